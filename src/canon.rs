//! Lexical path canonicalization.
//!
//! File paths act as cache and graph keys, so "foo/./bar" and "foo/bar"
//! must collapse to the same string.  This simplifies paths without
//! touching the disk; symlinks are deliberately not resolved.

/// Canonicalize a path, removing `.` components, empty components, and
/// `..` where a parent is available to pop.
pub fn canon_path(path: impl Into<String>) -> String {
    let path = path.into();
    let sep = if path.contains('\\') && !path.contains('/') {
        '\\'
    } else {
        '/'
    };
    let absolute = path.starts_with(['/', '\\']);

    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split(['/', '\\']) {
        match comp {
            "" | "." => {}
            ".." => {
                match parts.last() {
                    Some(&"..") | None => {
                        // Can't pop above the start of a relative path.
                        if !absolute {
                            parts.push("..");
                        }
                    }
                    Some(_) => {
                        parts.pop();
                    }
                }
            }
            c => parts.push(c),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push(sep);
    }
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push_str(p);
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}
