//! Stable 64-bit fingerprints over command identity and input evidence.
//!
//! A fingerprint is recorded after a successful run and compared on the
//! next one to decide whether a command is up to date.  It must survive
//! process restarts and agree across machines with the same path rules,
//! so everything here goes through SHA-256 rather than the std hasher,
//! truncated to the first eight bytes.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

/// Identifies one instance of a command's execution; compared against
/// the stored value to decide whether the command is up to date.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Fingerprint(pub u64);

/// Per-input evidence fed into a fingerprint: either the content hash
/// of the file or, when content hashing is disabled, its encoded mtime.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Evidence {
    Content(u64),
    Mtime(u64),
}

/// Separates units within one hashed field so that e.g. ["ab", "c"] and
/// ["a", "bc"] hash differently.
const UNIT_SEPARATOR: u8 = 0x1f;

fn trunc64(digest: &[u8]) -> u64 {
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    trunc64(&hasher.finalize())
}

/// Hash a file's contents without reading it all into memory.
pub fn hash_file_content(path: &Path) -> std::io::Result<u64> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(trunc64(&hasher.finalize()))
}

/// Encode an mtime as nanoseconds since the epoch.  Pre-epoch stamps
/// collapse to 0, which only ever makes a command look outdated.
pub fn encode_mtime(t: SystemTime) -> u64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as u64,
        Err(_) => 0,
    }
}

/// Incremental hasher for command identity.  Callers write fields in a
/// fixed order with separators between sections; see
/// `Command::fingerprint` for the canonical feed order.
pub struct IdentityHasher(Sha256);

impl IdentityHasher {
    pub fn new() -> Self {
        IdentityHasher(Sha256::new())
    }

    pub fn write_str(&mut self, s: &str) {
        self.0.update(s.as_bytes());
        self.0.update([UNIT_SEPARATOR]);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.0.update(v.to_le_bytes());
        self.0.update([UNIT_SEPARATOR]);
    }

    pub fn write_evidence(&mut self, e: Evidence) {
        match e {
            Evidence::Content(h) => {
                self.0.update([b'c']);
                self.write_u64(h);
            }
            Evidence::Mtime(m) => {
                self.0.update([b'm']);
                self.write_u64(m);
            }
        }
    }

    /// Marks the end of a section (argv, env, inputs, ...).
    pub fn write_separator(&mut self) {
        self.0.update([UNIT_SEPARATOR, UNIT_SEPARATOR]);
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(trunc64(&self.0.finalize()))
    }
}

impl Default for IdentityHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn bytes_hash_is_deterministic() {
        assert_eq!(hash_bytes(b""), hash_bytes(b""));
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
        assert_eq!(hash_bytes(b"hello world"), hash_bytes(b"hello world"));
    }

    #[test]
    fn file_content_matches_bytes() -> std::io::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(b"some file contents")?;
        f.flush()?;
        assert_eq!(
            hash_file_content(f.path())?,
            hash_bytes(b"some file contents")
        );
        Ok(())
    }

    #[test]
    fn units_do_not_collide() {
        let mut a = IdentityHasher::new();
        a.write_str("ab");
        a.write_str("c");
        let mut b = IdentityHasher::new();
        b.write_str("a");
        b.write_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn evidence_kinds_are_distinct() {
        let mut a = IdentityHasher::new();
        a.write_evidence(Evidence::Content(7));
        let mut b = IdentityHasher::new();
        b.write_evidence(Evidence::Mtime(7));
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn pre_epoch_mtime_encodes_to_zero() {
        let t = SystemTime::UNIX_EPOCH - std::time::Duration::from_secs(1);
        assert_eq!(encode_mtime(t), 0);
    }
}
