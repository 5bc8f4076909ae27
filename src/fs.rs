//! Process-wide cache of filesystem stat queries.
//!
//! Up-to-date checks stat and hash the same files over and over (a
//! header is an input to hundreds of commands), so results are cached
//! here by canonical path.  Entries for a command's outputs are
//! invalidated when the command completes, which is the only time the
//! executor writes those paths.

use crate::canon::canon_path;
use crate::hash;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MTime {
    Missing,
    Stamp(SystemTime),
}

impl MTime {
    pub fn exists(self) -> bool {
        matches!(self, MTime::Stamp(_))
    }

    /// Nanoseconds since the epoch; 0 for a missing file.
    pub fn encode(self) -> u64 {
        match self {
            MTime::Missing => 0,
            MTime::Stamp(t) => hash::encode_mtime(t),
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct FileMeta {
    mtime: MTime,
    content_hash: Option<u64>,
}

/// Shared stat/content-hash cache.  Readers take the read lock per
/// query; invalidation takes the write lock.
#[derive(Default)]
pub struct FileStorage {
    files: RwLock<HashMap<String, FileMeta>>,
}

impl FileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn stat(path: &str) -> std::io::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(MTime::Stamp(meta.modified()?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(err),
        }
    }

    pub fn mtime(&self, path: &str) -> std::io::Result<MTime> {
        let key = canon_path(path);
        if let Some(meta) = self.files.read().unwrap().get(&key) {
            return Ok(meta.mtime);
        }
        let mtime = Self::stat(&key)?;
        self.files
            .write()
            .unwrap()
            .entry(key)
            .or_insert(FileMeta {
                mtime,
                content_hash: None,
            });
        Ok(mtime)
    }

    pub fn exists(&self, path: &str) -> std::io::Result<bool> {
        Ok(self.mtime(path)?.exists())
    }

    /// Content hash of the file, computed once per generation of the
    /// file.  Missing files surface the underlying NotFound error.
    pub fn content_hash(&self, path: &str) -> std::io::Result<u64> {
        let key = canon_path(path);
        if let Some(meta) = self.files.read().unwrap().get(&key) {
            if let Some(h) = meta.content_hash {
                return Ok(h);
            }
        }
        let h = hash::hash_file_content(std::path::Path::new(&key))?;
        let mtime = Self::stat(&key)?;
        self.files.write().unwrap().insert(
            key,
            FileMeta {
                mtime,
                content_hash: Some(h),
            },
        );
        Ok(h)
    }

    /// Drop cached state for a path a command just (re)wrote.
    pub fn invalidate(&self, path: &str) {
        self.files.write().unwrap().remove(&canon_path(path));
    }

    pub fn invalidate_all<'a>(&self, paths: impl IntoIterator<Item = &'a str>) {
        let mut files = self.files.write().unwrap();
        for p in paths {
            files.remove(&canon_path(p));
        }
    }
}
