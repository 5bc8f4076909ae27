//! Persisted command fingerprints from previous successful runs.
//!
//! The store is a single append-mostly file in the build directory:
//! an 8-byte header (magic + format version) followed by fixed 24-byte
//! little-endian records of (identity hash, fingerprint, run mtime).
//! Re-recording an identity simply appends; the later record wins at
//! load time.  Reads go through a memory map once at open; writes are
//! serialized by the executor and flushed before any dependent of the
//! recorded command is queued.

use crate::error::{Error, Result};
use crate::hash::Fingerprint;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

const MAGIC: &[u8; 4] = b"bxfp";
const VERSION: u32 = 1;
const RECORD_LEN: usize = 24;

/// The stored result of a command's last successful run.
#[derive(Debug, Copy, Clone)]
pub struct StoredRun {
    pub fingerprint: Fingerprint,
    /// Encoded wall-clock time of the run, compared against input
    /// mtimes for commands that record them.
    pub run_mtime: u64,
}

pub struct Store {
    runs: HashMap<u64, StoredRun>,
    file: File,
}

impl Store {
    /// Open (or create) the store.  A corrupt file is recreated once;
    /// failing again is fatal.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
        match Self::open_once(path) {
            Ok(store) => Ok(store),
            Err(err) => {
                tracing::warn!("recreating fingerprint store: {}", err);
                std::fs::remove_file(path).map_err(store_err)?;
                Self::open_once(path)
            }
        }
    }

    fn open_once(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(store_err)?;
        let len = file.metadata().map_err(store_err)?.len() as usize;

        if len == 0 {
            let mut header = Vec::with_capacity(8);
            header.extend_from_slice(MAGIC);
            header.extend_from_slice(&VERSION.to_le_bytes());
            file.write_all(&header).map_err(store_err)?;
            return Ok(Store {
                runs: HashMap::new(),
                file,
            });
        }

        if len < 8 {
            return Err(Error::FingerprintStore("truncated header".into()));
        }
        // Safety: the map is read once here and dropped; concurrent
        // appends past `len` are never accessed through it.
        let map = unsafe { Mmap::map(&file) }.map_err(store_err)?;
        if &map[..4] != MAGIC {
            return Err(Error::FingerprintStore("bad magic".into()));
        }
        let version = u32::from_le_bytes(map[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(Error::FingerprintStore(format!(
                "unsupported version {}",
                version
            )));
        }

        // A torn final record (crash mid-append) is dropped, and the
        // file is truncated back to a record boundary so later appends
        // stay aligned.
        let aligned = 8 + (len - 8) / RECORD_LEN * RECORD_LEN;

        let mut runs = HashMap::new();
        for rec in map[8..aligned].chunks_exact(RECORD_LEN) {
            let identity = u64::from_le_bytes(rec[0..8].try_into().unwrap());
            let fingerprint = Fingerprint(u64::from_le_bytes(rec[8..16].try_into().unwrap()));
            let run_mtime = u64::from_le_bytes(rec[16..24].try_into().unwrap());
            runs.insert(
                identity,
                StoredRun {
                    fingerprint,
                    run_mtime,
                },
            );
        }
        drop(map);
        if aligned != len {
            file.set_len(aligned as u64).map_err(store_err)?;
        }
        Ok(Store { runs, file })
    }

    pub fn lookup(&self, identity: u64) -> Option<StoredRun> {
        self.runs.get(&identity).copied()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Append one record and make it durable before returning.
    pub fn record(&mut self, identity: u64, fingerprint: Fingerprint, run_mtime: u64) -> Result<()> {
        let mut rec = [0u8; RECORD_LEN];
        rec[0..8].copy_from_slice(&identity.to_le_bytes());
        rec[8..16].copy_from_slice(&fingerprint.0.to_le_bytes());
        rec[16..24].copy_from_slice(&run_mtime.to_le_bytes());
        self.file.write_all(&rec).map_err(store_err)?;
        self.file.sync_data().map_err(store_err)?;
        self.runs.insert(
            identity,
            StoredRun {
                fingerprint,
                run_mtime,
            },
        );
        Ok(())
    }
}

fn store_err(err: std::io::Error) -> Error {
    Error::FingerprintStore(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints");

        let mut store = Store::open(&path)?;
        assert!(store.lookup(1).is_none());
        store.record(1, Fingerprint(100), 10)?;
        store.record(2, Fingerprint(200), 20)?;
        // Later record for the same identity wins.
        store.record(1, Fingerprint(101), 11)?;
        drop(store);

        let store = Store::open(&path)?;
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(1).unwrap().fingerprint, Fingerprint(101));
        assert_eq!(store.lookup(1).unwrap().run_mtime, 11);
        assert_eq!(store.lookup(2).unwrap().fingerprint, Fingerprint(200));
        Ok(())
    }

    #[test]
    fn corrupt_file_is_recreated() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints");
        std::fs::write(&path, b"not a fingerprint store").unwrap();

        let mut store = Store::open(&path)?;
        assert!(store.is_empty());
        store.record(7, Fingerprint(700), 70)?;
        drop(store);

        let store = Store::open(&path)?;
        assert_eq!(store.lookup(7).unwrap().fingerprint, Fingerprint(700));
        Ok(())
    }

    #[test]
    fn torn_tail_record_is_dropped() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints");

        let mut store = Store::open(&path)?;
        store.record(1, Fingerprint(100), 10)?;
        drop(store);

        // Simulate a crash mid-append.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xab; 9]).unwrap();
        drop(f);

        let mut store = Store::open(&path)?;
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(1).unwrap().fingerprint, Fingerprint(100));

        // Appends after the truncation stay record-aligned.
        store.record(2, Fingerprint(200), 20)?;
        drop(store);
        let store = Store::open(&path)?;
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(2).unwrap().fingerprint, Fingerprint(200));
        Ok(())
    }
}
