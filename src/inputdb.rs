//! The input database: a durable map from specification files to their
//! last-seen hash.
//!
//! When an input's files all have the mtimes recorded here, the stored
//! hash is adopted without reading the spec; otherwise the hash is
//! recomputed over the concatenated contents and the rows are replaced.
//! Two inputs with identical spec bytes end up with identical hashes
//! across runs, which is what lets the context dedupe repeated
//! `add_input` calls.

use crate::error::Result;
use crate::hash;
use crate::input::Input;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    hash INTEGER NOT NULL,
    last_write_time BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS files_by_hash ON files(hash);
";

pub struct InputDatabase {
    conn: Connection,
}

impl InputDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(InputDatabase { conn })
    }

    /// Assign the input its hash, from the database when the recorded
    /// mtimes still match, recomputed and stored otherwise.
    pub fn setup_input(&mut self, input: &mut Input) -> Result<()> {
        if input.hash() != 0 {
            return Ok(());
        }
        if input.is_path_hashed() {
            let key = crate::canon::canon_path(input.path().to_string_lossy().into_owned());
            input.set_hash(hash::hash_bytes(key.as_bytes()));
            return Ok(());
        }

        let path_key = crate::canon::canon_path(input.path().to_string_lossy().into_owned());
        if let Some(stored) = self.lookup_unchanged(&path_key)? {
            input.set_hash(stored);
            return Ok(());
        }

        let files = input.constituent_files();
        let spec_hash = hash_spec_files(&files)?;

        let tx = self.conn.transaction()?;
        // Stale rows for any constituent are replaced wholesale; rows
        // for the previous hash that belonged to dropped constituents
        // would otherwise pin an mtime that no longer matters.
        if let Some(old) = lookup_hash(&tx, &path_key)? {
            tx.execute("DELETE FROM files WHERE hash = ?1", params![old as i64])?;
        }
        for file in &files {
            let key = crate::canon::canon_path(file.to_string_lossy().into_owned());
            let mtime = stat_encoded(&key)?;
            tx.execute(
                "INSERT OR REPLACE INTO files (path, hash, last_write_time) VALUES (?1, ?2, ?3)",
                params![key, spec_hash as i64, mtime.to_le_bytes().to_vec()],
            )?;
        }
        tx.commit()?;

        input.set_hash(spec_hash);
        Ok(())
    }

    /// The stored hash for a path, if every file sharing that hash
    /// still has its recorded mtime.
    fn lookup_unchanged(&self, path_key: &str) -> Result<Option<u64>> {
        let Some(stored) = lookup_hash(&self.conn, path_key)? else {
            return Ok(None);
        };
        let mut stmt = self
            .conn
            .prepare("SELECT path, last_write_time FROM files WHERE hash = ?1")?;
        let rows = stmt.query_map(params![stored as i64], |row| {
            let path: String = row.get(0)?;
            let mtime: Vec<u8> = row.get(1)?;
            Ok((path, mtime))
        })?;
        for row in rows {
            let (path, mtime_blob) = row?;
            let recorded = decode_mtime_blob(&mtime_blob);
            if stat_encoded(&path)? != recorded {
                return Ok(None);
            }
        }
        Ok(Some(stored))
    }
}

fn lookup_hash(conn: &Connection, path_key: &str) -> Result<Option<u64>> {
    let hash: Option<i64> = conn
        .query_row(
            "SELECT hash FROM files WHERE path = ?1",
            params![path_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash.map(|h| h as u64))
}

/// SHA-like hash over the concatenated contents of the spec's files.
fn hash_spec_files(files: &[std::path::PathBuf]) -> Result<u64> {
    let mut hasher = Sha256::new();
    for file in files {
        let bytes = std::fs::read(file)?;
        hasher.update(&bytes);
    }
    let digest = hasher.finalize();
    Ok(u64::from_le_bytes(digest[..8].try_into().unwrap()))
}

fn stat_encoded(path: &str) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(hash::encode_mtime(meta.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn decode_mtime_blob(blob: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = blob.len().min(8);
    bytes[..n].copy_from_slice(&blob[..n]);
    u64::from_le_bytes(bytes)
}
