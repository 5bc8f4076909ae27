//! Error types shared across the crate.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("no driver accepted input: {}", .0.display())]
    NoDriverAccepted(PathBuf),

    #[error("driver {driver} failed to load {}: {cause}", .input.display())]
    DriverLoad {
        driver: String,
        input: PathBuf,
        cause: String,
    },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("duplicate output {file}: declared by both {first} and {second}")]
    DuplicateOutput {
        file: String,
        first: String,
        second: String,
    },

    #[error("{name}: failed to spawn {program}: {source}")]
    Spawn {
        name: String,
        program: String,
        source: std::io::Error,
    },

    #[error("{name}: exited with code {code}")]
    ExitNonZero {
        name: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("{name}: killed by signal {signal}")]
    Signaled { name: String, signal: i32 },

    #[error("{name}: timed out after {seconds}s")]
    Timeout { name: String, seconds: u64 },

    #[error("{name}: succeeded but did not produce {file}")]
    OutputMissing { name: String, file: String },

    #[error("input database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("fingerprint store: {0}")]
    FingerprintStore(String),

    #[error("cancelled")]
    Cancelled,

    #[error("graph is frozen, no commands can be added")]
    GraphFrozen,

    #[error("package: {0}")]
    Package(String),

    #[error("settings: {0}")]
    Settings(String),

    #[error("plan: {0}")]
    Plan(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error arose while loading inputs, before any command
    /// was scheduled.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Error::InputNotFound(_)
                | Error::NoDriverAccepted(_)
                | Error::DriverLoad { .. }
                | Error::Package(_)
        )
    }

    /// Whether this error is a graph rejection (the build never starts).
    pub fn is_graph_error(&self) -> bool {
        matches!(self, Error::Cycle(_) | Error::DuplicateOutput { .. })
    }
}
