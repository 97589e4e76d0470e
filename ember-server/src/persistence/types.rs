use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Persistence error types
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("log replay failed: {0}")]
    ReplayFailed(String),

    #[error("a rewrite is already in progress")]
    RewriteInProgress,

    #[error("durability log is disabled")]
    LogDisabled,

    #[error("durability log is closed")]
    LogClosed,
}

impl From<bincode::Error> for PersistenceError {
    fn from(e: bincode::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

impl From<crate::protocol::RespError> for PersistenceError {
    fn from(e: crate::protocol::RespError) -> Self {
        PersistenceError::ReplayFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// One accepted write command headed for the log
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub db_index: usize,
    pub args: Vec<Vec<u8>>,
}

/// Fsync policy for the command log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsyncPolicy {
    /// Fsync after every append (safest, slowest)
    Always,
    /// Fsync from a once-a-second timer
    EverySecond,
    /// Leave flushing to the OS
    No,
}

/// Durability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    pub fsync: FsyncPolicy,
    /// Start rewritten logs with a snapshot preamble instead of
    /// replayed commands
    pub snapshot_preamble: bool,
    /// Bound on the writer queue; enqueue blocks when full
    pub queue_depth: usize,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: PathBuf::from("./data/ember.aof"),
            fsync: FsyncPolicy::EverySecond,
            snapshot_preamble: false,
            queue_depth: 65536,
        }
    }
}
