/// Durability: append-only command log, compaction, snapshots, and
/// startup recovery.
///
/// Every accepted write flows through [`aof::CommandLog`]'s single
/// consumer task, which is also where replication taps the stream via
/// the listener registry.
pub mod aof;
pub mod recovery;
pub mod rewrite;
pub mod snapshot;
pub mod types;

pub use aof::{CommandLog, ListenerRegistry, LogListener};
pub use rewrite::Compactor;
pub use types::{DurabilityConfig, FsyncPolicy, LogRecord, PersistenceError};

#[cfg(test)]
mod tests;
