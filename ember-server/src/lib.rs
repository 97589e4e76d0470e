pub mod config;
pub mod core;
pub mod persistence;
pub mod protocol;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use crate::core::{ConnCtx, Reply, Store, StoreError, Value};
pub use persistence::{CommandLog, Compactor, DurabilityConfig, FsyncPolicy, PersistenceError};
pub use replication::{PrimaryCoordinator, ReplicaClient, ReplicationConfig, ReplicationError};
pub use server::Server;
