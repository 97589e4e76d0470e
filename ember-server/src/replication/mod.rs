//! Primary/replica replication: offset-addressed backlog, PSYNC-style
//! full and partial resynchronization, and the replica-side sync loop.

pub mod backlog;
pub mod config;
pub mod primary;
pub mod replica;
pub mod types;

pub use backlog::Backlog;
pub use config::{parse_host_port, ReplicationConfig};
pub use primary::{BacklogFeed, PrimaryCoordinator, ReplicaConnInfo};
pub use replica::ReplicaClient;
pub use types::{ReplicaLinkState, ReplicationError};
