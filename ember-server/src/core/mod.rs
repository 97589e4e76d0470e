/// Store engine: a minimal multi-database keyspace.
///
/// The durability log, compactor, and replication machinery only rely
/// on the narrow contract exposed by [`Store`]: `execute`,
/// `for_each_entity`, `key_count`, and `swap_database`.
pub mod commands;
pub mod error;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::{ConnCtx, Exec, Store};
pub use types::{now_ms, Database, Entry, Reply, Value};
