use super::commands;
use super::error::StoreError;
use super::types::{now_ms, Database, Entry, Reply, Value};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Per-connection execution context
#[derive(Debug, Clone)]
pub struct ConnCtx {
    /// Currently selected database
    pub db_index: usize,
    /// Set on links fed by the primary; bypasses the read-only check
    pub from_primary: bool,
}

impl ConnCtx {
    pub fn client() -> Self {
        Self {
            db_index: 0,
            from_primary: false,
        }
    }

    pub fn primary_link() -> Self {
        Self {
            db_index: 0,
            from_primary: true,
        }
    }
}

/// Outcome of executing one command line
#[derive(Debug)]
pub struct Exec {
    pub reply: Reply,
    /// Command lines to propagate (durability log + replication), in
    /// order. Empty for reads and rejected writes.
    pub writes: Vec<Vec<Vec<u8>>>,
}

impl Exec {
    fn read(reply: Reply) -> Self {
        Self {
            reply,
            writes: Vec::new(),
        }
    }
}

/// The in-memory keyspace: a fixed set of numbered databases.
///
/// This is the engine the durability and replication machinery calls
/// into; individual command semantics are deliberately minimal.
pub struct Store {
    dbs: Vec<RwLock<Database>>,
    /// Writes from ordinary clients are rejected while set
    read_only: AtomicBool,
}

impl Store {
    pub fn new(db_count: usize) -> Self {
        let dbs = (0..db_count.max(1)).map(|_| RwLock::new(Database::new())).collect();
        Self {
            dbs,
            read_only: AtomicBool::new(false),
        }
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Execute one command line. Successful mutations are reported in
    /// `Exec::writes` for the caller to hand to the durability log.
    pub fn execute(&self, ctx: &mut ConnCtx, args: &[Vec<u8>]) -> Exec {
        if args.is_empty() {
            return Exec::read(Reply::Error("ERR empty command".to_string()));
        }
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

        // Connection-level commands first
        match name.as_str() {
            "PING" => {
                return Exec::read(Reply::Simple("PONG".to_string()));
            }
            "ECHO" => {
                return match args.get(1) {
                    Some(msg) => Exec::read(Reply::Bulk(msg.clone())),
                    None => Exec::read(self.arity_error(&name)),
                };
            }
            "SELECT" => {
                return match commands::parse_index(args) {
                    Ok(index) if index < self.dbs.len() => {
                        ctx.db_index = index;
                        Exec::read(Reply::ok())
                    }
                    Ok(_) => Exec::read(Reply::Error(
                        StoreError::InvalidDbIndex.wire_message(),
                    )),
                    Err(e) => Exec::read(Reply::Error(e.wire_message())),
                };
            }
            _ => {}
        }

        let is_write = commands::is_write_command(&name);
        if is_write && self.is_read_only() && !ctx.from_primary {
            return Exec::read(Reply::Error(StoreError::ReadOnlyReplica.wire_message()));
        }

        let mut db = self.dbs[ctx.db_index].write();
        match commands::dispatch(&mut db, &name, args) {
            Ok(outcome) => {
                if !outcome.writes.is_empty() {
                    debug!(command = %name, db = ctx.db_index, "write accepted");
                }
                outcome
            }
            Err(e) => Exec::read(Reply::Error(e.wire_message())),
        }
    }

    fn arity_error(&self, name: &str) -> Reply {
        Reply::Error(StoreError::WrongArity(name.to_ascii_lowercase()).wire_message())
    }

    /// Visit every live entity of one database
    pub fn for_each_entity<F>(&self, db_index: usize, mut visitor: F)
    where
        F: FnMut(&str, &Value, Option<u64>),
    {
        let now = now_ms();
        let db = self.dbs[db_index].read();
        for (key, entry) in db.iter() {
            if entry.is_expired(now) {
                continue;
            }
            visitor(key, &entry.value, entry.expires_at_ms);
        }
    }

    /// (live keys, keys carrying a TTL) for one database
    pub fn key_count(&self, db_index: usize) -> (usize, usize) {
        let now = now_ms();
        let db = self.dbs[db_index].read();
        let mut count = 0;
        let mut ttl_count = 0;
        for entry in db.values() {
            if entry.is_expired(now) {
                continue;
            }
            count += 1;
            if entry.expires_at_ms.is_some() {
                ttl_count += 1;
            }
        }
        (count, ttl_count)
    }

    /// Replace one database's contents wholesale
    pub fn swap_database(&self, db_index: usize, contents: Database) {
        *self.dbs[db_index].write() = contents;
    }

    /// Atomically replace the entire dataset. Databases beyond the
    /// provided set are cleared.
    pub fn replace_all(&self, mut dbs: Vec<Database>) {
        for index in 0..self.dbs.len() {
            let contents = if index < dbs.len() {
                std::mem::take(&mut dbs[index])
            } else {
                Database::new()
            };
            self.swap_database(index, contents);
        }
    }

    /// Direct insertion used by snapshot loading
    pub fn load_entry(&self, db_index: usize, key: String, value: Value, expires_at_ms: Option<u64>) {
        let mut db = self.dbs[db_index].write();
        db.insert(
            key,
            Entry {
                value,
                expires_at_ms,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let store = Store::new(16);
        let mut ctx = ConnCtx::client();

        let exec = store.execute(&mut ctx, &line(&["SET", "a", "1"]));
        assert_eq!(exec.reply, Reply::ok());
        assert_eq!(exec.writes.len(), 1);

        let exec = store.execute(&mut ctx, &line(&["GET", "a"]));
        assert_eq!(exec.reply, Reply::Bulk(b"1".to_vec()));
        assert!(exec.writes.is_empty());
    }

    #[test]
    fn test_select_switches_database() {
        let store = Store::new(16);
        let mut ctx = ConnCtx::client();

        store.execute(&mut ctx, &line(&["SET", "a", "db0"]));
        store.execute(&mut ctx, &line(&["SELECT", "3"]));
        assert_eq!(ctx.db_index, 3);

        let exec = store.execute(&mut ctx, &line(&["GET", "a"]));
        assert_eq!(exec.reply, Reply::Nil);
    }

    #[test]
    fn test_read_only_replica_rejects_client_writes() {
        let store = Store::new(16);
        store.set_read_only(true);

        let mut ctx = ConnCtx::client();
        let exec = store.execute(&mut ctx, &line(&["SET", "a", "1"]));
        assert!(matches!(exec.reply, Reply::Error(e) if e.starts_with("READONLY")));

        let mut primary = ConnCtx::primary_link();
        let exec = store.execute(&mut primary, &line(&["SET", "a", "1"]));
        assert_eq!(exec.reply, Reply::ok());
    }

    #[test]
    fn test_key_count_skips_expired() {
        let store = Store::new(16);
        let mut ctx = ConnCtx::client();

        store.execute(&mut ctx, &line(&["SET", "a", "1"]));
        store.execute(&mut ctx, &line(&["SET", "b", "2"]));
        store.execute(&mut ctx, &line(&["PEXPIREAT", "b", "1"]));

        let (count, ttl_count) = store.key_count(0);
        assert_eq!(count, 1);
        assert_eq!(ttl_count, 0);
    }

    #[test]
    fn test_swap_database() {
        let store = Store::new(16);
        let mut ctx = ConnCtx::client();
        store.execute(&mut ctx, &line(&["SET", "old", "1"]));

        let mut contents = Database::new();
        contents.insert("new".to_string(), Entry::new(Value::Str(b"2".to_vec())));
        store.swap_database(0, contents);

        assert_eq!(
            store.execute(&mut ctx, &line(&["GET", "old"])).reply,
            Reply::Nil
        );
        assert_eq!(
            store.execute(&mut ctx, &line(&["GET", "new"])).reply,
            Reply::Bulk(b"2".to_vec())
        );
    }
}
