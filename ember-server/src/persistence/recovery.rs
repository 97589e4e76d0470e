use super::snapshot;
use super::types::{PersistenceError, Result};
use crate::core::{ConnCtx, Reply, Store};
use crate::protocol::resp;
use std::path::Path;
use tracing::{info, warn};

/// What a startup load found
#[derive(Debug, Default)]
pub struct LoadStats {
    pub snapshot_records: usize,
    pub commands_replayed: usize,
}

/// Replay serialized log bytes (optional snapshot preamble followed by
/// command records) into `store` through the normal execution path.
pub fn replay_log_bytes(bytes: &[u8], store: &Store) -> Result<LoadStats> {
    let mut stats = LoadStats::default();
    let mut rest = bytes;

    if snapshot::starts_with_snapshot(rest) {
        let (records, consumed) = snapshot::decode_snapshot_prefix(rest)?;
        stats.snapshot_records = records.len();
        snapshot::apply_records(store, records)?;
        rest = &rest[consumed..];
    }

    // Commands replay as if issued by the primary: SELECT moves the
    // cursor, writes bypass the read-only check.
    let mut ctx = ConnCtx::primary_link();
    while !rest.is_empty() {
        match resp::decode_command(rest)? {
            Some((args, consumed)) => {
                let exec = store.execute(&mut ctx, &args);
                if let Reply::Error(e) = exec.reply {
                    return Err(PersistenceError::ReplayFailed(e));
                }
                stats.commands_replayed += 1;
                rest = &rest[consumed..];
            }
            None => {
                // A torn tail from a crash mid-append: everything up
                // to it has been applied, so stop here.
                warn!(
                    remaining = rest.len(),
                    "incomplete trailing record in command log, ignoring"
                );
                break;
            }
        }
    }

    Ok(stats)
}

/// Load the durability log at startup. A missing file is an empty
/// dataset; an unopenable file is fatal to the caller.
pub async fn load_command_log(path: &Path, store: &Store) -> Result<LoadStats> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no command log found, starting empty");
            return Ok(LoadStats::default());
        }
        Err(e) => return Err(e.into()),
    };

    let stats = replay_log_bytes(&bytes, store)?;
    info!(
        snapshot_records = stats.snapshot_records,
        commands = stats.commands_replayed,
        "command log loaded"
    );
    Ok(stats)
}
