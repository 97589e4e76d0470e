use rand::Rng;
use thiserror::Error;

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("link timed out")]
    Timeout,

    #[error("operation superseded by reconfiguration")]
    StaleGeneration,

    #[error("snapshot load failed: {0}")]
    SnapshotLoad(#[from] crate::persistence::PersistenceError),
}

impl From<crate::protocol::RespError> for ReplicationError {
    fn from(e: crate::protocol::RespError) -> Self {
        match e {
            crate::protocol::RespError::Io(e) => ReplicationError::Io(e),
            crate::protocol::RespError::Closed => ReplicationError::ConnectionClosed,
            other => ReplicationError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Primary's view of one connected replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSyncState {
    /// PSYNC received, waiting for a snapshot build to finish
    WaitSnapshotReady,
    /// Snapshot bytes are being streamed
    SendingSnapshot,
    /// Caught up; receives deltas from the cron
    Online,
}

/// Global snapshot-build state; one build can serve every replica
/// that arrives while it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotBuild {
    Idle,
    Running,
    Finished {
        path: std::path::PathBuf,
        begin_offset: u64,
    },
}

/// Replica-side connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaLinkState {
    Disconnected,
    Connecting,
    Handshaking,
    FullSyncLoading,
    Streaming,
}

impl ReplicaLinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaLinkState::Disconnected => "disconnected",
            ReplicaLinkState::Connecting => "connecting",
            ReplicaLinkState::Handshaking => "handshaking",
            ReplicaLinkState::FullSyncLoading => "full-sync-loading",
            ReplicaLinkState::Streaming => "streaming",
        }
    }
}

/// Parsed PSYNC reply header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsyncReply {
    FullResync { replication_id: String, offset: u64 },
    Continue { replication_id: String },
}

/// Parse a `+FULLRESYNC <id> <offset>` / `+CONTINUE <id>` status line
pub fn parse_psync_reply(line: &str) -> Result<PsyncReply> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["+FULLRESYNC", id, offset] => {
            let offset = offset
                .parse::<u64>()
                .map_err(|_| ReplicationError::Protocol(format!("bad resync offset: {line}")))?;
            Ok(PsyncReply::FullResync {
                replication_id: (*id).to_string(),
                offset,
            })
        }
        ["+CONTINUE", id] => Ok(PsyncReply::Continue {
            replication_id: (*id).to_string(),
        }),
        _ => Err(ReplicationError::Protocol(format!(
            "unexpected PSYNC reply: {line}"
        ))),
    }
}

/// 40-character hex replication id, regenerated per primary lifetime
pub fn generate_replication_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..40).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fullresync_header() {
        let reply = parse_psync_reply("+FULLRESYNC 0123abcd 42").unwrap();
        assert_eq!(
            reply,
            PsyncReply::FullResync {
                replication_id: "0123abcd".to_string(),
                offset: 42
            }
        );
    }

    #[test]
    fn test_parse_continue_header() {
        let reply = parse_psync_reply("+CONTINUE 0123abcd").unwrap();
        assert_eq!(
            reply,
            PsyncReply::Continue {
                replication_id: "0123abcd".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_psync_reply("+OK").is_err());
        assert!(parse_psync_reply("+FULLRESYNC id notanumber").is_err());
        assert!(parse_psync_reply("-ERR nope").is_err());
    }

    #[test]
    fn test_replication_id_shape() {
        let id = generate_replication_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_replication_id());
    }
}
