use super::backlog::Backlog;
use super::config::ReplicationConfig;
use super::types::{generate_replication_id, ReplicaSyncState, SnapshotBuild};
use crate::core::now_ms;
use crate::persistence::{Compactor, LogListener, PersistenceError};
use crate::protocol::resp::{self, RespReader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Announced identity accumulated from REPLCONF before PSYNC
#[derive(Debug, Default, Clone)]
pub struct ReplicaConnInfo {
    pub listening_port: Option<u16>,
    pub announced_ip: Option<String>,
    pub capabilities: Vec<String>,
}

/// Primary's bookkeeping for one connected replica
struct ReplicaHandle {
    addr: SocketAddr,
    state: ReplicaSyncState,
    /// Stream offset this replica has been sent up to
    sent_offset: u64,
    /// Last offset the replica acknowledged (observability only)
    ack_offset: u64,
    last_ack_ms: u64,
    info: ReplicaConnInfo,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Backlog and replica sets share this one lock so sync decisions are
/// atomic with respect to backlog snapshots.
struct PrimaryState {
    replication_id: String,
    backlog: Option<Backlog>,
    build: SnapshotBuild,
    replicas: HashMap<Uuid, ReplicaHandle>,
    /// Replicas parked until the in-flight build finishes
    waiting: Vec<Uuid>,
    last_ping_ms: u64,
}

/// Primary replication coordinator: owns the backlog, drives full and
/// partial resynchronization, and pushes the stream to online
/// replicas from its cron.
pub struct PrimaryCoordinator {
    config: ReplicationConfig,
    compactor: Arc<Compactor>,
    snapshot_path: PathBuf,
    state: Mutex<PrimaryState>,
}

/// Command-log listener that mirrors appended bytes into the backlog
pub struct BacklogFeed(pub Arc<PrimaryCoordinator>);

impl LogListener for BacklogFeed {
    fn on_append(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut state = self.0.state.lock();
        if let Some(backlog) = state.backlog.as_mut() {
            backlog.append(bytes);
        }
        Ok(())
    }
}

impl PrimaryCoordinator {
    pub fn new(
        config: ReplicationConfig,
        compactor: Arc<Compactor>,
        snapshot_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            compactor,
            snapshot_path,
            state: Mutex::new(PrimaryState {
                replication_id: generate_replication_id(),
                backlog: None,
                build: SnapshotBuild::Idle,
                replicas: HashMap::new(),
                waiting: Vec::new(),
                last_ping_ms: 0,
            }),
        })
    }

    pub fn replication_id(&self) -> String {
        self.state.lock().replication_id.clone()
    }

    pub fn replica_count(&self) -> usize {
        self.state.lock().replicas.len()
    }

    pub fn current_offset(&self) -> u64 {
        self.state
            .lock()
            .backlog
            .as_ref()
            .map(|b| b.current_offset())
            .unwrap_or(0)
    }

    /// Spawn the periodic housekeeping task
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(this.config.cron_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                this.cron();
            }
        });
    }

    /// Take over a connection that issued PSYNC. The read half keeps
    /// carrying REPLCONF ACKs; the write half is owned by a dedicated
    /// sender task fed through the handle's channel.
    pub async fn accept_replica(
        self: &Arc<Self>,
        reader: RespReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        addr: SocketAddr,
        conn_info: ReplicaConnInfo,
        requested_id: String,
        requested_offset: i64,
    ) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        info!(replica = %id, %addr, requested_offset, "PSYNC received");

        self.spawn_sender(id, writer, rx);
        self.spawn_ack_reader(id, reader);

        let serve_full = {
            let mut state = self.state.lock();
            state.replicas.insert(
                id,
                ReplicaHandle {
                    addr,
                    state: ReplicaSyncState::WaitSnapshotReady,
                    sent_offset: 0,
                    ack_offset: 0,
                    last_ack_ms: now_ms(),
                    info: conn_info,
                    tx,
                },
            );

            match state.build.clone() {
                SnapshotBuild::Idle => {
                    state.build = SnapshotBuild::Running;
                    state.waiting.push(id);
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.run_snapshot_build().await });
                    false
                }
                SnapshotBuild::Running => {
                    state.waiting.push(id);
                    false
                }
                SnapshotBuild::Finished { .. } => {
                    if self.try_partial_resync(&mut state, id, &requested_id, requested_offset) {
                        false
                    } else {
                        true
                    }
                }
            }
        };

        if serve_full {
            self.serve_full_resync(id).await;
        }
    }

    /// Partial resync if the replica's history lines up; returns
    /// false when a full resync is required instead.
    fn try_partial_resync(
        &self,
        state: &mut PrimaryState,
        id: Uuid,
        requested_id: &str,
        requested_offset: i64,
    ) -> bool {
        let Ok(offset) = u64::try_from(requested_offset) else {
            return false;
        };
        if requested_id != state.replication_id {
            debug!(replica = %id, "replication id mismatch, full resync");
            return false;
        }
        let Some(backlog) = state.backlog.as_ref() else {
            return false;
        };
        if !backlog.is_valid_offset(offset) {
            debug!(replica = %id, offset, "offset outside backlog, full resync");
            return false;
        }

        let mut payload = format!("+CONTINUE {}\r\n", state.replication_id).into_bytes();
        payload.extend(backlog.snapshot_after(offset));
        let current = backlog.current_offset();

        if let Some(handle) = state.replicas.get_mut(&id) {
            let _ = handle.tx.send(payload);
            handle.state = ReplicaSyncState::Online;
            handle.sent_offset = current;
            info!(replica = %id, offset, "partial resync accepted");
        }
        true
    }

    /// Stream header + length-prefixed snapshot + backlog to one
    /// replica, then mark it online.
    async fn serve_full_resync(self: &Arc<Self>, id: Uuid) {
        let (path, begin, replication_id) = {
            let mut state = self.state.lock();
            match state.build.clone() {
                SnapshotBuild::Finished { path, begin_offset } => {
                    if let Some(handle) = state.replicas.get_mut(&id) {
                        handle.state = ReplicaSyncState::SendingSnapshot;
                    } else {
                        return;
                    }
                    (path, begin_offset, state.replication_id.clone())
                }
                SnapshotBuild::Running => {
                    // A rotation claimed the build slot between the
                    // sync decision and here; park until the fresh
                    // snapshot lands.
                    if state.replicas.contains_key(&id) && !state.waiting.contains(&id) {
                        if let Some(handle) = state.replicas.get_mut(&id) {
                            handle.state = ReplicaSyncState::WaitSnapshotReady;
                        }
                        state.waiting.push(id);
                        debug!(replica = %id, "resync parked behind a running build");
                    }
                    return;
                }
                SnapshotBuild::Idle => {
                    drop(state);
                    self.remove_replica(id, "no snapshot available");
                    return;
                }
            }
        };

        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(replica = %id, "snapshot read failed: {e}");
                self.remove_replica(id, "snapshot unavailable");
                return;
            }
        };

        let mut state = self.state.lock();
        let Some(backlog) = state.backlog.as_ref() else {
            drop(state);
            self.remove_replica(id, "backlog missing");
            return;
        };
        if backlog.begin_offset() != begin {
            // The backlog rotated while the snapshot file was read;
            // this replica must restart its handshake.
            drop(state);
            self.remove_replica(id, "backlog rotated during resync");
            return;
        }
        let (tail, current) = backlog.snapshot();

        let mut payload = format!("+FULLRESYNC {replication_id} {begin}\r\n").into_bytes();
        payload.extend(format!("${}\r\n", blob.len()).into_bytes());
        payload.extend(blob);
        payload.extend(tail);

        if let Some(handle) = state.replicas.get_mut(&id) {
            let _ = handle.tx.send(payload);
            handle.state = ReplicaSyncState::Online;
            handle.sent_offset = current;
            info!(replica = %id, begin, current, "full resync streamed");
        }
    }

    /// Build a snapshot at a fresh capture point, rotating the
    /// backlog, then serve every parked replica.
    async fn run_snapshot_build(self: Arc<Self>) {
        // A user-triggered rewrite may hold the single-flight claim;
        // wait it out rather than failing parked replicas.
        let mut outcome = Err(PersistenceError::RewriteInProgress);
        for _ in 0..600 {
            outcome = self
                .compactor
                .build_replication_snapshot(&self.snapshot_path, &|| self.rotate_backlog())
                .await;
            if !matches!(outcome, Err(PersistenceError::RewriteInProgress)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        match outcome {
            Ok(begin) => {
                let waiters = {
                    let mut state = self.state.lock();
                    state.build = SnapshotBuild::Finished {
                        path: self.snapshot_path.clone(),
                        begin_offset: begin,
                    };
                    std::mem::take(&mut state.waiting)
                };
                for id in waiters {
                    self.serve_full_resync(id).await;
                }
            }
            Err(e) => {
                warn!("snapshot build failed: {e}");
                let waiters = {
                    let mut state = self.state.lock();
                    state.build = SnapshotBuild::Idle;
                    std::mem::take(&mut state.waiting)
                };
                for id in waiters {
                    self.remove_replica(id, "snapshot build failed");
                }
            }
        }
    }

    /// Swap in a fresh backlog at the capture boundary. Runs while
    /// the compactor holds the pause gate, so the boundary is exact.
    /// Online replicas are flushed to the old segment's edge first,
    /// keeping old and new ranges contiguous per replica as well.
    fn rotate_backlog(&self) -> u64 {
        let mut state = self.state.lock();
        let begin = match state.backlog.take() {
            Some(old) => {
                let current = old.current_offset();
                for handle in state.replicas.values_mut() {
                    if handle.state == ReplicaSyncState::Online && handle.sent_offset < current {
                        let _ = handle.tx.send(old.snapshot_after(handle.sent_offset));
                        handle.sent_offset = current;
                    }
                }
                current
            }
            None => 0,
        };
        state.backlog = Some(Backlog::continue_from(begin));
        debug!(begin, "backlog rotated");
        begin
    }

    /// REPLCONF ACK bookkeeping
    pub fn record_ack(&self, id: Uuid, offset: u64) {
        let mut state = self.state.lock();
        if let Some(handle) = state.replicas.get_mut(&id) {
            handle.ack_offset = offset;
            handle.last_ack_ms = now_ms();
        }
    }

    /// Periodic housekeeping: keepalive PING, delta push, rotation
    fn cron(self: &Arc<Self>) {
        let mut rotate = false;
        {
            let mut state = self.state.lock();
            let now = now_ms();
            let has_replicas = !state.replicas.is_empty();

            let state = &mut *state;
            if let Some(backlog) = state.backlog.as_mut() {
                if has_replicas
                    && now.saturating_sub(state.last_ping_ms)
                        >= self.config.ping_interval_secs * 1000
                {
                    backlog.append(&resp::encode_command(&[b"PING".to_vec()]));
                    state.last_ping_ms = now;
                }

                let current = backlog.current_offset();
                for handle in state.replicas.values_mut() {
                    if handle.state == ReplicaSyncState::Online && handle.sent_offset < current {
                        let _ = handle.tx.send(backlog.snapshot_after(handle.sent_offset));
                        handle.sent_offset = current;
                    }
                }

                rotate = backlog.len() > self.config.backlog_ceiling_bytes
                    && matches!(state.build, SnapshotBuild::Finished { .. })
                    && !self.compactor.log().rewrite_in_flight();
                if rotate {
                    state.build = SnapshotBuild::Running;
                }
            }
        }

        if rotate {
            info!("backlog over ceiling, rotating");
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_snapshot_build().await });
        }
    }

    /// Any write error drops the replica from all tracking; it must
    /// re-handshake.
    pub fn remove_replica(&self, id: Uuid, reason: &str) {
        let mut state = self.state.lock();
        if state.replicas.remove(&id).is_some() {
            info!(replica = %id, reason, "replica removed");
        }
        state.waiting.retain(|w| *w != id);
    }

    fn spawn_sender(
        self: &Arc<Self>,
        id: Uuid,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = writer.write_all(&chunk).await {
                    debug!(replica = %id, "replica write failed: {e}");
                    break;
                }
            }
            this.remove_replica(id, "link write closed");
        });
    }

    fn spawn_ack_reader(self: &Arc<Self>, id: Uuid, mut reader: RespReader<OwnedReadHalf>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match reader.read_command().await {
                    Ok(Some((args, _))) => {
                        if args.len() == 3
                            && args[0].eq_ignore_ascii_case(b"REPLCONF")
                            && args[1].eq_ignore_ascii_case(b"ACK")
                        {
                            if let Ok(offset) =
                                String::from_utf8_lossy(&args[2]).parse::<u64>()
                            {
                                this.record_ack(id, offset);
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            this.remove_replica(id, "link read closed");
        });
    }

    /// INFO replication section (primary side)
    pub fn info(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        out.push_str(&format!("replication_id:{}\r\n", state.replication_id));
        out.push_str(&format!(
            "backlog_begin_offset:{}\r\n",
            state.backlog.as_ref().map(|b| b.begin_offset()).unwrap_or(0)
        ));
        out.push_str(&format!(
            "backlog_current_offset:{}\r\n",
            state
                .backlog
                .as_ref()
                .map(|b| b.current_offset())
                .unwrap_or(0)
        ));
        out.push_str(&format!("connected_replicas:{}\r\n", state.replicas.len()));
        for (index, handle) in state.replicas.values().enumerate() {
            let port = handle
                .info
                .listening_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "?".to_string());
            let ip = handle
                .info
                .announced_ip
                .clone()
                .unwrap_or_else(|| handle.addr.ip().to_string());
            out.push_str(&format!(
                "replica{}:ip={},port={},ack_offset={},sent_offset={},ack_age_ms={}\r\n",
                index,
                ip,
                port,
                handle.ack_offset,
                handle.sent_offset,
                now_ms().saturating_sub(handle.last_ack_ms)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{DurabilityConfig, FsyncPolicy};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn coordinator(dir: &tempfile::TempDir) -> Arc<PrimaryCoordinator> {
        let log = crate::persistence::CommandLog::open(DurabilityConfig {
            enabled: true,
            log_path: dir.path().join("ember.aof"),
            fsync: FsyncPolicy::Always,
            snapshot_preamble: false,
            queue_depth: 64,
        })
        .await
        .unwrap();
        let compactor = Arc::new(Compactor::new(log, 1));
        // No start(): the test drives every step itself
        PrimaryCoordinator::new(
            ReplicationConfig::default(),
            compactor,
            dir.path().join("repl.snapshot"),
        )
    }

    #[tokio::test]
    async fn test_resync_racing_a_rotation_is_parked_until_the_next_build() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir).await;
        let (client, server_side) = pair().await;
        let addr = server_side.peer_addr().unwrap();
        let (read_half, write_half) = server_side.into_split();

        // A rotation pass owns the build slot while this replica
        // arrives, so it parks instead of being served
        coordinator.state.lock().build = SnapshotBuild::Running;
        coordinator
            .accept_replica(
                RespReader::new(read_half),
                write_half,
                addr,
                ReplicaConnInfo::default(),
                "?".to_string(),
                -1,
            )
            .await;
        let id = *coordinator.state.lock().replicas.keys().next().unwrap();

        // The build pass collected the waiters, then a rotation
        // flipped the slot back to Running before this replica's
        // serve took the lock
        coordinator.state.lock().waiting.clear();
        coordinator.serve_full_resync(id).await;
        {
            let state = coordinator.state.lock();
            assert!(state.replicas.contains_key(&id), "replica dropped");
            assert_eq!(state.waiting, vec![id], "replica left unparked");
        }

        // The next completed build serves the parked replica
        Arc::clone(&coordinator).run_snapshot_build().await;
        let mut reader = RespReader::new(client);
        let header = tokio::time::timeout(Duration::from_secs(5), reader.read_line())
            .await
            .unwrap()
            .unwrap();
        assert!(header.starts_with("+FULLRESYNC "), "got {header}");
    }
}
