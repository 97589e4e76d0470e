use super::config::ReplicationConfig;
use super::types::{
    parse_psync_reply, PsyncReply, ReplicaLinkState, ReplicationError, Result,
};
use crate::core::{ConnCtx, Database, Entry, Store};
use crate::persistence::{snapshot, CommandLog, Compactor};
use crate::protocol::resp::{self, RespReader};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Everything that must change together when the link moves. Guarded
/// by one mutex; every commit re-checks the generation so a superseded
/// sync attempt can never write through.
struct ReplicaState {
    /// Bumped on every REPLICAOF transition; fences stale attempts
    generation: u64,
    primary: Option<(String, u16)>,
    link: ReplicaLinkState,
    replication_id: Option<String>,
    /// Stream offset we have fully applied
    offset: u64,
}

/// Replica-side synchronization client: connects out to the primary,
/// runs the handshake, loads or continues the stream, and applies it.
pub struct ReplicaClient {
    store: Arc<Store>,
    log: Arc<CommandLog>,
    compactor: Arc<Compactor>,
    config: ReplicationConfig,
    listen_port: u16,
    state: Mutex<ReplicaState>,
}

impl ReplicaClient {
    pub fn new(
        store: Arc<Store>,
        log: Arc<CommandLog>,
        compactor: Arc<Compactor>,
        config: ReplicationConfig,
        listen_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            log,
            compactor,
            config,
            listen_port,
            state: Mutex::new(ReplicaState {
                generation: 0,
                primary: None,
                link: ReplicaLinkState::Disconnected,
                replication_id: None,
                offset: 0,
            }),
        })
    }

    /// REPLICAOF host port: start (or retarget) following a primary.
    /// Returns immediately; the sync loop runs in the background.
    pub fn set_primary(self: &Arc<Self>, host: String, port: u16) {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.primary = Some((host.clone(), port));
            state.link = ReplicaLinkState::Connecting;
            state.generation
        };
        self.store.set_read_only(true);
        info!(%host, port, "following new primary");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.sync_loop(generation).await });
    }

    /// REPLICAOF NO ONE: drop the link and resume accepting writes
    pub fn clear_primary(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.primary = None;
        state.link = ReplicaLinkState::Disconnected;
        self.store.set_read_only(false);
        info!("promoted to primary role");
    }

    pub fn is_replica(&self) -> bool {
        self.state.lock().primary.is_some()
    }

    /// INFO replication section (replica side)
    pub fn info(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        if let Some((host, port)) = &state.primary {
            out.push_str(&format!("primary_host:{host}\r\n"));
            out.push_str(&format!("primary_port:{port}\r\n"));
        }
        out.push_str(&format!("link_state:{}\r\n", state.link.as_str()));
        out.push_str(&format!("replica_offset:{}\r\n", state.offset));
        out
    }

    async fn sync_loop(self: Arc<Self>, mut generation: u64) {
        loop {
            if self.is_stale(generation) {
                return;
            }
            match self.attempt(generation).await {
                Err(ReplicationError::StaleGeneration) => return,
                Err(e) => warn!("replication link lost: {e}"),
                Ok(()) => return,
            }
            // Fence off anything still in flight on the dead link
            // before the next attempt starts
            generation = {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return;
                }
                state.generation += 1;
                state.link = ReplicaLinkState::Disconnected;
                state.generation
            };
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;
        }
    }

    /// One connection lifetime: connect, handshake, sync, stream.
    /// Only ever returns an error; a healthy link streams forever.
    async fn attempt(&self, generation: u64) -> Result<()> {
        let (host, port) = {
            let state = self.state.lock();
            if state.generation != generation {
                return Err(ReplicationError::StaleGeneration);
            }
            state
                .primary
                .clone()
                .ok_or(ReplicationError::StaleGeneration)?
        };

        self.commit(generation, |state| {
            state.link = ReplicaLinkState::Connecting;
        })?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = RespReader::new(read_half);

        self.commit(generation, |state| {
            state.link = ReplicaLinkState::Handshaking;
        })?;
        self.handshake(&mut reader, &mut writer).await?;

        let (request_id, request_offset) = {
            let state = self.state.lock();
            match &state.replication_id {
                Some(id) => (id.clone(), state.offset as i64),
                None => ("?".to_string(), -1),
            }
        };
        send(&mut writer, &["PSYNC", &request_id, &request_offset.to_string()]).await?;

        let header = reader.read_line().await?;
        match parse_psync_reply(&header)? {
            PsyncReply::FullResync {
                replication_id,
                offset,
            } => {
                self.commit(generation, |state| {
                    state.link = ReplicaLinkState::FullSyncLoading;
                })?;
                let blob = reader.read_blob().await?;
                self.load_snapshot(generation, &blob, replication_id, offset)?;
                // The old log describes a history this dataset no
                // longer descends from; replace it wholesale
                if let Err(e) = self.compactor.reset_to_store(&self.store).await {
                    warn!("log reset after full resync failed: {e}");
                }
                info!(offset, "full resync loaded");
            }
            PsyncReply::Continue { replication_id } => {
                self.commit(generation, |state| {
                    state.replication_id = Some(replication_id);
                })?;
                info!("partial resync accepted by primary");
            }
        }

        self.commit(generation, |state| {
            state.link = ReplicaLinkState::Streaming;
        })?;
        self.stream(generation, reader, writer).await
    }

    /// PING, optional AUTH, then announce identity via REPLCONF
    async fn handshake(
        &self,
        reader: &mut RespReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        send(writer, &["PING"]).await?;
        expect_ok(reader, "+PONG").await?;

        if let Some(secret) = &self.config.primary_auth {
            send(writer, &["AUTH", secret]).await?;
            expect_ok(reader, "+OK").await?;
        }

        let port = self
            .config
            .announce_port
            .unwrap_or(self.listen_port)
            .to_string();
        send(writer, &["REPLCONF", "listening-port", &port]).await?;
        expect_ok(reader, "+OK").await?;

        if let Some(ip) = &self.config.announce_ip {
            send(writer, &["REPLCONF", "ip-address", ip]).await?;
            expect_ok(reader, "+OK").await?;
        }

        send(writer, &["REPLCONF", "capa", "psync2"]).await?;
        expect_ok(reader, "+OK").await?;
        Ok(())
    }

    /// Decode the snapshot into a scratch dataset, then swap it in
    /// wholesale. The swap and the offset commit happen under one
    /// state-lock hold so a stale attempt can never replace the data.
    fn load_snapshot(
        &self,
        generation: u64,
        blob: &[u8],
        replication_id: String,
        offset: u64,
    ) -> Result<()> {
        let (records, consumed) = snapshot::decode_snapshot_prefix(blob)?;
        if consumed != blob.len() {
            debug!(
                extra = blob.len() - consumed,
                "trailing bytes after snapshot terminator ignored"
            );
        }

        let mut dbs: Vec<Database> = (0..self.store.db_count())
            .map(|_| Database::new())
            .collect();
        for record in records {
            let db_index = record.db_index as usize;
            let db = dbs.get_mut(db_index).ok_or_else(|| {
                ReplicationError::Protocol(format!("snapshot db index {db_index} out of range"))
            })?;
            db.insert(
                record.key,
                Entry {
                    value: record.value,
                    expires_at_ms: record.expires_at_ms,
                },
            );
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            return Err(ReplicationError::StaleGeneration);
        }
        self.store.replace_all(dbs);
        state.replication_id = Some(replication_id);
        state.offset = offset;
        Ok(())
    }

    /// Apply the replicated stream, acking and watching liveness
    async fn stream(
        &self,
        generation: u64,
        mut reader: RespReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) -> Result<()> {
        let mut ctx = ConnCtx::primary_link();
        let mut ack_tick =
            tokio::time::interval(Duration::from_secs(self.config.ack_interval_secs));
        ack_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let liveness = Duration::from_secs(self.config.replica_timeout_secs);
        let mut last_heard = tokio::time::Instant::now();

        loop {
            tokio::select! {
                next = reader.read_command() => {
                    let Some((args, consumed)) = next? else {
                        return Err(ReplicationError::ConnectionClosed);
                    };
                    last_heard = tokio::time::Instant::now();
                    self.apply(generation, &mut ctx, &args, consumed).await?;
                }
                _ = ack_tick.tick() => {
                    // Keepalive PINGs keep arriving on a healthy link,
                    // so silence this long means it is dead
                    if last_heard.elapsed() > liveness {
                        return Err(ReplicationError::Timeout);
                    }
                    let offset = {
                        let state = self.state.lock();
                        if state.generation != generation {
                            return Err(ReplicationError::StaleGeneration);
                        }
                        state.offset
                    };
                    send(&mut writer, &["REPLCONF", "ACK", &offset.to_string()]).await?;
                }
            }
        }
    }

    /// Execute one replicated command and advance the applied offset.
    /// Accepted writes flow into this node's own command log so the
    /// replica is durable in its own right.
    async fn apply(
        &self,
        generation: u64,
        ctx: &mut ConnCtx,
        args: &[Vec<u8>],
        consumed: usize,
    ) -> Result<()> {
        // The fencing check and the store mutation share one lock
        // hold: a retarget bumps the generation first, and a command
        // read on the superseded link is discarded, never applied.
        let exec = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return Err(ReplicationError::StaleGeneration);
            }
            let exec = self.store.execute(ctx, args);
            state.offset += consumed as u64;
            exec
        };
        for write in exec.writes {
            if let Err(e) = self.log.enqueue(ctx.db_index, write).await {
                warn!("replica log append failed: {e}");
            }
        }
        Ok(())
    }

    /// Run a state mutation only if this attempt is still current
    fn commit(&self, generation: u64, mutate: impl FnOnce(&mut ReplicaState)) -> Result<()> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Err(ReplicationError::StaleGeneration);
        }
        mutate(&mut state);
        Ok(())
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.state.lock().generation != generation
    }
}

async fn send(writer: &mut OwnedWriteHalf, parts: &[&str]) -> Result<()> {
    let args: Vec<Vec<u8>> = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
    writer.write_all(&resp::encode_command(&args)).await?;
    Ok(())
}

async fn expect_ok(reader: &mut RespReader<OwnedReadHalf>, want: &str) -> Result<()> {
    let line = reader.read_line().await?;
    if line == want {
        Ok(())
    } else {
        Err(ReplicationError::Handshake(format!(
            "expected {want}, primary said {line}"
        )))
    }
}
