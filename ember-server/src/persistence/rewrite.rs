use super::aof::{CommandLog, FileSink};
use super::recovery;
use super::snapshot;
use super::types::{PersistenceError, Result};
use crate::core::Store;
use crate::protocol::resp;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

/// Invoked while the pause gate is held at the capture point; swaps
/// in a fresh replication backlog and returns its begin offset.
pub type RotateHook<'a> = &'a (dyn Fn() -> u64 + Send + Sync);

fn select_line(db_index: usize) -> Vec<Vec<u8>> {
    vec![b"SELECT".to_vec(), db_index.to_string().into_bytes()]
}

/// What StartRewrite froze while the writer was paused
struct Capture {
    size: u64,
    db_index: Option<usize>,
}

/// Log compactor: builds a smaller equivalent log concurrently with
/// live appends, then swaps it in atomically. Also produces the
/// snapshots full resynchronization is served from, via the same
/// capture-and-replay path.
pub struct Compactor {
    log: Arc<CommandLog>,
    db_count: usize,
}

impl Compactor {
    pub fn new(log: Arc<CommandLog>, db_count: usize) -> Self {
        Self { log, db_count }
    }

    pub fn log(&self) -> &Arc<CommandLog> {
        &self.log
    }

    fn temp_path(&self) -> PathBuf {
        self.log.config().log_path.with_extension("rewrite")
    }

    /// Compact the command log. `rotate` additionally swaps the
    /// replication backlog at the capture boundary.
    pub async fn rewrite(&self, rotate: Option<RotateHook<'_>>) -> Result<()> {
        if !self.log.begin_rewrite() {
            return Err(PersistenceError::RewriteInProgress);
        }
        let result = self.rewrite_inner(rotate).await;
        self.log.end_rewrite();

        if let Err(e) = &result {
            warn!("log rewrite aborted: {e}");
            let _ = tokio::fs::remove_file(self.temp_path()).await;
        }
        result
    }

    async fn rewrite_inner(&self, rotate: Option<RotateHook<'_>>) -> Result<()> {
        let path = self.log.config().log_path.clone();
        let temp = self.temp_path();

        // StartRewrite: freeze an exact boundary under the pause gate
        let capture = {
            let _gate = self.log.gate().write().await;
            let mut file = self.log.file().lock().await;
            let sink = file
                .sink
                .as_mut()
                .ok_or(PersistenceError::LogDisabled)?;
            sink.sync().await?;
            let capture = Capture {
                size: sink.size,
                db_index: file.db_index,
            };
            File::create(&temp).await?;
            if let Some(rotate) = rotate {
                rotate();
            }
            capture
        };
        info!(boundary = capture.size, "log rewrite started");

        // DoRewrite: slow part, concurrent with live appends
        let scratch = self.replay_prefix(&path, capture.size).await?;
        self.write_compact_log(&temp, &scratch).await?;

        // FinishRewrite: splice the suffix and swap, again paused
        {
            let _gate = self.log.gate().write().await;
            let mut file = self.log.file().lock().await;
            let sink = file
                .sink
                .as_mut()
                .ok_or(PersistenceError::LogDisabled)?;
            sink.sync().await?;

            let suffix = read_suffix(&path, capture.size).await?;
            let mut temp_file = OpenOptions::new().append(true).open(&temp).await?;
            if !suffix.is_empty() {
                let marker = capture.db_index.unwrap_or(0);
                temp_file
                    .write_all(&resp::encode_command(&select_line(marker)))
                    .await?;
                temp_file.write_all(&suffix).await?;
            }
            temp_file.sync_all().await?;
            drop(temp_file);

            // The rename is the only destructive step; every failure
            // above leaves the old log authoritative.
            tokio::fs::rename(&temp, &path).await?;

            let mut new_sink = FileSink::open(&path).await?;
            // The marker may have moved during the unpaused window
            let current = file.db_index.unwrap_or(0);
            let trailer = resp::encode_command(&select_line(current));
            new_sink.writer.write_all(&trailer).await?;
            new_sink.size += trailer.len() as u64;
            new_sink.sync().await?;

            file.sink = Some(new_sink);
            file.db_index = Some(current);
            info!(suffix = suffix.len(), "log rewrite finished");
        }

        Ok(())
    }

    /// Build a snapshot of the log's current state for full
    /// resynchronization, rotating the backlog at the capture point.
    /// Returns the new backlog's begin offset.
    pub async fn build_replication_snapshot(
        &self,
        dest: &Path,
        rotate: RotateHook<'_>,
    ) -> Result<u64> {
        if !self.log.begin_rewrite() {
            return Err(PersistenceError::RewriteInProgress);
        }
        let result = self.build_snapshot_inner(dest, rotate).await;
        self.log.end_rewrite();
        result
    }

    async fn build_snapshot_inner(&self, dest: &Path, rotate: RotateHook<'_>) -> Result<u64> {
        let path = self.log.config().log_path.clone();

        let (size, begin) = {
            let _gate = self.log.gate().write().await;
            let mut file = self.log.file().lock().await;
            let sink = file
                .sink
                .as_mut()
                .ok_or(PersistenceError::LogDisabled)?;
            sink.sync().await?;
            (sink.size, rotate())
        };

        let scratch = self.replay_prefix(&path, size).await?;
        let bytes = snapshot::encode_snapshot(&scratch)?;

        let staging = dest.with_extension("tmp");
        let mut file = File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, dest).await?;

        info!(
            boundary = size,
            begin_offset = begin,
            bytes = bytes.len(),
            "replication snapshot built"
        );
        Ok(begin)
    }

    /// Replace the log wholesale with the store's current contents.
    /// Used after a full resynchronization, when the dataset no
    /// longer descends from the history the log recorded.
    pub async fn reset_to_store(&self, store: &Store) -> Result<()> {
        if !self.log.is_enabled() {
            return Ok(());
        }
        if !self.log.begin_rewrite() {
            return Err(PersistenceError::RewriteInProgress);
        }
        let result = self.reset_inner(store).await;
        self.log.end_rewrite();

        if let Err(e) = &result {
            warn!("log reset aborted: {e}");
            let _ = tokio::fs::remove_file(self.temp_path()).await;
        }
        result
    }

    async fn reset_inner(&self, store: &Store) -> Result<()> {
        let path = self.log.config().log_path.clone();
        let temp = self.temp_path();

        // Records still queued describe the replaced history
        self.log.flush().await?;

        File::create(&temp).await?;
        self.write_compact_log(&temp, store).await?;

        let _gate = self.log.gate().write().await;
        let mut file = self.log.file().lock().await;
        tokio::fs::rename(&temp, &path).await?;
        file.sink = Some(FileSink::open(&path).await?);
        file.db_index = None;
        info!("command log reset to the synced dataset");
        Ok(())
    }

    /// Reconstruct state as of the capture point by replaying the
    /// first `size` bytes into a scratch store (durability disabled).
    async fn replay_prefix(&self, path: &Path, size: u64) -> Result<Store> {
        let scratch = Store::new(self.db_count);
        if size == 0 {
            return Ok(scratch);
        }
        let mut bytes = tokio::fs::read(path).await?;
        bytes.truncate(size as usize);
        recovery::replay_log_bytes(&bytes, &scratch)?;
        Ok(scratch)
    }

    /// Serialize the scratch store's keyspace into the temp log:
    /// either equivalent write commands or a snapshot preamble.
    async fn write_compact_log(&self, temp: &Path, scratch: &Store) -> Result<()> {
        let mut out = Vec::new();
        if self.log.config().snapshot_preamble {
            out = snapshot::encode_snapshot(scratch)?;
        } else {
            for db_index in 0..scratch.db_count() {
                let (keys, _) = scratch.key_count(db_index);
                if keys == 0 {
                    continue;
                }
                out.extend(resp::encode_command(&select_line(db_index)));
                scratch.for_each_entity(db_index, |key, value, expires_at_ms| {
                    for cmd in snapshot::value_to_commands(key, value, expires_at_ms) {
                        out.extend(resp::encode_command(&cmd));
                    }
                });
            }
        }

        let mut file = OpenOptions::new().write(true).truncate(true).open(temp).await?;
        file.write_all(&out).await?;
        file.sync_all().await?;
        Ok(())
    }
}

async fn read_suffix(path: &Path, from: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(from)).await?;
    let mut suffix = Vec::new();
    file.read_to_end(&mut suffix).await?;
    Ok(suffix)
}
