use super::types::{DurabilityConfig, FsyncPolicy, LogRecord, PersistenceError, Result};
use crate::protocol::resp;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Observer of durable appends. Invoked synchronously from the writer
/// task with the exact bytes just written; errors are logged and
/// swallowed, never propagated to the writer.
pub trait LogListener: Send + Sync {
    fn on_append(&self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Registry of append listeners
#[derive(Default)]
pub struct ListenerRegistry {
    entries: parking_lot::RwLock<Vec<(u64, Arc<dyn LogListener>)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn LogListener>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: u64) {
        self.entries.write().retain(|(entry_id, _)| *entry_id != id);
    }

    fn notify(&self, bytes: &[u8]) {
        let entries = self.entries.read();
        for (id, listener) in entries.iter() {
            if let Err(e) = listener.on_append(bytes) {
                warn!(listener = id, "log listener failed: {e}");
            }
        }
    }
}

/// The open log file plus writer bookkeeping. Guarded by a mutex so
/// the compactor can swap it during the pause-gate windows.
pub(crate) struct LogFile {
    pub sink: Option<FileSink>,
    /// Database the last appended record targeted; None forces a
    /// SELECT before the next record (fresh open, post-rewrite).
    pub db_index: Option<usize>,
}

pub(crate) struct FileSink {
    pub writer: BufWriter<File>,
    pub size: u64,
}

impl FileSink {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            size,
        })
    }

    pub async fn sync(&mut self) -> std::io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await
    }
}

enum LogMessage {
    Record(LogRecord),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// The command log writer ("AOF persister").
///
/// A single consumer task drains a bounded queue and appends each
/// record to the log file in acceptance order, emitting a synthetic
/// SELECT whenever the target database changes. Registered listeners
/// observe every appended byte in the same order, which is what the
/// replication backlog is built on.
pub struct CommandLog {
    tx: mpsc::Sender<LogMessage>,
    gate: Arc<RwLock<()>>,
    file: Arc<Mutex<LogFile>>,
    listeners: Arc<ListenerRegistry>,
    rewrite_in_flight: Arc<AtomicBool>,
    config: DurabilityConfig,
}

impl CommandLog {
    /// Open the log and start the writer task. Failure to open the
    /// file is fatal; the caller should abort startup.
    pub async fn open(config: DurabilityConfig) -> Result<Arc<Self>> {
        let sink = if config.enabled {
            if let Some(parent) = config.log_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let sink = FileSink::open(&config.log_path).await?;
            info!(path = %config.log_path.display(), size = sink.size, "command log opened");
            Some(sink)
        } else {
            debug!("durability disabled; log writer runs without a file sink");
            None
        };

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let gate = Arc::new(RwLock::new(()));
        let file = Arc::new(Mutex::new(LogFile {
            sink,
            db_index: None,
        }));
        let listeners = Arc::new(ListenerRegistry::default());

        let log = Arc::new(Self {
            tx,
            gate: Arc::clone(&gate),
            file: Arc::clone(&file),
            listeners: Arc::clone(&listeners),
            rewrite_in_flight: Arc::new(AtomicBool::new(false)),
            config: config.clone(),
        });

        tokio::spawn(writer_loop(rx, gate, file, listeners, config));
        Ok(log)
    }

    /// Queue a write for durable append. Blocks when the queue is
    /// full; never drops a record.
    pub async fn enqueue(&self, db_index: usize, args: Vec<Vec<u8>>) -> Result<()> {
        self.tx
            .send(LogMessage::Record(LogRecord { db_index, args }))
            .await
            .map_err(|_| PersistenceError::LogClosed)
    }

    /// Wait until every record queued so far has been appended and
    /// synced. The queue is FIFO, so the ack doubles as a barrier.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(LogMessage::Flush(ack_tx))
            .await
            .map_err(|_| PersistenceError::LogClosed)?;
        ack_rx.await.map_err(|_| PersistenceError::LogClosed)
    }

    /// Drain outstanding records, fsync, and stop the writer
    pub async fn close(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(LogMessage::Close(ack_tx))
            .await
            .map_err(|_| PersistenceError::LogClosed)?;
        ack_rx.await.map_err(|_| PersistenceError::LogClosed)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn config(&self) -> &DurabilityConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Single-flight claim for the compactor
    pub fn begin_rewrite(&self) -> bool {
        self.rewrite_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_rewrite(&self) {
        self.rewrite_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn rewrite_in_flight(&self) -> bool {
        self.rewrite_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn gate(&self) -> &Arc<RwLock<()>> {
        &self.gate
    }

    pub(crate) fn file(&self) -> &Arc<Mutex<LogFile>> {
        &self.file
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<LogMessage>,
    gate: Arc<RwLock<()>>,
    file: Arc<Mutex<LogFile>>,
    listeners: Arc<ListenerRegistry>,
    config: DurabilityConfig,
) {
    let every_second = config.fsync == FsyncPolicy::EverySecond;
    let mut fsync_tick = tokio::time::interval(Duration::from_secs(1));
    fsync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(LogMessage::Record(record)) => {
                    append_record(&gate, &file, &listeners, &config, record).await;
                }
                Some(LogMessage::Flush(ack)) => {
                    sync_file(&gate, &file).await;
                    let _ = ack.send(());
                }
                Some(LogMessage::Close(ack)) => {
                    // Refuse new intake first, then drain everything
                    // the channel already accepted; an enqueue that
                    // returned Ok is never dropped.
                    rx.close();
                    while let Some(msg) = rx.recv().await {
                        if let LogMessage::Record(record) = msg {
                            append_record(&gate, &file, &listeners, &config, record).await;
                        }
                    }
                    sync_file(&gate, &file).await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    sync_file(&gate, &file).await;
                    break;
                }
            },
            _ = fsync_tick.tick(), if every_second => {
                sync_file(&gate, &file).await;
            }
        }
    }
    info!("command log writer stopped");
}

async fn append_record(
    gate: &RwLock<()>,
    file: &Mutex<LogFile>,
    listeners: &ListenerRegistry,
    config: &DurabilityConfig,
    record: LogRecord,
) {
    // Shared side of the pause gate: appends only serialize against
    // the compactor's capture windows.
    let _gate = gate.read().await;
    let mut file = file.lock().await;

    let mut out = Vec::new();
    if file.db_index != Some(record.db_index) {
        out.extend(resp::encode_command(&[
            b"SELECT".to_vec(),
            record.db_index.to_string().into_bytes(),
        ]));
        file.db_index = Some(record.db_index);
    }
    out.extend(resp::encode_command(&record.args));

    if let Some(sink) = file.sink.as_mut() {
        let write = async {
            sink.writer.write_all(&out).await?;
            if config.fsync == FsyncPolicy::Always {
                sink.sync().await?;
            }
            std::io::Result::Ok(())
        };
        match write.await {
            Ok(()) => sink.size += out.len() as u64,
            // Degraded mode: keep serving writes, keep the stream flowing
            Err(e) => warn!("command log append failed, continuing: {e}"),
        }
    }

    // Fan out before releasing the gate so a concurrent capture sees
    // the file and the listeners at the same boundary.
    listeners.notify(&out);
}

async fn sync_file(gate: &RwLock<()>, file: &Mutex<LogFile>) {
    let _gate = gate.read().await;
    let mut file = file.lock().await;
    if let Some(sink) = file.sink.as_mut() {
        if let Err(e) = sink.sync().await {
            warn!("command log fsync failed: {e}");
        }
    }
}
