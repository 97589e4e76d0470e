//! Cross-component durability tests: log replay, compaction
//! equivalence, and no-loss under concurrent traffic.

use super::aof::CommandLog;
use super::recovery;
use super::rewrite::Compactor;
use super::snapshot;
use super::types::{DurabilityConfig, FsyncPolicy, PersistenceError};
use crate::core::{ConnCtx, Store, Value};
use std::sync::Arc;

fn line(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

fn test_config(dir: &tempfile::TempDir) -> DurabilityConfig {
    DurabilityConfig {
        enabled: true,
        log_path: dir.path().join("ember.aof"),
        fsync: FsyncPolicy::Always,
        snapshot_preamble: false,
        queue_depth: 1024,
    }
}

/// Execute a command the way the server front door does: mutate the
/// store, then push the accepted write lines into the log.
async fn apply(store: &Store, log: &CommandLog, ctx: &mut ConnCtx, parts: &[&str]) {
    let exec = store.execute(ctx, &line(parts));
    for write in exec.writes {
        log.enqueue(ctx.db_index, write).await.unwrap();
    }
}

/// Stable flattened view of a store's entire keyspace
fn dump(store: &Store) -> Vec<(usize, String, Value, Option<u64>)> {
    let mut entries = Vec::new();
    for db_index in 0..store.db_count() {
        store.for_each_entity(db_index, |key, value, expires_at_ms| {
            entries.push((db_index, key.to_string(), value.clone(), expires_at_ms));
        });
    }
    entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    entries
}

async fn replay_file(config: &DurabilityConfig) -> Store {
    let store = Store::new(16);
    recovery::load_command_log(&config.log_path, &store)
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_replay_reproduces_keyspace() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let store = Store::new(16);
    let log = CommandLog::open(config.clone()).await.unwrap();
    let mut ctx = ConnCtx::client();

    apply(&store, &log, &mut ctx, &["SET", "a", "1"]).await;
    apply(&store, &log, &mut ctx, &["RPUSH", "l", "x", "y"]).await;
    apply(&store, &log, &mut ctx, &["HSET", "h", "f", "v"]).await;
    apply(&store, &log, &mut ctx, &["SELECT", "4"]).await;
    apply(&store, &log, &mut ctx, &["SADD", "s", "m"]).await;
    apply(&store, &log, &mut ctx, &["SET", "gone", "1"]).await;
    apply(&store, &log, &mut ctx, &["DEL", "gone"]).await;
    log.close().await.unwrap();

    let restored = replay_file(&config).await;
    assert_eq!(dump(&restored), dump(&store));
}

#[tokio::test]
async fn test_rewrite_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let store = Store::new(16);
    let log = CommandLog::open(config.clone()).await.unwrap();
    let compactor = Compactor::new(Arc::clone(&log), 16);
    let mut ctx = ConnCtx::client();

    apply(&store, &log, &mut ctx, &["SET", "a", "1"]).await;
    apply(&store, &log, &mut ctx, &["SET", "a", "2"]).await;
    apply(&store, &log, &mut ctx, &["SET", "b", "1"]).await;
    apply(&store, &log, &mut ctx, &["DEL", "b"]).await;

    compactor.rewrite(None).await.unwrap();
    log.close().await.unwrap();
    let first = dump(&replay_file(&config).await);
    assert_eq!(first, dump(&store));

    // Rewriting an already-compact log changes nothing observable
    let log = CommandLog::open(config.clone()).await.unwrap();
    let compactor = Compactor::new(Arc::clone(&log), 16);
    compactor.rewrite(None).await.unwrap();
    log.close().await.unwrap();
    let second = dump(&replay_file(&config).await);
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_rewrite_loses_nothing_under_concurrent_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let store = Arc::new(Store::new(16));
    let log = CommandLog::open(config.clone()).await.unwrap();
    let compactor = Compactor::new(Arc::clone(&log), 16);

    let mut ctx = ConnCtx::client();
    for i in 0..50 {
        apply(&store, &log, &mut ctx, &["SET", &format!("before:{i}"), "1"]).await;
    }

    // Writes racing the rewrite, including one guaranteed to land
    // while it runs
    let writer_store = Arc::clone(&store);
    let writer_log = Arc::clone(&log);
    let writer = tokio::spawn(async move {
        let mut ctx = ConnCtx::client();
        for i in 0..50 {
            apply(
                &writer_store,
                &writer_log,
                &mut ctx,
                &["SET", &format!("during:{i}"), "1"],
            )
            .await;
        }
    });

    compactor.rewrite(None).await.unwrap();
    writer.await.unwrap();
    apply(&store, &log, &mut ctx, &["SET", "after", "1"]).await;
    log.close().await.unwrap();

    let restored = replay_file(&config).await;
    assert_eq!(dump(&restored), dump(&store));
    let (keys, _) = restored.key_count(0);
    assert_eq!(keys, 101);
}

#[tokio::test]
async fn test_rewrite_with_snapshot_preamble() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.snapshot_preamble = true;

    let store = Store::new(16);
    let log = CommandLog::open(config.clone()).await.unwrap();
    let compactor = Compactor::new(Arc::clone(&log), 16);
    let mut ctx = ConnCtx::client();

    apply(&store, &log, &mut ctx, &["SET", "a", "1"]).await;
    apply(&store, &log, &mut ctx, &["RPUSH", "l", "x"]).await;
    compactor.rewrite(None).await.unwrap();

    // Post-rewrite writes append as commands after the preamble
    apply(&store, &log, &mut ctx, &["SET", "b", "2"]).await;
    log.close().await.unwrap();

    let bytes = tokio::fs::read(&config.log_path).await.unwrap();
    assert!(snapshot::starts_with_snapshot(&bytes));

    let restored = replay_file(&config).await;
    assert_eq!(dump(&restored), dump(&store));
}

#[tokio::test]
async fn test_rewrite_is_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let log = CommandLog::open(test_config(&dir)).await.unwrap();
    let compactor = Compactor::new(Arc::clone(&log), 16);

    assert!(log.begin_rewrite());
    let result = compactor.rewrite(None).await;
    assert!(matches!(result, Err(PersistenceError::RewriteInProgress)));
    log.end_rewrite();

    compactor.rewrite(None).await.unwrap();
}

#[tokio::test]
async fn test_rewrite_requires_enabled_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.enabled = false;

    let log = CommandLog::open(config).await.unwrap();
    let compactor = Compactor::new(Arc::clone(&log), 16);
    let result = compactor.rewrite(None).await;
    assert!(matches!(result, Err(PersistenceError::LogDisabled)));
}

#[tokio::test]
async fn test_build_replication_snapshot_captures_prefix_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let store = Store::new(16);
    let log = CommandLog::open(config.clone()).await.unwrap();
    let mut ctx = ConnCtx::client();
    apply(&store, &log, &mut ctx, &["SET", "a", "1"]).await;
    apply(&store, &log, &mut ctx, &["SET", "b", "2"]).await;

    // Drain the queue before capturing; close is the simplest barrier
    log.close().await.unwrap();
    let log = CommandLog::open(config.clone()).await.unwrap();
    let compactor = Compactor::new(Arc::clone(&log), 16);

    let dest = dir.path().join("repl.snapshot");
    let begin = compactor
        .build_replication_snapshot(&dest, &|| 42)
        .await
        .unwrap();
    assert_eq!(begin, 42);

    let bytes = tokio::fs::read(&dest).await.unwrap();
    let (records, _) = snapshot::decode_snapshot_prefix(&bytes).unwrap();
    assert_eq!(records.len(), 2);
}
