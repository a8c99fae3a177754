//! End-to-end tests for the auto-sync write-back path

use std::sync::Arc;
use std::time::Duration;

use litestore::{
    AutoSyncService, CreateTableOptions, Database, Engine, ReadOptions, StoreConfig, SyncConfig,
    SyncEvent, SyncTarget,
};
use serde_json::json;
use tempfile::tempdir;

fn record(v: serde_json::Value) -> litestore::Record {
    v.as_object().expect("object literal").clone()
}

fn manual_sync(engine: &Arc<Engine>, config: SyncConfig) -> AutoSyncService {
    let _ = env_logger::builder().is_test(true).try_init();
    AutoSyncService::new(
        engine.cache(),
        Arc::clone(engine) as Arc<dyn SyncTarget>,
        config,
    )
}

#[test]
fn test_deferred_writes_flush_to_disk() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(&StoreConfig::for_tests(dir.path())).unwrap());
    let sync = manual_sync(
        &engine,
        SyncConfig {
            min_items: 2,
            batch_size: 100,
            ..Default::default()
        },
    );

    engine.create_table("t", CreateTableOptions::default()).unwrap();
    engine
        .write_deferred(
            "t",
            vec![
                record(json!({"id": 1, "v": "a"})),
                record(json!({"id": 2, "v": "b"})),
            ],
        )
        .unwrap();
    assert_eq!(engine.cache().dirty_data().len(), 2);

    let flushed = sync.flush_now();
    assert_eq!(flushed, 2);
    assert!(engine.cache().dirty_data().is_empty());

    // The flushed values are on disk now.
    let on_disk = engine
        .read(
            "t",
            ReadOptions {
                bypass_cache: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(on_disk.len(), 2);
    assert!(on_disk.iter().any(|r| r["v"] == json!("a")));
    assert!(on_disk.iter().any(|r| r["v"] == json!("b")));
}

#[test]
fn test_min_items_holds_back_small_sets() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(&StoreConfig::for_tests(dir.path())).unwrap());
    let sync = manual_sync(
        &engine,
        SyncConfig {
            min_items: 2,
            ..Default::default()
        },
    );

    engine.create_table("t", CreateTableOptions::default()).unwrap();
    engine
        .write_deferred("t", vec![record(json!({"id": 1, "v": "a"}))])
        .unwrap();

    assert_eq!(sync.flush_now(), 0);
    assert_eq!(engine.cache().dirty_data().len(), 1);
}

#[test]
fn test_flush_upserts_over_existing_rows() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(&StoreConfig::for_tests(dir.path())).unwrap());
    let sync = manual_sync(&engine, SyncConfig::default());

    engine
        .insert(
            "t",
            vec![
                record(json!({"id": 1, "v": "old"})),
                record(json!({"id": 2, "v": "keep"})),
            ],
        )
        .unwrap();

    engine
        .write_deferred("t", vec![record(json!({"id": 1, "v": "new"}))])
        .unwrap();
    sync.flush_now();

    let all = engine
        .read(
            "t",
            ReadOptions {
                bypass_cache: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(all.len(), 2);
    let one = all.iter().find(|r| r["id"] == json!(1)).unwrap();
    assert_eq!(one["v"], json!("new"));
    let two = all.iter().find(|r| r["id"] == json!(2)).unwrap();
    assert_eq!(two["v"], json!("keep"));
}

#[test]
fn test_sync_events_observe_flush() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(&StoreConfig::for_tests(dir.path())).unwrap());
    let sync = manual_sync(&engine, SyncConfig::default());
    let events = sync.subscribe();

    engine.create_table("t", CreateTableOptions::default()).unwrap();
    engine
        .write_deferred("t", vec![record(json!({"id": 1}))])
        .unwrap();
    sync.flush_now();

    let received: Vec<SyncEvent> = events.try_iter().collect();
    assert!(matches!(received[0], SyncEvent::SyncStart { dirty: 1 }));
    assert!(matches!(
        received[1],
        SyncEvent::SyncComplete { flushed: 1, .. }
    ));

    let stats = sync.stats();
    assert_eq!(stats.passes, 1);
    assert_eq!(stats.entries_flushed, 1);
}

#[test]
fn test_database_background_loop_flushes() {
    let dir = tempdir().unwrap();
    let db = Database::open(StoreConfig::for_tests(dir.path())).unwrap();

    db.create_table("t", CreateTableOptions::default()).unwrap();
    db.write_deferred("t", vec![record(json!({"id": 1, "v": "bg"}))])
        .unwrap();

    // The for_tests profile ticks every 50ms.
    let mut waited = Duration::ZERO;
    while !db.engine().cache().dirty_data().is_empty() && waited < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(25));
        waited += Duration::from_millis(25);
    }
    assert!(db.engine().cache().dirty_data().is_empty(), "flush never ran");

    let on_disk = db
        .read(
            "t",
            ReadOptions {
                bypass_cache: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0]["v"], json!("bg"));
}

#[test]
fn test_close_drains_dirty_entries() {
    let dir = tempdir().unwrap();
    let records_on_disk;
    {
        let mut config = StoreConfig::for_tests(dir.path());
        // Long interval: only the shutdown drain can flush.
        config.sync.interval = Duration::from_secs(3600);
        let db = Database::open(config).unwrap();

        db.create_table("t", CreateTableOptions::default()).unwrap();
        db.write_deferred("t", vec![record(json!({"id": 1, "v": "drained"}))])
            .unwrap();
        db.close().unwrap();

        records_on_disk = std::fs::read_to_string(dir.path().join("t.ldb")).unwrap();
    }
    assert!(records_on_disk.contains("drained"));
}
