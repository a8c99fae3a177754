//! Integration tests for chunked-mode tables and single→chunked migration

use litestore::{
    CreateTableOptions, Database, ErrorCode, Filter, ReadOptions, StorageMode, StoreConfig,
};
use serde_json::json;
use tempfile::tempdir;

fn open_db(dir: &tempfile::TempDir) -> Database {
    Database::open(StoreConfig::for_tests(dir.path())).expect("open store")
}

fn small_chunk_db(dir: &tempfile::TempDir) -> Database {
    let mut config = StoreConfig::for_tests(dir.path());
    config.chunk_threshold = 2 * 1024;
    Database::open(config).expect("open store")
}

fn record(v: serde_json::Value) -> litestore::Record {
    v.as_object().expect("object literal").clone()
}

fn many_records(n: usize) -> Vec<litestore::Record> {
    (0..n)
        .map(|i| record(json!({"id": i, "name": format!("record-{}", i), "filler": "x".repeat(40)})))
        .collect()
}

#[test]
fn test_explicit_chunked_mode_round_trip() {
    let dir = tempdir().unwrap();
    let db = small_chunk_db(&dir);

    let options = CreateTableOptions {
        mode: Some(StorageMode::Chunked),
        ..Default::default()
    };
    db.create_table("logs", options).unwrap();

    let records = many_records(100);
    db.insert("logs", records.clone()).unwrap();

    // Insertion order survives the chunk split.
    assert_eq!(db.read("logs", ReadOptions::all()).unwrap(), records);
    assert!(dir.path().join("logs").is_dir());

    let schema = db.engine().catalog().get("logs").unwrap();
    assert_eq!(schema.mode, StorageMode::Chunked);
    assert!(schema.chunks.unwrap() > 1, "expected a multi-chunk table");
}

#[test]
fn test_chunked_append_extends_tail() {
    let dir = tempdir().unwrap();
    let db = small_chunk_db(&dir);

    db.create_table(
        "logs",
        CreateTableOptions {
            mode: Some(StorageMode::Chunked),
            ..Default::default()
        },
    )
    .unwrap();

    db.insert("logs", many_records(50)).unwrap();
    let chunks_before = db.engine().catalog().get("logs").unwrap().chunks.unwrap();

    db.insert("logs", many_records(50)).unwrap();
    let chunks_after = db.engine().catalog().get("logs").unwrap().chunks.unwrap();

    assert!(chunks_after >= chunks_before);
    assert_eq!(db.count("logs").unwrap(), 100);
    assert_eq!(db.read("logs", ReadOptions::all()).unwrap().len(), 100);
}

#[test]
fn test_large_initial_data_goes_chunked_by_heuristic() {
    let dir = tempdir().unwrap();
    let db = small_chunk_db(&dir);

    // Well past half the 2 KB threshold.
    db.insert("big", many_records(200)).unwrap();

    let schema = db.engine().catalog().get("big").unwrap();
    assert_eq!(schema.mode, StorageMode::Chunked);
    assert!(dir.path().join("big").is_dir());
}

#[test]
fn test_migrate_to_chunked_thousand_records() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    let records = many_records(1000);
    db.create_table(
        "t",
        CreateTableOptions {
            mode: Some(StorageMode::Single),
            ..Default::default()
        },
    )
    .unwrap();
    db.insert("t", records.clone()).unwrap();
    assert!(dir.path().join("t.ldb").exists());

    db.migrate_to_chunked("t").unwrap();

    let migrated = db.read("t", ReadOptions::all()).unwrap();
    assert_eq!(migrated.len(), 1000);
    assert_eq!(migrated, records);

    let schema = db.engine().catalog().get("t").unwrap();
    assert_eq!(schema.mode, StorageMode::Chunked);
    assert!(schema.chunks.unwrap() >= 1);
    assert_eq!(schema.count, 1000);

    assert!(dir.path().join("t").is_dir());
    assert!(!dir.path().join("t.ldb").exists());
}

#[test]
fn test_migrate_is_idempotent_and_strict() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert("t", many_records(10)).unwrap();
    db.migrate_to_chunked("t").unwrap();
    // Migrating an already-chunked table is a no-op.
    db.migrate_to_chunked("t").unwrap();
    assert_eq!(db.count("t").unwrap(), 10);

    assert_eq!(
        db.migrate_to_chunked("nope").unwrap_err().code,
        ErrorCode::TableNotFound
    );
}

#[test]
fn test_queries_work_after_migration() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert("t", many_records(100)).unwrap();
    db.migrate_to_chunked("t").unwrap();

    let found = db
        .find_one("t", Filter::eq("name", json!("record-42")))
        .unwrap()
        .unwrap();
    assert_eq!(found["id"], json!(42));

    let removed = db.delete("t", Filter::eq("id", json!(0))).unwrap();
    assert_eq!(removed, 1);
    assert_eq!(db.count("t").unwrap(), 99);
}

#[test]
fn test_chunked_table_delete_removes_directory() {
    let dir = tempdir().unwrap();
    let db = small_chunk_db(&dir);

    db.create_table(
        "logs",
        CreateTableOptions {
            mode: Some(StorageMode::Chunked),
            initial_data: many_records(50),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(dir.path().join("logs").is_dir());

    db.delete_table("logs").unwrap();
    assert!(!dir.path().join("logs").exists());
    assert!(!db.has_table("logs"));
}

#[test]
fn test_chunked_persistence_across_reopen() {
    let dir = tempdir().unwrap();
    let records = many_records(120);
    {
        let db = small_chunk_db(&dir);
        db.create_table(
            "logs",
            CreateTableOptions {
                mode: Some(StorageMode::Chunked),
                ..Default::default()
            },
        )
        .unwrap();
        db.insert("logs", records.clone()).unwrap();
        db.close().unwrap();
    }

    let db = small_chunk_db(&dir);
    assert_eq!(db.read("logs", ReadOptions::all()).unwrap(), records);
}
