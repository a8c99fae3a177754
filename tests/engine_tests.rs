//! Integration tests for the core table lifecycle and write paths

use litestore::{
    BulkOp, CreateTableOptions, Database, ErrorCode, Filter, ReadOptions, StoreConfig,
};
use serde_json::json;
use tempfile::tempdir;

fn open_db(dir: &tempfile::TempDir) -> Database {
    let _ = env_logger::builder().is_test(true).try_init();
    Database::open(StoreConfig::for_tests(dir.path())).expect("open store")
}

fn record(v: serde_json::Value) -> litestore::Record {
    v.as_object().expect("object literal").clone()
}

#[test]
fn test_create_read_delete_single_mode() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.create_table("u", CreateTableOptions::default()).unwrap();
    db.insert(
        "u",
        vec![
            record(json!({"id": 1, "name": "A"})),
            record(json!({"id": 2, "name": "B"})),
        ],
    )
    .unwrap();

    assert_eq!(db.count("u").unwrap(), 2);
    let all = db.read("u", ReadOptions::all()).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["name"], json!("A"));
    assert_eq!(all[1]["name"], json!("B"));

    let removed = db.delete("u", Filter::eq("id", json!(1))).unwrap();
    assert_eq!(removed, 1);
    assert_eq!(db.count("u").unwrap(), 1);
    assert!(db.find_one("u", Filter::eq("id", json!(1))).unwrap().is_none());
    assert_eq!(
        db.find_one("u", Filter::eq("id", json!(2))).unwrap().unwrap()["name"],
        json!("B")
    );
}

#[test]
fn test_create_table_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.create_table("t", CreateTableOptions::default()).unwrap();
    db.insert("t", vec![record(json!({"id": 1}))]).unwrap();
    // Creating again must not clobber the data.
    db.create_table("t", CreateTableOptions::default()).unwrap();
    assert_eq!(db.count("t").unwrap(), 1);
}

#[test]
fn test_delete_table_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.create_table("t", CreateTableOptions::default()).unwrap();
    assert!(db.has_table("t"));
    db.delete_table("t").unwrap();
    assert!(!db.has_table("t"));
    // Second delete is a safe no-op.
    db.delete_table("t").unwrap();
}

#[test]
fn test_soft_and_strict_missing_table_asymmetry() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    // Soft calls read as empty.
    assert!(db.read("ghost", ReadOptions::all()).unwrap().is_empty());
    assert!(db
        .find_many("ghost", None, ReadOptions::all())
        .unwrap()
        .is_empty());
    assert!(db.find_one("ghost", Filter::all()).unwrap().is_none());

    // Strict calls raise TABLE_NOT_FOUND.
    assert_eq!(db.count("ghost").unwrap_err().code, ErrorCode::TableNotFound);
    assert_eq!(
        db.verify_count("ghost").unwrap_err().code,
        ErrorCode::TableNotFound
    );
    assert_eq!(
        db.migrate_to_chunked("ghost").unwrap_err().code,
        ErrorCode::TableNotFound
    );
}

#[test]
fn test_overwrite_then_read_returns_exactly_written() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    let records = vec![
        record(json!({"id": 3, "v": "c"})),
        record(json!({"id": 1, "v": "a"})),
        record(json!({"id": 2, "v": "b"})),
    ];
    db.overwrite("t", records.clone()).unwrap();
    // Order preserved, not silently re-sorted.
    assert_eq!(db.read("t", ReadOptions::all()).unwrap(), records);

    let replacement = vec![record(json!({"id": 9, "v": "z"}))];
    db.overwrite("t", replacement.clone()).unwrap();
    assert_eq!(db.read("t", ReadOptions::all()).unwrap(), replacement);
    assert_eq!(db.count("t").unwrap(), 1);
}

#[test]
fn test_insert_concatenates_in_order() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    let first = vec![record(json!({"id": 1})), record(json!({"id": 2}))];
    let second = vec![record(json!({"id": 3}))];
    db.insert("t", first.clone()).unwrap();
    db.insert("t", second.clone()).unwrap();

    let mut expected = first;
    expected.extend(second);
    assert_eq!(db.read("t", ReadOptions::all()).unwrap(), expected);
}

#[test]
fn test_update_plain_and_operator_merge() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert(
        "t",
        vec![
            record(json!({"id": 1, "score": 10, "tags": ["a"]})),
            record(json!({"id": 2, "score": 20})),
        ],
    )
    .unwrap();

    // Plain merge overwrites fields on matching records.
    let modified = db
        .update("t", json!({"rank": "gold"}), Filter::eq("id", json!(1)))
        .unwrap();
    assert_eq!(modified, 1);
    let one = db.find_one("t", Filter::eq("id", json!(1))).unwrap().unwrap();
    assert_eq!(one["rank"], json!("gold"));
    assert_eq!(one["score"], json!(10));

    // Operator update.
    db.update(
        "t",
        json!({"$inc": {"score": 5}, "$push": {"tags": "b"}}),
        Filter::eq("id", json!(1)),
    )
    .unwrap();
    let one = db.find_one("t", Filter::eq("id", json!(1))).unwrap().unwrap();
    assert_eq!(one["score"], json!(15));
    assert_eq!(one["tags"], json!(["a", "b"]));
}

#[test]
fn test_delete_with_empty_filter_deletes_all() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert(
        "t",
        vec![record(json!({"id": 1})), record(json!({"id": 2}))],
    )
    .unwrap();

    let removed = db.delete("t", Filter::all()).unwrap();
    assert_eq!(removed, 2);
    assert!(db.read("t", ReadOptions::all()).unwrap().is_empty());
    assert!(db.has_table("t"), "delete removes records, not the table");
}

#[test]
fn test_clear_table_keeps_schema() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert("t", vec![record(json!({"id": 1}))]).unwrap();
    db.clear_table("t").unwrap();

    assert!(db.has_table("t"));
    assert_eq!(db.count("t").unwrap(), 0);
    assert!(db.read("t", ReadOptions::all()).unwrap().is_empty());

    assert_eq!(
        db.clear_table("ghost").unwrap_err().code,
        ErrorCode::TableNotFound
    );
}

#[test]
fn test_bulk_update_with_where() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert(
        "t",
        vec![
            record(json!({"id": 1, "active": true, "age": 25})),
            record(json!({"id": 2, "active": true, "age": 30})),
            record(json!({"id": 3, "active": false, "age": 35})),
        ],
    )
    .unwrap();

    let summary = db
        .bulk_write(
            "t",
            vec![BulkOp::Update {
                data: json!({"age": 40}),
                filter: Filter::from_value(&json!({"active": true})).unwrap(),
            }],
        )
        .unwrap();
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.written(), 2);

    let actives = db
        .find_many(
            "t",
            Some(Filter::from_value(&json!({"active": true})).unwrap()),
            ReadOptions::all(),
        )
        .unwrap();
    assert_eq!(actives.len(), 2);
    assert!(actives.iter().all(|r| r["age"] == json!(40)));

    // The inactive record is untouched.
    let inactive = db.find_one("t", Filter::eq("id", json!(3))).unwrap().unwrap();
    assert_eq!(inactive["age"], json!(35));
}

#[test]
fn test_bulk_mixed_ops_apply_in_order() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert("t", vec![record(json!({"id": 1, "keep": false}))]).unwrap();

    let summary = db
        .bulk_write(
            "t",
            vec![
                BulkOp::Insert {
                    records: vec![record(json!({"id": 2, "keep": true}))],
                },
                BulkOp::Delete {
                    filter: Filter::eq("keep", json!(false)),
                },
            ],
        )
        .unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.deleted, 1);

    let remaining = db.read("t", ReadOptions::all()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["id"], json!(2));
}

#[test]
fn test_find_many_equals_filtered_read() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert(
        "t",
        vec![
            record(json!({"id": 1, "group": "a"})),
            record(json!({"id": 2, "group": "b"})),
            record(json!({"id": 3, "group": "a"})),
        ],
    )
    .unwrap();

    let filter = Filter::from_value(&json!({"group": "a"})).unwrap();
    let via_find = db.find_many("t", Some(filter.clone()), ReadOptions::all()).unwrap();

    let via_read: Vec<_> = db
        .read("t", ReadOptions::all())
        .unwrap()
        .into_iter()
        .filter(|r| filter.matches(r))
        .collect();
    assert_eq!(via_find, via_read);
}

#[test]
fn test_invalid_table_names_rejected() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    for bad in ["", "   ", "../escape", "a/b", "a\\b"] {
        let err = db
            .create_table(bad, CreateTableOptions::default())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TableNameInvalid, "name {:?}", bad);

        let err = db.insert(bad, vec![record(json!({"id": 1}))]).unwrap_err();
        assert_eq!(err.code, ErrorCode::TableNameInvalid, "name {:?}", bad);
    }
}

#[test]
fn test_verify_count_flags_divergence() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.insert("t", vec![record(json!({"id": 1})), record(json!({"id": 2}))]).unwrap();
    let check = db.verify_count("t").unwrap();
    assert_eq!(check.metadata, 2);
    assert_eq!(check.actual, 2);
    assert!(check.matches);

    // Corrupt the advisory count behind the engine's back.
    db.engine()
        .catalog()
        .update("t", litestore::types::SchemaPatch::count(99));
    let check = db.verify_count("t").unwrap();
    assert_eq!(check.metadata, 99);
    assert_eq!(check.actual, 2);
    assert!(!check.matches);
}

#[test]
fn test_persistence_across_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open_db(&dir);
        db.insert("t", vec![record(json!({"id": 1, "v": "x"}))]).unwrap();
        db.close().unwrap();
    }

    let db = open_db(&dir);
    assert!(db.has_table("t"));
    assert_eq!(db.count("t").unwrap(), 1);
    assert_eq!(
        db.find_one("t", Filter::eq("id", json!(1))).unwrap().unwrap()["v"],
        json!("x")
    );
}

#[test]
fn test_write_deferred_is_readable_before_flush() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    db.create_table("t", CreateTableOptions::default()).unwrap();
    db.write_deferred("t", vec![record(json!({"id": 1, "v": "pending"}))])
        .unwrap();

    // The dirty entry is authoritative even though disk is still empty.
    let all = db.read("t", ReadOptions::all()).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0]["v"], json!("pending"));
}
