//! Unit tests for the chrome.storage areas.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use extension_host::database::Database;
use extension_host::services::storage_engine::{item_size, StorageEngine};
use extension_host::types::config::StorageQuotas;
use extension_host::types::errors::StorageError;
use extension_host::types::storage::{StorageAreaKind, StorageKeys};

fn items(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {}", other),
    }
}

fn engine() -> StorageEngine {
    StorageEngine::new(Arc::new(Database::open_in_memory().unwrap()), StorageQuotas::default())
}

fn engine_with_quota(bytes: usize) -> StorageEngine {
    let quotas = StorageQuotas {
        local_bytes: bytes,
        sync_bytes: bytes,
        session_bytes: bytes,
    };
    StorageEngine::new(Arc::new(Database::open_in_memory().unwrap()), quotas)
}

#[test]
fn set_then_get_every_key_selector() {
    let storage = engine();
    storage
        .set("ext", StorageAreaKind::Local, items(json!({"a": 1, "b": {"nested": true}, "c": "x"})))
        .unwrap();

    let all = storage.get("ext", StorageAreaKind::Local, &StorageKeys::All).unwrap();
    assert_eq!(all.len(), 3);

    let one = storage
        .get("ext", StorageAreaKind::Local, &StorageKeys::One("b".to_string()))
        .unwrap();
    assert_eq!(Value::Object(one), json!({"b": {"nested": true}}));

    let many = storage
        .get(
            "ext",
            StorageAreaKind::Local,
            &StorageKeys::Many(vec!["a".to_string(), "missing".to_string()]),
        )
        .unwrap();
    assert_eq!(Value::Object(many), json!({"a": 1}));

    let defaults = StorageKeys::from_value(&json!({"a": 0, "z": "fallback"})).unwrap();
    let with_defaults = storage.get("ext", StorageAreaKind::Local, &defaults).unwrap();
    assert_eq!(Value::Object(with_defaults), json!({"a": 1, "z": "fallback"}));
}

#[test]
fn extensions_and_areas_are_partitioned() {
    let storage = engine();
    storage.set("one", StorageAreaKind::Local, items(json!({"k": 1}))).unwrap();
    storage.set("one", StorageAreaKind::Sync, items(json!({"k": 2}))).unwrap();
    storage.set("two", StorageAreaKind::Local, items(json!({"k": 3}))).unwrap();

    let get = |ext: &str, area| {
        Value::Object(storage.get(ext, area, &StorageKeys::All).unwrap())
    };
    assert_eq!(get("one", StorageAreaKind::Local), json!({"k": 1}));
    assert_eq!(get("one", StorageAreaKind::Sync), json!({"k": 2}));
    assert_eq!(get("two", StorageAreaKind::Local), json!({"k": 3}));
    assert_eq!(get("two", StorageAreaKind::Session), json!({}));
}

#[test]
fn set_reports_only_changed_keys() {
    let storage = engine();
    storage.set("ext", StorageAreaKind::Local, items(json!({"a": 1, "b": 2}))).unwrap();

    let changes = storage
        .set("ext", StorageAreaKind::Local, items(json!({"a": 1, "b": 3, "c": 4})))
        .unwrap();

    assert_eq!(changes.len(), 2);
    assert_eq!(changes["b"].old_value, Some(json!(2)));
    assert_eq!(changes["b"].new_value, Some(json!(3)));
    assert_eq!(changes["c"].old_value, None);
}

#[test]
fn remove_and_clear_report_old_values() {
    let storage = engine();
    storage.set("ext", StorageAreaKind::Sync, items(json!({"a": 1, "b": 2, "c": 3}))).unwrap();

    let removed = storage
        .remove("ext", StorageAreaKind::Sync, &["a".to_string(), "missing".to_string()])
        .unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed["a"].old_value, Some(json!(1)));
    assert_eq!(removed["a"].new_value, None);

    let cleared = storage.clear("ext", StorageAreaKind::Sync).unwrap();
    assert_eq!(cleared.keys().cloned().collect::<Vec<_>>(), vec!["b".to_string(), "c".to_string()]);
    assert!(storage.get("ext", StorageAreaKind::Sync, &StorageKeys::All).unwrap().is_empty());
}

#[test]
fn quota_exceeded_writes_nothing() {
    let storage = engine_with_quota(20);
    storage.set("ext", StorageAreaKind::Local, items(json!({"a": "12345"}))).unwrap();

    let result = storage.set("ext", StorageAreaKind::Local, items(json!({"b": "this value is too long"})));

    match result {
        Err(StorageError::QuotaExceeded { area, requested, quota }) => {
            assert_eq!(area, "local");
            assert_eq!(quota, 20);
            assert!(requested > 20);
        }
        other => panic!("expected quota error, got {:?}", other),
    }
    let stored = storage.get("ext", StorageAreaKind::Local, &StorageKeys::All).unwrap();
    assert_eq!(Value::Object(stored), json!({"a": "12345"}));
}

#[test]
fn replacing_a_value_counts_only_the_new_size() {
    // "k" + "\"aaaaaaaaaa\"" = 13 bytes
    let storage = engine_with_quota(13);
    storage.set("ext", StorageAreaKind::Local, items(json!({"k": "aaaaaaaaaa"}))).unwrap();
    assert!(storage
        .set("ext", StorageAreaKind::Local, items(json!({"k": "bbbbbbbbbb"})))
        .is_ok());
}

#[test]
fn bytes_in_use_matches_item_sizes() {
    let storage = engine();
    storage.set("ext", StorageAreaKind::Local, items(json!({"a": 1, "bb": "xy"}))).unwrap();

    let total = storage.bytes_in_use("ext", StorageAreaKind::Local, &StorageKeys::All).unwrap();
    assert_eq!(total, item_size("a", &json!(1)) + item_size("bb", &json!("xy")));
    assert_eq!(total, 2 + 6);

    let just_a = storage
        .bytes_in_use("ext", StorageAreaKind::Local, &StorageKeys::One("a".to_string()))
        .unwrap();
    assert_eq!(just_a, 2);
}

#[test]
fn clear_extension_wipes_every_area() {
    let storage = engine();
    for area in StorageAreaKind::ALL {
        storage.set("ext", area, items(json!({"k": 1}))).unwrap();
    }
    storage.set("other", StorageAreaKind::Local, items(json!({"k": 1}))).unwrap();

    storage.clear_extension("ext").unwrap();

    for area in StorageAreaKind::ALL {
        assert!(storage.get("ext", area, &StorageKeys::All).unwrap().is_empty());
    }
    assert_eq!(storage.get("other", StorageAreaKind::Local, &StorageKeys::All).unwrap().len(), 1);
}

#[test]
fn persistent_areas_survive_reopen_but_session_does_not() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("storage.db");
    {
        let storage = StorageEngine::new(Arc::new(Database::open(&path).unwrap()), StorageQuotas::default());
        storage.set("ext", StorageAreaKind::Local, items(json!({"l": 1}))).unwrap();
        storage.set("ext", StorageAreaKind::Sync, items(json!({"s": 2}))).unwrap();
        storage.set("ext", StorageAreaKind::Session, items(json!({"t": 3}))).unwrap();
    }

    let storage = StorageEngine::new(Arc::new(Database::open(&path).unwrap()), StorageQuotas::default());
    assert_eq!(storage.get("ext", StorageAreaKind::Local, &StorageKeys::All).unwrap().len(), 1);
    assert_eq!(storage.get("ext", StorageAreaKind::Sync, &StorageKeys::All).unwrap().len(), 1);
    assert!(storage.get("ext", StorageAreaKind::Session, &StorageKeys::All).unwrap().is_empty());
}

#[test]
fn key_selector_parsing() {
    assert_eq!(StorageKeys::from_value(&Value::Null), Some(StorageKeys::All));
    assert_eq!(StorageKeys::from_value(&json!("k")), Some(StorageKeys::One("k".to_string())));
    assert_eq!(
        StorageKeys::from_value(&json!(["a", "b"])),
        Some(StorageKeys::Many(vec!["a".to_string(), "b".to_string()]))
    );
    assert_eq!(StorageKeys::from_value(&json!([1, 2])), None);
    assert_eq!(StorageKeys::from_value(&json!(7)), None);
    assert_eq!(StorageAreaKind::parse("sync"), Some(StorageAreaKind::Sync));
    assert_eq!(StorageAreaKind::parse("managed"), None);
}
