//! Property-based tests for storage quotas.
//!
//! Runs random set/remove sequences against a small quota and checks the
//! engine against a plain map model: rejected writes change nothing, and
//! usage never exceeds the quota.

use std::collections::BTreeMap;
use std::sync::Arc;

use extension_host::database::Database;
use extension_host::services::storage_engine::{item_size, StorageEngine};
use extension_host::types::config::StorageQuotas;
use extension_host::types::errors::StorageError;
use extension_host::types::storage::{StorageAreaKind, StorageKeys};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

const QUOTA: usize = 64;

#[derive(Debug, Clone)]
enum Op {
    Set(Vec<(String, Value)>),
    Remove(Vec<String>),
}

fn arb_key() -> impl Strategy<Value = String> {
    "[a-e]{1,3}"
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z ]{0,24}".prop_map(|s| json!(s)),
        any::<bool>().prop_map(|b| json!(b)),
        proptest::collection::vec(0u8..10, 0..6).prop_map(|v| json!(v)),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => proptest::collection::vec((arb_key(), arb_value()), 1..4).prop_map(Op::Set),
        1 => proptest::collection::vec(arb_key(), 1..3).prop_map(Op::Remove),
    ]
}

fn usage(model: &BTreeMap<String, Value>) -> usize {
    model.iter().map(|(k, v)| item_size(k, v)).sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // Property: the engine agrees with the model, and usage stays within quota.
    #[test]
    fn usage_never_exceeds_quota(ops in proptest::collection::vec(arb_op(), 1..24)) {
        let quotas = StorageQuotas {
            local_bytes: QUOTA,
            sync_bytes: QUOTA,
            session_bytes: QUOTA,
        };
        let storage = StorageEngine::new(Arc::new(Database::open_in_memory().unwrap()), quotas);
        let mut model: BTreeMap<String, Value> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Set(pairs) => {
                    let mut proposed = model.clone();
                    let mut items = Map::new();
                    for (key, value) in pairs {
                        proposed.insert(key.clone(), value.clone());
                        items.insert(key, value);
                    }
                    let result = storage.set("ext", StorageAreaKind::Local, items);
                    if usage(&proposed) > QUOTA {
                        let is_quota_error = matches!(result, Err(StorageError::QuotaExceeded { .. }));
                        prop_assert!(is_quota_error, "expected quota error, got {:?}", result);
                    } else {
                        prop_assert!(result.is_ok(), "unexpected {:?}", result);
                        model = proposed;
                    }
                }
                Op::Remove(keys) => {
                    storage.remove("ext", StorageAreaKind::Local, &keys).unwrap();
                    for key in &keys {
                        model.remove(key);
                    }
                }
            }

            let stored: BTreeMap<String, Value> = storage
                .get("ext", StorageAreaKind::Local, &StorageKeys::All)
                .unwrap()
                .into_iter()
                .collect();
            prop_assert_eq!(&stored, &model);
            let in_use = storage
                .bytes_in_use("ext", StorageAreaKind::Local, &StorageKeys::All)
                .unwrap();
            prop_assert_eq!(in_use, usage(&model));
            prop_assert!(in_use <= QUOTA);
        }
    }

    // Property: quotas are per area, so filling one area never blocks another.
    #[test]
    fn areas_have_independent_quotas(value in "[a-z]{40,50}") {
        let quotas = StorageQuotas {
            local_bytes: QUOTA,
            sync_bytes: QUOTA,
            session_bytes: QUOTA,
        };
        let storage = StorageEngine::new(Arc::new(Database::open_in_memory().unwrap()), quotas);
        for area in StorageAreaKind::ALL {
            let mut items = Map::new();
            items.insert("k".to_string(), json!(value.clone()));
            prop_assert!(storage.set("ext", area, items).is_ok());
        }
    }
}
