use cluster_txn::transaction::{TxnCtx, TxnCtxConfig};
use cluster_txn::{MemoryStore, NodeId, Store, TxnId};
use proptest::collection::{btree_map, vec as prop_vec};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Brick {
    host: String,
    path: String,
    size: u64,
    tags: Vec<String>,
    thin: bool,
}

fn brick() -> impl Strategy<Value = Brick> {
    (
        "[a-z][a-z0-9-]{0,12}",
        "/[a-z0-9/]{0,24}",
        any::<u64>(),
        prop_vec("[a-z]{1,6}", 0..4),
        any::<bool>(),
    )
        .prop_map(|(host, path, size, tags, thin)| Brick {
            host,
            path,
            size,
            tags,
            thin,
        })
}

fn ctx_pair(store: &Arc<dyn Store>) -> (TxnCtx, TxnCtx) {
    let config = TxnCtxConfig::new(TxnId::new(), "prop");
    let writer = TxnCtx::new(config.clone(), store.clone(), NodeId::new(), Duration::from_secs(2));
    let reader = TxnCtx::new(config, store.clone(), NodeId::new(), Duration::from_secs(2));
    (writer, reader)
}

// Property: set then get returns the value, on the writer and on a fresh context
proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_ctx_round_trip(entries in btree_map("[a-z][a-z0-9_.]{0,15}", brick(), 1..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let (writer, reader) = ctx_pair(&store);

            for (key, value) in &entries {
                writer.set(key, value).unwrap();
            }
            for (key, value) in &entries {
                prop_assert_eq!(&writer.get::<Brick>(key).await.unwrap(), value);
            }

            writer.commit().await.unwrap();
            let mut seen = BTreeMap::new();
            for key in entries.keys() {
                seen.insert(key.clone(), reader.get::<Brick>(key).await.unwrap());
            }
            prop_assert_eq!(seen, entries.clone());
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_node_results_are_node_scoped(
        values in prop_vec(any::<i64>(), 1..5),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let (writer, reader) = ctx_pair(&store);
            let nodes: Vec<NodeId> = values.iter().map(|_| NodeId::new()).collect();

            for (node, value) in nodes.iter().zip(&values) {
                writer.set_node_result(*node, "count", value).unwrap();
            }
            writer.commit().await.unwrap();
            reader.sync_cache().await.unwrap();

            for (node, value) in nodes.iter().zip(&values) {
                prop_assert_eq!(reader.get_node_result::<i64>(*node, "count").await.unwrap(), *value);
            }
            prop_assert!(reader.get::<i64>("count").await.is_err());
            Ok::<(), TestCaseError>(())
        })?;
    }
}
