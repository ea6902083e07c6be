//! Integration tests for the document store adapter contract:
//! point operations, scoped queries, optimistic transactions with
//! conflict retry, and partial-failure batch writes.

use assert_matches::assert_matches;
use std::sync::Arc;

use annotator_db::store::{
    run_transaction, BatchWrite, CollectionRef, DocRef, Document, DocumentStore, MemoryStore,
    MAX_TRANSACTION_WRITES,
};
use annotator_db::StoreError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("expected a JSON object"),
    }
}

fn widget(id: &str) -> DocRef {
    CollectionRef::root("widgets").doc(id)
}

// ---------------------------------------------------------------------------
// Point operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn point_read_returns_full_document_or_none() {
    let store = MemoryStore::new();
    assert!(store.get(&widget("w-1")).await.unwrap().is_none());

    store
        .set(&widget("w-1"), doc(serde_json::json!({"a": 1, "b": "x"})))
        .await
        .unwrap();

    let read = store.get(&widget("w-1")).await.unwrap().unwrap();
    assert_eq!(read["a"], 1);
    assert_eq!(read["b"], "x");
}

#[tokio::test]
async fn create_is_create_if_absent() {
    let store = MemoryStore::new();
    store
        .create(&widget("w-1"), doc(serde_json::json!({"a": 1})))
        .await
        .unwrap();

    let err = store
        .create(&widget("w-1"), doc(serde_json::json!({"a": 2})))
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::AlreadyExists { .. });

    // The original document is untouched.
    let read = store.get(&widget("w-1")).await.unwrap().unwrap();
    assert_eq!(read["a"], 1);
}

#[tokio::test]
async fn set_merge_keeps_untouched_fields() {
    let store = MemoryStore::new();
    store
        .set(&widget("w-1"), doc(serde_json::json!({"a": 1, "b": 2})))
        .await
        .unwrap();
    store
        .set_merge(&widget("w-1"), doc(serde_json::json!({"b": 3})))
        .await
        .unwrap();

    let read = store.get(&widget("w-1")).await.unwrap().unwrap();
    assert_eq!(read["a"], 1);
    assert_eq!(read["b"], 3);
}

#[tokio::test]
async fn delete_reports_whether_a_document_was_removed() {
    let store = MemoryStore::new();
    store
        .set(&widget("w-1"), doc(serde_json::json!({})))
        .await
        .unwrap();
    assert!(store.delete(&widget("w-1")).await.unwrap());
    assert!(!store.delete(&widget("w-1")).await.unwrap());
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_is_scoped_to_one_subtree() {
    let store = MemoryStore::new();
    let it_a = CollectionRef::root("project_iterations")
        .doc("it-a")
        .collection("cutouts");
    let it_b = CollectionRef::root("project_iterations")
        .doc("it-b")
        .collection("cutouts");

    store
        .set(&it_a.doc("c-1"), doc(serde_json::json!({"dataset_image_id": "ds-1"})))
        .await
        .unwrap();
    store
        .set(&it_a.doc("c-2"), doc(serde_json::json!({"dataset_image_id": "ds-2"})))
        .await
        .unwrap();
    store
        .set(&it_b.doc("c-3"), doc(serde_json::json!({"dataset_image_id": "ds-1"})))
        .await
        .unwrap();

    let all_a = store.query(&it_a, &[]).await.unwrap();
    assert_eq!(all_a.len(), 2);

    let filtered = store
        .query(
            &it_a,
            &[annotator_db::store::FieldFilter::eq("dataset_image_id", "ds-1")],
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].0, "c-1");
}

#[tokio::test]
async fn query_excludes_nested_subcollections() {
    let store = MemoryStore::new();
    let summaries = CollectionRef::root("project_iterations")
        .doc("it-1")
        .collection("annotated_images");

    store
        .set(&summaries.doc("ds-1"), doc(serde_json::json!({"annotations_count": 0})))
        .await
        .unwrap();
    let nested = summaries.doc("ds-1").collection("cutouts");
    store
        .set(&nested.doc("c-1"), doc(serde_json::json!({"label": "x"})))
        .await
        .unwrap();

    let rows = store.query(&summaries, &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "ds-1");

    let children = store.query(&nested, &[]).await.unwrap();
    assert_eq!(children.len(), 1);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transaction_applies_all_writes_atomically() {
    let store = MemoryStore::new();
    store
        .set(&widget("w-1"), doc(serde_json::json!({"count": 0})))
        .await
        .unwrap();

    let mut tx = store.begin().await.unwrap();
    let read = tx.get(&widget("w-1")).await.unwrap().unwrap();
    assert_eq!(read["count"], 0);
    tx.set(&widget("w-1"), doc(serde_json::json!({"count": 1})));
    tx.create(&widget("w-2"), doc(serde_json::json!({"count": 9})));
    tx.commit().await.unwrap();

    assert_eq!(store.get(&widget("w-1")).await.unwrap().unwrap()["count"], 1);
    assert_eq!(store.get(&widget("w-2")).await.unwrap().unwrap()["count"], 9);
}

#[tokio::test]
async fn concurrent_write_invalidates_the_read_set() {
    let store = MemoryStore::new();
    store
        .set(&widget("w-1"), doc(serde_json::json!({"count": 0})))
        .await
        .unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.get(&widget("w-1")).await.unwrap();

    // Another writer commits between the read and the commit.
    store
        .set(&widget("w-1"), doc(serde_json::json!({"count": 7})))
        .await
        .unwrap();

    tx.set(&widget("w-1"), doc(serde_json::json!({"count": 1})));
    let err = tx.commit().await.unwrap_err();
    assert_matches!(err, StoreError::TransactionConflict { .. });

    // The losing write never landed.
    assert_eq!(store.get(&widget("w-1")).await.unwrap().unwrap()["count"], 7);
}

#[tokio::test]
async fn transaction_create_fails_commit_when_document_appeared() {
    let store = MemoryStore::new();

    let mut tx = store.begin().await.unwrap();
    tx.create(&widget("w-1"), doc(serde_json::json!({"a": 1})));

    store
        .set(&widget("w-1"), doc(serde_json::json!({"a": 2})))
        .await
        .unwrap();

    let err = tx.commit().await.unwrap_err();
    assert_matches!(err, StoreError::AlreadyExists { .. });
}

#[tokio::test]
async fn transaction_rejects_oversized_write_sets() {
    let store = MemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    for i in 0..=MAX_TRANSACTION_WRITES {
        tx.set(&widget(&format!("w-{i}")), doc(serde_json::json!({})));
    }
    let err = tx.commit().await.unwrap_err();
    assert_matches!(err, StoreError::TransactionTooLarge { .. });
}

#[tokio::test]
async fn reads_observe_buffered_writes() {
    let store = MemoryStore::new();
    store
        .set(&widget("w-1"), doc(serde_json::json!({"count": 1})))
        .await
        .unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.merge(&widget("w-1"), doc(serde_json::json!({"count": 5})));
    let read = tx.get(&widget("w-1")).await.unwrap().unwrap();
    assert_eq!(read["count"], 5);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn concurrent_increments_are_not_lost() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    store
        .set(&widget("w-1"), doc(serde_json::json!({"count": 0})))
        .await
        .unwrap();

    let increment = |store: Arc<MemoryStore>| async move {
        run_transaction(store.as_ref(), |mut tx| async move {
            let target = widget("w-1");
            let data = tx.get(&target).await?.unwrap_or_default();
            let count = data.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
            tx.merge(&target, doc(serde_json::json!({"count": count + 1})));
            Ok((tx, ()))
        })
        .await
    };

    let (a, b) = tokio::join!(increment(Arc::clone(&store)), increment(Arc::clone(&store)));
    a.unwrap();
    b.unwrap();

    assert_eq!(store.get(&widget("w-1")).await.unwrap().unwrap()["count"], 2);
}

// ---------------------------------------------------------------------------
// Batch writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_write_reports_per_item_failures() {
    let store = MemoryStore::new();
    store
        .set(&widget("w-1"), doc(serde_json::json!({"a": 1})))
        .await
        .unwrap();

    let results = store
        .batch_write(vec![
            BatchWrite::Create {
                doc: widget("w-1"),
                data: doc(serde_json::json!({"a": 2})),
            },
            BatchWrite::Create {
                doc: widget("w-2"),
                data: doc(serde_json::json!({"a": 3})),
            },
            BatchWrite::Merge {
                doc: widget("w-3"),
                data: doc(serde_json::json!({"a": 4})),
            },
        ])
        .await
        .unwrap();

    assert_matches!(&results[0].result, Err(StoreError::AlreadyExists { .. }));
    assert_matches!(&results[1].result, Ok(()));
    assert_matches!(&results[2].result, Ok(()));

    // Independent items: the failure did not block the others.
    assert_eq!(store.get(&widget("w-2")).await.unwrap().unwrap()["a"], 3);
    assert_eq!(store.get(&widget("w-3")).await.unwrap().unwrap()["a"], 4);
}
