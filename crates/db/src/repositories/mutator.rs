//! Aggregate mutator: transactional numeric increments and set mutation.
//!
//! Counters and set-valued fields are never blindly overwritten. Every
//! mutation reads the current value inside a transaction, computes the
//! new value, and writes it back; the transaction's read-set validation
//! serializes concurrent writers, and [`run_transaction`] retries on
//! conflict. `stage_*` primitives operate on a caller-owned transaction
//! so domain writes can be bundled with the idempotency mark.

use annotator_core::types::Timestamp;
use chrono::Utc;
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{run_transaction, DocRef, Document, DocumentStore, Transaction};

/// Stage increments for several fields of one document.
///
/// A missing field counts as 0; a result below zero fails with
/// `InvalidDecrement` and nothing is staged. All fields change in the
/// same transaction attempt, so partial increments never become visible.
/// Returns the document as it will read after commit, letting the caller
/// evaluate guard conditions against the post-increment state.
pub async fn stage_increments(
    tx: &mut Transaction,
    doc: &DocRef,
    deltas: &[(&str, i64)],
    now: Timestamp,
) -> Result<Document, StoreError> {
    let mut data = tx.get(doc).await?.ok_or_else(|| StoreError::NotFound {
        path: doc.path(),
    })?;

    let mut update = Document::new();
    for (field, delta) in deltas {
        let current = match data.get(*field) {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                StoreError::Internal(format!(
                    "field {field:?} of {} is not an integer",
                    doc.path()
                ))
            })?,
        };
        let next = current + delta;
        if next < 0 {
            return Err(StoreError::InvalidDecrement {
                field: (*field).to_string(),
                current,
                delta: *delta,
            });
        }
        update.insert((*field).to_string(), Value::from(next));
        data.insert((*field).to_string(), Value::from(next));
    }

    let stamp = serde_json::to_value(now)?;
    update.insert("updated_at".to_string(), stamp.clone());
    data.insert("updated_at".to_string(), stamp);

    tx.merge(doc, update);
    Ok(data)
}

/// Stage a set mutation on an array field.
///
/// The array is treated as a mathematical set: additions are skipped for
/// elements already present, and removals are applied after additions,
/// so an element in both `add` and `remove` ends up absent (remove
/// wins). Returns the post-mutation document.
pub async fn stage_set_mutation(
    tx: &mut Transaction,
    doc: &DocRef,
    field: &str,
    add: &[String],
    remove: &[String],
    now: Timestamp,
) -> Result<Document, StoreError> {
    let mut data = tx.get(doc).await?.ok_or_else(|| StoreError::NotFound {
        path: doc.path(),
    })?;

    let mut set: Vec<String> = match data.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    StoreError::Internal(format!(
                        "field {field:?} of {} holds a non-string element",
                        doc.path()
                    ))
                })
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(StoreError::Internal(format!(
                "field {field:?} of {} is not an array",
                doc.path()
            )))
        }
    };

    for value in add {
        if !set.contains(value) {
            set.push(value.clone());
        }
    }
    set.retain(|value| !remove.contains(value));

    let mut update = Document::new();
    update.insert(field.to_string(), Value::from(set.clone()));
    data.insert(field.to_string(), Value::from(set));

    let stamp = serde_json::to_value(now)?;
    update.insert("updated_at".to_string(), stamp.clone());
    data.insert("updated_at".to_string(), stamp);

    tx.merge(doc, update);
    Ok(data)
}

/// Increment fields of one document in its own retrying transaction.
pub async fn increment_fields(
    store: &dyn DocumentStore,
    doc: &DocRef,
    deltas: &[(&str, i64)],
) -> Result<(), StoreError> {
    run_transaction(store, |mut tx| async move {
        stage_increments(&mut tx, doc, deltas, Utc::now()).await?;
        Ok((tx, ()))
    })
    .await
}

/// Mutate a set field of one document in its own retrying transaction.
pub async fn mutate_set(
    store: &dyn DocumentStore,
    doc: &DocRef,
    field: &str,
    add: &[String],
    remove: &[String],
) -> Result<(), StoreError> {
    run_transaction(store, |mut tx| async move {
        stage_set_mutation(&mut tx, doc, field, add, remove, Utc::now()).await?;
        Ok((tx, ()))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CollectionRef, MemoryStore};
    use assert_matches::assert_matches;

    fn store_and_doc() -> (MemoryStore, DocRef) {
        (
            MemoryStore::new(),
            CollectionRef::root("widgets").doc("w-1"),
        )
    }

    fn seed(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn increments_missing_field_from_zero() {
        let (store, doc) = store_and_doc();
        store
            .set(&doc, seed(serde_json::json!({"name": "w"})))
            .await
            .unwrap();

        increment_fields(&store, &doc, &[("count", 2)]).await.unwrap();
        increment_fields(&store, &doc, &[("count", 3)]).await.unwrap();

        let data = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(data["count"], 5);
        assert!(data.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn decrement_below_zero_is_rejected() {
        let (store, doc) = store_and_doc();
        store
            .set(&doc, seed(serde_json::json!({"count": 1})))
            .await
            .unwrap();

        let err = increment_fields(&store, &doc, &[("count", -2)])
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidDecrement { current: 1, delta: -2, .. });

        // Nothing was applied.
        let data = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(data["count"], 1);
    }

    #[tokio::test]
    async fn multi_field_increment_is_all_or_nothing() {
        let (store, doc) = store_and_doc();
        store
            .set(&doc, seed(serde_json::json!({"a": 1, "b": 0})))
            .await
            .unwrap();

        let err = increment_fields(&store, &doc, &[("a", 1), ("b", -1)])
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidDecrement { .. });

        let data = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(data["a"], 1);
        assert_eq!(data["b"], 0);
    }

    #[tokio::test]
    async fn set_mutation_deduplicates_and_remove_wins() {
        let (store, doc) = store_and_doc();
        store
            .set(&doc, seed(serde_json::json!({"tags": ["x"]})))
            .await
            .unwrap();

        mutate_set(&store, &doc, "tags", &["x".into(), "y".into()], &[])
            .await
            .unwrap();
        let data = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(data["tags"], serde_json::json!(["x", "y"]));

        // Overlapping add/remove: the element ends up absent.
        mutate_set(&store, &doc, "tags", &["z".into()], &["z".into(), "x".into()])
            .await
            .unwrap();
        let data = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(data["tags"], serde_json::json!(["y"]));
    }

    #[tokio::test]
    async fn mutating_an_absent_document_is_not_found() {
        let (store, doc) = store_and_doc();
        let err = increment_fields(&store, &doc, &[("count", 1)])
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::NotFound { .. });
    }
}
