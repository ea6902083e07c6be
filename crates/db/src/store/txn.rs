//! Transaction retry harness.
//!
//! [`run_transaction`] runs a caller-supplied body against a fresh
//! transaction attempt, retrying automatically on write-write conflicts
//! up to [`MAX_TRANSACTION_ATTEMPTS`](super::MAX_TRANSACTION_ATTEMPTS)
//! before surfacing `TransactionConflict` to the caller.

use std::future::Future;

use crate::error::StoreError;
use crate::store::{DocRef, Document, DocumentStore, StoreTransaction, MAX_TRANSACTION_ATTEMPTS};

/// One transaction attempt handed to a [`run_transaction`] body.
///
/// Bodies may read and then buffer writes; the harness commits after the
/// body hands the transaction back. Bodies run again on conflict, so
/// they must be side-effect free outside the transaction.
pub struct Transaction {
    inner: Box<dyn StoreTransaction>,
}

impl Transaction {
    pub async fn get(&mut self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        self.inner.get(doc).await
    }

    pub fn set(&mut self, doc: &DocRef, data: Document) {
        self.inner.set(doc, data);
    }

    pub fn merge(&mut self, doc: &DocRef, data: Document) {
        self.inner.merge(doc, data);
    }

    pub fn create(&mut self, doc: &DocRef, data: Document) {
        self.inner.create(doc, data);
    }

    pub fn delete(&mut self, doc: &DocRef) {
        self.inner.delete(doc);
    }

    pub fn write_count(&self) -> usize {
        self.inner.write_count()
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().await
    }
}

/// Run `body` inside an optimistic transaction with automatic conflict
/// retry.
///
/// The body takes the attempt's [`Transaction`] by value and returns it
/// together with its result, so the harness can commit what the body
/// staged. On `TransactionConflict` (from a read inside the body or
/// from commit validation) the body is run again with a fresh attempt;
/// any other error propagates immediately. After the retry budget is
/// exhausted the conflict surfaces to the caller, which for the event
/// pipeline means "redeliver".
pub async fn run_transaction<T, F, Fut>(
    store: &dyn DocumentStore,
    mut body: F,
) -> Result<T, StoreError>
where
    F: FnMut(Transaction) -> Fut,
    Fut: Future<Output = Result<(Transaction, T), StoreError>>,
{
    for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
        let tx = Transaction {
            inner: store.begin().await?,
        };
        match body(tx).await {
            Ok((tx, value)) => match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(StoreError::TransactionConflict { .. }) => {
                    tracing::warn!(attempt, "transaction conflict on commit, retrying");
                }
                Err(e) => return Err(e),
            },
            Err(StoreError::TransactionConflict { .. }) => {
                tracing::warn!(attempt, "transaction conflict in body, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::TransactionConflict {
        attempts: MAX_TRANSACTION_ATTEMPTS,
    })
}
