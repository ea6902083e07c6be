//! Idempotency guard over the `processed_events` subcollection.
//!
//! Every domain event derives a deterministic ledger identifier from its
//! natural key parts; existence of the ledger document means the event's
//! side effects were durably applied. The mark is normally staged as the
//! last write of the transaction that applies those effects
//! ([`stage_mark`](ProcessedEventRepo::stage_mark)). The standalone
//! [`mark_processed`](ProcessedEventRepo::mark_processed) exists for
//! callers whose guarded writes cannot fit the transaction cap; a crash
//! between that mark and the domain writes needs manual recovery, which
//! is why it logs a warning.

use annotator_core::identity;

use crate::error::StoreError;
use crate::models::processed_event::ProcessedEvent;
use crate::models::to_document;
use crate::repositories::iteration_collection;
use crate::store::{DocRef, SharedStore, Transaction};

const COLLECTION: &str = "processed_events";

/// Records and answers "was this event already applied".
pub struct ProcessedEventRepo {
    store: SharedStore,
}

impl ProcessedEventRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Ledger document for an event, derived from its key parts.
    pub fn ledger_doc(
        &self,
        project_iteration_id: &str,
        key_parts: &[&str],
    ) -> Result<DocRef, StoreError> {
        let id = identity::derive(key_parts)?;
        Ok(iteration_collection(project_iteration_id, COLLECTION).doc(id))
    }

    /// Point-read check: existence means processed.
    pub async fn is_processed(
        &self,
        project_iteration_id: &str,
        key_parts: &[&str],
    ) -> Result<bool, StoreError> {
        let doc = self.ledger_doc(project_iteration_id, key_parts)?;
        Ok(self.store.get(&doc).await?.is_some())
    }

    /// Read the ledger entry inside a caller-owned transaction, adding it
    /// to the read set so a concurrent mark forces a retry.
    pub async fn check_in_tx(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        key_parts: &[&str],
    ) -> Result<bool, StoreError> {
        let doc = self.ledger_doc(project_iteration_id, key_parts)?;
        Ok(tx.get(&doc).await?.is_some())
    }

    /// Stage the ledger mark as part of a caller-owned transaction. The
    /// create fails the commit with `AlreadyExists` if another worker
    /// marked the event first.
    pub fn stage_mark(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        key_parts: &[&str],
        record: &ProcessedEvent,
    ) -> Result<(), StoreError> {
        let doc = self.ledger_doc(project_iteration_id, key_parts)?;
        tx.create(&doc, to_document(record)?);
        Ok(())
    }

    /// Mark an event processed in its own minimal write, outside any
    /// domain transaction. Returns `true` if the mark was newly written,
    /// `false` if the event was already marked.
    pub async fn mark_processed(
        &self,
        project_iteration_id: &str,
        key_parts: &[&str],
        record: &ProcessedEvent,
    ) -> Result<bool, StoreError> {
        let doc = self.ledger_doc(project_iteration_id, key_parts)?;
        tracing::warn!(
            project_iteration_id,
            event_type = %record.event_type,
            "marking event processed ahead of its domain writes; a crash before they land needs manual recovery"
        );
        match self.store.create(&doc, to_document(record)?).await {
            Ok(()) => Ok(true),
            Err(StoreError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Administrative deletion of the ledger for an iteration. Returns
    /// the number of entries removed.
    pub async fn purge(&self, project_iteration_id: &str) -> Result<usize, StoreError> {
        let scope = iteration_collection(project_iteration_id, COLLECTION);
        let mut deleted = 0;
        for (id, _) in self.store.query(&scope, &[]).await? {
            if self.store.delete(&scope.doc(id)).await? {
                deleted += 1;
            }
        }
        tracing::debug!(project_iteration_id, deleted, "purged processed events");
        Ok(deleted)
    }
}
