//! Document store adapter.
//!
//! A thin capability interface over the underlying hierarchical store:
//! point reads and writes, equality queries scoped to one collection,
//! bounded optimistic transactions, and independent batch writes.
//!
//! The store client is constructed once at startup and injected into
//! repositories as a [`SharedStore`]; it is safe for concurrent use.

pub mod memory;
mod txn;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use txn::{run_transaction, Transaction};

/// Automatic retry budget for optimistic transactions.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Maximum number of writes a single transaction may buffer.
pub const MAX_TRANSACTION_WRITES: usize = 300;

/// A stored document: a flat JSON object.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Shared handle to the process-wide store client.
pub type SharedStore = Arc<dyn DocumentStore>;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Reference to a collection: alternating collection/document segments
/// ending in a collection name.
///
/// ```
/// use annotator_db::store::CollectionRef;
///
/// let cutouts = CollectionRef::root("project_iterations")
///     .doc("it-1")
///     .collection("cutouts");
/// assert_eq!(cutouts.path(), "project_iterations/it-1/cutouts");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    segments: Vec<String>,
}

impl CollectionRef {
    /// A top-level collection.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    /// A document within this collection.
    pub fn doc(&self, id: impl Into<String>) -> DocRef {
        DocRef {
            collection: self.clone(),
            id: id.into(),
        }
    }

    /// Canonical slash-separated path.
    pub fn path(&self) -> String {
        self.segments.join("/")
    }
}

/// Reference to a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocRef {
    collection: CollectionRef,
    id: String,
}

impl DocRef {
    /// A subcollection beneath this document.
    pub fn collection(&self, name: impl Into<String>) -> CollectionRef {
        let mut segments = self.collection.segments.clone();
        segments.push(self.id.clone());
        segments.push(name.into());
        CollectionRef { segments }
    }

    /// The document identifier (last path segment).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The collection this document belongs to.
    pub fn parent(&self) -> &CollectionRef {
        &self.collection
    }

    /// Canonical slash-separated path.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection.path(), self.id)
    }
}

// ---------------------------------------------------------------------------
// Queries and batches
// ---------------------------------------------------------------------------

/// Equality predicate on a document field.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    pub field: String,
    pub value: serde_json::Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// A single write in a batch. Items are independent: there is no
/// cross-item atomicity, so batches are only suitable for bulk creation
/// with deterministic identifiers.
#[derive(Debug, Clone)]
pub enum BatchWrite {
    /// Overwrite the document.
    Set { doc: DocRef, data: Document },
    /// Merge fields into the document, creating it if absent.
    Merge { doc: DocRef, data: Document },
    /// Create the document; fails with `AlreadyExists` if present.
    Create { doc: DocRef, data: Document },
}

impl BatchWrite {
    pub fn doc(&self) -> &DocRef {
        match self {
            BatchWrite::Set { doc, .. }
            | BatchWrite::Merge { doc, .. }
            | BatchWrite::Create { doc, .. } => doc,
        }
    }
}

/// Per-item outcome of a batch write.
#[derive(Debug)]
pub struct BatchItemResult {
    pub doc: DocRef,
    pub result: Result<(), StoreError>,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Capability interface over the hierarchical document store.
///
/// Queries are scoped to exactly one collection (the direct children of a
/// subtree node); queries spanning iterations are not expressible and
/// must not be attempted by callers.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point-read. Returns the full document or `None`; never a partial
    /// document.
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, StoreError>;

    /// Create-if-absent point write. Fails with `AlreadyExists` if a
    /// document is already stored at `doc`.
    async fn create(&self, doc: &DocRef, data: Document) -> Result<(), StoreError>;

    /// Overwriting point write (upsert).
    async fn set(&self, doc: &DocRef, data: Document) -> Result<(), StoreError>;

    /// Merge fields into the document, creating it if absent. Fields not
    /// present in `data` are left untouched.
    async fn set_merge(&self, doc: &DocRef, data: Document) -> Result<(), StoreError>;

    /// Point-delete. Returns `true` if a document was removed.
    async fn delete(&self, doc: &DocRef) -> Result<bool, StoreError>;

    /// All direct children of `scope` matching every supplied equality
    /// filter, as `(document id, document)` pairs. The result is
    /// materialized and finite; cost is O(documents in the collection).
    async fn query(
        &self,
        scope: &CollectionRef,
        filters: &[FieldFilter],
    ) -> Result<Vec<(String, Document)>, StoreError>;

    /// Begin an optimistic transaction. Reads record document versions;
    /// commit validates the read set and applies all buffered writes
    /// atomically, or none.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Apply an unordered set of independent point-writes, reporting
    /// success or failure per item.
    async fn batch_write(&self, writes: Vec<BatchWrite>) -> Result<Vec<BatchItemResult>, StoreError>;
}

/// A single optimistic transaction attempt.
///
/// Writes are buffered until [`commit`](StoreTransaction::commit); reads
/// observe buffered writes (read-your-writes) and record the underlying
/// document version for commit-time validation.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn get(&mut self, doc: &DocRef) -> Result<Option<Document>, StoreError>;

    /// Buffer an overwriting write.
    fn set(&mut self, doc: &DocRef, data: Document);

    /// Buffer a field merge.
    fn merge(&mut self, doc: &DocRef, data: Document);

    /// Buffer a create; commit fails with `AlreadyExists` if the document
    /// exists by then.
    fn create(&mut self, doc: &DocRef, data: Document);

    /// Buffer a delete.
    fn delete(&mut self, doc: &DocRef);

    /// Number of buffered writes.
    fn write_count(&self) -> usize;

    /// Validate the read set and apply all buffered writes atomically.
    ///
    /// Fails with `TransactionConflict` if any document read during the
    /// transaction changed since, and with `TransactionTooLarge` if the
    /// write buffer exceeds [`MAX_TRANSACTION_WRITES`].
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_paths_compose() {
        let iteration = CollectionRef::root("project_iterations").doc("it-1");
        assert_eq!(iteration.path(), "project_iterations/it-1");

        let annotation = iteration
            .collection("annotated_images")
            .doc("ds-1")
            .collection("cutouts")
            .doc("c-1");
        assert_eq!(
            annotation.path(),
            "project_iterations/it-1/annotated_images/ds-1/cutouts/c-1"
        );
        assert_eq!(annotation.id(), "c-1");
    }

    #[test]
    fn doc_parent_is_its_collection() {
        let scope = CollectionRef::root("billing_records");
        let doc = scope.doc("2026-01-01__annotate__dev");
        assert_eq!(doc.parent(), &scope);
    }
}
