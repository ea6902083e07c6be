//! In-memory document store.
//!
//! Documents live in an ordered map keyed by canonical path, each stamped
//! with the version of the commit that last wrote it. Transactions record
//! the version of every document they read and validate the read set at
//! commit time under the write lock, so concurrent writers serialize
//! through optimistic retry rather than external locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{
    BatchItemResult, BatchWrite, CollectionRef, DocRef, DocumentStore, Document, FieldFilter,
    StoreTransaction, MAX_TRANSACTION_WRITES,
};

#[derive(Debug, Clone)]
struct VersionedDoc {
    version: u64,
    data: Document,
}

#[derive(Default)]
struct MemoryInner {
    docs: BTreeMap<String, VersionedDoc>,
    next_version: u64,
}

impl MemoryInner {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn apply_merge(&mut self, path: &str, data: Document, version: u64) {
        match self.docs.get_mut(path) {
            Some(existing) => {
                for (key, value) in data {
                    existing.data.insert(key, value);
                }
                existing.version = version;
            }
            None => {
                self.docs.insert(path.to_string(), VersionedDoc { version, data });
            }
        }
    }
}

/// Shared in-memory store. Cheap to clone; all clones observe the same
/// documents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents, across all collections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn validate_ref(doc: &DocRef) -> Result<(), StoreError> {
    if doc.id().is_empty() || doc.id().contains('/') {
        return Err(StoreError::Internal(format!(
            "malformed document id {:?}",
            doc.id()
        )));
    }
    Ok(())
}

fn matches_filters(data: &Document, filters: &[FieldFilter]) -> bool {
    filters
        .iter()
        .all(|f| data.get(&f.field) == Some(&f.value))
}

/// Direct children of `scope`: keys under its prefix whose remainder has
/// no further path separator.
fn child_range<'a>(
    docs: &'a BTreeMap<String, VersionedDoc>,
    scope: &CollectionRef,
) -> impl Iterator<Item = (&'a String, &'a VersionedDoc)> {
    let prefix = format!("{}/", scope.path());
    let prefix_len = prefix.len();
    docs.range(prefix.clone()..)
        .take_while(move |(key, _)| key.starts_with(&prefix))
        .filter(move |(key, _)| !key[prefix_len..].contains('/'))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        validate_ref(doc)?;
        let inner = self.inner.read().await;
        Ok(inner.docs.get(&doc.path()).map(|v| v.data.clone()))
    }

    async fn create(&self, doc: &DocRef, data: Document) -> Result<(), StoreError> {
        validate_ref(doc)?;
        let mut inner = self.inner.write().await;
        let path = doc.path();
        if inner.docs.contains_key(&path) {
            return Err(StoreError::AlreadyExists { path });
        }
        let version = inner.bump_version();
        inner.docs.insert(path, VersionedDoc { version, data });
        Ok(())
    }

    async fn set(&self, doc: &DocRef, data: Document) -> Result<(), StoreError> {
        validate_ref(doc)?;
        let mut inner = self.inner.write().await;
        let version = inner.bump_version();
        inner.docs.insert(doc.path(), VersionedDoc { version, data });
        Ok(())
    }

    async fn set_merge(&self, doc: &DocRef, data: Document) -> Result<(), StoreError> {
        validate_ref(doc)?;
        let mut inner = self.inner.write().await;
        let version = inner.bump_version();
        inner.apply_merge(&doc.path(), data, version);
        Ok(())
    }

    async fn delete(&self, doc: &DocRef) -> Result<bool, StoreError> {
        validate_ref(doc)?;
        let mut inner = self.inner.write().await;
        Ok(inner.docs.remove(&doc.path()).is_some())
    }

    async fn query(
        &self,
        scope: &CollectionRef,
        filters: &[FieldFilter],
    ) -> Result<Vec<(String, Document)>, StoreError> {
        let prefix_len = scope.path().len() + 1;
        let inner = self.inner.read().await;
        Ok(child_range(&inner.docs, scope)
            .filter(|(_, v)| matches_filters(&v.data, filters))
            .map(|(key, v)| (key[prefix_len..].to_string(), v.data.clone()))
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            reads: HashMap::new(),
            writes: Vec::new(),
        }))
    }

    async fn batch_write(
        &self,
        writes: Vec<BatchWrite>,
    ) -> Result<Vec<BatchItemResult>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let doc = write.doc().clone();
            let result = match validate_ref(&doc) {
                Err(e) => Err(e),
                Ok(()) => {
                    let path = doc.path();
                    match write {
                        BatchWrite::Set { data, .. } => {
                            let version = inner.bump_version();
                            inner.docs.insert(path, VersionedDoc { version, data });
                            Ok(())
                        }
                        BatchWrite::Merge { data, .. } => {
                            let version = inner.bump_version();
                            inner.apply_merge(&path, data, version);
                            Ok(())
                        }
                        BatchWrite::Create { data, .. } => {
                            if inner.docs.contains_key(&path) {
                                Err(StoreError::AlreadyExists { path })
                            } else {
                                let version = inner.bump_version();
                                inner.docs.insert(path, VersionedDoc { version, data });
                                Ok(())
                            }
                        }
                    }
                }
            };
            results.push(BatchItemResult { doc, result });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

enum TxWrite {
    Set(Document),
    Merge(Document),
    Create(Document),
    Delete,
}

struct MemoryTransaction {
    inner: Arc<RwLock<MemoryInner>>,
    /// Path -> document version observed on first read (`None` = absent).
    reads: HashMap<String, Option<u64>>,
    /// Buffered writes, applied in order at commit.
    writes: Vec<(String, TxWrite)>,
}

impl MemoryTransaction {
    /// Project the buffered writes for `path` onto a base document, so
    /// reads within the transaction observe earlier staged writes.
    fn overlay(&self, path: &str, base: Option<Document>) -> Option<Document> {
        let mut view = base;
        for (write_path, write) in &self.writes {
            if write_path != path {
                continue;
            }
            view = match write {
                TxWrite::Set(data) | TxWrite::Create(data) => Some(data.clone()),
                TxWrite::Delete => None,
                TxWrite::Merge(data) => {
                    let mut merged = view.unwrap_or_default();
                    for (key, value) in data {
                        merged.insert(key.clone(), value.clone());
                    }
                    Some(merged)
                }
            };
        }
        view
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get(&mut self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        validate_ref(doc)?;
        let path = doc.path();
        let base = {
            let inner = self.inner.read().await;
            let versioned = inner.docs.get(&path);
            // Record the version observed by the first read only; later
            // reads may see staged writes and must not weaken validation.
            self.reads
                .entry(path.clone())
                .or_insert_with(|| versioned.map(|v| v.version));
            versioned.map(|v| v.data.clone())
        };
        Ok(self.overlay(&path, base))
    }

    fn set(&mut self, doc: &DocRef, data: Document) {
        self.writes.push((doc.path(), TxWrite::Set(data)));
    }

    fn merge(&mut self, doc: &DocRef, data: Document) {
        self.writes.push((doc.path(), TxWrite::Merge(data)));
    }

    fn create(&mut self, doc: &DocRef, data: Document) {
        self.writes.push((doc.path(), TxWrite::Create(data)));
    }

    fn delete(&mut self, doc: &DocRef) {
        self.writes.push((doc.path(), TxWrite::Delete));
    }

    fn write_count(&self) -> usize {
        self.writes.len()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            inner,
            reads,
            writes,
        } = *self;

        if writes.len() > MAX_TRANSACTION_WRITES {
            return Err(StoreError::TransactionTooLarge {
                writes: writes.len(),
                cap: MAX_TRANSACTION_WRITES,
            });
        }

        let mut guard = inner.write().await;

        // Validate the read set: every document read must still be at the
        // version observed, else a concurrent commit won the race.
        for (path, observed) in &reads {
            let current = guard.docs.get(path).map(|v| v.version);
            if current != *observed {
                return Err(StoreError::TransactionConflict { attempts: 1 });
            }
        }

        // Creates target documents that must not exist at commit time.
        for (path, write) in &writes {
            if matches!(write, TxWrite::Create(_)) && guard.docs.contains_key(path) {
                return Err(StoreError::AlreadyExists { path: path.clone() });
            }
        }

        let version = guard.bump_version();
        for (path, write) in writes {
            match write {
                TxWrite::Set(data) | TxWrite::Create(data) => {
                    guard.docs.insert(path, VersionedDoc { version, data });
                }
                TxWrite::Merge(data) => guard.apply_merge(&path, data, version),
                TxWrite::Delete => {
                    guard.docs.remove(&path);
                }
            }
        }
        Ok(())
    }
}
