//! Repository for the global `usage_cache` collection.

use chrono::Utc;

use crate::error::StoreError;
use crate::models::usage_cache::UsageCacheEntry;
use crate::models::{from_document, to_document};
use crate::store::{CollectionRef, SharedStore};

const COLLECTION: &str = "usage_cache";

/// Write-once cache entries keyed by caller-derived cache keys.
pub struct UsageCacheRepo {
    store: SharedStore,
}

impl UsageCacheRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn collection(&self) -> CollectionRef {
        CollectionRef::root(COLLECTION)
    }

    /// Store an entry if the key is unused. Returns `false` when the key
    /// already holds an entry, which is a benign outcome for a
    /// recomputed cache value, never an error.
    pub async fn put(
        &self,
        cache_key: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let entry = UsageCacheEntry {
            cache_key: cache_key.to_string(),
            payload,
            created_at: Utc::now(),
        };
        match self
            .store
            .create(&self.collection().doc(cache_key), to_document(&entry)?)
            .await
        {
            Ok(()) => {
                tracing::debug!(cache_key, "cached usage entry");
                Ok(true)
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, cache_key: &str) -> Result<Option<UsageCacheEntry>, StoreError> {
        self.store
            .get(&self.collection().doc(cache_key))
            .await?
            .map(from_document)
            .transpose()
    }
}
