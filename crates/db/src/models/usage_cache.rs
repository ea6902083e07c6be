//! Global write-once usage cache entries.

use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// The `usage_cache/{cacheKey}` document. Written once; a second put of
/// the same key is a benign no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCacheEntry {
    pub cache_key: String,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

/// Cache key for a usage dashboard over a date range.
pub fn usage_dashboard_key(start_date: &str, end_date: &str) -> String {
    format!("usage_dashboard_{start_date}_{end_date}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_key_layout() {
        assert_eq!(
            usage_dashboard_key("2026-01-01", "2026-01-31"),
            "usage_dashboard_2026-01-01_2026-01-31"
        );
    }
}
