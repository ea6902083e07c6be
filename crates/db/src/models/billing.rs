//! Global billing record with append-only counters.

use annotator_core::identity;
use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Counter field names on a billing record.
pub mod counters {
    pub const INVOCATIONS: &str = "invocations";
    pub const UNITS: &str = "units";
}

/// The `billing_records/{isoDate}__{functionName}__{environment}`
/// document. Counters only ever increase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    /// ISO calendar date, e.g. `2026-08-05`.
    pub date: String,
    pub function_name: String,
    pub environment: String,
    #[serde(default)]
    pub invocations: i64,
    #[serde(default)]
    pub units: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl BillingRecord {
    /// Derived document identifier for a (date, function, environment)
    /// triple.
    pub fn doc_id(date: &str, function_name: &str, environment: &str) -> Result<String, StoreError> {
        Ok(identity::derive(&[date, function_name, environment])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_layout() {
        assert_eq!(
            BillingRecord::doc_id("2026-08-05", "annotate", "dev").unwrap(),
            "2026-08-05__annotate__dev"
        );
    }
}
