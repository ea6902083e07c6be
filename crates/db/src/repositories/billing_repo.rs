//! Repository for the global `billing_records` collection.

use chrono::Utc;

use crate::error::StoreError;
use crate::models::billing::{counters, BillingRecord};
use crate::models::{from_document, to_document};
use crate::repositories::mutator;
use crate::store::{run_transaction, CollectionRef, SharedStore};

const COLLECTION: &str = "billing_records";

/// Append-only invocation counters per (date, function, environment).
pub struct BillingRepo {
    store: SharedStore,
}

impl BillingRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn collection(&self) -> CollectionRef {
        CollectionRef::root(COLLECTION)
    }

    /// Record one invocation (plus billable units) against the day's
    /// record, creating it on first use. Counters only ever increase.
    pub async fn record_invocation(
        &self,
        date: &str,
        function_name: &str,
        environment: &str,
        units: i64,
    ) -> Result<(), StoreError> {
        let doc_id = BillingRecord::doc_id(date, function_name, environment)?;
        let doc = self.collection().doc(doc_id);

        run_transaction(self.store.as_ref(), |mut tx| {
            let doc = doc.clone();
            async move {
                let now = Utc::now();
                match tx.get(&doc).await? {
                    None => {
                        let record = BillingRecord {
                            date: date.to_string(),
                            function_name: function_name.to_string(),
                            environment: environment.to_string(),
                            invocations: 1,
                            units,
                            created_at: now,
                            updated_at: now,
                        };
                        tx.create(&doc, to_document(&record)?);
                    }
                    Some(_) => {
                        mutator::stage_increments(
                            &mut tx,
                            &doc,
                            &[(counters::INVOCATIONS, 1), (counters::UNITS, units)],
                            now,
                        )
                        .await?;
                    }
                }
                Ok((tx, ()))
            }
        })
        .await?;

        tracing::debug!(date, function_name, environment, "recorded invocation");
        Ok(())
    }

    pub async fn get(
        &self,
        date: &str,
        function_name: &str,
        environment: &str,
    ) -> Result<Option<BillingRecord>, StoreError> {
        let doc_id = BillingRecord::doc_id(date, function_name, environment)?;
        self.store
            .get(&self.collection().doc(doc_id))
            .await?
            .map(from_document)
            .transpose()
    }
}
