//! Full-replace reconciliation.
//!
//! After a complete listing has been processed, every synchronization record
//! of the partition whose external id was not seen is deleted together with
//! its object. Running the sweep after a partial listing would delete live
//! objects, so the orchestrator only calls it after a successful fetch.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::contract::ObjectStore;
use crate::error::SyncError;
use crate::models::Partition;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Number of records inspected.
    pub inspected: usize,
    pub deleted: usize,
    pub failed: usize,
    /// External ids whose objects were removed.
    pub deleted_ids: Vec<String>,
}

#[derive(Clone)]
pub struct ReconciliationSweeper {
    store: Arc<dyn ObjectStore>,
}

impl ReconciliationSweeper {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Deletes every object of `partition` whose external id is not in `seen`.
    ///
    /// A failed deletion is logged and counted and the sweep moves on.
    ///
    /// # Errors
    ///
    /// Returns an error only when the partition cannot be enumerated, in which
    /// case nothing was deleted.
    pub async fn sweep(
        &self,
        partition: &Partition,
        seen: &HashSet<String>,
    ) -> Result<SweepReport, SyncError> {
        let records = self.store.list_partition(partition).await?;
        let mut report = SweepReport {
            inspected: records.len(),
            ..Default::default()
        };

        for record in records.iter().filter(|r| !seen.contains(&r.external_id)) {
            match self.store.delete_object(record.object_id).await {
                Ok(existed) => {
                    debug!(
                        partition = %partition,
                        external_id = %record.external_id,
                        object_id = %record.object_id,
                        existed,
                        "Deleted object no longer present in source"
                    );
                    report.deleted += 1;
                    report.deleted_ids.push(record.external_id.clone());
                }
                Err(e) => {
                    warn!(
                        partition = %partition,
                        external_id = %record.external_id,
                        object_id = %record.object_id,
                        error = %e,
                        "Failed to delete stale object"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            partition = %partition,
            inspected = report.inspected,
            deleted = report.deleted,
            failed = report.failed,
            "Reconciliation complete"
        );

        Ok(report)
    }
}
