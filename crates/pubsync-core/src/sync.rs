//! Run outcomes, statistics and reports.
//!
//! Pure bookkeeping: nothing here performs I/O. The orchestrator fills a
//! [`SyncRunResult`] while it runs and wraps it in a [`SyncRunReport`].

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::models::CanonicalObject;

/// Outcome of processing a single source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    /// Content hash matches the stored object - nothing rewritten
    Unchanged,
    /// Existing object updated in place
    Updated,
    /// New object and synchronization record created
    Created,
    /// Record failed schema validation and was skipped
    Skipped,
    /// Processing failed (persistence or unexpected error)
    Failed,
}

/// Statistics for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub unchanged: usize,
    pub updated: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: usize,
    pub delete_failed: usize,
    pub attachments_stored: usize,
    pub attachments_reused: usize,
    pub attachments_failed: usize,
}

impl SyncStats {
    /// Creates a new empty stats tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Unchanged => self.unchanged += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Skipped => self.skipped += 1,
            SyncOutcome::Failed => self.failed += 1,
        }
    }

    /// Returns the total number of processed records.
    pub fn total(&self) -> usize {
        self.successful() + self.skipped + self.failed
    }

    /// Returns the number of successfully synchronized records.
    pub fn successful(&self) -> usize {
        self.unchanged + self.updated + self.created
    }
}

/// Result of delta detection for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDecision {
    /// Whether the stored object has to be rewritten
    pub needs_write: bool,
    /// The outcome classification for this record
    pub outcome: SyncOutcome,
    /// Human-readable reason for the decision
    pub reason: &'static str,
}

/// Decides whether a record needs to be written, based on content hashes.
///
/// # Arguments
/// * `existing_hash` - Hash of the stored object (None if the record is new)
/// * `new_hash` - Hash of the freshly transformed fields
pub fn detect_change(existing_hash: Option<&str>, new_hash: &str) -> ChangeDecision {
    match existing_hash {
        Some(hash) if hash == new_hash => ChangeDecision {
            needs_write: false,
            outcome: SyncOutcome::Unchanged,
            reason: "content hash matches",
        },
        Some(_) => ChangeDecision {
            needs_write: true,
            outcome: SyncOutcome::Updated,
            reason: "content hash changed",
        },
        None => ChangeDecision {
            needs_write: true,
            outcome: SyncOutcome::Created,
            reason: "new record",
        },
    }
}

/// States of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    ConfigResolved,
    Fetching,
    ProcessingRecords,
    Reconciling,
    Reported,
    /// Configuration missing or unresolvable; nothing was fetched.
    ConfigInvalid,
    /// Another run holds the partition lock; nothing was fetched.
    LockUnavailable,
    /// The listing could not be fetched completely; nothing was written.
    FetchFailed,
    /// The partition lease lapsed mid-run; reconciliation was skipped.
    LockLost,
}

impl RunState {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunState::ConfigInvalid
                | RunState::LockUnavailable
                | RunState::FetchFailed
                | RunState::LockLost
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What one run produced. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncRunResult {
    /// External identifiers successfully synchronized, in listing order.
    pub synced_ids: Vec<String>,
    /// Canonical objects created, updated or confirmed unchanged.
    pub objects: Vec<CanonicalObject>,
    /// Number of records the listing contained.
    pub fetched: usize,
    pub stats: SyncStats,
}

/// Report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunReport {
    pub partition: String,
    pub success: bool,
    /// States visited, starting with `Idle` and ending with `Reported`.
    pub trail: Vec<RunState>,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub result: SyncRunResult,
    pub error: Option<String>,
}

impl SyncRunReport {
    /// The failure state the run went through, if any.
    pub fn failure_state(&self) -> Option<RunState> {
        self.trail.iter().copied().find(|s| s.is_failure())
    }

    pub fn visited(&self, state: RunState) -> bool {
        self.trail.contains(&state)
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// =============================================================================
// Batch Types
// =============================================================================

/// Aggregated reports from syncing several sources.
#[derive(Debug, Clone, Default)]
pub struct BatchSyncSummary {
    pub reports: Vec<SyncRunReport>,
}

impl BatchSyncSummary {
    /// Creates a new empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, report: SyncRunReport) {
        self.reports.push(report);
    }

    pub fn successful_count(&self) -> usize {
        self.reports.iter().filter(|r| r.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.reports.iter().filter(|r| !r.success).count()
    }

    /// Total records synchronized across successful runs.
    pub fn total_synced(&self) -> usize {
        self.reports
            .iter()
            .map(|r| r.result.stats.successful())
            .sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.reports.iter().map(|r| r.result.stats.deleted).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(success: bool, created: usize, deleted: usize) -> SyncRunReport {
        SyncRunReport {
            partition: "s/p".into(),
            success,
            trail: vec![RunState::Idle, RunState::Reported],
            elapsed: Duration::from_millis(5),
            result: SyncRunResult {
                stats: SyncStats {
                    created,
                    deleted,
                    ..Default::default()
                },
                ..Default::default()
            },
            error: None,
        }
    }

    #[test]
    fn test_sync_stats_record() {
        let mut stats = SyncStats::new();
        stats.record(SyncOutcome::Unchanged);
        stats.record(SyncOutcome::Updated);
        stats.record(SyncOutcome::Created);
        stats.record(SyncOutcome::Skipped);
        stats.record(SyncOutcome::Failed);

        assert_eq!(stats.successful(), 3);
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn test_detect_change_unchanged() {
        let decision = detect_change(Some("abc123"), "abc123");
        assert!(!decision.needs_write);
        assert_eq!(decision.outcome, SyncOutcome::Unchanged);
        assert_eq!(decision.reason, "content hash matches");
    }

    #[test]
    fn test_detect_change_updated() {
        let decision = detect_change(Some("abc123"), "def456");
        assert!(decision.needs_write);
        assert_eq!(decision.outcome, SyncOutcome::Updated);
    }

    #[test]
    fn test_detect_change_new() {
        let decision = detect_change(None, "def456");
        assert!(decision.needs_write);
        assert_eq!(decision.outcome, SyncOutcome::Created);
        assert_eq!(decision.reason, "new record");
    }

    #[test]
    fn test_failure_states() {
        assert!(RunState::FetchFailed.is_failure());
        assert!(RunState::LockUnavailable.is_failure());
        assert!(!RunState::Reconciling.is_failure());
    }

    #[test]
    fn test_report_failure_state() {
        let mut r = report(false, 0, 0);
        r.trail = vec![RunState::Idle, RunState::ConfigInvalid, RunState::Reported];
        assert_eq!(r.failure_state(), Some(RunState::ConfigInvalid));
        assert!(!r.visited(RunState::Fetching));
    }

    #[test]
    fn test_batch_summary_mixed_results() {
        let mut summary = BatchSyncSummary::new();
        summary.add(report(true, 3, 1));
        summary.add(report(false, 0, 0));
        summary.add(report(true, 2, 0));

        assert_eq!(summary.successful_count(), 2);
        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.total_synced(), 5);
        assert_eq!(summary.total_deleted(), 1);
    }
}
