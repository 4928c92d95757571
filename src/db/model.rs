//! View models returned by the inspection queries.
//!
//! Keep these focused on what the admin endpoints report. Business logic
//! lives in the pipeline.

use serde::Serialize;

/// Content items split by their `notification_sent` flag.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ContentFlagCounts {
    pub total: i64,
    pub notified: i64,
    pub unnotified: i64,
}

/// Ledger rows grouped by status. Attempts that reached a recipient who
/// already had a `sent` row are counted under `duplicates`, not `failed`.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LedgerSummary {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub duplicates: i64,
}
