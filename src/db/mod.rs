//! Database module: entity rows and SQL repositories.
//!
//! - `model`: view models returned by inspection queries.
//! - `repo`: pool setup, the content store and the subscriber table.
//! - `ledger`: the notification ledger and its state transitions.
//!
//! Callers import from `content_notifier::db`; the repository API is
//! re-exported here.

pub mod ledger;
pub mod model;
pub mod repo;

pub use ledger::*;
pub use repo::*;

pub use model::{ContentFlagCounts, LedgerSummary};
