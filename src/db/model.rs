//! View models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Lifecycle
//! decisions live in the evaluator and sweep.

use crate::model::Batch;
use serde::Serialize;

/// Ground-truth unit counts for one batch, read straight from `units`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub persisted: i64,
    pub with_artifact: i64,
}

impl UnitCounts {
    /// True when at least one unit exists and every persisted unit carries an artifact.
    pub fn all_have_artifacts(&self) -> bool {
        self.persisted > 0 && self.with_artifact >= self.persisted
    }
}

/// Batch record joined with its live unit counts, used by the status API and
/// the `batch_report` binary.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    #[serde(flatten)]
    pub batch: Batch,
    pub units: UnitCounts,
}
