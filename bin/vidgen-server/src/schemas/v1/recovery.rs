use serde::Serialize;
use utoipa::ToSchema;
use vidgen_core::{SweepFailure, SweepReport};

#[derive(Serialize, ToSchema)]
pub struct RecoveryFailure {
    pub task_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct RecoveryResponse {
    pub scope: String,
    /// Tasks a poller was attached to.
    pub resumed: Vec<String>,
    /// Tasks that were already terminal or already being polled.
    pub skipped: Vec<String>,
    pub failed: Vec<RecoveryFailure>,
}

impl RecoveryResponse {
    pub fn new(scope: String, report: &SweepReport) -> Self {
        Self {
            scope,
            resumed: report.resumed.clone(),
            skipped: report.skipped.clone(),
            failed: report.failed.iter().map(RecoveryFailure::from).collect(),
        }
    }
}

impl From<&SweepFailure> for RecoveryFailure {
    fn from(failure: &SweepFailure) -> Self {
        Self {
            task_id: failure.task_id.clone(),
            code: failure.code.clone(),
            message: failure.message.clone(),
        }
    }
}
