use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ledger::{best_effort, LedgerError, TaskFailure};
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::types::{GenerationError, GenerationResult, ProgressFn, TaskStatus};

/// A task the sweep could not re-attach.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub task_id: String,
    pub code: String,
    pub message: String,
}

/// Outcome of one [`RecoverySweep::run`].
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    /// Tasks a poller was attached to by this sweep.
    pub resumed: Vec<String>,
    /// Tasks that were already terminal or already being polled.
    pub skipped: Vec<String>,
    pub failed: Vec<SweepFailure>,
    #[serde(skip)]
    handles: Vec<JoinHandle<GenerationResult>>,
}

impl SweepReport {
    /// Wait for every resumed task to reach a terminal state.
    pub async fn join(self) -> Vec<GenerationResult> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "resumed poller panicked"),
            }
        }
        results
    }
}

/// Re-attaches polling to tasks left `PROCESSING` in the ledger.
///
/// Running it twice is harmless: tasks are re-read from the ledger before
/// attaching, and the orchestrator refuses a second poller for a task.
#[derive(Debug, Clone)]
pub struct RecoverySweep {
    orchestrator: Orchestrator,
}

impl RecoverySweep {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Resume every incomplete task of `scope`.
    ///
    /// Only the initial ledger scan can fail; per-task problems are reported
    /// in [`SweepReport::failed`].
    pub async fn run(&self, scope: &str, on_progress: Option<ProgressFn>) -> Result<SweepReport, LedgerError> {
        let ledger = self.orchestrator.ledger();
        let candidates = ledger.find_incomplete(scope).await?;
        let mut report = SweepReport::default();

        for candidate in candidates {
            let task_id = candidate.task_id.clone();
            let current = match ledger.get(&task_id).await {
                Ok(Some(task)) if task.status == TaskStatus::Processing => task,
                Ok(_) => {
                    report.skipped.push(task_id);
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "recovery: ledger re-read failed");
                    report.failed.push(SweepFailure {
                        task_id,
                        code: GenerationError::Ledger(e).code(),
                        message: "ledger re-read failed".into(),
                    });
                    continue;
                }
            };

            match self.orchestrator.resume(current, on_progress.clone()) {
                Ok(handle) => {
                    report.resumed.push(task_id);
                    report.handles.push(handle);
                }
                Err(GenerationError::AlreadyPolling(_)) | Err(GenerationError::NotInProgress(_)) => {
                    report.skipped.push(task_id);
                }
                Err(err) => {
                    warn!(task_id = %task_id, code = %err.code(), error = %err, "recovery: cannot resume task");
                    if matches!(err, GenerationError::UnknownModel(_) | GenerationError::UnknownGroup(_)) {
                        let failure = TaskFailure {
                            error_code: err.code(),
                            error_message: err.to_string(),
                            poll_count: candidate.poll_count,
                            total_time_ms: candidate.age_ms(),
                            finished_at: Utc::now(),
                        };
                        best_effort("mark_failed", &task_id, ledger.mark_failed(&task_id, &failure)).await;
                    }
                    report.failed.push(SweepFailure {
                        task_id,
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            scope,
            resumed = report.resumed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }
}
