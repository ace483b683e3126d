//! Task Ledger: durable record of generation tasks.
//!
//! Writes issued by the orchestrator are best-effort. They go through
//! [`best_effort`], which logs and absorbs failures so that the outcome
//! reported to a caller never depends on persistence.

mod memory;

pub use memory::MemoryLedger;

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::runtime::types::GenerationTask;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("task {0} already recorded")]
    Duplicate(String),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("ledger backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        LedgerError::Backend(Box::new(err))
    }
}

/// Terminal success written by [`TaskLedger::mark_complete`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub media_url: String,
    pub cover_url: Option<String>,
    pub poll_count: u32,
    pub total_time_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Terminal failure written by [`TaskLedger::mark_failed`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error_code: String,
    pub error_message: String,
    pub poll_count: u32,
    pub total_time_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Durable store for [`GenerationTask`] records.
///
/// Implementations must keep terminal rows terminal: `mark_complete` and
/// `mark_failed` on a row that is no longer `PROCESSING` change nothing and
/// return `Ok(false)`. Progress and the poll counter never move backwards.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    async fn create(&self, task: &GenerationTask) -> Result<(), LedgerError>;

    /// Raise the stored progress and poll counter of a `PROCESSING` row.
    async fn update_progress(&self, task_id: &str, progress: u8, poll_count: u32) -> Result<(), LedgerError>;

    /// Returns whether the row transitioned.
    async fn mark_complete(&self, task_id: &str, completion: &TaskCompletion) -> Result<bool, LedgerError>;

    /// Returns whether the row transitioned.
    async fn mark_failed(&self, task_id: &str, failure: &TaskFailure) -> Result<bool, LedgerError>;

    /// All `PROCESSING` tasks in `scope`, oldest first.
    async fn find_incomplete(&self, scope: &str) -> Result<Vec<GenerationTask>, LedgerError>;

    async fn get(&self, task_id: &str) -> Result<Option<GenerationTask>, LedgerError>;

    /// Tasks newest first, optionally restricted to one scope.
    async fn list(&self, scope: Option<&str>) -> Result<Vec<GenerationTask>, LedgerError>;
}

/// Run a ledger write as a best-effort side effect.
///
/// Failures are logged at `warn` with the operation name and task id and
/// turned into `None`; they never propagate.
pub async fn best_effort<T, F>(operation: &'static str, task_id: &str, write: F) -> Option<T>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match write.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation, task_id, error = %e, "ledger write failed; continuing");
            None
        }
    }
}
