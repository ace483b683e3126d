use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{LedgerError, TaskCompletion, TaskFailure, TaskLedger};
use crate::runtime::types::{GenerationTask, TaskStatus};

/// Process-local ledger. Used by tests and by hosts that do not need
/// persistence across restarts.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tasks: Mutex<HashMap<String, GenerationTask>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tasks<R>(&self, f: impl FnOnce(&mut HashMap<String, GenerationTask>) -> R) -> Result<R, LedgerError> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| LedgerError::Backend("memory ledger lock poisoned".into()))?;
        Ok(f(&mut tasks))
    }
}

#[async_trait]
impl TaskLedger for MemoryLedger {
    async fn create(&self, task: &GenerationTask) -> Result<(), LedgerError> {
        self.with_tasks(|tasks| {
            if tasks.contains_key(&task.task_id) {
                return Err(LedgerError::Duplicate(task.task_id.clone()));
            }
            tasks.insert(task.task_id.clone(), task.clone());
            Ok(())
        })?
    }

    async fn update_progress(&self, task_id: &str, progress: u8, poll_count: u32) -> Result<(), LedgerError> {
        self.with_tasks(|tasks| {
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| LedgerError::NotFound(task_id.to_owned()))?;
            if task.status == TaskStatus::Processing {
                task.progress = task.progress.max(progress.min(100));
                task.poll_count = task.poll_count.max(poll_count);
            }
            Ok(())
        })?
    }

    async fn mark_complete(&self, task_id: &str, completion: &TaskCompletion) -> Result<bool, LedgerError> {
        self.with_tasks(|tasks| {
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| LedgerError::NotFound(task_id.to_owned()))?;
            if task.status.is_terminal() {
                return Ok(false);
            }
            task.status = TaskStatus::Finish;
            task.progress = 100;
            task.media_url = Some(completion.media_url.clone());
            task.cover_url = completion.cover_url.clone();
            task.poll_count = completion.poll_count;
            task.total_time_ms = completion.total_time_ms;
            task.finished_at = Some(completion.finished_at);
            Ok(true)
        })?
    }

    async fn mark_failed(&self, task_id: &str, failure: &TaskFailure) -> Result<bool, LedgerError> {
        self.with_tasks(|tasks| {
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| LedgerError::NotFound(task_id.to_owned()))?;
            if task.status.is_terminal() {
                return Ok(false);
            }
            task.status = TaskStatus::Fail;
            task.error_code = Some(failure.error_code.clone());
            task.error_message = Some(failure.error_message.clone());
            task.poll_count = failure.poll_count;
            task.total_time_ms = failure.total_time_ms;
            task.finished_at = Some(failure.finished_at);
            Ok(true)
        })?
    }

    async fn find_incomplete(&self, scope: &str) -> Result<Vec<GenerationTask>, LedgerError> {
        self.with_tasks(|tasks| {
            let mut found: Vec<_> = tasks
                .values()
                .filter(|t| t.scope == scope && t.status == TaskStatus::Processing)
                .cloned()
                .collect();
            found.sort_by_key(|t| t.created_at);
            found
        })
    }

    async fn get(&self, task_id: &str) -> Result<Option<GenerationTask>, LedgerError> {
        self.with_tasks(|tasks| tasks.get(task_id).cloned())
    }

    async fn list(&self, scope: Option<&str>) -> Result<Vec<GenerationTask>, LedgerError> {
        self.with_tasks(|tasks| {
            let mut found: Vec<_> = tasks
                .values()
                .filter(|t| scope.is_none_or(|s| t.scope == s))
                .cloned()
                .collect();
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            found
        })
    }
}
