//! Provider Client: the remote video-generation API.
//!
//! [`ProviderClient`] is stateless request/response. The provided
//! [`ProviderClient::wait_for_completion`] loop turns repeated status reads
//! into a single terminal [`PollReport`].

mod http;

pub use http::HttpProviderClient;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{GroupPolicy, ModelSpec};
use crate::runtime::types::codes;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure. Transient.
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// 5xx or 429 from the provider. Transient.
    #[error("provider unavailable (HTTP {status})")]
    Unavailable { status: u16 },

    /// The provider refused the request (bad parameters, quota, auth).
    #[error("provider rejected request [{code}]: {message}")]
    Rejected { code: String, message: String },

    /// The provider answered with a payload that does not validate.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether a status poll hitting this error should simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transport(_) | ProviderError::Unavailable { .. })
    }

    pub fn code(&self) -> String {
        match self {
            ProviderError::Rejected { code, .. } => code.clone(),
            ProviderError::InvalidResponse(_) => codes::INVALID_RESPONSE.to_owned(),
            ProviderError::Transport(_) | ProviderError::Unavailable { .. } => {
                codes::PROVIDER_ERROR.to_owned()
            }
        }
    }
}

/// Identifiers returned by a successful task creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTask {
    pub task_id: String,
    pub request_id: Option<String>,
}

/// Validated provider view of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Processing { progress: u8 },
    Finish { media_url: String, cover_url: Option<String> },
    Fail { code: String, message: String },
}

impl ProviderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderStatus::Processing { .. })
    }
}

/// Polling limits derived from a [`GroupPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Progress already known for the task; reported progress never drops below it.
    pub start_progress: u8,
}

impl PollPolicy {
    pub fn starting_at(self, progress: u8) -> Self {
        Self {
            start_progress: progress.min(100),
            ..self
        }
    }
}

impl From<&GroupPolicy> for PollPolicy {
    fn from(policy: &GroupPolicy) -> Self {
        Self {
            interval: policy.poll_interval(),
            timeout: policy.poll_timeout(),
            max_attempts: policy.max_poll_attempts,
            start_progress: 0,
        }
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Finished { media_url: String, cover_url: Option<String> },
    Failed { code: String, message: String },
    /// The poll budget ran out before a terminal status was observed.
    /// Never reported by the provider itself.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Last observed progress (100 on `Finished`).
    pub progress: u8,
    pub poll_count: u32,
    pub elapsed: Duration,
}

/// Receives every status change observed by [`ProviderClient::wait_for_completion`].
#[async_trait]
pub trait StatusObserver: Send + Sync {
    /// `poll_count` counts polls made by this loop so far.
    async fn on_status(&self, status: &ProviderStatus, poll_count: u32);
}

#[async_trait]
impl StatusObserver for () {
    async fn on_status(&self, _status: &ProviderStatus, _poll_count: u32) {}
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit a generation. Never retried internally.
    async fn create_task(
        &self,
        model: &ModelSpec,
        prompt: &str,
        input: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CreatedTask, ProviderError>;

    /// Read the current status of a task. Idempotent.
    async fn get_task_status(&self, task_id: &str, model: &ModelSpec) -> Result<ProviderStatus, ProviderError>;

    /// Poll until a terminal status, `policy.timeout` or `policy.max_attempts`.
    ///
    /// Transient errors are logged and retried within the same budget.
    /// Reported progress is clamped so it never moves backwards.
    async fn wait_for_completion(
        &self,
        task_id: &str,
        model: &ModelSpec,
        policy: &PollPolicy,
        observer: &dyn StatusObserver,
    ) -> PollReport {
        let started = Instant::now();
        let mut poll_count = 0u32;
        let mut progress = policy.start_progress;
        let mut last: Option<ProviderStatus> = None;

        loop {
            if poll_count >= policy.max_attempts || started.elapsed() >= policy.timeout {
                warn!(task_id, poll_count, progress, "poll budget exhausted");
                return PollReport {
                    outcome: PollOutcome::TimedOut,
                    progress,
                    poll_count,
                    elapsed: started.elapsed(),
                };
            }

            poll_count += 1;
            let status = match self.get_task_status(task_id, model).await {
                Ok(ProviderStatus::Processing { progress: p }) => {
                    ProviderStatus::Processing { progress: p.max(progress).min(100) }
                }
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    warn!(task_id, poll_count, error = %e, "transient poll failure; retrying");
                    tokio::time::sleep(policy.interval).await;
                    continue;
                }
                Err(e) => ProviderStatus::Fail {
                    code: e.code(),
                    message: e.to_string(),
                },
            };

            if last.as_ref() != Some(&status) {
                debug!(task_id, poll_count, ?status, "status changed");
                observer.on_status(&status, poll_count).await;
                last = Some(status.clone());
            }

            match status {
                ProviderStatus::Processing { progress: p } => progress = p,
                ProviderStatus::Finish { media_url, cover_url } => {
                    return PollReport {
                        outcome: PollOutcome::Finished { media_url, cover_url },
                        progress: 100,
                        poll_count,
                        elapsed: started.elapsed(),
                    };
                }
                ProviderStatus::Fail { code, message } => {
                    return PollReport {
                        outcome: PollOutcome::Failed { code, message },
                        progress,
                        poll_count,
                        elapsed: started.elapsed(),
                    };
                }
            }

            tokio::time::sleep(policy.interval).await;
        }
    }
}
