use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{GenerationConfig, GroupPolicy, ModelSpec, OutputKind};
use crate::ledger::{best_effort, TaskCompletion, TaskFailure, TaskLedger};
use crate::provider::{PollOutcome, PollPolicy, ProviderClient, ProviderStatus, StatusObserver};
use crate::relocator::{MediaKind, Relocator};
use crate::runtime::admission::{Admission, PollingAdmission};
use crate::runtime::types::{
    codes, GenerationError, GenerationRequest, GenerationResult, GenerationTask, ProgressFn,
    TaskStatus, TaskUpdate,
};
use crate::session::SessionProvider;

/// Receiving end of [`Orchestrator::generate_stream`].
///
/// Dropping it does not stop the stream; remaining events are discarded.
pub type StreamHandle = mpsc::UnboundedReceiver<StreamEvent>;

/// One event of a generation stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A status change of the `index`-th task.
    Progress { index: usize, update: TaskUpdate },
    /// Sent once after the last task terminated.
    Complete(StreamSummary),
    /// The stream was aborted before task `index`. No `Complete` follows.
    Error { index: usize, code: String, message: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::Complete(_) => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<GenerationResult>,
    pub message: String,
}

impl StreamSummary {
    fn from_results(results: Vec<GenerationResult>) -> Self {
        let total = results.len();
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = total - succeeded;
        let message = if failed == 0 {
            format!("{succeeded} of {total} generations succeeded")
        } else {
            format!("{succeeded} of {total} generations succeeded, {failed} failed")
        };
        Self {
            total,
            succeeded,
            failed,
            results,
            message,
        }
    }
}

/// Drives generation tasks from admission to a terminal state.
///
/// Cheap to clone; clones share admission state and the registry of tasks
/// currently being polled.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<GenerationConfig>,
    provider: Arc<dyn ProviderClient>,
    relocator: Arc<dyn Relocator>,
    ledger: Arc<dyn TaskLedger>,
    session: Arc<dyn SessionProvider>,
    admission: Arc<dyn Admission>,
    /// Task ids with an attached poller.
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("groups", &self.config.groups.keys().collect::<Vec<_>>())
            .field("models", &self.config.models.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator with busy-poll admission over `config`'s groups.
    pub fn new(
        config: Arc<GenerationConfig>,
        provider: Arc<dyn ProviderClient>,
        relocator: Arc<dyn Relocator>,
        ledger: Arc<dyn TaskLedger>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        let admission = Arc::new(PollingAdmission::new(&config));
        Self {
            config,
            provider,
            relocator,
            ledger,
            session,
            admission,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Replace the admission strategy.
    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = admission;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn TaskLedger> {
        &self.ledger
    }

    /// Whether a poller is currently attached to `task_id`.
    pub fn is_polling(&self, task_id: &str) -> bool {
        self.inflight
            .lock()
            .map(|set| set.contains(task_id))
            .unwrap_or(false)
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Run one generation end to end. Returns only on a terminal state.
    ///
    /// The work runs on its own task, so dropping the returned future does
    /// not stop polling, relocation or the final ledger write.
    /// Failures never surface as `Err`; they are reported in the result's
    /// `error_code` / `error_message`.
    pub async fn generate(
        &self,
        model_id: &str,
        request: &GenerationRequest,
        on_progress: Option<ProgressFn>,
    ) -> GenerationResult {
        let this = self.clone();
        let owned_model_id = model_id.to_owned();
        let request = request.clone();
        let worker = tokio::spawn(async move {
            this.run(&owned_model_id, &request, on_progress.as_ref()).await
        });

        let outcome = worker
            .await
            .unwrap_or_else(|e| Err(GenerationError::Worker(e.to_string())));
        match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(model_id, code = %err.code(), error = %err, "generation rejected");
                GenerationResult::rejected(model_id, &err)
            }
        }
    }

    /// Run `count` generations of the same request one after another.
    ///
    /// Task `n + 1` is not created before task `n` is terminal. Individual
    /// failures are counted in the final [`StreamSummary`]; only failures
    /// that would repeat for every item (lost session, unknown model) end
    /// the stream with [`StreamEvent::Error`].
    pub fn generate_stream(&self, model_id: &str, request: GenerationRequest, count: usize) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let model_id = model_id.to_owned();
        tokio::spawn(async move {
            this.run_stream(&model_id, &request, count, tx).await;
        });
        rx
    }

    /// Re-attach polling to a task that already exists at the provider.
    ///
    /// Creation and admission are skipped. Fails with `ALREADY_POLLING` when
    /// another poller owns the task and `NOT_IN_PROGRESS` for terminal tasks.
    pub fn resume(
        &self,
        task: GenerationTask,
        on_progress: Option<ProgressFn>,
    ) -> Result<JoinHandle<GenerationResult>, GenerationError> {
        if task.status.is_terminal() {
            return Err(GenerationError::NotInProgress(task.task_id));
        }
        let model = self
            .config
            .model(&task.model_id)
            .cloned()
            .ok_or_else(|| GenerationError::UnknownModel(task.model_id.clone()))?;
        let policy = self
            .config
            .policy(&task.group)
            .cloned()
            .ok_or_else(|| GenerationError::UnknownGroup(task.group.clone()))?;
        let guard = self
            .claim(&task.task_id)
            .ok_or_else(|| GenerationError::AlreadyPolling(task.task_id.clone()))?;

        info!(task_id = %task.task_id, group = %task.group, progress = task.progress, "resuming task");
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let result = this.drive(&task, &model, &policy, on_progress.as_ref()).await;
            drop(guard);
            result
        }))
    }

    // ── State machine ────────────────────────────────────────────────────────

    /// ADMITTED → CREATED → (drive). `Err` means no provider task exists.
    async fn run(
        &self,
        model_id: &str,
        request: &GenerationRequest,
        on_progress: Option<&ProgressFn>,
    ) -> Result<GenerationResult, GenerationError> {
        let model = self
            .config
            .model(model_id)
            .ok_or_else(|| GenerationError::UnknownModel(model_id.to_owned()))?;
        let policy = self
            .config
            .policy(&model.group)
            .ok_or_else(|| GenerationError::UnknownGroup(model.group.clone()))?;

        self.ensure_session().await?;
        let permit = self.admission.await_admission(&model.group).await?;
        self.ensure_session().await?;
        debug!(model_id, group = %model.group, "admitted");

        let created = self
            .provider
            .create_task(model, &request.prompt, &request.input)
            .await
            .map_err(GenerationError::Creation)?;
        let task = GenerationTask::processing(&created.task_id, created.request_id, request, model);
        info!(task_id = %task.task_id, model_id, group = %model.group, scope = %task.scope, "task created");

        let guard = self.claim(&task.task_id);
        best_effort("create", &task.task_id, self.ledger.create(&task)).await;
        notify(on_progress, &TaskUpdate::processing(&task.task_id, 0));

        let result = self.drive(&task, model, policy, on_progress).await;
        drop(guard);
        drop(permit);
        Ok(result)
    }

    /// POLLING → (RELOCATING → COMPLETE) | FAILED, for a task that exists.
    async fn drive(
        &self,
        task: &GenerationTask,
        model: &ModelSpec,
        policy: &GroupPolicy,
        on_progress: Option<&ProgressFn>,
    ) -> GenerationResult {
        let task_id = task.task_id.as_str();
        let observer = TaskObserver {
            task_id,
            ledger: self.ledger.as_ref(),
            on_progress,
            prior_polls: task.poll_count,
        };
        let report = self
            .provider
            .wait_for_completion(task_id, model, &PollPolicy::from(policy).starting_at(task.progress), &observer)
            .await;
        let total_time_ms = task.age_ms();
        // Polls made before a resume stay counted.
        let poll_count = task.poll_count + report.poll_count;

        let result = match report.outcome {
            PollOutcome::Finished { media_url, cover_url } => {
                let primary = match model.kind {
                    OutputKind::Video => MediaKind::Video,
                    OutputKind::Image => MediaKind::Image,
                };
                let (media_url, cover_url) = tokio::join!(
                    self.relocate_or_keep(task_id, media_url, primary),
                    async {
                        match cover_url {
                            Some(url) => Some(self.relocate_or_keep(task_id, url, MediaKind::Cover).await),
                            None => None,
                        }
                    }
                );

                let completion = TaskCompletion {
                    media_url: media_url.clone(),
                    cover_url: cover_url.clone(),
                    poll_count,
                    total_time_ms,
                    finished_at: Utc::now(),
                };
                best_effort("mark_complete", task_id, self.ledger.mark_complete(task_id, &completion)).await;
                info!(task_id, polls = poll_count, total_time_ms, "task complete");

                GenerationResult {
                    task_id: Some(task_id.to_owned()),
                    model_id: model.id.clone(),
                    status: TaskStatus::Finish,
                    progress: 100,
                    media_url: Some(media_url),
                    cover_url,
                    error_code: None,
                    error_message: None,
                    poll_count,
                    total_time_ms,
                }
            }
            outcome => {
                let (error_code, error_message) = match outcome {
                    PollOutcome::Failed { code, message } => (code, message),
                    _ => {
                        let err = GenerationError::Timeout {
                            polls: report.poll_count,
                            elapsed_ms: report.elapsed.as_millis() as u64,
                        };
                        (codes::TIMEOUT.to_owned(), err.to_string())
                    }
                };

                let failure = TaskFailure {
                    error_code: error_code.clone(),
                    error_message: error_message.clone(),
                    poll_count,
                    total_time_ms,
                    finished_at: Utc::now(),
                };
                best_effort("mark_failed", task_id, self.ledger.mark_failed(task_id, &failure)).await;
                warn!(task_id, code = %error_code, polls = poll_count, "task failed");

                GenerationResult {
                    task_id: Some(task_id.to_owned()),
                    model_id: model.id.clone(),
                    status: TaskStatus::Fail,
                    progress: report.progress.max(task.progress),
                    media_url: None,
                    cover_url: None,
                    error_code: Some(error_code),
                    error_message: Some(error_message),
                    poll_count,
                    total_time_ms,
                }
            }
        };

        if let Some(update) = result.to_update() {
            notify(on_progress, &update);
        }
        result
    }

    async fn run_stream(
        &self,
        model_id: &str,
        request: &GenerationRequest,
        count: usize,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) {
        let mut results = Vec::with_capacity(count);
        for index in 0..count {
            let progress_tx = tx.clone();
            let on_progress: ProgressFn = Arc::new(move |update: &TaskUpdate| {
                let _ = progress_tx.send(StreamEvent::Progress {
                    index,
                    update: update.clone(),
                });
            });

            match self.run(model_id, request, Some(&on_progress)).await {
                Ok(result) => results.push(result),
                Err(err) if err.aborts_stream() => {
                    warn!(model_id, index, code = %err.code(), "stream aborted");
                    let _ = tx.send(StreamEvent::Error {
                        index,
                        code: err.code(),
                        message: err.to_string(),
                    });
                    return;
                }
                Err(err) => {
                    warn!(model_id, index, code = %err.code(), error = %err, "stream item rejected");
                    results.push(GenerationResult::rejected(model_id, &err));
                }
            }
        }

        let summary = StreamSummary::from_results(results);
        info!(model_id, total = summary.total, succeeded = summary.succeeded, "stream complete");
        let _ = tx.send(StreamEvent::Complete(summary));
    }

    async fn ensure_session(&self) -> Result<(), GenerationError> {
        if self.session.is_session_valid().await {
            Ok(())
        } else {
            Err(GenerationError::AuthRequired)
        }
    }

    /// Relocate `url`, falling back to the temporary URL on failure.
    async fn relocate_or_keep(&self, task_id: &str, url: String, kind: MediaKind) -> String {
        match self.relocator.relocate(&url, kind).await {
            Ok(permanent) => permanent,
            Err(e) => {
                warn!(task_id, %kind, error = %e, "relocation failed; keeping temporary url");
                url
            }
        }
    }

    fn claim(&self, task_id: &str) -> Option<InflightGuard> {
        let mut set = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        set.insert(task_id.to_owned()).then(|| InflightGuard {
            inflight: self.inflight.clone(),
            task_id: task_id.to_owned(),
        })
    }
}

fn notify(on_progress: Option<&ProgressFn>, update: &TaskUpdate) {
    if let Some(callback) = on_progress {
        callback(update);
    }
}

/// Removes a task from the in-flight registry when its poller ends.
struct InflightGuard {
    inflight: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut set = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.task_id);
    }
}

/// Forwards non-terminal status changes to the caller and the ledger.
struct TaskObserver<'a> {
    task_id: &'a str,
    ledger: &'a dyn TaskLedger,
    on_progress: Option<&'a ProgressFn>,
    /// Polls recorded before this poller attached.
    prior_polls: u32,
}

#[async_trait]
impl<'a> StatusObserver for TaskObserver<'a> {
    async fn on_status(&self, status: &ProviderStatus, poll_count: u32) {
        if let ProviderStatus::Processing { progress } = status {
            notify(self.on_progress, &TaskUpdate::processing(self.task_id, *progress));
            best_effort(
                "update_progress",
                self.task_id,
                self.ledger
                    .update_progress(self.task_id, *progress, self.prior_polls + poll_count),
            )
            .await;
        }
    }
}
