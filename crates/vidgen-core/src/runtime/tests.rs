use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing_test::traced_test;

use crate::config::{GenerationConfig, ModelSpec};
use crate::ledger::{LedgerError, MemoryLedger, TaskCompletion, TaskFailure, TaskLedger};
use crate::provider::{CreatedTask, ProviderClient, ProviderError, ProviderStatus};
use crate::relocator::{MediaKind, RelocationError, Relocator};
use crate::runtime::admission::{Admission, Permit};
use crate::runtime::orchestrator::{Orchestrator, StreamEvent};
use crate::runtime::recovery::RecoverySweep;
use crate::runtime::types::{
    codes, GenerationError, GenerationRequest, GenerationTask, ProgressFn, TaskStatus, TaskUpdate,
};
use crate::session::{Session, SessionProvider};

// ── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    Status(ProviderStatus),
    Unavailable,
}

fn processing(progress: u8) -> Step {
    Step::Status(ProviderStatus::Processing { progress })
}

fn finish(media_url: &str, cover_url: Option<&str>) -> Step {
    Step::Status(ProviderStatus::Finish {
        media_url: media_url.to_owned(),
        cover_url: cover_url.map(str::to_owned),
    })
}

fn fail(code: &str, message: &str) -> Step {
    Step::Status(ProviderStatus::Fail {
        code: code.to_owned(),
        message: message.to_owned(),
    })
}

/// Provider whose tasks follow a fixed script of status steps. The last step
/// repeats once the script is exhausted.
#[derive(Default)]
struct ScriptedProvider {
    default_script: Vec<Step>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    ids: Mutex<VecDeque<String>>,
    reject_create: Option<(String, String)>,
    creates: Mutex<Vec<Instant>>,
    polls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedProvider {
    fn new(script: Vec<Step>) -> Self {
        Self {
            default_script: script,
            ..Self::default()
        }
    }

    fn with_ids(self, ids: &[&str]) -> Self {
        *self.ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_script(self, task_id: &str, script: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_owned(), script.into());
        self
    }

    fn rejecting(code: &str, message: &str) -> Self {
        Self {
            reject_create: Some((code.to_owned(), message.to_owned())),
            ..Self::default()
        }
    }

    fn create_count(&self) -> usize {
        self.creates.lock().unwrap().len()
    }

    fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn create_task(
        &self,
        _model: &ModelSpec,
        _prompt: &str,
        _input: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CreatedTask, ProviderError> {
        if let Some((code, message)) = &self.reject_create {
            return Err(ProviderError::Rejected {
                code: code.clone(),
                message: message.clone(),
            });
        }
        let mut creates = self.creates.lock().unwrap();
        creates.push(Instant::now());
        let task_id = self
            .ids
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("task-{}", creates.len()));
        self.scripts
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_insert_with(|| self.default_script.clone().into());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(CreatedTask {
            task_id,
            request_id: Some("req-1".into()),
        })
    }

    async fn get_task_status(&self, task_id: &str, _model: &ModelSpec) -> Result<ProviderStatus, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.get_mut(task_id).expect("unscripted task polled");
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().expect("empty script")
            }
        };
        match step {
            Step::Unavailable => Err(ProviderError::Unavailable { status: 503 }),
            Step::Status(status) => {
                if status.is_terminal() {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(status)
            }
        }
    }
}

#[derive(Default)]
struct FakeRelocator {
    failing: Vec<MediaKind>,
    calls: Mutex<Vec<(String, MediaKind)>>,
}

impl FakeRelocator {
    fn failing(kinds: &[MediaKind]) -> Self {
        Self {
            failing: kinds.to_vec(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Relocator for FakeRelocator {
    async fn relocate(&self, temporary_url: &str, kind: MediaKind) -> Result<String, RelocationError> {
        self.calls.lock().unwrap().push((temporary_url.to_owned(), kind));
        if self.failing.contains(&kind) {
            return Err(RelocationError::Fetch {
                url: temporary_url.to_owned(),
                message: "connection reset".into(),
            });
        }
        let file = temporary_url.rsplit('/').next().unwrap_or_default();
        Ok(format!("https://storage.test/{kind}/{file}"))
    }
}

struct ToggleSession(AtomicBool);

impl ToggleSession {
    fn valid() -> Self {
        Self(AtomicBool::new(true))
    }

    fn set_valid(&self, valid: bool) {
        self.0.store(valid, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionProvider for ToggleSession {
    async fn current_session(&self) -> Option<Session> {
        self.0
            .load(Ordering::SeqCst)
            .then(|| Session::new("user-1", None))
    }
}

/// [`MemoryLedger`] that counts writes and can be told to fail them.
#[derive(Default)]
struct CountingLedger {
    inner: MemoryLedger,
    fail_writes: AtomicBool,
    creates: AtomicUsize,
    terminal_transitions: AtomicUsize,
}

impl CountingLedger {
    fn check(&self, task_id: &str) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::backend(std::io::Error::other(format!(
                "disk full while writing {task_id}"
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskLedger for CountingLedger {
    async fn create(&self, task: &GenerationTask) -> Result<(), LedgerError> {
        self.check(&task.task_id)?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(task).await
    }

    async fn update_progress(&self, task_id: &str, progress: u8, poll_count: u32) -> Result<(), LedgerError> {
        self.check(task_id)?;
        self.inner.update_progress(task_id, progress, poll_count).await
    }

    async fn mark_complete(&self, task_id: &str, completion: &TaskCompletion) -> Result<bool, LedgerError> {
        self.check(task_id)?;
        let changed = self.inner.mark_complete(task_id, completion).await?;
        if changed {
            self.terminal_transitions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(changed)
    }

    async fn mark_failed(&self, task_id: &str, failure: &TaskFailure) -> Result<bool, LedgerError> {
        self.check(task_id)?;
        let changed = self.inner.mark_failed(task_id, failure).await?;
        if changed {
            self.terminal_transitions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(changed)
    }

    async fn find_incomplete(&self, scope: &str) -> Result<Vec<GenerationTask>, LedgerError> {
        self.inner.find_incomplete(scope).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<GenerationTask>, LedgerError> {
        self.inner.get(task_id).await
    }

    async fn list(&self, scope: Option<&str>) -> Result<Vec<GenerationTask>, LedgerError> {
        self.inner.list(scope).await
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Policy {
    max_concurrent: usize,
    cooldown_ms: u64,
    poll_timeout_ms: u64,
    max_poll_attempts: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            cooldown_ms: 0,
            poll_timeout_ms: 60_000,
            max_poll_attempts: 50,
        }
    }
}

fn config(policy: &Policy) -> Arc<GenerationConfig> {
    let raw = format!(
        r#"
        [groups.vendor]
        base_url = "https://api.vendor.test/v1"
        max_concurrent = {}
        cooldown_ms = {}
        poll_interval_ms = 1000
        poll_timeout_ms = {}
        max_poll_attempts = {}

        [[models]]
        id = "video-1"
        group = "vendor"
        "#,
        policy.max_concurrent, policy.cooldown_ms, policy.poll_timeout_ms, policy.max_poll_attempts
    );
    Arc::new(GenerationConfig::from_toml_str(&raw).expect("valid test config"))
}

struct Harness {
    orchestrator: Orchestrator,
    provider: Arc<ScriptedProvider>,
    relocator: Arc<FakeRelocator>,
    ledger: Arc<CountingLedger>,
    session: Arc<ToggleSession>,
}

fn harness_with(policy: Policy, provider: ScriptedProvider, relocator: FakeRelocator) -> Harness {
    let provider = Arc::new(provider);
    let relocator = Arc::new(relocator);
    let ledger = Arc::new(CountingLedger::default());
    let session = Arc::new(ToggleSession::valid());
    let orchestrator = Orchestrator::new(
        config(&policy),
        provider.clone(),
        relocator.clone(),
        ledger.clone(),
        session.clone(),
    );
    Harness {
        orchestrator,
        provider,
        relocator,
        ledger,
        session,
    }
}

fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(Policy::default(), provider, FakeRelocator::default())
}

fn request() -> GenerationRequest {
    GenerationRequest::new("chat-1", "a cat surfing at sunset")
}

fn recorder() -> (ProgressFn, Arc<Mutex<Vec<TaskUpdate>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ProgressFn = Arc::new(move |update: &TaskUpdate| sink.lock().unwrap().push(update.clone()));
    (callback, seen)
}

async fn collect(mut handle: crate::runtime::orchestrator::StreamHandle) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.recv().await {
        events.push(event);
    }
    events
}

// ── Single generation ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn finished_task_is_relocated_with_full_progress() {
    let provider = ScriptedProvider::new(vec![
        processing(10),
        processing(55),
        finish("https://cdn.provider.test/tmp/abc.mp4", Some("https://cdn.provider.test/tmp/abc.jpg")),
    ])
    .with_ids(&["abc"]);
    let h = harness(provider);
    let (callback, seen) = recorder();

    let result = h.orchestrator.generate("video-1", &request(), Some(callback)).await;

    assert_eq!(result.task_id.as_deref(), Some("abc"));
    assert_eq!(result.status, TaskStatus::Finish);
    assert_eq!(result.progress, 100);
    assert_eq!(result.media_url.as_deref(), Some("https://storage.test/video/abc.mp4"));
    assert_eq!(result.cover_url.as_deref(), Some("https://storage.test/cover/abc.jpg"));
    assert_eq!(result.poll_count, 3);
    assert!(result.error_code.is_none());

    let progress: Vec<_> = seen.lock().unwrap().iter().map(|u| (u.status, u.progress)).collect();
    assert_eq!(
        progress,
        vec![
            (TaskStatus::Processing, 0),
            (TaskStatus::Processing, 10),
            (TaskStatus::Processing, 55),
            (TaskStatus::Finish, 100),
        ]
    );

    let stored = h.ledger.get("abc").await.unwrap().expect("ledger row");
    assert_eq!(stored.status, TaskStatus::Finish);
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.media_url, result.media_url);
    assert_eq!(stored.request_id.as_deref(), Some("req-1"));
    assert_eq!(stored.scope, "chat-1");
    assert!(!h.orchestrator.is_polling("abc"));
}

#[tokio::test(start_paused = true)]
async fn polling_outlives_a_dropped_caller() {
    let provider = ScriptedProvider::new(vec![
        processing(10),
        processing(30),
        processing(50),
        processing(70),
        processing(90),
        finish("https://cdn.provider.test/tmp/abc.mp4", None),
    ])
    .with_ids(&["abc"]);
    let h = harness(provider);

    let caller = tokio::time::timeout(
        Duration::from_millis(1_500),
        h.orchestrator.generate("video-1", &request(), None),
    )
    .await;
    assert!(caller.is_err());
    let polls_at_drop = h.provider.poll_count();
    assert!(polls_at_drop < 6);

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.provider.poll_count(), 6);
    let stored = h.ledger.get("abc").await.unwrap().expect("ledger row");
    assert_eq!(stored.status, TaskStatus::Finish);
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.media_url.as_deref(), Some("https://storage.test/video/abc.mp4"));
    assert!(!h.orchestrator.is_polling("abc"));
}

#[tokio::test(start_paused = true)]
async fn creation_rejection_fails_without_polling_or_ledger_row() {
    let h = harness(ScriptedProvider::rejecting("QUOTA", "monthly quota exhausted"));

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.status, TaskStatus::Fail);
    assert_eq!(result.error_code.as_deref(), Some("QUOTA"));
    assert!(result.task_id.is_none());
    assert_eq!(h.provider.poll_count(), 0);
    assert_eq!(h.ledger.creates.load(Ordering::SeqCst), 0);
    assert!(h.ledger.list(None).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_timeout_is_a_distinct_failure() {
    let policy = Policy {
        poll_timeout_ms: 5_000,
        ..Policy::default()
    };
    let h = harness_with(policy, ScriptedProvider::new(vec![processing(20)]), FakeRelocator::default());
    let started = Instant::now();

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.status, TaskStatus::Fail);
    assert_eq!(result.error_code.as_deref(), Some(codes::TIMEOUT));
    assert_eq!(result.progress, 20);
    assert!(result.error_message.is_some());
    assert!(started.elapsed() >= Duration::from_millis(5_000));

    let stored = h.ledger.get("task-1").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Fail);
    assert_eq!(stored.error_code.as_deref(), Some(codes::TIMEOUT));
}

#[tokio::test(start_paused = true)]
async fn poll_attempt_limit_ends_in_timeout() {
    let policy = Policy {
        max_poll_attempts: 3,
        ..Policy::default()
    };
    let h = harness_with(policy, ScriptedProvider::new(vec![processing(5)]), FakeRelocator::default());

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.error_code.as_deref(), Some(codes::TIMEOUT));
    assert_eq!(result.poll_count, 3);
    assert_eq!(h.provider.poll_count(), 3);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn relocation_failure_keeps_temporary_url() {
    let provider = ScriptedProvider::new(vec![processing(50), finish("https://cdn.provider.test/tmp/v.mp4", None)]);
    let h = harness_with(Policy::default(), provider, FakeRelocator::failing(&[MediaKind::Video]));

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.status, TaskStatus::Finish);
    assert_eq!(result.progress, 100);
    assert_eq!(result.media_url.as_deref(), Some("https://cdn.provider.test/tmp/v.mp4"));
    assert!(result.error_code.is_none());
    assert!(logs_contain("relocation failed"));

    let stored = h.ledger.get("task-1").await.unwrap().unwrap();
    assert_eq!(stored.media_url.as_deref(), Some("https://cdn.provider.test/tmp/v.mp4"));
}

#[tokio::test(start_paused = true)]
async fn cover_and_video_relocate_independently() {
    let provider = ScriptedProvider::new(vec![finish(
        "https://cdn.provider.test/tmp/v.mp4",
        Some("https://cdn.provider.test/tmp/c.png"),
    )]);
    let h = harness_with(Policy::default(), provider, FakeRelocator::failing(&[MediaKind::Cover]));

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.media_url.as_deref(), Some("https://storage.test/video/v.mp4"));
    assert_eq!(result.cover_url.as_deref(), Some("https://cdn.provider.test/tmp/c.png"));
    assert_eq!(h.relocator.calls.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn provider_failure_freezes_progress() {
    let provider = ScriptedProvider::new(vec![
        processing(30),
        processing(60),
        fail("CONTENT_FILTER", "prompt rejected by safety filter"),
    ]);
    let h = harness(provider);
    let (callback, seen) = recorder();

    let result = h.orchestrator.generate("video-1", &request(), Some(callback)).await;

    assert_eq!(result.status, TaskStatus::Fail);
    assert_eq!(result.progress, 60);
    assert_eq!(result.error_code.as_deref(), Some("CONTENT_FILTER"));
    assert_eq!(result.error_message.as_deref(), Some("prompt rejected by safety filter"));
    assert!(result.media_url.is_none());

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!((last.status, last.progress), (TaskStatus::Fail, 60));
    assert!(h.relocator.calls.lock().unwrap().is_empty());

    let stored = h.ledger.get("task-1").await.unwrap().unwrap();
    assert_eq!((stored.status, stored.progress), (TaskStatus::Fail, 60));
}

#[tokio::test(start_paused = true)]
async fn transient_poll_errors_are_retried() {
    let provider = ScriptedProvider::new(vec![
        processing(10),
        Step::Unavailable,
        Step::Unavailable,
        finish("https://cdn.provider.test/tmp/v.mp4", None),
    ]);
    let h = harness(provider);

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.status, TaskStatus::Finish);
    assert_eq!(result.poll_count, 4);
}

#[tokio::test(start_paused = true)]
async fn ledger_failures_do_not_change_the_outcome() {
    let h = harness(ScriptedProvider::new(vec![
        processing(40),
        finish("https://cdn.provider.test/tmp/v.mp4", None),
    ]));
    h.ledger.fail_writes.store(true, Ordering::SeqCst);

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.status, TaskStatus::Finish);
    assert_eq!(result.media_url.as_deref(), Some("https://storage.test/video/v.mp4"));
    assert!(h.ledger.list(None).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_model_is_rejected_before_admission() {
    let h = harness(ScriptedProvider::new(vec![processing(1)]));

    let result = h.orchestrator.generate("no-such-model", &request(), None).await;

    assert_eq!(result.error_code.as_deref(), Some(codes::UNKNOWN_MODEL));
    assert_eq!(h.provider.create_count(), 0);
}

// ── Session checks ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn invalid_session_never_reaches_the_provider() {
    let h = harness(ScriptedProvider::new(vec![processing(1)]));
    h.session.set_valid(false);

    let result = h.orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.error_code.as_deref(), Some(codes::AUTH_REQUIRED));
    assert_eq!(h.provider.create_count(), 0);
}

/// Admission that signs the user out while the request waits.
struct RevokingAdmission(Arc<ToggleSession>);

#[async_trait]
impl Admission for RevokingAdmission {
    async fn await_admission(&self, _group: &str) -> Result<Permit, GenerationError> {
        self.0.set_valid(false);
        Ok(Permit::new(()))
    }
}

#[tokio::test(start_paused = true)]
async fn session_is_rechecked_after_admission() {
    let h = harness(ScriptedProvider::new(vec![processing(1)]));
    let orchestrator = h
        .orchestrator
        .clone()
        .with_admission(Arc::new(RevokingAdmission(h.session.clone())));

    let result = orchestrator.generate("video-1", &request(), None).await;

    assert_eq!(result.error_code.as_deref(), Some(codes::AUTH_REQUIRED));
    assert_eq!(h.provider.create_count(), 0);
}

// ── Admission properties ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_tasks_never_exceed_group_limit() {
    let policy = Policy {
        max_concurrent: 2,
        ..Policy::default()
    };
    let provider = ScriptedProvider::new(vec![
        processing(10),
        processing(50),
        processing(90),
        finish("https://cdn.provider.test/tmp/v.mp4", None),
    ]);
    let h = harness_with(policy, provider, FakeRelocator::default());

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.generate("video-1", &request(), None).await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert_eq!(h.provider.create_count(), 5);
    assert_eq!(h.provider.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn creations_respect_group_cooldown() {
    let policy = Policy {
        max_concurrent: 5,
        cooldown_ms: 3_000,
        ..Policy::default()
    };
    let provider = ScriptedProvider::new(vec![finish("https://cdn.provider.test/tmp/v.mp4", None)]);
    let h = harness_with(policy, provider, FakeRelocator::default());

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.generate("video-1", &request(), None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let creates = h.provider.creates.lock().unwrap().clone();
    assert_eq!(creates.len(), 3);
    for pair in creates.windows(2) {
        assert!(
            pair[1].duration_since(pair[0]) >= Duration::from_millis(3_000),
            "creations {:?} apart",
            pair[1].duration_since(pair[0])
        );
    }
}

// ── Streams ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stream_runs_sequentially_and_completes_once() {
    let provider = ScriptedProvider::new(vec![processing(25), finish("https://cdn.provider.test/tmp/v.mp4", None)])
        .with_ids(&["s1", "s2", "s3"])
        .with_script("s2", vec![processing(15), fail("CONTENT_FILTER", "blocked")]);
    let h = harness(provider);

    let events = collect(h.orchestrator.generate_stream("video-1", request(), 3)).await;

    let indices: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Progress { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert!(indices.windows(2).all(|w| w[0] <= w[1]), "indices {indices:?}");
    assert_eq!(indices.first(), Some(&0));
    assert_eq!(indices.last(), Some(&2));

    let completes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Complete(summary) => Some(summary),
            _ => None,
        })
        .collect();
    assert_eq!(completes.len(), 1);
    assert!(matches!(events.last(), Some(StreamEvent::Complete(_))));

    let summary = completes[0];
    assert_eq!((summary.total, summary.succeeded, summary.failed), (3, 2, 1));
    assert!(summary.message.contains("1 failed"), "{}", summary.message);
    assert_eq!(summary.results[1].error_code.as_deref(), Some("CONTENT_FILTER"));
    assert_eq!(h.provider.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_counts_rejected_creations_as_failures() {
    let h = harness(ScriptedProvider::rejecting("QUOTA", "quota exhausted"));

    let events = collect(h.orchestrator.generate_stream("video-1", request(), 2)).await;

    match events.as_slice() {
        [StreamEvent::Complete(summary)] => {
            assert_eq!((summary.total, summary.failed), (2, 2));
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stream_aborts_when_session_is_lost() {
    let h = harness(ScriptedProvider::new(vec![processing(1)]));
    h.session.set_valid(false);

    let events = collect(h.orchestrator.generate_stream("video-1", request(), 3)).await;

    match events.as_slice() {
        [StreamEvent::Error { index: 0, code, .. }] => assert_eq!(code, codes::AUTH_REQUIRED),
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(h.provider.create_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_receiver_does_not_stop_work() {
    let h = harness(ScriptedProvider::new(vec![
        processing(50),
        finish("https://cdn.provider.test/tmp/v.mp4", None),
    ]));

    drop(h.orchestrator.generate_stream("video-1", request(), 2));
    tokio::time::sleep(Duration::from_secs(30)).await;

    let tasks = h.ledger.list(None).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Finish));
}

// ── Recovery ─────────────────────────────────────────────────────────────────

fn stored_task(task_id: &str, scope: &str, progress: u8) -> GenerationTask {
    let model = ModelSpec {
        id: "video-1".into(),
        group: "vendor".into(),
        remote_model: None,
        kind: Default::default(),
    };
    let mut task = GenerationTask::processing(task_id, None, &GenerationRequest::new(scope, "resumed"), &model);
    task.progress = progress;
    task
}

#[tokio::test(start_paused = true)]
async fn recovery_resumes_incomplete_tasks_once() {
    let provider = ScriptedProvider::new(vec![])
        .with_script("r1", vec![processing(70), finish("https://cdn.provider.test/tmp/r1.mp4", None)]);
    let h = harness(provider);
    h.ledger.create(&stored_task("r1", "chat-1", 40)).await.unwrap();
    h.ledger.create(&stored_task("r2", "chat-1", 10)).await.unwrap();
    h.ledger
        .mark_failed(
            "r2",
            &TaskFailure {
                error_code: "CONTENT_FILTER".into(),
                error_message: "blocked".into(),
                poll_count: 2,
                total_time_ms: 2_000,
                finished_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    let terminal_before = h.ledger.terminal_transitions.load(Ordering::SeqCst);

    let sweep = RecoverySweep::new(h.orchestrator.clone());
    let (callback, seen) = recorder();
    let first = sweep.run("chat-1", Some(callback)).await.unwrap();
    let second = sweep.run("chat-1", None).await.unwrap();

    assert_eq!(first.resumed, vec!["r1"]);
    assert!(second.resumed.is_empty());
    assert_eq!(second.skipped, vec!["r1"]);

    let results = first.join().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].media_url.as_deref(), Some("https://storage.test/video/r1.mp4"));
    assert_eq!(seen.lock().unwrap().last().map(|u| u.status), Some(TaskStatus::Finish));

    let third = sweep.run("chat-1", None).await.unwrap();
    assert!(third.resumed.is_empty() && third.skipped.is_empty());
    assert_eq!(h.provider.create_count(), 0);
    assert_eq!(h.ledger.terminal_transitions.load(Ordering::SeqCst), terminal_before + 1);
    assert_eq!(h.ledger.get("r2").await.unwrap().unwrap().status, TaskStatus::Fail);
}

#[tokio::test(start_paused = true)]
async fn recovery_marks_tasks_of_removed_models_failed() {
    let h = harness(ScriptedProvider::new(vec![]));
    let mut orphan = stored_task("o1", "chat-9", 30);
    orphan.model_id = "retired-model".into();
    h.ledger.create(&orphan).await.unwrap();

    let report = RecoverySweep::new(h.orchestrator.clone())
        .run("chat-9", None)
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].code, codes::UNKNOWN_MODEL);
    assert_eq!(h.ledger.get("o1").await.unwrap().unwrap().status, TaskStatus::Fail);
    assert_eq!(h.provider.poll_count(), 0);
}

#[tokio::test]
async fn resume_refuses_terminal_tasks() {
    let h = harness(ScriptedProvider::new(vec![]));
    let mut task = stored_task("done", "chat-1", 100);
    task.status = TaskStatus::Finish;

    let err = h.orchestrator.resume(task, None).unwrap_err();
    assert!(matches!(err, GenerationError::NotInProgress(id) if id == "done"));
}

#[tokio::test(start_paused = true)]
async fn resumed_progress_never_steps_back() {
    let provider = ScriptedProvider::new(vec![]).with_script(
        "r1",
        vec![processing(20), processing(60), finish("https://cdn.provider.test/tmp/r1.mp4", None)],
    );
    let h = harness(provider);
    let task = stored_task("r1", "chat-1", 40);
    h.ledger.create(&task).await.unwrap();
    let (callback, seen) = recorder();

    let result = h.orchestrator.resume(task, Some(callback)).unwrap().await.unwrap();

    assert!(result.is_success());
    let progress: Vec<_> = seen.lock().unwrap().iter().map(|u| (u.status, u.progress)).collect();
    assert_eq!(
        progress,
        vec![
            (TaskStatus::Processing, 40),
            (TaskStatus::Processing, 60),
            (TaskStatus::Finish, 100),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn resumed_task_keeps_earlier_poll_count() {
    let provider = ScriptedProvider::new(vec![])
        .with_script("r1", vec![processing(50), finish("https://cdn.provider.test/tmp/r1.mp4", None)]);
    let h = harness(provider);
    h.ledger.create(&stored_task("r1", "chat-1", 0)).await.unwrap();
    h.ledger.update_progress("r1", 30, 3).await.unwrap();

    let report = RecoverySweep::new(h.orchestrator.clone())
        .run("chat-1", None)
        .await
        .unwrap();
    let results = report.join().await;

    assert_eq!(results[0].poll_count, 5);
    let stored = h.ledger.get("r1").await.unwrap().unwrap();
    assert_eq!((stored.status, stored.poll_count), (TaskStatus::Finish, 5));
}
