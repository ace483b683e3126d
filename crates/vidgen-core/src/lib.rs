//! vidgen-core – asynchronous video generation orchestration.
//!
//! Drives remote generation tasks from admission through polling to
//! relocation of the finished media, persisting every status transition to a
//! [`TaskLedger`] so that interrupted tasks can be resumed by a
//! [`RecoverySweep`].
//!
//! All collaborators (provider API, media relocation, ledger, identity,
//! object storage) are traits injected at construction; nothing in this crate
//! keeps process-global state.

pub mod config;
pub mod ledger;
pub mod provider;
pub mod relocator;
pub mod session;
pub mod storage;

mod runtime;

pub use config::{ConfigError, GenerationConfig, GroupPolicy, ModelSpec, OutputKind, RelocationConfig};
pub use ledger::{best_effort, LedgerError, MemoryLedger, TaskCompletion, TaskFailure, TaskLedger};
pub use provider::{
    CreatedTask, HttpProviderClient, PollOutcome, PollPolicy, PollReport, ProviderClient,
    ProviderError, ProviderStatus, StatusObserver,
};
pub use relocator::{MediaKind, MediaRelocator, RelocationError, Relocator};
pub use runtime::admission::{Admission, Permit, PollingAdmission, ADMISSION_POLL_INTERVAL};
pub use runtime::orchestrator::{Orchestrator, StreamEvent, StreamHandle, StreamSummary};
pub use runtime::recovery::{RecoverySweep, SweepFailure, SweepReport};
pub use runtime::types::{
    codes, GenerationError, GenerationRequest, GenerationResult, GenerationTask, ProgressFn,
    TaskStatus, TaskUpdate,
};
pub use session::{Session, SessionProvider, StaticSession};
pub use storage::{HttpObjectStorage, LocalDirStorage, ObjectStorage, StorageError};
