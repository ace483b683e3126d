use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::GenerationConfig;
use crate::runtime::types::GenerationError;

/// Re-check interval of [`PollingAdmission`].
pub const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// RAII guard for one admitted request.
///
/// Holding it keeps a concurrency slot of the group occupied; dropping it
/// releases the slot.
pub struct Permit {
    _guard: Box<dyn Any + Send>,
}

impl Permit {
    /// Wrap whatever guard an [`Admission`] implementation releases on drop.
    pub fn new(guard: impl Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Group admission control.
///
/// `await_admission` suspends until the group has a free concurrency slot and
/// its cooldown since the previous admission has elapsed.
#[async_trait]
pub trait Admission: Send + Sync {
    async fn await_admission(&self, group: &str) -> Result<Permit, GenerationError>;
}

struct GroupSlots {
    capacity: usize,
    cooldown: Duration,
    semaphore: Arc<Semaphore>,
    last_admitted: Mutex<Option<Instant>>,
}

/// Busy-poll admission: re-checks both conditions every `interval`.
///
/// Waiters are not queued. Whichever waiter re-checks first after a slot
/// frees up gets it.
#[derive(Clone)]
pub struct PollingAdmission {
    groups: Arc<HashMap<String, GroupSlots>>,
    interval: Duration,
}

impl std::fmt::Debug for PollingAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingAdmission")
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("interval", &self.interval)
            .finish()
    }
}

impl PollingAdmission {
    pub fn new(config: &GenerationConfig) -> Self {
        let groups = config
            .groups
            .iter()
            .map(|(name, group)| {
                let capacity = group.policy.max_concurrent;
                let slots = GroupSlots {
                    capacity,
                    cooldown: group.policy.cooldown(),
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    last_admitted: Mutex::new(None),
                };
                (name.clone(), slots)
            })
            .collect();
        Self {
            groups: Arc::new(groups),
            interval: ADMISSION_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One admission attempt. `Ok(None)` means "not yet".
    ///
    /// The cooldown check, slot acquisition and timestamp update happen under
    /// one lock, so two waiters cannot both pass the same check.
    pub fn try_admit(&self, group: &str) -> Result<Option<Permit>, GenerationError> {
        let slots = self
            .groups
            .get(group)
            .ok_or_else(|| GenerationError::UnknownGroup(group.to_owned()))?;

        let mut last = slots
            .last_admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < slots.cooldown) {
            return Ok(None);
        }
        let Ok(permit) = slots.semaphore.clone().try_acquire_owned() else {
            return Ok(None);
        };
        *last = Some(now);
        Ok(Some(Permit::new(permit)))
    }

    /// Requests currently holding a slot in `group`.
    pub fn active_count(&self, group: &str) -> Option<usize> {
        self.groups
            .get(group)
            .map(|slots| slots.capacity - slots.semaphore.available_permits())
    }
}

#[async_trait]
impl Admission for PollingAdmission {
    async fn await_admission(&self, group: &str) -> Result<Permit, GenerationError> {
        let mut waits = 0u32;
        loop {
            if let Some(permit) = self.try_admit(group)? {
                debug!(group, waits, active = self.active_count(group), "admitted");
                return Ok(permit);
            }
            waits += 1;
            trace!(group, waits, "waiting for admission");
            tokio::time::sleep(self.interval).await;
        }
    }
}
