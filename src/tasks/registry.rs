use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, TaskError};
use crate::tasks::catalog::{TaskArgs, TaskContext, TaskFn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    AlreadyRunning,
    /// A retryable failure asked for a pause; nothing runs before this instant.
    Deferred(Instant),
    SpawnFailed(String),
}

#[derive(Default)]
struct Slot {
    handle: Option<JoinHandle<Result<(), TaskError>>>,
    not_before: Option<Instant>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// At most one live execution per task name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    slots: Slots,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `task` on its own thread unless an execution with this name
    /// is still alive. Liveness check, eviction and insert share one lock.
    pub fn run_if_idle(&self, context: TaskContext, task: TaskFn, args: TaskArgs) -> Dispatch {
        let Ok(mut slots) = self.slots.lock() else {
            return Dispatch::SpawnFailed("task registry lock poisoned".to_string());
        };
        let name = context.name.clone();
        let slot = slots.entry(name.clone()).or_default();
        if slot
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return Dispatch::AlreadyRunning;
        }
        if let Some(handle) = slot.handle.take() {
            if handle.join().is_err() {
                log::error!("task {name} panicked");
            }
        }
        if let Some(not_before) = slot.not_before {
            if Instant::now() < not_before {
                return Dispatch::Deferred(not_before);
            }
            slot.not_before = None;
        }

        let slots_for_task = Arc::clone(&self.slots);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let result = task(&context, &args);
            settle(&context.name, result, &slots_for_task)
        });
        match spawned {
            Ok(handle) => {
                slot.handle = Some(handle);
                log::debug!("task {name} started");
                Dispatch::Started
            }
            Err(err) => {
                log::error!("task {name} could not start: {err}");
                Dispatch::SpawnFailed(err.to_string())
            }
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .get(name)
                    .and_then(|slot| slot.handle.as_ref())
                    .is_some_and(|handle| !handle.is_finished())
            })
            .unwrap_or(false)
    }

    pub fn running(&self) -> Vec<String> {
        let Ok(slots) = self.slots.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Waits up to `timeout` for every execution to finish.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.running().is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Task boundary: applies the retry policy to a finished execution.
///
/// Retryable failures end the run quietly and defer the next one by the
/// kind's backoff; Fatal failures are returned as the thread's result;
/// anything unclassified only ends this run.
pub(crate) fn settle(name: &str, result: Result<(), TaskError>, slots: &Slots) -> Result<(), TaskError> {
    let err = match result {
        Ok(()) => {
            log::info!("task {name} finished");
            return Ok(());
        }
        Err(err) => err,
    };
    let kind = err.kind();
    match &kind {
        ErrorKind::Retryable(_) => {
            let backoff = kind.backoff().unwrap_or(Duration::ZERO);
            log::warn!("task {name}: {kind}; next run in {}s", backoff.as_secs());
            if let Ok(mut slots) = slots.lock() {
                slots.entry(name.to_string()).or_default().not_before = Some(Instant::now() + backoff);
            }
            Ok(())
        }
        ErrorKind::Fatal(_) => {
            log::error!("task {name} aborted: {kind} ({err})");
            Err(err)
        }
        ErrorKind::Unclassified => {
            log::error!("task {name} failed: {err}");
            Ok(())
        }
    }
}
