use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::tasks::catalog::{TaskArgs, TaskCatalog, TaskContext};
use crate::tasks::registry::{Dispatch, TaskRegistry};
use crate::tasks::shutdown::Shutdown;

const DEFAULT_TICK: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job '{0}' names no registered task")]
    UnknownTask(String),
    #[error("job '{name}' has an invalid interval {min}..{max} minutes")]
    InvalidInterval { name: String, min: u64, max: u64 },
    #[error("failed to start infrastructure task '{name}': {reason}")]
    Spawn { name: String, reason: String },
    #[error("infrastructure task '{name}' failed: {kind}")]
    InfrastructureFailed { name: String, kind: ErrorKind },
}

/// Trigger window in whole minutes; each fire is drawn uniformly from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalRange {
    min_minutes: u64,
    max_minutes: u64,
}

impl IntervalRange {
    pub fn new(min_minutes: u64, max_minutes: u64) -> Option<Self> {
        if max_minutes == 0 || min_minutes > max_minutes {
            return None;
        }
        Some(Self {
            min_minutes,
            max_minutes,
        })
    }

    pub fn min_minutes(&self) -> u64 {
        self.min_minutes
    }

    pub fn max_minutes(&self) -> u64 {
        self.max_minutes
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        let secs = rng.gen_range(self.min_minutes * 60..=self.max_minutes * 60);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub min_minutes: u64,
    pub max_minutes: u64,
    pub args: TaskArgs,
}

#[derive(Debug)]
struct Job {
    name: String,
    interval: IntervalRange,
    args: TaskArgs,
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    due: Instant,
    seq: u64,
    job: usize,
}

/// Min-heap by due instant (earliest first)
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

#[derive(Debug, Default)]
struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
    seq: u64,
}

impl JobQueue {
    fn push(&mut self, due: Instant, job: usize) {
        self.seq += 1;
        self.heap.push(QueueEntry {
            due,
            seq: self.seq,
            job,
        });
    }

    fn pop_due(&mut self, now: Instant) -> Option<usize> {
        if self.heap.peek()?.due > now {
            return None;
        }
        self.heap.pop().map(|entry| entry.job)
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.due)
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

#[derive(Debug)]
struct InfrastructureFailure {
    name: String,
    kind: ErrorKind,
}

/// Named jobs fired on jittered intervals, each behind the task boundary.
pub struct Scheduler {
    catalog: TaskCatalog,
    registry: TaskRegistry,
    shutdown: Shutdown,
    jobs: Vec<Job>,
    queue: JobQueue,
    rng: SmallRng,
    tick_interval: Duration,
    fatal_tx: Sender<InfrastructureFailure>,
    fatal_rx: Receiver<InfrastructureFailure>,
    infrastructure: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(catalog: TaskCatalog, shutdown: Shutdown) -> Self {
        Self::with_rng(catalog, shutdown, SmallRng::from_entropy())
    }

    pub fn with_seed(catalog: TaskCatalog, shutdown: Shutdown, seed: u64) -> Self {
        Self::with_rng(catalog, shutdown, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(catalog: TaskCatalog, shutdown: Shutdown, rng: SmallRng) -> Self {
        let (fatal_tx, fatal_rx) = unbounded();
        Self {
            catalog,
            registry: TaskRegistry::new(),
            shutdown,
            jobs: Vec::new(),
            queue: JobQueue::default(),
            rng,
            tick_interval: DEFAULT_TICK,
            fatal_tx,
            fatal_rx,
            infrastructure: Vec::new(),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.name.clone()).collect()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.next_due()
    }

    /// Validates and registers a job; its first fire is one interval from now.
    pub fn schedule_job(&mut self, spec: JobSpec) -> Result<(), SchedulerError> {
        if !self.catalog.contains(&spec.name) {
            return Err(SchedulerError::UnknownTask(spec.name));
        }
        let interval = IntervalRange::new(spec.min_minutes, spec.max_minutes).ok_or_else(|| {
            SchedulerError::InvalidInterval {
                name: spec.name.clone(),
                min: spec.min_minutes,
                max: spec.max_minutes,
            }
        })?;
        let idx = self.jobs.len();
        let due = Instant::now() + interval.sample(&mut self.rng);
        log::info!(
            "scheduled job {} every {}-{} minutes",
            spec.name,
            interval.min_minutes(),
            interval.max_minutes()
        );
        self.jobs.push(Job {
            name: spec.name,
            interval,
            args: spec.args,
        });
        self.queue.push(due, idx);
        Ok(())
    }

    /// Fires every job once now and restarts all trigger windows.
    pub fn run_all(&mut self) -> Vec<(String, Dispatch)> {
        let now = Instant::now();
        self.queue.clear();
        let mut dispatched = Vec::with_capacity(self.jobs.len());
        for idx in 0..self.jobs.len() {
            dispatched.push(self.fire(idx, now));
        }
        dispatched
    }

    /// Dispatches every job due at `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<(String, Dispatch)> {
        let mut dispatched = Vec::new();
        while let Some(idx) = self.queue.pop_due(now) {
            dispatched.push(self.fire(idx, now));
        }
        dispatched
    }

    fn fire(&mut self, idx: usize, now: Instant) -> (String, Dispatch) {
        let job = &self.jobs[idx];
        let name = job.name.clone();
        let next = now + job.interval.sample(&mut self.rng);
        let dispatch = match self.catalog.get(&name) {
            Some(task) => {
                let context = TaskContext {
                    name: name.clone(),
                    shutdown: self.shutdown.clone(),
                };
                self.registry.run_if_idle(context, task, job.args.clone())
            }
            None => Dispatch::SpawnFailed(format!("task {name} is not registered")),
        };
        match &dispatch {
            Dispatch::Started => log::info!("job {name} dispatched"),
            Dispatch::AlreadyRunning => log::debug!("job {name} still running; skipped"),
            Dispatch::Deferred(at) => log::info!(
                "job {name} deferred for another {}s",
                at.saturating_duration_since(now).as_secs()
            ),
            Dispatch::SpawnFailed(reason) => log::error!("job {name} not dispatched: {reason}"),
        }
        self.queue.push(next, idx);
        (name, dispatch)
    }

    /// Starts a long-lived task. A Fatal failure from it stops the scheduler
    /// and makes [`Scheduler::run`] return an error.
    pub fn spawn_infrastructure(&mut self, name: &str, args: TaskArgs) -> Result<(), SchedulerError> {
        let task = self
            .catalog
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        let context = TaskContext {
            name: name.to_string(),
            shutdown: self.shutdown.clone(),
        };
        let fatal_tx = self.fatal_tx.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let name = context.name.clone();
                match task(&context, &args) {
                    Ok(()) => log::info!("infrastructure task {name} stopped"),
                    Err(err) => {
                        let kind = err.kind();
                        if kind.is_fatal() {
                            log::error!("infrastructure task {name} aborted: {kind} ({err})");
                            let _ = fatal_tx.send(InfrastructureFailure { name, kind });
                            context.shutdown.request_fatal();
                        } else {
                            log::error!("infrastructure task {name} ended: {err}");
                        }
                    }
                }
            })
            .map_err(|err| SchedulerError::Spawn {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        log::info!("infrastructure task {name} started");
        self.infrastructure.push(handle);
        Ok(())
    }

    /// Blocking run loop; returns once shutdown is requested.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        let watch = self.shutdown.watch();
        let fatal_rx = self.fatal_rx.clone();
        let mut failure = None;
        while self.shutdown.is_running() {
            self.tick(Instant::now());
            select! {
                recv(watch) -> _ => break,
                recv(fatal_rx) -> message => {
                    failure = message.ok();
                    break;
                }
                default(self.tick_interval) => {}
            }
        }
        self.shutdown.request();
        log::info!("scheduler stopping");

        if !self.registry.wait_idle(DRAIN_TIMEOUT) {
            log::warn!("tasks still running at shutdown: {:?}", self.registry.running());
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.infrastructure.iter().any(|handle| !handle.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        for handle in self.infrastructure.drain(..) {
            if handle.is_finished() && handle.join().is_err() {
                log::error!("infrastructure task panicked");
            }
        }

        match failure.or_else(|| self.fatal_rx.try_recv().ok()) {
            Some(InfrastructureFailure { name, kind }) => {
                Err(SchedulerError::InfrastructureFailed { name, kind })
            }
            None => Ok(()),
        }
    }
}
