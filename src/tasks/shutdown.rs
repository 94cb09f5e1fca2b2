use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Running = 0,
    Requested = 1,
    Fatal = 2,
}

#[derive(Debug)]
struct ShutdownInner {
    signal: AtomicU8,
    // Dropped on shutdown; every watcher then sees a disconnected channel.
    guard: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
}

/// Process-wide stop signal shared by the scheduler, its tasks and scans.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (guard, watch) = bounded(0);
        Self {
            inner: Arc::new(ShutdownInner {
                signal: AtomicU8::new(ShutdownSignal::Running as u8),
                guard: Mutex::new(Some(guard)),
                watch,
            }),
        }
    }

    pub fn request(&self) {
        self.trigger(ShutdownSignal::Requested);
    }

    /// Shutdown caused by a fatal infrastructure failure.
    pub fn request_fatal(&self) {
        self.trigger(ShutdownSignal::Fatal);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.current_signal(), ShutdownSignal::Running)
    }

    pub fn current_signal(&self) -> ShutdownSignal {
        match self.inner.signal.load(Ordering::SeqCst) {
            2 => ShutdownSignal::Fatal,
            1 => ShutdownSignal::Requested,
            _ => ShutdownSignal::Running,
        }
    }

    /// Receiver that never yields a value and disconnects on shutdown;
    /// meant for `select!` arms.
    pub fn watch(&self) -> Receiver<()> {
        self.inner.watch.clone()
    }

    fn trigger(&self, signal: ShutdownSignal) {
        // Fatal wins over a plain request.
        let _ = self.inner.signal.fetch_max(signal as u8, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.guard.lock() {
            guard.take();
        }
    }
}
