//! Per-thread cooperative executor on top of the host's task queues.
//!
//! An [`Executor`] does no scheduling of its own: every job is handed to the
//! [`Scheduler`] installed for its thread, which posts it to the host event
//! loop as a microtask or a timer.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::runtime::error::{ProtocolMisuse, fatal};

/// A deferred unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The host's scheduling capability for one thread.
pub trait Scheduler: Send + Sync {
    /// Run `job` at the next microtask checkpoint, after earlier microtasks.
    fn queue_microtask(&self, job: Job);

    /// Run `job` on a later tick, no sooner than `delay_ms` from now.
    fn set_timeout(&self, delay_ms: f64, job: Job);

    /// Monotonic time since the host loop started.
    fn now(&self) -> Duration;
}

pub struct Executor {
    name: String,
    scheduler: OnceLock<Arc<dyn Scheduler>>,
    pub(crate) id_gen: AtomicU64,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl Executor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheduler: OnceLock::new(),
            id_gen: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route this executor's jobs through `scheduler`. Only the first call
    /// takes effect; returns whether it was this one.
    pub fn install(&self, scheduler: Arc<dyn Scheduler>) -> bool {
        let installed = self.scheduler.set(scheduler).is_ok();
        if installed {
            crate::bridge_trace!("executor", "installed on `{}`", self.name);
        }
        installed
    }

    pub fn is_installed(&self) -> bool {
        self.scheduler.get().is_some()
    }

    #[track_caller]
    fn scheduler(&self) -> &Arc<dyn Scheduler> {
        match self.scheduler.get() {
            Some(s) => s,
            None => fatal(ProtocolMisuse::NotInstalled {
                thread: self.name.clone(),
            }),
        }
    }

    /// Post `job` as a microtask. FIFO with respect to other `enqueue` calls.
    #[track_caller]
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler().queue_microtask(Box::new(job));
    }

    /// Post `job` as a host timer. The delay is truncated to whole
    /// milliseconds; zero still waits for a later tick.
    #[track_caller]
    pub fn enqueue_after<F>(&self, job: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay_ms = delay.as_millis() as f64;
        self.scheduler().set_timeout(delay_ms, Box::new(job));
    }

    /// Post `job` for a deadline on the host's monotonic clock. A deadline
    /// already in the past behaves like a zero delay.
    #[track_caller]
    pub fn enqueue_at<F>(&self, job: F, deadline: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.scheduler().now();
        self.enqueue_after(job, deadline.saturating_sub(now));
    }

    /// Current time on the installed scheduler's clock.
    #[track_caller]
    pub fn now(&self) -> Duration {
        self.scheduler().now()
    }
}
