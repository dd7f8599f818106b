//! In-process model of a host event loop.
//!
//! Each thread that runs guest code owns one [`HostLoop`]. It keeps a FIFO
//! microtask queue and a timer heap ordered by due time (ties in submission
//! order), and drains all microtasks after every timer it fires. Work posted
//! from other threads lands in an injector and wakes the loop.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal};
use parking::{Parker, Unparker};

use super::executor::{Job, Scheduler};
use crate::runtime::value::lock;

struct TimerEntry {
    due: Duration,
    seq: u64,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap, the earliest entry must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LoopShared {
    owner: ThreadId,
    origin: Instant,
    microtasks: Mutex<VecDeque<Job>>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    timer_seq: AtomicU64,
    inbox: Injector<Job>,
    unparker: Unparker,
    keep_alive: AtomicUsize,
    shutdown: AtomicBool,
}

impl LoopShared {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn on_owner(&self) -> bool {
        thread::current().id() == self.owner
    }
}

/// A thread's event loop. Run it on the thread that created it.
pub struct HostLoop {
    shared: Arc<LoopShared>,
    parker: Parker,
}

/// Cloneable, thread-safe access to a [`HostLoop`]'s queues.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

/// Keeps a loop from going idle until dropped.
pub struct KeepAlive {
    shared: Arc<LoopShared>,
}

impl Default for HostLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLoop")
            .field("owner", &self.shared.owner)
            .field("keep_alive", &self.shared.keep_alive.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HostLoop {
    pub fn new() -> Self {
        let (parker, unparker) = parking::pair();
        Self {
            shared: Arc::new(LoopShared {
                owner: thread::current().id(),
                origin: Instant::now(),
                microtasks: Mutex::new(VecDeque::new()),
                timers: Mutex::new(BinaryHeap::new()),
                timer_seq: AtomicU64::new(0),
                inbox: Injector::new(),
                unparker,
                keep_alive: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
            parker,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// This loop as an executor [`Scheduler`].
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::new(self.handle())
    }

    /// Run until no microtask, timer, inbox message or keep-alive guard is
    /// left, or until shutdown is requested.
    pub fn run_until_idle(&self) {
        self.run(false);
    }

    /// Run until [`LoopHandle::shutdown`] is called, waiting when idle.
    pub fn run_until_shutdown(&self) {
        self.run(true);
    }

    /// Run every microtask queued so far, including those they queue.
    pub fn perform_microtask_checkpoint(&self) -> usize {
        self.drain_inbox();
        let mut ran = 0;
        loop {
            let job = lock(&self.shared.microtasks).pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => break,
            }
            self.drain_inbox();
        }
        ran
    }

    fn drain_inbox(&self) {
        loop {
            match self.shared.inbox.steal() {
                Steal::Success(job) => lock(&self.shared.microtasks).push_back(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    /// Fire the earliest timer if it is due.
    fn fire_due_timer(&self) -> bool {
        let now = self.shared.now();
        let entry = {
            let mut timers = lock(&self.shared.timers);
            match timers.peek() {
                Some(entry) if entry.due <= now => timers.pop(),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                (entry.job)();
                true
            }
            None => false,
        }
    }

    fn next_due(&self) -> Option<Duration> {
        lock(&self.shared.timers).peek().map(|e| e.due)
    }

    fn run(&self, until_shutdown: bool) {
        loop {
            self.perform_microtask_checkpoint();
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if self.fire_due_timer() {
                continue;
            }
            // Read the guard count first: work posted before a guard drops must be seen.
            let held = self.shared.keep_alive.load(Ordering::Acquire) > 0;
            if !self.shared.inbox.is_empty() {
                continue;
            }

            let next_due = self.next_due();
            if !until_shutdown && next_due.is_none() && !held {
                break;
            }
            match next_due {
                Some(due) => {
                    let now = self.shared.now();
                    if due > now {
                        self.parker.park_timeout(due - now);
                    }
                }
                None => self.parker.park(),
            }
        }
    }
}

impl LoopHandle {
    /// Request the loop to stop at its next turn.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.unparker.unpark();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Hold the loop open until the guard is dropped.
    pub fn keep_alive(&self) -> KeepAlive {
        self.shared.keep_alive.fetch_add(1, Ordering::AcqRel);
        KeepAlive {
            shared: self.shared.clone(),
        }
    }

    pub fn is_owner_thread(&self) -> bool {
        self.shared.on_owner()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("owner", &self.shared.owner)
            .finish_non_exhaustive()
    }
}

impl Scheduler for LoopHandle {
    fn queue_microtask(&self, job: Job) {
        if self.shared.on_owner() {
            lock(&self.shared.microtasks).push_back(job);
        } else {
            self.shared.inbox.push(job);
            self.shared.unparker.unpark();
        }
    }

    fn set_timeout(&self, delay_ms: f64, job: Job) {
        let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
            Duration::from_millis(delay_ms as u64)
        } else {
            Duration::ZERO
        };
        let entry = TimerEntry {
            due: self.shared.now() + delay,
            seq: self.shared.timer_seq.fetch_add(1, Ordering::Relaxed),
            job,
        };
        lock(&self.shared.timers).push(entry);
        if !self.shared.on_owner() {
            self.shared.unparker.unpark();
        }
    }

    fn now(&self) -> Duration {
        self.shared.now()
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.shared.keep_alive.fetch_sub(1, Ordering::AcqRel);
        self.shared.unparker.unpark();
    }
}
