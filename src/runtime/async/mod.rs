//! Cooperative scheduling on the host's event loop.
//!
//! - `executor`: the per-thread [`Executor`] and the [`Scheduler`] capability it routes through
//! - `host_loop`: the in-process host event loop implementing [`Scheduler`]
//! - `task`: futures spawned as tasks, join handles and timer sleeps
//! - `registry`: thread-indexed lookup of executors
//! - `promise`: host promises and guest-side awaiting

pub mod executor;
pub mod host_loop;
pub mod promise;
pub mod registry;
pub mod task;

pub use executor::{Executor, Job, Scheduler};
pub use host_loop::{HostLoop, KeepAlive, LoopHandle};
pub use promise::{HostPromise, JsPromise, Outcome};
pub use registry::ExecutorRegistry;
pub use task::{JoinError, JoinHandle, Sleep, Task, sleep};
pub use task::{TASK_COMPLETED, TASK_IDLE, TASK_NOTIFIED, TASK_RUNNING, TASK_SCHEDULED};
