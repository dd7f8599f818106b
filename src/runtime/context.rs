//! The explicit runtime context.
//!
//! A [`BridgeRuntime`] owns everything shared between threads: configuration,
//! negotiated features, the import table, the executor registry, the table of
//! attached threads and the pending transfer continuations. Each thread that
//! runs guest code attaches once and gets a [`ThreadContext`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
#[cfg(feature = "multithreaded")]
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::r#async::executor::Executor;
use super::r#async::host_loop::{HostLoop, LoopHandle};
use super::r#async::registry::ExecutorRegistry;
use super::r#async::task::{JoinHandle, Sleep, sleep};
use super::abi::{LibraryFeatures, WireValue};
use super::bridged::{DynValue, HostRef};
use super::config::{ConfigError, RuntimeConfig};
use super::error::{BridgeError, ThreadIndex};
use super::realm::{ImportTable, Realm};
use super::transfer::{Continuation, Transferring};
use super::value::{HostValue, lock};

struct ThreadEntry {
    realm: Arc<Realm>,
    loop_handle: LoopHandle,
}

/// A `receive` waiting on its source thread.
struct PendingTransfer {
    source: ThreadIndex,
    destination: ThreadIndex,
    reply: Continuation,
}

struct RuntimeShared {
    config: RuntimeConfig,
    features: LibraryFeatures,
    imports: ImportTable,
    executors: ExecutorRegistry,
    threads: Mutex<HashMap<ThreadIndex, ThreadEntry>>,
    transfers: Mutex<HashMap<u64, PendingTransfer>>,
    next_thread: AtomicU32,
    next_correlation: AtomicU64,
}

#[derive(Clone)]
pub struct BridgeRuntime {
    shared: Arc<RuntimeShared>,
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

/// The context attached on the calling thread, if any.
pub fn current() -> Option<ThreadContext> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Run `f` with the calling thread's context.
pub fn with_current<R>(f: impl FnOnce(&ThreadContext) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow().as_ref().map(f))
}

impl fmt::Debug for BridgeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeRuntime")
            .field("features", &self.shared.features)
            .field("threads", &self.thread_count())
            .finish_non_exhaustive()
    }
}

impl BridgeRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        if config.trace {
            super::trace::set_enabled(true);
        }
        let features = LibraryFeatures::negotiate(config.weak_refs);
        crate::bridge_trace!(
            "runtime",
            "object space {}, features {:?}",
            config.object_space,
            features
        );
        Self {
            shared: Arc::new(RuntimeShared {
                config,
                features,
                imports: ImportTable::new(),
                executors: ExecutorRegistry::new(),
                threads: Mutex::new(HashMap::new()),
                transfers: Mutex::new(HashMap::new()),
                next_thread: AtomicU32::new(0),
                next_correlation: AtomicU64::new(1),
            }),
        }
    }

    /// A runtime configured from `HOSTBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(RuntimeConfig::from_env()?))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn features(&self) -> LibraryFeatures {
        self.shared.features
    }

    pub fn imports(&self) -> &ImportTable {
        &self.shared.imports
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.shared.executors
    }

    /// Register a host import visible to every realm of this runtime.
    pub fn register_import<F>(&self, name: &str, f: F)
    where
        F: Fn(&Realm, &[WireValue]) -> Result<WireValue, HostValue> + Send + Sync + 'static,
    {
        self.shared.imports.register(name, f);
    }

    /// Give the calling thread a realm and an executor driven by `host_loop`.
    pub fn attach_current_thread(&self, host_loop: &HostLoop) -> ThreadContext {
        let thread = ThreadIndex(self.shared.next_thread.fetch_add(1, Ordering::Relaxed));
        let scheduler = host_loop.scheduler();
        let realm = Realm::new(
            thread,
            &self.shared.config,
            self.shared.features,
            self.shared.imports.clone(),
            scheduler.clone(),
        );
        let executor = self.shared.executors.current();
        executor.install(scheduler);

        let loop_handle = host_loop.handle();
        lock(&self.shared.threads).insert(
            thread,
            ThreadEntry {
                realm: realm.clone(),
                loop_handle: loop_handle.clone(),
            },
        );

        let cx = ThreadContext {
            runtime: self.clone(),
            thread,
            realm,
            executor,
            loop_handle,
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(cx.clone()));
        crate::bridge_trace!("runtime", "attached {}", thread);
        cx
    }

    pub fn thread_count(&self) -> usize {
        lock(&self.shared.threads).len()
    }

    pub fn is_attached(&self, thread: ThreadIndex) -> bool {
        lock(&self.shared.threads).contains_key(&thread)
    }

    pub(crate) fn thread_entry(&self, thread: ThreadIndex) -> Option<(Arc<Realm>, LoopHandle)> {
        lock(&self.shared.threads)
            .get(&thread)
            .map(|e| (e.realm.clone(), e.loop_handle.clone()))
    }

    pub(crate) fn next_correlation(&self) -> u64 {
        self.shared.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Park `reply` until `source` serves the request. Hands `reply` back if
    /// `source` is no longer attached.
    pub(crate) fn register_continuation(
        &self,
        correlation: u64,
        source: ThreadIndex,
        destination: ThreadIndex,
        reply: Continuation,
    ) -> Result<(), Continuation> {
        let threads = lock(&self.shared.threads);
        if !threads.contains_key(&source) {
            return Err(reply);
        }
        lock(&self.shared.transfers).insert(
            correlation,
            PendingTransfer {
                source,
                destination,
                reply,
            },
        );
        Ok(())
    }

    pub(crate) fn take_continuation(&self, correlation: u64) -> Option<(ThreadIndex, Continuation)> {
        lock(&self.shared.transfers)
            .remove(&correlation)
            .map(|p| (p.destination, p.reply))
    }

    /// Transfers whose continuation is registered but not yet taken.
    pub fn pending_transfers(&self) -> usize {
        lock(&self.shared.transfers).len()
    }

    /// Remove `thread` and fail every transfer still waiting on it.
    fn remove_thread(&self, thread: ThreadIndex) {
        let orphaned: Vec<PendingTransfer> = {
            let mut threads = lock(&self.shared.threads);
            threads.remove(&thread);
            let mut transfers = lock(&self.shared.transfers);
            let ids: Vec<u64> = transfers
                .iter()
                .filter(|(_, p)| p.source == thread || p.destination == thread)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| transfers.remove(&id)).collect()
        };
        for pending in orphaned {
            if pending.source == thread {
                let _ = pending.reply.send(Err(BridgeError::ThreadUnavailable(thread)));
            }
        }
    }

    /// Start a named worker thread with its own host loop, realm and
    /// executor. `f` runs on the worker before its loop starts; the loop then
    /// runs until the worker is terminated.
    #[cfg(feature = "multithreaded")]
    pub fn spawn_worker<F>(&self, f: F) -> io::Result<WorkerHandle>
    where
        F: FnOnce(ThreadContext) + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        let runtime = self.clone();
        let ordinal = self.thread_count();
        let name = format!("{}-{}", self.shared.config.worker_name_prefix, ordinal);

        let thread = thread::Builder::new().name(name).spawn(move || {
            let host_loop = HostLoop::new();
            let cx = runtime.attach_current_thread(&host_loop);
            let _ = tx.send((cx.thread(), host_loop.handle()));
            crate::bridge_trace!("worker", "{} started", cx.thread());

            f(cx.clone());
            host_loop.run_until_shutdown();

            crate::bridge_trace!("worker", "{} stopped", cx.thread());
            cx.detach();
        })?;

        let (index, loop_handle) = rx
            .recv()
            .map_err(|_| io::Error::other("worker exited before attaching"))?;
        Ok(WorkerHandle {
            index,
            loop_handle,
            thread: Some(thread),
        })
    }
}

/// Per-thread view of a [`BridgeRuntime`].
#[derive(Clone)]
pub struct ThreadContext {
    runtime: BridgeRuntime,
    thread: ThreadIndex,
    realm: Arc<Realm>,
    executor: Arc<Executor>,
    loop_handle: LoopHandle,
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("thread", &self.thread)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ThreadContext {
    pub fn runtime(&self) -> &BridgeRuntime {
        &self.runtime
    }

    pub fn thread(&self) -> ThreadIndex {
        self.thread
    }

    pub fn realm(&self) -> &Arc<Realm> {
        &self.realm
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Spawn a task on this thread's executor.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.executor.spawn(future)
    }

    pub fn sleep(&self, duration: Duration) -> Sleep {
        sleep(&self.executor, duration)
    }

    /// Retain `value` in this thread's realm.
    pub fn retain(&self, value: HostValue) -> HostRef {
        HostRef::retain(&self.realm, value)
    }

    pub fn global(&self) -> Result<DynValue, BridgeError> {
        DynValue::global(&self.realm)
    }

    /// Create a transfer token for `object`, which must live in this realm.
    pub fn transfer(&self, object: &HostRef) -> Result<Transferring, BridgeError> {
        if object.realm().thread() != self.thread {
            return Err(BridgeError::invalid(object.handle(), "transfer from a foreign realm"));
        }
        Transferring::new(object, self.runtime.next_correlation())
    }

    /// Remove this thread from the runtime.
    pub fn detach(self) {
        self.runtime.remove_thread(self.thread);
        if self.realm.is_owner_thread() {
            self.runtime.shared.executors.remove_current();
            CURRENT.with(|c| {
                let mut current = c.borrow_mut();
                if current.as_ref().is_some_and(|cx| cx.thread == self.thread) {
                    *current = None;
                }
            });
        }
        crate::bridge_trace!("runtime", "detached {}", self.thread);
    }
}

/// Handle to a worker started by [`BridgeRuntime::spawn_worker`].
#[cfg(feature = "multithreaded")]
pub struct WorkerHandle {
    index: ThreadIndex,
    loop_handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

#[cfg(feature = "multithreaded")]
impl WorkerHandle {
    pub fn index(&self) -> ThreadIndex {
        self.index
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Ask the worker's loop to stop.
    pub fn terminate(&self) {
        self.loop_handle.shutdown();
    }

    /// Wait for the worker thread; `Err` carries its panic payload.
    pub fn join(mut self) -> thread::Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join(),
            None => Ok(()),
        }
    }
}

#[cfg(feature = "multithreaded")]
impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.loop_handle.shutdown();
            let _ = thread.join();
        }
    }
}
