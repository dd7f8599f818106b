use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use tokio::sync::oneshot;

use super::executor::Executor;
use crate::runtime::value::lock;

// Task state constants for thread-safe state management
pub const TASK_IDLE: u8 = 0;
pub const TASK_SCHEDULED: u8 = 1;
pub const TASK_RUNNING: u8 = 2;
/// Woken while running; poll again once the current poll returns.
pub const TASK_NOTIFIED: u8 = 3;
pub const TASK_COMPLETED: u8 = 4;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct Task {
    id: u64,
    future: Mutex<Option<BoxFuture>>,
    state: AtomicU8,
    executor: Arc<Executor>,
}

impl Task {
    pub(crate) fn new<F>(id: u64, executor: Arc<Executor>, future: F) -> Arc<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            id,
            future: Mutex::new(Some(Box::pin(future))),
            state: AtomicU8::new(TASK_SCHEDULED),
            executor,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TASK_COMPLETED
    }

    /// Post a poll of this task as a microtask.
    pub(crate) fn schedule(self: &Arc<Self>) {
        let task = self.clone();
        self.executor.enqueue(move || task.run());
    }

    fn run(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(TASK_SCHEDULED, TASK_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let mut slot = lock(&self.future);
        let Some(future) = slot.as_mut() else {
            self.state.store(TASK_COMPLETED, Ordering::Release);
            return;
        };
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                *slot = None;
                self.state.store(TASK_COMPLETED, Ordering::Release);
            }
            Poll::Pending => {
                drop(slot);
                if self
                    .state
                    .compare_exchange(TASK_RUNNING, TASK_IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Woken during the poll
                    self.state.store(TASK_SCHEDULED, Ordering::Release);
                    self.schedule();
                }
            }
        }
    }

    fn wake(self: &Arc<Self>) {
        loop {
            match self.state() {
                TASK_IDLE => {
                    if self
                        .state
                        .compare_exchange(TASK_IDLE, TASK_SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.schedule();
                        return;
                    }
                }
                TASK_RUNNING => {
                    if self
                        .state
                        .compare_exchange(TASK_RUNNING, TASK_NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Re-enqueues a poll of its task on the task's executor.
struct TaskWaker {
    task: Arc<Task>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.task.wake();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.task.wake();
    }
}

/// The task's output channel closed without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinError {
    pub task: u64,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} ended without producing a result", self.task)
    }
}

impl std::error::Error for JoinError {}

/// Awaits the output of a spawned task.
pub struct JoinHandle<T> {
    id: u64,
    rx: oneshot::Receiver<T>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The output if the task has finished, without waiting.
    pub fn try_result(&mut self) -> Option<Result<T, JoinError>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(JoinError { task: self.id })),
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| JoinError { task: id }))
    }
}

impl Executor {
    /// Run `future` as a task on this executor. Each wake posts one poll as a
    /// microtask.
    #[track_caller]
    pub fn spawn<F>(self: &Arc<Self>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.id_gen.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(id, self.clone(), async move {
            let _ = tx.send(future.await);
        });
        task.schedule();
        JoinHandle { id, rx }
    }
}

#[derive(Default)]
struct SleepState {
    fired: bool,
    waker: Option<Waker>,
}

/// Completes once the host timer it registers fires.
pub struct Sleep {
    executor: Arc<Executor>,
    duration: Duration,
    state: Option<Arc<Mutex<SleepState>>>,
}

/// Sleep for `duration` on the host's timer queue.
pub fn sleep(executor: &Arc<Executor>, duration: Duration) -> Sleep {
    Sleep {
        executor: executor.clone(),
        duration,
        state: None,
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.state.clone() {
            Some(state) => {
                let mut state = lock(&state);
                if state.fired {
                    Poll::Ready(())
                } else {
                    state.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
            None => {
                let state = Arc::new(Mutex::new(SleepState {
                    fired: false,
                    waker: Some(cx.waker().clone()),
                }));
                let timer_state = state.clone();
                self.executor.enqueue_after(
                    move || {
                        let waker = {
                            let mut state = lock(&timer_state);
                            state.fired = true;
                            state.waker.take()
                        };
                        if let Some(waker) = waker {
                            waker.wake();
                        }
                    },
                    self.duration,
                );
                self.state = Some(state);
                Poll::Pending
            }
        }
    }
}
