//! Lookup of the executor serving the calling thread.
//!
//! With the `multithreaded` feature every thread gets its own executor,
//! created on first lookup. Without it one executor serves the program.

use std::sync::Arc;
use std::thread;

#[cfg(feature = "multithreaded")]
use std::collections::HashMap;
#[cfg(feature = "multithreaded")]
use std::sync::Mutex;
#[cfg(feature = "multithreaded")]
use std::thread::ThreadId;
#[cfg(not(feature = "multithreaded"))]
use std::sync::OnceLock;

use super::executor::Executor;
#[cfg(feature = "multithreaded")]
use crate::runtime::value::lock;

#[derive(Default)]
pub struct ExecutorRegistry {
    #[cfg(feature = "multithreaded")]
    executors: Mutex<HashMap<ThreadId, Arc<Executor>>>,
    #[cfg(not(feature = "multithreaded"))]
    shared: OnceLock<Arc<Executor>>,
}

fn executor_name() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The calling thread's executor, created on first use.
    #[cfg(feature = "multithreaded")]
    pub fn current(&self) -> Arc<Executor> {
        let id = thread::current().id();
        lock(&self.executors)
            .entry(id)
            .or_insert_with(|| Arc::new(Executor::new(executor_name())))
            .clone()
    }

    #[cfg(not(feature = "multithreaded"))]
    pub fn current(&self) -> Arc<Executor> {
        self.shared
            .get_or_init(|| Arc::new(Executor::new(executor_name())))
            .clone()
    }

    /// Forget the calling thread's executor.
    pub fn remove_current(&self) -> Option<Arc<Executor>> {
        #[cfg(feature = "multithreaded")]
        {
            lock(&self.executors).remove(&thread::current().id())
        }
        #[cfg(not(feature = "multithreaded"))]
        {
            None
        }
    }

    pub fn len(&self) -> usize {
        #[cfg(feature = "multithreaded")]
        {
            lock(&self.executors).len()
        }
        #[cfg(not(feature = "multithreaded"))]
        {
            self.shared.get().map_or(0, |_| 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
