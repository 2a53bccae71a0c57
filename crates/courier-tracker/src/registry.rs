//! Process-wide registry of named background tasks.
//!
//! Background work is registered once at startup under a fixed name.
//! Registering a name that is already present is a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Named background tasks spawned at process startup.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<&'static str, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the task built by `make` under `name` unless one is registered.
    ///
    /// Returns `true` if the task was registered by this call. `make` is
    /// only invoked when it was.
    pub fn register<F, Fut>(&self, name: &'static str, make: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        if let Some(existing) = tasks.get(name) {
            if !existing.is_finished() {
                debug!(task = name, "Task already registered");
                return false;
            }
        }
        tasks.insert(name, tokio::spawn(make()));
        info!(task = name, "Registered background task");
        true
    }

    /// Whether a live task is registered under `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks()
            .get(name)
            .is_some_and(|task| !task.is_finished())
    }

    /// Names of all live registered tasks.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .tasks()
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(name, _)| *name)
            .collect();
        names.sort_unstable();
        names
    }

    /// Abort every registered task.
    pub fn shutdown(&self) {
        for (name, task) in self.tasks().drain() {
            debug!(task = name, "Aborting background task");
            task.abort();
        }
    }
}
