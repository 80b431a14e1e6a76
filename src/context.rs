//! The entry point: an execution context hands out schedulers bound to a backend.

use crate::core::thread_pool::{ThreadPool, ThreadPoolBuilder};
use crate::interface::AbstractScheduler;
use crate::scheduler::SchedulerHandle;

use std::sync::{Arc, OnceLock};

static DEFAULT_POOL: OnceLock<ThreadPool> = OnceLock::new();

/// The thread pool shared by every `ExecutionContext::new()`.
///
/// Created on first use, configured from the environment, and never shut down.
pub fn default_thread_pool() -> &'static ThreadPool {
    DEFAULT_POOL.get_or_init(|| {
        let builder = match ThreadPoolBuilder::from_env() {
            Ok(builder) => builder,
            Err(error) => {
                tracing::warn!(%error, "ignoring invalid thread pool configuration");
                ThreadPool::builder()
            }
        };

        builder
            .with_thread_names(|idx| format!("sysexec#{}", idx))
            .build()
    })
}

/// Binds a scheduler to an execution backend.
///
/// The context doesn't own the backend: dropping the context leaves the backend
/// running, and schedulers obtained from it stay usable.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    scheduler: SchedulerHandle,
    max_concurrency: usize,
}

impl ExecutionContext {
    /// A context running work on the process-wide thread pool.
    ///
    /// Each context gets its own scheduler object: schedulers from the same context
    /// compare equal, schedulers from different contexts don't.
    pub fn new() -> Self {
        ExecutionContext::with_thread_pool(default_thread_pool())
    }

    /// A context running work on `pool`.
    pub fn with_thread_pool(pool: &ThreadPool) -> Self {
        ExecutionContext {
            scheduler: pool.scheduler(),
            max_concurrency: pool.num_worker_threads() as usize,
        }
    }

    /// A context running work on a custom backend.
    pub fn with_backend(backend: Arc<dyn AbstractScheduler>, max_concurrency: usize) -> Self {
        ExecutionContext {
            scheduler: SchedulerHandle::new(backend),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn get_scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone()
    }

    /// A hint of how many work items the backend can run simultaneously.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext::new()
    }
}

#[test]
fn scheduler_identity() {
    let ctx1 = ExecutionContext::new();
    let ctx2 = ExecutionContext::new();

    assert_eq!(ctx1.get_scheduler(), ctx1.get_scheduler());
    assert_ne!(ctx1.get_scheduler(), ctx2.get_scheduler());
    assert!(ctx1.max_concurrency() >= 1);
    assert_eq!(ctx1.max_concurrency(), ctx2.max_concurrency());
}
