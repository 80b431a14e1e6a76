use super::{Shared, WorkerHook};
use super::sync::Arc;
use super::scheduler::PoolScheduler;
use super::shutdown::{Shutdown, ShutdownHandle};
use crate::error::ConfigError;
use crate::scheduler::SchedulerHandle;

/// Environment variable overriding the number of worker threads.
pub const NUM_THREADS_VAR: &str = "SYSEXEC_NUM_THREADS";
/// Environment variable overriding the size below which bulk ranges are not split.
pub const SPLIT_THRESHOLD_VAR: &str = "SYSEXEC_SPLIT_THRESHOLD";

/// The Activity and Sleep bitfields hold one bit per worker.
pub const MAX_WORKER_THREADS: u32 = 31;

const DEFAULT_SPLIT_THRESHOLD: usize = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadPoolId(pub(crate) u32);

/// A reference to a thread pool.
///
/// Cloning the pool does not spawn threads, the clones share the same workers.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            num_threads: default_num_threads(),
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// Stop accepting work and let the workers exit once the submitted work is done.
    pub fn shut_down(&self) -> ShutdownHandle {
        Shutdown::begin_shut_down(Arc::clone(&self.shared))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_shutting_down()
    }

    /// Creates a new scheduler object for this pool.
    ///
    /// Each call returns a distinct scheduler: handles obtained from the same call (or
    /// clones of it) compare equal, handles from separate calls don't.
    pub fn scheduler(&self) -> SchedulerHandle {
        SchedulerHandle::new(std::sync::Arc::new(PoolScheduler::new(Arc::clone(&self.shared))))
    }

    pub fn id(&self) -> ThreadPoolId {
        self.shared.id
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    pub fn split_threshold(&self) -> usize { self.shared.split_threshold }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.shared.id)
            .field("num_workers", &self.shared.num_workers)
            .finish()
    }
}

fn default_num_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
        .clamp(1, MAX_WORKER_THREADS)
}

pub struct ThreadPoolBuilder {
    pub(crate) num_threads: u32,
    pub(crate) split_threshold: usize,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadPoolBuilder {
    /// A builder with the default parameters, overridden by the `SYSEXEC_NUM_THREADS`
    /// and `SYSEXEC_SPLIT_THRESHOLD` environment variables when they are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = ThreadPool::builder();

        if let Some(num_threads) = read_env_number(NUM_THREADS_VAR)? {
            builder = builder.with_worker_threads(clamp_num_threads(num_threads));
        }

        if let Some(threshold) = read_env_number(SPLIT_THRESHOLD_VAR)? {
            builder = builder.with_split_threshold(threshold);
        }

        Ok(builder)
    }

    pub fn with_start_handler<F>(self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        ThreadPoolBuilder {
            start_handler: Some(Box::new(handler)),
            ..self
        }
    }

    pub fn with_exit_handler<F>(self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        ThreadPoolBuilder {
            exit_handler: Some(Box::new(handler)),
            ..self
        }
    }

    pub fn with_thread_names<F>(self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        ThreadPoolBuilder {
            name_handler: Box::new(handler),
            ..self
        }
    }

    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads.max(1);

        // We are currently limited to 32 workers, and that should be fine.
        // If not, the changes that need to happen are in the Activity and Sleep
        // structs in core/mod.rs.
        assert!(self.num_threads <= MAX_WORKER_THREADS);

        self
    }

    /// Ranges of a bulk job at or below this size are executed by a single worker
    /// instead of being split in halves.
    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold.max(1);

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn num_threads(&self) -> u32 { self.num_threads }

    pub fn split_threshold(&self) -> usize { self.split_threshold }

    pub fn build(self) -> ThreadPool {
        crate::core::init(self)
    }
}

// Clamp before narrowing so that huge values saturate instead of wrapping.
fn clamp_num_threads(num_threads: usize) -> u32 {
    num_threads.clamp(1, MAX_WORKER_THREADS as usize) as u32
}

fn read_env_number(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => parse_number(var, &value).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(value)) => Err(ConfigError::InvalidNumber {
            var,
            value: value.to_string_lossy().into_owned(),
        }),
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { var, value: value.to_string() }),
    }
}

#[test]
fn parse_config_numbers() {
    assert_eq!(parse_number(NUM_THREADS_VAR, "4"), Ok(4));
    assert_eq!(parse_number(NUM_THREADS_VAR, " 12 "), Ok(12));
    assert_eq!(
        parse_number(SPLIT_THRESHOLD_VAR, "0"),
        Err(ConfigError::InvalidNumber { var: SPLIT_THRESHOLD_VAR, value: "0".to_string() })
    );
    assert!(parse_number(NUM_THREADS_VAR, "many").is_err());

    assert_eq!(clamp_num_threads(5), 5);
    assert_eq!(clamp_num_threads(64), MAX_WORKER_THREADS);
    assert_eq!(clamp_num_threads(usize::MAX), MAX_WORKER_THREADS);
}

#[test]
fn builder_limits() {
    let builder = ThreadPool::builder()
        .with_worker_threads(0)
        .with_split_threshold(0);

    assert_eq!(builder.num_threads(), 1);
    assert_eq!(builder.split_threshold(), 1);

    let default = ThreadPool::builder();
    assert!(default.num_threads() >= 1);
    assert!(default.num_threads() <= MAX_WORKER_THREADS);
}
