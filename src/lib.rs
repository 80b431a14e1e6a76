//! Sender/receiver scheduling on top of a pluggable execution backend.
//!
//! Work is described with senders, bound to a continuation (a receiver) by `connect`
//! and submitted by `start`. Every operation completes exactly once, with a value,
//! a stopped signal or an error. Schedulers hand work over to an execution backend
//! through a small object-safe interface, so the same code can run on:
//!
//! - the process-wide work-stealing thread pool (`ExecutionContext::new()`),
//! - a dedicated `ThreadPool`,
//! - a single-threaded event loop (`ManualEventLoop`, `SingleThreadContext`),
//! - or any custom implementation of `AbstractScheduler`.
//!
//! ```no_run
//! use sysexec::{sync_wait, ExecutionContext, SenderExt};
//!
//! let ctx = ExecutionContext::new();
//! let scheduler = ctx.get_scheduler();
//!
//! let work = scheduler.schedule().then(|()| vec![1u64, 2, 3]);
//! let work = scheduler.bulk(work, 3, |index, values: &Vec<u64>| {
//!     println!("{}: {}", index, values[index]);
//! });
//!
//! let values = sync_wait(work).unwrap();
//! assert_eq!(values, Some(vec![1, 2, 3]));
//! ```

mod core;
mod bulk;
mod context;
mod error;
mod event_loop;
pub mod interface;
mod receiver;
mod scheduler;
mod sender;
mod sync_wait;

pub use bulk::{BulkOperation, BulkReceiver, BulkSender};
pub use context::{default_thread_pool, ExecutionContext};
pub use error::{ConfigError, ErrorPayload, SchedulerError};
pub use event_loop::{ManualEventLoop, SingleThreadContext};
pub use interface::ForwardProgress;
pub use receiver::{receiver_fn, Completion, FnReceiver, Receiver};
pub use scheduler::{ScheduleOperation, ScheduleSender, SchedulerHandle};
pub use sender::{
    just, just_error, just_stopped, Just, JustError, JustStopped, OperationState, Sender,
    SenderExt, Then,
};
pub use sync_wait::sync_wait;

pub use crate::core::event::Event;
pub use crate::core::scheduler::PoolScheduler;
pub use crate::core::thread_pool::{ThreadPool, ThreadPoolBuilder, ThreadPoolId};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::WorkerHook;
pub use crate::core::sync;
