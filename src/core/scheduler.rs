//! The thread pool's implementation of the backend interface.
//!
//! `schedule` pushes a heap job into the injector which completes the receiver on
//! whichever worker picks it up. `bulk` allocates a single `BulkJob` and pushes one
//! range job covering all indices; workers split the range in halves as they go, so
//! the indices spread over the pool without further allocations. The worker that
//! finishes the last index frees the job and delivers the completion.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};

use super::Shared;
use super::context::Context;
use super::job::{AbortIfPanic, HeapJob, Job, JobRef};
use super::sync::{Arc, AtomicUsize, Ordering};
use crate::error::SchedulerError;
use crate::interface::{
    AbstractOperationState, AbstractScheduler, AbstractSender, BulkFunction, ForwardProgress,
    ReceiverShim,
};

/// A scheduler submitting work to a `ThreadPool`.
///
/// Obtained via `ThreadPool::scheduler`.
pub struct PoolScheduler {
    shared: Arc<Shared>,
}

impl PoolScheduler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        PoolScheduler { shared }
    }

    fn accepts_work(&self) -> bool {
        !self.shared.shutdown.is_shutting_down()
    }
}

impl AbstractScheduler for PoolScheduler {
    fn forward_progress_guarantee(&self) -> ForwardProgress {
        ForwardProgress::Parallel
    }

    fn schedule(&self) -> Option<Box<dyn AbstractSender>> {
        if !self.accepts_work() {
            return None;
        }

        Some(Box::new(PoolSender {
            shared: Arc::clone(&self.shared),
            work: Work::Schedule,
        }))
    }

    fn bulk(&self, size: usize, function: BulkFunction) -> Option<Box<dyn AbstractSender>> {
        if !self.accepts_work() {
            return None;
        }

        Some(Box::new(PoolSender {
            shared: Arc::clone(&self.shared),
            work: Work::Bulk { size, function },
        }))
    }
}

#[derive(Copy, Clone)]
enum Work {
    Schedule,
    Bulk { size: usize, function: BulkFunction },
}

struct PoolSender {
    shared: Arc<Shared>,
    work: Work,
}

impl AbstractSender for PoolSender {
    fn connect(self: Box<Self>, receiver: ReceiverShim) -> Box<dyn AbstractOperationState> {
        Box::new(PoolOperation {
            shared: self.shared,
            work: self.work,
            receiver,
        })
    }
}

struct PoolOperation {
    shared: Arc<Shared>,
    work: Work,
    receiver: ReceiverShim,
}

impl AbstractOperationState for PoolOperation {
    fn start(self: Box<Self>) {
        let PoolOperation { shared, work, receiver } = *self;

        // The pool may have started shutting down since the work object was created.
        if shared.shutdown.is_shutting_down() {
            receiver.set_error(SchedulerError::BackendUnavailable.into());
            return;
        }

        match work {
            Work::Schedule => {
                let job = unsafe {
                    HeapJob::new_ref(move |_ctx: &mut Context| {
                        let abort = AbortIfPanic;
                        receiver.set_value();
                        std::mem::forget(abort);
                    })
                };

                shared.inject(job);
            }
            Work::Bulk { size: 0, .. } => {
                // Nothing to run, complete inline.
                receiver.set_value();
            }
            Work::Bulk { size, function } => {
                let job = Box::new(BulkJob {
                    function,
                    remaining: AtomicUsize::new(size),
                    first_panic: AtomicUsize::new(NO_PANIC),
                    receiver,
                });

                let job_ref = unsafe {
                    JobRef::new(Box::into_raw(job) as *const BulkJob)
                        .with_range(0..size, shared.split_threshold)
                };

                shared.inject(job_ref);
            }
        }
    }
}

const NO_PANIC: usize = usize::MAX;

/// The shared state of a bulk stage running on the pool.
///
/// Every range job split off the initial one points to the same `BulkJob`.
struct BulkJob {
    function: BulkFunction,
    // Number of indices that haven't run yet.
    remaining: AtomicUsize,
    // Smallest index whose call panicked, or NO_PANIC.
    first_panic: AtomicUsize,
    receiver: ReceiverShim,
}

impl Job for BulkJob {
    unsafe fn execute(this: *const Self, _ctx: &mut Context, range: Range<usize>) {
        profiling::scope!("bulk:range");

        let count = range.len();
        {
            let job = &*this;
            for index in range {
                let result = panic::catch_unwind(AssertUnwindSafe(|| job.function.call(index)));
                if result.is_err() {
                    job.first_panic.fetch_min(index, Ordering::Relaxed);
                }
            }

            if job.remaining.fetch_sub(count, Ordering::AcqRel) != count {
                // Other ranges are still running. After this point the job may be
                // freed at any time.
                return;
            }
        }

        // We ran the last range: nobody else refers to the job anymore.
        let job = Box::from_raw(this as *mut Self);
        let BulkJob { first_panic, receiver, .. } = *job;

        let abort = AbortIfPanic;
        match first_panic.load(Ordering::Relaxed) {
            NO_PANIC => receiver.set_value(),
            index => {
                tracing::debug!(index, "bulk function panicked");
                receiver.set_error(SchedulerError::BulkPanicked { index }.into());
            }
        }
        std::mem::forget(abort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadPool;
    use crate::receiver::{receiver_fn, Completion};
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    fn shim(sender: mpsc::Sender<Completion<()>>) -> ReceiverShim {
        ReceiverShim::new(receiver_fn(move |completion: Completion<()>| {
            let _ = sender.send(completion);
        }))
    }

    unsafe fn count_index(state: *const (), index: usize) {
        let counters = &*(state as *const Vec<AtomicU32>);
        counters[index].fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    unsafe fn panic_on_odd(state: *const (), index: usize) {
        count_index(state, index);
        if index % 2 == 1 {
            panic!("odd index");
        }
    }

    #[test]
    fn schedule_completes_on_a_worker() {
        let pool = ThreadPool::builder()
            .with_worker_threads(2)
            .with_thread_names(|idx| format!("PoolTest#{}", idx))
            .build();
        let scheduler = PoolScheduler::new(pool.shared.clone());

        let (tx, rx) = mpsc::channel();
        let on_worker = std::sync::Arc::new(AtomicU32::new(0));
        let flag = on_worker.clone();
        let op = scheduler.schedule().unwrap().connect(ReceiverShim::new(receiver_fn(
            move |completion: Completion<()>| {
                let name = std::thread::current().name().map(|n| n.to_string());
                if name.map_or(false, |n| n.starts_with("PoolTest#")) {
                    flag.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                let _ = tx.send(completion);
            },
        )));
        op.start();

        assert!(rx.recv().unwrap().is_value());
        assert_eq!(on_worker.load(std::sync::atomic::Ordering::SeqCst), 1);

        pool.shut_down().wait();
    }

    #[test]
    fn bulk_runs_every_index_once() {
        let pool = ThreadPool::builder()
            .with_worker_threads(4)
            .with_split_threshold(3)
            .build();
        let scheduler = PoolScheduler::new(pool.shared.clone());

        for &size in &[1usize, 2, 7, 64, 1000] {
            let counters: Vec<AtomicU32> = (0..size).map(|_| AtomicU32::new(0)).collect();
            let function = unsafe {
                BulkFunction::new(&counters as *const _ as *const (), count_index)
            };

            let (tx, rx) = mpsc::channel();
            scheduler.bulk(size, function).unwrap().connect(shim(tx)).start();
            assert!(rx.recv().unwrap().is_value());

            for counter in &counters {
                assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
            }
        }

        pool.shut_down().wait();
    }

    #[test]
    fn empty_bulk_completes_inline() {
        let pool = ThreadPool::builder().with_worker_threads(1).build();
        let scheduler = PoolScheduler::new(pool.shared.clone());

        unsafe fn unreachable_index(_: *const (), _: usize) {
            panic!("no index to run");
        }

        let function = unsafe { BulkFunction::new(std::ptr::null(), unreachable_index) };
        let (tx, rx) = mpsc::channel();
        scheduler.bulk(0, function).unwrap().connect(shim(tx)).start();

        assert!(rx.try_recv().unwrap().is_value());

        pool.shut_down().wait();
    }

    #[test]
    fn bulk_panic_reports_first_index() {
        let pool = ThreadPool::builder().with_worker_threads(3).build();
        let scheduler = PoolScheduler::new(pool.shared.clone());

        let counters: Vec<AtomicU32> = (0..16).map(|_| AtomicU32::new(0)).collect();
        let function = unsafe {
            BulkFunction::new(&counters as *const _ as *const (), panic_on_odd)
        };

        let (tx, rx) = mpsc::channel();
        scheduler.bulk(16, function).unwrap().connect(shim(tx)).start();

        match rx.recv().unwrap() {
            Completion::Error(payload) => {
                assert_eq!(
                    payload.downcast_ref::<SchedulerError>(),
                    Some(&SchedulerError::BulkPanicked { index: 1 })
                );
            }
            _ => panic!("expected an error"),
        }

        // The other indices still ran.
        for counter in &counters {
            assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        }

        pool.shut_down().wait();
    }

    #[test]
    fn shut_down_pool_refuses_work() {
        let pool = ThreadPool::builder().with_worker_threads(1).build();
        let scheduler = PoolScheduler::new(pool.shared.clone());

        let (tx, rx) = mpsc::channel();
        let op = scheduler.schedule().unwrap().connect(shim(tx));

        pool.shut_down().wait();

        assert!(scheduler.schedule().is_none());

        // Connected before the shutdown, started after.
        op.start();
        assert!(rx.try_recv().unwrap().is_error());
    }
}
