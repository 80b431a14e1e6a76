//! A work-stealing thread pool implementing the backend interface.
//!
//! Each worker owns a FIFO deque. Work submitted from outside of the pool goes through
//! a global injector, work produced by a job (split ranges of a bulk job) goes into
//! the local queue of the worker that executes it. Idle workers steal from each other
//! and from the injector before going to sleep.

pub mod job;
pub mod context;
pub mod event;
pub mod thread_pool;
pub mod scheduler;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use crossbeam_deque::{Injector, Stealer, Steal, Worker as WorkerQueue};
use crossbeam_utils::{CachePadded, sync::{Parker, Unparker}};

use sync::{Arc, Ordering, AtomicU32, thread};
use job::JobRef;
use thread_pool::{ThreadPool, ThreadPoolBuilder, ThreadPoolId};
use context::Context;
use shutdown::Shutdown;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_THREADPOOL_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// Data accessible by all workers and by the schedulers from any thread.
///
/// If you are familiar with rayon's code, this is somewhat equivalent to their
/// `Registry` struct.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// Jobs submitted from outside of the worker threads.
    pub injector: Injector<JobRef>,
    ///
    pub stealers: Stealers,
    /// keeps track of workers that may have work in their queue.
    pub activity: Activity,
    /// State and logic to put worker threads to sleep and wake them up.
    pub sleep: Sleep,
    /// Ranges at or below this size are not split further.
    pub split_threshold: usize,
    /// A unique ID per thread pool.
    pub id: ThreadPoolId,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    // A few hooks to register work
    handlers: ThreadPoolHooks,
}

impl Shared {
    /// Submit a job from any thread.
    pub fn inject(&self, job: JobRef) {
        profiling::scope!("inject");
        self.injector.push(job);
        // Pairs with the sleepy bit being set before workers re-check the injector.
        std::sync::atomic::fence(Ordering::SeqCst);
        self.sleep.wake(1, 0);
    }
}

pub(crate) fn init(params: ThreadPoolBuilder) -> ThreadPool {
    let num_threads = params.num_threads as usize;

    let mut stealers = Vec::with_capacity(num_threads);
    let mut queues = Vec::with_capacity(num_threads);
    for _ in 0..num_threads {
        let queue = WorkerQueue::new_fifo();
        stealers.push(CachePadded::new(queue.stealer()));
        queues.push(Some(queue));
    }

    let (sleep, mut parkers) = Sleep::new(num_threads);

    let id = ThreadPoolId(NEXT_THREADPOOL_ID.fetch_add(1, Ordering::Relaxed));

    let shared = Arc::new(Shared {
        num_workers: num_threads as u32,

        injector: Injector::new(),

        activity: Activity::new(num_threads),

        stealers: Stealers {
            stealers,
        },

        sleep,

        split_threshold: params.split_threshold,

        handlers: ThreadPoolHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },

        shutdown: Shutdown::new(num_threads as u32),

        id,
    });

    tracing::debug!(pool = id.0, workers = num_threads, "starting thread pool");

    for i in 0..num_threads {
        let (queue, parker) = match (queues[i].take(), parkers[i].take()) {
            (Some(queue), Some(parker)) => (queue, parker),
            _ => unreachable!(),
        };

        let mut worker = Worker {
            ctx: Context::new_worker(i as u32, queue, shared.clone()),
            parker,
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        if let Err(err) = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();
        }) {
            panic!("failed to spawn worker thread #{}: {}", i, err);
        }
    }

    ThreadPool { shared }
}


struct SleepState {
    unparker: Unparker,
    // The index of the context this one will start searching at next time it tries to steal.
    // Can be used as hint of which context last woke this worker.
    // Since it only guides a heuristic, it doesn't need to be perfectly accurate.
    next_target: AtomicU32,
}

pub(crate) struct Sleep {
    /// Atomic bitfield. Setting the Nth bit to one means the Nth worker thread is sleepy.
    sleepy_workers: AtomicU32,
    sleep_states: Vec<CachePadded<SleepState>>,
}

impl Sleep {
    fn new(num_threads: usize) -> (Self, Vec<Option<Parker>>) {
        let mut parkers = Vec::with_capacity(num_threads);
        let mut sleep_states = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let parker = Parker::new();
            sleep_states.push(CachePadded::new(SleepState {
                unparker: parker.unparker().clone(),
                next_target: AtomicU32::new(((i + 1) % num_threads) as u32),
            }));
            parkers.push(Some(parker));
        }

        (
            Sleep {
                // Workers start awake and mark themselves sleepy when they run out of work.
                sleepy_workers: AtomicU32::new(0),
                sleep_states,
            },
            parkers,
        )
    }

    /// Wake up to n worker threads (stop when they are all awake).
    ///
    /// This function is fairly expensive when it causes a thread to
    /// wake up (most of the time is spent dealing with the condition
    /// variable).
    /// However it is fairly cheap if all workers are already awake.
    pub fn wake(&self, mut n: u32, waker: u32) {
        while n > 0 {
            let mut sleepy_bits = self.sleepy_workers.load(Ordering::SeqCst);

            if sleepy_bits == 0 {
                // Everyone is already awake.
                return;
            }

            profiling::scope!("wake workers");

            for i in 0..(self.sleep_states.len() as u32) {
                let bit = 1 << i;
                if sleepy_bits & bit == 0 {
                    continue;
                }

                let prev = self.sleepy_workers.fetch_and(!bit, Ordering::SeqCst);
                if prev & bit == 0 {
                    // Someone else woke the thread up before we got to it.
                    // A good time to refresh our view of the sleep thread bits.
                    sleepy_bits = self.sleepy_workers.load(Ordering::SeqCst);

                    if sleepy_bits == 0 {
                        return;
                    }

                    continue;
                }

                let sleep_state = &self.sleep_states[i as usize];
                sleep_state.next_target.store(waker, Ordering::Relaxed);

                profiling::scope!("unpark");
                sleep_state.unparker.unpark();

                break;
            }

            n -= 1;
        }
    }

    fn mark_sleepy(&self, worker: u32) -> u32 {
        let sleepy_bit = 1 << worker;
        self.sleepy_workers.fetch_or(sleepy_bit, Ordering::SeqCst) | sleepy_bit
    }

    /// Clear our own sleepy bit if nobody did it for us.
    fn mark_awake(&self, worker: u32) {
        self.sleepy_workers.fetch_and(!(1 << worker), Ordering::SeqCst);
    }

    /// Who woke me up? They are likely the best candidate for work stealing.
    fn get_waker_hint(&self, worker_index: usize) -> usize {
        self.sleep_states[worker_index]
            .next_target
            .load(Ordering::Relaxed) as usize
    }

    /// Tell the worker at the given index what context to try to steal from first.
    fn set_waker_hint(&self, worker_index: usize, waker: usize) {
        self.sleep_states[worker_index]
            .next_target
            .store(waker as u32, Ordering::Release);
    }

    /// Wake all workers.
    ///
    /// This is a bit heavy handed and mostly intended for the shutdown code. In the majority
    /// of cases (other than shutdown), using `wake` is better.
    fn wake_all(&self) {
        for state in &self.sleep_states {
            state.unparker.unpark();
        }
    }
}

pub(crate) struct Stealers {
    pub stealers: Vec<CachePadded<Stealer<JobRef>>>,
}

impl Stealers {
    /// Attempt to steal multiple jobs from other workers, returning one of them.
    ///
    /// Uses the waker hint to start stealing from the last thread that woke us up.
    pub fn steal_batch(&self, ctx: &Context, sleep: &Sleep, activity: &Activity) -> Option<JobRef> {
        let stealer_index = ctx.index();
        let start = sleep.get_waker_hint(stealer_index);

        let mut stolen = None;
        activity.for_each_active_context(start as u32, &mut |idx| {
            let idx = idx as usize;
            if idx == stealer_index {
                return false;
            }

            for _ in 0..50 {
                let stealer = &self.stealers[idx];
                match stealer.steal_batch_and_pop(ctx.queue()) {
                    Steal::Success(job) => {
                        // We'll try to steal from here again next time.
                        sleep.set_waker_hint(stealer_index, idx);
                        stolen = Some(job);
                        return true;
                    }
                    Steal::Empty => {
                        return false;
                    }
                    Steal::Retry => {}
                }
            }

            false
        });

        stolen
    }
}

/// Attempt to take a batch of jobs submitted from outside of the pool.
fn steal_injected(injector: &Injector<JobRef>, ctx: &Context) -> Option<JobRef> {
    loop {
        match injector.steal_batch_and_pop(ctx.queue()) {
            Steal::Success(job) => return Some(job),
            Steal::Empty => return None,
            Steal::Retry => {}
        }
    }
}


/// Keep track of which workers may have work in their queue.
///
/// This is only used as an optimization heuristic for work-stealing. There is no
/// correctness or safety guarantee that depends on any particular ordering of access
/// of this, however for performance it is better to mark a context active before making
/// work available in its queue rather than the opposite.
pub(crate) struct Activity {
    // A bitfield where each bit corresponds to a worker.
    // if the bit is not set we know that there is no work in the worker's queue
    // and therefore we can skip trying to steal from it.
    // Storing it inline instead of on the heap is measurably faster.
    activity: AtomicU32,
    num_contexts: u32,
}

impl Activity {
    pub fn new(num_contexts: usize) -> Self {
        Activity {
            activity: AtomicU32::new(0),
            num_contexts: num_contexts as u32,
        }
    }

    pub fn mark_context_active(&self, index: u32) {
        debug_assert!(index < self.num_contexts);
        let bit = 1 << index;
        self.activity.fetch_or(bit, Ordering::Release);
    }

    pub fn mark_context_inactive(&self, index: u32) {
        debug_assert!(index < self.num_contexts);
        let bit = 1 << index;
        self.activity.fetch_and(!bit, Ordering::Release);
    }

    pub fn for_each_active_context<F>(&self, start: u32, cb: &mut F)
    where F: FnMut(u32) -> bool
    {
        let bits = self.activity.load(Ordering::Acquire);
        for i in 0..self.num_contexts {
            let idx = (start + i) % self.num_contexts;
            let bit = 1 << idx;

            if bits & bit == 0 {
                continue;
            }

            if cb(idx) {
                return;
            }
        }
    }
}

struct Worker {
    ctx: Context,
    parker: Parker,
}

impl Worker {
    fn run(&mut self) {
        let ctx = &mut self.ctx;
        let shared = Arc::clone(&ctx.shared);

        tracing::trace!(pool = shared.id.0, worker = ctx.id().0, "worker started");

        if let Some(handler) = &shared.handlers.start {
            handler.run(ctx.id().0);
        }

        'main: loop {
            // First see if we have work to do in our own queue.
            while let Some(job) = ctx.fetch_local_job() {
                unsafe {
                    ctx.execute_job(job);
                }
            }

            // See if there is work we can steal from other workers, then from
            // the injector.
            let stolen = shared.stealers.steal_batch(ctx, &shared.sleep, &shared.activity)
                .or_else(|| steal_injected(&shared.injector, ctx));

            if let Some(job) = stolen {
                ctx.stats.jobs_stolen += 1;
                // The rest of the batch we stole landed in our local queue.
                if !ctx.queue_is_empty() {
                    ctx.mark_may_have_work();
                    ctx.wake(1);
                }

                unsafe {
                    ctx.execute_job(job);
                }

                // If we found anything to do via work-stealing, go back to checking the local
                // queue again.
                continue 'main;
            }

            // Only the worker can install work in its own queue, so no other can install work in our
            // context without us noticing and as result if we get here the queue should be empty.
            debug_assert!(ctx.queue_is_empty());

            if shared.shutdown.is_shutting_down() && shared.injector.is_empty() {
                break;
            }

            // Couldn't find work to do in our or another context's queue, so
            // it's sleepy time.

            let _sleepy_bits = shared.sleep.mark_sleepy(ctx.id().0);

            // A job may have been injected after we last looked and before our sleepy bit
            // was visible to the thread that injected it.
            if !shared.injector.is_empty() || shared.shutdown.is_shutting_down() {
                shared.sleep.mark_awake(ctx.id().0);
                continue 'main;
            }

            ctx.stats.parked += 1;
            self.parker.park();
        }

        // Shutdown phase.

        if let Some(handler) = &shared.handlers.exit {
            handler.run(ctx.id().0);
        }

        tracing::trace!(
            pool = shared.id.0,
            worker = ctx.id().0,
            jobs_executed = ctx.stats.jobs_executed,
            jobs_stolen = ctx.stats.jobs_stolen,
            parked = ctx.stats.parked,
            "worker exiting"
        );

        shared.shutdown.worker_has_shut_down();
    }
}

pub(crate) struct ThreadPoolHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
