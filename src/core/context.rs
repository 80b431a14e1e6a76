use crate::sync::Arc;

use crossbeam_deque::{Worker as WorkerQueue};

use super::Shared;
use super::job::JobRef;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u32);

/// The per-worker state used to process jobs.
///
/// Each worker thread owns exactly one context. Jobs are handed the context of the
/// worker that executes them, which lets them push split ranges into the worker's
/// local queue instead of going through the shared injector.
pub struct Context {
    id: u32,
    queue: WorkerQueue<JobRef>,
    // Keep track of whether we may have work in our local queue. This is simple
    // because only the context can insert into its queue, so we can update this
    // when pushing and popping from the queue.
    // Only when this value changes do we propagate this information to a shared
    // atomic that is visible from other threads (a more expensive operation).
    may_have_work: bool,

    pub(crate) shared: Arc<Shared>,
    pub(crate) stats: Stats,
}

unsafe impl Send for Context {}

impl Context {
    pub fn id(&self) -> ContextId { ContextId(self.id) }

    pub(crate) fn index(&self) -> usize { self.id as usize }

    pub(crate) fn new_worker(id: u32, queue: WorkerQueue<JobRef>, shared: Arc<Shared>) -> Self {
        Context {
            id,
            queue,
            may_have_work: false,
            shared,
            stats: Stats::new(),
        }
    }

    pub(crate) fn queue(&self) -> &WorkerQueue<JobRef> {
        &self.queue
    }

    pub(crate) fn enqueue_job(&mut self, job: JobRef) {
        self.mark_may_have_work();
        self.queue.push(job);
    }

    pub(crate) fn mark_may_have_work(&mut self) {
        if !self.may_have_work {
            self.may_have_work = true;
            self.shared.activity.mark_context_active(self.id);
        }
    }

    pub(crate) fn fetch_local_job(&mut self) -> Option<JobRef> {
        let job = self.queue.pop();

        if job.is_none() && self.may_have_work {
            self.may_have_work = false;
            self.shared.activity.mark_context_inactive(self.id);
        }

        job
    }

    pub(crate) unsafe fn execute_job(&mut self, mut job: JobRef) {
        profiling::scope!("execute_job");

        if let Some(next) = job.split() {
            self.enqueue_job(next);
            self.wake(1);
        }

        job.execute(self);
        self.stats.jobs_executed += 1;
    }

    /// Wake up to n worker threads (stop when they are all awake).
    ///
    /// This function is fairly expensive when it causes a thread to
    /// wake up (most of the time is spent dealing with the condition
    /// variable).
    /// However it is fairly cheap if all workers are already awake.
    pub(crate) fn wake(&mut self, n: u32) {
        self.shared.sleep.wake(n, self.id);
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Stats {
    /// number of jobs executed.
    pub jobs_executed: u64,
    /// number of jobs stolen from other workers or from the injector.
    pub jobs_stolen: u64,
    /// How many times the worker went to sleep.
    pub parked: u64,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            jobs_executed: 0,
            jobs_stolen: 0,
            parked: 0,
        }
    }
}
