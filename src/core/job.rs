use std::ops::Range;
use std::cell::UnsafeCell;
use std::mem;
use crate::core::context::Context;

/// A `Job` is used to advertise work for other threads that they may
/// want to steal. In accordance with time honored tradition, jobs are
/// arranged in a deque, so that thieves can take from the top of the
/// deque while the main worker manages the bottom of the deque.
///
/// This trait is heavily inspired by rayon's `Job` trait.
pub trait Job {
    /// Unsafe: this may be called from a different thread than the one
    /// which scheduled the job, so the implementer must ensure the
    /// appropriate traits are met, whether `Send`, `Sync`, or both.
    unsafe fn execute(this: *const Self, ctx: &mut Context, range: Range<usize>);
}

/// Effectively a Job trait object with types and lifetime erased. Each JobRef
/// **must** be executed exactly once, or else data may leak ot be freed twice.
///
/// This is what gets pushed/popped/stolen from the queues.
///
/// Internally, we store the job's data in a `*const ()` pointer.  The
/// true type is something like `*const BulkJob`, but we hide
/// it. We also carry the "execute fn" from the `Job` trait.
///
/// In addition, JobRef contains start and end indices that can be
/// optionally used by the underlying implementation to represent sub-ranges of
/// a workload that can be split automatically by the scheduler.
///
/// Note that if a JobRef can be split, it will result in multiple JobRefs pointing
/// to the same pointer and execute_fn.
#[derive(Copy, Clone, Debug)]
pub struct JobRef {
    // The "deconstructed trait object" part, taken directly from rayon.
    pointer: *const (),
    execute_fn: unsafe fn(*const (), *const (), Range<usize>),

    // Optional start/end parameters to allow splitting a job that operates
    // over a range of items.
    start: usize,
    end: usize,
    split_threshold: usize,
}

unsafe impl Send for JobRef {}
unsafe impl Sync for JobRef {}

impl JobRef {
    /// Unsafe: caller asserts that `data` will remain valid until the
    /// job is executed.
    pub unsafe fn new<T>(data: *const T) -> JobRef
    where
        T: Job,
    {
        let fn_ptr: unsafe fn(*const T, &mut Context, range: Range<usize>) = <T as Job>::execute;
        // erase types:
        JobRef {
            pointer: data as *const (),
            execute_fn: mem::transmute(fn_ptr),
            start: 0,
            end: 1,
            split_threshold: 1,
        }
    }

    #[inline]
    pub unsafe fn with_range(mut self, range: Range<usize>, split_threshold: usize) -> Self {
        debug_assert!(range.start < range.end, "{:?}", range);
        self.start = range.start;
        self.end = range.end;
        self.split_threshold = split_threshold.max(1);
        self
    }

    #[inline]
    pub fn range(&self) -> Range<usize> { self.start..self.end }

    #[inline]
    pub(crate) unsafe fn execute(&self, ctx: &mut Context) {
        (self.execute_fn)(self.pointer, mem::transmute(ctx), self.range())
    }

    #[inline]
    pub(crate) fn split(&mut self) -> Option<Self> {
        if self.end - self.start <= self.split_threshold {
            return None;
        }

        let split = self.start + (self.end - self.start) / 2;

        let end = self.end;
        self.end = split;

        Some(JobRef {
            pointer: self.pointer,
            execute_fn: self.execute_fn,
            start: split,
            end,
            split_threshold: self.split_threshold,
        })
    }
}

/// Represents a job stored in the heap. When executed, `HeapJob` simply
/// invokes a closure and frees itself.
pub struct HeapJob<BODY>
where
    BODY: FnOnce(&mut Context) + Send,
{
    job: UnsafeCell<Option<BODY>>,
}

impl<F> HeapJob<F>
where
    F: FnOnce(&mut Context) + Send,
{
    pub fn new(func: F) -> Self {
        HeapJob {
            job: UnsafeCell::new(Some(func)),
        }
    }

    pub unsafe fn new_ref(func: F) -> JobRef {
        Box::new(Self::new(func)).as_job_ref()
    }

    /// Creates a `JobRef` from this job -- note that this hides all
    /// lifetimes, so it is up to you to ensure that this JobRef
    /// doesn't outlive any data that it closes over.
    pub unsafe fn as_job_ref(self: Box<Self>) -> JobRef {
        let this: *const Self = Box::into_raw(self);
        JobRef::new(this)
    }
}

impl<BODY> Job for HeapJob<BODY>
where
    BODY: FnOnce(&mut Context) + Send,
{
    unsafe fn execute(this: *const Self, ctx: &mut Context, _range: Range<usize>) {
        let this: Box<Self> = Box::from_raw(this as *mut Self);
        if let Some(job) = (*this.job.get()).take() {
            job(ctx);
        }
    }
}

/// Completions are not allowed to unwind. Keep one of these alive while calling
/// into a receiver from a worker and `mem::forget` it afterwards.
pub(crate) struct AbortIfPanic;

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        eprintln!("unexpected panic in a completion; aborting");
        ::std::process::abort();
    }
}

#[test]
fn split_range() {
    struct Nop;
    impl Job for Nop {
        unsafe fn execute(_: *const Self, _: &mut Context, _: Range<usize>) {}
    }

    let data = Nop;
    let mut job = unsafe { JobRef::new(&data).with_range(3..11, 2) };

    let mut pieces = Vec::new();
    let mut stack = vec![job];
    while let Some(mut j) = stack.pop() {
        if let Some(other) = j.split() {
            stack.push(other);
            stack.push(j);
        } else {
            pieces.push(j.range());
        }
    }
    pieces.sort_by_key(|r| r.start);
    assert_eq!(pieces, vec![3..5, 5..7, 7..9, 9..11]);

    assert!(job.split().is_some());
    assert_eq!(job.range(), 3..7);
}
