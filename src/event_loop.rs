//! A single-threaded backend.
//!
//! `ManualEventLoop` is a FIFO queue of tasks drained by whichever thread calls `run`.
//! `SingleThreadContext` owns a loop and the thread driving it.

use crate::error::SchedulerError;
use crate::interface::{
    AbstractOperationState, AbstractScheduler, AbstractSender, BulkFunction, ForwardProgress,
    ReceiverShim,
};
use crate::scheduler::SchedulerHandle;
use crate::sync::{Arc, Condvar, Mutex};

use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LoopState {
    Running,
    // `finish` was called, `run` returns once the queue is empty.
    Finishing,
    // `run` returned after `finish`, or a task panicked. Nothing will drain the queue anymore.
    Finished,
}

struct Task {
    work: Work,
    receiver: ReceiverShim,
}

impl Task {
    fn execute(self) {
        match self.work {
            Work::Schedule => self.receiver.set_value(),
            Work::Bulk { size, function } => run_bulk(size, function, self.receiver),
        }
    }
}

struct Queue {
    tasks: VecDeque<Task>,
    state: LoopState,
}

struct LoopShared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl LoopShared {
    fn is_finished(&self) -> bool {
        self.queue.lock().unwrap().state == LoopState::Finished
    }

    /// Queue the work, or fail it if the loop won't run anymore.
    fn submit(&self, work: Work, receiver: ReceiverShim) {
        let mut queue = self.queue.lock().unwrap();
        if queue.state == LoopState::Finished {
            mem::drop(queue);
            receiver.set_error(SchedulerError::BackendUnavailable.into());
            return;
        }

        queue.tasks.push_back(Task { work, receiver });
        self.cond.notify_one();
    }

    /// Stop the loop for good and fail whatever is still queued.
    fn abandon(&self) {
        let tasks = {
            let mut queue = self.queue.lock().unwrap();
            queue.state = LoopState::Finished;
            mem::take(&mut queue.tasks)
        };

        tracing::warn!(queued = tasks.len(), "event loop task panicked, stopping the loop");

        for task in tasks {
            task.receiver.set_error(SchedulerError::BackendUnavailable.into());
        }
    }
}

/// A run loop executing tasks in submission order on the thread that calls `run`.
///
/// Clones refer to the same loop.
#[derive(Clone)]
pub struct ManualEventLoop {
    shared: Arc<LoopShared>,
    scheduler: SchedulerHandle,
}

impl ManualEventLoop {
    pub fn new() -> Self {
        let shared = Arc::new(LoopShared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                state: LoopState::Running,
            }),
            cond: Condvar::new(),
        });

        // The handle needs a std `Arc` to hold a trait object.
        let scheduler = SchedulerHandle::new(std::sync::Arc::new(LoopScheduler {
            shared: Arc::clone(&shared),
        }));

        ManualEventLoop { shared, scheduler }
    }

    pub fn get_scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone()
    }

    /// Execute tasks until `finish` has been called and the queue is empty.
    ///
    /// If a task panics (a receiver panicked while being completed), the loop is
    /// finished, the remaining tasks fail with `SchedulerError::BackendUnavailable`
    /// and the panic resumes in the caller.
    pub fn run(&self) {
        loop {
            let task = {
                let mut queue = self.shared.queue.lock().unwrap();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }

                    if queue.state != LoopState::Running {
                        queue.state = LoopState::Finished;
                        return;
                    }

                    queue = self.shared.cond.wait(queue).unwrap();
                }
            };

            profiling::scope!("event_loop:task");
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
                self.shared.abandon();
                panic::resume_unwind(payload);
            }
        }
    }

    /// Ask `run` to return once the queue is empty.
    ///
    /// Tasks can still be submitted until `run` returns.
    pub fn finish(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.state == LoopState::Running {
            queue.state = LoopState::Finishing;
        }
        self.shared.cond.notify_all();
    }
}

impl Default for ManualEventLoop {
    fn default() -> Self {
        ManualEventLoop::new()
    }
}

struct LoopScheduler {
    shared: Arc<LoopShared>,
}

impl AbstractScheduler for LoopScheduler {
    fn forward_progress_guarantee(&self) -> ForwardProgress {
        ForwardProgress::Parallel
    }

    fn schedule(&self) -> Option<Box<dyn AbstractSender>> {
        if self.shared.is_finished() {
            return None;
        }

        Some(Box::new(LoopSender {
            shared: Arc::clone(&self.shared),
            work: Work::Schedule,
        }))
    }

    fn bulk(&self, size: usize, function: BulkFunction) -> Option<Box<dyn AbstractSender>> {
        if self.shared.is_finished() {
            return None;
        }

        Some(Box::new(LoopSender {
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

struct LoopSender {
    shared: Arc<LoopShared>,
    work: Work,
}

impl AbstractSender for LoopSender {
    fn connect(self: Box<Self>, receiver: ReceiverShim) -> Box<dyn AbstractOperationState> {
        Box::new(LoopOperation {
            shared: self.shared,
            work: self.work,
            receiver,
        })
    }
}

struct LoopOperation {
    shared: Arc<LoopShared>,
    work: Work,
    receiver: ReceiverShim,
}

impl AbstractOperationState for LoopOperation {
    fn start(self: Box<Self>) {
        let LoopOperation { shared, work, receiver } = *self;
        shared.submit(work, receiver);
    }
}

fn run_bulk(size: usize, function: BulkFunction, receiver: ReceiverShim) {
    profiling::scope!("event_loop:bulk");

    let mut first_panic = None;
    for index in 0..size {
        // SAFETY: the receiver, which keeps the function's state alive, isn't completed yet.
        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe { function.call(index) }));
        if result.is_err() && first_panic.is_none() {
            first_panic = Some(index);
        }
    }

    match first_panic {
        None => receiver.set_value(),
        Some(index) => receiver.set_error(SchedulerError::BulkPanicked { index }.into()),
    }
}

/// An event loop driven by a dedicated thread.
///
/// Dropping the context finishes the loop and joins its thread after the queued
/// tasks have run.
pub struct SingleThreadContext {
    event_loop: ManualEventLoop,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl SingleThreadContext {
    pub fn new() -> Self {
        let event_loop = ManualEventLoop::new();
        let runner = event_loop.clone();

        let thread = match thread::Builder::new()
            .name("sysexec-loop".to_string())
            .spawn(move || {
                profiling::register_thread!("EventLoop");
                tracing::trace!("event loop thread started");
                runner.run();
                tracing::trace!("event loop thread exiting");
            }) {
            Ok(thread) => thread,
            Err(err) => panic!("failed to spawn the event loop thread: {}", err),
        };

        SingleThreadContext {
            thread_id: thread.thread().id(),
            thread: Some(thread),
            event_loop,
        }
    }

    pub fn get_scheduler(&self) -> SchedulerHandle {
        self.event_loop.get_scheduler()
    }

    /// The thread tasks run on.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Default for SingleThreadContext {
    fn default() -> Self {
        SingleThreadContext::new()
    }
}

impl Drop for SingleThreadContext {
    fn drop(&mut self) {
        self.event_loop.finish();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("event loop thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{receiver_fn, Completion};
    use crate::receiver::Receiver;
    use crate::sender::{OperationState, Sender};
    use std::sync::mpsc;

    #[test]
    fn manual_loop_runs_in_fifo_order() {
        let event_loop = ManualEventLoop::new();
        let scheduler = event_loop.get_scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            scheduler.schedule().connect(receiver_fn(move |completion: Completion<()>| {
                assert!(completion.is_value());
                order.lock().unwrap().push(i);
            })).start();
        }

        // Nothing runs until someone drives the loop.
        assert!(order.lock().unwrap().is_empty());

        event_loop.finish();
        event_loop.run();

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());

        // The loop is done, new work is refused.
        let (tx, rx) = mpsc::channel();
        scheduler.schedule().connect(receiver_fn(move |completion: Completion<()>| {
            tx.send(completion.is_error()).unwrap();
        })).start();
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn single_thread_context_runs_on_its_thread() {
        let ctx = SingleThreadContext::new();
        let expected = ctx.thread_id();

        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            ctx.get_scheduler().schedule().connect(receiver_fn(move |_: Completion<()>| {
                tx.send((i, thread::current().id())).unwrap();
            })).start();
        }

        for i in 0..5 {
            assert_eq!(rx.recv().unwrap(), (i, expected));
        }
    }

    #[test]
    fn drop_drains_queued_tasks() {
        let (tx, rx) = mpsc::channel();
        {
            let ctx = SingleThreadContext::new();
            for _ in 0..100 {
                let tx = tx.clone();
                ctx.get_scheduler().schedule().connect(receiver_fn(move |_: Completion<()>| {
                    tx.send(()).unwrap();
                })).start();
            }
        }
        std::mem::drop(tx);

        assert_eq!(rx.iter().count(), 100);
    }

    fn send_completion(tx: &mpsc::Sender<Completion<()>>) -> impl Receiver<()> + 'static {
        let tx = tx.clone();
        receiver_fn(move |completion: Completion<()>| {
            let _ = tx.send(completion);
        })
    }

    fn assert_unavailable(completion: Completion<()>) {
        match completion {
            Completion::Error(payload) => assert_eq!(
                payload.downcast_ref::<SchedulerError>(),
                Some(&SchedulerError::BackendUnavailable)
            ),
            _ => panic!("expected BackendUnavailable"),
        }
    }

    #[test]
    fn panicking_receiver_stops_the_loop() {
        let event_loop = ManualEventLoop::new();
        let scheduler = event_loop.get_scheduler();
        let (tx, rx) = mpsc::channel();

        scheduler.schedule().connect(receiver_fn(|_: Completion<()>| {
            panic!("receiver panicked");
        })).start();
        // Queued behind the panicking task.
        scheduler.schedule().connect(send_completion(&tx)).start();

        let runner = event_loop.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(move || runner.run()));
        assert!(result.is_err());

        assert_unavailable(rx.try_recv().unwrap());

        // Later work is refused instead of piling up in a dead queue.
        scheduler.schedule().connect(send_completion(&tx)).start();
        assert_unavailable(rx.try_recv().unwrap());
    }

    #[test]
    fn single_thread_context_survives_a_panicking_receiver() {
        let ctx = SingleThreadContext::new();
        let scheduler = ctx.get_scheduler();
        let (tx, rx) = mpsc::channel();

        scheduler.schedule().connect(receiver_fn(|_: Completion<()>| {
            panic!("receiver panicked");
        })).start();
        scheduler.schedule().connect(send_completion(&tx)).start();

        let completion = rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("the operation never completed");
        assert_unavailable(completion);
    }
}
