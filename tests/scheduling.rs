use sysexec::interface::{AbstractScheduler, AbstractSender, BulkFunction};
use sysexec::*;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Counts every signal it receives and forwards the completion to a channel.
struct Recorder<V> {
    signals: Arc<AtomicU32>,
    sender: mpsc::Sender<Completion<V>>,
}

fn recorder<V>() -> (Recorder<V>, Arc<AtomicU32>, mpsc::Receiver<Completion<V>>) {
    let signals = Arc::new(AtomicU32::new(0));
    let (sender, receiver) = mpsc::channel();
    (Recorder { signals: signals.clone(), sender }, signals, receiver)
}

impl<V: Send> Recorder<V> {
    fn record(self, completion: Completion<V>) {
        self.signals.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(completion);
    }
}

impl<V: Send> Receiver<V> for Recorder<V> {
    fn set_value(self, value: V) { self.record(Completion::Value(value)) }
    fn set_stopped(self) { self.record(Completion::Stopped) }
    fn set_error(self, error: ErrorPayload) { self.record(Completion::Error(error)) }
}

/// Waits for the single completion and checks that no other one follows.
fn single_completion<V>(signals: &AtomicU32, rx: &mpsc::Receiver<Completion<V>>) -> Completion<V> {
    let completion = rx.recv_timeout(Duration::from_secs(10)).expect("no completion");
    assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(signals.load(Ordering::SeqCst), 1);
    completion
}

fn pool_context(workers: u32) -> (ThreadPool, ExecutionContext) {
    let pool = ThreadPool::builder().with_worker_threads(workers).build();
    let ctx = ExecutionContext::with_thread_pool(&pool);
    (pool, ctx)
}

#[test]
fn schedule_completes_once() {
    let (pool, ctx) = pool_context(4);
    assert_eq!(ctx.max_concurrency(), 4);

    let (receiver, signals, rx) = recorder::<()>();
    ctx.get_scheduler().schedule().connect(receiver).start();

    assert!(single_completion(&signals, &rx).is_value());

    pool.shut_down().wait();
}

#[test]
fn bulk_runs_every_index_with_previous_value() {
    let (pool, ctx) = pool_context(4);
    let scheduler = ctx.get_scheduler();

    let entries = Arc::new(Mutex::new(Vec::new()));
    let record = entries.clone();

    let work = scheduler.schedule().then(|()| 7);
    let work = scheduler.bulk(work, 5, move |index, value: &i32| {
        record.lock().unwrap().push((index, *value));
    });

    let (receiver, signals, rx) = recorder();
    work.connect(receiver).start();

    match single_completion(&signals, &rx) {
        Completion::Value(value) => assert_eq!(value, 7),
        other => panic!("unexpected completion {:?}", other),
    }

    let mut entries = entries.lock().unwrap().clone();
    entries.sort();
    assert_eq!(entries, vec![(0, 7), (1, 7), (2, 7), (3, 7), (4, 7)]);

    pool.shut_down().wait();
}

#[test]
fn bulk_forwards_stopped_without_running() {
    let (pool, ctx) = pool_context(2);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let work = ctx.get_scheduler().bulk(just_stopped::<i32>(), 5, move |_, _: &i32| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (receiver, signals, rx) = recorder();
    work.connect(receiver).start();

    assert!(single_completion(&signals, &rx).is_stopped());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    pool.shut_down().wait();
}

#[test]
fn bulk_forwards_error_without_running() {
    #[derive(Debug, PartialEq)]
    struct E(u32);

    let (pool, ctx) = pool_context(2);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let work = ctx.get_scheduler().bulk(just_error::<i32, _>(E(3)), 5, move |_, _: &i32| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (receiver, signals, rx) = recorder();
    work.connect(receiver).start();

    match single_completion(&signals, &rx) {
        Completion::Error(payload) => assert_eq!(payload.downcast::<E>().ok(), Some(E(3))),
        other => panic!("unexpected completion {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    pool.shut_down().wait();
}

#[test]
fn exactly_once_under_load() {
    let (pool, ctx) = pool_context(4);
    let scheduler = ctx.get_scheduler();

    let signals = Arc::new(AtomicU32::new(0));
    let (tx, rx) = mpsc::channel();
    let count = 200;

    for i in 0..count {
        let receiver = Recorder { signals: signals.clone(), sender: tx.clone() };
        let work = scheduler.bulk(scheduler.schedule().then(move |()| i), i % 17, |_, _: &usize| {});
        work.connect(receiver).start();
    }

    let mut values: Vec<usize> = (0..count)
        .map(|_| match rx.recv_timeout(Duration::from_secs(10)).expect("missing completion") {
            Completion::Value(v) => v,
            other => panic!("unexpected completion {:?}", other),
        })
        .collect();
    values.sort();

    assert_eq!(values, (0..count).collect::<Vec<_>>());
    assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(signals.load(Ordering::SeqCst), count as u32);

    pool.shut_down().wait();
}

#[test]
fn bulk_fan_out_completeness() {
    let (pool, ctx) = pool_context(3);
    let scheduler = ctx.get_scheduler();

    for &size in &[0usize, 1, 5, 100, 4096] {
        let counters: Arc<Vec<AtomicU32>> = Arc::new((0..size).map(|_| AtomicU32::new(0)).collect());
        let c = counters.clone();

        let work = scheduler.bulk(just(()), size, move |index, _: &()| {
            c[index].fetch_add(1, Ordering::SeqCst);
        });

        let (receiver, signals, rx) = recorder();
        work.connect(receiver).start();
        assert!(single_completion(&signals, &rx).is_value());

        // The completion happens after every index ran.
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    pool.shut_down().wait();
}

#[test]
fn bulk_indices_share_the_values() {
    let (pool, ctx) = pool_context(4);
    let scheduler = ctx.get_scheduler();

    let addresses = Arc::new(Mutex::new(Vec::new()));
    let record = addresses.clone();

    let work = scheduler.bulk(just(vec![1u8; 16]), 64, move |_, values: &Vec<u8>| {
        assert_eq!(values, &vec![1u8; 16]);
        record.lock().unwrap().push(values.as_ptr() as usize);
    });

    assert_eq!(sync_wait(work).unwrap(), Some(vec![1u8; 16]));

    let addresses = addresses.lock().unwrap();
    assert_eq!(addresses.len(), 64);
    assert!(addresses.iter().all(|a| *a == addresses[0]));

    pool.shut_down().wait();
}

#[test]
fn bulk_panic_runs_remaining_indices() {
    let (pool, ctx) = pool_context(2);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let work = ctx.get_scheduler().bulk(just(()), 10, move |index, _: &()| {
        counter.fetch_add(1, Ordering::SeqCst);
        if index == 4 {
            panic!("index 4");
        }
    });

    let error = sync_wait(work).unwrap_err();
    assert_eq!(
        error.downcast_ref::<SchedulerError>(),
        Some(&SchedulerError::BulkPanicked { index: 4 })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 10);

    pool.shut_down().wait();
}

#[test]
fn scheduler_equality() {
    let (pool, ctx1) = pool_context(1);
    let ctx2 = ExecutionContext::with_thread_pool(&pool);

    assert_eq!(ctx1.get_scheduler(), ctx1.get_scheduler());
    assert_eq!(ctx1.get_scheduler(), ctx1.get_scheduler().schedule().scheduler().clone());
    assert_ne!(ctx1.get_scheduler(), ctx2.get_scheduler());

    let default1 = ExecutionContext::new();
    let default2 = ExecutionContext::new();
    assert_eq!(default1.get_scheduler(), default1.clone().get_scheduler());
    assert_ne!(default1.get_scheduler(), default2.get_scheduler());

    pool.shut_down().wait();
}

#[test]
fn default_context_runs_work() {
    let ctx = ExecutionContext::default();
    let scheduler = ctx.get_scheduler();
    assert_eq!(scheduler.forward_progress_guarantee(), ForwardProgress::Parallel);

    let total = Arc::new(AtomicU32::new(0));
    let t = total.clone();
    let work = scheduler.bulk(scheduler.schedule().then(|()| 2u32), 50, move |_, v: &u32| {
        t.fetch_add(*v, Ordering::SeqCst);
    });

    assert_eq!(sync_wait(work).unwrap(), Some(2));
    assert_eq!(total.load(Ordering::SeqCst), 100);
}

/// A backend that never has work objects to give.
struct Unavailable;

impl AbstractScheduler for Unavailable {
    fn forward_progress_guarantee(&self) -> ForwardProgress { ForwardProgress::WeaklyParallel }
    fn schedule(&self) -> Option<Box<dyn AbstractSender>> { None }
    fn bulk(&self, _: usize, _: BulkFunction) -> Option<Box<dyn AbstractSender>> { None }
}

#[test]
fn unavailable_backend_surfaces_an_error() {
    let ctx = ExecutionContext::with_backend(Arc::new(Unavailable), 1);
    let scheduler = ctx.get_scheduler();
    assert_eq!(scheduler.forward_progress_guarantee(), ForwardProgress::WeaklyParallel);

    let error = sync_wait(scheduler.schedule()).unwrap_err();
    assert_eq!(error.downcast_ref::<SchedulerError>(), Some(&SchedulerError::BackendUnavailable));

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let work = scheduler.bulk(just(1), 3, move |_, _: &i32| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (receiver, signals, rx) = recorder();
    work.connect(receiver).start();
    match single_completion(&signals, &rx) {
        Completion::Error(payload) => assert!(payload.is::<SchedulerError>()),
        other => panic!("unexpected completion {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn single_thread_context_bulk() {
    let ctx = SingleThreadContext::new();
    let scheduler = ctx.get_scheduler();
    let thread = ctx.thread_id();

    let order = Arc::new(Mutex::new(Vec::new()));
    let record = order.clone();
    let work = scheduler.bulk(scheduler.schedule().then(|()| "x"), 6, move |index, _: &&str| {
        assert_eq!(std::thread::current().id(), thread);
        record.lock().unwrap().push(index);
    });

    assert_eq!(sync_wait(work).unwrap(), Some("x"));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn shut_down_pool_reports_unavailable() {
    let (pool, ctx) = pool_context(2);
    pool.shut_down().wait();

    let error = sync_wait(ctx.get_scheduler().schedule()).unwrap_err();
    assert_eq!(error.downcast_ref::<SchedulerError>(), Some(&SchedulerError::BackendUnavailable));
}

#[test]
fn bulk_releases_captured_function() {
    let (pool, ctx) = pool_context(3);
    let scheduler = ctx.get_scheduler();
    let captured = Arc::new(());

    // Value completion on the pool.
    let c = captured.clone();
    let work = scheduler.bulk(scheduler.schedule().then(|()| 1u32), 32, move |_, _: &u32| {
        let _ = &c;
    });
    assert_eq!(sync_wait(work).unwrap(), Some(1));
    assert_eq!(Arc::strong_count(&captured), 1);

    // Stopped and error short-circuits.
    let c = captured.clone();
    let work = scheduler.bulk(just_stopped::<u32>(), 4, move |_, _: &u32| {
        let _ = &c;
    });
    assert_eq!(sync_wait(work).unwrap(), None);
    assert_eq!(Arc::strong_count(&captured), 1);

    let c = captured.clone();
    let work = scheduler.bulk(just_error::<u32, _>("failed"), 4, move |_, _: &u32| {
        let _ = &c;
    });
    assert!(sync_wait(work).is_err());
    assert_eq!(Arc::strong_count(&captured), 1);

    // The backend has no work object for the bulk stage.
    let unavailable = ExecutionContext::with_backend(Arc::new(Unavailable), 1).get_scheduler();
    let c = captured.clone();
    let work = unavailable.bulk(just(2u32), 4, move |_, _: &u32| {
        let _ = &c;
    });
    assert!(sync_wait(work).is_err());
    assert_eq!(Arc::strong_count(&captured), 1);

    pool.shut_down().wait();
}
