use super::sync::{Ordering, AtomicI32, Mutex, Condvar};

use crossbeam_utils::Backoff;

const STATE_DEFAULT: i32 = 0;
const STATE_SIGNALING: i32 = 1;
const STATE_SIGNALED: i32 = 2;

/// A countdown of dependencies that threads can block on.
///
/// The completion of dependencies is communicated to the event by calling `Event::signal`.
/// The thread that resolves the last dependency is told so by `signal` returning `true`.
pub struct Event {
    // The number of unresolved dependency.
    deps: AtomicI32,
    // Whether the dependencies has been met AND it is safe to deallocate the event.
    // We can't simply use deps, because we need to keep the object alive for a little
    // bit after deps reach zero.
    //
    // No read or write to the event is safe after state is set to STATE_SIGNALED,
    // except for the threads that owns the event (the one that calls wait).
    state: AtomicI32,
    // A condition variable and its mutex to wait on once spinning didn't do it.
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Event {
    pub const MAX_DEPENDECIES: u32 = i32::MAX as u32;

    pub fn new(deps: u32) -> Self {
        debug_assert!(deps <= Self::MAX_DEPENDECIES);

        let state = if deps == 0 {
            STATE_SIGNALED
        } else {
            STATE_DEFAULT
        };

        Event {
            deps: AtomicI32::new(deps as i32),
            state: AtomicI32::new(state),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn signal_one(&self) -> bool {
        self.signal(1)
    }

    /// Resolve `n` dependencies.
    ///
    /// Returns true if this call resolved the last one.
    pub fn signal(&self, n: u32) -> bool {
        debug_assert!(!self.is_signaled(), "already signaled {:?}", self as *const _);
        debug_assert!(self.deps.load(Ordering::SeqCst) >= n as i32);

        if n == 0 {
            return false;
        }

        profiling::scope!("signal");
        let n = n as i32;
        let deps = self.deps.fetch_sub(n, Ordering::AcqRel) - n;

        if deps > 0 {
            // After reading deps, it isn't guaranteed that self is valid except for the
            // one thread which signaled the last dependency (the one thread not taking this
            // branch).
            return false;
        }

        debug_assert!(deps == 0, "signaled too many time");

        self.state.store(STATE_SIGNALING, Ordering::SeqCst);

        {
            std::mem::drop(self.mutex.lock().unwrap());

            self.cond.notify_all();
        }

        // It is important to mark this atomic after setting the event.
        // When waiting we can only assume that the wait is over when this atomic
        // is set, waking up from the condvar is not sufficient. This is because
        // we have to make sure this store can safely happen.
        // If we'd do the store before notifying, then notifying
        // would not be safe because the waiting thread might have continued from
        // an early-out on the state check. The waiting thread is responsible
        // for keeping the event alive until state has been set.
        self.state.store(STATE_SIGNALED, Ordering::Release);

        // After the state store above, self isn't guaranteed to be valid.

        true
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SIGNALED
    }

    /// Wait until all dependencies of this event are met, and until
    /// it is safe to destroy the event (no other threads are going to read or write
    /// into it).
    pub fn wait(&self) {
        profiling::scope!("wait");

        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.is_signaled() {
                return;
            }
            backoff.snooze();
        }

        // Slower path: using the condition variable.
        {
            profiling::scope!("wait(condvar)");
            let mut guard = self.mutex.lock().unwrap();
            while self.state.load(Ordering::Acquire) == STATE_DEFAULT {
                guard = self.cond.wait(guard).unwrap();
            }
        }

        // We have to spin until state has been stored to ensure that it is safe
        // for the signaling thread to do the store operation.
        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) != STATE_SIGNALED {
            backoff.snooze();

            #[cfg(loom)]
            loom::thread::yield_now();
        }
    }
}

unsafe impl Sync for Event {}
unsafe impl Send for Event {}

#[test]
fn countdown() {
    let event = Event::new(3);
    assert!(!event.signal(2));
    assert!(!event.is_signaled());
    assert!(event.signal_one());
    assert!(event.is_signaled());
    event.wait();

    let empty = Event::new(0);
    assert!(empty.is_signaled());
    empty.wait();
}

#[test]
fn wait_across_threads() {
    for _ in 0..100 {
        let event = std::sync::Arc::new(Event::new(4));

        let threads: Vec<_> = (0..4).map(|_| {
            let event = event.clone();
            std::thread::spawn(move || event.signal(1))
        }).collect();

        event.wait();

        let last_signals = threads.into_iter()
            .map(|t| t.join().unwrap())
            .filter(|last| *last)
            .count();

        assert_eq!(last_signals, 1);
    }
}
