//! Blocking on the completion of a sender.

use crate::core::event::Event;
use crate::error::ErrorPayload;
use crate::receiver::{Completion, Receiver};
use crate::sender::{OperationState, Sender};

use aliasable::boxed::AliasableBox;

use std::cell::UnsafeCell;
use std::mem;

/// Connect and start `sender`, then block the current thread until it completes.
///
/// Returns `Ok(Some(value))` if the sender completed with a value, `Ok(None)` if it
/// was stopped and `Err(payload)` if it failed.
///
/// An operation that drops its receiver without completing it counts as stopped.
///
/// Don't call this from a worker of the backend the sender runs on: the worker
/// would block instead of processing the work it waits for.
pub fn sync_wait<S: Sender>(sender: S) -> Result<Option<S::Output>, ErrorPayload> {
    profiling::scope!("sync_wait");

    let state = AliasableBox::from_unique(Box::new(WaitState {
        event: Event::new(1),
        slot: ResultSlot::new(),
    }));

    let receiver = WaitReceiver { state: &*state };

    sender.connect(receiver).start();

    state.event.wait();

    // SAFETY: the event was signaled after the slot was set, and no other thread
    // touches the state after that.
    match unsafe { state.slot.take() } {
        Completion::Value(value) => Ok(Some(value)),
        Completion::Stopped => Ok(None),
        Completion::Error(error) => Err(error),
    }
}

struct WaitState<V> {
    event: Event,
    slot: ResultSlot<Completion<V>>,
}

/// An unsynchronized slot written once by the receiver, read once by the waiting thread.
/// The event orders the two.
struct ResultSlot<T> {
    cell: UnsafeCell<Option<T>>,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        ResultSlot { cell: UnsafeCell::new(None) }
    }

    /// Safety: must be called at most once, before the event is signaled.
    unsafe fn set(&self, payload: T) {
        debug_assert!((*self.cell.get()).is_none());
        *self.cell.get() = Some(payload);
    }

    /// Safety: must be called after the event was signaled.
    unsafe fn take(&self) -> T {
        match (*self.cell.get()).take() {
            Some(payload) => payload,
            None => unreachable!("result slot read before being set"),
        }
    }
}

struct WaitReceiver<V> {
    state: *const WaitState<V>,
}

// The waiting thread keeps the state alive until the event is signaled.
unsafe impl<V: Send> Send for WaitReceiver<V> {}

impl<V> WaitReceiver<V> {
    fn complete(self, completion: Completion<V>) {
        let state = self.state;
        mem::forget(self);

        unsafe {
            (*state).slot.set(completion);
            // Past this point the state may be deallocated.
            (*state).event.signal_one();
        }
    }
}

impl<V: Send> Receiver<V> for WaitReceiver<V> {
    fn set_value(self, value: V) {
        self.complete(Completion::Value(value));
    }

    fn set_stopped(self) {
        self.complete(Completion::Stopped);
    }

    fn set_error(self, error: ErrorPayload) {
        self.complete(Completion::Error(error));
    }
}

impl<V> Drop for WaitReceiver<V> {
    fn drop(&mut self) {
        // Dropped without being completed.
        unsafe {
            (*self.state).slot.set(Completion::Stopped);
            (*self.state).event.signal_one();
        }
    }
}
