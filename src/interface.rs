//! The boundary between the generic scheduling layer and execution backends.
//!
//! Everything on the generic side of this module is statically typed. A backend only
//! sees trait objects and two type-erased helpers:
//!
//! - `ReceiverShim`: an owned, type-erased receiver. It is made of an opaque pointer
//!   and a static table of function pointers, very much like a `RawWaker`.
//! - `BulkFunction`: an opaque state pointer and the function to call for each index
//!   of a bulk stage.
//!
//! This is the only place where dynamic dispatch is used.

use crate::error::ErrorPayload;
use crate::receiver::Receiver;

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;

/// How work items submitted to a scheduler make progress relative to each other.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ForwardProgress {
    /// Work items may block on each other; each one eventually runs.
    Concurrent,
    /// Once a work item has started it makes progress independently of others.
    Parallel,
    /// Work items are only guaranteed to make progress once they have started,
    /// and only while others are not making progress.
    WeaklyParallel,
}

/// A scheduler implemented by an execution backend.
pub trait AbstractScheduler: Send + Sync {
    /// Identity comparison with another backend scheduler.
    fn equals(&self, other: &dyn AbstractScheduler) -> bool {
        ptr::addr_eq(self as *const Self, other as *const dyn AbstractScheduler)
    }

    fn forward_progress_guarantee(&self) -> ForwardProgress;

    /// Produces a work object that completes with a value once it has been picked up
    /// by the backend.
    ///
    /// Returns `None` if the backend can't accept work.
    fn schedule(&self) -> Option<Box<dyn AbstractSender>>;

    /// Produces a work object that calls `function` once for each index in `0..size`
    /// and completes with a value after all calls have returned.
    ///
    /// The backend must stop using `function` before delivering the completion.
    ///
    /// Returns `None` if the backend can't accept work.
    fn bulk(&self, size: usize, function: BulkFunction) -> Option<Box<dyn AbstractSender>>;
}

/// A unit of backend work that isn't bound to a receiver yet.
pub trait AbstractSender: Send {
    fn connect(self: Box<Self>, receiver: ReceiverShim) -> Box<dyn AbstractOperationState>;
}

/// Backend work bound to a receiver.
///
/// Dropping it without starting it drops the receiver without completing it.
pub trait AbstractOperationState: Send {
    /// Submit the work. The receiver is completed exactly once, possibly on another thread
    /// and possibly before this function returns.
    fn start(self: Box<Self>);
}

/// The functions to manipulate a type-erased receiver.
struct ReceiverVTable {
    set_value: unsafe fn(*mut ()),
    set_stopped: unsafe fn(*mut ()),
    set_error: unsafe fn(*mut (), ErrorPayload),
    drop: unsafe fn(*mut ()),
}

/// A type-erased receiver of `()`, handed to backends.
///
/// The shim owns the receiver: each completion method consumes it, and dropping the shim
/// without completing it drops the receiver.
pub struct ReceiverShim {
    receiver: *mut (),
    vtable: &'static ReceiverVTable,
}

// The receiver was Send before being erased.
unsafe impl Send for ReceiverShim {}

struct ErasedReceiver<R>(std::marker::PhantomData<R>);

impl<R: Receiver<()> + 'static> ErasedReceiver<R> {
    const VTABLE: ReceiverVTable = ReceiverVTable {
        set_value: Self::set_value,
        set_stopped: Self::set_stopped,
        set_error: Self::set_error,
        drop: Self::drop,
    };

    unsafe fn set_value(receiver: *mut ()) {
        Box::from_raw(receiver as *mut R).set_value(());
    }

    unsafe fn set_stopped(receiver: *mut ()) {
        Box::from_raw(receiver as *mut R).set_stopped();
    }

    unsafe fn set_error(receiver: *mut (), error: ErrorPayload) {
        Box::from_raw(receiver as *mut R).set_error(error);
    }

    unsafe fn drop(receiver: *mut ()) {
        let _ = Box::from_raw(receiver as *mut R);
    }
}

impl ReceiverShim {
    pub fn new<R: Receiver<()> + 'static>(receiver: R) -> Self {
        ReceiverShim {
            receiver: Box::into_raw(Box::new(receiver)) as *mut (),
            vtable: &ErasedReceiver::<R>::VTABLE,
        }
    }

    pub fn set_value(self) {
        let this = ManuallyDrop::new(self);
        unsafe { (this.vtable.set_value)(this.receiver) }
    }

    pub fn set_stopped(self) {
        let this = ManuallyDrop::new(self);
        unsafe { (this.vtable.set_stopped)(this.receiver) }
    }

    pub fn set_error(self, error: ErrorPayload) {
        let this = ManuallyDrop::new(self);
        unsafe { (this.vtable.set_error)(this.receiver, error) }
    }
}

impl Drop for ReceiverShim {
    fn drop(&mut self) {
        unsafe { (self.vtable.drop)(self.receiver) }
    }
}

impl Receiver<()> for ReceiverShim {
    fn set_value(self, _: ()) { ReceiverShim::set_value(self) }
    fn set_stopped(self) { ReceiverShim::set_stopped(self) }
    fn set_error(self, error: ErrorPayload) { ReceiverShim::set_error(self, error) }
}

impl fmt::Debug for ReceiverShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverShim").field("receiver", &self.receiver).finish()
    }
}

/// The per-index function of a bulk stage, with its state erased.
///
/// Can be called concurrently from any number of threads. The state pointer is
/// guaranteed to be valid until the completion of the bulk operation it was given
/// to is delivered, or until that operation is dropped.
#[derive(Copy, Clone, Debug)]
pub struct BulkFunction {
    state: *const (),
    call_fn: unsafe fn(*const (), usize),
}

unsafe impl Send for BulkFunction {}
unsafe impl Sync for BulkFunction {}

impl BulkFunction {
    /// # Safety
    ///
    /// `call_fn(state, index)` must be safe to call concurrently from any thread
    /// for every index passed to `call`, for as long as the bulk work is running.
    pub unsafe fn new(state: *const (), call_fn: unsafe fn(*const (), usize)) -> Self {
        BulkFunction { state, call_fn }
    }

    /// Calls the function for one index.
    ///
    /// # Safety
    ///
    /// Must only be called by the backend that received this function, before the
    /// completion of the corresponding bulk operation.
    #[inline]
    pub unsafe fn call(&self, index: usize) {
        (self.call_fn)(self.state, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{receiver_fn, Completion};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountOnDrop(Arc<AtomicU32>);

    impl Drop for CountOnDrop {
        fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    #[test]
    fn shim_forwards_exactly_one_signal() {
        let values = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let drops = Arc::new(AtomicU32::new(0));

        for i in 0..3 {
            let v = values.clone();
            let e = errors.clone();
            let guard = CountOnDrop(drops.clone());
            let shim = ReceiverShim::new(receiver_fn(move |completion: Completion<()>| {
                let _guard = guard;
                match completion {
                    Completion::Value(()) => { v.fetch_add(1, Ordering::SeqCst); }
                    Completion::Error(payload) => {
                        assert_eq!(payload.downcast_ref::<i32>(), Some(&7));
                        e.fetch_add(1, Ordering::SeqCst);
                    }
                    Completion::Stopped => {}
                }
            }));

            match i {
                0 => shim.set_value(),
                1 => shim.set_error(ErrorPayload::new(7i32)),
                _ => shim.set_stopped(),
            }
        }

        assert_eq!(values.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropped_shim_releases_receiver() {
        let drops = Arc::new(AtomicU32::new(0));
        let guard = CountOnDrop(drops.clone());
        let shim = ReceiverShim::new(receiver_fn(move |_: Completion<()>| {
            let _guard = guard;
            panic!("must not be completed");
        }));

        std::mem::drop(shim);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bulk_function_recovers_state() {
        let counter = AtomicU32::new(0);
        unsafe fn add(state: *const (), index: usize) {
            (*(state as *const AtomicU32)).fetch_add(index as u32, Ordering::SeqCst);
        }

        let function = unsafe { BulkFunction::new(&counter as *const _ as *const (), add) };
        for i in 0..5 {
            unsafe { function.call(i) };
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
