//! Bulk work: a data-parallel stage chained after another sender.
//!
//! Connecting a `BulkSender` connects the previous sender to a `BulkReceiver` which
//! owns everything the bulk stage needs. Nothing is handed to the backend until the
//! previous sender has produced its value:
//!
//! ```text
//! previous --value(v)--> BulkReceiver
//!                          | box (function, v) into BulkArguments
//!                          | backend.bulk(size, BulkFunction -> BulkArguments)
//!                          | connect to BulkCompletion, start
//!                          v
//!             f(0, &v) .. f(size - 1, &v) on the backend
//!                          |
//!                          v
//!               BulkCompletion --value(v)--> receiver
//! ```
//!
//! The stopped and error signals of the previous sender are forwarded without
//! ever reaching the backend.

use crate::error::{ErrorPayload, SchedulerError};
use crate::interface::{BulkFunction, ReceiverShim};
use crate::receiver::Receiver;
use crate::scheduler::SchedulerHandle;
use crate::sender::{OperationState, Sender};

use aliasable::boxed::AliasableBox;

use std::marker::PhantomData;

/// The sender returned by `SchedulerHandle::bulk`.
#[derive(Clone)]
pub struct BulkSender<S, F> {
    scheduler: SchedulerHandle,
    previous: S,
    size: usize,
    function: F,
}

impl<S, F> BulkSender<S, F> {
    pub(crate) fn new(scheduler: SchedulerHandle, previous: S, size: usize, function: F) -> Self {
        BulkSender { scheduler, previous, size, function }
    }

    pub fn size(&self) -> usize { self.size }

    pub fn scheduler(&self) -> &SchedulerHandle { &self.scheduler }
}

impl<S, F> Sender for BulkSender<S, F>
where
    S: Sender,
    S::Output: Sync,
    F: Fn(usize, &S::Output) + Send + Sync + 'static,
{
    type Output = S::Output;
    type Operation<R: Receiver<S::Output> + 'static> = BulkOperation<S::Operation<BulkReceiver<S::Output, F, R>>>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<S::Output> + 'static,
    {
        let intermediate = BulkReceiver {
            scheduler: self.scheduler,
            size: self.size,
            function: self.function,
            receiver,
            _values: PhantomData,
        };

        BulkOperation {
            previous: self.previous.connect(intermediate),
        }
    }
}

/// A `BulkSender` connected to a receiver.
///
/// The backend's part of the operation only exists once the previous operation has
/// produced its value, so starting this starts the previous operation.
pub struct BulkOperation<Previous> {
    previous: Previous,
}

impl<Previous: OperationState> OperationState for BulkOperation<Previous> {
    fn start(self) {
        self.previous.start();
    }
}

/// Receives the completion of the previous sender and dispatches the bulk stage.
pub struct BulkReceiver<V, F, R> {
    scheduler: SchedulerHandle,
    size: usize,
    function: F,
    receiver: R,
    _values: PhantomData<fn(V)>,
}

/// The captured arguments of a bulk stage.
///
/// Allocated when the previous sender produces its values and read concurrently by
/// every index. The allocation is owned by the `BulkCompletion` while the backend
/// refers to it through a raw pointer, hence the aliasable box.
struct BulkArguments<V, F> {
    function: F,
    values: V,
}

unsafe fn call_bulk_function<V, F>(state: *const (), index: usize)
where
    F: Fn(usize, &V),
{
    let arguments = &*(state as *const BulkArguments<V, F>);
    (arguments.function)(index, &arguments.values);
}

impl<V, F, R> Receiver<V> for BulkReceiver<V, F, R>
where
    V: Send + Sync + 'static,
    F: Fn(usize, &V) + Send + Sync + 'static,
    R: Receiver<V> + 'static,
{
    fn set_value(self, values: V) {
        profiling::scope!("bulk:dispatch");

        let arguments = AliasableBox::from_unique(Box::new(BulkArguments {
            function: self.function,
            values,
        }));

        // SAFETY: `BulkArguments` is Sync and the backend is not allowed to call the
        // function after delivering the completion, which owns the arguments.
        let function = unsafe {
            let state: *const BulkArguments<V, F> = &*arguments;
            BulkFunction::new(state as *const (), call_bulk_function::<V, F>)
        };

        let work = match self.scheduler.backend().bulk(self.size, function) {
            Some(work) => work,
            None => {
                std::mem::drop(arguments);
                self.receiver.set_error(SchedulerError::BackendUnavailable.into());
                return;
            }
        };

        let op = work.connect(ReceiverShim::new(BulkCompletion {
            receiver: self.receiver,
            arguments,
        }));

        op.start();
    }

    fn set_stopped(self) {
        // Release the function before the receiver observes the completion.
        let BulkReceiver { receiver, function, .. } = self;
        std::mem::drop(function);
        receiver.set_stopped();
    }

    fn set_error(self, error: ErrorPayload) {
        let BulkReceiver { receiver, function, .. } = self;
        std::mem::drop(function);
        receiver.set_error(error);
    }
}

/// Receives the completion of the bulk stage from the backend.
struct BulkCompletion<V, F, R> {
    receiver: R,
    arguments: AliasableBox<BulkArguments<V, F>>,
}

impl<V, F, R> Receiver<()> for BulkCompletion<V, F, R>
where
    V: Send + Sync,
    F: Send + Sync,
    R: Receiver<V>,
{
    fn set_value(self, _: ()) {
        let arguments = AliasableBox::into_unique(self.arguments);
        let BulkArguments { function, values } = *arguments;
        // Release the function before the receiver observes the completion.
        std::mem::drop(function);
        self.receiver.set_value(values);
    }

    fn set_stopped(self) {
        std::mem::drop(self.arguments);
        self.receiver.set_stopped();
    }

    fn set_error(self, error: ErrorPayload) {
        std::mem::drop(self.arguments);
        self.receiver.set_error(error);
    }
}
