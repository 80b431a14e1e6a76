//! Senders describe deferred work, operation states are the live record of
//! a sender bound to a receiver.
//!
//! ```text
//! sender --connect(receiver)--> operation state --start()--> one completion
//! ```
//!
//! Composition is entirely static: adaptors like `Then` wrap the receiver type of the
//! sender they adapt, so a chain of senders connects into a single, concrete operation
//! state type without any boxing.

use crate::error::{ErrorPayload, SchedulerError};
use crate::receiver::Receiver;

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

/// The live state of an operation.
///
/// `start` consumes the state so that an operation can't be started twice.
pub trait OperationState {
    fn start(self);
}

/// An immutable description of deferred work that completes through a `Receiver`.
///
/// Connecting consumes the sender. Senders that implement `Clone` can be cloned
/// to be connected several times; each connection is independent.
pub trait Sender: Send + Sized {
    /// The value the work completes with.
    type Output: Send + 'static;

    type Operation<R: Receiver<Self::Output> + 'static>: OperationState;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Self::Output> + 'static;
}

/// Combinators available on every sender.
pub trait SenderExt: Sender {
    /// Transform the value produced by this sender.
    ///
    /// If `function` panics the operation completes with
    /// `SchedulerError::CallbackPanicked` on the error channel.
    fn then<F, U>(self, function: F) -> Then<Self, F>
    where
        F: FnOnce(Self::Output) -> U + Send + 'static,
        U: Send + 'static,
    {
        Then { sender: self, function }
    }
}

impl<S: Sender> SenderExt for S {}

/// A sender that completes inline with a value.
#[derive(Clone, Debug)]
pub struct Just<V> {
    value: V,
}

pub fn just<V: Send + 'static>(value: V) -> Just<V> {
    Just { value }
}

pub struct JustOperation<V, R> {
    value: V,
    receiver: R,
}

impl<V: Send + 'static> Sender for Just<V> {
    type Output = V;
    type Operation<R: Receiver<V> + 'static> = JustOperation<V, R>;

    fn connect<R: Receiver<V> + 'static>(self, receiver: R) -> JustOperation<V, R> {
        JustOperation { value: self.value, receiver }
    }
}

impl<V, R: Receiver<V>> OperationState for JustOperation<V, R> {
    fn start(self) {
        self.receiver.set_value(self.value);
    }
}

/// A sender that completes inline on the error channel.
///
/// The payload can't be cloned so this sender can only be connected once.
pub struct JustError<V> {
    error: ErrorPayload,
    _output: PhantomData<fn() -> V>,
}

pub fn just_error<V, E>(error: E) -> JustError<V>
where
    E: Any + Send,
{
    JustError { error: ErrorPayload::new(error), _output: PhantomData }
}

pub struct JustErrorOperation<V, R> {
    error: ErrorPayload,
    receiver: R,
    _output: PhantomData<fn() -> V>,
}

impl<V: Send + 'static> Sender for JustError<V> {
    type Output = V;
    type Operation<R: Receiver<V> + 'static> = JustErrorOperation<V, R>;

    fn connect<R: Receiver<V> + 'static>(self, receiver: R) -> JustErrorOperation<V, R> {
        JustErrorOperation { error: self.error, receiver, _output: PhantomData }
    }
}

impl<V, R: Receiver<V>> OperationState for JustErrorOperation<V, R> {
    fn start(self) {
        self.receiver.set_error(self.error);
    }
}

/// A sender that completes inline with the stopped signal.
pub struct JustStopped<V> {
    _output: PhantomData<fn() -> V>,
}

impl<V> Clone for JustStopped<V> {
    fn clone(&self) -> Self { JustStopped { _output: PhantomData } }
}

pub fn just_stopped<V: Send + 'static>() -> JustStopped<V> {
    JustStopped { _output: PhantomData }
}

pub struct JustStoppedOperation<V, R> {
    receiver: R,
    _output: PhantomData<fn() -> V>,
}

impl<V: Send + 'static> Sender for JustStopped<V> {
    type Output = V;
    type Operation<R: Receiver<V> + 'static> = JustStoppedOperation<V, R>;

    fn connect<R: Receiver<V> + 'static>(self, receiver: R) -> JustStoppedOperation<V, R> {
        JustStoppedOperation { receiver, _output: PhantomData }
    }
}

impl<V, R: Receiver<V>> OperationState for JustStoppedOperation<V, R> {
    fn start(self) {
        self.receiver.set_stopped();
    }
}

/// See `SenderExt::then`.
#[derive(Clone)]
pub struct Then<S, F> {
    sender: S,
    function: F,
}

pub struct ThenReceiver<R, F> {
    receiver: R,
    function: F,
}

impl<S, F, U> Sender for Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Output) -> U + Send + 'static,
    U: Send + 'static,
{
    type Output = U;
    type Operation<R: Receiver<U> + 'static> = S::Operation<ThenReceiver<R, F>>;

    fn connect<R: Receiver<U> + 'static>(self, receiver: R) -> Self::Operation<R> {
        self.sender.connect(ThenReceiver { receiver, function: self.function })
    }
}

impl<V, U, R, F> Receiver<V> for ThenReceiver<R, F>
where
    R: Receiver<U>,
    F: FnOnce(V) -> U + Send,
{
    fn set_value(self, value: V) {
        let function = self.function;
        match panic::catch_unwind(AssertUnwindSafe(move || function(value))) {
            Ok(output) => self.receiver.set_value(output),
            Err(_) => self.receiver.set_error(SchedulerError::CallbackPanicked.into()),
        }
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }

    fn set_error(self, error: ErrorPayload) {
        self.receiver.set_error(error);
    }
}

#[test]
fn then_forwards_stopped_and_errors() {
    use crate::receiver::{receiver_fn, Completion};
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));

    let c = calls.clone();
    let sender = just_stopped::<u32>().then(move |v| {
        c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        v + 1
    });
    let t = tx.clone();
    sender.connect(receiver_fn(move |completion: Completion<u32>| t.send(completion).unwrap())).start();
    assert!(rx.recv().unwrap().is_stopped());

    let c = calls.clone();
    let sender = just_error::<u32, _>(5u8).then(move |v| {
        c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        v + 1
    });
    sender.connect(receiver_fn(move |completion: Completion<u32>| tx.send(completion).unwrap())).start();
    match rx.recv().unwrap() {
        Completion::Error(payload) => assert_eq!(payload.downcast_ref::<u8>(), Some(&5)),
        _ => panic!("expected an error"),
    }

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}
