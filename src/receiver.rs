//! The completion protocol.
//!
//! Every asynchronous operation reports its outcome through exactly one of three
//! channels: a value, a "stopped" signal (the work was cancelled upstream), or an
//! error carrying an opaque payload.
//!
//! All three methods consume the receiver, so delivering more than one signal to the
//! same receiver is impossible without unsafe code.

use crate::error::ErrorPayload;

/// The continuation of an operation.
///
/// `V` is the type of the value produced by the operation. Operations that produce
/// no value use `()`, operations that produce several use a tuple.
///
/// Completions may be delivered on any thread, hence the `Send` bound. They must not
/// unwind: a receiver that panics while being completed on a thread pool worker aborts
/// the process, and one that panics on an event loop stops that loop.
pub trait Receiver<V>: Send {
    /// The operation succeeded.
    fn set_value(self, value: V);

    /// The operation was cancelled.
    fn set_stopped(self);

    /// The operation failed.
    fn set_error(self, error: ErrorPayload);
}

/// The outcome of an operation, for receivers that want to store it.
#[derive(Debug)]
pub enum Completion<V> {
    Value(V),
    Stopped,
    Error(ErrorPayload),
}

impl<V> Completion<V> {
    pub fn is_value(&self) -> bool { matches!(self, Completion::Value(_)) }
    pub fn is_stopped(&self) -> bool { matches!(self, Completion::Stopped) }
    pub fn is_error(&self) -> bool { matches!(self, Completion::Error(_)) }

    /// Forward this completion to a receiver.
    pub fn deliver<R: Receiver<V>>(self, receiver: R) {
        match self {
            Completion::Value(value) => receiver.set_value(value),
            Completion::Stopped => receiver.set_stopped(),
            Completion::Error(error) => receiver.set_error(error),
        }
    }
}

/// Calls a closure with the completion.
pub struct FnReceiver<F> {
    callback: F,
}

/// Builds a receiver out of a closure taking the operation's `Completion`.
pub fn receiver_fn<V, F>(callback: F) -> FnReceiver<F>
where
    F: FnOnce(Completion<V>) + Send,
{
    FnReceiver { callback }
}

impl<V, F> Receiver<V> for FnReceiver<F>
where
    F: FnOnce(Completion<V>) + Send,
{
    fn set_value(self, value: V) { (self.callback)(Completion::Value(value)) }
    fn set_stopped(self) { (self.callback)(Completion::Stopped) }
    fn set_error(self, error: ErrorPayload) { (self.callback)(Completion::Error(error)) }
}
