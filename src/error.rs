use std::any::Any;
use std::fmt;

use thiserror::Error;

/// The payload carried by the error channel of a receiver.
///
/// The payload is opaque to the scheduling layer: it is moved from the operation that
/// failed to the receiver without being inspected. It has the same shape as a panic
/// payload (see `from_boxed`). Panics the scheduling layer catches itself, in `then`
/// continuations and bulk functions, are not forwarded: their payload is dropped and a
/// `SchedulerError` is delivered instead.
pub struct ErrorPayload {
    inner: Box<dyn Any + Send>,
}

impl ErrorPayload {
    pub fn new<E: Any + Send>(error: E) -> Self {
        ErrorPayload { inner: Box::new(error) }
    }

    pub fn from_boxed(inner: Box<dyn Any + Send>) -> Self {
        ErrorPayload { inner }
    }

    pub fn is<E: Any>(&self) -> bool {
        self.inner.is::<E>()
    }

    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.inner.downcast_ref()
    }

    /// Recover the concrete error, or get the payload back if the type doesn't match.
    pub fn downcast<E: Any>(self) -> Result<E, Self> {
        match self.inner.downcast::<E>() {
            Ok(error) => Ok(*error),
            Err(inner) => Err(ErrorPayload { inner }),
        }
    }

    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.inner
    }
}

impl From<SchedulerError> for ErrorPayload {
    fn from(error: SchedulerError) -> Self {
        ErrorPayload::new(error)
    }
}

impl fmt::Debug for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = self.downcast_ref::<SchedulerError>() {
            return f.debug_tuple("ErrorPayload").field(error).finish();
        }
        if let Some(msg) = self.downcast_ref::<&'static str>() {
            return f.debug_tuple("ErrorPayload").field(msg).finish();
        }
        if let Some(msg) = self.downcast_ref::<String>() {
            return f.debug_tuple("ErrorPayload").field(msg).finish();
        }

        f.write_str("ErrorPayload(..)")
    }
}

/// Failures produced by the scheduling layer itself, as opposed to the ones
/// forwarded from upstream computations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The backend could not provide a work object for this operation.
    #[error("the execution backend did not provide a work object")]
    BackendUnavailable,
    /// The bulk function panicked. `index` is the first index observed to panic.
    #[error("bulk function panicked at index {index}")]
    BulkPanicked { index: usize },
    /// A continuation passed to `then` panicked.
    #[error("continuation panicked")]
    CallbackPanicked,
}

/// Invalid thread pool configuration read from the environment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

#[test]
fn downcast_payload() {
    let payload = ErrorPayload::new(42u32);
    assert!(payload.is::<u32>());
    assert!(!payload.is::<i32>());
    assert_eq!(payload.downcast_ref::<u32>(), Some(&42));

    let payload = match payload.downcast::<String>() {
        Ok(_) => panic!("wrong type"),
        Err(payload) => payload,
    };
    assert_eq!(payload.downcast::<u32>().ok(), Some(42));

    let payload: ErrorPayload = SchedulerError::BackendUnavailable.into();
    assert_eq!(format!("{:?}", payload), "ErrorPayload(BackendUnavailable)");
}
