use crate::bulk::BulkSender;
use crate::error::SchedulerError;
use crate::interface::{AbstractOperationState, AbstractScheduler, ForwardProgress, ReceiverShim};
use crate::receiver::Receiver;
use crate::sender::{OperationState, Sender};

use std::fmt;
use std::sync::Arc;

/// A cheap, clonable reference to a backend's scheduler.
///
/// Two handles compare equal if they refer to the same backend scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<dyn AbstractScheduler>,
}

impl SchedulerHandle {
    pub fn new(inner: Arc<dyn AbstractScheduler>) -> Self {
        SchedulerHandle { inner }
    }

    /// Returns `true` if `self` and `other` refer to the same backend scheduler.
    pub fn equals(&self, other: &SchedulerHandle) -> bool {
        self.inner.equals(&*other.inner)
    }

    pub fn forward_progress_guarantee(&self) -> ForwardProgress {
        self.inner.forward_progress_guarantee()
    }

    /// Returns a sender that completes with `()` on the backend.
    ///
    /// Nothing is submitted until the sender is connected and started.
    pub fn schedule(&self) -> ScheduleSender {
        ScheduleSender { scheduler: self.clone() }
    }

    /// Returns a sender that, once `previous` completes with a value, calls
    /// `function(index, &value)` for each index in `0..size` on the backend,
    /// then completes with the value.
    ///
    /// If `previous` completes with stopped or an error, the function is never called
    /// and the signal is forwarded as-is.
    pub fn bulk<S, F>(&self, previous: S, size: usize, function: F) -> BulkSender<S, F>
    where
        S: Sender,
        F: Fn(usize, &S::Output) + Send + Sync + 'static,
    {
        BulkSender::new(self.clone(), previous, size, function)
    }

    pub(crate) fn backend(&self) -> &dyn AbstractScheduler {
        &*self.inner
    }
}

impl PartialEq for SchedulerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for SchedulerHandle {}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("forward_progress", &self.forward_progress_guarantee())
            .finish()
    }
}

/// The sender returned by `SchedulerHandle::schedule`.
#[derive(Clone, Debug)]
pub struct ScheduleSender {
    scheduler: SchedulerHandle,
}

impl ScheduleSender {
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }
}

impl Sender for ScheduleSender {
    type Output = ();
    type Operation<R: Receiver<()> + 'static> = ScheduleOperation<R>;

    fn connect<R: Receiver<()> + 'static>(self, receiver: R) -> ScheduleOperation<R> {
        let work = match self.scheduler.backend().schedule() {
            Some(work) => work,
            None => {
                return ScheduleOperation {
                    state: ScheduleState::Unavailable(receiver),
                    _sender: self,
                };
            }
        };

        ScheduleOperation {
            state: ScheduleState::Connected(work.connect(ReceiverShim::new(receiver))),
            _sender: self,
        }
    }
}

enum ScheduleState<R> {
    Connected(Box<dyn AbstractOperationState>),
    // The backend didn't give us a work object, the receiver is still ours.
    Unavailable(R),
}

/// A `ScheduleSender` connected to a receiver.
pub struct ScheduleOperation<R> {
    state: ScheduleState<R>,
    _sender: ScheduleSender,
}

impl<R: Receiver<()>> OperationState for ScheduleOperation<R> {
    fn start(self) {
        match self.state {
            ScheduleState::Connected(op) => op.start(),
            ScheduleState::Unavailable(receiver) => {
                receiver.set_error(SchedulerError::BackendUnavailable.into());
            }
        }
    }
}
