use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::{debug, error};

pub type DispatchJob = Box<dyn FnOnce() + Send + 'static>;

/// Determines the execution context in which channels publish their events.
///
/// Channels detect conditions on whatever task happens to notice them (a receive loop, a
///  sweep timer, the caller of `send_message`, ...). The dispatcher decides whether the
///  notification is published right there, or redirected to some designated context.
pub trait EventDispatcher: Debug + Send + Sync + 'static {
    fn dispatch(&self, job: DispatchJob);
}

/// Publishes events directly on the task that detected the condition.
#[derive(Default, Debug, Clone, Copy)]
pub struct InlineDispatcher;

impl EventDispatcher for InlineDispatcher {
    fn dispatch(&self, job: DispatchJob) {
        job();
    }
}

/// Publishes all events from a single dedicated task, in the order they were dispatched.
///  Any number of channels can share one [SerialDispatcher] to get a global order of their
///  notifications.
///
/// NB: This spawns its worker task, so it must be created from inside a tokio runtime. The
///      worker terminates when the last clone of the dispatcher is dropped.
#[derive(Clone, Debug)]
pub struct SerialDispatcher {
    sender: mpsc::UnboundedSender<DispatchJob>,
}

impl SerialDispatcher {
    pub fn new() -> SerialDispatcher {
        let (sender, mut receiver) = mpsc::unbounded_channel::<DispatchJob>();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("event dispatch job panicked - continuing with the next job");
                }
            }
            debug!("serial dispatcher shut down");
        });

        SerialDispatcher { sender }
    }
}

impl EventDispatcher for SerialDispatcher {
    fn dispatch(&self, job: DispatchJob) {
        if self.sender.send(job).is_err() {
            error!("serial dispatcher worker is gone - dropping event");
        }
    }
}
