use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

/// Work executed on the render thread against the render state `S`.
///
/// `FnMut` rather than `FnOnce` so that calling it does not consume the box: the
/// closure and everything it captured travel back to the control side inside the
/// message and are dropped there, never on the render thread.
pub type RenderTask<S> = Box<dyn FnMut(&mut S) + Send>;

/// Completion handler executed on a control thread after the render task has run.
pub type Response = Box<dyn FnOnce() + Send>;

/// A unit of cross-thread work.
///
/// Messages make a full round trip: control → render (task executed) → control
/// (response executed, message dropped).
pub struct Message<S> {
    pub(crate) task: Option<RenderTask<S>>,
    pub(crate) response: Option<Response>,
    /// Thread that is waiting synchronously for this message, if any.
    pub(crate) origin: Option<ThreadId>,
    /// Set by the origin thread when it stops waiting; any poller may then release
    /// the message.
    abandoned: Option<Arc<AtomicBool>>,
}

impl<S> Message<S> {
    pub fn new(task: Option<RenderTask<S>>, response: Option<Response>, origin: Option<ThreadId>) -> Self {
        Self {
            task,
            response,
            origin,
            abandoned: None,
        }
    }

    pub(crate) fn with_abandon_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abandoned = Some(flag);
        self
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Runs the render task. Called on the render thread, or on a control thread
    /// while the render side is inactive.
    pub(crate) fn execute(&mut self, state: &mut S) {
        if let Some(task) = self.task.as_mut() {
            task(state);
        }
    }

    /// Whether the thread `current` may service this message's response.
    pub(crate) fn serviceable_by(&self, current: ThreadId) -> bool {
        !self.has_response()
            || self.origin.is_none_or(|origin| origin == current)
            || self.is_abandoned()
    }
}

impl<S> std::fmt::Debug for Message<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("has_task", &self.task.is_some())
            .field("has_response", &self.has_response())
            .field("origin", &self.origin)
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}
