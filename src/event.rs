//! Per-thread event loop plumbing: cross-thread function posting and the
//! wakeup channel.
//!
//! Each worker owns a mio `Poll`; other threads reach it only through its
//! [`EventLoopHandle`], which enqueues a closure and wakes the poll. The
//! closure runs on the target thread with full access to its `Worker`,
//! which is how foreign threads install file events or touch connections
//! they do not own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::server::worker::Worker;

/// A closure to run on a worker thread.
pub type Task = Box<dyn FnOnce(&mut Worker) + Send>;

/// Posting onto a closed loop; callers may retry later or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostError;

impl std::fmt::Display for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event loop is shut down")
    }
}

impl std::error::Error for PostError {}

/// Shared handle to one worker's event loop.
///
/// The waker is attached when the worker starts; tasks posted before that
/// are queued and picked up on the first loop iteration.
pub struct EventLoopHandle {
    waker: OnceLock<mio::Waker>,
    tasks: Mutex<Vec<Task>>,
    closed: AtomicBool,
}

impl EventLoopHandle {
    pub fn new() -> EventLoopHandle {
        EventLoopHandle {
            waker: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the worker's waker. Called once from the owning thread.
    pub fn attach_waker(&self, waker: mio::Waker) {
        if self.waker.set(waker).is_err() {
            panic!("event loop waker attached twice");
        }
    }

    /// Enqueue `task` on the target thread and wake its poll.
    pub fn post(&self, task: Task) -> Result<(), PostError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PostError);
        }
        self.tasks
            .lock()
            .expect("posted-task queue poisoned")
            .push(task);
        self.wake();
        Ok(())
    }

    /// Interrupt the poll without queueing work.
    pub fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            let _ = waker.wake();
        }
    }

    /// Drain the posted-task queue. Called by the owning worker.
    pub fn take_tasks(&self) -> Vec<Task> {
        std::mem::take(&mut *self.tasks.lock().expect("posted-task queue poisoned"))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventLoopHandle {
    fn default() -> Self {
        EventLoopHandle::new()
    }
}
