//! Bus endpoints and the controller's injected seams.
//!
//! The controller publishes on exactly two endpoints: the output bus that
//! fans out to subordinate services, and the main queue that re-enters the
//! controller itself. Timers and process control are traits so tests can
//! substitute recording implementations.

use crate::message::Message;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Fan-out endpoint consumed by subordinate services.
///
/// Publishing with no subscribers is not an error; a node may run with
/// only a subset of services attached.
#[derive(Debug, Clone)]
pub struct OutputBus {
    tx: broadcast::Sender<Message>,
}

impl OutputBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}

/// Publish-only handle onto the controller's own queue.
#[derive(Debug, Clone)]
pub struct MainQueue {
    tx: mpsc::UnboundedSender<Message>,
}

impl MainQueue {
    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(message);
    }
}

/// Create the main queue and its single consumer end.
#[must_use]
pub fn main_queue() -> (MainQueue, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MainQueue { tx }, rx)
}

/// Deferred self-delivery. There is no cancellation: the owner rotates the
/// relevant correlation id instead, and the stale delivery no-ops.
pub trait TimerService: Send + Sync {
    fn schedule(&self, delay: Duration, message: Message);
}

/// Production timers: one sleeping task per scheduled message.
pub struct TokioTimers {
    main_queue: MainQueue,
}

impl TokioTimers {
    #[must_use]
    pub fn new(main_queue: MainQueue) -> Self {
        Self { main_queue }
    }
}

impl TimerService for TokioTimers {
    fn schedule(&self, delay: Duration, message: Message) {
        let queue = self.main_queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.publish(message);
        });
    }
}

/// Process-level actions the controller must be able to take but must not
/// own, so tests can observe them instead of dying.
pub trait NodeRuntime: Send + Sync {
    /// Close the log database. Called exactly once, while shutting down.
    fn close_database(&self);
    /// Stop the node's worker pool.
    fn stop_workers(&self);
    /// Terminate the process. `success` false means a fatal invariant
    /// violation. Production implementations do not return.
    fn exit_process(&self, success: bool);
}
