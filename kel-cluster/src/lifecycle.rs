//! Startup and shutdown acknowledgement counting.
//!
//! Three independent countdowns: core-service inits gate `SystemStart`,
//! service shutdown acks gate the final `Shutdown()`, and subsystem inits
//! gate `SystemReady`. The subsystem counter is atomic because subsystem
//! threads may report in before their notification joins the main queue
//! discipline; everything else is only touched from the main queue.

use kel_core::{
    CLUSTERED_SHUTDOWN_ACK_COUNT, CORE_SERVICE_INIT_COUNT, SINGLE_NODE_SHUTDOWN_ACK_COUNT,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct LifecycleTracker {
    service_inits_remaining: usize,
    service_shutdowns_remaining: usize,
    subsystem_inits_remaining: Arc<AtomicUsize>,
}

impl LifecycleTracker {
    #[must_use]
    pub fn new(cluster_size: usize, subsystem_count: usize) -> Self {
        let shutdown_acks = if cluster_size > 1 {
            CLUSTERED_SHUTDOWN_ACK_COUNT
        } else {
            SINGLE_NODE_SHUTDOWN_ACK_COUNT
        };
        Self {
            service_inits_remaining: CORE_SERVICE_INIT_COUNT,
            service_shutdowns_remaining: shutdown_acks,
            subsystem_inits_remaining: Arc::new(AtomicUsize::new(subsystem_count)),
        }
    }

    /// Record one core-service init. Returns true on the ack that
    /// completes the countdown.
    pub fn service_initialized(&mut self, service: &str) -> bool {
        if self.service_inits_remaining == 0 {
            warn!(
                target: "keel::lifecycle",
                service,
                "Service initialized after startup countdown completed"
            );
            return false;
        }
        self.service_inits_remaining -= 1;
        debug!(
            target: "keel::lifecycle",
            service,
            remaining = self.service_inits_remaining,
            "Service initialized"
        );
        self.service_inits_remaining == 0
    }

    /// Record one service shutdown ack. Returns true on the ack that
    /// completes the countdown.
    pub fn service_shutdown(&mut self, service: &str) -> bool {
        if self.service_shutdowns_remaining == 0 {
            warn!(
                target: "keel::lifecycle",
                service,
                "Service shutdown ack after countdown completed"
            );
            return false;
        }
        self.service_shutdowns_remaining -= 1;
        debug!(
            target: "keel::lifecycle",
            service,
            remaining = self.service_shutdowns_remaining,
            "Service shutdown acknowledged"
        );
        self.service_shutdowns_remaining == 0
    }

    /// Record one subsystem init. Returns true for exactly the caller
    /// whose decrement reaches zero. Safe to call from subsystem threads.
    pub fn subsystem_initialized(&self) -> bool {
        let previous = self
            .subsystem_inits_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => true,
            Ok(_) => false,
            Err(_) => {
                warn!(
                    target: "keel::lifecycle",
                    "Subsystem initialized after countdown completed"
                );
                false
            },
        }
    }

    #[inline]
    #[must_use]
    pub fn subsystems_pending(&self) -> usize {
        self.subsystem_inits_remaining.load(Ordering::Acquire)
    }

    /// Shared handle for subsystem threads reporting off the main queue.
    #[must_use]
    pub fn subsystem_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.subsystem_inits_remaining)
    }

    #[inline]
    #[must_use]
    pub fn service_shutdowns_expected(&self) -> usize {
        self.service_shutdowns_remaining
    }
}
