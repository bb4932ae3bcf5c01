//! Pending-forward registry for writes relayed to the leader.
//!
//! A replica that forwards a write remembers the client's envelope under a
//! fresh internal correlation id. The leader's eventual completion resolves
//! the entry; if the leader does not respond within the registered window,
//! the stored timeout reply goes back to the client instead. Entries are
//! resolved at most once.

use crate::message::{ClientEnvelope, ClientReply};
use kel_core::CorrelationId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

struct PendingForward {
    external_correlation_id: CorrelationId,
    envelope: ClientEnvelope,
    timeout_reply: ClientReply,
}

/// Registry of writes in flight toward the leader.
#[derive(Clone)]
pub struct ForwardingProxy {
    pending: Arc<Mutex<HashMap<CorrelationId, PendingForward>>>,
}

impl Default for ForwardingProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardingProxy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a forwarded write and arm its timeout.
    ///
    /// Outside a tokio runtime (pure-sync tests) no timeout task is armed;
    /// the entry then waits for `complete` or `expire`.
    pub fn register(
        &self,
        internal_correlation_id: CorrelationId,
        external_correlation_id: CorrelationId,
        envelope: ClientEnvelope,
        timeout: Duration,
        timeout_reply: ClientReply,
    ) {
        let entry = PendingForward {
            external_correlation_id,
            envelope,
            timeout_reply,
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(internal_correlation_id, entry);
        }
        debug!(
            target: "keel::forward",
            internal = %internal_correlation_id,
            external = %external_correlation_id,
            timeout_ms = timeout.as_millis(),
            "Registered forwarded write"
        );

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let proxy = self.clone();
            handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                proxy.expire(internal_correlation_id);
            });
        }
    }

    /// Resolve a forward with the leader's answer. Returns the client's
    /// envelope and external id, or `None` if the entry already timed out.
    pub fn complete(
        &self,
        internal_correlation_id: CorrelationId,
    ) -> Option<(CorrelationId, ClientEnvelope)> {
        let entry = self
            .pending
            .lock()
            .ok()?
            .remove(&internal_correlation_id)?;
        Some((entry.external_correlation_id, entry.envelope))
    }

    /// Deliver the timeout reply for a still-pending forward.
    pub fn expire(&self, internal_correlation_id: CorrelationId) {
        let entry = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&internal_correlation_id),
            Err(_) => None,
        };
        if let Some(entry) = entry {
            warn!(
                target: "keel::forward",
                internal = %internal_correlation_id,
                external = %entry.external_correlation_id,
                "Forwarded write timed out"
            );
            kel_metrics::increment_forward_timeouts();
            entry.envelope.reply(entry.timeout_reply);
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}
