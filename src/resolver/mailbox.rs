//! Capacity-one, latest-wins update mailbox.
//!
//! # Responsibilities
//! - Accept envelopes from any number of watch callbacks without blocking
//! - Keep only the newest unread envelope
//! - Never let a republish marker displace a pending update or error
//! - Wake the single consumer on publish or shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::discovery::{ServiceUpdate, WatchError};

/// One unit of work for the resolver state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEnvelope {
    /// A new service update from the control plane.
    Service(ServiceUpdate),
    /// Recompute and publish the service config from the current selector.
    RepublishCurrent,
    /// A watch error.
    Error(WatchError),
}

impl UpdateEnvelope {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            UpdateEnvelope::Service(_) => "service_update",
            UpdateEnvelope::RepublishCurrent => "republish",
            UpdateEnvelope::Error(e) if e.is_resource_not_found() => "not_found",
            UpdateEnvelope::Error(_) => "error",
        }
    }
}

impl From<Result<ServiceUpdate, WatchError>> for UpdateEnvelope {
    fn from(res: Result<ServiceUpdate, WatchError>) -> Self {
        match res {
            Ok(update) => UpdateEnvelope::Service(update),
            Err(e) => UpdateEnvelope::Error(e),
        }
    }
}

/// Single-slot mailbox between watch callbacks and the resolver worker.
#[derive(Debug, Default)]
pub struct UpdateMailbox {
    slot: Mutex<Option<UpdateEnvelope>>,
    notify: Notify,
    closed: AtomicBool,
}

impl UpdateMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<UpdateEnvelope>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `envelope`, replacing any unread one.
    ///
    /// Returns false if the mailbox is closed and the envelope was dropped.
    pub fn publish(&self, envelope: UpdateEnvelope) -> bool {
        if self.is_closed() {
            return false;
        }

        let replaced = self.slot().replace(envelope);
        if let Some(stale) = replaced {
            tracing::trace!(kind = stale.kind(), "Dropped unread update");
        }
        // A stored permit covers a consumer that is between its slot check and its wait.
        self.notify.notify_one();
        true
    }

    /// Store `RepublishCurrent` only if no envelope is pending.
    ///
    /// Any pending envelope already triggers a prune when handled, so the marker
    /// is redundant then. Returns true if the marker was stored.
    pub fn nudge(&self) -> bool {
        if self.is_closed() {
            return false;
        }

        {
            let mut slot = self.slot();
            if slot.is_some() {
                return false;
            }
            *slot = Some(UpdateEnvelope::RepublishCurrent);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next envelope. Returns `None` once the mailbox is closed.
    pub async fn consume(&self) -> Option<UpdateEnvelope> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(envelope) = self.try_take() {
                return Some(envelope);
            }
            self.notify.notified().await;
        }
    }

    /// Take the unread envelope, if any, without waiting.
    pub fn try_take(&self) -> Option<UpdateEnvelope> {
        self.slot().take()
    }

    /// Close the mailbox, discard any unread envelope and wake the consumer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slot().take();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
