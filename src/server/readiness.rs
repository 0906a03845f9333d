//! Readiness gating per listener generation.
//!
//! # Responsibilities
//! - Count the dynamic routes a generation still waits for
//! - Fire the ready signal once per generation when nothing is outstanding
//!
//! # Design Decisions
//! - Outstanding routes are tracked by name, so a route shared by several
//!   filter chains is waited for once
//! - The signal carries the generation number; receivers see the newest one

use std::collections::BTreeSet;

use tokio::sync::watch;

/// Outstanding route dependencies of one listener generation.
#[derive(Debug)]
pub struct ReadinessGate {
    generation: u64,
    outstanding: BTreeSet<String>,
    fired: bool,
}

impl ReadinessGate {
    pub fn new(generation: u64, outstanding: impl IntoIterator<Item = String>) -> Self {
        Self {
            generation,
            outstanding: outstanding.into_iter().collect(),
            fired: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Mark a route as resolved. Returns false if it was not outstanding.
    pub fn resolve(&mut self, name: &str) -> bool {
        self.outstanding.remove(name)
    }

    /// True exactly once: the first call after nothing is outstanding.
    pub fn take_ready(&mut self) -> bool {
        if self.fired || !self.outstanding.is_empty() {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Creates a connected ready sender and receiver.
pub(crate) fn ready_channel() -> (ReadySender, ReadyReceiver) {
    let (tx, rx) = watch::channel(None);
    (ReadySender { tx }, ReadyReceiver { rx })
}

#[derive(Debug)]
pub(crate) struct ReadySender {
    tx: watch::Sender<Option<u64>>,
}

impl ReadySender {
    pub(crate) fn fire(&self, generation: u64) {
        self.tx.send_replace(Some(generation));
    }
}

/// Receives the generation number each time a listener generation becomes ready.
#[derive(Debug, Clone)]
pub struct ReadyReceiver {
    rx: watch::Receiver<Option<u64>>,
}

impl ReadyReceiver {
    /// Wait for the next ready generation. `None` once the listener is gone.
    pub async fn ready(&mut self) -> Option<u64> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(generation) = *self.rx.borrow_and_update() {
                return Some(generation);
            }
        }
    }

    /// Newest ready generation not yet observed, without waiting.
    pub fn try_ready(&mut self) -> Option<u64> {
        if !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        *self.rx.borrow_and_update()
    }
}
