// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Typed event notifications from modules to the enclosing pipeline.

Modules never react to their own events. They post them through an
[`EventSender`] handed out by the pipeline-owned [`EventBus`], and the
pipeline decides the reaction policy (a typical one: stop the graph when an
`Error` event arrives). Delivery is at-least-attempted only; a full bus
drops the event with a warning rather than blocking the posting module.
*/

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::time::Duration;
use tracing::warn;

/// Default event queue depth per bus.
const DEFAULT_BUS_CAPACITY: usize = 256;

/// Kinds of events a module can post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Placeholder kind; never posted by well-behaved modules.
    Invalid,
    /// A stage-level failure the pipeline should react to.
    Error,
    /// A recoverable anomaly worth surfacing.
    Warning,
    /// A stream reached its end-of-stream marker.
    Eos,
    /// A module requests the pipeline to stop.
    Stop,
}

/// One posted event, tagged with the posting module's name.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub module_name: String,
    pub message: String,
}

/// Pipeline-side event queue.
///
/// The pipeline owns the bus and polls it; each module attached to the
/// pipeline gets its own [`EventSender`] clone.
pub struct EventBus {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Creates a sender for one module to post through.
    pub fn sender_for(&self, module_name: impl Into<String>) -> EventSender {
        EventSender {
            module_name: module_name.into(),
            tx: self.tx.clone(),
        }
    }

    /// Non-blocking poll for the next pending event.
    pub fn try_poll(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Blocking poll with a timeout, for pipeline reaction loops.
    pub fn poll(&self, timeout: Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Module-side posting handle.
#[derive(Debug, Clone)]
pub struct EventSender {
    module_name: String,
    tx: Sender<Event>,
}

impl EventSender {
    /// Posts one event. Returns false when the event could not be handed
    /// to the pipeline (bus full or bus gone).
    pub fn post(&self, kind: EventKind, message: impl Into<String>) -> bool {
        let event = Event {
            kind,
            module_name: self.module_name.clone(),
            message: message.into(),
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                warn!(module = %self.module_name, "event bus full, dropping {:?} event: {}", ev.kind, ev.message);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
