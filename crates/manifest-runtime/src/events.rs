//! Emitted events, the append-only event log and synchronous listeners.
//!
//! Every `emit`/`publish` action, declared `emits` entry, concurrency
//! conflict and applied override produces one [`EmittedEvent`]. The
//! [`EventLog`] keeps them in emission order until it is cleared
//! explicitly. Listeners registered in a [`Listeners`] registry are
//! notified synchronously after each append.
//!
//! # Listener failures
//!
//! A listener that returns `Err` or panics never affects the command that
//! emitted the event or any other listener. The failure is captured as a
//! [`ListenerFailure`] and handed back to the caller of
//! [`Listeners::notify`], which the engine collects for
//! `take_listener_errors`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use manifest_ir::IrProvenance;
use serde::{Deserialize, Serialize};

/// Name of the event appended when an optimistic version check fails.
pub const CONCURRENCY_CONFLICT_EVENT: &str = "ConcurrencyConflict";

/// Name of the event appended when a constraint override is applied.
pub const OVERRIDE_APPLIED_EVENT: &str = "OverrideApplied";

// ---------------------------------------------------------------------------
// EmittedEvent
// ---------------------------------------------------------------------------

/// One audit or integration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    pub name: String,
    pub channel: String,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch, from the engine clock.
    pub timestamp: i64,
    /// Provenance of the IR that was running when the event was emitted.
    pub provenance: IrProvenance,
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Append-only log of emitted events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<EmittedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: EmittedEvent) {
        self.events.push(event);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events in emission order.
    pub fn all_events(&self) -> &[EmittedEvent] {
        &self.events
    }

    pub fn events_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a EmittedEvent> {
        self.events.iter().filter(move |e| e.name == name)
    }

    pub fn events_on_channel<'a>(
        &'a self,
        channel: &'a str,
    ) -> impl Iterator<Item = &'a EmittedEvent> {
        self.events.iter().filter(move |e| e.channel == channel)
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// A synchronous event listener.
pub type Listener = Arc<dyn Fn(&EmittedEvent) -> Result<(), String> + Send + Sync>;

/// Handle returned by [`Listeners::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// A listener that failed while handling an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerFailure {
    pub subscription: SubscriptionId,
    pub event: String,
    pub message: String,
}

/// Registry of listeners, notified in subscription order.
#[derive(Clone, Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, Listener)>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(sid, _)| *sid != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Call every listener with `event`, returning the failures.
    pub fn notify(&self, event: &EmittedEvent) -> Vec<ListenerFailure> {
        let mut failures = Vec::new();
        for (id, listener) in &self.entries {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(message)) => message,
                Err(panic) => panic_message(panic.as_ref()),
            };
            tracing::warn!(
                subscription = id.0,
                event = %event.name,
                error = %message,
                "event listener failed"
            );
            failures.push(ListenerFailure {
                subscription: *id,
                event: event.name.clone(),
                message,
            });
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
