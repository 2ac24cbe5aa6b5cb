//! ---
//! hatch_section: "02-messaging-data-model"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Typed multi-channel event relay."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::bus::EventRelay;
use crate::event::LogEvent;

/// Observer-side log store: reference key to ordered messages.
///
/// Append-only and unbounded for the lifetime of the process. Insertion order
/// is the only ordering guarantee and duplicates are kept.
#[derive(Debug, Clone, Default)]
pub struct TranscriptStore {
    entries: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl TranscriptStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message under `reference`.
    pub fn append(&self, reference: impl Into<String>, msg: impl Into<String>) {
        self.entries
            .write()
            .entry(reference.into())
            .or_default()
            .push(msg.into());
    }

    /// File a relay event under its topic reference.
    pub fn record(&self, event: &LogEvent) {
        self.append(event.event.reference(), event.msg());
    }

    /// Snapshot of the messages stored under `reference`.
    pub fn entries(&self, reference: &str) -> Vec<String> {
        self.entries
            .read()
            .get(reference)
            .cloned()
            .unwrap_or_default()
    }

    /// Known reference keys, sorted.
    pub fn references(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of messages under `reference`.
    pub fn len(&self, reference: &str) -> usize {
        self.entries.read().get(reference).map_or(0, Vec::len)
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().values().all(Vec::is_empty)
    }

    /// Subscribe to every channel of `relay` and record events as they arrive.
    ///
    /// Must be called inside a Tokio runtime. The tasks end when the relay is
    /// dropped.
    pub fn attach(&self, relay: &EventRelay) -> Vec<JoinHandle<()>> {
        relay
            .subscribe_all()
            .into_iter()
            .map(|mut subscription| {
                let store = self.clone();
                tokio::spawn(async move {
                    while let Some(event) = subscription.recv().await {
                        store.record(&event);
                    }
                })
            })
            .collect()
    }
}
