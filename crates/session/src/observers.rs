use std::sync::{Arc, Mutex};

use kwatch_core::{Observer, ResourceType, WatchEvent};
use rustc_hash::FxHashMap;

use crate::session::EventCounts;

/// Counts events per resource type and kind.
#[derive(Debug, Default)]
pub struct EventTally {
    counts: Mutex<FxHashMap<ResourceType, EventCounts>>,
}

impl EventTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counts, sorted by resource type.
    pub fn snapshot(&self) -> Vec<(ResourceType, EventCounts)> {
        let counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = counts.iter().map(|(rt, c)| (*rt, *c)).collect();
        out.sort_by_key(|(rt, _)| *rt);
        out
    }

    pub fn get(&self, resource_type: ResourceType) -> EventCounts {
        let counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        counts.get(&resource_type).copied().unwrap_or_default()
    }
}

impl Observer for EventTally {
    fn on_event(&self, event: &WatchEvent) {
        let mut counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        counts.entry(event.resource_type).or_default().record(event.kind);
    }
}

/// Forwards each event to several observers in order.
#[derive(Default)]
pub struct Fanout {
    observers: Vec<Arc<dyn Observer>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl Observer for Fanout {
    fn on_event(&self, event: &WatchEvent) {
        for o in &self.observers {
            o.on_event(event);
        }
    }
}
