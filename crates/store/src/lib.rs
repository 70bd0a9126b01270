//! kwatch store: per-resource-type indexed cache, sync state and event classifier.
//!
//! Everything in here is owned by exactly one watch session and mutated from
//! that session's task only. Nothing is `Sync`-guarded on purpose: callers hold
//! `&mut` for every mutation, so the single-writer rule is enforced by the
//! borrow checker rather than by a lock.

#![forbid(unsafe_code)]

use kwatch_core::{EventKind, Notification, ResourceItem, ResourceType, WatchError, WatchEvent, WatchResult};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Identity → last-known item for one resource type.
#[derive(Debug, Default, Clone)]
pub struct IndexedCache {
    map: FxHashMap<String, ResourceItem>,
}

impl IndexedCache {
    pub fn new() -> Self { Self::default() }

    /// Insert or overwrite; returns the previous value for the key.
    pub fn put(&mut self, item: ResourceItem) -> Option<ResourceItem> {
        self.map.insert(item.key.clone(), item)
    }

    /// Remove if present. Absent keys are a no-op.
    pub fn remove(&mut self, key: &str) -> Option<ResourceItem> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool { self.map.contains_key(key) }
    pub fn get(&self, key: &str) -> Option<&ResourceItem> { self.map.get(key) }
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn keys(&self) -> impl Iterator<Item = &str> { self.map.keys().map(|k| k.as_str()) }
    pub fn items(&self) -> impl Iterator<Item = &ResourceItem> { self.map.values() }
}

/// Whether the initial snapshot has fully landed. Moves `Loading → Synced` once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Loading,
    Synced,
}

impl SyncState {
    pub fn is_synced(self) -> bool { matches!(self, SyncState::Synced) }

    /// Flip to `Synced`. Returns true only for the call that performed the transition.
    pub fn mark_synced(&mut self) -> bool {
        match self {
            SyncState::Loading => {
                *self = SyncState::Synced;
                true
            }
            SyncState::Synced => false,
        }
    }
}

/// Outcome of feeding a snapshot completion marker to the classifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// First completion: the session is now live.
    Synced,
    /// Completion of a re-snapshot after resubscribe; carries the DELETEs for
    /// keys that vanished while disconnected.
    Resynced(Vec<WatchEvent>),
    /// Marker arrived while already synced and not resyncing.
    Ignored,
}

/// Events produced by one notification. Almost always exactly one.
pub type Emitted = SmallVec<[WatchEvent; 1]>;

/// Turns raw notifications into watch events and keeps the cache current.
#[derive(Debug)]
pub struct Classifier {
    resource_type: ResourceType,
    cache: IndexedCache,
    state: SyncState,
    /// Keys seen since the last resubscribe; `Some` while a re-snapshot is in flight.
    resync: Option<FxHashSet<String>>,
}

impl Classifier {
    pub fn new(resource_type: ResourceType) -> Self {
        Self { resource_type, cache: IndexedCache::new(), state: SyncState::Loading, resync: None }
    }

    pub fn resource_type(&self) -> ResourceType { self.resource_type }
    pub fn state(&self) -> SyncState { self.state }
    pub fn cache(&self) -> &IndexedCache { &self.cache }
    pub fn is_resyncing(&self) -> bool { self.resync.is_some() }

    /// Classify one item notification. `SnapshotComplete` must go through
    /// [`Classifier::complete_snapshot`] instead and is rejected here.
    pub fn classify(&mut self, n: Notification) -> WatchResult<Emitted> {
        if let Some(item) = n.item() {
            if !item.has_identity() {
                return Err(WatchError::Classification {
                    resource_type: self.resource_type,
                    reason: format!("item without identity (version {:?})", item.version),
                });
            }
        }
        let mut out = Emitted::new();
        match n {
            Notification::Seen(item) => {
                if let Some(seen) = self.resync.as_mut() {
                    seen.insert(item.key.clone());
                    let kind = match self.cache.get(&item.key) {
                        None => Some(EventKind::Add),
                        Some(prev) if prev.version != item.version => Some(EventKind::Update),
                        Some(_) => None,
                    };
                    self.cache.put(item.clone());
                    if let Some(kind) = kind {
                        out.push(self.event(kind, item));
                    } else {
                        trace!(key = %item.key, "resync: unchanged");
                    }
                } else {
                    let kind = if self.state.is_synced() { EventKind::Add } else { EventKind::Exist };
                    self.cache.put(item.clone());
                    out.push(self.event(kind, item));
                }
            }
            Notification::Changed(item) => {
                if let Some(seen) = self.resync.as_mut() {
                    seen.insert(item.key.clone());
                }
                self.cache.put(item.clone());
                out.push(self.event(EventKind::Update, item));
            }
            Notification::Removed(item) => {
                if let Some(seen) = self.resync.as_mut() {
                    seen.remove(&item.key);
                }
                if self.cache.remove(&item.key).is_none() {
                    debug!(resource_type = %self.resource_type, key = %item.key, "delete for unknown key");
                }
                out.push(self.event(EventKind::Delete, item));
            }
            Notification::SnapshotComplete => {
                return Err(WatchError::Internal("snapshot completion passed to classify".into()));
            }
        }
        Ok(out)
    }

    /// Handle the source's "snapshot fully delivered" marker.
    pub fn complete_snapshot(&mut self) -> Completion {
        if let Some(seen) = self.resync.take() {
            let stale: Vec<String> = self.cache.keys().filter(|k| !seen.contains(*k)).map(str::to_string).collect();
            let mut events = Vec::with_capacity(stale.len());
            for key in stale {
                if let Some(item) = self.cache.remove(&key) {
                    events.push(self.event(EventKind::Delete, item));
                }
            }
            debug!(resource_type = %self.resource_type, deleted = events.len(), "resync complete");
            return Completion::Resynced(events);
        }
        if self.state.mark_synced() {
            debug!(resource_type = %self.resource_type, items = self.cache.len(), "synced");
            Completion::Synced
        } else {
            Completion::Ignored
        }
    }

    /// Start reconciling a fresh snapshot against the cache. Only meaningful once synced.
    pub fn begin_resync(&mut self) {
        debug_assert!(self.state.is_synced(), "resync before first sync");
        self.resync = Some(FxHashSet::default());
    }

    fn event(&self, kind: EventKind, item: ResourceItem) -> WatchEvent {
        WatchEvent { resource_type: self.resource_type, kind, item }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, v: &str) -> ResourceItem {
        ResourceItem::new(key, v, serde_json::json!({ "v": v }))
    }

    #[test]
    fn cache_put_overwrites_and_remove_is_noop_when_absent() {
        let mut c = IndexedCache::new();
        assert!(c.put(item("a", "1")).is_none());
        assert_eq!(c.put(item("a", "2")).map(|p| p.version), Some("1".to_string()));
        assert_eq!(c.get("a").map(|i| i.version.as_str()), Some("2"));
        assert!(c.remove("zzz").is_none());
        assert!(c.remove("a").is_some());
        assert!(!c.contains("a"));
        assert!(c.is_empty());
    }

    #[test]
    fn sync_state_transitions_once() {
        let mut s = SyncState::default();
        assert!(!s.is_synced());
        assert!(s.mark_synced());
        assert!(!s.mark_synced());
        assert!(s.is_synced());
    }

    #[test]
    fn missing_identity_is_rejected_without_touching_cache() {
        let mut c = Classifier::new(ResourceType::Pod);
        let err = c.classify(Notification::Seen(item("", "1"))).unwrap_err();
        assert!(matches!(err, WatchError::Classification { .. }));
        assert!(c.cache().is_empty());
    }

    #[test]
    fn completion_marker_is_not_an_item() {
        let mut c = Classifier::new(ResourceType::Pod);
        assert!(c.classify(Notification::SnapshotComplete).is_err());
    }

    #[test]
    fn second_completion_is_ignored() {
        let mut c = Classifier::new(ResourceType::Node);
        assert_eq!(c.complete_snapshot(), Completion::Synced);
        assert_eq!(c.complete_snapshot(), Completion::Ignored);
    }
}
