#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kwatch_core::{
    EventKind, Notification, NotificationStream, Observer, ResourceItem, ResourceType, SourceAdapter, WatchError,
    WatchEvent, WatchResult,
};
use rustc_hash::FxHashMap;

/// One scripted subscription: items to deliver, then either stay open or end.
pub struct Script {
    pub items: Vec<WatchResult<Notification>>,
    pub stay_open: bool,
}

impl Script {
    pub fn open(items: Vec<WatchResult<Notification>>) -> Self { Self { items, stay_open: true } }
    pub fn closing(items: Vec<WatchResult<Notification>>) -> Self { Self { items, stay_open: false } }
}

/// Source that replays prepared subscriptions per resource type.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<FxHashMap<ResourceType, VecDeque<Script>>>,
    pub subscribes: Mutex<Vec<ResourceType>>,
    panics: Mutex<Vec<ResourceType>>,
}

impl ScriptedSource {
    pub fn new() -> Self { Self::default() }

    pub fn with(self, rt: ResourceType, script: Script) -> Self {
        self.scripts.lock().unwrap().entry(rt).or_default().push_back(script);
        self
    }

    /// Subscribing to `rt` panics instead of returning.
    pub fn panicking(self, rt: ResourceType) -> Self {
        self.panics.lock().unwrap().push(rt);
        self
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ScriptedSource {
    async fn subscribe(&self, resource_type: ResourceType) -> WatchResult<NotificationStream> {
        self.subscribes.lock().unwrap().push(resource_type);
        if self.panics.lock().unwrap().contains(&resource_type) {
            panic!("scripted source blew up for {}", resource_type);
        }
        let script = self.scripts.lock().unwrap().get_mut(&resource_type).and_then(|q| q.pop_front());
        let Some(script) = script else {
            return Err(WatchError::Subscription { resource_type, reason: "no script left".into() });
        };
        let items = futures::stream::iter(script.items);
        if script.stay_open {
            Ok(items.chain(futures::stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }
}

/// Observer that records everything it receives.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<WatchEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn seen(&self) -> Vec<(ResourceType, EventKind, String)> {
        self.events.lock().unwrap().iter().map(|e| (e.resource_type, e.kind, e.item.key.clone())).collect()
    }

    pub fn kinds_for(&self, rt: ResourceType) -> Vec<(EventKind, String)> {
        self.seen().into_iter().filter(|(t, _, _)| *t == rt).map(|(_, k, key)| (k, key)).collect()
    }
}

impl Observer for Recorder {
    fn on_event(&self, event: &WatchEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Observer that blocks on every event until a permit arrives or the opener is dropped.
///
/// Waits through `block_in_place`, so tests using it need the multi-thread runtime.
pub struct Gate {
    permits: Mutex<std_mpsc::Receiver<()>>,
    pub delivered: AtomicU64,
}

impl Gate {
    pub fn closed() -> (std_mpsc::Sender<()>, Arc<Self>) {
        let (open, permits) = std_mpsc::channel();
        (open, Arc::new(Self { permits: Mutex::new(permits), delivered: AtomicU64::new(0) }))
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl Observer for Gate {
    fn on_event(&self, _event: &WatchEvent) {
        tokio::task::block_in_place(|| {
            let _ = self.permits.lock().unwrap().recv_timeout(Duration::from_secs(10));
        });
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn item(key: &str, rv: &str) -> ResourceItem {
    ResourceItem::new(key, rv, serde_json::json!({ "metadata": { "name": key, "resourceVersion": rv } }))
}

pub fn seen(key: &str, rv: &str) -> WatchResult<Notification> { Ok(Notification::Seen(item(key, rv))) }
pub fn changed(key: &str, rv: &str) -> WatchResult<Notification> { Ok(Notification::Changed(item(key, rv))) }
pub fn removed(key: &str, rv: &str) -> WatchResult<Notification> { Ok(Notification::Removed(item(key, rv))) }
pub fn complete() -> WatchResult<Notification> { Ok(Notification::SnapshotComplete) }

pub fn broken(rt: ResourceType, reason: &str) -> WatchResult<Notification> {
    Err(WatchError::Subscription { resource_type: rt, reason: reason.to_string() })
}
