//! kwatch core types: resource types, items, notifications, events and the
//! source/observer seams every other crate plugs into.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Remote collection a watch session tracks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Endpoints,
    Pod,
    Service,
    Node,
    Namespace,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Endpoints,
        ResourceType::Pod,
        ResourceType::Service,
        ResourceType::Node,
        ResourceType::Namespace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Endpoints => "Endpoints",
            ResourceType::Pod => "Pod",
            ResourceType::Service => "Service",
            ResourceType::Node => "Node",
            ResourceType::Namespace => "Namespace",
        }
    }

    /// Whether objects of this type live inside a namespace.
    pub fn is_namespaced(self) -> bool {
        !matches!(self, ResourceType::Node | ResourceType::Namespace)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "endpoints" => Ok(ResourceType::Endpoints),
            "pod" | "pods" => Ok(ResourceType::Pod),
            "service" | "services" => Ok(ResourceType::Service),
            "node" | "nodes" => Ok(ResourceType::Node),
            "namespace" | "namespaces" => Ok(ResourceType::Namespace),
            _ => Err(WatchError::Config(format!(
                "unknown resource type: {} (expect one of Endpoints, Pod, Service, Node, Namespace)",
                s
            ))),
        }
    }
}

/// One remote object. Only `key` and `version` are interpreted; `raw` is carried
/// through to observers untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceItem {
    /// Identity within the resource type (`namespace/name` or `name`).
    pub key: String,
    /// Opaque change marker (Kubernetes resourceVersion).
    pub version: String,
    pub raw: serde_json::Value,
}

impl ResourceItem {
    pub fn new(key: impl Into<String>, version: impl Into<String>, raw: serde_json::Value) -> Self {
        Self { key: key.into(), version: version.into(), raw }
    }

    pub fn has_identity(&self) -> bool {
        !self.key.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Exist,
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Exist => "EXIST",
            EventKind::Add => "ADD",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit emitted to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    pub resource_type: ResourceType,
    pub kind: EventKind,
    pub item: ResourceItem,
}

/// Raw change notification as delivered by a source.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Item reported as present (snapshot entry or live add).
    Seen(ResourceItem),
    Changed(ResourceItem),
    Removed(ResourceItem),
    /// The snapshot has been delivered in full.
    SnapshotComplete,
}

impl Notification {
    pub fn item(&self) -> Option<&ResourceItem> {
        match self {
            Notification::Seen(i) | Notification::Changed(i) | Notification::Removed(i) => Some(i),
            Notification::SnapshotComplete => None,
        }
    }
}

/// Errors surfaced by sources, sessions and the supervisor.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchError {
    #[error("connection: {0}")]
    Connection(String),
    #[error("snapshot for {resource_type}: {reason}")]
    Snapshot { resource_type: ResourceType, reason: String },
    #[error("subscription for {resource_type}: {reason}")]
    Subscription { resource_type: ResourceType, reason: String },
    #[error("classification for {resource_type}: {reason}")]
    Classification { resource_type: ResourceType, reason: String },
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl WatchError {
    /// Errors that end a session (everything except dropped notifications).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WatchError::Classification { .. })
    }
}

pub type WatchResult<T> = Result<T, WatchError>;

/// Stream of notifications for one resource type. Dropping it ends the subscription.
pub type NotificationStream = BoxStream<'static, WatchResult<Notification>>;

/// Supplies snapshot + live notifications for a resource type.
///
/// A stream must yield every snapshot item as [`Notification::Seen`], then one
/// [`Notification::SnapshotComplete`], then live changes. Snapshot and live
/// delivery may interleave before the completion marker.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn subscribe(&self, resource_type: ResourceType) -> WatchResult<NotificationStream>;
}

/// Receives every emitted event. Called from a dispatcher task; must not block for long.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &WatchEvent);
}

impl<F> Observer for F
where
    F: Fn(&WatchEvent) + Send + Sync,
{
    fn on_event(&self, event: &WatchEvent) {
        self(event)
    }
}

pub mod prelude {
    pub use super::{
        EventKind, Notification, NotificationStream, Observer, ResourceItem, ResourceType, SourceAdapter, WatchError,
        WatchEvent, WatchResult,
    };
}
