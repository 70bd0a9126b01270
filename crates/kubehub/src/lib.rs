//! kwatch kubehub – cluster connection and list+watch wiring.
//!
//! [`KubeSource`] implements [`SourceAdapter`] on top of `kube::runtime::watcher`.
//! The watcher only reports "applied" objects, so a small per-stream reflector
//! remembers which keys it has already delivered and splits applied objects
//! into `Seen` and `Changed`, the way an informer's store does.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    discovery::Discovery,
    runtime::watcher::{self, Event},
    Client, Config,
};
use kwatch_core::{Notification, NotificationStream, ResourceItem, ResourceType, SourceAdapter, WatchError, WatchResult};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Where and how to reach the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Explicit kubeconfig file; falls back to the usual inference when unset.
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Restrict namespaced resource types to one namespace (default: all).
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { kubeconfig: None, context: None, namespace: None, label_selector: None, connect_timeout: Duration::from_secs(10) }
    }
}

/// A resource type and whether the API server currently serves it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServedResource {
    pub resource_type: ResourceType,
    pub api_version: String,
    pub namespaced: bool,
    pub served: bool,
}

/// List+watch source backed by a kube client.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    namespace: Option<String>,
    label_selector: Option<String>,
}

impl fmt::Debug for KubeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeSource")
            .field("namespace", &self.namespace)
            .field("label_selector", &self.label_selector)
            .finish_non_exhaustive()
    }
}

fn connection_err(what: &str, e: impl fmt::Display) -> WatchError {
    WatchError::Connection(format!("{}: {}", what, e))
}

impl KubeSource {
    /// Resolve credentials, build a client and make one round trip to the API server.
    pub async fn connect(cfg: &ConnectionConfig) -> WatchResult<Self> {
        let opts = KubeConfigOptions { context: cfg.context.clone(), ..Default::default() };
        let config = match &cfg.kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).map_err(|e| connection_err(&format!("reading kubeconfig {}", path.display()), e))?;
                Config::from_custom_kubeconfig(kc, &opts).await.map_err(|e| connection_err("loading kubeconfig", e))?
            }
            None if cfg.context.is_some() => Config::from_kubeconfig(&opts).await.map_err(|e| connection_err("loading kubeconfig", e))?,
            None => Config::infer().await.map_err(|e| connection_err("inferring kube config", e))?,
        };
        let cluster_url = config.cluster_url.to_string();
        let client = Client::try_from(config).map_err(|e| connection_err("building client", e))?;
        let version = tokio::time::timeout(cfg.connect_timeout, client.apiserver_version())
            .await
            .map_err(|_| WatchError::Connection(format!("no answer from {} within {:?}", cluster_url, cfg.connect_timeout)))?
            .map_err(|e| connection_err("querying apiserver version", e))?;
        info!(cluster = %cluster_url, version = %version.git_version, "connected");
        Ok(Self::from_client(client, cfg))
    }

    pub fn from_client(client: Client, cfg: &ConnectionConfig) -> Self {
        Self { client, namespace: cfg.namespace.clone(), label_selector: cfg.label_selector.clone() }
    }

    fn api_for(&self, resource_type: ResourceType) -> Api<DynamicObject> {
        let ar = api_resource(resource_type);
        match (&self.namespace, resource_type.is_namespaced()) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    /// Check which of the enumerated resource types the cluster serves.
    pub async fn probe(&self) -> WatchResult<Vec<ServedResource>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| connection_err("running discovery", e))?;
        let mut out = Vec::with_capacity(ResourceType::ALL.len());
        for rt in ResourceType::ALL {
            let ar = api_resource(rt);
            let served = discovery.groups().any(|g| {
                g.recommended_resources().iter().any(|(r, _)| r.group == ar.group && r.version == ar.version && r.kind == ar.kind)
            });
            out.push(ServedResource { resource_type: rt, api_version: ar.api_version.clone(), namespaced: rt.is_namespaced(), served });
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for KubeSource {
    async fn subscribe(&self, resource_type: ResourceType) -> WatchResult<NotificationStream> {
        let api = self.api_for(resource_type);
        let mut cfg = watcher::Config::default();
        if let Some(sel) = self.label_selector.as_deref() {
            cfg = cfg.labels(sel);
        }
        info!(resource_type = %resource_type, ns = ?self.namespace, selector = ?self.label_selector, "watcher started");
        let mut reflector = Reflector::new(resource_type);
        let stream = watcher::watcher(api, cfg)
            .map(move |res| match res {
                Ok(ev) => reflector.on_event(ev).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(reflector.on_error(e))],
            })
            .flat_map(futures::stream::iter);
        Ok(stream.boxed())
    }
}

/// Map an enumerated resource type onto its core/v1 API resource.
pub fn api_resource(resource_type: ResourceType) -> ApiResource {
    match resource_type {
        ResourceType::Endpoints => ApiResource::erase::<Endpoints>(&()),
        ResourceType::Pod => ApiResource::erase::<Pod>(&()),
        ResourceType::Service => ApiResource::erase::<Service>(&()),
        ResourceType::Node => ApiResource::erase::<Node>(&()),
        ResourceType::Namespace => ApiResource::erase::<Namespace>(&()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Store key: `namespace/name`, or `name` for cluster-scoped objects. Empty when unnamed.
pub fn object_key(obj: &DynamicObject) -> String {
    let name = obj.metadata.name.as_deref().unwrap_or("");
    if name.is_empty() {
        return String::new();
    }
    match obj.metadata.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

pub fn item_from(obj: &DynamicObject) -> ResourceItem {
    let key = object_key(obj);
    let version = obj.metadata.resource_version.clone().unwrap_or_default();
    let raw = match serde_json::to_value(obj) {
        Ok(mut raw) => {
            strip_managed_fields(&mut raw);
            raw
        }
        Err(e) => {
            warn!(key = %key, error = %e, "serializing DynamicObject failed; forwarding without payload");
            serde_json::Value::Null
        }
    };
    ResourceItem { key, version, raw }
}

/// Per-stream memory of delivered keys and their versions.
#[derive(Debug)]
struct Reflector {
    resource_type: ResourceType,
    known: FxHashMap<String, String>,
    listed: bool,
}

impl Reflector {
    fn new(resource_type: ResourceType) -> Self {
        Self { resource_type, known: FxHashMap::default(), listed: false }
    }

    fn on_event(&mut self, ev: Event<DynamicObject>) -> Vec<Notification> {
        match ev {
            Event::Applied(o) => {
                let item = item_from(&o);
                if item.key.is_empty() {
                    return vec![Notification::Seen(item)];
                }
                match self.known.insert(item.key.clone(), item.version.clone()) {
                    None => vec![Notification::Seen(item)],
                    Some(_) => vec![Notification::Changed(item)],
                }
            }
            Event::Deleted(o) => {
                let item = item_from(&o);
                self.known.remove(&item.key);
                vec![Notification::Removed(item)]
            }
            Event::Restarted(list) => {
                debug!(resource_type = %self.resource_type, count = list.len(), relist = self.listed, "watch restart");
                if self.listed {
                    counter!("kube_watch_relists_total", 1u64, "resource_type" => self.resource_type.as_str());
                    self.reconcile(list)
                } else {
                    self.listed = true;
                    let mut out = Vec::with_capacity(list.len() + 1);
                    for o in list.iter() {
                        let item = item_from(o);
                        if !item.key.is_empty() {
                            self.known.insert(item.key.clone(), item.version.clone());
                        }
                        out.push(Notification::Seen(item));
                    }
                    out.push(Notification::SnapshotComplete);
                    out
                }
            }
        }
    }

    /// Diff a relisted snapshot against what this stream already delivered.
    ///
    /// The watcher only relists after it has yielded an error. `WatchSession`
    /// drops the stream at that error and resyncs on a fresh subscription, so
    /// this path serves consumers that keep polling a stream past its errors.
    fn reconcile(&mut self, list: Vec<DynamicObject>) -> Vec<Notification> {
        let mut out = Vec::new();
        let mut fresh: FxHashMap<String, String> = FxHashMap::default();
        for o in list.iter() {
            let item = item_from(o);
            if item.key.is_empty() {
                out.push(Notification::Seen(item));
                continue;
            }
            fresh.insert(item.key.clone(), item.version.clone());
            match self.known.get(&item.key) {
                None => out.push(Notification::Seen(item)),
                Some(v) if *v != item.version => out.push(Notification::Changed(item)),
                Some(_) => {}
            }
        }
        let mut gone: Vec<(String, String)> = self.known.iter().filter(|(k, _)| !fresh.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone())).collect();
        gone.sort();
        for (key, version) in gone {
            out.push(Notification::Removed(ResourceItem { key, version, raw: serde_json::Value::Null }));
        }
        self.known = fresh;
        out
    }

    fn on_error(&self, err: impl fmt::Display) -> WatchError {
        counter!("kube_watch_errors_total", 1u64, "resource_type" => self.resource_type.as_str());
        warn!(resource_type = %self.resource_type, error = %err, "watcher error");
        WatchError::Subscription { resource_type: self.resource_type, reason: err.to_string() }
    }
}
