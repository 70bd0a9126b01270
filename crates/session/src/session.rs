//! One resource type's watch lifecycle: subscribe, load, go live, stop.

use std::sync::Arc;

use futures::StreamExt;
use kwatch_core::{
    EventKind, Notification, NotificationStream, Observer, ResourceType, SourceAdapter, WatchError, WatchEvent,
    WatchResult,
};
use kwatch_store::{Classifier, Completion};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::dispatch;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionPhase {
    Starting,
    Loading,
    Synced,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// The run timer armed at sync time elapsed.
    Elapsed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCounts {
    pub exist: u64,
    pub add: u64,
    pub update: u64,
    pub delete: u64,
    /// Notifications rejected by the classifier.
    pub dropped: u64,
}

impl EventCounts {
    pub fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::Exist => self.exist += 1,
            EventKind::Add => self.add += 1,
            EventKind::Update => self.update += 1,
            EventKind::Delete => self.delete += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.exist + self.add + self.update + self.delete
    }
}

/// Summary of a session that stopped cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionReport {
    pub resource_type: ResourceType,
    pub counts: EventCounts,
    pub reached_synced: bool,
    pub sync_ms: Option<u64>,
    pub stop_reason: StopReason,
    pub resubscribes: u32,
    /// Every phase the session entered, in order.
    pub phases: Vec<SessionPhase>,
    pub cache_items: usize,
    /// Events the observer actually received before the queue closed.
    pub delivered: u64,
    /// False when the observer was aborted before it caught up.
    pub drain_complete: bool,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

struct PhaseLog {
    tx: watch::Sender<SessionPhase>,
    trace: Vec<SessionPhase>,
}

impl PhaseLog {
    fn enter(&mut self, resource_type: ResourceType, phase: SessionPhase) {
        if self.trace.last() == Some(&phase) {
            return;
        }
        debug!(resource_type = %resource_type, phase = ?phase, "session phase");
        self.trace.push(phase);
        self.tx.send_replace(phase);
    }
}

/// Mutable bookkeeping threaded through the pump loop.
struct Progress {
    counts: EventCounts,
    started: Instant,
    sync_ms: Option<u64>,
    sync_deadline: Option<Instant>,
    stop_at: Option<Instant>,
}

/// Watches one resource type until its stop condition fires.
///
/// The classifier (cache + sync state) lives on this task's stack for the
/// whole run; notifications are processed one at a time, so neither needs a lock.
pub struct WatchSession {
    resource_type: ResourceType,
    source: Arc<dyn SourceAdapter>,
    observer: Arc<dyn Observer>,
    config: Arc<WatchConfig>,
    cancel: CancellationToken,
    phase: PhaseLog,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending::<()>().await,
    }
}

impl WatchSession {
    pub fn new(
        resource_type: ResourceType,
        source: Arc<dyn SourceAdapter>,
        observer: Arc<dyn Observer>,
        config: Arc<WatchConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, _rx) = watch::channel(SessionPhase::Starting);
        let phase = PhaseLog { tx, trace: vec![SessionPhase::Starting] };
        Self { resource_type, source, observer, config, cancel, phase }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Follow phase changes while the session runs.
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.tx.subscribe()
    }

    pub async fn run(mut self) -> WatchResult<SessionReport> {
        let rt = self.resource_type;
        let started_at_ms = chrono::Utc::now().timestamp_millis();
        let started = Instant::now();
        let mut progress = Progress {
            counts: EventCounts::default(),
            started,
            sync_ms: None,
            sync_deadline: self.config.sync_timeout.map(|d| started + d),
            stop_at: None,
        };
        let dispatcher = dispatch::spawn(Arc::clone(&self.observer), self.config.queue_capacity);
        let mut classifier = Classifier::new(rt);
        let mut resubscribes = 0u32;
        info!(resource_type = %rt, "session starting");

        let outcome: WatchResult<StopReason> = loop {
            let loading = !classifier.state().is_synced();
            let subscribed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(StopReason::Cancelled),
                _ = sleep_until_opt(if loading { progress.sync_deadline } else { None }) => Err(self.sync_timed_out()),
                res = self.source.subscribe(rt) => res,
            };
            let failure = match subscribed {
                Ok(stream) => {
                    if loading {
                        self.phase.enter(rt, SessionPhase::Loading);
                    }
                    match self.pump(stream, &mut classifier, dispatcher.sender(), &mut progress).await {
                        Ok(reason) => break Ok(reason),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            let synced = classifier.state().is_synced();
            let failure = session_failure(rt, synced, failure);
            if !synced || !failure.is_fatal() || resubscribes >= self.config.max_resubscribes {
                break Err(failure);
            }
            resubscribes += 1;
            let delay = self.config.backoff(resubscribes);
            counter!("watch_resubscribes_total", 1u64, "resource_type" => rt.as_str());
            warn!(resource_type = %rt, error = %failure, attempt = resubscribes, delay_ms = %delay.as_millis(), "live stream failed; resubscribing");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(StopReason::Cancelled),
                _ = sleep_until_opt(progress.stop_at) => break Ok(StopReason::Elapsed),
                _ = tokio::time::sleep(delay) => {}
            }
            classifier.begin_resync();
        };

        self.phase.enter(rt, SessionPhase::Stopping);
        let drained = dispatcher.close(self.config.drain_grace).await;
        self.phase.enter(rt, SessionPhase::Stopped);
        gauge!("watch_cache_items", 0.0, "resource_type" => rt.as_str());

        match outcome {
            Ok(stop_reason) => {
                let report = SessionReport {
                    resource_type: rt,
                    counts: progress.counts,
                    reached_synced: classifier.state().is_synced(),
                    sync_ms: progress.sync_ms,
                    stop_reason,
                    resubscribes,
                    phases: self.phase.trace.clone(),
                    cache_items: classifier.cache().len(),
                    delivered: drained.delivered,
                    drain_complete: drained.complete,
                    started_at_ms,
                    finished_at_ms: chrono::Utc::now().timestamp_millis(),
                };
                info!(
                    resource_type = %rt,
                    reason = ?stop_reason,
                    events = report.counts.total(),
                    cache_items = report.cache_items,
                    drained = drained.complete,
                    "session stopped"
                );
                Ok(report)
            }
            Err(e) => {
                error!(resource_type = %rt, error = %e, events = progress.counts.total(), "session failed");
                Err(e)
            }
        }
    }

    /// Drive one subscription until the stop condition or a stream failure.
    async fn pump(
        &mut self,
        mut stream: NotificationStream,
        classifier: &mut Classifier,
        events: &mpsc::Sender<WatchEvent>,
        progress: &mut Progress,
    ) -> WatchResult<StopReason> {
        let rt = self.resource_type;
        loop {
            let deadline = if classifier.state().is_synced() { None } else { progress.sync_deadline };
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
                _ = sleep_until_opt(progress.stop_at) => return Ok(StopReason::Elapsed),
                _ = sleep_until_opt(deadline) => return Err(self.sync_timed_out()),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Notification::SnapshotComplete)) => match classifier.complete_snapshot() {
                    Completion::Synced => {
                        let ms = progress.started.elapsed().as_millis() as u64;
                        progress.sync_ms = Some(ms);
                        progress.stop_at = self.config.run_for.map(|d| Instant::now() + d);
                        histogram!("watch_sync_ms", ms as f64, "resource_type" => rt.as_str());
                        info!(resource_type = %rt, sync_ms = ms, items = classifier.cache().len(), "cache synced");
                        self.phase.enter(rt, SessionPhase::Synced);
                    }
                    Completion::Resynced(deletes) => {
                        info!(resource_type = %rt, deleted = deletes.len(), items = classifier.cache().len(), "cache resynced");
                        for ev in deletes {
                            if let Some(reason) = self.emit(ev, events, None, progress).await? {
                                return Ok(reason);
                            }
                        }
                    }
                    Completion::Ignored => debug!(resource_type = %rt, "duplicate snapshot completion ignored"),
                },
                Some(Ok(n)) => match classifier.classify(n) {
                    Ok(out) => {
                        for ev in out {
                            if let Some(reason) = self.emit(ev, events, deadline, progress).await? {
                                return Ok(reason);
                            }
                        }
                        gauge!("watch_cache_items", classifier.cache().len() as f64, "resource_type" => rt.as_str());
                    }
                    Err(e) => {
                        progress.counts.dropped += 1;
                        counter!("watch_events_dropped_total", 1u64, "resource_type" => rt.as_str());
                        warn!(resource_type = %rt, error = %e, "dropping malformed notification");
                    }
                },
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(WatchError::Subscription { resource_type: rt, reason: "stream ended".into() });
                }
            }
        }
    }

    /// Queue one event for the observer. Returns a stop reason if the session
    /// was told to stop while waiting for queue capacity, or the snapshot
    /// error if `sync_deadline` passed first.
    async fn emit(
        &self,
        ev: WatchEvent,
        events: &mpsc::Sender<WatchEvent>,
        sync_deadline: Option<Instant>,
        progress: &mut Progress,
    ) -> WatchResult<Option<StopReason>> {
        let kind = ev.kind;
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Some(StopReason::Cancelled)),
            _ = sleep_until_opt(progress.stop_at) => return Ok(Some(StopReason::Elapsed)),
            _ = sleep_until_opt(sync_deadline) => return Err(self.sync_timed_out()),
            res = events.send(ev) => res,
        };
        match sent {
            Ok(()) => {
                progress.counts.record(kind);
                counter!("watch_events_total", 1u64, "resource_type" => self.resource_type.as_str(), "kind" => kind.as_str());
            }
            Err(_) => warn!(resource_type = %self.resource_type, "observer queue closed; event lost"),
        }
        Ok(None)
    }

    fn sync_timed_out(&self) -> WatchError {
        WatchError::Snapshot {
            resource_type: self.resource_type,
            reason: format!("cache not synced within {:?}", self.config.sync_timeout.unwrap_or_default()),
        }
    }
}

/// A stream failure before sync is a snapshot failure; after sync it is a subscription failure.
fn session_failure(resource_type: ResourceType, synced: bool, err: WatchError) -> WatchError {
    match err {
        WatchError::Subscription { reason, .. } if !synced => WatchError::Snapshot { resource_type, reason },
        WatchError::Snapshot { reason, .. } if synced => WatchError::Subscription { resource_type, reason },
        other => other,
    }
}
