//! Runs one watch session per resource type and collects their outcomes.

use std::sync::Arc;

use kwatch_core::{Observer, ResourceType, SourceAdapter, WatchError, WatchResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::WatchConfig;
use crate::session::{SessionReport, WatchSession};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub resource_type: ResourceType,
    pub result: Result<SessionReport, WatchError>,
}

/// Per-type results, in configuration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorReport {
    pub outcomes: Vec<SessionOutcome>,
}

impl SupervisorReport {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &SessionReport> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (ResourceType, &WatchError)> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err().map(|e| (o.resource_type, e)))
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<&SessionOutcome> {
        self.outcomes.iter().find(|o| o.resource_type == resource_type)
    }
}

pub struct Supervisor {
    config: Arc<WatchConfig>,
    source: Arc<dyn SourceAdapter>,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: WatchConfig, source: Arc<dyn SourceAdapter>, observer: Arc<dyn Observer>) -> WatchResult<Self> {
        config.validate()?;
        Ok(Self { config: Arc::new(config), source, observer, cancel: CancellationToken::new() })
    }

    /// Cancelling this token stops every session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start all sessions concurrently and wait until every one has stopped.
    pub async fn run(self) -> SupervisorReport {
        let types = self.config.distinct_types();
        if types.len() != self.config.resource_types.len() {
            warn!(configured = self.config.resource_types.len(), distinct = types.len(), "duplicate resource types ignored");
        }
        info!(types = ?types, fail_fast = self.config.fail_fast, "supervisor starting");

        let mut handles = Vec::with_capacity(types.len());
        for rt in types {
            let session = WatchSession::new(
                rt,
                Arc::clone(&self.source),
                Arc::clone(&self.observer),
                Arc::clone(&self.config),
                self.cancel.child_token(),
            );
            let task = session.run().instrument(info_span!("session", resource_type = %rt));
            handles.push((rt, tokio::spawn(task)));
        }

        // Handled at join time: a panicked session must trigger fail-fast too.
        let parent = &self.cancel;
        let fail_fast = self.config.fail_fast;
        let outcomes = futures::future::join_all(handles.into_iter().map(|(rt, h)| async move {
            let result = match h.await {
                Ok(r) => r,
                Err(e) => Err(WatchError::Internal(format!("session task for {} failed: {}", rt, e))),
            };
            if let Err(e) = &result {
                if fail_fast && !parent.is_cancelled() {
                    warn!(resource_type = %rt, error = %e, "cancelling sibling sessions");
                    parent.cancel();
                }
            }
            SessionOutcome { resource_type: rt, result }
        }))
        .await;

        let report = SupervisorReport { outcomes };
        for o in &report.outcomes {
            match &o.result {
                Ok(r) => info!(resource_type = %o.resource_type, synced = r.reached_synced, events = r.counts.total(), "session ok"),
                Err(e) => error!(resource_type = %o.resource_type, error = %e, "session failed"),
            }
        }
        report
    }
}
