use std::time::Duration;

use kwatch_core::{ResourceType, WatchError, WatchResult};
use serde::{Deserialize, Serialize};

/// Everything a supervisor and its sessions need to run. Passed explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchConfig {
    pub resource_types: Vec<ResourceType>,
    /// How long a session stays live after reaching sync. `None` runs until cancelled.
    pub run_for: Option<Duration>,
    /// Deadline for the initial snapshot. `None` waits forever.
    pub sync_timeout: Option<Duration>,
    /// How long a stopping session waits for queued events to reach the observer.
    pub drain_grace: Duration,
    pub queue_capacity: usize,
    /// Resubscribe attempts after the live stream fails. 0 makes every disconnect fatal.
    pub max_resubscribes: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Cancel every sibling session as soon as one fails.
    pub fail_fast: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resource_types: ResourceType::ALL.to_vec(),
            run_for: Some(Duration::from_secs(5 * 60)),
            sync_timeout: Some(Duration::from_secs(60)),
            drain_grace: Duration::from_secs(2),
            queue_capacity: 1024,
            max_resubscribes: 0,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            fail_fast: false,
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> WatchResult<()> {
        if self.resource_types.is_empty() {
            return Err(WatchError::Config("no resource types to watch".into()));
        }
        if self.queue_capacity == 0 {
            return Err(WatchError::Config("queue capacity must be at least 1".into()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(WatchError::Config(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff_base, self.backoff_max
            )));
        }
        Ok(())
    }

    /// Configured types in order, duplicates removed.
    pub fn distinct_types(&self) -> Vec<ResourceType> {
        let mut out: Vec<ResourceType> = Vec::with_capacity(self.resource_types.len());
        for rt in &self.resource_types {
            if !out.contains(rt) {
                out.push(*rt);
            }
        }
        out
    }

    /// Delay before resubscribe attempt `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.backoff_base.saturating_mul(1u32 << shift).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_watches_everything_for_five_minutes() {
        let cfg = WatchConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.resource_types.len(), 5);
        assert_eq!(cfg.run_for, Some(Duration::from_secs(300)));
        assert_eq!(cfg.max_resubscribes, 0);
    }

    #[test]
    fn validate_rejects_empty_types_and_zero_queue() {
        let cfg = WatchConfig { resource_types: vec![], ..Default::default() };
        assert!(matches!(cfg.validate(), Err(WatchError::Config(_))));
        let cfg = WatchConfig { queue_capacity: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = WatchConfig { backoff_base: Duration::from_secs(60), ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn distinct_types_keep_first_occurrence_order() {
        let cfg = WatchConfig {
            resource_types: vec![ResourceType::Pod, ResourceType::Node, ResourceType::Pod],
            ..Default::default()
        };
        assert_eq!(cfg.distinct_types(), vec![ResourceType::Pod, ResourceType::Node]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.backoff(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff(4), Duration::from_secs(8));
        assert_eq!(cfg.backoff(10), Duration::from_secs(30));
        assert_eq!(cfg.backoff(u32::MAX), Duration::from_secs(30));
    }
}
