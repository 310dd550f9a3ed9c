use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{FilterIds, Identity, TaskType, TimeWindow};

/// A violated [`SessionConfig`] invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Configuration of one auto-claim session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub task_type: TaskType,
    pub filter_ids: FilterIds,
    /// Upper bound on successful claims.
    pub claim_limit: u32,
    pub poll_interval: Duration,
    /// Pages fetched per poll cycle; `0` pages until the queue runs dry.
    pub max_pages: u32,
    /// Number of claim requests allowed in flight at once.
    pub concurrency: usize,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    /// Only applied to [`TaskType::Produce`] sessions.
    pub time_window: TimeWindow,
    pub identity: Identity,
}

impl SessionConfig {
    pub const DEFAULT_CLAIM_LIMIT: u32 = 10;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_CONCURRENCY: usize = 10;
    /// Largest accepted `concurrency`; each unit is one worker task and one
    /// queue slot.
    pub const MAX_CONCURRENCY: usize = 256;

    pub fn new(task_type: TaskType, identity: Identity) -> Self {
        Self {
            task_type,
            filter_ids: FilterIds::default(),
            claim_limit: Self::DEFAULT_CLAIM_LIMIT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_pages: 0,
            concurrency: Self::DEFAULT_CONCURRENCY,
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            time_window: TimeWindow::default(),
            identity,
        }
    }

    /// Check the session invariants, reporting the first violated field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_limit == 0 {
            return Err(ConfigError::new("claim_limit", "must be greater than 0"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::new("concurrency", "must be at least 1"));
        }
        if self.concurrency > Self::MAX_CONCURRENCY {
            return Err(ConfigError::new(
                "concurrency",
                format!("must be at most {}", Self::MAX_CONCURRENCY),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::new("poll_interval", "must be a positive duration"));
        }
        if self.identity.is_empty() {
            return Err(ConfigError::new("identity", "credential is required"));
        }
        if let (Some(start), Some(end)) = (self.time_window.start, self.time_window.end) {
            if start > end {
                return Err(ConfigError::new(
                    "time_window",
                    format!("start {start} is after end {end}"),
                ));
            }
        }
        Ok(())
    }

    /// Whether the publish-time window takes part in matching for this session.
    pub fn time_window_applies(&self) -> bool {
        self.task_type == TaskType::Produce && !self.time_window.is_unbounded()
    }
}
