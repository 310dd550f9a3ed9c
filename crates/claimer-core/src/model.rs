use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Remote-assigned identifier of a claimable item.
pub type ItemId = u64;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse the ISO-like timestamps used both by the remote service
/// (`2024-01-01 12:00:00`) and by user input (`2024-01-01T12:00`).
pub fn parse_timestamp(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Audit,
    Produce,
}

impl TaskType {
    /// Path segment used by the list and label endpoints.
    pub fn queue_segment(self) -> &'static str {
        match self {
            TaskType::Audit => "audittask",
            TaskType::Produce => "producetask",
        }
    }

    /// Path segment used by the claim endpoint.
    pub fn commit_segment(self) -> &'static str {
        match self {
            TaskType::Audit => "audittaskcommit",
            TaskType::Produce => "producetaskcommit",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Audit => "audit",
            TaskType::Produce => "produce",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audit" | "audittask" => Ok(TaskType::Audit),
            "produce" | "producetask" => Ok(TaskType::Produce),
            other => Err(format!("unknown task type: {other:?}")),
        }
    }
}

/// Numeric filter identifiers sent with every list request.
///
/// `step` is the grade filter (the remote service calls grades "steps").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterIds {
    pub step: u32,
    pub subject: u32,
    pub clue_type: u32,
}

impl Default for FilterIds {
    fn default() -> Self {
        Self {
            step: 1,
            subject: 2,
            clue_type: 1,
        }
    }
}

/// Credential presented to the remote service (a session cookie).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self(cookie.into().trim().to_string())
    }

    pub fn cookie(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Identity(<empty>)")
        } else {
            f.write_str("Identity(<redacted>)")
        }
    }
}

/// A claimable item as observed on a list page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clue {
    /// Id used for claiming: the clue id for produce tasks, the task id for audits.
    pub id: ItemId,
    pub task_id: u64,
    pub clue_id: u64,
    pub brief: String,
    #[serde(default)]
    pub subject_name: String,
    #[serde(default)]
    pub step_name: String,
    #[serde(default)]
    pub clue_type_name: String,
    pub dispatch_time: Option<NaiveDateTime>,
}

impl Clue {
    pub fn searchable_text(&self) -> &str {
        &self.brief
    }
}

/// Inclusive publish-time window; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl TimeWindow {
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        if let Some(start) = self.start {
            if at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if at > end {
                return false;
            }
        }
        true
    }
}
