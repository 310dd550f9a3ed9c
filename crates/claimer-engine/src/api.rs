//! Public API types for the in-process auto-claim engine.

use clue_claimer_core::{ConfigError, ItemId};
use serde::{Deserialize, Serialize};

use crate::backend::{TaskLabels, UserInfo};

/// Lifecycle phase of the (single) session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No session is running.
    #[default]
    Idle,
    /// The poll loop is active.
    Running,
    /// Cancellation has been raised; in-flight claims are draining.
    Stopping,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StopReason {
    /// The caller asked to stop.
    Requested,
    /// The claim limit was reached.
    LimitReached,
    /// An unrecoverable failure (rejected credential, repeated list failures).
    Fatal {
        /// Human-readable cause.
        message: String,
    },
}

/// Result of a single claim attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    /// Claimed item.
    pub item_id: ItemId,
    /// Whether the service assigned the item to us.
    pub success: bool,
    /// Failure detail; present iff `success` is false.
    pub error: Option<String>,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// A session started.
    Started {
        /// Configured claim limit.
        claim_limit: u32,
    },
    /// Stop was requested by the caller.
    StopRequested,
    /// A list page was fetched and filtered.
    PageFetched {
        /// Poll cycle number (1-based).
        cycle: u64,
        /// Page number within the cycle (1-based).
        page: u32,
        /// Items on the page.
        items: usize,
        /// Items that passed the matcher.
        matched: usize,
    },
    /// A list request failed.
    PollFailed {
        /// Error message.
        message: String,
    },
    /// A claim attempt finished.
    ClaimFinished {
        /// Attempt outcome.
        outcome: ClaimOutcome,
        /// Successful claims so far.
        successful_claims: u32,
    },
    /// The claim limit was reached; the session is stopping.
    LimitReached,
    /// The session is idle again.
    Stopped {
        /// Why it ended.
        reason: StopReason,
        /// Final number of successful claims.
        successful_claims: u32,
    },
}

/// Current session state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Whether the session is running (and accepts no new start).
    pub is_active: bool,
    /// Successful claims in the current (or last) session.
    pub successful_claims: u32,
    /// Claim limit of the current (or last) session.
    pub claim_limit: u32,
    /// Claim requests currently in flight.
    pub in_flight: u32,
    /// Most recent failure message, empty if none.
    pub last_error: String,
}

/// Reasons a session cannot start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// A session is running or still draining.
    #[error("auto-claiming is already active")]
    AlreadyRunning,
    /// The configuration violates an invariant.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Response of start/stop commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command succeeded.
    pub success: bool,
    /// Human-readable result.
    pub message: String,
}

/// Response of the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Always true; the query itself cannot fail.
    pub success: bool,
    /// Whether a session is running.
    pub is_active: bool,
    /// Successful claims.
    pub successful_claims: u32,
    /// Most recent failure message, empty if none.
    pub last_error: String,
}

impl From<&StatusSnapshot> for StatusResponse {
    fn from(snap: &StatusSnapshot) -> Self {
        Self {
            success: true,
            is_active: snap.is_active,
            successful_claims: snap.successful_claims,
            last_error: snap.last_error.clone(),
        }
    }
}

/// Errno used when the request never produced a service response.
pub const LOCAL_FAILURE_ERRNO: i64 = -1;

/// Response of the taxonomy lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelsResponse {
    /// `0` on success.
    pub errno: i64,
    /// Failure detail.
    pub errmsg: String,
    /// Filter taxonomy (empty on failure).
    pub data: TaskLabels,
}

/// Response of the identity lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoResponse {
    /// `0` on success.
    pub errno: i64,
    /// Failure detail.
    pub errmsg: String,
    /// Account details (empty on failure).
    pub data: UserInfo,
}
