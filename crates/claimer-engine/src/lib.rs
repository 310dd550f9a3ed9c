#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process auto-claim engine: polls the remote clue queue, filters items
//! and claims matches through a bounded worker pool under one controllable
//! session.

/// Public API types for the engine crate.
pub mod api;
/// Remote queue client.
pub mod backend;

mod engine;
mod poll;
mod retry;
mod scheduler;
mod state;

pub use api::{
    ClaimOutcome, CommandResponse, LabelsResponse, SessionEvent, SessionPhase, StartError,
    StatusResponse, StatusSnapshot, StopReason, UserInfoResponse,
};
pub use backend::{
    HttpQueue, ItemPage, LabelGroup, LabelOption, ListQuery, QueueError, RemoteQueue, TaskLabels,
    UserInfo,
};
pub use engine::SessionController;
pub use retry::RetryPolicy;
