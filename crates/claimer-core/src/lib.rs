//! Shared types for the clue claimer: session configuration, observed items,
//! the claimability matcher and the on-disk settings file.

pub mod config;
pub mod matcher;
pub mod model;
pub mod settings;

pub use config::{ConfigError, SessionConfig};
pub use matcher::{ClueFilter, matches};
pub use model::{Clue, FilterIds, Identity, ItemId, TaskType, TimeWindow, parse_timestamp};
