//! Shared types for nodedash components.

pub mod config;
pub mod error;
pub mod events;
pub mod failure;
pub mod history;
pub mod operation;
pub mod status;

pub use config::Config;
pub use error::{NodedashError, UpdateError};
pub use events::{HubEvent, Topic};
pub use failure::FailureKind;
pub use history::{HistoryEntry, HistoryStatus};
pub use operation::{OperationRecord, OperationStatus};
pub use status::{UpdateStage, UpdateStatus};

/// Version of the running binary
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
