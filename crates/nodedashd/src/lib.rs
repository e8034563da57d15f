//! nodedash daemon library.
//!
//! Event hub, status store, stale-operation janitor and self-update
//! orchestration, plus the HTTP surface over them.

pub mod hub;
pub mod janitor;
pub mod lifecycle;
pub mod logging;
pub mod routes;
pub mod server;
pub mod state;
pub mod status_store;
pub mod store;
pub mod update;
pub mod updater;

pub use hub::{EventHub, Mailbox, Subscriber};
pub use janitor::{Janitor, JanitorHandle};
pub use lifecycle::{DaemonLifecycle, Lifecycle, ShutdownController};
pub use state::AppState;
pub use status_store::StatusStore;
pub use store::Database;
pub use update::{ShutdownTimings, UpdateOrchestrator, UpdateOutcome};
pub use updater::{CommandUpdater, UpdateSource};
