//! Application state shared across handlers

use crate::hub::EventHub;
use crate::lifecycle::ShutdownController;
use crate::status_store::StatusStore;
use crate::store::Database;
use crate::update::UpdateOrchestrator;
use nodedash_common::config::HubConfig;
use nodedash_common::operation::stale_threshold;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub status: Arc<StatusStore>,
    pub hub: Arc<EventHub>,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub db: Arc<Database>,
    pub shutdown: ShutdownController,
    /// Same threshold the janitor sweeps with
    pub stale_after: chrono::Duration,
    pub mailbox_capacity: usize,
    pub start_time: Instant,
}

pub type AppStateArc = Arc<AppState>;

impl AppState {
    pub fn new(
        status: Arc<StatusStore>,
        hub: Arc<EventHub>,
        orchestrator: Arc<UpdateOrchestrator>,
        db: Arc<Database>,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            status,
            hub,
            orchestrator,
            db,
            shutdown,
            stale_after: stale_threshold(),
            mailbox_capacity: HubConfig::default().mailbox_capacity,
            start_time: Instant::now(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }
}
