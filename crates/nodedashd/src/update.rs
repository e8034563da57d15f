//! Self-update orchestration.
//!
//! Drives one update run through checking → downloading → verifying →
//! applying → complete/failed, mirroring every step into the status store and
//! onto the event hub. A successful run ends with the daemon exiting so the
//! service supervisor restarts it on the new binary.

use crate::hub::EventHub;
use crate::lifecycle::Lifecycle;
use crate::status_store::StatusStore;
use crate::store::HistoryStore;
use crate::updater::UpdateSource;
use chrono::{DateTime, Utc};
use nodedash_common::config::UpdateConfig;
use nodedash_common::status::clamp_percentage;
use nodedash_common::{
    FailureKind, HistoryStatus, HubEvent, UpdateError, UpdateStage, UpdateStatus, VERSION,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Waits around the shutdown handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimings {
    /// Let in-flight responses flush before touching the database
    pub flush_grace: Duration,
    /// Let the filesystem settle after the checkpoint
    pub durability_grace: Duration,
    /// Delay before exiting on restart-for-update
    pub restart_delay: Duration,
}

impl ShutdownTimings {
    pub fn from_config(config: &UpdateConfig) -> Self {
        Self {
            flush_grace: Duration::from_secs(config.flush_grace_secs),
            durability_grace: Duration::from_secs(config.durability_grace_secs),
            restart_delay: Duration::from_secs(config.restart_delay_secs),
        }
    }

    pub fn immediate() -> Self {
        Self {
            flush_grace: Duration::ZERO,
            durability_grace: Duration::ZERO,
            restart_delay: Duration::ZERO,
        }
    }
}

impl Default for ShutdownTimings {
    fn default() -> Self {
        Self::from_config(&UpdateConfig::default())
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Completed { version: String },
    Failed { kind: FailureKind, details: String },
}

/// Progress sink handed to the update source for one run.
///
/// Percentages never go backwards and stages only move forward; a report that
/// would regress keeps the previous value.
pub struct ProgressReporter {
    status: Arc<StatusStore>,
    hub: Arc<EventHub>,
    started_at: DateTime<Utc>,
    latest: Mutex<UpdateStatus>,
}

impl ProgressReporter {
    pub fn new(
        status: Arc<StatusStore>,
        hub: Arc<EventHub>,
        base: UpdateStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        let latest = base.in_progress(UpdateStage::Idle, 0.0, "", started_at);
        Self {
            status,
            hub,
            started_at,
            latest: Mutex::new(latest),
        }
    }

    pub async fn report(&self, stage: UpdateStage, percentage: f64, message: impl Into<String>) {
        let message = message.into();
        let snapshot = {
            let mut latest = self.lock();
            let stage = if stage >= latest.stage && stage <= UpdateStage::Complete {
                stage
            } else {
                warn!("Ignoring stage regression {} -> {}", latest.stage, stage);
                latest.stage
            };
            let percentage = latest.percentage.max(clamp_percentage(percentage));
            *latest = latest.in_progress(stage, percentage, message.clone(), self.started_at);
            latest.clone()
        };

        self.status.set(snapshot.clone()).await;
        self.hub
            .publish_global(&HubEvent::UpdateProgress {
                stage: snapshot.stage,
                percentage: snapshot.percentage,
                message,
            })
            .await;
    }

    /// Last in-progress snapshot this run produced
    pub fn latest(&self) -> UpdateStatus {
        self.lock().clone()
    }

    pub fn stage(&self) -> UpdateStage {
        self.lock().stage
    }

    pub fn percentage(&self) -> f64 {
        self.lock().percentage
    }

    fn set_available_version(&self, version: &str) {
        self.lock().available_version = version.to_string();
    }

    fn lock(&self) -> MutexGuard<'_, UpdateStatus> {
        match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct UpdateOrchestrator {
    status: Arc<StatusStore>,
    hub: Arc<EventHub>,
    source: Arc<dyn UpdateSource>,
    history: Arc<dyn HistoryStore>,
    lifecycle: Arc<dyn Lifecycle>,
    timings: ShutdownTimings,
    channel: String,
    current_version: String,
    update_lock: Arc<AsyncMutex<()>>,
}

impl UpdateOrchestrator {
    pub fn new(
        status: Arc<StatusStore>,
        hub: Arc<EventHub>,
        source: Arc<dyn UpdateSource>,
        history: Arc<dyn HistoryStore>,
        lifecycle: Arc<dyn Lifecycle>,
    ) -> Self {
        Self {
            status,
            hub,
            source,
            history,
            lifecycle,
            timings: ShutdownTimings::default(),
            channel: "stable".to_string(),
            current_version: VERSION.to_string(),
            update_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn with_timings(mut self, timings: ShutdownTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = version.into();
        self
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Whether an update run or restart currently holds the exclusivity lock
    pub fn is_busy(&self) -> bool {
        self.update_lock.try_lock().is_err()
    }

    /// Ask the update source what is available and publish it as an idle
    /// snapshot. Marks a restart as required when the binary on disk is not
    /// the one running.
    pub async fn check_for_updates(&self) -> anyhow::Result<UpdateStatus> {
        let _guard = self
            .update_lock
            .try_lock()
            .map_err(|_| UpdateError::AlreadyRunning)?;

        let check = self.source.check().await?;
        let installed = check
            .installed_version
            .filter(|v| !v.is_empty() && *v != self.current_version);
        let restart_required = installed.is_some();
        let available = installed
            .or(check.available_version)
            .unwrap_or_default();

        if restart_required {
            info!(
                "Installed version {} differs from running {}, restart required",
                available, self.current_version
            );
        } else if !available.is_empty() {
            info!("Update available: {} -> {}", self.current_version, available);
        }

        let status = UpdateStatus::idle(&self.current_version, available)
            .with_restart_required(restart_required);
        Ok(self.status.set(status).await)
    }

    /// Start an update run in the background.
    ///
    /// The exclusivity lock is taken before spawning, so a second call while a
    /// run is in flight is rejected immediately.
    pub fn apply_update(self: &Arc<Self>) -> Result<JoinHandle<UpdateOutcome>, UpdateError> {
        let guard = Arc::clone(&self.update_lock)
            .try_lock_owned()
            .map_err(|_| UpdateError::AlreadyRunning)?;

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            // Held until the process exits or the run has failed
            let _guard = guard;
            let outcome = this.run().await;
            if let UpdateOutcome::Completed { version } = &outcome {
                this.exit_into(version).await;
            }
            outcome
        }))
    }

    async fn run(&self) -> UpdateOutcome {
        let started_at = Utc::now();
        let mut base = self.status.get().await;
        base.current_version = self.current_version.clone();
        // Best known target until the check answers; may be empty
        let expected = base.available_version.clone();

        let reporter = ProgressReporter::new(
            Arc::clone(&self.status),
            Arc::clone(&self.hub),
            base,
            started_at,
        );
        reporter
            .report(UpdateStage::Checking, 0.0, "Checking for updates")
            .await;

        // Recorded before the check so a failed check still leaves a row
        let history_id = match self
            .history
            .record_attempt(&expected, &self.channel, started_at)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Update history unavailable, continuing without it: {:#}", e);
                None
            }
        };

        let version = match self.source.check().await {
            Ok(check) => match check.available_version.filter(|v| !v.is_empty()) {
                Some(version) => version,
                None => {
                    let raw = UpdateError::NoUpdateAvailable.to_string();
                    return self.fail(&reporter, history_id, &expected, raw).await;
                }
            },
            Err(e) => {
                return self
                    .fail(&reporter, history_id, &expected, format!("{:#}", e))
                    .await
            }
        };

        info!("Applying update {} -> {}", self.current_version, version);
        reporter.set_available_version(&version);

        match self.source.apply(&version, &reporter).await {
            Ok(()) => {
                self.complete(&reporter, history_id, &version).await;
                UpdateOutcome::Completed { version }
            }
            Err(e) => {
                self.fail(&reporter, history_id, &version, format!("{:#}", e))
                    .await
            }
        }
    }

    async fn complete(&self, reporter: &ProgressReporter, history_id: Option<i64>, version: &str) {
        let message = format!("Updated to {}", version);
        info!("{}", message);

        self.status
            .set(reporter.latest().succeeded(message.clone()))
            .await;
        self.finish_history(history_id, version, HistoryStatus::Success, None)
            .await;
        self.hub
            .publish_global(&HubEvent::UpdateComplete { message })
            .await;
    }

    async fn fail(
        &self,
        reporter: &ProgressReporter,
        history_id: Option<i64>,
        version: &str,
        raw: String,
    ) -> UpdateOutcome {
        let kind = FailureKind::classify(&raw);
        let friendly = kind.user_message();
        error!("Update failed ({:?}): {}", kind, raw);

        self.status
            .set(reporter.latest().failed(friendly, raw.clone()))
            .await;
        self.finish_history(history_id, version, HistoryStatus::Failed, Some(&raw))
            .await;
        self.hub
            .publish_global(&HubEvent::UpdateFailed {
                error: friendly.to_string(),
                details: raw.clone(),
            })
            .await;

        UpdateOutcome::Failed { kind, details: raw }
    }

    async fn finish_history(
        &self,
        id: Option<i64>,
        version: &str,
        status: HistoryStatus,
        error: Option<&str>,
    ) {
        let Some(id) = id else { return };
        if let Err(e) = self
            .history
            .finish_attempt(id, version, status, error, Utc::now())
            .await
        {
            warn!("Failed to finalize update history {}: {:#}", id, e);
        }
    }

    /// Point of no return: flush, checkpoint, shut down, exit.
    async fn exit_into(&self, version: &str) {
        info!(
            "Restarting into {} in {:?}",
            version,
            self.timings.flush_grace + self.timings.durability_grace
        );
        tokio::time::sleep(self.timings.flush_grace).await;

        if let Err(e) = self.lifecycle.checkpoint().await {
            warn!("Database checkpoint before restart failed: {:#}", e);
        }
        tokio::time::sleep(self.timings.durability_grace).await;

        self.lifecycle.shutdown().await;
        self.lifecycle.exit(0);
    }

    /// Restart into a binary that is already installed on disk. Only allowed
    /// while the status snapshot says a restart is required.
    pub async fn restart_for_update(self: &Arc<Self>) -> Result<JoinHandle<()>, UpdateError> {
        if !self.status.get().await.restart_required {
            return Err(UpdateError::RestartNotRequired);
        }
        let guard = Arc::clone(&self.update_lock)
            .try_lock_owned()
            .map_err(|_| UpdateError::AlreadyRunning)?;

        // A run may have finished between the first read and the lock
        let current = self.status.get().await;
        if !current.restart_required {
            return Err(UpdateError::RestartNotRequired);
        }

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let version = if current.available_version.is_empty() {
                this.current_version.clone()
            } else {
                current.available_version.clone()
            };

            info!("Restarting to pick up version {}", version);
            this.hub
                .publish_global(&HubEvent::UpdateRestarting { version })
                .await;
            this.status.set(current.restarting()).await;

            tokio::time::sleep(this.timings.restart_delay).await;
            this.lifecycle.shutdown().await;
            this.lifecycle.exit(0);
        }))
    }
}
