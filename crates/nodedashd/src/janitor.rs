//! Stale-operation janitor.
//!
//! Operations left pending or in progress by a crash or a dropped client
//! never finish on their own. On every tick the janitor marks the ones older
//! than the staleness threshold as failed. Sweeps are idempotent: a record it
//! has reclaimed is terminal and no longer selected.

use crate::hub::EventHub;
use crate::store::OperationStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use nodedash_common::config::JanitorConfig;
use nodedash_common::operation::stale_cutoff;
use nodedash_common::{HubEvent, OperationStatus, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const ABANDONED_MESSAGE: &str = "Operation abandoned: no progress before the staleness deadline";

pub struct Janitor {
    store: Arc<dyn OperationStore>,
    hub: Option<Arc<EventHub>>,
    interval: Duration,
    threshold: chrono::Duration,
}

impl Janitor {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self::from_config(store, &JanitorConfig::default())
    }

    pub fn from_config(store: Arc<dyn OperationStore>, config: &JanitorConfig) -> Self {
        Self {
            store,
            hub: None,
            interval: config.interval(),
            threshold: config.stale_after(),
        }
    }

    /// Announce reclaimed records on their own topic
    pub fn with_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> chrono::Duration {
        self.threshold
    }

    /// One pass; returns how many records were reclaimed
    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = stale_cutoff(now, self.threshold);
        let stale = self
            .store
            .operations_older_than(&OperationStatus::RECLAIMABLE, cutoff)
            .await?;

        let mut reclaimed = 0;
        for record in stale {
            if let Err(e) = self
                .store
                .update_operation_status(&record.id, OperationStatus::Failed, ABANDONED_MESSAGE)
                .await
            {
                warn!("Failed to reclaim operation {}: {:#}", record.id, e);
                continue;
            }
            reclaimed += 1;
            debug!(
                "Reclaimed {} operation {} (was {}, created {})",
                record.kind, record.id, record.status, record.created_at
            );

            if let Some(hub) = &self.hub {
                hub.publish(
                    &Topic::named(record.id.as_str()),
                    &HubEvent::OperationStatus {
                        operation_id: record.id.clone(),
                        status: OperationStatus::Failed,
                        message: ABANDONED_MESSAGE.to_string(),
                    },
                )
                .await;
            }
        }

        if reclaimed > 0 {
            info!("Janitor reclaimed {} stale operation(s)", reclaimed);
        }
        Ok(reclaimed)
    }

    /// Sweep now and then on every interval until stopped
    pub fn start(self) -> JanitorHandle {
        let stop = Arc::new(Notify::new());
        let stopped = Arc::clone(&stop);
        info!(
            "Janitor started: every {:?}, threshold {}s",
            self.interval,
            self.threshold.num_seconds()
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.notified() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!("Janitor sweep failed: {:#}", e);
                        }
                    }
                }
            }
            debug!("Janitor stopped");
        });

        JanitorHandle { stop, task }
    }
}

pub struct JanitorHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Waits for an in-flight sweep to finish
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            warn!("Janitor task ended abnormally: {}", e);
        }
    }
}
