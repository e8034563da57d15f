//! Process lifecycle: graceful shutdown and the exit that hands control back
//! to the service supervisor.

use crate::janitor::JanitorHandle;
use crate::store::Database;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Steps the update orchestrator takes to leave the process
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Flush write-ahead state to the main database file
    async fn checkpoint(&self) -> Result<()>;

    /// Stop background work and close the database
    async fn shutdown(&self);

    /// Terminate the process. The supervisor restarts it.
    fn exit(&self, code: i32);
}

/// Fires once; every `ShutdownSignal` taken from it resolves afterwards.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self, reason: &str) {
        let fired = self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
        if fired {
            info!("Initiating shutdown: {}", reason);
        } else {
            debug!("Shutdown already in progress, ignoring: {}", reason);
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub async fn recv(mut self) {
        self.wait().await;
    }

    /// Resolves immediately once shutdown has been triggered
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Production lifecycle for the daemon process
pub struct DaemonLifecycle {
    db: Arc<Database>,
    janitor: Mutex<Option<JanitorHandle>>,
    shutdown: ShutdownController,
}

impl DaemonLifecycle {
    pub fn new(db: Arc<Database>, shutdown: ShutdownController) -> Self {
        Self {
            db,
            janitor: Mutex::new(None),
            shutdown,
        }
    }

    pub async fn attach_janitor(&self, handle: JanitorHandle) {
        *self.janitor.lock().await = Some(handle);
    }
}

#[async_trait]
impl Lifecycle for DaemonLifecycle {
    async fn checkpoint(&self) -> Result<()> {
        self.db.checkpoint().await
    }

    async fn shutdown(&self) {
        if let Some(janitor) = self.janitor.lock().await.take() {
            janitor.stop().await;
        }
        if let Err(e) = self.db.close().await {
            warn!("Failed to close database: {:#}", e);
        }
        self.shutdown.trigger("daemon shutdown");
    }

    fn exit(&self, code: i32) {
        info!("Exiting with code {} for supervisor restart", code);
        std::process::exit(code);
    }
}

/// Records calls instead of acting on them
#[derive(Debug, Default)]
pub struct RecordingLifecycle {
    calls: std::sync::Mutex<Vec<String>>,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, call: String) {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }
}

#[async_trait]
impl Lifecycle for RecordingLifecycle {
    async fn checkpoint(&self) -> Result<()> {
        self.record("checkpoint".to_string());
        Ok(())
    }

    async fn shutdown(&self) {
        self.record("shutdown".to_string());
    }

    fn exit(&self, code: i32) {
        self.record(format!("exit:{}", code));
    }
}
