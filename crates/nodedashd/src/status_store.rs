//! Status store - the single update status snapshot shared by the daemon.
//!
//! Readers get owned copies; writers replace the whole value. Concurrent
//! writers are last-write-wins.

use chrono::Utc;
use nodedash_common::UpdateStatus;
use tokio::sync::RwLock;

pub struct StatusStore {
    inner: RwLock<UpdateStatus>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(UpdateStatus::default()),
        }
    }

    pub async fn get(&self) -> UpdateStatus {
        self.inner.read().await.clone()
    }

    /// Replace the snapshot. `updated_at` is always stamped here; whatever
    /// the caller put there is ignored. Returns the stored value.
    pub async fn set(&self, mut status: UpdateStatus) -> UpdateStatus {
        let mut inner = self.inner.write().await;
        status.updated_at = Utc::now();
        *inner = status.clone();
        status
    }

    pub async fn reset(&self) -> UpdateStatus {
        self.set(UpdateStatus::default()).await
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
