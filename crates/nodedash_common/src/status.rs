//! UpdateStatus - the single authoritative snapshot of the current
//! long-running operation.
//!
//! A snapshot is always exactly one of: idle, in progress, succeeded, failed.
//! Writers build a whole new value through the constructors below and hand it
//! to the status store; fields are never patched in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where in the update sequence the daemon currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStage {
    #[default]
    Idle,
    Checking,
    Downloading,
    Verifying,
    Applying,
    Complete,
    Failed,
    Restarting,
}

impl UpdateStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStage::Idle => "idle",
            UpdateStage::Checking => "checking",
            UpdateStage::Downloading => "downloading",
            UpdateStage::Verifying => "verifying",
            UpdateStage::Applying => "applying",
            UpdateStage::Complete => "complete",
            UpdateStage::Failed => "failed",
            UpdateStage::Restarting => "restarting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(UpdateStage::Idle),
            "checking" => Some(UpdateStage::Checking),
            "downloading" => Some(UpdateStage::Downloading),
            "verifying" => Some(UpdateStage::Verifying),
            "applying" => Some(UpdateStage::Applying),
            "complete" => Some(UpdateStage::Complete),
            "failed" => Some(UpdateStage::Failed),
            "restarting" => Some(UpdateStage::Restarting),
            _ => None,
        }
    }

    /// Terminal stages end a run; nothing is reported after them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateStage::Complete | UpdateStage::Failed)
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot as served to status-polling clients.
///
/// Field names are part of the wire contract. `error` and `message` are
/// omitted when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub in_progress: bool,
    pub success: bool,
    pub failed: bool,
    /// User-facing error text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Technical detail, never shown verbatim to end users
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub stage: UpdateStage,
    pub percentage: f64,
    pub started_at: DateTime<Utc>,
    /// Stamped by the status store on every write
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub available_version: String,
    pub restart_required: bool,
}

impl UpdateStatus {
    /// Idle snapshot carrying version information only
    pub fn idle(current_version: impl Into<String>, available_version: impl Into<String>) -> Self {
        Self {
            current_version: current_version.into(),
            available_version: available_version.into(),
            ..Self::default()
        }
    }

    pub fn in_progress(
        &self,
        stage: UpdateStage,
        percentage: f64,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            in_progress: true,
            success: false,
            failed: false,
            error: String::new(),
            message: message.into(),
            stage,
            percentage: clamp_percentage(percentage),
            started_at,
            updated_at: self.updated_at,
            current_version: self.current_version.clone(),
            available_version: self.available_version.clone(),
            restart_required: false,
        }
    }

    pub fn succeeded(&self, message: impl Into<String>) -> Self {
        Self {
            in_progress: false,
            success: true,
            failed: false,
            error: String::new(),
            message: message.into(),
            stage: UpdateStage::Complete,
            percentage: 100.0,
            ..self.clone()
        }
    }

    pub fn failed(&self, error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            in_progress: false,
            success: false,
            failed: true,
            error: error.into(),
            message: details.into(),
            stage: UpdateStage::Failed,
            ..self.clone()
        }
    }

    pub fn restarting(&self) -> Self {
        Self {
            in_progress: true,
            success: false,
            failed: false,
            error: String::new(),
            message: "Restarting to finish the update".to_string(),
            stage: UpdateStage::Restarting,
            ..self.clone()
        }
    }

    pub fn with_restart_required(mut self, required: bool) -> Self {
        self.restart_required = required;
        self
    }

    pub fn is_idle(&self) -> bool {
        !self.in_progress && !self.success && !self.failed
    }

    /// At most one of in-progress, success, failed may be set.
    pub fn is_consistent(&self) -> bool {
        [self.in_progress, self.success, self.failed]
            .iter()
            .filter(|flag| **flag)
            .count()
            <= 1
    }
}

pub fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle_and_consistent() {
        let status = UpdateStatus::default();
        assert!(status.is_idle());
        assert!(status.is_consistent());
        assert_eq!(status.stage, UpdateStage::Idle);
    }

    #[test]
    fn test_empty_error_and_message_are_omitted() {
        let json = serde_json::to_value(UpdateStatus::idle("1.0.0", "")).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("error"));
        assert!(!obj.contains_key("message"));
        assert!(obj.contains_key("restart_required"));
        assert_eq!(obj["stage"], "idle");
    }

    #[test]
    fn test_failed_keeps_both_texts() {
        let base = UpdateStatus::idle("1.0.0", "1.1.0");
        let running = base.in_progress(UpdateStage::Verifying, 60.0, "verifying", Utc::now());
        let failed = running.failed("friendly", "raw detail");
        assert!(failed.failed && !failed.in_progress && !failed.success);
        assert_eq!(failed.error, "friendly");
        assert_eq!(failed.message, "raw detail");
        assert_eq!(failed.percentage, 60.0);
        assert!(failed.is_consistent());
    }

    #[test]
    fn test_stage_parse_round_trip() {
        assert_eq!(UpdateStage::parse("Downloading"), Some(UpdateStage::Downloading));
        assert_eq!(UpdateStage::parse("bogus"), None);
        assert!(UpdateStage::Failed.is_terminal());
        assert!(!UpdateStage::Applying.is_terminal());
    }

    #[test]
    fn test_percentage_is_clamped() {
        assert_eq!(clamp_percentage(140.0), 100.0);
        assert_eq!(clamp_percentage(-3.0), 0.0);
        assert_eq!(clamp_percentage(f64::NAN), 0.0);
    }
}
