//! Live events pushed to connected observers.
//!
//! Every event kind is a variant with a fixed field set; the wire `type` tag is
//! the variant name in kebab-case.

use crate::operation::OperationStatus;
use crate::status::UpdateStage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope that subscribers attach to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Reserved scope for system-wide notices
    Global,
    /// Application or operation identifier
    Named(String),
}

impl Topic {
    pub fn named(name: impl Into<String>) -> Self {
        Topic::Named(name.into())
    }

    /// Empty strings and the literal "global" map to the global scope.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("global") => Topic::Global,
            Some(name) => Topic::Named(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Topic::Global => "global",
            Topic::Named(name) => name,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HubEvent {
    UpdateProgress {
        stage: UpdateStage,
        percentage: f64,
        message: String,
    },
    UpdateComplete {
        message: String,
    },
    UpdateFailed {
        /// Classified, user-facing
        error: String,
        /// Raw collaborator output
        details: String,
    },
    UpdateRestarting {
        version: String,
    },
    OperationStatus {
        operation_id: String,
        status: OperationStatus,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        message: String,
    },
    OperationOutput {
        operation_id: String,
        line: String,
    },
    Heartbeat,
}

impl HubEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::UpdateProgress { .. } => "update-progress",
            HubEvent::UpdateComplete { .. } => "update-complete",
            HubEvent::UpdateFailed { .. } => "update-failed",
            HubEvent::UpdateRestarting { .. } => "update-restarting",
            HubEvent::OperationStatus { .. } => "operation-status",
            HubEvent::OperationOutput { .. } => "operation-output",
            HubEvent::Heartbeat => "heartbeat",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"{}","_ser":"error"}}"#, self.kind())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_matches_kind() {
        let events = vec![
            HubEvent::UpdateProgress {
                stage: UpdateStage::Downloading,
                percentage: 25.0,
                message: "fetching".to_string(),
            },
            HubEvent::UpdateComplete {
                message: "done".to_string(),
            },
            HubEvent::UpdateFailed {
                error: "friendly".to_string(),
                details: "raw".to_string(),
            },
            HubEvent::UpdateRestarting {
                version: "1.2.0".to_string(),
            },
            HubEvent::Heartbeat,
        ];
        for event in events {
            let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn test_progress_payload_fields() {
        let event = HubEvent::UpdateProgress {
            stage: UpdateStage::Verifying,
            percentage: 60.0,
            message: "checking digest".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["stage"], "verifying");
        assert_eq!(value["percentage"], 60.0);
        assert_eq!(value["message"], "checking digest");
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!(Topic::parse(None), Topic::Global);
        assert_eq!(Topic::parse(Some("  ")), Topic::Global);
        assert_eq!(Topic::parse(Some("global")), Topic::Global);
        assert_eq!(Topic::parse(Some("app-7")), Topic::named("app-7"));
    }
}
