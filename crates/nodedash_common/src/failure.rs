//! Classification of raw update failures into user-facing messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Network,
    Integrity,
    Permission,
    Unknown,
}

const INTEGRITY_MARKERS: &[&str] = &["checksum", "integrity", "signature", "hash mismatch", "digest"];
const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "access denied",
    "operation not permitted",
    "read-only file system",
];
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "http 404",
    "status 404",
    "no update",
    "unavailable",
];
const NETWORK_MARKERS: &[&str] = &[
    "network",
    "download",
    "connection",
    "timed out",
    "timeout",
    "dns",
    "unreachable",
];

impl FailureKind {
    /// Integrity and permission markers are checked before the broader
    /// not-found and network ones ("download checksum mismatch" is an
    /// integrity failure).
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

        if has(INTEGRITY_MARKERS) {
            FailureKind::Integrity
        } else if has(PERMISSION_MARKERS) {
            FailureKind::Permission
        } else if has(NOT_FOUND_MARKERS) {
            FailureKind::NotFound
        } else if has(NETWORK_MARKERS) {
            FailureKind::Network
        } else {
            FailureKind::Unknown
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::NotFound => {
                "The requested update could not be found. It may not be published for this platform yet."
            }
            FailureKind::Network => {
                "The update could not be downloaded. Check the network connection and try again."
            }
            FailureKind::Integrity => {
                "The downloaded update failed integrity verification and was discarded. Please try again."
            }
            FailureKind::Permission => {
                "Permission denied while installing the update. Check that the service can write to its install directory."
            }
            FailureKind::Unknown => "The update failed. Please try again later.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_integrity() {
        assert_eq!(
            FailureKind::classify("sha256 checksum mismatch for nodedash-1.2.0.tar.gz"),
            FailureKind::Integrity
        );
        assert_eq!(
            FailureKind::classify("download failed: checksum mismatch"),
            FailureKind::Integrity
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(FailureKind::classify("release v9.9.9 not found"), FailureKind::NotFound);
        assert_eq!(FailureKind::classify("HTTP 404"), FailureKind::NotFound);
        assert_eq!(
            FailureKind::classify("connection reset by peer"),
            FailureKind::Network
        );
        assert_eq!(
            FailureKind::classify("open /usr/local/bin/nodedashd: Permission denied (os error 13)"),
            FailureKind::Permission
        );
        assert_eq!(FailureKind::classify("exit status 3"), FailureKind::Unknown);
    }

    #[test]
    fn test_bare_digits_are_not_a_status_code() {
        assert_eq!(
            FailureKind::classify("download timed out after 4040ms"),
            FailureKind::Network
        );
        assert_eq!(
            FailureKind::classify("GET /releases/latest: status 404"),
            FailureKind::NotFound
        );
    }

    #[test]
    fn test_unknown_falls_back_to_generic() {
        assert_eq!(
            FailureKind::classify("something odd").user_message(),
            "The update failed. Please try again later."
        );
    }
}
