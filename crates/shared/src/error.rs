use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry class of a failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NetworkTransient,
    ServerRejected,
    UnknownDevices,
}

/// Classified failure of a single event submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendFailure {
    #[error("transient network failure: {message}")]
    NetworkTransient {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    #[error("server rejected event ({errcode}): {message}")]
    ServerRejected { errcode: String, message: String },
    #[error("room contains unverified devices: {}", .devices.join(", "))]
    UnknownDevices { devices: Vec<String> },
}

impl SendFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::NetworkTransient {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn rejected(errcode: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServerRejected {
            errcode: errcode.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SendFailure::NetworkTransient { .. } => FailureKind::NetworkTransient,
            SendFailure::ServerRejected { .. } => FailureKind::ServerRejected,
            SendFailure::UnknownDevices { .. } => FailureKind::UnknownDevices,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SendFailure::NetworkTransient { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Map a non-success HTTP status to a retry class.
///
/// Never yields [`FailureKind::UnknownDevices`]: unverified devices are found
/// while encrypting, before anything reaches the server.
pub fn classify_http_status(status: u16) -> FailureKind {
    match status {
        408 | 429 => FailureKind::NetworkTransient,
        400..=499 => FailureKind::ServerRejected,
        _ => FailureKind::NetworkTransient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_codes() {
        assert_eq!(classify_http_status(429), FailureKind::NetworkTransient);
        assert_eq!(classify_http_status(408), FailureKind::NetworkTransient);
        assert_eq!(classify_http_status(403), FailureKind::ServerRejected);
        assert_eq!(classify_http_status(400), FailureKind::ServerRejected);
        assert_eq!(classify_http_status(502), FailureKind::NetworkTransient);
    }

    #[test]
    fn no_status_code_reports_unknown_devices() {
        for status in 100..600 {
            assert_ne!(
                classify_http_status(status),
                FailureKind::UnknownDevices,
                "status {status}"
            );
        }
    }

    #[test]
    fn only_transient_failures_carry_retry_hints() {
        let transient = SendFailure::NetworkTransient {
            message: "slow down".into(),
            retry_after_ms: Some(2_000),
        };
        assert_eq!(transient.retry_after_ms(), Some(2_000));
        assert_eq!(transient.kind(), FailureKind::NetworkTransient);

        let rejected = SendFailure::rejected("M_FORBIDDEN", "not allowed");
        assert_eq!(rejected.retry_after_ms(), None);
        assert_eq!(rejected.kind(), FailureKind::ServerRejected);
    }

    #[test]
    fn unknown_devices_message_lists_devices() {
        let failure = SendFailure::UnknownDevices {
            devices: vec!["@bob:example.org/PHONE".into(), "@bob:example.org/LAPTOP".into()],
        };
        assert_eq!(
            failure.to_string(),
            "room contains unverified devices: @bob:example.org/PHONE, @bob:example.org/LAPTOP"
        );
    }
}
