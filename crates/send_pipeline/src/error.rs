use shared::domain::SendState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    /// The room has devices whose trust the user has not decided on.
    #[error("room contains unverified devices: {}", .devices.join(", "))]
    UnknownDevices { devices: Vec<String> },
    #[error("encryption is unavailable: {0}")]
    Unavailable(String),
    #[error("encryption failed: {0}")]
    Failed(String),
}

impl EncryptionError {
    pub fn is_unknown_devices(&self) -> bool {
        matches!(self, EncryptionError::UnknownDevices { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition from {from} on {input}")]
pub struct InvalidTransition {
    pub from: SendState,
    pub input: String,
}
