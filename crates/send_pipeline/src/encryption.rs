use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::protocol::SubmitEvent;

use crate::error::EncryptionError;

/// Event body as it goes over the wire for an encrypted room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedContent {
    pub event_type: String,
    pub content: serde_json::Value,
}

/// Turns a cleartext event into its encrypted form for one room.
#[async_trait]
pub trait EventEncryptor: Send + Sync {
    async fn encrypt(&self, request: &SubmitEvent) -> Result<EncryptedContent, EncryptionError>;
}

pub struct MissingEventEncryptor;

#[async_trait]
impl EventEncryptor for MissingEventEncryptor {
    async fn encrypt(&self, request: &SubmitEvent) -> Result<EncryptedContent, EncryptionError> {
        Err(EncryptionError::Unavailable(format!(
            "no encryption backend for room {}",
            request.room_id
        )))
    }
}
