use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    error::{classify_http_status, FailureKind, SendFailure},
    protocol::{ServerAck, ServerErrorBody, SubmitEvent},
};
use url::Url;

/// Submits one event to the homeserver.
///
/// Callers never have two submissions of the same event id outstanding, and
/// a retry reuses the id so the server can deduplicate it.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn submit(&self, request: &SubmitEvent) -> Result<ServerAck, SendFailure>;
}

pub struct MissingTransportClient;

#[async_trait]
impl TransportClient for MissingTransportClient {
    async fn submit(&self, request: &SubmitEvent) -> Result<ServerAck, SendFailure> {
        Err(SendFailure::transient(format!(
            "no transport configured for room {}",
            request.room_id
        )))
    }
}

/// `PUT /_matrix/client/v3/rooms/{roomId}/send/{eventType}/{txnId}`.
pub struct HttpTransportClient {
    http: Client,
    homeserver: Url,
    access_token: String,
}

impl HttpTransportClient {
    pub fn new(
        homeserver_url: &str,
        access_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let homeserver = Url::parse(homeserver_url)
            .with_context(|| format!("invalid homeserver url '{homeserver_url}'"))?;
        if homeserver.cannot_be_a_base() {
            bail!("homeserver url '{homeserver_url}' cannot carry a path");
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            homeserver,
            access_token: access_token.into(),
        })
    }

    pub fn send_url(&self, request: &SubmitEvent) -> Url {
        let mut url = self.homeserver.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "_matrix",
                "client",
                "v3",
                "rooms",
                request.room_id.as_str(),
                "send",
                request.event_type.as_str(),
                request.event_id.as_str(),
            ]);
        }
        url
    }
}

#[async_trait]
impl TransportClient for HttpTransportClient {
    async fn submit(&self, request: &SubmitEvent) -> Result<ServerAck, SendFailure> {
        let response = self
            .http
            .put(self.send_url(request))
            .bearer_auth(&self.access_token)
            .json(&request.content)
            .send()
            .await
            .map_err(|err| SendFailure::transient(format!("request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<ServerAck>()
                .await
                .map_err(|err| SendFailure::transient(format!("unreadable send response: {err}")));
        }

        let (errcode, message, retry_after_ms) = match response.json::<ServerErrorBody>().await {
            Ok(body) => (body.errcode, body.error, body.retry_after_ms),
            Err(_) => (format!("HTTP_{}", status.as_u16()), status.to_string(), None),
        };

        Err(match classify_http_status(status.as_u16()) {
            FailureKind::ServerRejected => SendFailure::ServerRejected { errcode, message },
            // Status codes never classify as UnknownDevices; that kind only
            // comes from the encryptor.
            FailureKind::NetworkTransient | FailureKind::UnknownDevices => {
                SendFailure::NetworkTransient {
                    message: format!("{errcode}: {message}"),
                    retry_after_ms,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
