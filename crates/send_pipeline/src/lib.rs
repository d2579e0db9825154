use std::sync::Arc;

use anyhow::{Context, Result};
use storage::EventStore;
use tracing::{info, warn};

pub mod config;
pub mod encryption;
pub mod error;
pub mod retry;
pub mod room_queue;
pub mod scheduler;
pub mod send_unit;
pub mod state_machine;
pub mod transport;

pub use config::{load_settings, SendPipelineSettings};
pub use encryption::{EncryptedContent, EventEncryptor, MissingEventEncryptor};
pub use error::{EncryptionError, InvalidTransition};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerOptions, SendScheduler};
pub use state_machine::{SendInput, SendStateMachine, Transition};
pub use transport::{HttpTransportClient, MissingTransportClient, TransportClient};

/// Open the store, wire the transport from `settings`, and re-queue whatever
/// a previous run left undelivered.
///
/// Without a homeserver the pipeline still records echoes; every submission
/// then fails transiently until the retry bound marks it `UNDELIVERED`.
pub async fn start_pipeline(settings: &SendPipelineSettings) -> Result<Arc<SendScheduler>> {
    let database_url = config::normalize_database_url(&settings.database_url);
    let store = EventStore::new(&database_url)
        .await
        .with_context(|| format!("failed to open event store at {database_url}"))?;

    let transport: Arc<dyn TransportClient> = match settings.homeserver_url.as_deref() {
        Some(homeserver_url) => Arc::new(HttpTransportClient::new(
            homeserver_url,
            settings.access_token.clone().unwrap_or_default(),
            settings.request_timeout(),
        )?),
        None => {
            warn!("send: no homeserver_url configured; submissions will fail");
            Arc::new(MissingTransportClient)
        }
    };

    start_with(store, transport, Arc::new(MissingEventEncryptor), settings).await
}

/// Same as [`start_pipeline`] with caller-supplied collaborators.
pub async fn start_with(
    store: EventStore,
    transport: Arc<dyn TransportClient>,
    encryptor: Arc<dyn EventEncryptor>,
    settings: &SendPipelineSettings,
) -> Result<Arc<SendScheduler>> {
    let options = settings.scheduler_options();
    let scheduler = SendScheduler::new(store, transport, encryptor, options);
    let resumed = scheduler.resume_pending().await?;
    info!(
        workers = options.worker_count,
        max_attempts = options.max_attempts,
        retry_base_delay_ms = options.retry_policy.base_delay_ms(),
        resumed,
        "send: pipeline started"
    );
    Ok(scheduler)
}
