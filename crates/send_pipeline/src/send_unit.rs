use std::{sync::Arc, time::Duration};

use anyhow::Result;
use shared::{
    domain::{EventId, LocalEcho, RoomId, SendState},
    protocol::SubmitEvent,
};
use storage::{EventStore, StateUpdate};
use tracing::{info, warn};

use crate::{
    encryption::EventEncryptor,
    retry::RetryPolicy,
    state_machine::{SendInput, SendStateMachine},
    transport::TransportClient,
};

/// Collaborators a unit needs to run.
#[derive(Clone)]
pub struct SendContext {
    pub store: EventStore,
    pub transport: Arc<dyn TransportClient>,
    pub encryptor: Arc<dyn EventEncryptor>,
    pub machine: SendStateMachine,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The echo reached a terminal state.
    Finished(SendState),
    /// Transient failure with attempts left; run again after `delay`.
    Retry { delay: Duration, attempt: u32 },
    /// The echo is gone or was not dispatchable.
    Dropped,
}

/// One schedulable send of one local echo.
#[derive(Debug, Clone)]
pub struct SendUnit {
    echo: LocalEcho,
}

impl SendUnit {
    pub fn new(echo: LocalEcho) -> Self {
        Self { echo }
    }

    pub fn event_id(&self) -> &EventId {
        self.echo.event_id()
    }

    pub fn room_id(&self) -> &RoomId {
        self.echo.room_id()
    }

    pub fn position(&self) -> i64 {
        self.echo.position
    }

    /// Run the pipeline once: encrypt if the room needs it, submit, and
    /// record the outcome in the store.
    ///
    /// Delivery failures never surface as errors; they become send states.
    /// `Err` means the store itself failed.
    pub async fn run(&self, ctx: &SendContext) -> Result<UnitOutcome> {
        let event_id = self.event_id();
        let room_id = self.room_id();

        let Some(current) = ctx.store.local_echo(event_id).await? else {
            info!(%room_id, %event_id, "send: echo removed before dispatch; dropping");
            return Ok(UnitOutcome::Dropped);
        };
        if current.send_state != SendState::Unsent {
            warn!(
                %room_id,
                %event_id,
                state = %current.send_state,
                "send: echo is not dispatchable; dropping"
            );
            return Ok(UnitOutcome::Dropped);
        }

        let requires_encryption = ctx.store.room_requires_encryption(room_id).await?;
        let dispatch = ctx.machine.apply(
            SendState::Unsent,
            SendInput::Dispatch {
                requires_encryption,
            },
        )?;

        let mut request = SubmitEvent::from_echo(&current);
        if dispatch.next == SendState::Encrypting {
            if !self.persist(ctx, SendState::Encrypting).await? {
                return Ok(UnitOutcome::Dropped);
            }
            match ctx.encryptor.encrypt(&request).await {
                Ok(encrypted) => {
                    ctx.machine
                        .apply(SendState::Encrypting, SendInput::Encrypted)?;
                    request.event_type = encrypted.event_type;
                    request.content = encrypted.content;
                }
                Err(err) => {
                    let failed = ctx.machine.apply(
                        SendState::Encrypting,
                        SendInput::EncryptionFailed {
                            unknown_devices: err.is_unknown_devices(),
                        },
                    )?;
                    warn!(
                        %room_id,
                        %event_id,
                        state = %failed.next,
                        "send: encryption failed: {err}"
                    );
                    ctx.store.record_failure(event_id, &err.to_string()).await?;
                    if !self.persist(ctx, failed.next).await? {
                        return Ok(UnitOutcome::Dropped);
                    }
                    return Ok(UnitOutcome::Finished(failed.next));
                }
            }
        }

        let Some(attempt) = ctx.store.begin_attempt(event_id).await? else {
            info!(%room_id, %event_id, "send: echo removed before submission; dropping");
            return Ok(UnitOutcome::Dropped);
        };
        info!(%room_id, %event_id, attempt, "send: submitting event");

        match ctx.transport.submit(&request).await {
            Ok(ack) => {
                ctx.machine
                    .apply(SendState::Sending, SendInput::Acknowledged)?;
                // Writes SENT and promotes in one transaction.
                if !ctx.store.promote_to_confirmed(event_id, &ack.event_id).await? {
                    info!(
                        %room_id,
                        %event_id,
                        server_event_id = %ack.event_id,
                        "send: echo removed mid-flight; acknowledgment not recorded"
                    );
                    return Ok(UnitOutcome::Dropped);
                }
                info!(
                    %room_id,
                    %event_id,
                    server_event_id = %ack.event_id,
                    attempt,
                    "send: event delivered"
                );
                Ok(UnitOutcome::Finished(SendState::Sent))
            }
            Err(failure) => {
                let transition = ctx.machine.apply(
                    SendState::Sending,
                    SendInput::Failed {
                        kind: failure.kind(),
                        attempts: attempt,
                    },
                )?;
                ctx.store
                    .record_failure(event_id, &failure.to_string())
                    .await?;
                if !self.persist(ctx, transition.next).await? {
                    return Ok(UnitOutcome::Dropped);
                }

                if transition.retry {
                    let delay = ctx
                        .retry_policy
                        .delay_for_retry(attempt.saturating_sub(1), failure.retry_after_ms());
                    warn!(
                        %room_id,
                        %event_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "send: transient failure, will retry: {failure}"
                    );
                    return Ok(UnitOutcome::Retry { delay, attempt });
                }

                warn!(
                    %room_id,
                    %event_id,
                    attempt,
                    state = %transition.next,
                    "send: delivery failed: {failure}"
                );
                Ok(UnitOutcome::Finished(transition.next))
            }
        }
    }

    /// Write `next`; `false` when the echo disappeared under us.
    async fn persist(&self, ctx: &SendContext, next: SendState) -> Result<bool> {
        match ctx.store.update_send_state(self.event_id(), next).await? {
            StateUpdate::Applied { .. } => Ok(true),
            StateUpdate::Missing => {
                info!(
                    room_id = %self.room_id(),
                    event_id = %self.event_id(),
                    state = %next,
                    "send: echo removed mid-flight; outcome not recorded"
                );
                Ok(false)
            }
            StateUpdate::Rejected { current } => {
                warn!(
                    room_id = %self.room_id(),
                    event_id = %self.event_id(),
                    %current,
                    %next,
                    "send: state write rejected"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/send_unit_tests.rs"]
mod tests;
