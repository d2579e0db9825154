use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt};
use shared::domain::{EventId, LocalEcho, RoomId, UserId};
use storage::{EventStore, StateUpdate};
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{error, info, warn};

use crate::{
    encryption::EventEncryptor,
    retry::RetryPolicy,
    room_queue::RoomSendQueue,
    send_unit::{SendContext, SendUnit, UnitOutcome},
    state_machine::SendStateMachine,
    transport::TransportClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Units running at once across all rooms.
    pub worker_count: usize,
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_attempts: 5,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Process-wide entry point of the send pipeline.
///
/// Routes echoes to per-room queues and runs released units on a bounded
/// worker pool. Rooms progress independently; within a room units run one
/// at a time in creation order. The store's local echoes are the durable
/// work log, so [`SendScheduler::resume_pending`] rebuilds the queues after
/// a restart.
pub struct SendScheduler {
    ctx: SendContext,
    workers: Arc<Semaphore>,
    queues: Mutex<HashMap<RoomId, RoomSendQueue>>,
    idle: Notify,
    fatal: Mutex<Option<anyhow::Error>>,
}

impl SendScheduler {
    pub fn new(
        store: EventStore,
        transport: Arc<dyn TransportClient>,
        encryptor: Arc<dyn EventEncryptor>,
        options: SchedulerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: SendContext {
                store,
                transport,
                encryptor,
                machine: SendStateMachine::new(options.max_attempts),
                retry_policy: options.retry_policy,
            },
            workers: Arc::new(Semaphore::new(options.worker_count.max(1))),
            queues: Mutex::new(HashMap::new()),
            idle: Notify::new(),
            fatal: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &EventStore {
        &self.ctx.store
    }

    /// Create a local echo and queue it for delivery.
    pub async fn send_event(
        self: &Arc<Self>,
        room_id: &RoomId,
        sender: &UserId,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<LocalEcho> {
        let echo = self
            .ctx
            .store
            .create_local_echo(room_id, sender, event_type, content)
            .await
            .with_context(|| format!("failed to create local echo in room {room_id}"))?;
        info!(
            %room_id,
            event_id = %echo.event_id(),
            event_type,
            "send: local echo created"
        );
        self.enqueue(echo.clone()).await;
        Ok(echo)
    }

    /// Route an echo to its room queue. Returns `false` if it is already
    /// waiting there.
    pub async fn enqueue(self: &Arc<Self>, echo: LocalEcho) -> bool {
        let room_id = echo.room_id().clone();
        let added = {
            let mut queues = self.queues.lock().await;
            queues
                .entry(room_id.clone())
                .or_insert_with(|| RoomSendQueue::new(room_id.clone()))
                .push(SendUnit::new(echo))
        };
        if added {
            self.pump(&room_id).await;
        }
        added
    }

    /// Re-queue every echo a previous process left undelivered.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize> {
        let pending = self
            .ctx
            .store
            .pending_echoes_at_startup()
            .await
            .context("failed to load pending local echoes")?;
        let total = pending.len();
        for echo in pending {
            self.enqueue(echo).await;
        }
        info!(pending = total, "send: resumed interrupted deliveries");
        Ok(total)
    }

    /// User-initiated resend of an `UNDELIVERED` or
    /// `FAILED_UNKNOWN_DEVICES` echo.
    pub async fn retry(self: &Arc<Self>, event_id: &EventId) -> Result<bool> {
        match self.ctx.store.reset_for_retry(event_id).await? {
            StateUpdate::Applied { previous } => {
                let Some(echo) = self.ctx.store.local_echo(event_id).await? else {
                    return Ok(false);
                };
                info!(
                    room_id = %echo.room_id(),
                    %event_id,
                    %previous,
                    "send: manual resend requested"
                );
                Ok(self.enqueue(echo).await)
            }
            StateUpdate::Missing => Ok(false),
            StateUpdate::Rejected { current } => {
                warn!(%event_id, %current, "send: resend ignored; echo has not failed");
                Ok(false)
            }
        }
    }

    /// Delete an echo. A queued unit is dropped; one already in flight
    /// finishes, and its outcome is discarded by the store.
    pub async fn cancel(&self, event_id: &EventId) -> Result<bool> {
        let Some(echo) = self.ctx.store.local_echo(event_id).await? else {
            return Ok(false);
        };
        let dequeued = self
            .queues
            .lock()
            .await
            .get_mut(echo.room_id())
            .is_some_and(|queue| queue.remove(event_id));
        let removed = self.ctx.store.remove_local_echo(event_id).await?;
        info!(
            room_id = %echo.room_id(),
            %event_id,
            dequeued,
            in_flight = echo.send_state.is_in_progress(),
            "send: local echo cancelled"
        );
        self.idle.notify_waiters();
        Ok(removed)
    }

    /// Leave a room: drop its queued units and its stored timeline.
    pub async fn forget_room(&self, room_id: &RoomId) -> Result<usize> {
        let dropped = self
            .queues
            .lock()
            .await
            .get_mut(room_id)
            .map(|queue| queue.clear_pending().len())
            .unwrap_or(0);
        let removed = self.ctx.store.forget_room(room_id).await?;
        info!(%room_id, dropped, removed = removed.len(), "send: room forgotten");
        self.idle.notify_waiters();
        Ok(removed.len())
    }

    /// Units queued or running for a room.
    pub async fn pending_in_room(&self, room_id: &RoomId) -> usize {
        self.queues
            .lock()
            .await
            .get(room_id)
            .map(|queue| queue.len() + usize::from(queue.in_flight().is_some()))
            .unwrap_or(0)
    }

    /// Wait until every room queue has drained, or return the store failure
    /// that halted a room.
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(err) = self.fatal.lock().await.take() {
                return Err(err);
            }
            if self.queues.lock().await.values().all(RoomSendQueue::is_idle) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn pump(self: &Arc<Self>, room_id: &RoomId) {
        let unit = {
            let mut queues = self.queues.lock().await;
            let Some(queue) = queues.get_mut(room_id) else {
                return;
            };
            match queue.start_next() {
                Some(unit) => unit,
                None => {
                    if queue.is_idle() {
                        queues.remove(room_id);
                        self.idle.notify_waiters();
                    }
                    return;
                }
            }
        };
        tokio::spawn(Arc::clone(self).drive(unit));
    }

    fn drive(self: Arc<Self>, unit: SendUnit) -> BoxFuture<'static, ()> {
        async move {
            let room_id = unit.room_id().clone();
            let event_id = unit.event_id().clone();

            let outcome = {
                let Ok(_permit) = self.workers.acquire().await else {
                    return;
                };
                unit.run(&self.ctx).await
            };

            match outcome {
                Ok(UnitOutcome::Retry { delay, .. }) => {
                    // The room stays in flight through the backoff.
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let mut queues = self.queues.lock().await;
                    queues
                        .entry(room_id.clone())
                        .or_insert_with(|| RoomSendQueue::new(room_id.clone()))
                        .requeue_front(unit);
                }
                Ok(UnitOutcome::Finished(_) | UnitOutcome::Dropped) => {
                    if let Some(queue) = self.queues.lock().await.get_mut(&room_id) {
                        queue.finish(&event_id);
                    }
                }
                Err(err) => {
                    error!(%room_id, %event_id, "send: event store failure, halting room: {err:#}");
                    let dropped = self
                        .queues
                        .lock()
                        .await
                        .remove(&room_id)
                        .map(|mut queue| queue.clear_pending().len())
                        .unwrap_or(0);
                    warn!(%room_id, dropped, "send: queued units left for restart recovery");
                    self.fatal.lock().await.get_or_insert(err);
                    self.idle.notify_waiters();
                    return;
                }
            }

            self.pump(&room_id).await;
        }
        .boxed()
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
