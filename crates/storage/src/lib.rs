use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tokio::sync::broadcast;
use tokio_stream::Stream;

use shared::domain::{
    ConfirmedEvent, Event, EventId, LocalEcho, RoomId, RoomTimeline, SendState, UserId,
};

mod changes;

pub use changes::TimelineChange;

const CHANGE_FEED_CAPACITY: usize = 1024;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ECHO_COLUMNS: &str = "position, event_id, room_id, event_type, content, sender, created_at, send_state, attempts, last_error";
const CONFIRMED_COLUMNS: &str =
    "event_id, room_id, event_type, content, sender, origin_ts, local_event_id";

/// Persisted rooms, confirmed timeline chunks and local echoes.
///
/// Every send-state write is a compare-and-swap against the state that was
/// read, so concurrent writers on one event never interleave.
#[derive(Clone)]
pub struct EventStore {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<TimelineChange>,
}

/// Result of a send-state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdate {
    Applied { previous: SendState },
    /// The echo no longer exists; nothing was written.
    Missing,
    /// The transition is not an edge of the state machine.
    Rejected { current: SendState },
}

impl StateUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, StateUpdate::Applied { .. })
    }
}

impl EventStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        // Every connection to `sqlite::memory:` opens its own database.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate event store schema")?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineChange> {
        self.changes.subscribe()
    }

    pub fn changes(&self) -> impl Stream<Item = TimelineChange> {
        changes::change_stream(self.changes.subscribe())
    }

    fn publish(&self, change: TimelineChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    pub async fn ensure_room(&self, room_id: &RoomId) -> Result<()> {
        sqlx::query("INSERT INTO rooms (room_id) VALUES (?) ON CONFLICT(room_id) DO NOTHING")
            .bind(room_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_room_encryption(&self, room_id: &RoomId, enabled: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO rooms (room_id, requires_encryption) VALUES (?, ?)
             ON CONFLICT(room_id) DO UPDATE SET requires_encryption = excluded.requires_encryption",
        )
        .bind(room_id.as_str())
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn room_requires_encryption(&self, room_id: &RoomId) -> Result<bool> {
        let row = sqlx::query("SELECT requires_encryption FROM rooms WHERE room_id = ?")
            .bind(room_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<bool, _>(0)).unwrap_or(false))
    }

    /// Allocate an identifier and append an `UNSENT` echo to the room's
    /// trailing local sequence.
    pub async fn create_local_echo(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<LocalEcho> {
        let event_id = EventId::new_local();
        let created_at = Utc::now();
        let content_json =
            serde_json::to_string(&content).context("failed to encode event content")?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO rooms (room_id) VALUES (?) ON CONFLICT(room_id) DO NOTHING")
            .bind(room_id.as_str())
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            "INSERT INTO local_echoes (event_id, room_id, event_type, content, sender, created_at, send_state)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING position",
        )
        .bind(event_id.as_str())
        .bind(room_id.as_str())
        .bind(event_type)
        .bind(&content_json)
        .bind(sender.as_str())
        .bind(created_at)
        .bind(SendState::Unsent.as_str())
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert local echo into room {room_id}"))?;
        tx.commit().await?;

        let echo = LocalEcho {
            event: Event {
                event_id: event_id.clone(),
                room_id: room_id.clone(),
                event_type: event_type.to_string(),
                content,
                sender: sender.clone(),
                created_at,
            },
            send_state: SendState::Unsent,
            position: row.get::<i64, _>(0),
            attempts: 0,
            last_error: None,
        };
        self.publish(TimelineChange::EchoAdded {
            room_id: room_id.clone(),
            event_id,
        });
        Ok(echo)
    }

    pub async fn local_echo(&self, event_id: &EventId) -> Result<Option<LocalEcho>> {
        let row = sqlx::query(&format!(
            "SELECT {ECHO_COLUMNS} FROM local_echoes WHERE event_id = ?"
        ))
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(echo_from_row).transpose()
    }

    pub async fn local_echoes_for_room(&self, room_id: &RoomId) -> Result<Vec<LocalEcho>> {
        let rows = sqlx::query(&format!(
            "SELECT {ECHO_COLUMNS} FROM local_echoes WHERE room_id = ? ORDER BY position ASC"
        ))
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(echo_from_row).collect()
    }

    pub async fn confirmed_events(&self, room_id: &RoomId) -> Result<Vec<ConfirmedEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONFIRMED_COLUMNS} FROM timeline_events WHERE room_id = ? ORDER BY seq ASC"
        ))
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(confirmed_from_row).collect()
    }

    pub async fn confirmed_event(&self, event_id: &EventId) -> Result<Option<ConfirmedEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIRMED_COLUMNS} FROM timeline_events WHERE event_id = ?"
        ))
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(confirmed_from_row).transpose()
    }

    /// Confirmed events followed by the room's local echoes.
    pub async fn room_timeline(&self, room_id: &RoomId) -> Result<RoomTimeline> {
        Ok(RoomTimeline {
            confirmed: self.confirmed_events(room_id).await?,
            local: self.local_echoes_for_room(room_id).await?,
        })
    }

    /// Current state of an echo, or `Sent` once it has been promoted.
    pub async fn send_state(&self, event_id: &EventId) -> Result<Option<SendState>> {
        if let Some((_, state)) = self.load_state(event_id).await? {
            return Ok(Some(state));
        }
        if self.is_promoted(event_id).await? {
            return Ok(Some(SendState::Sent));
        }
        Ok(None)
    }

    /// Move an echo along one edge of the state machine.
    ///
    /// A missing echo (room left, message deleted) is not an error. `SENT` is
    /// only entered through [`EventStore::promote_to_confirmed`], so a write
    /// of `SENT` here is rejected.
    pub async fn update_send_state(
        &self,
        event_id: &EventId,
        next: SendState,
    ) -> Result<StateUpdate> {
        loop {
            let Some((room_id, current)) = self.load_state(event_id).await? else {
                if self.is_promoted(event_id).await? {
                    return Ok(StateUpdate::Rejected {
                        current: SendState::Sent,
                    });
                }
                return Ok(StateUpdate::Missing);
            };
            if next == SendState::Sent || !current.can_transition_to(next) {
                return Ok(StateUpdate::Rejected { current });
            }

            let updated = sqlx::query(
                "UPDATE local_echoes
                 SET send_state = ?, updated_at = CURRENT_TIMESTAMP
                 WHERE event_id = ? AND send_state = ?",
            )
            .bind(next.as_str())
            .bind(event_id.as_str())
            .bind(current.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated > 0 {
                self.publish(TimelineChange::SendStateChanged {
                    room_id,
                    event_id: event_id.clone(),
                    state: next,
                });
                return Ok(StateUpdate::Applied { previous: current });
            }
        }
    }

    /// Enter `SENDING` for a new transmission attempt and bump the durable
    /// attempt counter. Returns the attempt number, or `None` when the echo
    /// is gone or not in a dispatchable state.
    pub async fn begin_attempt(&self, event_id: &EventId) -> Result<Option<u32>> {
        loop {
            let Some((room_id, current)) = self.load_state(event_id).await? else {
                return Ok(None);
            };
            if !current.can_transition_to(SendState::Sending) {
                return Ok(None);
            }

            let row = sqlx::query(
                "UPDATE local_echoes
                 SET send_state = ?, attempts = attempts + 1, updated_at = CURRENT_TIMESTAMP
                 WHERE event_id = ? AND send_state = ?
                 RETURNING attempts",
            )
            .bind(SendState::Sending.as_str())
            .bind(event_id.as_str())
            .bind(current.as_str())
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                let attempts = u32::try_from(row.get::<i64, _>(0))
                    .map_err(|_| anyhow!("corrupted attempt counter for event {event_id}"))?;
                self.publish(TimelineChange::SendStateChanged {
                    room_id,
                    event_id: event_id.clone(),
                    state: SendState::Sending,
                });
                return Ok(Some(attempts));
            }
        }
    }

    pub async fn record_failure(&self, event_id: &EventId, message: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE local_echoes SET last_error = ?, updated_at = CURRENT_TIMESTAMP WHERE event_id = ?",
        )
        .bind(message)
        .bind(event_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Manual resend of a failed echo. The event keeps its identifier so the
    /// server can still deduplicate it; the attempt budget starts over.
    pub async fn reset_for_retry(&self, event_id: &EventId) -> Result<StateUpdate> {
        loop {
            let Some((room_id, current)) = self.load_state(event_id).await? else {
                if self.is_promoted(event_id).await? {
                    return Ok(StateUpdate::Rejected {
                        current: SendState::Sent,
                    });
                }
                return Ok(StateUpdate::Missing);
            };
            if !current.is_failed() {
                return Ok(StateUpdate::Rejected { current });
            }

            let updated = sqlx::query(
                "UPDATE local_echoes
                 SET send_state = ?, attempts = 0, last_error = NULL, updated_at = CURRENT_TIMESTAMP
                 WHERE event_id = ? AND send_state = ?",
            )
            .bind(SendState::Unsent.as_str())
            .bind(event_id.as_str())
            .bind(current.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated > 0 {
                self.publish(TimelineChange::SendStateChanged {
                    room_id,
                    event_id: event_id.clone(),
                    state: SendState::Unsent,
                });
                return Ok(StateUpdate::Applied { previous: current });
            }
        }
    }

    /// Record the server's acknowledgment of a `SENDING` echo: the echo
    /// becomes `SENT` and moves into the confirmed chunk under its server id
    /// in one transaction, so no restart can leave a `SENT` echo behind in
    /// the trailing local sequence.
    ///
    /// Returns `false` when the echo is gone or not in flight. If a sync
    /// already inserted the server event, the existing row is linked instead
    /// of duplicated.
    pub async fn promote_to_confirmed(
        &self,
        event_id: &EventId,
        server_event_id: &EventId,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO timeline_events (event_id, room_id, event_type, content, sender, origin_ts, local_event_id)
             SELECT ?1, room_id, event_type, content, sender, created_at, event_id
             FROM local_echoes
             WHERE event_id = ?2 AND send_state = ?3
             ON CONFLICT(event_id) DO UPDATE SET local_event_id = excluded.local_event_id",
        )
        .bind(server_event_id.as_str())
        .bind(event_id.as_str())
        .bind(SendState::Sending.as_str())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to promote {event_id} to {server_event_id}"))?;

        let removed = sqlx::query(
            "DELETE FROM local_echoes WHERE event_id = ? AND send_state = ? RETURNING room_id",
        )
        .bind(event_id.as_str())
        .bind(SendState::Sending.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = removed else {
            tx.rollback().await?;
            return Ok(false);
        };
        tx.commit().await?;

        let room_id = RoomId(row.get::<String, _>(0));
        self.publish(TimelineChange::SendStateChanged {
            room_id: room_id.clone(),
            event_id: event_id.clone(),
            state: SendState::Sent,
        });
        self.publish(TimelineChange::EchoPromoted {
            room_id,
            local_event_id: event_id.clone(),
            server_event_id: server_event_id.clone(),
        });
        Ok(true)
    }

    /// Insert an event received from the server. Idempotent on the server
    /// event id.
    pub async fn insert_remote_event(&self, event: &ConfirmedEvent) -> Result<bool> {
        let content_json =
            serde_json::to_string(&event.content).context("failed to encode event content")?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO rooms (room_id) VALUES (?) ON CONFLICT(room_id) DO NOTHING")
            .bind(event.room_id.as_str())
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO timeline_events (event_id, room_id, event_type, content, sender, origin_ts, local_event_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(event.event_id.as_str())
        .bind(event.room_id.as_str())
        .bind(&event.event_type)
        .bind(&content_json)
        .bind(event.sender.as_str())
        .bind(event.origin_ts)
        .bind(event.local_event_id.as_ref().map(|id| id.as_str()))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if inserted > 0 {
            self.publish(TimelineChange::RemoteEventAdded {
                room_id: event.room_id.clone(),
                event_id: event.event_id.clone(),
            });
        }
        Ok(inserted > 0)
    }

    /// Delete an echo, whatever its state. An attempt already in flight
    /// finishes, but its later writes become no-ops.
    pub async fn remove_local_echo(&self, event_id: &EventId) -> Result<bool> {
        let row = sqlx::query("DELETE FROM local_echoes WHERE event_id = ? RETURNING room_id")
            .bind(event_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        self.publish(TimelineChange::EchoRemoved {
            room_id: RoomId(row.get::<String, _>(0)),
            event_id: event_id.clone(),
        });
        Ok(true)
    }

    /// Drop everything held for a room the user left. Returns the removed
    /// local echo ids in creation order.
    pub async fn forget_room(&self, room_id: &RoomId) -> Result<Vec<EventId>> {
        let mut tx = self.pool.begin().await?;
        let mut removed = sqlx::query(
            "DELETE FROM local_echoes WHERE room_id = ? RETURNING position, event_id",
        )
        .bind(room_id.as_str())
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|r| (r.get::<i64, _>(0), EventId(r.get::<String, _>(1))))
        .collect::<Vec<_>>();
        sqlx::query("DELETE FROM timeline_events WHERE room_id = ?")
            .bind(room_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM rooms WHERE room_id = ?")
            .bind(room_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        removed.sort_by_key(|(position, _)| *position);
        let removed = removed
            .into_iter()
            .map(|(_, event_id)| event_id)
            .collect::<Vec<_>>();
        for event_id in &removed {
            self.publish(TimelineChange::EchoRemoved {
                room_id: room_id.clone(),
                event_id: event_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Echoes that still need delivery, across all rooms, in creation order.
    ///
    /// Echoes caught mid-flight by a previous process are reset to `UNSENT`:
    /// their outcome was never observed, so they are attempted again.
    pub async fn pending_echoes_at_startup(&self) -> Result<Vec<LocalEcho>> {
        let mut tx = self.pool.begin().await?;
        let interrupted = sqlx::query(
            "UPDATE local_echoes
             SET send_state = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE send_state IN (?2, ?3)
             RETURNING room_id, event_id",
        )
        .bind(SendState::Unsent.as_str())
        .bind(SendState::Sending.as_str())
        .bind(SendState::Encrypting.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("failed to reset interrupted sends")?;
        let rows = sqlx::query(&format!(
            "SELECT {ECHO_COLUMNS} FROM local_echoes WHERE send_state = ? ORDER BY position ASC"
        ))
        .bind(SendState::Unsent.as_str())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        for row in interrupted {
            self.publish(TimelineChange::SendStateChanged {
                room_id: RoomId(row.get::<String, _>(0)),
                event_id: EventId(row.get::<String, _>(1)),
                state: SendState::Unsent,
            });
        }
        rows.iter().map(echo_from_row).collect()
    }

    async fn load_state(&self, event_id: &EventId) -> Result<Option<(RoomId, SendState)>> {
        let row = sqlx::query("SELECT room_id, send_state FROM local_echoes WHERE event_id = ?")
            .bind(event_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let state = parse_send_state(&r.get::<String, _>(1), event_id)?;
            Ok((RoomId(r.get::<String, _>(0)), state))
        })
        .transpose()
    }

    async fn is_promoted(&self, event_id: &EventId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM timeline_events WHERE local_event_id = ? LIMIT 1")
            .bind(event_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn parse_send_state(raw: &str, event_id: &EventId) -> Result<SendState> {
    raw.parse::<SendState>()
        .with_context(|| format!("corrupted event store: bad send_state for {event_id}"))
}

fn echo_from_row(row: &SqliteRow) -> Result<LocalEcho> {
    let event_id = EventId(row.try_get::<String, _>("event_id")?);
    let content = serde_json::from_str(&row.try_get::<String, _>("content")?)
        .with_context(|| format!("corrupted event store: bad content for {event_id}"))?;
    let send_state = parse_send_state(&row.try_get::<String, _>("send_state")?, &event_id)?;
    let attempts = u32::try_from(row.try_get::<i64, _>("attempts")?)
        .map_err(|_| anyhow!("corrupted attempt counter for event {event_id}"))?;

    Ok(LocalEcho {
        event: Event {
            room_id: RoomId(row.try_get::<String, _>("room_id")?),
            event_type: row.try_get::<String, _>("event_type")?,
            content,
            sender: UserId(row.try_get::<String, _>("sender")?),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            event_id,
        },
        send_state,
        position: row.try_get::<i64, _>("position")?,
        attempts,
        last_error: row.try_get::<Option<String>, _>("last_error")?,
    })
}

fn confirmed_from_row(row: &SqliteRow) -> Result<ConfirmedEvent> {
    let event_id = EventId(row.try_get::<String, _>("event_id")?);
    let content = serde_json::from_str(&row.try_get::<String, _>("content")?)
        .with_context(|| format!("corrupted event store: bad content for {event_id}"))?;

    Ok(ConfirmedEvent {
        room_id: RoomId(row.try_get::<String, _>("room_id")?),
        event_type: row.try_get::<String, _>("event_type")?,
        content,
        sender: UserId(row.try_get::<String, _>("sender")?),
        origin_ts: row.try_get::<DateTime<Utc>, _>("origin_ts")?,
        local_event_id: row
            .try_get::<Option<String>, _>("local_event_id")?
            .map(EventId),
        event_id,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
