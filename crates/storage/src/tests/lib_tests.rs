use super::*;
use serde_json::json;

fn room(id: &str) -> RoomId {
    RoomId::from(id)
}

fn alice() -> UserId {
    UserId::from("@alice:example.org")
}

async fn store() -> EventStore {
    EventStore::new("sqlite::memory:").await.expect("db")
}

async fn echo(store: &EventStore, room_id: &RoomId, body: &str) -> LocalEcho {
    store
        .create_local_echo(room_id, &alice(), "m.room.message", json!({ "body": body }))
        .await
        .expect("local echo")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    store().await.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("events.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = EventStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn local_echoes_start_unsent_in_creation_order() {
    let store = store().await;
    let r = room("!r:example.org");
    let first = echo(&store, &r, "one").await;
    let second = echo(&store, &r, "two").await;

    assert_eq!(first.send_state, SendState::Unsent);
    assert!(first.event_id().is_local());
    assert!(second.position > first.position);

    let echoes = store.local_echoes_for_room(&r).await.expect("echoes");
    let ids = echoes.iter().map(|e| e.event_id().clone()).collect::<Vec<_>>();
    assert_eq!(ids, vec![first.event_id().clone(), second.event_id().clone()]);
    assert_eq!(echoes[0].event.content, json!({ "body": "one" }));
    assert_eq!(echoes[0].event.sender, alice());
}

#[tokio::test]
async fn observers_see_new_echo_immediately() {
    let store = store().await;
    let mut changes = store.subscribe();
    let r = room("!r:example.org");
    let created = echo(&store, &r, "hi").await;

    assert_eq!(
        changes.recv().await.expect("change"),
        TimelineChange::EchoAdded {
            room_id: r,
            event_id: created.event_id().clone(),
        }
    );
}

#[tokio::test]
async fn update_send_state_follows_transition_table() {
    let store = store().await;
    let created = echo(&store, &room("!r:example.org"), "hi").await;
    let id = created.event_id();

    let applied = store
        .update_send_state(id, SendState::Sending)
        .await
        .expect("update");
    assert_eq!(
        applied,
        StateUpdate::Applied {
            previous: SendState::Unsent
        }
    );

    let rejected = store
        .update_send_state(id, SendState::Encrypting)
        .await
        .expect("update");
    assert_eq!(
        rejected,
        StateUpdate::Rejected {
            current: SendState::Sending
        }
    );
    assert_eq!(
        store.send_state(id).await.expect("state"),
        Some(SendState::Sending)
    );
}

#[tokio::test]
async fn update_send_state_on_removed_echo_is_a_no_op() {
    let store = store().await;
    let created = echo(&store, &room("!r:example.org"), "bye").await;
    assert!(store
        .remove_local_echo(created.event_id())
        .await
        .expect("remove"));

    let outcome = store
        .update_send_state(created.event_id(), SendState::Sending)
        .await
        .expect("update");
    assert_eq!(outcome, StateUpdate::Missing);
    assert_eq!(store.send_state(created.event_id()).await.expect("state"), None);
    assert!(!store
        .remove_local_echo(created.event_id())
        .await
        .expect("second remove"));
}

#[tokio::test]
async fn begin_attempt_counts_attempts_durably() {
    let store = store().await;
    let created = echo(&store, &room("!r:example.org"), "hi").await;
    let id = created.event_id();

    assert_eq!(store.begin_attempt(id).await.expect("begin"), Some(1));
    assert_eq!(
        store.begin_attempt(id).await.expect("second begin while sending"),
        None
    );

    store
        .update_send_state(id, SendState::Unsent)
        .await
        .expect("back to unsent");
    assert_eq!(store.begin_attempt(id).await.expect("begin"), Some(2));

    let reloaded = store.local_echo(id).await.expect("load").expect("echo");
    assert_eq!(reloaded.attempts, 2);
    assert_eq!(reloaded.send_state, SendState::Sending);
}

#[tokio::test]
async fn promote_moves_echo_into_confirmed_chunk() {
    let store = store().await;
    let r = room("!r:example.org");
    let created = echo(&store, &r, "hello").await;
    let id = created.event_id().clone();
    let server_id = EventId::from("$server1:example.org");

    store.begin_attempt(&id).await.expect("begin");
    let mut changes = store.subscribe();
    assert!(store
        .promote_to_confirmed(&id, &server_id)
        .await
        .expect("promote"));

    let timeline = store.room_timeline(&r).await.expect("timeline");
    assert!(timeline.local.is_empty());
    assert_eq!(timeline.confirmed.len(), 1);
    assert_eq!(timeline.confirmed[0].event_id, server_id);
    assert_eq!(timeline.confirmed[0].local_event_id.as_ref(), Some(&id));
    assert_eq!(timeline.confirmed[0].content, json!({ "body": "hello" }));

    assert_eq!(
        changes.recv().await.expect("change"),
        TimelineChange::SendStateChanged {
            room_id: r.clone(),
            event_id: id.clone(),
            state: SendState::Sent,
        }
    );
    assert_eq!(
        changes.recv().await.expect("change"),
        TimelineChange::EchoPromoted {
            room_id: r,
            local_event_id: id.clone(),
            server_event_id: server_id,
        }
    );
    assert_eq!(
        store.send_state(&id).await.expect("state"),
        Some(SendState::Sent)
    );
}

#[tokio::test]
async fn sent_echo_cannot_change_state_after_promotion() {
    let store = store().await;
    let created = echo(&store, &room("!r:example.org"), "hello").await;
    let id = created.event_id().clone();

    store.begin_attempt(&id).await.expect("begin");
    store
        .promote_to_confirmed(&id, &EventId::from("$s:example.org"))
        .await
        .expect("promote");

    for next in [SendState::Unsent, SendState::Sending, SendState::Undelivered] {
        assert_eq!(
            store.update_send_state(&id, next).await.expect("update"),
            StateUpdate::Rejected {
                current: SendState::Sent
            }
        );
    }
    assert_eq!(
        store.reset_for_retry(&id).await.expect("retry"),
        StateUpdate::Rejected {
            current: SendState::Sent
        }
    );
}

#[tokio::test]
async fn sent_is_only_reached_through_promotion() {
    let store = store().await;
    let r = room("!r:example.org");
    let created = echo(&store, &r, "hello").await;
    let id = created.event_id();
    store.begin_attempt(id).await.expect("begin");

    assert_eq!(
        store
            .update_send_state(id, SendState::Sent)
            .await
            .expect("update"),
        StateUpdate::Rejected {
            current: SendState::Sending
        }
    );
    let timeline = store.room_timeline(&r).await.expect("timeline");
    assert!(timeline.confirmed.is_empty());
    assert_eq!(timeline.local[0].send_state, SendState::Sending);
}

#[tokio::test]
async fn promote_requires_echo_in_flight() {
    let store = store().await;
    let created = echo(&store, &room("!r:example.org"), "hello").await;

    assert!(!store
        .promote_to_confirmed(created.event_id(), &EventId::from("$s:example.org"))
        .await
        .expect("promote"));
    assert_eq!(
        store
            .local_echo(created.event_id())
            .await
            .expect("load")
            .map(|e| e.send_state),
        Some(SendState::Unsent)
    );
}

#[tokio::test]
async fn promotion_converges_with_event_already_seen_in_sync() {
    let store = store().await;
    let r = room("!r:example.org");
    let created = echo(&store, &r, "hello").await;
    let id = created.event_id().clone();
    let server_id = EventId::from("$s:example.org");

    let synced = ConfirmedEvent {
        event_id: server_id.clone(),
        room_id: r.clone(),
        event_type: "m.room.message".into(),
        content: json!({ "body": "hello" }),
        sender: alice(),
        origin_ts: Utc::now(),
        local_event_id: None,
    };
    assert!(store.insert_remote_event(&synced).await.expect("sync insert"));
    assert!(!store
        .insert_remote_event(&synced)
        .await
        .expect("repeated sync insert"));

    store.begin_attempt(&id).await.expect("begin");
    assert!(store
        .promote_to_confirmed(&id, &server_id)
        .await
        .expect("promote"));

    let confirmed = store.confirmed_events(&r).await.expect("confirmed");
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].local_event_id.as_ref(), Some(&id));
}

#[tokio::test]
async fn reset_for_retry_only_accepts_failed_echoes() {
    let store = store().await;
    let created = echo(&store, &room("!r:example.org"), "hi").await;
    let id = created.event_id();

    assert_eq!(
        store.reset_for_retry(id).await.expect("retry"),
        StateUpdate::Rejected {
            current: SendState::Unsent
        }
    );

    store.begin_attempt(id).await.expect("begin");
    store
        .record_failure(id, "server rejected event")
        .await
        .expect("record");
    store
        .update_send_state(id, SendState::Undelivered)
        .await
        .expect("undelivered");

    let failed = store.local_echo(id).await.expect("load").expect("echo");
    assert_eq!(failed.last_error.as_deref(), Some("server rejected event"));

    assert_eq!(
        store.reset_for_retry(id).await.expect("retry"),
        StateUpdate::Applied {
            previous: SendState::Undelivered
        }
    );
    let reset = store.local_echo(id).await.expect("load").expect("echo");
    assert_eq!(reset.send_state, SendState::Unsent);
    assert_eq!(reset.attempts, 0);
    assert_eq!(reset.last_error, None);
    assert_eq!(reset.event_id(), created.event_id());
}

#[tokio::test]
async fn startup_recovery_resets_interrupted_sends_in_creation_order() {
    let store = store().await;
    let a = room("!a:example.org");
    let b = room("!b:example.org");
    let first = echo(&store, &a, "a1").await;
    let second = echo(&store, &b, "b1").await;
    let third = echo(&store, &a, "a2").await;
    let failed = echo(&store, &b, "b2").await;

    store.begin_attempt(first.event_id()).await.expect("sending");
    store
        .update_send_state(second.event_id(), SendState::Encrypting)
        .await
        .expect("encrypting");
    store.begin_attempt(failed.event_id()).await.expect("sending");
    store
        .update_send_state(failed.event_id(), SendState::Undelivered)
        .await
        .expect("undelivered");

    let pending = store.pending_echoes_at_startup().await.expect("pending");
    let ids = pending.iter().map(|e| e.event_id().clone()).collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![
            first.event_id().clone(),
            second.event_id().clone(),
            third.event_id().clone(),
        ]
    );
    assert!(pending.iter().all(|e| e.send_state == SendState::Unsent));
    assert_eq!(pending[0].attempts, 1);
}

#[tokio::test]
async fn forget_room_drops_its_echoes_only() {
    let store = store().await;
    let left = room("!left:example.org");
    let kept = room("!kept:example.org");
    let first = echo(&store, &left, "one").await;
    let second = echo(&store, &left, "two").await;
    let other = echo(&store, &kept, "stay").await;
    store
        .set_room_encryption(&left, true)
        .await
        .expect("encryption");

    let removed = store.forget_room(&left).await.expect("forget");
    assert_eq!(
        removed,
        vec![first.event_id().clone(), second.event_id().clone()]
    );
    assert!(store
        .local_echoes_for_room(&left)
        .await
        .expect("echoes")
        .is_empty());
    assert!(!store.room_requires_encryption(&left).await.expect("flag"));
    assert!(store
        .local_echo(other.event_id())
        .await
        .expect("load")
        .is_some());
}

#[tokio::test]
async fn room_encryption_flag_defaults_off() {
    let store = store().await;
    let r = room("!r:example.org");
    assert!(!store.room_requires_encryption(&r).await.expect("flag"));
    store.set_room_encryption(&r, true).await.expect("enable");
    assert!(store.room_requires_encryption(&r).await.expect("flag"));
    store.set_room_encryption(&r, false).await.expect("disable");
    assert!(!store.room_requires_encryption(&r).await.expect("flag"));
}

#[tokio::test]
async fn corrupted_send_state_is_reported() {
    let store = store().await;
    let created = echo(&store, &room("!r:example.org"), "hi").await;
    sqlx::query("UPDATE local_echoes SET send_state = 'bogus' WHERE event_id = ?")
        .bind(created.event_id().as_str())
        .execute(store.pool())
        .await
        .expect("corrupt");

    let err = store
        .local_echo(created.event_id())
        .await
        .expect_err("corruption must surface");
    assert!(err.to_string().contains("corrupted event store"));
}

#[tokio::test]
async fn change_stream_reports_state_writes_per_room() {
    use tokio_stream::StreamExt;

    let store = store().await;
    let r = room("!r:example.org");
    store.ensure_room(&r).await.expect("room");
    store.ensure_room(&r).await.expect("room again");
    let created = echo(&store, &r, "hi").await;

    let changes = store.changes();
    tokio::pin!(changes);
    let update = store
        .update_send_state(created.event_id(), SendState::Sending)
        .await
        .expect("update");
    assert!(update.is_applied());

    let change = changes.next().await.expect("change");
    assert_eq!(change.room_id(), &r);
    assert_eq!(
        change,
        TimelineChange::SendStateChanged {
            room_id: r.clone(),
            event_id: created.event_id().clone(),
            state: SendState::Sending,
        }
    );
}
