use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::put,
    Json, Router,
};
use send_pipeline::{start_pipeline, SendPipelineSettings};
use serde_json::{json, Value};
use shared::domain::{EventId, RoomId, SendState, UserId};
use tokio::{net::TcpListener, sync::Mutex, time::timeout};

#[derive(Clone, Default)]
struct Homeserver {
    failures_left: Arc<AtomicUsize>,
    txn_ids: Arc<Mutex<Vec<String>>>,
}

async fn handle_send(
    State(state): State<Homeserver>,
    Path((_room_id, _event_type, txn_id)): Path<(String, String, String)>,
    Json(_body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.txn_ids.lock().await.push(txn_id.clone());
    let failing = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if failing {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "errcode": "M_UNAVAILABLE", "error": "try later" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "event_id": format!("$S.{}", txn_id.trim_start_matches("$local.")) })),
    )
}

async fn spawn_homeserver(failures: usize) -> Result<(String, Homeserver)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = Homeserver {
        failures_left: Arc::new(AtomicUsize::new(failures)),
        ..Homeserver::default()
    };
    let app = Router::new()
        .route(
            "/_matrix/client/v3/rooms/:room_id/send/:event_type/:txn_id",
            put(handle_send),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn settings(database_url: String, homeserver_url: Option<String>) -> SendPipelineSettings {
    SendPipelineSettings {
        database_url,
        homeserver_url,
        access_token: Some("syt_token".into()),
        sender_id: Some("@alice:example.org".into()),
        max_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        request_timeout_secs: 5,
        ..SendPipelineSettings::default()
    }
}

fn database_url(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("data").join("events.db");
    format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
}

#[tokio::test]
async fn delivers_over_http_after_transient_server_errors() {
    let (url, homeserver) = spawn_homeserver(2).await.expect("spawn server");
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = start_pipeline(&settings(database_url(&dir), Some(url)))
        .await
        .expect("start");
    let room = RoomId::from("!room:example.org");

    let echo = pipeline
        .send_event(
            &room,
            &UserId::from("@alice:example.org"),
            "m.room.message",
            json!({ "msgtype": "m.text", "body": "hello" }),
        )
        .await
        .expect("send");
    timeout(Duration::from_secs(10), pipeline.wait_idle())
        .await
        .expect("idle")
        .expect("no store failure");

    let txn_ids = homeserver.txn_ids.lock().await.clone();
    assert_eq!(txn_ids, vec![echo.event_id().to_string(); 3]);
    assert_eq!(
        pipeline.store().send_state(echo.event_id()).await.expect("state"),
        Some(SendState::Sent)
    );
    let timeline = pipeline.store().room_timeline(&room).await.expect("timeline");
    assert!(timeline.local.is_empty());
    assert_eq!(timeline.confirmed.len(), 1);
    assert_eq!(timeline.confirmed[0].local_event_id.as_ref(), Some(echo.event_id()));
}

#[tokio::test]
async fn undelivered_event_survives_restart_and_resends_under_same_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let room = RoomId::from("!room:example.org");

    let event_id: EventId = {
        let offline = start_pipeline(&settings(database_url(&dir), None))
            .await
            .expect("start offline");
        let echo = offline
            .send_event(
                &room,
                &UserId::from("@alice:example.org"),
                "m.room.message",
                json!({ "body": "while offline" }),
            )
            .await
            .expect("send");
        timeout(Duration::from_secs(10), offline.wait_idle())
            .await
            .expect("idle")
            .expect("no store failure");
        assert_eq!(
            offline.store().send_state(echo.event_id()).await.expect("state"),
            Some(SendState::Undelivered)
        );
        offline.store().pool().close().await;
        echo.event_id().clone()
    };

    let (url, homeserver) = spawn_homeserver(0).await.expect("spawn server");
    let online = start_pipeline(&settings(database_url(&dir), Some(url)))
        .await
        .expect("start online");
    assert_eq!(online.pending_in_room(&room).await, 0, "failed events wait for the user");

    assert!(online.retry(&event_id).await.expect("retry"));
    timeout(Duration::from_secs(10), online.wait_idle())
        .await
        .expect("idle")
        .expect("no store failure");

    assert_eq!(
        homeserver.txn_ids.lock().await.clone(),
        vec![event_id.to_string()]
    );
    assert_eq!(
        online.store().send_state(&event_id).await.expect("state"),
        Some(SendState::Sent)
    );
}
