use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use send_pipeline::{config::normalize_database_url, load_settings, start_pipeline};
use serde_json::{json, Value};
use shared::domain::{EventId, RoomId, UserId};
use storage::EventStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `database_url` from send_pipeline.toml and the environment.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a message and wait until the room's queue drains.
    Send {
        room_id: String,
        body: String,
        #[arg(long, default_value = "m.room.message")]
        event_type: String,
        /// Raw JSON content; replaces the m.text body.
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        sender: Option<String>,
    },
    /// Deliver whatever a previous run left unsent.
    Resume,
    /// List local echoes that have not been confirmed.
    Pending { room_id: String },
    Timeline { room_id: String },
    /// Resend a failed event under its original id.
    Retry { event_id: String },
    Cancel { event_id: String },
    EncryptRoom {
        room_id: String,
        #[arg(long)]
        disable: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url {
        settings.database_url = normalize_database_url(&database_url);
    }

    match cli.command {
        Command::Send {
            room_id,
            body,
            event_type,
            content,
            sender,
        } => {
            let sender = sender
                .or_else(|| settings.sender_id.clone())
                .ok_or_else(|| anyhow!("no sender: pass --sender or set sender_id"))?;
            let content = match content {
                Some(raw) => serde_json::from_str::<Value>(&raw).context("invalid --content json")?,
                None => json!({ "msgtype": "m.text", "body": body }),
            };

            let pipeline = start_pipeline(&settings).await?;
            let echo = pipeline
                .send_event(
                    &RoomId::from(room_id),
                    &UserId::from(sender),
                    &event_type,
                    content,
                )
                .await?;
            pipeline.wait_idle().await?;
            let state = pipeline.store().send_state(echo.event_id()).await?;
            println!(
                "event_id={} state={}",
                echo.event_id(),
                state.map(|s| s.to_string()).unwrap_or_else(|| "removed".into())
            );
        }
        Command::Resume => {
            let pipeline = start_pipeline(&settings).await?;
            pipeline.wait_idle().await?;
            info!("resume finished");
        }
        Command::Pending { room_id } => {
            let store = open_store(&settings.database_url).await?;
            for echo in store.local_echoes_for_room(&RoomId::from(room_id)).await? {
                println!(
                    "{} {} attempts={} {}",
                    echo.event_id(),
                    echo.send_state,
                    echo.attempts,
                    echo.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Timeline { room_id } => {
            let store = open_store(&settings.database_url).await?;
            let timeline = store.room_timeline(&RoomId::from(room_id)).await?;
            for event in timeline.confirmed {
                println!("{} {} {}", event.event_id, event.event_type, event.content);
            }
            for echo in timeline.local {
                println!(
                    "{} {} {} [{}]",
                    echo.event_id(),
                    echo.event.event_type,
                    echo.event.content,
                    echo.send_state
                );
            }
        }
        Command::Retry { event_id } => {
            let event_id = EventId::from(event_id);
            let pipeline = start_pipeline(&settings).await?;
            if !pipeline.retry(&event_id).await? {
                println!("{event_id} is not a failed event");
                return Ok(());
            }
            pipeline.wait_idle().await?;
            let state = pipeline.store().send_state(&event_id).await?;
            println!(
                "event_id={event_id} state={}",
                state.map(|s| s.to_string()).unwrap_or_else(|| "removed".into())
            );
        }
        Command::Cancel { event_id } => {
            let store = open_store(&settings.database_url).await?;
            let removed = store.remove_local_echo(&EventId::from(event_id.as_str())).await?;
            println!("cancelled {event_id}: {removed}");
        }
        Command::EncryptRoom { room_id, disable } => {
            let store = open_store(&settings.database_url).await?;
            store
                .set_room_encryption(&RoomId::from(room_id.as_str()), !disable)
                .await?;
            println!("room {room_id} requires_encryption={}", !disable);
        }
    }

    Ok(())
}

async fn open_store(database_url: &str) -> Result<EventStore> {
    EventStore::new(database_url)
        .await
        .with_context(|| format!("failed to open event store at {database_url}"))
}
