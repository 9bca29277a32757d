//! # quizsync
//!
//! Command-line probe for a quizsync session authority: run connection
//! diagnostics, watch a session's event stream, or send a realtime event.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quizsync_client::{ANY, GameSessionClient};
use quizsync_core::logging::{init_json_subscriber, init_subscriber};
use quizsync_settings::{load_settings_from_path, settings_path};
use serde_json::Value;

/// quizsync session authority probe.
#[derive(Parser, Debug)]
#[command(name = "quizsync", about = "quizsync session authority probe", version)]
struct Cli {
    /// Settings file (defaults to `~/.quizsync/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Authority WebSocket URL (overrides settings).
    #[arg(long, global = true)]
    url: Option<String>,

    /// Bearer credential presented on connect.
    #[arg(long, global = true, env = "QUIZSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level filter (overrides settings; `RUST_LOG` wins over both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, run diagnostics, print the report as JSON.
    Diagnose {
        /// Seconds to wait for the connection before reporting.
        #[arg(long, default_value = "10")]
        wait_secs: u64,
    },
    /// Print every event for a session as JSON lines until Ctrl-C.
    Watch {
        /// Session to watch.
        session: String,
        /// Join the session as this user first.
        #[arg(long)]
        user: Option<String>,
    },
    /// Send one realtime event to a session.
    Send {
        /// Target session.
        session: String,
        /// Application event type.
        event_type: String,
        /// JSON payload.
        #[arg(default_value = "null")]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(url) = &args.url {
        settings.connection.url.clone_from(url);
        settings.validate().context("Invalid --url")?;
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| settings.logging.level.clone());
    if args.json_logs || settings.logging.json {
        init_json_subscriber(&level);
    } else {
        init_subscriber(&level);
    }
    tracing::debug!(path = %path.display(), url = %settings.connection.url, "settings loaded");

    let client = GameSessionClient::new(settings);
    let token = args.token;
    match args.command {
        Command::Diagnose { wait_secs } => {
            diagnose(&client, token, Duration::from_secs(wait_secs)).await
        }
        Command::Watch { session, user } => watch(&client, token, &session, user.as_deref()).await,
        Command::Send {
            session,
            event_type,
            data,
        } => send(&client, token, &session, &event_type, &data).await,
    }
}

async fn diagnose(client: &GameSessionClient, token: Option<String>, wait: Duration) -> Result<()> {
    match client.connect(token).await {
        Ok(()) => {}
        Err(err) => {
            tracing::warn!(error = %err, "connect failed; waiting for retries");
            if let Err(err) = client.wait_for_connection(wait).await {
                tracing::warn!(error = %err, "still not connected");
            }
        }
    }
    let report = client.perform_diagnostics().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    client.disconnect();
    Ok(())
}

async fn watch(
    client: &GameSessionClient,
    token: Option<String>,
    session: &str,
    user: Option<&str>,
) -> Result<()> {
    let session_id = session.to_owned();
    let _ = client.on(ANY, move |event| {
        if event.session().is_some_and(|s| s != session_id) {
            return;
        }
        match event.encode() {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "unprintable event"),
        }
    });

    client.connect(token).await.context("Failed to connect")?;
    if let Some(user) = user {
        let _ = client
            .join(session, user)
            .await
            .with_context(|| format!("Failed to join {session} as {user}"))?;
        tracing::info!(session, user, "joined");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    if let Some(user) = user {
        client.leave(session, user);
    }
    client.disconnect();
    Ok(())
}

async fn send(
    client: &GameSessionClient,
    token: Option<String>,
    session: &str,
    event_type: &str,
    data: &str,
) -> Result<()> {
    let data: Value = serde_json::from_str(data).context("Payload is not valid JSON")?;
    client.connect(token).await.context("Failed to connect")?;
    client.broadcast_realtime_event(session, event_type, data);

    // frames go out in order, so a pong means the event was written
    let report = client.perform_diagnostics().await;
    tracing::info!(ping = ?report.ping, "sent");
    client.disconnect();
    Ok(())
}
