mod cli;
mod terminal;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use beach_chat::signaling::RedisSignalingStore;
use beach_chat::telemetry::{self, LogConfig};
use beach_chat::transport::webrtc::WebRtcTransport;
use beach_chat::{ChatConfig, Session, SessionUpdate};

use crate::cli::{Cli, Commands};
use crate::terminal::{Output, QUIT_COMMAND, Renderer};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = ChatConfig::from_env();
    cli.apply(&mut config);
    let settings = config
        .session
        .clone()
        .validate()
        .context("set a display name with --name or BEACH_CHAT_NAME")?;

    let store = RedisSignalingStore::connect(
        &config.redis_url,
        config.record_ttl_seconds,
        config.poll_interval,
    )
    .await
    .with_context(|| format!("could not reach signaling server at {}", config.redis_url))?;
    let transport = WebRtcTransport::from_config(&config);

    let local_name = settings.display_name.clone();
    let session = Session::spawn(settings, Arc::new(store), Arc::new(transport))?;
    let printer = tokio::spawn(print_updates(session.subscribe(), Renderer::new(local_name)));

    match &cli.command {
        Commands::Host => {
            let id = session.begin_as_initiator().await?;
            info!(target = "beach_chat::cli", session_id = %id, "hosting session");
            println!("Share this session id: {id}");
        }
        Commands::Join { session_id } => {
            session.join_as_responder(session_id.as_str()).await?;
            info!(target = "beach_chat::cli", session_id = %session_id, "joined session");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut view = session.watch();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == QUIT_COMMAND => break,
                Some(line) => session.send_chat_message(line),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                debug!(target = "beach_chat::cli", "interrupted");
                break;
            }
            changed = view.changed() => {
                if changed.is_err() || view.borrow().state.is_closed() {
                    break;
                }
            }
        }
    }

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, session.disconnect())
        .await
        .is_err()
    {
        debug!(target = "beach_chat::cli", "disconnect timed out");
    }
    drop(session);
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, printer).await;
    Ok(())
}

async fn print_updates(mut updates: broadcast::Receiver<SessionUpdate>, mut renderer: Renderer) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                debug!(target = "beach_chat::cli", skipped, "update stream lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match renderer.render(&update) {
            Some(Output::Line(line)) => println!("{line}"),
            Some(Output::Bell) => {
                print!("\x07");
                let _ = std::io::stdout().flush();
            }
            None => {}
        }
        if matches!(update, SessionUpdate::DisconnectComplete) {
            break;
        }
    }
}
