use crate::config::{Config, TrackerConfig};
use crate::model::{ProgressSnapshot, ProgressStatus};
use crate::server::{self, FeedConfig};
use crate::session::Connector;
use crate::tracker::ProgressTracker;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;

const USAGE: &str = "usage: ingest-progress-tracker <watch <session_id> | serve | simulate | config-init>";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let command = args.next().ok_or(USAGE)?;

    if command == "config-init" {
        return handle_config_init();
    }

    let config = Config::load()?;
    match command.as_str() {
        "watch" => {
            let session_id = args.next().ok_or("missing session id")?;
            handle_watch(&config.tracker, &session_id).await
        }
        "serve" => handle_serve(&config).await,
        "simulate" => handle_simulate(&config).await,
        _ => Err(USAGE.into()),
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_watch(
    tracker_config: &TrackerConfig,
    session_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let tracker = ProgressTracker::new(tracker_config)?;
    tracing::info!(base_url = %tracker.base_url(), session_id, "watching session");
    watch_session(&tracker, session_id).await
}

async fn handle_serve(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("127.0.0.1:{}", config.server.port).parse()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        res = server::start(addr, FeedConfig::from(&config.server), shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    }
}

async fn handle_simulate(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed = tokio::spawn(server::serve(
        listener,
        FeedConfig::from(&config.server),
        shutdown_rx,
    ));

    let tracker_config = TrackerConfig {
        base_url: format!("ws://{addr}/ws/progress"),
        ..config.tracker.clone()
    };
    let tracker = ProgressTracker::new(&tracker_config)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(addr = %addr, session_id = %session_id, "simulating ingestion job");

    let result = watch_session(&tracker, &session_id).await;
    drop(tracker);
    let _ = shutdown_tx.send(true);
    if let Some(err) = feed_failure(feed.await) {
        tracing::warn!(error = %err, "progress feed ended abnormally");
    }
    result
}

fn feed_failure(joined: Result<std::io::Result<()>, JoinError>) -> Option<String> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("feed io error: {err}")),
        Err(err) => Some(format!("feed task failed: {err}")),
    }
}

async fn watch_session<C: Connector>(
    tracker: &ProgressTracker<C>,
    session_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    tracker.connect(session_id);
    let mut rx = tracker.subscribe();

    let outcome = loop {
        let snapshot = rx.borrow_and_update().clone();
        log_snapshot(&snapshot);
        if snapshot.is_settled() {
            break snapshot;
        }
        if snapshot.state.status == ProgressStatus::Error {
            tracing::warn!(
                session_id,
                error = snapshot.state.error.as_deref().unwrap_or(""),
                "session reported an error, still watching"
            );
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break tracker.snapshot();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown: ctrl-c");
                tracker.disconnect();
                return Ok(());
            }
        }
    };
    tracker.disconnect();

    match outcome.state.status {
        ProgressStatus::Completed => Ok(()),
        ProgressStatus::Error => Err(format!(
            "session {session_id} failed: {}",
            outcome.state.error.as_deref().unwrap_or("unknown error")
        )
        .into()),
        status => Err(format!("session {session_id} closed while {status}").into()),
    }
}

fn log_snapshot(snapshot: &ProgressSnapshot) {
    let state = &snapshot.state;
    tracing::info!(
        status = %state.status,
        progress = state.progress,
        service = state.current_service.as_deref().unwrap_or("-"),
        completed_services = state.completed_services.unwrap_or(0),
        total_services = state.total_services.unwrap_or(0),
        connected = snapshot.connected,
        message = state.message.as_deref().unwrap_or(""),
        "progress"
    );
}
