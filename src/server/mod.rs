use crate::config::ServerConfig;
use crate::protocol::{
    encode_event, CompletionPayload, ProgressCounters, ProgressPayload, ProtocolEvent, PING_FRAME,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub step_interval: Duration,
    pub heartbeat_interval: Duration,
    pub total_items: u64,
    pub services: Vec<String>,
}

impl From<&ServerConfig> for FeedConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            step_interval: Duration::from_millis(config.step_interval_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            total_items: config.total_items,
            services: config
                .services
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

pub async fn start(
    addr: SocketAddr,
    feed: FeedConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "progress feed listening");
    serve(listener, feed, shutdown_rx).await?;
    Ok(())
}

/// Serves on an already bound listener until `shutdown_rx` changes.
pub async fn serve(
    listener: TcpListener,
    feed: FeedConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws/progress/:session_id", get(ws_handler))
        .with_state(Arc::new(feed));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
}

async fn ws_handler(
    State(feed): State<Arc<FeedConfig>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, feed))
}

async fn handle_socket(mut socket: WebSocket, session_id: String, feed: Arc<FeedConfig>) {
    tracing::info!(session_id = %session_id, "progress feed client connected");
    let mut job = SimulatedJob::new(&feed, StdRng::from_entropy());
    let mut pings = 0u64;

    if send_event(&mut socket, &ProtocolEvent::Connection).await.is_err() {
        return;
    }

    let now = Instant::now();
    let mut steps = interval_at(now + feed.step_interval, feed.step_interval);
    let mut heartbeats = interval_at(now + feed.heartbeat_interval, feed.heartbeat_interval);
    heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = steps.tick(), if !job.is_finished() => {
                let event = job.next_event();
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
                if job.is_finished() {
                    tracing::info!(session_id = %session_id, "simulated job complete");
                }
            }
            _ = heartbeats.tick() => {
                if send_event(&mut socket, &ProtocolEvent::Heartbeat).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text == PING_FRAME => {
                        pings += 1;
                        tracing::debug!(session_id = %session_id, pings, "ping received");
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::info!(session_id = %session_id, pings, "progress feed client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &ProtocolEvent) -> Result<(), axum::Error> {
    let payload = match encode_event(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, kind = event.kind(), "failed to encode event");
            return Ok(());
        }
    };
    socket.send(Message::Text(payload)).await
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

struct SimulatedJob<R> {
    services: Vec<String>,
    total_items: u64,
    processed: u64,
    max_stride: u64,
    completed: bool,
    rng: R,
}

impl<R: Rng> SimulatedJob<R> {
    fn new(feed: &FeedConfig, rng: R) -> Self {
        let services = if feed.services.is_empty() {
            vec!["ingest".to_string()]
        } else {
            feed.services.clone()
        };
        let total_items = feed.total_items.max(1);
        let max_stride = (total_items / (services.len() as u64).saturating_mul(4)).max(1);
        Self {
            services,
            total_items,
            processed: 0,
            max_stride,
            completed: false,
            rng,
        }
    }

    fn is_finished(&self) -> bool {
        self.completed
    }

    fn next_event(&mut self) -> ProtocolEvent {
        if self.processed >= self.total_items {
            self.completed = true;
            return ProtocolEvent::Completion(CompletionPayload {
                summary: Some(serde_json::Value::String(format!(
                    "Ingested {} items from {} services",
                    self.total_items,
                    self.services.len()
                ))),
                message: None,
            });
        }

        let stride = self.rng.gen_range(1..=self.max_stride);
        self.processed = self.processed.saturating_add(stride).min(self.total_items);

        let total_services = self.services.len() as u64;
        // u128 keeps processed * services exact for any item count.
        let completed_services = (u128::from(self.processed) * u128::from(total_services)
            / u128::from(self.total_items)) as u64;
        let current = completed_services.min(total_services - 1) as usize;
        let service = self.services[current].clone();

        ProtocolEvent::Progress(ProgressPayload {
            message: Some(format!("Ingesting {service}")),
            progress: Some(ProgressCounters {
                processed_items: Some(self.processed as f64),
                total_items: Some(self.total_items as f64),
                current_service: Some(service),
                total_services: Some(total_services),
                completed_services: Some(completed_services),
            }),
        })
    }
}
