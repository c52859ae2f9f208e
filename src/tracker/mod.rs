use crate::config::{ConfigError, TrackerConfig};
use crate::heartbeat::HeartbeatConfig;
use crate::model::{ProgressSnapshot, ProgressState};
use crate::session::{Connector, SessionConnection, SessionShared, SharedState, WsConnector};
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

/// Tracks at most one job session at a time.
///
/// `connect` and `disconnect` never fail and never block; every outcome of
/// the session lands in the snapshot. Both must be called from inside a
/// tokio runtime, since `connect` spawns the session task.
pub struct ProgressTracker<C: Connector = WsConnector> {
    connector: Arc<C>,
    base_url: Url,
    heartbeat: HeartbeatConfig,
    shared: Arc<SessionShared>,
}

impl ProgressTracker<WsConnector> {
    pub fn new(config: &TrackerConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, WsConnector)
    }
}

impl<C: Connector> ProgressTracker<C> {
    pub fn with_connector(config: &TrackerConfig, connector: C) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(
            connector,
            config.parsed_base_url()?,
            config.heartbeat(),
        ))
    }

    pub fn from_parts(connector: C, base_url: Url, heartbeat: HeartbeatConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            base_url,
            heartbeat,
            shared: Arc::new(SessionShared::new()),
        }
    }

    /// Replaces any session already running. Nothing the old session receives
    /// afterwards is applied.
    pub fn connect(&self, session_id: &str) {
        let mut inner = self.shared.lock();
        teardown(&mut inner);
        let generation = inner.generation;
        inner.snapshot = ProgressSnapshot {
            state: ProgressState::connecting(),
            connected: false,
        };
        inner.session_id = Some(session_id.to_string());
        inner.connection = Some(SessionConnection::open(
            self.connector.clone(),
            self.shared.clone(),
            &self.base_url,
            session_id,
            generation,
            self.heartbeat,
        ));
        self.shared.publish(&inner);
        tracing::info!(session_id, "tracking session");
    }

    /// Cancels the current session, if any, and returns to idle. Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if let Some(session_id) = inner.session_id.take() {
            tracing::info!(session_id = %session_id, "stopped tracking session");
        }
        teardown(&mut inner);
        inner.snapshot = ProgressSnapshot::default();
        self.shared.publish(&inner);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.shared.lock().snapshot.clone()
    }

    pub fn state(&self) -> ProgressState {
        self.shared.lock().snapshot.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().snapshot.connected
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.shared.subscribe()
    }

    /// Waits until the current session has nothing further to report.
    pub async fn settled(&self) -> ProgressSnapshot {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(ProgressSnapshot::is_settled).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }
}

impl<C: Connector> Drop for ProgressTracker<C> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        teardown(&mut inner);
    }
}

fn teardown(inner: &mut SharedState) {
    inner.generation = inner.generation.wrapping_add(1);
    if let Some(connection) = inner.connection.take() {
        tracing::debug!(session_id = connection.session_id(), "closing previous session");
        drop(connection.close());
    }
}
