use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatTick};
use crate::model::{ProgressSnapshot, ProgressStatus, SessionError};
use crate::progress::reduce;
use crate::protocol::{self, ProtocolEvent, PING_FRAME};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

#[cfg(test)]
pub(crate) mod duplex;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum TransportError {
    Ws(tungstenite::Error),
    Unavailable(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ws(err) => write!(f, "websocket error: {err}"),
            Self::Unavailable(msg) => write!(f, "transport unavailable: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Ws(err) => Some(err),
            Self::Unavailable(_) => None,
        }
    }
}

/// Opens the socket for one session.
pub trait Connector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        target: Url,
    ) -> BoxFuture<'static, Result<WebSocketStream<Self::Io>, TransportError>>;
}

/// Dials real `ws://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Io = MaybeTlsStream<TcpStream>;

    fn connect(
        &self,
        target: Url,
    ) -> BoxFuture<'static, Result<WebSocketStream<Self::Io>, TransportError>> {
        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(target.as_str())
                .await
                .map_err(TransportError::Ws)?;
            Ok(stream)
        })
    }
}

/// `{base}/{session_id}`, with the id percent-encoded as a single segment.
pub fn session_target(base: &Url, session_id: &str) -> Url {
    let mut target = base.clone();
    if let Ok(mut segments) = target.path_segments_mut() {
        segments.pop_if_empty().push(session_id);
    }
    target
}

pub(crate) struct SessionShared {
    inner: Mutex<SharedState>,
    snapshot_tx: watch::Sender<ProgressSnapshot>,
}

pub(crate) struct SharedState {
    // Stale tasks must not write.
    pub(crate) generation: u64,
    pub(crate) snapshot: ProgressSnapshot,
    pub(crate) session_id: Option<String>,
    pub(crate) connection: Option<SessionConnection>,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(ProgressSnapshot::default());
        Self {
            inner: Mutex::new(SharedState {
                generation: 0,
                snapshot: ProgressSnapshot::default(),
                session_id: None,
                connection: None,
            }),
            snapshot_tx,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub(crate) fn publish(&self, state: &SharedState) {
        let next = state.snapshot.clone();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    pub(crate) fn commit<F>(&self, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut ProgressSnapshot),
    {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        f(&mut inner.snapshot);
        self.publish(&inner);
        true
    }

    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.snapshot.connected = false;
        inner.connection = None;
        self.publish(&inner);
    }
}

pub(crate) struct SessionConnection {
    session_id: String,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct SessionContext {
    session_id: String,
    target: Url,
    generation: u64,
    heartbeat: HeartbeatConfig,
}

impl SessionConnection {
    // Caller has already bumped the generation and torn down the old handle.
    pub(crate) fn open<C: Connector>(
        connector: Arc<C>,
        shared: Arc<SessionShared>,
        base_url: &Url,
        session_id: &str,
        generation: u64,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = SessionContext {
            session_id: session_id.to_string(),
            target: session_target(base_url, session_id),
            generation,
            heartbeat,
        };
        let task = tokio::spawn(run_session(connector, shared, ctx, shutdown_rx));
        Self {
            session_id: session_id.to_string(),
            shutdown_tx,
            task,
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn close(self) -> JoinHandle<()> {
        let _ = self.shutdown_tx.send(());
        self.task
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Cancelled,
    Superseded,
    LivenessLost,
    ClosedByPeer,
    TransportFailed,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded",
            Self::LivenessLost => "heartbeat_lost",
            Self::ClosedByPeer => "closed_by_peer",
            Self::TransportFailed => "transport_failed",
        }
    }

    fn owns_close(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Superseded | Self::LivenessLost)
    }
}

async fn run_session<C: Connector>(
    connector: Arc<C>,
    shared: Arc<SessionShared>,
    ctx: SessionContext,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let SessionContext {
        session_id,
        target,
        generation,
        heartbeat,
    } = ctx;
    tracing::debug!(session_id = %session_id, target = %target, "opening progress socket");

    let dialed = tokio::select! {
        biased;
        _ = &mut shutdown_rx => {
            tracing::debug!(session_id = %session_id, "progress socket dial cancelled");
            return;
        }
        res = connector.connect(target) => res,
    };
    let mut ws = match dialed {
        Ok(ws) => ws,
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "progress socket failed to open");
            shared.commit(generation, |s| s.state.fail(&SessionError::Connection));
            shared.release(generation);
            return;
        }
    };

    let opened = shared.commit(generation, |s| {
        s.state.status = ProgressStatus::InProgress;
        s.connected = true;
    });
    if !opened {
        close_transport(&mut ws).await;
        return;
    }
    tracing::info!(session_id = %session_id, "progress socket open");

    let mut monitor = HeartbeatMonitor::start(heartbeat);
    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break Outcome::Cancelled,
            tick = monitor.tick() => match tick {
                HeartbeatTick::Ping => {
                    tracing::debug!(session_id = %session_id, "sending ping");
                    if let Err(err) = ws.send(Message::text(PING_FRAME)).await {
                        tracing::warn!(session_id = %session_id, error = %err, "ping send failed");
                        shared.commit(generation, |s| s.state.fail(&SessionError::Connection));
                        break Outcome::TransportFailed;
                    }
                }
                HeartbeatTick::Expired => {
                    tracing::warn!(
                        session_id = %session_id,
                        timeout_secs = heartbeat.timeout.as_secs(),
                        "no heartbeat inside watchdog window"
                    );
                    let lost = shared.commit(generation, |s| {
                        s.state.fail(&SessionError::Liveness);
                        s.connected = false;
                    });
                    if !lost {
                        break Outcome::Superseded;
                    }
                    break Outcome::LivenessLost;
                }
            },
            frame = ws.next() => match frame {
                None => break Outcome::ClosedByPeer,
                Some(Err(err)) => {
                    tracing::warn!(session_id = %session_id, error = %err, "progress socket error");
                    shared.commit(generation, |s| s.state.fail(&SessionError::Connection));
                    break Outcome::TransportFailed;
                }
                Some(Ok(message)) => {
                    if !apply_message(&shared, generation, &session_id, message, &mut monitor) {
                        break Outcome::Superseded;
                    }
                }
            },
        }
    };

    // Timers stop before the transport goes away.
    drop(monitor);
    if outcome.owns_close() {
        close_transport(&mut ws).await;
    }
    shared.release(generation);
    tracing::info!(session_id = %session_id, reason = outcome.as_str(), "progress socket closed");
}

fn apply_message(
    shared: &SessionShared,
    generation: u64,
    session_id: &str,
    message: Message,
    monitor: &mut HeartbeatMonitor,
) -> bool {
    let decoded = match &message {
        Message::Text(text) => protocol::decode_frame(text.as_str()),
        Message::Binary(data) => protocol::decode_binary_frame(data),
        _ => return true,
    };

    match decoded {
        Ok(event) => {
            if event.is_heartbeat() {
                monitor.reset_watchdog();
            }
            match &event {
                ProtocolEvent::Unknown { .. } => {
                    tracing::warn!(session_id = %session_id, "unrecognised progress frame");
                }
                ProtocolEvent::Error(payload) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %payload.description(),
                        "server reported job error"
                    );
                }
                _ => tracing::trace!(session_id = %session_id, kind = event.kind(), "progress frame"),
            }
            shared.commit(generation, |s| s.state = reduce(&s.state, &event))
        }
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "undecodable progress frame");
            shared.commit(generation, |s| s.state.fail(&SessionError::Protocol))
        }
    }
}

async fn close_transport<S>(ws: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(CLOSE_GRACE, ws.close(None)).await {
        Ok(Ok(())) => {}
        Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {}
        Ok(Err(err)) => tracing::debug!(error = %err, "close handshake failed"),
        Err(_) => tracing::debug!("close handshake timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::duplex::DuplexConnector;
    use super::*;
    use crate::model::ProgressState;

    fn base() -> Url {
        Url::parse("ws://jobs.test/ws/progress").unwrap()
    }

    fn open_session(
        shared: &Arc<SessionShared>,
        connector: &Arc<DuplexConnector>,
        session_id: &str,
    ) -> u64 {
        let mut inner = shared.lock();
        inner.generation += 1;
        let generation = inner.generation;
        inner.snapshot = ProgressSnapshot {
            state: ProgressState::connecting(),
            connected: false,
        };
        inner.connection = Some(SessionConnection::open(
            connector.clone(),
            shared.clone(),
            &base(),
            session_id,
            generation,
            HeartbeatConfig::default(),
        ));
        generation
    }

    #[test]
    fn target_appends_session_id_as_one_segment() {
        assert_eq!(
            session_target(&base(), "abc").as_str(),
            "ws://jobs.test/ws/progress/abc"
        );
        let trailing = Url::parse("ws://jobs.test/ws/progress/").unwrap();
        assert_eq!(
            session_target(&trailing, "abc").as_str(),
            "ws://jobs.test/ws/progress/abc"
        );
        assert_eq!(
            session_target(&base(), "a/b c").as_str(),
            "ws://jobs.test/ws/progress/a%2Fb%20c"
        );
    }

    #[test]
    fn commit_is_fenced_by_generation() {
        let shared = SessionShared::new();
        shared.lock().generation = 3;
        assert!(!shared.commit(2, |s| s.connected = true));
        assert!(!shared.lock().snapshot.connected);
        assert!(shared.commit(3, |s| s.connected = true));
        assert!(shared.lock().snapshot.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn open_marks_connected_and_reaches_the_derived_target() {
        let (connector, mut accepted) = DuplexConnector::new();
        let connector = Arc::new(connector);
        let shared = Arc::new(SessionShared::new());
        let mut rx = shared.subscribe();

        open_session(&shared, &connector, "job-7");
        let peer = accepted.recv().await.unwrap();
        assert_eq!(peer.target.as_str(), "ws://jobs.test/ws/progress/job-7");

        rx.wait_for(|s| s.connected).await.unwrap();
        let inner = shared.lock();
        assert_eq!(inner.snapshot.state.status, ProgressStatus::InProgress);
        assert_eq!(
            inner.connection.as_ref().map(SessionConnection::session_id),
            Some("job-7")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_task_sends_close_frame_and_exits() {
        let (connector, mut accepted) = DuplexConnector::new();
        let connector = Arc::new(connector);
        let shared = Arc::new(SessionShared::new());
        let mut rx = shared.subscribe();

        open_session(&shared, &connector, "job-8");
        let mut peer = accepted.recv().await.unwrap();
        rx.wait_for(|s| s.connected).await.unwrap();

        let connection = {
            let mut inner = shared.lock();
            inner.generation += 1;
            inner.connection.take().unwrap()
        };
        connection.close().await.unwrap();

        assert!(matches!(peer.server.next().await, Some(Ok(Message::Close(_)))));
        // The superseded task must not have touched the snapshot on its way out.
        assert!(shared.lock().snapshot.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_dial_reports_connection_error_and_releases_handle() {
        let connector = Arc::new(DuplexConnector::refusing());
        let shared = Arc::new(SessionShared::new());
        let mut rx = shared.subscribe();

        open_session(&shared, &connector, "job-9");
        let snapshot = rx
            .wait_for(|s| s.state.status == ProgressStatus::Error)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.state.error.as_deref(), Some("connection error"));
        assert!(!snapshot.connected);
        assert!(shared.lock().connection.is_none());
    }
}
