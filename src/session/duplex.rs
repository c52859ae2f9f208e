use super::{Connector, TransportError};
use futures_util::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use url::Url;

const DUPLEX_CAPACITY: usize = 64 * 1024;

pub(crate) struct Accepted {
    pub(crate) target: Url,
    pub(crate) server: WebSocketStream<DuplexStream>,
}

pub(crate) struct DuplexConnector {
    accepted_tx: Option<mpsc::UnboundedSender<Accepted>>,
}

impl DuplexConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted_tx: Some(accepted_tx),
            },
            accepted_rx,
        )
    }

    pub(crate) fn refusing() -> Self {
        Self { accepted_tx: None }
    }
}

impl Connector for DuplexConnector {
    type Io = DuplexStream;

    fn connect(
        &self,
        target: Url,
    ) -> BoxFuture<'static, Result<WebSocketStream<Self::Io>, TransportError>> {
        let accepted_tx = self.accepted_tx.clone();
        Box::pin(async move {
            let Some(accepted_tx) = accepted_tx else {
                return Err(TransportError::Unavailable(format!(
                    "connection refused: {target}"
                )));
            };
            let (client_io, server_io) = tokio::io::duplex(DUPLEX_CAPACITY);
            let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
            let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            accepted_tx
                .send(Accepted { target, server })
                .map_err(|_| TransportError::Unavailable("test acceptor dropped".to_string()))?;
            Ok(client)
        })
    }
}
