//! Live connection transport: a WebSocket task that sends the session setup,
//! pumps outbound messages and decodes inbound server frames into events.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::MentorError;
use crate::types::{ClientMessage, ServerMessage, SessionSetup};

/// Bidirectional streaming endpoint of the hosted model service.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Events the connection task reports back to the session controller.
#[derive(Debug)]
pub enum LiveEvent {
    /// The remote acknowledged the session setup; streaming may begin.
    Open,
    Message(ServerMessage),
    Error(String),
    Closed,
}

/// Signals the connection task to close the socket. Fires on drop so an
/// abandoned connection never leaks its task.
pub struct ShutdownHandle(Option<oneshot::Sender<()>>);

impl ShutdownHandle {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Some(tx))
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.0.take() {
            if tx.send(()).is_err() {
                debug!("[Connection] Shutdown signal: task already gone");
            }
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An open live connection: outbound message sender, inbound event receiver
/// and the shutdown handle for the pump task.
pub struct LiveConnection {
    pub sender: mpsc::Sender<ClientMessage>,
    pub events: mpsc::Receiver<LiveEvent>,
    pub shutdown: ShutdownHandle,
}

/// Seam between the session controller and the transport, so tests can
/// inject scripted connections.
pub trait LiveConnector: Send + Sync + 'static {
    /// Pre-flight transport check, evaluated before any credential or device
    /// is acquired.
    fn is_secure(&self) -> bool;

    fn connect(
        &self,
        api_key: &str,
        setup: SessionSetup,
    ) -> impl Future<Output = Result<LiveConnection, MentorError>> + Send;
}

/// Production connector over tokio-tungstenite.
pub struct TungsteniteConnector {
    endpoint: Url,
}

impl TungsteniteConnector {
    pub fn new(endpoint: &str) -> Result<Self, MentorError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| MentorError::Internal(format!("invalid live endpoint: {e}")))?;
        Ok(Self { endpoint })
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_LIVE_ENDPOINT).expect("default endpoint parses"),
        }
    }
}

impl LiveConnector for TungsteniteConnector {
    /// `wss://` anywhere, plain `ws://` only on loopback.
    fn is_secure(&self) -> bool {
        match self.endpoint.scheme() {
            "wss" => true,
            "ws" => matches!(
                self.endpoint.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("[::1]")
            ),
            _ => false,
        }
    }

    fn connect(
        &self,
        api_key: &str,
        setup: SessionSetup,
    ) -> impl Future<Output = Result<LiveConnection, MentorError>> + Send {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("key", api_key);

        async move {
            let (socket, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| MentorError::Transport(format!("websocket connect failed: {e}")))?;
            info!("[Connection] Socket established, sending setup");

            let (events_tx, events_rx) = mpsc::channel(64);
            let (outgoing_tx, outgoing_rx) = mpsc::channel(100);
            let (shutdown_tx, shutdown_rx) = oneshot::channel();

            tokio::spawn(run_socket(socket, setup, events_tx, outgoing_rx, shutdown_rx));

            Ok(LiveConnection {
                sender: outgoing_tx,
                events: events_rx,
                shutdown: ShutdownHandle::new(shutdown_tx),
            })
        }
    }
}

async fn run_socket(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    setup: SessionSetup,
    events: mpsc::Sender<LiveEvent>,
    mut outgoing: mpsc::Receiver<ClientMessage>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let setup_text = match serde_json::to_string(&ClientMessage::Setup(setup)) {
        Ok(text) => text,
        Err(e) => {
            let _ = events
                .send(LiveEvent::Error(format!("setup serialization failed: {e}")))
                .await;
            return;
        }
    };
    if let Err(e) = socket.send(Message::Text(setup_text.into())).await {
        let _ = events
            .send(LiveEvent::Error(format!("failed to send setup: {e}")))
            .await;
        return;
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("[Connection] Shutdown requested, closing socket");
                let _ = socket.close(None).await;
                return;
            }
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    debug!("[Connection] Outgoing channel closed, closing socket");
                    let _ = socket.close(None).await;
                    return;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("[Connection] Skipping unserializable message: {e}");
                        continue;
                    }
                };
                if let Err(e) = socket.send(Message::Text(text.into())).await {
                    let _ = events.send(LiveEvent::Error(format!("send failed: {e}"))).await;
                    return;
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(text.as_bytes(), &events).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        dispatch_frame(&bytes, &events).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("[Connection] Remote closed the socket");
                        let _ = events.send(LiveEvent::Closed).await;
                        return;
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(e)) => {
                        let _ = events.send(LiveEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Decodes one inbound frame. The setup acknowledgment becomes `Open`;
/// unparseable frames are logged and dropped, never fatal.
async fn dispatch_frame(raw: &[u8], events: &mpsc::Sender<LiveEvent>) {
    match serde_json::from_slice::<ServerMessage>(raw) {
        Ok(msg) if msg.setup_complete.is_some() => {
            let _ = events.send(LiveEvent::Open).await;
        }
        Ok(msg) => {
            let _ = events.send(LiveEvent::Message(msg)).await;
        }
        Err(e) => {
            warn!("[Connection] Dropping unparseable server frame: {e}");
        }
    }
}
