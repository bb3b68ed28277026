// Transport abstraction over the draft socket.
//
// The manager only needs two things from a socket: the next inbound text
// frame (or the close that ended it) and a way to close it with a code. The
// production implementation sits on tokio-tungstenite; tests plug in
// in-memory sockets.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Close code for an intentional, locally requested shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame carried no status code.
pub const NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// How long to wait for the peer to echo our close frame.
const CLOSE_DRAIN: Duration = Duration::from_secs(1);
/// Upper bound on TCP connect plus the WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection failed: {0}")]
    Connect(String),
}

/// Something read from a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// The peer closed the connection with this code.
    Closed { code: u16, reason: String },
}

#[async_trait]
pub trait Socket: Send {
    /// Next text frame or close. `None` means the stream ended without a
    /// close frame.
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        let handshake = tokio_tungstenite::connect_async(url.as_str());
        let (stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| TransportError::Connect(format!("handshake with {url} timed out")))??;
        debug!(status = %response.status(), "WebSocket handshake completed with {url}");
        Ok(Box::new(TungsteniteSocket { stream }))
    }
}

pub struct TungsteniteSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for TungsteniteSocket {
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        while let Some(msg_result) = self.stream.next().await {
            match msg_result {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.to_string()))),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (NO_STATUS, String::new()),
                    };
                    return Some(Ok(Inbound::Closed { code, reason }));
                }
                Err(e) => return Some(Err(e.into())),
                _ => {
                    // Binary, Ping, Pong and raw frames carry nothing for us;
                    // pongs are answered by tungstenite itself.
                }
            }
        }
        None
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.stream.close(Some(frame)).await?;

        // Let the peer's close echo arrive so the handshake completes cleanly.
        let _ = tokio::time::timeout(CLOSE_DRAIN, async {
            while let Some(Ok(_)) = self.stream.next().await {}
        })
        .await;
        Ok(())
    }
}
