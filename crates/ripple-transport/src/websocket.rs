//! WebSocket transport implementation.
//!
//! Client-side transport using tokio-tungstenite. Text and binary WebSocket
//! messages map directly to [`WireMessage`]; protocol-level ping/pong is
//! handled by tungstenite itself.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ripple_protocol::WireMessage;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::traits::{ConnSink, ConnStream, Connected, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Connected, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(format!("invalid URL {url}: {e}")))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::ConnectFailed(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::ConnectFailed(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(url = %url, status = %response.status(), "WebSocket handshake completed");

        let (sink, stream) = stream.split();
        Ok(Connected {
            sink: Box::new(WebSocketSink { sink }),
            stream: Box::new(WebSocketConnStream { stream }),
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Outbound half of a WebSocket connection.
struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl ConnSink for WebSocketSink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

/// Inbound half of a WebSocket connection.
struct WebSocketConnStream {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl ConnStream for WebSocketConnStream {
    async fn next(&mut self) -> Result<Option<WireMessage>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(WireMessage::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(WireMessage::Binary(Bytes::from(data))));
                }
                // Pongs are queued by tungstenite; both directions are
                // invisible to the engine.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Received close frame");
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket receive error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => return Ok(None),
            }
        }
    }
}
