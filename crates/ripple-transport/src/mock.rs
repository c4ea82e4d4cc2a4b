//! In-memory transport for tests.
//!
//! [`MockTransport::pair`] returns the transport (handed to the engine) and
//! a [`MockServer`] the test drives: it accepts links as the engine
//! connects, reads the frames the engine writes, injects inbound frames,
//! and can drop the link or fail upcoming connect attempts to exercise
//! reconnection paths.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ripple_protocol::WireMessage;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{ConnSink, ConnStream, Connected, Transport, TransportError};

struct Shared {
    connect_attempts: AtomicU32,
    fail_budget: AtomicU32,
    link_tx: mpsc::UnboundedSender<MockLink>,
}

/// Test-side handle to one established link.
pub struct MockLink {
    from_client: mpsc::UnboundedReceiver<WireMessage>,
    to_client: Option<mpsc::UnboundedSender<WireMessage>>,
}

impl MockLink {
    /// Receive the next frame the client wrote.
    ///
    /// Returns `None` once the client closes its sink.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }

    /// Receive the next frame without waiting.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.from_client.try_recv().ok()
    }

    /// Inject an inbound frame toward the client.
    ///
    /// Frames sent after [`MockLink::disconnect`] are dropped.
    pub fn send(&self, message: WireMessage) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(message);
        }
    }

    /// Drop the link: the client's stream ends as a clean close.
    pub fn disconnect(&mut self) {
        self.to_client = None;
        self.from_client.close();
    }
}

/// Test-side handle to the transport as a whole.
pub struct MockServer {
    shared: Arc<Shared>,
    link_rx: mpsc::UnboundedReceiver<MockLink>,
}

impl MockServer {
    /// Wait for the next successful connect from the client.
    pub async fn accept(&mut self) -> MockLink {
        self.link_rx
            .recv()
            .await
            .expect("mock transport dropped while awaiting connect")
    }

    /// Total connect attempts, including failed ones.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_budget.store(n, Ordering::SeqCst);
    }
}

/// In-memory transport.
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Create a transport and the server handle driving it.
    #[must_use]
    pub fn pair() -> (Self, MockServer) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connect_attempts: AtomicU32::new(0),
            fail_budget: AtomicU32::new(0),
            link_tx,
        });

        (
            Self {
                shared: shared.clone(),
            },
            MockServer { shared, link_rx },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        url: &str,
        _headers: &[(String, String)],
    ) -> Result<Connected, TransportError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let budget = self.shared.fail_budget.load(Ordering::SeqCst);
        if budget > 0 {
            self.shared.fail_budget.store(budget - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed("mock connect failure".into()));
        }

        debug!(url = %url, "Mock transport connected");

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();

        let link = MockLink {
            from_client,
            to_client: Some(to_client),
        };
        self.shared
            .link_tx
            .send(link)
            .map_err(|_| TransportError::ConnectFailed("mock server dropped".into()))?;

        Ok(Connected {
            sink: Box::new(MockSink {
                tx: Some(client_tx),
            }),
            stream: Box::new(MockStream { rx: client_rx }),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockSink {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
}

#[async_trait]
impl ConnSink for MockSink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(message)
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl ConnStream for MockStream {
    async fn next(&mut self) -> Result<Option<WireMessage>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, mut server) = MockTransport::pair();

        let mut conn = transport.connect("mock://test", &[]).await.unwrap();
        let mut link = server.accept().await;

        conn.sink
            .send(WireMessage::Text("outbound".into()))
            .await
            .unwrap();
        assert_eq!(link.recv().await, Some(WireMessage::Text("outbound".into())));

        link.send(WireMessage::Text("inbound".into()));
        assert_eq!(
            conn.stream.next().await.unwrap(),
            Some(WireMessage::Text("inbound".into()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_ends_client_stream() {
        let (transport, mut server) = MockTransport::pair();

        let mut conn = transport.connect("mock://test", &[]).await.unwrap();
        let mut link = server.accept().await;

        link.disconnect();
        assert_eq!(conn.stream.next().await.unwrap(), None);
        assert!(conn
            .sink
            .send(WireMessage::Text("late".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_connects_are_counted() {
        let (transport, server) = MockTransport::pair();
        server.fail_next_connects(2);

        assert!(transport.connect("mock://test", &[]).await.is_err());
        assert!(transport.connect("mock://test", &[]).await.is_err());
        assert!(transport.connect("mock://test", &[]).await.is_ok());
        assert_eq!(server.connect_attempts(), 3);
    }
}
