//! Application connections
//!
//! A [`Connection`] wraps one duplex byte stream to an application process.
//! Reading stays with the connection's own task; the write side is handed out
//! as an `Arc<ConnectionSender>` so invocations can be forwarded from other
//! tasks without touching the read loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::CodecError;
use crate::protocol::AppMessage;

/// Process-wide counter; ids are never handed out twice
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque identifier of an accepted application connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Mint a fresh id
    pub fn next() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of one application connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Transport is up, no registration yet
    Accepted,
    /// A well-formed registration was received; may own tools
    Registered,
    /// Terminal
    Disconnected,
}

impl ConnectionState {
    /// State after a well-formed registration message
    pub fn on_register(self) -> Self {
        match self {
            ConnectionState::Disconnected => ConnectionState::Disconnected,
            ConnectionState::Accepted | ConnectionState::Registered => ConnectionState::Registered,
        }
    }

    /// State after the peer closed or the transport failed
    pub fn on_close(self) -> Self {
        ConnectionState::Disconnected
    }

    pub fn can_own_tools(self) -> bool {
        self == ConnectionState::Registered
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Accepted => write!(f, "accepted"),
            ConnectionState::Registered => write!(f, "registered"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Write side of an application connection
pub struct ConnectionSender {
    id: ConnectionId,
    writer: FrameWriter<BoxedWriter>,
}

impl ConnectionSender {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send one framed message; concurrent callers are serialized
    pub async fn send(&self, message: &AppMessage) -> Result<(), CodecError> {
        self.writer.send(message).await
    }

    /// Close the write direction so the peer sees EOF
    pub async fn close(&self) -> Result<(), CodecError> {
        self.writer.shutdown().await
    }
}

/// A framed duplex stream to one application
pub struct Connection {
    id: ConnectionId,
    reader: FrameReader<BoxedReader>,
    sender: Arc<ConnectionSender>,
}

impl Connection {
    pub fn new<R, W>(id: ConnectionId, reader: R, writer: W, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            id,
            reader: FrameReader::with_limit(reader, max_frame_bytes),
            sender: Arc::new(ConnectionSender {
                id,
                writer: FrameWriter::new(writer),
            }),
        }
    }

    /// Wrap an accepted TCP stream under a freshly minted id
    pub fn from_tcp(stream: TcpStream, max_frame_bytes: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(ConnectionId::next(), read_half, write_half, max_frame_bytes)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn sender(&self) -> Arc<ConnectionSender> {
        Arc::clone(&self.sender)
    }

    /// Next framed value; `Ok(None)` on graceful close
    pub async fn read_message(&mut self) -> Result<Option<Value>, CodecError> {
        self.reader.read_message().await
    }

    /// Send one framed message
    pub async fn send(&self, message: &AppMessage) -> Result<(), CodecError> {
        self.sender.send(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CorrelationId;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_connection_ids_are_unique() {
        let ids: HashSet<ConnectionId> = (0..100).map(|_| ConnectionId::next()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId(42);
        assert_eq!(id.to_string(), "conn-42");
        assert_eq!(id.as_u64(), 42);
    }

    #[test]
    fn test_state_transitions() {
        let state = ConnectionState::Accepted;
        assert!(!state.can_own_tools());

        let state = state.on_register();
        assert_eq!(state, ConnectionState::Registered);
        assert!(state.can_own_tools());

        // re-registration keeps the connection registered
        assert_eq!(state.on_register(), ConnectionState::Registered);

        let state = state.on_close();
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(state.on_register(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_send_and_read() {
        let (proxy_side, app_side) = tokio::io::duplex(1024);
        let (proxy_read, proxy_write) = tokio::io::split(proxy_side);
        let (app_read, mut app_write) = tokio::io::split(app_side);

        let mut conn = Connection::new(ConnectionId::next(), proxy_read, proxy_write, 1024);

        conn.send(&AppMessage::ToolInvocation {
            correlation_id: CorrelationId(1),
            tool: "Ping".to_string(),
            parameters: Some(json!({})),
        })
        .await
        .unwrap();

        let mut lines = BufReader::new(app_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "toolInvocation");
        assert_eq!(value["correlationId"], 1);

        app_write
            .write_all(b"{\"type\":\"register\",\"appName\":\"Foo\"}\n")
            .await
            .unwrap();
        drop(app_write);

        let msg = conn.read_message().await.unwrap().unwrap();
        assert_eq!(msg["appName"], "Foo");
    }
}
