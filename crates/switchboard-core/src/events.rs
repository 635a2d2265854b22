//! Event Sink Trait
//!
//! Decouples observability from the proxy logic. The server reports
//! lifecycle events (registrations, disconnects, tool calls) to an
//! [`EventSink`]; implementations log them, forward them to a channel, or
//! drop them.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::connection::ConnectionId;
use crate::protocol::CorrelationId;

/// Something observable happened inside the proxy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProxyEvent {
    AppRegistered {
        connection_id: ConnectionId,
        app_name: String,
        tool_count: usize,
        replaced: bool,
    },
    AppDisconnected {
        connection_id: ConnectionId,
        /// `None` if the connection never registered
        app_name: Option<String>,
        failed_calls: usize,
    },
    ToolCallStarted {
        correlation_id: CorrelationId,
        connection_id: ConnectionId,
        tool: String,
    },
    ToolCallFinished {
        correlation_id: CorrelationId,
        connection_id: ConnectionId,
        tool: String,
        outcome: String,
        duration_ms: u64,
    },
    CatalogChanged {
        tool_count: usize,
    },
}

impl ProxyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::AppRegistered { .. } => "app_registered",
            ProxyEvent::AppDisconnected { .. } => "app_disconnected",
            ProxyEvent::ToolCallStarted { .. } => "tool_call_started",
            ProxyEvent::ToolCallFinished { .. } => "tool_call_finished",
            ProxyEvent::CatalogChanged { .. } => "catalog_changed",
        }
    }
}

/// Event sink for emitting proxy events to listeners
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &ProxyEvent) -> Result<(), String>;
}

/// No-op event sink
#[derive(Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &ProxyEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Logs every event through `tracing`
#[derive(Default, Clone)]
pub struct TracingEventSink {
    /// Log the full event as JSON instead of a short summary
    pub json_output: bool,
}

impl TracingEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }
}

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &ProxyEvent) -> Result<(), String> {
        if self.json_output {
            let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
            info!(target: "switchboard::events", "{payload}");
        } else {
            info!(target: "switchboard::events", "{}", summarize(event));
        }
        Ok(())
    }
}

/// Forwards events into an unbounded channel
///
/// Lets embedders and tests await proxy state changes instead of polling.
#[derive(Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: &ProxyEvent) -> Result<(), String> {
        self.tx
            .send(event.clone())
            .map_err(|_| "event receiver dropped".to_string())
    }
}

fn summarize(event: &ProxyEvent) -> String {
    match event {
        ProxyEvent::AppRegistered {
            connection_id,
            app_name,
            tool_count,
            replaced,
        } => format!(
            "{} {} '{}' ({} tools)",
            connection_id,
            if *replaced { "re-registered" } else { "registered" },
            app_name,
            tool_count
        ),
        ProxyEvent::AppDisconnected {
            connection_id,
            app_name,
            failed_calls,
        } => format!(
            "{} disconnected ('{}', {} calls failed)",
            connection_id,
            app_name.as_deref().unwrap_or("-"),
            failed_calls
        ),
        ProxyEvent::ToolCallStarted {
            correlation_id,
            connection_id,
            tool,
        } => format!("call {correlation_id} → {tool} on {connection_id}"),
        ProxyEvent::ToolCallFinished {
            correlation_id,
            tool,
            outcome,
            duration_ms,
            ..
        } => format!("call {correlation_id} ← {tool}: {outcome} in {duration_ms}ms"),
        ProxyEvent::CatalogChanged { tool_count } => {
            format!("catalog changed ({tool_count} tools)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        assert!(sink
            .emit(&ProxyEvent::CatalogChanged { tool_count: 0 })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelEventSink::new();
        let event = ProxyEvent::CatalogChanged { tool_count: 3 };

        sink.emit(&event).await.unwrap();
        assert_eq!(rx.recv().await, Some(event));

        drop(rx);
        assert!(sink
            .emit(&ProxyEvent::CatalogChanged { tool_count: 1 })
            .await
            .is_err());
    }

    #[test]
    fn test_event_serialization() {
        let event = ProxyEvent::AppDisconnected {
            connection_id: ConnectionId::next(),
            app_name: Some("Foo".to_string()),
            failed_calls: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "app_disconnected");
        assert_eq!(json["app_name"], "Foo");
        assert_eq!(event.name(), "app_disconnected");
    }

    #[test]
    fn test_summarize() {
        let text = summarize(&ProxyEvent::ToolCallFinished {
            correlation_id: CorrelationId(4),
            connection_id: ConnectionId::next(),
            tool: "Ping".to_string(),
            outcome: "success".to_string(),
            duration_ms: 12,
        });
        assert_eq!(text, "call 4 ← Ping: success in 12ms");
    }
}
