//! Switchboard Core Library
//!
//! A tool-federation proxy. Independently running applications connect over
//! TCP and register the tools they implement; an AI agent talks to the proxy
//! over stdio and sees one merged tool catalog. Calls are routed to the
//! owning application and answered through request/response correlation.
//!
//! # Modules
//!
//! - [`protocol`] - Application messages and agent JSON-RPC types
//! - [`codec`] - Newline-delimited JSON framing
//! - [`connection`] - One application connection and its lifecycle
//! - [`registry`] - Live applications and their tool catalogs
//! - [`router`] - Catalog aggregation and tool name resolution
//! - [`correlator`] - Pending calls, timeouts and exactly-once resolution
//! - [`server`] - Listener, per-connection tasks and the agent loop
//! - [`events`] - Event sink trait for observing the proxy
//! - [`config`] - Proxy configuration
//! - [`error`] - Error types

pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

// Re-export commonly used types
pub use config::ProxyConfig;
pub use connection::ConnectionId;
pub use correlator::{CallOutcome, Correlator};
pub use error::{CodecError, ProtocolError, ProxyError, Result, RouteError};
pub use events::{ChannelEventSink, EventSink, NoOpEventSink, ProxyEvent, TracingEventSink};
pub use protocol::{AppMessage, CorrelationId, ToolDefinition, ToolResult};
pub use registry::{AppRecord, Registry};
pub use router::{CatalogEntry, Route};
pub use server::{ProxyHandle, ProxyServer};
