//! Federation proxy server
//!
//! Owns the application listener and the agent channel, and wires the
//! [`Registry`], router and [`Correlator`] together:
//!
//! - one task accepts application connections
//! - one task per application connection reads its frames in order
//! - the agent loop reads JSON-RPC requests from stdio; every `tools/call`
//!   waits for its result on its own task, so calls can overlap
//! - a maintenance task expires overdue calls and evicts old records
//!
//! Tasks share state only through the registry, the correlator and the
//! table of connection senders. No lock is held while writing to a socket.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::config::ProxyConfig;
use crate::connection::{BoxedReader, BoxedWriter, Connection, ConnectionId, ConnectionSender, ConnectionState};
use crate::correlator::{CallOutcome, Correlator, ResolveStatus};
use crate::error::{ProtocolError, ProxyError, Result, RouteError};
use crate::events::{EventSink, NoOpEventSink, ProxyEvent};
use crate::protocol::{
    AgentMessage, AppMessage, CallToolResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ToolCallParams, ToolResult, APP_DISCONNECTED,
    DEFAULT_PROTOCOL_VERSION, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, TOOL_AMBIGUOUS,
    TOOL_FAILED, TOOL_NOT_FOUND, TOOL_TIMEOUT,
};
use crate::registry::{RegisterOutcome, Registry};

type AgentWriter = Arc<FrameWriter<BoxedWriter>>;

const DISCONNECT_REASON: &str = "application disconnected";

/// State shared by every task of one server
struct Shared {
    config: ProxyConfig,
    registry: Registry,
    correlator: Correlator,
    /// Write halves of live application connections
    peers: RwLock<HashMap<ConnectionId, Arc<ConnectionSender>>>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    connection_slots: Arc<Semaphore>,
    catalog_changed: Notify,
}

impl Shared {
    fn new(config: ProxyConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            registry: Registry::new(),
            correlator: Correlator::new(config.call_timeout()),
            peers: RwLock::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            catalog_changed: Notify::new(),
            config,
        }
    }
}

/// A bound, not yet running proxy
pub struct ProxyServer {
    shared: Arc<Shared>,
    listener: TcpListener,
}

/// Cheap handle for observing and stopping a running server
#[derive(Clone)]
pub struct ProxyHandle {
    shared: Arc<Shared>,
}

impl ProxyHandle {
    /// Begin graceful shutdown
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn correlator(&self) -> &Correlator {
        &self.shared.correlator
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }
}

impl ProxyServer {
    /// Bind the application listener with events discarded
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        Self::bind_with_events(config, Arc::new(NoOpEventSink)).await
    }

    /// Bind the application listener, reporting events to `events`
    pub async fn bind_with_events(config: ProxyConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        info!("Application listener bound to {}", listener.local_addr()?);

        Ok(Self {
            shared: Arc::new(Shared::new(config, events)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Serve with the process's stdin/stdout as the agent channel
    pub async fn serve_stdio(self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run until the agent channel closes or shutdown is requested
    ///
    /// On return the listener is closed, every application connection has
    /// been closed, and in-flight calls have been answered, unless the
    /// shutdown deadline elapsed first.
    pub async fn serve<R, W>(self, agent_in: R, agent_out: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let Self { shared, listener } = self;

        shared
            .tasks
            .spawn(accept_loop(Arc::clone(&shared), listener));
        shared.tasks.spawn(maintenance_loop(Arc::clone(&shared)));

        let reader: BoxedReader = Box::new(agent_in);
        let writer: BoxedWriter = Box::new(agent_out);
        let writer: AgentWriter = Arc::new(FrameWriter::new(writer));

        let result = run_agent(&shared, reader, Arc::clone(&writer)).await;

        info!("Shutting down");
        shared.shutdown.cancel();
        shared.tasks.close();
        if tokio::time::timeout(shared.config.shutdown_timeout(), shared.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "Shutdown deadline of {:?} elapsed with {} tasks still running",
                shared.config.shutdown_timeout(),
                shared.tasks.len()
            );
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Closing agent channel: {}", e);
        }

        result
    }
}

// === Application side ===

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!("Application listener shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let permit = match Arc::clone(&shared.connection_slots).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(
                                    "Connection limit of {} reached; rejecting {}",
                                    shared.config.max_connections, addr
                                );
                                drop(stream);
                                continue;
                            }
                        };
                        if let Err(e) = stream.set_nodelay(true) {
                            trace!("set_nodelay failed for {}: {}", addr, e);
                        }
                        let conn = Connection::from_tcp(stream, shared.config.max_frame_bytes);
                        info!("Application connected from {} as {}", addr, conn.id());
                        shared
                            .tasks
                            .spawn(run_connection(Arc::clone(&shared), conn, permit));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

async fn run_connection(shared: Arc<Shared>, mut conn: Connection, _permit: OwnedSemaphorePermit) {
    let id = conn.id();
    let sender = conn.sender();
    shared.peers.write().await.insert(id, Arc::clone(&sender));

    let mut state = ConnectionState::Accepted;
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                debug!("Closing {} for shutdown", id);
                break;
            }
            frame = conn.read_message() => frame,
        };

        match frame {
            Ok(Some(value)) => {
                state = handle_app_message(&shared, id, state, value).await;
            }
            Ok(None) => {
                info!("{} closed the connection", id);
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("{}: dropping message: {}", id, e);
            }
            Err(e) => {
                warn!("{}: transport error: {}", id, e);
                break;
            }
        }
    }

    state = state.on_close();
    debug!("{} is now {}", id, state);
    disconnect(&shared, id).await;
    if let Err(e) = sender.close().await {
        trace!("{}: close failed: {}", id, e);
    }
}

async fn handle_app_message(
    shared: &Shared,
    id: ConnectionId,
    state: ConnectionState,
    value: Value,
) -> ConnectionState {
    if state.can_own_tools() {
        shared.registry.touch(id).await;
    }

    match AppMessage::from_value(value) {
        Ok(AppMessage::Register { app_name, tools }) => {
            let outcome = shared
                .registry
                .register(id, app_name.clone(), tools)
                .await;
            let tool_count = shared
                .registry
                .get(id)
                .await
                .map(|record| record.tools.len())
                .unwrap_or(0);
            emit(
                shared,
                ProxyEvent::AppRegistered {
                    connection_id: id,
                    app_name,
                    tool_count,
                    replaced: matches!(outcome, RegisterOutcome::Replaced { .. }),
                },
            )
            .await;
            catalog_changed(shared).await;
            state.on_register()
        }
        Ok(AppMessage::ToolResponse {
            correlation_id,
            result,
        }) => {
            if !state.can_own_tools() {
                warn!(
                    "{} sent toolResponse for call {} before registering; ignored",
                    id, correlation_id
                );
                return state;
            }
            let status = shared.correlator.resolve(id, correlation_id, result);
            if status != ResolveStatus::Resolved {
                debug!("{}: toolResponse for call {}: {}", id, correlation_id, status);
            }
            state
        }
        Ok(AppMessage::ToolInvocation { .. }) => {
            warn!("{} sent a toolInvocation, which only flows towards applications; ignored", id);
            state
        }
        Err(ProtocolError::UnknownType(kind)) => {
            warn!("{} ({}): unknown message type '{}'; ignored", id, state, kind);
            state
        }
        Err(e) => {
            warn!("{}: dropping message: {}", id, e);
            state
        }
    }
}

/// Tear down everything that depended on a connection
///
/// The sender is removed first: a call that finds no sender fails itself,
/// and a call that found one is registered before `fail_all_for` runs.
async fn disconnect(shared: &Shared, id: ConnectionId) {
    shared.peers.write().await.remove(&id);
    let was_registered = shared.registry.unregister(id).await;
    let failed_calls = shared.correlator.fail_all_for(id, DISCONNECT_REASON);
    let app_name = shared.registry.get(id).await.map(|record| record.name);

    emit(
        shared,
        ProxyEvent::AppDisconnected {
            connection_id: id,
            app_name,
            failed_calls,
        },
    )
    .await;
    if was_registered {
        catalog_changed(shared).await;
    }
}

async fn catalog_changed(shared: &Shared) {
    let tool_count = shared.registry.all_tools().await.len();
    emit(shared, ProxyEvent::CatalogChanged { tool_count }).await;
    shared.catalog_changed.notify_one();
}

async fn maintenance_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.sweep_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let expired = shared.correlator.expire_overdue();
                if expired > 0 {
                    debug!("Expired {} overdue calls", expired);
                }
                shared
                    .registry
                    .evict_disconnected(shared.config.disconnected_retention())
                    .await;
            }
        }
    }
}

async fn emit(shared: &Shared, event: ProxyEvent) {
    if let Err(e) = shared.events.emit(&event).await {
        debug!("Event sink rejected {}: {}", event.name(), e);
    }
}

// === Agent side ===

async fn run_agent(shared: &Arc<Shared>, reader: BoxedReader, writer: AgentWriter) -> Result<()> {
    let mut reader = FrameReader::with_limit(reader, shared.config.max_frame_bytes);
    let mut initialized = false;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!("Shutdown requested; leaving agent loop");
                return Ok(());
            }
            _ = shared.catalog_changed.notified(), if initialized => {
                let notification = JsonRpcNotification::new("notifications/tools/list_changed");
                send_to_agent(shared, &writer, &notification).await;
            }
            frame = reader.read_message() => {
                match frame {
                    Ok(Some(value)) => {
                        handle_agent_message(shared, &writer, value, &mut initialized).await;
                    }
                    Ok(None) => {
                        info!("Agent closed the channel");
                        return Ok(());
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!("Dropping agent message: {}", e);
                    }
                    Err(e) => {
                        error!("Agent channel failed: {}", e);
                        return Err(ProxyError::AgentChannel(e));
                    }
                }
            }
        }
    }
}

async fn handle_agent_message(
    shared: &Arc<Shared>,
    writer: &AgentWriter,
    value: Value,
    initialized: &mut bool,
) {
    match AgentMessage::classify(value) {
        AgentMessage::Request(request) => {
            debug!("Agent request {}: {}", request.id, request.method);
            handle_request(shared, writer, request, initialized).await;
        }
        AgentMessage::Notification(notification) => {
            if notification.method == "notifications/initialized" {
                *initialized = true;
            } else {
                debug!("Ignoring agent notification {}", notification.method);
            }
        }
        AgentMessage::Response(value) => {
            debug!("Ignoring response from agent: {}", value);
        }
        AgentMessage::Invalid(Some(id)) => {
            let response =
                JsonRpcResponse::failure(id, JsonRpcError::new(INVALID_REQUEST, "Invalid Request"));
            send_to_agent(shared, writer, &response).await;
        }
        AgentMessage::Invalid(None) => {
            warn!("Dropping agent message that is not a JSON-RPC request");
        }
    }
}

async fn handle_request(
    shared: &Arc<Shared>,
    writer: &AgentWriter,
    request: JsonRpcRequest,
    initialized: &mut bool,
) {
    let JsonRpcRequest {
        id, method, params, ..
    } = request;

    let response = match method.as_str() {
        "initialize" => {
            *initialized = true;
            JsonRpcResponse::success(id, initialize_result(params.as_ref()))
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => {
            let tools: Vec<_> = shared
                .registry
                .all_tools()
                .await
                .iter()
                .map(|entry| entry.to_listing())
                .collect();
            JsonRpcResponse::success(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            // Waiting happens off the read loop so later requests keep flowing
            let shared_for_call = Arc::clone(shared);
            let writer = Arc::clone(writer);
            shared.tasks.spawn(async move {
                let response = match call_tool(&shared_for_call, params).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(error) => JsonRpcResponse::failure(id, error),
                };
                send_to_agent(&shared_for_call, &writer, &response).await;
            });
            return;
        }
        other => {
            debug!("Unknown agent method {}", other);
            JsonRpcResponse::failure(id, JsonRpcError::new(METHOD_NOT_FOUND, "Method not found"))
        }
    };

    send_to_agent(shared, writer, &response).await;
}

fn initialize_result(params: Option<&Value>) -> Value {
    let version = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": { "tools": { "listChanged": true } },
        "serverInfo": {
            "name": "switchboard",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Route, forward and await one `tools/call`
async fn call_tool(shared: &Shared, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
    let params: ToolCallParams = params
        .and_then(|p| serde_json::from_value(p).ok())
        .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "Invalid params: expected {name, arguments}"))?;

    let arguments = match params.arguments {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(Value::Object(map)),
        Some(_) => {
            return Err(JsonRpcError::new(
                INVALID_PARAMS,
                "Invalid params: arguments must be an object",
            ))
        }
    };

    let route = shared
        .registry
        .find_owner(&params.name)
        .await
        .map_err(route_error)?;

    let call = shared
        .correlator
        .begin_call(route.connection_id, route.tool_name.clone());
    let correlation_id = call.id();
    let started = Instant::now();
    emit(
        shared,
        ProxyEvent::ToolCallStarted {
            correlation_id,
            connection_id: route.connection_id,
            tool: params.name.clone(),
        },
    )
    .await;

    let peer = shared.peers.read().await.get(&route.connection_id).cloned();
    match peer {
        Some(peer) => {
            let invocation = AppMessage::ToolInvocation {
                correlation_id,
                tool: route.tool_name.clone(),
                parameters: arguments,
            };
            if let Err(e) = peer.send(&invocation).await {
                warn!(
                    "Forwarding call {} to {} failed: {}",
                    correlation_id, route.connection_id, e
                );
                shared.correlator.fail(
                    correlation_id,
                    CallOutcome::Disconnected {
                        reason: format!("send failed: {e}"),
                    },
                );
            }
        }
        None => {
            shared.correlator.fail(
                correlation_id,
                CallOutcome::Disconnected {
                    reason: "connection closed before forwarding".to_string(),
                },
            );
        }
    }

    let outcome = shared.correlator.wait(call).await;
    emit(
        shared,
        ProxyEvent::ToolCallFinished {
            correlation_id,
            connection_id: route.connection_id,
            tool: params.name,
            outcome: outcome.label().to_string(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        },
    )
    .await;

    outcome_to_reply(outcome)
}

fn route_error(err: RouteError) -> JsonRpcError {
    let code = match err {
        RouteError::NotFound(_) => TOOL_NOT_FOUND,
        RouteError::Ambiguous { .. } => TOOL_AMBIGUOUS,
    };
    JsonRpcError::new(code, err.to_string())
}

fn outcome_to_reply(outcome: CallOutcome) -> std::result::Result<Value, JsonRpcError> {
    match outcome {
        CallOutcome::Completed(ToolResult::Success { data }) => {
            serde_json::to_value(CallToolResult::from_data(data))
                .map_err(|e| JsonRpcError::new(TOOL_FAILED, format!("unrenderable result: {e}")))
        }
        CallOutcome::Completed(ToolResult::Failure { error }) => {
            Err(JsonRpcError::new(TOOL_FAILED, error))
        }
        CallOutcome::TimedOut { after } => Err(JsonRpcError::new(
            TOOL_TIMEOUT,
            format!("tool call timed out after {}ms", after.as_millis()),
        )),
        CallOutcome::Disconnected { reason } => {
            let mut error = JsonRpcError::new(APP_DISCONNECTED, DISCONNECT_REASON);
            error.data = Some(json!({ "reason": reason }));
            Err(error)
        }
    }
}

/// Write to the agent; a failed write means the agent is gone
async fn send_to_agent<T: Serialize + ?Sized>(shared: &Shared, writer: &AgentWriter, message: &T) {
    if let Err(e) = writer.send(message).await {
        error!("Failed to write to agent: {}", e);
        shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolDefinition;
    use std::time::Duration;

    #[test]
    fn test_route_error_codes() {
        let not_found = route_error(RouteError::NotFound("Nope".to_string()));
        assert_eq!(not_found.code, TOOL_NOT_FOUND);
        assert_eq!(not_found.message, "tool not found: Nope");

        let ambiguous = route_error(RouteError::Ambiguous {
            name: "Reset".to_string(),
            candidates: vec!["A:Reset".to_string(), "B:Reset".to_string()],
        });
        assert_eq!(ambiguous.code, TOOL_AMBIGUOUS);
        assert!(ambiguous.message.contains("ambiguous"));
    }

    #[test]
    fn test_outcome_replies_are_distinguishable() {
        let ok = outcome_to_reply(CallOutcome::Completed(ToolResult::success(json!("pong")))).unwrap();
        assert_eq!(ok["content"][0]["text"], "pong");

        let failed = outcome_to_reply(CallOutcome::Completed(ToolResult::failure("boom"))).unwrap_err();
        assert_eq!(failed.code, TOOL_FAILED);
        assert_eq!(failed.message, "boom");

        let timeout = outcome_to_reply(CallOutcome::TimedOut {
            after: Duration::from_millis(250),
        })
        .unwrap_err();
        assert_eq!(timeout.code, TOOL_TIMEOUT);
        assert_eq!(timeout.message, "tool call timed out after 250ms");

        let gone = outcome_to_reply(CallOutcome::Disconnected {
            reason: "send failed".to_string(),
        })
        .unwrap_err();
        assert_eq!(gone.code, APP_DISCONNECTED);
        assert_eq!(gone.data, Some(json!({"reason": "send failed"})));
    }

    #[test]
    fn test_initialize_echoes_protocol_version() {
        let result = initialize_result(Some(&json!({"protocolVersion": "2025-03-26"})));
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);

        let result = initialize_result(None);
        assert_eq!(result["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "switchboard");
    }

    #[tokio::test]
    async fn test_failed_forward_reports_disconnect() {
        let (sink, mut events) = crate::events::ChannelEventSink::new();
        let shared = Shared::new(ProxyConfig::new(), Arc::new(sink));

        // peer half already gone, so the first write fails
        let (ours, theirs) = tokio::io::duplex(64);
        drop(theirs);
        let id = ConnectionId::next();
        let conn = Connection::new(id, tokio::io::empty(), ours, 1024);
        shared.peers.write().await.insert(id, conn.sender());
        shared
            .registry
            .register(id, "Foo".to_string(), vec![ToolDefinition::new("Ping", "")])
            .await;

        let err = call_tool(&shared, Some(json!({"name": "Ping", "arguments": {}})))
            .await
            .unwrap_err();
        assert_eq!(err.code, APP_DISCONNECTED);
        let reason = err.data.unwrap()["reason"].as_str().unwrap().to_string();
        assert!(reason.starts_with("send failed"), "{reason}");
        assert_eq!(shared.correlator.in_flight(), 0);

        assert!(matches!(events.recv().await, Some(ProxyEvent::ToolCallStarted { .. })));
        assert!(matches!(
            events.recv().await,
            Some(ProxyEvent::ToolCallFinished { ref outcome, .. }) if outcome == "disconnected"
        ));
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ProxyConfig::new()
            .with_listen_addr("127.0.0.1:0")
            .with_max_connections(0);
        assert!(matches!(
            ProxyServer::bind(config).await,
            Err(ProxyError::InvalidConfig(_))
        ));
    }
}
