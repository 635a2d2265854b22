//! Wire protocol types
//!
//! Two protocols meet in the proxy:
//! - the application protocol (`register`, `toolResponse`, `toolInvocation`),
//!   one JSON object per line, tagged by its `type` field
//! - JSON-RPC 2.0 towards the agent, carrying the MCP `tools/*` methods

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// JSON-RPC error: parse error
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC error: invalid request
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error: method not found
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error: invalid params
pub const INVALID_PARAMS: i64 = -32602;
/// No connected application owns the requested tool
pub const TOOL_NOT_FOUND: i64 = -32001;
/// The requested name matches tools on more than one application
pub const TOOL_AMBIGUOUS: i64 = -32002;
/// The owning application did not answer in time
pub const TOOL_TIMEOUT: i64 = -32003;
/// The owning application went away before answering
pub const APP_DISCONNECTED: i64 = -32004;
/// The owning application answered with `success: false`
pub const TOOL_FAILED: i64 = -32005;

/// MCP protocol version reported when the agent does not request one
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Identifier minted per forwarded invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tool as declared by the application that owns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema-shaped object; forwarded as-is, never validated
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: default_input_schema(),
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Outcome of a tool execution as reported by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ToolResultWire", into = "ToolResultWire")]
pub enum ToolResult {
    Success { data: Option<Value> },
    Failure { error: String },
}

impl ToolResult {
    pub fn success(data: impl Into<Option<Value>>) -> Self {
        ToolResult::Success { data: data.into() }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ToolResult::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success { .. })
    }
}

/// Flat on-the-wire shape of [`ToolResult`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolResultWire {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl From<ToolResultWire> for ToolResult {
    fn from(wire: ToolResultWire) -> Self {
        if wire.success {
            ToolResult::Success { data: wire.data }
        } else {
            ToolResult::Failure {
                error: wire
                    .error
                    .unwrap_or_else(|| "application reported failure".to_string()),
            }
        }
    }
}

impl From<ToolResult> for ToolResultWire {
    fn from(result: ToolResult) -> Self {
        match result {
            ToolResult::Success { data } => ToolResultWire {
                success: true,
                data,
                error: None,
            },
            ToolResult::Failure { error } => ToolResultWire {
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

/// Messages exchanged with application processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AppMessage {
    /// app → proxy: declare identity and (re)place the tool catalog
    #[serde(rename_all = "camelCase")]
    Register {
        app_name: String,
        #[serde(default)]
        tools: Vec<ToolDefinition>,
    },

    /// app → proxy: result of a previously forwarded invocation
    #[serde(rename_all = "camelCase")]
    ToolResponse {
        correlation_id: CorrelationId,
        result: ToolResult,
    },

    /// proxy → app: execute a tool
    #[serde(rename_all = "camelCase")]
    ToolInvocation {
        correlation_id: CorrelationId,
        tool: String,
        parameters: Option<Value>,
    },
}

impl AppMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            AppMessage::Register { .. } => "register",
            AppMessage::ToolResponse { .. } => "toolResponse",
            AppMessage::ToolInvocation { .. } => "toolInvocation",
        }
    }

    /// Interpret a parsed frame from an application connection
    ///
    /// Separates "unknown type" from "known type with bad fields" so the
    /// caller can log them differently. Registration payloads are also
    /// checked for empty names here.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = match &value {
            Value::Object(map) => match map.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                Some(_) | None => return Err(ProtocolError::MissingType),
            },
            _ => return Err(ProtocolError::NotAnObject),
        };

        if !matches!(
            kind.as_str(),
            "register" | "toolResponse" | "toolInvocation"
        ) {
            return Err(ProtocolError::UnknownType(kind));
        }

        let message: AppMessage =
            serde_json::from_value(value).map_err(|e| ProtocolError::Invalid {
                kind: kind.clone(),
                reason: e.to_string(),
            })?;

        if let AppMessage::Register { app_name, tools } = &message {
            if app_name.trim().is_empty() {
                return Err(ProtocolError::Invalid {
                    kind,
                    reason: "appName must not be empty".to_string(),
                });
            }
            if app_name.contains([':', '#']) {
                return Err(ProtocolError::Invalid {
                    kind,
                    reason: format!("appName '{app_name}' must not contain ':' or '#'"),
                });
            }
            if let Some(index) = tools.iter().position(|t| t.name.trim().is_empty()) {
                return Err(ProtocolError::Invalid {
                    kind,
                    reason: format!("tool at index {index} has an empty name"),
                });
            }
            // ':' separates the app from the tool in namespaced names
            if let Some(tool) = tools.iter().find(|t| t.name.contains(':')) {
                return Err(ProtocolError::Invalid {
                    kind,
                    reason: format!("tool name '{}' must not contain ':'", tool.name),
                });
            }
        }

        Ok(message)
    }
}

/// JSON-RPC 2.0 Request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 Response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 Error structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// JSON-RPC 2.0 Notification structure (no id field)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: None,
        }
    }
}

/// What arrived on the agent channel
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    /// The agent answering something; the proxy never sends requests
    Response(Value),
    /// Carries the request id when one could be recovered
    Invalid(Option<Value>),
}

impl AgentMessage {
    pub fn classify(value: Value) -> Self {
        let Value::Object(map) = &value else {
            return AgentMessage::Invalid(None);
        };

        let id = map.get("id").cloned();
        match map.get("method") {
            Some(Value::String(method)) => {
                let params = map.get("params").cloned();
                match id {
                    Some(id) => AgentMessage::Request(JsonRpcRequest {
                        jsonrpc: "2.0".to_string(),
                        id,
                        method: method.clone(),
                        params,
                    }),
                    None => AgentMessage::Notification(JsonRpcNotification {
                        jsonrpc: "2.0".to_string(),
                        method: method.clone(),
                        params,
                    }),
                }
            }
            Some(_) => AgentMessage::Invalid(id),
            None if map.contains_key("result") || map.contains_key("error") => {
                AgentMessage::Response(value)
            }
            None => AgentMessage::Invalid(id),
        }
    }
}

/// `params` of a `tools/call` request
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// One content block of a tool call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// `result` of a successful `tools/call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ContentItem>,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// Render application data as MCP content
    ///
    /// A JSON string becomes the text verbatim; anything else is rendered as
    /// compact JSON and also kept as structured content.
    pub fn from_data(data: Option<Value>) -> Self {
        let text = match &data {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        Self {
            content: vec![ContentItem {
                kind: "text".to_string(),
                text,
            }],
            is_error: false,
            structured_content: data.filter(|d| !d.is_null()),
        }
    }
}
