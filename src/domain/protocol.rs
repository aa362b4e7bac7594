//! Remote agent wire protocol (A2A over JSON-RPC 2.0)
//!
//! Only the subset the host consumes: descriptor paths, `message/send`,
//! `message/stream` and `tasks/cancel`, plus parsing of the task, message,
//! status-update and artifact-update results into [`RemoteUpdate`]s.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::RemoteRequest;
use crate::error::DispatchError;

/// Path of the public descriptor relative to the agent's base address
pub const PUBLIC_CARD_PATH: &str = "/.well-known/agent.json";

/// Path of the authenticated extended descriptor
pub const EXTENDED_CARD_PATH: &str = "/agent/authenticatedExtendedCard";

pub const METHOD_SEND: &str = "message/send";
pub const METHOD_STREAM: &str = "message/stream";
pub const METHOD_CANCEL: &str = "tasks/cancel";

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: json!(id),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
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

    pub fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Unwraps the result, turning protocol errors into dispatch errors
    pub fn into_result(self) -> Result<Value, DispatchError> {
        if let Some(error) = self.error {
            return Err(error.into_dispatch_error());
        }
        self.result
            .ok_or_else(|| DispatchError::Protocol("response carries neither result nor error".into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A2A error codes that mean the agent refused the task
const TASK_NOT_CANCELABLE: i32 = -32002;
const PUSH_NOT_SUPPORTED: i32 = -32003;
const UNSUPPORTED_OPERATION: i32 = -32004;
const CONTENT_TYPE_NOT_SUPPORTED: i32 = -32005;
const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;

impl JsonRpcError {
    pub fn into_dispatch_error(self) -> DispatchError {
        match self.code {
            TASK_NOT_CANCELABLE | PUSH_NOT_SUPPORTED | UNSUPPORTED_OPERATION
            | CONTENT_TYPE_NOT_SUPPORTED | INVALID_PARAMS | METHOD_NOT_FOUND => {
                DispatchError::Rejected(format!("[{}] {}", self.code, self.message))
            }
            _ => DispatchError::RemoteFailed(format!("[{}] {}", self.code, self.message)),
        }
    }
}

/// Builds `message/send` / `message/stream` params for a request
pub fn message_params(request: &RemoteRequest) -> Value {
    let mut message = json!({
        "role": "user",
        "kind": "message",
        "parts": [{ "kind": "text", "text": request.text }],
        "messageId": request.message_id,
    });
    if let Some(task_id) = &request.task_id {
        message["taskId"] = json!(task_id);
    }
    if let Some(context_id) = &request.context_id {
        message["contextId"] = json!(context_id);
    }
    json!({ "message": message })
}

/// Remote task lifecycle state as reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
    Rejected,
    AuthRequired,
    #[serde(other)]
    Unknown,
}

impl RemoteTaskState {
    /// States after which the remote produces nothing more for this request
    pub fn ends_exchange(self) -> bool {
        matches!(
            self,
            RemoteTaskState::InputRequired
                | RemoteTaskState::AuthRequired
                | RemoteTaskState::Completed
                | RemoteTaskState::Canceled
                | RemoteTaskState::Failed
                | RemoteTaskState::Rejected
        )
    }

    /// States where the remote task can be continued by a later turn
    pub fn awaits_input(self) -> bool {
        matches!(self, RemoteTaskState::InputRequired | RemoteTaskState::AuthRequired)
    }
}

/// One update received from a remote agent, normalised across result kinds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub task_id: Option<String>,
    pub context_id: Option<String>,
    pub state: Option<RemoteTaskState>,
    /// Text carried by this update, if any
    pub text: Option<String>,
    /// Remote marked this as the last update of the exchange
    pub last: bool,
}

impl RemoteUpdate {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn status(state: RemoteTaskState) -> Self {
        Self {
            state: Some(state),
            last: state.ends_exchange(),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>, context_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn finished(mut self) -> Self {
        self.last = true;
        self
    }

    /// Parses one JSON-RPC `result` value
    pub fn from_result(result: &Value) -> Result<Self, DispatchError> {
        let kind = result
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_else(|| infer_kind(result));

        let task_id = string_field(result, "taskId");
        let context_id = string_field(result, "contextId");

        match kind {
            "task" => {
                let state = status_state(result);
                let artifact_text = result
                    .get("artifacts")
                    .and_then(Value::as_array)
                    .map(|artifacts| {
                        artifacts
                            .iter()
                            .filter_map(|a| parts_text(a.get("parts")))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .filter(|t| !t.is_empty());
                let text = artifact_text.or_else(|| status_message_text(result));
                Ok(Self {
                    task_id: string_field(result, "id"),
                    context_id,
                    state,
                    text,
                    last: state.map_or(true, RemoteTaskState::ends_exchange),
                })
            }
            "message" => Ok(Self {
                task_id,
                context_id,
                state: None,
                text: parts_text(result.get("parts")),
                last: true,
            }),
            "status-update" => {
                let state = status_state(result);
                let last = result.get("final").and_then(Value::as_bool).unwrap_or(false)
                    || state.map_or(false, RemoteTaskState::ends_exchange);
                Ok(Self {
                    task_id,
                    context_id,
                    state,
                    text: status_message_text(result),
                    last,
                })
            }
            "artifact-update" => Ok(Self {
                task_id,
                context_id,
                state: None,
                text: parts_text(result.get("artifact").and_then(|a| a.get("parts"))),
                last: false,
            }),
            other => Err(DispatchError::Protocol(format!("unknown result kind '{}'", other))),
        }
    }
}

fn infer_kind(result: &Value) -> &'static str {
    if result.get("artifact").is_some() {
        "artifact-update"
    } else if result.get("final").is_some() {
        "status-update"
    } else if result.get("status").is_some() {
        "task"
    } else {
        "message"
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn status_state(value: &Value) -> Option<RemoteTaskState> {
    value
        .get("status")
        .and_then(|s| s.get("state"))
        .and_then(|s| serde_json::from_value(s.clone()).ok())
}

fn status_message_text(value: &Value) -> Option<String> {
    value
        .get("status")
        .and_then(|s| s.get("message"))
        .and_then(|m| parts_text(m.get("parts")))
}

fn parts_text(parts: Option<&Value>) -> Option<String> {
    let text = parts?
        .as_array()?
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
