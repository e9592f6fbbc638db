//! JSON-RPC 2.0 envelopes.
//!
//! # Message Types
//!
//! - **Request**: a message expecting exactly one response (has `id`)
//! - **Response**: a reply to a request (`result` XOR `error`)
//! - **Notification**: a one-way message (no `id`, no response expected)
//!
//! A frame may also carry a batch: a non-empty array of the above.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of the `jsonrpc` member.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A request, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Must be "2.0".
    pub jsonrpc: String,

    /// Unique request identifier.
    pub id: RequestId,

    /// The method to invoke.
    pub method: String,

    /// Optional parameters for the method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Creates a new request.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A notification, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Must be "2.0".
    pub jsonrpc: String,

    /// The notification method.
    pub method: String,

    /// Optional parameters for the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// The payload of a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Successful result.
    #[serde(rename = "result")]
    Result(Value),
    /// Error object.
    #[serde(rename = "error")]
    Error(ResponseError),
}

/// A response, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Always "2.0".
    pub jsonrpc: String,

    /// The request ID this response corresponds to; `null` when it could
    /// not be determined (parse errors).
    pub id: Option<RequestId>,

    /// Result or error.
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            outcome: Outcome::Result(result),
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: Outcome::Error(error),
        }
    }

    /// Creates a response from a handler result.
    #[must_use]
    pub fn from_result(id: RequestId, result: Result<Value, ResponseError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(error) => Self::error(Some(id), error),
        }
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error() -> Self {
        Self::error(None, ResponseError::from_code(ErrorCode::ParseError))
    }

    /// Creates an invalid request error response.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::error(
            id,
            ResponseError::with_message(ErrorCode::InvalidRequest, message),
        )
    }

    /// Returns the error object, if this is an error response.
    #[must_use]
    pub const fn error_object(&self) -> Option<&ResponseError> {
        match &self.outcome {
            Outcome::Error(e) => Some(e),
            Outcome::Result(_) => None,
        }
    }
}

/// JSON-RPC 2.0 and LSP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// A request arrived before the initialisation handshake.
    ServerNotInitialized,
    /// The request was syntactically valid but failed.
    RequestFailed,
    /// The request was cancelled by the peer or by shutdown.
    RequestCancelled,
    /// Server-defined error.
    ServerError(i32),
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerNotInitialized => -32002,
            Self::RequestFailed => -32803,
            Self::RequestCancelled => -32800,
            Self::ServerError(code) => code,
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ServerNotInitialized => "Server not initialized",
            Self::RequestFailed => "Request failed",
            Self::RequestCancelled => "Request cancelled",
            Self::ServerError(_) => "Server error",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Creates a method not found error.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::with_message(ErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }

    /// Creates an invalid params error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InvalidParams, message)
    }

    /// Returns true if this error reports a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::RequestCancelled.code()
    }
}

/// A single decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request expecting a response.
    Request(Request),
    /// A notification (no response expected).
    Notification(Notification),
    /// A response to one of our own requests.
    Response(Response),
}

impl Message {
    /// Serialises the message into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload fails to serialise.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Request(req) => serde_json::to_value(req),
            Self::Notification(notif) => serde_json::to_value(notif),
            Self::Response(resp) => serde_json::to_value(resp),
        }
    }
}

/// The decoded content of one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A single message.
    Single(Message),
    /// A batch. Entries that failed to decode keep their position as the
    /// error response to emit.
    Batch(Vec<Result<Message, Response>>),
}

/// Parses a frame body into a single message or a batch.
///
/// # Errors
///
/// Returns the error response to send when the body is not valid JSON, is an
/// empty batch, or is a single invalid message.
pub fn parse_message(body: &[u8]) -> Result<Incoming, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|_| Response::parse_error())?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(Response::invalid_request(None, "empty batch"));
            }
            Ok(Incoming::Batch(items.into_iter().map(classify).collect()))
        }
        other => classify(other).map(Incoming::Single),
    }
}

/// Classifies one JSON value as request, notification or response.
fn classify(value: Value) -> Result<Message, Response> {
    let Some(obj) = value.as_object() else {
        return Err(Response::invalid_request(None, "message must be an object"));
    };

    let id = obj
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(Response::invalid_request(
            id,
            "jsonrpc field must be \"2.0\"",
        ));
    }

    match (obj.contains_key("method"), obj.contains_key("id")) {
        (true, true) => {
            let request: Request = serde_json::from_value(value)
                .map_err(|e| Response::invalid_request(id.clone(), e.to_string()))?;
            if request.method.is_empty() {
                return Err(Response::invalid_request(
                    Some(request.id),
                    "method field cannot be empty",
                ));
            }
            Ok(Message::Request(request))
        }
        (true, false) => serde_json::from_value(value)
            .map(Message::Notification)
            .map_err(|e| Response::invalid_request(None, e.to_string())),
        (false, true) if obj.contains_key("result") || obj.contains_key("error") => {
            serde_json::from_value(value)
                .map(Message::Response)
                .map_err(|e| Response::invalid_request(id, e.to_string()))
        }
        _ => Err(Response::invalid_request(id, "not a request, response or notification")),
    }
}
