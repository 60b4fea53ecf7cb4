//! JSON-RPC 2.0 message model.
//!
//! Every inbound unit passes through this module before it reaches dispatch:
//!
//! - [`Payload::from_body`] checks the top level (one object, or a batch of
//!   1..=N objects).
//! - [`Request::parse`] validates one request object and normalizes `params`.
//! - [`Frame::classify`] sorts a frame received on a transport into a call,
//!   a subscription publish, or a success/error response.

use crate::config::RpcConfig;
use crate::error::TandemError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Correlation id of a call.
///
/// Numbers and strings are distinct id spaces: `1` never matches `"1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Extract an id from a raw JSON value.
    ///
    /// Only strings and integers are usable ids; `null`, floats, objects and
    /// arrays yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(RequestId::String(s.clone())),
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

impl Request {
    /// Create an outbound request.
    pub fn new(id: &RequestId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.to_value(),
        }
    }

    /// Validate one inbound request object.
    ///
    /// A request is valid when it is an object, `jsonrpc` is `"2.0"` and
    /// `method` is a non-empty string. On failure the returned error response
    /// carries the item's id when it is a usable id, `null` otherwise.
    ///
    /// `params` is normalized: absent becomes `[]`, an array is kept, any
    /// other value becomes a one-element sequence.
    pub fn parse(item: Value) -> Result<Request, Response> {
        let mut obj = match item {
            Value::Object(obj) => obj,
            _ => return Err(Response::invalid_request(None)),
        };

        let id = obj.remove("id").unwrap_or(Value::Null);
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(RpcConfig::JSONRPC_VERSION) {
            return Err(Response::invalid_request(usable_id(&id)));
        }

        let method = match obj.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => return Err(Response::invalid_request(usable_id(&id))),
        };

        let params = match obj.remove("params") {
            None => Vec::new(),
            Some(Value::Array(params)) => params,
            Some(other) => vec![other],
        };

        Ok(Request {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            method,
            params,
            id,
        })
    }

    /// The correlation id, when the request carries a usable one.
    pub fn request_id(&self) -> Option<RequestId> {
        RequestId::from_value(&self.id)
    }
}

fn usable_id(id: &Value) -> Option<Value> {
    RequestId::from_value(id).map(|_| id.clone())
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Option<Value>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: id.filter(|id| !id.is_null()),
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id: id.filter(|id| !id.is_null()),
        }
    }

    /// The `-32600` response for a malformed payload or batch item.
    pub fn invalid_request(id: Option<Value>) -> Self {
        Self::error(id, ErrorObject::invalid_request())
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Code used when a handler failure does not name one.
    pub const APPLICATION: i64 = 1;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// An application error with the default code.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(Self::APPLICATION, message)
    }

    pub fn invalid_request() -> Self {
        Self::new(Self::INVALID_REQUEST, "Invalid Request")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, message)
    }

    /// Read an error object sent by a peer, tolerating missing members.
    fn from_wire(value: Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64).unwrap_or(Self::APPLICATION);
        let message = match value.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => value.to_string(),
        };
        Self {
            code,
            message,
            data: value.get("data").cloned(),
        }
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl From<&str> for ErrorObject {
    fn from(message: &str) -> Self {
        ErrorObject::application(message)
    }
}

impl From<String> for ErrorObject {
    fn from(message: String) -> Self {
        ErrorObject::application(message)
    }
}

impl From<serde_json::Error> for ErrorObject {
    fn from(err: serde_json::Error) -> Self {
        ErrorObject::application(err.to_string())
    }
}

impl From<TandemError> for ErrorObject {
    fn from(err: TandemError) -> Self {
        match err {
            TandemError::Remote {
                code,
                message,
                data,
            } => ErrorObject {
                code,
                message,
                data,
            },
            other => ErrorObject::application(other.to_string()),
        }
    }
}

impl From<ErrorObject> for TandemError {
    fn from(err: ErrorObject) -> Self {
        TandemError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Top-level shape of an inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Value),
    Batch(Vec<Value>),
}

impl Payload {
    /// Check the top level of an inbound body.
    ///
    /// Accepts one object, or a non-empty array of at most `max_batch` items.
    /// Anything else (null, scalars, empty or oversized arrays) yields the
    /// single `-32600` response with a null id.
    pub fn from_body(body: Value, max_batch: usize) -> Result<Payload, Response> {
        match body {
            Value::Object(_) => Ok(Payload::Single(body)),
            Value::Array(items) if !items.is_empty() && items.len() <= max_batch => {
                Ok(Payload::Batch(items))
            }
            _ => Err(Response::invalid_request(None)),
        }
    }
}

/// Reply to an inbound payload; its cardinality mirrors the payload's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Single(Response),
    Batch(Vec<Response>),
}

impl Reply {
    pub fn into_value(self) -> Value {
        // Serializing plain data structs into a Value cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A subscription notification: a call to the reserved `"subscription"`
/// method carrying a token and a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    /// Raw id of the carrying call, echoed in the acknowledgement.
    pub id: Value,
    pub subscription: String,
    pub result: Value,
}

impl Publication {
    /// Build the params of a publish call.
    pub fn params(subscription: &str, result: Value) -> Vec<Value> {
        let mut body = Map::new();
        body.insert("subscription".to_string(), Value::String(subscription.to_string()));
        body.insert("result".to_string(), result);
        vec![Value::Object(body)]
    }

    fn parse(obj: &Map<String, Value>) -> Option<Self> {
        let body = match obj.get("params")? {
            Value::Array(items) if items.len() == 1 => &items[0],
            params @ Value::Object(_) => params,
            _ => return None,
        };
        let subscription = body.get("subscription")?.as_str()?.to_string();

        Some(Self {
            id: obj.get("id").cloned().unwrap_or(Value::Null),
            subscription,
            result: body.get("result").cloned().unwrap_or(Value::Null),
        })
    }
}

/// A frame received on a transport, sorted by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A request object or a batch, to be answered by the local callee.
    Call(Value),
    /// A well-formed subscription publish.
    Publish(Publication),
    /// A response carrying `result`.
    Success { id: Option<RequestId>, result: Value },
    /// A response carrying `error`.
    Error {
        id: Option<RequestId>,
        error: ErrorObject,
    },
}

impl Frame {
    /// Classify one parsed frame. Returns `None` for frames that are neither
    /// calls nor responses (scalars, objects without `method`/`result`/`error`).
    pub fn classify(value: Value) -> Option<Frame> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            Value::Array(items) => return Some(Frame::Call(Value::Array(items))),
            _ => return None,
        };

        if obj.contains_key("method") {
            if obj.get("method").and_then(Value::as_str) == Some(RpcConfig::SUBSCRIPTION_METHOD) {
                if let Some(publication) = Publication::parse(&obj) {
                    return Some(Frame::Publish(publication));
                }
            }
            return Some(Frame::Call(Value::Object(obj)));
        }

        let id = obj.get("id").and_then(RequestId::from_value);
        match obj.remove("error") {
            Some(error) if !error.is_null() => Some(Frame::Error {
                id,
                error: ErrorObject::from_wire(error),
            }),
            _ => obj.remove("result").map(|result| Frame::Success { id, result }),
        }
    }
}
