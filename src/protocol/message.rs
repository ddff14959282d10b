//! Request, Notify and Response messages carried inside frames.
//!
//! ```text
//! Request / Notify: {"method": str, "params": object?, "id": str?}
//! Response:         {"id": str, "result": any?, "error": {"code": int, "message": str}?}
//! ```
//!
//! A request without an `id` is a notify and never gets a response.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::error::{NodelinkError, Result};

/// Named call parameters.
pub type Params = Map<String, Value>;

/// Error code: no handler registered for the method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error code: the handler returned an error.
pub const HANDLER_ERROR: i64 = -32000;

/// Error code: a response carried an unreadable `error` member.
pub const INTERNAL_ERROR: i64 = -32603;

/// Error code: too many handlers already running.
pub const HANDLER_CAPACITY: i64 = -32003;

/// Correlation id of a request.
///
/// Always a syntactically valid UUID. The original text is kept so a reply
/// echoes exactly what the peer sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random (v4) id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept `text` if it is a UUID in the 36-character hyphenated form.
    ///
    /// Braced, `urn:uuid:` and bare 32-digit spellings are rejected.
    pub fn parse(text: &str) -> Option<Self> {
        if !is_hyphenated(text) {
            return None;
        }
        Uuid::try_parse(text).ok().map(|_| Self(text.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_hyphenated(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 36 && [8, 13, 18, 23].iter().all(|&i| bytes[i] == b'-')
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Error member of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    pub fn handler_error(message: impl Into<String>) -> Self {
        Self::new(HANDLER_ERROR, message)
    }

    pub fn handler_capacity() -> Self {
        Self::new(HANDLER_CAPACITY, "Handler capacity reached")
    }

    pub(crate) fn malformed() -> Self {
        Self::new(INTERNAL_ERROR, "malformed error object")
    }
}

/// A call to a named method. Without an id it is a notify.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    /// A one-way call.
    pub fn notify(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            method: method.into(),
            params,
            id: None,
        }
    }

    /// A call expecting a response, correlated by `id`.
    pub fn call(method: impl Into<String>, params: Option<Params>, id: RequestId) -> Self {
        Self {
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    #[inline]
    pub fn is_notify(&self) -> bool {
        self.id.is_none()
    }
}

/// The single reply to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: std::result::Result<Value, RpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Ok(result) => map.serialize_entry("result", result)?,
            Err(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

/// Any decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Serialize to JSON bytes, ready to be framed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Message::Request(request) => serde_json::to_vec(request)?,
            Message::Response(response) => serde_json::to_vec(response)?,
        };
        Ok(bytes)
    }

    /// Parse and classify a frame payload.
    ///
    /// An object with `method` is a request. Otherwise an object with `id` is
    /// a response. Anything else is a protocol error.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(mut object) = value else {
            return Err(NodelinkError::Protocol(
                "message is not a JSON object".into(),
            ));
        };

        if let Some(method) = object.remove("method") {
            return decode_request(method, object).map(Message::Request);
        }

        if let Some(id) = object.remove("id") {
            return decode_response(id, object).map(Message::Response);
        }

        Err(NodelinkError::Protocol(
            "message has neither method nor id".into(),
        ))
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

fn decode_request(method: Value, mut object: Map<String, Value>) -> Result<Request> {
    let Value::String(method) = method else {
        return Err(NodelinkError::Protocol("method is not a string".into()));
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(Value::Object(params)) => Some(params),
        Some(_) => {
            return Err(NodelinkError::Protocol(format!(
                "params of '{}' is not an object",
                method
            )))
        }
    };

    // An unusable id demotes the call to a notify.
    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => {
            let id = RequestId::parse(&text);
            if id.is_none() {
                warn!(method = %method, id = %text, "Discarding request id that is not a UUID");
            }
            id
        }
        Some(other) => {
            warn!(method = %method, id = %other, "Discarding request id that is not a string");
            None
        }
    };

    Ok(Request { method, params, id })
}

fn decode_response(id: Value, mut object: Map<String, Value>) -> Result<Response> {
    let id = match &id {
        Value::String(text) => RequestId::parse(text),
        _ => None,
    }
    .ok_or_else(|| NodelinkError::Protocol(format!("response id {} is not a UUID", id)))?;

    let outcome = match object.remove("error") {
        Some(error) if !error.is_null() => {
            Err(serde_json::from_value::<RpcError>(error).unwrap_or_else(|_| RpcError::malformed()))
        }
        _ => Ok(object.remove("result").unwrap_or(Value::Null)),
    };

    Ok(Response { id, outcome })
}
