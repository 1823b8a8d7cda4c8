//! JSON-RPC message envelope
//!
//! Every frame exchanged with the peer is one [`Message`]. A message is a
//! call (method + id), a notification (method, no id) or a response
//! (result/error + id). [`Message::classify`] turns the loose envelope into
//! the strongly typed [`Incoming`] the router works with.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Constant protocol marker carried in every outgoing message
pub const JSONRPC_VERSION: &str = "2.0";

/// Call identifier chosen by the originator of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

/// Error object carried by a failure response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Wire envelope: `{jsonrpc, id?, method?, params?, result?, error?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// `Some(Value::Null)` when the peer sent `"result": null`
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

// Keeps an explicit JSON null distinguishable from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Peer call that requires exactly one response
    Call {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// Peer notification; no response is ever produced
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Response to a call this side originated
    Response {
        id: RequestId,
        outcome: Result<Value, RpcError>,
    },
}

/// Envelope that is valid JSON but not a valid protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeError {
    /// Present when the peer can still be told which call was rejected
    pub id: Option<RequestId>,
    pub reason: String,
}

impl Message {
    fn envelope(id: Option<RequestId>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Build an outbound call
    pub fn call(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::envelope(Some(id))
        }
    }

    /// Build an outbound notification
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::envelope(None)
        }
    }

    /// Build a success response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::envelope(Some(id))
        }
    }

    /// Build a failure response
    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            error: Some(error),
            ..Self::envelope(Some(id))
        }
    }

    /// Build a response from a handler outcome
    pub fn response(id: RequestId, outcome: Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::failure(id, error),
        }
    }

    /// Parse a text frame into a message
    pub fn from_text(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::BridgeError::Decode(e.to_string()))
    }

    /// Serialize the message into a text frame
    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Classify the envelope, enforcing that exactly one of
    /// `method`, `result` or `error` is present.
    pub fn classify(self) -> Result<Incoming, EnvelopeError> {
        let reject = |id: Option<RequestId>, reason: &str| EnvelopeError {
            id,
            reason: reason.to_string(),
        };

        if let Some(tag) = &self.jsonrpc {
            if tag != JSONRPC_VERSION {
                return Err(reject(self.id, "unsupported jsonrpc version"));
            }
        }

        match (self.method, self.result, self.error) {
            (Some(method), None, None) => Ok(match self.id {
                Some(id) => Incoming::Call {
                    id,
                    method,
                    params: self.params,
                },
                None => Incoming::Notification {
                    method,
                    params: self.params,
                },
            }),
            (None, Some(result), None) => match self.id {
                Some(id) => Ok(Incoming::Response {
                    id,
                    outcome: Ok(result),
                }),
                None => Err(reject(None, "response without id")),
            },
            (None, None, Some(error)) => match self.id {
                Some(id) => Ok(Incoming::Response {
                    id,
                    outcome: Err(error),
                }),
                None => Err(reject(None, "error response without id")),
            },
            (None, None, None) => Err(reject(self.id, "message has neither method nor result")),
            _ => Err(reject(
                self.id,
                "message must carry exactly one of method, result or error",
            )),
        }
    }
}
