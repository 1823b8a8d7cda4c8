//! Method dispatch table
//!
//! Method names are decoded once, at the router boundary, into the
//! [`AgentMethod`] sum type. Everything past this point works with typed
//! payloads. Handler failures and panics are contained here and turned into
//! error responses.

use crate::connection::ConnectionContext;
use crate::error::{BridgeError, Result};
use crate::protocol::RpcError;
use crate::schema::{
    CancelNotification, InitializeRequest, NewSessionRequest, PromptRequest,
    SetSessionModeRequest,
};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

/// A decoded client → agent call
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMethod {
    Initialize(InitializeRequest),
    NewSession(NewSessionRequest),
    Prompt(PromptRequest),
    SetSessionMode(SetSessionModeRequest),
    Cancel(CancelNotification),
}

fn decode_params<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<T> {
    let params = match params {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    };
    serde_json::from_value(params)
        .map_err(|e| BridgeError::InvalidParams(format!("{}: {}", method, e)))
}

impl AgentMethod {
    /// Decode a method name and its raw params
    ///
    /// ACP slash names are accepted as aliases of the snake_case names.
    pub fn decode(method: &str, params: Option<Value>) -> Result<Self> {
        let decoded = match method {
            "initialize" => AgentMethod::Initialize(decode_params(method, params)?),
            "new_session" | "session/new" => {
                AgentMethod::NewSession(decode_params(method, params)?)
            }
            "prompt" | "session/prompt" => AgentMethod::Prompt(decode_params(method, params)?),
            "set_session_mode" | "session/set_mode" => {
                AgentMethod::SetSessionMode(decode_params(method, params)?)
            }
            "cancel" | "session/cancel" => AgentMethod::Cancel(decode_params(method, params)?),
            other => return Err(BridgeError::MethodNotFound(other.to_string())),
        };
        Ok(decoded)
    }

    /// Canonical method name
    pub fn name(&self) -> &'static str {
        match self {
            AgentMethod::Initialize(_) => "initialize",
            AgentMethod::NewSession(_) => "new_session",
            AgentMethod::Prompt(_) => "prompt",
            AgentMethod::SetSessionMode(_) => "set_session_mode",
            AgentMethod::Cancel(_) => "cancel",
        }
    }
}

async fn run_contained(context: &ConnectionContext, method: AgentMethod) -> Result<Value> {
    let name = method.name();
    match AssertUnwindSafe(context.execute(method)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(BridgeError::HandlerFailure(format!("{} panicked: {}", name, detail)))
        }
    }
}

/// Convert a handler error into the wire error for `method`
pub fn error_response(method: &str, error: &BridgeError) -> RpcError {
    match error {
        BridgeError::HandlerFailure(_)
        | BridgeError::Io(_)
        | BridgeError::Serialization(_)
        | BridgeError::Config(_) => {
            error!("{} failed: {}", method, error);
            RpcError::new(error.to_json_rpc_error(), error.to_string())
                .with_data(json!({ "method": method }))
        }
        _ => error.to_rpc_error(),
    }
}

/// Handle a call; always yields exactly one outcome
pub(crate) async fn handle_call(
    context: &ConnectionContext,
    method: &str,
    params: Option<Value>,
) -> std::result::Result<Value, RpcError> {
    let decoded = AgentMethod::decode(method, params).map_err(|e| {
        warn!("Rejecting {} call: {}", method, e);
        e.to_rpc_error()
    })?;

    run_contained(context, decoded)
        .await
        .map_err(|e| error_response(method, &e))
}

/// Handle a notification; failures are logged and never answered
pub(crate) async fn handle_notification(
    context: &ConnectionContext,
    method: &str,
    params: Option<Value>,
) {
    let decoded = match AgentMethod::decode(method, params) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Dropping {} notification: {}", method, e);
            return;
        }
    };

    if let Err(e) = run_contained(context, decoded).await {
        match e {
            BridgeError::HandlerFailure(_) => error!("{} notification failed: {}", method, e),
            _ => warn!("{} notification failed: {}", method, e),
        }
    }
}
