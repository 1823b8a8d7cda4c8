//! Agent-to-client calls
//!
//! [`ClientHandle`] is what agent code holds to call back into the connected
//! client while it is processing a prompt: asking for permission, reading or
//! writing files, driving terminals and streaming session updates. Each call
//! suspends only the calling task until the matching response arrives, the
//! connection closes, or the deadline passes.

use crate::error::{BridgeError, Result};
use crate::pending::PendingCalls;
use crate::protocol::{Message, RequestId};
use crate::pump::Outbox;
use crate::schema::{
    client_methods, ClientCapabilities, CreateTerminalRequest, CreateTerminalResponse,
    ReadTextFileRequest, ReadTextFileResponse, RequestPermissionRequest,
    RequestPermissionResponse, SessionId, SessionNotification, SessionUpdate, TerminalExitStatus,
    TerminalOutputResponse, TerminalRequest, WriteTextFileRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

struct ClientInner {
    outbox: Outbox,
    pending: Arc<PendingCalls>,
    next_id: AtomicI64,
    default_timeout: Option<Duration>,
    capabilities: RwLock<Option<ClientCapabilities>>,
}

/// Removes a call's pending entry when its caller finishes or is dropped
///
/// Ids are never reused, so removing an entry that was already resolved is
/// a no-op.
struct PendingEntry<'a> {
    pending: &'a PendingCalls,
    id: &'a RequestId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.pending.remove(self.id) {
            tracing::debug!("Abandoned client call {}", self.id);
        }
    }
}

/// Cloneable handle for originating calls toward the client
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

impl ClientHandle {
    /// Create a handle sharing the connection's outbound queue and pending table
    ///
    /// `default_timeout` of `None` means calls wait until answered or the
    /// connection closes.
    pub fn new(
        outbox: Outbox,
        pending: Arc<PendingCalls>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                outbox,
                pending,
                next_id: AtomicI64::new(0),
                default_timeout,
                capabilities: RwLock::new(None),
            }),
        }
    }

    /// Record what the client advertised during `initialize`
    pub(crate) fn set_capabilities(&self, capabilities: ClientCapabilities) {
        *self
            .inner
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(capabilities);
    }

    /// Capabilities negotiated with the client, once initialized
    pub fn capabilities(&self) -> Option<ClientCapabilities> {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls still awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Call `method` on the client using the default deadline
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.inner.default_timeout)
            .await
    }

    /// Call `method` on the client with an explicit deadline
    ///
    /// On expiry, or if the caller stops waiting, the pending entry is
    /// removed, so a late response is discarded by the router. The call is
    /// never retried.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let slot = self.inner.pending.register(id.clone())?;
        let _entry = PendingEntry {
            pending: &self.inner.pending,
            id: &id,
        };

        tracing::debug!("Calling client method {} (id={})", method, id);
        self.inner
            .outbox
            .send(Message::call(id.clone(), method, params))
            .await?;

        let outcome = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, slot).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!("Client call {} (id={}) timed out", method, id);
                    return Err(BridgeError::Timeout(deadline));
                }
            },
            None => slot.await,
        };

        // A dropped sender means the table was torn down without an answer
        outcome.unwrap_or(Err(BridgeError::ConnectionClosed))
    }

    async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let value = self.call(method, serde_json::to_value(params)?).await?;
        serde_json::from_value(value).map_err(|e| {
            BridgeError::Decode(format!("unexpected {} response: {}", method, e))
        })
    }

    /// Send a notification to the client; no response is expected
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.inner
            .outbox
            .send(Message::notification(method, params))
            .await
    }

    fn require(&self, supported: impl Fn(&ClientCapabilities) -> bool, method: &str) -> Result<()> {
        match self.capabilities() {
            Some(capabilities) if supported(&capabilities) => Ok(()),
            _ => Err(BridgeError::MethodNotFound(format!(
                "client does not support {}",
                method
            ))),
        }
    }

    /// Ask the client to approve a tool call
    pub async fn request_permission(
        &self,
        request: RequestPermissionRequest,
    ) -> Result<RequestPermissionResponse> {
        self.call_typed(client_methods::REQUEST_PERMISSION, &request)
            .await
    }

    pub async fn read_text_file(&self, request: ReadTextFileRequest) -> Result<ReadTextFileResponse> {
        self.require(|c| c.fs.read_text_file, client_methods::READ_TEXT_FILE)?;
        self.call_typed(client_methods::READ_TEXT_FILE, &request)
            .await
    }

    pub async fn write_text_file(&self, request: WriteTextFileRequest) -> Result<()> {
        self.require(|c| c.fs.write_text_file, client_methods::WRITE_TEXT_FILE)?;
        self.call(
            client_methods::WRITE_TEXT_FILE,
            serde_json::to_value(&request)?,
        )
        .await
        .map(|_| ())
    }

    pub async fn create_terminal(
        &self,
        request: CreateTerminalRequest,
    ) -> Result<CreateTerminalResponse> {
        self.require(|c| c.terminal, client_methods::TERMINAL_CREATE)?;
        self.call_typed(client_methods::TERMINAL_CREATE, &request)
            .await
    }

    pub async fn terminal_output(&self, request: TerminalRequest) -> Result<TerminalOutputResponse> {
        self.require(|c| c.terminal, client_methods::TERMINAL_OUTPUT)?;
        self.call_typed(client_methods::TERMINAL_OUTPUT, &request)
            .await
    }

    pub async fn wait_for_terminal_exit(
        &self,
        request: TerminalRequest,
    ) -> Result<TerminalExitStatus> {
        self.require(|c| c.terminal, client_methods::TERMINAL_WAIT_FOR_EXIT)?;
        self.call_typed(client_methods::TERMINAL_WAIT_FOR_EXIT, &request)
            .await
    }

    pub async fn release_terminal(&self, request: TerminalRequest) -> Result<()> {
        self.require(|c| c.terminal, client_methods::TERMINAL_RELEASE)?;
        self.call(
            client_methods::TERMINAL_RELEASE,
            serde_json::to_value(&request)?,
        )
        .await
        .map(|_| ())
    }

    pub async fn kill_terminal(&self, request: TerminalRequest) -> Result<()> {
        self.require(|c| c.terminal, client_methods::TERMINAL_KILL)?;
        self.call(client_methods::TERMINAL_KILL, serde_json::to_value(&request)?)
            .await
            .map(|_| ())
    }

    /// Stream a progress update for `session_id`
    pub async fn session_update(&self, session_id: &SessionId, update: SessionUpdate) -> Result<()> {
        let notification = SessionNotification {
            session_id: session_id.clone(),
            update,
        };
        self.notify(
            client_methods::SESSION_UPDATE,
            serde_json::to_value(&notification)?,
        )
        .await
    }
}
