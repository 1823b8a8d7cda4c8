//! Agent capability boundary
//!
//! The bridge never decides what a prompt means. It routes decoded calls to an
//! [`Agent`] and relays the agent's calls back to the client through the
//! [`ClientHandle`] it was created with.

use crate::client::ClientHandle;
use crate::config::ConnectionSettings;
use crate::error::Result;
use crate::schema::{
    ContentBlock, InitializeRequest, InitializeResponse, NewSessionRequest, NewSessionResponse,
    PromptResponse, SessionId, SetSessionModeResponse,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One prompt turn handed to the agent
#[derive(Debug, Clone)]
pub struct PromptTurn {
    /// Resolved target session (explicit or the connection default)
    pub session_id: SessionId,
    pub prompt: Vec<ContentBlock>,
    /// Fires when the client cancels this turn. Agents should check it at
    /// their suspension points and return early, e.g. with
    /// `StopReason::Cancelled`.
    pub cancellation: CancellationToken,
}

impl PromptTurn {
    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        self.prompt
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Stateful conversational agent serving one connection
#[async_trait]
pub trait Agent: Send + Sync {
    async fn initialize(&self, request: InitializeRequest) -> Result<InitializeResponse>;

    async fn new_session(&self, request: NewSessionRequest) -> Result<NewSessionResponse>;

    async fn prompt(&self, turn: PromptTurn) -> Result<PromptResponse>;

    async fn set_session_mode(
        &self,
        session_id: &SessionId,
        mode_id: &str,
    ) -> Result<SetSessionModeResponse>;

    /// Cancellation hint; the turn's token has already fired when this runs
    async fn cancel(&self, session_id: &SessionId) -> Result<()>;
}

/// Creates one exclusively-owned agent per accepted connection
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(
        &self,
        settings: &ConnectionSettings,
        client: ClientHandle,
    ) -> Result<Arc<dyn Agent>>;
}
