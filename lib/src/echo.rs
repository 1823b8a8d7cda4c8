//! Echo agent
//!
//! A small self-contained [`Agent`] that streams the prompt text back to the
//! client word by word. The binary serves it by default and the integration
//! tests drive it; it exercises every part of the bridge without needing an
//! upstream model.

use crate::agent::{Agent, AgentFactory, PromptTurn};
use crate::client::ClientHandle;
use crate::config::{AgentMode, ConnectionSettings};
use crate::error::{BridgeError, Result};
use crate::schema::{
    AgentCapabilities, ContentBlock, Implementation, InitializeRequest, InitializeResponse,
    NewSessionRequest, NewSessionResponse, PromptCapabilities, PromptResponse, SessionId,
    SessionMode, SessionModeState, SessionUpdate, SetSessionModeResponse, StopReason,
    PROTOCOL_VERSION,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use ulid::Ulid;

fn available_modes() -> Vec<SessionMode> {
    vec![
        SessionMode {
            id: AgentMode::AskBeforeEdits.as_str().to_string(),
            name: "Ask before edits".to_string(),
            description: Some("Request approval before modifying files".to_string()),
        },
        SessionMode {
            id: AgentMode::Auto.as_str().to_string(),
            name: "Auto".to_string(),
            description: Some("Apply edits without asking".to_string()),
        },
    ]
}

/// Agent that echoes prompts back as streamed message chunks
pub struct EchoAgent {
    client: ClientHandle,
    settings: ConnectionSettings,
    modes: Mutex<HashMap<SessionId, AgentMode>>,
}

impl EchoAgent {
    pub fn new(settings: ConnectionSettings, client: ClientHandle) -> Self {
        Self {
            client,
            settings,
            modes: Mutex::new(HashMap::new()),
        }
    }

    /// Current mode of `session_id`, if the session exists
    pub fn mode(&self, session_id: &SessionId) -> Option<AgentMode> {
        self.modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .copied()
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn initialize(&self, request: InitializeRequest) -> Result<InitializeResponse> {
        tracing::debug!("Echo agent initializing: {:?}", request.client_info);
        Ok(InitializeResponse {
            protocol_version: request.protocol_version.min(PROTOCOL_VERSION),
            agent_capabilities: AgentCapabilities {
                load_session: false,
                prompt_capabilities: PromptCapabilities {
                    image: false,
                    audio: false,
                    embedded_context: false,
                },
            },
            agent_info: Some(Implementation {
                name: "acp-bridge-echo".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            auth_methods: Vec::new(),
        })
    }

    async fn new_session(&self, request: NewSessionRequest) -> Result<NewSessionResponse> {
        let session_id = SessionId::new(Ulid::new().to_string());
        let mode = self.settings.mode;
        self.modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), mode);

        Ok(NewSessionResponse {
            session_id,
            modes: Some(SessionModeState {
                current_mode_id: mode.as_str().to_string(),
                available_modes: available_modes(),
            }),
            meta: Some(json!({
                "created_at": Utc::now().to_rfc3339(),
                "cwd": request.cwd,
                "model_id": self.settings.model_id,
                "region": self.settings.region,
            })),
        })
    }

    async fn prompt(&self, turn: PromptTurn) -> Result<PromptResponse> {
        if self.mode(&turn.session_id).is_none() {
            return Err(BridgeError::InvalidParams(format!(
                "unknown session: {}",
                turn.session_id
            )));
        }

        let text = turn.text();
        if text.trim().is_empty() {
            return Err(BridgeError::InvalidParams("prompt is empty".to_string()));
        }

        let delay = self.settings.echo_chunk_delay;
        for word in text.split_whitespace() {
            if turn.cancellation.is_cancelled() {
                return Ok(PromptResponse {
                    stop_reason: StopReason::Cancelled,
                    meta: None,
                });
            }

            self.client
                .session_update(
                    &turn.session_id,
                    SessionUpdate::AgentMessageChunk {
                        content: ContentBlock::text(format!("{} ", word)),
                    },
                )
                .await?;

            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = turn.cancellation.cancelled() => {}
                }
            }
        }

        let stop_reason = if turn.cancellation.is_cancelled() {
            StopReason::Cancelled
        } else {
            StopReason::EndTurn
        };
        Ok(PromptResponse {
            stop_reason,
            meta: None,
        })
    }

    async fn set_session_mode(
        &self,
        session_id: &SessionId,
        mode_id: &str,
    ) -> Result<SetSessionModeResponse> {
        let mode: AgentMode = mode_id
            .parse()
            .map_err(|_| BridgeError::InvalidParams(format!("unknown mode: {}", mode_id)))?;

        {
            let mut modes = self.modes.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(current) = modes.get_mut(session_id) else {
                return Err(BridgeError::InvalidParams(format!(
                    "unknown session: {}",
                    session_id
                )));
            };
            *current = mode;
        }

        self.client
            .session_update(
                session_id,
                SessionUpdate::CurrentModeUpdate {
                    current_mode_id: mode.as_str().to_string(),
                },
            )
            .await?;
        Ok(SetSessionModeResponse::default())
    }

    async fn cancel(&self, session_id: &SessionId) -> Result<()> {
        tracing::debug!("Echo agent observed cancel for {}", session_id);
        Ok(())
    }
}

/// Builds one [`EchoAgent`] per connection
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAgentFactory;

#[async_trait]
impl AgentFactory for EchoAgentFactory {
    async fn create(
        &self,
        settings: &ConnectionSettings,
        client: ClientHandle,
    ) -> Result<Arc<dyn Agent>> {
        Ok(Arc::new(EchoAgent::new(settings.clone(), client)))
    }
}
