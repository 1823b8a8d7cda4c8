//! Configuration types for the ACP bridge

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/tmp/workspace")
}

fn default_model_id() -> String {
    "global.anthropic.claude-haiku-4-5-20251001-v1:0".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_teardown_grace_ms() -> u64 {
    1_000
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

/// Main configuration structure for the bridge
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Listener options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket upgrade path
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long a new TCP connection may take to complete the upgrade
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            log_level: default_log_level(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Approval behaviour for file edits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Request approval before edits
    #[default]
    AskBeforeEdits,
    /// Auto-approve edits
    Auto,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::AskBeforeEdits => "ask_before_edits",
            AgentMode::Auto => "auto",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ask_before_edits" => Ok(AgentMode::AskBeforeEdits),
            "auto" => Ok(AgentMode::Auto),
            other => Err(BridgeError::Config(format!("Unknown agent mode: {}", other))),
        }
    }
}

/// Settings consumed when a connection's agent is created
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    /// Root directory for agent file operations
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub mode: AgentMode,
    /// Upstream model identifier
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Upstream model region
    #[serde(default = "default_region")]
    pub region: String,
    /// Delay between streamed chunks of the echo agent
    #[serde(default)]
    pub echo_chunk_delay_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            mode: AgentMode::default(),
            model_id: default_model_id(),
            region: default_region(),
            echo_chunk_delay_ms: 0,
        }
    }
}

/// What happens to a prompt that arrives while the session is mid-turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPolicy {
    /// Wait for the running turn to finish
    #[default]
    Queue,
    /// Answer immediately with a `Busy` error
    Reject,
}

/// Per-connection protocol tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Deadline for agent-to-client calls; 0 disables it
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// How long a cancelled turn may take to wind down on its own
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default)]
    pub prompt_policy: PromptPolicy,
    /// How long in-flight calls may run after teardown starts
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    /// Longest a single frame write may block before the peer is
    /// considered gone
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue_capacity(),
            call_timeout_ms: default_call_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            prompt_policy: PromptPolicy::default(),
            teardown_grace_ms: default_teardown_grace_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Agent settings resolved for a single connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub workspace_dir: PathBuf,
    pub mode: AgentMode,
    pub model_id: String,
    pub region: String,
    pub echo_chunk_delay: Duration,
}

impl BridgeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !["error", "warn", "info", "debug", "trace"].contains(&self.server.log_level.as_str()) {
            return Err(BridgeError::Config(format!(
                "Invalid log level: {}",
                self.server.log_level
            )));
        }

        if !self.server.path.starts_with('/') {
            return Err(BridgeError::Config(format!(
                "WebSocket path must start with '/': {}",
                self.server.path
            )));
        }

        if self.agent.workspace_dir.as_os_str().is_empty() {
            return Err(BridgeError::Config(
                "Workspace directory cannot be empty".to_string(),
            ));
        }

        if self.agent.model_id.is_empty() {
            return Err(BridgeError::Config("Model id cannot be empty".to_string()));
        }

        if self.connection.outbound_queue_capacity == 0 {
            return Err(BridgeError::Config(
                "Outbound queue capacity must be greater than zero".to_string(),
            ));
        }

        if self.server.handshake_timeout_ms == 0 || self.connection.send_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "Handshake and send timeouts must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply `WORKSPACE_DIR`, `AGENT_MODE`, `AWS_REGION` and `MODEL_ID`
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("WORKSPACE_DIR") {
            self.agent.workspace_dir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup("AGENT_MODE") {
            self.agent.mode = mode.parse()?;
        }
        if let Some(region) = lookup("AWS_REGION") {
            self.agent.region = region;
        }
        if let Some(model_id) = lookup("MODEL_ID") {
            self.agent.model_id = model_id;
        }
        Ok(())
    }

    /// Resolve per-connection settings from the upgrade request's query
    /// parameters (`workspace_dir`, `mode`)
    pub fn connection_settings(&self, query: &HashMap<String, String>) -> Result<ConnectionSettings> {
        let workspace_dir = query
            .get("workspace_dir")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.agent.workspace_dir.clone());

        let mode = match query.get("mode") {
            Some(mode) => mode.parse()?,
            None => self.agent.mode,
        };

        Ok(ConnectionSettings {
            workspace_dir,
            mode,
            model_id: self.agent.model_id.clone(),
            region: self.agent.region.clone(),
            echo_chunk_delay: Duration::from_millis(self.agent.echo_chunk_delay_ms),
        })
    }
}
