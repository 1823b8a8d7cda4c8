//! ACP Bridge CLI
//!
//! Starts the WebSocket bridge serving the echo agent.

use acp_bridge_lib::{AgentMode, BridgeConfig, BridgeServer, EchoAgentFactory};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// ACP Bridge - WebSocket bridge between ACP clients and a stateful agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (.json, .yaml, .yml or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Default workspace directory for new connections
    #[arg(long)]
    workspace_dir: Option<PathBuf>,

    /// Default agent mode (ask_before_edits or auto)
    #[arg(long)]
    mode: Option<AgentMode>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn load_config_file(path: &Path) -> Result<BridgeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: BridgeConfig = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
        Some("toml") => toml::from_str(&contents)?,
        _ => bail!("Unsupported config file extension: {}", path.display()),
    };
    Ok(config)
}

/// File, then environment, then command-line flags
fn build_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => BridgeConfig::default(),
    };

    config.apply_env()?;

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
    if let Some(dir) = &cli.workspace_dir {
        config.agent.workspace_dir = dir.clone();
    }
    if let Some(mode) = cli.mode {
        config.agent.mode = mode;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn log_banner(config: &BridgeConfig) {
    tracing::info!("ACP bridge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "  endpoint:  ws://{}:{}{}",
        config.server.host,
        config.server.port,
        config.server.path
    );
    tracing::info!("  workspace: {}", config.agent.workspace_dir.display());
    tracing::info!("  mode:      {}", config.agent.mode);
    tracing::info!("  model:     {} ({})", config.agent.model_id, config.agent.region);
    tracing::info!(
        "  prompts:   {:?}, call timeout {}ms",
        config.connection.prompt_policy,
        config.connection.call_timeout_ms
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    init_tracing(&config.server.log_level, cli.json_logs);
    log_banner(&config);

    let server = BridgeServer::new(config, Arc::new(EchoAgentFactory));
    server.run_until_signal().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_bridge_lib::PromptPolicy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["acp-bridge"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = cli(&["--port", "9100", "--mode", "auto", "--log-level", "debug"]);
        let config = build_config(&cli).unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.agent.mode, AgentMode::Auto);
    }

    #[test]
    fn test_load_json_config() {
        let file = config_file(".json", r#"{"server": {"port": 7000, "path": "/acp"}}"#);
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.path, "/acp");
    }

    #[test]
    fn test_load_yaml_config() {
        let file = config_file(
            ".yaml",
            "agent:\n  workspace_dir: /srv/ws\nconnection:\n  prompt_policy: reject\n",
        );
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.agent.workspace_dir, PathBuf::from("/srv/ws"));
        assert_eq!(config.connection.prompt_policy, PromptPolicy::Reject);
    }

    #[test]
    fn test_load_toml_config() {
        let file = config_file(
            ".toml",
            "[server]\nhost = \"127.0.0.1\"\n\n[connection]\ncall_timeout_ms = 0\n",
        );
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.connection.call_timeout(), None);
    }

    #[test]
    fn test_flags_override_file() {
        let file = config_file(".json", r#"{"server": {"port": 7000}}"#);
        let path = file.path().to_str().unwrap().to_string();
        let cli = cli(&["--config", &path, "--port", "7001"]);

        let config = build_config(&cli).unwrap();
        assert_eq!(config.server.port, 7001);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let file = config_file(".ini", "port=1");
        assert!(load_config_file(file.path()).is_err());
    }

    #[test]
    fn test_invalid_log_level_fails_validation() {
        let cli = cli(&["--log-level", "chatty"]);
        assert!(build_config(&cli).is_err());
    }
}
