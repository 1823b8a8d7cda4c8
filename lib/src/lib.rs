//! ACP Bridge Library
//!
//! Connects a remote Agent Client Protocol client to a stateful agent over a
//! WebSocket. Either side may originate calls: the client drives the agent
//! (initialize, sessions, prompts, cancellation) while the agent calls back
//! into the client (permission requests, file access, terminals, streamed
//! session updates) before the original call completes.

pub mod agent;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod echo;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod pump;
mod router;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;

pub use agent::{Agent, AgentFactory, PromptTurn};
pub use client::ClientHandle;
pub use config::{AgentMode, BridgeConfig, ConnectionSettings, PromptPolicy};
pub use connection::serve_connection;
pub use echo::{EchoAgent, EchoAgentFactory};
pub use error::{BridgeError, Result};
pub use protocol::{Message, RequestId, RpcError};
pub use server::BridgeServer;
pub use transport::{MessageTransport, WsTransport};
