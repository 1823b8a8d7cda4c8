//! WebSocket acceptor
//!
//! Accepts TCP connections, performs the WebSocket upgrade (checking the path
//! and the per-connection query parameters), and runs each connection on its
//! own task. Connections are only reachable through the task handles kept
//! here; there is no shared registry.

use crate::agent::AgentFactory;
use crate::config::{BridgeConfig, ConnectionSettings};
use crate::connection::serve_connection;
use crate::error::{BridgeError, Result};
use crate::transport::{MessageTransport, WsTransport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Serves ACP over WebSocket, one agent instance per connection
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    factory: Arc<dyn AgentFactory>,
    accepted: Arc<AtomicU64>,
}

fn reject(status: StatusCode, reason: impl Into<String>) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.into()));
    *response.status_mut() = status;
    response
}

impl BridgeServer {
    pub fn new(config: BridgeConfig, factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Number of connections accepted so far
    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Bind the configured host and port
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on ws://{}{}", listener.local_addr()?, self.config.server.path);
        Ok(listener)
    }

    /// Accept connections until `shutdown` fires, then wait for every live
    /// connection to finish its teardown
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let count = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
                    let id = Uuid::new_v4();
                    debug!("Accepted TCP connection #{} from {}", count, peer);

                    let config = self.config.clone();
                    let factory = self.factory.clone();
                    let token = shutdown.child_token();
                    connections.spawn(
                        async move {
                            if let Err(e) = handle_stream(id, stream, peer, config, factory, token).await {
                                warn!("Connection from {} ended with error: {}", peer, e);
                            }
                        }
                        .in_current_span(),
                    );
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }

            while let Some(result) = connections.try_join_next() {
                if let Err(e) = result {
                    error!("Connection task failed: {}", e);
                }
            }
        }

        info!("Shutting down, waiting for {} connections", connections.len());
        while let Some(result) = connections.join_next().await {
            if let Err(e) = result {
                error!("Connection task failed: {}", e);
            }
        }
        info!("Server shutdown complete");
        Ok(())
    }

    /// Bind, serve, and stop on SIGINT/SIGTERM (Ctrl-C elsewhere)
    pub async fn run_until_signal(&self) -> Result<()> {
        let listener = self.bind().await?;
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => info!("Received shutdown signal, stopping server"),
                Err(e) => error!("Failed to install signal handler: {}", e),
            }
            trigger.cancel();
        });

        self.serve(listener, shutdown).await
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Check the upgrade request and resolve its per-connection settings
fn resolve_upgrade(
    config: &BridgeConfig,
    request: &Request,
) -> std::result::Result<ConnectionSettings, ErrorResponse> {
    let uri = request.uri();
    if uri.path() != config.server.path {
        return Err(reject(StatusCode::NOT_FOUND, format!("no endpoint at {}", uri.path())));
    }

    let query: HashMap<String, String> = uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    config
        .connection_settings(&query)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))
}

async fn handle_stream(
    id: Uuid,
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<BridgeConfig>,
    factory: Arc<dyn AgentFactory>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut resolved = None;
    let callback = |request: &Request,
                    response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        resolved = Some(resolve_upgrade(&config, request)?);
        Ok(response)
    };

    let deadline = config.server.handshake_timeout();
    let upgrade = tokio::time::timeout(deadline, tokio_tungstenite::accept_hdr_async(stream, callback));
    let socket = tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("Shutdown before {} finished the upgrade", peer);
            return Ok(());
        }
        upgraded = upgrade => match upgraded {
            Ok(socket) => socket?,
            Err(_) => {
                warn!("{} did not complete the upgrade within {:?}", peer, deadline);
                return Err(BridgeError::Timeout(deadline));
            }
        },
    };
    let settings = resolved.ok_or_else(|| {
        BridgeError::InvalidRequest("upgrade completed without settings".to_string())
    })?;
    info!("WebSocket connection {} established from {}", id, peer);

    let transport: Arc<dyn MessageTransport> = Arc::new(WsTransport::open(socket));
    serve_connection(
        id,
        transport,
        factory.as_ref(),
        settings,
        config.connection.clone(),
        shutdown,
    )
    .await
}
