//! Per-connection lifecycle
//!
//! [`serve_connection`] owns everything belonging to one accepted socket: the
//! agent instance, the logical sessions, the pending-call table and both pump
//! loops. Nothing here is shared with other connections.
//!
//! Teardown always runs in the same order: stop dispatching, fail pending
//! calls, let in-flight handlers finish (bounded), release the agent, flush
//! and stop the outbound pump, close the transport.

use crate::agent::{Agent, AgentFactory, PromptTurn};
use crate::client::ClientHandle;
use crate::config::{ConnectionConfig, ConnectionSettings};
use crate::dispatch::AgentMethod;
use crate::error::{BridgeError, Result};
use crate::pending::PendingCalls;
use crate::pump::{self, Outbox};
use crate::router::Router;
use crate::schema::{
    CancelNotification, InitializeRequest, NewSessionRequest, PromptRequest,
    SetSessionModeRequest, PROTOCOL_VERSION,
};
use crate::session::{ConnectionState, LogicalSession, SessionTable, StateMachine};
use crate::transport::MessageTransport;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// State shared by the router and every dispatched call of one connection
pub(crate) struct ConnectionContext {
    pub(crate) id: Uuid,
    pub(crate) state: StateMachine,
    agent: RwLock<Option<Arc<dyn Agent>>>,
    pub(crate) sessions: SessionTable,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) outbox: Outbox,
    pub(crate) client: ClientHandle,
    pub(crate) settings: ConnectionSettings,
    pub(crate) config: ConnectionConfig,
    pub(crate) closing: CancellationToken,
    initialize_claimed: AtomicBool,
    close_after_reply: AtomicBool,
}

impl ConnectionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        agent: Arc<dyn Agent>,
        pending: Arc<PendingCalls>,
        outbox: Outbox,
        client: ClientHandle,
        settings: ConnectionSettings,
        config: ConnectionConfig,
        closing: CancellationToken,
    ) -> Self {
        Self {
            id,
            state: StateMachine::new(),
            agent: RwLock::new(Some(agent)),
            sessions: SessionTable::new(),
            pending,
            outbox,
            client,
            settings,
            config,
            closing,
            initialize_claimed: AtomicBool::new(false),
            close_after_reply: AtomicBool::new(false),
        }
    }

    fn agent(&self) -> Result<Arc<dyn Agent>> {
        self.agent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BridgeError::ConnectionClosed)
    }

    fn release_agent(&self) -> bool {
        self.agent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Whether the connection must close once the current reply is queued
    pub(crate) fn close_requested(&self) -> bool {
        self.close_after_reply.load(Ordering::SeqCst)
    }

    fn require_session_active(&self) -> Result<()> {
        match self.state.current() {
            ConnectionState::SessionActive => Ok(()),
            ConnectionState::Connecting | ConnectionState::Initialized => Err(
                BridgeError::InvalidRequest("no session has been created".to_string()),
            ),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(BridgeError::ConnectionClosed)
            }
        }
    }

    /// Run one decoded method against this connection's agent
    pub(crate) async fn execute(&self, method: AgentMethod) -> Result<Value> {
        if self.state.current().is_shutting_down() {
            return Err(BridgeError::ConnectionClosed);
        }

        match method {
            AgentMethod::Initialize(request) => self.initialize(request).await,
            AgentMethod::NewSession(request) => self.new_session(request).await,
            AgentMethod::Prompt(request) => self.prompt(request).await,
            AgentMethod::SetSessionMode(request) => self.set_session_mode(request).await,
            AgentMethod::Cancel(request) => self.cancel(request).await,
        }
    }

    async fn initialize(&self, request: InitializeRequest) -> Result<Value> {
        if self.initialize_claimed.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::InvalidRequest(
                "initialize was already received".to_string(),
            ));
        }

        let outcome = self.negotiate(request).await;
        if outcome.is_err() {
            // Reply first, then tear down
            self.close_after_reply.store(true, Ordering::SeqCst);
        }
        outcome
    }

    async fn negotiate(&self, request: InitializeRequest) -> Result<Value> {
        if !(1..=PROTOCOL_VERSION).contains(&request.protocol_version) {
            return Err(BridgeError::InvalidParams(format!(
                "unsupported protocol version {} (supported: 1..={})",
                request.protocol_version, PROTOCOL_VERSION
            )));
        }

        self.client
            .set_capabilities(request.client_capabilities.clone().unwrap_or_default());

        let client_name = request
            .client_info
            .as_ref()
            .map(|info| info.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let response = self.agent()?.initialize(request).await?;
        self.state.transition(ConnectionState::Initialized)?;

        info!(
            "Initialized (client={}, protocol_version={})",
            client_name, response.protocol_version
        );
        Ok(serde_json::to_value(response)?)
    }

    async fn new_session(&self, mut request: NewSessionRequest) -> Result<Value> {
        match self.state.current() {
            ConnectionState::Initialized | ConnectionState::SessionActive => {}
            ConnectionState::Connecting => {
                return Err(BridgeError::InvalidRequest(
                    "initialize must complete before new_session".to_string(),
                ))
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(BridgeError::ConnectionClosed)
            }
        }

        let cwd = request
            .cwd
            .get_or_insert_with(|| self.settings.workspace_dir.clone())
            .clone();

        let response = self.agent()?.new_session(request).await?;
        if response.session_id.as_str().is_empty() {
            return Err(BridgeError::HandlerFailure(
                "agent returned an empty session id".to_string(),
            ));
        }

        let mode_id = response
            .modes
            .as_ref()
            .map(|modes| modes.current_mode_id.clone());
        self.sessions.register(LogicalSession::new(
            response.session_id.clone(),
            cwd.clone(),
            mode_id,
        ));
        self.state.transition(ConnectionState::SessionActive)?;

        info!("Session created: {} (cwd={})", response.session_id, cwd.display());
        Ok(serde_json::to_value(response)?)
    }

    async fn prompt(&self, request: PromptRequest) -> Result<Value> {
        self.require_session_active()?;
        let session = self.sessions.resolve(request.session_id.as_ref())?;
        let prompt = request.prompt.into_blocks();

        let turn = session.begin_turn(self.config.prompt_policy).await?;
        let cancellation = turn.cancellation.clone();
        let agent = self.agent()?;

        let run = agent.prompt(PromptTurn {
            session_id: session.id.clone(),
            prompt,
            cancellation: cancellation.clone(),
        });
        tokio::pin!(run);

        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = cancellation.cancelled() => {
                debug!("Turn on {} cancelled, allowing {:?} to wind down", session.id, self.config.cancel_grace());
                match tokio::time::timeout(self.config.cancel_grace(), &mut run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("Agent ignored cancellation on {}; abandoning turn", session.id);
                        Err(BridgeError::Cancelled)
                    }
                }
            }
        };
        drop(turn);

        Ok(serde_json::to_value(outcome?)?)
    }

    async fn set_session_mode(&self, request: SetSessionModeRequest) -> Result<Value> {
        self.require_session_active()?;
        let session = self.sessions.resolve(request.session_id.as_ref())?;

        let response = self
            .agent()?
            .set_session_mode(&session.id, &request.mode_id)
            .await?;
        session.set_mode_id(request.mode_id.clone());

        info!("Session {} switched to mode {}", session.id, request.mode_id);
        Ok(serde_json::to_value(response)?)
    }

    async fn cancel(&self, request: CancelNotification) -> Result<Value> {
        self.require_session_active()?;
        let session = self.sessions.resolve(request.session_id.as_ref())?;

        session.cancel();
        self.agent()?.cancel(&session.id).await?;

        info!("Cancel requested for session {}", session.id);
        Ok(json!({}))
    }
}

/// Serve one accepted connection until it closes
///
/// Creates the workspace directory and the connection's agent, runs both
/// pump loops, and tears everything down when the peer hangs up, a fatal
/// error occurs, or `shutdown` fires. If setup fails the socket is closed
/// with an error close frame and the error is returned.
pub async fn serve_connection(
    id: Uuid,
    transport: Arc<dyn MessageTransport>,
    factory: &dyn AgentFactory,
    settings: ConnectionSettings,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let span = info_span!("connection", id = %id);
    run_connection(id, transport, factory, settings, config, shutdown)
        .instrument(span)
        .await
}

async fn run_connection(
    id: Uuid,
    transport: Arc<dyn MessageTransport>,
    factory: &dyn AgentFactory,
    settings: ConnectionSettings,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "Connection opened (workspace={}, mode={})",
        settings.workspace_dir.display(),
        settings.mode
    );

    if let Err(e) = tokio::fs::create_dir_all(&settings.workspace_dir).await {
        transport
            .close_with_error(&format!("cannot create workspace: {}", e))
            .await;
        return Err(e.into());
    }

    let (outbox, rx) = Outbox::channel(config.outbound_queue_capacity);
    let pending = Arc::new(PendingCalls::new());
    let client = ClientHandle::new(outbox.clone(), pending.clone(), config.call_timeout());

    let agent = match factory.create(&settings, client.clone()).await {
        Ok(agent) => agent,
        Err(e) => {
            transport
                .close_with_error(&format!("agent initialization failed: {}", e))
                .await;
            return Err(e);
        }
    };

    let closing = shutdown.child_token();
    let teardown_grace = config.teardown_grace();
    let send_timeout = config.send_timeout();
    let context = Arc::new(ConnectionContext::new(
        id,
        agent,
        pending,
        outbox,
        client,
        settings,
        config,
        closing.clone(),
    ));

    let stop_writer = CancellationToken::new();
    let writer = tokio::spawn(pump::outbound_loop(
        transport.clone(),
        rx,
        send_timeout,
        closing.clone(),
        stop_writer.clone(),
    ));

    let router = Router::new(context.clone());
    let mut tasks = JoinSet::new();
    let exit = pump::inbound_loop(transport.clone(), &router, &mut tasks, closing).await;

    // (1) stop accepting new dispatch
    context.state.begin_closing();
    info!("Connection closing ({:?})", exit);

    // (2) fail every pending outbound call
    let failed = context.pending.fail_all();
    if failed > 0 {
        debug!("Failed {} pending client calls", failed);
    }

    // In-flight turns observe cancellation and answer on their own
    context.sessions.cancel_all();
    let drained = tokio::time::timeout(teardown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Aborting {} calls still running after {:?}", tasks.len(), teardown_grace);
        tasks.shutdown().await;
    }

    // (3) release the agent instance
    context.release_agent();

    // (4) flush queued replies and close the transport
    stop_writer.cancel();
    if let Err(e) = writer.await {
        warn!("Outbound pump task failed: {}", e);
    }
    transport.close().await;
    context.state.finish();

    info!("Connection {} closed", context.id);
    Ok(())
}
