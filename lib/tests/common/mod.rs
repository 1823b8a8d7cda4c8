//! Shared test harness
//!
//! [`TestPeer`] plays the ACP client over a real WebSocket running on an
//! in-memory duplex pipe, with the bridge serving the other end.

#![allow(dead_code)]

use acp_bridge_lib::schema::{
    InitializeRequest, InitializeResponse, NewSessionRequest, NewSessionResponse, PermissionOption,
    PermissionOptionKind, PromptResponse, ReadTextFileRequest, RequestPermissionOutcome,
    RequestPermissionRequest, SessionId, SetSessionModeResponse, StopReason, ToolCall,
};
use acp_bridge_lib::{
    serve_connection, Agent, AgentFactory, BridgeConfig, BridgeError, ClientHandle,
    ConnectionSettings, MessageTransport, PromptTurn, WsTransport,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridge configuration rooted in a fresh temporary workspace
pub fn test_config(workspace: &TempDir) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.agent.workspace_dir = workspace.path().join("workspace");
    config.connection.teardown_grace_ms = 200;
    config
}

/// Client side of one bridged connection
pub struct TestPeer {
    ws: WebSocketStream<DuplexStream>,
    next_id: i64,
    backlog: Vec<Value>,
    pub server: JoinHandle<acp_bridge_lib::Result<()>>,
    pub shutdown: CancellationToken,
    pub workspace: TempDir,
}

impl TestPeer {
    pub async fn start(factory: Arc<dyn AgentFactory>, configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        let workspace = TempDir::new().unwrap();
        let mut config = test_config(&workspace);
        configure(&mut config);

        let settings = config.connection_settings(&HashMap::new()).unwrap();
        Self::start_with_settings(factory, config, settings, workspace).await
    }

    pub async fn start_with_settings(
        factory: Arc<dyn AgentFactory>,
        config: BridgeConfig,
        settings: ConnectionSettings,
        workspace: TempDir,
    ) -> Self {
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let shutdown = CancellationToken::new();
        let transport: Arc<dyn MessageTransport> = Arc::new(WsTransport::open(server_ws));
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                serve_connection(
                    uuid::Uuid::new_v4(),
                    transport,
                    factory.as_ref(),
                    settings,
                    config.connection,
                    shutdown,
                )
                .await
            }
        });

        Self {
            ws,
            next_id: 100,
            backlog: Vec::new(),
            server,
            shutdown,
            workspace,
        }
    }

    pub async fn echo(configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        Self::start(Arc::new(acp_bridge_lib::EchoAgentFactory), configure).await
    }

    pub async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    pub async fn call(&mut self, id: i64, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Next JSON frame, or `None` once the bridge has closed the socket
    pub async fn recv(&mut self) -> Option<Value> {
        if !self.backlog.is_empty() {
            return Some(self.backlog.remove(0));
        }
        self.recv_frame().await
    }

    async fn recv_frame(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(WsMessage::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Wait for the close frame and return it
    pub async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close");
            match frame {
                Some(Ok(WsMessage::Close(frame))) => return frame.map(CloseFrame::into_owned),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    /// Assert nothing arrives for `quiet`
    pub async fn expect_silence(&mut self, quiet: Duration) {
        assert!(self.backlog.is_empty(), "unexpected backlog: {:?}", self.backlog);
        if let Ok(frame) = tokio::time::timeout(quiet, self.ws.next()).await {
            if let Some(Ok(WsMessage::Text(text))) = frame {
                panic!("Expected silence, got {}", text);
            }
        }
    }

    /// Wait for the response to call `id`, keeping other traffic for later
    pub async fn response(&mut self, id: i64) -> Value {
        if let Some(pos) = self
            .backlog
            .iter()
            .position(|m| is_response(m) && m["id"] == id)
        {
            return self.backlog.remove(pos);
        }
        loop {
            let message = self
                .recv_frame()
                .await
                .unwrap_or_else(|| panic!("connection closed before response {}", id));
            if is_response(&message) && message["id"] == id {
                return message;
            }
            self.backlog.push(message);
        }
    }

    /// Send a call with a fresh id and wait for its response
    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.call(id, method, params).await;
        self.response(id).await
    }

    /// Run initialize and new_session; returns the session id
    pub async fn open_session(&mut self) -> String {
        let init = self
            .request(
                "initialize",
                json!({
                    "protocol_version": 1,
                    "client_capabilities": {"fs": {"read_text_file": true, "write_text_file": true}, "terminal": true},
                    "client_info": {"name": "test-peer", "version": "0.0.1"}
                }),
            )
            .await;
        assert!(init.get("result").is_some(), "initialize failed: {}", init);

        let session = self.request("new_session", json!({})).await;
        session["result"]["session_id"].as_str().unwrap().to_string()
    }

    /// Messages set aside while waiting for responses
    pub fn take_backlog(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.backlog)
    }

    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Wait for the bridge side of the connection to finish
    pub async fn finished(self) -> acp_bridge_lib::Result<()> {
        tokio::time::timeout(RECV_TIMEOUT, self.server)
            .await
            .expect("connection did not shut down")
            .unwrap()
    }
}

pub fn is_response(message: &Value) -> bool {
    message.get("method").is_none() && (message.get("result").is_some() || message.get("error").is_some())
}

pub fn error_code(message: &Value) -> Option<i64> {
    message["error"]["code"].as_i64()
}

/// Scripted prompt behaviour for [`ScriptedAgent`]
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Ask the client for permission `n` times concurrently
    AskPermission(usize),
    /// Read a file through the client
    ReadFile,
    /// Panic inside the handler
    Panic,
    /// Sleep without ever looking at the cancellation token
    IgnoreCancel,
    /// Wait for cancellation, then return a partial result
    WaitForCancel,
}

/// Agent whose prompt behaviour is chosen by the test
pub struct ScriptedAgent {
    client: ClientHandle,
    script: Script,
    sessions: AtomicUsize,
    report: mpsc::UnboundedSender<acp_bridge_lib::Result<Value>>,
}

fn permission_request(session_id: &SessionId, n: usize) -> RequestPermissionRequest {
    RequestPermissionRequest {
        session_id: session_id.clone(),
        tool_call: ToolCall {
            tool_call_id: format!("tool-{}", n),
            title: format!("Edit file {}", n),
            kind: None,
            status: None,
            raw_input: None,
        },
        options: vec![
            PermissionOption {
                option_id: "allow".into(),
                name: "Allow".into(),
                kind: PermissionOptionKind::AllowOnce,
            },
            PermissionOption {
                option_id: "reject".into(),
                name: "Reject".into(),
                kind: PermissionOptionKind::RejectOnce,
            },
        ],
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn initialize(&self, request: InitializeRequest) -> acp_bridge_lib::Result<InitializeResponse> {
        Ok(InitializeResponse {
            protocol_version: request.protocol_version,
            agent_capabilities: Default::default(),
            agent_info: None,
            auth_methods: vec![],
        })
    }

    async fn new_session(&self, _request: NewSessionRequest) -> acp_bridge_lib::Result<NewSessionResponse> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(NewSessionResponse {
            session_id: SessionId::new(format!("scripted-{}", n)),
            modes: None,
            meta: None,
        })
    }

    async fn prompt(&self, turn: PromptTurn) -> acp_bridge_lib::Result<PromptResponse> {
        let done = |stop_reason| PromptResponse {
            stop_reason,
            meta: None,
        };

        match self.script {
            Script::AskPermission(n) => {
                let calls = (0..n).map(|i| self.client.request_permission(permission_request(&turn.session_id, i)));
                let results = futures::future::join_all(calls).await;

                let mut allowed = true;
                let mut failure = None;
                for result in results {
                    match result {
                        Ok(response) => {
                            allowed &= matches!(
                                response.outcome,
                                RequestPermissionOutcome::Selected { ref option_id } if option_id == "allow"
                            );
                            let _ = self.report.send(Ok(serde_json::to_value(&response).unwrap()));
                        }
                        Err(e) => {
                            failure.get_or_insert(e.to_json_rpc_error());
                            let _ = self.report.send(Err(e));
                        }
                    }
                }
                if let Some(code) = failure {
                    return Err(BridgeError::Remote(acp_bridge_lib::RpcError::new(
                        code,
                        "permission request failed",
                    )));
                }
                Ok(done(if allowed { StopReason::EndTurn } else { StopReason::Refusal }))
            }
            Script::ReadFile => {
                let response = self
                    .client
                    .read_text_file(ReadTextFileRequest {
                        session_id: turn.session_id.clone(),
                        path: "/tmp/notes.txt".into(),
                        line: None,
                        limit: None,
                    })
                    .await?;
                let _ = self.report.send(Ok(json!(response.content)));
                Ok(done(StopReason::EndTurn))
            }
            Script::Panic => panic!("scripted failure"),
            Script::IgnoreCancel => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(done(StopReason::EndTurn))
            }
            Script::WaitForCancel => {
                turn.cancellation.cancelled().await;
                Ok(done(StopReason::Cancelled))
            }
        }
    }

    async fn set_session_mode(
        &self,
        _session_id: &SessionId,
        _mode_id: &str,
    ) -> acp_bridge_lib::Result<SetSessionModeResponse> {
        Ok(SetSessionModeResponse::default())
    }

    async fn cancel(&self, _session_id: &SessionId) -> acp_bridge_lib::Result<()> {
        Ok(())
    }
}

pub struct ScriptedFactory {
    pub script: Script,
    pub report: mpsc::UnboundedSender<acp_bridge_lib::Result<Value>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> (Arc<Self>, mpsc::UnboundedReceiver<acp_bridge_lib::Result<Value>>) {
        let (report, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { script, report }), rx)
    }
}

#[async_trait]
impl AgentFactory for ScriptedFactory {
    async fn create(
        &self,
        _settings: &ConnectionSettings,
        client: ClientHandle,
    ) -> acp_bridge_lib::Result<Arc<dyn Agent>> {
        Ok(Arc::new(ScriptedAgent {
            client,
            script: self.script,
            sessions: AtomicUsize::new(0),
            report: self.report.clone(),
        }))
    }
}

/// Factory that can never build an agent
pub struct FailingFactory;

#[async_trait]
impl AgentFactory for FailingFactory {
    async fn create(
        &self,
        _settings: &ConnectionSettings,
        _client: ClientHandle,
    ) -> acp_bridge_lib::Result<Arc<dyn Agent>> {
        Err(BridgeError::HandlerFailure("model credentials missing".to_string()))
    }
}
