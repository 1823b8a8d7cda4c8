//! Agent-to-client calls over a live connection
//!
//! The agent calls back into the client while a prompt is in flight; these
//! tests play the client side of those calls.

mod common;

use acp_bridge_lib::BridgeError;
use common::{error_code, Script, ScriptedFactory, TestPeer};
use serde_json::{json, Value};
use tokio::time::Duration;

async fn expect_client_call(peer: &mut TestPeer, method: &str) -> Value {
    loop {
        let message = peer.recv().await.expect("connection closed");
        if message["method"] == method && message.get("id").is_some() {
            return message;
        }
    }
}

#[tokio::test]
async fn test_permission_round_trip() {
    let (factory, mut reports) = ScriptedFactory::new(Script::AskPermission(1));
    let mut peer = TestPeer::start(factory, |_| {}).await;
    let session_id = peer.open_session().await;

    peer.call(5, "prompt", json!({"session_id": session_id, "prompt": "edit"})).await;

    let call = expect_client_call(&mut peer, "session/request_permission").await;
    assert_eq!(call["jsonrpc"], "2.0");
    assert_eq!(call["params"]["session_id"], session_id);
    assert_eq!(call["params"]["options"][0]["option_id"], "allow");

    peer.send(json!({
        "jsonrpc": "2.0",
        "id": call["id"],
        "result": {"outcome": {"outcome": "selected", "option_id": "allow"}}
    }))
    .await;

    let response = peer.response(5).await;
    assert_eq!(response["result"]["stop_reason"], "end_turn");

    let report = reports.recv().await.unwrap().unwrap();
    assert_eq!(report["outcome"]["option_id"], "allow");
}

#[tokio::test]
async fn test_duplicate_response_is_ignored() {
    let (factory, mut reports) = ScriptedFactory::new(Script::AskPermission(1));
    let mut peer = TestPeer::start(factory, |_| {}).await;
    let session_id = peer.open_session().await;

    peer.call(5, "prompt", json!({"session_id": session_id, "prompt": "edit"})).await;
    let call = expect_client_call(&mut peer, "session/request_permission").await;

    let reject = json!({
        "jsonrpc": "2.0",
        "id": call["id"],
        "result": {"outcome": {"outcome": "selected", "option_id": "reject"}}
    });
    peer.send(reject.clone()).await;
    peer.send(reject).await;

    let response = peer.response(5).await;
    assert_eq!(response["result"]["stop_reason"], "refusal");

    // Only one outcome was ever delivered to the waiting agent
    assert!(reports.recv().await.unwrap().is_ok());
    assert!(reports.try_recv().is_err());

    let mode = peer.request("set_session_mode", json!({"mode_id": "auto"})).await;
    assert!(mode.get("result").is_some());
}

#[tokio::test]
async fn test_concurrent_client_calls_correlate_by_id() {
    let (factory, mut reports) = ScriptedFactory::new(Script::AskPermission(3));
    let mut peer = TestPeer::start(factory, |_| {}).await;
    let session_id = peer.open_session().await;

    peer.call(5, "prompt", json!({"session_id": session_id, "prompt": "edit"})).await;

    let mut calls = Vec::new();
    for _ in 0..3 {
        calls.push(expect_client_call(&mut peer, "session/request_permission").await);
    }

    // Answer in reverse order, each with an option naming its own tool call
    for call in calls.iter().rev() {
        let tool = call["params"]["tool_call"]["tool_call_id"].as_str().unwrap();
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": call["id"],
            "result": {"outcome": {"outcome": "selected", "option_id": tool}}
        }))
        .await;
    }

    let response = peer.response(5).await;
    assert!(response.get("result").is_some());

    let mut seen = Vec::new();
    for _ in 0..3 {
        let report = reports.recv().await.unwrap().unwrap();
        seen.push(report["outcome"]["option_id"].as_str().unwrap().to_string());
    }
    // join_all keeps request order, so each waiter got its own answer
    assert_eq!(seen, vec!["tool-0", "tool-1", "tool-2"]);
}

#[tokio::test]
async fn test_close_drains_pending_calls() {
    let (factory, mut reports) = ScriptedFactory::new(Script::AskPermission(3));
    let mut peer = TestPeer::start(factory, |config| config.connection.call_timeout_ms = 0).await;
    let session_id = peer.open_session().await;

    peer.call(5, "prompt", json!({"session_id": session_id, "prompt": "edit"})).await;
    for _ in 0..3 {
        expect_client_call(&mut peer, "session/request_permission").await;
    }

    peer.close().await;

    let mut closed = 0;
    for _ in 0..3 {
        let report = tokio::time::timeout(Duration::from_secs(2), reports.recv())
            .await
            .expect("pending call never resolved")
            .unwrap();
        assert!(matches!(report, Err(BridgeError::ConnectionClosed)));
        closed += 1;
    }
    assert_eq!(closed, 3);
    assert!(reports.try_recv().is_err());

    peer.finished().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let (factory, mut reports) = ScriptedFactory::new(Script::AskPermission(1));
    let mut peer = TestPeer::start(factory, |config| config.connection.call_timeout_ms = 100).await;
    let session_id = peer.open_session().await;

    peer.call(5, "prompt", json!({"session_id": session_id, "prompt": "edit"})).await;
    let call = expect_client_call(&mut peer, "session/request_permission").await;

    let response = peer.response(5).await;
    assert_eq!(error_code(&response), Some(-32002));
    assert!(matches!(
        reports.recv().await.unwrap(),
        Err(BridgeError::Timeout(_))
    ));

    // A late answer is discarded without disturbing the connection
    peer.send(json!({"jsonrpc": "2.0", "id": call["id"], "result": {"outcome": {"outcome": "cancelled"}}}))
        .await;
    let mode = peer.request("set_session_mode", json!({"mode_id": "auto"})).await;
    assert!(mode.get("result").is_some());
}

#[tokio::test]
async fn test_client_error_is_relayed_to_agent() {
    let (factory, mut reports) = ScriptedFactory::new(Script::AskPermission(1));
    let mut peer = TestPeer::start(factory, |_| {}).await;
    let session_id = peer.open_session().await;

    peer.call(5, "prompt", json!({"session_id": session_id, "prompt": "edit"})).await;
    let call = expect_client_call(&mut peer, "session/request_permission").await;
    peer.send(json!({
        "jsonrpc": "2.0",
        "id": call["id"],
        "error": {"code": -32000, "message": "user closed the dialog"}
    }))
    .await;

    let response = peer.response(5).await;
    assert_eq!(error_code(&response), Some(-32000));
    match reports.recv().await.unwrap() {
        Err(BridgeError::Remote(error)) => assert_eq!(error.message, "user closed the dialog"),
        other => panic!("Expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_file_read_through_client() {
    let (factory, mut reports) = ScriptedFactory::new(Script::ReadFile);
    let mut peer = TestPeer::start(factory, |_| {}).await;
    let session_id = peer.open_session().await;

    peer.call(5, "prompt", json!({"session_id": session_id, "prompt": "read"})).await;
    let call = expect_client_call(&mut peer, "fs/read_text_file").await;
    assert_eq!(call["params"]["path"], "/tmp/notes.txt");

    peer.send(json!({"jsonrpc": "2.0", "id": call["id"], "result": {"content": "remember the milk"}}))
        .await;

    assert_eq!(peer.response(5).await["result"]["stop_reason"], "end_turn");
    assert_eq!(reports.recv().await.unwrap().unwrap(), json!("remember the milk"));
}

#[tokio::test]
async fn test_unadvertised_capability_is_refused() {
    let (factory, _reports) = ScriptedFactory::new(Script::ReadFile);
    let mut peer = TestPeer::start(factory, |_| {}).await;

    // No client_capabilities: nothing may be called on the client
    peer.request("initialize", json!({"protocol_version": 1})).await;
    let session = peer.request("new_session", json!({})).await;
    let session_id = session["result"]["session_id"].as_str().unwrap().to_string();

    let response = peer
        .request("prompt", json!({"session_id": session_id, "prompt": "read"}))
        .await;
    assert_eq!(error_code(&response), Some(-32601));

    let stray: Vec<_> = peer
        .take_backlog()
        .into_iter()
        .filter(|m| m["method"] == "fs/read_text_file")
        .collect();
    assert!(stray.is_empty());
}
