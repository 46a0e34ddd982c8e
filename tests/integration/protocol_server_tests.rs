//! Protocol server behaviour against fake tools.

use std::sync::Arc;

use serde_json::json;

use agent_shell::rpc::message::{codes, Message, RequestId};
use agent_shell::server::{Dispatch, Phase, SUPPORTED_PROTOCOL_VERSIONS};

use super::test_helpers::{
    call_params, fake_tools, initialize, is_error, request, respond, result_text, server_with,
    tool, EchoTool,
};

fn error_code(reply: &Message) -> i64 {
    reply.error.as_ref().expect("error response").code
}

// ── Handshake ───────────────────────────────────────────────────────────────

/// Methods other than initialize and ping are rejected before the handshake.
#[tokio::test]
async fn tools_list_before_initialize_is_rejected() {
    let server = server_with(fake_tools());

    let reply = respond(&server, request(1, "tools/list", json!({}))).await;
    assert_eq!(reply.id, Some(RequestId::Number(1)));
    assert_eq!(error_code(&reply), codes::NOT_INITIALIZED);

    let reply = respond(&server, request(2, "tools/call", call_params("echo", json!({})))).await;
    assert_eq!(error_code(&reply), codes::NOT_INITIALIZED);
}

#[tokio::test]
async fn ping_works_before_initialize() {
    let server = server_with(Vec::new());

    let reply = respond(&server, request(1, "ping", json!(null))).await;
    let stamp = reply.result.expect("ping result")["timestamp"]
        .as_str()
        .expect("timestamp string")
        .to_owned();
    assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok(), "bad timestamp {stamp}");
}

/// An unknown version is answered with the preferred one and the session
/// becomes operational.
#[tokio::test]
async fn unknown_version_is_accepted_permissively() {
    let server = server_with(fake_tools());

    let reply = respond(
        &server,
        request(1, "initialize", json!({"protocolVersion": "1999-01-01", "capabilities": {}})),
    )
    .await;
    let result = reply.result.expect("initialize result");
    assert_eq!(result["protocolVersion"], json!(SUPPORTED_PROTOCOL_VERSIONS[0]));
    assert_eq!(result["serverInfo"]["name"], json!("agent-shell"));
    assert_eq!(result["capabilities"]["tools"]["listChanged"], json!(false));
    assert_eq!(result["capabilities"]["resources"]["subscribe"], json!(false));
    assert_eq!(result["capabilities"]["logging"], json!({}));

    let reply = respond(&server, request(2, "tools/list", json!({}))).await;
    assert!(reply.error.is_none(), "tools/list after initialize: {reply:?}");
}

#[tokio::test]
async fn known_version_is_echoed_and_capabilities_stored() {
    let server = server_with(Vec::new());

    let reply = respond(
        &server,
        request(
            1,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"sampling": {}},
                "clientInfo": {"name": "tester", "version": "1"}
            }),
        ),
    )
    .await;
    assert_eq!(reply.result.unwrap()["protocolVersion"], json!("2024-11-05"));

    let state = server.handshake();
    assert_eq!(state.phase(), Phase::Operational);
    assert_eq!(state.client_capabilities(), &json!({"sampling": {}}));
    assert_eq!(state.client_info().unwrap()["name"], json!("tester"));
}

#[tokio::test]
async fn missing_protocol_version_is_rejected_with_supported_list() {
    let server = server_with(fake_tools());

    let reply = respond(&server, request(1, "initialize", json!({"capabilities": {}}))).await;
    let error = reply.error.expect("error");
    assert_eq!(error.code, codes::INVALID_VERSION);
    assert_eq!(error.message, "missing protocol version");
    assert_eq!(
        error.data.unwrap()["supportedVersions"],
        json!(SUPPORTED_PROTOCOL_VERSIONS)
    );

    let reply = respond(&server, request(2, "tools/list", json!({}))).await;
    assert_eq!(error_code(&reply), codes::NOT_INITIALIZED, "still gated");
}

/// Re-initializing an operational session is accepted.
#[tokio::test]
async fn reinitialize_while_operational_is_accepted() {
    let server = server_with(Vec::new());
    initialize(&server).await;

    let reply = respond(
        &server,
        request(5, "initialize", json!({"protocolVersion": "2025-06-18"})),
    )
    .await;
    assert_eq!(reply.result.unwrap()["protocolVersion"], json!("2025-06-18"));
    assert_eq!(server.handshake().protocol_version(), Some("2025-06-18"));
}

// ── Listing ─────────────────────────────────────────────────────────────────

/// Seven tools with `limit=3` page as 3, 3, 1 and end with an empty cursor.
#[tokio::test]
async fn tools_list_paginates() {
    let tools = (0..7)
        .map(|i| tool(&format!("tool{i}"), Arc::new(EchoTool)))
        .collect();
    let server = server_with(tools);
    initialize(&server).await;

    let mut cursor: Option<String> = None;
    let mut sizes = Vec::new();
    let mut names = Vec::new();

    for id in 1..=3 {
        let mut params = json!({"limit": 3});
        if let Some(c) = &cursor {
            params["cursor"] = json!(c);
        }
        let result = respond(&server, request(id, "tools/list", params))
            .await
            .result
            .expect("tools/list result");

        let page = result["tools"].as_array().expect("tools array");
        sizes.push(page.len());
        names.extend(page.iter().map(|t| t["name"].as_str().unwrap().to_owned()));
        cursor = Some(result["nextCursor"].as_str().unwrap().to_owned());
    }

    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(cursor.as_deref(), Some(""));
    assert_eq!(names.first().map(String::as_str), Some("tool0"));
    assert_eq!(names.last().map(String::as_str), Some("tool6"));
}

#[tokio::test]
async fn tools_list_entries_have_schema() {
    let server = server_with(fake_tools());
    initialize(&server).await;

    let result = respond(&server, request(1, "tools/list", json!(null)))
        .await
        .result
        .unwrap();
    let first = &result["tools"][0];
    assert_eq!(first["name"], json!("echo"));
    assert_eq!(first["inputSchema"], json!({"type": "object"}));
    assert!(first["description"].is_string());
    assert_eq!(result["nextCursor"], json!(""));
}

#[tokio::test]
async fn invalid_cursor_is_invalid_params() {
    let server = server_with(fake_tools());
    initialize(&server).await;

    let reply = respond(&server, request(1, "tools/list", json!({"cursor": "x"}))).await;
    assert_eq!(error_code(&reply), codes::INVALID_PARAMS);
}

#[tokio::test]
async fn resource_methods_without_resources() {
    let server = server_with(Vec::new());
    initialize(&server).await;

    let listed = respond(&server, request(1, "resources/list", json!({}))).await;
    assert_eq!(
        listed.result.unwrap(),
        json!({"resources": [], "nextCursor": ""})
    );

    let templates = respond(&server, request(2, "resources/templates/list", json!({}))).await;
    assert_eq!(
        templates.result.unwrap(),
        json!({"resourceTemplates": [], "nextCursor": ""})
    );

    let subscribe = respond(&server, request(3, "resources/subscribe", json!({"uri": "x"}))).await;
    assert_eq!(error_code(&subscribe), codes::METHOD_NOT_FOUND);

    let unknown = respond(
        &server,
        request(4, "resources/read", json!({"uri": "shell://nope"})),
    )
    .await;
    assert_eq!(error_code(&unknown), codes::INVALID_PARAMS);

    let missing = respond(&server, request(5, "resources/read", json!({}))).await;
    assert_eq!(error_code(&missing), codes::INVALID_PARAMS);
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let server = server_with(Vec::new());
    initialize(&server).await;

    let reply = respond(&server, request(1, "sampling/createMessage", json!({}))).await;
    assert_eq!(error_code(&reply), codes::METHOD_NOT_FOUND);
}

// ── tools/call ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn tools_call_returns_text_content() {
    let server = server_with(fake_tools());
    initialize(&server).await;

    let params = call_params("echo", json!({"a": 1}));
    let reply = respond(&server, request(1, "tools/call", params)).await;
    assert_eq!(reply.id, Some(RequestId::Number(1)));
    assert_eq!(result_text(&reply), "echoed");
    assert!(!is_error(&reply));
}

#[tokio::test]
async fn unknown_tool_and_missing_name_are_errors() {
    let server = server_with(fake_tools());
    initialize(&server).await;

    let unknown = respond(&server, request(1, "tools/call", call_params("nope", json!({})))).await;
    let error = unknown.error.expect("error");
    assert_eq!(error.code, codes::INVALID_PARAMS);
    assert!(error.message.contains("nope"));

    let missing = respond(&server, request(2, "tools/call", json!({"arguments": {}}))).await;
    assert_eq!(error_code(&missing), codes::INVALID_PARAMS);
}

/// A handler that returns `Err` becomes an internal error naming the failure.
#[tokio::test]
async fn handler_failure_is_wrapped() {
    let server = server_with(fake_tools());
    initialize(&server).await;

    let reply = respond(&server, request(1, "tools/call", call_params("fail", json!({})))).await;
    let error = reply.error.expect("error");
    assert_eq!(error.code, codes::INTERNAL_ERROR);
    assert_eq!(error.message, "tool execution failed: tool: kaput");
    assert_eq!(error.data.unwrap()["message"], json!("tool: kaput"));
}

/// A panicking handler still produces exactly one response.
#[tokio::test]
async fn handler_panic_still_responds() {
    let server = server_with(fake_tools());
    initialize(&server).await;

    let reply = respond(&server, request(9, "tools/call", call_params("panic", json!({})))).await;
    assert_eq!(reply.id, Some(RequestId::Number(9)));
    assert_eq!(error_code(&reply), codes::INTERNAL_ERROR);
    assert_eq!(server.in_flight(), 0);
}

/// `notifications/cancelled` fires the running call's cancellation handle.
#[tokio::test]
async fn cancelled_notification_reaches_running_call() {
    let server = server_with(fake_tools());
    initialize(&server).await;

    let Dispatch::Deferred(pending) =
        server.handle(request(42, "tools/call", call_params("slow", json!({}))))
    else {
        panic!("tools/call must be deferred");
    };
    let running = tokio::spawn(pending);
    assert_eq!(server.in_flight(), 1);

    let cancel = Message::notification(
        "notifications/cancelled",
        Some(json!({"requestId": 42, "reason": "user abort"})),
    );
    assert!(matches!(server.handle(cancel), Dispatch::Silent));

    let reply = tokio::time::timeout(std::time::Duration::from_secs(5), running)
        .await
        .expect("cancelled call finishes promptly")
        .expect("task joins");
    assert_eq!(result_text(&reply), "cancelled");
    assert_eq!(server.in_flight(), 0);
}

// ── Envelopes and notifications ─────────────────────────────────────────────

#[tokio::test]
async fn notifications_never_respond() {
    let server = server_with(Vec::new());

    let initialized = Message::notification("notifications/initialized", None);
    assert!(matches!(server.handle(initialized), Dispatch::Silent));
    assert!(server.handshake().client_initialized());

    let other = Message::notification("notifications/progress", Some(json!({})));
    assert!(matches!(server.handle(other), Dispatch::Silent));

    let disconnect = Message::notification("notifications/disconnect", None);
    assert!(matches!(server.handle(disconnect), Dispatch::Disconnect));
}

#[tokio::test]
async fn client_responses_are_dropped() {
    let server = server_with(Vec::new());
    let response = Message::response(RequestId::Number(3), json!({}));
    assert!(matches!(server.handle(response), Dispatch::Silent));
}

#[tokio::test]
async fn wrong_jsonrpc_version_is_invalid_request() {
    let server = server_with(Vec::new());
    let mut message = request(1, "ping", json!(null));
    message.jsonrpc = "1.0".into();

    let reply = respond(&server, message).await;
    assert_eq!(error_code(&reply), codes::INVALID_REQUEST);
}

#[tokio::test]
async fn id_without_method_is_invalid_request() {
    let server = server_with(Vec::new());
    let message: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":"q"}"#).unwrap();

    let reply = respond(&server, message).await;
    assert_eq!(reply.id, Some(RequestId::String("q".into())));
    assert_eq!(error_code(&reply), codes::INVALID_REQUEST);
}
