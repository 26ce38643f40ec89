//! Stream transport integration tests
//!
//! Serves a small SSE MCP endpoint with `axum`: `GET /sse` holds the event
//! stream open and `POST /messages` (or `/message`) accepts outbound
//! messages. Replies travel back over the event stream unless the server is
//! configured to answer inline in the POST body.

mod common;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use mcphub::mcp::config::StreamParams;
use mcphub::mcp::protocol::McpProtocol;
use mcphub::mcp::transport::stream::StreamTransport;
use mcphub::mcp::transport::{CloseReason, Transport, TransportEvent};
use mcphub::mcp::types::ClientCapabilities;
use mcphub::McpHubError;

use common::client_info;

#[derive(Clone, Default)]
struct Mode {
    /// Data of the initial `endpoint` event; `None` sends no such event.
    endpoint_event: Option<String>,
    /// Answer in the POST body instead of on the event stream.
    inline: bool,
    /// Fail every POST with HTTP 500.
    fail_post: bool,
    /// End the event stream right after the endpoint event.
    end_stream: bool,
    /// Start a POST reply body and abort it halfway.
    broken_body: bool,
}

#[derive(Clone)]
struct AppState {
    mode: Mode,
    events: broadcast::Sender<String>,
}

fn reply_for(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    let method = request["method"].as_str().unwrap_or("");
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2025-11-25",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "sse-server", "version": "1.0.0" }
        }),
        "tools/list" => json!({
            "tools": [{ "name": "echo", "inputSchema": { "type": "object" } }]
        }),
        "tools/call" => json!({
            "content": [{
                "type": "text",
                "text": request["params"]["arguments"]["message"]
            }]
        }),
        _ => json!({ "echo": method }),
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let first = stream::iter(
        state
            .mode
            .endpoint_event
            .clone()
            .map(|data| Ok(Event::default().event("endpoint").data(data))),
    );
    if state.mode.end_stream {
        return Sse::new(first.boxed());
    }
    let rest = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(text) => return Some((Ok(Event::default().data(text)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(first.chain(rest).boxed())
}

async fn post_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    if state.mode.fail_post {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if state.mode.broken_body {
        let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
            Ok("{\"jsonrpc\":\"2.0\","),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")),
        ];
        return Response::builder()
            .header("Content-Type", "application/json")
            .body(axum::body::Body::from_stream(stream::iter(chunks)))
            .unwrap();
    }
    match reply_for(&body) {
        Some(reply) if state.mode.inline => Json(reply).into_response(),
        Some(reply) => {
            let _ = state.events.send(reply.to_string());
            StatusCode::ACCEPTED.into_response()
        }
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn serve(mode: Mode) -> SocketAddr {
    let (events, _) = broadcast::channel(64);
    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(post_handler))
        .route("/messages", post(post_handler))
        .with_state(AppState { mode, events });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn transport(addr: SocketAddr) -> StreamTransport {
    let params = StreamParams {
        url: format!("http://{addr}/sse"),
        headers: Default::default(),
    };
    StreamTransport::new("sse", params, Duration::from_secs(3)).unwrap()
}

#[tokio::test]
async fn test_endpoint_event_sets_send_url_and_replies_arrive_over_stream() {
    let addr = serve(Mode {
        endpoint_event: Some("/messages?session=abc".to_string()),
        ..Mode::default()
    })
    .await;
    let transport = std::sync::Arc::new(transport(addr));
    transport.connect().await.unwrap();
    assert_eq!(
        transport.send_url().as_str(),
        format!("http://{addr}/messages?session=abc")
    );

    let session = McpProtocol::new(transport.clone())
        .initialize(client_info(), ClientCapabilities::default())
        .await
        .unwrap();
    assert_eq!(session.server_info().name, "sse-server");

    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    let response = session
        .call_tool("echo", Some(json!({ "message": "over sse" })))
        .await
        .unwrap();
    assert_eq!(response.text(), "over sse");
    assert_eq!(transport.pending_requests(), 0);

    transport.disconnect().await.unwrap();
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_derived_send_url_with_inline_replies() {
    let addr = serve(Mode {
        inline: true,
        ..Mode::default()
    })
    .await;
    let transport = transport(addr);
    transport.connect().await.unwrap();
    assert_eq!(transport.send_url().as_str(), format!("http://{addr}/message"));

    let result = transport.request("ping", Some(json!({}))).await.unwrap();
    assert_eq!(result["echo"], "ping");
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_failed_post_is_connection_error() {
    let addr = serve(Mode {
        endpoint_event: Some("/messages".to_string()),
        fail_post: true,
        ..Mode::default()
    })
    .await;
    let transport = transport(addr);
    transport.connect().await.unwrap();

    let err = transport.request("ping", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McpHubError>(),
        Some(McpHubError::Connection { .. })
    ));
    assert!(err.to_string().contains("500"));
    assert!(transport.is_connected());
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_truncated_reply_body_fails_request_and_is_reported() {
    let addr = serve(Mode {
        endpoint_event: Some("/messages".to_string()),
        broken_body: true,
        ..Mode::default()
    })
    .await;
    let transport = transport(addr);
    let mut events = transport.subscribe();
    transport.connect().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), transport.request("ping", None))
        .await
        .expect("request should fail instead of waiting for a reply")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McpHubError>(),
        Some(McpHubError::Connection { .. })
    ));
    assert!(err.to_string().contains("reading POST response failed"));
    assert_eq!(transport.pending_requests(), 0);

    let reported = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(TransportEvent::Error { message, .. }) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("body read error not reported");
    assert!(reported.contains("reading POST response failed"));
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stream_end_closes_transport() {
    let addr = serve(Mode {
        endpoint_event: Some("/messages".to_string()),
        end_stream: true,
        ..Mode::default()
    })
    .await;
    let transport = transport(addr);
    let mut events = transport.subscribe();
    transport.connect().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(TransportEvent::Closed(reason)) = events.recv().await {
                assert_eq!(reason, CloseReason::Remote);
                return;
            }
        }
    })
    .await
    .expect("stream end not reported");
    assert!(!transport.is_connected());

    let err = transport.request("ping", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McpHubError>(),
        Some(McpHubError::Closed { .. })
    ));
}

#[tokio::test]
async fn test_subscription_http_error_fails_connect() {
    let addr = serve(Mode::default()).await;
    let params = StreamParams {
        url: format!("http://{addr}/missing"),
        headers: Default::default(),
    };
    let transport = StreamTransport::new("sse", params, Duration::from_secs(3)).unwrap();
    let err = transport.connect().await.unwrap_err();
    assert!(err.to_string().contains("404"));
    assert!(!transport.is_connected());
}
