//! Integration tests for the stdio JSON-RPC client.
//!
//! The client runs over an in-memory duplex pipe; the test plays the app
//! server on the other end.
//!
//! Covers:
//! - the initialize handshake
//! - response correlation for concurrent calls
//! - error responses
//! - notification fan-out and server requests
//! - undecodable lines, call timeout and server EOF

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use codex_turn::connection::app_server::AppServerConnection;
use codex_turn::connection::{Connection, InboundMessage};
use codex_turn::subprocess::codec::MAX_LINE_BYTES;
use codex_turn::AppError;

struct FakeServer {
    reader: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, LinesCodec>,
}

impl FakeServer {
    async fn next(&mut self) -> Value {
        let line = self.reader.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn send(&mut self, message: Value) {
        self.writer.send(message.to_string()).await.unwrap();
    }
}

fn connect(call_timeout: Duration) -> (AppServerConnection, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let conn = AppServerConnection::from_io(client_read, client_write, call_timeout);
    let server = FakeServer {
        reader: FramedRead::new(server_read, LinesCodec::new()),
        writer: FramedWrite::new(server_write, LinesCodec::new()),
    };
    (conn, server)
}

// ── Calls ────────────────────────────────────────────────────────────────────

/// The handshake sends `initialize`, then the `initialized` notification.
#[tokio::test]
async fn initialize_handshake() {
    let (conn, mut server) = connect(Duration::from_secs(5));

    let server_side = async {
        let request = server.next().await;
        assert_eq!(request["method"], json!("initialize"));
        assert_eq!(request["jsonrpc"], json!("2.0"));
        assert_eq!(request["params"]["clientInfo"]["name"], json!("codex_turn_rs"));
        server
            .send(json!({ "id": request["id"], "result": { "userAgent": "codex" } }))
            .await;

        let notification = server.next().await;
        assert_eq!(notification["method"], json!("initialized"));
        assert!(notification.get("id").is_none());
    };

    let (result, ()) = tokio::join!(conn.initialize(), server_side);
    assert_eq!(result.unwrap(), json!({ "userAgent": "codex" }));
}

/// Responses answered out of order reach the right callers.
#[tokio::test]
async fn concurrent_calls_are_correlated() {
    let (conn, mut server) = connect(Duration::from_secs(5));

    let server_side = async {
        let first = server.next().await;
        let second = server.next().await;
        for request in [second, first] {
            server
                .send(json!({ "id": request["id"], "result": { "echo": request["method"] } }))
                .await;
        }
    };

    let (a, b, ()) = tokio::join!(
        conn.call("thread/start", json!({})),
        conn.call("model/list", json!({})),
        server_side
    );
    assert_eq!(a.unwrap(), json!({ "echo": "thread/start" }));
    assert_eq!(b.unwrap(), json!({ "echo": "model/list" }));
}

/// An error response becomes an API error carrying the payload.
#[tokio::test]
async fn error_response_is_api_error() {
    let (conn, mut server) = connect(Duration::from_secs(5));

    let server_side = async {
        let request = server.next().await;
        server
            .send(json!({
                "id": request["id"],
                "error": { "code": -32000, "message": "rate limited", "data": { "type": "rate_limit" } }
            }))
            .await;
    };

    let (result, ()) = tokio::join!(conn.call("turn/start", json!({})), server_side);
    match result {
        Err(AppError::Api { status, payload }) => {
            assert_eq!(status, None);
            assert_eq!(payload["message"], json!("rate limited"));
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

/// A call without an answer times out.
#[tokio::test]
async fn unanswered_call_times_out() {
    let (conn, mut server) = connect(Duration::from_millis(50));

    let (result, _request) = tokio::join!(conn.call("turn/start", json!({})), server.next());
    assert!(matches!(result, Err(AppError::Timeout(_))), "{result:?}");
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// Notifications reach every subscriber.
#[tokio::test]
async fn notifications_fan_out() {
    let (conn, mut server) = connect(Duration::from_secs(5));
    let mut first = conn.subscribe();
    let mut second = conn.subscribe();

    server
        .send(json!({ "method": "turn/started", "params": { "threadId": "t1" } }))
        .await;

    let expected = InboundMessage::Notification {
        method: "turn/started".into(),
        params: json!({ "threadId": "t1" }),
    };
    assert_eq!(first.recv().await, Some(expected.clone()));
    assert_eq!(second.recv().await, Some(expected));
}

/// Server requests are surfaced and answered with the same id.
#[tokio::test]
async fn server_requests_round_trip() {
    let (conn, mut server) = connect(Duration::from_secs(5));
    let mut inbound = conn.subscribe();

    server
        .send(json!({
            "id": 42,
            "method": "item/commandExecution/requestApproval",
            "params": { "threadId": "t1" }
        }))
        .await;

    let Some(InboundMessage::Request { id, method, .. }) = inbound.recv().await else {
        panic!("expected a request");
    };
    assert_eq!(method, "item/commandExecution/requestApproval");

    conn.respond(id, json!({ "decision": "accept" })).await.unwrap();
    let answer = server.next().await;
    assert_eq!(answer["id"], json!(42));
    assert_eq!(answer["result"], json!({ "decision": "accept" }));
}

/// Garbage lines are skipped without disturbing later messages.
#[tokio::test]
async fn garbage_lines_are_skipped() {
    let (conn, mut server) = connect(Duration::from_secs(5));
    let mut inbound = conn.subscribe();

    server.writer.send("not json".to_owned()).await.unwrap();
    server.send(json!([1, 2, 3])).await;
    server.send(json!({ "method": "turn/completed" })).await;

    let message = inbound.recv().await.unwrap();
    assert_eq!(message.method(), "turn/completed");
}

/// Non-UTF-8 and over-long lines are skipped without closing the
/// connection.
#[tokio::test]
async fn undecodable_lines_keep_connection_open() {
    let (conn, mut server) = connect(Duration::from_secs(5));
    let mut inbound = conn.subscribe();

    let raw = server.writer.get_mut();
    raw.write_all(b"\xff\xfe bad\n").await.unwrap();
    raw.write_all(b"{\"method\":\"item/started\"}\n").await.unwrap();

    let mut long_line = vec![b'x'; MAX_LINE_BYTES + MAX_LINE_BYTES / 10];
    long_line.push(b'\n');
    raw.write_all(&long_line).await.unwrap();
    raw.write_all(b"{\"method\":\"turn/completed\"}\n").await.unwrap();

    assert_eq!(inbound.recv().await.unwrap().method(), "item/started");
    assert_eq!(inbound.recv().await.unwrap().method(), "turn/completed");

    let server_side = async {
        let request = server.next().await;
        server.send(json!({ "id": request["id"], "result": {} })).await;
    };
    let (result, ()) = tokio::join!(conn.call("model/list", json!({})), server_side);
    assert_eq!(result.unwrap(), json!({}));
}

/// Server EOF fails pending calls and ends subscriptions.
#[tokio::test]
async fn eof_fails_pending_calls() {
    let (conn, server) = connect(Duration::from_secs(5));
    let mut inbound = conn.subscribe();
    let FakeServer {
        mut reader,
        mut writer,
    } = server;

    let server_side = async move {
        let _request = reader.next().await;
        SinkExt::<String>::close(&mut writer).await.unwrap();
        reader
    };

    let (result, _reader) = tokio::join!(conn.call("turn/start", json!({})), server_side);
    assert!(
        matches!(result, Err(AppError::Connection(_))),
        "{result:?}"
    );
    assert_eq!(inbound.recv().await, None);
    assert_eq!(conn.subscribe().recv().await, None);
}
