//! End-to-end tests against a stub session authority over a real WebSocket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use quizsync_client::{GameSessionClient, PingOutcome};
use quizsync_core::errors::ClientError;
use quizsync_core::model::{AnswerSubmission, ConnectionState};
use quizsync_core::protocol::{events, lifecycle};
use quizsync_settings::ClientSettings;

const TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN: &str = "good-token";

/// Boot a stub authority and return its WS URL.
async fn boot_authority() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _accept = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let _conn = tokio::spawn(serve(stream));
        }
    });
    format!("ws://{addr}/ws")
}

#[allow(clippy::result_large_err)]
fn check_token(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    if presented == Some(format!("Bearer {TOKEN}").as_str()) {
        Ok(resp)
    } else {
        let mut err = ErrorResponse::new(Some("unauthorized".to_owned()));
        *err.status_mut() = StatusCode::UNAUTHORIZED;
        Err(err)
    }
}

async fn serve(stream: TcpStream) {
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, check_token).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let id = frame.get("id").cloned();
        let data = &frame["data"];
        let reply = match frame["type"].as_str().unwrap_or_default() {
            "session.join" if data["sessionId"] == "sess-1" => Some(json!({
                "type": "session.joined",
                "sessionId": "sess-1",
                "replyTo": id,
                "data": {"userId": data["userId"]},
            })),
            "session.join" => Some(json!({
                "type": "session.error",
                "replyTo": id,
                "data": {"message": "Game session not found"},
            })),
            "heartbeat.ping" => Some(json!({"type": "heartbeat.pong", "replyTo": id, "data": {}})),
            "session.action" => Some(json!({
                "type": "session.action_ack",
                "replyTo": id,
                "data": {"action": data["action"], "ok": true},
            })),
            "session.broadcast" if data["eventType"] == "__close" => {
                let _ = ws.close(None).await;
                return;
            }
            "session.broadcast" => Some(json!({
                "type": "session.realtime_event",
                "sessionId": data["sessionId"],
                "data": {"eventType": data["eventType"], "eventData": data["eventData"]},
            })),
            // answers are never acknowledged by this stub
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = ws.send(Message::text(reply.to_string())).await;
        }
    }
}

fn settings(url: &str) -> ClientSettings {
    let mut s = ClientSettings::default();
    s.connection.url = url.to_owned();
    s.reconnect.base_delay_ms = 50;
    s.timeouts.answer_ms = 300;
    s
}

async fn connected_client() -> GameSessionClient {
    let url = boot_authority().await;
    let client = GameSessionClient::new(settings(&url));
    client.connect(Some(TOKEN.into())).await.unwrap();
    client
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn join_resolves_against_live_authority() {
    let client = connected_client().await;
    assert_eq!(client.state(), ConnectionState::Connected);
    let joined = timeout(TIMEOUT, client.join("sess-1", "u-42")).await.unwrap();
    assert_eq!(joined, Ok(true));
    client.disconnect();
}

#[tokio::test]
async fn unknown_session_is_rejected_verbatim() {
    let client = connected_client().await;
    let err = timeout(TIMEOUT, client.join("missing", "u-42"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_string(), "Game session not found");
    assert!(matches!(err, ClientError::Rejected { .. }));
    client.disconnect();
}

#[tokio::test]
async fn bad_token_is_a_connection_error() {
    let url = boot_authority().await;
    let client = GameSessionClient::new(settings(&url));
    let errors = Arc::new(AtomicUsize::new(0));
    let errors2 = Arc::clone(&errors);
    let _ = client.on(lifecycle::CONNECTION_ERROR, move |_| {
        let _ = errors2.fetch_add(1, Ordering::SeqCst);
    });

    let err = client.connect(Some("wrong".into())).await.unwrap_err();
    assert!(matches!(err, ClientError::Connection(ref m) if m.contains("401")), "{err}");
    assert!(errors.load(Ordering::SeqCst) >= 1);
    client.disconnect();
}

#[tokio::test]
async fn unanswered_submission_times_out_and_stays_connected() {
    let client = connected_client().await;
    let err = timeout(
        TIMEOUT,
        client.submit_answer("sess-1", AnswerSubmission::new("q-3", "B", 4200)),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert_eq!(client.state(), ConnectionState::Connected);
    client.disconnect();
}

#[tokio::test]
async fn host_action_is_acknowledged() {
    let client = connected_client().await;
    let paused = timeout(TIMEOUT, client.pause("sess-1")).await.unwrap();
    assert_eq!(paused, Ok(true));
    client.disconnect();
}

#[tokio::test]
async fn diagnostics_ping_round_trip() {
    let client = connected_client().await;
    let report = timeout(TIMEOUT, client.perform_diagnostics()).await.unwrap();
    assert!(report.connected);
    assert_eq!(report.ping, PingOutcome::Success);
    assert!(report.connection_id.is_some());
    client.disconnect();
}

#[tokio::test]
async fn realtime_broadcast_is_relayed() {
    let client = connected_client().await;
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let _ = client.on(events::REALTIME_EVENT, move |e| seen2.lock().push(e.data.clone()));

    client.send_chat_message("sess-1", "hello");
    eventually(|| !seen.lock().is_empty()).await;
    assert_eq!(
        seen.lock()[0],
        json!({"eventType": "chat_message", "eventData": {"message": "hello"}})
    );
    client.disconnect();
}

#[tokio::test]
async fn authority_close_triggers_reconnect() {
    let client = connected_client().await;
    let first = client.connection_id();
    let connects = Arc::new(AtomicUsize::new(0));
    let connects2 = Arc::clone(&connects);
    let _ = client.on(lifecycle::CONNECTED, move |_| {
        let _ = connects2.fetch_add(1, Ordering::SeqCst);
    });

    client.broadcast_realtime_event("sess-1", "__close", Value::Null);
    eventually(|| connects.load(Ordering::SeqCst) == 1).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_ne!(client.connection_id(), first);
    assert_eq!(client.connection().reconnect_attempts(), 0);
    let joined = timeout(TIMEOUT, client.join("sess-1", "u-42")).await.unwrap();
    assert_eq!(joined, Ok(true));
    client.disconnect();
}
