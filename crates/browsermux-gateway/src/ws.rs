//! Websocket protocol handling.
//!
//! Inbound frames are JSON envelopes `{"id"?, "action", "payload"?}`.
//! Request/reply actions answer `{"id", "success", "data"?, "message"?}`;
//! fire-and-forget input actions answer nothing. Server pushes arrive as
//! `{"event", "payload"}`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use browsermux_core::{
    BrowserSession, ClientId, ClientKind, MuxError, MuxErrorKind, ScreenshotOptions,
    SessionRegistry,
};
use browsermux_core::keymap::KeyModifiers;

/// The external request/reply deadline; the underlying session call keeps
/// running when it fires and its eventual result is discarded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ClientRequest {
    id: Option<u64>,
    action: String,
    #[serde(default)]
    payload: Value,
}

pub(crate) async fn websocket_handler(
    State(state): State<crate::GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state.registry, socket))
}

async fn handle_socket(registry: Arc<SessionRegistry>, socket: WebSocket) {
    let client_id = ClientId::new();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // One outbound lane: replies from the request loop and session pushes
    // from the forwarder both serialize through it.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<browsermux_core::SessionEvent>();

    let forwarder_tx = outbound_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let (name, payload) = event.to_wire();
            let frame = json!({ "event": name, "payload": payload });
            if forwarder_tx.send(frame.to_string()).is_err() {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut kind: Option<ClientKind> = None;

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let request = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(target: "gateway", %client_id, %err, "unparseable client frame");
                        continue;
                    }
                };
                handle_request(
                    &registry,
                    client_id,
                    &mut kind,
                    request,
                    &events_tx,
                    &outbound_tx,
                )
                .await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Err(err) => {
                debug!(target: "gateway", %client_id, %err, "websocket error");
                break;
            }
        }
    }

    registry.on_socket_disconnect(client_id).await;
    forwarder.abort();
    writer.abort();
}

async fn handle_request(
    registry: &Arc<SessionRegistry>,
    client_id: ClientId,
    kind: &mut Option<ClientKind>,
    request: ClientRequest,
    events_tx: &mpsc::UnboundedSender<browsermux_core::SessionEvent>,
    outbound: &mpsc::UnboundedSender<String>,
) {
    let ClientRequest {
        id,
        action,
        payload,
    } = request;

    match action.as_str() {
        "browser:connect" => {
            let token = payload
                .get("token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let requested_kind = payload
                .get("clientType")
                .and_then(Value::as_str)
                .and_then(ClientKind::parse)
                .unwrap_or(ClientKind::Viewer);

            if token.is_empty() {
                send_reply(outbound, id, Err(err_msg("Missing token")));
                return;
            }

            let result = registry
                .attach(client_id, requested_kind, &token, events_tx.clone())
                .await
                .map(|outcome| json!({ "reused": outcome.reused }));
            if result.is_ok() {
                *kind = Some(requested_kind);
            }
            send_reply(outbound, id, result);
        }
        "browser:disconnect" => {
            registry.detach(client_id).await;
            *kind = None;
            send_reply(outbound, id, Ok(Value::Null));
        }

        // Fire-and-forget input: no reply, errors only logged.
        "browser:mouseMove" | "browser:scroll" | "browser:keyDown" | "browser:keyUp"
        | "browser:imeSetComposition" | "browser:imeCommitComposition"
        | "browser:insertText" => {
            let Some(session) = registry.session_for_client(client_id).await else {
                return;
            };
            if let Err(err) = dispatch_input(&session, &action, &payload).await {
                debug!(target: "gateway", %client_id, action, %err, "input dispatch failed");
            }
        }

        _ => {
            let Some(session) = registry.session_for_client(client_id).await else {
                send_reply(outbound, id, Err(MuxError::new(MuxErrorKind::NoSession)));
                return;
            };

            if is_api_only(&action) && *kind != Some(ClientKind::Api) {
                send_reply(outbound, id, Err(err_msg("API clients only")));
                return;
            }

            // Spawned so a timeout abandons the reply without cancelling
            // the in-flight CDP work.
            let task = tokio::spawn(run_action(session, action.clone(), payload));
            let result = match timeout(REQUEST_TIMEOUT, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => {
                    Err(MuxError::new(MuxErrorKind::Internal).with_hint(join_err.to_string()))
                }
                Err(_) => Err(err_msg("Request timed out")),
            };
            send_reply(outbound, id, result);
        }
    }
}

fn is_api_only(action: &str) -> bool {
    matches!(
        action,
        "browser:click" | "browser:fill" | "browser:getSnapshot" | "browser:getScreenshot"
    )
}

async fn run_action(
    session: Arc<BrowserSession>,
    action: String,
    payload: Value,
) -> Result<Value, MuxError> {
    match action.as_str() {
        "browser:navigate" => {
            let url = require_str(&payload, "url")?;
            session.navigate(&url).await.map(|_| Value::Null)
        }
        "browser:goBack" => session.go_back().await.map(|_| Value::Null),
        "browser:goForward" => session.go_forward().await.map(|_| Value::Null),
        "browser:reload" => session.reload().await.map(|_| Value::Null),
        "browser:switchPage" => {
            let target_id = require_str(&payload, "targetId")?;
            session.switch_to_page(&target_id).await.map(|_| Value::Null)
        }
        "browser:newPage" => {
            let url = payload.get("url").and_then(Value::as_str).map(str::to_owned);
            session
                .create_new_page(url.as_deref())
                .await
                .map(|_| Value::Null)
        }
        "browser:closePage" => {
            let target_id = require_str(&payload, "targetId")?;
            session.close_page(&target_id).await.map(|_| Value::Null)
        }
        "browser:clickAt" => {
            let x = require_f64(&payload, "x")?;
            let y = require_f64(&payload, "y")?;
            session.click_at(x, y).await.map(|_| Value::Null)
        }
        "browser:click" => {
            let backend_node_id = require_i64(&payload, "backendNodeId")?;
            session.click_node(backend_node_id).await.map(|_| Value::Null)
        }
        "browser:fill" => {
            let backend_node_id = require_i64(&payload, "backendNodeId")?;
            let value = require_str(&payload, "value")?;
            session
                .fill_node(backend_node_id, &value)
                .await
                .map(|_| Value::Null)
        }
        "browser:getSnapshot" => session.get_snapshot(true, true).await,
        "browser:getScreenshot" => {
            let opts: ScreenshotOptions =
                serde_json::from_value(payload).unwrap_or_default();
            session.get_screenshot(opts).await
        }
        other => Err(err_msg(format!("Unknown action {other}"))),
    }
}

async fn dispatch_input(
    session: &Arc<BrowserSession>,
    action: &str,
    payload: &Value,
) -> Result<(), MuxError> {
    match action {
        "browser:mouseMove" => {
            let x = require_f64(payload, "x")?;
            let y = require_f64(payload, "y")?;
            session.mouse_move(x, y).await
        }
        "browser:scroll" => {
            let x = require_f64(payload, "x")?;
            let y = require_f64(payload, "y")?;
            let dx = payload.get("deltaX").and_then(Value::as_f64).unwrap_or(0.0);
            let dy = payload.get("deltaY").and_then(Value::as_f64).unwrap_or(0.0);
            session.scroll(x, y, dx, dy).await
        }
        "browser:keyDown" | "browser:keyUp" => {
            let key = require_str(payload, "key")?;
            let code = payload
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or(&key)
                .to_string();
            let modifiers: KeyModifiers = payload
                .get("modifiers")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|err| err_msg(err.to_string()))?
                .unwrap_or_default();
            if action == "browser:keyDown" {
                session.key_down(&key, &code, modifiers).await
            } else {
                session.key_up(&key, &code, modifiers).await
            }
        }
        "browser:imeSetComposition" => {
            let text = require_str(payload, "text")?;
            let start = payload
                .get("selectionStart")
                .and_then(Value::as_i64)
                .unwrap_or(-1);
            let end = payload
                .get("selectionEnd")
                .and_then(Value::as_i64)
                .unwrap_or(-1);
            session.ime_set_composition(&text, start, end).await
        }
        "browser:imeCommitComposition" => {
            let text = require_str(payload, "text")?;
            session.ime_commit_composition(&text).await
        }
        "browser:insertText" => {
            let text = require_str(payload, "text")?;
            session.insert_text(&text).await
        }
        other => Err(err_msg(format!("Unknown input action {other}"))),
    }
}

fn require_str(payload: &Value, field: &str) -> Result<String, MuxError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| err_msg(format!("Missing field {field}")))
}

fn require_f64(payload: &Value, field: &str) -> Result<f64, MuxError> {
    payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| err_msg(format!("Missing field {field}")))
}

fn require_i64(payload: &Value, field: &str) -> Result<i64, MuxError> {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| err_msg(format!("Missing field {field}")))
}

fn err_msg(message: impl Into<String>) -> MuxError {
    MuxError::new(MuxErrorKind::Internal).with_hint(message.into())
}

fn send_reply(
    outbound: &mpsc::UnboundedSender<String>,
    id: Option<u64>,
    result: Result<Value, MuxError>,
) {
    let frame = match result {
        Ok(Value::Null) => json!({ "id": id, "success": true }),
        Ok(data) => json!({ "id": id, "success": true, "data": data }),
        Err(err) => json!({ "id": id, "success": false, "message": err.public_message() }),
    };
    let _ = outbound.send(frame.to_string());
}
