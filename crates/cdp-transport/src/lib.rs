//! One flattened CDP channel per browser token.
//!
//! The transport owns a single websocket to a browser's DevTools endpoint
//! (`ws://<host>:<port>/browser?token=<token>`), correlates request/reply
//! pairs by call id, and hands every unsolicited frame to the session layer
//! tagged with its CDP session id.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// An unsolicited CDP frame: an event, optionally scoped to a page session.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Where a command is addressed: the browser-level connection or one
/// attached page session (flattened mode).
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The channel dropped; every pending and future call fails with this.
    #[error("transport closed")]
    Closed,
    /// The browser answered the call with a protocol error.
    #[error("cdp error {code}: {message}")]
    Cdp { code: i64, message: String },
    #[error("cdp i/o failure: {0}")]
    Io(String),
}

impl TransportError {
    fn from_cdp(err: CdpError) -> Self {
        match err {
            CdpError::Ws(_) | CdpError::Io(_) | CdpError::NoResponse => {
                TransportError::Closed
            }
            other => TransportError::Io(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    /// Issue one CDP call and await its reply.
    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError>;

    /// Receive the next unsolicited frame. `None` means the channel ended.
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Tear the channel down, failing all in-flight calls.
    async fn close(&self);

    fn is_alive(&self) -> bool;
}

struct ControlMessage {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, TransportError>>,
}

/// Concrete transport over the chromiumoxide connection layer.
pub struct WsTransport {
    command_tx: mpsc::Sender<ControlMessage>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

impl WsTransport {
    /// Dial a CDP websocket endpoint and spawn the run loop.
    pub async fn connect(ws_url: &str) -> Result<Self, TransportError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            Self::run_loop(conn, command_rx, events_tx).await;
            loop_alive.store(false, Ordering::Relaxed);
        });

        info!(target: "cdp-transport", url = %ws_url, "cdp connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task: Mutex::new(Some(loop_task)),
            alive,
        })
    }

    async fn run_loop(
        mut conn: Connection<CdpEventMessage>,
        mut command_rx: mpsc::Receiver<ControlMessage>,
        events_tx: mpsc::Sender<TransportEvent>,
    ) {
        let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, TransportError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    Self::handle_command(&mut conn, cmd, &mut inflight);
                }
                message = conn.next() => {
                    match message {
                        Some(Ok(Message::Response(resp))) => {
                            Self::handle_response(resp, &mut inflight);
                        }
                        Some(Ok(Message::Event(event))) => {
                            Self::handle_event(event, &events_tx).await;
                        }
                        Some(Err(err)) => {
                            let failure = TransportError::from_cdp(err);
                            warn!(target: "cdp-transport", %failure, "connection failed");
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(TransportError::Closed));
                            }
                            return;
                        }
                        None => {
                            debug!(target: "cdp-transport", "connection closed by peer");
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(TransportError::Closed));
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle_command(
        conn: &mut Connection<CdpEventMessage>,
        cmd: ControlMessage,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, TransportError>>>,
    ) {
        let session = match cmd.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
        };

        let method_id: MethodId = cmd.method.into();
        match conn.submit_command(method_id, session, cmd.params) {
            Ok(call_id) => {
                inflight.insert(call_id, cmd.responder);
            }
            Err(err) => {
                let _ = cmd
                    .responder
                    .send(Err(TransportError::Io(err.to_string())));
            }
        }
    }

    fn handle_response(
        resp: Response,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, TransportError>>>,
    ) {
        let entry = inflight.remove(&resp.id);
        let result = Self::extract_payload(resp);

        if let Some(sender) = entry {
            let _ = sender.send(result);
        }
    }

    async fn handle_event(event: CdpEventMessage, events_tx: &mpsc::Sender<TransportEvent>) {
        let raw: Result<CdpJsonEventMessage, _> = event.try_into();
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target: "cdp-transport", ?err, "failed to decode cdp event");
                return;
            }
        };

        let payload = TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        };

        if events_tx.send(payload).await.is_err() {
            debug!(target: "cdp-transport", "event receiver dropped");
        }
    }

    fn extract_payload(resp: Response) -> Result<Value, TransportError> {
        if let Some(result) = resp.result {
            Ok(result)
        } else if let Some(error) = resp.error {
            Err(TransportError::Cdp {
                code: error.code,
                message: error.message,
            })
        } else {
            // A reply with neither body nor error; Target.detachFromTarget
            // answers like this on some Chromium builds.
            Ok(Value::Object(Default::default()))
        }
    }

    #[cfg(test)]
    fn stub_closed() -> Self {
        let (command_tx, _) = mpsc::channel(1);
        let (_, events_rx) = mpsc::channel(1);
        Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl CdpTransport for WsTransport {
    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)?;

        // A dropped responder means the run loop died with our call pending.
        resp_rx.await.unwrap_or(Err(TransportError::Closed))
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        if let Some(handle) = self.loop_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        if let Ok(mut guard) = self.loop_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
