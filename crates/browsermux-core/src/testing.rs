//! In-process transport fake shared by session and registry tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cdp_transport::{CdpTransport, CommandTarget, TransportError, TransportEvent};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

/// Records every call and answers from per-method response queues;
/// unscripted methods reply with an empty object.
pub(crate) struct MockTransport {
    alive: AtomicBool,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<HashMap<String, VecDeque<Result<Value, TransportError>>>>,
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedCall {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

impl MockTransport {
    pub fn new_pair() -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                alive: AtomicBool::new(true),
                events_rx: Mutex::new(rx),
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(HashMap::new()),
            }),
            tx,
        )
    }

    pub async fn script(&self, method: &str, response: Value) {
        self.responses
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(response));
    }

    pub async fn script_err(&self, method: &str, err: TransportError) {
        self.responses
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push_back(Err(err));
    }

    pub async fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|call| call.method.clone())
            .collect()
    }

    pub async fn calls_for(&self, method: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// Scripts the responses one healthy boot consumes: election over a
    /// single visible page, the real attach, frame tree, and the two
    /// target listings (election + initial page list broadcast).
    pub async fn script_boot(&self, target_id: &str, session_id: &str, url: &str) {
        let listing = json!({
            "targetInfos": [
                { "targetId": target_id, "type": "page", "url": url, "title": "Page", "attached": false },
            ],
        });
        self.script("Target.getTargets", listing.clone()).await;
        self.script("Target.attachToTarget", json!({ "sessionId": format!("probe-{session_id}") }))
            .await;
        self.script(
            "Runtime.evaluate",
            json!({ "result": { "type": "string", "value": "visible" } }),
        )
        .await;
        self.script("Target.attachToTarget", json!({ "sessionId": session_id }))
            .await;
        self.script(
            "Page.getFrameTree",
            json!({ "frameTree": { "frame": { "id": "root-frame", "url": url } } }),
        )
        .await;
        self.script("Target.getTargets", listing).await;
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        let session_id = match target {
            CommandTarget::Browser => None,
            CommandTarget::Session(sid) => Some(sid),
        };
        self.calls.lock().await.push(RecordedCall {
            method: method.to_string(),
            params,
            session_id,
        });

        let mut responses = self.responses.lock().await;
        if let Some(queue) = responses.get_mut(method) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        Ok(Value::Object(Default::default()))
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
