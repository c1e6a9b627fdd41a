//! One live browser, many clients.
//!
//! A [`BrowserSession`] wraps the CDP channel for one browser token. It
//! elects and attaches the active page, re-elects it under target lifecycle
//! churn, injects input, answers snapshot/screenshot requests, and runs the
//! screencast only while at least one viewer is watching.
//!
//! All public methods serialize on the session state mutex; the event loop
//! competes for the same mutex, so handlers and actions never interleave
//! mid-sequence. Transport replies are delivered by an independent task and
//! are never blocked by that lock.

use std::collections::HashSet;
use std::sync::Arc;

use cdp_transport::{CdpTransport, CommandTarget, TransportEvent, WsTransport};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, ClientId};
use crate::config::MuxConfig;
use crate::error::{MuxError, MuxErrorKind};
use crate::events::{PageInfo, SessionEvent};
use crate::keymap::{modifier_flags, windows_virtual_key_code, KeyModifiers};
use crate::metrics;

const BLANK_URL: &str = "about:blank";

/// Modifier keys currently held down on the remote page. `ctrl` covers both
/// the client's ctrl and meta flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PressedModifiers {
    ctrl: bool,
    alt: bool,
    shift: bool,
}

impl PressedModifiers {
    fn flags(&self) -> u32 {
        (self.alt as u32) | ((self.ctrl as u32) << 1) | ((self.shift as u32) << 3)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    active_session_id: Option<String>,
    active_target_id: Option<String>,
    current_url: String,
    screencast_running: bool,
    pressed: PressedModifiers,
    /// Targets already seen, so the discovery replay after
    /// `Target.setDiscoverTargets` does not re-trigger page switches.
    known_targets: HashSet<String>,
}

/// Options for [`BrowserSession::get_screenshot`].
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenshotOptions {
    pub format: String,
    pub quality: u32,
    pub full_page: bool,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self {
            format: "png".to_string(),
            quality: 80,
            full_page: false,
        }
    }
}

pub struct BrowserSession {
    token: String,
    cfg: MuxConfig,
    transport: Arc<dyn CdpTransport>,
    state: Mutex<SessionState>,
    clients: DashMap<ClientId, ClientHandle>,
    shutdown: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserSession {
    pub fn new(
        token: impl Into<String>,
        cfg: MuxConfig,
        transport: Arc<dyn CdpTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            cfg,
            transport,
            state: Mutex::new(SessionState::default()),
            clients: DashMap::new(),
            shutdown: CancellationToken::new(),
            event_task: Mutex::new(None),
        })
    }

    /// Dial the browser addressed by `token` through the upstream pool.
    pub async fn connect(token: impl Into<String>, cfg: MuxConfig) -> Result<Arc<Self>, MuxError> {
        let token = token.into();
        let ws_url = cfg.browser_ws_url(&token);
        let transport = WsTransport::connect(&ws_url)
            .await
            .map_err(|err| MuxError::new(MuxErrorKind::NotConnected).with_hint(err.to_string()))?;
        Ok(Self::new(token, cfg, Arc::new(transport)))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Run the attach protocol and start consuming transport events.
    pub async fn start(self: &Arc<Self>) -> Result<(), MuxError> {
        self.initialize().await?;
        self.spawn_event_loop().await;
        Ok(())
    }

    async fn initialize(&self) -> Result<(), MuxError> {
        let mut state = self.state.lock().await;

        self.call("Target.setDiscoverTargets", json!({ "discover": true }))
            .await?;

        let target_id = match self.find_active_target(&mut state).await? {
            Some(target_id) => target_id,
            None => {
                let created = self
                    .call("Target.createTarget", json!({ "url": BLANK_URL }))
                    .await?;
                created
                    .get("targetId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        MuxError::new(MuxErrorKind::Internal)
                            .with_hint("createTarget reply missing targetId")
                    })?
                    .to_string()
            }
        };
        state.known_targets.insert(target_id.clone());

        self.attach_to_page(&mut state, &target_id).await?;

        info!(
            target: "browser-session",
            token = %self.token,
            target_id = %target_id,
            url = %state.current_url,
            "session connected"
        );
        self.broadcast(SessionEvent::Connected {
            url: state.current_url.clone(),
            target_id: Some(target_id),
        });
        self.broadcast_page_list(&state).await;
        Ok(())
    }

    /// Probe every page target for `document.visibilityState`. Falls back to
    /// the first non-blank page, then any page; `None` means the browser has
    /// no page at all and the caller must create one.
    async fn find_active_target(
        &self,
        state: &mut SessionState,
    ) -> Result<Option<String>, MuxError> {
        let pages = self.fetch_page_list().await?;
        for page in &pages {
            state.known_targets.insert(page.target_id.clone());
        }

        let candidates: Vec<&PageInfo> = pages.iter().filter(|p| p.url != BLANK_URL).collect();

        for page in &candidates {
            match self.probe_visibility(&page.target_id).await {
                Ok(true) => return Ok(Some(page.target_id.clone())),
                Ok(false) => {}
                Err(err) => {
                    debug!(
                        target: "browser-session",
                        target_id = %page.target_id,
                        %err,
                        "visibility probe failed; skipping target"
                    );
                }
            }
        }

        if let Some(page) = candidates.first() {
            return Ok(Some(page.target_id.clone()));
        }
        Ok(pages.first().map(|p| p.target_id.clone()))
    }

    /// Temporarily attach to one target and ask the page how visible it is.
    async fn probe_visibility(&self, target_id: &str) -> Result<bool, MuxError> {
        let attached = self
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MuxError::new(MuxErrorKind::Internal).with_hint("attachToTarget missing sessionId")
            })?
            .to_string();

        let _ = self.page_call(&session_id, "Runtime.enable", json!({})).await;
        let result = self
            .page_call(
                &session_id,
                "Runtime.evaluate",
                json!({ "expression": "document.visibilityState", "returnByValue": true }),
            )
            .await;
        let _ = self
            .call(
                "Target.detachFromTarget",
                json!({ "sessionId": session_id }),
            )
            .await;

        let visibility = result?;
        Ok(visibility
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(Value::as_str)
            == Some("visible"))
    }

    /// Attach protocol steps against one target: flattened attach, domain
    /// enables, URL read, viewport override, screencast when watched.
    async fn attach_to_page(
        &self,
        state: &mut SessionState,
        target_id: &str,
    ) -> Result<(), MuxError> {
        let attached = self
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MuxError::new(MuxErrorKind::TargetGone)
                    .with_hint(format!("could not attach to target {target_id}"))
            })?
            .to_string();

        state.active_session_id = Some(session_id.clone());
        state.active_target_id = Some(target_id.to_string());

        self.page_call(&session_id, "Page.enable", json!({})).await?;
        self.page_call(&session_id, "Runtime.enable", json!({})).await?;

        let frame_tree = self
            .page_call(&session_id, "Page.getFrameTree", json!({}))
            .await?;
        state.current_url = frame_tree
            .pointer("/frameTree/frame/url")
            .and_then(Value::as_str)
            .unwrap_or(BLANK_URL)
            .to_string();

        self.page_call(
            &session_id,
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": self.cfg.viewport_width,
                "height": self.cfg.viewport_height,
                "deviceScaleFactor": self.cfg.viewport_scale,
                "mobile": self.cfg.viewport_mobile,
            }),
        )
        .await?;

        if self.viewer_count() > 0 {
            self.start_screencast(state).await;
        }
        Ok(())
    }

    // ---- page switching -------------------------------------------------

    pub async fn switch_to_page(&self, target_id: &str) -> Result<(), MuxError> {
        let mut state = self.state.lock().await;
        self.switch_to_page_locked(&mut state, target_id).await
    }

    async fn switch_to_page_locked(
        &self,
        state: &mut SessionState,
        target_id: &str,
    ) -> Result<(), MuxError> {
        if state.active_target_id.as_deref() == Some(target_id) {
            return Ok(());
        }

        if state.screencast_running {
            if let Some(sid) = state.active_session_id.clone() {
                let _ = self
                    .page_call(&sid, "Page.stopScreencast", json!({}))
                    .await;
            }
            state.screencast_running = false;
        }

        if let Some(sid) = state.active_session_id.take() {
            let _ = self
                .call("Target.detachFromTarget", json!({ "sessionId": sid }))
                .await;
        }
        state.active_target_id = None;

        if let Err(err) = self
            .call("Target.activateTarget", json!({ "targetId": target_id }))
            .await
        {
            warn!(target: "browser-session", %err, "activateTarget failed");
        }

        self.attach_to_page(state, target_id).await?;
        self.push_initial_frame(state).await;

        self.broadcast(SessionEvent::PageSwitched {
            target_id: target_id.to_string(),
            url: state.current_url.clone(),
        });
        self.broadcast_page_list(state).await;
        Ok(())
    }

    /// One still frame right after a switch, so a quiet page does not look
    /// frozen until the next screencast frame arrives.
    async fn push_initial_frame(&self, state: &SessionState) {
        let Some(sid) = state.active_session_id.clone() else {
            return;
        };
        match self
            .page_call(
                &sid,
                "Page.captureScreenshot",
                json!({ "format": "jpeg", "quality": 60 }),
            )
            .await
        {
            Ok(reply) => {
                if let Some(data) = reply.get("data").and_then(Value::as_str) {
                    self.broadcast(SessionEvent::Frame(data.to_string()));
                }
            }
            Err(err) => {
                debug!(target: "browser-session", %err, "initial frame push failed");
            }
        }
    }

    // ---- navigation -----------------------------------------------------

    pub async fn navigate(&self, url: &str) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        self.page_call(&sid, "Page.navigate", json!({ "url": url }))
            .await
            .map(|_| ())
    }

    pub async fn go_back(&self) -> Result<(), MuxError> {
        self.step_history(-1).await
    }

    pub async fn go_forward(&self) -> Result<(), MuxError> {
        self.step_history(1).await
    }

    async fn step_history(&self, delta: i64) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        let history = self
            .page_call(&sid, "Page.getNavigationHistory", json!({}))
            .await?;
        let current = history
            .get("currentIndex")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let entries = history
            .get("entries")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let index = current + delta;
        if index < 0 || index as usize >= entries.len() {
            // Nothing in that direction; mirror the browser UI and do nothing.
            return Ok(());
        }
        let Some(entry_id) = entries[index as usize].get("id").and_then(Value::as_i64) else {
            return Ok(());
        };
        self.page_call(
            &sid,
            "Page.navigateToHistoryEntry",
            json!({ "entryId": entry_id }),
        )
        .await
        .map(|_| ())
    }

    pub async fn reload(&self) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        self.page_call(&sid, "Page.reload", json!({})).await.map(|_| ())
    }

    // ---- page management ------------------------------------------------

    /// The target listener picks the new page up and switches to it.
    pub async fn create_new_page(&self, url: Option<&str>) -> Result<(), MuxError> {
        let url = url.filter(|u| !u.is_empty()).unwrap_or(BLANK_URL);
        self.call("Target.createTarget", json!({ "url": url }))
            .await
            .map(|_| ())
    }

    pub async fn close_page(&self, target_id: &str) -> Result<(), MuxError> {
        self.call("Target.closeTarget", json!({ "targetId": target_id }))
            .await
            .map(|_| ())
    }

    // ---- pointer input --------------------------------------------------

    pub async fn click_at(&self, x: f64, y: f64) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        self.dispatch_click(&sid, x, y).await
    }

    async fn dispatch_click(&self, sid: &str, x: f64, y: f64) -> Result<(), MuxError> {
        self.page_call(
            sid,
            "Input.dispatchMouseEvent",
            json!({ "type": "mousePressed", "x": x, "y": y, "button": "left", "clickCount": 1 }),
        )
        .await?;
        self.page_call(
            sid,
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseReleased", "x": x, "y": y, "button": "left", "clickCount": 1 }),
        )
        .await
        .map(|_| ())
    }

    pub async fn mouse_move(&self, x: f64, y: f64) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        self.page_call(
            &sid,
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseMoved", "x": x, "y": y }),
        )
        .await
        .map(|_| ())
    }

    pub async fn scroll(&self, x: f64, y: f64, delta_x: f64, delta_y: f64) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        self.page_call(
            &sid,
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseWheel", "x": x, "y": y, "deltaX": delta_x, "deltaY": delta_y }),
        )
        .await
        .map(|_| ())
    }

    // ---- keyboard input -------------------------------------------------
    //
    // Modifier discipline: a primary key never reaches the page with a
    // modifier flag set unless the matching modifier key-down was sent
    // first. Presses synthesize in Ctrl, Alt, Shift order; releases unwind
    // in reverse.

    pub async fn key_down(
        &self,
        key: &str,
        code: &str,
        modifiers: KeyModifiers,
    ) -> Result<(), MuxError> {
        let mut state = self.state.lock().await;
        let sid = Self::require_session(&state)?;

        let want_ctrl = modifiers.ctrl || modifiers.meta;
        if want_ctrl && !state.pressed.ctrl {
            let flags = state.pressed.flags();
            self.dispatch_key(&sid, "keyDown", "Control", "ControlLeft", 17, flags)
                .await?;
            state.pressed.ctrl = true;
        }
        if modifiers.alt && !state.pressed.alt {
            let flags = state.pressed.flags();
            self.dispatch_key(&sid, "keyDown", "Alt", "AltLeft", 18, flags)
                .await?;
            state.pressed.alt = true;
        }
        if modifiers.shift && !state.pressed.shift {
            let flags = state.pressed.flags();
            self.dispatch_key(&sid, "keyDown", "Shift", "ShiftLeft", 16, flags)
                .await?;
            state.pressed.shift = true;
        }

        let flags = modifier_flags(&modifiers);
        let vk = windows_virtual_key_code(key);
        self.dispatch_key(&sid, "keyDown", key, code, vk, flags)
            .await?;

        if key.chars().count() == 1 {
            self.page_call(
                &sid,
                "Input.dispatchKeyEvent",
                json!({ "type": "char", "text": key, "key": key, "modifiers": flags }),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn key_up(
        &self,
        key: &str,
        code: &str,
        modifiers: KeyModifiers,
    ) -> Result<(), MuxError> {
        let mut state = self.state.lock().await;
        let sid = Self::require_session(&state)?;

        let flags = modifier_flags(&modifiers);
        let vk = windows_virtual_key_code(key);
        self.dispatch_key(&sid, "keyUp", key, code, vk, flags).await?;

        let want_ctrl = modifiers.ctrl || modifiers.meta;
        if state.pressed.shift && !modifiers.shift {
            state.pressed.shift = false;
            let flags = state.pressed.flags();
            self.dispatch_key(&sid, "keyUp", "Shift", "ShiftLeft", 16, flags)
                .await?;
        }
        if state.pressed.alt && !modifiers.alt {
            state.pressed.alt = false;
            let flags = state.pressed.flags();
            self.dispatch_key(&sid, "keyUp", "Alt", "AltLeft", 18, flags)
                .await?;
        }
        if state.pressed.ctrl && !want_ctrl {
            state.pressed.ctrl = false;
            let flags = state.pressed.flags();
            self.dispatch_key(&sid, "keyUp", "Control", "ControlLeft", 17, flags)
                .await?;
        }
        Ok(())
    }

    async fn dispatch_key(
        &self,
        sid: &str,
        kind: &str,
        key: &str,
        code: &str,
        vk: u32,
        flags: u32,
    ) -> Result<(), MuxError> {
        self.page_call(
            sid,
            "Input.dispatchKeyEvent",
            json!({
                "type": kind,
                "key": key,
                "code": code,
                "modifiers": flags,
                "windowsVirtualKeyCode": vk,
                "nativeVirtualKeyCode": vk,
            }),
        )
        .await
        .map(|_| ())
    }

    // ---- IME and direct insertion ---------------------------------------

    pub async fn ime_set_composition(
        &self,
        text: &str,
        selection_start: i64,
        selection_end: i64,
    ) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        self.page_call(
            &sid,
            "Input.imeSetComposition",
            json!({ "text": text, "selectionStart": selection_start, "selectionEnd": selection_end }),
        )
        .await
        .map(|_| ())
    }

    pub async fn ime_commit_composition(&self, text: &str) -> Result<(), MuxError> {
        self.insert_text(text).await
    }

    pub async fn insert_text(&self, text: &str) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;
        self.page_call(&sid, "Input.insertText", json!({ "text": text }))
            .await
            .map(|_| ())
    }

    // ---- snapshot and element-targeted actions --------------------------

    /// `{"snapshot": …}` with either the compact text rendering or the
    /// (optionally filtered) node array.
    pub async fn get_snapshot(
        &self,
        interesting_only: bool,
        compressed: bool,
    ) -> Result<Value, MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;

        let _ = self
            .page_call(&sid, "Accessibility.enable", json!({}))
            .await;
        let reply = self
            .page_call(&sid, "Accessibility.getFullAXTree", json!({}))
            .await?;
        let nodes: Vec<Value> = reply
            .get("nodes")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                MuxError::new(MuxErrorKind::Internal)
                    .with_hint("getFullAXTree reply missing nodes")
            })?;

        let nodes = if interesting_only {
            ax_snapshot::filter_interesting(&nodes)
        } else {
            nodes
        };

        let snapshot = if compressed {
            Value::String(ax_snapshot::render_text(&nodes))
        } else {
            Value::Array(nodes)
        };
        Ok(json!({ "snapshot": snapshot }))
    }

    /// Click the center of an element addressed by its backend DOM node id,
    /// as resolved from a snapshot line.
    pub async fn click_node(&self, backend_node_id: i64) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;

        self.page_call(&sid, "DOM.enable", json!({})).await?;
        let box_model = self
            .page_call(
                &sid,
                "DOM.getBoxModel",
                json!({ "backendNodeId": backend_node_id }),
            )
            .await
            .unwrap_or(Value::Null);

        let content: Vec<f64> = box_model
            .pointer("/model/content")
            .and_then(Value::as_array)
            .map(|quad| quad.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        if content.len() != 8 {
            return Err(MuxError::new(MuxErrorKind::ElementNotFound).with_hint(format!(
                "Element with backendNodeId {backend_node_id} not found or has no box model"
            )));
        }

        let x = (content[0] + content[2] + content[4] + content[6]) / 4.0;
        let y = (content[1] + content[3] + content[5] + content[7]) / 4.0;
        self.dispatch_click(&sid, x, y).await
    }

    /// Replace an element's value: focus, select-all, wipe, insert.
    pub async fn fill_node(&self, backend_node_id: i64, value: &str) -> Result<(), MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;

        self.page_call(&sid, "DOM.enable", json!({})).await?;
        self.page_call(
            &sid,
            "DOM.focus",
            json!({ "backendNodeId": backend_node_id }),
        )
        .await?;

        self.dispatch_key(&sid, "keyDown", "a", "KeyA", 65, 2).await?;
        self.dispatch_key(&sid, "keyUp", "a", "KeyA", 65, 2).await?;
        self.dispatch_key(&sid, "keyDown", "Backspace", "Backspace", 8, 0)
            .await?;
        self.dispatch_key(&sid, "keyUp", "Backspace", "Backspace", 8, 0)
            .await?;

        self.page_call(&sid, "Input.insertText", json!({ "text": value }))
            .await
            .map(|_| ())
    }

    // ---- screenshot -----------------------------------------------------

    /// `{"data": <base64>, "format": …}`.
    pub async fn get_screenshot(&self, opts: ScreenshotOptions) -> Result<Value, MuxError> {
        let state = self.state.lock().await;
        let sid = Self::require_session(&state)?;

        let mut params = serde_json::Map::new();
        params.insert("format".into(), json!(opts.format.clone()));
        if opts.full_page {
            let layout = self
                .page_call(&sid, "Page.getLayoutMetrics", json!({}))
                .await?;
            let width = layout
                .pointer("/contentSize/width")
                .and_then(Value::as_f64)
                .unwrap_or(self.cfg.viewport_width as f64);
            let height = layout
                .pointer("/contentSize/height")
                .and_then(Value::as_f64)
                .unwrap_or(self.cfg.viewport_height as f64);
            params.insert(
                "clip".into(),
                json!({ "x": 0, "y": 0, "width": width, "height": height, "scale": 1 }),
            );
            params.insert("captureBeyondViewport".into(), json!(true));
        }
        if opts.format != "png" {
            params.insert("quality".into(), json!(opts.quality));
        }

        let reply = self
            .page_call(&sid, "Page.captureScreenshot", Value::Object(params))
            .await?;
        let data = reply
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MuxError::new(MuxErrorKind::Internal)
                    .with_hint("captureScreenshot reply missing data")
            })?;
        Ok(json!({ "data": data, "format": opts.format }))
    }

    // ---- screencast -----------------------------------------------------

    async fn start_screencast(&self, state: &mut SessionState) {
        if state.screencast_running {
            return;
        }
        let Some(sid) = state.active_session_id.clone() else {
            return;
        };
        match self
            .page_call(
                &sid,
                "Page.startScreencast",
                json!({
                    "format": "jpeg",
                    "quality": self.cfg.screencast_quality,
                    "maxWidth": self.cfg.viewport_width,
                    "maxHeight": self.cfg.viewport_height,
                    "everyNthFrame": self.cfg.screencast_every_nth_frame,
                }),
            )
            .await
        {
            Ok(_) => state.screencast_running = true,
            Err(err) => {
                warn!(target: "browser-session", token = %self.token, %err, "startScreencast failed");
            }
        }
    }

    async fn stop_screencast(&self, state: &mut SessionState) {
        if !state.screencast_running {
            return;
        }
        if let Some(sid) = state.active_session_id.clone() {
            let _ = self.page_call(&sid, "Page.stopScreencast", json!({})).await;
        }
        state.screencast_running = false;
    }

    // ---- client set (mutated only by the registry) ----------------------

    pub(crate) async fn add_client(&self, handle: ClientHandle) {
        let is_viewer = handle.is_viewer();
        self.clients.insert(handle.id, handle);
        if is_viewer {
            let mut state = self.state.lock().await;
            if !state.screencast_running && state.active_session_id.is_some() {
                self.start_screencast(&mut state).await;
            }
        }
    }

    pub(crate) async fn remove_client(&self, id: ClientId) {
        self.clients.remove(&id);
        if self.viewer_count() == 0 {
            let mut state = self.state.lock().await;
            self.stop_screencast(&mut state).await;
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_viewer()).count()
    }

    pub(crate) fn send_to(&self, id: ClientId, event: SessionEvent) {
        if let Some(client) = self.clients.get(&id) {
            client.send(event);
        }
    }

    fn broadcast(&self, event: SessionEvent) {
        for client in self.clients.iter().filter(|c| c.is_viewer()) {
            client.send(event.clone());
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Disconnect protocol: stop the screencast, detach from the page,
    /// close the transport. Run by the registry when the last client leaves.
    pub(crate) async fn disconnect(&self) {
        self.shutdown.cancel();
        {
            let mut state = self.state.lock().await;
            self.stop_screencast(&mut state).await;
            if let Some(sid) = state.active_session_id.take() {
                let _ = self
                    .call("Target.detachFromTarget", json!({ "sessionId": sid }))
                    .await;
            }
            state.active_target_id = None;
        }
        self.transport.close().await;
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!(target: "browser-session", token = %self.token, "session disconnected");
    }

    pub async fn current_url(&self) -> String {
        self.state.lock().await.current_url.clone()
    }

    pub async fn active_target_id(&self) -> Option<String> {
        self.state.lock().await.active_target_id.clone()
    }

    // ---- event loop -----------------------------------------------------

    async fn spawn_event_loop(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.shutdown.cancelled() => break,
                    event = session.transport.next_event() => {
                        match event {
                            Some(ev) => session.handle_transport_event(ev).await,
                            None => {
                                session.handle_transport_disconnect().await;
                                break;
                            }
                        }
                    }
                }
            }
            debug!(target: "browser-session", token = %session.token, "event loop exiting");
        });
        *self.event_task.lock().await = Some(task);
    }

    async fn handle_transport_disconnect(&self) {
        warn!(target: "browser-session", token = %self.token, "browser connection lost");
        {
            let mut state = self.state.lock().await;
            state.active_session_id = None;
            state.active_target_id = None;
            state.screencast_running = false;
        }
        self.broadcast(SessionEvent::Error("Browser connection lost".to_string()));
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        metrics::record_event();
        match event.method.as_str() {
            "Target.targetCreated" => self.on_target_created(event.params).await,
            "Target.targetDestroyed" => self.on_target_destroyed(event.params).await,
            "Target.targetInfoChanged" => self.on_target_info_changed(event.params).await,
            "Page.frameNavigated" => self.on_frame_navigated(event).await,
            "Page.screencastFrame" => self.on_screencast_frame(event).await,
            "Page.screencastVisibilityChanged" => {
                debug!(target: "browser-session", params = %event.params, "screencast visibility changed");
            }
            _ => {
                debug!(target: "browser-session", method = %event.method, "unhandled cdp event");
            }
        }
    }

    async fn on_target_created(&self, params: Value) {
        let Ok(payload) = serde_json::from_value::<TargetLifecycleParams>(params) else {
            return;
        };
        if payload.target_info.target_type != "page" {
            return;
        }
        let info = payload.target_info.into_page_info();

        let mut state = self.state.lock().await;
        // The discovery replay after setDiscoverTargets re-announces every
        // existing target; only genuinely new pages trigger a switch.
        if !state.known_targets.insert(info.target_id.clone()) {
            return;
        }

        self.broadcast(SessionEvent::PageCreated(info.clone()));
        if let Err(err) = self.switch_to_page_locked(&mut state, &info.target_id).await {
            warn!(target: "browser-session", %err, "switch to created page failed");
            self.broadcast(SessionEvent::Error(err.public_message()));
            self.broadcast_page_list(&state).await;
        }
    }

    async fn on_target_destroyed(&self, params: Value) {
        let Ok(payload) = serde_json::from_value::<TargetDestroyedParams>(params) else {
            return;
        };
        let target_id = payload.target_id;

        let mut state = self.state.lock().await;
        if !state.known_targets.remove(&target_id) {
            return;
        }
        self.broadcast(SessionEvent::PageDestroyed {
            target_id: target_id.clone(),
        });

        if state.active_target_id.as_deref() == Some(target_id.as_str()) {
            // The attached page died under us; its session and screencast
            // died with it.
            state.active_session_id = None;
            state.active_target_id = None;
            state.screencast_running = false;

            match self.pick_replacement_target(&mut state).await {
                Ok(replacement) => {
                    if let Err(err) =
                        self.switch_to_page_locked(&mut state, &replacement).await
                    {
                        warn!(target: "browser-session", %err, "switch to replacement page failed");
                        self.broadcast(SessionEvent::Error(err.public_message()));
                    }
                }
                Err(err) => {
                    warn!(target: "browser-session", %err, "no replacement page available");
                    self.broadcast(SessionEvent::Error(err.public_message()));
                }
            }
        }
        self.broadcast_page_list(&state).await;
    }

    async fn pick_replacement_target(
        &self,
        state: &mut SessionState,
    ) -> Result<String, MuxError> {
        let pages = self.fetch_page_list().await?;
        if let Some(page) = pages.first() {
            return Ok(page.target_id.clone());
        }

        let created = self
            .call("Target.createTarget", json!({ "url": BLANK_URL }))
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MuxError::new(MuxErrorKind::Internal)
                    .with_hint("createTarget reply missing targetId")
            })?
            .to_string();
        state.known_targets.insert(target_id.clone());
        Ok(target_id)
    }

    async fn on_target_info_changed(&self, params: Value) {
        let Ok(payload) = serde_json::from_value::<TargetLifecycleParams>(params) else {
            return;
        };
        if payload.target_info.target_type != "page" {
            return;
        }
        let info = payload.target_info.into_page_info();

        let state = self.state.lock().await;
        if !state.known_targets.contains(&info.target_id) {
            return;
        }
        self.broadcast(SessionEvent::PageInfoChanged(info));
        self.broadcast_page_list(&state).await;
    }

    async fn on_frame_navigated(&self, event: TransportEvent) {
        let mut state = self.state.lock().await;
        if event.session_id != state.active_session_id {
            return;
        }
        let Ok(payload) = serde_json::from_value::<FrameNavigatedParams>(event.params) else {
            return;
        };
        // Sub-frame navigations carry a parentId; only the main frame moves
        // the session URL.
        if payload.frame.parent_id.is_some() {
            return;
        }
        state.current_url = payload.frame.url.clone();
        self.broadcast(SessionEvent::UrlChanged(payload.frame.url));
    }

    async fn on_screencast_frame(&self, event: TransportEvent) {
        {
            let state = self.state.lock().await;
            if event.session_id != state.active_session_id {
                return;
            }
        }
        let Some(page_session) = event.session_id else {
            return;
        };
        let Ok(payload) = serde_json::from_value::<ScreencastFrameParams>(event.params) else {
            return;
        };

        metrics::record_frame();
        self.broadcast(SessionEvent::Frame(payload.data));

        // Ack with the *screencast* session id from the frame payload, not
        // the CDP page session id. Fire-and-forget: a slow ack would stall
        // the whole event loop and CDP stops producing frames without it.
        let transport = Arc::clone(&self.transport);
        let frame_session = payload.session_id;
        tokio::spawn(async move {
            let _ = transport
                .call(
                    CommandTarget::Session(page_session),
                    "Page.screencastFrameAck",
                    json!({ "sessionId": frame_session }),
                )
                .await;
        });
    }

    // ---- page list ------------------------------------------------------

    async fn fetch_page_list(&self) -> Result<Vec<PageInfo>, MuxError> {
        let reply = self.call("Target.getTargets", json!({})).await?;
        let infos = reply
            .get("targetInfos")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(infos
            .into_iter()
            .filter_map(|info| serde_json::from_value::<TargetInfoPayload>(info).ok())
            .filter(|info| info.target_type == "page")
            .map(TargetInfoPayload::into_page_info)
            .collect())
    }

    async fn broadcast_page_list(&self, state: &SessionState) {
        match self.fetch_page_list().await {
            Ok(pages) => {
                self.broadcast(SessionEvent::PageList {
                    pages,
                    active_target_id: state.active_target_id.clone(),
                });
            }
            Err(err) => {
                debug!(target: "browser-session", %err, "page list refresh failed");
            }
        }
    }

    // ---- transport plumbing ---------------------------------------------

    fn require_session(state: &SessionState) -> Result<String, MuxError> {
        state
            .active_session_id
            .clone()
            .ok_or_else(|| MuxError::new(MuxErrorKind::NotConnected))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, MuxError> {
        metrics::record_command();
        match self
            .transport
            .call(CommandTarget::Browser, method, params)
            .await
        {
            Ok(value) => Ok(value),
            Err(err) => {
                metrics::record_command_failure();
                Err(err.into())
            }
        }
    }

    async fn page_call(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, MuxError> {
        metrics::record_command();
        match self
            .transport
            .call(
                CommandTarget::Session(session_id.to_string()),
                method,
                params,
            )
            .await
        {
            Ok(value) => Ok(value),
            Err(err) => {
                metrics::record_command_failure();
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TargetLifecycleParams {
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, Deserialize)]
struct TargetDestroyedParams {
    #[serde(rename = "targetId")]
    target_id: String,
}

#[derive(Debug, Deserialize)]
struct TargetInfoPayload {
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
}

impl TargetInfoPayload {
    fn into_page_info(self) -> PageInfo {
        PageInfo {
            target_id: self.target_id,
            url: self.url,
            title: self.title,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FrameNavigatedParams {
    frame: FrameInfo,
}

#[derive(Debug, Deserialize)]
struct FrameInfo {
    #[serde(default)]
    url: String,
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScreencastFrameParams {
    data: String,
    #[serde(rename = "sessionId")]
    session_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::sleep;

    use crate::client::ClientKind;
    use crate::testing::MockTransport;

    type ViewerRx = mpsc::UnboundedReceiver<SessionEvent>;

    async fn boot(
        with_viewer: bool,
    ) -> (
        Arc<BrowserSession>,
        Arc<MockTransport>,
        mpsc::Sender<TransportEvent>,
        Option<ViewerRx>,
    ) {
        let (transport, events) = MockTransport::new_pair();
        transport
            .script_boot("page-1", "sess-1", "https://example.com")
            .await;
        let session = BrowserSession::new(
            "tok-test",
            MuxConfig::default(),
            transport.clone() as Arc<dyn CdpTransport>,
        );
        let rx = if with_viewer {
            let (tx, rx) = mpsc::unbounded_channel();
            session
                .add_client(ClientHandle::new(ClientId::new(), ClientKind::Viewer, tx))
                .await;
            Some(rx)
        } else {
            None
        };
        session.start().await.expect("session start");
        (session, transport, events, rx)
    }

    fn drain(rx: &mut ViewerRx) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn event_names(events: &[SessionEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.to_wire().0).collect()
    }

    async fn wait_for_active(session: &Arc<BrowserSession>, target_id: &str) {
        for _ in 0..200 {
            if session.active_target_id().await.as_deref() == Some(target_id) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("target {target_id} never became active");
    }

    #[tokio::test]
    async fn attach_protocol_issues_the_documented_sequence() {
        let (session, transport, _events, mut rx) = boot(true).await;

        assert_eq!(
            transport.methods().await,
            vec![
                "Target.setDiscoverTargets",
                "Target.getTargets",
                "Target.attachToTarget",
                "Runtime.enable",
                "Runtime.evaluate",
                "Target.detachFromTarget",
                "Target.attachToTarget",
                "Page.enable",
                "Runtime.enable",
                "Page.getFrameTree",
                "Emulation.setDeviceMetricsOverride",
                "Page.startScreencast",
                "Target.getTargets",
            ],
        );

        assert_eq!(
            session.active_target_id().await.as_deref(),
            Some("page-1")
        );
        assert_eq!(session.current_url().await, "https://example.com");
        assert!(session.state.lock().await.screencast_running);

        let names = event_names(&drain(rx.as_mut().unwrap()));
        assert_eq!(names, vec!["browser:connected", "browser:pageList"]);
    }

    #[tokio::test]
    async fn viewport_override_uses_the_default_viewport() {
        let (_session, transport, _events, _rx) = boot(false).await;
        let calls = transport
            .calls_for("Emulation.setDeviceMetricsOverride")
            .await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params["width"], 1280);
        assert_eq!(calls[0].params["height"], 720);
        assert_eq!(calls[0].params["deviceScaleFactor"], 1.0);
        assert_eq!(calls[0].params["mobile"], false);
        assert_eq!(calls[0].session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn page_switch_preserves_screencast_and_pushes_one_frame() {
        let (session, transport, _events, mut rx) = boot(true).await;
        drain(rx.as_mut().unwrap());
        transport.clear_calls().await;

        transport
            .script("Target.attachToTarget", json!({ "sessionId": "sess-2" }))
            .await;
        transport
            .script(
                "Page.getFrameTree",
                json!({ "frameTree": { "frame": { "id": "f2", "url": "https://second.example" } } }),
            )
            .await;
        transport
            .script("Page.captureScreenshot", json!({ "data": "still-frame" }))
            .await;

        session.switch_to_page("page-2").await.expect("switch");

        assert_eq!(
            transport.methods().await,
            vec![
                "Page.stopScreencast",
                "Target.detachFromTarget",
                "Target.activateTarget",
                "Target.attachToTarget",
                "Page.enable",
                "Runtime.enable",
                "Page.getFrameTree",
                "Emulation.setDeviceMetricsOverride",
                "Page.startScreencast",
                "Page.captureScreenshot",
                "Target.getTargets",
            ],
        );

        let detach = transport.calls_for("Target.detachFromTarget").await;
        assert_eq!(detach[0].params["sessionId"], "sess-1");
        let capture = transport.calls_for("Page.captureScreenshot").await;
        assert_eq!(capture[0].params["format"], "jpeg");
        assert_eq!(capture[0].params["quality"], 60);
        assert_eq!(capture[0].session_id.as_deref(), Some("sess-2"));

        let events = drain(rx.as_mut().unwrap());
        let names = event_names(&events);
        assert_eq!(
            names,
            vec!["browser:frame", "browser:pageSwitched", "browser:pageList"],
            "exactly one initial frame, then the switch notifications"
        );
        match &events[1] {
            SessionEvent::PageSwitched { target_id, url } => {
                assert_eq!(target_id, "page-2");
                assert_eq!(url, "https://second.example");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn switch_to_active_page_is_a_no_op() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;
        session.switch_to_page("page-1").await.expect("no-op switch");
        assert!(transport.methods().await.is_empty());
    }

    #[tokio::test]
    async fn modifier_state_machine_matches_the_contract() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        let ctrl = KeyModifiers {
            ctrl: true,
            ..KeyModifiers::default()
        };
        let none = KeyModifiers::default();

        session.key_down("a", "KeyA", ctrl).await.unwrap();
        session.key_down("c", "KeyC", ctrl).await.unwrap();
        session.key_up("c", "KeyC", ctrl).await.unwrap();
        session.key_up("a", "KeyA", none).await.unwrap();

        let keys = transport.calls_for("Input.dispatchKeyEvent").await;
        let trace: Vec<(String, String, u64)> = keys
            .iter()
            .map(|call| {
                let kind = call.params["type"].as_str().unwrap().to_string();
                let key = call.params["key"]
                    .as_str()
                    .or_else(|| call.params["text"].as_str())
                    .unwrap()
                    .to_string();
                (kind, key, call.params["modifiers"].as_u64().unwrap())
            })
            .collect();

        assert_eq!(
            trace,
            vec![
                ("keyDown".into(), "Control".into(), 0),
                ("keyDown".into(), "a".into(), 2),
                ("char".into(), "a".into(), 2),
                ("keyDown".into(), "c".into(), 2),
                ("char".into(), "c".into(), 2),
                ("keyUp".into(), "c".into(), 2),
                ("keyUp".into(), "a".into(), 0),
                ("keyUp".into(), "Control".into(), 0),
            ],
        );

        assert_eq!(
            session.state.lock().await.pressed,
            PressedModifiers::default(),
            "all modifiers released at the end"
        );
    }

    #[tokio::test]
    async fn synthetic_modifiers_stack_in_press_order() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        let all = KeyModifiers {
            ctrl: true,
            alt: true,
            shift: true,
            meta: false,
        };
        session.key_down("X", "KeyX", all).await.unwrap();

        let keys = transport.calls_for("Input.dispatchKeyEvent").await;
        let synth: Vec<(String, u64)> = keys
            .iter()
            .take(3)
            .map(|call| {
                (
                    call.params["key"].as_str().unwrap().to_string(),
                    call.params["modifiers"].as_u64().unwrap(),
                )
            })
            .collect();
        // Each synthetic press carries only the modifiers already down.
        assert_eq!(
            synth,
            vec![
                ("Control".into(), 0),
                ("Alt".into(), 2),
                ("Shift".into(), 3),
            ],
        );
        assert_eq!(keys[3].params["modifiers"], 11, "primary carries all flags");
    }

    #[tokio::test]
    async fn meta_is_absorbed_by_ctrl() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        let meta = KeyModifiers {
            meta: true,
            ..KeyModifiers::default()
        };
        session.key_down("v", "KeyV", meta).await.unwrap();

        let keys = transport.calls_for("Input.dispatchKeyEvent").await;
        assert_eq!(keys[0].params["key"], "Control");
        assert_eq!(keys[0].params["windowsVirtualKeyCode"], 17);
        assert_eq!(keys[1].params["modifiers"], 4, "primary keeps the meta flag");
        assert!(session.state.lock().await.pressed.ctrl);
    }

    #[tokio::test]
    async fn click_by_backend_node_id_hits_the_box_center() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        transport
            .script(
                "DOM.getBoxModel",
                json!({ "model": { "content": [10, 20, 110, 20, 110, 60, 10, 60] } }),
            )
            .await;

        session.click_node(42).await.expect("click");

        assert_eq!(
            transport.methods().await,
            vec![
                "DOM.enable",
                "DOM.getBoxModel",
                "Input.dispatchMouseEvent",
                "Input.dispatchMouseEvent",
            ],
        );
        let box_call = transport.calls_for("DOM.getBoxModel").await;
        assert_eq!(box_call[0].params["backendNodeId"], 42);

        let mouse = transport.calls_for("Input.dispatchMouseEvent").await;
        assert_eq!(mouse[0].params["type"], "mousePressed");
        assert_eq!(mouse[0].params["x"], 60.0);
        assert_eq!(mouse[0].params["y"], 40.0);
        assert_eq!(mouse[0].params["button"], "left");
        assert_eq!(mouse[0].params["clickCount"], 1);
        assert_eq!(mouse[1].params["type"], "mouseReleased");
    }

    #[tokio::test]
    async fn click_without_box_model_reports_the_exact_message() {
        let (session, _transport, _events, _rx) = boot(false).await;

        let err = session.click_node(42).await.expect_err("no box model");
        assert_eq!(err.kind, MuxErrorKind::ElementNotFound);
        assert_eq!(
            err.public_message(),
            "Element with backendNodeId 42 not found or has no box model"
        );
    }

    #[tokio::test]
    async fn fill_selects_all_wipes_and_inserts() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        session.fill_node(5, "hello").await.expect("fill");

        assert_eq!(
            transport.methods().await,
            vec![
                "DOM.enable",
                "DOM.focus",
                "Input.dispatchKeyEvent",
                "Input.dispatchKeyEvent",
                "Input.dispatchKeyEvent",
                "Input.dispatchKeyEvent",
                "Input.insertText",
            ],
        );

        let keys = transport.calls_for("Input.dispatchKeyEvent").await;
        assert_eq!(keys[0].params["key"], "a");
        assert_eq!(keys[0].params["modifiers"], 2);
        assert_eq!(keys[0].params["windowsVirtualKeyCode"], 65);
        assert_eq!(keys[2].params["key"], "Backspace");
        assert_eq!(keys[2].params["windowsVirtualKeyCode"], 8);

        let insert = transport.calls_for("Input.insertText").await;
        assert_eq!(insert[0].params["text"], "hello");
    }

    #[tokio::test]
    async fn election_prefers_the_visible_page() {
        let (transport, _events) = MockTransport::new_pair();
        let listing = json!({
            "targetInfos": [
                { "targetId": "P1", "type": "page", "url": "about:blank", "title": "" },
                { "targetId": "P2", "type": "page", "url": "https://example.com", "title": "" },
                { "targetId": "P3", "type": "page", "url": "https://foo.com", "title": "" },
            ],
        });
        transport.script("Target.getTargets", listing.clone()).await;
        transport
            .script("Target.attachToTarget", json!({ "sessionId": "probe-2" }))
            .await;
        transport
            .script(
                "Runtime.evaluate",
                json!({ "result": { "value": "hidden" } }),
            )
            .await;
        transport
            .script("Target.attachToTarget", json!({ "sessionId": "probe-3" }))
            .await;
        transport
            .script(
                "Runtime.evaluate",
                json!({ "result": { "value": "visible" } }),
            )
            .await;
        transport
            .script("Target.attachToTarget", json!({ "sessionId": "sess-3" }))
            .await;
        transport
            .script(
                "Page.getFrameTree",
                json!({ "frameTree": { "frame": { "url": "https://foo.com" } } }),
            )
            .await;
        transport.script("Target.getTargets", listing).await;

        let session = BrowserSession::new(
            "tok-election",
            MuxConfig::default(),
            transport.clone() as Arc<dyn CdpTransport>,
        );
        session.start().await.expect("start");

        assert_eq!(session.active_target_id().await.as_deref(), Some("P3"));
        let attaches = transport.calls_for("Target.attachToTarget").await;
        let targets: Vec<&str> = attaches
            .iter()
            .map(|c| c.params["targetId"].as_str().unwrap())
            .collect();
        assert_eq!(targets, vec!["P2", "P3", "P3"], "blank page is never probed");
        assert!(attaches
            .iter()
            .all(|c| c.params["flatten"] == true));
    }

    #[tokio::test]
    async fn election_falls_back_to_first_non_blank_page() {
        let (transport, _events) = MockTransport::new_pair();
        let listing = json!({
            "targetInfos": [
                { "targetId": "P1", "type": "page", "url": "about:blank", "title": "" },
                { "targetId": "P2", "type": "page", "url": "https://example.com", "title": "" },
                { "targetId": "P3", "type": "page", "url": "https://foo.com", "title": "" },
            ],
        });
        transport.script("Target.getTargets", listing).await;
        for probe in ["probe-2", "probe-3"] {
            transport
                .script("Target.attachToTarget", json!({ "sessionId": probe }))
                .await;
            transport
                .script(
                    "Runtime.evaluate",
                    json!({ "result": { "value": "hidden" } }),
                )
                .await;
        }
        transport
            .script("Target.attachToTarget", json!({ "sessionId": "sess-2" }))
            .await;

        let session = BrowserSession::new(
            "tok-election",
            MuxConfig::default(),
            transport.clone() as Arc<dyn CdpTransport>,
        );
        session.start().await.expect("start");

        assert_eq!(session.active_target_id().await.as_deref(), Some("P2"));
    }

    #[tokio::test]
    async fn election_accepts_a_lone_blank_page() {
        let (transport, _events) = MockTransport::new_pair();
        transport
            .script(
                "Target.getTargets",
                json!({
                    "targetInfos": [
                        { "targetId": "P1", "type": "page", "url": "about:blank", "title": "" },
                    ],
                }),
            )
            .await;
        transport
            .script("Target.attachToTarget", json!({ "sessionId": "sess-1" }))
            .await;

        let session = BrowserSession::new(
            "tok-election",
            MuxConfig::default(),
            transport.clone() as Arc<dyn CdpTransport>,
        );
        session.start().await.expect("start");

        assert_eq!(session.active_target_id().await.as_deref(), Some("P1"));
        assert_eq!(transport.calls_for("Runtime.evaluate").await.len(), 0);
    }

    #[tokio::test]
    async fn empty_browser_gets_a_fresh_blank_page() {
        let (transport, _events) = MockTransport::new_pair();
        transport
            .script("Target.getTargets", json!({ "targetInfos": [] }))
            .await;
        transport
            .script("Target.createTarget", json!({ "targetId": "page-new" }))
            .await;
        transport
            .script("Target.attachToTarget", json!({ "sessionId": "sess-new" }))
            .await;

        let session = BrowserSession::new(
            "tok-empty",
            MuxConfig::default(),
            transport.clone() as Arc<dyn CdpTransport>,
        );
        session.start().await.expect("start");

        let creates = transport.calls_for("Target.createTarget").await;
        assert_eq!(creates[0].params["url"], "about:blank");
        assert_eq!(
            session.active_target_id().await.as_deref(),
            Some("page-new")
        );
    }

    #[tokio::test]
    async fn screencast_follows_viewer_count() {
        let (session, transport, _events, _rx) = boot(false).await;
        assert!(
            transport.calls_for("Page.startScreencast").await.is_empty(),
            "no screencast without viewers"
        );

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let viewer1 = ClientId::new();
        session
            .add_client(ClientHandle::new(viewer1, ClientKind::Viewer, tx1))
            .await;
        assert!(session.state.lock().await.screencast_running);
        let starts = transport.calls_for("Page.startScreencast").await;
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].params["format"], "jpeg");
        assert_eq!(starts[0].params["quality"], 60);
        assert_eq!(starts[0].params["maxWidth"], 1280);
        assert_eq!(starts[0].params["maxHeight"], 720);
        assert_eq!(starts[0].params["everyNthFrame"], 3);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let viewer2 = ClientId::new();
        session
            .add_client(ClientHandle::new(viewer2, ClientKind::Viewer, tx2))
            .await;
        assert_eq!(
            transport.calls_for("Page.startScreencast").await.len(),
            1,
            "screencast started once"
        );

        session.remove_client(viewer1).await;
        assert!(session.state.lock().await.screencast_running);

        session.remove_client(viewer2).await;
        assert!(!session.state.lock().await.screencast_running);
        assert_eq!(transport.calls_for("Page.stopScreencast").await.len(), 1);
    }

    #[tokio::test]
    async fn api_clients_do_not_start_the_screencast() {
        let (session, transport, _events, _rx) = boot(false).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        session
            .add_client(ClientHandle::new(ClientId::new(), ClientKind::Api, tx))
            .await;
        assert!(transport.calls_for("Page.startScreencast").await.is_empty());
        assert!(!session.state.lock().await.screencast_running);
    }

    #[tokio::test]
    async fn new_target_event_switches_to_the_new_page() {
        let (session, transport, events, mut rx) = boot(true).await;
        drain(rx.as_mut().unwrap());
        transport.clear_calls().await;

        transport
            .script("Target.attachToTarget", json!({ "sessionId": "sess-9" }))
            .await;
        transport
            .script(
                "Page.getFrameTree",
                json!({ "frameTree": { "frame": { "url": "https://nine.example" } } }),
            )
            .await;
        transport
            .script("Page.captureScreenshot", json!({ "data": "frame-9" }))
            .await;

        events
            .send(TransportEvent {
                method: "Target.targetCreated".into(),
                params: json!({
                    "targetInfo": {
                        "targetId": "page-9",
                        "type": "page",
                        "url": "https://nine.example",
                        "title": "Nine",
                    },
                }),
                session_id: None,
            })
            .await
            .unwrap();

        wait_for_active(&session, "page-9").await;

        let names = event_names(&drain(rx.as_mut().unwrap()));
        assert_eq!(
            names,
            vec![
                "browser:pageCreated",
                "browser:frame",
                "browser:pageSwitched",
                "browser:pageList",
            ],
        );
    }

    #[tokio::test]
    async fn rediscovered_targets_do_not_cause_spurious_switches() {
        let (session, transport, events, _rx) = boot(false).await;
        transport.clear_calls().await;

        events
            .send(TransportEvent {
                method: "Target.targetCreated".into(),
                params: json!({
                    "targetInfo": {
                        "targetId": "page-1",
                        "type": "page",
                        "url": "https://example.com",
                        "title": "Page",
                    },
                }),
                session_id: None,
            })
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert!(transport.methods().await.is_empty());
        assert_eq!(
            session.active_target_id().await.as_deref(),
            Some("page-1")
        );
    }

    #[tokio::test]
    async fn destroyed_active_target_elects_a_replacement() {
        let (session, transport, events, mut rx) = boot(true).await;
        drain(rx.as_mut().unwrap());
        transport.clear_calls().await;

        transport
            .script(
                "Target.getTargets",
                json!({
                    "targetInfos": [
                        { "targetId": "page-2", "type": "page", "url": "https://two.example", "title": "Two" },
                    ],
                }),
            )
            .await;
        transport
            .script("Target.attachToTarget", json!({ "sessionId": "sess-2" }))
            .await;
        transport
            .script(
                "Page.getFrameTree",
                json!({ "frameTree": { "frame": { "url": "https://two.example" } } }),
            )
            .await;

        events
            .send(TransportEvent {
                method: "Target.targetDestroyed".into(),
                params: json!({ "targetId": "page-1" }),
                session_id: None,
            })
            .await
            .unwrap();

        wait_for_active(&session, "page-2").await;

        let names = event_names(&drain(rx.as_mut().unwrap()));
        assert_eq!(names[0], "browser:pageDestroyed");
        assert!(names.contains(&"browser:pageSwitched"));
    }

    #[tokio::test]
    async fn main_frame_navigation_updates_the_url() {
        let (session, _transport, events, mut rx) = boot(true).await;
        drain(rx.as_mut().unwrap());

        // Sub-frame navigations and foreign sessions are ignored.
        events
            .send(TransportEvent {
                method: "Page.frameNavigated".into(),
                params: json!({ "frame": { "url": "https://iframe.example", "parentId": "root" } }),
                session_id: Some("sess-1".into()),
            })
            .await
            .unwrap();
        events
            .send(TransportEvent {
                method: "Page.frameNavigated".into(),
                params: json!({ "frame": { "url": "https://other.example" } }),
                session_id: Some("sess-ghost".into()),
            })
            .await
            .unwrap();
        events
            .send(TransportEvent {
                method: "Page.frameNavigated".into(),
                params: json!({ "frame": { "url": "https://moved.example" } }),
                session_id: Some("sess-1".into()),
            })
            .await
            .unwrap();

        for _ in 0..200 {
            if session.current_url().await == "https://moved.example" {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.current_url().await, "https://moved.example");

        let events = drain(rx.as_mut().unwrap());
        let urls: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::UrlChanged(url) => Some(url.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(urls, vec!["https://moved.example"]);
    }

    #[tokio::test]
    async fn screencast_frames_fan_out_and_are_acked() {
        let (session, transport, events, mut rx) = boot(true).await;
        drain(rx.as_mut().unwrap());
        transport.clear_calls().await;

        events
            .send(TransportEvent {
                method: "Page.screencastFrame".into(),
                params: json!({ "data": "jpeg-bytes", "sessionId": 77, "metadata": {} }),
                session_id: Some("sess-1".into()),
            })
            .await
            .unwrap();

        let mut acks = Vec::new();
        for _ in 0..200 {
            acks = transport.calls_for("Page.screencastFrameAck").await;
            if !acks.is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].params["sessionId"], 77);
        assert_eq!(acks[0].session_id.as_deref(), Some("sess-1"));

        let frames = drain(rx.as_mut().unwrap());
        match &frames[0] {
            SessionEvent::Frame(data) => assert_eq!(data, "jpeg-bytes"),
            other => panic!("unexpected event {other:?}"),
        }
        let _ = session;
    }

    #[tokio::test]
    async fn stale_screencast_frames_are_dropped() {
        let (_session, transport, events, mut rx) = boot(true).await;
        drain(rx.as_mut().unwrap());
        transport.clear_calls().await;

        events
            .send(TransportEvent {
                method: "Page.screencastFrame".into(),
                params: json!({ "data": "old", "sessionId": 5 }),
                session_id: Some("sess-stale".into()),
            })
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert!(drain(rx.as_mut().unwrap()).is_empty());
        assert!(transport.calls_for("Page.screencastFrameAck").await.is_empty());
    }

    #[tokio::test]
    async fn transport_loss_surfaces_an_error_and_fails_later_calls() {
        let (session, _transport, events, mut rx) = boot(true).await;
        drain(rx.as_mut().unwrap());

        drop(events);

        let mut saw_error = false;
        for _ in 0..200 {
            if drain(rx.as_mut().unwrap())
                .iter()
                .any(|e| matches!(e, SessionEvent::Error(_)))
            {
                saw_error = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(saw_error, "viewer must hear about the lost browser");

        let err = session
            .navigate("https://example.com")
            .await
            .expect_err("no page attached after disconnect");
        assert_eq!(err.kind, MuxErrorKind::NotConnected);
        assert_eq!(err.public_message(), "Browser not connected");
    }

    #[tokio::test]
    async fn history_steps_only_when_an_entry_exists() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        transport
            .script(
                "Page.getNavigationHistory",
                json!({
                    "currentIndex": 0,
                    "entries": [ { "id": 11, "url": "https://example.com" } ],
                }),
            )
            .await;
        session.go_back().await.expect("edge go_back is a no-op");
        assert!(transport
            .calls_for("Page.navigateToHistoryEntry")
            .await
            .is_empty());

        transport
            .script(
                "Page.getNavigationHistory",
                json!({
                    "currentIndex": 1,
                    "entries": [
                        { "id": 11, "url": "https://example.com" },
                        { "id": 12, "url": "https://example.com/next" },
                    ],
                }),
            )
            .await;
        session.go_back().await.expect("go_back");
        let nav = transport.calls_for("Page.navigateToHistoryEntry").await;
        assert_eq!(nav[0].params["entryId"], 11);
    }

    #[tokio::test]
    async fn screenshot_options_shape_the_capture_call() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        transport
            .script("Page.captureScreenshot", json!({ "data": "png-bytes" }))
            .await;
        let reply = session
            .get_screenshot(ScreenshotOptions::default())
            .await
            .expect("png screenshot");
        assert_eq!(reply["data"], "png-bytes");
        assert_eq!(reply["format"], "png");
        let capture = transport.calls_for("Page.captureScreenshot").await;
        assert!(
            capture[0].params.get("quality").is_none(),
            "png never sends quality"
        );

        transport.clear_calls().await;
        transport
            .script(
                "Page.getLayoutMetrics",
                json!({ "contentSize": { "x": 0, "y": 0, "width": 900.0, "height": 4000.0 } }),
            )
            .await;
        transport
            .script("Page.captureScreenshot", json!({ "data": "jpeg-bytes" }))
            .await;
        let reply = session
            .get_screenshot(ScreenshotOptions {
                format: "jpeg".into(),
                quality: 70,
                full_page: true,
            })
            .await
            .expect("full page screenshot");
        assert_eq!(reply["format"], "jpeg");

        let capture = transport.calls_for("Page.captureScreenshot").await;
        assert_eq!(capture[0].params["quality"], 70);
        assert_eq!(capture[0].params["captureBeyondViewport"], true);
        assert_eq!(capture[0].params["clip"]["width"], 900.0);
        assert_eq!(capture[0].params["clip"]["height"], 4000.0);
        assert_eq!(capture[0].params["clip"]["scale"], 1);
    }

    #[tokio::test]
    async fn snapshot_compresses_the_ax_tree() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport.clear_calls().await;

        transport
            .script(
                "Accessibility.getFullAXTree",
                json!({
                    "nodes": [
                        {
                            "nodeId": "1",
                            "ignored": false,
                            "role": { "value": "RootWebArea" },
                            "name": { "value": "首页" },
                            "childIds": ["2", "3"],
                        },
                        {
                            "nodeId": "2",
                            "ignored": false,
                            "role": { "value": "link" },
                            "name": { "value": "VIP会员" },
                            "backendDOMNodeId": 6804,
                        },
                        {
                            "nodeId": "3",
                            "ignored": true,
                            "role": { "value": "generic" },
                        },
                    ],
                }),
            )
            .await;

        let reply = session.get_snapshot(true, true).await.expect("snapshot");
        let text = reply["snapshot"].as_str().expect("compressed text");
        assert!(text.contains("uid=1_6804 link \"VIP会员\""));
        assert!(!text.contains("generic"));

        let enables = transport.calls_for("Accessibility.enable").await;
        assert_eq!(enables.len(), 1);
    }

    #[tokio::test]
    async fn uncompressed_snapshot_returns_nodes() {
        let (session, transport, _events, _rx) = boot(false).await;
        transport
            .script(
                "Accessibility.getFullAXTree",
                json!({
                    "nodes": [
                        { "nodeId": "1", "role": { "value": "button" }, "name": { "value": "Go" } },
                    ],
                }),
            )
            .await;

        let reply = session.get_snapshot(false, false).await.expect("snapshot");
        assert_eq!(reply["snapshot"].as_array().unwrap().len(), 1);
    }
}
