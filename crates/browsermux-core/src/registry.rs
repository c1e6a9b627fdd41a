//! Process-wide routing of clients onto browser sessions.
//!
//! The registry owns every [`BrowserSession`] and knows which client hangs
//! off which token. Sessions are created lazily on the first attach for a
//! token and torn down when the last client (viewer or API) detaches.

use std::collections::HashMap;
use std::sync::Arc;

use cdp_transport::{CdpTransport, TransportError, WsTransport};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::client::{ClientHandle, ClientId, ClientKind};
use crate::config::MuxConfig;
use crate::error::{MuxError, MuxErrorKind};
use crate::events::SessionEvent;
use crate::metrics;
use crate::session::BrowserSession;

/// Whether an attach landed on an existing session or created one.
#[derive(Clone, Copy, Debug)]
pub struct AttachOutcome {
    pub reused: bool,
}

type TransportFactory = Arc<
    dyn Fn(String) -> BoxFuture<'static, Result<Arc<dyn CdpTransport>, TransportError>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct RegistryInner {
    sessions_by_token: HashMap<String, Arc<BrowserSession>>,
    token_by_client: HashMap<ClientId, String>,
}

pub struct SessionRegistry {
    cfg: MuxConfig,
    factory: TransportFactory,
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(cfg: MuxConfig) -> Arc<Self> {
        let factory: TransportFactory = Arc::new(|ws_url: String| {
            Box::pin(async move {
                let transport = WsTransport::connect(&ws_url).await?;
                Ok(Arc::new(transport) as Arc<dyn CdpTransport>)
            })
        });
        Self::with_transport_factory(cfg, factory)
    }

    pub fn with_transport_factory(cfg: MuxConfig, factory: TransportFactory) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            factory,
            inner: Mutex::new(RegistryInner::default()),
        })
    }

    /// Bind a client to the session for `token`, creating and connecting
    /// the session when this is the token's first client.
    pub async fn attach(
        &self,
        client_id: ClientId,
        kind: ClientKind,
        token: &str,
        sink: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<AttachOutcome, MuxError> {
        let mut inner = self.inner.lock().await;

        if inner.token_by_client.contains_key(&client_id) {
            self.detach_locked(&mut inner, client_id).await;
        }

        let handle = ClientHandle::new(client_id, kind, sink);

        if let Some(session) = inner.sessions_by_token.get(token).cloned() {
            session.add_client(handle).await;
            inner.token_by_client.insert(client_id, token.to_string());
            // Prime the fresh client; real page state follows with the next
            // lifecycle broadcast.
            session.send_to(
                client_id,
                SessionEvent::Connected {
                    url: String::new(),
                    target_id: None,
                },
            );
            info!(target: "session-registry", %client_id, token, "client joined existing session");
            return Ok(AttachOutcome { reused: true });
        }

        let ws_url = self.cfg.browser_ws_url(token);
        let transport = (self.factory)(ws_url).await.map_err(|err| {
            MuxError::new(MuxErrorKind::NotConnected).with_hint(err.to_string())
        })?;

        let session = BrowserSession::new(token, self.cfg.clone(), transport);
        inner
            .sessions_by_token
            .insert(token.to_string(), Arc::clone(&session));
        inner.token_by_client.insert(client_id, token.to_string());
        session.add_client(handle).await;

        if let Err(err) = session.start().await {
            warn!(target: "session-registry", token, %err, "session attach failed");
            inner.sessions_by_token.remove(token);
            inner.token_by_client.remove(&client_id);
            session.disconnect().await;
            return Err(err);
        }

        metrics::record_session_created();
        info!(target: "session-registry", %client_id, token, "session created");
        Ok(AttachOutcome { reused: false })
    }

    /// Unbind a client; destroys the session when it was the last one.
    pub async fn detach(&self, client_id: ClientId) {
        let mut inner = self.inner.lock().await;
        self.detach_locked(&mut inner, client_id).await;
    }

    pub async fn on_socket_disconnect(&self, client_id: ClientId) {
        self.detach(client_id).await;
    }

    async fn detach_locked(&self, inner: &mut RegistryInner, client_id: ClientId) {
        let Some(token) = inner.token_by_client.remove(&client_id) else {
            return;
        };
        let Some(session) = inner.sessions_by_token.get(&token).cloned() else {
            return;
        };

        session.remove_client(client_id).await;
        if session.client_count() == 0 {
            inner.sessions_by_token.remove(&token);
            session.disconnect().await;
            metrics::record_session_destroyed();
            info!(target: "session-registry", token, "last client left; session destroyed");
        }
    }

    pub async fn session_for_client(&self, client_id: ClientId) -> Option<Arc<BrowserSession>> {
        let inner = self.inner.lock().await;
        let token = inner.token_by_client.get(&client_id)?;
        inner.sessions_by_token.get(token).cloned()
    }

    /// Used by the upstream pool to refuse stopping a browser that still
    /// has clients.
    pub async fn session_by_token(&self, token: &str) -> Option<Arc<BrowserSession>> {
        self.inner.lock().await.sessions_by_token.get(token).cloned()
    }

    pub async fn client_count(&self, token: &str) -> usize {
        self.session_by_token(token)
            .await
            .map(|session| session.client_count())
            .unwrap_or(0)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions_by_token.len()
    }
}
