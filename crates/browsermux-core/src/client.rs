use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::SessionEvent;

/// Stable identity of one client connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Viewer clients receive the screencast and lifecycle pushes; API clients
/// interact only through request/reply actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Viewer,
    Api,
}

impl ClientKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "viewer" => Some(ClientKind::Viewer),
            "api" => Some(ClientKind::Api),
            _ => None,
        }
    }
}

/// A client as the session sees it: a tag and an event sink. Ownership of
/// the connection itself stays with the registry and the outer transport;
/// dropping the sink is how a dead client disappears.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub kind: ClientKind,
    sink: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientHandle {
    pub fn new(id: ClientId, kind: ClientKind, sink: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { id, kind, sink }
    }

    pub fn is_viewer(&self) -> bool {
        self.kind == ClientKind::Viewer
    }

    /// Delivery is best-effort; a closed sink means the socket is already
    /// going away and the registry will detach it shortly.
    pub fn send(&self, event: SessionEvent) {
        let _ = self.sink.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_kinds() {
        assert_eq!(ClientKind::parse("viewer"), Some(ClientKind::Viewer));
        assert_eq!(ClientKind::parse("API"), Some(ClientKind::Api));
        assert_eq!(ClientKind::parse("bot"), None);
    }

    #[test]
    fn send_to_dropped_sink_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = ClientHandle::new(ClientId::new(), ClientKind::Viewer, tx);
        handle.send(SessionEvent::UrlChanged("https://example.com".into()));
    }
}
