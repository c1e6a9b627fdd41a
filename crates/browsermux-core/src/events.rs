use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// What one browser tab looks like to clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub target_id: String,
    pub url: String,
    pub title: String,
}

/// Server-push events fanned out to attached clients.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// One base64-encoded jpeg screencast (or still) frame.
    Frame(String),
    UrlChanged(String),
    Connected {
        url: String,
        target_id: Option<String>,
    },
    PageCreated(PageInfo),
    PageDestroyed {
        target_id: String,
    },
    PageInfoChanged(PageInfo),
    PageSwitched {
        target_id: String,
        url: String,
    },
    PageList {
        pages: Vec<PageInfo>,
        active_target_id: Option<String>,
    },
    Error(String),
}

impl SessionEvent {
    /// Wire name + payload for the client-facing protocol.
    pub fn to_wire(&self) -> (&'static str, Value) {
        match self {
            SessionEvent::Frame(data) => ("browser:frame", json!(data)),
            SessionEvent::UrlChanged(url) => ("browser:urlChanged", json!(url)),
            SessionEvent::Connected { url, target_id } => (
                "browser:connected",
                json!({ "url": url, "targetId": target_id }),
            ),
            SessionEvent::PageCreated(info) => ("browser:pageCreated", json!(info)),
            SessionEvent::PageDestroyed { target_id } => {
                ("browser:pageDestroyed", json!({ "targetId": target_id }))
            }
            SessionEvent::PageInfoChanged(info) => ("browser:pageInfoChanged", json!(info)),
            SessionEvent::PageSwitched { target_id, url } => (
                "browser:pageSwitched",
                json!({ "targetId": target_id, "url": url }),
            ),
            SessionEvent::PageList {
                pages,
                active_target_id,
            } => (
                "browser:pageList",
                json!({ "pages": pages, "activeTargetId": active_target_id }),
            ),
            SessionEvent::Error(message) => ("browser:error", json!(message)),
        }
    }
}
