use std::fmt;

use cdp_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories surfaced by session actions.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum MuxErrorKind {
    #[error("No browser session")]
    NoSession,
    #[error("Browser not connected")]
    NotConnected,
    #[error("cdp call failed")]
    Cdp,
    #[error("target gone")]
    TargetGone,
    #[error("element not resolvable")]
    ElementNotFound,
    #[error("internal error")]
    Internal,
}

/// A typed action error with an optional human-readable hint. The hint, when
/// present, is the message clients see verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MuxError {
    pub kind: MuxErrorKind,
    pub hint: Option<String>,
}

impl MuxError {
    pub fn new(kind: MuxErrorKind) -> Self {
        Self { kind, hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// The string surfaced to clients in `{success:false, message}` replies.
    pub fn public_message(&self) -> String {
        match &self.hint {
            Some(hint) => hint.clone(),
            None => self.kind.to_string(),
        }
    }
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for MuxError {}

impl From<TransportError> for MuxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => MuxError::new(MuxErrorKind::NotConnected),
            TransportError::Cdp { message, .. } => {
                MuxError::new(MuxErrorKind::Cdp).with_hint(message)
            }
            TransportError::Io(message) => MuxError::new(MuxErrorKind::Cdp).with_hint(message),
        }
    }
}
