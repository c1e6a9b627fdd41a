//! Session-multiplexing middle tier for remote headless browsers.
//!
//! One [`session::BrowserSession`] per browser token owns the CDP channel,
//! tracks the active page under target lifecycle churn, and fans the
//! screencast and lifecycle events out to every attached client. The
//! [`registry::SessionRegistry`] routes client attaches onto new or existing
//! sessions and tears a session down when its last client leaves.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod keymap;
pub mod metrics;
pub mod registry;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientHandle, ClientId, ClientKind};
pub use config::MuxConfig;
pub use error::{MuxError, MuxErrorKind};
pub use events::{PageInfo, SessionEvent};
pub use registry::{AttachOutcome, SessionRegistry};
pub use session::{BrowserSession, ScreenshotOptions};
