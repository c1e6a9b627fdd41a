use std::env;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the mediation tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Upstream browser pool address; the pool proxies
    /// `GET /browser?token=…` websocket upgrades to the browser's CDP
    /// endpoint.
    pub browser_endpoint_host: String,
    pub browser_endpoint_port: u16,
    pub screencast_quality: u32,
    pub screencast_every_nth_frame: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub viewport_scale: f64,
    pub viewport_mobile: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            browser_endpoint_host: env_or("BROWSER_ENDPOINT_HOST", "127.0.0.1".to_string()),
            browser_endpoint_port: env_or("BROWSER_ENDPOINT_PORT", 9300),
            screencast_quality: env_or("SCREENCAST_QUALITY", 60),
            screencast_every_nth_frame: env_or("SCREENCAST_EVERY_NTH_FRAME", 3),
            viewport_width: 1280,
            viewport_height: 720,
            viewport_scale: 1.0,
            viewport_mobile: false,
        }
    }
}

impl MuxConfig {
    /// Websocket URL of the browser addressed by `token`.
    pub fn browser_ws_url(&self, token: &str) -> String {
        format!(
            "ws://{}:{}/browser?token={}",
            self.browser_endpoint_host, self.browser_endpoint_port, token
        )
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}
