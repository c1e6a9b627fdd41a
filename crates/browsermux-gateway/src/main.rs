use std::net::SocketAddr;

use anyhow::{Context, Result};
use browsermux_core::{MuxConfig, SessionRegistry};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "browsermuxd", about = "Remote browser mediation gateway")]
struct Args {
    /// Address the client websocket endpoint listens on.
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,

    /// Upstream browser pool host.
    #[arg(long, env = "BROWSER_ENDPOINT_HOST")]
    browser_host: Option<String>,

    /// Upstream browser pool port.
    #[arg(long, env = "BROWSER_ENDPOINT_PORT")]
    browser_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut cfg = MuxConfig::default();
    if let Some(host) = args.browser_host {
        cfg.browser_endpoint_host = host;
    }
    if let Some(port) = args.browser_port {
        cfg.browser_endpoint_port = port;
    }

    info!(
        listen = %args.listen,
        browser = %format!("{}:{}", cfg.browser_endpoint_host, cfg.browser_endpoint_port),
        "starting browsermux gateway"
    );

    let registry = SessionRegistry::new(cfg);
    let app = browsermux_gateway::router(registry);

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind gateway on {}", args.listen))?;
    axum::serve(listener, app.into_make_service())
        .await
        .context("gateway server exited unexpectedly")?;
    Ok(())
}
