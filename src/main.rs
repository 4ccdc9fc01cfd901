//! MJPEG relay CLI application

use anyhow::{Context, Result};
use clap::Parser;
use mjpeg_relay::capture::{FrameSource, TestPatternBackend};
use mjpeg_relay::config::{Config, SourceConfig};
use mjpeg_relay::streaming::{FrameDistributor, Relay, RelayMonitor};
use mjpeg_relay::web::{self, AppState};
use mjpeg_relay::JpegEncoder;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mjpeg-relay")]
#[command(about = "Relay a network camera to HTTP clients as an MJPEG stream")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Upstream stream URL, overrides the config file
    #[arg(long, env = "RTSP_URL")]
    url: Option<String>,

    /// Address to bind the web server to
    #[arg(long)]
    bind_ip: Option<String>,

    /// Port for the web server
    #[arg(long)]
    web_port: Option<u16>,

    /// JPEG quality (1-100)
    #[arg(long)]
    quality: Option<u8>,

    /// Serve the built-in test pattern instead of a camera
    #[arg(long)]
    test_mode: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path).with_context(|| format!("Failed to load config {}", path))?,
            None => Config::default(),
        };

        if let Some(url) = &self.url {
            config.source.url = url.clone();
        }
        if self.test_mode {
            config.source.url = "test://pattern".to_string();
        }
        if let Some(bind_ip) = &self.bind_ip {
            config.server.bind_ip = bind_ip.clone();
        }
        if let Some(port) = self.web_port {
            config.server.web_port = port;
        }
        if let Some(quality) = self.quality {
            config.encoder.quality = quality;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("MJPEG relay starting");
    let config = cli.load_config()?;

    let source = build_source(&config.source)?;
    let cancel = CancellationToken::new();
    let distributor = Arc::new(FrameDistributor::new());
    let relay = Relay::new(
        source,
        JpegEncoder::new(config.encoder.quality),
        Arc::clone(&distributor),
    );
    let monitor = relay.monitor();
    let state = AppState::new(distributor, monitor.clone(), cancel.clone());

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let relay_task = relay.spawn(cancel.clone()).join();
    let server = tokio::spawn(web::run_server(listener, state));
    tokio::spawn(log_stats_periodically(monitor, cancel.clone()));

    info!("Streaming started, press Ctrl+C to stop");
    tokio::pin!(relay_task);

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down");
            cancel.cancel();
            relay_task.await
        }
        res = &mut relay_task => {
            // Relay only returns early on an unrecoverable capture error
            cancel.cancel();
            res
        }
    };

    if let Err(e) = server.await.context("Web server task panicked")? {
        error!(error = %e, "Web server failed");
    }

    result
}

fn build_source(config: &SourceConfig) -> Result<FrameSource> {
    let source = if config.is_test_pattern() {
        FrameSource::new(
            &config.url,
            TestPatternBackend::new(config.width, config.height, config.fps),
        )
    } else {
        open_network_source(config)?
    };

    Ok(source.with_backoff(config.backoff()))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_network_source(config: &SourceConfig) -> Result<FrameSource> {
    let backend = mjpeg_relay::capture::GstBackend::new(config.open_timeout(), config.read_timeout())?;
    Ok(FrameSource::new(&config.url, backend))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_network_source(_config: &SourceConfig) -> Result<FrameSource> {
    anyhow::bail!("built without the rtsp-gstreamer feature; only test:// URLs and --test-mode are available")
}

async fn log_stats_periodically(monitor: RelayMonitor, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => monitor.log_stats(),
        }
    }
}
