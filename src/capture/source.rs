use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Backoff, CaptureBackend, CaptureConnection, CaptureError, Frame};

/// Granularity at which backoff waits observe cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Counters shared between the capture thread and the HTTP surface.
#[derive(Debug, Default)]
pub struct SourceStats {
    frames_captured: AtomicU64,
    read_failures: AtomicU64,
    open_attempts: AtomicU64,
    open_failures: AtomicU64,
    reconnects: AtomicU64,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStatsSnapshot {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub open_attempts: u64,
    pub open_failures: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub last_error: Option<String>,
}

impl SourceStats {
    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            open_attempts: self.open_attempts.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn record_error(&self, err: &CaptureError) {
        *self.last_error.lock() = Some(err.to_string());
    }
}

/// Owns the one upstream connection for a camera URL.
///
/// The connection is only ever touched by the thread driving this source;
/// nothing outside can reach it. At most one connection is live: `open`
/// releases the previous one before establishing the next.
pub struct FrameSource {
    url: String,
    backend: Box<dyn CaptureBackend>,
    connection: Option<Box<dyn CaptureConnection>>,
    backoff: Backoff,
    next_seq: u64,
    ever_connected: bool,
    stats: Arc<SourceStats>,
}

impl FrameSource {
    pub fn new(url: impl Into<String>, backend: impl CaptureBackend + 'static) -> Self {
        Self {
            url: url.into(),
            backend: Box::new(backend),
            connection: None,
            backoff: Backoff::default(),
            next_seq: 0,
            ever_connected: false,
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Establish a fresh upstream connection, releasing any live one first.
    pub fn open(&mut self) -> Result<(), CaptureError> {
        self.release();
        self.stats.open_attempts.fetch_add(1, Ordering::Relaxed);

        match self.backend.open(&self.url) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.stats.connected.store(true, Ordering::Relaxed);
                if self.ever_connected {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                self.ever_connected = true;
                info!(url = %redact(&self.url), "Connected to upstream stream");
                Ok(())
            }
            Err(e) => {
                if e.is_recoverable() {
                    self.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }

    /// Read one frame from the live connection.
    ///
    /// Any failure releases the connection; the next `open` starts over.
    pub fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| CaptureError::FrameReadFailed("not connected".to_string()))?;

        match connection.read_frame() {
            Ok(mut frame) => {
                frame.seq = self.next_seq;
                self.next_seq += 1;
                self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            Err(e) => {
                self.release();
                if matches!(e, CaptureError::FrameReadFailed(_)) {
                    self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }

    /// Next frame, reconnecting as often as it takes.
    ///
    /// `SourceUnavailable` and `FrameReadFailed` never escape; only
    /// `Fatal` and `Cancelled` do.
    pub fn next_frame(&mut self, cancel: &CancellationToken) -> Result<Frame, CaptureError> {
        loop {
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }

            if self.connection.is_none() {
                if let Err(e) = self.open() {
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = self.backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Could not open upstream, retrying"
                    );
                    wait(delay, cancel)?;
                    continue;
                }
            }

            match self.read_frame() {
                Ok(frame) => {
                    self.backoff.reset();
                    return Ok(frame);
                }
                Err(e) if e.is_recoverable() => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to read frame, reconnecting"
                    );
                    wait(delay, cancel)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn release(&mut self) {
        if self.connection.take().is_some() {
            debug!("Released upstream connection");
        }
        self.stats.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn wait(delay: Duration, cancel: &CancellationToken) -> Result<(), CaptureError> {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

/// Strip credentials from a URL before it reaches the logs.
pub(crate) fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
