//! The capture → encode → fan-out loop
//!
//! One relay runs per upstream URL regardless of how many clients are
//! attached. It lives on a blocking thread because upstream reads block;
//! publishing into the distributor never waits on a client, so client
//! speed has no influence on capture.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{DistributorStats, FrameDistributor};
use crate::capture::{CaptureError, FrameSource, SourceStats, SourceStatsSnapshot};
use crate::mjpeg::{frame_chunk, JpegEncoder};

const STATS_LOG_INTERVAL: u64 = 300;

#[derive(Debug, Default)]
struct RelayCounters {
    frames_encoded: AtomicU64,
    frames_idle: AtomicU64,
    encode_errors: AtomicU64,
}

/// Point-in-time view of the whole relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub frames_encoded: u64,
    /// Captured while no client was attached; not encoded.
    pub frames_idle: u64,
    pub encode_errors: u64,
    pub source: SourceStatsSnapshot,
    pub distribution: DistributorStats,
}

/// Cheap, clonable handle for reading relay statistics.
#[derive(Clone)]
pub struct RelayMonitor {
    counters: Arc<RelayCounters>,
    source: Arc<SourceStats>,
    distributor: Arc<FrameDistributor>,
}

impl RelayMonitor {
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            frames_idle: self.counters.frames_idle.load(Ordering::Relaxed),
            encode_errors: self.counters.encode_errors.load(Ordering::Relaxed),
            source: self.source.snapshot(),
            distribution: self.distributor.stats(),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            captured = stats.source.frames_captured,
            encoded = stats.frames_encoded,
            published = stats.distribution.frames_published,
            encode_errors = stats.encode_errors,
            reconnects = stats.source.reconnects,
            clients = stats.distribution.clients,
            "Relay stats"
        );
    }
}

pub struct Relay {
    source: FrameSource,
    encoder: JpegEncoder,
    distributor: Arc<FrameDistributor>,
    counters: Arc<RelayCounters>,
}

impl Relay {
    pub fn new(source: FrameSource, encoder: JpegEncoder, distributor: Arc<FrameDistributor>) -> Self {
        Self {
            source,
            encoder,
            distributor,
            counters: Arc::new(RelayCounters::default()),
        }
    }

    pub fn monitor(&self) -> RelayMonitor {
        RelayMonitor {
            counters: Arc::clone(&self.counters),
            source: self.source.stats(),
            distributor: Arc::clone(&self.distributor),
        }
    }

    /// Run the loop on the blocking pool until `cancel` fires or a fatal
    /// capture error occurs.
    pub fn spawn(self, cancel: CancellationToken) -> RelayHandle {
        let monitor = self.monitor();
        let task_cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || self.run(&task_cancel));
        RelayHandle {
            cancel,
            task,
            monitor,
        }
    }

    /// Blocking loop body. Only `CaptureError::Fatal` is returned as an error.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<(), CaptureError> {
        info!(quality = self.encoder.quality(), "Relay started");
        let monitor = self.monitor();

        loop {
            let frame = match self.source.next_frame(cancel) {
                Ok(frame) => frame,
                Err(CaptureError::Cancelled) => {
                    info!("Relay stopped");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Relay stopped on unrecoverable capture error");
                    return Err(e);
                }
            };

            // Keep the camera connection warm but skip the encode when nobody watches
            if self.distributor.subscriber_count() == 0 {
                self.counters.frames_idle.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match self.encoder.encode(&frame) {
                Ok(chunk) => {
                    let encoded = self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed) + 1;
                    self.distributor.publish(chunk.seq, frame_chunk(&chunk));
                    if encoded % STATS_LOG_INTERVAL == 0 {
                        monitor.log_stats();
                    }
                }
                Err(e) => {
                    self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(seq = frame.seq, error = %e, "Dropping frame that failed to encode");
                }
            }
        }
    }
}

/// Owner of a running relay task.
pub struct RelayHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), CaptureError>>,
    monitor: RelayMonitor,
}

impl RelayHandle {
    pub fn monitor(&self) -> RelayMonitor {
        self.monitor.clone()
    }

    pub fn stats(&self) -> RelayStats {
        self.monitor.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the loop to stop; it exits after the in-flight read completes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the loop to exit, surfacing a fatal capture error.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .context("relay task panicked")?
            .context("relay failed")
    }
}
