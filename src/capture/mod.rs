//! Upstream camera capture
//!
//! A [`FrameSource`] owns the single connection to the camera and hides
//! transient failures from its caller: failed reads and failed opens are
//! retried with a bounded backoff until a frame arrives or the relay is
//! cancelled.

mod backoff;
#[cfg(feature = "rtsp-gstreamer")]
mod gst_backend;
mod source;
mod test_pattern;

pub use backoff::Backoff;
#[cfg(feature = "rtsp-gstreamer")]
pub use gst_backend::GstBackend;
pub use source::{FrameSource, SourceStats, SourceStatsSnapshot};
pub use test_pattern::TestPatternBackend;

use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Upstream could not be opened (network, auth, bad URL, codec negotiation).
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The live connection ended (EOS, timeout, socket reset).
    #[error("frame read failed: {0}")]
    FrameReadFailed(String),

    /// Unrecoverable; the relay loop stops and the process should exit.
    #[error("fatal capture error: {0}")]
    Fatal(String),

    #[error("capture cancelled")]
    Cancelled,
}

impl CaptureError {
    /// Whether the reconnect protocol absorbs this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CaptureError::SourceUnavailable(_) | CaptureError::FrameReadFailed(_)
        )
    }
}

/// A decoded image in packed RGB8 (3 bytes per pixel, no row padding).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture order, assigned by [`FrameSource`]. Strictly increasing.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            seq: 0,
            width,
            height,
            data: data.into(),
        }
    }

    /// Byte length an RGB8 buffer of this size must have, `None` on overflow.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(3)
    }
}

/// Opens connections to an upstream URL.
///
/// Implemented by the GStreamer backend for real cameras and by the
/// synthetic test pattern; tests plug in scripted backends.
pub trait CaptureBackend: Send {
    fn open(&mut self, url: &str) -> Result<Box<dyn CaptureConnection>, CaptureError>;
}

/// One live upstream connection. Dropping it releases the capture resource.
pub trait CaptureConnection: Send {
    /// Blocks until the next decoded frame or a definitive failure.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}
