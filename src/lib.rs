//! Camera-to-browser MJPEG relay
//!
//! Pulls decoded frames from one upstream camera URL, encodes them as JPEG
//! and fans them out to any number of HTTP clients as a
//! `multipart/x-mixed-replace` stream. Upstream failures are absorbed by a
//! reconnect loop with bounded backoff; clients simply see a pause.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mjpeg_relay::capture::{FrameSource, TestPatternBackend};
//! use mjpeg_relay::mjpeg::JpegEncoder;
//! use mjpeg_relay::streaming::{FrameDistributor, Relay};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let distributor = Arc::new(FrameDistributor::new());
//! let source = FrameSource::new("test://pattern", TestPatternBackend::new(640, 480, 15));
//! let handle = Relay::new(source, JpegEncoder::new(80), Arc::clone(&distributor))
//!     .spawn(CancellationToken::new());
//!
//! let mut client = distributor.attach_client("viewer");
//! let part = client.recv().await;
//! # handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod mjpeg;
pub mod streaming;
pub mod web;

// Re-exports for convenience
pub use capture::{CaptureError, Frame, FrameSource};
pub use config::Config;
pub use mjpeg::{frame_chunk, EncodedChunk, JpegEncoder};
pub use streaming::{ClientSession, FrameDistributor, Relay, RelayHandle};
