//! JPEG encoding and multipart framing for MJPEG-over-HTTP

mod encoder;
mod framing;

pub use encoder::{EncodeError, EncodedChunk, JpegEncoder, DEFAULT_QUALITY};
pub use framing::{frame_chunk, BOUNDARY, PART_CONTENT_TYPE, STREAM_CONTENT_TYPE};
