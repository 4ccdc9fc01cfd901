use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use crate::capture::Frame;

pub const DEFAULT_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("JPEG encoder error: {0}")]
    Codec(#[from] image::ImageError),
}

/// One JPEG image derived from exactly one [`Frame`].
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Bytes,
}

impl EncodedChunk {
    pub fn content_type(&self) -> &'static str {
        super::PART_CONTENT_TYPE
    }
}

/// Fixed-quality baseline JPEG encoder for RGB8 frames.
#[derive(Debug, Clone, Copy)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    /// `quality` is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &Frame) -> Result<EncodedChunk, EncodeError> {
        let invalid = EncodeError::InvalidDimensions {
            width: frame.width,
            height: frame.height,
        };
        if frame.width == 0 || frame.height == 0 {
            return Err(invalid);
        }

        let expected = frame.expected_len().ok_or(invalid)?;
        if frame.data.len() != expected {
            return Err(EncodeError::BufferSizeMismatch {
                expected,
                actual: frame.data.len(),
            });
        }

        // JPEG output is usually well under a tenth of the raw size
        let mut jpeg = Vec::with_capacity(expected / 8);
        ImageJpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;

        Ok(EncodedChunk {
            seq: frame.seq,
            width: frame.width,
            height: frame.height,
            jpeg: Bytes::from(jpeg),
        })
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}
