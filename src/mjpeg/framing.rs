use bytes::{BufMut, Bytes, BytesMut};

use super::EncodedChunk;

/// Multipart boundary token. Clients match it literally.
pub const BOUNDARY: &str = "frame";

/// `Content-Type` of the streaming HTTP response.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// `Content-Type` of each part.
pub const PART_CONTENT_TYPE: &str = "image/jpeg";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

/// Wrap one JPEG in its multipart part:
/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
///
/// No length prefix; parts are delimited by the boundary only.
pub fn frame_chunk(chunk: &EncodedChunk) -> Bytes {
    let mut out = BytesMut::with_capacity(PART_HEADER.len() + chunk.jpeg.len() + PART_TRAILER.len());
    out.put_slice(PART_HEADER);
    out.put_slice(&chunk.jpeg);
    out.put_slice(PART_TRAILER);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(jpeg: &'static [u8]) -> EncodedChunk {
        EncodedChunk {
            seq: 7,
            width: 1,
            height: 1,
            jpeg: Bytes::from_static(jpeg),
        }
    }

    #[test]
    fn test_exact_wire_format() {
        let framed = frame_chunk(&chunk(b"\xff\xd8JPEG\xff\xd9"));
        assert_eq!(
            &framed[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8JPEG\xff\xd9\r\n"
        );
    }

    #[test]
    fn test_header_matches_constants() {
        let header = format!("--{}\r\nContent-Type: {}\r\n\r\n", BOUNDARY, PART_CONTENT_TYPE);
        assert_eq!(header.as_bytes(), PART_HEADER);
        assert!(STREAM_CONTENT_TYPE.ends_with(&format!("boundary={}", BOUNDARY)));
    }

    #[test]
    fn test_empty_payload_still_framed() {
        let framed = frame_chunk(&chunk(b""));
        assert_eq!(framed.len(), PART_HEADER.len() + PART_TRAILER.len());
    }
}
