//! `multipart/x-mixed-replace` framing.
//!
//! ```text
//! \r\n--frame\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: N\r\n
//! \r\n
//! <N bytes of JPEG>
//! ```

use bytes::{BufMut, Bytes, BytesMut};

pub const BOUNDARY: &str = "frame";

/// Response `Content-Type` for an MJPEG stream.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Header block preceding a JPEG payload of `len` bytes.
pub fn part_header(len: usize) -> Bytes {
    let header = format!(
        "\r\n--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n"
    );
    Bytes::from(header)
}

/// A complete part: header followed by the payload.
pub fn part(jpeg: &[u8]) -> Bytes {
    let header = part_header(jpeg.len());
    let mut buf = BytesMut::with_capacity(header.len() + jpeg.len());
    buf.put_slice(&header);
    buf.put_slice(jpeg);
    buf.freeze()
}

/// Split a captured MJPEG body back into its payloads. Stops at the first
/// incomplete part.
pub fn split_parts(mut body: &[u8]) -> Vec<&[u8]> {
    const LENGTH: &[u8] = b"Content-Length: ";
    let mut parts = Vec::new();
    loop {
        let Some(at) = find(body, LENGTH) else { break };
        let rest = &body[at + LENGTH.len()..];
        let Some(eol) = find(rest, b"\r\n\r\n") else { break };
        let Some(len) = std::str::from_utf8(&rest[..eol]).ok().and_then(|s| s.trim().parse::<usize>().ok())
        else {
            break;
        };
        let payload = &rest[eol + 4..];
        if payload.len() < len {
            break;
        }
        parts.push(&payload[..len]);
        body = &payload[len..];
    }
    parts
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
