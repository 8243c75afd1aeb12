//! `multipart/x-mixed-replace` framing for JPEG streams.

use bytes::{BufMut, Bytes, BytesMut};

pub const BOUNDARY: &str = "frame";

/// Response content type of a feed.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

/// Wrap one JPEG frame as a multipart part.
pub fn encode_part(frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PART_HEADER.len() + frame.len() + PART_TRAILER.len());
    buf.put_slice(PART_HEADER);
    buf.put_slice(frame);
    buf.put_slice(PART_TRAILER);
    buf.freeze()
}
