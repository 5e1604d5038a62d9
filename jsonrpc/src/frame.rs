//! Content-Length framing for JSON-RPC over byte streams.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing. [`split_frame`] pulls
//! the first complete frame out of an accumulated buffer without assuming
//! anything about how the bytes were chunked on the way in; [`encode_frame`]
//! produces the inverse.

use thiserror::Error;

/// Default maximum body size (64 MiB). `didOpen` on a large generated file
/// is the usual worst case.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Maximum header section size. A peer that streams this much without a
/// blank line is not speaking the protocol.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// The interpreted part of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub content_length: usize,
}

/// One complete frame found at the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: MessageHeader,
    pub body: &'a [u8],
    /// Bytes following this frame, still to be split.
    pub rest: &'a [u8],
}

impl Frame<'_> {
    /// Number of bytes this frame occupied at the front of the buffer.
    #[must_use]
    pub fn consumed(&self, buffer_len: usize) -> usize {
        buffer_len - self.rest.len()
    }
}

/// A framing failure. Every variant means the stream position of the next
/// frame is unknown, so the connection cannot continue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("malformed header line {0:?}")]
    MalformedHeaderLine(String),
    #[error("header is not valid UTF-8")]
    NonUtf8Header,
    #[error("header exceeds {max} bytes without a terminating blank line")]
    HeaderTooLarge { max: usize },
    #[error("Content-Length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Split the first complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, either because the header
/// has not been terminated yet or because fewer than `Content-Length` body
/// bytes have arrived.
pub fn split_frame(buf: &[u8], max_frame_bytes: usize) -> Result<Option<Frame<'_>>, FrameError> {
    let Some((header_len, body_start)) = find_header_end(buf) else {
        if buf.len() > MAX_HEADER_BYTES + HEADER_TERMINATOR.len() {
            return Err(FrameError::HeaderTooLarge {
                max: MAX_HEADER_BYTES,
            });
        }
        return Ok(None);
    };
    if header_len > MAX_HEADER_BYTES {
        return Err(FrameError::HeaderTooLarge {
            max: MAX_HEADER_BYTES,
        });
    }

    let header = parse_header(&buf[..header_len])?;
    if header.content_length > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            len: header.content_length,
            max: max_frame_bytes,
        });
    }

    let body_end = body_start + header.content_length;
    if buf.len() < body_end {
        return Ok(None);
    }

    Ok(Some(Frame {
        header,
        body: &buf[body_start..body_end],
        rest: &buf[body_end..],
    }))
}

/// Prefix `body` with its header.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Locate the blank line closing the header section.
///
/// Returns `(header_len, body_start)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.starts_with(CRLF) {
        return Some((0, CRLF.len()));
    }
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| (pos, pos + HEADER_TERMINATOR.len()))
}

fn parse_header(raw: &[u8]) -> Result<MessageHeader, FrameError> {
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::NonUtf8Header)?;
    let mut content_length = None;

    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once(':') else {
            return Err(FrameError::MalformedHeaderLine(line.to_string()));
        };
        // Field names are matched case-insensitively.
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            let len = value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            content_length = Some(len);
        }
        // Ignore other headers (e.g. Content-Type)
    }

    content_length
        .map(|content_length| MessageHeader { content_length })
        .ok_or(FrameError::MissingContentLength)
}
