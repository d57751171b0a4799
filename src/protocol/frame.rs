//! Message framing on top of a reassembled session stream.
//!
//! Every game message starts with a one-byte tag (`field << 3 | 2`, field
//! 1..=15) followed by a varint body length. The convention is reverse
//! engineered, so the extractor is resynchronizing: bytes that cannot start a
//! header are skipped one at a time, and a session that keeps producing
//! garbage past the resync window has its buffer dropped.

use std::time::Instant;

use crate::config::FramingSettings;
use crate::reassembly::{Session, SessionId};

use super::varint::{self, Varint};

/// Frame type, taken from the tag's field number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Chat,
    Other(u8),
}

impl FrameKind {
    fn from_field(field: u8) -> Self {
        match field {
            1 => FrameKind::Chat,
            n => FrameKind::Other(n),
        }
    }

    fn field(self) -> u8 {
        match self {
            FrameKind::Chat => 1,
            FrameKind::Other(n) => n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub session: SessionId,
    pub kind: FrameKind,
    pub body: Vec<u8>,
    pub discovered_at: Instant,
}

#[derive(Debug)]
pub enum Extract {
    Frame(Frame),
    /// The buffer holds at most a partial frame.
    NeedMore,
    /// Resync window exceeded; the session buffer was cleared.
    Corrupt { discarded: usize },
}

enum Header {
    Valid {
        kind: FrameKind,
        header_len: usize,
        body_len: usize,
    },
    Incomplete,
    Invalid,
}

fn parse_header(buf: &[u8], max_frame_len: usize) -> Header {
    let Some(&tag) = buf.first() else {
        return Header::Incomplete;
    };
    let field = tag >> 3;
    if tag & 0x07 != 2 || !(1..=15).contains(&field) {
        return Header::Invalid;
    }

    match varint::read(&buf[1..]) {
        Varint::Value(len, n) => match usize::try_from(len) {
            Ok(body_len) if body_len <= max_frame_len => Header::Valid {
                kind: FrameKind::from_field(field),
                header_len: 1 + n,
                body_len,
            },
            _ => Header::Invalid,
        },
        Varint::Incomplete if buf.len() - 1 >= varint_width(max_frame_len) => Header::Invalid,
        Varint::Incomplete => Header::Incomplete,
        Varint::Overlong => Header::Invalid,
    }
}

/// Bytes needed to encode `value` as a varint.
fn varint_width(value: usize) -> usize {
    let mut width = 1;
    let mut v = value >> 7;
    while v > 0 {
        width += 1;
        v >>= 7;
    }
    width
}

/// Pull the next complete frame out of the session's contiguous buffer.
/// Consumed bytes are removed, so a byte range is never framed twice.
pub fn try_extract_frame(session: &mut Session, limits: &FramingSettings, now: Instant) -> Extract {
    let mut skipped = 0;

    let outcome = loop {
        if session.resync_skipped + skipped > limits.resync_window {
            let discarded = session.buffer.len();
            session.buffer.clear();
            session.resync_skipped = 0;
            return Extract::Corrupt { discarded };
        }

        match parse_header(&session.buffer[skipped..], limits.max_frame_len) {
            Header::Valid {
                kind,
                header_len,
                body_len,
            } => {
                let start = skipped + header_len;
                let end = start + body_len;
                if session.buffer.len() < end {
                    break Extract::NeedMore;
                }
                let body = session.buffer[start..end].to_vec();
                session.buffer.drain(..end);
                session.resync_skipped = 0;
                return Extract::Frame(Frame {
                    session: session.id,
                    kind,
                    body,
                    discovered_at: now,
                });
            }
            Header::Incomplete => break Extract::NeedMore,
            Header::Invalid => skipped += 1,
        }
    };

    if skipped > 0 {
        session.buffer.drain(..skipped);
        session.resync_skipped += skipped;
    }
    outcome
}

/// Build a complete frame: tag, varint length, body.
pub fn encode_frame(kind: FrameKind, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(kind.field() << 3 | 2);
    varint::write(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    out
}
