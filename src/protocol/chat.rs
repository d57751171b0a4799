//! Chat envelope decoding.
//!
//! A chat frame (type 1) carries a protobuf-style envelope:
//!
//! ```text
//! envelope  = 1:varint channel, (2|3):bytes chat_block ...
//! chat_block = 1:varint entity, 2:bytes profile, 3:varint timestamp, 4:bytes message
//! profile   = 1:varint uid, 2:bytes nickname, 3:varint class, 4:varint status, 5:varint level
//! message   = 3:bytes text
//! ```
//!
//! The channel id is what separates real chat envelopes from server metadata
//! that happens to share the frame type; envelopes without it are ignored.

use serde::Serialize;

use super::frame::{self, Frame, FrameKind};
use super::varint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    World,
    Local,
    Party,
    Guild,
}

impl Channel {
    pub fn from_id(id: u64) -> Self {
        match id {
            2 => Channel::Local,
            3 => Channel::Party,
            4 => Channel::Guild,
            _ => Channel::World,
        }
    }

    pub fn id(self) -> u64 {
        match self {
            Channel::World => 1,
            Channel::Local => 2,
            Channel::Party => 3,
            Channel::Guild => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::World => "WORLD",
            Channel::Local => "LOCAL",
            Channel::Party => "PARTY",
            Channel::Guild => "GUILD",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chat line as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub channel: Channel,
    /// Permanent player uid; the protocol-native speaker identifier.
    pub speaker_id: u64,
    pub nickname: String,
    pub text: String,
    pub class_id: u64,
    pub level: u64,
    /// Server-side timestamp as sent by the game (seconds).
    pub sent_at: u64,
}

enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed,
}

/// Walks `(field number, value)` pairs. Stops at the first malformed field
/// so a corrupt tail never yields garbage values.
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

fn fields(data: &[u8]) -> Fields<'_> {
    Fields { data, pos: 0 }
}

impl<'a> Iterator for Fields<'a> {
    type Item = (u64, FieldValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.pos..)?;
        let (tag, tag_len) = varint::read_value(rest)?;
        let number = tag >> 3;
        let wire_type = (tag & 0x07) as u8;
        let body = &rest[tag_len..];
        let body_len = varint::field_len(wire_type, body)?;

        let value = match wire_type {
            0 => FieldValue::Varint(varint::read_value(body)?.0),
            2 => {
                let (_, prefix) = varint::read_value(body)?;
                FieldValue::Bytes(&body[prefix..body_len])
            }
            _ => FieldValue::Fixed,
        };
        self.pos += tag_len + body_len;
        Some((number, value))
    }
}

/// Decode every chat line carried by a frame. Non-chat frames, and chat-typed
/// frames that turn out to be metadata, yield nothing.
pub fn decode_frame(frame: &Frame) -> Vec<ChatMessage> {
    if frame.kind != FrameKind::Chat {
        return Vec::new();
    }
    decode_envelope(&frame.body)
}

pub fn decode_envelope(body: &[u8]) -> Vec<ChatMessage> {
    let mut channel = None;
    let mut blocks = Vec::new();

    for (number, value) in fields(body) {
        match (number, value) {
            (1, FieldValue::Varint(id)) => channel = Some(Channel::from_id(id)),
            (2 | 3, FieldValue::Bytes(block)) => blocks.push(block),
            _ => {}
        }
    }

    let Some(channel) = channel else {
        return Vec::new();
    };

    blocks
        .into_iter()
        .filter_map(|block| decode_block(channel, block))
        .collect()
}

fn decode_block(channel: Channel, block: &[u8]) -> Option<ChatMessage> {
    let mut msg = ChatMessage {
        channel,
        speaker_id: 0,
        nickname: String::new(),
        text: String::new(),
        class_id: 0,
        level: 0,
        sent_at: 0,
    };

    for (number, value) in fields(block) {
        match (number, value) {
            (2, FieldValue::Bytes(profile)) => decode_profile(profile, &mut msg),
            (3, FieldValue::Varint(ts)) => msg.sent_at = ts,
            (4, FieldValue::Bytes(message)) => {
                for (n, v) in fields(message) {
                    if let (3, FieldValue::Bytes(text)) = (n, v) {
                        msg.text = String::from_utf8_lossy(text).into_owned();
                    }
                }
            }
            _ => {}
        }
    }

    (msg.speaker_id > 0 && !msg.text.is_empty()).then_some(msg)
}

fn decode_profile(profile: &[u8], msg: &mut ChatMessage) {
    for (number, value) in fields(profile) {
        match (number, value) {
            (1, FieldValue::Varint(uid)) => msg.speaker_id = uid,
            (2, FieldValue::Bytes(name)) => {
                msg.nickname = String::from_utf8_lossy(name).into_owned()
            }
            (3, FieldValue::Varint(class)) => msg.class_id = class,
            (5, FieldValue::Varint(level)) => msg.level = level,
            _ => {}
        }
    }
}

fn put_varint_field(number: u64, value: u64, out: &mut Vec<u8>) {
    varint::write(number << 3, out);
    varint::write(value, out);
}

fn put_bytes_field(number: u64, bytes: &[u8], out: &mut Vec<u8>) {
    varint::write(number << 3 | 2, out);
    varint::write(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

impl ChatMessage {
    /// Encode as a single-block chat envelope body.
    pub fn encode_envelope(&self) -> Vec<u8> {
        encode_envelope(self.channel, std::slice::from_ref(self))
    }

    /// Encode as a complete chat frame (header included).
    pub fn encode_frame(&self) -> Vec<u8> {
        frame::encode_frame(FrameKind::Chat, &self.encode_envelope())
    }

    fn encode_block(&self, out: &mut Vec<u8>) {
        let mut profile = Vec::new();
        put_varint_field(1, self.speaker_id, &mut profile);
        put_bytes_field(2, self.nickname.as_bytes(), &mut profile);
        put_varint_field(3, self.class_id, &mut profile);
        put_varint_field(4, 1, &mut profile);
        put_varint_field(5, self.level, &mut profile);

        let mut message = Vec::new();
        put_bytes_field(3, self.text.as_bytes(), &mut message);

        let mut block = Vec::new();
        put_varint_field(1, self.speaker_id, &mut block);
        put_bytes_field(2, &profile, &mut block);
        put_varint_field(3, self.sent_at, &mut block);
        put_bytes_field(4, &message, &mut block);

        put_bytes_field(2, &block, out);
    }
}

/// Encode several messages into one envelope on `channel`.
pub fn encode_envelope(channel: Channel, messages: &[ChatMessage]) -> Vec<u8> {
    let mut body = Vec::new();
    put_varint_field(1, channel.id(), &mut body);
    for msg in messages {
        msg.encode_block(&mut body);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sample() -> ChatMessage {
        ChatMessage {
            channel: Channel::Party,
            speaker_id: 42,
            nickname: "あずるる".into(),
            text: "こんにちは".into(),
            class_id: 2,
            level: 60,
            sent_at: 1_770_753_503,
        }
    }

    fn chat_frame(body: Vec<u8>) -> Frame {
        Frame {
            session: crate::reassembly::SessionId(1),
            kind: FrameKind::Chat,
            body,
            discovered_at: Instant::now(),
        }
    }

    #[test]
    fn decodes_single_message() {
        let msg = sample();
        let decoded = decode_frame(&chat_frame(msg.encode_envelope()));
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn decodes_batched_blocks() {
        let a = sample();
        let mut b = sample();
        b.speaker_id = 7;
        b.text = "よろしく".into();
        let body = encode_envelope(Channel::Guild, &[a.clone(), b.clone()]);
        let decoded = decode_frame(&chat_frame(body));
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].channel, Channel::Guild);
        assert_eq!(decoded[1].speaker_id, 7);
        assert_eq!(decoded[1].text, "よろしく");
    }

    #[test]
    fn envelope_without_channel_is_metadata() {
        let mut body = Vec::new();
        let mut block = Vec::new();
        sample().encode_block(&mut block);
        body.extend_from_slice(&block);
        assert!(decode_frame(&chat_frame(body)).is_empty());
    }

    #[test]
    fn non_chat_frame_is_ignored() {
        let mut frame = chat_frame(sample().encode_envelope());
        frame.kind = FrameKind::Other(4);
        assert!(decode_frame(&frame).is_empty());
    }

    #[test]
    fn block_without_uid_or_text_is_skipped() {
        let mut no_text = sample();
        no_text.text.clear();
        assert!(decode_frame(&chat_frame(no_text.encode_envelope())).is_empty());

        let mut no_uid = sample();
        no_uid.speaker_id = 0;
        assert!(decode_frame(&chat_frame(no_uid.encode_envelope())).is_empty());
    }

    #[test]
    fn truncated_envelope_does_not_panic() {
        let body = sample().encode_envelope();
        for cut in 0..body.len() {
            let _ = decode_envelope(&body[..cut]);
        }
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let msg = sample();
        let mut body = msg.encode_envelope();
        // fixed64 field 9 and fixed32 field 10 appended after the block
        body.push(9 << 3 | 1);
        body.extend_from_slice(&[0; 8]);
        body.push(10 << 3 | 5);
        body.extend_from_slice(&[0; 4]);
        assert_eq!(decode_envelope(&body), vec![msg]);
    }

    #[test]
    fn channel_ids() {
        assert_eq!(Channel::from_id(2), Channel::Local);
        assert_eq!(Channel::from_id(99), Channel::World);
        for ch in [Channel::World, Channel::Local, Channel::Party, Channel::Guild] {
            assert_eq!(Channel::from_id(ch.id()), ch);
        }
    }
}
