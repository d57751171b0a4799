//! Capture-file and wire helpers shared by the integration tests.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::{Duration, SystemTime};

use chatwire::capture::pcap_writer::PcapWriter;
use chatwire::protocol::chat::{Channel, ChatMessage};
use chatwire::protocol::{LinkType, ParsedPacket, TcpFlags};

pub const SERVER: [u8; 4] = [203, 0, 113, 7];
pub const CLIENT: [u8; 4] = [192, 168, 1, 20];
pub const GAME_PORT: u16 = 5003;
pub const CLIENT_PORT: u16 = 50123;

pub fn chat(speaker_id: u64, nickname: &str, text: &str) -> ChatMessage {
    ChatMessage {
        channel: Channel::Party,
        speaker_id,
        nickname: nickname.to_string(),
        text: text.to_string(),
        class_id: 3,
        level: 55,
        sent_at: 1_770_753_503,
    }
}

/// Concatenated chat frames, one per message.
pub fn chat_stream(messages: &[ChatMessage]) -> Vec<u8> {
    messages.iter().flat_map(|m| m.encode_frame()).collect()
}

/// Ethernet/IPv4/TCP frame from the game server to the client.
pub fn server_segment(seq: u32, payload: &[u8]) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(SERVER, CLIENT, 64)
        .tcp(GAME_PORT, CLIENT_PORT, seq, 65535)
        .ack(1)
        .psh();
    let mut buf = Vec::new();
    builder.write(&mut buf, payload).unwrap();
    buf
}

/// Split `stream` into `chunk`-sized segments starting at `isn`.
pub fn segments(isn: u32, stream: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    let mut seq = isn;
    stream
        .chunks(chunk.max(1))
        .map(|piece| {
            let pkt = server_segment(seq, piece);
            seq = seq.wrapping_add(piece.len() as u32);
            pkt
        })
        .collect()
}

pub fn write_capture(path: &Path, packets: &[Vec<u8>]) {
    let mut writer = PcapWriter::create(path, LinkType::Ethernet, 65535).unwrap();
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_770_753_503);
    for (i, pkt) in packets.iter().enumerate() {
        writer
            .write_packet(pkt, start + Duration::from_millis(i as u64))
            .unwrap();
    }
}

/// Parsed segment for driving the stream table directly.
pub fn parsed(seq: u32, payload: &[u8]) -> ParsedPacket {
    ParsedPacket {
        src_ip: IpAddr::V4(Ipv4Addr::from(SERVER)),
        dst_ip: IpAddr::V4(Ipv4Addr::from(CLIENT)),
        src_port: GAME_PORT,
        dst_port: CLIENT_PORT,
        seq,
        flags: TcpFlags {
            ack: true,
            psh: true,
            ..TcpFlags::default()
        },
        payload: payload.to_vec(),
    }
}
