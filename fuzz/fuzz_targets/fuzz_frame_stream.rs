#![no_main]
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

use chatwire::config::{FramingSettings, ReassemblySettings};
use chatwire::protocol::chat::decode_frame;
use chatwire::protocol::frame::{try_extract_frame, Extract};
use chatwire::protocol::{ParsedPacket, TcpFlags};
use chatwire::reassembly::StreamTable;
use libfuzzer_sys::fuzz_target;

// The first byte picks a segment size; the rest is the stream, fed in order
// with every other segment delayed to exercise the holding set.
fuzz_target!(|data: &[u8]| {
    let Some((&chunk, stream)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk.max(1));
    let limits = FramingSettings {
        max_frame_len: 4096,
        resync_window: 512,
    };
    let mut table = StreamTable::new(&ReassemblySettings::default());
    let now = Instant::now();

    let segment = |offset: usize, payload: &[u8]| ParsedPacket {
        src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        src_port: 5003,
        dst_port: 50000,
        seq: 1000u32.wrapping_add(offset as u32),
        flags: TcpFlags::default(),
        payload: payload.to_vec(),
    };

    let pieces: Vec<(usize, &[u8])> = stream
        .chunks(chunk)
        .enumerate()
        .map(|(i, p)| (i * chunk, p))
        .collect();
    let (odd, even): (Vec<_>, Vec<_>) = pieces.iter().partition(|(i, _)| (i / chunk) % 2 == 1);

    for (offset, payload) in even.iter().take(1).chain(odd.iter()).chain(even.iter().skip(1)) {
        let ingest = table.ingest(&segment(*offset, *payload), now);
        let Some(session) = table.session_mut(&ingest.key) else {
            continue;
        };
        loop {
            match try_extract_frame(session, &limits, now) {
                Extract::Frame(frame) => {
                    assert!(frame.body.len() <= limits.max_frame_len);
                    let _ = decode_frame(&frame);
                }
                Extract::NeedMore => break,
                Extract::Corrupt { .. } => {}
            }
        }
    }
});
