//! Property tests for the ordering and framing guarantees.

mod common;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

use chrono::Utc;
use proptest::prelude::*;

use chatwire::config::{FramingSettings, ReassemblySettings};
use chatwire::postprocess::nickname::{NicknameCache, Romanizer};
use chatwire::postprocess::{DisplayLine, TranslationStatus};
use chatwire::protocol::chat::{decode_frame, Channel, ChatMessage};
use chatwire::protocol::frame::{try_extract_frame, Extract};
use chatwire::protocol::{SessionKey, TcpFlags};
use chatwire::reassembly::{SessionId, StreamTable};
use chatwire::sanitize::sanitize_display;
use chatwire::translate::reorder::ReorderBuffer;

use common::parsed;

fn message() -> impl Strategy<Value = ChatMessage> {
    (
        prop_oneof![
            Just(Channel::World),
            Just(Channel::Local),
            Just(Channel::Party),
            Just(Channel::Guild)
        ],
        1u64..1_000_000,
        "[a-zA-Z0-9ぁ-ゖ]{0,12}",
        "[a-zA-Z0-9 ぁ-ゖァ-ヺ一-龯!?。、]{1,80}",
        any::<u32>(),
    )
        .prop_map(|(channel, speaker_id, nickname, text, sent_at)| ChatMessage {
            channel,
            speaker_id,
            nickname,
            text,
            class_id: 1,
            level: 10,
            sent_at: u64::from(sent_at),
        })
}

/// Cut `len` bytes at the given (unsorted, possibly duplicate) points.
fn pieces(len: usize, cuts: &[usize]) -> Vec<(usize, usize)> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (len + 1)).collect();
    points.push(0);
    points.push(len);
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|w| (w[0], w[1])).collect()
}

fn decode_all(table: &mut StreamTable, key: &SessionKey) -> Vec<ChatMessage> {
    let limits = FramingSettings::default();
    let now = Instant::now();
    let mut out = Vec::new();
    let Some(session) = table.session_mut(key) else {
        return out;
    };
    loop {
        match try_extract_frame(session, &limits, now) {
            Extract::Frame(frame) => out.extend(decode_frame(&frame)),
            Extract::NeedMore => break,
            Extract::Corrupt { discarded } => panic!("clean stream reset ({} bytes)", discarded),
        }
    }
    out
}

fn line(session: u64, sequence: u64) -> DisplayLine {
    DisplayLine {
        session: SessionId(session),
        key: SessionKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5003,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000 + session as u16,
        ),
        sequence,
        channel: Channel::World,
        speaker_id: 1,
        speaker_name: "Rin".into(),
        original: format!("{}:{}", session, sequence),
        translated: None,
        status: TranslationStatus::Skipped,
        out_of_order: false,
        captured_at: Utc::now(),
    }
}

struct Echo;

impl Romanizer for Echo {
    fn romanize(&self, source: &str) -> String {
        source.to_uppercase()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Any split of a chat stream into segments, delivered in any order
    /// after the handshake, decodes to exactly the original messages.
    #[test]
    fn split_and_shuffled_stream_decodes_exactly(
        messages in prop::collection::vec(message(), 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..24),
        isn in any::<u32>(),
        order in any::<u64>(),
    ) {
        let stream: Vec<u8> = messages.iter().flat_map(|m| m.encode_frame()).collect();
        let mut segs: Vec<(usize, usize)> = pieces(stream.len(), &cuts);

        let mut state = order | 1;
        for i in (1..segs.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            segs.swap(i, (state as usize) % (i + 1));
        }

        let mut table = StreamTable::new(&ReassemblySettings::default());
        let now = Instant::now();
        let mut syn = parsed(isn, b"");
        syn.flags = TcpFlags { syn: true, ..TcpFlags::default() };
        let key = table.ingest(&syn, now).key;
        for (start, end) in segs {
            let seq = isn.wrapping_add(1).wrapping_add(start as u32);
            table.ingest(&parsed(seq, &stream[start..end]), now);
        }

        let decoded = decode_all(&mut table, &key);
        prop_assert_eq!(decoded, messages);
        prop_assert!(table.session(&key).unwrap().buffered().is_empty());
    }

    /// Without a handshake the stream start is a guess, but a stream split
    /// in two still comes out whole whichever half arrives first.
    #[test]
    fn two_halves_without_handshake_in_either_order(
        messages in prop::collection::vec(message(), 1..5),
        cut in any::<usize>(),
        isn in any::<u32>(),
    ) {
        let stream: Vec<u8> = messages.iter().flat_map(|m| m.encode_frame()).collect();
        let cut = 1 + cut % (stream.len() - 1);
        let now = Instant::now();

        let mut table = StreamTable::new(&ReassemblySettings::default());
        let back = parsed(isn.wrapping_add(cut as u32), &stream[cut..]);
        let key = table.ingest(&back, now).key;
        table.ingest(&parsed(isn, &stream[..cut]), now);

        prop_assert_eq!(table.session(&key).unwrap().buffered(), &stream[..]);
        prop_assert_eq!(decode_all(&mut table, &key), messages);
    }

    /// Duplicated and overlapping retransmissions never duplicate bytes.
    #[test]
    fn retransmissions_are_idempotent(
        messages in prop::collection::vec(message(), 1..5),
        resend in prop::collection::vec((any::<usize>(), any::<usize>()), 0..16),
    ) {
        let stream: Vec<u8> = messages.iter().flat_map(|m| m.encode_frame()).collect();
        let mut table = StreamTable::new(&ReassemblySettings::default());
        let now = Instant::now();

        let key = table.ingest(&parsed(1, &stream), now).key;
        for (a, b) in resend {
            let start = a % stream.len();
            let end = start + 1 + b % (stream.len() - start);
            let ingest = table.ingest(&parsed(1 + start as u32, &stream[start..end]), now);
            prop_assert_eq!(ingest.delivered, 0);
        }

        prop_assert_eq!(decode_all(&mut table, &key), messages);
    }

    /// Every completed line is released exactly once, and lines that are
    /// not flagged late come out in sequence order per session.
    #[test]
    fn reorder_releases_each_line_once_in_order(
        counts in prop::collection::vec(1u64..20, 1..4),
        shuffle in any::<u64>(),
        window in 1usize..8,
    ) {
        let mut buffer = ReorderBuffer::new(window);
        let mut pending = Vec::new();
        for (s, &count) in counts.iter().enumerate() {
            for seq in 0..count {
                buffer.track(SessionId(s as u64), seq);
                pending.push((s as u64, seq));
            }
        }

        let mut state = shuffle | 1;
        for i in (1..pending.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            pending.swap(i, (state as usize) % (i + 1));
        }

        let mut released = Vec::new();
        for (s, seq) in pending {
            released.extend(buffer.complete(line(s, seq)));
        }

        let total: u64 = counts.iter().sum();
        prop_assert_eq!(released.len() as u64, total);
        prop_assert_eq!(buffer.waiting(), 0);
        prop_assert_eq!(buffer.outstanding(), 0);

        let unique: HashSet<(SessionId, u64)> =
            released.iter().map(|r| (r.line.session, r.line.sequence)).collect();
        prop_assert_eq!(unique.len() as u64, total);

        let mut last: HashMap<SessionId, u64> = HashMap::new();
        for r in released.iter().filter(|r| !r.line.out_of_order) {
            if let Some(&prev) = last.get(&r.line.session) {
                prop_assert!(r.line.sequence > prev);
            }
            last.insert(r.line.session, r.line.sequence);
        }
    }

    /// With a window at least as large as the session, nothing is forced.
    #[test]
    fn wide_window_never_forces(count in 1u64..30, shuffle in any::<u64>()) {
        let mut buffer = ReorderBuffer::new(count as usize);
        let mut order: Vec<u64> = (0..count).collect();
        for seq in &order {
            buffer.track(SessionId(1), *seq);
        }
        let mut state = shuffle | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state as usize) % (i + 1));
        }

        let released: Vec<u64> = order
            .into_iter()
            .flat_map(|seq| buffer.complete(line(1, seq)))
            .inspect(|r| assert!(!r.forced && !r.line.out_of_order))
            .map(|r| r.line.sequence)
            .collect();
        prop_assert_eq!(released, (0..count).collect::<Vec<_>>());
    }

    /// The cache never grows past capacity once pins are released, and a
    /// pinned entry survives any amount of churn.
    #[test]
    fn nickname_cache_respects_pins(
        capacity in 1usize..16,
        speakers in prop::collection::vec(1u64..64, 1..200),
    ) {
        let mut cache = NicknameCache::new(capacity, Box::new(Echo));
        let pinned = cache.acquire(9_999, "あずるる");

        for id in &speakers {
            cache.acquire(*id, "なまえ");
            cache.release(*id);
            prop_assert!(cache.len() <= capacity + 1);
        }
        let entry = cache.get(9_999).unwrap();
        prop_assert!(entry.is_pinned());
        prop_assert_eq!(&entry.display, &pinned);

        cache.release(9_999);
        prop_assert!(cache.len() <= capacity);
    }

    /// Rendered text never carries a control or bidi-override character.
    #[test]
    fn sanitized_text_is_inert(text in any::<String>()) {
        let clean = sanitize_display(&text);
        prop_assert!(!clean.chars().any(|c| c.is_control()));
        prop_assert!(!clean.chars().any(|c| matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')), "sanitized text contains a bidi override");
    }
}
