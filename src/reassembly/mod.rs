use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::ReassemblySettings;
use crate::protocol::{ParsedPacket, SessionKey};

/// Identifier for one observed session. A reconnect on the same 4-tuple gets
/// a fresh id, so stale state from the old connection never leaks into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Fin,
    Reset,
    Idle,
    /// A new SYN arrived on the same 4-tuple.
    Replaced,
    /// The capture handle went away with the session still open.
    CaptureEnded,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Fin => "fin",
            CloseReason::Reset => "reset",
            CloseReason::Idle => "idle",
            CloseReason::Replaced => "replaced",
            CloseReason::CaptureEnded => "capture_ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened {
        id: SessionId,
        key: SessionKey,
    },
    /// Out-of-order data exceeded the holding cap. `dropped` bytes were
    /// discarded from the holding set and `skipped` bytes of stream gap were
    /// given up on.
    HoldingOverflow {
        id: SessionId,
        key: SessionKey,
        dropped: usize,
        skipped: u64,
    },
    Closed {
        id: SessionId,
        key: SessionKey,
        reason: CloseReason,
    },
}

/// Result of feeding one segment to the table.
#[derive(Debug)]
pub struct Ingest {
    pub key: SessionKey,
    /// Bytes newly appended to the session's contiguous buffer.
    pub delivered: usize,
    pub events: Vec<StreamEvent>,
}

#[derive(Debug)]
struct HeldSegment {
    data: Vec<u8>,
    arrival: u64,
}

/// Per-direction reassembly state.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    /// Contiguous, not yet framed bytes.
    pub(crate) buffer: Vec<u8>,
    /// Bytes skipped by the framer since the last good frame.
    pub(crate) resync_skipped: usize,
    next_seq: Option<u32>,
    /// The stream start is known from a SYN. Without one, the first segment
    /// seen is only a guess at where the stream begins.
    anchored: bool,
    /// Stream offset of `next_seq`. Offsets are 64-bit so sequence wrap
    /// never reorders the holding set.
    offset: u64,
    holding: BTreeMap<u64, HeldSegment>,
    holding_bytes: usize,
    arrivals: u64,
    record_seq: u64,
    closing: Option<CloseReason>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

#[derive(Debug, Default)]
struct Accepted {
    delivered: usize,
    overflow: Option<(usize, u64)>,
}

impl Session {
    pub fn new(id: SessionId, key: SessionKey, now: Instant) -> Self {
        Session {
            id,
            key,
            buffer: Vec::new(),
            resync_skipped: 0,
            next_seq: None,
            anchored: false,
            offset: 0,
            holding: BTreeMap::new(),
            holding_bytes: 0,
            arrivals: 0,
            record_seq: 0,
            closing: None,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn holding_bytes(&self) -> usize {
        self.holding_bytes
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_some()
    }

    /// Sequence number for the next decoded record. Strictly increasing per
    /// session, which is what downstream ordering keys on.
    pub fn next_record_sequence(&mut self) -> u64 {
        let seq = self.record_seq;
        self.record_seq += 1;
        seq
    }

    fn accept(&mut self, seq: u32, payload: &[u8], holding_cap: usize) -> Accepted {
        let mut result = Accepted::default();
        if payload.is_empty() {
            return result;
        }
        let next = *self.next_seq.get_or_insert(seq);

        // Signed distance from the cursor, valid across sequence wrap.
        let mut rel = i64::from(seq.wrapping_sub(next) as i32);
        let mut payload = payload;

        // Bytes just in front of a guessed start extend the stream backwards,
        // as long as none of it has been framed yet.
        let ahead_of_start = -(rel + self.offset as i64);
        if ahead_of_start > 0 && ahead_of_start <= payload.len() as i64 && self.can_backfill() {
            let (front, rest) = payload.split_at(ahead_of_start as usize);
            result.delivered += self.prepend(front);
            rel += ahead_of_start;
            payload = rest;
        }

        let end = rel + payload.len() as i64;
        if end <= 0 {
            // Retransmission of bytes already delivered.
            return result;
        }

        if rel <= 0 {
            let fresh = &payload[(-rel) as usize..];
            result.delivered += self.append(fresh);
            result.delivered += self.drain_holding();
            return result;
        }

        let at = self.offset + rel as u64;
        self.hold(at, payload);

        if self.holding_bytes > holding_cap {
            result.overflow = Some(self.shed_holding(holding_cap, at + payload.len() as u64));
            result.delivered += self.drain_holding();
        }
        result
    }

    fn can_backfill(&self) -> bool {
        !self.anchored && self.buffer.len() as u64 == self.offset
    }

    fn prepend(&mut self, data: &[u8]) -> usize {
        let shift = data.len() as u64;
        self.buffer.splice(0..0, data.iter().copied());
        self.offset += shift;
        self.holding = std::mem::take(&mut self.holding)
            .into_iter()
            .map(|(at, seg)| (at + shift, seg))
            .collect();
        data.len()
    }

    fn append(&mut self, data: &[u8]) -> usize {
        self.buffer.extend_from_slice(data);
        self.advance(data.len() as u64);
        data.len()
    }

    fn advance(&mut self, by: u64) {
        self.offset += by;
        if let Some(next) = self.next_seq.as_mut() {
            *next = next.wrapping_add(by as u32);
        }
    }

    fn hold(&mut self, at: u64, data: &[u8]) {
        if let Some(existing) = self.holding.get(&at) {
            if existing.data.len() >= data.len() {
                return;
            }
        }
        self.arrivals += 1;
        let seg = HeldSegment {
            data: data.to_vec(),
            arrival: self.arrivals,
        };
        self.holding_bytes += seg.data.len();
        if let Some(old) = self.holding.insert(at, seg) {
            self.holding_bytes -= old.data.len();
        }
    }

    /// Move every held segment that now touches the cursor into the buffer.
    fn drain_holding(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(entry) = self.holding.first_entry() {
            let at = *entry.key();
            if at > self.offset {
                break;
            }
            let seg = entry.remove();
            self.holding_bytes -= seg.data.len();
            let overlap = (self.offset - at) as usize;
            if overlap < seg.data.len() {
                delivered += self.append(&seg.data[overlap..]);
            }
        }
        delivered
    }

    /// Drop the oldest held segments until under the cap, then give up on
    /// the gap in front of whatever is left. Returns (dropped, skipped).
    fn shed_holding(&mut self, holding_cap: usize, fallback_end: u64) -> (usize, u64) {
        let mut dropped = 0;
        while self.holding_bytes > holding_cap {
            let oldest = self
                .holding
                .iter()
                .min_by_key(|(_, seg)| seg.arrival)
                .map(|(&at, _)| at);
            let Some(at) = oldest else { break };
            if let Some(seg) = self.holding.remove(&at) {
                self.holding_bytes -= seg.data.len();
                dropped += seg.data.len();
            }
        }

        let resume = self
            .holding
            .keys()
            .next()
            .copied()
            .unwrap_or(fallback_end);
        let skipped = resume.saturating_sub(self.offset);

        // A partial frame can never be completed across the gap.
        self.buffer.clear();
        self.resync_skipped = 0;
        self.advance(skipped);
        (dropped, skipped)
    }
}

/// Tracks sessions and reassembles their payloads into contiguous buffers.
pub struct StreamTable {
    sessions: HashMap<SessionKey, Session>,
    next_id: u64,
    holding_cap: usize,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl StreamTable {
    pub fn new(settings: &ReassemblySettings) -> Self {
        StreamTable {
            sessions: HashMap::new(),
            next_id: 1,
            holding_cap: settings.holding_cap_bytes,
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
            max_sessions: settings.max_sessions.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn session_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    /// Feed one TCP segment.
    pub fn ingest(&mut self, packet: &ParsedPacket, now: Instant) -> Ingest {
        let key = packet.session_key();
        let flags = packet.flags;
        let mut events = Vec::new();

        if flags.syn {
            if let Some(old) = self.sessions.remove(&key) {
                events.push(StreamEvent::Closed {
                    id: old.id,
                    key,
                    reason: CloseReason::Replaced,
                });
            }
        } else if !self.sessions.contains_key(&key) && (flags.rst || packet.payload.is_empty()) {
            // Nothing worth tracking for a bare ACK/FIN/RST on an unknown session.
            return Ingest {
                key,
                delivered: 0,
                events,
            };
        }

        if !self.sessions.contains_key(&key) {
            if self.sessions.len() >= self.max_sessions {
                debug!(session = %key, "session table full, ignoring new flow");
                return Ingest {
                    key,
                    delivered: 0,
                    events,
                };
            }
            let id = SessionId(self.next_id);
            self.next_id += 1;
            let mut session = Session::new(id, key, now);
            if flags.syn {
                session.next_seq = Some(packet.seq.wrapping_add(1));
                session.anchored = true;
            }
            self.sessions.insert(key, session);
            events.push(StreamEvent::Opened { id, key });
        }

        let holding_cap = self.holding_cap;
        let Some(session) = self.sessions.get_mut(&key) else {
            return Ingest {
                key,
                delivered: 0,
                events,
            };
        };
        session.last_activity = now;

        let seq = if flags.syn {
            packet.seq.wrapping_add(1)
        } else {
            packet.seq
        };
        let accepted = session.accept(seq, &packet.payload, holding_cap);
        if let Some((dropped, skipped)) = accepted.overflow {
            events.push(StreamEvent::HoldingOverflow {
                id: session.id,
                key,
                dropped,
                skipped,
            });
        }

        if flags.rst {
            session.closing = Some(CloseReason::Reset);
        } else if flags.fin && session.closing.is_none() {
            session.closing = Some(CloseReason::Fin);
        }

        Ingest {
            key,
            delivered: accepted.delivered,
            events,
        }
    }

    /// Remove sessions that saw FIN or RST. Call after their final bytes
    /// have been framed.
    pub fn reap_closed(&mut self) -> Vec<StreamEvent> {
        let closed: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.closing.is_some())
            .map(|(k, _)| *k)
            .collect();
        closed
            .into_iter()
            .filter_map(|key| {
                let s = self.sessions.remove(&key)?;
                Some(StreamEvent::Closed {
                    id: s.id,
                    key,
                    reason: s.closing.unwrap_or(CloseReason::Fin),
                })
            })
            .collect()
    }

    /// Remove every session, oldest first.
    pub fn close_all(&mut self, reason: CloseReason) -> Vec<StreamEvent> {
        let mut sessions: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        sessions.sort_unstable_by_key(|s| s.id);
        sessions
            .into_iter()
            .map(|s| StreamEvent::Closed {
                id: s.id,
                key: s.key,
                reason,
            })
            .collect()
    }

    /// Remove sessions with no traffic for longer than the idle timeout.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<StreamEvent> {
        let timeout = self.idle_timeout;
        let idle: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|(k, _)| *k)
            .collect();
        idle.into_iter()
            .filter_map(|key| {
                let s = self.sessions.remove(&key)?;
                Some(StreamEvent::Closed {
                    id: s.id,
                    key,
                    reason: CloseReason::Idle,
                })
            })
            .collect()
    }
}
