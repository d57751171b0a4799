//! Per-session release ordering.
//!
//! Translations finish in any order. Lines are held until every earlier
//! record of the same session has finished, so each session's output keeps
//! capture order. A bounded window stops one stuck record from holding back
//! a whole session: once too many lines wait behind it, the oldest waiting
//! line goes out flagged `out_of_order`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::postprocess::DisplayLine;
use crate::reassembly::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub line: DisplayLine,
    /// Pushed out by the window ahead of an unfinished predecessor.
    pub forced: bool,
}

#[derive(Default)]
struct SessionOrder {
    outstanding: BTreeSet<u64>,
    ready: BTreeMap<u64, DisplayLine>,
    highest_released: Option<u64>,
}

impl SessionOrder {
    fn is_idle(&self) -> bool {
        self.outstanding.is_empty() && self.ready.is_empty()
    }

    fn release_next(&mut self, out_of_order: bool, out: &mut Vec<Release>) -> bool {
        let Some((seq, mut line)) = self.ready.pop_first() else {
            return false;
        };
        line.out_of_order = out_of_order;
        self.highest_released = Some(self.highest_released.map_or(seq, |h| h.max(seq)));
        out.push(Release {
            line,
            forced: out_of_order,
        });
        true
    }
}

pub struct ReorderBuffer {
    window: usize,
    sessions: HashMap<SessionId, SessionOrder>,
}

impl ReorderBuffer {
    pub fn new(window: usize) -> Self {
        ReorderBuffer {
            window: window.max(1),
            sessions: HashMap::new(),
        }
    }

    /// Register a record before its outcome is known.
    pub fn track(&mut self, session: SessionId, sequence: u64) {
        self.sessions
            .entry(session)
            .or_default()
            .outstanding
            .insert(sequence);
    }

    /// Hand in a finished line; returns whatever can now be released, in
    /// order.
    pub fn complete(&mut self, mut line: DisplayLine) -> Vec<Release> {
        let session = line.session;
        let order = self.sessions.entry(session).or_default();
        order.outstanding.remove(&line.sequence);

        let mut out = Vec::new();
        if order.highest_released.is_some_and(|h| line.sequence < h) {
            // A successor was already forced out; this one is late.
            line.out_of_order = true;
            out.push(Release {
                line,
                forced: false,
            });
        } else {
            order.ready.insert(line.sequence, line);
        }

        while let Some(&first) = order.ready.keys().next() {
            let blocked = order.outstanding.first().is_some_and(|&o| o < first);
            if !blocked {
                order.release_next(false, &mut out);
            } else if order.ready.len() > self.window {
                order.release_next(true, &mut out);
            } else {
                break;
            }
        }

        if order.is_idle() {
            self.sessions.remove(&session);
        }
        out
    }

    /// Lines waiting on a predecessor, across all sessions.
    pub fn waiting(&self) -> usize {
        self.sessions.values().map(|o| o.ready.len()).sum()
    }

    pub fn outstanding(&self) -> usize {
        self.sessions.values().map(|o| o.outstanding.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::TranslationStatus;
    use crate::protocol::chat::Channel;
    use crate::protocol::SessionKey;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    fn line(session: u64, sequence: u64) -> DisplayLine {
        DisplayLine {
            session: SessionId(session),
            key: SessionKey::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                5003,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                40000,
            ),
            sequence,
            channel: Channel::World,
            speaker_id: 1,
            speaker_name: "a".into(),
            original: format!("line {}", sequence),
            translated: None,
            status: TranslationStatus::Skipped,
            out_of_order: false,
            captured_at: Utc::now(),
        }
    }

    fn seqs(released: &[Release]) -> Vec<u64> {
        released.iter().map(|r| r.line.sequence).collect()
    }

    #[test]
    fn in_order_completion_releases_immediately() {
        let mut buf = ReorderBuffer::new(4);
        buf.track(SessionId(1), 0);
        buf.track(SessionId(1), 1);
        assert_eq!(seqs(&buf.complete(line(1, 0))), vec![0]);
        assert_eq!(seqs(&buf.complete(line(1, 1))), vec![1]);
        assert_eq!(buf.outstanding(), 0);
    }

    #[test]
    fn later_line_waits_for_predecessor() {
        let mut buf = ReorderBuffer::new(4);
        for seq in 0..3 {
            buf.track(SessionId(1), seq);
        }
        assert!(buf.complete(line(1, 2)).is_empty());
        assert!(buf.complete(line(1, 1)).is_empty());
        assert_eq!(buf.waiting(), 2);
        let released = buf.complete(line(1, 0));
        assert_eq!(seqs(&released), vec![0, 1, 2]);
        assert!(released.iter().all(|r| !r.forced && !r.line.out_of_order));
    }

    #[test]
    fn sessions_are_independent() {
        let mut buf = ReorderBuffer::new(4);
        buf.track(SessionId(1), 0);
        buf.track(SessionId(2), 0);
        buf.track(SessionId(2), 1);
        assert_eq!(seqs(&buf.complete(line(2, 0))), vec![0]);
        assert_eq!(seqs(&buf.complete(line(2, 1))), vec![1]);
        assert_eq!(seqs(&buf.complete(line(1, 0))), vec![0]);
    }

    #[test]
    fn window_overflow_forces_oldest_out() {
        let mut buf = ReorderBuffer::new(2);
        for seq in 0..4 {
            buf.track(SessionId(1), seq);
        }
        assert!(buf.complete(line(1, 1)).is_empty());
        assert!(buf.complete(line(1, 2)).is_empty());
        let released = buf.complete(line(1, 3));
        assert_eq!(seqs(&released), vec![1]);
        assert!(released[0].forced);
        assert!(released[0].line.out_of_order);
        assert_eq!(buf.waiting(), 2);
    }

    #[test]
    fn late_predecessor_is_flagged() {
        let mut buf = ReorderBuffer::new(1);
        for seq in 0..3 {
            buf.track(SessionId(1), seq);
        }
        assert!(buf.complete(line(1, 1)).is_empty());
        // window of one: 1 is forced out once 2 is ready
        let released = buf.complete(line(1, 2));
        assert_eq!(seqs(&released), vec![1]);

        let released = buf.complete(line(1, 0));
        assert_eq!(seqs(&released), vec![0, 2]);
        assert!(released[0].line.out_of_order);
        assert!(!released[0].forced);
        assert!(!released[1].line.out_of_order);
        assert_eq!(buf.waiting(), 0);
    }
}
