//! Record hand-off from the capture thread to the dispatcher.
//!
//! Records normally travel over a bounded channel. When it is full, capture
//! cannot wait, so the record spills onto an unbounded side lane tagged with
//! how many records went over the main channel before it. The receiving end
//! merges both lanes back into capture order, so a spilled record never
//! overtakes an earlier one.

use std::collections::VecDeque;

use tokio::sync::mpsc::{self, error::TrySendError};

use super::ChatRecord;

#[derive(Debug)]
struct Spilled {
    /// Records sent over the main channel before this one.
    after: u64,
    record: ChatRecord,
}

/// What the dispatcher receives, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    Record(ChatRecord),
    /// Found the main channel full; passes through untranslated.
    Overflowed(ChatRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Queued,
    Spilled,
    /// The dispatcher is gone.
    Closed,
}

pub struct RecordSender {
    records: mpsc::Sender<ChatRecord>,
    spilled: mpsc::UnboundedSender<Spilled>,
    sent: u64,
}

impl RecordSender {
    /// Never blocks.
    pub fn forward(&mut self, record: ChatRecord) -> Forwarded {
        match self.records.try_send(record) {
            Ok(()) => {
                self.sent += 1;
                Forwarded::Queued
            }
            Err(TrySendError::Full(record)) => {
                let spill = Spilled {
                    after: self.sent,
                    record,
                };
                match self.spilled.send(spill) {
                    Ok(()) => Forwarded::Spilled,
                    Err(_) => Forwarded::Closed,
                }
            }
            Err(TrySendError::Closed(_)) => Forwarded::Closed,
        }
    }
}

pub struct RecordIntake {
    records: mpsc::Receiver<ChatRecord>,
    spilled: mpsc::UnboundedReceiver<Spilled>,
    pending: VecDeque<Spilled>,
    /// A main-channel record received but not yet handed out.
    ahead: Option<ChatRecord>,
    received: u64,
    records_open: bool,
    spilled_open: bool,
}

/// Channel pair with `capacity` slots on the main lane.
pub fn record_channel(capacity: usize) -> (RecordSender, RecordIntake) {
    let (records_tx, records_rx) = mpsc::channel(capacity.max(1));
    let (spilled_tx, spilled_rx) = mpsc::unbounded_channel();
    (
        RecordSender {
            records: records_tx,
            spilled: spilled_tx,
            sent: 0,
        },
        RecordIntake {
            records: records_rx,
            spilled: spilled_rx,
            pending: VecDeque::new(),
            ahead: None,
            received: 0,
            records_open: true,
            spilled_open: true,
        },
    )
}

impl RecordIntake {
    /// Next record in capture order; `None` once the sender is dropped and
    /// everything has been handed out. Cancel safe.
    pub async fn recv(&mut self) -> Option<Intake> {
        loop {
            if let Some(front) = self.pending.front() {
                if front.after <= self.received || !self.records_open {
                    return self.pending.pop_front().map(|s| Intake::Overflowed(s.record));
                }
            }
            if let Some(record) = self.ahead.take() {
                self.received += 1;
                return Some(Intake::Record(record));
            }
            if !self.records_open && !self.spilled_open {
                return None;
            }

            tokio::select! {
                biased;

                record = self.records.recv(), if self.records_open => match record {
                    Some(record) => {
                        // Anything spilled before this record was sent is
                        // already visible on the side lane.
                        while let Ok(spill) = self.spilled.try_recv() {
                            self.pending.push_back(spill);
                        }
                        self.ahead = Some(record);
                    }
                    None => self.records_open = false,
                },

                spill = self.spilled.recv(), if self.spilled_open => match spill {
                    Some(spill) => self.pending.push_back(spill),
                    None => self.spilled_open = false,
                },
            }
        }
    }
}
