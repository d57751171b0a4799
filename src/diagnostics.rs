//! Append-only diagnostics feed.
//!
//! Every pipeline event and every display line goes through one ordered
//! feed. Subscribers attach and detach freely over a broadcast channel; a
//! bounded tail is retained so a late subscriber can catch up with
//! `snapshot`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

use crate::postprocess::DisplayLine;
use crate::protocol::{LinkType, SessionKey};
use crate::reassembly::{CloseReason, SessionId, StreamEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    DriverLoaded {
        source: String,
        link: LinkType,
    },
    PrivilegeCheckFailed {
        reason: String,
    },
    DriverIntegrityFailed {
        reason: String,
    },
    DriverNotFound {
        name: String,
    },
    CaptureStopped {
        reason: String,
    },
    FirstPacketCaptured {
        key: SessionKey,
    },
    /// Nothing matched the capture filter for `quiet_ms`.
    NoTraffic {
        quiet_ms: u64,
    },
    StreamDetected {
        session: SessionId,
        key: SessionKey,
    },
    SessionReset {
        session: SessionId,
        key: SessionKey,
        discarded: usize,
    },
    SessionClosed {
        session: SessionId,
        key: SessionKey,
        reason: CloseReason,
    },
    HoldingOverflow {
        session: SessionId,
        key: SessionKey,
        dropped: usize,
        skipped: u64,
    },
    ReorderOverflow {
        session: SessionId,
        sequence: u64,
    },
    QueueOverflow {
        session: SessionId,
        sequence: u64,
    },
    EngineReady {
        model: Option<String>,
    },
    EngineCrashed {
        pending: usize,
    },
    EngineUnavailable {
        reason: String,
    },
    EngineError {
        id: Option<u64>,
        message: String,
    },
    TranslationTimeout {
        session: SessionId,
        sequence: u64,
        after_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::DriverLoaded { .. } => "driver_loaded",
            PipelineEvent::PrivilegeCheckFailed { .. } => "privilege_check_failed",
            PipelineEvent::DriverIntegrityFailed { .. } => "driver_integrity_failed",
            PipelineEvent::DriverNotFound { .. } => "driver_not_found",
            PipelineEvent::CaptureStopped { .. } => "capture_stopped",
            PipelineEvent::FirstPacketCaptured { .. } => "first_packet_captured",
            PipelineEvent::NoTraffic { .. } => "no_traffic",
            PipelineEvent::StreamDetected { .. } => "stream_detected",
            PipelineEvent::SessionReset { .. } => "session_reset",
            PipelineEvent::SessionClosed { .. } => "session_closed",
            PipelineEvent::HoldingOverflow { .. } => "holding_overflow",
            PipelineEvent::ReorderOverflow { .. } => "reorder_overflow",
            PipelineEvent::QueueOverflow { .. } => "queue_overflow",
            PipelineEvent::EngineReady { .. } => "engine_ready",
            PipelineEvent::EngineCrashed { .. } => "engine_crashed",
            PipelineEvent::EngineUnavailable { .. } => "engine_unavailable",
            PipelineEvent::EngineError { .. } => "engine_error",
            PipelineEvent::TranslationTimeout { .. } => "translation_timeout",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PipelineEvent::PrivilegeCheckFailed { .. }
            | PipelineEvent::DriverIntegrityFailed { .. }
            | PipelineEvent::DriverNotFound { .. }
            | PipelineEvent::EngineCrashed { .. }
            | PipelineEvent::EngineUnavailable { .. } => Severity::Error,
            PipelineEvent::CaptureStopped { .. }
            | PipelineEvent::NoTraffic { .. }
            | PipelineEvent::SessionReset { .. }
            | PipelineEvent::HoldingOverflow { .. }
            | PipelineEvent::ReorderOverflow { .. }
            | PipelineEvent::QueueOverflow { .. }
            | PipelineEvent::EngineError { .. }
            | PipelineEvent::TranslationTimeout { .. } => Severity::Warning,
            PipelineEvent::DriverLoaded { .. }
            | PipelineEvent::FirstPacketCaptured { .. }
            | PipelineEvent::StreamDetected { .. }
            | PipelineEvent::SessionClosed { .. }
            | PipelineEvent::EngineReady { .. } => Severity::Info,
        }
    }

    /// One-line human summary, without the event name.
    pub fn detail(&self) -> String {
        match self {
            PipelineEvent::DriverLoaded { source, link } => format!("{} ({:?})", source, link),
            PipelineEvent::PrivilegeCheckFailed { reason }
            | PipelineEvent::DriverIntegrityFailed { reason }
            | PipelineEvent::CaptureStopped { reason }
            | PipelineEvent::EngineUnavailable { reason } => reason.clone(),
            PipelineEvent::DriverNotFound { name } => name.clone(),
            PipelineEvent::FirstPacketCaptured { key } => key.to_string(),
            PipelineEvent::NoTraffic { quiet_ms } => {
                format!("no game traffic for {}s", quiet_ms / 1_000)
            }
            PipelineEvent::StreamDetected { session, key } => format!("{} {}", session, key),
            PipelineEvent::SessionReset {
                session,
                key,
                discarded,
            } => format!("{} {} discarded {} bytes", session, key, discarded),
            PipelineEvent::SessionClosed {
                session,
                key,
                reason,
            } => format!("{} {} ({})", session, key, reason.as_str()),
            PipelineEvent::HoldingOverflow {
                session,
                key,
                dropped,
                skipped,
            } => format!(
                "{} {} dropped {} held bytes, skipped {} byte gap",
                session, key, dropped, skipped
            ),
            PipelineEvent::ReorderOverflow { session, sequence }
            | PipelineEvent::QueueOverflow { session, sequence } => {
                format!("{} seq {}", session, sequence)
            }
            PipelineEvent::EngineReady { model } => model.clone().unwrap_or_default(),
            PipelineEvent::EngineCrashed { pending } => format!("{} pending requests", pending),
            PipelineEvent::EngineError { id, message } => match id {
                Some(id) => format!("request {}: {}", id, message),
                None => message.clone(),
            },
            PipelineEvent::TranslationTimeout {
                session,
                sequence,
                after_ms,
            } => format!("{} seq {} after {}ms", session, sequence, after_ms),
        }
    }

    fn log(&self) {
        match self.severity() {
            Severity::Info => info!(event = self.name(), "{}", self.detail()),
            Severity::Warning => warn!(event = self.name(), "{}", self.detail()),
            Severity::Error => error!(event = self.name(), "{}", self.detail()),
        }
    }
}

impl From<StreamEvent> for PipelineEvent {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Opened { id, key } => PipelineEvent::StreamDetected { session: id, key },
            StreamEvent::HoldingOverflow {
                id,
                key,
                dropped,
                skipped,
            } => PipelineEvent::HoldingOverflow {
                session: id,
                key,
                dropped,
                skipped,
            },
            StreamEvent::Closed { id, key, reason } => PipelineEvent::SessionClosed {
                session: id,
                key,
                reason,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum FeedPayload {
    Event(PipelineEvent),
    Line(DisplayLine),
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    /// Position in the feed; strictly increasing, never reused.
    pub index: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: FeedPayload,
}

impl FeedItem {
    pub fn event(&self) -> Option<&PipelineEvent> {
        match &self.payload {
            FeedPayload::Event(e) => Some(e),
            FeedPayload::Line(_) => None,
        }
    }

    pub fn line(&self) -> Option<&DisplayLine> {
        match &self.payload {
            FeedPayload::Line(l) => Some(l),
            FeedPayload::Event(_) => None,
        }
    }
}

struct FeedState {
    next_index: u64,
    retained: VecDeque<FeedItem>,
    retention: usize,
}

struct Shared {
    sender: broadcast::Sender<FeedItem>,
    state: Mutex<FeedState>,
}

#[derive(Clone)]
pub struct DiagnosticsFeed {
    shared: Arc<Shared>,
}

impl DiagnosticsFeed {
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        let (sender, _) = broadcast::channel(retention.max(16));
        DiagnosticsFeed {
            shared: Arc::new(Shared {
                sender,
                state: Mutex::new(FeedState {
                    next_index: 0,
                    retained: VecDeque::with_capacity(retention),
                    retention,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        // A panic while holding the lock cannot leave the ring inconsistent.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, payload: FeedPayload) -> u64 {
        let mut state = self.state();
        let index = state.next_index;
        state.next_index += 1;

        let item = FeedItem {
            index,
            at: Utc::now(),
            payload,
        };
        if state.retained.len() == state.retention {
            state.retained.pop_front();
        }
        state.retained.push_back(item.clone());
        // Sent under the lock so subscribers see index order. No receivers is fine.
        let _ = self.shared.sender.send(item);
        index
    }

    pub fn publish_event(&self, event: PipelineEvent) -> u64 {
        event.log();
        self.publish(FeedPayload::Event(event))
    }

    pub fn publish_line(&self, line: DisplayLine) -> u64 {
        self.publish(FeedPayload::Line(line))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedItem> {
        self.shared.sender.subscribe()
    }

    /// Retained tail plus a receiver positioned right after it, with no gap
    /// or overlap between the two.
    pub fn subscribe_with_snapshot(&self) -> (Vec<FeedItem>, broadcast::Receiver<FeedItem>) {
        let state = self.state();
        let rx = self.shared.sender.subscribe();
        (state.retained.iter().cloned().collect(), rx)
    }

    pub fn stream(&self) -> BroadcastStream<FeedItem> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn snapshot(&self) -> Vec<FeedItem> {
        self.state().retained.iter().cloned().collect()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.state()
            .retained
            .iter()
            .filter_map(|item| item.event().cloned())
            .collect()
    }

    pub fn lines(&self) -> Vec<DisplayLine> {
        self.state()
            .retained
            .iter()
            .filter_map(|item| item.line().cloned())
            .collect()
    }

    pub fn published(&self) -> u64 {
        self.state().next_index
    }
}
