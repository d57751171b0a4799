//! Translation dispatcher.
//!
//! Owns everything between a decoded chat record and its display line: the
//! engine connection and its supervision, the in-flight map, the pending
//! queue, the reorder buffer and the nickname cache. It runs as a single
//! task, so none of that state is shared.

pub mod engine;
pub mod intake;
pub mod reorder;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TranslationSettings;
use crate::diagnostics::{DiagnosticsFeed, PipelineEvent};
use crate::error::{error_chain, EngineError};
use crate::postprocess::glossary::Shield;
use crate::postprocess::nickname::NicknameCache;
use crate::postprocess::{contains_japanese, Outcome, PassthroughReason, PostProcessor};
use crate::protocol::chat::ChatMessage;
use crate::protocol::SessionKey;
use crate::reassembly::SessionId;

use engine::{EngineConnection, EngineMessage, EngineRequest, EngineSpawner};
use intake::{Intake, RecordIntake};
use reorder::ReorderBuffer;

/// A decoded chat line on its way to translation. Never mutated; the
/// outcome lives in the `DisplayLine` built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRecord {
    pub session: SessionId,
    pub key: SessionKey,
    /// Strictly increasing within a session.
    pub sequence: u64,
    pub message: ChatMessage,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub max_in_flight: usize,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub ready_timeout: Duration,
    pub reorder_window: usize,
    pub restart_attempts: u32,
}

impl DispatcherConfig {
    pub fn from_settings(settings: &TranslationSettings) -> Self {
        DispatcherConfig {
            enabled: settings.enabled,
            max_in_flight: settings.max_in_flight(),
            queue_capacity: settings.queue_capacity,
            request_timeout: settings.request_timeout(),
            ready_timeout: Duration::from_millis(settings.ready_timeout_ms),
            reorder_window: settings.reorder_window,
            restart_attempts: settings.restart_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Translation switched off; every record is skipped.
    Disabled,
    /// Engine spawned, waiting for its ready message.
    Starting,
    Ready,
    /// No engine and no restarts left; every record passes through.
    Unavailable,
}

struct InFlight {
    record: ChatRecord,
    speaker_name: String,
    shield: Shield,
    sent_at: Instant,
    deadline: Instant,
}

struct Queued {
    record: ChatRecord,
    speaker_name: String,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    spawner: Option<Arc<dyn EngineSpawner>>,
    engine: Option<EngineConnection>,
    state: EngineState,
    ready_deadline: Option<Instant>,
    restarts_left: u32,
    next_request_id: u64,
    in_flight: HashMap<u64, InFlight>,
    queue: VecDeque<Queued>,
    reorder: ReorderBuffer,
    nicknames: NicknameCache,
    post: PostProcessor,
    feed: DiagnosticsFeed,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        spawner: Option<Arc<dyn EngineSpawner>>,
        post: PostProcessor,
        nicknames: NicknameCache,
        feed: DiagnosticsFeed,
    ) -> Self {
        let state = if config.enabled {
            EngineState::Starting
        } else {
            EngineState::Disabled
        };
        Dispatcher {
            restarts_left: config.restart_attempts,
            reorder: ReorderBuffer::new(config.reorder_window),
            queue: VecDeque::with_capacity(config.queue_capacity),
            config,
            spawner,
            engine: None,
            state,
            ready_deadline: None,
            next_request_id: 0,
            in_flight: HashMap::new(),
            nicknames,
            post,
            feed,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn nicknames(&self) -> &NicknameCache {
        &self.nicknames
    }

    /// Launch the engine, or settle into skip/passthrough mode if there is
    /// none to launch.
    pub async fn start(&mut self) {
        if !self.config.enabled {
            info!("translation disabled");
            self.state = EngineState::Disabled;
            return;
        }
        if self.spawner.is_none() {
            self.become_unavailable(EngineError::NotConfigured.to_string());
            return;
        }
        self.launch().await;
    }

    async fn launch(&mut self) {
        let Some(spawner) = self.spawner.clone() else {
            return self.become_unavailable(EngineError::NotConfigured.to_string());
        };
        match spawner.spawn().await {
            Ok(connection) => {
                self.engine = Some(connection);
                self.state = EngineState::Starting;
                self.ready_deadline = Some(Instant::now() + self.config.ready_timeout);
                debug!("translation engine spawned, waiting for ready");
            }
            Err(e) => self.become_unavailable(error_chain(&e)),
        }
    }

    fn become_unavailable(&mut self, reason: String) {
        self.engine = None;
        self.ready_deadline = None;
        self.state = EngineState::Unavailable;
        self.feed
            .publish_event(PipelineEvent::EngineUnavailable { reason });
        while let Some(queued) = self.queue.pop_front() {
            self.complete(
                queued.record,
                queued.speaker_name,
                Outcome::Passthrough(PassthroughReason::EngineUnavailable),
            );
        }
    }

    /// Accept a record. Every submitted record produces exactly one display
    /// line, now or later.
    pub fn submit(&mut self, record: ChatRecord) {
        self.reorder.track(record.session, record.sequence);
        let speaker_name = self
            .nicknames
            .acquire(record.message.speaker_id, &record.message.nickname);

        if !contains_japanese(&record.message.text) {
            return self.complete(record, speaker_name, Outcome::Skipped);
        }

        match self.state {
            EngineState::Disabled => self.complete(record, speaker_name, Outcome::Skipped),
            EngineState::Unavailable => self.complete(
                record,
                speaker_name,
                Outcome::Passthrough(PassthroughReason::EngineUnavailable),
            ),
            EngineState::Ready
                if self.queue.is_empty() && self.in_flight.len() < self.config.max_in_flight =>
            {
                self.send(record, speaker_name)
            }
            EngineState::Ready | EngineState::Starting => self.enqueue(record, speaker_name),
        }
    }

    /// Accept a record the capture side could not queue. It still takes its
    /// place in session order, just without a translation.
    pub fn submit_overflowed(&mut self, record: ChatRecord) {
        self.reorder.track(record.session, record.sequence);
        let speaker_name = self
            .nicknames
            .acquire(record.message.speaker_id, &record.message.nickname);

        if !contains_japanese(&record.message.text) || self.state == EngineState::Disabled {
            return self.complete(record, speaker_name, Outcome::Skipped);
        }
        self.feed.publish_event(PipelineEvent::QueueOverflow {
            session: record.session,
            sequence: record.sequence,
        });
        self.complete(
            record,
            speaker_name,
            Outcome::Passthrough(PassthroughReason::QueueOverflow),
        );
    }

    fn enqueue(&mut self, record: ChatRecord, speaker_name: String) {
        if self.queue.len() >= self.config.queue_capacity {
            self.feed.publish_event(PipelineEvent::QueueOverflow {
                session: record.session,
                sequence: record.sequence,
            });
            return self.complete(
                record,
                speaker_name,
                Outcome::Passthrough(PassthroughReason::QueueOverflow),
            );
        }
        self.queue.push_back(Queued {
            record,
            speaker_name,
        });
    }

    fn send(&mut self, record: ChatRecord, speaker_name: String) {
        let shield = self.post.shield(&record, &speaker_name);
        let id = self.next_request_id;
        self.next_request_id += 1;

        let request = EngineRequest::Translate {
            id,
            text: shield.masked.clone(),
            nickname: Some(speaker_name.clone()),
        };
        let sent = match &self.engine {
            Some(engine) => engine.requests.try_send(request).map_err(|e| e.to_string()),
            None => Err("no engine connection".to_string()),
        };

        match sent {
            Ok(()) => {
                trace!(id, session = %record.session, sequence = record.sequence, "translation requested");
                let now = Instant::now();
                self.in_flight.insert(
                    id,
                    InFlight {
                        record,
                        speaker_name,
                        shield,
                        sent_at: now,
                        deadline: now + self.config.request_timeout,
                    },
                );
            }
            Err(reason) => {
                warn!(id, %reason, "could not send translation request");
                self.complete(
                    record,
                    speaker_name,
                    Outcome::Passthrough(PassthroughReason::EngineUnavailable),
                );
            }
        }
    }

    fn pump(&mut self) {
        while self.state == EngineState::Ready && self.in_flight.len() < self.config.max_in_flight {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.send(queued.record, queued.speaker_name);
        }
    }

    fn complete(&mut self, record: ChatRecord, speaker_name: String, outcome: Outcome) {
        let line = self.post.process(&record, speaker_name, outcome);
        for release in self.reorder.complete(line) {
            if release.forced {
                self.feed.publish_event(PipelineEvent::ReorderOverflow {
                    session: release.line.session,
                    sequence: release.line.sequence,
                });
            }
            self.nicknames.release(release.line.speaker_id);
            self.feed.publish_line(release.line);
        }
    }

    /// Handle one item from the engine. `None` means its message channel
    /// closed, i.e. the engine is gone.
    pub async fn on_engine_message(&mut self, message: Option<EngineMessage>) {
        let Some(message) = message else {
            return self.handle_crash().await;
        };

        match message {
            EngineMessage::Ready { model } => {
                info!(model = ?model, "translation engine ready");
                self.state = EngineState::Ready;
                self.ready_deadline = None;
                self.restarts_left = self.config.restart_attempts;
                self.feed.publish_event(PipelineEvent::EngineReady { model });
                self.pump();
            }
            EngineMessage::Result { id, translated } => match self.in_flight.remove(&id) {
                Some(done) => {
                    debug!(
                        id,
                        elapsed_ms = done.sent_at.elapsed().as_millis() as u64,
                        "translation received"
                    );
                    self.complete(
                        done.record,
                        done.speaker_name,
                        Outcome::Translated {
                            raw: translated,
                            shield: done.shield,
                        },
                    );
                    self.pump();
                }
                None => debug!(id, "result for unknown or expired request"),
            },
            EngineMessage::Error { id, message } => {
                self.feed
                    .publish_event(PipelineEvent::EngineError { id, message });
                if let Some(failed) = id.and_then(|id| self.in_flight.remove(&id)) {
                    self.complete(
                        failed.record,
                        failed.speaker_name,
                        Outcome::Passthrough(PassthroughReason::EngineError),
                    );
                    self.pump();
                }
            }
            EngineMessage::Info { message } | EngineMessage::Status { message } => {
                info!(target: "chatwire::engine", "{}", message)
            }
            EngineMessage::Debug { message } => debug!(target: "chatwire::engine", "{}", message),
        }
    }

    async fn handle_crash(&mut self) {
        self.engine = None;
        self.ready_deadline = None;

        let mut lost: Vec<(u64, InFlight)> = self.in_flight.drain().collect();
        lost.sort_unstable_by_key(|(id, _)| *id);
        self.feed.publish_event(PipelineEvent::EngineCrashed {
            pending: lost.len(),
        });
        for (_, request) in lost {
            self.complete(
                request.record,
                request.speaker_name,
                Outcome::Passthrough(PassthroughReason::EngineCrashed),
            );
        }

        if self.restarts_left > 0 {
            self.restarts_left -= 1;
            info!(remaining = self.restarts_left, "restarting translation engine");
            self.launch().await;
        } else {
            self.become_unavailable("engine exited and no restarts are left".to_string());
        }
    }

    /// Time out overdue requests, and an engine that never became ready.
    pub async fn expire(&mut self, now: Instant) {
        let mut overdue: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        overdue.sort_unstable();

        for id in overdue {
            let Some(request) = self.in_flight.remove(&id) else {
                continue;
            };
            self.feed.publish_event(PipelineEvent::TranslationTimeout {
                session: request.record.session,
                sequence: request.record.sequence,
                after_ms: now.duration_since(request.sent_at).as_millis() as u64,
            });
            self.complete(
                request.record,
                request.speaker_name,
                Outcome::Passthrough(PassthroughReason::Timeout),
            );
        }

        if self.ready_deadline.is_some_and(|deadline| deadline <= now) {
            warn!(
                timeout_ms = self.config.ready_timeout.as_millis() as u64,
                "translation engine never became ready"
            );
            self.handle_crash().await;
        }
        self.pump();
    }

    /// Earliest instant at which `expire` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .values()
            .map(|request| request.deadline)
            .chain(self.ready_deadline)
            .min()
    }

    fn is_drained(&self) -> bool {
        self.in_flight.is_empty() && self.queue.is_empty()
    }

    /// Drive the dispatcher until cancelled, or until the record channel
    /// closes and the remaining work is done.
    pub async fn run(mut self, mut records: RecordIntake, cancel: CancellationToken) {
        self.start().await;
        let mut records_open = true;

        loop {
            if !records_open && self.is_drained() {
                break;
            }
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                message = next_message(&mut self.engine) => self.on_engine_message(message).await,

                record = records.recv(), if records_open => match record {
                    Some(Intake::Record(record)) => self.submit(record),
                    Some(Intake::Overflowed(record)) => self.submit_overflowed(record),
                    None => {
                        debug!("record channel closed, finishing outstanding work");
                        records_open = false;
                    }
                },

                _ = wait_until(deadline) => self.expire(Instant::now()).await,
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        let discarded = self.in_flight.len() + self.queue.len();
        // Dropping the connection closes the engine's stdin.
        self.engine = None;
        self.in_flight.clear();
        self.queue.clear();
        info!(discarded, "dispatcher stopped");
    }
}

async fn next_message(engine: &mut Option<EngineConnection>) -> Option<EngineMessage> {
    match engine {
        Some(connection) => connection.messages.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
