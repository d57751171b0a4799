//! Capture thread and dispatcher task, wired together.
//!
//! One OS thread owns the pcap handle, the stream table and framing. Decoded
//! records cross to the tokio runtime without blocking, so capture never
//! waits on translation. The dispatcher task owns everything after that.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::pcap_writer::PcapWriter;
use crate::capture::PacketSource;
use crate::config::Settings;
use crate::diagnostics::{DiagnosticsFeed, PipelineEvent};
use crate::error::{error_chain, CaptureError, DriverError, PipelineError};
use crate::postprocess::glossary::Glossary;
use crate::postprocess::nickname::NicknameCache;
use crate::postprocess::PostProcessor;
use crate::protocol::frame::{self, Extract};
use crate::protocol::{self, chat, LinkType, SessionKey};
use crate::reassembly::{CloseReason, StreamEvent, StreamTable};
use crate::translate::engine::{EngineSpawner, ProcessSpawner};
use crate::translate::intake::{record_channel, Forwarded, RecordSender};
use crate::translate::{ChatRecord, Dispatcher, DispatcherConfig};

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Replay this pcap file instead of capturing live.
    pub input: Option<PathBuf>,
    /// Copy every captured packet to this pcap file.
    pub record_to: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub packets: u64,
    pub records: u64,
    /// Records that found the dispatcher channel full and were spilled.
    pub overflowed: u64,
}

/// The diagnostics event for a failed start attempt.
pub fn driver_event(err: &DriverError) -> PipelineEvent {
    match err {
        DriverError::AccessDenied { reason } => PipelineEvent::PrivilegeCheckFailed {
            reason: reason.clone(),
        },
        DriverError::IntegrityCheckFailed { reason } => PipelineEvent::DriverIntegrityFailed {
            reason: reason.clone(),
        },
        DriverError::DriverNotFound { name } => PipelineEvent::DriverNotFound { name: name.clone() },
        other => PipelineEvent::CaptureStopped {
            reason: error_chain(other),
        },
    }
}

enum LoopEnd {
    Stopped,
    EndOfFile,
    Failed(String),
}

/// Notices when nothing has matched the capture filter for a while, which
/// usually means the wrong interface or filter, or no game running.
struct TrafficWatchdog {
    period: Option<Duration>,
    since: Instant,
}

impl TrafficWatchdog {
    fn new(period: Option<Duration>, now: Instant) -> Self {
        TrafficWatchdog { period, since: now }
    }

    fn saw_traffic(&mut self, now: Instant) {
        self.since = now;
    }

    /// Length of the quiet spell once it reaches the period. Re-arms, so a
    /// long silence reports once per period.
    fn check(&mut self, now: Instant) -> Option<Duration> {
        let period = self.period?;
        let quiet = now.saturating_duration_since(self.since);
        if quiet < period {
            return None;
        }
        self.since = now;
        Some(quiet)
    }
}

struct CaptureWorker {
    settings: Settings,
    options: PipelineOptions,
    feed: DiagnosticsFeed,
    records: RecordSender,
    stop: Receiver<()>,
}

impl CaptureWorker {
    fn stop_requested(&self) -> bool {
        matches!(self.stop.try_recv(), Ok(()) | Err(TryRecvError::Disconnected))
    }

    /// Sleep for the retry interval; true if asked to stop meanwhile.
    fn wait_or_stop(&self, interval: Duration) -> bool {
        !matches!(self.stop.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
    }

    fn source_name(&self) -> String {
        match &self.options.input {
            Some(path) => path.display().to_string(),
            None => self
                .settings
                .capture
                .interface
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        }
    }

    fn run(mut self) -> CaptureStats {
        let mut stats = CaptureStats::default();
        let replay = self.options.input.is_some();
        let mut last_failure: Option<PipelineEvent> = None;

        loop {
            if self.stop_requested() {
                return stats;
            }

            match PacketSource::open_with(&self.settings.capture, self.options.input.as_deref()) {
                Ok(source) => {
                    last_failure = None;
                    self.feed.publish_event(PipelineEvent::DriverLoaded {
                        source: self.source_name(),
                        link: source.link_type(),
                    });
                    match self.capture_loop(source, &mut stats) {
                        LoopEnd::Stopped => return stats,
                        LoopEnd::EndOfFile => {
                            self.feed.publish_event(PipelineEvent::CaptureStopped {
                                reason: "end of capture file".to_string(),
                            });
                            return stats;
                        }
                        LoopEnd::Failed(reason) => {
                            self.feed
                                .publish_event(PipelineEvent::CaptureStopped { reason });
                            if replay {
                                return stats;
                            }
                        }
                    }
                }
                Err(e) => {
                    for hint in e.recovery_suggestions() {
                        info!(hint, "capture recovery");
                    }
                    // Repeated identical failures are reported once.
                    let event = driver_event(&e);
                    if last_failure.as_ref() != Some(&event) {
                        self.feed.publish_event(event.clone());
                        last_failure = Some(event);
                    }
                    if replay || !e.is_retryable() {
                        if !matches!(last_failure, Some(PipelineEvent::CaptureStopped { .. })) {
                            self.feed.publish_event(PipelineEvent::CaptureStopped {
                                reason: "capture cannot start".to_string(),
                            });
                        }
                        return stats;
                    }
                }
            }

            debug!(
                retry_ms = self.settings.retry_interval_ms,
                "capture not running, retrying later"
            );
            if self.wait_or_stop(self.settings.retry_interval()) {
                return stats;
            }
        }
    }

    fn open_writer(&self, link: LinkType) -> Option<PcapWriter<std::io::BufWriter<std::fs::File>>> {
        let path = self.options.record_to.as_ref()?;
        let snaplen = u32::try_from(self.settings.capture.snaplen).unwrap_or(65535);
        match PcapWriter::create(path, link, snaplen) {
            Ok(writer) => {
                info!(file = %path.display(), "recording packets");
                Some(writer)
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot record packets");
                None
            }
        }
    }

    fn capture_loop(&mut self, mut source: PacketSource, stats: &mut CaptureStats) -> LoopEnd {
        let link = source.link_type();
        let mut table = StreamTable::new(&self.settings.reassembly);
        let mut writer = self.open_writer(link);
        let sweep_every = Duration::from_millis(self.settings.reassembly.sweep_interval_ms);
        let port_guard = self.settings.capture.filter.is_none();
        let mut last_sweep = Instant::now();
        let mut watchdog = TrafficWatchdog::new(self.settings.capture.watchdog(), last_sweep);
        let mut first_seen = false;

        loop {
            if self.stop_requested() {
                return LoopEnd::Stopped;
            }

            let now = Instant::now();
            if now.duration_since(last_sweep) >= sweep_every {
                self.publish_stream_events(table.expire_idle(now));
                if let Some(quiet) = watchdog.check(now) {
                    self.feed.publish_event(PipelineEvent::NoTraffic {
                        quiet_ms: quiet.as_millis() as u64,
                    });
                }
                last_sweep = now;
            }

            let packet = match source.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(CaptureError::HandleClosed) if self.options.input.is_some() => {
                    self.publish_stream_events(table.close_all(CloseReason::CaptureEnded));
                    return LoopEnd::EndOfFile;
                }
                Err(e) => {
                    self.publish_stream_events(table.close_all(CloseReason::CaptureEnded));
                    return LoopEnd::Failed(error_chain(&e));
                }
            };
            stats.packets += 1;

            if let Some(w) = writer.as_mut() {
                if let Err(e) = w.write_packet(&packet.data, packet.timestamp) {
                    warn!(error = %e, "packet recording failed, stopping recording");
                    writer = None;
                }
            }

            let Some(parsed) = protocol::parse_packet(&packet.data, link) else {
                continue;
            };
            if port_guard && !parsed.touches_port(&self.settings.capture.ports) {
                continue;
            }
            watchdog.saw_traffic(now);
            if !first_seen {
                first_seen = true;
                self.feed.publish_event(PipelineEvent::FirstPacketCaptured {
                    key: parsed.session_key(),
                });
            }

            let ingest = table.ingest(&parsed, now);
            self.publish_stream_events(ingest.events);
            if ingest.delivered > 0 {
                self.drain_frames(&mut table, &ingest.key, now, packet.timestamp, stats);
            }
            self.publish_stream_events(table.reap_closed());
        }
    }

    fn drain_frames(
        &mut self,
        table: &mut StreamTable,
        key: &SessionKey,
        now: Instant,
        captured: SystemTime,
        stats: &mut CaptureStats,
    ) {
        let Some(session) = table.session_mut(key) else {
            return;
        };
        loop {
            match frame::try_extract_frame(session, &self.settings.framing, now) {
                Extract::Frame(frame) => {
                    for message in chat::decode_frame(&frame) {
                        let record = ChatRecord {
                            session: session.id,
                            key: session.key,
                            sequence: session.next_record_sequence(),
                            message,
                            captured_at: DateTime::<Utc>::from(captured),
                        };
                        stats.records += 1;
                        self.forward(record, stats);
                    }
                }
                Extract::NeedMore => break,
                Extract::Corrupt { discarded } => {
                    self.feed.publish_event(PipelineEvent::SessionReset {
                        session: session.id,
                        key: session.key,
                        discarded,
                    });
                    break;
                }
            }
        }
    }

    fn forward(&mut self, record: ChatRecord, stats: &mut CaptureStats) {
        let (session, sequence) = (record.session, record.sequence);
        match self.records.forward(record) {
            Forwarded::Queued => {}
            Forwarded::Spilled => {
                stats.overflowed += 1;
                debug!(%session, sequence, "record channel full, spilling");
            }
            Forwarded::Closed => debug!(%session, sequence, "dispatcher gone, dropping record"),
        }
    }

    fn publish_stream_events(&self, events: Vec<StreamEvent>) {
        for event in events {
            self.feed.publish_event(event.into());
        }
    }
}

/// Running pipeline. Must be started inside a tokio runtime.
pub struct Pipeline {
    feed: DiagnosticsFeed,
    stop: Option<Sender<()>>,
    capture: Option<thread::JoinHandle<CaptureStats>>,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start with the engine and dictionary named in `settings`.
    pub fn start(
        settings: Settings,
        options: PipelineOptions,
        feed: DiagnosticsFeed,
    ) -> Result<Self, PipelineError> {
        let glossary = match &settings.translation.dictionary_path {
            Some(path) => Glossary::load(path)?,
            None => Glossary::empty(),
        };
        let spawner: Option<Arc<dyn EngineSpawner>> =
            match ProcessSpawner::from_settings(&settings.translation) {
                Ok(spawner) => Some(Arc::new(spawner)),
                Err(e) => {
                    debug!(reason = %e, "no translation engine");
                    None
                }
            };
        let nicknames = NicknameCache::with_kakasi(settings.translation.nickname_cache_size);
        Self::start_with(settings, options, feed, spawner, glossary, nicknames)
    }

    pub fn start_with(
        settings: Settings,
        options: PipelineOptions,
        feed: DiagnosticsFeed,
        spawner: Option<Arc<dyn EngineSpawner>>,
        glossary: Glossary,
        nicknames: NicknameCache,
    ) -> Result<Self, PipelineError> {
        let (records_tx, records_rx) = record_channel(settings.translation.queue_capacity);
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            DispatcherConfig::from_settings(&settings.translation),
            spawner,
            PostProcessor::new(glossary),
            nicknames,
            feed.clone(),
        );
        let dispatcher = tokio::spawn(dispatcher.run(records_rx, cancel.clone()));

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let worker = CaptureWorker {
            settings,
            options,
            feed: feed.clone(),
            records: records_tx,
            stop: stop_rx,
        };
        let capture = thread::Builder::new()
            .name("chatwire-capture".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                cancel.cancel();
                PipelineError::Thread(e)
            })?;

        Ok(Pipeline {
            feed,
            stop: Some(stop_tx),
            capture: Some(capture),
            cancel,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn feed(&self) -> &DiagnosticsFeed {
        &self.feed
    }

    /// Resolves once capture has ended on its own (end of a replay file or
    /// a non-retryable error) and the dispatcher has finished its work.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.dispatcher.as_mut() {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher task failed");
            }
            self.dispatcher = None;
        }
    }

    /// Stop capture first, then the dispatcher. In-flight translations are
    /// discarded.
    pub async fn shutdown(mut self) -> CaptureStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }

        let stats = match self.capture.take() {
            Some(handle) => match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(stats)) => stats,
                Ok(Err(_)) => {
                    warn!("capture thread panicked");
                    CaptureStats::default()
                }
                Err(e) => {
                    warn!(error = %e, "failed to join capture thread");
                    CaptureStats::default()
                }
            },
            None => CaptureStats::default(),
        };

        self.cancel.cancel();
        if let Some(handle) = self.dispatcher.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher task failed");
            }
        }

        info!(
            packets = stats.packets,
            records = stats.records,
            overflowed = stats.overflowed,
            "pipeline stopped"
        );
        stats
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Dropping the sender also stops the capture thread.
        self.stop.take();
        self.cancel.cancel();
    }
}
