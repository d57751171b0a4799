//! Runtime settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional file,
//! then `CHATWIRE_`-prefixed environment variables (`__` between sections,
//! e.g. `CHATWIRE_TRANSLATION__TIER=high`). Command-line flags are applied on
//! top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Port the game's chat server talks on.
pub const DEFAULT_GAME_PORT: u16 = 5003;

/// Operator-selected performance profile, fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    #[default]
    Middle,
    High,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierProfile {
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    pub beam_size: u32,
    pub compute_type: &'static str,
}

impl Tier {
    pub fn profile(self) -> TierProfile {
        let (max_in_flight, timeout_ms, beam_size, compute_type) = match self {
            Tier::Low => (2, 100, 1, "int8"),
            Tier::Middle => (4, 150, 5, "int8"),
            Tier::High => (8, 300, 10, "int8"),
            Tier::Extreme => (16, 600, 10, "float16"),
        };
        TierProfile {
            max_in_flight,
            request_timeout: Duration::from_millis(timeout_ms),
            beam_size,
            compute_type,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Middle => "middle",
            Tier::High => "high",
            Tier::Extreme => "extreme",
        }
    }

    /// Next tier down, used when suggesting a remedy for out-of-memory.
    pub fn lower(self) -> Option<Tier> {
        match self {
            Tier::Low => None,
            Tier::Middle => Some(Tier::Low),
            Tier::High => Some(Tier::Middle),
            Tier::Extreme => Some(Tier::High),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Device to capture on; `None` picks the default device.
    pub interface: Option<String>,
    pub ports: Vec<u16>,
    /// Explicit BPF expression; replaces the port-derived filter.
    pub filter: Option<String>,
    pub snaplen: i32,
    pub promisc: bool,
    pub read_timeout_ms: i32,
    /// Also capture client-to-server traffic.
    pub include_outbound: bool,
    /// Warn after this long without game traffic; 0 turns the warning off.
    pub watchdog_ms: u64,
}

impl CaptureSettings {
    pub fn watchdog(&self) -> Option<Duration> {
        (self.watchdog_ms > 0).then(|| Duration::from_millis(self.watchdog_ms))
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            interface: None,
            ports: vec![DEFAULT_GAME_PORT],
            filter: None,
            snaplen: 65535,
            promisc: false,
            read_timeout_ms: 250,
            include_outbound: false,
            watchdog_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySettings {
    pub holding_cap_bytes: usize,
    pub idle_timeout_ms: u64,
    pub max_sessions: usize,
    pub sweep_interval_ms: u64,
}

impl Default for ReassemblySettings {
    fn default() -> Self {
        ReassemblySettings {
            holding_cap_bytes: 256 * 1024,
            idle_timeout_ms: 120_000,
            max_sessions: 1024,
            sweep_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingSettings {
    pub max_frame_len: usize,
    pub resync_window: usize,
}

impl Default for FramingSettings {
    fn default() -> Self {
        FramingSettings {
            max_frame_len: 65_535,
            resync_window: 8_192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationSettings {
    pub enabled: bool,
    pub tier: Tier,
    /// Engine executable. Without one, source-language lines pass through.
    pub engine_command: Option<String>,
    pub engine_args: Vec<String>,
    pub model_path: Option<PathBuf>,
    /// Custom glossary, `{"data": {"source": "target", ...}}`.
    pub dictionary_path: Option<PathBuf>,
    pub device: String,
    pub queue_capacity: usize,
    pub reorder_window: usize,
    /// Overrides the tier's request timeout.
    pub request_timeout_ms: Option<u64>,
    pub ready_timeout_ms: u64,
    pub restart_attempts: u32,
    pub nickname_cache_size: usize,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        TranslationSettings {
            enabled: true,
            tier: Tier::default(),
            engine_command: None,
            engine_args: Vec::new(),
            model_path: None,
            dictionary_path: None,
            device: "cpu".to_string(),
            queue_capacity: 256,
            reorder_window: 32,
            request_timeout_ms: None,
            ready_timeout_ms: 120_000,
            restart_attempts: 1,
            nickname_cache_size: 500,
        }
    }
}

impl TranslationSettings {
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.tier.profile().request_timeout)
    }

    pub fn max_in_flight(&self) -> usize {
        self.tier.profile().max_in_flight
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSettings {
    /// Feed items kept for late subscribers.
    pub retention: usize,
    pub log_level: String,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        DiagnosticsSettings {
            retention: 1_000,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub capture: CaptureSettings,
    pub reassembly: ReassemblySettings,
    pub framing: FramingSettings,
    pub translation: TranslationSettings,
    pub diagnostics: DiagnosticsSettings,
    /// Delay between start attempts after a fatal capture error.
    pub retry_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            capture: CaptureSettings::default(),
            reassembly: ReassemblySettings::default(),
            framing: FramingSettings::default(),
            translation: TranslationSettings::default(),
            diagnostics: DiagnosticsSettings::default(),
            retry_interval_ms: 5_000,
        }
    }
}

impl Settings {
    /// Load defaults, the optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("CHATWIRE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("capture.ports")
                    .with_list_parse_key("translation.engine_args")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.capture.ports.is_empty() && self.capture.filter.is_none() {
            return Err(invalid(
                "capture.ports",
                "at least one port is required unless a filter is given",
            ));
        }
        if self.capture.snaplen <= 0 {
            return Err(invalid("capture.snaplen", "must be greater than zero"));
        }
        if self.capture.read_timeout_ms <= 0 {
            return Err(invalid("capture.read_timeout_ms", "must be greater than zero"));
        }
        if self.framing.max_frame_len == 0 {
            return Err(invalid("framing.max_frame_len", "must be greater than zero"));
        }
        if self.reassembly.max_sessions == 0 {
            return Err(invalid("reassembly.max_sessions", "must be greater than zero"));
        }
        if self.translation.queue_capacity == 0 {
            return Err(invalid("translation.queue_capacity", "must be greater than zero"));
        }
        if self.translation.reorder_window == 0 {
            return Err(invalid("translation.reorder_window", "must be greater than zero"));
        }
        if self.translation.nickname_cache_size == 0 {
            return Err(invalid(
                "translation.nickname_cache_size",
                "must be greater than zero",
            ));
        }
        if self.translation.request_timeout_ms == Some(0) {
            return Err(invalid("translation.request_timeout_ms", "must be greater than zero"));
        }
        if self.diagnostics.retention == 0 {
            return Err(invalid("diagnostics.retention", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
