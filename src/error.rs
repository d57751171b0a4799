//! Error types for the capture and translation pipeline.
//!
//! Library code returns these typed errors; the binary wraps them in
//! `anyhow` with context. Capture-path errors are turned into diagnostic
//! events by the pipeline rather than propagated as a halt.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

/// Failure to bring up packet capture. All variants are fatal for the current
/// start attempt; the pipeline reports them and retries later.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DriverError {
    #[error("capture requires elevated privileges: {reason}")]
    AccessDenied { reason: String },

    #[error("capture driver integrity check failed: {reason}")]
    IntegrityCheckFailed { reason: String },

    #[error("capture device not found: {name}")]
    DriverNotFound { name: String },

    #[error("invalid capture filter '{filter}'")]
    InvalidFilter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("failed to open capture device")]
    Open(#[source] pcap::Error),

    #[error("failed to open capture file {path}")]
    File {
        path: PathBuf,
        #[source]
        source: pcap::Error,
    },
}

impl DriverError {
    /// Whether a later attempt can succeed without operator action on the
    /// process itself (e.g. the device appears or privileges are granted).
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::AccessDenied { .. }
            | DriverError::DriverNotFound { .. }
            | DriverError::Open(_)
            | DriverError::IntegrityCheckFailed { .. } => true,
            DriverError::InvalidFilter { .. } | DriverError::File { .. } => false,
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            DriverError::AccessDenied { .. } => vec![
                "Run as root or grant CAP_NET_RAW (setcap cap_net_raw+ep)",
                "On Windows, run the process as Administrator",
            ],
            DriverError::IntegrityCheckFailed { .. } => vec![
                "Reinstall the capture driver (libpcap / Npcap)",
                "Capture on a different interface",
            ],
            DriverError::DriverNotFound { .. } => vec![
                "List interfaces with --list-interfaces",
                "Install libpcap / Npcap",
            ],
            DriverError::InvalidFilter { .. } => vec!["Check the BPF filter syntax"],
            DriverError::Open(_) => vec!["Check the device is up"],
            DriverError::File { .. } => vec!["Check the capture file exists and is a pcap/pcapng file"],
        }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture handle closed")]
    HandleClosed,

    #[error("capture read failed")]
    Read(#[source] pcap::Error),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn translation engine '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("translation engine {0} pipe unavailable")]
    Pipe(&'static str),

    #[error("translation engine is not configured")]
    NotConfigured,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read dictionary {path}")]
    Dictionary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed dictionary {path}")]
    DictionaryFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// `err` and its sources joined with `": "`, for events that carry a
/// reason string.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Failure to bring the pipeline up at all. Capture problems after start
/// are reported on the diagnostics feed instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start capture thread")]
    Thread(#[source] std::io::Error),
}
