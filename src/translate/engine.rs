//! Translation engine process and its JSON-lines protocol.
//!
//! The engine is an external program. Requests go to its stdin and messages
//! come back on stdout, one JSON object per line. Its stderr is logged. The
//! dispatcher sees the engine only as a pair of channels, so a crash shows
//! up as the message channel closing.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{Tier, TranslationSettings};
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum EngineRequest {
    Translate {
        id: u64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    /// Model loaded; requests may be sent.
    Ready {
        #[serde(default)]
        model: Option<String>,
    },
    Result {
        #[serde(alias = "pid")]
        id: u64,
        translated: String,
    },
    Error {
        #[serde(default, alias = "pid")]
        id: Option<u64>,
        message: String,
    },
    Info {
        #[serde(default)]
        message: String,
    },
    Status {
        #[serde(default)]
        message: String,
    },
    Debug {
        #[serde(default)]
        message: String,
    },
}

/// Parse one stdout line. Blank or malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<EngineMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(error = %e, line = %line, "unrecognized engine output");
            None
        }
    }
}

pub fn encode_request(request: &EngineRequest) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

/// Live channels to a running engine. Dropping `requests` closes the
/// engine's stdin; `messages` yielding `None` means the engine is gone.
pub struct EngineConnection {
    pub requests: mpsc::Sender<EngineRequest>,
    pub messages: mpsc::Receiver<EngineMessage>,
}

#[async_trait]
pub trait EngineSpawner: Send + Sync {
    async fn spawn(&self) -> Result<EngineConnection, EngineError>;
}

/// Spawns the engine as a child process.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    command: String,
    extra_args: Vec<String>,
    tier: Tier,
    device: String,
    model: Option<PathBuf>,
    dictionary: Option<PathBuf>,
    exit_grace: Duration,
}

impl ProcessSpawner {
    pub fn from_settings(settings: &TranslationSettings) -> Result<Self, EngineError> {
        let command = settings
            .engine_command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or(EngineError::NotConfigured)?;
        Ok(ProcessSpawner {
            command,
            extra_args: settings.engine_args.clone(),
            tier: settings.tier,
            device: settings.device.clone(),
            model: settings.model_path.clone(),
            dictionary: settings.dictionary_path.clone(),
            exit_grace: Duration::from_secs(2),
        })
    }

    pub fn launch_args(&self) -> Vec<String> {
        let profile = self.tier.profile();
        let mut args = vec![
            "--tier".to_string(),
            self.tier.as_str().to_string(),
            "--beam-size".to_string(),
            profile.beam_size.to_string(),
            "--compute-type".to_string(),
            profile.compute_type.to_string(),
            "--device".to_string(),
            self.device.clone(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.display().to_string());
        }
        if let Some(dict) = &self.dictionary {
            args.push("--dict".to_string());
            args.push(dict.display().to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl EngineSpawner for ProcessSpawner {
    async fn spawn(&self) -> Result<EngineConnection, EngineError> {
        let args = self.launch_args();
        info!(command = %self.command, args = ?args, "starting translation engine");

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(EngineError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(EngineError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(EngineError::Pipe("stderr"))?;

        let (request_tx, request_rx) = mpsc::channel(64);
        let (message_tx, message_rx) = mpsc::channel(256);

        tokio::spawn(write_requests(stdin, request_rx));
        tokio::spawn(read_messages(stdout, child, message_tx, self.exit_grace));
        tokio::spawn(log_stderr(stderr, self.tier));

        Ok(EngineConnection {
            requests: request_tx,
            messages: message_rx,
        })
    }
}

async fn write_requests(mut stdin: ChildStdin, mut requests: mpsc::Receiver<EngineRequest>) {
    while let Some(request) = requests.recv().await {
        let line = match encode_request(&request) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to encode engine request");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(error = %e, "engine stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "engine stdin flush failed");
            break;
        }
    }
    debug!("engine request writer finished");
}

async fn read_messages(
    stdout: ChildStdout,
    mut child: Child,
    messages: mpsc::Sender<EngineMessage>,
    exit_grace: Duration,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            next = lines.next_line() => next,
            // Dispatcher dropped the connection.
            _ = messages.closed() => break,
        };
        match next {
            Ok(Some(line)) => {
                let Some(msg) = parse_line(&line) else {
                    continue;
                };
                if messages.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "engine stdout read failed");
                break;
            }
        }
    }

    match tokio::time::timeout(exit_grace, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "translation engine exited"),
        Ok(Err(e)) => warn!(error = %e, "failed to reap translation engine"),
        Err(_) => {
            warn!("translation engine did not exit, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill translation engine");
            }
        }
    }
    // `messages` drops here, which the dispatcher reads as the engine going away.
}

/// Operator hint for well-known engine failures on stderr.
pub fn stderr_hint(line: &str, tier: Tier) -> Option<String> {
    if line.contains("CUDA error: out of memory") {
        return Some(match tier.lower() {
            Some(lower) => format!("GPU out of memory; try --tier {}", lower),
            None => "GPU out of memory; try --device cpu".to_string(),
        });
    }
    if line.contains("ImportError: DLL load failed") {
        return Some("engine dependencies missing (Visual C++ Redistributable?)".to_string());
    }
    None
}

async fn log_stderr(stderr: ChildStderr, tier: Tier) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match stderr_hint(&line, tier) {
            Some(hint) => error!(target: "chatwire::engine", "{}: {}", hint, line),
            None => warn!(target: "chatwire::engine", "{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let line = encode_request(&EngineRequest::Translate {
            id: 7,
            text: "こんにちは".into(),
            nickname: Some("Azururu".into()),
        })
        .unwrap();
        assert_eq!(
            line,
            "{\"cmd\":\"translate\",\"id\":7,\"text\":\"こんにちは\",\"nickname\":\"Azururu\"}\n"
        );
    }

    #[test]
    fn nickname_omitted_when_absent() {
        let line = encode_request(&EngineRequest::Translate {
            id: 1,
            text: "x".into(),
            nickname: None,
        })
        .unwrap();
        assert!(!line.contains("nickname"));
    }

    #[test]
    fn parses_engine_messages() {
        assert_eq!(
            parse_line(r#"{"type":"result","id":3,"translated":"안녕"}"#),
            Some(EngineMessage::Result {
                id: 3,
                translated: "안녕".into()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"ready"}"#),
            Some(EngineMessage::Ready { model: None })
        );
        assert_eq!(
            parse_line(r#"{"type":"error","message":"boom"}"#),
            Some(EngineMessage::Error {
                id: None,
                message: "boom".into()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"info","message":"loading"}"#),
            Some(EngineMessage::Info {
                message: "loading".into()
            })
        );
    }

    #[test]
    fn accepts_legacy_pid_field() {
        assert_eq!(
            parse_line(r#"{"type":"result","pid":9,"translated":"네"}"#),
            Some(EngineMessage::Result {
                id: 9,
                translated: "네".into()
            })
        );
    }

    #[test]
    fn junk_lines_are_ignored() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("Loading weights..."), None);
        assert_eq!(parse_line(r#"{"type":"mystery"}"#), None);
    }

    #[test]
    fn launch_args_follow_tier() {
        let settings = TranslationSettings {
            engine_command: Some("engine".into()),
            tier: Tier::Extreme,
            device: "cuda".into(),
            model_path: Some(PathBuf::from("/models/ja-ko")),
            engine_args: vec!["--debug".into()],
            ..TranslationSettings::default()
        };
        let args = ProcessSpawner::from_settings(&settings).unwrap().launch_args();
        assert_eq!(
            args,
            vec![
                "--tier",
                "extreme",
                "--beam-size",
                "10",
                "--compute-type",
                "float16",
                "--device",
                "cuda",
                "--model",
                "/models/ja-ko",
                "--debug"
            ]
        );
    }

    #[test]
    fn missing_command_is_not_configured() {
        let err = ProcessSpawner::from_settings(&TranslationSettings::default()).unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured));
    }

    #[test]
    fn stderr_hints() {
        assert_eq!(
            stderr_hint("RuntimeError: CUDA error: out of memory", Tier::High).as_deref(),
            Some("GPU out of memory; try --tier middle")
        );
        assert!(stderr_hint("ImportError: DLL load failed while importing", Tier::Low).is_some());
        assert_eq!(stderr_hint("warning: slow tokenizer", Tier::Low), None);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let settings = TranslationSettings {
            engine_command: Some("/nonexistent/chatwire-engine".into()),
            ..TranslationSettings::default()
        };
        let spawner = ProcessSpawner::from_settings(&settings).unwrap();
        let err = spawner.spawn().await.err().unwrap();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
