use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use chatwire::capture;
use chatwire::config::{Settings, Tier};
use chatwire::diagnostics::DiagnosticsFeed;
use chatwire::output::{self, Formatter};
use chatwire::pipeline::{Pipeline, PipelineOptions};

#[derive(Parser)]
#[command(
    name = "chatwire",
    version,
    about = "Live translation of in-game chat captured off the wire"
)]
struct Cli {
    /// Settings file (TOML, JSON or YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network interface to capture on
    #[arg(short = 'd', long)]
    interface: Option<String>,

    /// Read from pcap/pcapng file instead of live capture
    #[arg(short = 'I', long)]
    input: Option<PathBuf>,

    /// Game server port (repeatable)
    #[arg(short = 'p', long = "port")]
    ports: Vec<u16>,

    /// BPF filter expression, replacing the port filter
    #[arg(short = 'F', long)]
    bpf: Option<String>,

    /// Performance tier
    #[arg(long, value_enum)]
    tier: Option<Tier>,

    /// Translation engine executable
    #[arg(long)]
    engine: Option<String>,

    /// Extra argument passed to the engine (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Model directory passed to the engine
    #[arg(long)]
    model: Option<PathBuf>,

    /// Custom dictionary (JSON)
    #[arg(long)]
    dict: Option<PathBuf>,

    /// Inference device passed to the engine (cpu, cuda)
    #[arg(long)]
    device: Option<String>,

    /// Show chat untranslated
    #[arg(long)]
    no_translate: bool,

    /// Output feed items as JSON lines
    #[arg(long)]
    json: bool,

    /// Quiet mode (chat lines only, no events)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Write captured packets to pcap file
    #[arg(short = 'O', long)]
    output_file: Option<PathBuf>,

    /// List available interfaces and exit
    #[arg(short = 'L', long)]
    list_interfaces: bool,

    /// Log filter when RUST_LOG is unset (e.g. debug, chatwire=trace)
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(interface) = &self.interface {
            settings.capture.interface = Some(interface.clone());
        }
        if !self.ports.is_empty() {
            settings.capture.ports = self.ports.clone();
        }
        if let Some(bpf) = &self.bpf {
            settings.capture.filter = Some(bpf.clone());
        }

        let t = &mut settings.translation;
        if let Some(tier) = self.tier {
            t.tier = tier;
        }
        if let Some(engine) = &self.engine {
            t.engine_command = Some(engine.clone());
        }
        t.engine_args.extend(self.engine_args.iter().cloned());
        if let Some(model) = &self.model {
            t.model_path = Some(model.clone());
        }
        if let Some(dict) = &self.dict {
            t.dictionary_path = Some(dict.clone());
        }
        if let Some(device) = &self.device {
            t.device = device.clone();
        }
        if self.no_translate {
            t.enabled = false;
        }

        if let Some(level) = &self.log_level {
            settings.diagnostics.log_level = level.clone();
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_interfaces {
        for line in capture::list_interfaces().context("Failed to list interfaces")? {
            println!("{}", line);
        }
        return Ok(());
    }

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_tracing(&settings.diagnostics.log_level);
    debug!(?settings, "effective settings");

    let feed = DiagnosticsFeed::new(settings.diagnostics.retention);
    let printer = tokio::spawn(output::follow(
        Formatter::new(cli.json, cli.quiet),
        feed.subscribe(),
    ));

    let options = PipelineOptions {
        input: cli.input.clone(),
        record_to: cli.output_file.clone(),
    };
    let mut pipeline =
        Pipeline::start(settings, options, feed.clone()).context("Failed to start pipeline")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("interrupted, shutting down");
        }
        _ = pipeline.wait() => debug!("capture finished"),
    }
    pipeline.shutdown().await;

    // The printer exits once every feed handle is gone and it has drained.
    drop(feed);
    printer.await.context("Output task failed")?;
    Ok(())
}
