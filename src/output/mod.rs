//! Terminal consumer of the diagnostics feed.
//!
//! Display lines go to stdout; pipeline events go to stderr so stdout can be
//! piped. In JSON mode every feed item is one JSON object per stdout line.

use colored::{ColoredString, Colorize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::diagnostics::{FeedItem, FeedPayload, PipelineEvent, Severity};
use crate::postprocess::{DisplayLine, TranslationStatus};
use crate::protocol::chat::Channel;
use crate::sanitize::sanitize_display;

pub struct Formatter {
    json: bool,
    quiet: bool,
}

impl Formatter {
    pub fn new(json: bool, quiet: bool) -> Self {
        Formatter { json, quiet }
    }

    pub fn print(&self, item: &FeedItem) {
        if self.json {
            match serde_json::to_string(item) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!(index = item.index, error = %e, "failed to encode feed item"),
            }
            return;
        }

        match &item.payload {
            FeedPayload::Line(line) => println!("{}", self.render_line(line)),
            FeedPayload::Event(event) => {
                if !self.quiet {
                    eprintln!("{}", render_event(event));
                }
            }
        }
    }

    /// One chat line. Quiet mode drops the channel tag and status notes.
    pub fn render_line(&self, line: &DisplayLine) -> String {
        let name = sanitize_display(&line.speaker_name);
        let text = sanitize_display(line.text());
        if self.quiet {
            return format!("{}: {}", name, text);
        }

        let tag = format!("[{}]", line.channel.as_str());
        let mut out = format!("{} {}: ", channel_color(line.channel, tag), name.yellow().bold());
        match line.status {
            TranslationStatus::Translated | TranslationStatus::Skipped => out.push_str(&text),
            TranslationStatus::Passthrough(reason) => {
                out.push_str(&format!("{} {}", text.dimmed(), format!("({})", reason.as_str()).dimmed()))
            }
        }
        if line.out_of_order {
            out.push_str(&format!(" {}", "[late]".red()));
        }
        out
    }
}

fn channel_color(channel: Channel, tag: String) -> ColoredString {
    match channel {
        Channel::World => tag.blue(),
        Channel::Local => tag.white(),
        Channel::Party => tag.green(),
        Channel::Guild => tag.magenta(),
    }
}

pub fn render_event(event: &PipelineEvent) -> String {
    let label = match event.severity() {
        Severity::Info => "INFO ".cyan(),
        Severity::Warning => "WARN ".yellow().bold(),
        Severity::Error => "ERROR".red().bold(),
    };
    format!(
        "{} {} {}",
        label,
        event.name().bold(),
        sanitize_display(&event.detail())
    )
}

/// Print feed items until the feed closes.
pub async fn follow(formatter: Formatter, mut items: broadcast::Receiver<FeedItem>) {
    loop {
        match items.recv().await {
            Ok(item) => formatter.print(&item),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind the feed"),
            Err(RecvError::Closed) => break,
        }
    }
}
