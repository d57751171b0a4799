//! Turns a chat record plus its translation outcome into a display line.

pub mod glossary;
pub mod nickname;
pub mod particle;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::protocol::chat::Channel;
use crate::protocol::SessionKey;
use crate::reassembly::SessionId;
use crate::translate::ChatRecord;

use glossary::{Glossary, Shield};

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>\s*").expect("think pattern is valid"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([.!?,~])").expect("punctuation pattern is valid"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// True if `text` has hiragana, katakana or CJK ideographs. Only such lines
/// are worth sending to the engine.
pub fn contains_japanese(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c as u32,
            0x3040..=0x309F   // hiragana
            | 0x30A0..=0x30FF // katakana
            | 0x4E00..=0x9FAF // CJK unified ideographs
        )
    })
}

/// Why a line went out untranslated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassthroughReason {
    EngineUnavailable,
    EngineCrashed,
    EngineError,
    Timeout,
    QueueOverflow,
    EmptyResult,
}

impl PassthroughReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PassthroughReason::EngineUnavailable => "engine unavailable",
            PassthroughReason::EngineCrashed => "engine crashed",
            PassthroughReason::EngineError => "engine error",
            PassthroughReason::Timeout => "timeout",
            PassthroughReason::QueueOverflow => "queue overflow",
            PassthroughReason::EmptyResult => "empty result",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TranslationStatus {
    Translated,
    /// Not sent to the engine: nothing to translate or translation is off.
    Skipped,
    Passthrough(PassthroughReason),
}

/// What happened to a record on its way through the dispatcher.
#[derive(Debug, Clone)]
pub enum Outcome {
    Translated { raw: String, shield: Shield },
    Skipped,
    Passthrough(PassthroughReason),
}

/// One line ready for presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayLine {
    pub session: SessionId,
    pub key: SessionKey,
    pub sequence: u64,
    pub channel: Channel,
    pub speaker_id: u64,
    pub speaker_name: String,
    pub original: String,
    pub translated: Option<String>,
    #[serde(flatten)]
    pub status: TranslationStatus,
    /// Released ahead of a stalled predecessor.
    pub out_of_order: bool,
    pub captured_at: DateTime<Utc>,
}

impl DisplayLine {
    /// Text to show: the translation if there is one, else the original.
    pub fn text(&self) -> &str {
        self.translated.as_deref().unwrap_or(&self.original)
    }
}

/// Cleanup applied to every engine result, in order: drop reasoning
/// blocks, restore shielded terms, tighten punctuation, fix particles,
/// collapse whitespace.
pub fn clean_translation(raw: &str, shield: &Shield) -> String {
    let text = THINK_BLOCK.replace_all(raw, "");
    let text = shield.restore(&text);
    let text = SPACE_BEFORE_PUNCT.replace_all(&text, "$1");
    let text = particle::fix_particles(&text);
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

pub struct PostProcessor {
    glossary: Glossary,
}

impl PostProcessor {
    pub fn new(glossary: Glossary) -> Self {
        PostProcessor { glossary }
    }

    /// Mask a record's text before it is sent to the engine.
    pub fn shield(&self, record: &ChatRecord, speaker_name: &str) -> Shield {
        self.glossary
            .shield(&record.message.text, Some((record.message.nickname.as_str(), speaker_name)))
    }

    pub fn process(&self, record: &ChatRecord, speaker_name: String, outcome: Outcome) -> DisplayLine {
        let (translated, status) = match outcome {
            Outcome::Translated { raw, shield } => {
                let cleaned = clean_translation(&raw, &shield);
                if cleaned.is_empty() {
                    (None, TranslationStatus::Passthrough(PassthroughReason::EmptyResult))
                } else {
                    (Some(cleaned), TranslationStatus::Translated)
                }
            }
            Outcome::Skipped => (None, TranslationStatus::Skipped),
            Outcome::Passthrough(reason) => (None, TranslationStatus::Passthrough(reason)),
        };
        build_line(record, speaker_name, translated, status)
    }
}

fn build_line(
    record: &ChatRecord,
    speaker_name: String,
    translated: Option<String>,
    status: TranslationStatus,
) -> DisplayLine {
    DisplayLine {
        session: record.session,
        key: record.key,
        sequence: record.sequence,
        channel: record.message.channel,
        speaker_id: record.message.speaker_id,
        speaker_name,
        original: record.message.text.clone(),
        translated,
        status,
        out_of_order: false,
        captured_at: record.captured_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::chat::ChatMessage;
    use std::net::{IpAddr, Ipv4Addr};

    fn record(text: &str) -> ChatRecord {
        ChatRecord {
            session: SessionId(1),
            key: SessionKey::new(
                IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                5000,
                IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
                80,
            ),
            sequence: 7,
            message: ChatMessage {
                channel: Channel::World,
                speaker_id: 42,
                nickname: "あずるる".into(),
                text: text.into(),
                class_id: 0,
                level: 0,
                sent_at: 0,
            },
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn japanese_detection() {
        assert!(contains_japanese("こんにちは"));
        assert!(contains_japanese("NM出ました"));
        assert!(contains_japanese("カタカナ"));
        assert!(!contains_japanese("hello 안녕"));
        assert!(!contains_japanese(""));
    }

    #[test]
    fn cleanup_strips_think_blocks() {
        let out = clean_translation("<think>\nreasoning\n</think>\n안녕하세요", &Shield::plain(""));
        assert_eq!(out, "안녕하세요");
    }

    #[test]
    fn cleanup_tightens_punctuation_and_spaces() {
        let out = clean_translation("  좋아요  !  가자 ~ ", &Shield::plain(""));
        assert_eq!(out, "좋아요! 가자~");
    }

    #[test]
    fn cleanup_restores_then_fixes_particles() {
        let glossary = Glossary::from_pairs([("竜", "Ryu")]);
        let shield = glossary.shield("竜が来た", None);
        assert_eq!(shield.masked, "[P0]が来た");
        let out = clean_translation("[P0]이 왔다", &shield);
        assert_eq!(out, "Ryu가 왔다");
    }

    #[test]
    fn process_translated() {
        let pp = PostProcessor::new(Glossary::empty());
        let rec = record("こんにちは");
        let shield = pp.shield(&rec, "Azururu");
        let line = pp.process(
            &rec,
            "Azururu".into(),
            Outcome::Translated {
                raw: "안녕하세요".into(),
                shield,
            },
        );
        assert_eq!(line.status, TranslationStatus::Translated);
        assert_eq!(line.text(), "안녕하세요");
        assert_eq!(line.speaker_name, "Azururu");
        assert_eq!(line.sequence, 7);
        assert!(!line.out_of_order);
    }

    #[test]
    fn process_passthrough_keeps_original() {
        let pp = PostProcessor::new(Glossary::empty());
        let line = pp.process(
            &record("こんにちは"),
            "Azururu".into(),
            Outcome::Passthrough(PassthroughReason::Timeout),
        );
        assert_eq!(line.translated, None);
        assert_eq!(line.text(), "こんにちは");
        assert_eq!(line.status, TranslationStatus::Passthrough(PassthroughReason::Timeout));
    }

    #[test]
    fn empty_result_is_passthrough() {
        let pp = PostProcessor::new(Glossary::empty());
        let line = pp.process(
            &record("こんにちは"),
            "Azururu".into(),
            Outcome::Translated {
                raw: "<think>x</think>".into(),
                shield: Shield::plain("こんにちは"),
            },
        );
        assert_eq!(
            line.status,
            TranslationStatus::Passthrough(PassthroughReason::EmptyResult)
        );
    }

    #[test]
    fn shield_uses_speaker_name() {
        let pp = PostProcessor::new(Glossary::empty());
        let shield = pp.shield(&record("あずるるです"), "Azururu");
        assert_eq!(shield.masked, "Azururuです");
    }

    #[test]
    fn display_line_json_shape() {
        let pp = PostProcessor::new(Glossary::empty());
        let line = pp.process(
            &record("こんにちは"),
            "Azururu".into(),
            Outcome::Passthrough(PassthroughReason::QueueOverflow),
        );
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["status"], "passthrough");
        assert_eq!(json["reason"], "queue_overflow");
        assert_eq!(json["channel"], "WORLD");
        assert_eq!(json["session"], 1);
    }
}
