//! Term shielding around a translation request.
//!
//! Names, `@` recruit tags, custom dictionary terms and counted units are
//! swapped for `[Pn]` placeholders before the text reaches the engine, then
//! restored in the output. The engine never sees (and cannot mangle) them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;

static RECRUIT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"@[A-Za-z0-9\x{3040}-\x{30ff}\x{4e00}-\x{9faf}]+(?:\s+[A-Za-z0-9\x{3040}-\x{30ff}\x{4e00}-\x{9faf}]+)*",
    )
    .expect("recruit pattern is valid")
});

/// Counter suffixes and their Korean reading.
static UNITS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [("種", "종"), ("人", "인"), ("周", "주"), ("回", "회")]
        .into_iter()
        .map(|(ja, ko)| {
            let re = Regex::new(&format!(r"(\d+){}", ja)).expect("unit pattern is valid");
            (re, ko)
        })
        .collect()
});

/// Dictionary keys that are bare brackets carry no meaning.
const IGNORED_KEYS: &str = "【】「」『』（）〈〉《》";

#[derive(Deserialize)]
struct DictionaryFile {
    #[serde(default)]
    data: HashMap<String, serde_json::Value>,
}

/// Custom source→target terms, longest first so overlapping terms resolve to
/// the most specific one.
#[derive(Debug, Clone, Default)]
pub struct Glossary {
    terms: Vec<(String, String)>,
}

impl Glossary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let mut terms: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(s, t)| (s.into(), t.into()))
            .filter(|(s, _)| !s.is_empty() && !IGNORED_KEYS.contains(s.as_str()))
            .collect();
        terms.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then(a.0.cmp(&b.0)));
        Glossary { terms }
    }

    /// Parse `{"data": {"source": "target", ...}}`. Non-string values are
    /// skipped.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        if content.trim().is_empty() {
            return Ok(Self::empty());
        }
        let file: DictionaryFile = serde_json::from_str(content)?;
        Ok(Self::from_pairs(file.data.into_iter().filter_map(|(k, v)| {
            v.as_str().map(|s| (k, s.to_string()))
        })))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Dictionary {
            path: path.to_path_buf(),
            source,
        })?;
        let glossary = Self::from_json(&content).map_err(|source| ConfigError::DictionaryFormat {
            path: path.to_path_buf(),
            source,
        })?;
        if glossary.is_empty() {
            warn!(path = %path.display(), "dictionary has no usable terms");
        } else {
            info!(path = %path.display(), terms = glossary.len(), "dictionary loaded");
        }
        Ok(glossary)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Mask `text` for translation. `nickname` is the speaker's (source,
    /// display) pair; mentions of the source name are rewritten to the
    /// display form first.
    pub fn shield(&self, text: &str, nickname: Option<(&str, &str)>) -> Shield {
        let mut shield = Shield {
            masked: text.to_string(),
            replacements: Vec::new(),
        };

        if let Some((source, display)) = nickname {
            if !source.is_empty() && source != display {
                shield.masked = shield.masked.replace(source, display);
            }
        }

        let tags: Vec<String> = RECRUIT_TAG
            .find_iter(&shield.masked)
            .map(|m| m.as_str().to_string())
            .collect();
        for tag in tags {
            shield.mask(&tag, &tag);
        }

        for (source, target) in &self.terms {
            if shield.masked.contains(source.as_str()) {
                shield.mask(source, target);
            }
        }

        for (re, reading) in UNITS.iter() {
            let mut replacements = Vec::new();
            let next = shield.replacements.len();
            let masked = re
                .replace_all(&shield.masked, |caps: &Captures| {
                    let placeholder = placeholder(next + replacements.len());
                    replacements.push((placeholder.clone(), format!("{}{}", &caps[1], reading)));
                    placeholder
                })
                .into_owned();
            shield.masked = masked;
            shield.replacements.extend(replacements);
        }

        shield
    }
}

fn placeholder(n: usize) -> String {
    format!("[P{}]", n)
}

/// Masked text plus what each placeholder stands for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shield {
    pub masked: String,
    replacements: Vec<(String, String)>,
}

impl Shield {
    /// A shield that masks nothing.
    pub fn plain(text: &str) -> Self {
        Shield {
            masked: text.to_string(),
            replacements: Vec::new(),
        }
    }

    fn mask(&mut self, term: &str, replacement: &str) {
        let placeholder = placeholder(self.replacements.len());
        self.masked = self.masked.replace(term, &placeholder);
        self.replacements.push((placeholder, replacement.to_string()));
    }

    pub fn placeholders(&self) -> usize {
        self.replacements.len()
    }

    /// Put the shielded terms back into translated text.
    pub fn restore(&self, translated: &str) -> String {
        let mut out = translated.to_string();
        for (placeholder, replacement) in &self.replacements {
            out = out.replace(placeholder.as_str(), replacement);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_recruit_tags() {
        let shield = Glossary::empty().shield("@ギルド募集！よろしく", None);
        assert_eq!(shield.masked, "[P0]！よろしく");
        assert_eq!(shield.restore("[P0]！ 잘 부탁해"), "@ギルド募集！ 잘 부탁해");
    }

    #[test]
    fn masks_dictionary_terms_longest_first() {
        let glossary = Glossary::from_pairs([("竜", "용"), ("竜騎士", "드래곤 나이트")]);
        let shield = glossary.shield("竜騎士と竜", None);
        assert_eq!(shield.masked, "[P0]と[P1]");
        assert_eq!(shield.restore("[P0]와 [P1]"), "드래곤 나이트와 용");
    }

    #[test]
    fn numeric_units() {
        let shield = Glossary::empty().shield("3人で5回", None);
        assert_eq!(shield.masked, "[P0]で[P1]");
        assert_eq!(shield.restore("[P0]이서 [P1]"), "3인이서 5회");
    }

    #[test]
    fn nickname_is_replaced_with_display_form() {
        let shield = Glossary::empty().shield("あずるるさん、こんにちは", Some(("あずるる", "Azururu")));
        assert_eq!(shield.masked, "Azururuさん、こんにちは");
        assert_eq!(shield.placeholders(), 0);
    }

    #[test]
    fn placeholders_are_numbered_across_stages() {
        let glossary = Glossary::from_pairs([("ボス", "보스")]);
        let shield = glossary.shield("@PT、ボス 2周", None);
        assert_eq!(shield.masked, "[P0]、[P1] [P2]");
        assert_eq!(shield.restore("[P0], [P1] [P2]"), "@PT, 보스 2주");
    }

    #[test]
    fn dictionary_json() {
        let glossary = Glossary::from_json(
            r#"{"data": {"竜": "용", "「": "", "数": 3, "【】": "x"}}"#,
        )
        .unwrap();
        assert_eq!(glossary.len(), 1);
        assert!(Glossary::from_json("   ").unwrap().is_empty());
        assert!(Glossary::from_json("{not json").is_err());
        assert!(Glossary::from_json(r#"{"other": 1}"#).unwrap().is_empty());
    }

    #[test]
    fn load_missing_dictionary() {
        let err = Glossary::load(Path::new("/nonexistent/dict.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Dictionary { .. }));
    }
}
