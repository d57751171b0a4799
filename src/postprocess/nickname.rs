//! Speaker nickname cache.
//!
//! Japanese nicknames are romanized once per distinct source text and kept
//! per speaker id. Entries referenced by a record still owned by the
//! dispatcher are pinned and survive eviction.

use std::collections::HashMap;

use tracing::trace;

use super::contains_japanese;

pub trait Romanizer: Send {
    fn romanize(&self, source: &str) -> String;
}

/// Romanizes with `kakasi` and capitalizes each word ("azururu" becomes
/// "Azururu").
#[derive(Debug, Default, Clone, Copy)]
pub struct KakasiRomanizer;

impl Romanizer for KakasiRomanizer {
    fn romanize(&self, source: &str) -> String {
        capitalize_words(&kakasi::convert(source).romaji)
    }
}

pub fn capitalize_words(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct NicknameEntry {
    pub source: String,
    pub display: String,
    last_used: u64,
    pins: usize,
}

impl NicknameEntry {
    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}

pub struct NicknameCache {
    entries: HashMap<u64, NicknameEntry>,
    capacity: usize,
    tick: u64,
    romanizer: Box<dyn Romanizer>,
}

fn resolve(romanizer: &dyn Romanizer, speaker_id: u64, source: &str) -> String {
    if source.trim().is_empty() {
        return format!("#{}", speaker_id);
    }
    if !contains_japanese(source) {
        return source.to_string();
    }
    let display = romanizer.romanize(source);
    if display.trim().is_empty() {
        source.to_string()
    } else {
        display
    }
}

impl NicknameCache {
    pub fn new(capacity: usize, romanizer: Box<dyn Romanizer>) -> Self {
        NicknameCache {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
            romanizer,
        }
    }

    pub fn with_kakasi(capacity: usize) -> Self {
        Self::new(capacity, Box::new(KakasiRomanizer))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, speaker_id: u64) -> Option<&NicknameEntry> {
        self.entries.get(&speaker_id)
    }

    /// Resolve and pin the display name for a speaker. Every `acquire` must
    /// be paired with a `release` once the line has been emitted.
    pub fn acquire(&mut self, speaker_id: u64, source: &str) -> String {
        self.tick += 1;
        let tick = self.tick;

        if !self.entries.contains_key(&speaker_id) {
            self.evict_to(self.capacity.saturating_sub(1));
        }

        let romanizer = self.romanizer.as_ref();
        let entry = self
            .entries
            .entry(speaker_id)
            .or_insert_with(|| NicknameEntry {
                source: source.to_string(),
                display: resolve(romanizer, speaker_id, source),
                last_used: tick,
                pins: 0,
            });

        if entry.source != source {
            trace!(speaker_id, from = %entry.source, to = %source, "nickname changed");
            entry.source = source.to_string();
            entry.display = resolve(romanizer, speaker_id, source);
        }
        entry.last_used = tick;
        entry.pins += 1;
        entry.display.clone()
    }

    pub fn release(&mut self, speaker_id: u64) {
        if let Some(entry) = self.entries.get_mut(&speaker_id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
        // Pins can push the cache past capacity; shrink back once they drop.
        self.evict_to(self.capacity);
    }

    fn evict_to(&mut self, target: usize) {
        while self.entries.len() > target {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| !e.is_pinned())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}
