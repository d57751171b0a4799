//! Korean particle correction.
//!
//! Particles come in pairs whose form depends on whether the preceding
//! syllable ends in a consonant (받침). Names and glossary terms are spliced
//! in after translation, so the engine cannot pick the right form for them.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static PARTICLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([가-힣a-zA-Z0-9\)])(을|를|이|가|은|는|와|과)([^가-힣]|$)")
        .expect("particle pattern is valid")
});

/// (after a final consonant, after a vowel)
const PAIRS: [(&str, &str); 4] = [("을", "를"), ("이", "가"), ("은", "는"), ("과", "와")];

const HANGUL_FIRST: u32 = 0xAC00;
const HANGUL_LAST: u32 = 0xD7A3;
const FINALS_PER_MEDIAL: u32 = 28;

/// Digits and letters read with a final consonant when spoken in Korean
/// (영, 일, 삼, 육, 칠, 팔, 엘, 엠, 엔).
const CONSONANT_FINAL_LATIN: &str = "013678lmnLMN";

/// Whether `c` ends in a consonant for particle selection.
pub fn has_final_consonant(c: char) -> bool {
    let code = c as u32;
    if (HANGUL_FIRST..=HANGUL_LAST).contains(&code) {
        return (code - HANGUL_FIRST) % FINALS_PER_MEDIAL != 0;
    }
    CONSONANT_FINAL_LATIN.contains(c)
}

/// Pick the particle form matching the preceding character.
pub fn select(particle: &str, preceding: char) -> &str {
    let final_consonant = has_final_consonant(preceding);
    for (with_final, without_final) in PAIRS {
        if particle == with_final || particle == without_final {
            return if final_consonant { with_final } else { without_final };
        }
    }
    particle
}

pub fn fix_particles(text: &str) -> String {
    PARTICLE
        .replace_all(text, |caps: &Captures| {
            let word = &caps[1];
            let preceding = word.chars().last().unwrap_or(' ');
            format!("{}{}{}", word, select(&caps[2], preceding), &caps[3])
        })
        .into_owned()
}
