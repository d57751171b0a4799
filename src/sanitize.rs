//! Terminal-safe rendering of text that came off the wire.
//!
//! Nicknames and chat text are attacker-controlled. Before they reach a
//! terminal, control characters that could start an escape sequence are
//! replaced with U+FFFD, line breaks are flattened so one chat line stays one
//! output line, and bidi overrides are dropped so a name cannot visually
//! reorder the rest of the line.

use std::borrow::Cow;

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' | '\u{200E}' | '\u{200F}')
}

fn needs_cleaning(c: char) -> bool {
    c.is_control() || is_bidi_control(c)
}

/// Make `text` safe to print as a single terminal line.
pub fn sanitize_display(text: &str) -> Cow<'_, str> {
    if !text.chars().any(needs_cleaning) {
        return Cow::Borrowed(text);
    }
    let cleaned = text
        .chars()
        .filter(|c| !is_bidi_control(*c))
        .map(|c| match c {
            '\t' | '\n' | '\r' => ' ',
            // C0, DEL and C1 (U+009B is a one-byte CSI on some terminals)
            c if c.is_control() => '\u{FFFD}',
            c => c,
        })
        .collect();
    Cow::Owned(cleaned)
}
