//! Text to wire encoding for the peripheral display.
//!
//! The display firmware renders a CP437-style font, so a handful of German
//! letters are remapped to their code page positions before the text is
//! truncated and emitted one byte per character.

/// Default truncation length, in characters.
pub const MAX_PAYLOAD_CHARS: usize = 150;

/// Byte emitted for characters outside ISO-8859-1.
const UNMAPPABLE: u8 = b'?';

/// Letters remapped to their legacy code page positions.
const SUBSTITUTIONS: [(char, u8); 7] = [
   ('Ä', 0x8E),
   ('Ö', 0x99),
   ('Ü', 0x9A),
   ('ä', 0x84),
   ('ö', 0x94),
   ('ü', 0x81),
   ('ß', 0xE1),
];

fn substitute(c: char) -> char {
   SUBSTITUTIONS
      .iter()
      .find(|(from, _)| *from == c)
      .map_or(c, |&(_, to)| char::from(to))
}

/// Encodes `text` for the peripheral, keeping at most `max_chars` characters.
///
/// Truncation counts Unicode scalar values after substitution, and every one
/// becomes exactly one byte. Characters outside the Basic Multilingual Plane,
/// such as most emoji, count once and are sent as a single `?`.
pub fn encode(text: &str, max_chars: usize) -> Vec<u8> {
   text
      .chars()
      .map(substitute)
      .take(max_chars)
      .map(|c| u8::try_from(u32::from(c)).unwrap_or(UNMAPPABLE))
      .collect()
}

/// Formats a desktop notification the way the display expects it.
pub fn format_notification(app: &str, title: &str, body: &str) -> String {
   let title = if title.is_empty() { "No Title" } else { title };
   let body = if body.is_empty() { "No Text" } else { body };
   format!("{app}||{title}||{body}")
}
