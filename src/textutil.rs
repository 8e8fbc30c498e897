use once_cell::sync::Lazy;
use regex::Regex;

static ENGLISH_PHRASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z]+(?:\s+[A-Za-z]+)*\b").expect("english phrase regex"));

pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Maps curly quotes to straight quotes and ASCII commas to full-width commas.
pub fn normalize_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{201C}' | '\u{201D}' => out.push('"'),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            ',' => out.push('\u{FF0C}'),
            _ => out.push(ch),
        }
    }
    out
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut it = text.chars();
    let head: String = it.by_ref().take(max_chars).collect();
    if it.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Maximal runs of space-separated English words.
pub fn english_phrases(text: &str) -> impl Iterator<Item = &str> {
    ENGLISH_PHRASE_RE.find_iter(text).map(|m| m.as_str())
}
