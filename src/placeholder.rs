//! Reversible tokenization of dynamic-value markers.
//!
//! Control characters, printf-style specifiers and `$variable` references are
//! replaced by `${n}` tokens before text is handed to a model, and restored
//! afterwards. Restoration requires every token to survive the round trip.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{\d+\}").expect("token regex"));
static LETTER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{L}").expect("letter regex"));

/// Conversion letters accepted after `%` (digits are accepted as well).
const PRINTF_CONVERSIONS: [char; 5] = ['s', 'd', 'x', 'f', 'v'];

pub fn placeholder_token(n: usize) -> String {
    format!("${{{n}}}")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaceholderError {
    /// The model dropped or mangled a token. Callers retry the model call.
    #[error("placeholder {token} (original {original:?}) missing from {text:?}")]
    Missing {
        token: String,
        original: String,
        text: String,
    },
}

/// Token -> original substring, in order of first appearance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderMap {
    entries: Vec<(String, String)>,
}

impl PlaceholderMap {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(t, o)| (t.as_str(), o.as_str()))
    }

    #[must_use]
    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, o)| o.as_str())
    }

    fn push(&mut self, original: &str) -> String {
        let token = placeholder_token(self.entries.len() + 1);
        self.entries.push((token.clone(), original.to_string()));
        token
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Encoded {
    pub text: String,
    pub map: PlaceholderMap,
}

impl Encoded {
    /// True when the text is nothing but placeholders and punctuation.
    #[must_use]
    pub fn is_placeholder_only(&self) -> bool {
        if self.map.is_empty() {
            return false;
        }
        let stripped = TOKEN_RE.replace_all(&self.text, " ");
        !LETTER_RE.is_match(&stripped)
    }
}

#[inline]
fn is_control(c: char) -> bool {
    (c as u32) < 32 && !matches!(c, '\n' | '\r' | '\t')
}

/// Single left-to-right pass; substituted regions are never rescanned.
pub fn encode(text: &str) -> Encoded {
    let mut out = String::with_capacity(text.len());
    let mut map = PlaceholderMap::default();
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if is_control(c) {
            let mut buf = [0u8; 4];
            out.push_str(&map.push(c.encode_utf8(&mut buf)));
            continue;
        }

        if c == '%' {
            match chars.peek().map(|&(_, next)| next) {
                // `%%` is an escaped percent sign.
                Some('%') => {
                    chars.next();
                    out.push_str("%%");
                    continue;
                }
                Some(next) if next.is_ascii_digit() || PRINTF_CONVERSIONS.contains(&next) => {
                    chars.next();
                    let end = i + 1 + next.len_utf8();
                    out.push_str(&map.push(&text[i..end]));
                    continue;
                }
                _ => {}
            }
        }

        if c == '$' {
            let mut end = i + 1;
            while let Some(&(j, next)) = chars.peek() {
                if next.is_whitespace() || is_control(next) {
                    break;
                }
                end = j + next.len_utf8();
                chars.next();
            }
            if end > i + 1 {
                out.push_str(&map.push(&text[i..end]));
                continue;
            }
        }

        out.push(c);
    }

    Encoded { text: out, map }
}

/// Restores every token of `map` in `text`. Tokens unknown to the map are left
/// untouched.
pub fn decode(text: &str, map: &PlaceholderMap) -> Result<String, PlaceholderError> {
    if map.is_empty() {
        return Ok(text.to_string());
    }
    for (token, original) in map.iter() {
        if !text.contains(token) {
            return Err(PlaceholderError::Missing {
                token: token.to_string(),
                original: original.to_string(),
                text: text.to_string(),
            });
        }
    }
    Ok(TOKEN_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let tok = &caps[0];
            map.get(tok).unwrap_or(tok).to_string()
        })
        .into_owned())
}
