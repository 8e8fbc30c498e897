use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// External language-model client. Returns the raw reply text.
pub trait ModelInvoker: Send + Sync {
    fn invoke(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("no json object in model reply")]
    NoJson,
    #[error("model reply is not valid json: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

/// `{"translation": ..., "should_translate": ..., "reason": ...}`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModelReply {
    #[serde(default)]
    pub translation: String,
    #[serde(default = "default_true")]
    pub should_translate: bool,
    #[serde(default)]
    pub reason: String,
}

static VALUE_BEFORE_FLAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)"translation"\s*:\s*"(.*?)"\s*,\s*"should_translate""#)
        .expect("translation value regex")
});
static VALUE_BEFORE_REASON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)"translation"\s*:\s*"(.*?)"\s*,\s*"reason""#)
        .expect("translation value regex")
});
static VALUE_LAST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)"translation"\s*:\s*"(.*)"\s*\}"#).expect("translation value regex")
});

impl ModelReply {
    /// Parses the first JSON object in `text`. Replies whose `translation`
    /// value carries unescaped quotes or raw newlines are repaired once.
    pub fn parse(text: &str) -> Result<Self, ReplyError> {
        let start = text.find('{').ok_or(ReplyError::NoJson)?;
        let slice = &text[start..];
        let first_err = match first_object(slice) {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };
        match repair(slice) {
            Some(fixed) => first_object(&fixed).map_err(|_| ReplyError::Invalid(first_err)),
            None => Err(ReplyError::Invalid(first_err)),
        }
    }
}

fn first_object(slice: &str) -> Result<ModelReply, String> {
    let mut de = serde_json::Deserializer::from_str(slice);
    ModelReply::deserialize(&mut de).map_err(|e| e.to_string())
}

fn escape_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut escaped = false;
    for ch in raw.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                out.push(ch);
                escaped = true;
            }
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

fn repair(slice: &str) -> Option<String> {
    let caps = VALUE_BEFORE_FLAG_RE
        .captures(slice)
        .or_else(|| VALUE_BEFORE_REASON_RE.captures(slice))
        .or_else(|| VALUE_LAST_RE.captures(slice))?;
    let value = caps.get(1)?;
    let mut fixed = String::with_capacity(slice.len() + 8);
    fixed.push_str(&slice[..value.start()]);
    fixed.push_str(&escape_value(value.as_str()));
    fixed.push_str(&slice[value.end()..]);
    Some(fixed)
}
