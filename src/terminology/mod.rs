//! Terminology dictionary with prompt-hint lookup.

pub mod matcher;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::info;

use crate::db::StoreResult;
use crate::textutil::english_phrases;

pub use matcher::{MatchKind, TermMatch, TermMatcher};
pub use store::{TermEntry, TermStore, DEFAULT_DOMAIN};

const SUGGESTION_LIMIT: usize = 20;
const MAX_PHRASE_WORDS: usize = 3;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
        "one", "our", "out", "has", "have", "him", "his", "how", "its", "may", "new", "now", "old",
        "see", "two", "who", "did", "yes", "get", "got", "let", "put", "say", "she", "too", "use",
        "with", "this", "that", "from", "they", "will", "would", "there", "their", "what", "about",
        "which", "when", "make", "like", "into", "them", "than", "then", "some", "could", "other",
        "been", "were", "also", "more", "your", "only", "just", "over", "such", "very", "each",
        "much", "here", "well", "does", "should", "these", "those", "being", "after", "before",
    ]
    .into_iter()
    .collect()
});

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TermSuggestion {
    pub text: String,
    pub frequency: usize,
}

/// Term store plus the automaton built from it.
pub struct Terminology {
    store: TermStore,
    matcher: TermMatcher,
}

impl Terminology {
    pub fn new(store: TermStore, word_boundary: bool) -> StoreResult<Self> {
        let terminology = Self {
            store,
            matcher: TermMatcher::new(word_boundary),
        };
        terminology.rebuild()?;
        Ok(terminology)
    }

    pub fn open(path: &Path, word_boundary: bool) -> StoreResult<Self> {
        Self::new(TermStore::open(path)?, word_boundary)
    }

    pub fn store(&self) -> &TermStore {
        &self.store
    }

    pub fn rebuild(&self) -> StoreResult<()> {
        self.matcher.rebuild(self.store.all()?)?;
        Ok(())
    }

    pub fn add(&self, entry: &TermEntry) -> StoreResult<()> {
        self.store.add(entry)?;
        self.rebuild()
    }

    pub fn add_batch(&self, entries: &[TermEntry]) -> StoreResult<(usize, usize)> {
        let counts = self.store.add_batch(entries)?;
        self.rebuild()?;
        Ok(counts)
    }

    pub fn delete(&self, term: &str) -> StoreResult<bool> {
        let removed = self.store.delete(term)?;
        if removed {
            self.rebuild()?;
        }
        Ok(removed)
    }

    pub fn find_matches(&self, text: &str) -> Vec<TermMatch> {
        self.matcher.find_matches(text)
    }

    /// Writes every entry as a pretty JSON array.
    pub fn export_json(&self, path: &Path) -> StoreResult<usize> {
        let entries = self.store.all()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        info!(path = %path.display(), terms = entries.len(), "terminology exported");
        Ok(entries.len())
    }

    /// Reads a JSON array of entries. Returns `(success, failed)`.
    pub fn import_json(&self, path: &Path) -> StoreResult<(usize, usize)> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<TermEntry> = serde_json::from_str(&raw)?;
        let counts = self.add_batch(&entries)?;
        info!(path = %path.display(), ok = counts.0, failed = counts.1, "terminology imported");
        Ok(counts)
    }

    /// Frequent English words and short phrases from `texts` that are not yet
    /// in the dictionary.
    pub fn suggest_terms<'a>(
        &self,
        texts: impl IntoIterator<Item = &'a str>,
        min_frequency: usize,
    ) -> StoreResult<Vec<TermSuggestion>> {
        let known: HashSet<String> = self
            .store
            .all()?
            .into_iter()
            .map(|e| e.term.to_lowercase())
            .collect();
        Ok(suggest_terms(texts, min_frequency, &known))
    }
}

fn eligible(word: &str) -> bool {
    word.chars().count() > 2 && !STOP_WORDS.contains(word.to_lowercase().as_str())
}

fn suggest_terms<'a>(
    texts: impl IntoIterator<Item = &'a str>,
    min_frequency: usize,
    known: &HashSet<String>,
) -> Vec<TermSuggestion> {
    // Keyed by lowercase form; the first spelling seen is reported.
    let mut counts: HashMap<String, (String, usize)> = HashMap::new();
    let mut bump = |candidate: String| {
        let key = candidate.to_lowercase();
        if known.contains(&key) {
            return;
        }
        counts.entry(key).or_insert_with(|| (candidate, 0)).1 += 1;
    };

    for text in texts {
        for phrase in english_phrases(text) {
            let words: Vec<&str> = phrase.split_whitespace().collect();
            for (i, word) in words.iter().enumerate() {
                if eligible(word) {
                    bump((*word).to_string());
                }
                for n in 2..=MAX_PHRASE_WORDS {
                    let Some(window) = words.get(i..i + n) else {
                        break;
                    };
                    let (first, last) = (window[0], window[n - 1]);
                    if eligible(first) && eligible(last) {
                        bump(window.join(" "));
                    }
                }
            }
        }
    }

    let mut out: Vec<TermSuggestion> = counts
        .into_values()
        .filter(|(_, n)| *n >= min_frequency.max(1))
        .map(|(text, frequency)| TermSuggestion { text, frequency })
        .collect();
    out.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.text.cmp(&b.text)));
    out.truncate(SUGGESTION_LIMIT);
    out
}

/// Glossary block for the user prompt; empty when there are no matches.
pub fn render_for_prompt(matches: &[TermMatch]) -> String {
    if matches.is_empty() {
        return String::new();
    }
    let mut out = String::from("Terminology (use these translations consistently):\n");
    for m in matches {
        out.push_str("- ");
        out.push_str(&m.term);
        out.push_str(" => ");
        out.push_str(&m.translation);
        if !m.domain.is_empty() && m.domain != DEFAULT_DOMAIN {
            out.push_str(" [");
            out.push_str(&m.domain);
            out.push(']');
        }
        let notes = m.notes.trim();
        if !notes.is_empty() {
            out.push_str(" (");
            out.push_str(notes);
            out.push(')');
        }
        out.push('\n');
    }
    out
}
