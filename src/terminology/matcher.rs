//! Multi-pattern term matching over a rebuildable Aho-Corasick automaton.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aho_corasick::{AhoCorasick, MatchKind as AcMatchKind};

use super::store::TermEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    ExactCase,
    CaseInsensitive,
}

impl MatchKind {
    pub fn confidence(self) -> f32 {
        match self {
            MatchKind::ExactCase => 1.0,
            MatchKind::CaseInsensitive => 0.95,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TermMatch {
    pub term: String,
    pub translation: String,
    pub domain: String,
    pub notes: String,
    pub kind: MatchKind,
    pub similarity: f32,
}

struct Automata {
    exact: AhoCorasick,
    folded: AhoCorasick,
    entries: Vec<TermEntry>,
}

/// Rebuilt as a whole after every dictionary change; lookups see either the
/// previous or the new automaton, never a partial one.
pub struct TermMatcher {
    word_boundary: bool,
    current: RwLock<Option<Arc<Automata>>>,
}

fn ascii_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `[start, end)` is not glued to surrounding ASCII word characters. Edges of
/// non-ASCII-word terms (CJK, punctuation) are always accepted.
fn on_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let matched = &text[start..end];
    let left_ok = match (matched.chars().next(), text[..start].chars().next_back()) {
        (Some(first), Some(prev)) if ascii_word(first) => !ascii_word(prev),
        _ => true,
    };
    let right_ok = match (matched.chars().next_back(), text[end..].chars().next()) {
        (Some(last), Some(next)) if ascii_word(last) => !ascii_word(next),
        _ => true,
    };
    left_ok && right_ok
}

impl TermMatcher {
    pub fn new(word_boundary: bool) -> Self {
        Self {
            word_boundary,
            current: RwLock::new(None),
        }
    }

    pub fn rebuild(&self, entries: Vec<TermEntry>) -> Result<(), aho_corasick::BuildError> {
        let entries: Vec<TermEntry> = entries
            .into_iter()
            .filter(|e| !e.term.is_empty())
            .collect();
        let next = if entries.is_empty() {
            None
        } else {
            let exact = AhoCorasick::builder()
                .match_kind(AcMatchKind::Standard)
                .build(entries.iter().map(|e| e.term.as_str()))?;
            let folded = AhoCorasick::builder()
                .match_kind(AcMatchKind::Standard)
                .build(entries.iter().map(|e| e.term.to_lowercase()))?;
            Some(Arc::new(Automata {
                exact,
                folded,
                entries,
            }))
        };
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        *slot = next;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot().map_or(0, |a| a.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Option<Arc<Automata>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::clone)
    }

    /// Every dictionary term found in `text`, one match per term, exact-case
    /// matches first, then longer terms.
    pub fn find_matches(&self, text: &str) -> Vec<TermMatch> {
        let Some(automata) = self.snapshot() else {
            return Vec::new();
        };
        if text.is_empty() {
            return Vec::new();
        }

        let mut best: HashMap<usize, MatchKind> = HashMap::new();
        let mut consider = |idx: usize, kind: MatchKind| {
            best.entry(idx)
                .and_modify(|k| *k = (*k).min(kind))
                .or_insert(kind);
        };

        for m in automata.exact.find_overlapping_iter(text) {
            if !self.word_boundary || on_word_boundary(text, m.start(), m.end()) {
                consider(m.pattern().as_usize(), MatchKind::ExactCase);
            }
        }
        let lowered = text.to_lowercase();
        for m in automata.folded.find_overlapping_iter(&lowered) {
            if !self.word_boundary || on_word_boundary(&lowered, m.start(), m.end()) {
                consider(m.pattern().as_usize(), MatchKind::CaseInsensitive);
            }
        }

        let mut out: Vec<TermMatch> = best
            .into_iter()
            .filter_map(|(idx, kind)| {
                automata.entries.get(idx).map(|e| TermMatch {
                    term: e.term.clone(),
                    translation: e.translation.clone(),
                    domain: e.domain.clone(),
                    notes: e.notes.clone(),
                    kind,
                    similarity: kind.confidence(),
                })
            })
            .collect();
        out.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| b.term.chars().count().cmp(&a.term.chars().count()))
                .then_with(|| a.term.cmp(&b.term))
        });
        out
    }
}
