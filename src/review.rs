//! Human review of unit logs.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::StoreError;
use crate::memory::TranslationMemory;
use crate::unit::TranslationUnit;
use crate::unit_log;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("unit index {index} out of range (log has {len} units)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("file is not configured: {0}")]
    UnknownFile(String),
    #[error("file is being translated: {0}")]
    FileBusy(String),
    #[error("unit log has an unreadable line {line}; resume the file to repair it")]
    UnreadableLog { line: usize },
}

/// Edit to the unit at `index` of a log.
#[derive(Clone, Debug, Deserialize)]
pub struct ReviewUpdate {
    pub index: usize,
    pub approved: bool,
    #[serde(default)]
    pub approved_text: String,
    #[serde(default)]
    pub translation: Option<String>,
    #[serde(default)]
    pub is_translated: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub updated: usize,
    pub recorded: usize,
    pub failed: usize,
}

pub fn load_review(log: &Path) -> Result<Vec<TranslationUnit>, ReviewError> {
    Ok(unit_log::read_units(log)?)
}

/// Applies `updates`, rewrites the whole log and mirrors the edited units into
/// the exact tier. Nothing is written if any index is out of range or the
/// log has a line that does not parse.
pub fn save_review(
    log: &Path,
    updates: &[ReviewUpdate],
    memory: &TranslationMemory,
) -> Result<ReviewOutcome, ReviewError> {
    let scan = unit_log::scan(log)?;
    if let Some(line) = scan.bad_line {
        warn!(log = %log.display(), line, "refusing to rewrite unreadable unit log");
        return Err(ReviewError::UnreadableLog { line });
    }
    let mut units = scan.units;
    if let Some(bad) = updates.iter().find(|u| u.index >= units.len()) {
        return Err(ReviewError::IndexOutOfRange {
            index: bad.index,
            len: units.len(),
        });
    }

    let mut touched: Vec<usize> = Vec::with_capacity(updates.len());
    for up in updates {
        let unit = &mut units[up.index];
        unit.approved = up.approved;
        unit.approved_text = up.approved_text.clone();
        if let Some(t) = &up.translation {
            unit.translation = t.clone();
        }
        if let Some(flag) = up.is_translated {
            unit.is_translated = flag;
        }
        unit.ensure_key();
        if !touched.contains(&up.index) {
            touched.push(up.index);
        }
    }
    unit_log::rewrite(log, &units)?;

    let mut outcome = ReviewOutcome {
        updated: touched.len(),
        ..ReviewOutcome::default()
    };
    for idx in touched {
        let unit = &units[idx];
        match memory.records().upsert(unit) {
            Ok(()) => outcome.recorded += 1,
            Err(e) => {
                warn!(key = %unit.translation_key, "review write to memory failed: {e}");
                outcome.failed += 1;
            }
        }
    }
    info!(
        log = %log.display(),
        updated = outcome.updated,
        recorded = outcome.recorded,
        "review saved"
    );
    Ok(outcome)
}
