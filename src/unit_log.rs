//! Per-file JSONL log: one serialized unit per line, in extraction order.
//!
//! Appended (and flushed) unit by unit during a run; rewritten whole by
//! review edits. Callers serialize append and rewrite on the same file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::unit::TranslationUnit;

pub const LOG_SUFFIX: &str = ".temp_translation.jsonl";

/// `<work_dir>/<file>.temp_translation.jsonl`
pub fn log_path(work_dir: &Path, file_path: &str) -> PathBuf {
    work_dir.join(format!("{file_path}{LOG_SUFFIX}"))
}

pub struct UnitLogWriter {
    out: BufWriter<File>,
}

impl UnitLogWriter {
    pub fn open_append(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, unit: &TranslationUnit) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, unit)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// The leading run of whole, parseable lines of a log. A logged unit is a
/// newline-terminated line that deserializes; counting stops at the first
/// line that is not.
#[derive(Debug, Default)]
pub struct LogScan {
    pub units: Vec<TranslationUnit>,
    /// Byte length of the leading run, blank lines included.
    pub valid_len: u64,
    /// 1-based line where the leading run stops, if anything follows it.
    pub bad_line: Option<usize>,
}

/// A missing log scans as empty.
pub fn scan(path: &Path) -> io::Result<LogScan> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogScan::default()),
        Err(e) => return Err(e),
    };
    let mut out = LogScan::default();
    let mut offset = 0usize;
    for (idx, chunk) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        let whole = chunk.last() == Some(&b'\n');
        if whole && chunk.iter().all(u8::is_ascii_whitespace) {
            offset += chunk.len();
            continue;
        }
        let parsed = if whole {
            serde_json::from_slice::<TranslationUnit>(chunk).ok()
        } else {
            None
        };
        match parsed {
            Some(unit) => {
                out.units.push(unit);
                offset += chunk.len();
            }
            None => {
                out.bad_line = Some(idx + 1);
                break;
            }
        }
    }
    out.valid_len = offset as u64;
    Ok(out)
}

pub fn count_units(path: &Path) -> io::Result<usize> {
    Ok(scan(path)?.units.len())
}

/// Units in log order, up to the first unreadable line.
pub fn read_units(path: &Path) -> io::Result<Vec<TranslationUnit>> {
    let scan = scan(path)?;
    if let Some(line) = scan.bad_line {
        warn!(file = %path.display(), line, "unit log unreadable from line; ignoring the rest");
    }
    Ok(scan.units)
}

/// Cuts the log back to its leading run so the next append starts on a
/// fresh line. Returns the number of units kept.
pub fn truncate_unreadable(path: &Path) -> io::Result<usize> {
    let scan = scan(path)?;
    if let Some(line) = scan.bad_line {
        warn!(
            file = %path.display(),
            line,
            kept = scan.units.len(),
            "truncating unit log at unreadable line"
        );
        OpenOptions::new().write(true).open(path)?.set_len(scan.valid_len)?;
    }
    Ok(scan.units.len())
}

/// Replaces the log with `units` via a sibling temp file and rename.
pub fn rewrite(path: &Path, units: &[TranslationUnit]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for unit in units {
            serde_json::to_writer(&mut out, unit)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    fs::rename(&tmp, path)
}

/// Returns whether a file was removed.
pub fn remove(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
