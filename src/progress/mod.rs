//! Resumable per-file progress and the run-state machine.
//!
//! `Idle -> Running -> {Idle, Interrupted}`, `Interrupted -> Running` on the
//! next start. Readers get copies; the worker mutates under one lock.

pub mod state;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::extract::{FileSpec, UnitExtractor};
use crate::unit_log;
use crate::workspace::Workspace;

pub use state::{CancellationToken, FileProgress, FileState, RunStatus, StatusSnapshot};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("a translation run is already active")]
    AlreadyRunning,
    #[error("no translation run is active")]
    NotRunning,
    #[error("translation run was interrupted")]
    Interrupted,
    #[error("file is not configured: {0}")]
    UnknownFile(String),
    #[error("unit log is in use: {0}")]
    LogBusy(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProgressResult<T> = Result<T, ProgressError>;

struct TrackerState {
    status: RunStatus,
    current_file: Option<String>,
    /// Configuration order.
    files: Vec<FileProgress>,
    token: CancellationToken,
    unsaved: usize,
    /// Files whose unit log has a live writer.
    claimed: HashSet<String>,
}

impl TrackerState {
    fn file_mut(&mut self, path: &str) -> ProgressResult<&mut FileProgress> {
        self.files
            .iter_mut()
            .find(|f| f.file_path == path)
            .ok_or_else(|| ProgressError::UnknownFile(path.to_string()))
    }

    fn clear_active(&mut self) {
        if let Some(current) = self.current_file.take() {
            if let Some(f) = self.files.iter_mut().find(|f| f.file_path == current) {
                f.translating = false;
            }
        }
    }
}

/// Exclusive right to write one file's unit log; released on drop. Outlives
/// an interrupt request, which only asks the holder to stop.
#[must_use]
pub struct LogClaim<'a> {
    tracker: &'a ProgressTracker,
    file: String,
}

impl Drop for LogClaim<'_> {
    fn drop(&mut self) {
        self.tracker.lock().claimed.remove(&self.file);
    }
}

pub struct ProgressTracker {
    workspace: Workspace,
    persist_every: usize,
    state: Mutex<TrackerState>,
}

fn read_snapshot(path: &Path) -> BTreeMap<String, FileProgress> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), "cannot read progress snapshot: {e}");
            return BTreeMap::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), "ignoring corrupt progress snapshot: {e}");
            BTreeMap::new()
        }
    }
}

impl ProgressTracker {
    /// Loads the persisted snapshot for `files` without touching sources.
    pub fn load(workspace: Workspace, files: &[FileSpec], persist_every: usize) -> Self {
        let mut persisted = read_snapshot(&workspace.progress_path());
        let files = files
            .iter()
            .map(|spec| {
                let mut p = persisted
                    .remove(&spec.path)
                    .unwrap_or_else(|| FileProgress::new(spec));
                p.file_type = spec.file_type;
                p.description = spec.description.clone();
                p.translating = false;
                p.refresh();
                p
            })
            .collect();
        Self {
            workspace,
            persist_every: persist_every.max(1),
            state: Mutex::new(TrackerState {
                status: RunStatus::Idle,
                current_file: None,
                files,
                token: CancellationToken::new(),
                unsaved: 0,
                claimed: HashSet::new(),
            }),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // State stays consistent across a panic: every mutation is a plain
        // field write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-extracts every configured file and reconciles counters with the
    /// snapshot and the unit logs. A changed total discards the file's log.
    pub fn initialize(&self, extractor: &dyn UnitExtractor) -> ProgressResult<()> {
        let specs: Vec<FileSpec> = {
            let state = self.lock();
            state
                .files
                .iter()
                .map(|f| FileSpec {
                    path: f.file_path.clone(),
                    file_type: f.file_type,
                    description: f.description.clone(),
                })
                .collect()
        };

        for spec in &specs {
            let total = match self
                .workspace
                .prepare_working_copy(&spec.path)
                .map_err(anyhow::Error::from)
                .and_then(|source| extractor.extract_units(spec, &source))
            {
                Ok(units) => units.len(),
                Err(e) => {
                    warn!(file = %spec.path, "extraction failed during initialize: {e:#}");
                    continue;
                }
            };
            self.reconcile(&spec.path, total)?;
        }
        self.persist()
    }

    /// Applies a freshly extracted total to `file`. Returns the index to
    /// resume from. A torn or unreadable tail of the unit log is cut off
    /// first, so only whole parsed units count as done.
    pub fn reconcile(&self, file: &str, total: usize) -> ProgressResult<usize> {
        let log = self.workspace.unit_log(file);
        let logged = unit_log::truncate_unreadable(&log)?;

        let mut state = self.lock();
        let progress = state.file_mut(file)?;
        let had_total = progress.total_count > 0 || progress.translated_count > 0;
        let changed = had_total && progress.total_count != total;
        if changed || logged > total {
            info!(
                file = %file,
                previous = progress.total_count,
                total,
                logged,
                "source changed; discarding partial progress"
            );
            unit_log::remove(&log)?;
            progress.set_total(total);
            progress.reset_counts();
        } else {
            progress.set_total(total);
            progress.translated_count = logged;
            progress.refresh();
        }
        let resume = progress.translated_count;
        self.save_locked(&mut state)?;
        Ok(resume)
    }

    pub fn claim_log(&self, file: &str) -> ProgressResult<LogClaim<'_>> {
        let mut state = self.lock();
        state.file_mut(file)?;
        if !state.claimed.insert(file.to_string()) {
            return Err(ProgressError::LogBusy(file.to_string()));
        }
        Ok(LogClaim {
            tracker: self,
            file: file.to_string(),
        })
    }

    pub fn is_log_claimed(&self, file: &str) -> bool {
        self.lock().claimed.contains(file)
    }

    /// Claims the single run slot and hands out a fresh token.
    pub fn try_start(&self) -> ProgressResult<CancellationToken> {
        let mut state = self.lock();
        if state.status == RunStatus::Running {
            return Err(ProgressError::AlreadyRunning);
        }
        state.status = RunStatus::Running;
        state.token = CancellationToken::new();
        state.clear_active();
        info!(workspace = %self.workspace.name(), "translation run started");
        Ok(state.token.clone())
    }

    /// `Running` switches the active file and fails once the run is
    /// interrupted. Leaving `Running` clears the active file.
    pub fn set_status(&self, status: RunStatus, file: Option<&str>) -> ProgressResult<()> {
        let mut state = self.lock();
        match status {
            RunStatus::Running => {
                if state.status == RunStatus::Interrupted || state.token.is_cancelled() {
                    return Err(ProgressError::Interrupted);
                }
                state.clear_active();
                if let Some(path) = file {
                    state.file_mut(path)?.translating = true;
                    state.current_file = Some(path.to_string());
                }
                state.status = RunStatus::Running;
                Ok(())
            }
            RunStatus::Idle | RunStatus::Interrupted => {
                if status == RunStatus::Interrupted {
                    state.token.cancel();
                }
                state.clear_active();
                state.status = status;
                debug!(status = status.as_str(), "run status changed");
                self.save_locked(&mut state)
            }
        }
    }

    pub fn request_interrupt(&self) -> ProgressResult<()> {
        {
            let state = self.lock();
            if state.status != RunStatus::Running {
                return Err(ProgressError::NotRunning);
            }
        }
        info!(workspace = %self.workspace.name(), "interrupt requested");
        self.set_status(RunStatus::Interrupted, None)
    }

    pub fn is_interrupted(&self) -> bool {
        let state = self.lock();
        state.status == RunStatus::Interrupted || state.token.is_cancelled()
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status
    }

    /// Counts `delta` more processed units. Persists when the file completes
    /// and otherwise every `persist_every` units.
    pub fn advance_progress(&self, file: &str, delta: usize) -> ProgressResult<FileProgress> {
        let mut state = self.lock();
        let progress = state.file_mut(file)?;
        let was_completed = progress.completed;
        progress.translated_count = progress.translated_count.saturating_add(delta);
        progress.refresh();
        let copy = progress.clone();

        state.unsaved += delta;
        if (copy.completed && !was_completed) || state.unsaved >= self.persist_every {
            self.save_locked(&mut state)?;
        }
        Ok(copy)
    }

    pub fn set_total(&self, file: &str, total: usize) -> ProgressResult<()> {
        let mut state = self.lock();
        state.file_mut(file)?.set_total(total);
        self.save_locked(&mut state)
    }

    /// Zeroes counters and deletes the unit log and working copy of `file`,
    /// or of every file when `None`.
    pub fn reset_progress(&self, file: Option<&str>) -> ProgressResult<()> {
        let mut state = self.lock();
        if state.status == RunStatus::Running {
            return Err(ProgressError::AlreadyRunning);
        }
        let targets: Vec<String> = match file {
            Some(path) => vec![state.file_mut(path)?.file_path.clone()],
            None => state.files.iter().map(|f| f.file_path.clone()).collect(),
        };
        if let Some(busy) = targets.iter().find(|p| state.claimed.contains(p.as_str())) {
            return Err(ProgressError::LogBusy(busy.clone()));
        }
        for path in &targets {
            unit_log::remove(&self.workspace.unit_log(path))?;
            self.workspace.remove_working_copy(path)?;
            let progress = state.file_mut(path)?;
            progress.reset_counts();
            progress.translating = false;
            info!(file = %path, "progress reset");
        }
        self.save_locked(&mut state)
    }

    pub fn persist(&self) -> ProgressResult<()> {
        let mut state = self.lock();
        self.save_locked(&mut state)
    }

    fn save_locked(&self, state: &mut TrackerState) -> ProgressResult<()> {
        let map: BTreeMap<&str, &FileProgress> = state
            .files
            .iter()
            .map(|f| (f.file_path.as_str(), f))
            .collect();
        let path = self.workspace.progress_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&map)?)?;
        fs::rename(&tmp, &path)?;
        state.unsaved = 0;
        Ok(())
    }

    pub fn file(&self, path: &str) -> Option<FileProgress> {
        self.lock().files.iter().find(|f| f.file_path == path).cloned()
    }

    pub fn files(&self) -> Vec<FileProgress> {
        self.lock().files.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        StatusSnapshot {
            status: state.status,
            current_file: state.current_file.clone(),
            files: state.files.clone(),
            total_files: state.files.len(),
            completed_files: state.files.iter().filter(|f| f.completed).count(),
        }
    }
}
