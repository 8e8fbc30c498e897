use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pipeline::extract::{FileSpec, FileType};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

/// Shared stop flag handed to one run. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Completed,
    NoContents,
    Translating,
    Pending,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Completed => "completed",
            FileState::NoContents => "no contents",
            FileState::Translating => "translating",
            FileState::Pending => "pending",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub file_path: String,
    pub file_type: FileType,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub translated_count: usize,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub description: String,
    /// Only meaningful while a run is active; cleared on load.
    #[serde(default)]
    pub translating: bool,
    #[serde(default)]
    pub no_contents: bool,
}

impl FileProgress {
    pub fn new(spec: &FileSpec) -> Self {
        Self {
            file_path: spec.path.clone(),
            file_type: spec.file_type,
            total_count: 0,
            translated_count: 0,
            completed: false,
            description: spec.description.clone(),
            translating: false,
            no_contents: false,
        }
    }

    /// Recomputes the derived flags from the counters.
    pub fn refresh(&mut self) {
        self.completed = self.total_count > 0 && self.translated_count >= self.total_count;
    }

    pub fn set_total(&mut self, total: usize) {
        self.total_count = total;
        self.no_contents = total == 0;
        self.refresh();
    }

    pub fn reset_counts(&mut self) {
        self.translated_count = 0;
        self.refresh();
    }

    pub fn percentage(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        (self.translated_count.min(self.total_count) as f64 / self.total_count as f64) * 100.0
    }

    pub fn state(&self) -> FileState {
        if self.completed {
            FileState::Completed
        } else if self.no_contents {
            FileState::NoContents
        } else if self.translating {
            FileState::Translating
        } else {
            FileState::Pending
        }
    }
}

/// Point-in-time copy of tracker state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: RunStatus,
    pub current_file: Option<String>,
    pub files: Vec<FileProgress>,
    pub total_files: usize,
    pub completed_files: usize,
}
