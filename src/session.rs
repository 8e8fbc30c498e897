//! One open configuration namespace, and the application context holding
//! every open namespace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};
use tracing::info;

use crate::config::{LoadedConfig, TranslateSection};
use crate::memory::TranslationMemory;
use crate::pipeline::extract::FileSpec;
use crate::pipeline::prompts::PromptSet;
use crate::progress::{ProgressError, ProgressTracker};
use crate::review::{self, ReviewError, ReviewOutcome, ReviewUpdate};
use crate::terminology::Terminology;
use crate::unit::TranslationUnit;
use crate::workspace::Workspace;

pub struct Session {
    files: Vec<FileSpec>,
    settings: TranslateSection,
    prompts: PromptSet,
    memory: Arc<TranslationMemory>,
    terminology: Arc<Terminology>,
    tracker: Arc<ProgressTracker>,
}

impl Session {
    pub fn new(
        workspace: Workspace,
        files: Vec<FileSpec>,
        settings: TranslateSection,
        prompts: PromptSet,
        memory: Arc<TranslationMemory>,
        terminology: Arc<Terminology>,
    ) -> Self {
        let tracker = Arc::new(ProgressTracker::load(workspace, &files, settings.persist_every));
        Self {
            files,
            settings,
            prompts,
            memory,
            terminology,
            tracker,
        }
    }

    /// Opens the stores of `loaded` with a private terminology handle.
    pub fn open(loaded: &LoadedConfig) -> anyhow::Result<Self> {
        let workspace = workspace_for(loaded);
        let terminology = Arc::new(
            Terminology::open(
                &workspace.terminology_db(),
                loaded.config.translate.term_word_boundary,
            )
            .context("open terminology")?,
        );
        Self::open_with_terminology(loaded, workspace, terminology)
    }

    fn open_with_terminology(
        loaded: &LoadedConfig,
        workspace: Workspace,
        terminology: Arc<Terminology>,
    ) -> anyhow::Result<Self> {
        let cfg = &loaded.config;
        let memory = TranslationMemory::open(workspace.memory_dir(), workspace.name())
            .context("open translation memory")?;
        let prompts = PromptSet::load(loaded.dir(), &cfg.prompts).context("load prompts")?;
        info!(
            workspace = %workspace.name(),
            files = cfg.files.len(),
            work_dir = %workspace.work_dir().display(),
            "session opened"
        );
        Ok(Self::new(
            workspace,
            cfg.files.clone(),
            cfg.translate.clone(),
            prompts,
            Arc::new(memory),
            terminology,
        ))
    }

    pub fn name(&self) -> &str {
        self.workspace().name()
    }

    pub fn workspace(&self) -> &Workspace {
        self.tracker.workspace()
    }

    pub fn files(&self) -> &[FileSpec] {
        &self.files
    }

    pub fn file(&self, path: &str) -> Option<&FileSpec> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn settings(&self) -> &TranslateSection {
        &self.settings
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    pub fn memory(&self) -> &Arc<TranslationMemory> {
        &self.memory
    }

    pub fn terminology(&self) -> &Arc<Terminology> {
        &self.terminology
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn load_review(&self, file: &str) -> Result<Vec<TranslationUnit>, ReviewError> {
        if self.file(file).is_none() {
            return Err(ReviewError::UnknownFile(file.to_string()));
        }
        review::load_review(&self.workspace().unit_log(file))
    }

    /// Refuses to rewrite the log of a file a worker is still writing, even
    /// after an interrupt request.
    pub fn save_review(
        &self,
        file: &str,
        updates: &[ReviewUpdate],
    ) -> Result<ReviewOutcome, ReviewError> {
        if self.file(file).is_none() {
            return Err(ReviewError::UnknownFile(file.to_string()));
        }
        let _claim = self.tracker.claim_log(file).map_err(|e| match e {
            ProgressError::LogBusy(f) => ReviewError::FileBusy(f),
            _ => ReviewError::UnknownFile(file.to_string()),
        })?;
        review::save_review(&self.workspace().unit_log(file), updates, &self.memory)
    }
}

fn workspace_for(loaded: &LoadedConfig) -> Workspace {
    let ws = &loaded.config.workspace;
    Workspace::new(
        ws.name.clone(),
        ws.mod_path.as_deref().map(|p| loaded.resolve(p)),
        &loaded.resolve(&ws.work_directory),
        &loaded.resolve(&ws.memory_directory),
    )
}

/// Open sessions keyed by namespace. Terminology databases are shared
/// between sessions that point at the same memory directory.
#[derive(Default)]
pub struct AppContext {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    terminologies: RwLock<HashMap<PathBuf, Arc<Terminology>>>,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open session for the config's namespace, opening it on
    /// first use.
    pub fn open(&self, loaded: &LoadedConfig) -> anyhow::Result<Arc<Session>> {
        let name = loaded.config.workspace.name.clone();
        if let Some(existing) = self.get(&name) {
            return Ok(existing);
        }
        let workspace = workspace_for(loaded);
        let terminology = self.terminology_for(
            &workspace.terminology_db(),
            loaded.config.translate.term_word_boundary,
        )?;
        let session = Arc::new(Session::open_with_terminology(loaded, workspace, terminology)?);

        let mut sessions = self.sessions.write().map_err(|_| anyhow!("session table poisoned"))?;
        Ok(Arc::clone(sessions.entry(name).or_insert(session)))
    }

    fn terminology_for(
        &self,
        path: &Path,
        word_boundary: bool,
    ) -> anyhow::Result<Arc<Terminology>> {
        let mut table = self
            .terminologies
            .write()
            .map_err(|_| anyhow!("terminology table poisoned"))?;
        if let Some(t) = table.get(path) {
            return Ok(Arc::clone(t));
        }
        let t = Arc::new(Terminology::open(path, word_boundary).context("open terminology")?);
        table.insert(path.to_path_buf(), Arc::clone(&t));
        Ok(t)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.read().ok()?.get(name).cloned()
    }

    pub fn close(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.write().ok()?.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
