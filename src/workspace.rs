use std::io;
use std::path::{Path, PathBuf};

use crate::unit_log;

pub const PROGRESS_FILE: &str = "translation_progress.json";

/// On-disk layout of one configuration namespace.
#[derive(Clone, Debug)]
pub struct Workspace {
    name: String,
    mod_path: Option<PathBuf>,
    work_dir: PathBuf,
    memory_dir: PathBuf,
}

impl Workspace {
    /// `work_root` and `memory_dir` are shared between namespaces; the
    /// namespace gets its own directory under `work_root`.
    pub fn new(
        name: impl Into<String>,
        mod_path: Option<PathBuf>,
        work_root: &Path,
        memory_dir: &Path,
    ) -> Self {
        let name = name.into();
        Self {
            work_dir: work_root.join(&name),
            name,
            mod_path,
            memory_dir: memory_dir.to_path_buf(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    pub fn progress_path(&self) -> PathBuf {
        self.work_dir.join(PROGRESS_FILE)
    }

    pub fn unit_log(&self, file: &str) -> PathBuf {
        unit_log::log_path(&self.work_dir, file)
    }

    pub fn working_copy(&self, file: &str) -> PathBuf {
        self.work_dir.join(file)
    }

    pub fn source_path(&self, file: &str) -> Option<PathBuf> {
        self.mod_path.as_ref().map(|root| root.join(file))
    }

    pub fn terminology_db(&self) -> PathBuf {
        self.memory_dir.join("sqlite").join("terminology.db")
    }

    /// Copies the source into the workspace on first use and returns the
    /// working copy path. An existing working copy is kept as is.
    pub fn prepare_working_copy(&self, file: &str) -> io::Result<PathBuf> {
        let copy = self.working_copy(file);
        if copy.exists() {
            return Ok(copy);
        }
        let source = self.source_path(file).filter(|p| p.exists()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("source file not found for {file}"),
            )
        })?;
        if let Some(parent) = copy.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &copy)?;
        Ok(copy)
    }

    /// Returns whether a working copy was removed.
    pub fn remove_working_copy(&self, file: &str) -> io::Result<bool> {
        unit_log::remove(&self.working_copy(file))
    }
}
