//! Collaborator seams for file-format handling.
//!
//! Format parsers live outside the core. They are registered per
//! [`FileType`] in an [`ExtractorRegistry`] at startup.

use std::collections::HashMap;
use std::path::Path;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::unit::TranslationUnit;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Json,
    Jar,
}

impl FileType {
    pub const ALL: [FileType; 3] = [FileType::Csv, FileType::Json, FileType::Jar];

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Csv => "csv",
            FileType::Json => "json",
            FileType::Jar => "jar",
        }
    }

    pub fn from_extension(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(FileType::Csv),
            "json" => Some(FileType::Json),
            "jar" => Some(FileType::Jar),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured source file, relative to the mod directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default)]
    pub description: String,
}

impl FileSpec {
    pub fn new(path: impl Into<String>, file_type: FileType) -> Self {
        Self {
            path: path.into(),
            file_type,
            description: String::new(),
        }
    }
}

/// Extracts translatable units from the working copy at `source`.
///
/// Repeated calls on an unchanged source must return the same units in the
/// same order; resume relies on it.
pub trait UnitExtractor: Send + Sync {
    fn extract_units(&self, file: &FileSpec, source: &Path) -> anyhow::Result<Vec<TranslationUnit>>;
}

/// Writes translated units back into an output artifact for `file`.
pub trait UnitApplier: Send + Sync {
    fn apply_units(
        &self,
        file: &FileSpec,
        source: &Path,
        units: &[TranslationUnit],
    ) -> anyhow::Result<()>;
}

/// Static per-type dispatch table.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<FileType, Box<dyn UnitExtractor>>,
    appliers: HashMap<FileType, Box<dyn UnitApplier>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extractor(
        mut self,
        file_type: FileType,
        extractor: Box<dyn UnitExtractor>,
    ) -> Self {
        self.extractors.insert(file_type, extractor);
        self
    }

    pub fn with_applier(mut self, file_type: FileType, applier: Box<dyn UnitApplier>) -> Self {
        self.appliers.insert(file_type, applier);
        self
    }

    pub fn supports(&self, file_type: FileType) -> bool {
        self.extractors.contains_key(&file_type)
    }
}

impl UnitExtractor for ExtractorRegistry {
    fn extract_units(
        &self,
        file: &FileSpec,
        source: &Path,
    ) -> anyhow::Result<Vec<TranslationUnit>> {
        let extractor = self
            .extractors
            .get(&file.file_type)
            .ok_or_else(|| anyhow!("no extractor registered for {} files", file.file_type))?;
        extractor.extract_units(file, source)
    }
}

impl UnitApplier for ExtractorRegistry {
    fn apply_units(
        &self,
        file: &FileSpec,
        source: &Path,
        units: &[TranslationUnit],
    ) -> anyhow::Result<()> {
        let applier = self
            .appliers
            .get(&file.file_type)
            .ok_or_else(|| anyhow!("no applier registered for {} files", file.file_type))?;
        applier.apply_units(file, source, units)
    }
}
