//! Drives files through encode, memory lookup, model call, decode, log and
//! progress.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::StoreError;
use crate::placeholder::{self, Encoded};
use crate::progress::{ProgressError, RunStatus};
use crate::session::Session;
use crate::textutil::{is_blank, normalize_punctuation, preview};
use crate::unit::TranslationUnit;
use crate::unit_log::{self, UnitLogWriter};

use super::extract::{FileSpec, UnitApplier, UnitExtractor};
use super::model::{ModelInvoker, ModelReply};
use super::prompts::PromptInput;

pub const REASON_EXACT_MATCH: &str = "exact translation memory match";
pub const REASON_PLACEHOLDER_ONLY: &str = "placeholder-only text";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("file is not configured: {0}")]
    UnknownFile(String),
    #[error("extract {file}: {message}")]
    Extraction { file: String, message: String },
    #[error("apply {file}: {message}")]
    Apply { file: String, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOutcome {
    Completed,
    Interrupted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub interrupted: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ApplyReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Orchestrator {
    session: Arc<Session>,
    extractor: Arc<dyn UnitExtractor>,
    applier: Arc<dyn UnitApplier>,
    model: Arc<dyn ModelInvoker>,
}

impl Orchestrator {
    pub fn new(
        session: Arc<Session>,
        extractor: Arc<dyn UnitExtractor>,
        applier: Arc<dyn UnitApplier>,
        model: Arc<dyn ModelInvoker>,
    ) -> Self {
        Self {
            session,
            extractor,
            applier,
            model,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn spec(&self, path: &str) -> Result<FileSpec, PipelineError> {
        self.session
            .file(path)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownFile(path.to_string()))
    }

    /// Translates one configured file, resuming where its log ends.
    pub fn translate_file(&self, path: &str) -> Result<FileOutcome, PipelineError> {
        let spec = self.spec(path)?;
        self.session.tracker().try_start()?;
        self.finish_file(self.run_started_file(&spec))
    }

    /// Translates every configured file in order. Stops on interrupt and
    /// continues past a failing file.
    pub fn translate_all(&self) -> Result<RunReport, PipelineError> {
        self.session.tracker().try_start()?;
        self.run_all_started()
    }

    /// Body of a file run whose slot is already claimed.
    pub(crate) fn finish_file(
        &self,
        result: Result<FileOutcome, PipelineError>,
    ) -> Result<FileOutcome, PipelineError> {
        let tracker = self.session.tracker();
        match result {
            Ok(FileOutcome::Interrupted) => {
                tracker.persist()?;
                Ok(FileOutcome::Interrupted)
            }
            Ok(FileOutcome::Completed) => {
                tracker.set_status(RunStatus::Idle, None)?;
                Ok(FileOutcome::Completed)
            }
            Err(e) => {
                if let Err(status_err) = tracker.set_status(RunStatus::Idle, None) {
                    warn!("cannot reset run status: {status_err}");
                }
                Err(e)
            }
        }
    }

    pub(crate) fn run_all_started(&self) -> Result<RunReport, PipelineError> {
        let tracker = self.session.tracker();
        let mut report = RunReport::default();
        for spec in self.session.files() {
            match self.run_started_file(spec) {
                Ok(FileOutcome::Completed) => report.completed.push(spec.path.clone()),
                Ok(FileOutcome::Interrupted) => {
                    info!(file = %spec.path, "batch stopped by interrupt");
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    error!(file = %spec.path, "file failed: {e}");
                    report.failed.push((spec.path.clone(), e.to_string()));
                }
            }
        }
        if report.interrupted {
            tracker.persist()?;
        } else {
            tracker.set_status(RunStatus::Idle, None)?;
        }
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            interrupted = report.interrupted,
            "batch finished"
        );
        Ok(report)
    }

    pub(crate) fn run_started_file(&self, spec: &FileSpec) -> Result<FileOutcome, PipelineError> {
        let tracker = self.session.tracker();
        let workspace = self.session.workspace();
        let path = spec.path.as_str();

        match tracker.set_status(RunStatus::Running, Some(path)) {
            Ok(()) => {}
            Err(ProgressError::Interrupted) => return Ok(FileOutcome::Interrupted),
            Err(e) => return Err(e.into()),
        }
        let _claim = tracker.claim_log(path)?;

        let source = workspace.prepare_working_copy(path)?;
        let mut units = self
            .extractor
            .extract_units(spec, &source)
            .map_err(|e| PipelineError::Extraction {
                file: path.to_string(),
                message: format!("{e:#}"),
            })?;
        for unit in &mut units {
            if unit.file_name.is_empty() {
                unit.file_name = path.to_string();
            }
            unit.ensure_key();
        }

        let total = units.len();
        let resume = tracker.reconcile(path, total)?;
        info!(file = %path, total, resume, "translating file");
        if resume >= total {
            return Ok(FileOutcome::Completed);
        }

        let mut log = UnitLogWriter::open_append(&workspace.unit_log(path))?;
        for unit in units.into_iter().skip(resume) {
            if tracker.is_interrupted() {
                info!(file = %path, "interrupted before next unit");
                return Ok(FileOutcome::Interrupted);
            }
            let unit = self.translate_unit(unit, spec);
            log.append(&unit)?;
            let progress = tracker.advance_progress(path, 1)?;
            info!(
                file = %path,
                "{}/{} ({:5.1}%)",
                progress.translated_count,
                progress.total_count,
                progress.percentage()
            );
        }
        tracker.persist()?;
        Ok(FileOutcome::Completed)
    }

    /// Never fails: unrecoverable problems leave the original text in place
    /// with the reason recorded.
    pub fn translate_unit(&self, mut unit: TranslationUnit, spec: &FileSpec) -> TranslationUnit {
        if is_blank(&unit.original_text) {
            return unit;
        }
        let settings = self.session.settings();
        let memory = self.session.memory();

        let encoded = placeholder::encode(&unit.original_text);
        unit.process_text = encoded.text.clone();

        match memory.get_exact(&unit.original_text) {
            Ok(Some(hit)) => {
                debug!(key = %unit.translation_key, "exact memory hit");
                unit.translation = self.post_process(hit.effective_translation());
                unit.is_translated = true;
                unit.is_suggested_to_translate = true;
                unit.llm_reason = if hit.llm_reason.is_empty() {
                    REASON_EXACT_MATCH.to_string()
                } else {
                    hit.llm_reason
                };
                return unit;
            }
            Ok(None) => {}
            Err(e) => warn!(key = %unit.translation_key, "exact lookup failed: {e}"),
        }

        if encoded.is_placeholder_only() {
            unit.translation = unit.original_text.clone();
            unit.is_translated = true;
            unit.is_suggested_to_translate = false;
            unit.llm_reason = REASON_PLACEHOLDER_ONLY.to_string();
            return unit;
        }

        let chars = encoded.text.chars().count();
        if chars > settings.max_text_chars {
            warn!(
                key = %unit.translation_key,
                chars,
                "text too long, skipped: {}",
                preview(&encoded.text, 50)
            );
            unit.pass_through(format!(
                "text longer than {} characters, not translated",
                settings.max_text_chars
            ));
            return unit;
        }

        let similar = memory
            .search_similar(
                &unit.original_text,
                settings.similarity_threshold,
                settings.similar_results,
            )
            .unwrap_or_else(|e| {
                warn!(key = %unit.translation_key, "similarity search failed: {e}");
                Vec::new()
            });
        let terms = self.session.terminology().find_matches(&unit.original_text);
        debug!(similar = similar.len(), terms = terms.len(), "prompt hints");

        let prompts = self.session.prompts();
        let system = prompts.render_system(&settings.game, &settings.target_language);
        let user = prompts.render_user(
            &PromptInput {
                unit: &unit,
                encoded: &encoded.text,
                similar: &similar,
                terms: &terms,
                file_type: spec.file_type.as_str(),
            },
            settings.prompt_examples,
        );

        let attempts = settings.max_retries.max(1);
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            match self.attempt(&system, &user, &encoded) {
                Ok((translation, reply)) => {
                    unit.is_translated = !translation.is_empty();
                    unit.translation = translation;
                    unit.is_suggested_to_translate = reply.should_translate;
                    unit.llm_reason = reply.reason;
                    if unit.is_translated && unit.is_suggested_to_translate {
                        if let Err(e) = memory.record_translation(&unit) {
                            warn!(key = %unit.translation_key, "memory write failed: {e}");
                            unit.llm_reason =
                                format!("{} (memory write failed: {e})", unit.llm_reason);
                        }
                    }
                    return unit;
                }
                Err(e) => {
                    warn!(
                        key = %unit.translation_key,
                        attempt,
                        attempts,
                        "model attempt failed: {e}"
                    );
                    last_err = e;
                }
            }
        }
        unit.pass_through(format!("translation failed: {last_err}"));
        unit
    }

    /// One model call: invoke, parse, restore placeholders. An empty
    /// translation is only accepted when the model declines to translate.
    fn attempt(
        &self,
        system: &str,
        user: &str,
        encoded: &Encoded,
    ) -> Result<(String, ModelReply), String> {
        let raw = self
            .model
            .invoke(system, user)
            .map_err(|e| format!("model call failed: {e:#}"))?;
        let reply = ModelReply::parse(&raw).map_err(|e| e.to_string())?;
        if reply.translation.trim().is_empty() {
            if reply.should_translate {
                return Err("model returned an empty translation".to_string());
            }
            return Ok((String::new(), reply));
        }
        let decoded =
            placeholder::decode(&reply.translation, &encoded.map).map_err(|e| e.to_string())?;
        let translation = self.post_process(&decoded);
        Ok((translation, reply))
    }

    fn post_process(&self, text: &str) -> String {
        if self.session.settings().normalize_punctuation {
            normalize_punctuation(text)
        } else {
            text.to_string()
        }
    }

    /// Hands the file's unit log to the applier.
    pub fn apply_file(&self, path: &str) -> Result<usize, PipelineError> {
        let spec = self.spec(path)?;
        let workspace = self.session.workspace();
        let units = unit_log::read_units(&workspace.unit_log(path))?;
        let source = workspace.prepare_working_copy(path)?;
        self.applier
            .apply_units(&spec, &source, &units)
            .map_err(|e| PipelineError::Apply {
                file: path.to_string(),
                message: format!("{e:#}"),
            })?;
        info!(file = %path, units = units.len(), "translations applied");
        Ok(units.len())
    }

    /// Applies every completed file; incomplete and empty files are skipped.
    pub fn apply_all(&self) -> ApplyReport {
        let tracker = self.session.tracker();
        let mut report = ApplyReport::default();
        for spec in self.session.files() {
            let ready = tracker
                .file(&spec.path)
                .is_some_and(|p| p.completed && !p.no_contents);
            if !ready {
                report.skipped.push(spec.path.clone());
                continue;
            }
            match self.apply_file(&spec.path) {
                Ok(_) => report.applied.push(spec.path.clone()),
                Err(e) => {
                    error!(file = %spec.path, "apply failed: {e}");
                    report.failed.push((spec.path.clone(), e.to_string()));
                }
            }
        }
        report
    }
}
