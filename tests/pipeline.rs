#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::anyhow;
use serde_json::json;
use tempfile::TempDir;

use mod_translator::config::TranslateSection;
use mod_translator::memory::TranslationMemory;
use mod_translator::pipeline::orchestrator::{REASON_EXACT_MATCH, REASON_PLACEHOLDER_ONLY};
use mod_translator::pipeline::prompts::PromptSet;
use mod_translator::pipeline::{
    FileOutcome, FileSpec, FileType, ModelInvoker, Orchestrator, PipelineError, TranslationRunner,
    UnitApplier, UnitExtractor,
};
use mod_translator::progress::{ProgressError, RunStatus};
use mod_translator::review::ReviewError;
use mod_translator::session::Session;
use mod_translator::terminology::{TermEntry, TermStore, Terminology};
use mod_translator::unit::TranslationUnit;
use mod_translator::unit_log;
use mod_translator::workspace::Workspace;

/// One unit per line of the working copy.
struct LineExtractor;

impl UnitExtractor for LineExtractor {
    fn extract_units(
        &self,
        file: &FileSpec,
        source: &Path,
    ) -> anyhow::Result<Vec<TranslationUnit>> {
        let raw = fs::read_to_string(source)?;
        Ok(raw
            .lines()
            .enumerate()
            .map(|(i, l)| TranslationUnit::new(file.path.clone(), l, format!("line:{i}")))
            .collect())
    }
}

/// Writes `<working copy>.out` with one effective translation per line.
struct LineApplier;

impl UnitApplier for LineApplier {
    fn apply_units(
        &self,
        _file: &FileSpec,
        source: &Path,
        units: &[TranslationUnit],
    ) -> anyhow::Result<()> {
        let body: Vec<&str> = units.iter().map(|u| u.effective_translation()).collect();
        fs::write(source.with_extension("out"), body.join("\n"))?;
        Ok(())
    }
}

enum Reply {
    /// Prefixes the prompt text, keeping its tokens.
    Echo,
    Raw(String),
    Fail,
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct ScriptedModel {
    script: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    after_call: Option<Hook>,
}

impl ScriptedModel {
    fn with_script(replies: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    fn with_hook(hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self {
            after_call: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn prompt_text(user_prompt: &str) -> &str {
    user_prompt
        .split("Text to translate: ")
        .nth(1)
        .and_then(|rest| rest.split("\n\nReply with JSON only").next())
        .unwrap_or_default()
}

impl ModelInvoker for ScriptedModel {
    fn invoke(&self, _system_prompt: &str, user_prompt: &str) -> anyhow::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(user_prompt.to_string());
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Echo);
        let out = match reply {
            Reply::Echo => Ok(json!({
                "translation": format!("译 {}", prompt_text(user_prompt)),
                "should_translate": true,
                "reason": "player-facing text",
            })
            .to_string()),
            Reply::Raw(raw) => Ok(raw),
            Reply::Fail => Err(anyhow!("backend unavailable")),
        };
        if let Some(hook) = &self.after_call {
            hook(n);
        }
        out
    }
}

struct Harness {
    _dir: TempDir,
    mod_root: PathBuf,
    session: Arc<Session>,
}

impl Harness {
    fn new(files: &[(&str, &str)]) -> Self {
        Self::with_settings(files, TranslateSection::default())
    }

    fn with_settings(files: &[(&str, &str)], settings: TranslateSection) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mod_root = dir.path().join("mod");
        fs::create_dir_all(&mod_root).unwrap();
        let mut specs = Vec::new();
        for (path, body) in files {
            fs::write(mod_root.join(path), body).unwrap();
            specs.push(FileSpec::new(*path, FileType::Csv));
        }
        let workspace = Workspace::new(
            "demo",
            Some(mod_root.clone()),
            &dir.path().join("work"),
            &dir.path().join("memory"),
        );
        let terminology = Terminology::new(TermStore::open_in_memory().unwrap(), false).unwrap();
        let session = Session::new(
            workspace,
            specs,
            settings,
            PromptSet::default(),
            Arc::new(TranslationMemory::open_in_memory("demo").unwrap()),
            Arc::new(terminology),
        );
        Self {
            _dir: dir,
            mod_root,
            session: Arc::new(session),
        }
    }

    fn orchestrator(&self, model: &Arc<ScriptedModel>) -> Orchestrator {
        let model: Arc<dyn ModelInvoker> = model.clone();
        Orchestrator::new(
            Arc::clone(&self.session),
            Arc::new(LineExtractor),
            Arc::new(LineApplier),
            model,
        )
    }

    fn logged(&self, file: &str) -> Vec<TranslationUnit> {
        unit_log::read_units(&self.session.workspace().unit_log(file)).unwrap()
    }
}

fn interrupt_on(session: &Arc<Session>, call: usize) -> Arc<ScriptedModel> {
    let tracker = Arc::clone(session.tracker());
    Arc::new(ScriptedModel::with_hook(move |n| {
        if n == call {
            tracker.request_interrupt().unwrap();
        }
    }))
}

#[test]
fn translates_every_unit_and_records_memory() {
    let h = Harness::new(&[("a.csv", "Fleet\n\nDeal %d damage\n%s")]);
    let model = Arc::new(ScriptedModel::default());
    let orch = h.orchestrator(&model);

    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Completed);
    assert_eq!(model.calls(), 2);

    let units = h.logged("a.csv");
    assert_eq!(units.len(), 4);
    assert_eq!(units[0].translation, "译 Fleet");
    assert!(units[0].is_translated && units[0].is_suggested_to_translate);
    assert!(!units[1].is_translated);
    assert_eq!(units[1].translation, "");
    assert_eq!(units[2].process_text, "Deal ${1} damage");
    assert_eq!(units[2].translation, "译 Deal %d damage");
    assert_eq!(units[3].translation, "%s");
    assert_eq!(units[3].llm_reason, REASON_PLACEHOLDER_ONLY);
    assert!(!units[3].is_suggested_to_translate);
    assert!(units.iter().all(|u| !u.translation_key.is_empty()));

    let memory = h.session.memory();
    assert_eq!(memory.get_exact("Fleet").unwrap().unwrap().translation, "译 Fleet");
    assert_eq!(memory.stats().unwrap().semantic_entries, 2);

    let progress = h.session.tracker().file("a.csv").unwrap();
    assert_eq!((progress.translated_count, progress.total_count), (4, 4));
    assert!(progress.completed);
    assert_eq!(h.session.tracker().status(), RunStatus::Idle);
    assert!(h.session.workspace().progress_path().exists());
}

#[test]
fn finished_file_is_not_translated_twice() {
    let h = Harness::new(&[("a.csv", "Fleet\nStation")]);
    let model = Arc::new(ScriptedModel::default());
    let orch = h.orchestrator(&model);
    orch.translate_file("a.csv").unwrap();
    orch.translate_file("a.csv").unwrap();
    assert_eq!(model.calls(), 2);
    assert_eq!(h.logged("a.csv").len(), 2);
}

#[test]
fn exact_memory_hit_skips_the_model() {
    let h = Harness::new(&[("a.csv", "Fleet\nStation")]);
    let mut known = TranslationUnit::new("other.csv", "Fleet", "row:9");
    known.ensure_key();
    known.translation = "舰船".to_string();
    known.approved = true;
    known.approved_text = "舰队".to_string();
    h.session.memory().records().upsert(&known).unwrap();

    let model = Arc::new(ScriptedModel::default());
    h.orchestrator(&model).translate_file("a.csv").unwrap();

    assert_eq!(model.calls(), 1);
    let units = h.logged("a.csv");
    assert_eq!(units[0].translation, "舰队");
    assert_eq!(units[0].llm_reason, REASON_EXACT_MATCH);
    assert!(units[0].is_translated);
}

#[test]
fn missing_placeholder_is_retried() {
    let h = Harness::new(&[("a.csv", "Deal %d damage")]);
    let dropped =
        json!({"translation": "造成伤害", "should_translate": true, "reason": "x"}).to_string();
    let model = Arc::new(ScriptedModel::with_script(vec![Reply::Raw(dropped)]));
    h.orchestrator(&model).translate_file("a.csv").unwrap();

    assert_eq!(model.calls(), 2);
    assert_eq!(h.logged("a.csv")[0].translation, "译 Deal %d damage");
}

#[test]
fn exhausted_retries_pass_the_original_through() {
    let settings = TranslateSection {
        max_retries: 3,
        ..TranslateSection::default()
    };
    let h = Harness::with_settings(&[("a.csv", "Fleet")], settings);
    let model = Arc::new(ScriptedModel::with_script(vec![
        Reply::Fail,
        Reply::Raw("no json here".to_string()),
        Reply::Fail,
    ]));
    let orch = h.orchestrator(&model);
    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Completed);

    assert_eq!(model.calls(), 3);
    let unit = &h.logged("a.csv")[0];
    assert_eq!(unit.translation, "Fleet");
    assert!(!unit.is_translated);
    assert!(unit.llm_reason.starts_with("translation failed"), "{}", unit.llm_reason);
    assert!(h.session.memory().get_exact("Fleet").unwrap().is_none());
    assert!(h.session.tracker().file("a.csv").unwrap().completed);
}

#[test]
fn should_not_translate_is_kept_out_of_memory() {
    let h = Harness::new(&[("a.csv", "data/config/settings.json")]);
    let reply = json!({
        "translation": "data/config/settings.json",
        "should_translate": false,
        "reason": "file path",
    })
    .to_string();
    let model = Arc::new(ScriptedModel::with_script(vec![Reply::Raw(reply)]));
    h.orchestrator(&model).translate_file("a.csv").unwrap();

    let unit = &h.logged("a.csv")[0];
    assert!(unit.is_translated);
    assert!(!unit.is_suggested_to_translate);
    assert_eq!(unit.llm_reason, "file path");
    assert_eq!(h.session.memory().count().unwrap(), 0);
}

#[test]
fn prompt_carries_terminology_and_similar_examples() {
    let settings = TranslateSection {
        similarity_threshold: 0.3,
        ..TranslateSection::default()
    };
    let h = Harness::with_settings(&[("a.csv", "Hegemony fleet arrives")], settings);
    h.session
        .terminology()
        .add(&TermEntry::new("Hegemony", "霸主"))
        .unwrap();
    let mut past = TranslationUnit::new("old.csv", "Hegemony fleet", "row:1");
    past.ensure_key();
    past.translation = "霸主舰队".to_string();
    h.session.memory().record_translation(&past).unwrap();

    let model = Arc::new(ScriptedModel::default());
    h.orchestrator(&model).translate_file("a.csv").unwrap();

    let prompts = model.prompts.lock().unwrap();
    assert!(prompts[0].contains("- Hegemony => 霸主"), "{}", prompts[0]);
    assert!(prompts[0].contains("Source: Hegemony fleet\nTarget: 霸主舰队"), "{}", prompts[0]);
    assert_eq!(prompt_text(&prompts[0]), "Hegemony fleet arrives");
}

#[test]
fn interrupt_stops_after_current_unit_and_resume_continues() {
    let h = Harness::new(&[("a.csv", "One\nTwo\nThree")]);
    let model = interrupt_on(&h.session, 1);
    let orch = h.orchestrator(&model);

    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Interrupted);
    assert_eq!(h.session.tracker().status(), RunStatus::Interrupted);
    assert_eq!(h.logged("a.csv").len(), 1);
    assert_eq!(h.session.tracker().file("a.csv").unwrap().translated_count, 1);

    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Completed);
    assert_eq!(model.calls(), 3);
    let texts: Vec<String> = h.logged("a.csv").into_iter().map(|u| u.original_text).collect();
    assert_eq!(texts, ["One", "Two", "Three"]);
    assert_eq!(h.session.tracker().status(), RunStatus::Idle);
}

#[test]
fn torn_log_tail_is_dropped_on_resume() {
    let h = Harness::new(&[("a.csv", "One\nTwo\nThree")]);
    let model = interrupt_on(&h.session, 1);
    let orch = h.orchestrator(&model);
    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Interrupted);

    // A crash mid-append leaves half a line behind.
    let log = h.session.workspace().unit_log("a.csv");
    let mut raw = fs::read(&log).unwrap();
    raw.extend_from_slice(br#"{"file_name":"a.csv","original_te"#);
    fs::write(&log, raw).unwrap();

    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Completed);
    let texts: Vec<String> = h.logged("a.csv").into_iter().map(|u| u.original_text).collect();
    assert_eq!(texts, ["One", "Two", "Three"]);
    assert!(unit_log::scan(&log).unwrap().bad_line.is_none());
    let progress = h.session.tracker().file("a.csv").unwrap();
    assert_eq!((progress.translated_count, progress.total_count), (3, 3));
    assert!(progress.completed);
    assert_eq!(model.calls(), 3);
}

#[test]
fn unreadable_log_blocks_review_until_resumed() {
    let h = Harness::new(&[("a.csv", "One\nTwo\nThree")]);
    let log = h.session.workspace().unit_log("a.csv");
    let mut two = TranslationUnit::new("a.csv", "Two", "line:1");
    two.ensure_key();
    fs::create_dir_all(log.parent().unwrap()).unwrap();
    fs::write(&log, format!("garbage\n{}\n", serde_json::to_string(&two).unwrap())).unwrap();
    let before = fs::read(&log).unwrap();

    let review = h.session.save_review("a.csv", &[]);
    assert!(matches!(review, Err(ReviewError::UnreadableLog { line: 1 })));
    assert_eq!(fs::read(&log).unwrap(), before);

    let model = Arc::new(ScriptedModel::default());
    let orch = h.orchestrator(&model);
    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Completed);
    let texts: Vec<String> = h.logged("a.csv").into_iter().map(|u| u.original_text).collect();
    assert_eq!(texts, ["One", "Two", "Three"]);
    assert_eq!(model.calls(), 3);
    h.session.save_review("a.csv", &[]).unwrap();
}

#[test]
fn empty_translation_is_retried() {
    let h = Harness::new(&[("a.csv", "Fleet")]);
    let empty = json!({"translation": "", "should_translate": true, "reason": "x"}).to_string();
    let model = Arc::new(ScriptedModel::with_script(vec![Reply::Raw(empty)]));
    h.orchestrator(&model).translate_file("a.csv").unwrap();

    assert_eq!(model.calls(), 2);
    let unit = &h.logged("a.csv")[0];
    assert_eq!(unit.translation, "译 Fleet");
    assert!(unit.is_translated);
    assert_eq!(h.session.memory().get_exact("Fleet").unwrap().unwrap().translation, "译 Fleet");
}

#[test]
fn empty_translation_is_accepted_when_declined() {
    let h = Harness::new(&[("a.csv", "DEBUG_FLAG")]);
    let declined =
        json!({"translation": "", "should_translate": false, "reason": "identifier"}).to_string();
    let model = Arc::new(ScriptedModel::with_script(vec![Reply::Raw(declined)]));
    h.orchestrator(&model).translate_file("a.csv").unwrap();

    assert_eq!(model.calls(), 1);
    let unit = &h.logged("a.csv")[0];
    assert!(!unit.is_translated);
    assert!(!unit.is_suggested_to_translate);
    assert_eq!(unit.llm_reason, "identifier");
}

#[test]
fn changed_source_discards_partial_log() {
    let h = Harness::new(&[("a.csv", "One\nTwo\nThree")]);
    let model = interrupt_on(&h.session, 1);
    let orch = h.orchestrator(&model);
    orch.translate_file("a.csv").unwrap();
    assert_eq!(h.logged("a.csv").len(), 1);

    fs::write(h.session.workspace().working_copy("a.csv"), "Uno\nDos\nTres\nCuatro").unwrap();
    assert_eq!(orch.translate_file("a.csv").unwrap(), FileOutcome::Completed);

    let texts: Vec<String> = h.logged("a.csv").into_iter().map(|u| u.original_text).collect();
    assert_eq!(texts, ["Uno", "Dos", "Tres", "Cuatro"]);
    assert_eq!(model.calls(), 5);
}

#[test]
fn translate_all_continues_past_failing_file() {
    let h = Harness::new(&[("a.csv", "Fleet"), ("b.csv", "Station")]);
    fs::remove_file(h.mod_root.join("a.csv")).unwrap();
    let model = Arc::new(ScriptedModel::default());

    let report = h.orchestrator(&model).translate_all().unwrap();
    assert_eq!(report.completed, ["b.csv"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "a.csv");
    assert!(!report.interrupted);
    assert_eq!(h.session.tracker().status(), RunStatus::Idle);
}

#[test]
fn translate_all_stops_on_interrupt() {
    let h = Harness::new(&[("a.csv", "One\nTwo"), ("b.csv", "Three")]);
    let model = interrupt_on(&h.session, 1);

    let report = h.orchestrator(&model).translate_all().unwrap();
    assert!(report.interrupted);
    assert!(report.completed.is_empty());
    assert_eq!(h.session.tracker().status(), RunStatus::Interrupted);
    assert_eq!(h.session.tracker().file("b.csv").unwrap().translated_count, 0);
    assert!(h.logged("b.csv").is_empty());
}

#[test]
fn unknown_file_is_rejected_without_claiming_the_run() {
    let h = Harness::new(&[("a.csv", "Fleet")]);
    let model = Arc::new(ScriptedModel::default());
    assert!(matches!(
        h.orchestrator(&model).translate_file("nope.csv"),
        Err(PipelineError::UnknownFile(_))
    ));
    assert_eq!(h.session.tracker().status(), RunStatus::Idle);
}

#[test]
fn apply_all_skips_unfinished_files() {
    let h = Harness::new(&[("a.csv", "Fleet\nStation"), ("b.csv", "Ship")]);
    let model = Arc::new(ScriptedModel::default());
    let orch = h.orchestrator(&model);
    orch.translate_file("a.csv").unwrap();

    let report = orch.apply_all();
    assert!(report.success());
    assert_eq!(report.applied, ["a.csv"]);
    assert_eq!(report.skipped, ["b.csv"]);
    let out = h.session.workspace().working_copy("a.csv").with_extension("out");
    assert_eq!(fs::read_to_string(out).unwrap(), "译 Fleet\n译 Station");
}

fn gated_model() -> (Arc<ScriptedModel>, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let rx = Mutex::new(rx);
    let model = ScriptedModel::with_hook(move |_| {
        rx.lock().unwrap().recv().unwrap();
    });
    (Arc::new(model), tx)
}

#[test]
fn runner_rejects_second_start_while_running() {
    let h = Harness::new(&[("a.csv", "One\nTwo\nThree")]);
    let (model, gate) = gated_model();
    let runner = TranslationRunner::new(Arc::new(h.orchestrator(&model)));

    runner.start_file("a.csv").unwrap();
    assert!(runner.is_running());
    assert!(matches!(
        runner.start_all(),
        Err(PipelineError::Progress(ProgressError::AlreadyRunning))
    ));
    assert!(matches!(
        h.session.tracker().reset_progress(None),
        Err(ProgressError::AlreadyRunning)
    ));

    for _ in 0..3 {
        gate.send(()).unwrap();
    }
    runner.wait();
    assert!(!runner.is_running());
    assert!(runner.status().files[0].completed);
    assert_eq!(model.calls(), 3);
}

#[test]
fn runner_interrupt_is_cooperative() {
    let h = Harness::new(&[("a.csv", "One\nTwo\nThree")]);
    let (model, gate) = gated_model();
    let runner = TranslationRunner::new(Arc::new(h.orchestrator(&model)));
    assert!(matches!(runner.interrupt(), Err(ProgressError::NotRunning)));

    runner.start_file("a.csv").unwrap();
    // The worker is now parked inside its first model call.
    while model.calls() == 0 {
        std::thread::yield_now();
    }
    assert!(matches!(
        h.session.save_review("a.csv", &[]),
        Err(ReviewError::FileBusy(_))
    ));
    runner.interrupt().unwrap();
    // Still inside the call: the log stays claimed until the worker exits.
    assert_eq!(runner.status().current_file, None);
    assert!(matches!(
        h.session.save_review("a.csv", &[]),
        Err(ReviewError::FileBusy(_))
    ));
    assert!(matches!(
        h.session.tracker().reset_progress(Some("a.csv")),
        Err(ProgressError::LogBusy(_))
    ));
    gate.send(()).unwrap();
    runner.wait();

    let snap = runner.status();
    assert_eq!(snap.status, RunStatus::Interrupted);
    assert_eq!(snap.current_file, None);
    assert_eq!(h.logged("a.csv").len(), 1);
    assert_eq!(model.calls(), 1);
    assert!(!h.session.tracker().is_log_claimed("a.csv"));
    h.session.save_review("a.csv", &[]).unwrap();
}
