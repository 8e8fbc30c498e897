use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::pipeline::extract::FileSpec;
use crate::pipeline::prompts::{default_prompt_files, DEFAULT_PROMPTS_DIR};

pub const DEFAULT_CONFIG_FILENAME: &str = "mod-translator.toml";
pub const CONFIG_ENV: &str = "MOD_TRANSLATOR_CONFIG";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub translate: TranslateSection,
    #[serde(default)]
    pub prompts: PromptsSection,
    #[serde(default)]
    pub files: Vec<FileSpec>,
}

fn default_work_directory() -> PathBuf {
    PathBuf::from("translation_work")
}

fn default_memory_directory() -> PathBuf {
    PathBuf::from("hybrid_memory")
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkspaceSection {
    /// Configuration namespace; also used in database and directory names.
    pub name: String,
    #[serde(default)]
    pub mod_path: Option<PathBuf>,
    #[serde(default = "default_work_directory")]
    pub work_directory: PathBuf,
    #[serde(default = "default_memory_directory")]
    pub memory_directory: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TranslateSection {
    pub max_retries: usize,
    pub similarity_threshold: f32,
    pub similar_results: usize,
    pub prompt_examples: usize,
    pub max_text_chars: usize,
    /// Progress snapshot is written at least every N units.
    pub persist_every: usize,
    pub normalize_punctuation: bool,
    pub term_word_boundary: bool,
    pub target_language: String,
    pub game: String,
}

impl Default for TranslateSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            similarity_threshold: 0.7,
            similar_results: 3,
            prompt_examples: 3,
            max_text_chars: 4000,
            persist_every: 10,
            normalize_punctuation: true,
            term_word_boundary: false,
            target_language: "Simplified Chinese".to_string(),
            game: "Starsector".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// A parsed config plus the file it came from.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: AppConfig,
}

impl LoadedConfig {
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Relative paths in the config are relative to the config file.
    pub fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_relative() {
            self.dir().join(p)
        } else {
            p.to_path_buf()
        }
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

/// Explicit path, then `MOD_TRANSLATOR_CONFIG`, then upward search.
pub fn locate_config(explicit: Option<PathBuf>, workdir: &Path) -> anyhow::Result<PathBuf> {
    explicit
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .or_else(|| find_default_config(workdir, DEFAULT_CONFIG_FILENAME))
        .ok_or_else(|| {
            anyhow!(
                "{DEFAULT_CONFIG_FILENAME} not found \
                 (set {CONFIG_ENV} or run: mod-translator init)"
            )
        })
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != ".."
}

pub fn parse_config(text: &str) -> anyhow::Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(text).context("parse config toml")?;
    let name = cfg.workspace.name.as_str();
    if !valid_name(name) {
        return Err(anyhow!(
            "workspace.name must be a non-empty identifier (letters, digits, - _ .), got {:?}",
            cfg.workspace.name
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for f in &cfg.files {
        if !seen.insert(f.path.as_str()) {
            return Err(anyhow!("file listed twice: {}", f.path));
        }
    }
    Ok(cfg)
}

pub fn load_config(path: &Path) -> anyhow::Result<LoadedConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let config = parse_config(&text).with_context(|| format!("config: {}", path.display()))?;
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Ok(LoadedConfig { path, config })
}

const DEFAULT_CONFIG_TEXT: &str = r#"[workspace]
name = "my_mod"
# Directory holding the mod's original files. Relative to this file.
mod_path = "mods/my_mod"
work_directory = "translation_work"
memory_directory = "hybrid_memory"

[translate]
max_retries = 3
similarity_threshold = 0.7
similar_results = 3
prompt_examples = 3
max_text_chars = 4000
persist_every = 10
normalize_punctuation = true
term_word_boundary = false
target_language = "Simplified Chinese"
game = "Starsector"

[prompts]
system = "prompts/system.txt"
user = "prompts/user.txt"

# Files are translated in the order listed.
# [[files]]
# path = "data/strings/descriptions.csv"
# type = "csv"
# description = "ship and weapon descriptions"
"#;

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(DEFAULT_CONFIG_FILENAME);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;
    for (fname, body) in default_prompt_files() {
        let p = prompts_dir.join(fname);
        if p.exists() && !force {
            continue;
        }
        std::fs::write(&p, body).with_context(|| format!("write prompt: {}", p.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TEXT)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}
