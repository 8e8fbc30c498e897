use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::PromptsSection;
use crate::memory::ScoredMatch;
use crate::terminology::{self, TermMatch};
use crate::unit::TranslationUnit;

pub const DEFAULT_PROMPTS_DIR: &str = "prompts";
pub const DEFAULT_SYSTEM: &str = "system.txt";
pub const DEFAULT_USER: &str = "user.txt";

pub const DEFAULT_SYSTEM_TEXT: &str = include_str!("../../prompts/system.txt");
pub const DEFAULT_USER_TEXT: &str = include_str!("../../prompts/user.txt");

#[derive(Clone, Debug)]
pub struct PromptSet {
    pub system: String,
    pub user: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_TEXT.to_string(),
            user: DEFAULT_USER_TEXT.to_string(),
        }
    }
}

/// Everything the user prompt is rendered from.
pub struct PromptInput<'a> {
    pub unit: &'a TranslationUnit,
    pub encoded: &'a str,
    pub similar: &'a [ScoredMatch],
    pub terms: &'a [TermMatch],
    pub file_type: &'a str,
}

impl PromptSet {
    /// Explicit paths must exist. Without one, `prompts/<name>` next to the
    /// config file is used when present, else the built-in text.
    pub fn load(config_dir: &Path, section: &PromptsSection) -> anyhow::Result<Self> {
        Ok(Self {
            system: read_prompt(
                config_dir,
                section.system.as_deref(),
                DEFAULT_SYSTEM,
                DEFAULT_SYSTEM_TEXT,
            )?,
            user: read_prompt(
                config_dir,
                section.user.as_deref(),
                DEFAULT_USER,
                DEFAULT_USER_TEXT,
            )?,
        })
    }

    pub fn render_system(&self, game: &str, target_language: &str) -> String {
        render_template(
            &self.system,
            &[("game", game), ("target_language", target_language)],
        )
    }

    pub fn render_user(&self, input: &PromptInput<'_>, max_examples: usize) -> String {
        let terms = terminology::render_for_prompt(input.terms);
        let terms = if terms.is_empty() { terms } else { format!("{terms}\n") };
        let examples = render_examples(input.similar, max_examples);
        render_template(
            &self.user,
            &[
                ("file_type", input.file_type),
                ("context", &input.unit.context),
                ("terminology", &terms),
                ("examples", &examples),
                ("text", input.encoded),
            ],
        )
    }
}

fn read_prompt(
    config_dir: &Path,
    explicit: Option<&str>,
    default_filename: &str,
    builtin: &str,
) -> anyhow::Result<String> {
    let path = match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(rel) => {
            let mut p = PathBuf::from(rel);
            if p.is_relative() {
                p = config_dir.join(&p);
            }
            if !p.exists() {
                return Err(anyhow!(
                    "prompt file not found: {} (run: mod-translator init)",
                    p.display()
                ));
            }
            p
        }
        None => {
            let p = config_dir.join(DEFAULT_PROMPTS_DIR).join(default_filename);
            if !p.exists() {
                return Ok(builtin.to_string());
            }
            p
        }
    };
    std::fs::read_to_string(&path).with_context(|| format!("read prompt: {}", path.display()))
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        let pat = format!("{{{{{k}}}}}");
        out = out.replace(&pat, v);
    }
    out
}

/// Past translations as source/target pairs, approved text preferred.
pub fn render_examples(similar: &[ScoredMatch], max_examples: usize) -> String {
    if similar.is_empty() || max_examples == 0 {
        return String::new();
    }
    let mut out = String::from("Similar past translations:\n");
    for m in similar.iter().take(max_examples) {
        out.push_str("Source: ");
        out.push_str(&m.unit.original_text);
        out.push_str("\nTarget: ");
        out.push_str(m.unit.effective_translation());
        out.push_str("\n\n");
    }
    out
}

pub fn default_prompt_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (DEFAULT_SYSTEM, DEFAULT_SYSTEM_TEXT),
        (DEFAULT_USER, DEFAULT_USER_TEXT),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminology::MatchKind;

    fn scored(text: &str, translation: &str, approved: Option<&str>) -> ScoredMatch {
        let mut unit = TranslationUnit::new("a.csv", text, "");
        unit.translation = translation.to_string();
        if let Some(a) = approved {
            unit.approved = true;
            unit.approved_text = a.to_string();
        }
        ScoredMatch { unit, similarity: 0.9 }
    }

    #[test]
    fn template_substitutes_all_occurrences() {
        assert_eq!(render_template("{{a}}-{{b}}-{{a}}", &[("a", "x"), ("b", "y")]), "x-y-x");
        assert_eq!(render_template("{{missing}}", &[]), "{{missing}}");
    }

    #[test]
    fn examples_prefer_approved_text_and_respect_limit() {
        let similar = vec![
            scored("Fleet", "舰队", Some("舰群")),
            scored("Station", "空间站", None),
            scored("Ship", "船", None),
        ];
        let block = render_examples(&similar, 2);
        assert!(block.contains("Source: Fleet\nTarget: 舰群"));
        assert!(block.contains("Target: 空间站"));
        assert!(!block.contains("Ship"));
        assert_eq!(render_examples(&similar, 0), "");
    }

    #[test]
    fn user_prompt_carries_hints_and_encoded_text() {
        let unit = TranslationUnit::new("a.csv", "Hegemony fleet deals %d", "description");
        let terms = vec![TermMatch {
            term: "Hegemony".to_string(),
            translation: "霸主".to_string(),
            domain: "general".to_string(),
            notes: String::new(),
            kind: MatchKind::ExactCase,
            similarity: 1.0,
        }];
        let similar = vec![scored("Hegemony fleet", "霸主舰队", None)];
        let prompt = PromptSet::default().render_user(
            &PromptInput {
                unit: &unit,
                encoded: "Hegemony fleet deals ${1}",
                similar: &similar,
                terms: &terms,
                file_type: "csv",
            },
            3,
        );
        assert!(prompt.contains("[Context] description"));
        assert!(prompt.contains("- Hegemony => 霸主"));
        assert!(prompt.contains("Target: 霸主舰队"));
        assert!(prompt.contains("Text to translate: Hegemony fleet deals ${1}"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn load_prefers_files_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let set = PromptSet::load(dir.path(), &PromptsSection::default()).unwrap();
        assert_eq!(set.system, DEFAULT_SYSTEM_TEXT);

        std::fs::create_dir_all(dir.path().join(DEFAULT_PROMPTS_DIR)).unwrap();
        std::fs::write(dir.path().join("prompts/user.txt"), "custom {{text}}").unwrap();
        let set = PromptSet::load(dir.path(), &PromptsSection::default()).unwrap();
        assert_eq!(set.user, "custom {{text}}");

        let section = PromptsSection {
            system: Some("nope.txt".to_string()),
            user: None,
        };
        assert!(PromptSet::load(dir.path(), &section).is_err());
    }
}
