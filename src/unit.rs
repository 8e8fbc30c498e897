use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn default_true() -> bool {
    true
}

/// One extracted translatable string occurrence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationUnit {
    #[serde(default)]
    pub file_name: String,
    #[serde(alias = "original")]
    pub original_text: String,
    /// Placeholder-encoded form of `original_text`.
    #[serde(default)]
    pub process_text: String,
    #[serde(default)]
    pub translation: String,
    /// Free-form locator: field name, JSON path or calling function.
    #[serde(default)]
    pub context: String,
    /// Heuristic flag: the text is likely an identifier rather than prose.
    #[serde(default)]
    pub dangerous: bool,
    #[serde(default)]
    pub is_translated: bool,
    #[serde(default = "default_true")]
    pub is_suggested_to_translate: bool,
    #[serde(default, alias = "model_reason")]
    pub llm_reason: String,
    #[serde(default)]
    pub translation_key: String,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub approved_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TranslationUnit {
    pub fn new(
        file_name: impl Into<String>,
        original_text: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            original_text: original_text.into(),
            context: context.into(),
            is_suggested_to_translate: true,
            ..Self::default()
        }
    }

    /// Assigns the derived key when the extractor left it empty. Returns the key.
    pub fn ensure_key(&mut self) -> &str {
        if self.translation_key.is_empty() {
            self.translation_key =
                derive_translation_key(&self.file_name, &self.context, &self.original_text);
        }
        &self.translation_key
    }

    /// The text a reviewer settled on, falling back to the model output.
    #[must_use]
    pub fn effective_translation(&self) -> &str {
        if self.approved && !self.approved_text.is_empty() {
            &self.approved_text
        } else {
            &self.translation
        }
    }

    /// Marks the unit as passed through untranslated.
    pub fn pass_through(&mut self, reason: impl Into<String>) {
        self.translation = self.original_text.clone();
        self.is_translated = false;
        self.is_suggested_to_translate = false;
        self.llm_reason = reason.into();
    }
}

/// Stable key for one logical occurrence (same file, locator and text).
pub fn derive_translation_key(file_name: &str, context: &str, original_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.as_bytes());
    hasher.update([0u8]);
    hasher.update(original_text.as_bytes());
    hex::encode(hasher.finalize())
}
