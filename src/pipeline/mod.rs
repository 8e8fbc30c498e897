pub mod extract;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod runner;

pub use extract::{ExtractorRegistry, FileSpec, FileType, UnitApplier, UnitExtractor};
pub use model::{ModelInvoker, ModelReply};
pub use orchestrator::{ApplyReport, FileOutcome, Orchestrator, PipelineError, RunReport};
pub use runner::TranslationRunner;
