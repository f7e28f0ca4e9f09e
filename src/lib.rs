//! surveyor - Resumable LLM annotation of survey questionnaires.
//!
//! ## Architecture
//!
//! - **InferenceClient**: one completion per prompt from an Ollama-style endpoint
//! - **ResponseExtractor**: pulls a numeric answer and optional rationale out of free text
//! - **CheckpointStore**: snapshot of results keyed by prompt text, saved atomically
//! - **AnnotationDriver**: sequential row loop with rationale sampling, periodic
//!   autosave, pacing, and a final flush on every exit path
//!
//! ## Pipelines
//!
//! - **Annotate**: Source table → merge snapshot → complete → extract → record
//! - **Network**: Long-format ratings → weighted and binary adjacency matrices
//!
//! A run can be interrupted and restarted any number of times: rows already in
//! the snapshot are never sent again.

pub mod checkpoint;
pub mod client;
pub mod extract;
pub mod models;
pub mod pipeline;
pub mod table;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, FileCheckpointStore};
pub use client::{InferenceClient, OllamaClient, PromptTemplates};
pub use extract::ResponseExtractor;
pub use models::{Config, Result, RunOutcome, RunReport, SurveyorError};
pub use pipeline::{AnnotationDriver, AnnotationPipeline, NetworkBuilder};
