//! Inference client module.

mod ollama;

pub use ollama::*;
