//! Error types for surveyor.
//!
//! Taxonomy:
//! - Expected failures: bad configuration, unreadable input tables
//! - Infrastructure failures: inference endpoint, disk
//! - Internal invariant violations (bugs)

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for surveyor.
#[derive(Debug, Error)]
pub enum SurveyorError {
    // ═══════════════════════════════════════════════════════════════════
    // Expected failures
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // Infrastructure failures
    // ═══════════════════════════════════════════════════════════════════

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Table error: {context}: {source}")]
    Table {
        context: String,
        #[source]
        source: csv::Error,
    },

    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single completion request.
///
/// Never fatal for a run: the driver records an empty answer and moves on.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Endpoint returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl SurveyorError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a table (CSV) error with context.
    pub fn table(context: impl Into<String>, source: csv::Error) -> Self {
        Self::Table {
            context: context.into(),
            source,
        }
    }
}

impl InferenceError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Result type alias for surveyor.
pub type Result<T> = std::result::Result<T, SurveyorError>;
