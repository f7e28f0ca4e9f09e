//! Configuration models for surveyor.
//!
//! Every field has a default, so a run works without a config file and a
//! file only needs the values it wants to change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted with the trimmed prompt in templates.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Top-level configuration for surveyor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inference endpoint
    pub endpoint: EndpointConfig,

    /// Annotation run settings
    pub annotation: AnnotationConfig,

    /// Column names in the source table and snapshot
    pub columns: ColumnConfig,

    /// Labels recognised in model output
    pub extraction: ExtractionConfig,

    /// Prompt templates
    pub templates: TemplateConfig,

    /// Adjacency-matrix export
    pub network: NetworkConfig,
}

/// Inference endpoint configuration.
///
/// The endpoint speaks the Ollama generate API: `POST {base_url}/api/generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of the inference server
    pub base_url: String,

    /// Model identifier as loaded on the server (e.g. "llama3.1:latest")
    pub model: String,

    /// Request timeout in seconds; unset means the transport default
    pub timeout_secs: Option<u64>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:latest".to_string(),
            timeout_secs: None,
        }
    }
}

/// Annotation run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Source table with one prompt per row
    pub input: PathBuf,

    /// Durable snapshot of processed rows (checkpoint)
    pub snapshot: PathBuf,

    /// Optional copy of the full source table with answers filled in
    pub merged_output: Option<PathBuf>,

    /// Save the snapshot after rows whose index is a multiple of this
    pub autosave_interval: usize,

    /// Request a rationale for rows whose index is a multiple of this
    pub rationale_interval: usize,

    /// Delay after every inference call, in milliseconds
    pub pacing_delay_ms: u64,

    /// Re-send rows whose checkpointed answer is empty
    pub retry_empty_answers: bool,

    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("questionnaires.csv"),
            snapshot: PathBuf::from("questionnaires_with_answers.csv"),
            merged_output: None,
            autosave_interval: 10,
            rationale_interval: 5,
            pacing_delay_ms: 1000,
            retry_empty_answers: false,
            show_progress: true,
        }
    }
}

impl AnnotationConfig {
    /// Pacing delay as a `Duration`.
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}

/// Column names shared by the source table and the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub prompt: String,
    pub answer: String,
    pub rationale: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            prompt: "Prompt".to_string(),
            answer: "Risposta numerica".to_string(),
            rationale: "Motivazione".to_string(),
        }
    }
}

/// Labels the extractor looks for, matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Line prefixes introducing the numeric answer
    pub answer_labels: Vec<String>,

    /// Markers introducing the rationale
    pub reasoning_labels: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            answer_labels: vec!["answer:".to_string()],
            reasoning_labels: vec!["reasoning:".to_string()],
        }
    }
}

/// Prompt templates; `{prompt}` is replaced by the trimmed prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Used when only the numeric answer is wanted
    pub answer_only: String,

    /// Used when a rationale is sampled for the row
    pub with_reasoning: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            answer_only: "{prompt}\n\n\
                Respond with a single integer only. Do not add any other text."
                .to_string(),
            with_reasoning: "{prompt}\n\n\
                Respond using exactly this format:\n\
                Answer: <a single integer>\n\
                Reasoning: <a short explanation of the answer>"
                .to_string(),
        }
    }
}

/// Adjacency-matrix export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Long-format ratings table
    pub input: PathBuf,

    /// Directory receiving one CSV per matrix
    pub output_dir: PathBuf,

    /// Weighted values at or above this become 1 in the binary matrix
    pub threshold: f64,

    pub from_column: String,
    pub to_column: String,
    pub question_column: String,
    pub score_column: String,

    /// Network name → question codes
    pub networks: BTreeMap<String, Vec<String>>,

    /// Networks whose weighted matrix is already binary
    pub binary_networks: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let codes = |prefix: &str, n: usize| -> Vec<String> {
            (1..=n).map(|i| format!("{prefix}_{i:02}")).collect()
        };

        let mut networks = BTreeMap::new();
        networks.insert("CC".to_string(), codes("CC", 4));
        networks.insert("EC".to_string(), codes("EC", 5));
        networks.insert("CM".to_string(), codes("CM", 2));
        networks.insert("FR".to_string(), codes("FR", 1));

        Self {
            input: PathBuf::from("ratings.csv"),
            output_dir: PathBuf::from("matrices"),
            threshold: 2.5,
            from_column: "Cod profilo rispondente".to_string(),
            to_column: "Cod profilo valutato".to_string(),
            question_column: "Codice domanda".to_string(),
            score_column: "Risposta numerica".to_string(),
            networks,
            binary_networks: vec!["FR".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Load from `path` if given, else from `default_path` when it exists,
    /// else fall back to built-in defaults.
    pub fn load(path: Option<&Path>, default_path: &Path) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None if default_path.exists() => Self::from_file(default_path),
            None => Ok(Self::default()),
        }
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let annotation = &self.annotation;
        if annotation.autosave_interval == 0 {
            return Err(ConfigError::Invalid(
                "annotation.autosave_interval must be at least 1".to_string(),
            ));
        }
        if annotation.rationale_interval == 0 {
            return Err(ConfigError::Invalid(
                "annotation.rationale_interval must be at least 1".to_string(),
            ));
        }

        for (name, template) in [
            ("templates.answer_only", &self.templates.answer_only),
            ("templates.with_reasoning", &self.templates.with_reasoning),
        ] {
            if !template.contains(PROMPT_PLACEHOLDER) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must contain the {PROMPT_PLACEHOLDER} placeholder"
                )));
            }
        }

        let labels = &self.extraction;
        if labels.answer_labels.iter().all(|l| l.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "extraction.answer_labels must contain at least one label".to_string(),
            ));
        }
        if labels.reasoning_labels.iter().all(|l| l.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "extraction.reasoning_labels must contain at least one label".to_string(),
            ));
        }

        if !self.network.threshold.is_finite() {
            return Err(ConfigError::Invalid(
                "network.threshold must be a finite number".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.annotation.autosave_interval, 10);
        assert_eq!(config.columns.prompt, "Prompt");
        assert_eq!(config.network.networks["EC"].len(), 5);
        assert_eq!(config.network.networks["CC"][0], "CC_01");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[endpoint]
model = "llama3:latest"

[annotation]
autosave_interval = 25
pacing_delay_ms = 0
"#,
        )
        .unwrap();

        assert_eq!(config.endpoint.model, "llama3:latest");
        assert_eq!(config.endpoint.base_url, "http://localhost:11434");
        assert_eq!(config.annotation.autosave_interval, 25);
        assert_eq!(config.annotation.rationale_interval, 5);
        assert_eq!(config.annotation.pacing_delay(), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.annotation.autosave_interval = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_template_without_placeholder() {
        let mut config = Config::default();
        config.templates.answer_only = "Give a number".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_default_path_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(None, &dir.path().join("surveyor.toml")).unwrap();
        assert_eq!(config.endpoint.model, "llama3.1:latest");

        let explicit = Config::load(Some(&dir.path().join("missing.toml")), Path::new("x"));
        assert!(matches!(explicit, Err(ConfigError::FileRead { .. })));
    }
}
