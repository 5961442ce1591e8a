//! Pipeline definitions and execution settings.
//!
//! A pipeline is a serializable description of a run:
//! - Input: where records come from
//! - Steps: named mappings to chain, with options
//! - Output: where records go
//! - Execution: how the environment runs jobs
//!
//! Pipelines can be written in JSON, YAML, or TOML.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Options passed to a mapping factory.
pub type Options = IndexMap<String, serde_json::Value>;

/// What the environment does when a mapping panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanicPolicy {
    /// Abort the run; the panic is not resumable.
    #[default]
    Fatal,
    /// Treat the panic like any other per-record failure.
    Isolate,
}

/// Settings for an [`Environment`](crate::Environment).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Worker count. `None` or `1` runs jobs inline; `0` uses every
    /// available core.
    pub parallelism: Option<usize>,
    /// Evict failed jobs after notifying listeners instead of holding the
    /// run open until they are resolved.
    pub drop_failed_tasks: bool,
    /// How panics inside mappings are handled.
    pub panic_policy: PanicPolicy,
}

/// A pipeline definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    /// Input location.
    #[serde(default)]
    pub input: Option<String>,

    /// Output location.
    #[serde(default)]
    pub output: Option<String>,

    /// Mappings to chain, first stage first.
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Execution settings.
    #[serde(default)]
    pub execution: EnvironmentConfig,
}

/// A step in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Name of the mapping to use.
    pub mapping: String,

    /// Options for this mapping.
    #[serde(default)]
    pub options: Options,
}

impl Step {
    /// Create a step without options.
    pub fn new(mapping: impl Into<String>) -> Self {
        Self {
            mapping: mapping.into(),
            options: Options::new(),
        }
    }

    /// Set an option.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }
}

impl Pipeline {
    /// Create a new empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the input location.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Add a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Set the output location.
    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Set the execution settings.
    pub fn execution(mut self, execution: EnvironmentConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Parse a pipeline from bytes, detecting the format from `path`.
    ///
    /// Falls back to YAML when the extension is unknown.
    pub fn from_bytes(data: &[u8], path: Option<&str>) -> Result<Self, PipelineError> {
        let format = path
            .and_then(detect_format)
            .unwrap_or_else(|| "yaml".to_string());

        Self::from_bytes_format(data, &format)
    }

    /// Parse a pipeline from bytes with explicit format.
    pub fn from_bytes_format(data: &[u8], format: &str) -> Result<Self, PipelineError> {
        match format {
            "json" => serde_json::from_slice(data).map_err(|e| PipelineError::Parse(e.to_string())),
            "yaml" | "yml" => {
                serde_yaml::from_slice(data).map_err(|e| PipelineError::Parse(e.to_string()))
            }
            "toml" => {
                let s = std::str::from_utf8(data)
                    .map_err(|e| PipelineError::Parse(format!("Invalid UTF-8: {}", e)))?;
                toml::from_str(s).map_err(|e| PipelineError::Parse(e.to_string()))
            }
            _ => Err(PipelineError::UnsupportedFormat(format.to_string())),
        }
    }

    /// Serialize the pipeline to bytes.
    pub fn to_bytes(&self, format: &str) -> Result<Vec<u8>, PipelineError> {
        match format {
            "json" => serde_json::to_vec_pretty(self)
                .map_err(|e| PipelineError::Serialize(e.to_string())),
            "yaml" | "yml" => serde_yaml::to_string(self)
                .map(|s| s.into_bytes())
                .map_err(|e| PipelineError::Serialize(e.to_string())),
            "toml" => toml::to_string_pretty(self)
                .map(|s| s.into_bytes())
                .map_err(|e| PipelineError::Serialize(e.to_string())),
            _ => Err(PipelineError::UnsupportedFormat(format.to_string())),
        }
    }
}

/// Errors related to pipeline definitions.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to parse pipeline: {0}")]
    Parse(String),

    #[error("failed to serialize pipeline: {0}")]
    Serialize(String),

    #[error("unsupported pipeline format: {0}")]
    UnsupportedFormat(String),
}

/// Detect format from file path extension.
fn detect_format(path: &str) -> Option<String> {
    let ext = path.rsplit('.').next()?;
    match ext.to_lowercase().as_str() {
        "json" => Some("json".into()),
        "yaml" | "yml" => Some("yaml".into()),
        "toml" => Some("toml".into()),
        _ => None,
    }
}
