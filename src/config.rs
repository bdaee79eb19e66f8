//! Processing configuration.
//!
//! [`ProcessingConfig`] gathers the service identifiers, batching limits,
//! size ceilings and retry parameters. It can be built in code, read from
//! `DOCFLOW_*` environment variables, or (with the `yaml` feature) parsed
//! from a YAML document. Every field has a default, so partial sources work.

use crate::error::{PipelineError, Result};
use crate::preprocess::PreprocessLimits;
use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Prefix for environment variables read by [`ProcessingConfig::from_env`].
pub const ENV_PREFIX: &str = "DOCFLOW_";

/// Tunables for a processing run.
///
/// # Example
///
/// ```
/// use llm_docflow::config::ProcessingConfig;
///
/// let config = ProcessingConfig::default();
/// assert_eq!(config.max_documents_per_batch, 4);
/// assert!(config.validate().unwrap().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub region: String,
    pub model_id: String,
    /// Explicit service endpoint. Default derives from `region`.
    pub endpoint: Option<String>,

    pub max_documents_per_batch: usize,
    pub batch_delay_ms: u64,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,

    /// Per-document size ceiling in bytes (4.5 MiB).
    pub max_file_bytes: usize,
    /// Combined size of one batch in bytes (20 MiB).
    pub max_batch_bytes: usize,
    /// Page ceiling for paginated documents.
    pub max_pdf_pages: u32,

    /// Total service calls per exchange step, including the first.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,

    pub max_tool_rounds: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".into(),
            model_id: "us.anthropic.claude-3-7-sonnet-20250219-v1:0".into(),
            endpoint: None,
            max_documents_per_batch: 4,
            batch_delay_ms: 1000,
            max_concurrent_requests: 4,
            request_timeout_secs: 30,
            max_file_bytes: 4_718_592,
            max_batch_bytes: 20 * 1024 * 1024,
            max_pdf_pages: 50,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            backoff_multiplier: 1.5,
            max_backoff_ms: 10_000,
            max_tool_rounds: 3,
        }
    }
}

impl ProcessingConfig {
    /// Read overrides from `DOCFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`, keyed by the upper-case field name
    /// with the `DOCFLOW_` prefix (e.g. `DOCFLOW_MAX_CONCURRENT_REQUESTS`).
    /// Unset keys keep their defaults; unparsable values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("REGION") {
            config.region = v;
        }
        if let Some(v) = get("MODEL_ID") {
            config.model_id = v;
        }
        if let Some(v) = get("ENDPOINT") {
            config.endpoint = Some(v);
        }
        parse_into(&get, "MAX_DOCUMENTS_PER_BATCH", &mut config.max_documents_per_batch)?;
        parse_into(&get, "BATCH_DELAY_MS", &mut config.batch_delay_ms)?;
        parse_into(&get, "MAX_CONCURRENT_REQUESTS", &mut config.max_concurrent_requests)?;
        parse_into(&get, "REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs)?;
        parse_into(&get, "MAX_FILE_BYTES", &mut config.max_file_bytes)?;
        parse_into(&get, "MAX_BATCH_BYTES", &mut config.max_batch_bytes)?;
        parse_into(&get, "MAX_PDF_PAGES", &mut config.max_pdf_pages)?;
        parse_into(&get, "MAX_RETRIES", &mut config.max_retries)?;
        parse_into(&get, "RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms)?;
        parse_into(&get, "BACKOFF_MULTIPLIER", &mut config.backoff_multiplier)?;
        parse_into(&get, "MAX_BACKOFF_MS", &mut config.max_backoff_ms)?;
        parse_into(&get, "MAX_TOOL_ROUNDS", &mut config.max_tool_rounds)?;
        Ok(config)
    }

    /// Parse from YAML. Missing fields keep their defaults.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| PipelineError::InvalidConfig(format!("invalid YAML config: {e}")))
    }

    /// Check the configuration.
    ///
    /// Values that make a run impossible are errors. Values that are legal
    /// but likely to trigger throttling come back as warnings (and are
    /// logged).
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.max_concurrent_requests == 0 {
            return Err(PipelineError::InvalidConfig("max_concurrent_requests must be at least 1".into()));
        }
        if self.max_documents_per_batch == 0 {
            return Err(PipelineError::InvalidConfig("max_documents_per_batch must be at least 1".into()));
        }
        if self.max_file_bytes == 0 {
            return Err(PipelineError::InvalidConfig("max_file_bytes must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(PipelineError::InvalidConfig("max_retries counts the first call and must be at least 1".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(PipelineError::InvalidConfig("backoff_multiplier must be >= 1.0".into()));
        }

        let mut warnings = Vec::new();
        if self.max_documents_per_batch > 10 {
            warnings.push("max_documents_per_batch > 10 may cause throttling issues".to_string());
        }
        if self.batch_delay_ms < 500 {
            warnings.push("batch_delay_ms < 500 may not provide sufficient throttling protection".to_string());
        }
        if self.max_concurrent_requests > self.max_documents_per_batch {
            warnings.push("max_concurrent_requests should not exceed max_documents_per_batch".to_string());
        }
        for w in &warnings {
            warn!(warning = %w, "processing config");
        }
        Ok(warnings)
    }

    /// Retry policy for service calls.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            max_attempts: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_backoff_ms),
            ..BackoffConfig::throttling()
        }
    }

    pub fn preprocess_limits(&self) -> PreprocessLimits {
        PreprocessLimits {
            max_bytes: self.max_file_bytes,
            max_pages: self.max_pdf_pages,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Service endpoint: the explicit override, or the regional default.
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", self.region))
    }
}

fn parse_into<T, G>(get: &G, name: &str, slot: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *slot = raw.trim().parse().map_err(|e| {
            PipelineError::InvalidConfig(format!("{ENV_PREFIX}{name}={raw:?}: {e}"))
        })?;
    }
    Ok(())
}
