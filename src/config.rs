use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::ai::{self, ModelSpec};

pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Provider settings handed explicitly to the LLM client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: ModelSpec,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl LlmConfig {
    /// Builds the config for `model_name`, picking the API key from the
    /// provider's environment variable. A missing key is allowed here.
    pub fn for_model(model_name: &str, timeout: Duration) -> Result<Self> {
        let model = ai::resolve_model(model_name)?;
        let api_key = env::var(model.provider.api_key_var()).ok();
        Ok(Self {
            model,
            api_key,
            timeout,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Upper bound on companies evaluated at the same time.
    pub max_parallel: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

/// Settings read from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: Option<PathBuf>,
    pub model: String,
    pub llm_timeout: Duration,
    pub max_parallel: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let db_path = env::var("FEATURIZER_DB").ok().map(PathBuf::from);
        let model = env::var("FEATURIZER_MODEL").unwrap_or_else(|_| ai::DEFAULT_MODEL.to_string());
        let timeout_secs = parse_var("FEATURIZER_LLM_TIMEOUT_SECS", DEFAULT_LLM_TIMEOUT_SECS)?;
        let max_parallel = parse_var("FEATURIZER_MAX_PARALLEL", DEFAULT_MAX_PARALLEL)?;

        Ok(Self {
            db_path,
            model,
            llm_timeout: Duration::from_secs(timeout_secs),
            max_parallel: max_parallel.max(1),
        })
    }

    pub fn llm_config(&self) -> Result<LlmConfig> {
        LlmConfig::for_model(&self.model, self.llm_timeout)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            max_parallel: self.max_parallel.max(1),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("{}: {}", raw, err))
            .with_context(|| format!("Invalid value for {}", name)),
        Err(_) => Ok(default),
    }
}
