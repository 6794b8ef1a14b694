//! Run and model configuration stored in `distill.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::features::FeatureFlags;

pub const DEFAULT_BASE_URL: &str = "https://api.together.xyz/v1";
pub const DEFAULT_SUPERVISOR_MODEL: &str = "meta-llama/Llama-3.3-70B-Instruct-Turbo";
pub const DEFAULT_WORKER_MODEL: &str = "meta-llama/Llama-3.1-8B-Instruct-Turbo";
pub const DEFAULT_PYTHON_COMMAND: &str = "python3";

/// Settings for a single supervisor-worker run.
///
/// Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Hard cap on supervisor turns before the forced final turn.
    pub max_iterations: usize,

    /// Max characters of execution output shown back to the supervisor.
    pub output_limit: usize,

    /// Worker context window hint, in thousands (converted to a character budget).
    pub worker_context_k: usize,

    pub features: FeatureFlags,

    /// Replaces the flag-composed instructions when set.
    pub prompt_template: Option<String>,

    /// Directory for JSONL run logs. `None` disables run logging.
    pub log_dir: Option<PathBuf>,

    /// Interpreter command backing the execution environment (split on whitespace).
    pub python_command: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            output_limit: 2000,
            worker_context_k: 8,
            features: FeatureFlags::default(),
            prompt_template: None,
            log_dir: None,
            python_command: DEFAULT_PYTHON_COMMAND.to_string(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.output_limit == 0 {
            return Err(anyhow!("output_limit must be > 0"));
        }
        if self.worker_context_k == 0 {
            return Err(anyhow!("worker_context_k must be > 0"));
        }
        if self.python_command.split_whitespace().next().is_none() {
            return Err(anyhow!("python_command must not be empty"));
        }
        Ok(())
    }
}

/// Endpoint and sampling settings for one model role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    /// OpenAI-compatible API root (the client appends `/chat/completions`).
    pub base_url: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Environment variable holding the API key. Falls back to
    /// `OPENAI_API_KEY`, then `TOGETHER_API_KEY`.
    pub api_key_env: Option<String>,
    pub request_timeout_secs: u64,
}

impl ModelConfig {
    pub fn supervisor() -> Self {
        Self {
            model: DEFAULT_SUPERVISOR_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: Some(0.7),
            max_tokens: Some(2048),
            api_key_env: None,
            request_timeout_secs: 600,
        }
    }

    pub fn worker() -> Self {
        Self {
            model: DEFAULT_WORKER_MODEL.to_string(),
            temperature: Some(0.2),
            max_tokens: Some(512),
            ..Self::supervisor()
        }
    }

    pub fn validate(&self, role: &str) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("{role}.model must not be empty"));
        }
        if self.base_url.trim().is_empty() {
            return Err(anyhow!("{role}.base_url must not be empty"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("{role}.request_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Resolve the API key from the configured variable or the defaults.
    pub fn api_key(&self) -> Option<String> {
        let candidates: Vec<&str> = match &self.api_key_env {
            Some(name) => vec![name.as_str()],
            None => vec!["OPENAI_API_KEY", "TOGETHER_API_KEY"],
        };
        candidates
            .into_iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::supervisor()
    }
}

/// Full application config: run settings plus both model roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub run: RunConfig,
    pub supervisor: ModelConfig,
    pub worker: ModelConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            supervisor: ModelConfig::supervisor(),
            worker: ModelConfig::worker(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.run.validate()?;
        self.supervisor.validate("supervisor")?;
        self.worker.validate("worker")?;
        Ok(())
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub max_iterations: Option<usize>,
    pub output_limit: Option<usize>,
    pub worker_context_k: Option<usize>,
    pub features: Option<FeatureFlags>,
    pub prompt_template: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub supervisor_model: Option<String>,
    pub worker_model: Option<String>,
    pub base_url: Option<String>,
}

/// Apply overrides on top of `base` and validate the merged result.
pub fn apply_overrides(mut base: AppConfig, overrides: &RunOverrides) -> Result<AppConfig> {
    if let Some(max_iterations) = overrides.max_iterations {
        base.run.max_iterations = max_iterations;
    }
    if let Some(output_limit) = overrides.output_limit {
        base.run.output_limit = output_limit;
    }
    if let Some(worker_context_k) = overrides.worker_context_k {
        base.run.worker_context_k = worker_context_k;
    }
    if let Some(features) = overrides.features {
        base.run.features = features;
    }
    if let Some(template) = &overrides.prompt_template {
        base.run.prompt_template = Some(template.clone());
    }
    if let Some(log_dir) = &overrides.log_dir {
        base.run.log_dir = Some(log_dir.clone());
    }
    if let Some(model) = &overrides.supervisor_model {
        base.supervisor.model = model.clone();
    }
    if let Some(model) = &overrides.worker_model {
        base.worker.model = model.clone();
    }
    if let Some(base_url) = &overrides.base_url {
        base.supervisor.base_url = base_url.clone();
        base.worker.base_url = base_url.clone();
    }
    base.validate()?;
    Ok(base)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AppConfig::default()`.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let cfg = AppConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AppConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AppConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::Flag;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.run.max_iterations, 15);
        assert_eq!(cfg.run.output_limit, 2000);
        assert_eq!(cfg.run.worker_context_k, 8);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("distill.toml");
        let mut cfg = AppConfig::default();
        cfg.run.features = FeatureFlags::only(Flag::StructuredOutput);
        cfg.run.log_dir = Some(PathBuf::from("logs/run"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("distill.toml");
        fs::write(
            &path,
            "[run]\nmax_iterations = 4\n\n[run.features]\nsynthesis_cot = true\n\n[worker]\nmodel = \"small\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.run.max_iterations, 4);
        assert_eq!(cfg.run.output_limit, 2000);
        assert!(cfg.run.features.synthesis_cot);
        assert_eq!(cfg.worker.model, "small");
        assert_eq!(cfg.worker.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.supervisor.model, DEFAULT_SUPERVISOR_MODEL);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let cfg = RunConfig {
            max_iterations: 0,
            ..RunConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = RunOverrides {
            max_iterations: Some(3),
            features: Some(FeatureFlags::all_on()),
            base_url: Some("http://localhost:8000/v1".to_string()),
            ..RunOverrides::default()
        };
        let merged = apply_overrides(AppConfig::default(), &overrides).expect("merge");
        assert_eq!(merged.run.max_iterations, 3);
        assert_eq!(merged.run.features, FeatureFlags::all_on());
        assert_eq!(merged.supervisor.base_url, "http://localhost:8000/v1");
        assert_eq!(merged.worker.base_url, "http://localhost:8000/v1");
        assert_eq!(merged.worker.model, DEFAULT_WORKER_MODEL);
    }

    #[test]
    fn invalid_override_fails_validation() {
        let overrides = RunOverrides {
            output_limit: Some(0),
            ..RunOverrides::default()
        };
        assert!(apply_overrides(AppConfig::default(), &overrides).is_err());
    }
}
