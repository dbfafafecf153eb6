//! Configuration: a single [`HarnessConfig`] loaded from `.harness.toml` at
//! the target repo root (optional) merges with CLI flags via
//! [`CliOverrides`]. `Option` fields mean "CLI wins over config, which wins
//! over built-in default"; `bool` flags are OR'd.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::factory::DEFAULT_MAX_ATTEMPTS;
use crate::plancompile::MAX_COMPILE_ATTEMPTS;

const CONFIG_FILE_NAME: &str = ".harness.toml";

/// LLM transport defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_model() -> String {
    "gpt-5".to_string()
}

fn default_reasoning_effort() -> String {
    "medium".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            reasoning_effort: default_reasoning_effort(),
            base_url: default_base_url(),
        }
    }
}

/// Factory attempt-loop defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfigFile {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub allow_verify_exempt: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for FactoryConfigFile {
    fn default() -> Self {
        Self { max_attempts: default_max_attempts(), allow_verify_exempt: false }
    }
}

/// Plan compiler attempt-loop defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfigFile {
    #[serde(default = "default_compile_attempts")]
    pub max_compile_attempts: u32,
}

fn default_compile_attempts() -> u32 {
    MAX_COMPILE_ATTEMPTS
}

impl Default for PlannerConfigFile {
    fn default() -> Self {
        Self { max_compile_attempts: default_compile_attempts() }
    }
}

/// On-disk configuration, read from `.harness.toml` at a target repo's root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub factory: FactoryConfigFile,
    #[serde(default)]
    pub planner: PlannerConfigFile,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
}

impl HarnessConfig {
    /// Load `.harness.toml` from `repo_root`, if present.
    pub fn load_from_repo(repo_root: &Path) -> Result<Option<Self>> {
        let path = repo_root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Sanity-check the merged values; called before the config is used to
    /// build runtime options.
    pub fn validate(&self) -> Result<()> {
        if self.factory.max_attempts == 0 {
            bail!("factory.max_attempts must be greater than 0");
        }
        if self.planner.max_compile_attempts == 0 {
            bail!("planner.max_compile_attempts must be greater than 0");
        }
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }
        Ok(())
    }

    /// Merge CLI overrides on top of this config, producing the final
    /// [`RuntimeOptions`] the planner/factory entry points consume.
    ///
    /// For `Option` fields: CLI value takes precedence; falls back to
    /// config. For `bool` flags: `true` if either CLI or config enables it.
    pub fn build_runtime_options(&self, cli: CliOverrides) -> RuntimeOptions {
        RuntimeOptions {
            llm_model: cli.llm_model.unwrap_or_else(|| self.llm.model.clone()),
            reasoning_effort: cli.reasoning_effort.unwrap_or_else(|| self.llm.reasoning_effort.clone()),
            llm_base_url: cli.llm_base_url.unwrap_or_else(|| self.llm.base_url.clone()),
            max_attempts: cli.max_attempts.unwrap_or(self.factory.max_attempts),
            allow_verify_exempt: cli.allow_verify_exempt || self.factory.allow_verify_exempt,
            artifacts_dir: cli.artifacts_dir.or_else(|| self.artifacts_dir.clone()),
        }
    }
}

/// CLI overrides for merging with config-file values.
///
/// `Option` fields mean "user did not pass this flag" when `None`; `bool`
/// fields mean "user explicitly enabled this" when `true`.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub llm_model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub llm_base_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub allow_verify_exempt: bool,
    pub artifacts_dir: Option<PathBuf>,
}

/// Fully merged runtime options passed to the planner/factory.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub llm_model: String,
    pub reasoning_effort: String,
    pub llm_base_url: String,
    pub max_attempts: u32,
    pub allow_verify_exempt: bool,
    pub artifacts_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_from_repo_returns_none_when_absent() {
        let td = tempdir().unwrap();
        assert!(HarnessConfig::load_from_repo(td.path()).unwrap().is_none());
    }

    #[test]
    fn load_from_repo_parses_partial_toml_with_defaults() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join(CONFIG_FILE_NAME), "[factory]\nmax_attempts = 5\n").unwrap();
        let cfg = HarnessConfig::load_from_repo(td.path()).unwrap().unwrap();
        assert_eq!(cfg.factory.max_attempts, 5);
        assert_eq!(cfg.llm.model, default_model());
    }

    #[test]
    fn validate_rejects_zero_max_attempts() {
        let mut cfg = HarnessConfig::default();
        cfg.factory.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn build_runtime_options_cli_overrides_win() {
        let cfg = HarnessConfig::default();
        let cli = CliOverrides { max_attempts: Some(7), ..Default::default() };
        let opts = cfg.build_runtime_options(cli);
        assert_eq!(opts.max_attempts, 7);
        assert_eq!(opts.llm_model, default_model());
    }

    #[test]
    fn build_runtime_options_bools_are_ored() {
        let mut cfg = HarnessConfig::default();
        cfg.factory.allow_verify_exempt = true;
        let opts = cfg.build_runtime_options(CliOverrides::default());
        assert!(opts.allow_verify_exempt);
    }
}
