//! Configuration stored in `config.toml` under the user config directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::ApplyMode;

/// Top-level configuration (TOML).
///
/// Missing fields default to usable values; only the API key has no default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub workflow: WorkflowSettings,
}

/// Connection settings for the primary and fixer models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    pub model: String,
    /// Cheaper model used only to repair malformed structured output.
    pub fixer_model: String,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            fixer_model: "gpt-4o-mini".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Fail unless every field needed for a request is present.
    pub fn ensure_complete(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("backend.api_key", &self.api_key),
            ("backend.base_url", &self.base_url),
            ("backend.model", &self.model),
            ("backend.fixer_model", &self.fixer_model),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(key, _)| key)
        .collect();
        if !missing.is_empty() {
            bail!(
                "backend configuration is incomplete (missing {}); run `patchbee config set <key> <value>`",
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Copy of this config that targets the fixer model.
    pub fn for_fixer(&self) -> BackendConfig {
        BackendConfig {
            model: self.fixer_model.clone(),
            ..self.clone()
        }
    }
}

/// Defaults for `patchbee auto`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowSettings {
    pub max_iterations: u32,
    pub mode: ApplyMode,
    /// Wall-clock bound for one verification run; the command is killed after it.
    pub verify_timeout_secs: u64,
    /// Bytes of verification stdout/stderr kept for logs and retry prompts.
    pub output_limit_bytes: usize,
    pub scrub_comments: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            mode: ApplyMode::Patch,
            verify_timeout_secs: 600,
            output_limit_bytes: 100_000,
            scrub_comments: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.backend.request_timeout_secs == 0 {
            return Err(anyhow!("backend.request_timeout_secs must be > 0"));
        }
        if self.workflow.max_iterations == 0 {
            return Err(anyhow!("workflow.max_iterations must be > 0"));
        }
        if self.workflow.verify_timeout_secs == 0 {
            return Err(anyhow!("workflow.verify_timeout_secs must be > 0"));
        }
        if self.workflow.output_limit_bytes == 0 {
            return Err(anyhow!("workflow.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Set a dotted key such as `backend.model`, keeping the field's type.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<()> {
        let (section, field) = key
            .split_once('.')
            .ok_or_else(|| anyhow!("key must look like <section>.<field>, got '{key}'"))?;
        let mut doc = toml::Value::try_from(&*self).context("serialize config")?;
        let slot = doc
            .get_mut(section)
            .and_then(|s| s.get_mut(field))
            .ok_or_else(|| anyhow!("unknown config key '{key}'"))?;
        let replacement = match &*slot {
            toml::Value::Integer(_) => toml::Value::Integer(
                raw.parse()
                    .with_context(|| format!("{key} expects an integer"))?,
            ),
            toml::Value::Boolean(_) => toml::Value::Boolean(
                raw.parse()
                    .with_context(|| format!("{key} expects true or false"))?,
            ),
            _ => toml::Value::String(raw.to_string()),
        };
        *slot = replacement;
        let updated: Config = doc
            .try_into()
            .with_context(|| format!("invalid value for {key}"))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Pretty TOML with the API key masked.
    pub fn render_masked(&self) -> Result<String> {
        let mut shown = self.clone();
        shown.backend.api_key = mask_secret(&self.backend.api_key);
        toml::to_string_pretty(&shown).context("serialize config toml")
    }
}

/// Show only the first and last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        return "********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// `$XDG_CONFIG_HOME/patchbee/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| anyhow!("cannot determine config directory"))?;
    Ok(base.join("patchbee").join("config.toml"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
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

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let mut cfg = Config::default();
        cfg.backend.api_key = "sk-test".to_string();
        cfg.workflow.mode = ApplyMode::Direct;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[backend]\nmodel = \"local\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.backend.model, "local");
        assert_eq!(cfg.workflow, WorkflowSettings::default());
    }

    #[test]
    fn zero_max_iterations_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[workflow]\nmax_iterations = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn set_value_keeps_field_types() {
        let mut cfg = Config::default();
        cfg.set_value("backend.model", "gpt-x").expect("set model");
        cfg.set_value("workflow.max_iterations", "9").expect("set max");
        cfg.set_value("workflow.scrub_comments", "false").expect("set scrub");
        cfg.set_value("workflow.mode", "direct").expect("set mode");

        assert_eq!(cfg.backend.model, "gpt-x");
        assert_eq!(cfg.workflow.max_iterations, 9);
        assert!(!cfg.workflow.scrub_comments);
        assert_eq!(cfg.workflow.mode, ApplyMode::Direct);
    }

    #[test]
    fn set_value_rejects_unknown_and_invalid() {
        let mut cfg = Config::default();
        assert!(cfg.set_value("backend.nope", "x").is_err());
        assert!(cfg.set_value("model", "x").is_err());
        assert!(cfg.set_value("workflow.max_iterations", "many").is_err());
        assert!(cfg.set_value("workflow.mode", "sideways").is_err());
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn masks_api_keys() {
        assert_eq!(mask_secret("sk-1234567890abcd"), "sk-1...abcd");
        assert_eq!(mask_secret("short"), "********");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn incomplete_backend_names_missing_keys() {
        let err = BackendConfig::default().ensure_complete().unwrap_err();
        assert!(err.to_string().contains("backend.api_key"));
    }
}
