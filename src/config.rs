//! Engine configuration (ambient stack §2.1), loaded from TOML.
//!
//! Mirrors the teacher's `io/config.rs`: a `serde`-derived struct with
//! `Default`, a `from_str`/`load` pair, `validate`, and an atomic
//! temp-file-then-rename `write`, plus field-level doc comments that double
//! as the reference for operators hand-editing the file.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Tunables that are not part of any single tree/run's data but govern how
/// the engine executes steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard ceiling on retry attempts even when a node's own `maxRetries` is
    /// higher; guards against a misconfigured tree looping forever.
    pub max_retry_ceiling: u32,

    /// Character budget for the context-handoff envelope's head-tail
    /// truncation (§4.8).
    pub context_truncation_chars: usize,

    /// Byte budget for a serialized diagnostics payload before the shedding
    /// policy in §4.9 kicks in (events, then error stack, then `truncated`).
    pub diagnostics_max_bytes: usize,

    /// Default per-step provider timeout when `RunOptions.timeout_secs` is
    /// unset.
    pub default_provider_timeout_secs: u64,

    /// Schema version stamped into context-handoff envelopes (§4.8).
    pub context_envelope_policy_version: u32,

    /// Schema version stamped into diagnostics payloads (§4.9).
    pub diagnostics_schema_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retry_ceiling: 5,
            context_truncation_chars: 8_000,
            diagnostics_max_bytes: 64_000,
            default_provider_timeout_secs: 600,
            context_envelope_policy_version: 1,
            diagnostics_schema_version: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Load config from a TOML file. If the file is missing, returns
    /// [`EngineConfig::default`].
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config = Self::from_toml_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Atomically write config to disk (temp file + rename).
    pub fn write(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        self.validate()?;
        let mut buf = toml::to_string_pretty(self).context("serialize config toml")?;
        buf.push('\n');
        write_atomic(path.as_ref(), &buf)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.context_truncation_chars == 0 {
            return Err(anyhow!("context_truncation_chars must be > 0"));
        }
        if self.diagnostics_max_bytes == 0 {
            return Err(anyhow!("diagnostics_max_bytes must be > 0"));
        }
        if self.default_provider_timeout_secs == 0 {
            return Err(anyhow!("default_provider_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_budgets() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retry_ceiling, 5);
        assert_eq!(config.context_envelope_policy_version, 1);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = EngineConfig::from_toml_str("max_retry_ceiling = 2\n").unwrap();
        assert_eq!(config.max_retry_ceiling, 2);
        assert_eq!(
            config.context_truncation_chars,
            EngineConfig::default().context_truncation_chars
        );
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::load(temp.path().join("missing.toml")).expect("load");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let config = EngineConfig {
            max_retry_ceiling: 3,
            ..EngineConfig::default()
        };
        config.write(&path).expect("write");
        let loaded = EngineConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn validate_rejects_zero_truncation_budget() {
        let config = EngineConfig {
            context_truncation_chars: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
