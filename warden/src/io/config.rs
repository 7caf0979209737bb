//! Engine configuration stored under `<var>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderConfig,
    pub fingerprint: FingerprintConfig,

    /// Maximum number of run ids retained in the global run index.
    pub run_index_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Total live-call attempts for transient provider failures.
    pub max_attempts: u32,

    /// First backoff delay; doubles per retry.
    pub backoff_base_ms: u64,

    /// Per-agent live-call timeout in seconds.
    pub timeout_secs: u64,

    /// Maximum tokens requested from the provider.
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Directory names skipped during the fingerprint walk.
    pub ignore_dirs: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            timeout_secs: 300,
            max_tokens: 4_096,
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: [
                ".git",
                "var",
                "target",
                "node_modules",
                "__pycache__",
                ".venv",
                "venv",
                ".idea",
                ".vscode",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            fingerprint: FingerprintConfig::default(),
            run_index_cap: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.provider.max_attempts == 0 {
            return Err(anyhow!("provider.max_attempts must be > 0"));
        }
        if self.provider.backoff_base_ms == 0 {
            return Err(anyhow!("provider.backoff_base_ms must be > 0"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.fingerprint.ignore_dirs.is_empty() {
            return Err(anyhow!("fingerprint.ignore_dirs must not be empty"));
        }
        if self.run_index_cap == 0 {
            return Err(anyhow!("run_index_cap must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
