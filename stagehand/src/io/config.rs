//! Engine configuration stored in `stagehand.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;

/// Engine configuration (TOML).
///
/// Missing fields fall back to defaults, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Pass cap for every iterative section.
    pub max_iterations: u32,

    pub generator: GeneratorConfig,

    /// Retry schedule for generator calls.
    pub retry: RetryPolicy,

    /// Retry schedule for state checkpoints.
    pub state_retry: RetryPolicy,

    pub write_gate: WriteGateConfig,

    pub mutation: MutationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a prompt on stdin and prints the response (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
    /// Per-call wall-clock budget in seconds.
    pub timeout_secs: u64,
    /// Truncate captured generator output beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WriteGateConfig {
    /// Environment variable consulted on every gate check.
    pub env: Option<String>,
    /// Policy file consulted on every gate check (takes precedence over `env`).
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MutationConfig {
    /// Command that receives one change as JSON on stdin. Empty disables pushing.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for WriteGateConfig {
    fn default() -> Self {
        Self {
            env: Some("STAGEHAND_WRITE_ENABLED".to_string()),
            file: None,
        }
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            generator: GeneratorConfig::default(),
            retry: RetryPolicy::default(),
            state_retry: RetryPolicy::state_store(),
            write_gate: WriteGateConfig::default(),
            mutation: MutationConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be >= 1"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        for (name, policy) in [("retry", &self.retry), ("state_retry", &self.state_retry)] {
            if policy.max_attempts == 0 {
                return Err(anyhow!("{name}.max_attempts must be >= 1"));
            }
            if policy.multiplier == 0 {
                return Err(anyhow!("{name}.multiplier must be >= 1"));
            }
        }
        if !self.mutation.command.is_empty() && self.mutation.timeout_secs == 0 {
            return Err(anyhow!("mutation.timeout_secs must be > 0"));
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
