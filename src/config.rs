//! Policy file loading.
//!
//! Every section and field is optional; anything omitted falls back to the
//! defaults below.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::{
    issues::IssueConfig, rate_limit::RateLimitConfig, retry::RetryConfig, safety::SafetyConfig,
    trust::TrustPolicy,
};

pub const DEFAULT_CONFIG_PATH: &str = ".github/prshepherd.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Pause between pull requests within one cycle.
    pub pacing_ms: u64,
    /// Comment on PRs whose checks show mixed status.
    pub comment_on_mixed_status: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pacing_ms: 1000,
            comment_on_mixed_status: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub trust: TrustPolicy,
    pub safety: SafetyConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub reconcile: ReconcileConfig,
    pub issues: IssueConfig,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse policy file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limit.increment_secs == 0 {
            anyhow::bail!("rate_limit.increment_secs must be at least 1");
        }
        if let crate::rate_limit::Backoff::Exponential { max_secs: 0 } = self.rate_limit.backoff {
            anyhow::bail!("rate_limit.backoff.max_secs must be at least 1");
        }
        Ok(())
    }

    /// Loads the policy file. An explicit path must exist; the default path
    /// is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            if explicit.is_some() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            debug!(path = %path.display(), "No policy file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }
}
