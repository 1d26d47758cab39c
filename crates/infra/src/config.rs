//! Engine configuration.
//!
//! Layered: built-in defaults, then an optional `config/engine.{toml,yaml,json}`
//! file, then `CAMPUSRES_*` environment variables
//! (e.g. `CAMPUSRES_EXTENSION__MAX_HOURS=2.0`).

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;

use campusres_requests::{
    DAILY_EXTENSION_BUDGET_HOURS, ExtensionPolicy, MAX_EXTENSION_HOURS, MIN_EXTENSION_HOURS,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub daily_budget_hours: f64,
    pub min_hours: f64,
    pub max_hours: f64,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            daily_budget_hours: DAILY_EXTENSION_BUDGET_HOURS,
            min_hours: MIN_EXTENSION_HOURS,
            max_hours: MAX_EXTENSION_HOURS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Extra attempts after a lost optimistic-concurrency race.
    pub conflict_retries: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { conflict_retries: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub extension: ExtensionConfig,
    pub concurrency: ConcurrencyConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from `config/engine` (optional) and the environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("config/engine")
    }

    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("CAMPUSRES")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read engine configuration from {path}"))?;

        let loaded: EngineConfig = config
            .try_deserialize()
            .context("invalid engine configuration")?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let ext = &self.extension;
        anyhow::ensure!(
            ext.min_hours > 0.0 && ext.min_hours <= ext.max_hours,
            "extension.min_hours must be positive and not above extension.max_hours"
        );
        anyhow::ensure!(
            ext.daily_budget_hours >= ext.max_hours,
            "extension.daily_budget_hours must allow at least one maximal extension"
        );
        Ok(())
    }

    pub fn extension_policy(&self) -> ExtensionPolicy {
        ExtensionPolicy {
            min_hours: self.extension.min_hours,
            max_hours: self.extension.max_hours,
            daily_budget_hours: self.extension.daily_budget_hours,
        }
    }

    /// Install the JSON tracing subscriber with `logging.level` as the
    /// fallback filter.
    pub fn init_logging(&self) {
        campusres_observability::init_with_level(&self.logging.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_domain_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.extension_policy(), ExtensionPolicy::default());
        assert_eq!(cfg.concurrency.conflict_retries, 1);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = EngineConfig::load_from("config/does-not-exist").unwrap();
        assert_eq!(cfg.extension, ExtensionConfig::default());
    }

    #[test]
    fn inconsistent_limits_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.extension.min_hours = 4.0;
        assert!(cfg.validate().is_err());
    }
}
