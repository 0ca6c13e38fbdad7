//! Engine configuration with validation and defaults
//!
//! Loaded from an optional TOML file, then overridden by `PARLOR_*`
//! environment variables, then validated.

use crate::errors::{ConfigurationError, EngineResult};
use crate::games::types::Variant;
use crate::money::Money;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub timing: TimingConfig,
    pub limits: LimitsConfig,
    pub settlement: SettlementConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub variants: VariantsConfig,
}

/// Phase durations in milliseconds
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub waiting_ms: u64,
    pub betting_ms: u64,
    pub dealing_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            waiting_ms: 1_000,
            betting_ms: 15_000,
            dealing_ms: 8_000,
            cooldown_ms: 4_000,
        }
    }
}

impl TimingConfig {
    pub fn waiting(&self) -> Duration {
        Duration::from_millis(self.waiting_ms)
    }

    pub fn betting(&self) -> Duration {
        Duration::from_millis(self.betting_ms)
    }

    pub fn dealing(&self) -> Duration {
        Duration::from_millis(self.dealing_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Stake bounds, in cents
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_stake: Money,
    pub max_stake: Money,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_stake: Money::from_major(1),
            max_stake: Money::from_major(10_000),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_ms: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/parlor".to_string(),
            clear_on_start: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Events buffered per push subscriber
    pub push_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            push_buffer: 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "parlor=info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VariantsConfig {
    pub enabled: Vec<Variant>,
    /// Variants that keep dealing with nobody watching
    pub always_on: Vec<Variant>,
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            enabled: Variant::ALL.to_vec(),
            always_on: Vec::new(),
        }
    }
}

pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> EngineResult<EngineConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => EngineConfig::default(),
        };

        self.apply_overrides(&mut config, |key| env::var(key).ok())?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> EngineResult<EngineConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Applies `PARLOR_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&self, config: &mut EngineConfig, lookup: F) -> EngineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "PARLOR_WAITING_MS", &mut config.timing.waiting_ms)?;
        override_parsed(&lookup, "PARLOR_BETTING_MS", &mut config.timing.betting_ms)?;
        override_parsed(&lookup, "PARLOR_DEALING_MS", &mut config.timing.dealing_ms)?;
        override_parsed(&lookup, "PARLOR_COOLDOWN_MS", &mut config.timing.cooldown_ms)?;
        override_parsed(&lookup, "PARLOR_MIN_STAKE", &mut config.limits.min_stake)?;
        override_parsed(&lookup, "PARLOR_MAX_STAKE", &mut config.limits.max_stake)?;
        override_parsed(&lookup, "PARLOR_CLEAR_ON_START", &mut config.storage.clear_on_start)?;

        if let Some(dir) = lookup("PARLOR_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Some(filter) = lookup("PARLOR_LOG") {
            config.logging.filter = filter;
        }
        if let Some(list) = lookup("PARLOR_ALWAYS_ON") {
            config.variants.always_on = parse_variants("PARLOR_ALWAYS_ON", &list)?;
        }

        Ok(())
    }

    pub fn validate(&self, config: &EngineConfig) -> EngineResult<()> {
        let timing = &config.timing;
        for (field, value) in [
            ("timing.betting_ms", timing.betting_ms),
            ("timing.dealing_ms", timing.dealing_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "0", "Phase duration cannot be zero"));
            }
        }

        let limits = &config.limits;
        if !limits.min_stake.is_positive() {
            return Err(invalid(
                "limits.min_stake",
                &limits.min_stake.to_string(),
                "Minimum stake must be positive",
            ));
        }
        if limits.max_stake < limits.min_stake {
            return Err(invalid(
                "limits.max_stake",
                &limits.max_stake.to_string(),
                "Maximum stake is below the minimum",
            ));
        }

        if config.settlement.max_attempts == 0 {
            return Err(invalid("settlement.max_attempts", "0", "At least one attempt is required"));
        }

        if config.storage.data_directory.is_empty() {
            return Err(ConfigurationError::ValidationFailed("storage.data_directory is required".to_string()).into());
        }

        if config.variants.enabled.is_empty() {
            return Err(ConfigurationError::ValidationFailed("no variants enabled".to_string()).into());
        }
        if let Some(v) = config
            .variants
            .always_on
            .iter()
            .find(|v| !config.variants.enabled.contains(v))
        {
            return Err(invalid("variants.always_on", v.as_str(), "Variant is not enabled"));
        }

        Ok(())
    }

    pub fn save(&self, config: &EngineConfig, path: &str) -> EngineResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::errors::EngineError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn override_parsed<T, F>(lookup: &F, key: &str, target: &mut T) -> EngineResult<()>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| invalid(key, &raw, "Unparseable value"))?;
    }
    Ok(())
}

/// Comma separated variant names or codes
pub fn parse_variants(field: &str, list: &str) -> EngineResult<Vec<Variant>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Variant>().map_err(|reason| invalid(field, s, &reason)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.timing.betting_ms, 15_000);
        assert_eq!(config.variants.enabled.len(), 3);
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_limits() {
        let loader = ConfigLoader::new();
        let mut config = EngineConfig::default();
        config.limits.max_stake = Money::from_cents(50);
        assert!(loader.validate(&config).is_err());

        let mut config = EngineConfig::default();
        config.variants.enabled = vec![Variant::DragonTiger];
        config.variants.always_on = vec![Variant::LuckySeven];
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PARLOR_BETTING_MS", "2500"),
            ("PARLOR_MAX_STAKE", "500.00"),
            ("PARLOR_ALWAYS_ON", "dt, lucky_seven"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        ConfigLoader::new()
            .apply_overrides(&mut config, |k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.timing.betting_ms, 2_500);
        assert_eq!(config.limits.max_stake, Money::from_major(500));
        assert_eq!(config.variants.always_on, vec![Variant::DragonTiger, Variant::LuckySeven]);
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut config = EngineConfig::default();
        let err = ConfigLoader::new()
            .apply_overrides(&mut config, |k| (k == "PARLOR_DEALING_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PARLOR_DEALING_MS"));
    }

    #[test]
    fn test_save_and_load_config() -> EngineResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut original = EngineConfig::default();
        original.variants.always_on = vec![Variant::AndarBahar];
        ConfigLoader::new().save(&original, path)?;

        let mut loaded = ConfigLoader::new().load_from_file(path)?;
        ConfigLoader::new().apply_overrides(&mut loaded, |_| None)?;
        assert_eq!(loaded, original);
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig = toml::from_str("[timing]\nbetting_ms = 500\n").unwrap();
        assert_eq!(config.timing.betting_ms, 500);
        assert_eq!(config.timing.dealing_ms, 8_000);
        assert_eq!(config.limits, LimitsConfig::default());
    }

    #[test]
    fn test_cache_section_only_sizes_push_buffer() {
        // files written before the snapshot cache size was dropped still load
        let config: EngineConfig = toml::from_str("[cache]
capacity = 8
push_buffer = 32
").unwrap();
        assert_eq!(config.cache.push_buffer, 32);

        let written = toml::to_string(&EngineConfig::default()).unwrap();
        assert!(written.contains("push_buffer"));
        assert!(!written.contains("capacity"));
    }
}
