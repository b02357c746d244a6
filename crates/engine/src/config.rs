//! Worker and serving configuration read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::evolution::EvolutionSettings;
use crate::promotion::{BackoffPolicy, OrchestratorSettings, PromotionPolicy};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the worker, the CLI and the serving surface read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub promote_delta: f64,
    pub max_drawdown_limit: f64,
    pub evolve_interval: Duration,
    pub population: usize,
    pub generations: u32,
    pub evolve_seed: u64,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    /// Opt-in: write a promoted champion's parameters back as the current configuration
    pub adopt_promoted: bool,
    pub webhook_url: Option<String>,
    pub api_port: u16,
    pub api_base_url: String,
    pub api_reload_endpoint: String,
    pub db_path: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            promote_delta: 0.02,
            max_drawdown_limit: -0.35,
            evolve_interval: Duration::from_secs(60),
            population: 6,
            generations: 2,
            evolve_seed: 42,
            backoff_floor: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            adopt_promoted: false,
            webhook_url: None,
            api_port: 8000,
            api_base_url: "http://localhost:8000".to_string(),
            api_reload_endpoint: "/reload".to_string(),
            db_path: PathBuf::from("data/organism.db"),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

impl WorkerConfig {
    /// Read from the process environment (call `dotenvy::dotenv()` first)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup; unset keys fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let api_port: u16 = parse(&lookup, "API_PORT", d.api_port)?;

        Ok(Self {
            promote_delta: parse(&lookup, "PROMOTE_DELTA", d.promote_delta)?,
            max_drawdown_limit: parse(&lookup, "MAX_DRAWDOWN_LIMIT", d.max_drawdown_limit)?,
            evolve_interval: Duration::from_secs(parse(&lookup, "EVOLVE_INTERVAL", 60)?),
            population: parse(&lookup, "POPULATION", d.population)?,
            generations: parse(&lookup, "GENERATIONS", d.generations)?,
            evolve_seed: parse(&lookup, "EVOLVE_SEED", d.evolve_seed)?,
            backoff_floor: Duration::from_secs(parse(&lookup, "BACKOFF_FLOOR_SECS", 5)?),
            backoff_cap: Duration::from_secs(parse(&lookup, "BACKOFF_CAP_SECS", 300)?),
            adopt_promoted: parse_bool(&lookup, "ADOPT_PROMOTED", d.adopt_promoted)?,
            webhook_url: lookup("WEBHOOK_URL").filter(|u| !u.trim().is_empty()),
            api_port,
            api_base_url: lookup("API_BASE_URL").unwrap_or_else(|| format!("http://localhost:{api_port}")),
            api_reload_endpoint: lookup("API_RELOAD_ENDPOINT").unwrap_or(d.api_reload_endpoint),
            db_path: lookup("ORGANISM_DB_PATH").map(PathBuf::from).unwrap_or(d.db_path),
        })
    }

    pub fn evolution_settings(&self) -> EvolutionSettings {
        EvolutionSettings {
            population: self.population,
            base_seed: self.evolve_seed,
            ..EvolutionSettings::default()
        }
    }

    pub fn promotion_policy(&self) -> PromotionPolicy {
        PromotionPolicy {
            promote_delta: self.promote_delta,
            max_drawdown_limit: self.max_drawdown_limit,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            evolution: self.evolution_settings(),
            generations: self.generations,
            policy: self.promotion_policy(),
            adopt_promoted: self.adopt_promoted,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            interval: self.evolve_interval,
            floor: self.backoff_floor,
            cap: self.backoff_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = WorkerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert!(!config.adopt_promoted);
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("PROMOTE_DELTA", "0.1"),
            ("POPULATION", "10"),
            ("EVOLVE_INTERVAL", "5"),
            ("API_PORT", "9100"),
            ("ADOPT_PROMOTED", "yes"),
            ("WEBHOOK_URL", ""),
        ]))
        .unwrap();

        assert_eq!(config.promote_delta, 0.1);
        assert_eq!(config.population, 10);
        assert_eq!(config.evolve_interval, Duration::from_secs(5));
        assert_eq!(config.api_base_url, "http://localhost:9100");
        assert!(config.adopt_promoted);
        assert!(config.webhook_url.is_none());
        assert_eq!(config.evolution_settings().population, 10);
        assert!(config.orchestrator_settings().adopt_promoted);
        assert_eq!(config.backoff_policy().interval, Duration::from_secs(5));
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("GENERATIONS", "two")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "GENERATIONS", .. }));

        let err = WorkerConfig::from_lookup(lookup(&[("ADOPT_PROMOTED", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ADOPT_PROMOTED", .. }));
    }
}
