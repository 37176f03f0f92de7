use agent_memory_indexing::RankingConfig;
use agent_memory_schemas::MAX_EXPIRY_DAYS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MemoryError, Result};

pub const DB_PATH_ENV: &str = "AGENT_MEMORY_DB_PATH";
pub const DEFAULT_EXPIRY_ENV: &str = "AGENT_MEMORY_DEFAULT_EXPIRY_DAYS";

/// Where the store keeps its data. Fixed for the lifetime of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreLocation {
    InMemory,
    File(PathBuf),
}

impl StoreLocation {
    /// `:memory:` and `in-memory` select the ephemeral mode, anything else is a path.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            ":memory:" | "in-memory" => StoreLocation::InMemory,
            path => StoreLocation::File(PathBuf::from(path)),
        }
    }

    /// `~/.agent-memory/memory.db`
    pub fn default_file(home: &Path) -> Self {
        StoreLocation::File(home.join(".agent-memory").join("memory.db"))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            StoreLocation::InMemory => None,
            StoreLocation::File(path) => Some(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub location: StoreLocation,
    /// Applied by `remember` when the caller gives no expiry of its own.
    pub default_expiry_days: Option<u32>,
    #[serde(default)]
    pub ranking: RankingConfig,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::InMemory,
            default_expiry_days: None,
            ranking: RankingConfig::default(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            default_expiry_days: None,
            ranking: RankingConfig::default(),
        }
    }

    pub fn with_default_expiry_days(mut self, days: u32) -> Self {
        self.default_expiry_days = Some(days);
        self
    }

    pub fn with_ranking(mut self, ranking: RankingConfig) -> Self {
        self.ranking = ranking;
        self
    }

    /// Build from `AGENT_MEMORY_DB_PATH` / `AGENT_MEMORY_DEFAULT_EXPIRY_DAYS`,
    /// defaulting to a file under `$HOME`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let location = match lookup(DB_PATH_ENV).filter(|raw| !raw.trim().is_empty()) {
            Some(raw) => StoreLocation::parse(&raw),
            None => {
                let home = lookup("HOME").ok_or_else(|| {
                    MemoryError::Config(format!("neither {} nor HOME is set", DB_PATH_ENV))
                })?;
                StoreLocation::default_file(Path::new(&home))
            }
        };

        let default_expiry_days = match lookup(DEFAULT_EXPIRY_ENV) {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|e| {
                MemoryError::Config(format!("{} must be a whole number of days: {}", DEFAULT_EXPIRY_ENV, e))
            })?),
            None => None,
        };

        let config = Self {
            location,
            default_expiry_days,
            ranking: RankingConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(days) = self.default_expiry_days {
            if days == 0 || days > MAX_EXPIRY_DAYS {
                return Err(MemoryError::Config(format!(
                    "default_expiry_days must be within 1..={}",
                    MAX_EXPIRY_DAYS
                )));
            }
        }
        if !(self.ranking.half_life_days > 0.0) {
            return Err(MemoryError::Config(
                "ranking.half_life_days must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.ranking.recency_floor) {
            return Err(MemoryError::Config(
                "ranking.recency_floor must be within [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_location_under_home() {
        let config = StoreConfig::from_lookup(lookup_from(&[("HOME", "/home/agent")])).unwrap();
        assert_eq!(
            config.location,
            StoreLocation::File(PathBuf::from("/home/agent/.agent-memory/memory.db"))
        );
        assert_eq!(config.default_expiry_days, None);
    }

    #[test]
    fn test_env_overrides() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            (DB_PATH_ENV, ":memory:"),
            (DEFAULT_EXPIRY_ENV, "14"),
        ]))
        .unwrap();
        assert_eq!(config.location, StoreLocation::InMemory);
        assert_eq!(config.default_expiry_days, Some(14));
    }

    #[test]
    fn test_bad_values_rejected() {
        let bad_days = StoreConfig::from_lookup(lookup_from(&[
            (DB_PATH_ENV, "/tmp/m.db"),
            (DEFAULT_EXPIRY_ENV, "soon"),
        ]));
        assert!(matches!(bad_days, Err(MemoryError::Config(_))));

        let zero_days = StoreConfig::from_lookup(lookup_from(&[
            (DB_PATH_ENV, "/tmp/m.db"),
            (DEFAULT_EXPIRY_ENV, "0"),
        ]));
        assert!(zero_days.is_err());

        let huge_days = StoreConfig::from_lookup(lookup_from(&[
            (DB_PATH_ENV, "/tmp/m.db"),
            (DEFAULT_EXPIRY_ENV, "4294967295"),
        ]));
        assert!(matches!(huge_days, Err(MemoryError::Config(_))));

        assert!(StoreConfig::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    fn test_ranking_validation() {
        let config = StoreConfig::in_memory().with_ranking(RankingConfig {
            half_life_days: 0.0,
            recency_floor: 0.1,
        });
        assert!(config.validate().is_err());

        assert!(StoreConfig::file("/tmp/x.db").validate().is_ok());
    }
}
