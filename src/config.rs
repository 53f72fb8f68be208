//! Runtime settings read from the environment (and a `.env` file).

use std::env;
use thiserror::Error;

pub const DEFAULT_POOL_MAX_SIZE: usize = 5;
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Connection string for the price database.
    pub database_url: Option<String>,
    pub pool_max_size: usize,
    /// How many sibling blocks or per-asset metrics are awaited at once.
    pub max_concurrent_tasks: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

impl Settings {
    /// Loads `.env` if present, then reads `DATABASE_URL`,
    /// `DB_POOL_MAX_SIZE` and `STRATEGY_MAX_CONCURRENCY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            pool_max_size: positive(&lookup, "DB_POOL_MAX_SIZE", defaults.pool_max_size)?,
            max_concurrent_tasks: positive(
                &lookup,
                "STRATEGY_MAX_CONCURRENCY",
                defaults.max_concurrent_tasks,
            )?,
        })
    }
}

fn positive<F>(lookup: &F, key: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        Ok(_) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "must be positive".to_string(),
        }),
        Err(e) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: e.to_string(),
        }),
    }
}
