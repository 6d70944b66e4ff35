//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::GenerationParams;
use crate::translate::invoker::DEFAULT_MAX_INPUT_TOKENS;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_CACHE_SIZE: usize = 2;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub model_dir: PathBuf,
    pub cache_capacity: NonZeroUsize,
    pub workers: usize,
    pub queue_depth: usize,
    pub max_input_tokens: usize,
    pub generation: GenerationParams,
    /// Optional JSON pair table replacing the built-in one.
    pub registry_path: Option<PathBuf>,
    /// `None` disables message history.
    pub database_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset and blank values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let non_blank = |key: &str| get(key).filter(|v| !v.is_empty());

        let bind_addr = match non_blank("BIND_ADDR") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "BIND_ADDR",
                value: v,
                expected: "a socket address such as 0.0.0.0:8000",
            })?,
            None => DEFAULT_BIND_ADDR
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    var: "BIND_ADDR",
                    value: DEFAULT_BIND_ADDR.to_string(),
                    expected: "a socket address",
                })?,
        };

        let positive =
            |var: &'static str, default: usize| parse_positive(non_blank(var), var, default);

        let cache_size = positive("TRANSLATOR_MODEL_CACHE_SIZE", DEFAULT_CACHE_SIZE)?;
        let default_workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let workers = positive("TRANSLATOR_WORKERS", default_workers)?;
        let queue_depth = positive("TRANSLATOR_QUEUE_DEPTH", DEFAULT_QUEUE_DEPTH)?;
        let max_input_tokens = positive("TRANSLATOR_MAX_INPUT_TOKENS", DEFAULT_MAX_INPUT_TOKENS)?;
        let defaults = GenerationParams::default();
        let num_beams = positive("TRANSLATOR_NUM_BEAMS", defaults.num_beams)?;

        // An explicitly empty DATABASE_PATH turns history off.
        let database_path = match get("DATABASE_PATH") {
            None => Some(PathBuf::from("messages.db")),
            Some(v) if v.is_empty() => None,
            Some(v) => Some(PathBuf::from(v)),
        };

        Ok(Self {
            bind_addr,
            model_dir: non_blank("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("models")),
            cache_capacity: NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN),
            workers,
            queue_depth,
            max_input_tokens,
            generation: GenerationParams {
                num_beams,
                ..defaults
            },
            registry_path: non_blank("TRANSLATOR_REGISTRY").map(PathBuf::from),
            database_path,
        })
    }
}

fn parse_positive(
    value: Option<String>,
    var: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            expected: "a positive integer",
        }),
    }
}
