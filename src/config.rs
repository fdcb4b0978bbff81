//! Configuration management for the Bigfile server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default upper bound for a single chunk: 500MB
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 500 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Holds the `chunks/` and `merged/` namespaces
    pub root: PathBuf,
    pub max_chunk_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// 0 disables the sweeper
    pub max_age_hours: u64,
}

impl SweepConfig {
    pub fn enabled(&self) -> bool {
        self.max_age_hours > 0 && self.interval_secs > 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours * 60 * 60)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8686,
            },
            storage: StorageConfig {
                root: PathBuf::from("./uploaded_files"),
                max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            },
            sweep: SweepConfig {
                interval_secs: 300,
                max_age_hours: 0,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
            },
            storage: StorageConfig {
                root: env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.root),
                max_chunk_bytes: parse_var("MAX_CHUNK_BYTES", defaults.storage.max_chunk_bytes),
            },
            sweep: SweepConfig {
                interval_secs: parse_var("SWEEP_INTERVAL_SECS", defaults.sweep.interval_secs),
                max_age_hours: parse_var("CHUNK_MAX_AGE_HOURS", defaults.sweep.max_age_hours),
            },
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}
