//! Configuration system for drover.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DROVER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/drover/config.toml
//!   3. ~/.config/drover/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    pub worker: WorkerSettings,
    pub blobs: BlobSettings,
    pub hunts: HuntSettings,
    pub flows: FlowSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// How long a leased message handler batch stays exclusive.
    pub message_handler_lease_secs: u64,
    /// Max requests per leased batch.
    pub message_handler_batch_limit: usize,
    /// Idle delay between lease attempts.
    pub poll_interval_ms: u64,
    /// How long shutdown waits for an in-flight batch.
    pub unregister_timeout_secs: u64,
    /// Period of hunt refresh and flow archival.
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobSettings {
    /// Root of the on-disk blob store.
    pub storage_path: PathBuf,
    /// How long flows wait for referenced blobs to appear.
    pub wait_timeout_secs: u64,
    /// Fixed delay between existence polls.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HuntSettings {
    /// Clients admitted per minute. 0 = unlimited.
    pub default_client_rate: f64,
    /// Max clients per hunt. 0 = unlimited.
    pub default_client_limit: u64,
    pub default_duration_secs: u64,
    pub default_crash_limit: u64,
    pub default_avg_results_per_client_limit: u64,
    pub default_avg_cpu_seconds_per_client_limit: f64,
    pub default_avg_network_bytes_per_client_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Terminal flows older than this are archived. 0 = never.
    pub retention_days: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            message_handler_lease_secs: 600,
            message_handler_batch_limit: 1000,
            poll_interval_ms: 100,
            unregister_timeout_secs: 60,
            maintenance_interval_secs: 30,
        }
    }
}

impl Default for BlobSettings {
    fn default() -> Self {
        Self {
            storage_path: data_dir().join("blobs"),
            wait_timeout_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for HuntSettings {
    fn default() -> Self {
        Self {
            default_client_rate: 20.5,
            default_client_limit: 100,
            default_duration_secs: 14 * 24 * 3600,
            default_crash_limit: 100,
            default_avg_results_per_client_limit: 1000,
            default_avg_cpu_seconds_per_client_limit: 60.0,
            default_avg_network_bytes_per_client_limit: 10 * 1024 * 1024,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

impl WorkerSettings {
    pub fn lease_time(&self) -> Duration {
        Duration::from_secs(self.message_handler_lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn unregister_timeout(&self) -> Duration {
        Duration::from_secs(self.unregister_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

impl BlobSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl FlowSettings {
    /// Retention window in milliseconds, `None` when archival is disabled.
    pub fn retention_ms(&self) -> Option<u64> {
        (self.retention_days > 0).then(|| u64::from(self.retention_days) * 24 * 3600 * 1000)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("drover")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("drover")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DroverConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DroverConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DROVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DroverConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply DROVER_* overrides. `lookup` abstracts the environment so tests
    /// don't have to mutate process state.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(value: Option<String>, target: &mut T) {
            if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
                *target = parsed;
            }
        }

        parse(
            lookup("DROVER_WORKER__MESSAGE_HANDLER_LEASE_SECS"),
            &mut self.worker.message_handler_lease_secs,
        );
        parse(
            lookup("DROVER_WORKER__MESSAGE_HANDLER_BATCH_LIMIT"),
            &mut self.worker.message_handler_batch_limit,
        );
        parse(
            lookup("DROVER_WORKER__POLL_INTERVAL_MS"),
            &mut self.worker.poll_interval_ms,
        );
        parse(
            lookup("DROVER_WORKER__UNREGISTER_TIMEOUT_SECS"),
            &mut self.worker.unregister_timeout_secs,
        );
        parse(
            lookup("DROVER_WORKER__MAINTENANCE_INTERVAL_SECS"),
            &mut self.worker.maintenance_interval_secs,
        );
        if let Some(v) = lookup("DROVER_BLOBS__STORAGE_PATH") {
            self.blobs.storage_path = PathBuf::from(v);
        }
        parse(
            lookup("DROVER_BLOBS__WAIT_TIMEOUT_SECS"),
            &mut self.blobs.wait_timeout_secs,
        );
        parse(
            lookup("DROVER_BLOBS__POLL_INTERVAL_MS"),
            &mut self.blobs.poll_interval_ms,
        );
        parse(
            lookup("DROVER_HUNTS__DEFAULT_CLIENT_RATE"),
            &mut self.hunts.default_client_rate,
        );
        parse(
            lookup("DROVER_HUNTS__DEFAULT_CLIENT_LIMIT"),
            &mut self.hunts.default_client_limit,
        );
        parse(
            lookup("DROVER_HUNTS__DEFAULT_DURATION_SECS"),
            &mut self.hunts.default_duration_secs,
        );
        parse(
            lookup("DROVER_HUNTS__DEFAULT_CRASH_LIMIT"),
            &mut self.hunts.default_crash_limit,
        );
        parse(
            lookup("DROVER_HUNTS__DEFAULT_AVG_RESULTS_PER_CLIENT_LIMIT"),
            &mut self.hunts.default_avg_results_per_client_limit,
        );
        parse(
            lookup("DROVER_HUNTS__DEFAULT_AVG_CPU_SECONDS_PER_CLIENT_LIMIT"),
            &mut self.hunts.default_avg_cpu_seconds_per_client_limit,
        );
        parse(
            lookup("DROVER_HUNTS__DEFAULT_AVG_NETWORK_BYTES_PER_CLIENT_LIMIT"),
            &mut self.hunts.default_avg_network_bytes_per_client_limit,
        );
        parse(
            lookup("DROVER_FLOWS__RETENTION_DAYS"),
            &mut self.flows.retention_days,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_matches_documented_values() {
        let config = DroverConfig::default();
        assert_eq!(config.worker.message_handler_lease_secs, 600);
        assert_eq!(config.worker.message_handler_batch_limit, 1000);
        assert_eq!(config.blobs.wait_timeout(), Duration::from_secs(30));
        assert_eq!(config.blobs.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.hunts.default_crash_limit, 100);
        assert_eq!(config.hunts.default_avg_results_per_client_limit, 1000);
        assert_eq!(config.hunts.default_avg_network_bytes_per_client_limit, 10_485_760);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("DROVER_BLOBS__WAIT_TIMEOUT_SECS", "5"),
            ("DROVER_HUNTS__DEFAULT_CLIENT_LIMIT", "not-a-number"),
            ("DROVER_BLOBS__STORAGE_PATH", "/srv/blobs"),
        ]
        .into_iter()
        .collect();

        let mut config = DroverConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.blobs.wait_timeout_secs, 5);
        assert_eq!(config.hunts.default_client_limit, 100);
        assert_eq!(config.blobs.storage_path, PathBuf::from("/srv/blobs"));
    }

    #[test]
    fn every_numeric_hunt_default_is_overridable() {
        let env: HashMap<&str, &str> = [
            ("DROVER_HUNTS__DEFAULT_CLIENT_RATE", "0.5"),
            ("DROVER_HUNTS__DEFAULT_DURATION_SECS", "3600"),
            ("DROVER_HUNTS__DEFAULT_CRASH_LIMIT", "7"),
            ("DROVER_HUNTS__DEFAULT_AVG_RESULTS_PER_CLIENT_LIMIT", "50"),
            ("DROVER_HUNTS__DEFAULT_AVG_CPU_SECONDS_PER_CLIENT_LIMIT", "2.5"),
            ("DROVER_HUNTS__DEFAULT_AVG_NETWORK_BYTES_PER_CLIENT_LIMIT", "4096"),
            ("DROVER_WORKER__UNREGISTER_TIMEOUT_SECS", "9"),
            ("DROVER_WORKER__MAINTENANCE_INTERVAL_SECS", "11"),
        ]
        .into_iter()
        .collect();

        let mut config = DroverConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.hunts.default_client_rate, 0.5);
        assert_eq!(config.hunts.default_duration_secs, 3600);
        assert_eq!(config.hunts.default_crash_limit, 7);
        assert_eq!(config.hunts.default_avg_results_per_client_limit, 50);
        assert_eq!(config.hunts.default_avg_cpu_seconds_per_client_limit, 2.5);
        assert_eq!(config.hunts.default_avg_network_bytes_per_client_limit, 4096);
        assert_eq!(config.worker.unregister_timeout(), Duration::from_secs(9));
        assert_eq!(config.worker.maintenance_interval(), Duration::from_secs(11));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: DroverConfig = toml::from_str("[worker]\npoll_interval_ms = 5\n").unwrap();
        assert_eq!(config.worker.poll_interval_ms, 5);
        assert_eq!(config.worker.message_handler_lease_secs, 600);
        assert_eq!(config.flows.retention_days, 30);
    }

    #[test]
    fn retention_zero_disables_archival() {
        let flows = FlowSettings { retention_days: 0 };
        assert_eq!(flows.retention_ms(), None);
        assert_eq!(FlowSettings::default().retention_ms(), Some(30 * 86_400_000));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("drover-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("DROVER_CONFIG", config_path.to_str().unwrap());
        }

        let path = DroverConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = DroverConfig::load().expect("load should succeed");
        assert_eq!(config.worker.message_handler_batch_limit, 1000);

        unsafe {
            std::env::remove_var("DROVER_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
