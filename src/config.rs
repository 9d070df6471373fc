//! Server configuration.
//!
//! Values come from environment variables first, then from an optional
//! `config.json` in the data directory, then from built-in defaults.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::status::StatusThresholds;

/// One year
const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;
/// Upper bound for every day-count setting
const MAX_DAYS: i64 = 3650;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    DuckDb,
    Json,
}

impl FromStr for BackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "duckdb" | "db" | "sql" => Ok(BackendKind::DuckDb),
            "json" | "file" => Ok(BackendKind::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub backend: BackendKind,
    pub thresholds: StatusThresholds,
    pub session_ttl_hours: i64,
    pub activity_log_cap: usize,
    pub trial_days: i64,
    pub bcrypt_cost: u32,
    /// Cron expression for the expiry sweep; unset disables it
    pub expiry_sweep_cron: Option<String>,
    pub superadmin_username: String,
    pub superadmin_password: Option<String>,
    /// Directory holding a built front end to serve at `/`
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            data_dir: default_data_dir(),
            backend: BackendKind::DuckDb,
            thresholds: StatusThresholds::default(),
            session_ttl_hours: 12,
            activity_log_cap: 300,
            trial_days: 14,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            expiry_sweep_cron: None,
            superadmin_username: "superadmin".to_string(),
            superadmin_password: None,
            static_dir: None,
        }
    }
}

/// Shape of `config.json`; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    backend: Option<String>,
    expiring_within_days: Option<i64>,
    stopped_after_days: Option<i64>,
    session_ttl_hours: Option<i64>,
    activity_log_cap: Option<usize>,
    trial_days: Option<i64>,
    bcrypt_cost: Option<u32>,
    expiry_sweep_cron: Option<String>,
    superadmin_username: Option<String>,
    static_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/data"))
        .join("wasla")
}

impl ServerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::resolve(|key| vars.get(key).cloned())
    }

    /// Resolve using `lookup` for environment values
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = ServerConfig::default();

        if let Some(dir) = env("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        let file = load_file_config(&config.data_dir)?;

        config.host = env("HOST").or(file.host).unwrap_or(config.host);
        config.port = match env("PORT") {
            Some(v) => parse_value("PORT", &v)?,
            None => file.port.unwrap_or(config.port),
        };
        if let Some(v) = env("WASLA_BACKEND").or(file.backend) {
            config.backend = v
                .parse()
                .map_err(|_| ConfigError::Invalid { key: "WASLA_BACKEND", value: v.clone() })?;
        }
        config.thresholds.expiring_within_days = pick(
            "EXPIRING_WITHIN_DAYS",
            env("EXPIRING_WITHIN_DAYS"),
            file.expiring_within_days,
            config.thresholds.expiring_within_days,
        )?;
        config.thresholds.stopped_after_days = pick(
            "STOPPED_AFTER_DAYS",
            env("STOPPED_AFTER_DAYS"),
            file.stopped_after_days,
            config.thresholds.stopped_after_days,
        )?;
        config.session_ttl_hours = pick(
            "SESSION_TTL_HOURS",
            env("SESSION_TTL_HOURS"),
            file.session_ttl_hours,
            config.session_ttl_hours,
        )?;
        config.activity_log_cap = pick(
            "ACTIVITY_LOG_CAP",
            env("ACTIVITY_LOG_CAP"),
            file.activity_log_cap,
            config.activity_log_cap,
        )?;
        config.trial_days = pick("TRIAL_DAYS", env("TRIAL_DAYS"), file.trial_days, config.trial_days)?;
        config.bcrypt_cost = pick("BCRYPT_COST", env("BCRYPT_COST"), file.bcrypt_cost, config.bcrypt_cost)?;
        config.expiry_sweep_cron = env("EXPIRY_SWEEP_CRON").or(file.expiry_sweep_cron);
        config.superadmin_username = env("WASLA_SUPERADMIN_USERNAME")
            .or(file.superadmin_username)
            .unwrap_or(config.superadmin_username);
        config.superadmin_password = env("WASLA_SUPERADMIN_PASSWORD");
        config.static_dir = env("STATIC_DIR").map(PathBuf::from).or(file.static_dir);

        check_range("SESSION_TTL_HOURS", config.session_ttl_hours, 1..=MAX_SESSION_TTL_HOURS)?;
        check_range("TRIAL_DAYS", config.trial_days, 1..=MAX_DAYS)?;
        check_range("EXPIRING_WITHIN_DAYS", config.thresholds.expiring_within_days, 0..=MAX_DAYS)?;
        check_range("STOPPED_AFTER_DAYS", config.thresholds.stopped_after_days, 0..=MAX_DAYS)?;
        check_range("BCRYPT_COST", config.bcrypt_cost, 4..=31)?;
        if config.activity_log_cap == 0 {
            return Err(ConfigError::Invalid {
                key: "ACTIVITY_LOG_CAP",
                value: "0".to_string(),
            });
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn load_file_config(data_dir: &Path) -> Result<FileConfig, ConfigError> {
    let path = data_dir.join("config.json");
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
}

fn check_range<T>(key: &'static str, value: T, range: RangeInclusive<T>) -> Result<(), ConfigError>
where
    T: PartialOrd + ToString,
{
    if range.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn pick<T: FromStr>(key: &'static str, env: Option<String>, file: Option<T>, default: T) -> Result<T, ConfigError> {
    match env {
        Some(v) => parse_value(key, &v),
        None => Ok(file.unwrap_or(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_file() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = ServerConfig::resolve(lookup(&[("DATA_DIR", &data_dir)])).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.backend, BackendKind::DuckDb);
        assert_eq!(config.thresholds, StatusThresholds::default());
        assert_eq!(config.activity_log_cap, 300);
        assert_eq!(config.trial_days, 14);
        assert_eq!(config.bcrypt_cost, bcrypt::DEFAULT_COST);
        assert!(config.expiry_sweep_cron.is_none());
        assert_eq!(config.bind_addr(), "0.0.0.0:3001");
    }

    #[test]
    fn env_overrides_config_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "port": 4000, "backend": "json", "expiring_within_days": 5, "trial_days": 30 }"#,
        )
        .unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = ServerConfig::resolve(lookup(&[
            ("DATA_DIR", &data_dir),
            ("PORT", "8080"),
            ("STOPPED_AFTER_DAYS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.backend, BackendKind::Json);
        assert_eq!(config.thresholds.expiring_within_days, 5);
        assert_eq!(config.thresholds.stopped_after_days, 10);
        assert_eq!(config.trial_days, 30);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let err = ServerConfig::resolve(lookup(&[("DATA_DIR", &data_dir), ("PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));
        let err = ServerConfig::resolve(lookup(&[("DATA_DIR", &data_dir), ("WASLA_BACKEND", "postgres")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WASLA_BACKEND", .. }));
        let err = ServerConfig::resolve(lookup(&[("DATA_DIR", &data_dir), ("ACTIVITY_LOG_CAP", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ACTIVITY_LOG_CAP", .. }));
        let err = ServerConfig::resolve(lookup(&[("DATA_DIR", &data_dir), ("BCRYPT_COST", "2")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "BCRYPT_COST", .. }));
    }

    #[test]
    fn day_and_hour_counts_are_bounded() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let rejected = [
            ("SESSION_TTL_HOURS", "0"),
            ("SESSION_TTL_HOURS", "9999999999999"),
            ("TRIAL_DAYS", "-3"),
            ("TRIAL_DAYS", "0"),
            ("TRIAL_DAYS", "100000000000"),
            ("EXPIRING_WITHIN_DAYS", "-1"),
            ("STOPPED_AFTER_DAYS", "-30"),
            ("STOPPED_AFTER_DAYS", "9223372036854775807"),
        ];
        for (key, value) in rejected {
            let err = ServerConfig::resolve(lookup(&[("DATA_DIR", &data_dir), (key, value)])).unwrap_err();
            match err {
                ConfigError::Invalid { key: got, .. } => assert_eq!(got, key, "{}={}", key, value),
                other => panic!("{}={} gave {}", key, value, other),
            }
        }

        let config = ServerConfig::resolve(lookup(&[
            ("DATA_DIR", &data_dir),
            ("SESSION_TTL_HOURS", "8760"),
            ("TRIAL_DAYS", "1"),
            ("EXPIRING_WITHIN_DAYS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.session_ttl_hours, 8760);
        assert_eq!(config.thresholds.expiring_within_days, 0);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = ServerConfig::resolve(lookup(&[("DATA_DIR", &data_dir), ("HOST", "  ")])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
    }
}
