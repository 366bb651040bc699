//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::coordinator::CoordinatorOptions;

/// Server configuration. File: ~/.config/ingest/config.toml or /etc/ingest/config.toml.
/// Env overrides: INGEST_BIND_ADDRESS, INGEST_PORT, INGEST_OUTPUT_DIR, INGEST_IDLE_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listen port (default 9999).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory receiving one FITS file per image (default /tmp).
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// How long frames wait for a late START (default 1000 ms).
    #[serde(default = "default_start_wait_ms")]
    pub start_wait_ms: u64,
    /// Idle time after which a session is force-closed (default 60 s).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Idle sweep period (default 1000 ms).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9999
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_start_wait_ms() -> u64 {
    1000
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_sweep_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            output_dir: default_output_dir(),
            start_wait_ms: default_start_wait_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            start_wait: Duration::from_millis(self.start_wait_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
        }
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("INGEST_BIND_ADDRESS") {
            self.bind_address = s;
        }
        if let Some(s) = lookup("INGEST_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.port = p,
                Err(_) => warn!(value = %s, "ignoring invalid INGEST_PORT"),
            }
        }
        if let Some(s) = lookup("INGEST_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("INGEST_IDLE_TIMEOUT_SECS") {
            match s.parse::<u64>() {
                Ok(v) => self.idle_timeout_secs = v,
                Err(_) => warn!(value = %s, "ignoring invalid INGEST_IDLE_TIMEOUT_SECS"),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

/// Load an explicitly named file, then env vars. Unlike [`load`], a bad file is an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut c = parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ingest/config.toml"));
    }
    out.push(PathBuf::from("/etc/ingest/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.port, 9999);
        let o = c.coordinator_options();
        assert_eq!(o.start_wait, Duration::from_secs(1));
        assert_eq!(o.idle_timeout, Duration::from_secs(60));
        assert_eq!(o.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = parse("port = 7000\noutput_dir = \"/data/ingest\"\n").unwrap();
        assert_eq!(c.port, 7000);
        assert_eq!(c.output_dir, PathBuf::from("/data/ingest"));
        assert_eq!(c.idle_timeout_secs, 60);
        assert_eq!(c.listen_addr(), "0.0.0.0:7000");
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("prot = 1").is_err());
    }

    #[test]
    fn env_overrides_and_bad_values_ignored() {
        let env: HashMap<&str, &str> = [
            ("INGEST_PORT", "not-a-port"),
            ("INGEST_OUTPUT_DIR", "/ram/ingest"),
            ("INGEST_IDLE_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.port, 9999);
        assert_eq!(c.output_dir, PathBuf::from("/ram/ingest"));
        assert_eq!(c.coordinator_options().idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"x\"").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            load_from(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
