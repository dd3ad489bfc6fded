//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fieldsync_core::Settings;

const DEFAULT_LOOKUP_URL: &str = "https://api.ipify.org?format=json";

/// Daemon configuration. File: ~/.config/fieldsync/config.toml or /etc/fieldsync/config.toml.
/// Env overrides: FIELDSYNC_DISCOVERY_PORT, FIELDSYNC_TRANSPORT_PORT, FIELDSYNC_POLL_INTERVAL_MS,
/// FIELDSYNC_ROOM, FIELDSYNC_LOOKUP_URL, FIELDSYNC_DEVICE_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Discovery UDP port (default 45678).
    pub discovery_port: u16,
    /// Data channel TCP port; 0 picks an ephemeral port (advertised in beacons).
    pub transport_port: u16,
    /// Discovery poll interval.
    pub poll_interval_ms: u64,
    /// How long the "synced" badge stays up after a remote edit.
    pub ack_duration_ms: u64,
    /// Beacon send interval.
    pub beacon_interval_ms: u64,
    /// Peers silent for longer than this are no longer listed.
    pub peer_timeout_ms: u64,
    /// Public address lookup endpoint; must answer `{"ip": "..."}`.
    pub lookup_url: String,
    /// Fixed room name; skips the address lookup.
    pub room: Option<String>,
    pub device_name: Option<String>,
    pub device_icon: Option<String>,
    /// Redial known-but-disconnected peers on each discovery poll.
    pub redial_disconnected: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: 45678,
            transport_port: 0,
            poll_interval_ms: 3000,
            ack_duration_ms: 1000,
            beacon_interval_ms: 1000,
            peer_timeout_ms: 6000,
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
            room: None,
            device_name: None,
            device_icon: None,
            redial_disconnected: true,
        }
    }
}

impl Config {
    /// Session tunables derived from this config.
    pub fn settings(&self) -> Settings {
        Settings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            ack_duration: Duration::from_millis(self.ack_duration_ms),
            redial_disconnected: self.redial_disconnected,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = match load_file() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring config file, using defaults");
            Config::default()
        }
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("FIELDSYNC_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("FIELDSYNC_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
    if let Some(ms) = var("FIELDSYNC_POLL_INTERVAL_MS").and_then(|s| s.parse().ok()) {
        c.poll_interval_ms = ms;
    }
    if let Some(room) = var("FIELDSYNC_ROOM").filter(|s| !s.is_empty()) {
        c.room = Some(room);
    }
    if let Some(url) = var("FIELDSYNC_LOOKUP_URL").filter(|s| !s.is_empty()) {
        c.lookup_url = url;
    }
    if let Some(name) = var("FIELDSYNC_DEVICE_NAME").filter(|s| !s.is_empty()) {
        c.device_name = Some(name);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fieldsync/config.toml"));
    }
    out.push(PathBuf::from("/etc/fieldsync/config.toml"));
    out
}

fn load_file() -> Result<Option<Config>, ConfigError> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => parse_file(&p).map(Some),
        None => Ok(None),
    }
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("poll_interval_ms = 500\nroom = \"office\"\n").unwrap();
        assert_eq!(c.poll_interval_ms, 500);
        assert_eq!(c.room.as_deref(), Some("office"));
        assert_eq!(c.discovery_port, 45678);
        assert!(c.redial_disconnected);
        assert_eq!(c.settings().poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FIELDSYNC_DISCOVERY_PORT", "5000"),
            ("FIELDSYNC_POLL_INTERVAL_MS", "not-a-number"),
            ("FIELDSYNC_ROOM", "lab"),
            ("FIELDSYNC_DEVICE_NAME", ""),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.discovery_port, 5000);
        assert_eq!(c.poll_interval_ms, 3000);
        assert_eq!(c.room.as_deref(), Some("lab"));
        assert!(c.device_name.is_none());
    }

    #[test]
    fn bad_file_reports_path() {
        let dir = std::env::temp_dir().join(format!("fieldsync-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "poll_interval_ms = \"fast\"\n").unwrap();
        let err = parse_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
