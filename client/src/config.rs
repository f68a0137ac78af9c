use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

use crate::constants::{
    DRIFT_THRESHOLD_SECS, ECHO_WINDOW_MS, HEARTBEAT_INTERVAL_MS, LOCAL_WS_URL,
    PENDING_QUEUE_LIMIT, REMOTE_WS_URL,
};
use crate::error::{Error, Result};

/// Tunables of the synchronization core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub drift_threshold_secs: f64,
    pub heartbeat_interval_ms: u64,
    pub echo_window_ms: u64,
    pub pending_queue_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_threshold_secs: DRIFT_THRESHOLD_SECS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            echo_window_ms: ECHO_WINDOW_MS,
            pending_queue_limit: PENDING_QUEUE_LIMIT,
        }
    }
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.drift_threshold_secs.is_finite() || self.drift_threshold_secs <= 0.0 {
            return Err(Error::Config(format!(
                "drift_threshold_secs must be positive, got {}",
                self.drift_threshold_secs
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be positive".into()));
        }
        if self.echo_window_ms == 0 {
            return Err(Error::Config("echo_window_ms must be positive".into()));
        }
        if self.pending_queue_limit == 0 {
            return Err(Error::Config("pending_queue_limit must be positive".into()));
        }
        Ok(())
    }
}

/// A relay endpoint the client may connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub label: String,
    pub url: String,
}

impl Endpoint {
    fn new(label: &str, url: &str) -> Self {
        Self {
            label: label.to_string(),
            url: url.to_string(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.url == LOCAL_WS_URL
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Explicit relay URL; replaces the built-in endpoint list when set.
    pub server_url: Option<String>,
    pub prefer_local: bool,
    pub disable_local: bool,
    pub sync: SyncConfig,
}

impl ClientConfig {
    /// Defaults, then `config.json` in the platform config dir, then env.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        config.sync.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let data = fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "lockstep", "Lockstep")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("LOCKSTEP_SERVER_URL").filter(|u| !u.trim().is_empty()) {
            self.server_url = Some(url);
        }
        if var("LOCKSTEP_PREFER_LOCAL").is_some() {
            self.prefer_local = true;
        }
        if var("LOCKSTEP_DISABLE_LOCAL").is_some() {
            self.disable_local = true;
        }
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        if let Some(url) = &self.server_url {
            return vec![Endpoint::new("configured", url)];
        }

        let mut endpoints = Vec::with_capacity(2);
        if self.prefer_local && !self.disable_local {
            endpoints.push(Endpoint::new("local development", LOCAL_WS_URL));
        }
        endpoints.push(Endpoint::new("remote deployment", REMOTE_WS_URL));
        if !self.prefer_local && !self.disable_local {
            endpoints.push(Endpoint::new("local development", LOCAL_WS_URL));
        }
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.sync.drift_threshold_secs, 1.5);
        assert_eq!(config.sync.heartbeat_interval(), Duration::from_millis(2001));
        assert_eq!(config.sync.echo_window(), Duration::from_millis(101));
        assert!(config.sync.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"sync": {"drift_threshold_secs": 0.5}}"#).unwrap();
        assert_eq!(config.sync.drift_threshold_secs, 0.5);
        assert_eq!(config.sync.heartbeat_interval_ms, 2001);
        assert!(config.server_url.is_none());
    }

    #[test]
    fn test_validation_rejects_nonsense() {
        let mut sync = SyncConfig::default();
        sync.drift_threshold_secs = 0.0;
        assert!(sync.validate().is_err());

        let mut sync = SyncConfig::default();
        sync.heartbeat_interval_ms = 0;
        assert!(sync.validate().is_err());
    }

    #[test]
    fn test_env_overrides_and_endpoint_order() {
        let mut config = ClientConfig::default();
        assert_eq!(config.endpoints()[0].url, REMOTE_WS_URL);
        assert_eq!(config.endpoints().len(), 2);

        let vars: HashMap<&str, &str> = [("LOCKSTEP_PREFER_LOCAL", "1")].into();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.endpoints()[0].is_local());

        let vars: HashMap<&str, &str> = [("LOCKSTEP_SERVER_URL", "ws://10.0.0.2:3005/ws")].into();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        let endpoints = config.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].url, "ws://10.0.0.2:3005/ws");
    }
}
