//! Client configuration loading: endpoints, connection policy and timer tuning.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/client.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "DUEL_CLIENT_CONFIG_PATH";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";
const DEFAULT_SOCKET_URL: &str = "ws://localhost:3000/duel";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_TICK_INTERVAL_MS: u64 = 100;
const DEFAULT_SYNC_STALENESS_MS: u64 = 1_500;
const DEFAULT_STORAGE_PATH: &str = ".duel-client/storage.json";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RESULTS_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable runtime configuration shared across the client.
pub struct ClientConfig {
    /// Base URL of the REST backend, without trailing slash.
    pub api_base_url: String,
    /// WebSocket endpoint of the duel server.
    pub socket_url: String,
    /// Upper bound for the handshake plus acknowledgment.
    pub connect_timeout: Duration,
    /// Delay before the first reconnect; doubled on each further attempt.
    pub reconnect_base_delay: Duration,
    /// Consecutive reconnects attempted before giving up.
    pub max_reconnect_attempts: u32,
    /// Period of the local countdown tick.
    pub tick_interval: Duration,
    /// How long a `timer_update` stays authoritative.
    pub sync_staleness: Duration,
    /// JSON file holding tokens and preferences.
    pub storage_path: PathBuf,
    /// Upper bound for a single REST request.
    pub request_timeout: Duration,
    /// How long closing a session waits for end-of-duel results to be recorded.
    pub results_timeout: Duration,
}

impl ClientConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        socket_url = %config.socket_url,
                        "loaded client config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a configuration document. Missing fields take their default.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    api_base_url: Option<String>,
    socket_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    tick_interval_ms: Option<u64>,
    sync_staleness_ms: Option<u64>,
    storage_path: Option<PathBuf>,
    request_timeout_ms: Option<u64>,
    results_timeout_ms: Option<u64>,
}

impl From<RawConfig> for ClientConfig {
    fn from(value: RawConfig) -> Self {
        let millis = |value: Option<u64>, default: u64| Duration::from_millis(value.unwrap_or(default));
        Self {
            api_base_url: value
                .api_base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.into()),
            socket_url: value
                .socket_url
                .unwrap_or_else(|| DEFAULT_SOCKET_URL.into()),
            connect_timeout: millis(value.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS),
            reconnect_base_delay: millis(
                value.reconnect_base_delay_ms,
                DEFAULT_RECONNECT_BASE_DELAY_MS,
            ),
            max_reconnect_attempts: value
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            // A zero period would make the tick interval panic.
            tick_interval: millis(value.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS)
                .max(Duration::from_millis(1)),
            sync_staleness: millis(value.sync_staleness_ms, DEFAULT_SYNC_STALENESS_MS),
            storage_path: value
                .storage_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH)),
            request_timeout: millis(value.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS),
            results_timeout: millis(value.results_timeout_ms, DEFAULT_RESULTS_TIMEOUT_MS),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.sync_staleness, Duration::from_millis(1_500));
        assert_eq!(config.storage_path, PathBuf::from(".duel-client/storage.json"));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.results_timeout, Duration::from_secs(15));
    }

    #[test]
    fn timeouts_are_read_in_milliseconds() {
        let config =
            ClientConfig::from_json(r#"{"requestTimeoutMs": 2500, "resultsTimeoutMs": 500}"#)
                .unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(2_500));
        assert_eq!(config.results_timeout, Duration::from_millis(500));
    }

    #[test]
    fn partial_documents_keep_defaults_for_missing_fields() {
        let config = ClientConfig::from_json(
            r#"{"apiBaseUrl": "https://api.example.test/", "maxReconnectAttempts": 2}"#,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://api.example.test");
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn zero_tick_interval_is_clamped() {
        let config = ClientConfig::from_json(r#"{"tickIntervalMs": 0}"#).unwrap();
        assert_eq!(config.tick_interval, Duration::from_millis(1));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(ClientConfig::from_json(r#"{"connectTimeoutMs": "soon"}"#).is_err());
    }
}
