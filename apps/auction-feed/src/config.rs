use std::env;
use std::time::Duration;

use auction_feed_proto::SequenceNumber;
#[cfg(test)]
use std::sync::Mutex;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_PROBE_LAG_THRESHOLD: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint {value:?}: {source}")]
    Endpoint {
        value: String,
        source: url::ParseError,
    },
    #[error("endpoint {0:?} must use ws:// or wss://")]
    Scheme(String),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Session configuration for one auction stream.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:8000`.
    pub endpoint: Url,
    pub auction_id: String,
    /// How long an out-of-order event may wait before a resync is requested.
    pub gap_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    /// A probe this far ahead of the last accepted sequence forces a resync.
    pub probe_lag_threshold: u64,
}

impl FeedConfig {
    pub fn new(endpoint: &str, auction_id: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: parse_endpoint(endpoint)?,
            auction_id: auction_id.into(),
            gap_timeout: DEFAULT_GAP_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            probe_lag_threshold: DEFAULT_PROBE_LAG_THRESHOLD,
        })
    }

    /// Loads configuration from `AUCTION_FEED_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint =
            env::var("AUCTION_FEED_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let auction_id = env::var("AUCTION_FEED_AUCTION_ID").unwrap_or_default();
        let mut config = Self::new(&endpoint, auction_id)?;
        if let Some(ms) = env_parse::<u64>("AUCTION_FEED_GAP_TIMEOUT_MS")? {
            config.gap_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<u32>("AUCTION_FEED_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("AUCTION_FEED_RECONNECT_BASE_DELAY_MS")? {
            config.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_parse::<u64>("AUCTION_FEED_PROBE_LAG_THRESHOLD")? {
            config.probe_lag_threshold = threshold;
        }
        Ok(config)
    }

    /// Stream URL carrying the resume hint for the next connection.
    pub fn stream_url(&self, last_sequence: SequenceNumber) -> Url {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/ws/auction/{}/", self.auction_id));
        url.query_pairs_mut()
            .clear()
            .append_pair("last_seq", &last_sequence.to_string());
        url
    }
}

fn parse_endpoint(value: &str) -> Result<Url, ConfigError> {
    // Normalize localhost to IPv4, same as the session server defaults.
    let with_scheme = if value.contains("://") {
        value.to_string()
    } else {
        format!("ws://{value}")
    };
    let normalized = with_scheme.replacen("://localhost", "://127.0.0.1", 1);
    let url = Url::parse(&normalized).map_err(|source| ConfigError::Endpoint {
        value: value.to_string(),
        source,
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        _ => Err(ConfigError::Scheme(value.to_string())),
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "AUCTION_FEED_ENDPOINT",
        "AUCTION_FEED_AUCTION_ID",
        "AUCTION_FEED_GAP_TIMEOUT_MS",
        "AUCTION_FEED_MAX_RECONNECT_ATTEMPTS",
        "AUCTION_FEED_RECONNECT_BASE_DELAY_MS",
        "AUCTION_FEED_PROBE_LAG_THRESHOLD",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn stream_url_carries_resume_hint() {
        let config = FeedConfig::new("ws://localhost:8000", "auction-123").unwrap();
        assert_eq!(
            config.stream_url(0).as_str(),
            "ws://127.0.0.1:8000/ws/auction/auction-123/?last_seq=0"
        );
        assert_eq!(
            config.stream_url(42).as_str(),
            "ws://127.0.0.1:8000/ws/auction/auction-123/?last_seq=42"
        );
    }

    #[test]
    fn endpoint_without_scheme_defaults_to_ws() {
        let config = FeedConfig::new("feeds.example.com/api", "a1").unwrap();
        assert_eq!(
            config.stream_url(7).as_str(),
            "ws://feeds.example.com/api/ws/auction/a1/?last_seq=7"
        );
        assert!(matches!(
            FeedConfig::new("http://example.com", "a1"),
            Err(ConfigError::Scheme(_))
        ));
    }

    #[test]
    fn from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = FeedConfig::from_env().unwrap();
        assert_eq!(config.endpoint.as_str(), "ws://127.0.0.1:8000/");
        assert_eq!(config.gap_timeout, Duration::from_secs(2));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(config.probe_lag_threshold, 10);
    }

    #[test]
    fn from_env_overrides_and_rejects_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("AUCTION_FEED_AUCTION_ID", "lot-9");
        env::set_var("AUCTION_FEED_GAP_TIMEOUT_MS", "500");
        env::set_var("AUCTION_FEED_MAX_RECONNECT_ATTEMPTS", "3");
        let config = FeedConfig::from_env().unwrap();
        assert_eq!(config.auction_id, "lot-9");
        assert_eq!(config.gap_timeout, Duration::from_millis(500));
        assert_eq!(config.max_reconnect_attempts, 3);

        env::set_var("AUCTION_FEED_PROBE_LAG_THRESHOLD", "ten");
        assert!(matches!(
            FeedConfig::from_env(),
            Err(ConfigError::Invalid {
                var: "AUCTION_FEED_PROBE_LAG_THRESHOLD",
                ..
            })
        ));
        clear_env();
    }
}
