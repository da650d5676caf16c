use std::path::PathBuf;
use std::time::Duration;

use auction_feed_client::config::{
    ConfigError, DEFAULT_ENDPOINT, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_PROBE_LAG_THRESHOLD,
};
use auction_feed_client::logging::{LogConfig, LogLevel};
use auction_feed_client::FeedConfig;
use clap::{Args, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "auction-feed",
    about = "Follow a live auction bid stream and place bids from stdin",
    version
)]
pub struct Cli {
    #[arg(env = "AUCTION_FEED_AUCTION_ID", help = "Auction to follow")]
    pub auction_id: String,

    #[arg(
        long,
        env = "AUCTION_FEED_ENDPOINT",
        default_value = DEFAULT_ENDPOINT,
        help = "Base URL of the auction server (ws:// or wss://)"
    )]
    pub endpoint: String,

    #[command(flatten)]
    pub tuning: TuningArgs,

    #[arg(long, help = "Print accepted events as JSON lines")]
    pub json: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct TuningArgs {
    #[arg(
        long = "gap-timeout-ms",
        env = "AUCTION_FEED_GAP_TIMEOUT_MS",
        default_value_t = 2_000,
        help = "How long an out-of-order event waits before a resync"
    )]
    pub gap_timeout_ms: u64,

    #[arg(
        long = "max-reconnect-attempts",
        env = "AUCTION_FEED_MAX_RECONNECT_ATTEMPTS",
        default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS
    )]
    pub max_reconnect_attempts: u32,

    #[arg(
        long = "reconnect-base-delay-ms",
        env = "AUCTION_FEED_RECONNECT_BASE_DELAY_MS",
        default_value_t = 1_000,
        help = "First reconnect delay; doubles on every further attempt"
    )]
    pub reconnect_base_delay_ms: u64,

    #[arg(
        long = "probe-lag-threshold",
        env = "AUCTION_FEED_PROBE_LAG_THRESHOLD",
        default_value_t = DEFAULT_PROBE_LAG_THRESHOLD
    )]
    pub probe_lag_threshold: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "AUCTION_FEED_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "AUCTION_FEED_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn feed_config(&self) -> Result<FeedConfig, ConfigError> {
        let mut config = FeedConfig::new(&self.endpoint, self.auction_id.clone())?;
        config.gap_timeout = Duration::from_millis(self.tuning.gap_timeout_ms);
        config.max_reconnect_attempts = self.tuning.max_reconnect_attempts;
        config.reconnect_base_delay = Duration::from_millis(self.tuning.reconnect_base_delay_ms);
        config.probe_lag_threshold = self.tuning.probe_lag_threshold;
        Ok(config)
    }
}

/// One line of operator input.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Bid(&'a str),
    Sync,
    Reconnect,
    Stats,
    Status,
    Help,
    Quit,
    Unknown(&'a str),
}

pub fn parse_input(line: &str) -> Option<Input<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(word, rest)| (word, rest.trim()))
        .unwrap_or((line, ""));
    let input = match word {
        "bid" | "b" => Input::Bid(rest),
        "sync" => Input::Sync,
        "reconnect" => Input::Reconnect,
        "stats" => Input::Stats,
        "status" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        _ => Input::Unknown(word),
    };
    Some(input)
}
