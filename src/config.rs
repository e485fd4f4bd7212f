//! Configuration types and constants.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Notification snapshot re-pull interval, independent of push delivery.
pub const NOTIFICATION_POLL_INTERVAL_SECS: u64 = 30;
pub const WS_BACKOFF_INITIAL_SECS: u64 = 2;
pub const WS_BACKOFF_MAX_SECS: u64 = 60;
/// Relative jitter applied to every reconnect delay.
pub const WS_BACKOFF_JITTER: f64 = 0.2;
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

pub const MAX_MESSAGE_CHARS: usize = 4_000;
pub const MAX_ATTACHMENT_BYTES: usize = 25 * 1024 * 1024; // 25 MiB

/// Accepted content-type prefixes for outgoing documents. Images, video and
/// audio are matched on their top-level type.
pub const ALLOWED_DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "text/plain",
];

/// Runtime settings shared by the controllers and the transports.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub api_url: String,
    pub ws_url: String,
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3000/api".to_string(),
            ws_url: "ws://127.0.0.1:3000/ws".to_string(),
            poll_interval: Duration::from_secs(NOTIFICATION_POLL_INTERVAL_SECS),
            backoff_initial: Duration::from_secs(WS_BACKOFF_INITIAL_SECS),
            backoff_max: Duration::from_secs(WS_BACKOFF_MAX_SECS),
        }
    }
}

/// Follow conversations and notifications for one account from the terminal.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "congregate-tail", version, about)]
pub struct Cli {
    /// REST base URL [env: CONGREGATE_API_URL] [default: http://127.0.0.1:3000/api]
    #[arg(long, short = 'a')]
    pub api_url: Option<String>,

    /// Event bus URL [env: CONGREGATE_WS_URL] [default: ws://127.0.0.1:3000/ws]
    #[arg(long, short = 'w')]
    pub ws_url: Option<String>,

    /// Data directory for the session database [env: CONGREGATE_HOME] [default: ~/.congregate]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Bearer token; stored in the session database when given [env: CONGREGATE_TOKEN]
    #[arg(long, short = 't')]
    pub token: Option<String>,

    /// Local user id, required together with --token
    #[arg(long, short = 'u')]
    pub user: Option<String>,

    /// Conversation scope to follow
    #[arg(long, default_value = "principal")]
    pub scope: String,
}

pub struct Config {
    pub sync: SyncConfig,
    pub data_dir: PathBuf,
    pub token: Option<String>,
    pub user: Option<String>,
    pub scope: String,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let defaults = SyncConfig::default();

        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("CONGREGATE_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".congregate"))
                    .unwrap_or_else(|_| PathBuf::from(".congregate"))
            });

        let api_url = cli
            .api_url
            .or_else(|| std::env::var("CONGREGATE_API_URL").ok())
            .unwrap_or(defaults.api_url);

        let ws_url = cli
            .ws_url
            .or_else(|| std::env::var("CONGREGATE_WS_URL").ok())
            .unwrap_or(defaults.ws_url);

        let token = cli
            .token
            .or_else(|| std::env::var("CONGREGATE_TOKEN").ok());

        Self {
            sync: SyncConfig {
                api_url,
                ws_url,
                ..defaults
            },
            data_dir,
            token,
            user: cli.user,
            scope: cli.scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_take_precedence() {
        let cli = Cli::parse_from([
            "congregate-tail",
            "--api-url",
            "http://example.test/api",
            "--data-dir",
            "/tmp/congregate-test",
        ]);
        let config = Config::from_cli_and_env(cli);
        assert_eq!(config.sync.api_url, "http://example.test/api");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/congregate-test"));
        assert_eq!(config.scope, "principal");
        assert_eq!(config.sync.poll_interval, Duration::from_secs(30));
    }
}
