//! Server configuration: all from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for WebSocket + REST.
    pub listen_addr: String,
    /// Server instance name (shows up in logs and /healthz).
    pub server_instance: String,
    /// Shared HS256 secret, identical to the HTTP session layer's.
    /// `None` means every connection degrades to anonymous.
    pub jwt_secret: Option<String>,
    /// Cookie carrying the session token on the upgrade request.
    pub token_cookie: String,
    /// How often every connection is pinged.
    pub heartbeat_interval: Duration,
    /// A connection whose last pong is older than this is evicted.
    pub heartbeat_timeout: Duration,
    /// Per-connection outbound queue depth. Frames beyond it are dropped.
    pub outbound_buffer: usize,
    /// Largest inbound WebSocket message accepted; bigger ones close the connection.
    pub max_message_bytes: usize,
    /// Admit unauthenticated connections to user/workspace channels.
    /// Local development only.
    pub allow_anonymous_channels: bool,
    /// Browser origin allowed to open the channel with credentials.
    pub cors_origin: String,
    /// Key the CRUD layer presents on the producer endpoints.
    /// `None` disables those endpoints.
    pub producer_key: Option<String>,
    /// Cadence of the scheduled deadline scan.
    pub deadline_scan_interval: Duration,
    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,
    /// Log level filter.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            server_instance: env::var("SERVER_INSTANCE").unwrap_or_else(|_| hostname()),
            jwt_secret: env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            token_cookie: env::var("TOKEN_COOKIE").unwrap_or_else(|_| "token".into()),
            heartbeat_interval: Duration::from_secs(parse_env("HEARTBEAT_INTERVAL_SECS", 25)),
            heartbeat_timeout: Duration::from_secs(parse_env("HEARTBEAT_TIMEOUT_SECS", 60)),
            outbound_buffer: parse_env("OUTBOUND_BUFFER", 256),
            max_message_bytes: parse_env("MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES),
            allow_anonymous_channels: parse_env("ALLOW_ANONYMOUS_CHANNELS", false),
            cors_origin: env::var("CORS_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:5173".into()),
            producer_key: env::var("PRODUCER_KEY").ok().filter(|s| !s.is_empty()),
            deadline_scan_interval: Duration::from_secs(parse_env(
                "DEADLINE_SCAN_INTERVAL_SECS",
                86_400,
            )),
            json_logs: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "beacond=info,tower_http=info".into()),
        }
    }
}

impl Default for Config {
    /// Development defaults, independent of the process environment.
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".into(),
            server_instance: "local".into(),
            jwt_secret: None,
            token_cookie: "token".into(),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            outbound_buffer: 256,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            allow_anonymous_channels: false,
            cors_origin: "http://localhost:5173".into(),
            producer_key: None,
            deadline_scan_interval: Duration::from_secs(86_400),
            json_logs: false,
            log_level: "beacond=info,tower_http=info".into(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into())
}
