//! Runtime configuration, read once at startup.
//!
//! Every parameter has a default and can be overridden via `MEDIAGATE_*`
//! environment variables. Optional values that fail to parse fall back to
//! the default with a warning; the process never refuses to start over a
//! malformed optional setting.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Base URLs of the downstream provider engines.
///
/// Each provider is optional: a route whose engine is unconfigured answers
/// with the provider-failure envelope instead of preventing startup.
#[derive(Debug, Clone, Default)]
pub struct ProviderEndpoints {
    /// Media extraction engine (search + mp3/mp4 resolution).
    pub media: Option<String>,
    /// AI chat backend.
    pub chat: Option<String>,
    /// Headless-browser screenshot renderer.
    pub screenshot: Option<String>,
    /// Outbound mail relay for contact messages.
    pub mail: Option<String>,
}

/// Gateway runtime configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address for both the gateway and admin listeners.
    pub bind: String,
    /// Main gateway port.
    pub port: u16,
    /// Dedicated admin port (health, metrics).
    pub admin_port: u16,

    /// Attribution string stamped into every envelope.
    pub author: String,

    /// Breaker threshold: requests allowed per one-second window.
    pub rate_limit: u32,

    /// Deadline for provider calls. Media extraction and rendering run for
    /// minutes, so this sits far above normal API response expectations.
    pub provider_timeout: Duration,
    /// TCP + TLS connect deadline for provider calls.
    pub provider_connect_timeout: Duration,

    /// Per-chunk deadline for relayed streams.
    pub stream_chunk_timeout: Duration,
    /// Total deadline for one relayed stream.
    pub stream_total_timeout: Duration,

    /// Upper bound on concurrently served connections.
    pub max_connections: usize,
    /// Hard deadline for a whole connection on JSON routes does not apply
    /// to relayed streams; this guards leaked idle connections.
    pub connection_timeout: Duration,

    pub tcp_nodelay: bool,
    pub tcp_keepalive_secs: u64,
    pub socket_buffer_size: usize,

    /// Working tree captured by snapshot backups.
    pub backup_root: PathBuf,
    /// Directory where backup archives are staged before delivery.
    pub backup_staging: PathBuf,

    /// Optional cache capacity; `None` keeps entries for the process
    /// lifetime.
    pub cache_capacity: Option<usize>,

    pub providers: ProviderEndpoints,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7770,
            admin_port: 7772,
            author: "mediagate".to_string(),
            rate_limit: 50,
            provider_timeout: Duration::from_secs(180),
            provider_connect_timeout: Duration::from_secs(10),
            stream_chunk_timeout: Duration::from_secs(60),
            stream_total_timeout: Duration::from_secs(3600),
            max_connections: 1024,
            connection_timeout: Duration::from_secs(3600),
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            socket_buffer_size: 262144, // 256 KB
            backup_root: PathBuf::from("."),
            backup_staging: std::env::temp_dir(),
            cache_capacity: None,
            providers: ProviderEndpoints::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `MEDIAGATE_BIND` (default: 0.0.0.0)
    /// - `MEDIAGATE_PORT` (default: 7770)
    /// - `MEDIAGATE_ADMIN_PORT` (default: 7772)
    /// - `MEDIAGATE_AUTHOR` (default: mediagate)
    /// - `MEDIAGATE_RATE_LIMIT` (default: 50)
    /// - `MEDIAGATE_PROVIDER_TIMEOUT_SECS` (default: 180)
    /// - `MEDIAGATE_PROVIDER_CONNECT_TIMEOUT_SECS` (default: 10)
    /// - `MEDIAGATE_STREAM_CHUNK_TIMEOUT_SECS` (default: 60)
    /// - `MEDIAGATE_STREAM_TOTAL_TIMEOUT_SECS` (default: 3600)
    /// - `MEDIAGATE_MAX_CONNECTIONS` (default: 1024)
    /// - `MEDIAGATE_CONNECTION_TIMEOUT_SECS` (default: 3600)
    /// - `MEDIAGATE_TCP_NODELAY` (default: true)
    /// - `MEDIAGATE_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `MEDIAGATE_SOCKET_BUFFER_SIZE` (default: 262144)
    /// - `MEDIAGATE_BACKUP_ROOT` (default: .)
    /// - `MEDIAGATE_BACKUP_STAGING` (default: system temp dir)
    /// - `MEDIAGATE_CACHE_CAPACITY` (default: unbounded)
    /// - `MEDIAGATE_MEDIA_URL`, `MEDIAGATE_CHAT_URL`,
    ///   `MEDIAGATE_SCREENSHOT_URL`, `MEDIAGATE_MAIL_URL` (default: unset)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind: env_string("MEDIAGATE_BIND", default.bind),
            port: parse_env_warn("MEDIAGATE_PORT", default.port),
            admin_port: parse_env_warn("MEDIAGATE_ADMIN_PORT", default.admin_port),
            author: env_string("MEDIAGATE_AUTHOR", default.author),
            rate_limit: parse_env_warn("MEDIAGATE_RATE_LIMIT", default.rate_limit),
            provider_timeout: Duration::from_secs(parse_env_warn(
                "MEDIAGATE_PROVIDER_TIMEOUT_SECS",
                default.provider_timeout.as_secs(),
            )),
            provider_connect_timeout: Duration::from_secs(parse_env_warn(
                "MEDIAGATE_PROVIDER_CONNECT_TIMEOUT_SECS",
                default.provider_connect_timeout.as_secs(),
            )),
            stream_chunk_timeout: Duration::from_secs(parse_env_warn(
                "MEDIAGATE_STREAM_CHUNK_TIMEOUT_SECS",
                default.stream_chunk_timeout.as_secs(),
            )),
            stream_total_timeout: Duration::from_secs(parse_env_warn(
                "MEDIAGATE_STREAM_TOTAL_TIMEOUT_SECS",
                default.stream_total_timeout.as_secs(),
            )),
            max_connections: parse_env_warn("MEDIAGATE_MAX_CONNECTIONS", default.max_connections),
            connection_timeout: Duration::from_secs(parse_env_warn(
                "MEDIAGATE_CONNECTION_TIMEOUT_SECS",
                default.connection_timeout.as_secs(),
            )),
            tcp_nodelay: parse_env_warn("MEDIAGATE_TCP_NODELAY", default.tcp_nodelay),
            tcp_keepalive_secs: parse_env_warn(
                "MEDIAGATE_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),
            socket_buffer_size: parse_env_warn(
                "MEDIAGATE_SOCKET_BUFFER_SIZE",
                default.socket_buffer_size,
            ),
            backup_root: PathBuf::from(env_string(
                "MEDIAGATE_BACKUP_ROOT",
                default.backup_root.display().to_string(),
            )),
            backup_staging: PathBuf::from(env_string(
                "MEDIAGATE_BACKUP_STAGING",
                default.backup_staging.display().to_string(),
            )),
            cache_capacity: std::env::var("MEDIAGATE_CACHE_CAPACITY")
                .ok()
                .and_then(|val| match val.parse::<usize>() {
                    Ok(capacity) => Some(capacity),
                    Err(_) => {
                        warn!(
                            env_var = "MEDIAGATE_CACHE_CAPACITY",
                            value = %val,
                            "Invalid value for environment variable, cache stays unbounded"
                        );
                        None
                    }
                }),
            providers: ProviderEndpoints {
                media: std::env::var("MEDIAGATE_MEDIA_URL").ok(),
                chat: std::env::var("MEDIAGATE_CHAT_URL").ok(),
                screenshot: std::env::var("MEDIAGATE_SCREENSHOT_URL").ok(),
                mail: std::env::var("MEDIAGATE_MAIL_URL").ok(),
            },
        }
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns
/// the default. If the env var is not set, returns the default silently.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
