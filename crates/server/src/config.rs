// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// `db::pool::PoolConfig`.

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

const DEV_JWT_SECRET: &str = "syncroom_local_development_jwt_secret_32_chars";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_RELAY_RETRY_MS: u64 = 1_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to verify bearer credentials.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` selects the in-memory backends.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: String,
    /// Log filter directive (e.g. `info`, `syncroom_server=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Identifies this process in relay frames and presence rows.
    pub instance_id: Uuid,
    /// Fixed delay between relay listener reconnect attempts.
    pub relay_retry_delay: Duration,
    /// Largest inbound websocket message accepted from a client.
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SYNCROOM_HOST` | `0.0.0.0` |
    /// | `SYNCROOM_PORT` | `8000` |
    /// | `SYNCROOM_JWT_SECRET` | dev-only placeholder |
    /// | `SYNCROOM_DATABASE_URL` | *(none, in-memory backends)* |
    /// | `SYNCROOM_CORS_ORIGINS` | `*` |
    /// | `SYNCROOM_LOG_FILTER` | `RUST_LOG`, then `info` |
    /// | `SYNCROOM_LOG_FORMAT` | `text` |
    /// | `SYNCROOM_INSTANCE_ID` | random UUID |
    /// | `SYNCROOM_RELAY_RETRY_MS` | `1000` |
    /// | `SYNCROOM_MAX_FRAME_BYTES` | `1048576` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("SYNCROOM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("SYNCROOM_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("SYNCROOM_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("SYNCROOM_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let cors_origins = env("SYNCROOM_CORS_ORIGINS").unwrap_or_else(|_| "*".into());

        let log_filter = env("SYNCROOM_LOG_FILTER")
            .or_else(|_| env("RUST_LOG"))
            .unwrap_or_else(|_| "info".into());
        let log_format = match env("SYNCROOM_LOG_FORMAT").ok().as_deref() {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let instance_id = env("SYNCROOM_INSTANCE_ID")
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);

        let relay_retry_ms = env("SYNCROOM_RELAY_RETRY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_RELAY_RETRY_MS);

        let max_frame_bytes = env("SYNCROOM_MAX_FRAME_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|bytes| *bytes > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            instance_id,
            relay_retry_delay: Duration::from_millis(relay_retry_ms),
            max_frame_bytes,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8000);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.cors_origins, "*");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.relay_retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("SYNCROOM_HOST", "127.0.0.1");
        m.insert("SYNCROOM_PORT", "9000");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("SYNCROOM_PORT", "not_a_number");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8000);
    }

    #[test]
    fn blank_database_url_selects_memory_backends() {
        let mut m = HashMap::new();
        m.insert("SYNCROOM_DATABASE_URL", "  ");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn log_filter_falls_back_to_rust_log() {
        let mut m = HashMap::new();
        m.insert("RUST_LOG", "syncroom_server=debug");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "syncroom_server=debug");

        let mut m = HashMap::new();
        m.insert("RUST_LOG", "warn");
        m.insert("SYNCROOM_LOG_FILTER", "debug,tower_http=trace");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }

    #[test]
    fn json_log_format_is_case_insensitive() {
        let mut m = HashMap::new();
        m.insert("SYNCROOM_LOG_FORMAT", "JSON");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn instance_id_is_read_when_valid() {
        let mut m = HashMap::new();
        m.insert("SYNCROOM_INSTANCE_ID", "00000000-0000-0000-0000-0000000000aa");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.instance_id.to_string(), "00000000-0000-0000-0000-0000000000aa");
    }

    #[test]
    fn zero_retry_delay_uses_default() {
        let mut m = HashMap::new();
        m.insert("SYNCROOM_RELAY_RETRY_MS", "0");
        m.insert("SYNCROOM_MAX_FRAME_BYTES", "4096");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.relay_retry_delay, Duration::from_millis(1_000));
        assert_eq!(cfg.max_frame_bytes, 4096);
    }
}
