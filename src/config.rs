//! Server configuration
//!
//! Everything is environment-driven with sensible defaults, so the same
//! binary can run on every node behind the load balancer.

use std::time::Duration;

use crate::error::{ChatError, Result};

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection URL
    pub database_url: String,
    /// Redis URL for the KV store
    pub kv_url: String,
    /// Redis URL for the pub/sub bus (may coincide with the KV store)
    pub bus_url: String,
    /// HMAC secret for signed tokens
    pub token_secret: String,
    /// Token lifetime
    pub token_lifetime: Duration,
    /// Allowed CORS origins ("*" for any)
    pub allowed_origins: Vec<String>,
    /// Port to listen on
    pub port: u16,
    /// Log filter (RUST_LOG syntax)
    pub log_level: String,
    /// DB connection pool size
    pub db_pool_size: u32,
    /// Reaper period
    pub reap_interval: Duration,
    /// Heartbeat age after which a user is considered gone
    pub stale_threshold: Duration,
    /// Max entries in a room's recent-message cache
    pub recent_cache_size: usize,
    /// TTL on a room's recent-message cache
    pub cache_ttl: Duration,
    /// TTL on heartbeat keys
    pub heartbeat_ttl: Duration,
    /// TTL on session keys (refreshed on activity)
    pub session_ttl: Duration,
    /// Per-event deadline for DB/KV calls inside a handler
    pub event_deadline: Duration,
    /// Grace period for draining in-flight handlers on shutdown
    pub shutdown_grace: Duration,
    /// Policy: purge a leaver's messages from the room cache
    pub purge_cache_on_leave: bool,
    /// Policy: proactively mark local users offline on shutdown
    pub offline_on_shutdown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/chorus".to_string(),
            kv_url: "redis://localhost:6379".to_string(),
            bus_url: "redis://localhost:6379".to_string(),
            token_secret: "dev-secret-change-me".to_string(),
            token_lifetime: Duration::from_secs(24 * 60 * 60),
            allowed_origins: vec!["*".to_string()],
            port: 8080,
            log_level: "info".to_string(),
            db_pool_size: 20,
            reap_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(180),
            recent_cache_size: 100,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            heartbeat_ttl: Duration::from_secs(30),
            session_ttl: Duration::from_secs(60 * 60),
            event_deadline: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            purge_cache_on_leave: false,
            offline_on_shutdown: false,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let database_url = env_or("DATABASE_URL", &defaults.database_url);
        let kv_url = env_or("REDIS_URL", &defaults.kv_url);
        // The bus rides the same Redis unless pointed elsewhere.
        let bus_url = env_or("BUS_URL", &kv_url);

        let config = Self {
            database_url,
            kv_url,
            bus_url,
            token_secret: env_or("TOKEN_SECRET", &defaults.token_secret),
            token_lifetime: env_secs("TOKEN_LIFETIME_SECS", defaults.token_lifetime)?,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.allowed_origins),
            port: env_parse("PORT", defaults.port)?,
            log_level: env_or("RUST_LOG", &defaults.log_level),
            db_pool_size: env_parse("DB_POOL_SIZE", defaults.db_pool_size)?,
            reap_interval: env_secs("REAP_INTERVAL_SECS", defaults.reap_interval)?,
            stale_threshold: env_secs("STALE_THRESHOLD_SECS", defaults.stale_threshold)?,
            recent_cache_size: env_parse("RECENT_CACHE_SIZE", defaults.recent_cache_size)?,
            cache_ttl: env_secs("CACHE_TTL_SECS", defaults.cache_ttl)?,
            heartbeat_ttl: env_secs("HEARTBEAT_TTL_SECS", defaults.heartbeat_ttl)?,
            session_ttl: env_secs("SESSION_TTL_SECS", defaults.session_ttl)?,
            event_deadline: env_secs("EVENT_DEADLINE_SECS", defaults.event_deadline)?,
            shutdown_grace: env_secs("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            purge_cache_on_leave: env_bool("PURGE_CACHE_ON_LEAVE", defaults.purge_cache_on_leave)?,
            offline_on_shutdown: env_bool("OFFLINE_ON_SHUTDOWN", defaults.offline_on_shutdown)?,
        };

        if config.recent_cache_size == 0 {
            return Err(ChatError::validation("RECENT_CACHE_SIZE must be positive"));
        }

        Ok(config)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ChatError::validation(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ChatError::validation(format!(
                "invalid value for {}: {}",
                key, raw
            ))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_expectations() {
        let config = Config::default();
        assert_eq!(config.reap_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(180));
        assert_eq!(config.recent_cache_size, 100);
        assert_eq!(config.cache_ttl, Duration::from_secs(86400));
        assert!(!config.purge_cache_on_leave);
        assert!(!config.offline_on_shutdown);
    }
}
