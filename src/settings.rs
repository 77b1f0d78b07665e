use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Path of the embedded store file.
    pub database_url: String,
    /// JWT signing key; must be at least 32 bytes.
    pub secret_key: String,
    /// Fallback webhook signing secret for merchants without one.
    pub webhook_signing_secret: String,
    pub frontend_url: String,
    pub server_port: u16,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_webhook_timeout", with = "humantime_serde")]
    pub webhook_timeout: Duration,
    #[serde(default = "default_webhook_workers")]
    pub webhook_workers: usize,
    #[serde(default = "default_webhook_poll_interval", with = "humantime_serde")]
    pub webhook_poll_interval: Duration,
    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,
    #[serde(default = "default_webhook_lease", with = "humantime_serde")]
    pub webhook_lease: Duration,
    #[serde(default = "default_authorize_success_rate")]
    pub authorize_success_rate: f64,
    #[serde(default = "default_key_cache_ttl", with = "humantime_serde")]
    pub key_cache_ttl: Duration,
    #[serde(default = "default_order_ttl", with = "humantime_serde")]
    pub order_ttl: Duration,
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "payflow.redb".to_string(),
            secret_key: String::new(),
            webhook_signing_secret: "payflow-dev-signing-secret".to_string(),
            frontend_url: "http://localhost:5173".to_string(),
            server_port: 8080,
            request_timeout: default_request_timeout(),
            webhook_timeout: default_webhook_timeout(),
            webhook_workers: default_webhook_workers(),
            webhook_poll_interval: default_webhook_poll_interval(),
            webhook_max_attempts: default_webhook_max_attempts(),
            webhook_lease: default_webhook_lease(),
            authorize_success_rate: default_authorize_success_rate(),
            key_cache_ttl: default_key_cache_ttl(),
            order_ttl: default_order_ttl(),
            token_ttl: default_token_ttl(),
        }
    }
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: DATABASE_URL, SECRET_KEY, WEBHOOK_SIGNING_SECRET,
    /// FRONTEND_URL, SERVER_PORT, REQUEST_TIMEOUT, WEBHOOK_TIMEOUT,
    /// WEBHOOK_WORKERS, WEBHOOK_POLL_INTERVAL, WEBHOOK_MAX_ATTEMPTS,
    /// AUTHORIZE_SUCCESS_RATE, KEY_CACHE_TTL, ORDER_TTL, TOKEN_TTL
    pub fn load() -> Self {
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();

        if let Ok(v) = std::env::var("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = std::env::var("SECRET_KEY") {
            cfg.secret_key = v;
        }
        if let Ok(v) = std::env::var("WEBHOOK_SIGNING_SECRET") {
            cfg.webhook_signing_secret = v;
        }
        if let Ok(v) = std::env::var("FRONTEND_URL") {
            cfg.frontend_url = v;
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            cfg.server_port = v.parse().unwrap_or(cfg.server_port);
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT") {
            cfg.request_timeout = parse_duration_env(&v, cfg.request_timeout);
        }
        if let Ok(v) = std::env::var("WEBHOOK_TIMEOUT") {
            cfg.webhook_timeout = parse_duration_env(&v, cfg.webhook_timeout);
        }
        if let Ok(v) = std::env::var("WEBHOOK_WORKERS") {
            cfg.webhook_workers = v.parse().unwrap_or(cfg.webhook_workers);
        }
        if let Ok(v) = std::env::var("WEBHOOK_POLL_INTERVAL") {
            cfg.webhook_poll_interval = parse_duration_env(&v, cfg.webhook_poll_interval);
        }
        if let Ok(v) = std::env::var("WEBHOOK_MAX_ATTEMPTS") {
            cfg.webhook_max_attempts = v.parse().unwrap_or(cfg.webhook_max_attempts);
        }
        if let Ok(v) = std::env::var("AUTHORIZE_SUCCESS_RATE") {
            cfg.authorize_success_rate = v.parse().unwrap_or(cfg.authorize_success_rate);
        }
        if let Ok(v) = std::env::var("KEY_CACHE_TTL") {
            cfg.key_cache_ttl = parse_duration_env(&v, cfg.key_cache_ttl);
        }
        if let Ok(v) = std::env::var("ORDER_TTL") {
            cfg.order_ttl = parse_duration_env(&v, cfg.order_ttl);
        }
        if let Ok(v) = std::env::var("TOKEN_TTL") {
            cfg.token_ttl = parse_duration_env(&v, cfg.token_ttl);
        }

        cfg
    }

    /// Reject configurations the process cannot safely start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.secret_key.len() < 32 {
            anyhow::bail!("SECRET_KEY must be at least 32 bytes");
        }
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL must not be empty");
        }
        if !(0.0..=1.0).contains(&self.authorize_success_rate) {
            anyhow::bail!("AUTHORIZE_SUCCESS_RATE must be within [0, 1]");
        }
        if self.webhook_workers == 0 {
            anyhow::bail!("WEBHOOK_WORKERS must be at least 1");
        }
        Ok(())
    }
}

fn parse_duration_env(value: &str, current: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(current)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_webhook_workers() -> usize {
    4
}

fn default_webhook_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_webhook_max_attempts() -> u32 {
    8
}

fn default_webhook_lease() -> Duration {
    Duration::from_secs(30)
}

fn default_authorize_success_rate() -> f64 {
    0.96
}

fn default_key_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_order_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_short_secret() {
        let mut cfg = Config::default();
        cfg.secret_key = "short".to_string();
        assert!(cfg.validate().is_err());

        cfg.secret_key = "0123456789abcdef0123456789abcdef".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_success_rate() {
        let mut cfg = Config::default();
        cfg.secret_key = "0123456789abcdef0123456789abcdef".to_string();
        cfg.authorize_success_rate = 1.5;
        assert!(cfg.validate().is_err());
    }
}
