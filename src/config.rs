use std::{str::FromStr, time::Duration};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub persist_timeout: Duration,
    pub page_limit_default: u32,
    pub page_limit_max: u32,
    pub session_idle_minutes: i64,
    pub client_url: Option<String>,
    /// Undelivered events a connection may queue before it is dropped.
    pub outbound_queue: usize,
    /// Accept a bare `?username=` on the websocket handshake when there is
    /// no login session. Only for trusted deployments.
    pub allow_handshake_claim: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0:8080".to_owned(),
            database_url: "sqlite://roomsync.db?mode=rwc".to_owned(),
            db_max_connections: 16,
            persist_timeout: Duration::from_millis(5000),
            page_limit_default: 50,
            page_limit_max: 200,
            session_idle_minutes: 15,
            client_url: None,
            outbound_queue: 256,
            allow_handshake_claim: false,
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let defaults = Config::default();

        let config = Config {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.db_max_connections),
            persist_timeout: parse(&lookup, "PERSIST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_timeout),
            page_limit_default: parse(&lookup, "PAGE_LIMIT_DEFAULT")?
                .unwrap_or(defaults.page_limit_default),
            page_limit_max: parse(&lookup, "PAGE_LIMIT_MAX")?
                .unwrap_or(defaults.page_limit_max),
            session_idle_minutes: parse(&lookup, "SESSION_IDLE_MINUTES")?
                .unwrap_or(defaults.session_idle_minutes),
            client_url: lookup("CLIENT_URL").filter(|url| !url.is_empty()),
            outbound_queue: parse(&lookup, "OUTBOUND_QUEUE")?.unwrap_or(defaults.outbound_queue),
            allow_handshake_claim: parse(&lookup, "ALLOW_HANDSHAKE_CLAIM")?
                .unwrap_or(defaults.allow_handshake_claim),
        };

        anyhow::ensure!(config.page_limit_max > 0, "PAGE_LIMIT_MAX must be positive");
        anyhow::ensure!(config.outbound_queue > 0, "OUTBOUND_QUEUE must be positive");
        anyhow::ensure!(
            config.page_limit_default <= config.page_limit_max,
            "PAGE_LIMIT_DEFAULT exceeds PAGE_LIMIT_MAX"
        );
        Ok(config)
    }

    /// Clamps a requested page size into `1..=page_limit_max`.
    pub fn page_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.page_limit_default)
            .clamp(1, self.page_limit_max)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("{key}={raw:?} is not valid")))
        .transpose()
}
