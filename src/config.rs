use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, anyhow};

use crate::negotiation::DeliveryMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    /// Any `sqlite:` connection url
    Sqlite(String),
}

/// Which negotiation engine answers offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineKind {
    #[default]
    WebRtc,
    /// Answers locally without opening any transport
    Loopback,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webrtc" => Ok(Self::WebRtc),
            "loopback" => Ok(Self::Loopback),
            other => Err(anyhow!("unknown engine `{other}` (expected `webrtc` or `loopback`)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store: StoreBackend,
    pub session_ttl: Option<Duration>,
    pub room_ttl: Duration,
    pub history_limit: usize,
    pub delivery_mode: DeliveryMode,
    pub engine: EngineKind,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub stun_urls: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store: StoreBackend::Memory,
            session_ttl: None,
            room_ttl: Duration::from_secs(24 * 60 * 60),
            history_limit: 50,
            delivery_mode: DeliveryMode::Inline,
            engine: EngineKind::WebRtc,
            queue_capacity: 256,
            request_timeout: Duration::from_secs(30),
            stun_urls: vec!["stun:stun.l.google.com:19302".to_owned()],
        }
    }
}

impl Config {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = parse("BIND_ADDR", &addr)?;
        }
        if let Some(url) = lookup("STORE_URL") {
            config.store = match url.as_str() {
                "" | "memory" => StoreBackend::Memory,
                url if url.starts_with("sqlite:") => StoreBackend::Sqlite(url.to_owned()),
                other => return Err(anyhow!("STORE_URL: unsupported store `{other}`")),
            };
        }
        if let Some(secs) = lookup("SESSION_TTL_SECS") {
            config.session_ttl = Some(Duration::from_secs(parse("SESSION_TTL_SECS", &secs)?));
        }
        if let Some(secs) = lookup("ROOM_TTL_SECS") {
            config.room_ttl = Duration::from_secs(parse("ROOM_TTL_SECS", &secs)?);
        }
        if let Some(limit) = lookup("HISTORY_LIMIT") {
            config.history_limit = parse("HISTORY_LIMIT", &limit)?;
            if config.history_limit == 0 {
                return Err(anyhow!("HISTORY_LIMIT must be at least 1"));
            }
        }
        if let Some(mode) = lookup("DELIVERY_MODE") {
            config.delivery_mode = parse("DELIVERY_MODE", &mode)?;
        }
        if let Some(engine) = lookup("NEGOTIATION_ENGINE") {
            config.engine = engine.parse::<EngineKind>().context("NEGOTIATION_ENGINE")?;
        }
        if let Some(capacity) = lookup("QUEUE_CAPACITY") {
            config.queue_capacity = parse("QUEUE_CAPACITY", &capacity)?;
            if config.queue_capacity == 0 {
                return Err(anyhow!("QUEUE_CAPACITY must be at least 1"));
            }
        }
        if let Some(secs) = lookup("REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse("REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(urls) = lookup("STUN_URLS") {
            config.stun_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
                .collect();
        }

        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key}: cannot parse `{value}`"))
}
