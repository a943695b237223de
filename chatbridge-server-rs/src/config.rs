use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_MODEL: &str = "gpt-5-nano";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_ECHO_DELAY_MS: u64 = 50;
pub const DEFAULT_UNATTACHED_TTL_SECS: u64 = 300;

/// Which tool loop backs the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Echo,
    Llm,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "echo" => Ok(EngineKind::Echo),
            "llm" => Ok(EngineKind::Llm),
            other => Err(format!("unknown engine {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub engine: EngineKind,
    pub model: String,
    pub api_key: Option<String>,
    pub channel_capacity: usize,
    pub heartbeat: Duration,
    pub echo_delay: Duration,
    /// How long a session may live without an event stream.
    pub unattached_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            engine: EngineKind::Echo,
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            channel_capacity: chatbridge_sdk_rs::delivery::DEFAULT_CHANNEL_CAPACITY,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            echo_delay: Duration::from_millis(DEFAULT_ECHO_DELAY_MS),
            unattached_ttl: Duration::from_secs(DEFAULT_UNATTACHED_TTL_SECS),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from `lookup`. Unparsable values fall back to the
    /// default and are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            addr: lookup("CHATBRIDGE_ADDR").unwrap_or(defaults.addr),
            engine: parse_or(&lookup, "CHATBRIDGE_ENGINE", defaults.engine),
            model: lookup("CHATBRIDGE_MODEL").unwrap_or(defaults.model),
            api_key: lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()),
            channel_capacity: parse_or(
                &lookup,
                "CHATBRIDGE_CHANNEL_CAPACITY",
                defaults.channel_capacity,
            ),
            heartbeat: Duration::from_secs(positive_or(
                &lookup,
                "CHATBRIDGE_HEARTBEAT_SECS",
                DEFAULT_HEARTBEAT_SECS,
            )),
            echo_delay: Duration::from_millis(parse_or(
                &lookup,
                "CHATBRIDGE_ECHO_DELAY_MS",
                DEFAULT_ECHO_DELAY_MS,
            )),
            unattached_ttl: Duration::from_secs(positive_or(
                &lookup,
                "CHATBRIDGE_UNATTACHED_TTL_SECS",
                DEFAULT_UNATTACHED_TTL_SECS,
            )),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(key, value = %raw, error = %e, default = %default, "Invalid config value, using default");
                default
            }
        },
    }
}

/// Like [`parse_or`], but zero also falls back to the default.
fn positive_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    match parse_or(lookup, key, default) {
        0 => {
            warn!(key, default, "Config value must be positive, using default");
            default
        }
        value => value,
    }
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Echo => write!(f, "echo"),
            EngineKind::Llm => write!(f, "llm"),
        }
    }
}
