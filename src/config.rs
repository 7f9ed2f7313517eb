use std::collections::HashMap;
use std::path::PathBuf;

/// Server settings, read from `SLOTKEEPER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Journal commits since the last rewrite that trigger compaction.
    pub compact_threshold: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "{key}: invalid value {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_getter(|key| std::env::var(key).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_connections = parse_or(&get, "SLOTKEEPER_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "SLOTKEEPER_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        Ok(ServerConfig {
            port: parse_or(&get, "SLOTKEEPER_PORT", 5433)?,
            bind: get("SLOTKEEPER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("SLOTKEEPER_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("SLOTKEEPER_PASSWORD").unwrap_or_else(|| "slotkeeper".into()),
            max_connections,
            compact_threshold: parse_or(&get, "SLOTKEEPER_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&get, "SLOTKEEPER_METRICS_PORT")?,
            tls_cert: get("SLOTKEEPER_TLS_CERT").filter(|s| !s.is_empty()),
            tls_key: get("SLOTKEEPER_TLS_KEY").filter(|s| !s.is_empty()),
        })
    }

    /// Create config from a HashMap (convenience for testing)
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self, ConfigError> {
        Self::from_getter(|key| map.get(key).map(|v| v.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<F, T>(get: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key).filter(|s| !s.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_or<F, T>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}
