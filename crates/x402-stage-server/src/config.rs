use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_ORACLE_URL: &str = "http://localhost:4022";
const DEFAULT_PORT: u16 = 4030;
const DEFAULT_DB_PATH: &str = "./x402-stage.db";
const DEFAULT_RATE_LIMIT_RPM: u32 = 120;
const DEFAULT_SSE_KEEPALIVE_SECS: u64 = 15;

#[derive(Clone)]
pub struct ServerConfig {
    /// Base URL of the verification/settlement oracle
    pub oracle_url: String,
    /// HMAC shared secret for signing oracle requests (None = unsigned)
    pub oracle_secret: Option<Vec<u8>>,
    pub verify_timeout: Duration,
    pub settle_timeout: Duration,
    /// SQLite database path
    pub db_path: String,
    /// JSON catalog seed loaded at startup
    pub catalog_path: Option<String>,
    /// Server port
    pub port: u16,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// Rate limit requests per minute
    pub rate_limit_rpm: u32,
    /// Interval between SSE keepalive comments
    pub sse_keepalive: Duration,
    /// Bearer token required for /metrics endpoint (None = public)
    pub metrics_token: Option<String>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("oracle_url", &self.oracle_url)
            .field(
                "oracle_secret",
                &self.oracle_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("verify_timeout", &self.verify_timeout)
            .field("settle_timeout", &self.settle_timeout)
            .field("db_path", &self.db_path)
            .field("catalog_path", &self.catalog_path)
            .field("port", &self.port)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("sse_keepalive", &self.sse_keepalive)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            oracle_url: DEFAULT_ORACLE_URL.to_string(),
            oracle_secret: None,
            verify_timeout: Duration::from_secs(x402::VERIFY_TIMEOUT_SECS),
            settle_timeout: Duration::from_secs(x402::SETTLE_TIMEOUT_SECS),
            db_path: DEFAULT_DB_PATH.to_string(),
            catalog_path: None,
            port: DEFAULT_PORT,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            rate_limit_rpm: DEFAULT_RATE_LIMIT_RPM,
            sse_keepalive: Duration::from_secs(DEFAULT_SSE_KEEPALIVE_SECS),
            metrics_token: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let oracle_url = get("ORACLE_URL").unwrap_or(defaults.oracle_url);
        Url::parse(&oracle_url).map_err(|_| ConfigError::InvalidUrl(oracle_url.clone()))?;

        let oracle_secret = get("ORACLE_SHARED_SECRET").map(|s| s.into_bytes());

        let verify_timeout = match get("ORACLE_VERIFY_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_number("ORACLE_VERIFY_TIMEOUT_SECS", &v)?),
            None => defaults.verify_timeout,
        };
        let settle_timeout = match get("ORACLE_SETTLE_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_number("ORACLE_SETTLE_TIMEOUT_SECS", &v)?),
            None => defaults.settle_timeout,
        };

        let db_path = get("DB_PATH").unwrap_or(defaults.db_path);
        let catalog_path = get("CATALOG_PATH");

        let port = match get("PORT") {
            Some(v) => parse_number("PORT", &v)?,
            None => defaults.port,
        };

        let allowed_origins: Vec<String> = match get("ALLOWED_ORIGINS") {
            Some(s) => s
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.allowed_origins,
        };

        let rate_limit_rpm = match get("RATE_LIMIT_RPM") {
            Some(v) => parse_number("RATE_LIMIT_RPM", &v)?,
            None => defaults.rate_limit_rpm,
        };
        if rate_limit_rpm == 0 {
            return Err(ConfigError::InvalidValue("RATE_LIMIT_RPM", "0".to_string()));
        }

        let sse_keepalive = match get("SSE_KEEPALIVE_SECS") {
            Some(v) => Duration::from_secs(parse_number("SSE_KEEPALIVE_SECS", &v)?),
            None => defaults.sse_keepalive,
        };
        if sse_keepalive.is_zero() {
            return Err(ConfigError::InvalidValue("SSE_KEEPALIVE_SECS", "0".to_string()));
        }

        let metrics_token = get("METRICS_TOKEN");

        if let Some(ref secret) = oracle_secret {
            if secret.len() < 32 {
                tracing::warn!(
                    "ORACLE_SHARED_SECRET is short ({} bytes, recommended minimum 32)",
                    secret.len()
                );
            }
        } else {
            tracing::warn!("ORACLE_SHARED_SECRET not set; oracle requests will be unsigned");
        }

        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set; /metrics endpoint is publicly accessible");
        }

        Ok(Self {
            oracle_url,
            oracle_secret,
            verify_timeout,
            settle_timeout,
            db_path,
            catalog_path,
            port,
            allowed_origins,
            rate_limit_rpm,
            sse_keepalive,
            metrics_token,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key, value.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.oracle_url, "http://localhost:4022");
        assert_eq!(config.port, 4030);
        assert_eq!(config.verify_timeout, Duration::from_secs(10));
        assert_eq!(config.settle_timeout, Duration::from_secs(15));
        assert_eq!(config.sse_keepalive, Duration::from_secs(15));
        assert_eq!(config.rate_limit_rpm, 120);
        assert!(config.oracle_secret.is_none());
        assert!(config.catalog_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("ORACLE_URL", "https://oracle.example.com"),
            ("ORACLE_SETTLE_TIMEOUT_SECS", "30"),
            ("PORT", "8080"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("CATALOG_PATH", "catalog.json"),
        ])
        .unwrap();
        assert_eq!(config.oracle_url, "https://oracle.example.com");
        assert_eq!(config.settle_timeout, Duration::from_secs(30));
        assert_eq!(config.port, 8080);
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.catalog_path.as_deref(), Some("catalog.json"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config_from(&[("ORACLE_URL", "not a url")]),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            config_from(&[("PORT", "eighty")]),
            Err(ConfigError::InvalidValue("PORT", _))
        ));
        assert!(config_from(&[("RATE_LIMIT_RPM", "0")]).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = config_from(&[
            ("ORACLE_SHARED_SECRET", "super-secret-value-that-is-long-enough"),
            ("METRICS_TOKEN", "token-123"),
        ])
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("token-123"));
        assert!(debug.contains("[REDACTED]"));
    }
}
