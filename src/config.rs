use std::env;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime configuration, loaded once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// When absent the service runs against the in-memory store.
    pub database_url: Option<String>,
    pub supabase: SupabaseConfig,
    pub cookie_secure: bool,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
    /// Set when a reverse proxy appends the client address to `X-Forwarded-For`.
    pub trust_forwarded_for: bool,
    pub mail: Option<MailConfig>,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
    pub jwt_secret: String,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Config {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let bind_raw = get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3000".to_string());
        let bind_addr = bind_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "BIND_ADDR",
            value: bind_raw.clone(),
        })?;

        let supabase = SupabaseConfig {
            url: require("SUPABASE_URL")?.trim_end_matches('/').to_string(),
            anon_key: require("SUPABASE_ANON_KEY")?,
            jwt_secret: require("SUPABASE_JWT_SECRET")?,
        };

        let rate_limit_per_minute = match get("RATE_LIMIT_PER_MINUTE") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "RATE_LIMIT_PER_MINUTE",
                        value: raw,
                    })
                }
            },
            None => 30,
        };

        // Mail is all-or-nothing
        let mail = match (get("MAIL_API_URL"), get("MAIL_API_KEY"), get("MAIL_FROM")) {
            (Some(api_url), Some(api_key), Some(from)) => Some(MailConfig {
                api_url,
                api_key,
                from,
            }),
            (None, None, None) => None,
            _ => return Err(ConfigError::Missing("MAIL_API_URL/MAIL_API_KEY/MAIL_FROM")),
        };

        let cors_origins = get("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            bind_addr,
            database_url: get("DATABASE_URL"),
            supabase,
            cookie_secure: parse_bool(get("COOKIE_SECURE"), true, "COOKIE_SECURE")?,
            cors_origins,
            rate_limit_per_minute,
            trust_forwarded_for: parse_bool(get("TRUST_FORWARDED_FOR"), false, "TRUST_FORWARDED_FOR")?,
            mail,
            log: LogConfig {
                level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                json: parse_bool(get("LOG_JSON"), false, "LOG_JSON")?,
            },
        })
    }
}

fn parse_bool(raw: Option<String>, default: bool, name: &'static str) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("SUPABASE_URL", "https://demo.supabase.co/"),
        ("SUPABASE_ANON_KEY", "anon"),
        ("SUPABASE_JWT_SECRET", "secret"),
    ];

    #[test]
    fn defaults_apply_when_optional_values_missing() {
        let config = Config::from_lookup(lookup(&BASE)).unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:3000");
        assert_eq!(config.supabase.url, "https://demo.supabase.co");
        assert!(config.database_url.is_none());
        assert!(config.mail.is_none());
        assert!(config.cookie_secure);
        assert_eq!(config.rate_limit_per_minute, 30);
        assert!(!config.trust_forwarded_for);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn missing_jwt_secret_is_an_error() {
        let err = Config::from_lookup(lookup(&BASE[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SUPABASE_JWT_SECRET")));
    }

    #[test]
    fn partial_mail_settings_are_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("MAIL_API_URL", "https://mail.example/send"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn parses_cors_list_and_flags() {
        let mut pairs = BASE.to_vec();
        pairs.push(("CORS_ORIGINS", "https://app.nilepay.et, http://localhost:3001"));
        pairs.push(("COOKIE_SECURE", "false"));
        pairs.push(("LOG_JSON", "yes"));
        pairs.push(("TRUST_FORWARDED_FOR", "true"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.cors_origins.len(), 2);
        assert!(config.trust_forwarded_for);
        assert!(!config.cookie_secure);
        assert!(config.log.json);
    }

    #[test]
    fn zero_rate_limit_is_invalid() {
        let mut pairs = BASE.to_vec();
        pairs.push(("RATE_LIMIT_PER_MINUTE", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }
}
