//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before environment variables are read.
    /// Paths support ~ expansion. Loaded in order after `./.env`; a variable
    /// already set is never overridden.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Identity provider / bearer authentication configuration
    pub auth: AuthConfig,
    /// Relational store configuration
    pub database: DatabaseConfig,
    /// Plan generation API configuration
    pub planner: PlannerConfig,
}

/// Environment variables understood without the `TASKPLAN_` prefix, mapped
/// onto their config keys.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("APP_PORT", "server.port"),
    ("DATABASE_URL", "database.url"),
    ("AUTH0_DOMAIN", "auth.domain"),
    ("AUTH0_AUDIENCE", "auth.audience"),
    ("AUTH0_ISSUER", "auth.issuer"),
    ("AUTH0_CLIENT_ID", "auth.client_id"),
    ("AUTH0_CLIENT_SECRET", "auth.client_secret"),
    ("AUTH0_REDIRECT_URI", "auth.redirect_uri"),
    ("FRONTEND_URL", "auth.frontend_url"),
    ("GEMINI_API_KEY", "planner.api_key"),
    ("GEMINI_BASE_URL", "planner.base_url"),
];

impl Config {
    /// Load configuration from file and environment
    ///
    /// Precedence (lowest to highest): defaults, YAML file, legacy
    /// unprefixed variables (`AUTH0_ISSUER`, ...), `TASKPLAN_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the result fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load like [`Config::load`] without requiring auth settings.
    ///
    /// Used by commands that never serve requests (`migrate`).
    pub fn load_unvalidated(path: Option<&Path>) -> Result<Self> {
        // ./.env first, so it feeds the legacy variables below
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded env file: {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!("Failed to load .env: {e}"),
        }

        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        let env_files: Vec<String> = figment
            .extract_inner("env_files")
            .unwrap_or_default();
        Self::load_env_files(&env_files);

        let legacy: Vec<&str> = LEGACY_ENV.iter().map(|(var, _)| *var).collect();
        figment = figment.merge(Env::raw().only(&legacy).map(|key| {
            LEGACY_ENV
                .iter()
                .find(|(var, _)| key.as_str().eq_ignore_ascii_case(var))
                .map_or_else(|| key.as_str().to_owned(), |(_, path)| (*path).to_owned())
                .into()
        }));

        figment = figment.merge(Env::prefixed("TASKPLAN_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();

        Ok(config)
    }

    /// Check the settings the auth gate cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.auth.issuer.trim().is_empty() {
            return Err(Error::Config("auth.issuer is required".to_string()));
        }
        if self.auth.audience.trim().is_empty() {
            return Err(Error::Config("auth.audience is required".to_string()));
        }
        if self.auth.jwks_refresh_interval.is_zero() {
            return Err(Error::Config(
                "auth.jwks_refresh_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(env_files: &[String]) {
        for path_str in env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secret-bearing values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        self.auth.client_secret = Self::expand_string(&re, &self.auth.client_secret);
        self.planner.api_key = Self::expand_string(&re, &self.planner.api_key);
        if let Some(url) = self.database.url.as_mut() {
            *url = Self::expand_string(&re, url);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// How long graceful shutdown waits for in-flight requests
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Identity provider and bearer-token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expected `iss` claim; also the base of the JWKS URL
    pub issuer: String,
    /// Expected `aud` claim member
    pub audience: String,
    /// Identity provider domain (for `/authorize`, `/oauth/token`, `/userinfo`)
    pub domain: String,
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret (supports `${VAR}`)
    #[serde(skip_serializing)]
    pub client_secret: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Frontend base URL used for post-login redirects
    pub frontend_url: String,
    /// JWKS URL override (default: `<issuer>/.well-known/jwks.json`)
    pub jwks_uri: Option<String>,
    /// Background key-set refresh interval
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    /// Timeout for one key-set fetch
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_timeout: Duration,
    /// Bound on first-use key-set initialization inside a request
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,
    /// Refuse to fetch keys over plain HTTP
    pub require_https: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            domain: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            frontend_url: "http://localhost:3000".to_string(),
            jwks_uri: None,
            jwks_refresh_interval: Duration::from_secs(3600),
            jwks_refresh_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(10),
            require_https: true,
        }
    }
}

impl AuthConfig {
    /// JWKS endpoint: the explicit override, or the well-known path under the issuer.
    #[must_use]
    pub fn jwks_url(&self) -> String {
        self.jwks_uri.clone().unwrap_or_else(|| {
            let base = self.issuer.trim_end_matches('/');
            format!("{base}/.well-known/jwks.json")
        })
    }
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL. When unset the in-memory store is used.
    #[serde(skip_serializing)]
    pub url: Option<String>,
    /// Pool upper bound
    pub max_connections: u32,
    /// Pool lower bound
    pub min_connections: u32,
    /// Idle connection lifetime
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Connect / acquire timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Apply pending migrations at startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            min_connections: 1,
            idle_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }
}

/// Generation API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// API base URL
    pub base_url: String,
    /// API key (supports `${VAR}`)
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Model name used in the request path
    pub model: String,
    /// HTTP timeout for one generation call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Upper bound on whole generation, including retries by the caller
    #[serde(with = "humantime_serde")]
    pub generation_timeout: Duration,
    /// `max_output_tokens` sent with each request
    pub max_output_tokens: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model: "gemini-2.5-pro".to_string(),
            timeout: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(120),
            max_output_tokens: 800,
        }
    }
}

/// Human-readable serde for `Duration` ("100ms", "30s", "5m", "1h")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string. Bare numbers are seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" must be tried before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
