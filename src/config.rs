//! Application configuration loaded from environment variables.
//!
//! # Modes
//!
//! `APP_ENV` selects `development` (default), `production` or `testing`. The
//! mode only changes defaults:
//!
//! | Setting                 | development | production | testing |
//! |-------------------------|-------------|------------|---------|
//! | `FORCE_HTTPS`           | false       | true       | false   |
//! | `SESSION_COOKIE_SECURE` | false       | true       | true    |
//! | `CSRF_ENABLED`          | true        | true       | false   |
//! | `SECRET_KEY` required   | no          | **yes**    | no      |
//!
//! Outside production a missing `SECRET_KEY` is replaced by a random
//! per-process key, which invalidates CSRF tokens on every restart.
//!
//! # Rate Limits
//!
//! `RATE_LIMIT_DEFAULT`, `RATE_LIMIT_INDEX`, `RATE_LIMIT_STATIC` and
//! `RATE_LIMIT_HEALTH` take comma-separated lists such as
//! `200 per day, 50 per hour` or `30/minute`.
//!
//! # Security Configuration
//!
//! - `TRUSTED_PROXY_HOPS`: number of reverse proxies in front of the server
//!   whose `X-Forwarded-For` / `X-Forwarded-Proto` entries are honored
//! - `TRUSTED_PROXIES`: CIDR ranges the direct peer must fall in before any
//!   forwarded header is honored (empty = any peer)
//! - `CSP_POLICY`: replaces the default Content-Security-Policy

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::security::csrf::new_session_id;
use crate::security::headers::CspPolicy;
use crate::security::path_guard::DEFAULT_ALLOWED_EXTENSIONS;
use crate::security::rate_limiter::{
    MEMORY_STORAGE_URL, RateLimit, RateLimitPolicy, parse_rate_limits,
};
use crate::validation::{file_extension, normalize_extension};

/// Deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
    Testing,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
            Environment::Testing => write!(f, "testing"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "testing" | "test" => Ok(Environment::Testing),
            other => Err(format!(
                "unknown environment '{other}' (expected development, production or testing)"
            )),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// HMAC key for CSRF tokens. `Debug` never prints the bytes.
#[derive(Clone)]
pub struct SecretKey {
    bytes: Arc<[u8]>,
    ephemeral: bool,
}

impl SecretKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            bytes: Arc::from(bytes),
            ephemeral: false,
        }
    }

    /// Random key for a single process lifetime.
    pub fn ephemeral() -> Self {
        Self {
            ephemeral: true,
            ..Self::new(new_session_id().into_bytes())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True when the key was generated at startup instead of configured.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([redacted; {} bytes])", self.bytes.len())
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 5000)
    pub port: u16,

    /// Deployment mode (default: development)
    pub environment: Environment,

    /// Name reported by the health endpoint (default: "portfolio-webapp")
    pub service_name: String,

    // =========================================================================
    // Static Assets
    // =========================================================================
    /// Directory served as the static root (default: ".")
    pub static_root: PathBuf,

    /// File served for `GET /` (default: "index.html")
    pub index_file: String,

    /// Servable extensions, lowercased with a leading dot
    pub allowed_extensions: Vec<String>,

    /// Upper bound on a single file read (default: 5s)
    pub file_read_timeout: Duration,

    /// Maximum request body size in bytes (default: 16MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    pub rate_limit_enabled: bool,

    /// Counter storage (only "memory://" is supported)
    pub rate_limit_storage_url: String,

    /// Per-scope limits
    pub rate_limit_policy: RateLimitPolicy,

    /// How often stale buckets and expired CSRF tokens are evicted (0 = never)
    pub sweep_interval: Duration,

    // =========================================================================
    // Client Identity
    // =========================================================================
    /// Reverse proxies in front of the server (default: 1, 0 = use peer address)
    pub trusted_proxy_hops: usize,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// Forwarded headers are only honored if the direct peer is in one of
    /// these networks. Empty means any peer.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Transport & Headers
    // =========================================================================
    /// Redirect plain-http requests to https and always send HSTS
    pub force_https: bool,

    /// Content-Security-Policy template
    pub csp_policy: CspPolicy,

    // =========================================================================
    // CSRF & Session
    // =========================================================================
    pub csrf_enabled: bool,

    /// Paths exempt from CSRF verification (default: ["/health"])
    pub csrf_exempt_paths: Vec<String>,

    /// Token lifetime (default: 1 hour)
    pub csrf_time_limit: Duration,

    /// HMAC key for tokens
    pub secret_key: SecretKey,

    /// Mark the session cookie `Secure`
    pub session_cookie_secure: bool,

    /// Session cookie Max-Age (default: 24 hours)
    pub session_lifetime: Duration,

    // =========================================================================
    // Observability
    // =========================================================================
    /// Log filter (e.g., "info", "static_shield=debug")
    pub log_level: String,

    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with mode-dependent defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a value does not parse, if
    /// `APP_ENV=production` and `SECRET_KEY` is unset, or if validation fails.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let environment: Environment = Self::parse_env("APP_ENV", Environment::Development)?;
        let production = environment.is_production();
        let defaults = RateLimitPolicy::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 5000)?,
            environment,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "portfolio-webapp".to_string()),

            // Static assets
            static_root: PathBuf::from(env::var("STATIC_ROOT").unwrap_or_else(|_| ".".into())),
            index_file: env::var("INDEX_FILE").unwrap_or_else(|_| "index.html".to_string()),
            allowed_extensions: Self::parse_extensions(env::var("ALLOWED_EXTENSIONS").ok()),
            file_read_timeout: Duration::from_millis(Self::parse_env("FILE_READ_TIMEOUT_MS", 5000)?),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 16 * 1024 * 1024)?, // 16MB

            // Rate limiting
            rate_limit_enabled: Self::parse_env("RATE_LIMIT_ENABLED", true)?,
            rate_limit_storage_url: env::var("RATELIMIT_STORAGE_URL")
                .unwrap_or_else(|_| MEMORY_STORAGE_URL.to_string()),
            rate_limit_policy: RateLimitPolicy {
                global: Self::parse_limits("RATE_LIMIT_DEFAULT", &defaults.global)?,
                index: Self::parse_limits("RATE_LIMIT_INDEX", &defaults.index)?,
                assets: Self::parse_limits("RATE_LIMIT_STATIC", &defaults.assets)?,
                health: Self::parse_limits("RATE_LIMIT_HEALTH", &defaults.health)?,
            },
            sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Client identity
            trusted_proxy_hops: Self::parse_env("TRUSTED_PROXY_HOPS", 1)?,
            trusted_proxies: Self::parse_list(env::var("TRUSTED_PROXIES").ok()),

            // Transport & headers
            force_https: Self::parse_env("FORCE_HTTPS", production)?,
            csp_policy: env::var("CSP_POLICY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|s| CspPolicy::parse(&s))
                .unwrap_or_default(),

            // CSRF & session
            csrf_enabled: Self::parse_env("CSRF_ENABLED", environment != Environment::Testing)?,
            csrf_exempt_paths: Self::parse_paths(env::var("CSRF_EXEMPT_PATHS").ok(), &["/health"]),
            csrf_time_limit: Duration::from_secs(Self::parse_env("CSRF_TIME_LIMIT_SECS", 3600)?),
            secret_key: Self::resolve_secret_key(env::var("SECRET_KEY").ok(), environment)?,
            session_cookie_secure: Self::parse_env(
                "SESSION_COOKIE_SECURE",
                environment != Environment::Development,
            )?,
            session_lifetime: Duration::from_secs(Self::parse_env(
                "SESSION_LIFETIME_SECS",
                86_400,
            )?),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Text)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.rate_limit_storage_url.trim() != MEMORY_STORAGE_URL {
            return Err(AppError::ConfigError(format!(
                "RATELIMIT_STORAGE_URL '{}' is not supported (only {MEMORY_STORAGE_URL})",
                self.rate_limit_storage_url
            )));
        }

        if self.allowed_extensions.is_empty() {
            return Err(AppError::ConfigError(
                "ALLOWED_EXTENSIONS must name at least one extension".to_string(),
            ));
        }

        // The index file goes through the same guard as any other asset.
        let index_allowed = file_extension(&self.index_file)
            .is_some_and(|ext| self.allowed_extensions.contains(&ext));
        if !index_allowed {
            return Err(AppError::ConfigError(format!(
                "INDEX_FILE '{}' does not have an allowed extension",
                self.index_file
            )));
        }

        if self.file_read_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "FILE_READ_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.csrf_time_limit.is_zero() {
            return Err(AppError::ConfigError(
                "CSRF_TIME_LIMIT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.session_lifetime.is_zero() {
            return Err(AppError::ConfigError(
                "SESSION_LIFETIME_SECS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if trusted proxy validation is enabled.
    ///
    /// When enabled, forwarded headers are only trusted if the request
    /// originates from a configured trusted proxy network.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Pick the CSRF key: the configured one, or an ephemeral key outside production.
    ///
    /// Runs before logging is initialized; callers report
    /// [`SecretKey::is_ephemeral`] once tracing is up.
    fn resolve_secret_key(raw: Option<String>, environment: Environment) -> AppResult<SecretKey> {
        match raw.filter(|k| !k.is_empty()) {
            Some(key) => Ok(SecretKey::new(key.into_bytes())),
            None if environment.is_production() => Err(AppError::ConfigError(
                "SECRET_KEY must be set when APP_ENV=production".to_string(),
            )),
            None => Ok(SecretKey::ephemeral()),
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr + ToString,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_limits(name: &str, default: &[RateLimit]) -> AppResult<Vec<RateLimit>> {
        match env::var(name) {
            Ok(val) => parse_rate_limits(&val)
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default.to_vec()),
        }
    }

    fn parse_extensions(raw: Option<String>) -> Vec<String> {
        match raw {
            Some(raw) => raw.split(',').filter_map(normalize_extension).collect(),
            None => DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|e| (*e).to_string())
                .collect(),
        }
    }

    /// Comma-separated list, trimmed, empties dropped.
    fn parse_list(raw: Option<String>) -> Vec<String> {
        raw.map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Like [`Self::parse_list`] but keeps only absolute paths.
    fn parse_paths(raw: Option<String>, default: &[&str]) -> Vec<String> {
        match raw {
            Some(raw) => Self::parse_list(Some(raw))
                .into_iter()
                .filter(|p| p.starts_with('/'))
                .collect(),
            None => default.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 5000,
            environment: Environment::Development,
            service_name: "portfolio-webapp".to_string(),
            // Static assets
            static_root: PathBuf::from("."),
            index_file: "index.html".to_string(),
            allowed_extensions: Self::parse_extensions(None),
            file_read_timeout: Duration::from_secs(5),
            max_request_body_size: 16 * 1024 * 1024, // 16MB
            // Rate limiting
            rate_limit_enabled: true,
            rate_limit_storage_url: MEMORY_STORAGE_URL.to_string(),
            rate_limit_policy: RateLimitPolicy::default(),
            sweep_interval: Duration::from_secs(60),
            // Client identity
            trusted_proxy_hops: 1,
            trusted_proxies: vec![], // Empty = trust any peer (dev mode)
            // Transport & headers
            force_https: false,
            csp_policy: CspPolicy::default(),
            // CSRF & session
            csrf_enabled: true,
            csrf_exempt_paths: vec!["/health".to_string()],
            csrf_time_limit: Duration::from_secs(3600),
            secret_key: SecretKey::ephemeral(),
            session_cookie_secure: false,
            session_lifetime: Duration::from_secs(86_400),
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_port: 9090,
        }
    }
}
