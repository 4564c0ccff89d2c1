//! Configuration management
//!
//! Every knob has a documented fallback. Files and environment variables are
//! merged onto these defaults by the infra loader.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TicketlineError};

/// Client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketlineConfig {
    pub instance: InstanceConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: BreakerSettings,
    pub cursor: CursorSettings,
    pub logging: LoggingConfig,
    /// JSON file holding the persisted session and its audit trail
    pub store_path: Option<String>,
}

impl TicketlineConfig {
    /// # Errors
    ///
    /// Returns [`TicketlineError::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.instance.validate()?;
        self.auth.validate()?;
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        self.cursor.validate()
    }
}

/// Remote instance and network routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Instance root, e.g. `https://acme.example.com`
    pub base_url: String,
    /// Path of the REST API below the root
    pub api_path: String,
    pub request_timeout_secs: u64,
    /// Explicit proxy URL; falls back to `HTTPS_PROXY`/`HTTP_PROXY`
    pub proxy: Option<String>,
    /// Hosts (or `.suffix` domains) always reached directly
    pub no_proxy: Vec<String>,
    /// Identity-provider hosts; always reached directly. Hosts reached by
    /// redirect during sign-in are added for that handshake.
    pub identity_hosts: Vec<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_path: "/api/now".to_string(),
            request_timeout_secs: 120,
            proxy: None,
            no_proxy: Vec::new(),
            identity_hosts: Vec::new(),
        }
    }
}

impl InstanceConfig {
    /// Root of the table API without a trailing slash.
    pub fn api_base(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_path.trim_matches('/')
        )
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(TicketlineError::Config("instance.base_url must be set".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(TicketlineError::Config(
                "instance.request_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Identity handshake and session validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Entry point of the sign-in redirect chain
    pub login_url: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub username_field: String,
    pub password_field: String,
    /// Cookie that carries the session identifier
    pub session_cookie: String,
    /// Pattern with one capture group extracting the session token from the
    /// final page
    pub token_pattern: String,
    /// Path (below the API base) probed to validate a cached session
    pub probe_path: String,
    /// Skip probing for this long after a successful validation
    pub validation_ttl_secs: u64,
    /// Sessions are considered expired this long after creation
    pub session_max_age_secs: Option<u64>,
    pub max_redirects: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_url: None,
            username: None,
            password: None,
            username_field: "user_name".to_string(),
            password_field: "user_password".to_string(),
            session_cookie: "JSESSIONID".to_string(),
            token_pattern: r#"g_ck\s*=\s*['"]([^'"]+)['"]"#.to_string(),
            probe_path: "/table/sys_user?sysparm_limit=1&sysparm_fields=sys_id".to_string(),
            validation_ttl_secs: 300,
            session_max_age_secs: None,
            max_redirects: 10,
        }
    }
}

impl AuthConfig {
    pub const fn validation_ttl(&self) -> Duration {
        Duration::from_secs(self.validation_ttl_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_redirects == 0 {
            return Err(TicketlineError::Config("auth.max_redirects must be greater than 0".into()));
        }
        if self.username_field.is_empty() || self.password_field.is_empty() {
            return Err(TicketlineError::Config("auth form field names must not be empty".into()));
        }
        Ok(())
    }
}

/// Outbound pacing and retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_second: u32,
    pub max_concurrent: u32,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_unit_ms: u64,
    pub backoff_cap_ms: u64,
    /// Lower bound applied after jitter
    pub backoff_floor_ms: u64,
    /// Upper bound on a single wait for a free slot
    pub poll_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
            max_concurrent: 10,
            max_retries: 3,
            backoff_base: 2.0,
            backoff_unit_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_floor_ms: 2_000,
            poll_interval_ms: 50,
        }
    }
}

impl RateLimitSettings {
    fn validate(&self) -> Result<()> {
        if self.requests_per_second == 0 || self.max_concurrent == 0 {
            return Err(TicketlineError::Config(
                "rate_limit ceilings must be greater than 0".into(),
            ));
        }
        if self.backoff_base < 1.0 {
            return Err(TicketlineError::Config("rate_limit.backoff_base must be >= 1.0".into()));
        }
        if self.backoff_floor_ms > self.backoff_cap_ms {
            return Err(TicketlineError::Config(
                "rate_limit.backoff_floor_ms must not exceed backoff_cap_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 1, cooldown_secs: 30, half_open_max_calls: 1 }
    }
}

impl BreakerSettings {
    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0
            || self.success_threshold == 0
            || self.half_open_max_calls == 0
        {
            return Err(TicketlineError::Config(
                "circuit_breaker thresholds must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Paging and buffering for record cursors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorSettings {
    pub batch_size: usize,
    /// Fetch the next page in the background once fewer rows remain buffered
    pub prefetch_threshold: usize,
    pub max_cache_size: usize,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self { batch_size: 100, prefetch_threshold: 10, max_cache_size: 1_000 }
    }
}

impl CursorSettings {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TicketlineError::Config("cursor.batch_size must be greater than 0".into()));
        }
        if self.max_cache_size < self.batch_size {
            return Err(TicketlineError::Config(
                "cursor.max_cache_size must be at least batch_size".into(),
            ));
        }
        Ok(())
    }
}

/// Tracing output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}
