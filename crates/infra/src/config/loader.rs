//! Configuration loader
//!
//! Builds a [`TicketlineConfig`] from defaults, an optional file and the
//! environment.
//!
//! ## Loading Strategy
//! 1. Load `.env` from the working directory (if present)
//! 2. Parse the file named by `TICKETLINE_CONFIG`, or the first of
//!    `ticketline.toml` / `ticketline.json` found in the search directories
//! 3. Apply `TICKETLINE_*` environment variables on top
//! 4. Validate
//!
//! Without a file the defaults are used, so an environment-only setup works.
//!
//! ## Environment Variables
//! - `TICKETLINE_CONFIG`: Explicit config file path
//! - `TICKETLINE_BASE_URL`: Instance base URL
//! - `TICKETLINE_API_PATH`: API path below the base URL
//! - `TICKETLINE_REQUEST_TIMEOUT_SECS`: Per-request timeout
//! - `TICKETLINE_PROXY`: Proxy URL for instance traffic
//! - `TICKETLINE_NO_PROXY`: Comma-separated hosts reached directly
//! - `TICKETLINE_IDENTITY_HOSTS`: Comma-separated identity provider hosts
//! - `TICKETLINE_LOGIN_URL`, `TICKETLINE_USERNAME`, `TICKETLINE_PASSWORD`:
//!   Sign-in form
//! - `TICKETLINE_VALIDATION_TTL_SECS`: Skip session probes for this long
//! - `TICKETLINE_RATE_LIMIT_RPS`: Requests per second
//! - `TICKETLINE_MAX_CONCURRENT`: Requests in flight
//! - `TICKETLINE_MAX_RETRIES`: Retries per request
//! - `TICKETLINE_BREAKER_THRESHOLD`: Consecutive failures before opening
//! - `TICKETLINE_BREAKER_COOLDOWN_SECS`: Open period before a trial call
//! - `TICKETLINE_BATCH_SIZE`: Cursor page size
//! - `TICKETLINE_STORE_PATH`: Session store file
//! - `TICKETLINE_LOG_LEVEL`, `TICKETLINE_LOG_JSON`: Logging

use std::path::{Path, PathBuf};
use std::str::FromStr;

use ticketline_domain::{Result, TicketlineConfig, TicketlineError};

const CONFIG_PATH_VAR: &str = "TICKETLINE_CONFIG";
const FILE_NAMES: [&str; 2] = ["ticketline.toml", "ticketline.json"];

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct ConfigLoader {
    search_dirs: Vec<PathBuf>,
    env: EnvLookup,
    load_dotenv: bool,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("search_dirs", &self.search_dirs)
            .field("load_dotenv", &self.load_dotenv)
            .finish_non_exhaustive()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader over the process environment, searching the working directory.
    pub fn new() -> Self {
        let search_dirs = std::env::current_dir().map(|cwd| vec![cwd]).unwrap_or_default();
        Self {
            search_dirs,
            env: Box::new(|key| std::env::var(key).ok()),
            load_dotenv: true,
        }
    }

    /// Read variables through `lookup` instead of the process environment.
    /// Disables `.env` loading.
    #[must_use]
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self.load_dotenv = false;
        self
    }

    #[must_use]
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    /// # Errors
    ///
    /// Returns `TicketlineError::Config` if:
    /// - `TICKETLINE_CONFIG` names a missing file
    /// - the file format is invalid
    /// - an environment value does not parse
    /// - the merged configuration fails validation
    pub fn load(&self) -> Result<TicketlineConfig> {
        if self.load_dotenv {
            if let Ok(path) = dotenvy::dotenv() {
                tracing::debug!(path = %path.display(), "Loaded .env file");
            }
        }

        let mut config = match self.config_file()? {
            Some(path) => load_from_file(&path)?,
            None => {
                tracing::debug!("No config file found, starting from defaults");
                TicketlineConfig::default()
            }
        };
        self.apply_env(&mut config)?;
        config.validate()?;
        tracing::info!(base_url = %config.instance.base_url, "Configuration loaded");
        Ok(config)
    }

    fn config_file(&self) -> Result<Option<PathBuf>> {
        if let Some(explicit) = self.var(CONFIG_PATH_VAR) {
            let path = PathBuf::from(explicit);
            if !path.exists() {
                return Err(TicketlineError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path));
        }
        Ok(self
            .search_dirs
            .iter()
            .flat_map(|dir| FILE_NAMES.iter().map(move |name| dir.join(name)))
            .find(|path| path.exists()))
    }

    fn var(&self, key: &str) -> Option<String> {
        (self.env)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.var(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| TicketlineError::Config(format!("Invalid {key}: {e}")))
            })
            .transpose()
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.var(key).map(|raw| {
            raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
        })
    }

    fn apply_env(&self, config: &mut TicketlineConfig) -> Result<()> {
        let instance = &mut config.instance;
        if let Some(v) = self.var("TICKETLINE_BASE_URL") {
            instance.base_url = v;
        }
        if let Some(v) = self.var("TICKETLINE_API_PATH") {
            instance.api_path = v;
        }
        if let Some(v) = self.parsed("TICKETLINE_REQUEST_TIMEOUT_SECS")? {
            instance.request_timeout_secs = v;
        }
        if let Some(v) = self.var("TICKETLINE_PROXY") {
            instance.proxy = Some(v);
        }
        if let Some(v) = self.list("TICKETLINE_NO_PROXY") {
            instance.no_proxy = v;
        }
        if let Some(v) = self.list("TICKETLINE_IDENTITY_HOSTS") {
            instance.identity_hosts = v;
        }

        let auth = &mut config.auth;
        if let Some(v) = self.var("TICKETLINE_LOGIN_URL") {
            auth.login_url = Some(v);
        }
        if let Some(v) = self.var("TICKETLINE_USERNAME") {
            auth.username = Some(v);
        }
        if let Some(v) = self.var("TICKETLINE_PASSWORD") {
            auth.password = Some(v);
        }
        if let Some(v) = self.parsed("TICKETLINE_VALIDATION_TTL_SECS")? {
            auth.validation_ttl_secs = v;
        }

        if let Some(v) = self.parsed("TICKETLINE_RATE_LIMIT_RPS")? {
            config.rate_limit.requests_per_second = v;
        }
        if let Some(v) = self.parsed("TICKETLINE_MAX_CONCURRENT")? {
            config.rate_limit.max_concurrent = v;
        }
        if let Some(v) = self.parsed("TICKETLINE_MAX_RETRIES")? {
            config.rate_limit.max_retries = v;
        }
        if let Some(v) = self.parsed("TICKETLINE_BREAKER_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = self.parsed("TICKETLINE_BREAKER_COOLDOWN_SECS")? {
            config.circuit_breaker.cooldown_secs = v;
        }
        if let Some(v) = self.parsed("TICKETLINE_BATCH_SIZE")? {
            config.cursor.batch_size = v;
        }
        if let Some(v) = self.var("TICKETLINE_STORE_PATH") {
            config.store_path = Some(v);
        }
        if let Some(v) = self.var("TICKETLINE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = self.var("TICKETLINE_LOG_JSON") {
            config.logging.json = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }
}

/// Load configuration from the process environment and working directory.
///
/// # Errors
///
/// See [`ConfigLoader::load`].
pub fn load() -> Result<TicketlineConfig> {
    ConfigLoader::new().load()
}

/// Load configuration from a file
///
/// Format is detected by extension (`.toml` or `.json`). Missing sections
/// and keys take their defaults; the result is not validated.
///
/// # Errors
///
/// Returns `TicketlineError::Config` if the file cannot be read or parsed.
pub fn load_from_file(path: &Path) -> Result<TicketlineConfig> {
    tracing::info!(path = %path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(path)
        .map_err(|e| TicketlineError::Config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> Result<TicketlineConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| TicketlineError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| TicketlineError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(TicketlineError::Config(format!("Unsupported config format: {extension}"))),
    }
}
