//! Agent configuration.
//!
//! `Config` controls the response cache, the cookie jar, proxy use and a few
//! transport details of an [`Agent`](crate::agent::Agent). Defaults follow
//! the classic behaviour: a disk cache under the user cache directory, a
//! persistent cookie jar under the user data directory, no proxy.
//!
//! # Examples
//!
//! ```rust
//! use duperagent::config::{CacheConfig, Config, CookieJarConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = Config::builder()
//!     .cache(CacheConfig::Disabled)
//!     .cookie_jar(CookieJarConfig::Memory)
//!     .user_agent("my-app/1.0")
//!     .build()?;
//! assert!(cfg.user_agent.is_some());
//! # Ok(()) }
//! ```
//!
//! The same settings can be given as a JSON options object:
//!
//! ```rust
//! use duperagent::config::Config;
//! let cfg = Config::from_options(&serde_json::json!({
//!     "cache": { "maxSize": 1048576 },
//!     "cookieJar": false,
//!     "proxy": "system",
//! })).unwrap();
//! ```
//!
//! The process-wide agent reads the options stored with
//! [`configure`] exactly once, the first time it is used.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;

use crate::errors::ConfigError;

pub const DEFAULT_CACHE_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_ACTIVATION_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_COMPLETION_DELAY: Duration = Duration::from_millis(170);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheConfig {
    Disabled,
    Memory,
    Disk { location: PathBuf, max_size: u64 },
}

impl CacheConfig {
    pub fn default_disk() -> Self {
        CacheConfig::Disk {
            location: default_cache_location(),
            max_size: DEFAULT_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieJarConfig {
    Disabled,
    Memory,
    File {
        location: PathBuf,
        persist_sessions: bool,
    },
}

impl CookieJarConfig {
    pub fn default_file() -> Self {
        CookieJarConfig::File {
            location: default_cookie_location(),
            persist_sessions: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyConfig {
    /// Use the proxy settings of the environment.
    System,
    /// Always connect directly.
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub cache: CacheConfig,
    pub cookie_jar: CookieJarConfig,
    pub proxy: ProxyConfig,
    pub user_agent: Option<String>,
    /// Continuous activity needed before the activity indicator turns on.
    pub activation_delay: Duration,
    /// Idle time needed before the activity indicator turns off.
    pub completion_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default_disk(),
            cookie_jar: CookieJarConfig::default_file(),
            proxy: ProxyConfig::None,
            user_agent: None,
            activation_delay: DEFAULT_ACTIVATION_DELAY,
            completion_delay: DEFAULT_COMPLETION_DELAY,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parses an options object of the shape
    /// `{ cache: bool | {maxSize, location}, cookieJar: bool | {location, persistSessions}, proxy: "system" | other }`.
    ///
    /// Missing keys keep their defaults.
    pub fn from_options(options: &Value) -> Result<Config, ConfigError> {
        let Some(map) = options.as_object() else {
            return Err(ConfigError::InvalidOption {
                option: "options",
                reason: "expected an object".into(),
            });
        };

        let mut builder = Config::builder();

        for (key, value) in map {
            builder = match key.as_str() {
                "cache" => builder.cache(parse_cache(value)?),
                "cookieJar" => builder.cookie_jar(parse_cookie_jar(value)?),
                "proxy" => builder.proxy(match value.as_str() {
                    Some("system") => ProxyConfig::System,
                    _ => ProxyConfig::None,
                }),
                "userAgent" => match value.as_str() {
                    Some(ua) => builder.user_agent(ua),
                    None => return Err(invalid("userAgent", "expected a string")),
                },
                other => {
                    log::warn!("Ignoring unknown configuration option '{}'", other);
                    builder
                }
            };
        }

        builder.build()
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    inner: Config,
}

impl ConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn cache(self, cache: CacheConfig) -> Self { self.map(|c| c.cache = cache) }
    pub fn cookie_jar(self, jar: CookieJarConfig) -> Self { self.map(|c| c.cookie_jar = jar) }
    pub fn proxy(self, proxy: ProxyConfig) -> Self { self.map(|c| c.proxy = proxy) }
    pub fn user_agent<S: Into<String>>(self, ua: S) -> Self { self.map(|c| c.user_agent = Some(ua.into())) }
    pub fn activation_delay(self, delay: Duration) -> Self { self.map(|c| c.activation_delay = delay) }
    pub fn completion_delay(self, delay: Duration) -> Self { self.map(|c| c.completion_delay = delay) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<Config, ConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

fn validate(c: &Config) -> Result<(), ConfigError> {
    if let CacheConfig::Disk { max_size: 0, .. } = c.cache {
        return Err(ConfigError::ZeroCacheSize);
    }
    Ok(())
}

fn invalid(option: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidOption {
        option,
        reason: reason.to_string(),
    }
}

fn parse_cache(value: &Value) -> Result<CacheConfig, ConfigError> {
    match value {
        Value::Bool(false) | Value::Null => Ok(CacheConfig::Disabled),
        Value::Bool(true) => Ok(CacheConfig::default_disk()),
        Value::Object(opts) => {
            let max_size = match opts.get("maxSize") {
                None => DEFAULT_CACHE_SIZE,
                Some(v) => v
                    .as_u64()
                    .ok_or_else(|| invalid("cache.maxSize", "expected a positive integer"))?,
            };
            let location = match opts.get("location") {
                None => default_cache_location(),
                Some(v) => v
                    .as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| invalid("cache.location", "expected a path string"))?,
            };
            Ok(CacheConfig::Disk { location, max_size })
        }
        _ => Err(invalid("cache", "expected a boolean or an object")),
    }
}

fn parse_cookie_jar(value: &Value) -> Result<CookieJarConfig, ConfigError> {
    match value {
        Value::Bool(false) | Value::Null => Ok(CookieJarConfig::Disabled),
        Value::Bool(true) => Ok(CookieJarConfig::default_file()),
        Value::Object(opts) => {
            let location = match opts.get("location") {
                None => default_cookie_location(),
                Some(v) => v
                    .as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| invalid("cookieJar.location", "expected a path string"))?,
            };
            let persist_sessions = match opts.get("persistSessions") {
                None => false,
                Some(v) => v
                    .as_bool()
                    .ok_or_else(|| invalid("cookieJar.persistSessions", "expected a boolean"))?,
            };
            Ok(CookieJarConfig::File {
                location,
                persist_sessions,
            })
        }
        _ => Err(invalid("cookieJar", "expected a boolean or an object")),
    }
}

fn default_cache_location() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("duperagent")
}

fn default_cookie_location() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("duperagent_cookies.json")
}

// ---------- Process-wide options ----------

static GLOBAL_CONFIG: Mutex<Option<Config>> = Mutex::new(None);
static CONSUMED: AtomicBool = AtomicBool::new(false);

/// Stores the options the process-wide agent is created with.
///
/// Must be called before the first request through the module-level verb
/// functions. Later calls have no effect and return
/// [`ConfigError::AlreadyInitialized`].
pub fn configure(options: &Value) -> Result<(), ConfigError> {
    set_global(Config::from_options(options)?)
}

/// Typed variant of [`configure`].
pub fn set_global(config: Config) -> Result<(), ConfigError> {
    let mut slot = GLOBAL_CONFIG.lock().unwrap_or_else(PoisonError::into_inner);
    if CONSUMED.load(Ordering::SeqCst) {
        log::warn!("duperagent is already initialized, configuration ignored");
        return Err(ConfigError::AlreadyInitialized);
    }
    *slot = Some(config);
    Ok(())
}

/// Hands the stored configuration to the global agent. Only the first call
/// sees the stored options; they are never applied twice.
pub(crate) fn take_global() -> Config {
    let mut slot = GLOBAL_CONFIG.lock().unwrap_or_else(PoisonError::into_inner);
    CONSUMED.store(true, Ordering::SeqCst);
    slot.take().unwrap_or_default()
}
