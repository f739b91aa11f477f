use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::query::persist::Storage;
use crate::realtime::TransportConnector;
use crate::signals::BrowserSignals;
use crate::token::TokenFactory;

/// A time limit that can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deadline {
    After(Duration),
    Never,
}

impl Deadline {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Deadline::After(duration) => Some(*duration),
            Deadline::Never => None,
        }
    }

    /// Parses milliseconds, or `infinity`/`never` for no limit.
    pub fn parse_millis(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("infinity") || value.eq_ignore_ascii_case("never") {
            return Some(Deadline::Never);
        }
        value
            .parse::<u64>()
            .ok()
            .map(|ms| Deadline::After(Duration::from_millis(ms)))
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Deadline::After(duration)
    }
}

/// Default time before cached query data is considered stale.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(1);
/// Default time unused query data stays cached.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 60 * 24);
/// Default wait before asking the token factory again after an unusable token.
pub const DEFAULT_TOKEN_FACTORY_RETRY_DELAY: Deadline = Deadline::After(Duration::from_secs(2));
/// Default upper bound for one token acquisition.
pub const DEFAULT_TOKEN_FACTORY_TIMEOUT: Deadline = Deadline::After(Duration::from_secs(20));

/// Options accepted by [`WeavyContext::new`](crate::WeavyContext::new).
///
/// Every field is optional; only the ones that are set are applied, so partial
/// option sets can be layered over the defaults.
#[derive(Clone, Default)]
pub struct ContextOptions {
    pub url: Option<Url>,
    pub token_factory: Option<Arc<dyn TokenFactory>>,
    pub token_url: Option<Url>,
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub token_factory_retry_delay: Option<Deadline>,
    pub token_factory_timeout: Option<Deadline>,
    /// Browser signals shared with other contexts on the same page.
    pub signals: Option<BrowserSignals>,
    /// Realtime transport, defaults to the websocket hub connection.
    pub connector: Option<Arc<dyn TransportConnector>>,
    /// Storage for the query cache persister, defaults to session storage.
    pub storage: Option<Arc<dyn Storage>>,
    /// Namespace for the persisted query cache key.
    pub cache_namespace: Option<String>,
    /// Name of the context provider host this context registers with.
    pub provider: Option<String>,
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("token_factory", &self.token_factory.is_some())
            .field("token_url", &self.token_url.as_ref().map(Url::as_str))
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("token_factory_retry_delay", &self.token_factory_retry_delay)
            .field("token_factory_timeout", &self.token_factory_timeout)
            .field("cache_namespace", &self.cache_namespace)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from environment variables.
    ///
    /// Optional env vars:
    /// - `WEAVY_URL`: environment url
    /// - `WEAVY_TOKEN_URL`: endpoint answering `{ "access_token": ... }`
    /// - `WEAVY_STALE_TIME_MS`, `WEAVY_GC_TIME_MS`: query cache timings
    /// - `WEAVY_TOKEN_FACTORY_RETRY_DELAY_MS`, `WEAVY_TOKEN_FACTORY_TIMEOUT_MS`:
    ///   milliseconds or `infinity`
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = ContextConfig {
            url: std::env::var("WEAVY_URL").ok(),
            token_url: std::env::var("WEAVY_TOKEN_URL").ok(),
            stale_time_ms: env_millis("WEAVY_STALE_TIME_MS")?,
            gc_time_ms: env_millis("WEAVY_GC_TIME_MS")?,
            token_factory_retry_delay: env_deadline("WEAVY_TOKEN_FACTORY_RETRY_DELAY_MS")?,
            token_factory_timeout: env_deadline("WEAVY_TOKEN_FACTORY_TIMEOUT_MS")?,
            cache_namespace: std::env::var("WEAVY_CACHE_NAMESPACE").ok(),
        };
        config.into_options()
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_token_factory(mut self, factory: impl TokenFactory) -> Self {
        self.token_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = Some(url);
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn with_token_factory_retry_delay(mut self, delay: impl Into<Deadline>) -> Self {
        self.token_factory_retry_delay = Some(delay.into());
        self
    }

    pub fn with_token_factory_timeout(mut self, timeout: impl Into<Deadline>) -> Self {
        self.token_factory_timeout = Some(timeout.into());
        self
    }

    pub fn with_signals(mut self, signals: BrowserSignals) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_cache_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = Some(namespace.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Serializable subset of [`ContextOptions`], e.g. from a JSON config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    pub url: Option<String>,
    pub token_url: Option<String>,
    pub stale_time_ms: Option<u64>,
    pub gc_time_ms: Option<u64>,
    pub token_factory_retry_delay: Option<Deadline>,
    pub token_factory_timeout: Option<Deadline>,
    pub cache_namespace: Option<String>,
}

impl ContextConfig {
    pub fn into_options(self) -> Result<ContextOptions, ConfigError> {
        Ok(ContextOptions {
            url: self.url.as_deref().map(parse_http_url).transpose()?,
            token_url: self.token_url.as_deref().map(parse_http_url).transpose()?,
            stale_time: self.stale_time_ms.map(Duration::from_millis),
            gc_time: self.gc_time_ms.map(Duration::from_millis),
            token_factory_retry_delay: self.token_factory_retry_delay,
            token_factory_timeout: self.token_factory_timeout,
            cache_namespace: self.cache_namespace,
            ..ContextOptions::default()
        })
    }
}

/// Parses an environment url and checks it is http(s).
pub fn parse_http_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::UrlParse {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    validate_http_url(&parsed)?;
    Ok(parsed)
}

pub(crate) fn validate_http_url(url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::UrlScheme {
            url: url.to_string(),
            scheme: scheme.to_string(),
        }),
    }
}

fn env_millis(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

fn env_deadline(var: &'static str) -> Result<Option<Deadline>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => Deadline::parse_millis(&value)
            .map(Some)
            .ok_or(ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}
