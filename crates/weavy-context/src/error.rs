//! Error types for the Weavy client context.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Boxed error returned by user supplied factories and fetchers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared form of [`BoxError`], used where one failure is handed to many waiters.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for client context operations
#[derive(Debug, Error, Diagnostic)]
pub enum WeavyError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Destroyed(#[from] DestroyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Realtime(#[from] RealtimeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

impl WeavyError {
    /// True when the failure only happened because the context was torn down.
    pub fn is_destroyed(&self) -> bool {
        match self {
            WeavyError::Destroyed(_) => true,
            WeavyError::Token(e) => e.is_destroyed(),
            WeavyError::Http(e) => e.is_destroyed(),
            WeavyError::Realtime(RealtimeError::Token(e)) => e.is_destroyed(),
            _ => false,
        }
    }
}

/// The context has been destroyed and refuses further work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error, Diagnostic)]
#[error("the weavy context has been destroyed")]
#[diagnostic(
    code(weavy::destroyed),
    help("create a new WeavyContext instead of reusing a destroyed one")
)]
pub struct DestroyError;

/// Token acquisition errors.
///
/// Clone so that one coalesced refresh can hand the same failure to every waiter.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum TokenError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Destroyed(#[from] DestroyError),

    #[error("invalid token: expected a user access token starting with `wyu_`")]
    #[diagnostic(code(weavy::token::invalid))]
    Invalid,

    #[error("the provided token is an API key, which must never be used client side")]
    #[diagnostic(
        code(weavy::token::api_key),
        help("issue a user access token (`wyu_...`) from your backend instead")
    )]
    ApiKey,

    #[error("token factory did not respond within {}ms", .0.as_millis())]
    #[diagnostic(code(weavy::token::timeout))]
    Timeout(Duration),

    #[error("network status changed while waiting for a token")]
    #[diagnostic(code(weavy::token::network_changed))]
    NetworkChanged,

    #[error("no token factory has been configured")]
    #[diagnostic(code(weavy::token::no_factory), help("set a token factory or a token url"))]
    NoFactory,

    #[error("token factory failed: {0}")]
    #[diagnostic(code(weavy::token::factory))]
    Factory(SharedError),

    #[error("token response did not contain an `access_token`")]
    #[diagnostic(code(weavy::token::missing_access_token))]
    MissingAccessToken,

    #[error("token request to {url} failed with status {status}")]
    #[diagnostic(code(weavy::token::status))]
    Status { url: String, status: u16 },

    #[error("token request failed: {0}")]
    #[diagnostic(code(weavy::token::request))]
    Request(Arc<reqwest::Error>),
}

impl TokenError {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, TokenError::Destroyed(_))
    }

    /// True for the malformed-token class of errors.
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, TokenError::Invalid | TokenError::ApiKey)
    }
}

impl From<reqwest::Error> for TokenError {
    fn from(err: reqwest::Error) -> Self {
        TokenError::Request(Arc::new(err))
    }
}

/// HTTP gateway errors
#[derive(Debug, Error, Diagnostic)]
pub enum HttpError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Destroyed(#[from] DestroyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Token(#[from] TokenError),

    #[error("no environment url has been configured")]
    #[diagnostic(code(weavy::http::no_url))]
    NoUrl,

    #[error("invalid request url {url}")]
    #[diagnostic(code(weavy::http::url))]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request to {url} failed")]
    #[diagnostic(code(weavy::http::transport))]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} failed with status {status}")]
    #[diagnostic(code(weavy::http::status))]
    Status { url: String, status: u16 },

    #[error("invalid header value")]
    #[diagnostic(code(weavy::http::header))]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

impl HttpError {
    pub fn is_destroyed(&self) -> bool {
        match self {
            HttpError::Destroyed(_) => true,
            HttpError::Token(e) => e.is_destroyed(),
            _ => false,
        }
    }
}

/// Realtime hub errors
#[derive(Debug, Error, Diagnostic)]
pub enum RealtimeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Token(#[from] TokenError),

    #[error("hub rejected the connection: 401 Unauthorized")]
    #[diagnostic(code(weavy::realtime::unauthorized))]
    Unauthorized,

    #[error("failed to connect to {url}: {message}")]
    #[diagnostic(code(weavy::realtime::connect))]
    Connect { url: String, message: String },

    #[error("hub handshake failed: {0}")]
    #[diagnostic(code(weavy::realtime::handshake))]
    Handshake(String),

    #[error("hub invocation `{method}` failed: {message}")]
    #[diagnostic(code(weavy::realtime::invocation))]
    Invocation { method: String, message: String },

    #[error("hub invocation `{method}` timed out")]
    #[diagnostic(code(weavy::realtime::timeout))]
    Timeout { method: String },

    #[error("hub connection is not connected")]
    #[diagnostic(code(weavy::realtime::not_connected))]
    NotConnected,

    #[error("hub connection closed")]
    #[diagnostic(code(weavy::realtime::closed))]
    Closed,

    #[error("malformed hub message: {0}")]
    #[diagnostic(code(weavy::realtime::protocol))]
    Protocol(String),

    #[error("`{topic}` is already subscribed with this handler")]
    #[diagnostic(
        code(weavy::realtime::duplicate_subscription),
        help("unsubscribe the handler before subscribing it again")
    )]
    DuplicateSubscription { topic: String },
}

impl RealtimeError {
    /// Whether the failure looks like an authorization rejection.
    ///
    /// Transports report 401s in different shapes, so the message text is
    /// inspected as well as the variant.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            RealtimeError::Unauthorized => true,
            RealtimeError::Token(_) => false,
            other => {
                let message = other.to_string().to_ascii_lowercase();
                message.contains("401") || message.contains("unauthorized")
            }
        }
    }
}

/// Server version check errors
#[derive(Debug, Error, Diagnostic)]
pub enum VersionError {
    #[error("version mismatch: client {client} is not compatible with server {server}")]
    #[diagnostic(
        code(weavy::version::mismatch),
        help("upgrade the client package to match the major version of the environment")
    )]
    Mismatch { client: String, server: String },

    #[error("malformed version string `{0}`")]
    #[diagnostic(code(weavy::version::malformed))]
    Malformed(String),
}

/// Query cache errors
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum QueryError {
    #[error("query fetcher failed: {0}")]
    #[diagnostic(code(weavy::query::fetch))]
    Fetch(SharedError),

    #[error("query was cancelled")]
    #[diagnostic(code(weavy::query::cancelled))]
    Cancelled,

    #[error("query fetcher panicked: {0}")]
    #[diagnostic(code(weavy::query::panicked))]
    Panicked(String),

    #[error("no fetcher registered for query {0}")]
    #[diagnostic(code(weavy::query::no_fetcher))]
    NoFetcher(String),
}

/// Query cache persistence errors
#[derive(Debug, Error, Diagnostic)]
pub enum PersistError {
    #[error("failed to serialize query cache")]
    #[diagnostic(code(weavy::query::persist::serde))]
    Serde(#[from] serde_json::Error),

    #[error("storage failure for {key}: {message}")]
    #[diagnostic(code(weavy::query::persist::storage))]
    Storage { key: String, message: String },
}

/// Configuration errors
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    #[diagnostic(code(config::missing_env))]
    MissingEnv { var: &'static str },

    #[error("invalid value for {var}: {value}")]
    #[diagnostic(code(config::invalid_env))]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to parse URL {url}: {message}")]
    #[diagnostic(code(config::url_parse))]
    UrlParse { url: String, message: String },

    #[error("unsupported url scheme `{scheme}` for {url}, expected http or https")]
    #[diagnostic(code(config::url_scheme))]
    UrlScheme { url: String, scheme: String },

    #[error("a tokio runtime is required to create a WeavyContext")]
    #[diagnostic(code(config::runtime))]
    NoRuntime,
}
