//! Token acquisition.
//!
//! Tokens come from a [`TokenFactory`], either supplied by the host or
//! installed from a token url ([`UrlTokenFactory`]). The context caches the last
//! valid token and makes sure only one factory call is in flight; every caller
//! that asks while a fetch is running shares its result.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::Shared;
use n0_future::boxed::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::context::WeavyContext;
use crate::error::{BoxError, DestroyError, TokenError, WeavyError};
use crate::{lock, sleep_for};

/// Prefix of user access tokens.
pub const USER_TOKEN_PREFIX: &str = "wyu_";
/// Prefix of system API keys, which are never accepted client side.
pub const API_KEY_PREFIX: &str = "wys_";

/// Source of access tokens.
///
/// `refresh` is `true` when the previous token was rejected and the factory
/// must not return a cached one.
pub trait TokenFactory: Send + Sync + 'static {
    fn fetch_token(&self, refresh: bool) -> BoxFuture<Result<String, BoxError>>;
}

impl<F, Fut> TokenFactory for F
where
    F: Fn(bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
{
    fn fetch_token(&self, refresh: bool) -> BoxFuture<Result<String, BoxError>> {
        Box::pin(self(refresh))
    }
}

/// Checks that `token` is a user access token.
pub fn validate_token(token: &str) -> Result<(), TokenError> {
    if token.starts_with(API_KEY_PREFIX) {
        return Err(TokenError::ApiKey);
    }
    if !token.starts_with(USER_TOKEN_PREFIX) {
        return Err(TokenError::Invalid);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Default factory that fetches tokens from a url.
///
/// `GET <url>` (with `refresh=true` added to the query on refresh) must answer
/// `{ "access_token": "wyu_..." }`.
#[derive(Debug, Clone)]
pub struct UrlTokenFactory {
    url: Url,
    client: reqwest::Client,
}

impl UrlTokenFactory {
    pub fn new(url: Url) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: Url, client: reqwest::Client) -> Self {
        Self { url, client }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn fetch(&self, refresh: bool) -> Result<String, TokenError> {
        let mut url = self.url.clone();
        if refresh {
            url.query_pairs_mut().append_pair("refresh", "true");
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response.json().await?;
        body.access_token.ok_or(TokenError::MissingAccessToken)
    }
}

impl TokenFactory for UrlTokenFactory {
    fn fetch_token(&self, refresh: bool) -> BoxFuture<Result<String, BoxError>> {
        let factory = self.clone();
        Box::pin(async move { factory.fetch(refresh).await.map_err(BoxError::from) })
    }
}

pub(crate) type SharedTokenFetch = Shared<BoxFuture<Result<String, TokenError>>>;

/// Token slice of the context state.
#[derive(Default)]
pub(crate) struct TokenState {
    pub(crate) factory: Option<Arc<dyn TokenFactory>>,
    pub(crate) token: Option<String>,
    pub(crate) in_flight: Option<SharedTokenFetch>,
}

fn same_factory(a: &Arc<dyn TokenFactory>, b: &Arc<dyn TokenFactory>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl WeavyContext {
    /// Returns a valid access token.
    ///
    /// A cached token is returned as is unless `refresh` is set. Otherwise this
    /// waits until both url and token factory are configured and joins (or
    /// starts) the single in-flight factory call.
    ///
    /// After the factory has returned two unusable tokens in a row the session
    /// stays not ready until a token factory or url is set again, and later
    /// calls wait for that without a deadline. With the factory retry delay set
    /// to [`Deadline::Never`](crate::Deadline::Never), the refresh after the
    /// first unusable token waits for it too.
    pub async fn get_token(&self, refresh: bool) -> Result<String, TokenError> {
        self.ensure_alive()?;

        if !refresh && let Some(token) = self.cached_token() {
            return Ok(token);
        }

        self.inner.gates.session_ready.wait().await?;
        self.ensure_alive()?;

        if !refresh && let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let fetch = {
            let mut state = lock(&self.inner.token);
            match &state.in_flight {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self.spawn_token_fetch(refresh);
                    state.in_flight = Some(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Runs the factory call as its own task so it keeps going when the caller
    /// that started it is dropped.
    fn spawn_token_fetch(&self, refresh: bool) -> SharedTokenFetch {
        let task = tokio::spawn(self.token_fetch(refresh));
        self.track_task(task.abort_handle());

        let weak = self.downgrade();
        let fetch: BoxFuture<Result<String, TokenError>> = Box::pin(async move {
            match task.await {
                Ok(result) => result,
                Err(error) if error.is_cancelled() => Err(TokenError::Destroyed(DestroyError)),
                Err(error) => {
                    if let Some(context) = Self::upgrade(&weak) {
                        lock(&context.inner.token).in_flight = None;
                    }
                    Err(TokenError::Factory(Arc::from(BoxError::from(format!(
                        "token fetch panicked: {error}"
                    )))))
                }
            }
        });
        fetch.shared()
    }

    /// Installs a token factory.
    ///
    /// Replacing an existing factory with a different one drops the cached
    /// token and refetches stale queries once the context is ready again.
    pub fn set_token_factory(&self, factory: impl TokenFactory) -> Result<(), DestroyError> {
        self.set_shared_token_factory(Arc::new(factory))
    }

    pub fn set_shared_token_factory(
        &self,
        factory: Arc<dyn TokenFactory>,
    ) -> Result<(), DestroyError> {
        self.ensure_alive()?;
        let replaced = {
            let mut state = lock(&self.inner.token);
            let previous = state.factory.replace(factory.clone());
            let replaced = previous.is_some_and(|previous| !same_factory(&previous, &factory));
            if replaced {
                state.token = None;
            }
            replaced
        };

        if replaced {
            debug!(id = %self.id(), "token factory replaced, refetching stale queries when ready");
            let context = self.clone();
            self.spawn_tracked(async move {
                if context.inner.gates.session_ready.wait().await.is_ok() {
                    context.inner.query_client.refetch_queries(true).await;
                }
            });
        }

        self.update_session_ready();
        Ok(())
    }

    /// Sets the token url, installing a [`UrlTokenFactory`] when no factory is set.
    pub fn set_token_url(&self, url: Url) -> Result<(), WeavyError> {
        self.ensure_alive()?;
        crate::config::validate_http_url(&url)?;
        lock(&self.inner.settings).token_url = Some(url.clone());

        if self.has_token_factory() {
            return Ok(());
        }
        let factory = UrlTokenFactory::with_client(url, self.inner.http.clone());
        self.set_token_factory(factory)?;
        Ok(())
    }

    pub fn token_url(&self) -> Option<Url> {
        lock(&self.inner.settings).token_url.clone()
    }

    pub fn has_token_factory(&self) -> bool {
        lock(&self.inner.token).factory.is_some()
    }

    /// Forgets the cached token so the next call goes to the factory.
    pub fn clear_token(&self) {
        lock(&self.inner.token).token = None;
    }

    /// Waits until a valid token has been seen at least once.
    pub async fn when_token_is_valid(&self) -> Result<(), DestroyError> {
        self.inner.gates.token_validated.wait().await
    }

    fn cached_token(&self) -> Option<String> {
        lock(&self.inner.token).token.clone()
    }

    /// Builds the shared fetch. The future clears the in-flight marker itself,
    /// so it completes exactly once however many callers await it.
    fn token_fetch(&self, refresh: bool) -> BoxFuture<Result<String, TokenError>> {
        let weak = self.downgrade();
        Box::pin(async move {
            let context = Self::upgrade(&weak).ok_or(TokenError::Destroyed(DestroyError))?;
            let result = context.bounded_token_fetch(refresh).await;
            {
                let mut state = lock(&context.inner.token);
                state.in_flight = None;
                if let Ok(token) = &result {
                    state.token = Some(token.clone());
                }
            }
            match &result {
                Ok(_) => {
                    context.inner.gates.token_validated.open();
                }
                Err(error) => debug!(%error, refresh, "token fetch failed"),
            }
            result
        })
    }

    /// One fetch-and-validate, bounded by the factory timeout and aborted if
    /// connectivity flips meanwhile.
    async fn bounded_token_fetch(&self, refresh: bool) -> Result<String, TokenError> {
        let timeout = lock(&self.inner.settings).token_factory_timeout.as_duration();
        let signals = self.inner.signals.clone();

        tokio::select! {
            result = self.fetch_and_validate(refresh) => result,
            _ = sleep_for(timeout) => {
                warn!(timeout = ?timeout, "token factory timed out");
                Err(TokenError::Timeout(timeout.unwrap_or_default()))
            }
            _ = signals.online_changed() => Err(TokenError::NetworkChanged),
        }
    }

    async fn fetch_and_validate(&self, refresh: bool) -> Result<String, TokenError> {
        let mut refresh = refresh;
        loop {
            let retry_delay = lock(&self.inner.settings)
                .token_factory_retry_delay
                .as_duration();
            let ready = self.inner.gates.session_ready.current();
            tokio::select! {
                waited = ready.wait() => waited?,
                _ = sleep_for(retry_delay) => {}
            }
            self.ensure_alive()?;

            let factory = lock(&self.inner.token)
                .factory
                .clone()
                .ok_or(TokenError::NoFactory)?;

            metrics::counter!(crate::telemetry::TOKEN_FETCHES).increment(1);
            let token = factory
                .fetch_token(refresh)
                .await
                .map_err(|e| TokenError::Factory(Arc::from(e)))?;
            self.ensure_alive()?;

            match validate_token(&token) {
                Ok(()) => {
                    // A later valid token restores readiness lost to an invalid one.
                    self.update_session_ready();
                    return Ok(token);
                }
                Err(error) => {
                    warn!(%error, refresh, "token factory returned an unusable token");
                    self.inner.gates.session_ready.rearm();
                    if refresh {
                        return Err(error);
                    }
                    refresh = true;
                }
            }
        }
    }
}
