//! Authorized HTTP requests against the environment.
//!
//! Every request goes through [`WeavyContext::post`] (or [`WeavyContext::upload`]
//! for progress-reporting bodies). Outcomes feed the server side of the network
//! status; a 401/403 is retried exactly once with a freshly fetched token.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::context::{SOURCE_NAME, VERSION, WeavyContext};
use crate::error::HttpError;
use crate::network::ServerState;

/// Header identifying the client package on every request.
pub const SOURCE_HEADER: &str = "x-weavy-source";

pub const CONTENT_TYPE_JSON: &str = "application/json;charset=utf-8";

/// Upload progress callback, called with a percentage in `0..=100`.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// How a response status maps onto the server state and the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    RetryWithFreshToken,
    Unauthorized,
    Unreachable,
    Other,
}

fn classify(status: StatusCode, retry: bool) -> Outcome {
    if status.is_success() {
        Outcome::Ok
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        if retry {
            Outcome::RetryWithFreshToken
        } else {
            Outcome::Unauthorized
        }
    } else if status.is_server_error() {
        Outcome::Unreachable
    } else {
        Outcome::Other
    }
}

fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) as u128 * 100) / total as u128) as u8
}

impl WeavyContext {
    /// Headers for a request to the environment.
    ///
    /// With `authorized` set this obtains a token first, which waits until the
    /// context is ready.
    pub async fn fetch_options(&self, authorized: bool) -> Result<HeaderMap, HttpError> {
        self.ensure_alive()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            SOURCE_HEADER,
            HeaderValue::from_str(&format!("{SOURCE_NAME}@{VERSION}"))?,
        );
        if authorized {
            let token = self.get_token(false).await?;
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// `GET` relative to the environment url.
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.post(url, Method::GET, None, CONTENT_TYPE_JSON, true)
            .await
    }

    /// Sends an authorized request relative to the environment url.
    ///
    /// Non-OK responses are returned as is; only transport failures are errors.
    pub async fn post(
        &self,
        url: &str,
        method: Method,
        body: Option<Bytes>,
        content_type: &str,
        retry: bool,
    ) -> Result<Response, HttpError> {
        let mut retry = retry;
        loop {
            self.ensure_alive()?;
            let headers = self.fetch_options(true).await?;
            let target = self.resolve_url(url)?;

            let mut request = self
                .inner
                .http
                .request(method.clone(), target.clone())
                .headers(headers)
                .header(CONTENT_TYPE, content_type);
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            self.inner.network.set_pending(true);
            let response = match request.send().await {
                Ok(response) => response,
                Err(source) => {
                    warn!(url = %target, error = %source, "request failed");
                    self.report_server_state(Some(ServerState::Unreachable));
                    return Err(HttpError::Transport {
                        url: target.to_string(),
                        source,
                    });
                }
            };

            match self.handle_status(&method, &target, response.status(), retry) {
                Outcome::RetryWithFreshToken => {
                    self.refresh_token_for_retry().await?;
                    retry = false;
                }
                _ => return Ok(response),
            }
        }
    }

    /// Sends `body` as a stream of chunks, reporting progress as they go out.
    ///
    /// Auth behaves like [`post`](Self::post), but only a 401 is retried; a 403
    /// is returned straight away.
    pub async fn upload(
        &self,
        url: &str,
        method: Method,
        body: Bytes,
        content_type: Option<&str>,
        on_progress: Option<ProgressFn>,
        retry: bool,
    ) -> Result<Response, HttpError> {
        let mut retry = retry;
        loop {
            self.ensure_alive()?;
            let headers = self.fetch_options(true).await?;
            let target = self.resolve_url(url)?;
            let total = body.len();

            let mut request = self
                .inner
                .http
                .request(method.clone(), target.clone())
                .headers(headers)
                .header(CONTENT_LENGTH, total)
                .body(reqwest::Body::wrap_stream(progress_stream(
                    body.clone(),
                    on_progress.clone(),
                )));
            if let Some(content_type) = content_type {
                request = request.header(CONTENT_TYPE, content_type);
            }

            self.inner.network.set_pending(true);
            let response = match request.send().await {
                Ok(response) => response,
                Err(source) => {
                    warn!(url = %target, error = %source, "upload failed");
                    self.report_server_state(Some(ServerState::Unreachable));
                    return Err(HttpError::Transport {
                        url: target.to_string(),
                        source,
                    });
                }
            };

            // only an expired token is worth another upload of the whole body
            let status = response.status();
            let retry_status = retry && status == StatusCode::UNAUTHORIZED;
            match self.handle_status(&method, &target, status, retry_status) {
                Outcome::RetryWithFreshToken => {
                    self.refresh_token_for_retry().await?;
                    retry = false;
                }
                _ => {
                    if total == 0
                        && let Some(on_progress) = &on_progress
                    {
                        on_progress(100);
                    }
                    return Ok(response);
                }
            }
        }
    }

    async fn refresh_token_for_retry(&self) -> Result<(), HttpError> {
        if let Err(error) = self.get_token(true).await {
            self.inner.network.set_pending(false);
            return Err(error.into());
        }
        Ok(())
    }

    /// Resolves `url` against the environment url. Absolute urls pass through.
    pub fn resolve_url(&self, url: &str) -> Result<Url, HttpError> {
        let base = self.url().ok_or(HttpError::NoUrl)?;
        base.join(url).map_err(|source| HttpError::Url {
            url: url.to_string(),
            source,
        })
    }

    fn handle_status(
        &self,
        method: &Method,
        url: &Url,
        status: StatusCode,
        retry: bool,
    ) -> Outcome {
        metrics::counter!(crate::telemetry::HTTP_REQUESTS, "status" => status.as_str().to_string())
            .increment(1);

        let outcome = classify(status, retry);
        match outcome {
            Outcome::Ok => self.report_server_state(Some(ServerState::Ok)),
            Outcome::RetryWithFreshToken => {
                debug!(%method, %url, %status, "retrying with a refreshed token");
            }
            Outcome::Unauthorized => {
                warn!(%method, %url, %status, "request not authorized");
                self.report_server_state(Some(ServerState::Unauthorized));
            }
            Outcome::Unreachable => {
                warn!(%method, %url, %status, "server error");
                self.report_server_state(Some(ServerState::Unreachable));
            }
            Outcome::Other => {
                debug!(%method, %url, %status, "request returned non-OK status");
                self.report_server_state(None);
            }
        }
        outcome
    }

    /// Clears the pending flag and records the server outcome, if any.
    fn report_server_state(&self, state: Option<ServerState>) {
        let network = &self.inner.network;
        network.set_pending(false);
        if let Some(state) = state {
            network.set_server_state(state);
        }
    }
}

/// Splits `body` into chunks and reports progress as each one is pulled.
fn progress_stream(
    body: Bytes,
    on_progress: Option<ProgressFn>,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let total = body.len();
    let chunks: Vec<Bytes> = (0..total)
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| body.slice(start..(start + UPLOAD_CHUNK_SIZE).min(total)))
        .collect();

    let mut sent = 0;
    futures_util::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len();
        if let Some(on_progress) = &on_progress {
            on_progress(percent(sent, total));
        }
        Ok(chunk)
    })
}
