#![allow(dead_code)]

pub mod loopback;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{any, get, post};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use url::Url;
use weavy_context::realtime::AccessTokenFactory;
use weavy_context::{
    BoxError, ContextOptions, HubEvent, HubOptions, MemoryStorage, RealtimeError,
    RealtimeHandler, RealtimeTransport, TransportConnector, WeavyContext,
};

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Token factory that counts calls and remembers the refresh flags.
#[derive(Clone, Default)]
pub struct CountingFactory {
    pub calls: Arc<AtomicUsize>,
    pub refreshes: Arc<Mutex<Vec<bool>>>,
}

impl CountingFactory {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> Vec<bool> {
        self.refreshes.lock().unwrap().clone()
    }

    /// A factory answering `tokens[n]` on the n-th call (the last one repeats),
    /// after `delay`.
    pub fn returning(
        &self,
        tokens: &[&str],
        delay: Duration,
    ) -> impl Fn(bool) -> BoxFuture<'static, Result<String, BoxError>> + Send + Sync + 'static
    {
        let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        let counter = self.clone();
        move |refresh| -> BoxFuture<'static, Result<String, BoxError>> {
            let call = counter.calls.fetch_add(1, Ordering::SeqCst);
            counter.refreshes.lock().unwrap().push(refresh);
            let token = tokens[call.min(tokens.len() - 1)].clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(token)
            })
        }
    }
}

/// Options for a context isolated from other tests' persisted caches.
pub fn isolated_options() -> ContextOptions {
    ContextOptions::new().with_storage(Arc::new(MemoryStorage::new()))
}

/// Shared state behind every transport a [`MockConnector`] builds.
#[derive(Default)]
pub struct MockHub {
    invocations: Mutex<Vec<(String, String)>>,
    handlers: Mutex<Vec<(String, RealtimeHandler)>>,
    failures: Mutex<VecDeque<RealtimeError>>,
    options: Mutex<Option<HubOptions>>,
    urls: Mutex<Vec<Url>>,
    tokens: Mutex<Vec<String>>,
    built: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockHub {
    /// The next start fails with `error`.
    pub fn fail_next_start(&self, error: RealtimeError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn invocations(&self) -> Vec<(String, String)> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, topic: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, t)| m == method && t == topic)
            .count()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .count()
    }

    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }

    /// Tokens handed to successful and failed starts, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    /// Sends a lifecycle event as the transport would.
    pub fn emit(&self, event: HubEvent) {
        let options = self.options.lock().unwrap().clone();
        if let Some(options) = options {
            let _ = options.events.send(event);
        }
    }

    /// Delivers a server push to every handler registered for `topic`.
    pub fn push(&self, topic: &str, payload: Value) {
        let handlers: Vec<RealtimeHandler> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    pub hub: Arc<MockHub>,
}

impl TransportConnector for MockConnector {
    fn connect(&self, options: HubOptions) -> Arc<dyn RealtimeTransport> {
        self.hub.built.fetch_add(1, Ordering::SeqCst);
        self.hub.urls.lock().unwrap().push(options.url.clone());
        let access_token = options.access_token.clone();
        *self.hub.options.lock().unwrap() = Some(options);
        Arc::new(MockTransport {
            hub: self.hub.clone(),
            access_token,
            connected: Mutex::new(false),
        })
    }
}

struct MockTransport {
    hub: Arc<MockHub>,
    access_token: AccessTokenFactory,
    connected: Mutex<bool>,
}

impl RealtimeTransport for MockTransport {
    fn start(&self) -> BoxFuture<'_, Result<(), RealtimeError>> {
        Box::pin(async move {
            self.hub.starts.fetch_add(1, Ordering::SeqCst);
            let token = (self.access_token)().await?;
            self.hub.tokens.lock().unwrap().push(token);
            if let Some(error) = self.hub.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            *self.connected.lock().unwrap() = true;
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.hub.stops.fetch_add(1, Ordering::SeqCst);
            let was_connected = std::mem::replace(&mut *self.connected.lock().unwrap(), false);
            if was_connected {
                self.hub.emit(HubEvent::Closed { error: None });
            }
            was_connected
        })
    }

    fn set_url(&self, url: Url) {
        self.hub.urls.lock().unwrap().push(url);
    }

    fn invoke<'a>(
        &'a self,
        method: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), RealtimeError>> {
        Box::pin(async move {
            self.hub
                .invocations
                .lock()
                .unwrap()
                .push((method.to_string(), topic.to_string()));
            Ok(())
        })
    }

    fn on(&self, topic: &str, handler: RealtimeHandler) {
        self.hub
            .handlers
            .lock()
            .unwrap()
            .push((topic.to_string(), handler));
    }

    fn off(&self, topic: &str, handler: &RealtimeHandler) {
        let mut handlers = self.hub.handlers.lock().unwrap();
        if let Some(position) = handlers
            .iter()
            .position(|(t, h)| t == topic && Arc::ptr_eq(h, handler))
        {
            handlers.remove(position);
        }
    }
}

/// A context on `url` with a counting factory and a mock hub.
pub fn mock_context(url: &str, tokens: &[&str]) -> (WeavyContext, CountingFactory, Arc<MockHub>) {
    let factory = CountingFactory::default();
    let connector = MockConnector::default();
    let hub = connector.hub.clone();
    let context = WeavyContext::new(
        isolated_options()
            .with_url(url.parse().unwrap())
            .with_token_factory(factory.returning(tokens, Duration::ZERO))
            .with_connector(Arc::new(connector)),
    )
    .unwrap();
    (context, factory, hub)
}

/// A local stand-in for a Weavy environment.
#[derive(Clone)]
pub struct Environment {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl Environment {
    pub fn url(&self) -> Url {
        format!("http://{}/", self.addr).parse().unwrap()
    }

    pub fn join(&self, path: &str) -> Url {
        self.url().join(path).unwrap()
    }

    /// `(path, authorization)` of every request to the `/api` routes.
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct EnvState {
    version: String,
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn record(state: &EnvState, path: &str, headers: &HeaderMap) -> Option<String> {
    let auth = authorization(headers);
    state
        .requests
        .lock()
        .unwrap()
        .push((path.to_string(), auth.clone()));
    auth
}

/// Serves `/version` (answering `version`), `/token` and a few `/api` routes:
/// - `/api/echo` returns the source and authorization headers
/// - `/api/fresh-only` answers 401 unless the bearer is `wyu_fresh`
/// - `/api/forbidden` always answers 403, whatever the method
/// - `/api/broken` always answers 500
/// - `/api/missing` always answers 404
/// - `POST /api/upload` returns the received byte count
pub async fn spawn_environment(version: &str) -> Environment {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = EnvState {
        version: version.to_string(),
        requests: requests.clone(),
    };

    let app = Router::new()
        .route(
            "/version",
            get(|State(state): State<EnvState>| async move { state.version }),
        )
        .route(
            "/token",
            get(|Query(query): Query<HashMap<String, String>>| async move {
                let token = if query.get("refresh").is_some_and(|r| r == "true") {
                    "wyu_refreshed"
                } else {
                    "wyu_from_url"
                };
                Json(json!({ "access_token": token }))
            }),
        )
        .route("/token-empty", get(|| async { Json(json!({})) }))
        .route(
            "/api/echo",
            get(
                |State(state): State<EnvState>, headers: HeaderMap| async move {
                    let auth = record(&state, "/api/echo", &headers);
                    let source = headers
                        .get("x-weavy-source")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Json(json!({ "authorization": auth, "source": source }))
                },
            ),
        )
        .route(
            "/api/fresh-only",
            get(
                |State(state): State<EnvState>, headers: HeaderMap| async move {
                    let auth = record(&state, "/api/fresh-only", &headers);
                    if auth.as_deref() == Some("Bearer wyu_fresh") {
                        (StatusCode::OK, "ok")
                    } else {
                        (StatusCode::UNAUTHORIZED, "expired")
                    }
                },
            ),
        )
        .route(
            "/api/forbidden",
            any(
                |State(state): State<EnvState>, headers: HeaderMap| async move {
                    record(&state, "/api/forbidden", &headers);
                    StatusCode::FORBIDDEN
                },
            ),
        )
        .route(
            "/api/broken",
            get(
                |State(state): State<EnvState>, headers: HeaderMap| async move {
                    record(&state, "/api/broken", &headers);
                    StatusCode::INTERNAL_SERVER_ERROR
                },
            ),
        )
        .route(
            "/api/missing",
            get(
                |State(state): State<EnvState>, headers: HeaderMap| async move {
                    record(&state, "/api/missing", &headers);
                    StatusCode::NOT_FOUND
                },
            ),
        )
        .route(
            "/api/upload",
            post(
                |State(state): State<EnvState>, headers: HeaderMap, body: axum::body::Bytes| async move {
                    record(&state, "/api/upload", &headers);
                    Json(json!({ "received": body.len() }))
                },
            ),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Environment { addr, requests }
}
