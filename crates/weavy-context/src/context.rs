//! The shared client context.
//!
//! [`WeavyContext`] is a cheap-clone handle over [`ContextInner`]. Each concern
//! adds its own `impl WeavyContext` block in its module (`token`, `http`,
//! `realtime`, `version`); this module holds the state, the readiness gates,
//! configuration setters and the lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};
use url::Url;

use crate::config::{
    ContextOptions, DEFAULT_GC_TIME, DEFAULT_STALE_TIME, DEFAULT_TOKEN_FACTORY_RETRY_DELAY,
    DEFAULT_TOKEN_FACTORY_TIMEOUT, Deadline, validate_http_url,
};
use crate::error::{ConfigError, DestroyError, WeavyError};
use crate::gate::{Gate, GateSlot};
use crate::lock;
use crate::network::{
    ConnectionState, ListenerId, NetworkListener, NetworkState, NetworkStatus,
    NetworkStatusAggregator, ServerState,
};
use crate::provider;
use crate::query::QueryClient;
use crate::query::persist::{MemoryStorage, QueryPersister};
use crate::realtime::link::RealtimeState;
use crate::realtime::{HubConnector, TransportConnector};
use crate::signals::BrowserSignals;
use crate::token::TokenState;

/// Package name sent in the source header.
pub const SOURCE_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version, also the persisted cache buster and the version checked
/// against the environment.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const ID_LENGTH: usize = 8;
const DEFAULT_CACHE_NAMESPACE: &str = "default";

/// Mutable configuration.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) url: Option<Url>,
    pub(crate) token_url: Option<Url>,
    pub(crate) stale_time: Duration,
    pub(crate) gc_time: Duration,
    pub(crate) token_factory_retry_delay: Deadline,
    pub(crate) token_factory_timeout: Deadline,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: None,
            token_url: None,
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
            token_factory_retry_delay: DEFAULT_TOKEN_FACTORY_RETRY_DELAY,
            token_factory_timeout: DEFAULT_TOKEN_FACTORY_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Gates {
    pub(crate) url_ready: Gate,
    /// Url and token factory are both present.
    pub(crate) session_ready: GateSlot,
    pub(crate) token_validated: Gate,
    pub(crate) realtime_requested: Gate,
    pub(crate) realtime_started: GateSlot,
}

impl Gates {
    fn reject_all(&self) {
        self.url_ready.reject();
        self.session_ready.reject();
        self.token_validated.reject();
        self.realtime_requested.reject();
        self.realtime_started.reject();
    }
}

pub(crate) struct ContextInner {
    pub(crate) id: String,
    pub(crate) provider: Option<String>,
    pub(crate) settings: Mutex<Settings>,
    pub(crate) destroyed: AtomicBool,
    pub(crate) gates: Gates,
    pub(crate) signals: BrowserSignals,
    pub(crate) network: NetworkStatusAggregator,
    pub(crate) token: Mutex<TokenState>,
    pub(crate) realtime: Mutex<RealtimeState>,
    pub(crate) connector: Arc<dyn TransportConnector>,
    pub(crate) http: reqwest::Client,
    pub(crate) query_client: QueryClient,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if !self.destroyed.load(Ordering::Acquire) {
            if let Some(provider) = &self.provider {
                provider::registry().detach(provider, &self.id);
            }
            provider::registry().release_portal_root();
        }
    }
}

/// Shared client context, one per embedding.
///
/// Clones share the same state. Call [`destroy`](Self::destroy) when the
/// embedding goes away; background tasks keep the context alive until then.
#[derive(Clone)]
pub struct WeavyContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl std::fmt::Debug for WeavyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeavyContext")
            .field("id", &self.inner.id)
            .field("url", &self.url().as_ref().map(Url::as_str))
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

fn random_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

impl WeavyContext {
    /// Creates a context from `options`.
    ///
    /// Only options that are set override the defaults. Must be called inside a
    /// tokio runtime, which runs the context's background work.
    pub fn new(options: ContextOptions) -> Result<Self, WeavyError> {
        tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let mut settings = Settings::default();
        if let Some(stale_time) = options.stale_time {
            settings.stale_time = stale_time;
        }
        if let Some(gc_time) = options.gc_time {
            settings.gc_time = gc_time;
        }
        if let Some(delay) = options.token_factory_retry_delay {
            settings.token_factory_retry_delay = delay;
        }
        if let Some(timeout) = options.token_factory_timeout {
            settings.token_factory_timeout = timeout;
        }

        let signals = options.signals.unwrap_or_default();
        let query_client = QueryClient::new(settings.stale_time, settings.gc_time);
        let storage = options.storage.unwrap_or_else(MemoryStorage::session);
        let namespace = options
            .cache_namespace
            .unwrap_or_else(|| DEFAULT_CACHE_NAMESPACE.to_string());
        let persister = QueryPersister::new(
            storage,
            &namespace,
            settings.stale_time,
            settings.gc_time,
            VERSION,
        );
        if let Err(error) = query_client.attach_persister(persister) {
            error!(%error, "could not restore persisted query cache");
        }

        let context = Self {
            inner: Arc::new(ContextInner {
                id: random_id(),
                provider: options.provider,
                settings: Mutex::new(settings),
                destroyed: AtomicBool::new(false),
                gates: Gates::default(),
                network: NetworkStatusAggregator::new(signals.is_online()),
                signals,
                token: Mutex::new(TokenState::default()),
                realtime: Mutex::new(RealtimeState::default()),
                connector: options
                    .connector
                    .unwrap_or_else(|| Arc::new(HubConnector)),
                http: reqwest::Client::new(),
                query_client,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        if let Some(url) = options.url {
            context.set_url(url)?;
        }
        if let Some(factory) = options.token_factory {
            context.set_shared_token_factory(factory)?;
        }
        if let Some(token_url) = options.token_url {
            context.set_token_url(token_url)?;
        }

        context.spawn_background();

        let registry = provider::registry();
        if let Some(provider) = &context.inner.provider {
            registry.attach(provider, &context.inner.id);
        }
        registry.acquire_portal_root();

        info!(id = %context.composite_id(), "weavy context created");
        Ok(context)
    }

    /// Short random id of this context.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// `<package>-<id>`, unique per context on a page.
    pub fn composite_id(&self) -> String {
        format!("{SOURCE_NAME}-{}", self.inner.id)
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn signals(&self) -> &BrowserSignals {
        &self.inner.signals
    }

    pub fn query_client(&self) -> QueryClient {
        self.inner.query_client.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_alive(&self) -> Result<(), DestroyError> {
        if self.is_destroyed() {
            Err(DestroyError)
        } else {
            Ok(())
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<ContextInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Spawns work that is aborted on destroy.
    pub(crate) fn spawn_tracked<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track_task(tokio::spawn(future).abort_handle());
    }

    pub(crate) fn track_task(&self, handle: AbortHandle) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    // Configuration

    pub fn url(&self) -> Option<Url> {
        lock(&self.inner.settings).url.clone()
    }

    /// Sets the environment url.
    ///
    /// A url on a different origin than before retargets a requested realtime
    /// link.
    pub fn set_url(&self, url: Url) -> Result<(), WeavyError> {
        self.ensure_alive()?;
        validate_http_url(&url)?;

        let previous = lock(&self.inner.settings).url.replace(url.clone());
        self.inner.gates.url_ready.open();
        self.update_session_ready();

        let origin_changed = previous.is_some_and(|previous| previous.origin() != url.origin());
        if origin_changed && self.inner.gates.realtime_requested.is_open() {
            debug!(url = %url, "environment url changed, retargeting realtime");
            let context = self.clone();
            self.spawn_tracked(async move {
                if let Err(error) = context.create_connection().await
                    && !error.is_destroyed()
                {
                    error!(%error, "could not retarget realtime connection");
                }
            });
        }
        Ok(())
    }

    pub fn stale_time(&self) -> Duration {
        lock(&self.inner.settings).stale_time
    }

    pub fn set_stale_time(&self, stale_time: Duration) -> Result<(), DestroyError> {
        self.ensure_alive()?;
        lock(&self.inner.settings).stale_time = stale_time;
        self.inner.query_client.set_stale_time(stale_time);
        Ok(())
    }

    pub fn gc_time(&self) -> Duration {
        lock(&self.inner.settings).gc_time
    }

    pub fn set_gc_time(&self, gc_time: Duration) -> Result<(), DestroyError> {
        self.ensure_alive()?;
        lock(&self.inner.settings).gc_time = gc_time;
        self.inner.query_client.set_gc_time(gc_time);
        Ok(())
    }

    pub fn token_factory_retry_delay(&self) -> Deadline {
        lock(&self.inner.settings).token_factory_retry_delay
    }

    pub fn set_token_factory_retry_delay(
        &self,
        delay: impl Into<Deadline>,
    ) -> Result<(), DestroyError> {
        self.ensure_alive()?;
        lock(&self.inner.settings).token_factory_retry_delay = delay.into();
        Ok(())
    }

    pub fn token_factory_timeout(&self) -> Deadline {
        lock(&self.inner.settings).token_factory_timeout
    }

    pub fn set_token_factory_timeout(
        &self,
        timeout: impl Into<Deadline>,
    ) -> Result<(), DestroyError> {
        self.ensure_alive()?;
        lock(&self.inner.settings).token_factory_timeout = timeout.into();
        Ok(())
    }

    /// Opens the session gate once both url and token factory are known.
    pub(crate) fn update_session_ready(&self) {
        if self.is_destroyed() {
            return;
        }
        let has_url = lock(&self.inner.settings).url.is_some();
        if has_url && self.has_token_factory() {
            self.inner.gates.session_ready.open();
        }
    }

    // Readiness

    pub async fn when_url(&self) -> Result<(), DestroyError> {
        self.inner.gates.url_ready.wait().await
    }

    pub async fn when_session_ready(&self) -> Result<(), DestroyError> {
        self.inner.gates.session_ready.wait().await
    }

    pub async fn when_realtime_requested(&self) -> Result<(), DestroyError> {
        self.inner.gates.realtime_requested.wait().await
    }

    pub async fn when_realtime_started(&self) -> Result<(), DestroyError> {
        self.inner.gates.realtime_started.wait().await
    }

    // Network status

    /// The derived network status.
    pub fn network(&self) -> NetworkStatus {
        self.inner.network.status()
    }

    pub fn network_state(&self) -> NetworkState {
        self.inner.network.network_state()
    }

    pub fn server_state(&self) -> ServerState {
        self.inner.network.server_state()
    }

    pub fn set_server_state(&self, state: ServerState) {
        self.inner.network.set_server_state(state);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.network.connection_state()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.inner.network.set_connection_state(state);
    }

    pub fn network_state_is_pending(&self) -> bool {
        self.inner.network.is_pending()
    }

    pub fn set_network_state_is_pending(&self, pending: bool) {
        self.inner.network.set_pending(pending);
    }

    pub fn add_network_listener(
        &self,
        listener: impl Fn(NetworkStatus) + Send + Sync + 'static,
    ) -> ListenerId {
        let listener: NetworkListener = Arc::new(listener);
        self.inner.network.add_listener(listener)
    }

    pub fn remove_network_listener(&self, id: ListenerId) -> bool {
        self.inner.network.remove_listener(id)
    }

    pub fn watch_network(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.network.watch()
    }

    // Lifecycle

    fn spawn_background(&self) {
        // browser online/offline into the aggregator
        let weak = self.downgrade();
        let mut online = self.inner.signals.watch_online();
        self.spawn_tracked(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                let Some(context) = Self::upgrade(&weak) else {
                    return;
                };
                debug!(online = is_online, "browser connectivity changed");
                context.inner.network.handle_online(is_online);

                let query_client = context.inner.query_client.clone();
                if is_online && query_client.is_mounted() {
                    tokio::spawn(async move {
                        query_client.refetch_queries(true).await;
                    });
                }
            }
        });

        // query cache mounted while the host element is attached
        let weak = self.downgrade();
        let mut attached = self.inner.signals.watch_host_attached();
        self.spawn_tracked(async move {
            loop {
                let is_attached = *attached.borrow_and_update();
                {
                    let Some(context) = Self::upgrade(&weak) else {
                        return;
                    };
                    let query_client = &context.inner.query_client;
                    if is_attached {
                        query_client.mount();
                    } else {
                        query_client.unmount();
                    }
                }
                if attached.changed().await.is_err() {
                    return;
                }
            }
        });

        // realtime is built on first subscribe
        let weak = self.downgrade();
        let requested = self.inner.gates.realtime_requested.clone();
        self.spawn_tracked(async move {
            if requested.wait().await.is_err() {
                return;
            }
            let Some(context) = Self::upgrade(&weak) else {
                return;
            };
            if let Err(error) = context.create_connection().await {
                if error.is_destroyed() {
                    debug!("context destroyed before realtime connected");
                } else {
                    error!(%error, "could not create realtime connection");
                }
            }
        });

        // check the environment version once ready
        let weak = self.downgrade();
        let ready = self.inner.gates.session_ready.current();
        self.spawn_tracked(async move {
            if ready.wait().await.is_err() {
                return;
            }
            let Some(context) = Self::upgrade(&weak) else {
                return;
            };
            if let Err(error) = context.check_version(None).await
                && !error.is_destroyed()
            {
                error!(%error, "environment version check failed");
            }
        });
    }

    /// Tears the context down. Idempotent.
    ///
    /// Every later call into the context fails with [`DestroyError`], and
    /// everything still waiting on a readiness gate is released with it.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(id = %self.composite_id(), "destroying weavy context");

        let tasks: Vec<AbortHandle> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.inner.query_client.disconnect_query_client();
        self.disconnect().await;
        lock(&self.inner.realtime).transport = None;
        lock(&self.inner.token).in_flight = None;
        self.inner.gates.reject_all();

        let registry = provider::registry();
        if let Some(provider) = &self.inner.provider {
            registry.detach(provider, &self.inner.id);
        }
        if registry.release_portal_root() {
            debug!("removed shared portal root");
        }
    }
}
