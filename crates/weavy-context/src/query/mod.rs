//! Client-side query cache.
//!
//! Widgets load server data through [`QueryClient::fetch_query`]. Results are
//! kept per [`QueryKey`] in a `mini-moka` cache that drops entries unused for
//! `gc_time`; data older than `stale_time` is fetched again on the next read
//! or refetch. Concurrent fetches of one key share a single fetcher call.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::{Shared, join_all};
use n0_future::boxed::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BoxError, PersistError, QueryError};
use crate::lock;

pub mod persist;

use persist::{PersistedQuery, QueryPersister};

/// Hierarchical cache key, e.g. `["apps", "a1", "messages"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// True if `prefix` is a leading part of this key. The empty key prefixes everything.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for QueryKey {
    fn from(parts: [S; N]) -> Self {
        Self::new(parts)
    }
}

/// Loads the data for one query.
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<Result<Value, BoxError>> + Send + Sync>;

type SharedFetch = Shared<BoxFuture<Result<Value, QueryError>>>;

#[derive(Debug, Clone)]
struct QueryEntry {
    data: Value,
    updated_at: Instant,
    invalidated: bool,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
    abort: AbortHandle,
}

struct QueryInner {
    cache: Mutex<mini_moka::sync::Cache<QueryKey, Arc<QueryEntry>>>,
    stale_time: Mutex<Duration>,
    gc_time: Mutex<Duration>,
    fetchers: Mutex<HashMap<QueryKey, QueryFn>>,
    in_flight: Mutex<HashMap<QueryKey, InFlight>>,
    next_fetch: AtomicU64,
    mounted: AtomicBool,
    persister: Mutex<Option<QueryPersister>>,
    persist_scheduled: AtomicBool,
}

/// Handle to the query cache. Clones share the cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<QueryInner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("stale_time", &self.stale_time())
            .field("gc_time", &*lock(&self.inner.gc_time))
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

fn build_cache(gc_time: Duration) -> mini_moka::sync::Cache<QueryKey, Arc<QueryEntry>> {
    mini_moka::sync::Cache::builder()
        .time_to_idle(gc_time)
        .build()
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl QueryClient {
    pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                cache: Mutex::new(build_cache(gc_time)),
                stale_time: Mutex::new(stale_time),
                gc_time: Mutex::new(gc_time),
                fetchers: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_fetch: AtomicU64::new(0),
                mounted: AtomicBool::new(false),
                persister: Mutex::new(None),
                persist_scheduled: AtomicBool::new(false),
            }),
        }
    }

    fn cache(&self) -> mini_moka::sync::Cache<QueryKey, Arc<QueryEntry>> {
        lock(&self.inner.cache).clone()
    }

    pub fn stale_time(&self) -> Duration {
        *lock(&self.inner.stale_time)
    }

    pub fn set_stale_time(&self, stale_time: Duration) {
        *lock(&self.inner.stale_time) = stale_time;
    }

    pub fn gc_time(&self) -> Duration {
        *lock(&self.inner.gc_time)
    }

    /// Changes the idle expiry. Cached entries are carried over.
    pub fn set_gc_time(&self, gc_time: Duration) {
        *lock(&self.inner.gc_time) = gc_time;
        let rebuilt = build_cache(gc_time);
        let mut cache = lock(&self.inner.cache);
        for entry in cache.iter() {
            rebuilt.insert(entry.key().clone(), entry.value().clone());
        }
        *cache = rebuilt;
    }

    fn is_stale(&self, entry: &QueryEntry) -> bool {
        entry.invalidated || entry.updated_at.elapsed() >= self.stale_time()
    }

    /// Returns cached data while fresh, otherwise runs `fetcher`.
    ///
    /// The fetcher is remembered for later refetches of `key`.
    pub async fn fetch_query(&self, key: QueryKey, fetcher: QueryFn) -> Result<Value, QueryError> {
        lock(&self.inner.fetchers).insert(key.clone(), fetcher.clone());

        if let Some(entry) = self.cache().get(&key)
            && !self.is_stale(&entry)
        {
            return Ok(entry.data.clone());
        }
        self.start_fetch(key, fetcher).await
    }

    /// Refetches `key` with its remembered fetcher.
    pub async fn refetch_query(&self, key: &QueryKey) -> Result<Value, QueryError> {
        let fetcher = lock(&self.inner.fetchers)
            .get(key)
            .cloned()
            .ok_or_else(|| QueryError::NoFetcher(key.to_string()))?;
        self.start_fetch(key.clone(), fetcher).await
    }

    /// Joins the running fetch for `key`, or spawns one.
    fn start_fetch(&self, key: QueryKey, fetcher: QueryFn) -> SharedFetch {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(running) = in_flight.get(&key) {
            return running.fetch.clone();
        }

        let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(fetcher());
        let abort = task.abort_handle();

        let client = Arc::downgrade(&self.inner);
        let fetch_key = key.clone();
        let fetch: BoxFuture<Result<Value, QueryError>> = Box::pin(async move {
            let result = match task.await {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(error)) => Err(QueryError::Fetch(Arc::from(error))),
                Err(error) if error.is_cancelled() => Err(QueryError::Cancelled),
                Err(error) => Err(QueryError::Panicked(error.to_string())),
            };
            finish_fetch(&client, fetch_key, id, &result);
            result
        });

        let fetch = fetch.shared();
        in_flight.insert(
            key,
            InFlight {
                id,
                fetch: fetch.clone(),
                abort,
            },
        );
        fetch
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        self.cache().get(key).map(|entry| entry.data.clone())
    }

    /// Stores `data` for `key` as freshly fetched.
    pub fn set_query_data(&self, key: QueryKey, data: Value) {
        self.cache().insert(
            key,
            Arc::new(QueryEntry {
                data,
                updated_at: Instant::now(),
                invalidated: false,
            }),
        );
        self.schedule_persist();
    }

    /// Marks every query under `prefix` stale and refetches them while mounted.
    pub async fn invalidate_queries(&self, prefix: &QueryKey) {
        let cache = self.cache();
        let keys: Vec<QueryKey> = cache
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            if let Some(entry) = cache.get(key) {
                let mut entry = (*entry).clone();
                entry.invalidated = true;
                cache.insert(key.clone(), Arc::new(entry));
            }
        }
        debug!(%prefix, count = keys.len(), "queries invalidated");

        if self.is_mounted() {
            let refetches = keys.iter().map(|key| self.refetch_query(key));
            for result in join_all(refetches).await {
                if let Err(error) = result
                    && !matches!(error, QueryError::NoFetcher(_))
                {
                    warn!(%error, "refetch after invalidation failed");
                }
            }
        }
    }

    /// Refetches queries that have a fetcher. Returns how many were refetched.
    pub async fn refetch_queries(&self, stale_only: bool) -> usize {
        let cache = self.cache();
        let keys: Vec<QueryKey> = lock(&self.inner.fetchers)
            .keys()
            .filter(|key| {
                !stale_only
                    || cache
                        .get(*key)
                        .is_none_or(|entry| self.is_stale(&entry))
            })
            .cloned()
            .collect();

        let count = keys.len();
        let refetches = keys.iter().map(|key| self.refetch_query(key));
        for result in join_all(refetches).await {
            if let Err(error) = result {
                warn!(%error, "query refetch failed");
            }
        }
        count
    }

    /// Aborts every running fetch. Waiters get [`QueryError::Cancelled`].
    pub fn cancel_queries(&self) {
        let running: Vec<InFlight> = lock(&self.inner.in_flight)
            .drain()
            .map(|(_, running)| running)
            .collect();
        for running in running {
            running.abort.abort();
        }
    }

    /// Drops cached data and fetchers for every query under `prefix`.
    pub fn remove_queries(&self, prefix: &QueryKey) {
        let cache = self.cache();
        let keys: Vec<QueryKey> = cache
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            cache.invalidate(key);
        }
        lock(&self.inner.fetchers).retain(|key, _| !key.starts_with(prefix));
        self.schedule_persist();
    }

    /// Drops everything cached.
    pub fn clear(&self) {
        self.cache().invalidate_all();
        lock(&self.inner.fetchers).clear();
    }

    pub fn mount(&self) {
        if !self.inner.mounted.swap(true, Ordering::AcqRel) {
            debug!("query client mounted");
        }
    }

    pub fn unmount(&self) {
        if self.inner.mounted.swap(false, Ordering::AcqRel) {
            debug!("query client unmounted");
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::Acquire)
    }

    /// Restores the persisted cache (if current) and keeps persisting changes.
    ///
    /// Returns how many queries were restored.
    pub fn attach_persister(&self, persister: QueryPersister) -> Result<usize, PersistError> {
        let restored = persister.restore();
        *lock(&self.inner.persister) = Some(persister);

        let queries = restored?.unwrap_or_default();
        let now = SystemTime::now();
        let cache = self.cache();
        for query in &queries {
            let age = now
                .duration_since(UNIX_EPOCH + Duration::from_millis(query.data_updated_at))
                .unwrap_or_default();
            let updated_at = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
            cache.insert(
                query.query_key.clone(),
                Arc::new(QueryEntry {
                    data: query.data.clone(),
                    updated_at,
                    invalidated: false,
                }),
            );
        }
        if !queries.is_empty() {
            debug!(count = queries.len(), "restored persisted queries");
        }
        Ok(queries.len())
    }

    /// Writes the cache to the persister now.
    pub fn persist(&self) -> Result<(), PersistError> {
        let Some(persister) = lock(&self.inner.persister).clone() else {
            return Ok(());
        };
        persister.persist(self.dehydrate())
    }

    fn dehydrate(&self) -> Vec<PersistedQuery> {
        let now = Instant::now();
        let wall_now = SystemTime::now();
        self.cache()
            .iter()
            .map(|entry| {
                let age = now.saturating_duration_since(entry.value().updated_at);
                PersistedQuery {
                    query_key: entry.key().clone(),
                    data: entry.value().data.clone(),
                    data_updated_at: epoch_millis(
                        wall_now.checked_sub(age).unwrap_or(UNIX_EPOCH),
                    ),
                }
            })
            .collect()
    }

    /// Persists after the throttle interval, coalescing changes made meanwhile.
    fn schedule_persist(&self) {
        let throttle = match &*lock(&self.inner.persister) {
            Some(persister) => persister.throttle(),
            None => return,
        };
        if self.inner.persist_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let client = Arc::downgrade(&self.inner);
        let write = move |client: &Weak<QueryInner>| {
            let Some(inner) = client.upgrade() else {
                return;
            };
            inner.persist_scheduled.store(false, Ordering::Release);
            if let Err(error) = (QueryClient { inner }).persist() {
                warn!(%error, "could not persist query cache");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(throttle).await;
                    write(&client);
                });
            }
            Err(_) => write(&client),
        }
    }

    /// Tears the client down: cancels fetches, drops data, removes and
    /// detaches the persister, and unmounts.
    pub fn disconnect_query_client(&self) {
        self.cancel_queries();
        self.clear();
        if let Some(persister) = lock(&self.inner.persister).take()
            && let Err(error) = persister.remove()
        {
            warn!(%error, "could not remove persisted query cache");
        }
        self.unmount();
        self.cache().invalidate_all();
    }
}

/// Stores a finished fetch and clears its in-flight marker, unless a newer
/// fetch replaced it.
fn finish_fetch(
    client: &Weak<QueryInner>,
    key: QueryKey,
    id: u64,
    result: &Result<Value, QueryError>,
) {
    let Some(inner) = client.upgrade() else {
        return;
    };
    {
        let mut in_flight = lock(&inner.in_flight);
        match in_flight.get(&key) {
            Some(running) if running.id == id => {
                in_flight.remove(&key);
            }
            _ => return,
        }
    }
    if let Ok(data) = result {
        QueryClient { inner }.set_query_data(key, data.clone());
    }
}
