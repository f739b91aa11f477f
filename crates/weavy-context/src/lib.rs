//! Shared client context for the Weavy collaboration widgets.
//!
//! A [`WeavyContext`] is created once per embedding and handed to every widget.
//! It owns:
//! - token acquisition through a pluggable [`TokenFactory`] (or a token URL),
//!   with validation, caching and coalesced refreshes
//! - a realtime hub link (`/hubs/rtm`) with automatic reconnection and
//!   subscription replay
//! - authorized HTTP requests that retry once with a fresh token on 401/403
//! - the derived [`NetworkStatus`] that banners and widgets observe
//! - a [`QueryClient`] cache with storage-backed persistence
//!
//! ```ignore
//! use weavy_context::{ContextOptions, WeavyContext};
//!
//! let weavy = WeavyContext::new(
//!     ContextOptions::new()
//!         .with_url("https://example.weavy.io".parse()?)
//!         .with_token_factory(|refresh| async move { fetch_user_token(refresh).await }),
//! )?;
//!
//! weavy.subscribe(Some("a1"), "message_created", handler.clone()).await?;
//! let response = weavy.get("/api/apps/a1/messages").await?;
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod http;
pub mod network;
pub mod provider;
pub mod query;
pub mod realtime;
pub mod signals;
pub mod telemetry;
pub mod token;
pub mod version;

pub use crate::config::{ContextConfig, ContextOptions, Deadline};
pub use crate::context::{SOURCE_NAME, VERSION, WeavyContext};
pub use crate::error::{
    BoxError, ConfigError, DestroyError, HttpError, PersistError, QueryError, RealtimeError,
    TokenError, VersionError, WeavyError,
};
pub use crate::gate::{Gate, GateState};
pub use crate::http::{CONTENT_TYPE_JSON, ProgressFn, SOURCE_HEADER};
pub use crate::network::{
    ConnectionState, ListenerId, NetworkListener, NetworkState, NetworkStatus, ServerState,
};
pub use crate::query::persist::{FileStorage, MemoryStorage, QueryPersister, Storage};
pub use crate::query::{QueryClient, QueryFn, QueryKey};
pub use crate::realtime::{
    HubConnection, HubConnector, HubEvent, HubOptions, HubTimeouts, RealtimeHandler,
    RealtimeTransport, RetryContext, RetryPolicy, TransportConnector, WeavyRetryPolicy,
};
pub use crate::signals::BrowserSignals;
pub use crate::token::{TokenFactory, UrlTokenFactory, validate_token};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// None of the guarded state can be left half-written by a panic, so the
/// poison flag carries no information here.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sleeps for `duration`, or forever when there is no duration.
pub(crate) async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
