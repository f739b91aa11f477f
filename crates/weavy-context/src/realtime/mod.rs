//! Realtime hub link.
//!
//! The context keeps one hub connection per environment and multiplexes every
//! widget subscription over it. The connection itself sits behind
//! [`RealtimeTransport`] so tests (or other hub flavours) can swap it out via a
//! [`TransportConnector`]; the default is [`HubConnection`], a SignalR JSON
//! hub client over websocket.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{RealtimeError, TokenError};

mod hub;
pub(crate) mod link;
mod policy;
pub mod protocol;

pub use hub::{HubConnection, HubTimeouts};
pub use policy::{RetryContext, RetryPolicy, WeavyRetryPolicy};

/// Path of the realtime hub relative to the environment url.
pub const HUB_PATH: &str = "/hubs/rtm";

/// Callback for realtime events, called with the event payload.
///
/// Handlers are identified by pointer, so keep the `Arc` around to unsubscribe.
pub type RealtimeHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Supplies the bearer token for each connection attempt.
pub type AccessTokenFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, TokenError>> + Send + Sync>;

/// Topic name for a realtime event: `group:event`, or just `event`.
pub fn topic_name(group: Option<&str>, event: &str) -> String {
    match group {
        Some(group) if !group.is_empty() => format!("{group}:{event}"),
        _ => event.to_string(),
    }
}

pub(crate) fn same_handler(a: &RealtimeHandler, b: &RealtimeHandler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Lifecycle notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// The connection dropped and automatic reconnection began.
    Reconnecting { error: Option<String> },
    /// Automatic reconnection succeeded.
    Reconnected,
    /// The connection is gone for good, either stopped or out of retries.
    Closed { error: Option<String> },
}

/// Everything a transport needs to reach the hub.
#[derive(Clone)]
pub struct HubOptions {
    pub url: Url,
    pub access_token: AccessTokenFactory,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub events: mpsc::UnboundedSender<HubEvent>,
}

impl std::fmt::Debug for HubOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubOptions")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

/// A duplex pub/sub connection to the realtime hub.
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Connects and completes the handshake. Starting a started transport is a no-op.
    fn start(&self) -> BoxFuture<'_, Result<(), RealtimeError>>;

    /// Closes the connection without reconnecting.
    ///
    /// Emits [`HubEvent::Closed`] before returning if it was connected or
    /// reconnecting, and returns whether it did.
    fn stop(&self) -> BoxFuture<'_, bool>;

    /// Points the next start at a different hub url.
    fn set_url(&self, url: Url);

    /// Calls a hub method with a topic name argument.
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), RealtimeError>>;

    /// Registers a handler for server pushes to `topic`.
    fn on(&self, topic: &str, handler: RealtimeHandler);

    /// Removes a handler registered with [`on`](Self::on).
    fn off(&self, topic: &str, handler: &RealtimeHandler);
}

/// Builds transports for the context.
pub trait TransportConnector: Send + Sync + 'static {
    fn connect(&self, options: HubOptions) -> Arc<dyn RealtimeTransport>;
}

/// Default connector producing [`HubConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubConnector;

impl TransportConnector for HubConnector {
    fn connect(&self, options: HubOptions) -> Arc<dyn RealtimeTransport> {
        Arc::new(HubConnection::new(options))
    }
}
