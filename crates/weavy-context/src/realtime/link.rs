//! Connection state machine and subscription registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{
    AccessTokenFactory, HUB_PATH, HubEvent, HubOptions, RealtimeHandler, RealtimeTransport,
    WeavyRetryPolicy, same_handler, topic_name,
};
use crate::context::{ContextInner, WeavyContext};
use crate::error::{DestroyError, RealtimeError, TokenError, WeavyError};
use crate::lock;
use crate::network::ConnectionState;

const SUBSCRIBE: &str = "Subscribe";
const UNSUBSCRIBE: &str = "Unsubscribe";

/// Wait before retrying a failed start, cut short by focus or connectivity.
const RETRY_WAIT: Duration = Duration::from_secs(5);
/// Extra wait before each retry while online and visible.
const GRACE_PERIOD: Duration = Duration::from_secs(1);

pub(crate) struct Subscription {
    name: String,
    handler: RealtimeHandler,
}

/// Realtime slice of the context state.
#[derive(Default)]
pub(crate) struct RealtimeState {
    pub(crate) transport: Option<Arc<dyn RealtimeTransport>>,
    /// Origin the transport was built for.
    origin: Option<String>,
    subscriptions: Vec<Subscription>,
    /// One-shot: the next token is fetched with `refresh` after an
    /// unauthorized start.
    force_refresh: bool,
    /// Set after the first successful start; later starts replay subscriptions.
    has_started: bool,
    /// A stop requested by the context is in progress.
    stopping: bool,
    /// `Closed` events caused by our own stops that the event loop has yet to
    /// see. Goes negative while a stop is in progress and its event has
    /// already been handled.
    requested_closes: i32,
}

enum Connection {
    Built(mpsc::UnboundedReceiver<HubEvent>),
    Retarget(Arc<dyn RealtimeTransport>),
    Existing,
}

enum StartOutcome {
    Started(Result<(), RealtimeError>),
    StartedElsewhere(Result<(), DestroyError>),
}

impl WeavyContext {
    fn transport(&self) -> Option<Arc<dyn RealtimeTransport>> {
        lock(&self.inner.realtime).transport.clone()
    }

    /// Builds the transport, or retargets it when the environment origin changed.
    pub(crate) async fn create_connection(&self) -> Result<(), WeavyError> {
        self.ensure_alive()?;
        self.inner.gates.session_ready.wait().await?;
        self.ensure_alive()?;

        let Some(url) = self.url() else {
            return Ok(());
        };
        let hub_url = url.join(HUB_PATH).map_err(|e| RealtimeError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let origin = url.origin().ascii_serialization();

        // built under the lock so concurrent callers never create two transports
        let connection = {
            let mut state = lock(&self.inner.realtime);
            match &state.transport {
                Some(transport) if state.origin.as_deref() != Some(origin.as_str()) => {
                    let transport = transport.clone();
                    state.origin = Some(origin);
                    Connection::Retarget(transport)
                }
                Some(_) => Connection::Existing,
                None => {
                    let (events, receiver) = mpsc::unbounded_channel();
                    let transport = self.inner.connector.connect(HubOptions {
                        url: hub_url.clone(),
                        access_token: self.access_token_supplier(),
                        retry_policy: Arc::new(WeavyRetryPolicy::new(self.inner.signals.clone())),
                        events,
                    });
                    state.transport = Some(transport);
                    state.origin = Some(origin);
                    Connection::Built(receiver)
                }
            }
        };

        match connection {
            Connection::Existing => Ok(()),
            Connection::Built(events) => {
                debug!(url = %hub_url, "realtime connection created");
                self.spawn_tracked(run_hub_events(self.downgrade(), events));
                self.connect().await?;
                Ok(())
            }
            Connection::Retarget(transport) => {
                debug!(url = %hub_url, "retargeting realtime connection");
                self.disconnect().await;
                self.inner.gates.realtime_started.rearm();
                transport.set_url(hub_url);
                self.connect().await?;
                Ok(())
            }
        }
    }

    /// Token supplier for the transport, honouring the force-refresh flag.
    fn access_token_supplier(&self) -> AccessTokenFactory {
        let weak = self.downgrade();
        Arc::new(move || -> BoxFuture<'static, Result<String, TokenError>> {
            let weak = weak.clone();
            Box::pin(async move {
                let context = WeavyContext::upgrade(&weak).ok_or(DestroyError)?;
                let refresh = lock(&context.inner.realtime).force_refresh;
                context.get_token(refresh).await
            })
        })
    }

    /// Starts the transport, retrying until it is up or the context is destroyed.
    pub(crate) async fn connect(&self) -> Result<(), DestroyError> {
        loop {
            self.ensure_alive()?;
            let Some(transport) = self.transport() else {
                return Ok(());
            };

            let started = self.inner.gates.realtime_started.current();
            let outcome = tokio::select! {
                result = transport.start() => StartOutcome::Started(result),
                waited = started.wait() => StartOutcome::StartedElsewhere(waited),
            };

            let error = match outcome {
                StartOutcome::StartedElsewhere(result) => return result,
                StartOutcome::Started(Ok(())) => {
                    self.realtime_started();
                    return Ok(());
                }
                StartOutcome::Started(Err(error)) => error,
            };

            let destroyed = matches!(&error, RealtimeError::Token(e) if e.is_destroyed());
            if destroyed || self.is_destroyed() {
                debug!("realtime start aborted, context destroyed");
                return Err(DestroyError);
            }

            let signals = &self.inner.signals;
            let network = &self.inner.network;
            if !signals.is_online() {
                debug!(%error, "realtime start failed while offline, waiting for connectivity");
                network.set_pending(false);
                signals.until_online().await;
                continue;
            }

            let retry_with_fresh_token = {
                let mut state = lock(&self.inner.realtime);
                let retry = error.is_unauthorized() && !state.force_refresh && signals.is_visible();
                if retry {
                    state.force_refresh = true;
                }
                retry
            };

            if retry_with_fresh_token {
                debug!(%error, "realtime start unauthorized, retrying with a fresh token");
            } else {
                warn!(%error, "realtime start failed, retrying");
                network.set_connection_state(ConnectionState::Reconnecting);
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_WAIT) => {}
                    _ = signals.focused() => {}
                    _ = signals.online_changed() => {}
                }
            }

            if signals.is_online() && signals.is_visible() {
                tokio::time::sleep(GRACE_PERIOD).await;
            }
            self.ensure_alive()?;
            self.spawn_version_check();
            network.set_pending(true);
        }
    }

    fn realtime_started(&self) {
        let restarted = {
            let mut state = lock(&self.inner.realtime);
            state.force_refresh = false;
            std::mem::replace(&mut state.has_started, true)
        };

        let network = &self.inner.network;
        network.set_pending(false);
        network.set_connection_state(ConnectionState::Connected);
        self.inner.gates.realtime_started.open();

        if restarted {
            let context = self.clone();
            self.spawn_tracked(async move { context.replay_subscriptions().await });
        }
    }

    /// Stops the transport if there is one.
    ///
    /// The resulting `Closed` event does not restart the link.
    pub async fn disconnect(&self) {
        if let Some(transport) = self.transport() {
            lock(&self.inner.realtime).stopping = true;
            let emitted = transport.stop().await;
            let mut state = lock(&self.inner.realtime);
            state.stopping = false;
            if emitted {
                state.requested_closes += 1;
            }
            state.requested_closes = state.requested_closes.max(0);
        }
        self.inner
            .network
            .set_connection_state(ConnectionState::Disconnected);
    }

    /// Subscribes `handler` to `group:event` (or `event`).
    ///
    /// Only [`DestroyError`] is returned; every other failure is logged. The
    /// call completes once the hub acknowledged the subscription, so it waits
    /// for the realtime link to start.
    pub async fn subscribe(
        &self,
        group: Option<&str>,
        event: &str,
        handler: RealtimeHandler,
    ) -> Result<(), DestroyError> {
        self.ensure_alive()?;
        self.inner.gates.realtime_requested.open();

        let name = topic_name(group, event);
        match self.try_subscribe(&name, handler).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_destroyed() => Err(DestroyError),
            Err(error) => {
                error!(topic = %name, %error, "could not subscribe");
                Ok(())
            }
        }
    }

    async fn try_subscribe(&self, name: &str, handler: RealtimeHandler) -> Result<(), WeavyError> {
        {
            let mut state = lock(&self.inner.realtime);
            let duplicate = state
                .subscriptions
                .iter()
                .any(|s| s.name == name && same_handler(&s.handler, &handler));
            if duplicate {
                return Err(RealtimeError::DuplicateSubscription {
                    topic: name.to_string(),
                }
                .into());
            }
            state.subscriptions.push(Subscription {
                name: name.to_string(),
                handler: handler.clone(),
            });
        }

        self.inner.gates.realtime_started.wait().await?;
        self.ensure_alive()?;
        let transport = self.transport().ok_or(RealtimeError::NotConnected)?;
        transport.on(name, handler);
        transport.invoke(SUBSCRIBE, name).await?;
        debug!(topic = %name, "subscribed");
        Ok(())
    }

    /// Removes the first registration of `handler` for `group:event`.
    ///
    /// The hub is told to unsubscribe only when no other handler remains for
    /// the topic. Failures other than [`DestroyError`] are logged.
    pub async fn unsubscribe(
        &self,
        group: Option<&str>,
        event: &str,
        handler: &RealtimeHandler,
    ) -> Result<(), DestroyError> {
        self.ensure_alive()?;

        let name = topic_name(group, event);
        let remaining = {
            let mut state = lock(&self.inner.realtime);
            let Some(position) = state
                .subscriptions
                .iter()
                .position(|s| s.name == name && same_handler(&s.handler, handler))
            else {
                debug!(topic = %name, "unsubscribe for unknown handler");
                return Ok(());
            };
            state.subscriptions.remove(position);
            state.subscriptions.iter().any(|s| s.name == name)
        };

        match self.try_unsubscribe(&name, handler, remaining).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_destroyed() => Err(DestroyError),
            Err(error) => {
                error!(topic = %name, %error, "could not unsubscribe");
                Ok(())
            }
        }
    }

    async fn try_unsubscribe(
        &self,
        name: &str,
        handler: &RealtimeHandler,
        remaining: bool,
    ) -> Result<(), WeavyError> {
        self.inner.gates.realtime_started.wait().await?;
        self.ensure_alive()?;
        let transport = self.transport().ok_or(RealtimeError::NotConnected)?;
        transport.off(name, handler);
        if !remaining {
            transport.invoke(UNSUBSCRIBE, name).await?;
            debug!(topic = %name, "unsubscribed");
        }
        Ok(())
    }

    /// Topic names with at least one handler, in subscription order.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let state = lock(&self.inner.realtime);
        let mut seen = HashSet::new();
        state
            .subscriptions
            .iter()
            .filter(|s| seen.insert(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Re-issues `Subscribe` for every topic after the hub lost our state.
    async fn replay_subscriptions(&self) {
        let Some(transport) = self.transport() else {
            return;
        };
        for name in self.subscribed_topics() {
            if self.is_destroyed() {
                return;
            }
            if let Err(error) = transport.invoke(SUBSCRIBE, &name).await {
                warn!(topic = %name, %error, "could not restore subscription");
            }
        }
    }
}

/// Applies transport lifecycle events to the context.
async fn run_hub_events(context: Weak<ContextInner>, mut events: mpsc::UnboundedReceiver<HubEvent>) {
    while let Some(event) = events.recv().await {
        let Some(context) = WeavyContext::upgrade(&context) else {
            return;
        };
        let network = &context.inner.network;
        match event {
            HubEvent::Reconnecting { error } => {
                debug!(error = ?error, "realtime reconnecting");
                network.set_connection_state(ConnectionState::Reconnecting);
            }
            HubEvent::Reconnected => {
                debug!("realtime reconnected");
                network.set_connection_state(ConnectionState::Connected);
                network.set_pending(false);
                context.replay_subscriptions().await;
            }
            HubEvent::Closed { error } => {
                let requested = {
                    let mut state = lock(&context.inner.realtime);
                    let requested = state.stopping || state.requested_closes > 0;
                    if requested {
                        state.requested_closes -= 1;
                    }
                    requested
                };
                if requested {
                    debug!("realtime closed on request");
                    continue;
                }
                debug!(error = ?error, "realtime closed");
                network.set_connection_state(ConnectionState::Disconnected);
                context.inner.gates.realtime_started.rearm();
                if !context.is_destroyed() {
                    let restart = context.clone();
                    context.spawn_tracked(async move {
                        if restart.connect().await.is_err() {
                            debug!("realtime restart abandoned, context destroyed");
                        }
                    });
                }
            }
        }
    }
}
