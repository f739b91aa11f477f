//! Websocket hub client.
//!
//! One [`HubConnection`] owns at most one live websocket. A live connection is
//! a writer task (fed through an unbounded channel), a reader task that
//! dispatches records and a keepalive task. When the reader sees the socket go
//! away without a `stop`, a reconnect task takes over and follows the
//! [`RetryPolicy`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::protocol::{self, HubMessage};
use super::{
    AccessTokenFactory, HubEvent, HubOptions, RealtimeHandler, RealtimeTransport, RetryContext,
    RetryPolicy, same_handler,
};
use crate::error::RealtimeError;
use crate::lock;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Protocol timers of a [`HubConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubTimeouts {
    /// Wait for the handshake response after connecting.
    pub handshake: Duration,
    /// Interval between pings sent to the server.
    pub keepalive_interval: Duration,
    /// Silence from the server after which the connection counts as lost.
    pub server_timeout: Duration,
    /// Wait for the completion of an invocation.
    pub invocation: Duration,
}

impl Default for HubTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            invocation: Duration::from_secs(30),
        }
    }
}

/// A live websocket and the tasks serving it.
struct Link {
    writer: mpsc::UnboundedSender<Message>,
    generation: u64,
    tasks: Vec<AbortHandle>,
    reader: AbortHandle,
}

struct PendingInvocation {
    method: String,
    reply: oneshot::Sender<Result<(), RealtimeError>>,
}

struct HubInner {
    url: Mutex<Url>,
    access_token: AccessTokenFactory,
    retry_policy: Arc<dyn RetryPolicy>,
    events: mpsc::UnboundedSender<HubEvent>,
    handlers: Mutex<HashMap<String, Vec<RealtimeHandler>>>,
    link: Mutex<Option<Link>>,
    reconnect: Mutex<Option<AbortHandle>>,
    pending: Mutex<HashMap<String, PendingInvocation>>,
    next_invocation: AtomicU64,
    generation: AtomicU64,
    stopped: AtomicBool,
    timeouts: HubTimeouts,
    // serializes connection attempts between start, stop and reconnect
    start_lock: tokio::sync::Mutex<()>,
}

/// SignalR JSON hub client over websocket.
pub struct HubConnection {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("url", &lock(&self.inner.url).as_str())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl HubConnection {
    pub fn new(options: HubOptions) -> Self {
        Self::with_timeouts(options, HubTimeouts::default())
    }

    pub fn with_timeouts(options: HubOptions, timeouts: HubTimeouts) -> Self {
        Self {
            inner: Arc::new(HubInner {
                url: Mutex::new(options.url),
                access_token: options.access_token,
                retry_policy: options.retry_policy,
                events: options.events,
                handlers: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                reconnect: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_invocation: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                stopped: AtomicBool::new(true),
                timeouts,
                start_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).is_some()
    }
}

/// Websocket url for the hub with the token in the query, as browsers cannot
/// set headers on websocket requests.
fn socket_url(hub_url: &Url, token: &str) -> Result<Url, RealtimeError> {
    let mut url = hub_url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RealtimeError::Connect {
                url: hub_url.to_string(),
                message: format!("unsupported scheme `{other}`"),
            });
        }
    };
    url.set_scheme(scheme).map_err(|()| RealtimeError::Connect {
        url: hub_url.to_string(),
        message: "cannot switch to a websocket scheme".into(),
    })?;
    url.query_pairs_mut().append_pair("access_token", token);
    Ok(url)
}

fn connect_error(url: &Url, error: tungstenite::Error) -> RealtimeError {
    if let tungstenite::Error::Http(response) = &error
        && response.status() == tungstenite::http::StatusCode::UNAUTHORIZED
    {
        return RealtimeError::Unauthorized;
    }
    // never log the token carried in the query
    let mut url = url.clone();
    url.set_query(None);
    RealtimeError::Connect {
        url: url.to_string(),
        message: error.to_string(),
    }
}

impl HubInner {
    fn emit(&self, event: HubEvent) {
        // the receiver is gone once the owning context dropped the transport
        let _ = self.events.send(event);
    }

    fn fail_pending(&self, error: impl Fn() -> RealtimeError) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, invocation) in pending {
            let _ = invocation.reply.send(Err(error()));
        }
    }

    /// Tears down the live link. The reader is only aborted when the caller is
    /// not the reader itself.
    fn close_link(&self, generation: Option<u64>, abort_reader: bool) -> bool {
        let link = {
            let mut current = lock(&self.link);
            let matches = match (current.as_ref(), generation) {
                (None, _) => false,
                (Some(link), Some(generation)) => link.generation == generation,
                (Some(_), None) => true,
            };
            if !matches {
                return false;
            }
            current.take()
        };
        let Some(link) = link else {
            return false;
        };
        // the writer drains and sends the close frame once the last sender is gone
        let _ = link.writer.send(Message::Close(None));
        for task in link.tasks {
            task.abort();
        }
        if abort_reader {
            link.reader.abort();
        }
        true
    }

    /// Opens a websocket, completes the handshake and spawns the link tasks.
    async fn open(hub: &Arc<HubInner>) -> Result<(), RealtimeError> {
        metrics::counter!(crate::telemetry::REALTIME_CONNECT_ATTEMPTS).increment(1);

        let token = (hub.access_token)().await?;
        let hub_url = lock(&hub.url).clone();
        let url = socket_url(&hub_url, &token)?;

        debug!(url = %hub_url, "connecting to realtime hub");
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| connect_error(&url, e))?;
        let (mut write, mut read) = stream.split();

        write
            .send(Message::text(protocol::handshake_request()))
            .await
            .map_err(|e| connect_error(&url, e))?;
        let leftover = tokio::time::timeout(hub.timeouts.handshake, read_handshake(&mut read))
            .await
            .map_err(|_| RealtimeError::Handshake("timed out waiting for handshake".into()))??;

        let generation = hub.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(write, writer_rx));
        let keepalive = tokio::spawn(run_keepalive(
            writer_tx.clone(),
            hub.timeouts.keepalive_interval,
        ));
        let reader = tokio::spawn(run_reader(
            Arc::downgrade(hub),
            read,
            generation,
            hub.timeouts.server_timeout,
        ));

        *lock(&hub.link) = Some(Link {
            writer: writer_tx,
            generation,
            tasks: vec![keepalive.abort_handle()],
            reader: reader.abort_handle(),
        });
        info!(url = %hub_url, generation, "realtime hub connected");

        for message in leftover {
            hub.dispatch(message);
        }
        Ok(())
    }

    fn dispatch(&self, message: HubMessage) {
        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                let handlers = lock(&self.handlers)
                    .get(&target)
                    .cloned()
                    .unwrap_or_default();
                trace!(%target, handlers = handlers.len(), "hub event");
                let payload = arguments.into_iter().next().unwrap_or(Value::Null);
                for handler in handlers {
                    handler(payload.clone());
                }
            }
            HubMessage::Completion {
                invocation_id,
                error,
                ..
            } => {
                let Some(invocation) = lock(&self.pending).remove(&invocation_id) else {
                    trace!(%invocation_id, "completion for unknown invocation");
                    return;
                };
                let result = match error {
                    Some(message) => Err(RealtimeError::Invocation {
                        method: invocation.method,
                        message,
                    }),
                    None => Ok(()),
                };
                let _ = invocation.reply.send(result);
            }
            HubMessage::Ping => {}
            HubMessage::Close { .. } => {}
            HubMessage::Other(kind) => trace!(kind, "ignoring hub record"),
        }
    }

    /// Called by the reader when its socket ended.
    fn connection_lost(hub: &Arc<HubInner>, generation: u64, error: Option<String>) {
        if !hub.close_link(Some(generation), false) {
            return;
        }
        hub.fail_pending(|| RealtimeError::Closed);
        if hub.stopped.load(Ordering::Acquire) {
            return;
        }

        warn!(error = ?error, "realtime hub connection lost");
        hub.emit(HubEvent::Reconnecting {
            error: error.clone(),
        });
        let task = tokio::spawn(reconnect(Arc::downgrade(hub), error));
        if let Some(previous) = lock(&hub.reconnect).replace(task.abort_handle()) {
            previous.abort();
        }
    }
}

async fn read_handshake(read: &mut SplitStream<WsStream>) -> Result<Vec<HubMessage>, RealtimeError> {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => return protocol::parse_handshake_response(text.as_str()),
            Ok(Message::Close(frame)) => {
                return Err(RealtimeError::Handshake(
                    frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "connection closed during handshake".into()),
                ));
            }
            Ok(_) => {}
            Err(e) => return Err(RealtimeError::Handshake(e.to_string())),
        }
    }
    Err(RealtimeError::Handshake(
        "connection closed during handshake".into(),
    ))
}

async fn run_writer(
    mut write: SplitSink<WsStream, Message>,
    mut messages: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = messages.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(error) = write.send(message).await {
            debug!(%error, "hub writer stopped");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
}

async fn run_keepalive(writer: mpsc::UnboundedSender<Message>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        if writer
            .send(Message::text(HubMessage::Ping.to_frame()))
            .is_err()
        {
            return;
        }
    }
}

async fn run_reader(
    hub: Weak<HubInner>,
    mut read: SplitStream<WsStream>,
    generation: u64,
    server_timeout: Duration,
) {
    let error = 'read: loop {
        let next = tokio::time::timeout(server_timeout, read.next()).await;
        let Some(inner) = hub.upgrade() else {
            return;
        };
        match next {
            Err(_) => {
                break 'read Some("server timeout elapsed without receiving a message".to_string());
            }
            Ok(None) => break 'read None,
            Ok(Some(Err(e))) => break 'read Some(e.to_string()),
            Ok(Some(Ok(Message::Text(text)))) => {
                for message in protocol::parse_frames(text.as_str()) {
                    match message {
                        Ok(HubMessage::Close { error, .. }) => break 'read error,
                        Ok(message) => inner.dispatch(message),
                        Err(error) => warn!(%error, "malformed hub record"),
                    }
                }
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                break 'read frame.map(|f| format!("closed by server: {} {}", u16::from(f.code), f.reason.as_str()));
            }
            Ok(Some(Ok(_))) => {}
        }
    };

    if let Some(inner) = hub.upgrade() {
        HubInner::connection_lost(&inner, generation, error);
    }
}

async fn reconnect(hub: Weak<HubInner>, error: Option<String>) {
    let outage = Instant::now();
    let mut attempts = 0;
    let mut reason = error;

    loop {
        let Some(inner) = hub.upgrade() else {
            return;
        };
        let delay = inner.retry_policy.next_retry_delay(&RetryContext {
            previous_retry_count: attempts,
            elapsed: outage.elapsed(),
            retry_reason: reason.clone(),
        });
        let Some(delay) = delay else {
            info!(attempts, "realtime reconnection given up");
            lock(&inner.reconnect).take();
            inner.emit(HubEvent::Closed { error: reason });
            return;
        };
        drop(inner);

        debug!(attempt = attempts + 1, delay = ?delay, "reconnecting to realtime hub");
        tokio::time::sleep(delay).await;

        let Some(inner) = hub.upgrade() else {
            return;
        };
        let _guard = inner.start_lock.lock().await;
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }
        // a concurrent start already brought the link back
        if lock(&inner.link).is_some() {
            lock(&inner.reconnect).take();
            return;
        }
        match HubInner::open(&inner).await {
            Ok(()) => {
                lock(&inner.reconnect).take();
                inner.emit(HubEvent::Reconnected);
                return;
            }
            Err(e) => {
                debug!(error = %e, "realtime reconnect attempt failed");
                attempts += 1;
                reason = Some(e.to_string());
            }
        }
    }
}

impl RealtimeTransport for HubConnection {
    fn start(&self) -> BoxFuture<'_, Result<(), RealtimeError>> {
        Box::pin(async move {
            let _guard = self.inner.start_lock.lock().await;
            if self.is_connected() {
                return Ok(());
            }
            self.inner.stopped.store(false, Ordering::Release);
            HubInner::open(&self.inner).await
        })
    }

    fn stop(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.inner.stopped.store(true, Ordering::Release);
            let reconnecting = match lock(&self.inner.reconnect).take() {
                Some(task) => {
                    task.abort();
                    true
                }
                None => false,
            };

            let _guard = self.inner.start_lock.lock().await;
            let connected = self.inner.close_link(None, true);
            self.inner.fail_pending(|| RealtimeError::Closed);
            if connected || reconnecting {
                info!("realtime hub stopped");
                self.inner.emit(HubEvent::Closed { error: None });
            }
            connected || reconnecting
        })
    }

    fn set_url(&self, url: Url) {
        *lock(&self.inner.url) = url;
    }

    fn invoke<'a>(
        &'a self,
        method: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), RealtimeError>> {
        Box::pin(async move {
            let writer = lock(&self.inner.link)
                .as_ref()
                .map(|link| link.writer.clone())
                .ok_or(RealtimeError::NotConnected)?;

            let id = self
                .inner
                .next_invocation
                .fetch_add(1, Ordering::Relaxed)
                .to_string();
            let (reply, response) = oneshot::channel();
            lock(&self.inner.pending).insert(
                id.clone(),
                PendingInvocation {
                    method: method.to_string(),
                    reply,
                },
            );

            let frame = HubMessage::Invocation {
                invocation_id: Some(id.clone()),
                target: method.to_string(),
                arguments: vec![Value::String(topic.to_string())],
            }
            .to_frame();
            if writer.send(Message::text(frame)).is_err() {
                lock(&self.inner.pending).remove(&id);
                return Err(RealtimeError::NotConnected);
            }

            match tokio::time::timeout(self.inner.timeouts.invocation, response).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RealtimeError::Closed),
                Err(_) => {
                    lock(&self.inner.pending).remove(&id);
                    Err(RealtimeError::Timeout {
                        method: method.to_string(),
                    })
                }
            }
        })
    }

    fn on(&self, topic: &str, handler: RealtimeHandler) {
        lock(&self.inner.handlers)
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    fn off(&self, topic: &str, handler: &RealtimeHandler) {
        let mut handlers = lock(&self.inner.handlers);
        if let Some(registered) = handlers.get_mut(topic) {
            if let Some(position) = registered.iter().position(|h| same_handler(h, handler)) {
                registered.remove(position);
            }
            if registered.is_empty() {
                handlers.remove(topic);
            }
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(task) = lock(&self.inner.reconnect).take() {
            task.abort();
        }
        self.inner.close_link(None, true);
    }
}
