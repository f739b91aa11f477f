//! Network status aggregation.
//!
//! Combines three inputs into one derived [`NetworkStatus`]:
//! - raw browser connectivity ([`NetworkState`])
//! - the outcome of the last HTTP call ([`ServerState`])
//! - the realtime link state ([`ConnectionState`])

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::lock;

/// Browser connectivity, and the derived overall state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Online,
    Unreachable,
    Offline,
}

/// Outcome of the last HTTP exchange with the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Ok,
    Unreachable,
    Unauthorized,
}

/// Realtime link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Derived status exposed to widgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub state: NetworkState,
    pub is_pending: bool,
}

impl NetworkStatus {
    /// `offline` iff the browser is offline, `online` iff the browser is online
    /// and either the realtime link is connected or the server answered,
    /// `unreachable` otherwise.
    pub fn derive(
        network: NetworkState,
        server: ServerState,
        connection: ConnectionState,
        is_pending: bool,
    ) -> Self {
        let state = match network {
            NetworkState::Offline => NetworkState::Offline,
            _ if connection == ConnectionState::Connected || server == ServerState::Ok => {
                NetworkState::Online
            }
            _ => NetworkState::Unreachable,
        };
        Self { state, is_pending }
    }
}

/// Callback invoked with every new derived status.
pub type NetworkListener = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Registration handle returned by [`NetworkStatusAggregator::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy)]
struct Inputs {
    network_state: NetworkState,
    server_state: ServerState,
    connection_state: ConnectionState,
    is_pending: bool,
}

impl Inputs {
    fn status(&self) -> NetworkStatus {
        NetworkStatus::derive(
            self.network_state,
            self.server_state,
            self.connection_state,
            self.is_pending,
        )
    }
}

/// Owns the raw inputs and broadcasts the derived status.
pub struct NetworkStatusAggregator {
    inputs: Mutex<Inputs>,
    listeners: Mutex<Vec<(ListenerId, NetworkListener)>>,
    next_listener: AtomicU64,
    status: watch::Sender<NetworkStatus>,
    /// Last status handed to listeners.
    notified: Mutex<NetworkStatus>,
    /// Set while some thread is calling listeners.
    dispatching: AtomicBool,
}

impl std::fmt::Debug for NetworkStatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStatusAggregator")
            .field("inputs", &*lock(&self.inputs))
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

impl NetworkStatusAggregator {
    pub fn new(online: bool) -> Self {
        let inputs = Inputs {
            network_state: if online {
                NetworkState::Online
            } else {
                NetworkState::Offline
            },
            server_state: ServerState::Ok,
            connection_state: ConnectionState::Connecting,
            is_pending: false,
        };
        Self {
            status: watch::Sender::new(inputs.status()),
            notified: Mutex::new(inputs.status()),
            dispatching: AtomicBool::new(false),
            inputs: Mutex::new(inputs),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        lock(&self.inputs).status()
    }

    pub fn network_state(&self) -> NetworkState {
        lock(&self.inputs).network_state
    }

    pub fn server_state(&self) -> ServerState {
        lock(&self.inputs).server_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inputs).connection_state
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.inputs).is_pending
    }

    pub fn set_network_state(&self, state: NetworkState) {
        self.update(|inputs| inputs.network_state = state);
    }

    pub fn set_server_state(&self, state: ServerState) {
        self.update(|inputs| inputs.server_state = state);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.update(|inputs| inputs.connection_state = state);
    }

    pub fn set_pending(&self, pending: bool) {
        self.update(|inputs| inputs.is_pending = pending);
    }

    /// Applies a browser `online`/`offline` event.
    pub fn handle_online(&self, online: bool) {
        self.update(|inputs| {
            if online {
                inputs.network_state = NetworkState::Online;
            } else {
                inputs.network_state = NetworkState::Offline;
                inputs.is_pending = false;
            }
        });
    }

    pub fn add_listener(&self, listener: NetworkListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    fn update(&self, apply: impl FnOnce(&mut Inputs)) {
        {
            let mut inputs = lock(&self.inputs);
            apply(&mut inputs);
            let status = inputs.status();
            // published under the inputs lock so concurrent updates land in order
            let changed = self.status.send_if_modified(|current| {
                let changed = *current != status;
                *current = status;
                changed
            });
            if !changed {
                return;
            }
        }
        self.notify_listeners();
    }

    /// Hands the latest status to the listeners until they have seen it.
    ///
    /// One thread dispatches at a time; a change made meanwhile (including from
    /// inside a listener) is picked up by the dispatching thread.
    fn notify_listeners(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let status = {
                    let mut notified = lock(&self.notified);
                    let latest = *self.status.borrow();
                    if *notified == latest {
                        break;
                    }
                    *notified = latest;
                    latest
                };

                tracing::trace!(state = ?status.state, pending = status.is_pending, "network status changed");
                let listeners: Vec<NetworkListener> = lock(&self.listeners)
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect();
                for listener in listeners {
                    listener(status);
                }
            }
            self.dispatching.store(false, Ordering::Release);

            // a change that arrived after the last check but before the release
            let caught_up = *lock(&self.notified) == *self.status.borrow();
            if caught_up {
                return;
            }
        }
    }
}
