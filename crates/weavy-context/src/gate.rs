//! Readiness gates.
//!
//! A [`Gate`] is a one-shot signal that is opened (or rejected) from the
//! outside and awaited by any number of tasks. Once settled it never goes back
//! to pending. Where a readiness condition can be lost again, a [`GateSlot`]
//! swaps an open gate for a fresh pending one; tasks already past the old gate
//! are unaffected.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::DestroyError;
use crate::lock;

/// Settlement state of a [`Gate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Open,
    Rejected,
}

/// A one-shot readiness signal.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<GateState>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Pending);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> GateState {
        *self.tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == GateState::Open
    }

    pub fn is_settled(&self) -> bool {
        self.state() != GateState::Pending
    }

    /// Opens the gate. Returns `true` only for the call that opened it.
    pub fn open(&self) -> bool {
        self.settle(GateState::Open)
    }

    /// Rejects the gate so every waiter fails with [`DestroyError`].
    pub fn reject(&self) -> bool {
        self.settle(GateState::Rejected)
    }

    fn settle(&self, to: GateState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) -> Result<(), DestroyError> {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                GateState::Open => return Ok(()),
                GateState::Rejected => return Err(DestroyError),
                GateState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(DestroyError);
            }
        }
    }
}

/// Holder for a gate that may be re-armed.
#[derive(Debug, Default)]
pub struct GateSlot {
    current: Mutex<Gate>,
}

impl GateSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate currently in the slot.
    pub fn current(&self) -> Gate {
        lock(&self.current).clone()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.current).is_open()
    }

    pub fn open(&self) -> bool {
        lock(&self.current).open()
    }

    pub fn reject(&self) -> bool {
        lock(&self.current).reject()
    }

    /// Puts a fresh pending gate in the slot if the current one is open.
    ///
    /// A still pending gate is kept so its waiters are not stranded, and a
    /// rejected one stays rejected.
    pub fn rearm(&self) -> Gate {
        let mut current = lock(&self.current);
        if current.is_open() {
            *current = Gate::new();
        }
        current.clone()
    }

    pub async fn wait(&self) -> Result<(), DestroyError> {
        self.current().wait().await
    }
}
