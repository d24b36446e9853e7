//! Connectivity state shared between the application and the sync worker.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// Observable online/offline flag.
///
/// Cheap to clone; every clone sees the same state. The sync worker
/// subscribes and runs a cycle as soon as the state flips back to online.
#[derive(Debug, Clone)]
pub struct OfflineMode {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl Default for OfflineMode {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

impl OfflineMode {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_offline(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    /// Returns true if the state changed.
    pub fn set_offline(&self) -> bool {
        self.set(ConnectivityState::Offline)
    }

    /// Returns true if the state changed.
    pub fn set_online(&self) -> bool {
        self.set(ConnectivityState::Online)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    fn set(&self, next: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::info!(state = ?next, "connectivity changed");
        }
        changed
    }
}
