//! Device connectivity tracking.
//!
//! One process-wide [`ConnectivityMonitor`] holds the current
//! online/offline state and fans out transitions to subscribers through a
//! broadcast channel, so subscribers observe transitions in the order
//! they occurred and never block the notifier. State updates come from
//! the platform's reachability callbacks via [`ConnectivityMonitor::set_state`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 16;

/// Process-wide connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Network reachable.
    Online,
    /// Network unreachable.
    Offline,
}

/// Observes device reachability and publishes state transitions.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    // Serializes transition checks so broadcast order matches state order.
    transition: Mutex<()>,
    tx: broadcast::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            online: AtomicBool::new(initial == ConnectivityState::Online),
            transition: Mutex::new(()),
            tx,
        }
    }

    /// Returns true if the device is online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectivityState {
        if self.is_online() {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    /// Records a reachability change. Duplicate states are not re-published.
    pub fn set_state(&self, state: ConnectivityState) {
        let _guard = self.transition.lock().unwrap();
        let online = state == ConnectivityState::Online;
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        tracing::info!(online, "Connectivity changed");
        // Send fails only when no subscriber is listening.
        let _ = self.tx.send(state);
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}
