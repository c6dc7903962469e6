//! Network change notification
//!
//! Registration hands back a [`SubscriptionToken`]; the holder revokes it at
//! teardown. Callbacks may fire from any thread at any time after
//! registration.

use crate::error::MonitorError;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub trait NetworkMonitor: Send + Sync {
    fn register_callback(&self, callback: ChangeCallback) -> SubscriptionToken;
    fn unregister_callback(&self, token: SubscriptionToken) -> Result<(), MonitorError>;
}

/// Callback list fired by whoever observes interface changes
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: Mutex<IndexMap<u64, ChangeCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fire every registered callback. The list is snapshotted first so a
    /// callback may unregister itself or others.
    pub fn notify(&self) {
        let callbacks: Vec<ChangeCallback> = match self.callbacks.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => {
                warn!("Callback registry lock poisoned, dropping notification");
                return;
            }
        };
        trace!("Notifying {} network callbacks", callbacks.len());
        for callback in callbacks {
            callback();
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().map(|it| it.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NetworkMonitor for CallbackRegistry {
    fn register_callback(&self, callback: ChangeCallback) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.callbacks.lock() {
            map.insert(id, callback);
        }
        SubscriptionToken(id)
    }

    fn unregister_callback(&self, token: SubscriptionToken) -> Result<(), MonitorError> {
        let removed = self
            .callbacks
            .lock()
            .ok()
            .and_then(|mut map| map.shift_remove(&token.0));
        match removed {
            Some(_) => Ok(()),
            None => Err(MonitorError::UnknownSubscription(token.0)),
        }
    }
}

/// Fire `registry` every `period` on the blocking pool. The first tick is
/// skipped since callers compute their initial state at setup.
pub fn spawn_poller(registry: Arc<CallbackRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let registry = registry.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || registry.notify()).await {
                warn!("Network callback panicked: {}", e);
            }
        }
    })
}
