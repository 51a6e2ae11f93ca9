//! Listener contract
//!
//! Push-based fan-out of cursor notifications to any number of consumers.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Callbacks a consumer registers with a cursor
///
/// Callbacks may run on a background worker (fetch completion) as well as on
/// the owner thread.
pub trait CursorListener: Send + Sync {
    /// A refresh is needed and not yet running
    fn on_refresh_required(&self);

    /// A new snapshot is available; call `sync()` when convenient
    fn on_refresh_ready(&self);

    /// The logical row set changed in place
    fn on_data_set_changed(&self);
}

/// Notification emitted by the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorEvent {
    RefreshRequired,
    RefreshReady,
    DataSetChanged,
}

/// Registered listeners, notified in no particular order
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn CursorListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn CursorListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove(&self, listener: &Arc<dyn CursorListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every listener
    ///
    /// The registration lock is released before callbacks run, so a listener
    /// may (un)register from inside its callback.
    pub fn emit(&self, event: CursorEvent) {
        let listeners: Vec<Arc<dyn CursorListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in listeners {
            match event {
                CursorEvent::RefreshRequired => listener.on_refresh_required(),
                CursorEvent::RefreshReady => listener.on_refresh_ready(),
                CursorEvent::DataSetChanged => listener.on_data_set_changed(),
            }
        }
    }
}

/// Listener forwarding every notification into a channel
pub struct ChannelListener {
    tx: Sender<CursorEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, Receiver<CursorEvent>) {
        let (tx, rx) = flume::unbounded();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: CursorEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!("Dropped cursor event {:?}: {}", event, e);
        }
    }
}

impl CursorListener for ChannelListener {
    fn on_refresh_required(&self) {
        self.send(CursorEvent::RefreshRequired);
    }

    fn on_refresh_ready(&self) {
        self.send(CursorEvent::RefreshReady);
    }

    fn on_data_set_changed(&self) {
        self.send(CursorEvent::DataSetChanged);
    }
}
