//! Background refresh coordination
//!
//! Fetches a replacement snapshot off the owner thread and holds it until the
//! consumer explicitly calls `sync()`. Listener delivery is gated by a pause
//! flag and a defer-sync flag; suppressed signals stay pending and are flushed
//! when the gate opens.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cursor::listener::{CursorEvent, ListenerSet};
use crate::cursor::snapshot::Snapshot;
use crate::sync::backend::SnapshotSource;
use crate::types::error::CursorError;

/// Refresh state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshState {
    Idle,
    FetchInFlight,
    ReadyToSwap,
}

struct RefreshInner {
    state: RefreshState,
    pending: Option<Snapshot>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every request/cancel/close; a fetch completing under an
    /// older generation is discarded
    generation: u64,
    refresh_required: bool,
    /// Upstream changes seen so far, and how many of them the current fetch
    /// started after
    changes: u64,
    covered: u64,
    refresh_ready: bool,
    data_changed: bool,
    paused: bool,
    defer_sync: bool,
    closed: bool,
}

impl RefreshInner {
    fn gate_open(&self) -> bool {
        !self.paused && !self.defer_sync
    }

    fn discard_pending(&mut self) {
        if let Some(snapshot) = self.pending.take() {
            snapshot.close();
        }
        self.refresh_ready = false;
    }
}

pub struct RefreshCoordinator {
    inner: Arc<Mutex<RefreshInner>>,
    source: Arc<dyn SnapshotSource>,
    listeners: Arc<ListenerSet>,
    runtime: Handle,
}

impl RefreshCoordinator {
    pub fn new(source: Arc<dyn SnapshotSource>, listeners: Arc<ListenerSet>, runtime: Handle) -> Self {
        let inner = RefreshInner {
            state: RefreshState::Idle,
            pending: None,
            task: None,
            generation: 0,
            refresh_required: false,
            changes: 0,
            covered: 0,
            refresh_ready: false,
            data_changed: false,
            paused: false,
            defer_sync: false,
            closed: false,
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            source,
            listeners,
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> RefreshState {
        self.lock().state
    }

    pub fn is_refresh_required(&self) -> bool {
        self.lock().refresh_required
    }

    pub fn is_refresh_ready(&self) -> bool {
        self.lock().refresh_ready
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Start a background fetch
    ///
    /// Returns false when a fetch is already in flight. A snapshot waiting to
    /// be swapped in is discarded in favor of the new fetch.
    pub fn request_refresh(&self) -> Result<bool, CursorError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(CursorError::DisabledCursor);
        }
        if inner.state == RefreshState::FetchInFlight {
            debug!("Refresh already in flight");
            return Ok(false);
        }

        inner.discard_pending();
        inner.generation += 1;
        inner.state = RefreshState::FetchInFlight;
        inner.refresh_required = false;
        inner.covered = inner.changes;

        let generation = inner.generation;
        let source = self.source.clone();
        let shared = self.inner.clone();
        let listeners = self.listeners.clone();

        debug!("Starting snapshot fetch #{}", generation);
        let task = self.runtime.spawn(async move {
            let result = source.fetch().await;
            complete_fetch(&shared, &listeners, generation, result);
        });
        inner.task = Some(task);

        Ok(true)
    }

    /// Abandon any in-flight fetch and any snapshot waiting to be swapped in
    ///
    /// A running fetch is not interrupted; its result is discarded when it
    /// arrives.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        if inner.state == RefreshState::Idle {
            return;
        }

        info!("Cancelling refresh in state {:?}", inner.state);
        inner.generation += 1;
        inner.discard_pending();
        inner.task = None;
        inner.state = RefreshState::Idle;
    }

    /// Wait for the in-flight fetch, if any, to finish
    pub async fn join(&self) {
        let task = self.lock().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Snapshot fetch task failed: {}", e);
                }
            }
        }
    }

    /// Record that the remote data changed
    pub fn notify_upstream_changed(&self) {
        let deliver = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.refresh_required = true;
            inner.changes += 1;
            inner.gate_open()
        };

        if deliver {
            self.listeners.emit(CursorEvent::RefreshRequired);
        } else {
            debug!("Refresh required; notification deferred");
        }
    }

    /// Tell listeners the visible data changed
    pub fn notify_data_changed(&self) {
        let deliver = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            let open = inner.gate_open();
            inner.data_changed = !open;
            open
        };

        if deliver {
            self.listeners.emit(CursorEvent::DataSetChanged);
        }
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Reopen the notification gate and flush pending signals
    pub fn resume(&self) {
        self.lock().paused = false;
        self.flush();
    }

    /// Suppress notifications while rows are mid-animation
    pub fn set_defer_sync(&self, defer: bool) {
        self.lock().defer_sync = defer;
        if !defer {
            self.flush();
        }
    }

    /// Deliver pending signals if the gate is open
    pub fn flush(&self) {
        let (required, ready, changed) = {
            let mut inner = self.lock();
            if inner.closed || !inner.gate_open() {
                return;
            }
            let changed = std::mem::take(&mut inner.data_changed);
            (inner.refresh_required, inner.refresh_ready, changed)
        };

        if required {
            self.listeners.emit(CursorEvent::RefreshRequired);
        }
        if ready {
            self.listeners.emit(CursorEvent::RefreshReady);
        }
        if changed {
            self.listeners.emit(CursorEvent::DataSetChanged);
        }
    }

    /// Hand the waiting snapshot to `swap`
    ///
    /// Returns false when no snapshot is ready. This is the only path by
    /// which a fetched snapshot reaches the cursor.
    pub fn sync<F>(&self, swap: F) -> Result<bool, CursorError>
    where
        F: FnOnce(Snapshot) -> Result<(), CursorError>,
    {
        let snapshot = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(CursorError::DisabledCursor);
            }
            if inner.state != RefreshState::ReadyToSwap {
                return Ok(false);
            }
            let Some(snapshot) = inner.pending.take() else {
                inner.state = RefreshState::Idle;
                return Ok(false);
            };
            inner.state = RefreshState::Idle;
            inner.refresh_ready = false;
            if inner.changes == inner.covered {
                inner.refresh_required = false;
            } else {
                debug!("Upstream changed during the fetch; refresh still required");
            }
            snapshot
        };

        swap(snapshot)?;
        Ok(true)
    }

    /// Stop accepting fetch results and release any pending snapshot
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.generation += 1;
        inner.discard_pending();
        inner.refresh_required = false;
        inner.data_changed = false;
        inner.state = RefreshState::Idle;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }
}

fn complete_fetch(
    shared: &Mutex<RefreshInner>,
    listeners: &ListenerSet,
    generation: u64,
    result: Result<Option<Snapshot>, CursorError>,
) {
    let deliver = {
        let mut inner = shared.lock().unwrap_or_else(|e| e.into_inner());

        if inner.closed || inner.generation != generation {
            debug!("Discarding snapshot fetch #{} (cancelled or closed)", generation);
            if let Ok(Some(snapshot)) = result {
                snapshot.close();
            }
            return;
        }

        inner.task = None;
        match result {
            Ok(Some(snapshot)) => {
                info!("Snapshot fetch #{} ready: {} rows", generation, snapshot.len());
                inner.pending = Some(snapshot);
                inner.state = RefreshState::ReadyToSwap;
                inner.refresh_ready = true;
                inner.gate_open()
            }
            Ok(None) => {
                warn!("Snapshot fetch #{} returned no result", generation);
                inner.state = RefreshState::Idle;
                false
            }
            Err(e) => {
                warn!("Snapshot fetch #{} failed: {}", generation, e);
                inner.state = RefreshState::Idle;
                false
            }
        }
    };

    if deliver {
        listeners.emit(CursorEvent::RefreshReady);
    } else {
        debug!("Snapshot fetch #{} completed; notification deferred", generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::listener::ChannelListener;
    use crate::types::Row;
    use async_trait::async_trait;
    use flume::{Receiver, Sender};

    /// Source whose fetches complete only when the test says so
    struct GatedSource {
        results: Receiver<Result<Option<Snapshot>, CursorError>>,
    }

    #[async_trait]
    impl SnapshotSource for GatedSource {
        async fn fetch(&self) -> Result<Option<Snapshot>, CursorError> {
            self.results.recv_async().await.unwrap_or(Ok(None))
        }
    }

    type ResultSender = Sender<Result<Option<Snapshot>, CursorError>>;

    fn setup() -> (RefreshCoordinator, ResultSender, Receiver<CursorEvent>) {
        let (tx, rx) = flume::unbounded();
        let listeners = Arc::new(ListenerSet::new());
        let (listener, events) = ChannelListener::new();
        listeners.add(listener);

        let coordinator = RefreshCoordinator::new(
            Arc::new(GatedSource { results: rx }),
            listeners,
            Handle::current(),
        );
        (coordinator, tx, events)
    }

    fn snapshot(n: usize) -> Snapshot {
        Snapshot::from_rows(
            (0..n)
                .map(|i| Row::new(format!("content://mail/conversation/{}", i)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_fetch_then_sync() {
        let (coordinator, results, events) = setup();

        assert!(coordinator.request_refresh().unwrap());
        assert_eq!(coordinator.state(), RefreshState::FetchInFlight);
        assert!(!coordinator.request_refresh().unwrap());

        results.send(Ok(Some(snapshot(3)))).unwrap();
        coordinator.join().await;

        assert_eq!(coordinator.state(), RefreshState::ReadyToSwap);
        assert!(coordinator.is_refresh_ready());
        assert_eq!(events.try_recv().unwrap(), CursorEvent::RefreshReady);

        let mut swapped = 0;
        let applied = coordinator
            .sync(|s| {
                swapped = s.len();
                Ok(())
            })
            .unwrap();
        assert!(applied);
        assert_eq!(swapped, 3);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert!(!coordinator.is_refresh_ready());

        // Nothing left to swap
        assert!(!coordinator.sync(|_| Ok(())).unwrap());
    }

    #[tokio::test]
    async fn test_cancel_discards_late_result() {
        let (coordinator, results, events) = setup();

        coordinator.request_refresh().unwrap();
        coordinator.cancel();
        assert_eq!(coordinator.state(), RefreshState::Idle);

        results.send(Ok(Some(snapshot(2)))).unwrap();
        // Let the detached fetch finish
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert!(!coordinator.is_refresh_ready());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_fetch_returns_to_idle() {
        let (coordinator, results, events) = setup();

        coordinator.request_refresh().unwrap();
        results.send(Err(CursorError::Fetch("offline".into()))).unwrap();
        coordinator.join().await;
        assert_eq!(coordinator.state(), RefreshState::Idle);

        coordinator.request_refresh().unwrap();
        results.send(Ok(None)).unwrap();
        coordinator.join().await;
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pause_defers_notifications() {
        let (coordinator, results, events) = setup();

        coordinator.pause();
        coordinator.notify_upstream_changed();
        assert!(coordinator.is_refresh_required());
        assert!(events.try_recv().is_err());

        coordinator.resume();
        assert_eq!(events.try_recv().unwrap(), CursorEvent::RefreshRequired);

        coordinator.pause();
        coordinator.request_refresh().unwrap();
        assert!(!coordinator.is_refresh_required());
        results.send(Ok(Some(snapshot(1)))).unwrap();
        coordinator.join().await;
        assert!(events.try_recv().is_err());

        coordinator.resume();
        assert_eq!(events.try_recv().unwrap(), CursorEvent::RefreshReady);
    }

    #[tokio::test]
    async fn test_defer_sync_gates_delivery() {
        let (coordinator, _results, events) = setup();

        coordinator.set_defer_sync(true);
        coordinator.notify_upstream_changed();
        assert!(events.try_recv().is_err());

        // Resuming alone does not open the gate while sync is deferred
        coordinator.resume();
        assert!(events.try_recv().is_err());

        coordinator.set_defer_sync(false);
        assert_eq!(events.try_recv().unwrap(), CursorEvent::RefreshRequired);
    }

    #[tokio::test]
    async fn test_change_during_fetch_survives_sync() {
        let (coordinator, results, events) = setup();

        coordinator.pause();
        coordinator.request_refresh().unwrap();
        coordinator.notify_upstream_changed();
        results.send(Ok(Some(snapshot(2)))).unwrap();
        coordinator.join().await;

        assert!(coordinator.sync(|_| Ok(())).unwrap());
        assert!(coordinator.is_refresh_required());
        assert!(!coordinator.is_refresh_ready());

        coordinator.resume();
        assert_eq!(events.try_recv().unwrap(), CursorEvent::RefreshRequired);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_change_before_fetch_is_covered() {
        let (coordinator, results, _events) = setup();

        coordinator.notify_upstream_changed();
        coordinator.request_refresh().unwrap();
        results.send(Ok(Some(snapshot(1)))).unwrap();
        coordinator.join().await;

        assert!(coordinator.sync(|_| Ok(())).unwrap());
        assert!(!coordinator.is_refresh_required());
    }

    #[tokio::test]
    async fn test_data_changed_is_held_once() {
        let (coordinator, _results, events) = setup();

        coordinator.notify_data_changed();
        assert_eq!(events.try_recv().unwrap(), CursorEvent::DataSetChanged);

        coordinator.pause();
        coordinator.notify_data_changed();
        coordinator.notify_data_changed();
        assert!(events.try_recv().is_err());

        coordinator.resume();
        assert_eq!(events.try_recv().unwrap(), CursorEvent::DataSetChanged);
        assert!(events.try_recv().is_err());

        // Already delivered
        coordinator.flush();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_rejects_requests() {
        let (coordinator, _results, events) = setup();

        coordinator.request_refresh().unwrap();
        coordinator.close();
        coordinator.close();

        assert_eq!(coordinator.request_refresh(), Err(CursorError::DisabledCursor));
        coordinator.notify_upstream_changed();
        assert!(!coordinator.is_refresh_required());
        assert!(events.try_recv().is_err());
    }
}
