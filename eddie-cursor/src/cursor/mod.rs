//! Caching conversation cursor
//!
//! Presents the active snapshot minus soft-deleted rows as a single ordered
//! view, with every column read passing through the local override store
//! first. Mutations show up immediately while the backing authorities are
//! updated out of band; a replacement snapshot is only installed when the
//! consumer calls `sync()`.
//!
//! Reads and navigation are expected on one owner thread. A single lock
//! guards the override store, the active snapshot and the position, and is
//! never held across a fetch or a remote dispatch.

pub mod listener;
pub mod overrides;
pub mod snapshot;
pub mod uri;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CursorConfig;
use crate::sync::backend::{MutationBackend, SnapshotSource};
use crate::sync::refresh::{RefreshCoordinator, RefreshState};
use crate::sync::sequencer::{LocalCache, OperationSequencer, RowMutation};
use crate::types::error::CursorError;
use crate::types::{operations, ColumnValue, ColumnValues, RowId};
use listener::{CursorListener, ListenerSet};
use overrides::LocalOverrideStore;
use snapshot::Snapshot;

/// State guarded by the cursor lock
struct CursorState {
    snapshot: Option<Arc<Snapshot>>,
    overrides: LocalOverrideStore,
    /// Position in the snapshot, -1 before the first row
    raw_position: isize,
    /// Position in the visible (non-deleted) view, -1 before the first row
    position: isize,
}

impl CursorState {
    fn active(&self) -> Result<Arc<Snapshot>, CursorError> {
        self.snapshot.clone().ok_or(CursorError::DisabledCursor)
    }

    fn count(&self) -> Result<usize, CursorError> {
        let snapshot = self.snapshot.as_ref().ok_or(CursorError::DisabledCursor)?;
        Ok(snapshot.len().saturating_sub(self.overrides.deleted_count()))
    }

    fn on_row(&self) -> Result<bool, CursorError> {
        Ok(self.position >= 0 && (self.position as usize) < self.count()?)
    }

    fn is_hidden(&self, snapshot: &Snapshot, raw: isize) -> bool {
        snapshot
            .row_id(raw as usize)
            .map_or(true, |id| self.overrides.is_deleted(id))
    }

    fn advance(&mut self) -> Result<bool, CursorError> {
        let snapshot = self.active()?;
        let len = snapshot.len() as isize;

        loop {
            self.raw_position += 1;
            if self.raw_position >= len {
                self.raw_position = len;
                self.position = self.count()? as isize;
                return Ok(false);
            }
            if !self.is_hidden(&snapshot, self.raw_position) {
                self.position += 1;
                return Ok(true);
            }
        }
    }

    fn retreat(&mut self) -> Result<bool, CursorError> {
        let snapshot = self.active()?;

        loop {
            self.raw_position -= 1;
            if self.raw_position < 0 {
                self.raw_position = -1;
                self.position = -1;
                return Ok(false);
            }
            if !self.is_hidden(&snapshot, self.raw_position) {
                self.position -= 1;
                return Ok(true);
            }
        }
    }

    fn seek_first(&mut self) -> Result<bool, CursorError> {
        self.active()?;
        self.raw_position = -1;
        self.position = -1;
        self.advance()
    }

    fn seek(&mut self, pos: isize) -> Result<bool, CursorError> {
        self.active()?;

        if pos == self.position {
            return self.on_row();
        }
        if pos < 0 {
            self.raw_position = -1;
            self.position = -1;
            return Ok(false);
        }
        if pos == 0 {
            return self.seek_first();
        }
        if pos > self.position {
            while pos > self.position {
                if !self.advance()? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        if self.position - pos > pos {
            // Closer to the start than to the current row
            self.seek_first()?;
            return self.seek(pos);
        }
        while pos < self.position {
            if !self.retreat()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn recalibrate(&mut self) -> Result<(), CursorError> {
        let pos = self.position;
        self.seek_first()?;
        self.seek(pos)?;
        Ok(())
    }

    fn current_id(&self) -> Result<Option<RowId>, CursorError> {
        let snapshot = self.active()?;
        if self.raw_position < 0 || self.raw_position as usize >= snapshot.len() {
            return Ok(None);
        }
        Ok(snapshot.row_id(self.raw_position as usize).cloned())
    }
}

pub struct CachingCursor {
    state: Mutex<CursorState>,
    config: CursorConfig,
    listeners: Arc<ListenerSet>,
    refresh: Arc<RefreshCoordinator>,
    sequencer: OperationSequencer,
    runtime: Handle,
    owner: ThreadId,
    watcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CachingCursor {
    /// Create a cursor over an optional initial snapshot
    ///
    /// Must be called from within a tokio runtime; background fetches and
    /// remote dispatches are spawned on it. The calling thread becomes the
    /// owner thread.
    pub fn new(
        snapshot: Option<Snapshot>,
        source: Arc<dyn SnapshotSource>,
        backend: Arc<dyn MutationBackend>,
        config: CursorConfig,
    ) -> Result<Self, CursorError> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| CursorError::Runtime(format!("No tokio runtime available: {}", e)))?;

        let listeners = Arc::new(ListenerSet::new());
        let refresh = Arc::new(RefreshCoordinator::new(
            source,
            listeners.clone(),
            runtime.clone(),
        ));
        let sequencer = OperationSequencer::new(backend, config.clone(), runtime.clone());

        if let Some(snapshot) = &snapshot {
            info!("Creating cursor over {} rows", snapshot.len());
        }

        Ok(Self {
            state: Mutex::new(CursorState {
                snapshot: snapshot.map(Arc::new),
                overrides: LocalOverrideStore::new(),
                raw_position: -1,
                position: -1,
            }),
            config,
            listeners,
            refresh,
            sequencer,
            runtime,
            owner: thread::current().id(),
            watcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CursorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self) -> Result<(), CursorError> {
        if self.is_closed() {
            return Err(CursorError::DisabledCursor);
        }
        Ok(())
    }

    /// Override writes interleaved with a read of the row count on the owner
    /// thread would desynchronize a list mid-layout
    fn check_owner_thread(&self, operation: &str) {
        if self.config.warn_off_owner_thread && thread::current().id() != self.owner {
            warn!("{} called off the owner thread ({:?})", operation, thread::current().id());
        }
    }

    fn backing_id(&self, id: &RowId) -> Result<RowId, CursorError> {
        uri::unforward(id, &self.config.local_authority)
    }

    pub fn config(&self) -> &CursorConfig {
        &self.config
    }

    // --- Reads ---------------------------------------------------------

    /// Number of visible rows
    pub fn row_count(&self) -> Result<usize, CursorError> {
        self.lock().count()
    }

    /// Visible position, -1 before the first row, `row_count()` after the last
    pub fn position(&self) -> Result<isize, CursorError> {
        let state = self.lock();
        state.active()?;
        Ok(state.position)
    }

    pub fn is_before_first(&self) -> Result<bool, CursorError> {
        Ok(self.position()? < 0)
    }

    pub fn is_after_last(&self) -> Result<bool, CursorError> {
        let state = self.lock();
        Ok(state.position >= state.count()? as isize)
    }

    pub fn column_names(&self) -> Result<Vec<String>, CursorError> {
        Ok(self.lock().active()?.columns().to_vec())
    }

    /// Column value of a row: the local override if any, else the snapshot
    /// value
    ///
    /// The canonical identifier column is always returned in forwarded form.
    pub fn column_value(&self, id: &RowId, column: &str) -> Result<Option<ColumnValue>, CursorError> {
        let id = self.backing_id(id)?;
        let state = self.lock();
        let snapshot = state.active()?;

        if column == self.config.uri_column {
            if !snapshot.contains(&id) && state.overrides.get(&id).is_none() {
                return Ok(None);
            }
            let forwarded = uri::forward(&id, &self.config.local_authority)?;
            return Ok(Some(ColumnValue::Text(forwarded.to_string())));
        }

        if let Some(value) = state.overrides.value(&id, column) {
            return Ok(Some(value));
        }
        Ok(snapshot.value_of(&id, column).cloned())
    }

    /// Backing identifier of the current row
    pub fn row_id(&self) -> Result<Option<RowId>, CursorError> {
        self.lock().current_id()
    }

    /// Column value of the current row
    pub fn value(&self, column: &str) -> Result<Option<ColumnValue>, CursorError> {
        let id = self
            .row_id()?
            .ok_or_else(|| CursorError::RowNotFound("cursor is not positioned on a row".into()))?;
        self.column_value(&id, column)
    }

    /// Identifiers of the visible rows, in order
    pub fn row_ids(&self) -> Result<Vec<RowId>, CursorError> {
        let state = self.lock();
        let snapshot = state.active()?;
        Ok(snapshot
            .rows()
            .filter(|row| !state.overrides.is_deleted(&row.id))
            .map(|row| row.id.clone())
            .collect())
    }

    pub fn is_deleted(&self, id: &RowId) -> Result<bool, CursorError> {
        let id = self.backing_id(id)?;
        Ok(self.lock().overrides.is_deleted(&id))
    }

    pub fn deleted_count(&self) -> usize {
        self.lock().overrides.deleted_count()
    }

    pub fn override_count(&self) -> usize {
        self.lock().overrides.len()
    }

    /// The active snapshot, if any
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.lock().snapshot.clone()
    }

    // --- Navigation ----------------------------------------------------

    pub fn advance(&self) -> Result<bool, CursorError> {
        self.lock().advance()
    }

    pub fn retreat(&self) -> Result<bool, CursorError> {
        self.lock().retreat()
    }

    pub fn seek_first(&self) -> Result<bool, CursorError> {
        self.lock().seek_first()
    }

    /// Move to a visible position
    ///
    /// On failure the position is left at -1 or `row_count()`.
    pub fn seek(&self, pos: isize) -> Result<bool, CursorError> {
        self.lock().seek(pos)
    }

    /// Re-derive the position after the set of hidden rows changed
    pub fn recalibrate(&self) -> Result<(), CursorError> {
        self.lock().recalibrate()
    }

    // --- Refresh -------------------------------------------------------

    /// Install a new snapshot
    ///
    /// Prunes overrides made redundant by the incoming snapshot, closes the
    /// previous one and resets the position to -1, all under the cursor lock.
    pub fn swap_snapshot(&self, snapshot: Snapshot) -> Result<(), CursorError> {
        if self.is_closed() {
            snapshot.close();
            return Err(CursorError::DisabledCursor);
        }

        let now = Utc::now();
        let mut state = self.lock();
        let stats = state
            .overrides
            .prune(&snapshot, now, self.config.retention_window());

        if let Some(previous) = state.snapshot.take() {
            previous.close();
        }
        let rows = snapshot.len();
        state.snapshot = Some(Arc::new(snapshot));
        state.raw_position = -1;
        state.position = -1;

        info!(
            "Swapped snapshot: {} rows, pruned {} overrides ({} confirmed deletes), {} remain",
            rows,
            stats.removed,
            stats.confirmed_deletes,
            state.overrides.len()
        );
        Ok(())
    }

    /// Apply the snapshot waiting in the refresh coordinator
    ///
    /// Returns false when none was ready.
    pub fn sync(&self) -> Result<bool, CursorError> {
        self.check_open()?;
        let swapped = self.refresh.sync(|snapshot| self.swap_snapshot(snapshot))?;
        if swapped {
            self.refresh.notify_data_changed();
        }
        Ok(swapped)
    }

    pub fn request_refresh(&self) -> Result<bool, CursorError> {
        self.check_open()?;
        self.refresh.request_refresh()
    }

    pub fn cancel_refresh(&self) {
        self.refresh.cancel();
    }

    /// Wait for the in-flight fetch, if any
    pub async fn join_refresh(&self) {
        self.refresh.join().await;
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.refresh.state()
    }

    pub fn is_refresh_required(&self) -> bool {
        self.refresh.is_refresh_required()
    }

    pub fn is_refresh_ready(&self) -> bool {
        self.refresh.is_refresh_ready()
    }

    /// Record an upstream change notification
    pub fn notify_upstream_changed(&self) {
        if self.is_closed() {
            return;
        }
        self.refresh.notify_upstream_changed();
    }

    /// Observe upstream change notifications from a channel until closed
    pub fn watch_upstream(&self, changes: flume::Receiver<()>) -> Result<(), CursorError> {
        self.check_open()?;
        let refresh = self.refresh.clone();
        let task = self.runtime.spawn(async move {
            while changes.recv_async().await.is_ok() {
                refresh.notify_upstream_changed();
            }
            debug!("Upstream change channel closed");
        });

        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = watcher.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub fn pause(&self) {
        self.refresh.pause();
    }

    pub fn resume(&self) {
        self.refresh.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.refresh.is_paused()
    }

    pub fn add_listener(&self, listener: Arc<dyn CursorListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CursorListener>) {
        self.listeners.remove(listener);
    }

    // --- Mutations -----------------------------------------------------

    /// Submit a batch of mutations; returns its sequence number
    pub fn submit(&self, batch: Vec<RowMutation>) -> Result<u64, CursorError> {
        self.check_open()?;
        self.check_owner_thread("submit");
        self.sequencer.submit(self, batch)
    }

    fn submit_each<F>(&self, ids: &[RowId], build: F) -> Result<u64, CursorError>
    where
        F: Fn(RowId) -> RowMutation,
    {
        self.submit(ids.iter().cloned().map(build).collect())
    }

    pub fn update(&self, ids: &[RowId], values: ColumnValues) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::update(id, values.clone()))
    }

    pub fn update_column(
        &self,
        ids: &[RowId],
        column: &str,
        value: impl Into<ColumnValue>,
    ) -> Result<u64, CursorError> {
        let mut values = ColumnValues::new();
        values.insert(column.to_string(), value.into());
        self.update(ids, values)
    }

    pub fn insert(&self, collection: &RowId, values: ColumnValues) -> Result<u64, CursorError> {
        self.submit(vec![RowMutation::insert(collection.clone(), values)])
    }

    pub fn delete(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, RowMutation::delete)
    }

    pub fn archive(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::operation(id, operations::ARCHIVE))
    }

    pub fn mute(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::operation(id, operations::MUTE))
    }

    pub fn report_spam(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::operation(id, operations::REPORT_SPAM))
    }

    pub fn report_not_spam(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::operation(id, operations::REPORT_NOT_SPAM))
    }

    pub fn report_phishing(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::operation(id, operations::REPORT_PHISHING))
    }

    pub fn discard_drafts(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::operation(id, operations::DISCARD_DRAFTS))
    }

    pub fn mostly_archive(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, RowMutation::mostly_archive)
    }

    pub fn mostly_delete(&self, ids: &[RowId]) -> Result<u64, CursorError> {
        self.submit_each(ids, RowMutation::mostly_delete)
    }

    pub fn mostly_destructive_update(&self, ids: &[RowId], values: ColumnValues) -> Result<u64, CursorError> {
        self.submit_each(ids, |id| RowMutation::mostly_destructive_update(id, values.clone()))
    }

    /// Wait for every outstanding remote dispatch
    pub async fn flush_dispatches(&self) {
        self.sequencer.flush().await;
    }

    /// Current global sequence number
    pub fn sequence(&self) -> u64 {
        self.sequencer.sequence()
    }

    // --- Mostly-dead ---------------------------------------------------

    /// Provisionally remove a row: it stays visible until committed
    pub fn mark_mostly_dead(&self, id: &RowId) -> Result<(), CursorError> {
        self.check_open()?;
        let id = self.backing_id(id)?;
        self.mark_mostly_dead_local(&id)
    }

    /// Finalize a mostly-dead row: it now behaves as deleted and any held
    /// remote mutation is dispatched
    pub fn commit_mostly_dead(&self, id: &RowId) -> Result<bool, CursorError> {
        self.check_open()?;
        let id = self.backing_id(id)?;

        let (changed, remaining) = {
            let mut state = self.lock();
            let changed = state.overrides.set_mostly_dead(&id, false, Utc::now());
            (changed, state.overrides.mostly_dead_count())
        };
        if !changed {
            return Ok(false);
        }

        self.sequencer.commit_deferred(self, &id)?;
        self.delete_local(&id)?;
        LocalCache::recalibrate(self)?;

        if remaining == 0 {
            self.refresh.set_defer_sync(false);
        }
        self.notify_data_changed();
        Ok(true)
    }

    /// Restore a mostly-dead row to normal visibility without finalizing it
    pub fn clear_mostly_dead(&self, id: &RowId) -> Result<bool, CursorError> {
        self.check_open()?;
        let id = self.backing_id(id)?;

        let changed = self.clear_mostly_dead_local(&id)?;
        self.sequencer.discard_deferred(&id);
        if changed {
            self.notify_data_changed();
        }
        Ok(changed)
    }

    pub fn is_mostly_dead(&self, id: &RowId) -> Result<bool, CursorError> {
        let id = self.backing_id(id)?;
        Ok(self.lock().overrides.is_mostly_dead(&id))
    }

    pub fn mostly_dead_count(&self) -> usize {
        self.lock().overrides.mostly_dead_count()
    }

    // --- Undo ----------------------------------------------------------

    /// Reverse the most recent destructive batch
    ///
    /// Returns false once a newer batch has been submitted.
    pub fn undo(&self) -> Result<bool, CursorError> {
        self.check_open()?;
        self.sequencer.undo(self)
    }

    pub fn can_undo(&self) -> bool {
        self.sequencer.can_undo()
    }

    // --- Lifecycle -----------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop observing upstream changes and release the active snapshot
    ///
    /// Idempotent. Any later read or navigation fails with `DisabledCursor`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(watcher) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
        self.refresh.close();
        self.sequencer.reset();

        let mut state = self.lock();
        if let Some(snapshot) = state.snapshot.take() {
            snapshot.close();
        }
        state.overrides.clear();
        state.raw_position = -1;
        state.position = -1;
        info!("Cursor closed");
    }
}

impl Drop for CachingCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl LocalCache for CachingCursor {
    fn cache_values(&self, id: &RowId, values: ColumnValues) -> Result<(), CursorError> {
        self.check_owner_thread("cache_values");
        self.lock().overrides.put_values(id, values, Utc::now())
    }

    fn delete_local(&self, id: &RowId) -> Result<(), CursorError> {
        self.check_owner_thread("delete_local");
        let mut state = self.lock();
        let counted = state.snapshot.as_ref().map_or(false, |s| s.contains(id));
        if !counted {
            debug!("Deleting {} which the active snapshot does not contain", id);
        }
        state.overrides.set_deleted(id, true, counted, Utc::now());
        Ok(())
    }

    fn undelete_local(&self, id: &RowId) -> Result<(), CursorError> {
        self.check_owner_thread("undelete_local");
        self.lock().overrides.set_deleted(id, false, false, Utc::now());
        Ok(())
    }

    fn mark_mostly_dead_local(&self, id: &RowId) -> Result<(), CursorError> {
        self.check_owner_thread("mark_mostly_dead");
        self.lock().overrides.set_mostly_dead(id, true, Utc::now());
        self.refresh.set_defer_sync(true);
        Ok(())
    }

    fn clear_mostly_dead_local(&self, id: &RowId) -> Result<bool, CursorError> {
        self.check_owner_thread("clear_mostly_dead");
        let (changed, remaining) = {
            let mut state = self.lock();
            let changed = state.overrides.set_mostly_dead(id, false, Utc::now());
            (changed, state.overrides.mostly_dead_count())
        };
        if changed && remaining == 0 {
            self.refresh.set_defer_sync(false);
        }
        Ok(changed)
    }

    fn is_mostly_dead(&self, id: &RowId) -> bool {
        self.lock().overrides.is_mostly_dead(id)
    }

    fn recalibrate(&self) -> Result<(), CursorError> {
        let mut state = self.lock();
        if state.snapshot.is_none() {
            return Ok(());
        }
        state.recalibrate()
    }

    fn notify_data_changed(&self) {
        self.refresh.notify_data_changed();
    }
}
