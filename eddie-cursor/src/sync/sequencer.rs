//! Operation sequencing
//!
//! Stamps each batch of row mutations with a sequence number, applies the
//! local effect synchronously through a [`LocalCache`] and forwards the
//! remote effect asynchronously, one unit of work per backing authority.
//!
//! Each authority has its own lane: a channel drained by one worker task, so
//! work for one authority is applied in submission order while a slow
//! authority never holds up the others.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::CursorConfig;
use crate::cursor::uri;
use crate::sync::backend::{MutationBackend, RemoteOperation};
use crate::sync::undo::UndoTracker;
use crate::types::error::CursorError;
use crate::types::{operations, ColumnValue, ColumnValues, RowId, DELETED_COLUMN, MOSTLY_DEAD_COLUMN, OPERATION_COLUMN};

/// Kinds of row mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    /// Archive once the mostly-dead state is committed
    MostlyArchive,
    /// Delete once the mostly-dead state is committed
    MostlyDelete,
    /// Update (and remove locally) once the mostly-dead state is committed
    MostlyDestructiveUpdate,
}

impl MutationKind {
    pub fn is_mostly(&self) -> bool {
        matches!(
            self,
            Self::MostlyArchive | Self::MostlyDelete | Self::MostlyDestructiveUpdate
        )
    }
}

/// One requested change to a row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMutation {
    pub kind: MutationKind,
    /// Target row, or the target collection for inserts
    pub id: RowId,
    pub values: ColumnValues,
    /// Treat an update as a delete locally while forwarding it as an update
    pub remove_locally: bool,
}

impl RowMutation {
    fn new(kind: MutationKind, id: RowId, values: ColumnValues) -> Self {
        Self {
            kind,
            id,
            values,
            remove_locally: false,
        }
    }

    pub fn insert(collection: RowId, values: ColumnValues) -> Self {
        Self::new(MutationKind::Insert, collection, values)
    }

    pub fn update(id: RowId, values: ColumnValues) -> Self {
        Self::new(MutationKind::Update, id, values)
    }

    /// Update forwarded remotely but removing the row from the local view
    pub fn update_removing(id: RowId, values: ColumnValues) -> Self {
        Self {
            remove_locally: true,
            ..Self::new(MutationKind::Update, id, values)
        }
    }

    /// Named operation (archive, mute, ...) that removes the row locally
    pub fn operation(id: RowId, operation: &str) -> Self {
        Self::update_removing(id, operation_values(operation))
    }

    pub fn delete(id: RowId) -> Self {
        Self::new(MutationKind::Delete, id, ColumnValues::new())
    }

    pub fn mostly_archive(id: RowId) -> Self {
        Self::new(MutationKind::MostlyArchive, id, ColumnValues::new())
    }

    pub fn mostly_delete(id: RowId) -> Self {
        Self::new(MutationKind::MostlyDelete, id, ColumnValues::new())
    }

    pub fn mostly_destructive_update(id: RowId, values: ColumnValues) -> Self {
        Self::new(MutationKind::MostlyDestructiveUpdate, id, values)
    }

    /// Whether applying this mutation can change which rows are visible
    pub fn recalibrate_required(&self) -> bool {
        !(self.kind == MutationKind::Update && !self.remove_locally)
    }
}

fn operation_values(operation: &str) -> ColumnValues {
    let mut values = ColumnValues::new();
    values.insert(OPERATION_COLUMN.to_string(), ColumnValue::Text(operation.to_string()));
    values
}

/// Values that may be written into the local override store
fn local_values(values: &ColumnValues) -> ColumnValues {
    values
        .iter()
        .filter(|(column, _)| column.as_str() != OPERATION_COLUMN)
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

/// Local side of the cursor, as seen by the sequencer
///
/// The sequencer only ever borrows this; it never owns the cursor.
pub trait LocalCache {
    fn cache_values(&self, id: &RowId, values: ColumnValues) -> Result<(), CursorError>;
    fn delete_local(&self, id: &RowId) -> Result<(), CursorError>;
    fn undelete_local(&self, id: &RowId) -> Result<(), CursorError>;
    fn mark_mostly_dead_local(&self, id: &RowId) -> Result<(), CursorError>;
    fn clear_mostly_dead_local(&self, id: &RowId) -> Result<bool, CursorError>;
    fn is_mostly_dead(&self, id: &RowId) -> bool;
    fn recalibrate(&self) -> Result<(), CursorError>;
    fn notify_data_changed(&self);
}

/// Remote mutation held back until a mostly-dead row is committed
#[derive(Debug, Clone)]
struct DeferredMutation {
    sequence: u64,
    authority: String,
    /// Column values applied locally on commit
    local: ColumnValues,
    remote: RemoteOperation,
}

/// One unit of work queued on an authority's lane
enum LaneWork {
    Apply(Vec<RemoteOperation>),
    Undo(Vec<RowId>),
    /// Answered once everything queued before it has run
    Flush(flume::Sender<()>),
}

async fn run_lane(backend: Arc<dyn MutationBackend>, authority: String, work: flume::Receiver<LaneWork>) {
    while let Ok(item) = work.recv_async().await {
        match item {
            LaneWork::Apply(operations) => {
                let count = operations.len();
                match backend.apply(&authority, operations).await {
                    Ok(()) => debug!("Applied {} operations on {}", count, authority),
                    Err(e) => warn!("Failed to apply {} operations on {}: {}", count, authority, e),
                }
            }
            LaneWork::Undo(rows) => {
                if let Err(e) = backend.undo(&authority, rows).await {
                    warn!("Failed to undo on {}: {}", authority, e);
                }
            }
            LaneWork::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Dispatch lane for {} closed", authority);
}

struct ResolvedMutation {
    mutation: RowMutation,
    original: RowId,
    authority: String,
}

pub struct OperationSequencer {
    sequence: AtomicU64,
    backend: Arc<dyn MutationBackend>,
    config: CursorConfig,
    runtime: Handle,
    undo: Mutex<UndoTracker>,
    deferred: Mutex<HashMap<RowId, DeferredMutation>>,
    lanes: Mutex<HashMap<String, flume::Sender<LaneWork>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl OperationSequencer {
    pub fn new(backend: Arc<dyn MutationBackend>, config: CursorConfig, runtime: Handle) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            backend,
            config,
            runtime,
            undo: Mutex::new(UndoTracker::new()),
            deferred: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Current global sequence (0 before the first batch)
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn can_undo(&self) -> bool {
        lock(&self.undo).can_undo(self.sequence())
    }

    pub fn deferred_count(&self) -> usize {
        lock(&self.deferred).len()
    }

    /// Check a mutation and resolve its backing identifier and authority
    fn resolve(&self, mutation: RowMutation) -> Result<ResolvedMutation, CursorError> {
        for column in mutation.values.keys() {
            if column == DELETED_COLUMN || column == MOSTLY_DEAD_COLUMN || *column == self.config.uri_column {
                return Err(CursorError::InvalidInput(format!(
                    "Column '{}' is reserved and cannot be written",
                    column
                )));
            }
        }

        let original = uri::unforward(&mutation.id, &self.config.local_authority)?;
        let authority = uri::authority_of(&original, &self.config.local_authority)?;

        Ok(ResolvedMutation {
            mutation,
            original,
            authority,
        })
    }

    /// Apply a batch locally and forward it to its authorities
    ///
    /// Every mutation is validated before anything is written, so an invalid
    /// batch leaves local state and the sequence untouched. Returns the
    /// sequence number assigned to the batch.
    pub fn submit(&self, cache: &dyn LocalCache, batch: Vec<RowMutation>) -> Result<u64, CursorError> {
        if batch.is_empty() {
            return Ok(self.sequence());
        }

        let resolved = batch
            .into_iter()
            .map(|m| self.resolve(m))
            .collect::<Result<Vec<_>, _>>()?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut groups: BTreeMap<String, Vec<RemoteOperation>> = BTreeMap::new();
        let mut recalibrate = false;

        for ResolvedMutation {
            mutation,
            original,
            authority,
        } in resolved
        {
            recalibrate |= mutation.recalibrate_required();

            match mutation.kind {
                MutationKind::Insert => {
                    groups.entry(authority).or_default().push(RemoteOperation::Insert {
                        collection: original,
                        values: mutation.values,
                    });
                }
                MutationKind::Update if mutation.remove_locally => {
                    cache.delete_local(&original)?;
                    lock(&self.undo).record(sequence, original.clone());
                    groups.entry(authority).or_default().push(RemoteOperation::Update {
                        id: original,
                        values: mutation.values,
                    });
                }
                MutationKind::Update => {
                    cache.cache_values(&original, local_values(&mutation.values))?;
                    groups.entry(authority).or_default().push(RemoteOperation::Update {
                        id: original,
                        values: mutation.values,
                    });
                }
                MutationKind::Delete => {
                    cache.delete_local(&original)?;
                    lock(&self.undo).record(sequence, original.clone());
                    groups
                        .entry(authority)
                        .or_default()
                        .push(RemoteOperation::Delete { id: original });
                }
                MutationKind::MostlyArchive
                | MutationKind::MostlyDelete
                | MutationKind::MostlyDestructiveUpdate => {
                    let (local, remote) = match mutation.kind {
                        MutationKind::MostlyArchive => (
                            ColumnValues::new(),
                            RemoteOperation::Update {
                                id: original.clone(),
                                values: operation_values(operations::ARCHIVE),
                            },
                        ),
                        MutationKind::MostlyDelete => (
                            ColumnValues::new(),
                            RemoteOperation::Delete {
                                id: original.clone(),
                            },
                        ),
                        _ => (
                            local_values(&mutation.values),
                            RemoteOperation::Update {
                                id: original.clone(),
                                values: mutation.values,
                            },
                        ),
                    };

                    cache.mark_mostly_dead_local(&original)?;
                    lock(&self.undo).record(sequence, original.clone());
                    lock(&self.deferred).insert(
                        original,
                        DeferredMutation {
                            sequence,
                            authority,
                            local,
                            remote,
                        },
                    );
                }
            }
        }

        if recalibrate {
            cache.recalibrate()?;
        }
        cache.notify_data_changed();

        for (authority, operations) in groups {
            self.dispatch(authority, operations);
        }

        debug!("Submitted batch #{}", sequence);
        Ok(sequence)
    }

    /// Release the remote mutation held for a committed mostly-dead row
    ///
    /// Applies any destructive column values locally first. Returns false
    /// when nothing was held for the row.
    pub fn commit_deferred(&self, cache: &dyn LocalCache, id: &RowId) -> Result<bool, CursorError> {
        let Some(deferred) = lock(&self.deferred).remove(id) else {
            return Ok(false);
        };

        debug!(
            "Committing deferred {} for {} from batch #{}",
            deferred.remote.type_str(),
            id,
            deferred.sequence
        );
        if !deferred.local.is_empty() {
            cache.cache_values(id, deferred.local)?;
        }
        self.dispatch(deferred.authority, vec![deferred.remote]);
        Ok(true)
    }

    /// Drop the remote mutation held for a mostly-dead row
    pub fn discard_deferred(&self, id: &RowId) -> bool {
        lock(&self.deferred).remove(id).is_some()
    }

    /// Reverse the most recent destructive batch
    ///
    /// A no-op returning false once any newer batch has been submitted.
    pub fn undo(&self, cache: &dyn LocalCache) -> Result<bool, CursorError> {
        let Some(rows) = lock(&self.undo).take(self.sequence()) else {
            return Ok(false);
        };

        info!("Undoing {} rows", rows.len());
        let mut remote: BTreeMap<String, Vec<RowId>> = BTreeMap::new();
        for id in rows {
            if cache.is_mostly_dead(&id) {
                // Never left: nothing was forwarded
                cache.clear_mostly_dead_local(&id)?;
                self.discard_deferred(&id);
                continue;
            }

            cache.undelete_local(&id)?;
            match uri::authority_of(&id, &self.config.local_authority) {
                Ok(authority) => remote.entry(authority).or_default().push(id),
                Err(e) => warn!("Cannot route undo for {}: {}", id, e),
            }
        }

        cache.recalibrate()?;
        cache.notify_data_changed();

        for (authority, rows) in remote {
            self.enqueue(authority, LaneWork::Undo(rows));
        }

        Ok(true)
    }

    fn dispatch(&self, authority: String, operations: Vec<RemoteOperation>) {
        self.enqueue(authority, LaneWork::Apply(operations));
    }

    /// Queue work on the authority's lane, starting its worker on first use
    fn enqueue(&self, authority: String, work: LaneWork) {
        let mut lanes = lock(&self.lanes);
        let lane = lanes.entry(authority.clone()).or_insert_with(|| {
            let (tx, rx) = flume::unbounded();
            debug!("Opening dispatch lane for {}", authority);
            self.runtime
                .spawn(run_lane(self.backend.clone(), authority.clone(), rx));
            tx
        });

        if let Err(flume::SendError(work)) = lane.send(work) {
            // The worker is gone; replace the lane and retry once
            warn!("Dispatch lane for {} was closed, reopening", authority);
            let (tx, rx) = flume::unbounded();
            self.runtime
                .spawn(run_lane(self.backend.clone(), authority.clone(), rx));
            let _ = tx.send(work);
            lanes.insert(authority, tx);
        }
    }

    /// Wait until every lane has drained the work queued so far
    pub async fn flush(&self) {
        let waits: Vec<flume::Receiver<()>> = lock(&self.lanes)
            .values()
            .filter_map(|lane| {
                let (done, wait) = flume::bounded(1);
                lane.send(LaneWork::Flush(done)).ok().map(|_| wait)
            })
            .collect();

        for result in futures::future::join_all(waits.iter().map(|w| w.recv_async())).await {
            if result.is_err() {
                warn!("Dispatch lane stopped before flushing");
            }
        }
    }

    /// Forget deferred mutations and undo state
    pub fn reset(&self) {
        lock(&self.deferred).clear();
        lock(&self.undo).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flume::Receiver;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingCache {
        calls: Mutex<Vec<String>>,
        mostly_dead: Mutex<HashSet<RowId>>,
    }

    impl RecordingCache {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LocalCache for RecordingCache {
        fn cache_values(&self, id: &RowId, values: ColumnValues) -> Result<(), CursorError> {
            let columns: Vec<&String> = values.keys().collect();
            self.record(format!("cache {} {:?}", id, columns));
            Ok(())
        }

        fn delete_local(&self, id: &RowId) -> Result<(), CursorError> {
            self.record(format!("delete {}", id));
            Ok(())
        }

        fn undelete_local(&self, id: &RowId) -> Result<(), CursorError> {
            self.record(format!("undelete {}", id));
            Ok(())
        }

        fn mark_mostly_dead_local(&self, id: &RowId) -> Result<(), CursorError> {
            self.mostly_dead.lock().unwrap().insert(id.clone());
            self.record(format!("mostly_dead {}", id));
            Ok(())
        }

        fn clear_mostly_dead_local(&self, id: &RowId) -> Result<bool, CursorError> {
            self.record(format!("clear_mostly_dead {}", id));
            Ok(self.mostly_dead.lock().unwrap().remove(id))
        }

        fn is_mostly_dead(&self, id: &RowId) -> bool {
            self.mostly_dead.lock().unwrap().contains(id)
        }

        fn recalibrate(&self) -> Result<(), CursorError> {
            self.record("recalibrate".to_string());
            Ok(())
        }

        fn notify_data_changed(&self) {
            self.record("changed".to_string());
        }
    }

    /// Backend recording every call; the "broken" authority always fails
    struct RecordingBackend {
        tx: flume::Sender<(String, Vec<RemoteOperation>)>,
        undo_tx: flume::Sender<(String, Vec<RowId>)>,
    }

    #[async_trait]
    impl MutationBackend for RecordingBackend {
        async fn apply(&self, authority: &str, operations: Vec<RemoteOperation>) -> Result<(), CursorError> {
            self.tx.send((authority.to_string(), operations)).ok();
            if authority == "broken.provider" {
                return Err(CursorError::Backend("unreachable".into()));
            }
            Ok(())
        }

        async fn undo(&self, authority: &str, rows: Vec<RowId>) -> Result<(), CursorError> {
            self.undo_tx.send((authority.to_string(), rows)).ok();
            Ok(())
        }
    }

    type Applied = Receiver<(String, Vec<RemoteOperation>)>;
    type Undone = Receiver<(String, Vec<RowId>)>;

    fn setup() -> (OperationSequencer, Applied, Undone) {
        let (tx, rx) = flume::unbounded();
        let (undo_tx, undo_rx) = flume::unbounded();
        let sequencer = OperationSequencer::new(
            Arc::new(RecordingBackend { tx, undo_tx }),
            CursorConfig::default(),
            Handle::current(),
        );
        (sequencer, rx, undo_rx)
    }

    fn id(authority: &str, n: u32) -> RowId {
        RowId::new(format!("content://{}/conversation/{}", authority, n))
    }

    fn starred() -> ColumnValues {
        let mut values = ColumnValues::new();
        values.insert("starred".to_string(), ColumnValue::Bool(true));
        values
    }

    #[tokio::test]
    async fn test_one_sequence_per_batch_grouped_by_authority() {
        let (sequencer, applied, _) = setup();
        let cache = RecordingCache::default();

        let seq = sequencer
            .submit(
                &cache,
                vec![
                    RowMutation::delete(id("mail.provider", 1)),
                    RowMutation::update(id("work.provider", 2), starred()),
                    RowMutation::delete(id("mail.provider", 3)),
                ],
            )
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(sequencer.sequence(), 1);

        sequencer.flush().await;
        let mut calls: Vec<(String, Vec<RemoteOperation>)> = applied.drain().collect();
        calls.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "mail.provider");
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(calls[1].0, "work.provider");
        assert_eq!(
            calls[1].1,
            vec![RemoteOperation::Update {
                id: id("work.provider", 2),
                values: starred()
            }]
        );

        let local = cache.calls();
        assert_eq!(local.last().map(String::as_str), Some("changed"));
        assert!(local.contains(&"recalibrate".to_string()));
    }

    #[tokio::test]
    async fn test_plain_update_skips_recalibrate() {
        let (sequencer, _, _) = setup();
        let cache = RecordingCache::default();

        sequencer
            .submit(&cache, vec![RowMutation::update(id("mail.provider", 1), starred())])
            .unwrap();

        assert_eq!(
            cache.calls(),
            vec![
                "cache content://mail.provider/conversation/1 [\"starred\"]".to_string(),
                "changed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_batch_writes_nothing() {
        let (sequencer, applied, _) = setup();
        let cache = RecordingCache::default();

        let mut values = starred();
        values.insert(DELETED_COLUMN.to_string(), ColumnValue::Bool(true));
        let result = sequencer.submit(
            &cache,
            vec![
                RowMutation::delete(id("mail.provider", 1)),
                RowMutation::update(id("mail.provider", 2), values),
            ],
        );

        assert!(matches!(result, Err(CursorError::InvalidInput(_))));
        assert_eq!(sequencer.sequence(), 0);
        assert!(cache.calls().is_empty());

        let result = sequencer.submit(&cache, vec![RowMutation::delete(RowId::from("nonsense"))]);
        assert!(matches!(result, Err(CursorError::InvalidUri(_))));

        sequencer.flush().await;
        assert!(applied.is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_ids_are_unforwarded() {
        let (sequencer, applied, _) = setup();
        let cache = RecordingCache::default();
        let original = id("mail.provider", 9);
        let forwarded = uri::forward(&original, "eddie.cursor.provider").unwrap();

        sequencer
            .submit(&cache, vec![RowMutation::operation(forwarded, operations::MUTE)])
            .unwrap();
        sequencer.flush().await;

        let (authority, ops) = applied.try_recv().unwrap();
        assert_eq!(authority, "mail.provider");
        assert_eq!(ops[0].target(), &original);
        assert_eq!(cache.calls()[0], format!("delete {}", original));
    }

    #[tokio::test]
    async fn test_failing_authority_does_not_block_others() {
        let (sequencer, applied, _) = setup();
        let cache = RecordingCache::default();

        sequencer
            .submit(
                &cache,
                vec![
                    RowMutation::delete(id("broken.provider", 1)),
                    RowMutation::delete(id("mail.provider", 2)),
                ],
            )
            .unwrap();
        sequencer.flush().await;

        let authorities: HashSet<String> = applied.drain().map(|(a, _)| a).collect();
        assert!(authorities.contains("broken.provider"));
        assert!(authorities.contains("mail.provider"));
        // Local state is not rolled back
        assert!(cache.calls().contains(&format!("delete {}", id("broken.provider", 1))));
    }

    #[tokio::test]
    async fn test_mostly_dead_dispatch_deferred_until_commit() {
        let (sequencer, applied, _) = setup();
        let cache = RecordingCache::default();
        let row = id("mail.provider", 4);

        sequencer
            .submit(&cache, vec![RowMutation::mostly_archive(row.clone())])
            .unwrap();
        sequencer.flush().await;
        assert!(applied.is_empty());
        assert_eq!(sequencer.deferred_count(), 1);

        assert!(sequencer.commit_deferred(&cache, &row).unwrap());
        assert!(!sequencer.commit_deferred(&cache, &row).unwrap());
        sequencer.flush().await;

        let (authority, ops) = applied.try_recv().unwrap();
        assert_eq!(authority, "mail.provider");
        assert_eq!(
            ops,
            vec![RemoteOperation::Update {
                id: row,
                values: operation_values(operations::ARCHIVE)
            }]
        );
    }

    #[tokio::test]
    async fn test_undo_latest_batch() {
        let (sequencer, _, undone) = setup();
        let cache = RecordingCache::default();
        let first = id("mail.provider", 1);
        let second = id("mail.provider", 2);

        sequencer.submit(&cache, vec![RowMutation::delete(first.clone())]).unwrap();
        sequencer.submit(&cache, vec![RowMutation::delete(second.clone())]).unwrap();

        assert!(sequencer.can_undo());
        assert!(sequencer.undo(&cache).unwrap());
        assert!(!sequencer.undo(&cache).unwrap());
        sequencer.flush().await;

        let calls = cache.calls();
        assert!(calls.contains(&format!("undelete {}", second)));
        assert!(!calls.contains(&format!("undelete {}", first)));
        assert_eq!(undone.try_recv().unwrap(), ("mail.provider".to_string(), vec![second]));
    }

    #[tokio::test]
    async fn test_undo_window_closed_by_update() {
        let (sequencer, _, _) = setup();
        let cache = RecordingCache::default();

        sequencer
            .submit(&cache, vec![RowMutation::delete(id("mail.provider", 1))])
            .unwrap();
        sequencer
            .submit(&cache, vec![RowMutation::update(id("mail.provider", 2), starred())])
            .unwrap();

        assert!(!sequencer.can_undo());
        assert!(!sequencer.undo(&cache).unwrap());
    }

    #[tokio::test]
    async fn test_undo_of_mostly_dead_discards_remote() {
        let (sequencer, applied, undone) = setup();
        let cache = RecordingCache::default();
        let row = id("mail.provider", 5);

        sequencer.submit(&cache, vec![RowMutation::mostly_delete(row.clone())]).unwrap();
        assert!(sequencer.undo(&cache).unwrap());
        sequencer.flush().await;

        assert_eq!(sequencer.deferred_count(), 0);
        assert!(cache.calls().contains(&format!("clear_mostly_dead {}", row)));
        assert!(applied.is_empty());
        assert!(undone.is_empty());
    }

    /// Backend whose first call on an authority is slow
    #[derive(Default)]
    struct SlowFirstBackend {
        log: Mutex<Vec<String>>,
    }

    impl SlowFirstBackend {
        async fn record(&self, entry: String) {
            let first = self.log.lock().unwrap().is_empty();
            if first {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            }
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl MutationBackend for SlowFirstBackend {
        async fn apply(&self, _authority: &str, operations: Vec<RemoteOperation>) -> Result<(), CursorError> {
            let entry = operations
                .iter()
                .map(|op| format!("{} {}", op.type_str(), op.target()))
                .collect::<Vec<_>>()
                .join(",");
            self.record(entry).await;
            Ok(())
        }

        async fn undo(&self, _authority: &str, rows: Vec<RowId>) -> Result<(), CursorError> {
            self.record(format!("undo {}", rows.len())).await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_same_authority_work_keeps_submission_order() {
        let backend = Arc::new(SlowFirstBackend::default());
        let sequencer = OperationSequencer::new(backend.clone(), CursorConfig::default(), Handle::current());
        let cache = RecordingCache::default();
        let row = id("mail.provider", 1);

        sequencer.submit(&cache, vec![RowMutation::delete(row.clone())]).unwrap();
        assert!(sequencer.undo(&cache).unwrap());
        sequencer.submit(&cache, vec![RowMutation::update(row.clone(), starred())]).unwrap();
        sequencer.flush().await;

        let log = backend.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![format!("delete {}", row), "undo 1".to_string(), format!("update {}", row)]
        );
    }

    #[tokio::test]
    async fn test_flush_without_lanes_returns() {
        let (sequencer, applied, _) = setup();
        sequencer.flush().await;
        assert!(applied.is_empty());
    }

    #[test]
    fn test_recalibrate_required() {
        let row = id("mail.provider", 1);
        assert!(!RowMutation::update(row.clone(), starred()).recalibrate_required());
        assert!(RowMutation::update_removing(row.clone(), starred()).recalibrate_required());
        assert!(RowMutation::delete(row.clone()).recalibrate_required());
        assert!(RowMutation::mostly_delete(row).recalibrate_required());
    }
}
