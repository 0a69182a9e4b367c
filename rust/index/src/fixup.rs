//! Background maintenance of the partition tree.
//!
//! Foreground operations never restructure the tree. They queue a [`Fixup`]
//! when they notice a partition that is too large or too small, or a leaf
//! entry whose full vector is gone, and the fixup processor applies it later
//! in a transaction of its own.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{select, sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vecindex_error::VecIndexError;
use vecindex_tracing::util::{StopWatchUnit, Stopwatch};

use crate::{
    index::{IndexCore, VectorIndexError},
    kmeans::balanced_two_means,
    partition::Partition,
    store::{Store, StoreError, Txn},
    types::{ChildKey, Level, PartitionKey, PrimaryKey, VectorWithKey, INVALID_KEY, LEAF_LEVEL, ROOT_KEY},
};

/// Attempts in a row before a fixup that keeps hitting retryable errors, such
/// as transaction conflicts, goes to the back of the queue.
pub(crate) const MAX_FIXUP_ATTEMPTS: u32 = 3;

/// Delay before the first retry. Doubles with every further attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum FixupKind {
    Split,
    Merge,
    DeleteVector,
}

impl FixupKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            FixupKind::Split => "split",
            FixupKind::Merge => "merge",
            FixupKind::DeleteVector => "delete_vector",
        }
    }
}

/// A deferred change to the tree.
///
/// `parent_key` is a hint. [`INVALID_KEY`] or a parent that no longer holds
/// the partition makes the processor look the parent up from the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Fixup {
    Split {
        parent_key: PartitionKey,
        partition_key: PartitionKey,
        forced: bool,
    },
    Merge {
        parent_key: PartitionKey,
        partition_key: PartitionKey,
        forced: bool,
    },
    DeleteVector {
        partition_key: PartitionKey,
        primary_key: PrimaryKey,
    },
}

impl Fixup {
    pub(crate) fn split(parent_key: PartitionKey, partition_key: PartitionKey) -> Self {
        Fixup::Split {
            parent_key,
            partition_key,
            forced: false,
        }
    }

    pub(crate) fn merge(parent_key: PartitionKey, partition_key: PartitionKey) -> Self {
        Fixup::Merge {
            parent_key,
            partition_key,
            forced: false,
        }
    }

    pub(crate) fn delete_vector(partition_key: PartitionKey, primary_key: PrimaryKey) -> Self {
        Fixup::DeleteVector {
            partition_key,
            primary_key,
        }
    }

    /// Applies the fixup even if the partition's size no longer calls for it.
    pub(crate) fn forced(self) -> Self {
        match self {
            Fixup::Split {
                parent_key,
                partition_key,
                ..
            } => Fixup::Split {
                parent_key,
                partition_key,
                forced: true,
            },
            Fixup::Merge {
                parent_key,
                partition_key,
                ..
            } => Fixup::Merge {
                parent_key,
                partition_key,
                forced: true,
            },
            other => other,
        }
    }

    pub(crate) fn kind(&self) -> FixupKind {
        match self {
            Fixup::Split { .. } => FixupKind::Split,
            Fixup::Merge { .. } => FixupKind::Merge,
            Fixup::DeleteVector { .. } => FixupKind::DeleteVector,
        }
    }

    fn is_forced(&self) -> bool {
        matches!(
            self,
            Fixup::Split { forced: true, .. } | Fixup::Merge { forced: true, .. }
        )
    }

    fn key(&self) -> FixupKey {
        match self {
            Fixup::Split { partition_key, .. } | Fixup::Merge { partition_key, .. } => {
                FixupKey(self.kind(), *partition_key, None)
            }
            Fixup::DeleteVector {
                partition_key,
                primary_key,
            } => FixupKey(self.kind(), *partition_key, Some(primary_key.clone())),
        }
    }
}

/// Identity of a fixup for deduplication. Two fixups with the same key do the
/// same work, whatever parent hint they carry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FixupKey(FixupKind, PartitionKey, Option<PrimaryKey>);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FixupState {
    Pending,
    InProgress,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Fixup>,
    states: HashMap<FixupKey, FixupState>,
    in_progress: usize,
}

/// Deduplicating FIFO of fixups shared by the index and its workers.
#[derive(Default)]
pub(crate) struct FixupQueue {
    state: Mutex<QueueState>,
    // Signalled when there is work for the workers.
    wakeup: Notify,
    // Signalled whenever a fixup is queued or finishes.
    progress: Notify,
    suspended: AtomicBool,
}

impl FixupQueue {
    /// Queues `fixup` unless an equal fixup is already pending. A forced
    /// fixup upgrades a pending unforced one. A fixup that is in progress
    /// can be queued again, since it may have run against an older tree.
    pub(crate) fn enqueue(&self, fixup: Fixup) {
        {
            let mut state = self.state.lock();
            let key = fixup.key();
            if state.states.get(&key) == Some(&FixupState::Pending) {
                if fixup.is_forced() {
                    if let Some(queued) = state.pending.iter_mut().find(|f| f.key() == key) {
                        *queued = queued.clone().forced();
                    }
                }
                return;
            }
            state.states.insert(key, FixupState::Pending);
            state.pending.push_back(fixup);
        }
        if !self.is_suspended() {
            self.wakeup.notify_one();
        }
        self.progress.notify_waiters();
    }

    /// Takes the oldest pending fixup and marks it in progress.
    pub(crate) fn next(&self) -> Option<Fixup> {
        let mut state = self.state.lock();
        let fixup = state.pending.pop_front()?;
        state.states.insert(fixup.key(), FixupState::InProgress);
        state.in_progress += 1;
        Some(fixup)
    }

    pub(crate) fn finish(&self, fixup: &Fixup) {
        {
            let mut state = self.state.lock();
            let key = fixup.key();
            // The key was queued again while running, keep that entry.
            if state.states.get(&key) == Some(&FixupState::InProgress) {
                state.states.remove(&key);
            }
            state.in_progress -= 1;
        }
        self.progress.notify_waiters();
    }

    /// Puts a fixup interrupted by cancellation back at the head of the queue.
    pub(crate) fn requeue(&self, fixup: Fixup) {
        self.put_back(fixup, true);
    }

    /// Moves a fixup that keeps conflicting to the back of the queue, behind
    /// the work it was racing with.
    pub(crate) fn defer(&self, fixup: Fixup) {
        self.put_back(fixup, false);
    }

    fn put_back(&self, fixup: Fixup, front: bool) {
        {
            let mut state = self.state.lock();
            state.in_progress -= 1;
            let key = fixup.key();
            if state.states.get(&key) != Some(&FixupState::Pending) {
                state.states.insert(key, FixupState::Pending);
                if front {
                    state.pending.push_front(fixup);
                } else {
                    state.pending.push_back(fixup);
                }
            }
        }
        if !self.is_suspended() {
            self.wakeup.notify_one();
        }
        self.progress.notify_waiters();
    }

    pub(crate) fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        self.wakeup.notify_waiters();
        self.wakeup.notify_one();
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_progress == 0
    }
}

/// Background tasks draining the fixup queue.
pub(crate) struct FixupWorkers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl FixupWorkers {
    pub(crate) fn spawn<S: Store>(core: Arc<IndexCore<S>>, count: usize) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..count)
            .map(|worker| {
                let core = core.clone();
                let cancel = cancel.clone();
                tokio::spawn(
                    async move { core.run_worker(&cancel).await }
                        .instrument(tracing::info_span!("fixup_worker", worker)),
                )
            })
            .collect();
        FixupWorkers { cancel, handles }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Fixup worker failed: {}", e);
            }
        }
    }
}

/// What a fixup found when it looked at the tree.
#[derive(Debug)]
pub(crate) enum FixupOutcome {
    Applied(Vec<Fixup>),
    Skipped {
        reason: &'static str,
        followups: Vec<Fixup>,
    },
}

fn skipped(reason: &'static str) -> Result<FixupOutcome, VectorIndexError> {
    Ok(FixupOutcome::Skipped {
        reason,
        followups: Vec::new(),
    })
}

impl<S: Store> IndexCore<S> {
    async fn run_worker(&self, cancel: &CancellationToken) {
        tracing::debug!("Fixup worker started");
        loop {
            let wakeup = self.fixups.wakeup.notified();
            let mut wakeup = pin!(wakeup);
            wakeup.as_mut().enable();
            while !self.fixups.is_suspended() && !cancel.is_cancelled() {
                let Some(fixup) = self.fixups.next() else {
                    break;
                };
                self.run_fixup(fixup, cancel).await;
            }
            select! {
                _ = cancel.cancelled() => break,
                _ = wakeup => {}
            }
        }
        tracing::debug!("Fixup worker stopped");
    }

    /// Runs fixups on the calling task until the queue is empty and no worker
    /// is in the middle of one.
    pub(crate) async fn process_fixups(&self, cancel: &CancellationToken) {
        loop {
            while let Some(fixup) = self.fixups.next() {
                self.run_fixup(fixup, cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
            }
            let progress = self.fixups.progress.notified();
            let mut progress = pin!(progress);
            progress.as_mut().enable();
            if self.fixups.is_idle() {
                return;
            }
            if self.fixups.pending_count() > 0 {
                continue;
            }
            select! {
                _ = cancel.cancelled() => return,
                _ = progress => {}
            }
        }
    }

    /// Applies a fixup taken from the queue, retrying it with backoff on
    /// retryable errors. Follow-up fixups are queued only once the change has
    /// committed, and before the fixup is marked finished so the queue never
    /// looks idle in between.
    pub(crate) async fn run_fixup(&self, fixup: Fixup, cancel: &CancellationToken) {
        let attributes = [KeyValue::new("kind", fixup.kind().name())];
        let _stopwatch = Stopwatch::new(
            &self.metrics.fixup_latency,
            &attributes,
            StopWatchUnit::Millis,
        );

        let mut attempt = 1;
        let outcome = loop {
            if cancel.is_cancelled() {
                self.fixups.requeue(fixup);
                return;
            }
            match self.try_fixup(&fixup, cancel).await {
                Ok(outcome) => break Some(outcome),
                Err(VectorIndexError::Cancelled) => {
                    self.fixups.requeue(fixup);
                    return;
                }
                Err(e) if e.code().is_retryable() => {
                    self.counters.add_retried();
                    self.metrics.num_fixups_retried.add(1, &attributes);
                    if attempt >= MAX_FIXUP_ATTEMPTS {
                        tracing::debug!("Deferring {:?} after {} attempts: {}", fixup, attempt, e);
                        self.fixups.defer(fixup);
                        return;
                    }
                    tracing::debug!("Retrying {:?} after attempt {}: {}", fixup, attempt, e);
                    select! {
                        _ = cancel.cancelled() => {
                            self.fixups.requeue(fixup);
                            return;
                        }
                        _ = tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(attempt - 1)) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.should_trace_error() {
                        tracing::error!("Dropping {:?} after {} attempts: {}", fixup, attempt, e);
                    }
                    self.counters.add_dropped();
                    self.metrics.num_fixups_dropped.add(1, &attributes);
                    break None;
                }
            }
        };

        let followups = match outcome {
            Some(FixupOutcome::Applied(followups)) => {
                match fixup.kind() {
                    FixupKind::Split => {
                        self.counters.add_split();
                        self.metrics.num_splits.add(1, &[]);
                    }
                    FixupKind::Merge => {
                        self.counters.add_merge();
                        self.metrics.num_merges.add(1, &[]);
                    }
                    FixupKind::DeleteVector => {
                        self.counters.add_vector_delete();
                        self.metrics.num_vector_deletes.add(1, &[]);
                    }
                }
                followups
            }
            Some(FixupOutcome::Skipped { reason, followups }) => {
                tracing::debug!("Skipped {:?}: {}", fixup, reason);
                self.counters.add_skipped();
                followups
            }
            None => Vec::new(),
        };
        for followup in followups {
            self.fixups.enqueue(followup);
        }
        self.fixups.finish(&fixup);
    }

    /// Applies the fixup in a single transaction. Nothing is written unless the
    /// fixup applies in full.
    async fn try_fixup(
        &self,
        fixup: &Fixup,
        cancel: &CancellationToken,
    ) -> Result<FixupOutcome, VectorIndexError> {
        let txn = self.store.begin().await?;
        let result = match fixup {
            Fixup::Split {
                parent_key,
                partition_key,
                forced,
            } => {
                self.split_partition(&txn, *parent_key, *partition_key, *forced)
                    .await
            }
            Fixup::Merge {
                parent_key,
                partition_key,
                forced,
            } => {
                self.merge_partition(&txn, cancel, *parent_key, *partition_key, *forced)
                    .await
            }
            Fixup::DeleteVector {
                partition_key,
                primary_key,
            } => self.delete_vector(&txn, *partition_key, primary_key).await,
        };

        match result {
            Ok(outcome @ FixupOutcome::Applied(_)) => {
                self.store.commit(txn).await?;
                Ok(outcome)
            }
            Ok(outcome) => {
                self.store.abort(txn).await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(abort_err) = self.store.abort(txn).await {
                    tracing::warn!("Failed to abort fixup transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    async fn try_get_partition(
        &self,
        txn: &S::Txn,
        key: PartitionKey,
    ) -> Result<Option<Arc<Partition>>, VectorIndexError> {
        match txn.get_partition(key).await {
            Ok(partition) => Ok(Some(partition)),
            Err(StoreError::PartitionNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Walks the tree from the root to find the partition at `level + 1` that
    /// holds `key`.
    pub(crate) async fn find_parent(
        &self,
        txn: &S::Txn,
        key: PartitionKey,
        level: Level,
    ) -> Result<Option<(PartitionKey, Arc<Partition>)>, VectorIndexError> {
        let target = ChildKey::Partition(key);
        let mut queue = VecDeque::from([ROOT_KEY]);
        while let Some(current) = queue.pop_front() {
            let partition = txn.get_partition(current).await?;
            if partition.level() <= level {
                continue;
            }
            if partition.level() == level + 1 {
                if partition.find(&target).is_some() {
                    return Ok(Some((current, partition)));
                }
                continue;
            }
            queue.extend(partition.child_keys().iter().filter_map(ChildKey::partition_key));
        }
        Ok(None)
    }

    /// Checks the parent hint, falling back to a walk of the tree when it is
    /// missing or stale.
    async fn resolve_parent(
        &self,
        txn: &S::Txn,
        hint: PartitionKey,
        key: PartitionKey,
        level: Level,
    ) -> Result<Option<(PartitionKey, Arc<Partition>)>, VectorIndexError> {
        if hint != INVALID_KEY {
            if let Some(parent) = self.try_get_partition(txn, hint).await? {
                if parent.level() == level + 1 && parent.find(&ChildKey::Partition(key)).is_some() {
                    return Ok(Some((hint, parent)));
                }
            }
        }
        self.find_parent(txn, key, level).await
    }

    /// Loads the vectors of a partition's children in randomized space, along
    /// with their keys. Leaf entries whose full vector is gone are left out.
    async fn load_child_vectors(
        &self,
        txn: &S::Txn,
        partition: &Partition,
    ) -> Result<(Vec<ChildKey>, Vec<Vec<f32>>), VectorIndexError> {
        let mut refs: Vec<VectorWithKey> = partition
            .child_keys()
            .iter()
            .cloned()
            .map(VectorWithKey::new)
            .collect();
        txn.get_full_vectors(&mut refs).await?;

        let mut keys = Vec::with_capacity(refs.len());
        let mut vectors = Vec::with_capacity(refs.len());
        for VectorWithKey { key, vector } in refs {
            match (vector, partition.is_leaf()) {
                (Some(vector), true) => {
                    keys.push(key);
                    vectors.push(self.randomizer.randomize(&vector));
                }
                (Some(centroid), false) => {
                    keys.push(key);
                    vectors.push(centroid);
                }
                (None, true) => {
                    tracing::debug!("Dropping {} whose full vector is gone", key);
                }
                (None, false) => {
                    return Err(VectorIndexError::Internal(format!(
                        "child partition {} is missing",
                        key
                    )));
                }
            }
        }
        Ok((keys, vectors))
    }

    fn split_rng(&self, key: PartitionKey) -> StdRng {
        if self.options.is_deterministic {
            StdRng::seed_from_u64(self.seed ^ key.0.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        } else {
            StdRng::from_entropy()
        }
    }

    #[tracing::instrument(skip(self, txn))]
    async fn split_partition(
        &self,
        txn: &S::Txn,
        parent_key: PartitionKey,
        partition_key: PartitionKey,
        forced: bool,
    ) -> Result<FixupOutcome, VectorIndexError> {
        let Some(partition) = self.try_get_partition(txn, partition_key).await? else {
            return skipped("partition no longer exists");
        };
        let (min, max) = (
            self.options.min_partition_size,
            self.options.max_partition_size,
        );
        if !forced && partition.count() <= max {
            return skipped("partition is no longer oversized");
        }
        let level = partition.level();
        let parent_key = if partition_key == ROOT_KEY {
            INVALID_KEY
        } else {
            match self
                .resolve_parent(txn, parent_key, partition_key, level)
                .await?
            {
                Some((key, _)) => key,
                None => return skipped("partition is no longer in the tree"),
            }
        };

        let (child_keys, vectors) = self.load_child_vectors(txn, &partition).await?;
        if vectors.len() < 2 {
            return skipped("partition has too few vectors to split");
        }
        let split = balanced_two_means(&vectors, min, &mut self.split_rng(partition_key));
        let new_partition = |indices: &[usize], centroid: &[f32]| {
            let members: Vec<&[f32]> = indices.iter().map(|i| vectors[*i].as_slice()).collect();
            let keys = indices.iter().map(|i| child_keys[*i].clone()).collect();
            Partition::new(
                self.quantizer.quantize(centroid.to_vec(), &members),
                keys,
                level,
            )
        };
        let left = new_partition(&split.left, &split.left_centroid);
        let right = new_partition(&split.right, &split.right_centroid);
        let sizes = [left.count(), right.count()];
        let left_key = txn.insert_partition(left).await?;
        let right_key = txn.insert_partition(right).await?;

        let mut followups = Vec::new();
        let new_parent_key = if partition_key == ROOT_KEY {
            // The root keeps its key and grows the tree by a level.
            let root_set = self.root_quantizer.quantize(
                vec![0.0; self.dims],
                &[
                    split.left_centroid.as_slice(),
                    split.right_centroid.as_slice(),
                ],
            );
            let children = vec![ChildKey::Partition(left_key), ChildKey::Partition(right_key)];
            txn.set_root_partition(Partition::new(root_set, children, level + 1))
                .await?;
            ROOT_KEY
        } else {
            txn.remove_from_partition(parent_key, &ChildKey::Partition(partition_key))
                .await?;
            txn.add_to_partition(parent_key, &split.left_centroid, ChildKey::Partition(left_key))
                .await?;
            let parent_size = txn
                .add_to_partition(
                    parent_key,
                    &split.right_centroid,
                    ChildKey::Partition(right_key),
                )
                .await?;
            txn.delete_partition(partition_key).await?;
            if parent_size > max {
                followups.push(Fixup::split(INVALID_KEY, parent_key));
            }
            parent_key
        };

        for (key, size) in [left_key, right_key].into_iter().zip(sizes) {
            if size > max {
                followups.push(Fixup::split(new_parent_key, key));
            } else if size < min {
                followups.push(Fixup::merge(new_parent_key, key));
            }
        }
        tracing::debug!(
            "Split partition {} into {} ({} children) and {} ({} children)",
            partition_key,
            left_key,
            sizes[0],
            right_key,
            sizes[1]
        );
        Ok(FixupOutcome::Applied(followups))
    }

    #[tracing::instrument(skip(self, txn, cancel))]
    async fn merge_partition(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        parent_key: PartitionKey,
        partition_key: PartitionKey,
        forced: bool,
    ) -> Result<FixupOutcome, VectorIndexError> {
        if partition_key == ROOT_KEY {
            return skipped("the root partition is never merged");
        }
        let Some(partition) = self.try_get_partition(txn, partition_key).await? else {
            return skipped("partition no longer exists");
        };
        let (min, max) = (
            self.options.min_partition_size,
            self.options.max_partition_size,
        );
        if !forced && partition.count() >= min {
            return skipped("partition is no longer undersized");
        }
        let level = partition.level();
        let Some((parent_key, parent)) = self
            .resolve_parent(txn, parent_key, partition_key, level)
            .await?
        else {
            return skipped("partition is no longer in the tree");
        };
        let (child_keys, vectors) = self.load_child_vectors(txn, &partition).await?;

        if parent.count() == 1 {
            if parent_key != ROOT_KEY {
                // Nowhere to move the children. Merge the parent first, which
                // gives this partition siblings or makes the root its parent.
                return Ok(FixupOutcome::Skipped {
                    reason: "partition has no siblings",
                    followups: vec![
                        Fixup::merge(INVALID_KEY, parent_key).forced(),
                        Fixup::Merge {
                            parent_key: INVALID_KEY,
                            partition_key,
                            forced,
                        },
                    ],
                });
            }
            return self
                .absorb_into_root(txn, partition_key, level, child_keys, vectors)
                .await;
        }

        let parent_size = txn
            .remove_from_partition(parent_key, &ChildKey::Partition(partition_key))
            .await?
            .ok_or_else(|| {
                VectorIndexError::Internal(format!(
                    "partition {} vanished from parent {}",
                    partition_key, parent_key
                ))
            })?;
        txn.delete_partition(partition_key).await?;

        let moved = child_keys.len();
        let mut targets: BTreeMap<PartitionKey, (PartitionKey, usize)> = BTreeMap::new();
        for (child_key, vector) in child_keys.into_iter().zip(vectors) {
            let target = self
                .find_partition_at_level(txn, cancel, &vector, level)
                .await?;
            let target_key = target.child_key.partition_key().ok_or_else(|| {
                VectorIndexError::Internal("merge search returned a primary key".to_string())
            })?;
            let size = txn.add_to_partition(target_key, &vector, child_key).await?;
            targets.insert(target_key, (target.parent_partition_key, size));
        }

        let mut followups = Vec::new();
        if parent_key == ROOT_KEY {
            if parent_size == 1 {
                let remaining = parent
                    .child_keys()
                    .iter()
                    .filter_map(ChildKey::partition_key)
                    .find(|key| *key != partition_key);
                if let Some(remaining) = remaining {
                    followups.push(Fixup::merge(ROOT_KEY, remaining).forced());
                }
            }
        } else if parent_size < min {
            followups.push(Fixup::merge(INVALID_KEY, parent_key));
        }
        followups.extend(
            targets
                .into_iter()
                .filter(|(_, (_, size))| *size > max)
                .map(|(key, (parent, _))| Fixup::split(parent, key)),
        );
        tracing::debug!(
            "Merged partition {} into its neighbors, moving {} children",
            partition_key,
            moved
        );
        Ok(FixupOutcome::Applied(followups))
    }

    /// Replaces the root with the contents of its only child.
    async fn absorb_into_root(
        &self,
        txn: &S::Txn,
        partition_key: PartitionKey,
        level: Level,
        child_keys: Vec<ChildKey>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<FixupOutcome, VectorIndexError> {
        let count = child_keys.len();
        let single_child = match child_keys.as_slice() {
            [ChildKey::Partition(key)] if level > LEAF_LEVEL => Some(*key),
            _ => None,
        };
        let root_set = self.root_quantizer.quantize(vec![0.0; self.dims], &vectors);
        txn.set_root_partition(Partition::new(root_set, child_keys, level))
            .await?;
        txn.delete_partition(partition_key).await?;

        let mut followups = Vec::new();
        if let Some(child) = single_child {
            followups.push(Fixup::merge(ROOT_KEY, child).forced());
        }
        if count > self.options.max_partition_size {
            followups.push(Fixup::split(INVALID_KEY, ROOT_KEY));
        }
        tracing::debug!(
            "Root absorbed partition {} and is now at level {}",
            partition_key,
            level
        );
        Ok(FixupOutcome::Applied(followups))
    }

    #[tracing::instrument(skip(self, txn, primary_key), fields(primary_key = %primary_key))]
    async fn delete_vector(
        &self,
        txn: &S::Txn,
        partition_key: PartitionKey,
        primary_key: &PrimaryKey,
    ) -> Result<FixupOutcome, VectorIndexError> {
        let child_key = ChildKey::Primary(primary_key.clone());
        let mut refs = [VectorWithKey::new(child_key.clone())];
        txn.get_full_vectors(&mut refs).await?;
        if refs[0].vector.is_some() {
            return skipped("full vector exists again");
        }

        let size = match txn.remove_from_partition(partition_key, &child_key).await {
            Ok(Some(size)) => size,
            Ok(None) => return skipped("vector is no longer in the partition"),
            Err(StoreError::PartitionNotFound(_)) => return skipped("partition no longer exists"),
            Err(e) => return Err(e.into()),
        };
        let mut followups = Vec::new();
        if partition_key != ROOT_KEY && size < self.options.min_partition_size {
            followups.push(Fixup::merge(INVALID_KEY, partition_key));
        }
        Ok(FixupOutcome::Applied(followups))
    }
}
