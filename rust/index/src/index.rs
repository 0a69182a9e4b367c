use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use validator::Validate;
use vecindex_error::{ErrorCodes, OptionsValidationError, VecIndexError};

use crate::{
    config::VectorIndexOptions,
    fixup::{Fixup, FixupQueue, FixupWorkers},
    metrics::{FixupCounters, FixupStats, IndexMetrics},
    partition::Partition,
    quantization::Quantizer,
    randomize::RandomOrthoTransformer,
    search_set::{SearchResult, SearchSet},
    store::{Store, StoreError, Txn},
    types::{ChildKey, PartitionKey, PrimaryKey, INVALID_KEY, LEAF_LEVEL, ROOT_KEY},
};

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Operation cancelled")]
    Cancelled,
    #[error(transparent)]
    InvalidOptions(#[from] OptionsValidationError),
    #[error("Expected a vector with {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VecIndexError for VectorIndexError {
    fn code(&self) -> ErrorCodes {
        match self {
            VectorIndexError::Store(err) => err.code(),
            VectorIndexError::Cancelled => ErrorCodes::Cancelled,
            VectorIndexError::InvalidOptions(err) => err.code(),
            VectorIndexError::DimensionMismatch { .. } => ErrorCodes::InvalidArgument,
            VectorIndexError::Internal(_) => ErrorCodes::Internal,
        }
    }

    fn should_trace_error(&self) -> bool {
        !matches!(self, VectorIndexError::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The key was not found in any leaf reachable by the search.
    NotFound,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Overrides the index's base beam size when non-zero.
    pub base_beam_size: usize,
    /// Return quantized estimates without fetching full vectors.
    pub skip_rerank: bool,
}

/// State shared by foreground operations and fixup workers.
pub(crate) struct IndexCore<S: Store> {
    pub(crate) store: Arc<S>,
    pub(crate) options: VectorIndexOptions,
    pub(crate) seed: u64,
    pub(crate) dims: usize,
    pub(crate) root_quantizer: Quantizer,
    pub(crate) quantizer: Quantizer,
    pub(crate) randomizer: RandomOrthoTransformer,
    pub(crate) fixups: FixupQueue,
    pub(crate) metrics: IndexMetrics,
    pub(crate) counters: FixupCounters,
}

impl<S: Store> IndexCore<S> {
    pub(crate) fn check_dims(&self, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.dims {
            return Err(VectorIndexError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn fixup_stats(&self) -> FixupStats {
        self.counters.snapshot(self.fixups.pending_count() as u64)
    }
}

/// Hierarchical quantized ANN index over a transactional [`Store`].
///
/// Every operation runs against a caller supplied transaction. Partitions that
/// grow past `max_partition_size` or shrink below `min_partition_size` are
/// queued for a split or merge, which background workers apply in their own
/// transactions.
pub struct VectorIndex<S: Store> {
    core: Arc<IndexCore<S>>,
    workers: Mutex<Option<FixupWorkers>>,
}

impl<S: Store> VectorIndex<S> {
    /// Creates the index, and the empty root partition if the store does not
    /// have one yet. `seed` fixes the random rotation applied to vectors.
    pub async fn new(
        store: Arc<S>,
        quantizer: Quantizer,
        options: VectorIndexOptions,
        seed: u64,
    ) -> Result<Self, VectorIndexError> {
        options.validate().map_err(OptionsValidationError::from)?;
        let dims = quantizer.dims();
        let core = Arc::new(IndexCore {
            store,
            randomizer: RandomOrthoTransformer::from_kind(options.randomize, dims, seed),
            root_quantizer: Quantizer::unquantized(dims),
            quantizer,
            dims,
            seed,
            options,
            fixups: FixupQueue::default(),
            metrics: IndexMetrics::default(),
            counters: FixupCounters::default(),
        });

        let txn = core.store.begin().await?;
        match txn.get_partition(ROOT_KEY).await {
            Ok(_) => core.store.abort(txn).await?,
            Err(StoreError::PartitionNotFound(_)) => {
                let root = Partition::empty(&core.root_quantizer, vec![0.0; dims], LEAF_LEVEL);
                txn.set_root_partition(root).await?;
                core.store.commit(txn).await?;
            }
            Err(e) => {
                core.store.abort(txn).await?;
                return Err(e.into());
            }
        }

        let workers = match core.options.fixup_workers {
            0 => None,
            count => Some(FixupWorkers::spawn(core.clone(), count)),
        };
        Ok(Self {
            core,
            workers: Mutex::new(workers),
        })
    }

    pub fn options(&self) -> &VectorIndexOptions {
        &self.core.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.core.store
    }

    pub fn dims(&self) -> usize {
        self.core.dims
    }

    pub fn randomize_vector(&self, vector: &[f32]) -> Vec<f32> {
        self.core.randomizer.randomize(vector)
    }

    pub fn unrandomize_vector(&self, vector: &[f32]) -> Vec<f32> {
        self.core.randomizer.unrandomize(vector)
    }

    /// Adds `vector` under `key` to the leaf partition nearest to it. The full
    /// vector itself is stored by the caller.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn insert(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        vector: &[f32],
        key: PrimaryKey,
    ) -> Result<(), VectorIndexError> {
        self.core.check_dims(vector)?;
        let randomized = self.core.randomizer.randomize(vector);
        let leaf = self.core.find_leaf_for_insert(txn, cancel, &randomized).await?;
        let leaf_key = leaf.child_key.partition_key().ok_or_else(|| {
            VectorIndexError::Internal("insert search returned a primary key".to_string())
        })?;
        let size = txn
            .add_to_partition(leaf_key, &randomized, ChildKey::Primary(key))
            .await?;
        if size > self.core.options.max_partition_size {
            self.core
                .fixups
                .enqueue(Fixup::split(leaf.parent_partition_key, leaf_key));
        }
        Ok(())
    }

    /// Removes `key` from the leaf that holds it. `vector` must be the vector
    /// the key was inserted with; it guides the search for the leaf.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn delete(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        vector: &[f32],
        key: &PrimaryKey,
    ) -> Result<DeleteOutcome, VectorIndexError> {
        self.core.check_dims(vector)?;
        let randomized = self.core.randomizer.randomize(vector);
        let Some(found) = self
            .core
            .find_leaf_for_delete(txn, cancel, &randomized, key)
            .await?
        else {
            return Ok(DeleteOutcome::NotFound);
        };

        let leaf_key = found.parent_partition_key;
        match txn
            .remove_from_partition(leaf_key, &ChildKey::Primary(key.clone()))
            .await?
        {
            None => Ok(DeleteOutcome::NotFound),
            Some(size) => {
                if leaf_key != ROOT_KEY && size < self.core.options.min_partition_size {
                    self.core.fixups.enqueue(Fixup::merge(INVALID_KEY, leaf_key));
                }
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    /// Finds the `search_set.max_results` nearest vectors to `query`. Results
    /// are left in `search_set`, and its stats are reset to describe this
    /// search.
    #[tracing::instrument(skip_all, fields(max_results = search_set.max_results))]
    pub async fn search(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        query: &[f32],
        search_set: &mut SearchSet,
        options: SearchOptions,
    ) -> Result<(), VectorIndexError> {
        self.core.check_dims(query)?;
        self.core
            .search_vectors(txn, cancel, query, search_set, options)
            .await
    }

    /// Returns the leaf partition an insert of `vector` would go to. The
    /// result's `vector` is the leaf's centroid in randomized space.
    pub async fn search_for_insert(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        vector: &[f32],
    ) -> Result<SearchResult, VectorIndexError> {
        self.core.check_dims(vector)?;
        let randomized = self.core.randomizer.randomize(vector);
        let mut leaf = self.core.find_leaf_for_insert(txn, cancel, &randomized).await?;
        if let Some(leaf_key) = leaf.child_key.partition_key() {
            let partition = txn.get_partition(leaf_key).await?;
            leaf.vector = Some(partition.centroid().to_vec());
        }
        Ok(leaf)
    }

    /// Returns where `key` is stored, without removing it. The result's
    /// `parent_partition_key` is the leaf partition.
    pub async fn search_for_delete(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        vector: &[f32],
        key: &PrimaryKey,
    ) -> Result<Option<SearchResult>, VectorIndexError> {
        self.core.check_dims(vector)?;
        let randomized = self.core.randomizer.randomize(vector);
        self.core
            .find_leaf_for_delete(txn, cancel, &randomized, key)
            .await
    }

    /// Queues a split of `partition_key` regardless of its size.
    pub fn force_split(&self, parent_key: PartitionKey, partition_key: PartitionKey) {
        self.core
            .fixups
            .enqueue(Fixup::split(parent_key, partition_key).forced());
    }

    /// Queues a merge of `partition_key` regardless of its size.
    pub fn force_merge(&self, parent_key: PartitionKey, partition_key: PartitionKey) {
        self.core
            .fixups
            .enqueue(Fixup::merge(parent_key, partition_key).forced());
    }

    /// Stops background workers from picking up fixups. Queued fixups stay
    /// queued until `process_fixups` or `resume_fixups`.
    pub fn suspend_fixups(&self) {
        self.core.fixups.suspend();
    }

    pub fn resume_fixups(&self) {
        self.core.fixups.resume();
    }

    /// Runs queued fixups on the calling task until none are queued or in
    /// progress, including fixups queued along the way.
    pub async fn process_fixups(&self) {
        self.core.process_fixups(&CancellationToken::new()).await;
    }

    pub fn pending_fixups(&self) -> usize {
        self.core.fixups.pending_count()
    }

    pub fn fixup_stats(&self) -> FixupStats {
        self.core.fixup_stats()
    }

    /// Stops the background workers and waits for them to exit.
    pub async fn close(&self) {
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.shutdown().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<IndexCore<S>> {
        &self.core
    }
}

impl<S: Store> Drop for VectorIndex<S> {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.lock().take() {
            workers.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn options(min: usize, max: usize) -> VectorIndexOptions {
        VectorIndexOptions {
            min_partition_size: min,
            max_partition_size: max,
            is_deterministic: true,
            fixup_workers: 0,
            ..Default::default()
        }
    }

    async fn new_index(dims: usize, min: usize, max: usize) -> VectorIndex<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new(dims));
        VectorIndex::new(store, Quantizer::rabitq(dims), options(min, max), 42)
            .await
            .unwrap()
    }

    async fn insert(index: &VectorIndex<InMemoryStore>, key: &str, vector: Vec<f32>) {
        let key = PrimaryKey::from(key);
        index.store().insert_vector(key.clone(), vector.clone()).await.unwrap();
        let txn = index.store().begin().await.unwrap();
        index
            .insert(&txn, &CancellationToken::new(), &vector, key)
            .await
            .unwrap();
        index.store().commit(txn).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_creates_empty_root() {
        let index = new_index(2, 1, 4).await;
        let txn = index.store().begin().await.unwrap();
        let root = txn.get_partition(ROOT_KEY).await.unwrap();
        assert!(root.is_empty());
        assert!(root.is_leaf());
        assert_eq!(root.centroid(), &[0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_new_keeps_existing_root() {
        let index = new_index(2, 1, 4).await;
        insert(&index, "a", vec![1.0, 2.0]).await;
        let store = index.store().clone();
        drop(index);

        let reopened = VectorIndex::new(store, Quantizer::rabitq(2), options(1, 4), 42)
            .await
            .unwrap();
        let txn = reopened.store().begin().await.unwrap();
        assert_eq!(txn.get_partition(ROOT_KEY).await.unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_options() {
        let store = Arc::new(InMemoryStore::new(2));
        let result = VectorIndex::new(store, Quantizer::rabitq(2), options(4, 4), 1).await;
        let err = result.err().unwrap();
        assert_eq!(err.code(), ErrorCodes::InvalidArgument);
        assert!(matches!(err, VectorIndexError::InvalidOptions(_)));
        assert!(err.to_string().starts_with("Validation error"));
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let index = new_index(3, 1, 4).await;
        let txn = index.store().begin().await.unwrap();
        let err = index
            .insert(&txn, &CancellationToken::new(), &[1.0, 2.0], PrimaryKey::from("a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VectorIndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_insert_oversized_leaf_queues_split() {
        let index = new_index(2, 1, 2).await;
        index.suspend_fixups();
        insert(&index, "a", vec![0.0, 0.0]).await;
        insert(&index, "b", vec![1.0, 1.0]).await;
        assert_eq!(index.pending_fixups(), 0);
        insert(&index, "c", vec![2.0, 2.0]).await;
        assert_eq!(index.pending_fixups(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_not_found() {
        let index = new_index(2, 1, 4).await;
        insert(&index, "a", vec![1.0, 1.0]).await;
        let txn = index.store().begin().await.unwrap();
        let cancel = CancellationToken::new();
        let outcome = index
            .delete(&txn, &cancel, &[1.0, 1.0], &PrimaryKey::from("missing"))
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
        let outcome = index
            .delete(&txn, &cancel, &[1.0, 1.0], &PrimaryKey::from("a"))
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        let outcome = index
            .delete(&txn, &cancel, &[1.0, 1.0], &PrimaryKey::from("a"))
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_search_for_insert_and_delete() {
        let index = new_index(2, 1, 4).await;
        insert(&index, "a", vec![3.0, 4.0]).await;
        let txn = index.store().begin().await.unwrap();
        let cancel = CancellationToken::new();

        let leaf = index.search_for_insert(&txn, &cancel, &[3.0, 4.0]).await.unwrap();
        assert_eq!(leaf.child_key, ChildKey::Partition(ROOT_KEY));
        assert_eq!(leaf.vector, Some(vec![0.0, 0.0]));
        assert!((leaf.query_squared_distance - 25.0).abs() < 1e-3);

        let found = index
            .search_for_delete(&txn, &cancel, &[3.0, 4.0], &PrimaryKey::from("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.parent_partition_key, ROOT_KEY);
        assert_eq!(found.child_key, ChildKey::Primary(PrimaryKey::from("a")));
        assert!(index
            .search_for_delete(&txn, &cancel, &[3.0, 4.0], &PrimaryKey::from("b"))
            .await
            .unwrap()
            .is_none());
        // Searching does not mutate.
        assert_eq!(txn.get_partition(ROOT_KEY).await.unwrap().count(), 1);
    }
}
