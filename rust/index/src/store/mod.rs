//! Storage contract of the index.
//!
//! Partitions and full vectors live in a transactional store owned by the
//! embedding engine. Every read and write of the index goes through a [`Txn`],
//! so the tree is only ever observed at a consistent snapshot and a fixup
//! either commits entirely or not at all.

mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use vecindex_error::{ErrorCodes, VecIndexError};

pub use in_memory::*;

use crate::{
    partition::Partition,
    types::{ChildKey, PartitionKey, PrimaryKey, VectorWithKey},
};

#[derive(Error, Debug)]
pub enum StoreError {
    /// The transaction raced with a concurrent committed transaction.
    #[error("Transaction conflict: {0}")]
    Conflict(String),
    #[error("Partition {0} not found")]
    PartitionNotFound(PartitionKey),
    #[error("Expected a vector with {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Store error: {0}")]
    Internal(#[from] Box<dyn VecIndexError>),
}

impl VecIndexError for StoreError {
    fn code(&self) -> ErrorCodes {
        match self {
            StoreError::Conflict(_) => ErrorCodes::Aborted,
            StoreError::PartitionNotFound(_) => ErrorCodes::NotFound,
            StoreError::DimensionMismatch { .. } => ErrorCodes::InvalidArgument,
            StoreError::Internal(err) => err.code(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Txn: Txn;

    async fn begin(&self) -> Result<Self::Txn, StoreError>;

    /// Makes the writes of `txn` visible, or fails with
    /// [`StoreError::Conflict`] without applying any of them.
    async fn commit(&self, txn: Self::Txn) -> Result<(), StoreError>;

    async fn abort(&self, txn: Self::Txn) -> Result<(), StoreError>;

    /// Stores the full vector of `key`, replacing any earlier one. Full
    /// vectors are written by the embedding engine, outside index
    /// transactions.
    async fn insert_vector(&self, key: PrimaryKey, vector: Vec<f32>) -> Result<(), StoreError>;

    /// Removes the full vector of `key`, returning it if it existed. Leaf
    /// entries still pointing at it are cleaned up lazily by searches.
    async fn delete_vector(&self, key: &PrimaryKey) -> Result<Option<Vec<f32>>, StoreError>;
}

#[async_trait]
pub trait Txn: Send + Sync {
    async fn get_partition(&self, key: PartitionKey) -> Result<Arc<Partition>, StoreError>;

    /// Replaces the root partition, creating it if needed.
    async fn set_root_partition(&self, partition: Partition) -> Result<(), StoreError>;

    /// Stores a new partition under a freshly allocated key.
    async fn insert_partition(&self, partition: Partition) -> Result<PartitionKey, StoreError>;

    async fn delete_partition(&self, key: PartitionKey) -> Result<(), StoreError>;

    /// Adds a child to the partition and returns its new size.
    async fn add_to_partition(
        &self,
        key: PartitionKey,
        vector: &[f32],
        child_key: ChildKey,
    ) -> Result<usize, StoreError>;

    /// Removes a child from the partition. Returns the new size, or `None`
    /// when the child was not present.
    async fn remove_from_partition(
        &self,
        key: PartitionKey,
        child_key: &ChildKey,
    ) -> Result<Option<usize>, StoreError>;

    /// Fills in the full vector of each reference that still exists. Primary
    /// keys resolve to caller vectors, partition keys to partition centroids.
    async fn get_full_vectors(&self, refs: &mut [VectorWithKey]) -> Result<(), StoreError>;
}
