use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{Store, StoreError, Txn};
use crate::{
    partition::Partition,
    types::{ChildKey, PartitionKey, PrimaryKey, VectorWithKey, ROOT_KEY},
};

// Version recorded for a partition that did not exist when it was read.
const ABSENT: u64 = 0;

#[derive(Clone, Debug)]
struct VersionedPartition {
    version: u64,
    partition: Arc<Partition>,
}

#[derive(Debug, Default)]
struct StoreState {
    partitions: HashMap<PartitionKey, VersionedPartition>,
    // Bumped by every commit that writes.
    version: u64,
}

impl StoreState {
    fn version_of(&self, key: &PartitionKey) -> u64 {
        self.partitions
            .get(key)
            .map(|p| p.version)
            .unwrap_or(ABSENT)
    }
}

/// Process local store with optimistic transactions. Transactions read the
/// latest committed partitions, buffer their writes, and are validated at
/// commit: if any partition they read has changed since, the commit fails with
/// [`StoreError::Conflict`] and nothing is applied.
///
/// Full vectors are owned by the caller and are not transactional.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    dims: usize,
    state: Arc<RwLock<StoreState>>,
    vectors: Arc<RwLock<HashMap<PrimaryKey, Vec<f32>>>>,
    next_key: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new(dims: usize) -> Self {
        InMemoryStore {
            dims,
            state: Arc::new(RwLock::new(StoreState::default())),
            vectors: Arc::new(RwLock::new(HashMap::new())),
            next_key: Arc::new(AtomicU64::new(ROOT_KEY.0 + 1)),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn get_vector(&self, key: &PrimaryKey) -> Option<Vec<f32>> {
        self.vectors.read().get(key).cloned()
    }

    /// Every full vector, ordered by primary key.
    pub fn get_all_vectors(&self) -> Vec<(PrimaryKey, Vec<f32>)> {
        let mut vectors: Vec<_> = self
            .vectors
            .read()
            .iter()
            .map(|(key, vector)| (key.clone(), vector.clone()))
            .collect();
        vectors.sort_by(|a, b| a.0.cmp(&b.0));
        vectors
    }

    /// Number of committed partitions, root included.
    pub fn partition_count(&self) -> usize {
        self.state.read().partitions.len()
    }
}

#[derive(Debug, Default)]
struct TxnState {
    reads: HashMap<PartitionKey, u64>,
    // None marks a deletion.
    writes: HashMap<PartitionKey, Option<Arc<Partition>>>,
}

#[derive(Debug)]
pub struct InMemoryTxn {
    state: Arc<RwLock<StoreState>>,
    vectors: Arc<RwLock<HashMap<PrimaryKey, Vec<f32>>>>,
    next_key: Arc<AtomicU64>,
    inner: Mutex<TxnState>,
}

impl InMemoryTxn {
    fn read(&self, key: PartitionKey) -> Result<Arc<Partition>, StoreError> {
        let mut txn = self.inner.lock();
        if let Some(write) = txn.writes.get(&key) {
            return write.clone().ok_or(StoreError::PartitionNotFound(key));
        }

        let state = self.state.read();
        // Every read must agree with the reads before it, otherwise the
        // transaction would act on a mix of snapshots.
        if let Some((stale, _)) = txn
            .reads
            .iter()
            .find(|(k, version)| state.version_of(k) != **version)
        {
            return Err(StoreError::Conflict(format!("partition {} changed", stale)));
        }

        let found = state.partitions.get(&key);
        let version = found.map(|p| p.version).unwrap_or(ABSENT);
        match txn.reads.entry(key) {
            Entry::Occupied(entry) if *entry.get() != version => {
                return Err(StoreError::Conflict(format!("partition {} changed", key)));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(version);
            }
        }
        found
            .map(|p| p.partition.clone())
            .ok_or(StoreError::PartitionNotFound(key))
    }

    fn write(&self, key: PartitionKey, partition: Option<Partition>) {
        self.inner
            .lock()
            .writes
            .insert(key, partition.map(Arc::new));
    }
}

#[async_trait]
impl Txn for InMemoryTxn {
    async fn get_partition(&self, key: PartitionKey) -> Result<Arc<Partition>, StoreError> {
        self.read(key)
    }

    async fn set_root_partition(&self, partition: Partition) -> Result<(), StoreError> {
        self.write(ROOT_KEY, Some(partition));
        Ok(())
    }

    async fn insert_partition(&self, partition: Partition) -> Result<PartitionKey, StoreError> {
        let key = PartitionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.write(key, Some(partition));
        Ok(key)
    }

    async fn delete_partition(&self, key: PartitionKey) -> Result<(), StoreError> {
        self.read(key)?;
        self.write(key, None);
        Ok(())
    }

    async fn add_to_partition(
        &self,
        key: PartitionKey,
        vector: &[f32],
        child_key: ChildKey,
    ) -> Result<usize, StoreError> {
        let mut partition = Partition::clone(&*self.read(key)?);
        partition.add(vector, child_key);
        let count = partition.count();
        self.write(key, Some(partition));
        Ok(count)
    }

    async fn remove_from_partition(
        &self,
        key: PartitionKey,
        child_key: &ChildKey,
    ) -> Result<Option<usize>, StoreError> {
        let existing = self.read(key)?;
        if existing.find(child_key).is_none() {
            return Ok(None);
        }
        let mut partition = Partition::clone(&*existing);
        partition.remove(child_key);
        let count = partition.count();
        self.write(key, Some(partition));
        Ok(Some(count))
    }

    async fn get_full_vectors(&self, refs: &mut [VectorWithKey]) -> Result<(), StoreError> {
        for vector_ref in refs.iter_mut() {
            vector_ref.vector = match &vector_ref.key {
                ChildKey::Primary(key) => self.vectors.read().get(key).cloned(),
                ChildKey::Partition(key) => match self.read(*key) {
                    Ok(partition) => Some(partition.centroid().to_vec()),
                    Err(StoreError::PartitionNotFound(_)) => None,
                    Err(e) => return Err(e),
                },
            };
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Txn = InMemoryTxn;

    async fn begin(&self) -> Result<InMemoryTxn, StoreError> {
        Ok(InMemoryTxn {
            state: self.state.clone(),
            vectors: self.vectors.clone(),
            next_key: self.next_key.clone(),
            inner: Mutex::new(TxnState::default()),
        })
    }

    async fn commit(&self, txn: InMemoryTxn) -> Result<(), StoreError> {
        let TxnState { reads, writes } = txn.inner.into_inner();
        let mut state = self.state.write();
        if let Some((stale, _)) = reads
            .iter()
            .find(|(key, version)| state.version_of(key) != **version)
        {
            return Err(StoreError::Conflict(format!(
                "partition {} changed before commit",
                stale
            )));
        }
        if writes.is_empty() {
            return Ok(());
        }

        state.version += 1;
        let version = state.version;
        for (key, partition) in writes {
            match partition {
                Some(partition) => {
                    state
                        .partitions
                        .insert(key, VersionedPartition { version, partition });
                }
                None => {
                    state.partitions.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn abort(&self, txn: InMemoryTxn) -> Result<(), StoreError> {
        drop(txn);
        Ok(())
    }

    async fn insert_vector(&self, key: PrimaryKey, vector: Vec<f32>) -> Result<(), StoreError> {
        if vector.len() != self.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        self.vectors.write().insert(key, vector);
        Ok(())
    }

    async fn delete_vector(&self, key: &PrimaryKey) -> Result<Option<Vec<f32>>, StoreError> {
        Ok(self.vectors.write().remove(key))
    }
}
