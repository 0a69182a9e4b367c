use std::fmt::{Display, Formatter};

/// Identifies a partition in the tree. Keys are assigned by the store and
/// never reused while the partition exists.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(pub u64);

/// The root partition is created with the index and never deleted.
pub const ROOT_KEY: PartitionKey = PartitionKey(1);

/// Never assigned to a partition. Used as the parent of the root.
pub const INVALID_KEY: PartitionKey = PartitionKey(0);

impl Display for PartitionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller supplied identifier of a full vector.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimaryKey(Vec<u8>);

impl PrimaryKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for PrimaryKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Key of an entry inside a partition. Interior partitions reference child
/// partitions, leaf partitions reference primary keys. Partition keys sort
/// before primary keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKey {
    Partition(PartitionKey),
    Primary(PrimaryKey),
}

impl ChildKey {
    pub fn partition_key(&self) -> Option<PartitionKey> {
        match self {
            ChildKey::Partition(key) => Some(*key),
            ChildKey::Primary(_) => None,
        }
    }

    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        match self {
            ChildKey::Partition(_) => None,
            ChildKey::Primary(key) => Some(key),
        }
    }
}

impl From<PartitionKey> for ChildKey {
    fn from(value: PartitionKey) -> Self {
        ChildKey::Partition(value)
    }
}

impl From<PrimaryKey> for ChildKey {
    fn from(value: PrimaryKey) -> Self {
        ChildKey::Primary(value)
    }
}

impl Display for ChildKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildKey::Partition(key) => write!(f, "{}", key),
            ChildKey::Primary(key) => write!(f, "{}", key),
        }
    }
}

/// Height of a partition above the leaves.
pub type Level = u32;

pub const LEAF_LEVEL: Level = 0;

/// A child key together with its full vector, when the store has one.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorWithKey {
    pub key: ChildKey,
    pub vector: Option<Vec<f32>>,
}

impl VectorWithKey {
    pub fn new(key: ChildKey) -> Self {
        Self { key, vector: None }
    }
}
