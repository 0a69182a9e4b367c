use crate::{
    quantization::{QuantizedVectorSet, Quantizer},
    search_set::{SearchResult, SearchSet},
    types::{ChildKey, Level, PartitionKey, LEAF_LEVEL},
};

/// A node of the partition tree: a quantized set of child vectors around a
/// centroid, the keys of those children, and the height of the node.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    level: Level,
    quantized_set: QuantizedVectorSet,
    // Parallel to `quantized_set`.
    child_keys: Vec<ChildKey>,
}

impl Partition {
    pub fn new(quantized_set: QuantizedVectorSet, child_keys: Vec<ChildKey>, level: Level) -> Self {
        assert_eq!(
            quantized_set.len(),
            child_keys.len(),
            "quantized vectors and child keys must line up"
        );
        Self {
            level,
            quantized_set,
            child_keys,
        }
    }

    pub fn empty(quantizer: &Quantizer, centroid: Vec<f32>, level: Level) -> Self {
        Self::new(quantizer.new_set(centroid), Vec::new(), level)
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn is_leaf(&self) -> bool {
        self.level == LEAF_LEVEL
    }

    pub fn centroid(&self) -> &[f32] {
        self.quantized_set.centroid()
    }

    pub fn quantized_set(&self) -> &QuantizedVectorSet {
        &self.quantized_set
    }

    pub fn child_keys(&self) -> &[ChildKey] {
        &self.child_keys
    }

    pub fn count(&self) -> usize {
        self.child_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.child_keys.is_empty()
    }

    pub fn find(&self, child_key: &ChildKey) -> Option<usize> {
        self.child_keys.iter().position(|key| key == child_key)
    }

    /// Adds a child, replacing any existing entry with the same key. Returns
    /// false when the key was already present.
    pub fn add(&mut self, vector: &[f32], child_key: ChildKey) -> bool {
        let existed = match self.find(&child_key) {
            Some(offset) => {
                self.replace_with_last(offset);
                true
            }
            None => false,
        };
        self.quantized_set.add(vector);
        self.child_keys.push(child_key);
        !existed
    }

    /// Returns false when the key is not a child of this partition.
    pub fn remove(&mut self, child_key: &ChildKey) -> bool {
        match self.find(child_key) {
            Some(offset) => {
                self.replace_with_last(offset);
                true
            }
            None => false,
        }
    }

    fn replace_with_last(&mut self, offset: usize) {
        self.quantized_set.replace_with_last(offset);
        self.child_keys.swap_remove(offset);
    }

    /// Estimates the distance from `query` to every child and offers each one
    /// to `search_set`. Returns the number of children considered.
    pub fn search(
        &self,
        partition_key: PartitionKey,
        query: &[f32],
        search_set: &mut SearchSet,
    ) -> usize {
        let count = self.count();
        let mut distances = vec![0.0; count];
        let mut error_bounds = vec![0.0; count];
        self.quantized_set
            .estimate_squared_distances(query, &mut distances, &mut error_bounds);
        let centroid_distances = self.quantized_set.centroid_distances();
        for offset in 0..count {
            search_set.add(SearchResult {
                query_squared_distance: distances[offset],
                error_bound: error_bounds[offset],
                centroid_distance: centroid_distances[offset],
                parent_partition_key: partition_key,
                child_key: self.child_keys[offset].clone(),
                vector: None,
            });
        }
        count
    }
}
