use std::{cmp::Ordering, collections::HashSet};

use crate::types::{ChildKey, PartitionKey};

/// Counters describing the work done by one search.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Partitions whose quantized vectors were scanned.
    pub partition_count: usize,
    /// Quantized vectors compared with the query, at any level.
    pub quantized_vector_count: usize,
    /// The subset of `quantized_vector_count` found in leaf partitions.
    pub quantized_leaf_vector_count: usize,
    /// Full vectors fetched from the store for reranking.
    pub full_vector_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    /// Estimated (or, after reranking, exact) squared distance to the query.
    pub query_squared_distance: f32,
    /// Bound on the absolute error of `query_squared_distance`.
    pub error_bound: f32,
    /// Distance of the child from the centroid of its partition.
    pub centroid_distance: f32,
    pub parent_partition_key: PartitionKey,
    pub child_key: ChildKey,
    pub vector: Option<Vec<f32>>,
}

impl SearchResult {
    pub fn min_distance(&self) -> f32 {
        self.query_squared_distance - self.error_bound
    }

    pub fn max_distance(&self) -> f32 {
        self.query_squared_distance + self.error_bound
    }

    /// Orders by distance, then by child key.
    pub fn compare(&self, other: &SearchResult) -> Ordering {
        self.query_squared_distance
            .total_cmp(&other.query_squared_distance)
            .then_with(|| self.child_key.cmp(&other.child_key))
    }
}

/// Collects the best candidates offered during a search.
///
/// Besides the `max_results` nearest candidates, up to `max_extra_results`
/// further candidates are kept whose distance range overlaps the range of the
/// last regular result, so reranking with exact distances can still promote
/// them.
#[derive(Clone, Debug, Default)]
pub struct SearchSet {
    pub max_results: usize,
    pub max_extra_results: usize,
    /// When set, every other child key is rejected.
    pub match_key: Option<ChildKey>,
    pub stats: SearchStats,
    candidates: Vec<SearchResult>,
}

impl SearchSet {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            ..Default::default()
        }
    }

    pub fn with_extra_results(mut self, max_extra_results: usize) -> Self {
        self.max_extra_results = max_extra_results;
        self
    }

    pub fn with_match_key(mut self, match_key: ChildKey) -> Self {
        self.match_key = Some(match_key);
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn add(&mut self, candidate: SearchResult) {
        if let Some(match_key) = &self.match_key {
            if &candidate.child_key != match_key {
                return;
            }
        }
        self.candidates.push(candidate);
        let capacity = self.max_results + self.max_extra_results;
        if self.candidates.len() > 2 * capacity.max(8) {
            self.prune();
        }
    }

    pub fn add_all(&mut self, candidates: impl IntoIterator<Item = SearchResult>) {
        for candidate in candidates {
            self.add(candidate);
        }
    }

    /// Drops every candidate. Stats are kept.
    pub fn clear(&mut self) {
        self.candidates.clear();
    }

    fn sort_and_dedup(&mut self) {
        self.candidates.sort_by(|a, b| a.compare(b));
        let mut seen = HashSet::new();
        self.candidates
            .retain(|candidate| seen.insert(candidate.child_key.clone()));
    }

    fn prune(&mut self) {
        self.sort_and_dedup();
        self.candidates
            .truncate(self.max_results + self.max_extra_results);
    }

    /// Removes and returns the best results, nearest first: `max_results`
    /// candidates plus the admissible extra candidates.
    pub fn pop_results(&mut self) -> Vec<SearchResult> {
        self.sort_and_dedup();
        let mut candidates = std::mem::take(&mut self.candidates).into_iter();
        let mut results: Vec<SearchResult> = candidates.by_ref().take(self.max_results).collect();
        if self.max_extra_results > 0 {
            if let Some(threshold) = results.last().map(SearchResult::max_distance) {
                results.extend(
                    candidates
                        .filter(|candidate| candidate.min_distance() <= threshold)
                        .take(self.max_extra_results),
                );
            }
        }
        results
    }
}

/// Mean fraction of the true nearest neighbors found per query. `predicted`
/// and `truth` hold one result list per query, in the same order.
pub fn calculate_recall<K: Eq + std::hash::Hash>(predicted: &[Vec<K>], truth: &[Vec<K>]) -> f64 {
    assert_eq!(
        predicted.len(),
        truth.len(),
        "predicted and true result sets must cover the same queries"
    );
    if truth.is_empty() {
        return 1.0;
    }
    let total: f64 = predicted
        .iter()
        .zip(truth)
        .map(|(predicted, truth)| {
            if truth.is_empty() {
                return 1.0;
            }
            let expected: HashSet<&K> = truth.iter().collect();
            let found = predicted.iter().filter(|k| expected.contains(k)).count();
            found as f64 / truth.len() as f64
        })
        .sum();
    total / truth.len() as f64
}
