//! Beam search over the partition tree.
//!
//! The search keeps the `beam_size` most promising partitions per level,
//! ranked by quantized distance estimates, and descends until it reaches the
//! requested level. Leaf results can then be reranked with exact distances
//! computed from full vectors.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vecindex_distance::squared_l2_distance;

use crate::{
    fixup::Fixup,
    index::{IndexCore, SearchOptions, VectorIndexError},
    partition::Partition,
    search_set::{SearchResult, SearchSet, SearchStats},
    store::{Store, Txn},
    types::{ChildKey, Level, PartitionKey, PrimaryKey, VectorWithKey, INVALID_KEY, LEAF_LEVEL, ROOT_KEY},
};

struct FrontierEntry {
    key: PartitionKey,
    parent_key: PartitionKey,
    partition: Arc<Partition>,
}

/// The beam is too narrow when the estimates of its best candidates are less
/// certain than the distances separating them.
fn needs_wider_beam(candidates: &[SearchResult], quality_samples: usize) -> bool {
    let samples = quality_samples.min(candidates.len());
    if samples < 2 {
        return false;
    }
    let mean_error_bound =
        candidates[..samples].iter().map(|c| c.error_bound).sum::<f32>() / samples as f32;
    let spread =
        candidates[samples - 1].query_squared_distance - candidates[0].query_squared_distance;
    mean_error_bound > spread
}

fn record_scan(stats: &mut SearchStats, partition: &Partition, count: usize) {
    stats.partition_count += 1;
    stats.quantized_vector_count += count;
    if partition.is_leaf() {
        stats.quantized_leaf_vector_count += count;
    }
}

impl<S: Store> IndexCore<S> {
    fn check_cancelled(cancel: &CancellationToken) -> Result<(), VectorIndexError> {
        if cancel.is_cancelled() {
            return Err(VectorIndexError::Cancelled);
        }
        Ok(())
    }

    fn check_size(&self, entry: &FrontierEntry) {
        if entry.partition.count() > self.options.max_partition_size {
            self.fixups
                .enqueue(Fixup::split(entry.parent_key, entry.key));
        }
    }

    /// Descends from the root and offers the children of every partition at
    /// `stop_level` that the beam reaches to `search_set`. `query` must be
    /// randomized.
    ///
    /// When the whole tree is lower than `stop_level`, the root partition
    /// itself is offered instead.
    pub(crate) async fn search_tree(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        query: &[f32],
        search_set: &mut SearchSet,
        base_beam_size: usize,
        stop_level: Level,
    ) -> Result<(), VectorIndexError> {
        Self::check_cancelled(cancel)?;
        let root = txn.get_partition(ROOT_KEY).await?;
        if root.level() < stop_level {
            search_set.add(SearchResult {
                query_squared_distance: squared_l2_distance(query, root.centroid()),
                error_bound: 0.0,
                centroid_distance: 0.0,
                parent_partition_key: INVALID_KEY,
                child_key: ChildKey::Partition(ROOT_KEY),
                vector: None,
            });
            return Ok(());
        }

        let mut frontier = vec![FrontierEntry {
            key: ROOT_KEY,
            parent_key: INVALID_KEY,
            partition: root,
        }];
        let mut beam_size = base_beam_size.max(1);
        let mut widened = false;

        loop {
            for entry in &frontier {
                self.check_size(entry);
            }

            let level = frontier[0].partition.level();
            if level == stop_level {
                for entry in &frontier {
                    let count = entry.partition.search(entry.key, query, search_set);
                    record_scan(&mut search_set.stats, &entry.partition, count);
                }
                return Ok(());
            }

            // Room for twice the beam until the beam has been widened once.
            let capacity = if widened { beam_size } else { beam_size * 2 };
            let mut next = SearchSet::new(capacity);
            for entry in &frontier {
                debug_assert_eq!(entry.partition.level(), level);
                let count = entry.partition.search(entry.key, query, &mut next);
                record_scan(&mut search_set.stats, &entry.partition, count);
            }
            let mut candidates = next.pop_results();
            if !widened && needs_wider_beam(&candidates, self.options.quality_samples) {
                widened = true;
                beam_size *= 2;
                tracing::trace!("Widening search beam to {} at level {}", beam_size, level);
            }
            candidates.truncate(beam_size);

            Self::check_cancelled(cancel)?;
            let mut next_frontier = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                let ChildKey::Partition(key) = candidate.child_key else {
                    return Err(VectorIndexError::Internal(format!(
                        "interior partition {} has a primary key child",
                        candidate.parent_partition_key
                    )));
                };
                let partition = txn.get_partition(key).await?;
                next_frontier.push(FrontierEntry {
                    key,
                    parent_key: candidate.parent_partition_key,
                    partition,
                });
            }
            if next_frontier.is_empty() {
                return Ok(());
            }
            frontier = next_frontier;
        }
    }

    /// Finds the best partition at `level` for a vector or centroid. The
    /// result's `parent_partition_key` is the partition's parent.
    pub(crate) async fn find_partition_at_level(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        randomized: &[f32],
        level: Level,
    ) -> Result<SearchResult, VectorIndexError> {
        let mut search_set = SearchSet::new(1);
        self.search_tree(
            txn,
            cancel,
            randomized,
            &mut search_set,
            self.options.base_beam_size,
            level + 1,
        )
        .await?;
        search_set.pop_results().into_iter().next().ok_or_else(|| {
            VectorIndexError::Internal(format!("no partition found at level {}", level))
        })
    }

    pub(crate) async fn find_leaf_for_insert(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        randomized: &[f32],
    ) -> Result<SearchResult, VectorIndexError> {
        self.find_partition_at_level(txn, cancel, randomized, LEAF_LEVEL)
            .await
    }

    /// Looks for `key` among the leaves near `randomized`. The beam is twice
    /// as wide as for inserts, since the key may have been moved to a
    /// neighboring leaf by splits and merges.
    pub(crate) async fn find_leaf_for_delete(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        randomized: &[f32],
        key: &PrimaryKey,
    ) -> Result<Option<SearchResult>, VectorIndexError> {
        let mut search_set = SearchSet::new(1).with_match_key(ChildKey::Primary(key.clone()));
        self.search_tree(
            txn,
            cancel,
            randomized,
            &mut search_set,
            self.options.base_beam_size * 2,
            LEAF_LEVEL,
        )
        .await?;
        Ok(search_set.pop_results().into_iter().next())
    }

    pub(crate) async fn search_vectors(
        &self,
        txn: &S::Txn,
        cancel: &CancellationToken,
        query: &[f32],
        search_set: &mut SearchSet,
        options: SearchOptions,
    ) -> Result<(), VectorIndexError> {
        search_set.clear();
        search_set.stats = SearchStats::default();

        let randomized = self.randomizer.randomize(query);
        let beam_size = match options.base_beam_size {
            0 => self.options.base_beam_size,
            size => size,
        };
        let extra = if options.skip_rerank {
            0
        } else {
            search_set.max_results * self.options.max_extra_results_factor
        };
        let mut working = SearchSet::new(search_set.max_results).with_extra_results(extra);
        working.match_key = search_set.match_key.clone();

        let searched = self
            .search_tree(txn, cancel, &randomized, &mut working, beam_size, LEAF_LEVEL)
            .await;
        search_set.stats = working.stats.clone();
        let results = working.pop_results();
        if let Err(e) = searched {
            search_set.add_all(results);
            return Err(e);
        }

        if options.skip_rerank {
            search_set.add_all(results);
            return Ok(());
        }
        if cancel.is_cancelled() {
            search_set.add_all(results);
            return Err(VectorIndexError::Cancelled);
        }
        let reranked = self
            .rerank(txn, query, results, search_set.max_results, &mut search_set.stats)
            .await?;
        search_set.add_all(reranked);
        Ok(())
    }

    /// Replaces estimates with exact distances to `query`, which is not
    /// randomized since full vectors are stored as given. Results whose full
    /// vector is gone are dropped and their keys queued for removal.
    async fn rerank(
        &self,
        txn: &S::Txn,
        query: &[f32],
        results: Vec<SearchResult>,
        max_results: usize,
        stats: &mut SearchStats,
    ) -> Result<Vec<SearchResult>, VectorIndexError> {
        let mut refs: Vec<VectorWithKey> = results
            .iter()
            .map(|result| VectorWithKey::new(result.child_key.clone()))
            .collect();
        txn.get_full_vectors(&mut refs).await?;

        let mut reranked = Vec::with_capacity(results.len());
        for (mut result, vector_ref) in results.into_iter().zip(refs) {
            match vector_ref.vector {
                Some(vector) => {
                    stats.full_vector_count += 1;
                    result.query_squared_distance = squared_l2_distance(query, &vector);
                    result.error_bound = 0.0;
                    result.vector = Some(vector);
                    reranked.push(result);
                }
                None => {
                    if let ChildKey::Primary(key) = &result.child_key {
                        tracing::debug!(
                            "Full vector for {} is missing, removing it from partition {}",
                            key,
                            result.parent_partition_key
                        );
                        self.fixups.enqueue(Fixup::delete_vector(
                            result.parent_partition_key,
                            key.clone(),
                        ));
                    }
                }
            }
        }
        reranked.sort_by(|a, b| a.compare(b));
        reranked.truncate(max_results);
        Ok(reranked)
    }
}
