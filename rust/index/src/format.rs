//! Human readable dumps of the partition tree, used by tests and debugging.

use std::{collections::HashMap, fmt::Write, sync::Arc};

use vecindex_distance::squared_l2_distance;

use crate::{
    index::{VectorIndex, VectorIndexError},
    metrics::FixupStats,
    partition::Partition,
    store::{Store, Txn},
    types::{ChildKey, Level, PartitionKey, VectorWithKey, ROOT_KEY},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct FormatOptions {
    /// Print primary keys as (lossy) UTF-8 rather than hex.
    pub primary_key_strings: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LevelStats {
    pub level: Level,
    pub partition_count: usize,
    pub mean_size: f64,
    pub stdev_size: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexStats {
    pub partition_count: usize,
    /// Ordered from the root level down to the leaves.
    pub levels: Vec<LevelStats>,
    /// Mean absolute error of quantized squared distance estimates between
    /// vectors sharing a leaf.
    pub quantization_error: f64,
    pub fixups: FixupStats,
}

fn format_float(value: f32) -> String {
    let formatted = format!("{:.4}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

fn format_vector(vector: &[f32]) -> String {
    let values: Vec<String> = vector.iter().map(|v| format_float(*v)).collect();
    format!("({})", values.join(", "))
}

fn format_key(key: &ChildKey, options: FormatOptions) -> String {
    match key {
        ChildKey::Partition(key) => key.to_string(),
        ChildKey::Primary(key) if options.primary_key_strings => key.to_string(),
        ChildKey::Primary(key) => key.as_bytes().iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

struct Tree {
    partitions: HashMap<PartitionKey, Arc<Partition>>,
    // Full vectors of leaf children, in caller space.
    leaf_vectors: HashMap<ChildKey, Option<Vec<f32>>>,
}

impl<S: Store> VectorIndex<S> {
    async fn load_tree(&self, txn: &S::Txn) -> Result<Tree, VectorIndexError> {
        let mut partitions = HashMap::new();
        let mut refs = Vec::new();
        let mut stack = vec![ROOT_KEY];
        while let Some(key) = stack.pop() {
            let partition = txn.get_partition(key).await?;
            if partition.is_leaf() {
                refs.extend(partition.child_keys().iter().cloned().map(VectorWithKey::new));
            } else {
                stack.extend(partition.child_keys().iter().filter_map(ChildKey::partition_key));
            }
            partitions.insert(key, partition);
        }
        txn.get_full_vectors(&mut refs).await?;
        let leaf_vectors = refs.into_iter().map(|r| (r.key, r.vector)).collect();
        Ok(Tree {
            partitions,
            leaf_vectors,
        })
    }

    /// Renders the tree with one line per partition or vector. Centroids are
    /// shown in the caller's space.
    pub async fn format(
        &self,
        txn: &S::Txn,
        options: FormatOptions,
    ) -> Result<String, VectorIndexError> {
        let tree = self.load_tree(txn).await?;
        let mut out = String::new();
        self.format_partition(&tree, ROOT_KEY, "", "", options, &mut out)?;
        Ok(out)
    }

    fn format_partition(
        &self,
        tree: &Tree,
        key: PartitionKey,
        first_prefix: &str,
        prefix: &str,
        options: FormatOptions,
        out: &mut String,
    ) -> Result<(), VectorIndexError> {
        let partition = tree
            .partitions
            .get(&key)
            .ok_or_else(|| VectorIndexError::Internal(format!("partition {} not loaded", key)))?;
        let centroid = self.unrandomize_vector(partition.centroid());
        writeln!(out, "{}• {} {}", first_prefix, key, format_vector(&centroid))
            .map_err(|e| VectorIndexError::Internal(e.to_string()))?;

        let children = partition.child_keys();
        for (i, child) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let (branch, indent) = if last {
                ("└───", "    ")
            } else {
                ("├───", "│   ")
            };
            let child_first_prefix = format!("{}{}", prefix, branch);
            let child_prefix = format!("{}{}", prefix, indent);
            match child {
                ChildKey::Partition(child_key) => self.format_partition(
                    tree,
                    *child_key,
                    &child_first_prefix,
                    &child_prefix,
                    options,
                    out,
                )?,
                ChildKey::Primary(_) => {
                    let vector = match tree.leaf_vectors.get(child) {
                        Some(Some(vector)) => format_vector(vector),
                        _ => "(MISSING)".to_string(),
                    };
                    writeln!(
                        out,
                        "{}• {} {}",
                        child_first_prefix,
                        format_key(child, options),
                        vector
                    )
                    .map_err(|e| VectorIndexError::Internal(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    /// Compares the estimate of each leaf vector's distance to every other
    /// vector in its leaf with the exact distance between their full vectors.
    fn quantization_error(&self, tree: &Tree) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for partition in tree.partitions.values().filter(|p| p.is_leaf()) {
            let vectors: Vec<Option<Vec<f32>>> = partition
                .child_keys()
                .iter()
                .map(|key| {
                    tree.leaf_vectors
                        .get(key)
                        .and_then(Option::as_ref)
                        .map(|v| self.randomize_vector(v))
                })
                .collect();
            let set = partition.quantized_set();
            let mut distances = vec![0.0; set.len()];
            let mut error_bounds = vec![0.0; set.len()];
            for (i, query) in vectors.iter().enumerate() {
                let Some(query) = query else {
                    continue;
                };
                set.estimate_squared_distances(query, &mut distances, &mut error_bounds);
                for (j, other) in vectors.iter().enumerate() {
                    let Some(other) = other.as_ref().filter(|_| i != j) else {
                        continue;
                    };
                    total += (distances[j] - squared_l2_distance(query, other)).abs() as f64;
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    /// Partition counts and size distribution per level, the quantization
    /// error of the leaves, and the fixup counters of this process.
    pub async fn stats(&self, txn: &S::Txn) -> Result<IndexStats, VectorIndexError> {
        let tree = self.load_tree(txn).await?;
        let mut sizes: HashMap<Level, Vec<usize>> = HashMap::new();
        for partition in tree.partitions.values() {
            sizes
                .entry(partition.level())
                .or_default()
                .push(partition.count());
        }
        let mut levels: Vec<LevelStats> = sizes
            .into_iter()
            .map(|(level, sizes)| {
                let n = sizes.len() as f64;
                let mean = sizes.iter().sum::<usize>() as f64 / n;
                let variance = sizes
                    .iter()
                    .map(|s| (*s as f64 - mean).powi(2))
                    .sum::<f64>()
                    / n;
                LevelStats {
                    level,
                    partition_count: sizes.len(),
                    mean_size: mean,
                    stdev_size: variance.sqrt(),
                }
            })
            .collect();
        levels.sort_by(|a, b| b.level.cmp(&a.level));
        Ok(IndexStats {
            partition_count: tree.partitions.len(),
            levels,
            quantization_error: self.quantization_error(&tree),
            fixups: self.fixup_stats(),
        })
    }

    pub async fn format_stats(&self, txn: &S::Txn) -> Result<String, VectorIndexError> {
        let stats = self.stats(txn).await?;
        let mut out = format!(
            "{} levels, {} partitions\n",
            stats.levels.len(),
            stats.partition_count
        );
        for level in &stats.levels {
            out.push_str(&format!(
                "level {}: {} partitions, size {:.2} ± {:.2}\n",
                level.level, level.partition_count, level.mean_size, level.stdev_size
            ));
        }
        out.push_str(&format!(
            "quantization error: {:.4}\n",
            stats.quantization_error
        ));
        let fixups = &stats.fixups;
        out.push_str(&format!(
            "fixups: {} splits, {} merges, {} vector deletes, {} skipped, {} dropped, {} retried, {} pending\n",
            fixups.splits,
            fixups.merges,
            fixups.vector_deletes,
            fixups.skipped,
            fixups.dropped,
            fixups.retried,
            fixups.pending
        ));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RandomizeKind, VectorIndexOptions},
        quantization::Quantizer,
        store::InMemoryStore,
        types::{PrimaryKey, INVALID_KEY},
    };
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1.0), "1");
        assert_eq!(format_float(-0.00001), "0");
        assert_eq!(format_float(2.5), "2.5");
        assert_eq!(format_float(0.123456), "0.1235");
        assert_eq!(format_float(-3.25), "-3.25");
    }

    async fn build(vectors: &[(&str, [f32; 2])]) -> VectorIndex<InMemoryStore> {
        let options = VectorIndexOptions {
            min_partition_size: 1,
            max_partition_size: 4,
            fixup_workers: 0,
            is_deterministic: true,
            randomize: RandomizeKind::None,
            ..Default::default()
        };
        let index = VectorIndex::new(
            Arc::new(InMemoryStore::new(2)),
            Quantizer::rabitq(2),
            options,
            3,
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        for (key, vector) in vectors {
            let key = PrimaryKey::from(*key);
            index.store().insert_vector(key.clone(), vector.to_vec()).await.unwrap();
            let txn = index.store().begin().await.unwrap();
            index.insert(&txn, &cancel, vector, key).await.unwrap();
            index.store().commit(txn).await.unwrap();
        }
        index
    }

    #[tokio::test]
    async fn test_format_leaf_root() {
        let index = build(&[("a", [1.0, 2.0]), ("b", [-0.5, 0.0])]).await;
        index.store().delete_vector(&PrimaryKey::from("b")).await.unwrap();
        let txn = index.store().begin().await.unwrap();
        let options = FormatOptions {
            primary_key_strings: true,
        };
        let tree = index.format(&txn, options).await.unwrap();
        assert_eq!(tree, "• 1 (0, 0)\n├───• a (1, 2)\n└───• b (MISSING)\n");

        let tree = index.format(&txn, FormatOptions::default()).await.unwrap();
        assert_eq!(tree, "• 1 (0, 0)\n├───• 61 (1, 2)\n└───• 62 (MISSING)\n");
    }

    #[tokio::test]
    async fn test_quantization_error() {
        let index = build(&[
            ("a", [0.0, 0.0]),
            ("b", [0.0, 2.0]),
            ("c", [10.0, 0.0]),
            ("d", [10.0, 2.0]),
        ])
        .await;
        // The root is never quantized.
        let txn = index.store().begin().await.unwrap();
        let stats = index.stats(&txn).await.unwrap();
        assert!(stats.quantization_error < 1e-3);
        drop(txn);

        index.force_split(INVALID_KEY, ROOT_KEY);
        index.process_fixups().await;
        let txn = index.store().begin().await.unwrap();
        let stats = index.stats(&txn).await.unwrap();
        assert!(stats.quantization_error.is_finite());
        assert!(stats.quantization_error >= 0.0);
        let formatted = index.format_stats(&txn).await.unwrap();
        assert!(formatted.contains("quantization error: "));
    }

    #[tokio::test]
    async fn test_format_two_levels() {
        let index = build(&[
            ("a", [0.0, 0.0]),
            ("b", [0.0, 2.0]),
            ("c", [10.0, 0.0]),
            ("d", [10.0, 2.0]),
        ])
        .await;
        index.force_split(INVALID_KEY, ROOT_KEY);
        index.process_fixups().await;

        let txn = index.store().begin().await.unwrap();
        let tree = index
            .format(
                &txn,
                FormatOptions {
                    primary_key_strings: true,
                },
            )
            .await
            .unwrap();
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "• 1 (0, 0)");
        assert!(lines.iter().any(|l| l.ends_with("(0, 1)")));
        assert!(lines.iter().any(|l| l.ends_with("(10, 1)")));
        assert!(lines.iter().any(|l| l.starts_with("│   ├───• ")));
        assert!(lines.iter().any(|l| l.starts_with("    └───• ")));

        let stats = index.stats(&txn).await.unwrap();
        assert_eq!(stats.partition_count, 3);
        assert_eq!(
            stats.levels,
            vec![
                LevelStats {
                    level: 1,
                    partition_count: 1,
                    mean_size: 2.0,
                    stdev_size: 0.0,
                },
                LevelStats {
                    level: 0,
                    partition_count: 2,
                    mean_size: 2.0,
                    stdev_size: 0.0,
                },
            ]
        );
        assert_eq!(stats.fixups.splits, 1);
        let formatted = index.format_stats(&txn).await.unwrap();
        assert!(formatted.starts_with("2 levels, 3 partitions\n"));
        assert!(formatted.contains("level 0: 2 partitions, size 2.00 ± 0.00"));
        assert!(formatted.contains("fixups: 1 splits, 0 merges"));
    }
}
