use std::{collections::HashSet, sync::Arc};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use vecindex::{
    calculate_recall, ChildKey, DeleteOutcome, InMemoryStore, Partition, PartitionKey,
    PrimaryKey, Quantizer, SearchOptions, SearchSet, Store, StoreError, Txn, VectorIndex,
    VectorIndexError, VectorIndexOptions, INVALID_KEY, ROOT_KEY,
};
use vecindex_error::VecIndexError;

const MAX_ATTEMPTS: usize = 100;

fn options(min: usize, max: usize) -> VectorIndexOptions {
    VectorIndexOptions {
        min_partition_size: min,
        max_partition_size: max,
        is_deterministic: true,
        fixup_workers: 0,
        ..Default::default()
    }
}

async fn new_index(dims: usize, options: VectorIndexOptions) -> VectorIndex<InMemoryStore> {
    vecindex_tracing::init_test_tracing();
    VectorIndex::new(
        Arc::new(InMemoryStore::new(dims)),
        Quantizer::rabitq(dims),
        options,
        42,
    )
    .await
    .unwrap()
}

/// Stores the full vector and indexes it, retrying on transaction conflicts
/// with concurrent fixups.
async fn insert(index: &VectorIndex<InMemoryStore>, key: &PrimaryKey, vector: &[f32]) {
    index.store().insert_vector(key.clone(), vector.to_vec()).await.unwrap();
    let cancel = CancellationToken::new();
    for _ in 0..MAX_ATTEMPTS {
        let txn = index.store().begin().await.unwrap();
        match index.insert(&txn, &cancel, vector, key.clone()).await {
            Ok(()) => match index.store().commit(txn).await {
                Ok(()) => return,
                Err(e) if e.code().is_retryable() => continue,
                Err(e) => panic!("commit failed: {}", e),
            },
            Err(e) if e.code().is_retryable() => {
                index.store().abort(txn).await.unwrap();
            }
            Err(e) => panic!("insert failed: {}", e),
        }
    }
    panic!("insert of {} kept conflicting", key);
}

/// Removes the key from the index, retrying on transaction conflicts.
async fn delete(index: &VectorIndex<InMemoryStore>, key: &PrimaryKey, vector: &[f32]) -> DeleteOutcome {
    let cancel = CancellationToken::new();
    for _ in 0..MAX_ATTEMPTS {
        let txn = index.store().begin().await.unwrap();
        match index.delete(&txn, &cancel, vector, key).await {
            Ok(outcome) => match index.store().commit(txn).await {
                Ok(()) => return outcome,
                Err(e) if e.code().is_retryable() => continue,
                Err(e) => panic!("commit failed: {}", e),
            },
            Err(e) if e.code().is_retryable() => {
                index.store().abort(txn).await.unwrap();
            }
            Err(e) => panic!("delete failed: {}", e),
        }
    }
    panic!("delete of {} kept conflicting", key);
}

async fn search(
    index: &VectorIndex<InMemoryStore>,
    query: &[f32],
    k: usize,
    options: SearchOptions,
) -> Vec<(PrimaryKey, f32)> {
    let txn = index.store().begin().await.unwrap();
    let mut search_set = SearchSet::new(k);
    index
        .search(&txn, &CancellationToken::new(), query, &mut search_set, options)
        .await
        .unwrap();
    search_set
        .pop_results()
        .into_iter()
        .map(|r| (r.child_key.primary_key().unwrap().clone(), r.query_squared_distance))
        .collect()
}

/// Every partition reachable from the root, parents before children.
async fn walk_tree(index: &VectorIndex<InMemoryStore>) -> Vec<(PartitionKey, Arc<Partition>)> {
    let txn = index.store().begin().await.unwrap();
    let mut partitions = Vec::new();
    let mut queue = std::collections::VecDeque::from([ROOT_KEY]);
    while let Some(key) = queue.pop_front() {
        let partition = txn.get_partition(key).await.unwrap();
        for child in partition.child_keys() {
            if let ChildKey::Partition(child_key) = child {
                let child_partition = txn.get_partition(*child_key).await.unwrap();
                assert_eq!(child_partition.level() + 1, partition.level());
                queue.push_back(*child_key);
            }
        }
        partitions.push((key, partition));
    }
    partitions
}

/// Checks that no partition is over `max` and that only the root is under
/// `min`.
async fn assert_partition_sizes(index: &VectorIndex<InMemoryStore>, min: usize, max: usize) {
    for (key, partition) in walk_tree(index).await {
        assert!(
            partition.count() <= max,
            "partition {} holds {} > {}",
            key,
            partition.count(),
            max
        );
        if key != ROOT_KEY {
            assert!(
                partition.count() >= min,
                "partition {} holds {} < {}",
                key,
                partition.count(),
                min
            );
        }
    }
}

/// Primary keys of all leaves, asserting that none appears twice.
async fn leaf_keys(index: &VectorIndex<InMemoryStore>) -> HashSet<PrimaryKey> {
    let mut keys = HashSet::new();
    for (_, partition) in walk_tree(index).await {
        for child in partition.child_keys() {
            if let ChildKey::Primary(key) = child {
                assert!(keys.insert(key.clone()), "{} is indexed twice", key);
            }
        }
    }
    keys
}

fn random_vectors(rng: &mut StdRng, count: usize, dims: usize) -> Vec<(PrimaryKey, Vec<f32>)> {
    (0..count)
        .map(|i| {
            let vector = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
            (PrimaryKey::from(format!("vec{i:04}")), vector)
        })
        .collect()
}

fn brute_force(vectors: &[(PrimaryKey, Vec<f32>)], query: &[f32], k: usize) -> Vec<PrimaryKey> {
    let mut distances: Vec<(f32, &PrimaryKey)> = vectors
        .iter()
        .map(|(key, vector)| {
            let distance = vector.iter().zip(query).map(|(a, b)| (a - b) * (a - b)).sum();
            (distance, key)
        })
        .collect();
    distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(b.1)));
    distances.into_iter().take(k).map(|(_, key)| key.clone()).collect()
}

#[tokio::test]
async fn test_split_three_vectors() {
    let index = new_index(2, options(1, 2)).await;
    let vectors = [
        (PrimaryKey::from("vec1"), vec![1.0, 2.0]),
        (PrimaryKey::from("vec2"), vec![7.0, 4.0]),
        (PrimaryKey::from("vec3"), vec![4.0, 3.0]),
    ];
    for (key, vector) in &vectors {
        insert(&index, key, vector).await;
    }
    assert_eq!(index.pending_fixups(), 1);
    index.process_fixups().await;
    assert_eq!(index.pending_fixups(), 0);

    let tree = walk_tree(&index).await;
    assert_eq!(tree[0].1.level(), 1);
    assert_eq!(tree[0].1.count(), 2);
    assert_eq!(leaf_keys(&index).await.len(), 3);

    let results = search(&index, &[6.0, 4.0], 3, SearchOptions::default()).await;
    assert_eq!(
        results,
        vec![
            (PrimaryKey::from("vec2"), 1.0),
            (PrimaryKey::from("vec3"), 5.0),
            (PrimaryKey::from("vec1"), 29.0),
        ]
    );
}

#[tokio::test]
async fn test_search_after_root_split() {
    let index = new_index(2, options(1, 2)).await;
    let vectors = [
        (PrimaryKey::from("a"), vec![0.0, 0.0]),
        (PrimaryKey::from("b"), vec![10.0, 10.0]),
        (PrimaryKey::from("c"), vec![10.1, 10.1]),
    ];
    for (key, vector) in &vectors {
        insert(&index, key, vector).await;
    }
    index.process_fixups().await;
    assert_eq!(walk_tree(&index).await[0].1.level(), 1);

    let results = search(&index, &[10.0, 10.0], 1, SearchOptions::default()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, PrimaryKey::from("b"));
    assert!(results[0].1.abs() < 1e-4, "distance {}", results[0].1);

    let options = SearchOptions {
        skip_rerank: true,
        ..Default::default()
    };
    let results = search(&index, &[10.0, 10.0], 1, options).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, PrimaryKey::from("b"));
    assert!(results[0].1.abs() < 0.1, "estimate {}", results[0].1);
}

#[tokio::test]
async fn test_delete_missing_key() {
    let index = new_index(2, options(1, 4)).await;
    insert(&index, &PrimaryKey::from("a"), &[1.0, 1.0]).await;
    let outcome = delete(&index, &PrimaryKey::from("b"), &[1.0, 1.0]).await;
    assert_eq!(outcome, DeleteOutcome::NotFound);
    assert_eq!(leaf_keys(&index).await.len(), 1);
}

#[tokio::test]
async fn test_force_split_replaces_partition() {
    let mut rng = StdRng::seed_from_u64(5);
    let vectors = random_vectors(&mut rng, 12, 4);
    let index = new_index(4, options(2, 16)).await;
    for (key, vector) in &vectors {
        insert(&index, key, vector).await;
    }

    index.force_split(INVALID_KEY, ROOT_KEY);
    index.process_fixups().await;
    let tree = walk_tree(&index).await;
    let root = &tree[0].1;
    assert_eq!(root.level(), 1);
    let children: Vec<PartitionKey> = root
        .child_keys()
        .iter()
        .map(|k| k.partition_key().unwrap())
        .collect();
    assert_eq!(children.len(), 2);
    assert_eq!(tree.len(), 3);

    let split_key = children[0];
    index.force_split(ROOT_KEY, split_key);
    index.process_fixups().await;

    let tree = walk_tree(&index).await;
    let root = &tree[0].1;
    assert_eq!(root.count(), 3);
    assert!(root.find(&ChildKey::Partition(split_key)).is_none());
    assert!(root.find(&ChildKey::Partition(children[1])).is_some());
    let txn = index.store().begin().await.unwrap();
    assert!(matches!(
        txn.get_partition(split_key).await,
        Err(StoreError::PartitionNotFound(_))
    ));

    let expected: HashSet<PrimaryKey> = vectors.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(leaf_keys(&index).await, expected);
    assert_eq!(index.fixup_stats().splits, 2);
}

#[tokio::test]
async fn test_size_invariant_after_fixups() {
    let (min, max) = (2, 8);
    let mut rng = StdRng::seed_from_u64(17);
    let vectors = random_vectors(&mut rng, 100, 8);
    // A wide beam lets deletes find every key among the leaves.
    let options = VectorIndexOptions {
        base_beam_size: 16,
        ..options(min, max)
    };
    let index = new_index(8, options).await;
    for (key, vector) in &vectors {
        insert(&index, key, vector).await;
        index.process_fixups().await;
    }

    assert!(walk_tree(&index).await[0].1.level() >= 1);
    assert_partition_sizes(&index, min, max).await;
    assert_eq!(leaf_keys(&index).await.len(), vectors.len());

    // Deleting half of the vectors triggers merges, which keep every key
    // indexed exactly once.
    for (key, vector) in vectors.iter().step_by(2) {
        assert_eq!(delete(&index, key, vector).await, DeleteOutcome::Deleted);
        index.store().delete_vector(key).await.unwrap();
        index.process_fixups().await;
    }
    let remaining: HashSet<PrimaryKey> = vectors.iter().skip(1).step_by(2).map(|(k, _)| k.clone()).collect();
    assert_eq!(leaf_keys(&index).await, remaining);
    assert_partition_sizes(&index, min, max).await;
    assert!(index.fixup_stats().merges > 0);
}

#[tokio::test]
async fn test_search_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(23);
    let vectors = random_vectors(&mut rng, 100, 8);
    let index = new_index(8, options(2, 8)).await;
    for (key, vector) in &vectors {
        insert(&index, key, vector).await;
    }
    index.process_fixups().await;
    index.suspend_fixups();

    let query: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
    for options in [
        SearchOptions::default(),
        SearchOptions {
            skip_rerank: true,
            ..Default::default()
        },
    ] {
        let first = search(&index, &query, 5, options).await;
        let second = search(&index, &query, 5, options).await;
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_build_with_background_fixups() {
    let (min, max) = (2, 8);
    let options = VectorIndexOptions {
        min_partition_size: min,
        max_partition_size: max,
        base_beam_size: 2,
        quality_samples: 4,
        is_deterministic: true,
        fixup_workers: 2,
        ..Default::default()
    };
    let index = Arc::new(new_index(4, options).await);
    let mut rng = StdRng::seed_from_u64(31);
    let vectors = random_vectors(&mut rng, 200, 4);

    let tasks: Vec<_> = vectors
        .chunks(50)
        .map(|chunk| {
            let index = index.clone();
            let chunk = chunk.to_vec();
            tokio::spawn(async move {
                for (key, vector) in &chunk {
                    insert(&index, key, vector).await;
                }
            })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }
    index.process_fixups().await;

    assert_eq!(index.pending_fixups(), 0);
    assert_partition_sizes(&index, min, max).await;
    let expected: HashSet<PrimaryKey> = vectors.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(leaf_keys(&index).await, expected);
    let stats = index.fixup_stats();
    assert!(stats.splits > 0);
    assert_eq!(stats.dropped, 0);
    index.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_and_deletes_drain() {
    let (min, max) = (2, 6);
    let options = VectorIndexOptions {
        base_beam_size: 8,
        fixup_workers: 3,
        ..options(min, max)
    };
    let index = Arc::new(new_index(4, options).await);
    let mut rng = StdRng::seed_from_u64(37);
    let vectors = random_vectors(&mut rng, 400, 4);

    let tasks: Vec<_> = vectors
        .chunks(50)
        .map(|chunk| {
            let index = index.clone();
            let chunk = chunk.to_vec();
            tokio::spawn(async move {
                for (key, vector) in &chunk {
                    insert(&index, key, vector).await;
                }
                let mut deleted = Vec::new();
                for (key, vector) in chunk.iter().step_by(2) {
                    if delete(&index, key, vector).await == DeleteOutcome::Deleted {
                        deleted.push(key.clone());
                    }
                }
                deleted
            })
        })
        .collect();
    let mut deleted = HashSet::new();
    for result in futures::future::join_all(tasks).await {
        deleted.extend(result.unwrap());
    }
    index.process_fixups().await;

    // Nothing commits once the queue has drained, so a fresh transaction
    // reads a stable tree.
    let txn = index.store().begin().await.unwrap();
    let stats = index.stats(&txn).await.unwrap();
    index.format_stats(&txn).await.unwrap();
    index.store().commit(txn).await.unwrap();
    assert_eq!(stats.fixups.pending, 0);
    assert_eq!(stats.fixups.dropped, 0);

    assert_partition_sizes(&index, min, max).await;
    let keys = leaf_keys(&index).await;
    assert!(keys.is_disjoint(&deleted));
    let inserted: HashSet<PrimaryKey> = vectors.iter().map(|(k, _)| k.clone()).collect();
    assert!(keys.is_subset(&inserted));
    assert_eq!(keys.len() + deleted.len(), inserted.len());
    index.close().await;
}

#[tokio::test]
async fn test_merge_collapses_root() {
    let index = new_index(2, options(2, 4)).await;
    let vectors = [
        (PrimaryKey::from("a"), vec![0.0, 0.0]),
        (PrimaryKey::from("b"), vec![0.0, 1.0]),
        (PrimaryKey::from("c"), vec![10.0, 0.0]),
        (PrimaryKey::from("d"), vec![10.0, 1.0]),
    ];
    for (key, vector) in &vectors {
        insert(&index, key, vector).await;
    }
    index.force_split(INVALID_KEY, ROOT_KEY);
    index.process_fixups().await;
    assert_eq!(walk_tree(&index).await.len(), 3);

    assert_eq!(
        delete(&index, &vectors[0].0, &vectors[0].1).await,
        DeleteOutcome::Deleted
    );
    assert_eq!(index.pending_fixups(), 1);
    index.process_fixups().await;

    let tree = walk_tree(&index).await;
    assert_eq!(tree.len(), 1);
    assert!(tree[0].1.is_leaf());
    assert_eq!(tree[0].1.count(), 3);
    assert_eq!(index.store().partition_count(), 1);
    assert_eq!(index.fixup_stats().merges, 2);
}

#[tokio::test]
async fn test_dangling_vector_is_removed() {
    let index = new_index(2, options(1, 4)).await;
    insert(&index, &PrimaryKey::from("a"), &[1.0, 0.0]).await;
    insert(&index, &PrimaryKey::from("b"), &[0.0, 1.0]).await;
    index.store().delete_vector(&PrimaryKey::from("a")).await.unwrap();

    let results = search(&index, &[1.0, 0.0], 2, SearchOptions::default()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, PrimaryKey::from("b"));
    assert_eq!(index.pending_fixups(), 1);

    index.process_fixups().await;
    let keys = leaf_keys(&index).await;
    assert_eq!(keys, HashSet::from([PrimaryKey::from("b")]));
    assert_eq!(index.fixup_stats().vector_deletes, 1);
}

#[tokio::test]
async fn test_cancelled_operations() {
    let index = new_index(2, options(1, 4)).await;
    insert(&index, &PrimaryKey::from("a"), &[1.0, 0.0]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let txn = index.store().begin().await.unwrap();
    let err = index
        .insert(&txn, &cancel, &[2.0, 0.0], PrimaryKey::from("b"))
        .await
        .unwrap_err();
    assert!(matches!(err, VectorIndexError::Cancelled));
    assert!(!err.should_trace_error());

    let mut search_set = SearchSet::new(1);
    let err = index
        .search(&txn, &cancel, &[1.0, 0.0], &mut search_set, SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VectorIndexError::Cancelled));
    index.store().abort(txn).await.unwrap();
    assert_eq!(leaf_keys(&index).await.len(), 1);
}

#[tokio::test]
async fn test_recall() {
    let dims = 16;
    let mut rng = StdRng::seed_from_u64(101);
    let centers: Vec<Vec<f32>> = (0..10)
        .map(|_| (0..dims).map(|_| rng.gen_range(-5.0..5.0)).collect())
        .collect();
    let vectors: Vec<(PrimaryKey, Vec<f32>)> = (0..500)
        .map(|i| {
            let center = &centers[i % centers.len()];
            let vector = center.iter().map(|c| c + rng.gen_range(-1.0..1.0)).collect();
            (PrimaryKey::from(format!("vec{i:04}")), vector)
        })
        .collect();

    let index = new_index(dims, options(4, 16)).await;
    for (i, (key, vector)) in vectors.iter().enumerate() {
        insert(&index, key, vector).await;
        if i % 10 == 0 {
            index.process_fixups().await;
        }
    }
    index.process_fixups().await;

    let k = 10;
    let mut predicted = Vec::new();
    let mut truth = Vec::new();
    for i in 0..20 {
        let center = &centers[i % centers.len()];
        let query: Vec<f32> = center.iter().map(|c| c + rng.gen_range(-1.0..1.0)).collect();
        let options = SearchOptions {
            base_beam_size: 16,
            ..Default::default()
        };
        let results = search(&index, &query, k, options).await;
        predicted.push(results.into_iter().map(|(key, _)| key).collect::<Vec<_>>());
        truth.push(brute_force(&vectors, &query, k));
    }
    let recall = calculate_recall(&predicted, &truth);
    assert!(recall >= 0.7, "recall {} is too low", recall);
}
