use rand::Rng;
use vecindex_distance::{mean, squared_l2_distance};

const MAX_ITERATIONS: usize = 16;

/// Result of splitting a set of vectors in two.
#[derive(Clone, Debug, PartialEq)]
pub struct BalancedSplit {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    pub left_centroid: Vec<f32>,
    pub right_centroid: Vec<f32>,
}

/// Two-means clustering that keeps both sides reasonably large.
///
/// Each side receives at least a third of the vectors and at least
/// `min_size` of them, as long as `min_size` does not exceed half. Points are
/// assigned by how much closer they are to one centroid than to the other, so
/// when a side is too small it takes the points that are least far from it.
pub fn balanced_two_means<R: Rng>(vectors: &[Vec<f32>], min_size: usize, rng: &mut R) -> BalancedSplit {
    let n = vectors.len();
    assert!(n >= 2, "cannot split fewer than two vectors");
    let dims = vectors[0].len();
    let min_side = n.div_ceil(3).max(min_size).min(n / 2);

    // Seed with a random point and the point farthest from it.
    let first = rng.gen_range(0..n);
    let (second, farthest) = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (i, squared_l2_distance(&vectors[first], v)))
        .fold((first, 0.0f32), |best, cur| if cur.1 > best.1 { cur } else { best });

    if farthest == 0.0 {
        // All vectors coincide, any balanced cut is as good as another.
        let left: Vec<usize> = (0..n / 2).collect();
        let right: Vec<usize> = (n / 2..n).collect();
        return BalancedSplit {
            left,
            right,
            left_centroid: vectors[first].clone(),
            right_centroid: vectors[first].clone(),
        };
    }

    let mut left_centroid = vectors[first].clone();
    let mut right_centroid = vectors[second].clone();
    let mut assignment: Vec<bool> = Vec::new();

    for _ in 0..MAX_ITERATIONS {
        let mut order: Vec<(f32, usize)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| {
                (
                    squared_l2_distance(v, &left_centroid) - squared_l2_distance(v, &right_centroid),
                    i,
                )
            })
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let left_count = order
            .iter()
            .filter(|(diff, _)| *diff < 0.0)
            .count()
            .clamp(min_side, n - min_side);

        let mut next = vec![false; n];
        for (_, i) in &order[..left_count] {
            next[*i] = true;
        }
        if next == assignment {
            break;
        }
        assignment = next;

        mean(
            (0..n).filter(|i| assignment[*i]).map(|i| vectors[i].as_slice()),
            &mut left_centroid,
        );
        mean(
            (0..n).filter(|i| !assignment[*i]).map(|i| vectors[i].as_slice()),
            &mut right_centroid,
        );
    }

    debug_assert_eq!(left_centroid.len(), dims);
    let (left, right): (Vec<usize>, Vec<usize>) = (0..n).partition(|i| assignment[*i]);
    BalancedSplit {
        left,
        right,
        left_centroid,
        right_centroid,
    }
}
