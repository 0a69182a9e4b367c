use simsimd::SpatialSimilarity;

pub fn squared_l2_distance_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    for i in 0..a.len() {
        sum += (a[i] - b[i]).powi(2);
    }
    sum
}

pub fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Squared euclidean distance between `a` and `b`.
///
/// Dispatches to simsimd when the target supports it and falls back to the
/// scalar loop otherwise.
pub fn squared_l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match f32::l2sq(a, b) {
        Some(distance) => distance as f32,
        None => squared_l2_distance_scalar(a, b),
    }
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match f32::dot(a, b) {
        Some(dot) => dot as f32,
        None => dot_product_scalar(a, b),
    }
}

pub fn squared_norm(v: &[f32]) -> f32 {
    dot_product(v, v)
}

pub fn norm(v: &[f32]) -> f32 {
    squared_norm(v).sqrt()
}

/// Writes the element-wise mean of `vectors` into `out`. `out` is zeroed when
/// there are no vectors.
pub fn mean<'a, I>(vectors: I, out: &mut [f32])
where
    I: IntoIterator<Item = &'a [f32]>,
{
    out.fill(0.0);
    let mut count = 0usize;
    for vector in vectors {
        for (o, v) in out.iter_mut().zip(vector) {
            *o += v;
        }
        count += 1;
    }
    if count > 0 {
        let scale = 1.0 / count as f32;
        out.iter_mut().for_each(|o| *o *= scale);
    }
}
