use criterion::{criterion_group, criterion_main, Criterion};
use vecindex_distance::{squared_l2_distance, squared_l2_distance_scalar};

fn random_vector(dims: usize) -> Vec<f32> {
    (0..dims).map(|_| rand::random()).collect()
}

fn distance_metrics(c: &mut Criterion) {
    let x = random_vector(768);
    let y = random_vector(768);
    c.bench_function("squared_l2_distance", |b| {
        b.iter(|| std::hint::black_box(squared_l2_distance(&x, &y)));
    });
    c.bench_function("squared_l2_distance_scalar", |b| {
        b.iter(|| std::hint::black_box(squared_l2_distance_scalar(&x, &y)));
    });
}

criterion_group!(benches, distance_metrics,);
criterion_main!(benches);
