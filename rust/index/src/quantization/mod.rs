//! Quantized vector sets and distance estimation.
//!
//! ## Assumptions
//!
//! Data, centroid, and query vectors have been transformed by the same random
//! rotation (see [`crate::randomize`]).
//!
//! ## Notation
//!
//! | Symbol | Description |
//! |--------|-------------|
//! | `c` | Partition centroid |
//! | `r` | Data residual (`d - c`) |
//! | `r_q` | Query residual (`q - c`) |
//! | `n = r / ‖r‖` | Normalized data residual |
//! | `g` | Grid point, `±1/√D` per dimension |
//! | `D` | Dimensions |
//!
//! ## Squared distance estimation
//!
//! ```text
//! ‖d - q‖² = ‖r - r_q‖²
//!          = ‖r‖² + ‖r_q‖² - 2 * ‖r‖ * ⟨n, r_q⟩
//! ⟨n, r_q⟩ ≈ ⟨g, r_q⟩ / ⟨g, n⟩
//! ```
//!
//! The error of the inner product estimate is bounded, with high probability,
//! by
//!
//! ```text
//! ‖r_q‖ * ε₀ * sqrt((1 - ⟨g, n⟩²) / ⟨g, n⟩²) / sqrt(D - 1)
//! ```
//!
//! so the squared distance estimate carries twice that times `‖r‖`.
//!
//! ## Set types
//!
//! | Type | Storage | Error bound |
//! |------|---------|-------------|
//! | [`RaBitQuantizedVectorSet`] | 1 bit per dimension plus two floats | see above |
//! | [`UnQuantizedVectorSet`] | full vectors | always zero |

mod rabitq;
mod unquantized;

pub use rabitq::*;
pub use unquantized::*;

/// Produces quantized vector sets. A set remembers which codec built it, so
/// estimation and mutation dispatch on the set alone.
#[derive(Clone, Debug)]
pub enum Quantizer {
    RaBitQ(RaBitQuantizer),
    UnQuantizer(UnQuantizer),
}

impl Quantizer {
    pub fn rabitq(dims: usize) -> Self {
        Quantizer::RaBitQ(RaBitQuantizer::new(dims))
    }

    pub fn unquantized(dims: usize) -> Self {
        Quantizer::UnQuantizer(UnQuantizer::new(dims))
    }

    pub fn dims(&self) -> usize {
        match self {
            Quantizer::RaBitQ(q) => q.dims(),
            Quantizer::UnQuantizer(q) => q.dims(),
        }
    }

    /// Creates an empty set around `centroid`.
    pub fn new_set(&self, centroid: Vec<f32>) -> QuantizedVectorSet {
        self.quantize::<Vec<f32>>(centroid, &[])
    }

    pub fn quantize<V: AsRef<[f32]>>(&self, centroid: Vec<f32>, vectors: &[V]) -> QuantizedVectorSet {
        match self {
            Quantizer::RaBitQ(q) => QuantizedVectorSet::RaBitQ(q.quantize(centroid, vectors)),
            Quantizer::UnQuantizer(q) => QuantizedVectorSet::UnQuantized(q.quantize(centroid, vectors)),
        }
    }

    /// Writes one squared distance estimate and one error bound per vector in
    /// `set`. Both output slices must be `set.len()` long.
    pub fn estimate_squared_distances(
        &self,
        set: &QuantizedVectorSet,
        query: &[f32],
        distances: &mut [f32],
        error_bounds: &mut [f32],
    ) {
        debug_assert_eq!(self.dims(), query.len());
        set.estimate_squared_distances(query, distances, error_bounds);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QuantizedVectorSet {
    RaBitQ(RaBitQuantizedVectorSet),
    UnQuantized(UnQuantizedVectorSet),
}

impl QuantizedVectorSet {
    pub fn len(&self) -> usize {
        match self {
            QuantizedVectorSet::RaBitQ(set) => set.len(),
            QuantizedVectorSet::UnQuantized(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn centroid(&self) -> &[f32] {
        match self {
            QuantizedVectorSet::RaBitQ(set) => set.centroid(),
            QuantizedVectorSet::UnQuantized(set) => set.centroid(),
        }
    }

    /// Exact distance (not squared) of each vector from the centroid.
    pub fn centroid_distances(&self) -> &[f32] {
        match self {
            QuantizedVectorSet::RaBitQ(set) => set.centroid_distances(),
            QuantizedVectorSet::UnQuantized(set) => set.centroid_distances(),
        }
    }

    pub fn add(&mut self, vector: &[f32]) {
        match self {
            QuantizedVectorSet::RaBitQ(set) => set.add(vector),
            QuantizedVectorSet::UnQuantized(set) => set.add(vector),
        }
    }

    /// Removes the vector at `offset` by moving the last vector into its slot.
    pub fn replace_with_last(&mut self, offset: usize) {
        match self {
            QuantizedVectorSet::RaBitQ(set) => set.replace_with_last(offset),
            QuantizedVectorSet::UnQuantized(set) => set.replace_with_last(offset),
        }
    }

    /// Drops every vector and recenters the set.
    pub fn clear(&mut self, centroid: Vec<f32>) {
        match self {
            QuantizedVectorSet::RaBitQ(set) => set.clear(centroid),
            QuantizedVectorSet::UnQuantized(set) => set.clear(centroid),
        }
    }

    pub fn estimate_squared_distances(
        &self,
        query: &[f32],
        distances: &mut [f32],
        error_bounds: &mut [f32],
    ) {
        match self {
            QuantizedVectorSet::RaBitQ(set) => {
                set.estimate_squared_distances(query, distances, error_bounds)
            }
            QuantizedVectorSet::UnQuantized(set) => {
                set.estimate_squared_distances(query, distances, error_bounds)
            }
        }
    }
}
