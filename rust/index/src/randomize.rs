use faer::{
    col::ColRef,
    stats::{
        prelude::{Distribution, SeedableRng, StandardNormal, StdRng},
        UnitaryMat,
    },
    Mat,
};

use crate::config::RandomizeKind;

/// Applies a fixed random orthogonal rotation to vectors before they are
/// quantized. The rotation spreads the energy of skewed inputs evenly across
/// dimensions, which keeps the sign codes informative. Distances and norms are
/// preserved exactly, up to float rounding.
#[derive(Clone, Debug)]
pub struct RandomOrthoTransformer {
    dims: usize,
    // None means identity.
    rotation: Option<Mat<f32>>,
}

impl RandomOrthoTransformer {
    /// Samples a Haar random orthogonal matrix. The same `(dims, seed)` always
    /// yields the same rotation.
    pub fn new(dims: usize, seed: u64) -> Self {
        let dist = UnitaryMat {
            dim: dims,
            standard_normal: StandardNormal,
        };
        let rotation = dist.sample(&mut StdRng::seed_from_u64(seed));
        Self {
            dims,
            rotation: Some(rotation),
        }
    }

    pub fn identity(dims: usize) -> Self {
        Self {
            dims,
            rotation: None,
        }
    }

    pub fn from_kind(kind: RandomizeKind, dims: usize, seed: u64) -> Self {
        match kind {
            RandomizeKind::Orthogonal => Self::new(dims, seed),
            RandomizeKind::None => Self::identity(dims),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn randomize(&self, vector: &[f32]) -> Vec<f32> {
        match &self.rotation {
            Some(rotation) => {
                let rotated = rotation * ColRef::from_slice(vector);
                rotated.iter().copied().collect()
            }
            None => vector.to_vec(),
        }
    }

    /// Inverse of [`Self::randomize`]. The rotation is orthogonal, so its
    /// transpose undoes it.
    pub fn unrandomize(&self, vector: &[f32]) -> Vec<f32> {
        match &self.rotation {
            Some(rotation) => {
                let restored = rotation.transpose() * ColRef::from_slice(vector);
                restored.iter().copied().collect()
            }
            None => vector.to_vec(),
        }
    }
}
