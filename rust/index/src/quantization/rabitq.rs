//! 1-bit RaBitQ codes for partition residuals.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use simsimd::SpatialSimilarity;
use vecindex_distance::squared_norm;

/// High probability constant of the RaBitQ error bound.
const ERROR_BOUND_EPSILON: f32 = 1.9;

/// Residuals with a smaller norm are treated as coinciding with the centroid.
const ZERO_NORM: f32 = 1e-10;

/// Per vector header. 8 bytes.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct CodeHeader {
    /// `‖r‖`
    centroid_distance: f32,
    /// `⟨g, n⟩`
    correction: f32,
}

#[derive(Clone, Debug)]
pub struct RaBitQuantizer {
    dims: usize,
}

impl RaBitQuantizer {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn quantize<V: AsRef<[f32]>>(
        &self,
        centroid: Vec<f32>,
        vectors: &[V],
    ) -> RaBitQuantizedVectorSet {
        debug_assert_eq!(centroid.len(), self.dims);
        let mut set = RaBitQuantizedVectorSet::new(centroid);
        for vector in vectors {
            set.add(vector.as_ref());
        }
        set
    }
}

/// Byte layout per vector: `[CodeHeader (8 bytes)][packed sign bits]`.
///
/// One bit per dimension, packed LSB-first. Bit `i` is 1 when the residual
/// `r[i] ≥ 0`, i.e. `g[i] = +1/√D`, and 0 otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct RaBitQuantizedVectorSet {
    centroid: Vec<f32>,
    codes: Vec<u8>,
    // Mirrors the headers so callers can borrow them as a slice.
    centroid_distances: Vec<f32>,
}

impl RaBitQuantizedVectorSet {
    pub fn new(centroid: Vec<f32>) -> Self {
        Self {
            centroid,
            codes: Vec::new(),
            centroid_distances: Vec::new(),
        }
    }

    pub fn packed_len(dims: usize) -> usize {
        dims.div_ceil(8)
    }

    fn stride(&self) -> usize {
        size_of::<CodeHeader>() + Self::packed_len(self.dims())
    }

    pub fn dims(&self) -> usize {
        self.centroid.len()
    }

    pub fn len(&self) -> usize {
        self.centroid_distances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn centroid(&self) -> &[f32] {
        &self.centroid
    }

    pub fn centroid_distances(&self) -> &[f32] {
        &self.centroid_distances
    }

    fn code(&self, offset: usize) -> (CodeHeader, &[u8]) {
        let stride = self.stride();
        let bytes = &self.codes[offset * stride..(offset + 1) * stride];
        let header = bytemuck::pod_read_unaligned::<CodeHeader>(&bytes[..size_of::<CodeHeader>()]);
        (header, &bytes[size_of::<CodeHeader>()..])
    }

    /// Quantizes `vector` relative to the centroid and appends the code.
    pub fn add(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dims());
        let mut packed = vec![0u8; Self::packed_len(self.dims())];
        let mut abs_sum = 0.0f32;
        let mut norm_sq = 0.0f32;
        for (byte_ref, (vec_chunk, cen_chunk)) in packed
            .iter_mut()
            .zip(vector.chunks(8).zip(self.centroid.chunks(8)))
        {
            let mut byte = 0u8;
            for (j, (&v, &c)) in vec_chunk.iter().zip(cen_chunk).enumerate() {
                let r = v - c;
                if r >= 0.0 {
                    byte |= 1 << j;
                }
                abs_sum += r.abs();
                norm_sq += r * r;
            }
            *byte_ref = byte;
        }

        let centroid_distance = norm_sq.sqrt();
        // ⟨g, n⟩ = Σ|r[i]| / (√D · ‖r‖)
        let correction = if centroid_distance > ZERO_NORM {
            abs_sum / ((self.dims() as f32).sqrt() * centroid_distance)
        } else {
            1.0
        };

        let header = CodeHeader {
            centroid_distance,
            correction,
        };
        self.codes.extend_from_slice(bytemuck::bytes_of(&header));
        self.codes.extend_from_slice(&packed);
        self.centroid_distances.push(centroid_distance);
    }

    pub fn replace_with_last(&mut self, offset: usize) {
        let stride = self.stride();
        let last = self.len() - 1;
        if offset != last {
            self.codes
                .copy_within(last * stride..(last + 1) * stride, offset * stride);
        }
        self.codes.truncate(last * stride);
        self.centroid_distances.swap_remove(offset);
    }

    pub fn clear(&mut self, centroid: Vec<f32>) {
        self.centroid = centroid;
        self.codes.clear();
        self.centroid_distances.clear();
    }

    /// Estimates `‖d - q‖²` for every vector `d` in the set along with a
    /// bound on the absolute error of each estimate.
    pub fn estimate_squared_distances(
        &self,
        query: &[f32],
        distances: &mut [f32],
        error_bounds: &mut [f32],
    ) {
        debug_assert_eq!(query.len(), self.dims());
        debug_assert_eq!(distances.len(), self.len());

        let r_q: Vec<f32> = query
            .iter()
            .zip(self.centroid.iter())
            .map(|(q, c)| q - c)
            .collect();
        let r_q_norm_sq = squared_norm(&r_q);
        let r_q_norm = r_q_norm_sq.sqrt();
        let sqrt_dims = (self.dims() as f32).sqrt();
        let bound_scale =
            2.0 * ERROR_BOUND_EPSILON / ((self.dims().max(2) - 1) as f32).sqrt() * r_q_norm;

        for (offset, (distance, bound)) in distances
            .iter_mut()
            .zip(error_bounds.iter_mut())
            .enumerate()
        {
            let (header, packed) = self.code(offset);
            if header.centroid_distance <= ZERO_NORM {
                *distance = r_q_norm_sq;
                *bound = 0.0;
                continue;
            }
            // ⟨g, r_q⟩ = Σ sign[i] · r_q[i] / √D
            let g_dot_r_q = signed_dot(packed, &r_q) / sqrt_dims;
            let n_dot_r_q = g_dot_r_q / header.correction;
            let estimate = header.centroid_distance * header.centroid_distance + r_q_norm_sq
                - 2.0 * header.centroid_distance * n_dot_r_q;
            *distance = estimate.max(0.0);

            let x = header.correction;
            let spread = ((1.0 - x * x).max(0.0) / (x * x)).sqrt();
            *bound = bound_scale * header.centroid_distance * spread;
        }
    }
}

/// Computes `Σ sign(bit[i]) · values[i]` where a set bit means `+1`.
fn signed_dot(packed: &[u8], values: &[f32]) -> f32 {
    const CHUNK: usize = 8; // bytes per outer iteration → 64 floats
    let mut signs = [0.0f32; CHUNK * 8];
    let mut sum = 0.0f32;

    for (packed_chunk, val_chunk) in packed.chunks(CHUNK).zip(values.chunks(CHUNK * 8)) {
        let n = val_chunk.len();
        for (i, &byte) in packed_chunk.iter().enumerate() {
            for bit in 0..8 {
                signs[i * 8 + bit] = if (byte >> bit) & 1 == 1 { 1.0 } else { -1.0 };
            }
        }
        sum += match f32::dot(&signs[..n], val_chunk) {
            Some(dot) => dot as f32,
            None => signs[..n].iter().zip(val_chunk).map(|(s, v)| s * v).sum(),
        };
    }
    sum
}
