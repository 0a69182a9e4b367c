use vecindex_distance::squared_l2_distance;

/// Keeps full vectors and computes exact distances. Used where the vectors are
/// few and visited by every search, such as the root partition.
#[derive(Clone, Debug)]
pub struct UnQuantizer {
    dims: usize,
}

impl UnQuantizer {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn quantize<V: AsRef<[f32]>>(&self, centroid: Vec<f32>, vectors: &[V]) -> UnQuantizedVectorSet {
        debug_assert_eq!(centroid.len(), self.dims);
        let mut set = UnQuantizedVectorSet::new(centroid);
        for vector in vectors {
            set.add(vector.as_ref());
        }
        set
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnQuantizedVectorSet {
    centroid: Vec<f32>,
    // Row major, `centroid.len()` floats per vector.
    vectors: Vec<f32>,
    centroid_distances: Vec<f32>,
}

impl UnQuantizedVectorSet {
    pub fn new(centroid: Vec<f32>) -> Self {
        Self {
            centroid,
            vectors: Vec::new(),
            centroid_distances: Vec::new(),
        }
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

    pub fn vector(&self, offset: usize) -> &[f32] {
        let dims = self.dims();
        &self.vectors[offset * dims..(offset + 1) * dims]
    }

    pub fn add(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dims());
        self.vectors.extend_from_slice(vector);
        self.centroid_distances
            .push(squared_l2_distance(vector, &self.centroid).sqrt());
    }

    pub fn replace_with_last(&mut self, offset: usize) {
        let dims = self.dims();
        let last = self.len() - 1;
        if offset != last {
            self.vectors
                .copy_within(last * dims..(last + 1) * dims, offset * dims);
        }
        self.vectors.truncate(last * dims);
        self.centroid_distances.swap_remove(offset);
    }

    pub fn clear(&mut self, centroid: Vec<f32>) {
        self.centroid = centroid;
        self.vectors.clear();
        self.centroid_distances.clear();
    }

    pub fn estimate_squared_distances(
        &self,
        query: &[f32],
        distances: &mut [f32],
        error_bounds: &mut [f32],
    ) {
        debug_assert_eq!(distances.len(), self.len());
        for (offset, (distance, bound)) in distances.iter_mut().zip(error_bounds.iter_mut()).enumerate() {
            *distance = squared_l2_distance(self.vector(offset), query);
            *bound = 0.0;
        }
    }
}
