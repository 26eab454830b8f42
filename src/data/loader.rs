use ndarray::Array2;

use super::dataset::{Batch, DataError, Dataset};

/// Materializes fixed-size batches from an ordered index sequence.
///
/// The index sequence is a worker's epoch partition for training, or the
/// locally shuffled full range for validation. Indices are scattered after
/// shuffling, so batches gather rows into an owned `Batch`.
#[derive(Debug)]
pub struct DataLoader<'a, D: Dataset> {
    dataset: &'a D,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<'a, D: Dataset> DataLoader<'a, D> {
    /// # Panics
    /// If `batch_size` is zero.
    pub fn new(dataset: &'a D, indices: Vec<usize>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        Self {
            dataset,
            indices,
            batch_size,
            cursor: 0,
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Number of batches one full pass will produce.
    #[inline]
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Returns the next batch, or `None` when the sequence is exhausted.
    ///
    /// # Errors
    /// Propagates `DataError` from the underlying dataset.
    pub fn next_batch(&mut self) -> Result<Option<Batch>, DataError> {
        if self.cursor >= self.indices.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let rows = end - self.cursor;
        let width = self.dataset.feature_len();

        let mut xs = Vec::with_capacity(rows * width);
        let mut ys = Vec::with_capacity(rows);
        for &index in &self.indices[self.cursor..end] {
            let (features, label) = self.dataset.get(index)?;
            xs.extend_from_slice(features);
            ys.push(label);
        }
        self.cursor = end;

        let xs = Array2::from_shape_vec((rows, width), xs)
            .map_err(|_| DataError::Malformed("gathered batch has inconsistent row width"))?;

        Ok(Some(Batch::new(xs, ys)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::InMemoryDataset;

    fn toy_dataset() -> InMemoryDataset {
        // 5 samples, 2 features each: sample i is [i, i + 10] with label i
        let features = (0..5).flat_map(|i| [i as f32, i as f32 + 10.0]).collect();
        InMemoryDataset::new(features, (0..5).collect(), 2)
    }

    #[test]
    fn batches_follow_index_order() {
        let ds = toy_dataset();
        let mut loader = DataLoader::new(&ds, vec![3, 1, 4, 0, 2], 2);
        assert_eq!(loader.num_batches(), 3);

        let b1 = loader.next_batch().unwrap().unwrap();
        assert_eq!(b1.len(), 2);
        assert_eq!(b1.ys, vec![3, 1]);
        assert_eq!(b1.xs.row(0).to_vec(), vec![3.0, 13.0]);
        assert_eq!(b1.xs.row(1).to_vec(), vec![1.0, 11.0]);

        let b2 = loader.next_batch().unwrap().unwrap();
        assert_eq!(b2.ys, vec![4, 0]);

        // trailing short batch
        let b3 = loader.next_batch().unwrap().unwrap();
        assert_eq!(b3.ys, vec![2]);

        assert!(loader.next_batch().unwrap().is_none());

        loader.reset();
        let again = loader.next_batch().unwrap().unwrap();
        assert_eq!(again.ys, vec![3, 1]);
    }

    #[test]
    fn out_of_bounds_index_is_an_error() {
        let ds = toy_dataset();
        let mut loader = DataLoader::new(&ds, vec![99], 1);
        assert!(loader.next_batch().is_err());
    }
}
