use std::fmt;

use ndarray::Array2;

/// Errors produced while accessing dataset samples.
#[derive(Debug)]
pub enum DataError {
    /// The requested sample index is out of bounds.
    OutOfBounds { index: usize, len: usize },

    /// The dataset source could not provide valid samples.
    Malformed(&'static str),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::OutOfBounds { index, len } => {
                write!(f, "sample index {index} is out of bounds for {len} samples")
            }
            DataError::Malformed(msg) => write!(f, "malformed dataset: {msg}"),
        }
    }
}

impl std::error::Error for DataError {}

/// A collection of supervised samples.
///
/// A `Dataset` is responsible only for *providing access* to samples; how
/// they are partitioned, batched or consumed is up to the training loop.
pub trait Dataset: Sync {
    /// Total number of samples.
    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattened input width of every sample.
    fn feature_len(&self) -> usize;

    /// Fetches the sample at `index` as `(features, class label)`.
    ///
    /// # Errors
    /// Returns `DataError::OutOfBounds` if `index` is invalid.
    fn get(&self, index: usize) -> Result<(&[f32], usize), DataError>;
}

/// A minimal in-memory dataset: flat row-major features plus class labels.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    features: Vec<f32>,
    labels: Vec<u8>,
    feature_len: usize,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Panics
    /// - if `features.len() != labels.len() * feature_len`
    /// - if `labels` is empty or `feature_len` is zero
    pub fn new(features: Vec<f32>, labels: Vec<u8>, feature_len: usize) -> Self {
        assert!(feature_len > 0, "feature_len must be > 0");
        assert!(!labels.is_empty(), "dataset must be non-empty");
        assert_eq!(
            features.len(),
            labels.len() * feature_len,
            "features must hold feature_len floats per label"
        );

        Self {
            features,
            labels,
            feature_len,
        }
    }
}

impl Dataset for InMemoryDataset {
    #[inline]
    fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    fn feature_len(&self) -> usize {
        self.feature_len
    }

    fn get(&self, index: usize) -> Result<(&[f32], usize), DataError> {
        if index >= self.labels.len() {
            return Err(DataError::OutOfBounds {
                index,
                len: self.labels.len(),
            });
        }

        let start = index * self.feature_len;
        let features = &self.features[start..start + self.feature_len];
        Ok((features, self.labels[index] as usize))
    }
}

/// An owned batch of training data: one row per sample.
#[derive(Debug, Clone)]
pub struct Batch {
    pub xs: Array2<f32>,
    pub ys: Vec<usize>,
}

impl Batch {
    /// # Panics
    /// - if `xs.nrows() != ys.len()`
    /// - if the batch is empty
    pub fn new(xs: Array2<f32>, ys: Vec<usize>) -> Self {
        assert_eq!(xs.nrows(), ys.len(), "xs and ys must have the same length");
        assert!(!ys.is_empty(), "batch must be non-empty");
        Self { xs, ys }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ys.is_empty()
    }
}
