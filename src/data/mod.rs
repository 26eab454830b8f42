pub mod dataset;
pub mod loader;
pub mod partition;
pub mod source;

pub use dataset::{Batch, DataError, Dataset, InMemoryDataset};
pub use loader::DataLoader;
pub use partition::{derive_partition, epoch_seed, shuffled_indices, validation_seed};
pub use source::load_dataset;
