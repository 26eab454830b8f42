//! Synchronous data-parallel training of a small image classifier.
//!
//! Every worker holds a full parameter replica, trains on a deterministic
//! per-epoch slice of the dataset, and averages gradients across the group
//! after every batch, so all replicas stay bitwise identical. Rank 0 writes
//! the final checkpoint.

pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod session;

pub use checkpoint::{CheckpointSink, FileSink};
pub use collective::{Collective, LocalCollective, LocalGroup, TcpCollective};
pub use config::{RendezvousConfig, TrainingConfig};
pub use error::{Result, TrainError};
pub use metrics::{EpochMetrics, SessionMetrics};
pub use model::{Mlp, TrainStep};
pub use optimizer::Sgd;
pub use session::TrainingSession;
