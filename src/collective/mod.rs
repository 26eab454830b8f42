mod local;
mod tcp;

pub use local::{LocalCollective, LocalGroup};
pub use tcp::TcpCollective;

use crate::error::Result;

/// Group coordination capability used by the training session.
///
/// All three operations are blocking, synchronous barriers from the caller's
/// perspective. The contract the session relies on: `all_reduce_average` for
/// step *n* completes only after every worker contributed its step-*n*
/// gradient, and before any worker applies its step-*n* optimizer update.
pub trait Collective {
    /// This worker's rank in `[0, world_size)`.
    fn rank(&self) -> usize;

    /// Number of cooperating workers.
    fn world_size(&self) -> usize;

    /// Registers into the group; blocks until all workers joined.
    ///
    /// # Errors
    /// `TrainError::JoinTimeout` if the group does not fully rendezvous
    /// within the configured window. An inconsistent launch is unrecoverable
    /// without a restart.
    fn join(&mut self) -> Result<()>;

    /// Replaces `buf` on every worker with the element-wise mean of all
    /// workers' buffers.
    ///
    /// # Errors
    /// `TrainError::SyncStall` if any peer fails to reach this point within
    /// the configured window; continuing with a partial set would corrupt
    /// the shared-parameter invariant, so the whole group aborts.
    fn all_reduce_average(&mut self, buf: &mut [f32]) -> Result<()>;

    /// Blocks until every worker reaches this point.
    ///
    /// # Errors
    /// `TrainError::SyncStall` on timeout.
    fn barrier(&mut self) -> Result<()>;
}
