use std::{error::Error, fmt, io, time::Duration};

use crate::data::DataError;

/// The crate's result type.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Training runtime failures.
///
/// Every variant is fatal to the whole worker group: a desynchronized group
/// cannot be recovered without re-establishing parameter replica consistency,
/// which this design does not attempt.
#[derive(Debug)]
pub enum TrainError {
    Io(io::Error),
    /// The worker group did not fully rendezvous within the configured window.
    JoinTimeout {
        waited: Duration,
    },
    /// A collective operation was not reached by all workers in time.
    SyncStall {
        op: &'static str,
        waited: Duration,
    },
    /// A loss value became non-finite.
    NumericDivergence {
        epoch: usize,
        step: u64,
        loss: f32,
    },
    /// The designated worker failed to persist the final parameters.
    Checkpoint(io::Error),
    /// A buffer or tensor length invariant was violated.
    Shape {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Data(DataError),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Io(e) => write!(f, "io error: {e}"),
            TrainError::JoinTimeout { waited } => {
                write!(f, "worker group did not rendezvous within {waited:?}")
            }
            TrainError::SyncStall { op, waited } => {
                write!(f, "{op} was not reached by all workers within {waited:?}")
            }
            TrainError::NumericDivergence { epoch, step, loss } => {
                write!(f, "non-finite loss {loss} at epoch {epoch}, step {step}")
            }
            TrainError::Checkpoint(e) => write!(f, "checkpoint write failed: {e}"),
            TrainError::Shape {
                what,
                got,
                expected,
            } => write!(f, "length mismatch for {what}: got {got}, expected {expected}"),
            TrainError::Data(e) => write!(f, "dataset error: {e}"),
        }
    }
}

impl Error for TrainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainError::Io(e) | TrainError::Checkpoint(e) => Some(e),
            TrainError::Data(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<DataError> for TrainError {
    fn from(value: DataError) -> Self {
        Self::Data(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainError> for io::Error {
    fn from(value: TrainError) -> Self {
        match value {
            TrainError::Io(e) => e,
            other @ (TrainError::JoinTimeout { .. } | TrainError::SyncStall { .. }) => {
                io::Error::new(io::ErrorKind::TimedOut, other)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
