use std::{env, io, net::SocketAddr, num::NonZeroUsize, time::Duration};

/// Immutable hyper-parameters for one training run.
#[derive(Debug, Clone, Copy)]
pub struct TrainingConfig {
    pub epochs: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub learning_rate: f32,
    /// Seed shared by every worker; the per-epoch partition and the initial
    /// parameters are both derived from it, so replicas agree without
    /// communication.
    pub base_seed: u64,
}

impl TrainingConfig {
    /// # Panics
    /// If `learning_rate` is not a positive finite number.
    pub fn validate(&self) {
        assert!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be positive and finite"
        );
    }
}

/// Group rendezvous parameters, supplied by the launcher's environment.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub world_size: NonZeroUsize,
    /// Address the rank-0 coordinator binds and every other rank dials.
    pub addr: SocketAddr,
    pub join_timeout: Duration,
    pub sync_timeout: Duration,
}

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

impl RendezvousConfig {
    /// Reads `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT` from the
    /// environment (the launcher contract).
    ///
    /// # Returns
    /// The rendezvous configuration, or an io error if a variable is missing
    /// or malformed.
    pub fn from_env() -> io::Result<Self> {
        let world_size = env::var("WORLD_SIZE")
            .map_err(|_| invalid("WORLD_SIZE is not set"))?
            .parse::<NonZeroUsize>()
            .map_err(|e| invalid(format!("invalid WORLD_SIZE: {e}")))?;

        let host = env::var("MASTER_ADDR").map_err(|_| invalid("MASTER_ADDR is not set"))?;
        let port = env::var("MASTER_PORT").map_err(|_| invalid("MASTER_PORT is not set"))?;
        let addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("invalid rendezvous address: {e}")))?;

        Ok(Self {
            world_size,
            addr,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        })
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}
