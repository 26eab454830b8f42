use std::{env, io, num::NonZeroUsize, path::PathBuf};

use log::info;

use ddp_trainer::{
    FileSink, Mlp, RendezvousConfig, TcpCollective, TrainingConfig, TrainingSession,
    data::{Dataset, load_dataset},
};

const EPOCHS: NonZeroUsize = NonZeroUsize::new(10).unwrap();
const BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(128).unwrap();
const LEARNING_RATE: f32 = 0.01;
const BASE_SEED: u64 = 42;

fn main() -> io::Result<()> {
    env_logger::init();

    let rank = parse_local_rank()?;
    let rendezvous = RendezvousConfig::from_env()?;
    if rank >= rendezvous.world_size.get() {
        return Err(invalid(format!(
            "--local-rank {rank} is out of range for WORLD_SIZE {}",
            rendezvous.world_size
        )));
    }

    let data_dir = PathBuf::from(env::var("DATA_DIR").map_err(|_| invalid("DATA_DIR is not set"))?);
    let train = load_dataset(&data_dir.join("train.safetensors"))?;
    let validation = load_dataset(&data_dir.join("test.safetensors"))?;
    info!(
        "rank {rank}: loaded {} training and {} validation samples",
        train.len(),
        validation.len()
    );

    let checkpoint_path =
        env::var("CHECKPOINT_PATH").unwrap_or_else(|_| "model.safetensors".to_string());

    let cfg = TrainingConfig {
        epochs: EPOCHS,
        batch_size: BATCH_SIZE,
        learning_rate: LEARNING_RATE,
        base_seed: BASE_SEED,
    };

    // mask seed is rank-salted so dropout differs per worker; the shared
    // base seed alone drives the initial parameters
    let model = Mlp::classifier(BASE_SEED ^ rank as u64);
    let params = model.init_params(BASE_SEED);
    let mut sink = FileSink::new(checkpoint_path, model.schema());

    let collective = TcpCollective::new(rank, &rendezvous)?;
    let mut session = TrainingSession::new(model, collective, cfg, params);
    let metrics = session.run(&train, &validation, &mut sink)?;

    info!(
        "rank {rank}: done; {} epochs, {} steps, {} samples",
        metrics.epochs, metrics.steps, metrics.samples
    );
    Ok(())
}

/// Parses `--local-rank <n>` (or `--local-rank=<n>`) from the launcher.
fn parse_local_rank() -> io::Result<usize> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--local-rank" {
            let value = args
                .next()
                .ok_or_else(|| invalid("--local-rank needs a value"))?;
            return parse_rank(&value);
        }
        if let Some(value) = arg.strip_prefix("--local-rank=") {
            return parse_rank(value);
        }
    }
    Err(invalid("missing required argument --local-rank"))
}

fn parse_rank(value: &str) -> io::Result<usize> {
    value
        .parse::<usize>()
        .map_err(|e| invalid(format!("invalid --local-rank: {e}")))
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}
