use std::{
    io,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use ddp_trainer::{
    CheckpointSink, LocalGroup, Mlp, TrainError, TrainStep, TrainingConfig, TrainingSession,
    data::{Batch, InMemoryDataset},
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

fn config(epochs: usize, batch_size: usize, learning_rate: f32) -> TrainingConfig {
    TrainingConfig {
        epochs: nz(epochs),
        batch_size: nz(batch_size),
        learning_rate,
        base_seed: 42,
    }
}

/// Synthetic differentiation: constant gradient, constant loss.
struct FixedGradStep {
    num_params: usize,
    grad: f32,
    loss: f32,
}

impl TrainStep for FixedGradStep {
    fn num_params(&self) -> usize {
        self.num_params
    }

    fn train_batch(&mut self, _weights: &[f32], _batch: &Batch, grads: &mut [f32]) -> Result<f32, TrainError> {
        grads.fill(self.grad);
        Ok(self.loss)
    }

    fn eval_batch(&mut self, _weights: &[f32], _batch: &Batch) -> Result<f32, TrainError> {
        Ok(self.loss)
    }
}

/// Counts persists instead of writing anything.
#[derive(Clone, Default)]
struct CountingSink {
    persists: Arc<AtomicUsize>,
}

impl CheckpointSink for CountingSink {
    fn persist(&mut self, _params: &[f32]) -> io::Result<()> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Always fails, as if the checkpoint volume were gone.
struct FailingSink;

impl CheckpointSink for FailingSink {
    fn persist(&mut self, _params: &[f32]) -> io::Result<()> {
        Err(io::Error::other("checkpoint volume unavailable"))
    }
}

/// 4 one-feature samples with labels 0/1.
fn tiny_dataset() -> InMemoryDataset {
    InMemoryDataset::new(vec![0.0, 1.0, 2.0, 3.0], vec![0, 1, 0, 1], 1)
}

#[test]
fn update_uses_the_group_averaged_gradient() {
    // rank r contributes a constant gradient of r + 1; with two workers the
    // average is 1.5, so one step moves every parameter by -lr * 1.5
    let group = LocalGroup::new(nz(2), TIMEOUT, TIMEOUT);
    let data = tiny_dataset();

    let mut handles = Vec::new();
    for rank in 0..2 {
        let collective = group.handle(rank);
        let data = data.clone();
        handles.push(thread::spawn(move || {
            let step = FixedGradStep {
                num_params: 2,
                grad: (rank + 1) as f32,
                loss: 1.0,
            };
            let mut session =
                TrainingSession::new(step, collective, config(1, 4, 0.01), vec![1.0, 2.0]);
            let mut sink = CountingSink::default();
            session.run(&data, &data, &mut sink).unwrap();
            session.params().to_vec()
        }));
    }

    // one batch per epoch (partition of 2 samples, batch size 4)
    let expected = vec![1.0 - 0.01 * 1.5, 2.0 - 0.01 * 1.5];
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn replicas_stay_bitwise_identical_with_dropout() {
    // real model, per-rank dropout masks; the averaged gradient keeps every
    // replica exactly in sync anyway
    let group = LocalGroup::new(nz(2), TIMEOUT, TIMEOUT);

    let features: Vec<f32> = (0..8 * 4).map(|i| (i % 7) as f32 / 7.0).collect();
    let labels: Vec<u8> = (0..8).map(|i| (i % 3) as u8).collect();
    let data = InMemoryDataset::new(features, labels, 4);

    let mut handles = Vec::new();
    for rank in 0..2 {
        let collective = group.handle(rank);
        let data = data.clone();
        handles.push(thread::spawn(move || {
            let model = Mlp::new(&[4, 8, 3], true, 0.2, 42 ^ rank as u64);
            let params = model.init_params(42);
            let mut session = TrainingSession::new(model, collective, config(2, 2, 0.1), params);
            let mut sink = CountingSink::default();
            session.run(&data, &data, &mut sink).unwrap();
            session.params().to_vec()
        }));
    }

    let first = handles.remove(0).join().unwrap();
    let second = handles.remove(0).join().unwrap();
    assert_eq!(first, second);

    let initial = Mlp::new(&[4, 8, 3], true, 0.2, 0).init_params(42);
    assert_ne!(first, initial, "training must move the parameters");
}

#[test]
fn only_rank_zero_persists_the_checkpoint() {
    let group = LocalGroup::new(nz(3), TIMEOUT, TIMEOUT);
    let data = tiny_dataset();

    let mut handles = Vec::new();
    for rank in 0..3 {
        let collective = group.handle(rank);
        let data = data.clone();
        handles.push(thread::spawn(move || {
            let step = FixedGradStep {
                num_params: 1,
                grad: 0.0,
                loss: 1.0,
            };
            let mut session =
                TrainingSession::new(step, collective, config(1, 4, 0.01), vec![0.0]);
            let sink = CountingSink::default();
            let mut writer = sink.clone();
            session.run(&data, &data, &mut writer).unwrap();
            (rank, sink.persists.load(Ordering::SeqCst))
        }));
    }

    for handle in handles {
        let (rank, persists) = handle.join().unwrap();
        assert_eq!(persists, usize::from(rank == 0), "rank {rank}");
    }
}

#[test]
fn epoch_loss_sums_mean_loss_over_batch_length() {
    // 4 samples at batch size 2 -> two batches of mean loss 1.0 each, and
    // every term is divided by the batch length once more before summing:
    // 1.0/2 + 1.0/2 = 1.0
    let group = LocalGroup::new(nz(1), TIMEOUT, TIMEOUT);
    let data = tiny_dataset();

    let step = FixedGradStep {
        num_params: 1,
        grad: 0.0,
        loss: 1.0,
    };
    let mut session =
        TrainingSession::new(step, group.handle(0), config(1, 2, 0.01), vec![0.0]);
    let mut sink = CountingSink::default();

    let metrics = session.run(&data, &data, &mut sink).unwrap();
    let epoch = &metrics.history[0];
    assert!((epoch.train_loss_sum - 1.0).abs() < 1e-6, "{epoch:?}");
    assert!((epoch.val_loss_sum - 1.0).abs() < 1e-6, "{epoch:?}");
}

#[test]
fn failed_checkpoint_write_fails_the_whole_group() {
    // rank 0's persist fails before the final barrier, so rank 1 stalls out
    // of that barrier instead of reporting success
    let group = LocalGroup::new(nz(2), TIMEOUT, Duration::from_millis(300));
    let data = tiny_dataset();

    let mut handles = Vec::new();
    for rank in 0..2 {
        let collective = group.handle(rank);
        let data = data.clone();
        handles.push(thread::spawn(move || {
            let step = FixedGradStep {
                num_params: 1,
                grad: 0.0,
                loss: 1.0,
            };
            let mut session =
                TrainingSession::new(step, collective, config(1, 4, 0.01), vec![0.0]);
            if rank == 0 {
                session.run(&data, &data, &mut FailingSink).unwrap_err()
            } else {
                let mut sink = CountingSink::default();
                session.run(&data, &data, &mut sink).unwrap_err()
            }
        }));
    }

    let writer_err = handles.remove(0).join().unwrap();
    assert!(matches!(writer_err, TrainError::Checkpoint(_)), "{writer_err}");

    let peer_err = handles.remove(0).join().unwrap();
    assert!(matches!(peer_err, TrainError::SyncStall { .. }), "{peer_err}");
}

#[test]
fn missing_worker_fails_the_join() {
    let group = LocalGroup::new(nz(2), Duration::from_millis(100), TIMEOUT);
    let data = tiny_dataset();

    let step = FixedGradStep {
        num_params: 1,
        grad: 0.0,
        loss: 1.0,
    };
    let mut session =
        TrainingSession::new(step, group.handle(0), config(1, 4, 0.01), vec![0.0]);
    let mut sink = CountingSink::default();

    let err = session.run(&data, &data, &mut sink).unwrap_err();
    assert!(matches!(err, TrainError::JoinTimeout { .. }), "{err}");
    assert_eq!(sink.persists.load(Ordering::SeqCst), 0);
}

#[test]
fn non_finite_loss_aborts_the_run() {
    let group = LocalGroup::new(nz(1), TIMEOUT, TIMEOUT);
    let data = tiny_dataset();

    let step = FixedGradStep {
        num_params: 1,
        grad: 0.0,
        loss: f32::NAN,
    };
    let mut session =
        TrainingSession::new(step, group.handle(0), config(3, 4, 0.01), vec![0.0]);
    let mut sink = CountingSink::default();

    let err = session.run(&data, &data, &mut sink).unwrap_err();
    assert!(
        matches!(err, TrainError::NumericDivergence { epoch: 0, .. }),
        "{err}"
    );
    assert_eq!(sink.persists.load(Ordering::SeqCst), 0);
}
