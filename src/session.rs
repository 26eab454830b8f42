use log::{debug, info};

use crate::checkpoint::CheckpointSink;
use crate::collective::Collective;
use crate::config::TrainingConfig;
use crate::data::{DataLoader, Dataset, derive_partition, shuffled_indices, validation_seed};
use crate::error::{Result, TrainError};
use crate::metrics::{EpochMetrics, SessionMetrics};
use crate::model::TrainStep;
use crate::optimizer::Sgd;

/// One worker's end-to-end training run.
///
/// Owns the full replica state (parameters, gradient buffer, optimizer) and
/// drives the lockstep schedule: join the group, then per epoch train over
/// this rank's partition with a gradient all-reduce after every batch,
/// validate locally, and finally have rank 0 persist the parameters.
///
/// Both capabilities are injected: `TrainStep` supplies the differentiation
/// and `Collective` the group synchronization, so the loop is testable with
/// synthetic gradients and an in-process group.
pub struct TrainingSession<S: TrainStep, C: Collective> {
    step: S,
    collective: C,
    optimizer: Sgd,
    cfg: TrainingConfig,
    params: Vec<f32>,
    grads: Vec<f32>,
    metrics: SessionMetrics,
}

impl<S: TrainStep, C: Collective> TrainingSession<S, C> {
    /// # Panics
    /// - if the config fails validation
    /// - if `params` does not match the step's parameter count
    pub fn new(step: S, collective: C, cfg: TrainingConfig, params: Vec<f32>) -> Self {
        cfg.validate();
        assert_eq!(
            params.len(),
            step.num_params(),
            "parameter buffer does not match the model"
        );

        let grads = vec![0.0; params.len()];
        Self {
            step,
            collective,
            optimizer: Sgd::new(cfg.learning_rate),
            cfg,
            params,
            grads,
            metrics: SessionMetrics::default(),
        }
    }

    /// The current replica parameters.
    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Runs the whole session to completion.
    ///
    /// # Errors
    /// Fatal, no retries: `JoinTimeout` or `SyncStall` from the collective,
    /// `NumericDivergence` when a loss stops being finite, `Checkpoint` when
    /// the final persist fails, and `Data`/`Shape` for malformed inputs.
    pub fn run<D: Dataset>(
        &mut self,
        train: &D,
        validation: &D,
        sink: &mut dyn CheckpointSink,
    ) -> Result<SessionMetrics> {
        let rank = self.collective.rank();
        let world_size = self.collective.world_size();

        info!("rank {rank}: joining group of {world_size}");
        self.collective.join()?;
        info!("rank {rank}: group complete, starting training");

        for epoch in 0..self.cfg.epochs.get() {
            let train_loss_sum = self.train_epoch(train, epoch)?;
            let val_loss_sum = self.validate_epoch(validation, epoch)?;

            info!(
                "rank {rank}: epoch={epoch} train_loss={train_loss_sum:.4} val_loss={val_loss_sum:.4}"
            );
            self.metrics.push_epoch(EpochMetrics {
                epoch,
                train_loss_sum,
                val_loss_sum,
            });
        }

        if rank == 0 {
            info!("rank 0: persisting final parameters");
            sink.persist(&self.params).map_err(TrainError::Checkpoint)?;
        }
        // nobody exits before the checkpoint is durable
        self.collective.barrier()?;
        info!("rank {rank}: finished after {} steps", self.metrics.steps);

        Ok(self.metrics.clone())
    }

    /// One synchronized pass over this rank's partition of `train`.
    fn train_epoch<D: Dataset>(&mut self, train: &D, epoch: usize) -> Result<f32> {
        let partition = derive_partition(
            train.len(),
            self.collective.rank(),
            self.collective.world_size(),
            self.cfg.base_seed,
            epoch,
        );
        let mut loader = DataLoader::new(train, partition, self.cfg.batch_size.get());
        debug!(rank = self.collective.rank(), epoch = epoch; "{} training batches", loader.num_batches());

        let mut loss_sum = 0.0;
        while let Some(batch) = loader.next_batch()? {
            let loss = self.step.train_batch(&self.params, &batch, &mut self.grads)?;
            self.check_finite(loss, epoch)?;
            loss_sum += loss / batch.len() as f32;

            self.collective.all_reduce_average(&mut self.grads)?;
            self.optimizer.update_params(&self.grads, &mut self.params)?;

            self.metrics.bump_step();
            self.metrics.add_samples(batch.len());
        }

        Ok(loss_sum)
    }

    /// One local pass over the full validation set; no synchronization.
    fn validate_epoch<D: Dataset>(&mut self, validation: &D, epoch: usize) -> Result<f32> {
        let order = shuffled_indices(
            validation.len(),
            validation_seed(self.cfg.base_seed, self.collective.rank(), epoch),
        );
        let mut loader = DataLoader::new(validation, order, self.cfg.batch_size.get());

        let mut loss_sum = 0.0;
        while let Some(batch) = loader.next_batch()? {
            let loss = self.step.eval_batch(&self.params, &batch)?;
            self.check_finite(loss, epoch)?;
            loss_sum += loss / batch.len() as f32;
        }

        Ok(loss_sum)
    }

    fn check_finite(&self, loss: f32, epoch: usize) -> Result<()> {
        if loss.is_finite() {
            Ok(())
        } else {
            Err(TrainError::NumericDivergence {
                epoch,
                step: self.metrics.steps,
                loss,
            })
        }
    }
}
