/// Per-epoch loss record.
///
/// Each term is the mean batch loss divided once more by the batch length,
/// summed over batches and never normalized by the batch count; the sums
/// are comparable across epochs of the same run but scale with the
/// partition size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss_sum: f32,
    pub val_loss_sum: f32,
}

/// Counters accumulated over one full training session.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    pub epochs: usize,
    pub steps: u64,
    pub samples: u64,
    pub history: Vec<EpochMetrics>,
}

impl SessionMetrics {
    pub fn bump_step(&mut self) {
        self.steps += 1;
    }

    pub fn add_samples(&mut self, n: usize) {
        self.samples += n as u64;
    }

    pub fn push_epoch(&mut self, record: EpochMetrics) {
        self.epochs += 1;
        self.history.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut m = SessionMetrics::default();
        m.bump_step();
        m.bump_step();
        m.add_samples(128);
        m.push_epoch(EpochMetrics {
            epoch: 0,
            train_loss_sum: 1.5,
            val_loss_sum: 0.5,
        });

        assert_eq!(m.steps, 2);
        assert_eq!(m.samples, 128);
        assert_eq!(m.epochs, 1);
        assert_eq!(m.history.len(), 1);
    }
}
