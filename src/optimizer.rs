use crate::error::{Result, TrainError};

/// Stochastic gradient descent with a fixed learning rate.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    /// Creates an optimizer with a constant step size; no momentum, no
    /// weight decay, no schedule.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    /// Updates `params` in place using the (already group-averaged) gradient.
    ///
    /// # Errors
    /// Returns `TrainError::Shape` if the lengths disagree.
    pub fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != params.len() {
            return Err(TrainError::Shape {
                what: "gradient",
                got: grad.len(),
                expected: params.len(),
            });
        }

        let lr = self.learning_rate;
        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * g;
        }

        Ok(())
    }
}
