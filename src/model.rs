use ndarray::{Array1, ArrayView2};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::data::Batch;
use crate::error::{Result, TrainError};

/// Training-computation boundary.
///
/// Maps the current parameters to a batch gradient (forward, loss, backward).
/// The training session treats this as a black box, which keeps the loop
/// testable with synthetic gradients and no real model.
pub trait TrainStep: Send {
    /// Number of scalar parameters expected in `weights` and `grads`.
    fn num_params(&self) -> usize;

    /// Runs forward + backward on one batch.
    ///
    /// Overwrites `grads` with the gradient of the *mean* batch loss and
    /// returns that loss.
    ///
    /// # Errors
    /// Returns `TrainError::Shape` when buffer or label invariants are
    /// violated.
    fn train_batch(&mut self, weights: &[f32], batch: &Batch, grads: &mut [f32]) -> Result<f32>;

    /// Runs forward only and returns the mean batch loss.
    fn eval_batch(&mut self, weights: &[f32], batch: &Batch) -> Result<f32>;
}

/// A fixed-topology multilayer perceptron over an external flat parameter
/// buffer.
///
/// The struct owns no parameters: it describes layer shapes and knows how to
/// evaluate and differentiate them against a caller-owned `&[f32]`. That
/// keeps replicas trivially comparable and lets the all-reduce operate on one
/// contiguous gradient buffer.
///
/// Layout of the flat buffer, per layer: row-major `(out, in)` weight matrix,
/// then the bias vector when the layer has one.
pub struct Mlp {
    sizes: Vec<usize>,
    last_bias: bool,
    /// Inverted-dropout probability applied after the first hidden
    /// activation during training; 0.0 disables it.
    dropout: f32,
    mask_rng: StdRng,
}

/// Per-sample forward caches consumed by the backward pass.
struct Tape {
    /// Pre-activations, one per layer.
    zs: Vec<Array1<f32>>,
    /// Layer inputs: `activations[l]` feeds layer `l`.
    activations: Vec<Array1<f32>>,
    /// Dropout masks (scale included), per hidden layer.
    masks: Vec<Option<Array1<f32>>>,
}

impl Mlp {
    /// # Panics
    /// - if fewer than two sizes are given or any size is zero
    /// - if `dropout` is outside `[0, 1)`
    pub fn new(sizes: &[usize], last_bias: bool, dropout: f32, mask_seed: u64) -> Self {
        assert!(sizes.len() >= 2, "need at least one layer");
        assert!(sizes.iter().all(|&s| s > 0), "layer sizes must be > 0");
        assert!((0.0..1.0).contains(&dropout), "dropout must be in [0, 1)");

        Self {
            sizes: sizes.to_vec(),
            last_bias,
            dropout,
            mask_rng: StdRng::seed_from_u64(mask_seed),
        }
    }

    /// The image classifier topology: 784-128-128-10, ReLU, dropout 0.2
    /// after the first hidden activation, bias-free output layer.
    ///
    /// `mask_seed` drives only the worker-local dropout masks; it may (and
    /// should) differ per rank without breaking replica consistency, since
    /// parameter updates use the group-averaged gradient.
    pub fn classifier(mask_seed: u64) -> Self {
        Self::new(&[28 * 28, 128, 128, 10], false, 0.2, mask_seed)
    }

    #[inline]
    fn layers(&self) -> usize {
        self.sizes.len() - 1
    }

    #[inline]
    fn has_bias(&self, layer: usize) -> bool {
        layer + 1 < self.layers() || self.last_bias
    }

    #[inline]
    pub fn input_len(&self) -> usize {
        self.sizes[0]
    }

    #[inline]
    pub fn classes(&self) -> usize {
        *self.sizes.last().unwrap()
    }

    pub fn param_count(&self) -> usize {
        (0..self.layers())
            .map(|l| {
                let n = self.sizes[l + 1] * self.sizes[l];
                if self.has_bias(l) { n + self.sizes[l + 1] } else { n }
            })
            .sum()
    }

    /// Named tensor shapes in flat-buffer order, for checkpointing.
    pub fn schema(&self) -> Vec<(String, Vec<usize>)> {
        let mut out = Vec::new();
        for l in 0..self.layers() {
            out.push((format!("layer{l}.weight"), vec![self.sizes[l + 1], self.sizes[l]]));
            if self.has_bias(l) {
                out.push((format!("layer{l}.bias"), vec![self.sizes[l + 1]]));
            }
        }
        out
    }

    /// Deterministic parameter initialization: uniform in
    /// `[-1/sqrt(fan_in), 1/sqrt(fan_in)]` per layer.
    ///
    /// Every worker seeds this with the shared base seed, so all replicas
    /// start identical without a broadcast.
    pub fn init_params(&self, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = Vec::with_capacity(self.param_count());

        for l in 0..self.layers() {
            let (fan_in, fan_out) = (self.sizes[l], self.sizes[l + 1]);
            let bound = 1.0 / (fan_in as f32).sqrt();
            for _ in 0..fan_out * fan_in {
                params.push(rng.random_range(-bound..bound));
            }
            if self.has_bias(l) {
                for _ in 0..fan_out {
                    params.push(rng.random_range(-bound..bound));
                }
            }
        }

        params
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        let expected = self.param_count();
        if got != expected {
            return Err(TrainError::Shape {
                what,
                got,
                expected,
            });
        }
        Ok(())
    }

    fn split_params<'a>(&self, buf: &'a [f32]) -> Vec<(&'a [f32], Option<&'a [f32]>)> {
        let mut rest = buf;
        let mut out = Vec::with_capacity(self.layers());
        for l in 0..self.layers() {
            let (w, r) = rest.split_at(self.sizes[l + 1] * self.sizes[l]);
            rest = r;
            let b = if self.has_bias(l) {
                let (b, r) = rest.split_at(self.sizes[l + 1]);
                rest = r;
                Some(b)
            } else {
                None
            };
            out.push((w, b));
        }
        out
    }

    fn split_params_mut<'a>(
        &self,
        buf: &'a mut [f32],
    ) -> Vec<(&'a mut [f32], Option<&'a mut [f32]>)> {
        let mut rest = buf;
        let mut out = Vec::with_capacity(self.layers());
        for l in 0..self.layers() {
            let (w, r) = rest.split_at_mut(self.sizes[l + 1] * self.sizes[l]);
            rest = r;
            let b = if self.has_bias(l) {
                let (b, r) = rest.split_at_mut(self.sizes[l + 1]);
                rest = r;
                Some(b)
            } else {
                None
            };
            out.push((w, b));
        }
        out
    }

    fn weight_view<'a>(&self, layer: usize, w: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        ArrayView2::from_shape((self.sizes[layer + 1], self.sizes[layer]), w).map_err(|_| {
            TrainError::Shape {
                what: "weight matrix",
                got: w.len(),
                expected: self.sizes[layer + 1] * self.sizes[layer],
            }
        })
    }

    /// Forward pass for one sample, recording the caches backprop needs.
    fn forward_train(&mut self, weights: &[f32], x: Array1<f32>) -> Result<(Array1<f32>, Tape)> {
        let layers = self.layers();
        let splits = self.split_params(weights);

        let mut tape = Tape {
            zs: Vec::with_capacity(layers),
            activations: vec![x],
            masks: vec![None; layers.saturating_sub(1)],
        };

        for (l, (w, b)) in splits.into_iter().enumerate() {
            let wview = self.weight_view(l, w)?;
            let mut z = wview.dot(tape.activations.last().unwrap());
            if let Some(b) = b {
                z.zip_mut_with(&ndarray::ArrayView1::from(b), |zv, bv| *zv += bv);
            }

            if l + 1 < layers {
                let mut a = z.mapv(|v| v.max(0.0));
                if l == 0 && self.dropout > 0.0 {
                    let keep = 1.0 - self.dropout;
                    let mask = Array1::from_iter((0..a.len()).map(|_| {
                        if self.mask_rng.random::<f32>() < keep {
                            1.0 / keep
                        } else {
                            0.0
                        }
                    }));
                    a.zip_mut_with(&mask, |av, m| *av *= m);
                    tape.masks[l] = Some(mask);
                }
                tape.zs.push(z);
                tape.activations.push(a);
            } else {
                let probs = softmax(&z);
                tape.zs.push(z);
                return Ok((probs, tape));
            }
        }

        unreachable!("loop returns at the last layer")
    }

    /// Forward pass without dropout or caches; returns class probabilities.
    fn forward_eval(&self, weights: &[f32], x: Array1<f32>) -> Result<Array1<f32>> {
        let layers = self.layers();
        let splits = self.split_params(weights);

        let mut a = x;
        for (l, (w, b)) in splits.into_iter().enumerate() {
            let wview = self.weight_view(l, w)?;
            let mut z = wview.dot(&a);
            if let Some(b) = b {
                z.zip_mut_with(&ndarray::ArrayView1::from(b), |zv, bv| *zv += bv);
            }
            a = if l + 1 < layers { z.mapv(|v| v.max(0.0)) } else { z };
        }

        Ok(softmax(&a))
    }

    /// Accumulates one sample's gradient contribution into `grads`.
    ///
    /// `delta` starts as dL/dlogits (`probs - onehot(y)` for softmax
    /// cross-entropy) and is propagated backwards layer by layer.
    fn backward(
        &self,
        weights: &[f32],
        tape: &Tape,
        mut delta: Array1<f32>,
        grads: &mut [f32],
    ) -> Result<()> {
        let wsplits = self.split_params(weights);
        let mut gsplits = self.split_params_mut(grads);

        for l in (0..self.layers()).rev() {
            let a_prev = &tape.activations[l];
            let (gw, gb) = &mut gsplits[l];

            for (i, d) in delta.iter().enumerate() {
                let row = &mut gw[i * a_prev.len()..(i + 1) * a_prev.len()];
                for (g, a) in row.iter_mut().zip(a_prev.iter()) {
                    *g += d * a;
                }
            }
            if let Some(gb) = gb {
                for (g, d) in gb.iter_mut().zip(delta.iter()) {
                    *g += d;
                }
            }

            if l > 0 {
                let wview = self.weight_view(l, wsplits[l].0)?;
                let mut prev = wview.t().dot(&delta);
                if let Some(mask) = &tape.masks[l - 1] {
                    prev.zip_mut_with(mask, |p, m| *p *= m);
                }
                prev.zip_mut_with(&tape.zs[l - 1], |p, &z| {
                    if z <= 0.0 {
                        *p = 0.0;
                    }
                });
                delta = prev;
            }
        }

        Ok(())
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        if batch.xs.ncols() != self.input_len() {
            return Err(TrainError::Shape {
                what: "batch input width",
                got: batch.xs.ncols(),
                expected: self.input_len(),
            });
        }
        for &y in &batch.ys {
            if y >= self.classes() {
                return Err(TrainError::Shape {
                    what: "class label",
                    got: y,
                    expected: self.classes(),
                });
            }
        }
        Ok(())
    }
}

impl TrainStep for Mlp {
    fn num_params(&self) -> usize {
        self.param_count()
    }

    fn train_batch(&mut self, weights: &[f32], batch: &Batch, grads: &mut [f32]) -> Result<f32> {
        self.check_len("params", weights.len())?;
        self.check_len("grads", grads.len())?;
        self.check_batch(batch)?;

        grads.fill(0.0);
        let mut loss_sum = 0.0f32;

        for row in 0..batch.len() {
            let x = batch.xs.row(row).to_owned();
            let y = batch.ys[row];

            let (probs, tape) = self.forward_train(weights, x)?;
            loss_sum += -probs[y].ln();

            let mut delta = probs;
            delta[y] -= 1.0;
            self.backward(weights, &tape, delta, grads)?;
        }

        // gradient of the mean loss over the batch
        let scale = 1.0 / batch.len() as f32;
        for g in grads.iter_mut() {
            *g *= scale;
        }

        Ok(loss_sum * scale)
    }

    fn eval_batch(&mut self, weights: &[f32], batch: &Batch) -> Result<f32> {
        self.check_len("params", weights.len())?;
        self.check_batch(batch)?;

        let mut loss_sum = 0.0f32;
        for row in 0..batch.len() {
            let probs = self.forward_eval(weights, batch.xs.row(row).to_owned())?;
            loss_sum += -probs[batch.ys[row]].ln();
        }

        Ok(loss_sum / batch.len() as f32)
    }
}

/// Numerically stable softmax.
fn softmax(z: &Array1<f32>) -> Array1<f32> {
    let max = z.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut e = z.mapv(|v| (v - max).exp());
    let sum = e.sum();
    e.mapv_inplace(|v| v / sum);
    e
}
