//! One training epoch: fetch, forward, loss, backward, accumulate, step.
//!
//! Gradients of consecutive micro-batches are summed by a
//! [`GradientsAccumulator`]; every `aggregate_k_gradients` batches they are
//! synchronised, unscaled, clipped and applied. A step whose gradients are
//! not finite is logged and skipped, the epoch carries on.
//!
//! Under boosting the split point is forced to half the window. In the
//! first epoch of a boosting member the gradient of the loss with respect
//! to the model output is stored per batch and blended with the previous
//! member's before being pushed back through the model.

use super::distributed::{GradientSync, LocalGradientSync};
use super::grad::{clip_global_norm, OutputGradients};
use super::loss::{ignore_share, nanmean_tasks, LossKind};
use super::precision::LossScaler;
use crate::tabpfn::architectures::PriorFittingModel;
use crate::tabpfn::data::BatchSource;
use crate::tabpfn::errors::{Result, TabPfnError};
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::marker::PhantomData;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct StepOptions {
    pub loss: LossKind,
    pub aggregate_k_gradients: usize,
    pub clip_norm: f32,
    /// Reduce with a plain mean and split every window in half.
    pub boosting: bool,
    pub permute_features: bool,
    /// Length of the per-position loss vector.
    pub bptt: usize,
}

/// Summary of one epoch. Timings are those of the last batch, in seconds.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    pub mean_loss: f64,
    pub positional_losses: Vec<f64>,
    pub data_time: f64,
    pub forward_time: f64,
    pub step_time: f64,
    pub nan_share: f64,
    pub ignore_share: f64,
    pub batches: usize,
    pub skipped_steps: usize,
}

#[derive(Debug, Clone)]
struct PositionalLosses {
    total: Vec<f64>,
    recorded: Vec<f64>,
}

impl PositionalLosses {
    fn new(bptt: usize) -> Self {
        Self {
            total: vec![0.0; bptt],
            recorded: vec![0.0; bptt],
        }
    }

    /// Per-row means when every row is a query.
    fn add_rows(&mut self, row_means: &[f64]) {
        for (total, loss) in self.total.iter_mut().zip(row_means) {
            *total += loss;
        }
        for recorded in self.recorded.iter_mut() {
            *recorded += 1.0;
        }
    }

    /// One mean attributed to the split position.
    fn add_at(&mut self, pos: usize, mean: f64) {
        if pos < self.total.len() {
            self.total[pos] += mean;
            self.recorded[pos] += 1.0;
        }
    }

    fn finish(self, boosting: bool) -> Vec<f64> {
        if boosting {
            return vec![0.0; self.total.len()];
        }
        self.total
            .iter()
            .zip(&self.recorded)
            .map(|(total, recorded)| total / recorded)
            .collect()
    }
}

fn scalar<B: burn::tensor::backend::Backend, const D: usize>(tensor: Tensor<B, D>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

pub struct StepEngine<B, M, O>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
    O: Optimizer<M, B>,
{
    optimizer: O,
    accumulator: GradientsAccumulator<M>,
    scaler: Option<LossScaler>,
    sync: Box<dyn GradientSync>,
    options: StepOptions,
    rng: StdRng,
    _backend: PhantomData<B>,
}

impl<B, M, O> StepEngine<B, M, O>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
    O: Optimizer<M, B>,
{
    pub fn new(optimizer: O, options: StepOptions, seed: u64) -> Self {
        Self {
            optimizer,
            accumulator: GradientsAccumulator::new(),
            scaler: None,
            sync: Box::new(LocalGradientSync),
            options,
            rng: StdRng::seed_from_u64(seed),
            _backend: PhantomData,
        }
    }

    pub fn with_loss_scaler(mut self, scaler: LossScaler) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_gradient_sync(mut self, sync: Box<dyn GradientSync>) -> Self {
        self.sync = sync;
        self
    }

    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    /// Reseed feature permutation draws.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Train `model` on one epoch of `source`.
    ///
    /// `boost` is the output-gradient store of a boosting member, passed
    /// only during that member's first epoch.
    pub fn train_epoch<S: BatchSource<B>>(
        &mut self,
        mut model: M,
        source: &mut S,
        lr: f64,
        mut boost: Option<&mut OutputGradients<B::InnerBackend>>,
        device: &B::Device,
    ) -> Result<(M, EpochStats)> {
        let k = self.options.aggregate_k_gradients.max(1);
        let planned = source.batches_per_epoch();
        if planned % k != 0 {
            return Err(TabPfnError::configuration(format!(
                "{} batches per epoch cannot be split into accumulation windows of {}",
                planned, k
            )));
        }

        let mut stats = EpochStats::default();
        let mut positional = PositionalLosses::new(self.options.bptt);
        let (mut total_loss, mut finite_steps) = (0.0, 0usize);
        let (mut nan_steps, mut ignore_steps) = (0.0, 0.0);

        let mut before_batch = Instant::now();
        for (index, batch) in source.epoch(device).enumerate() {
            stats.data_time = before_batch.elapsed().as_secs_f64();
            let batch = if self.options.permute_features {
                batch.permute_features(&mut self.rng)
            } else {
                batch
            };

            let before_forward = Instant::now();
            let single_eval_pos = if self.options.boosting {
                Some(batch.seq_len() / 2)
            } else {
                batch.single_eval_pos
            };
            let targets = batch.query_targets(single_eval_pos);
            let output = model.forward(batch.x, batch.y, single_eval_pos);
            stats.forward_time = before_forward.elapsed().as_secs_f64();

            let (losses, loss, nan_share, grads) = match boost.as_deref_mut() {
                Some(store) => {
                    // d(loss)/d(output) through a detached copy of the output
                    let leaf = output.clone().detach().require_grad();
                    let losses = self.options.loss.per_element(leaf.clone(), targets.clone())?;
                    let loss = self.scaled(losses.clone().mean());
                    let leaf_grads = loss.backward();
                    let output_grad = leaf.grad(&leaf_grads).ok_or_else(|| {
                        TabPfnError::state("model output did not receive a gradient")
                    })?;
                    store.store(index, output_grad.clone());
                    let blended = store.blend(index, output_grad);
                    let grads = (output * Tensor::from_inner(blended)).sum().backward();
                    (losses, scalar(loss.detach()), 0.0, grads)
                }
                None => {
                    let losses = self.options.loss.per_element(output, targets.clone())?;
                    let (loss, nan_share) = if self.options.boosting {
                        (losses.clone().mean(), 0.0)
                    } else {
                        let reduced = nanmean_tasks(losses.clone());
                        (reduced.loss / k as f32, reduced.nan_share)
                    };
                    let loss = self.scaled(loss);
                    let value = scalar(loss.clone().detach());
                    (losses, value, nan_share, loss.backward())
                }
            };

            let grads = GradientsParams::from_grads(grads, &model);
            self.accumulator.accumulate(&model, grads);
            if index % k == k - 1 {
                let (updated, stepped) = self.apply_step(model, lr);
                model = updated;
                if !stepped {
                    stats.skipped_steps += 1;
                }
            }
            stats.step_time = before_forward.elapsed().as_secs_f64();

            if loss.is_finite() {
                let losses = losses.detach();
                total_loss += scalar(losses.clone().mean());
                finite_steps += 1;
                let [q, b] = losses.dims();
                match single_eval_pos {
                    None => {
                        let row_means: Vec<f64> = losses
                            .mean_dim(1)
                            .into_data()
                            .iter::<f32>()
                            .map(f64::from)
                            .collect();
                        positional.add_rows(&row_means);
                    }
                    Some(pos) => {
                        let rows = self.options.bptt.saturating_sub(pos).min(q);
                        if rows > 0 {
                            let mean = scalar(losses.slice([0..rows, 0..b]).mean());
                            positional.add_at(pos, mean);
                        }
                    }
                }
            }
            nan_steps += nan_share;
            ignore_steps += ignore_share(&targets);
            stats.batches = index + 1;
            before_batch = Instant::now();
        }

        let batches = stats.batches.max(1) as f64;
        stats.mean_loss = total_loss / finite_steps.max(1) as f64;
        stats.positional_losses = positional.finish(self.options.boosting);
        stats.nan_share = nan_steps / batches;
        stats.ignore_share = ignore_steps / batches;
        Ok((model, stats))
    }

    fn scaled(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        match &self.scaler {
            Some(scaler) => scaler.scale_loss(loss),
            None => loss,
        }
    }

    /// Sync, unscale, clip and apply the accumulated gradients.
    fn apply_step(&mut self, model: M, lr: f64) -> (M, bool) {
        let mut grads = self.sync.all_reduce(self.accumulator.grads());
        if let Some(scaler) = self.scaler.as_mut() {
            let clean = scaler.unscale(&model, &mut grads);
            scaler.update(!clean);
            if !clean {
                log::warn!("Invalid optimization step encountered: gradient overflow at scale {}", scaler.scale());
                return (model, false);
            }
        }
        match clip_global_norm(&model, &mut grads, self.options.clip_norm) {
            Ok(norm) => {
                log::debug!("optimizer step, gradient norm {:.4}", norm);
                (self.optimizer.step(lr, model, grads), true)
            }
            Err(err) => {
                log::warn!("Invalid optimization step encountered: {}", err);
                (model, false)
            }
        }
    }
}
