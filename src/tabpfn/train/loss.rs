//! Per-element training losses.
//!
//! Every loss is computed on the query rows only and returned unreduced as
//! `[Q, B]`, so the step engine can take the per-task mean, count non-finite
//! tasks and track per-position losses.

use crate::tabpfn::data::IGNORE_INDEX;
use crate::tabpfn::errors::{Result, TabPfnError};
use burn::tensor::{activation, backend::Backend, ElementConversion, Int, Tensor};

/// Lower bound applied to the predicted variance of the Gaussian NLL.
const GAUSSIAN_NLL_EPS: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Output channels are `(mean, variance)`, variance taken by magnitude.
    GaussianNll,
    Mse,
    BceWithLogits,
    /// Targets equal to [`IGNORE_INDEX`] contribute zero loss.
    CrossEntropy,
}

impl LossKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gaussnll" | "gaussian_nll" => Ok(LossKind::GaussianNll),
            "mse" => Ok(LossKind::Mse),
            "bce" | "bce_with_logits" => Ok(LossKind::BceWithLogits),
            "ce" | "cross_entropy" => Ok(LossKind::CrossEntropy),
            other => Err(TabPfnError::configuration(format!(
                "loss function not recognized: '{}'",
                other
            ))),
        }
    }

    /// Unreduced loss of `output: [Q, B, n_out]` against `targets: [Q, B]`.
    pub fn per_element<B: Backend>(&self, output: Tensor<B, 3>, targets: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let [q, b, n_out] = output.dims();
        let [tq, tb] = targets.dims();
        if (q, b) != (tq, tb) {
            return Err(TabPfnError::precondition(format!(
                "output rows {:?} do not match target rows {:?}",
                [q, b],
                [tq, tb]
            )));
        }

        match self {
            LossKind::GaussianNll => {
                if n_out != 2 {
                    return Err(TabPfnError::precondition(format!(
                        "gaussian nll needs exactly 2 output channels (mean, variance), got {}",
                        n_out
                    )));
                }
                let mean = output.clone().slice([0..q, 0..b, 0..1]).reshape([q, b]);
                let var = output
                    .slice([0..q, 0..b, 1..2])
                    .reshape([q, b])
                    .abs()
                    .clamp_min(GAUSSIAN_NLL_EPS);
                let residual = mean - targets;
                Ok((var.clone().log() + residual.powf_scalar(2.0) / var) * 0.5)
            }
            LossKind::Mse => {
                let pred = single_channel(output, n_out)?;
                Ok((pred - targets).powf_scalar(2.0))
            }
            LossKind::BceWithLogits => {
                let logits = single_channel(output, n_out)?;
                // max(x, 0) - x * t + log(1 + exp(-|x|))
                let softplus = (logits.clone().abs().neg().exp() + 1.0).log();
                Ok(logits.clone().clamp_min(0.0) - logits * targets + softplus)
            }
            LossKind::CrossEntropy => {
                let log_probs = activation::log_softmax(output.clone(), 2);
                let device = output.device();
                let classes = Tensor::<B, 1, Int>::arange(0..n_out as i64, &device)
                    .float()
                    .reshape([1, 1, n_out])
                    .repeat_dim(0, q)
                    .repeat_dim(1, b);
                let one_hot = targets
                    .reshape([q, b, 1])
                    .repeat_dim(2, n_out)
                    .equal(classes)
                    .float();
                Ok((log_probs * one_hot).sum_dim(2).reshape([q, b]).neg())
            }
        }
    }
}

fn single_channel<B: Backend>(output: Tensor<B, 3>, n_out: usize) -> Result<Tensor<B, 2>> {
    let [q, b, _] = output.dims();
    if n_out != 1 {
        return Err(TabPfnError::precondition(format!(
            "loss expects a single output channel, got {}",
            n_out
        )));
    }
    Ok(output.reshape([q, b]))
}

/// Scalar training loss plus the share of tasks whose loss was NaN.
#[derive(Debug, Clone)]
pub struct ReducedLoss<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub nan_share: f64,
}

/// Mean over query rows per task, then NaN-skipping mean over tasks.
pub fn nanmean_tasks<B: Backend>(losses: Tensor<B, 2>) -> ReducedLoss<B> {
    let [_, b] = losses.dims();
    let per_task = losses.mean_dim(0).reshape([b]);
    let nan = per_task.clone().is_nan();
    let count = nan.clone().bool_not().float().sum();
    let total = per_task.mask_fill(nan, 0.0).sum();
    let finite_tasks = count.clone().into_scalar().elem::<f64>();
    ReducedLoss {
        loss: total / count,
        nan_share: 1.0 - finite_tasks / b.max(1) as f64,
    }
}

/// Share of targets carrying the ignore label.
pub fn ignore_share<B: Backend>(targets: &Tensor<B, 2>) -> f64 {
    targets
        .clone()
        .equal_elem(IGNORE_INDEX as f32)
        .float()
        .mean()
        .into_scalar()
        .elem::<f64>()
}
