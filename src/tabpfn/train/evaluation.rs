//! Accuracy and calibration on held-out real data.
//!
//! Calibration is measured on softmax probabilities with 30 bins:
//! - ECE: equal-width bins over the top-label confidence
//! - TACE: per class, probabilities at or above 0.01 split into equal-count
//!   bins, averaged over classes

use crate::tabpfn::architectures::PriorFittingModel;
use crate::tabpfn::data::{Batch, EvalSplit, RealDataSource};
use crate::tabpfn::errors::{Result, TabPfnError};
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array2, ArrayView1, Axis};

pub const CALIBRATION_BINS: usize = 30;

/// Probabilities below this are ignored by TACE.
const TACE_THRESHOLD: f32 = 0.01;

/// Round to three decimals, the precision every reported score uses.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Index of the largest entry, ties resolved to the smallest index.
fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

pub fn predictions(outputs: &Array2<f32>) -> Vec<usize> {
    outputs.axis_iter(Axis(0)).map(argmax).collect()
}

/// Share of rows whose arg-max matches the target, rounded to 3 decimals.
pub fn accuracy(outputs: &Array2<f32>, targets: &[i64]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let correct = predictions(outputs)
        .into_iter()
        .zip(targets)
        .filter(|(pred, &target)| *pred as i64 == target)
        .count();
    round3(correct as f64 / targets.len() as f64)
}

pub fn softmax_rows(outputs: &Array2<f32>) -> Array2<f32> {
    let mut probs = outputs.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Expected calibration error of the top label.
pub fn ece(probs: &Array2<f32>, targets: &[i64], num_bins: usize) -> f64 {
    let n = targets.len();
    if n == 0 || num_bins == 0 {
        return 0.0;
    }
    let mut confidence = vec![0.0f64; num_bins];
    let mut correct = vec![0.0f64; num_bins];
    let mut counts = vec![0usize; num_bins];
    for (row, &target) in probs.axis_iter(Axis(0)).zip(targets) {
        let pred = argmax(row);
        let conf = row[pred] as f64;
        let bin = ((conf * num_bins as f64).ceil() as usize).clamp(1, num_bins) - 1;
        confidence[bin] += conf;
        correct[bin] += f64::from(u8::from(pred as i64 == target));
        counts[bin] += 1;
    }
    (0..num_bins)
        .filter(|&b| counts[b] > 0)
        .map(|b| (correct[b] - confidence[b]).abs() / n as f64)
        .sum()
}

/// Thresholded adaptive calibration error.
pub fn tace(probs: &Array2<f32>, targets: &[i64], num_bins: usize) -> f64 {
    let num_classes = probs.ncols();
    if targets.is_empty() || num_bins == 0 || num_classes == 0 {
        return 0.0;
    }
    let mut class_errors = Vec::with_capacity(num_classes);
    for class in 0..num_classes {
        let mut entries: Vec<(f32, bool)> = probs
            .column(class)
            .iter()
            .zip(targets)
            .filter(|(&p, _)| p >= TACE_THRESHOLD)
            .map(|(&p, &t)| (p, t == class as i64))
            .collect();
        if entries.is_empty() {
            continue;
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        let n = entries.len();
        let bins = num_bins.min(n);
        let (base, extra) = (n / bins, n % bins);
        let mut start = 0;
        let mut error = 0.0;
        for b in 0..bins {
            let len = base + usize::from(b < extra);
            let chunk = &entries[start..start + len];
            let conf: f64 = chunk.iter().map(|(p, _)| *p as f64).sum();
            let hits: f64 = chunk.iter().map(|(_, hit)| f64::from(u8::from(*hit))).sum();
            error += (hits - conf).abs() / n as f64;
            start += len;
        }
        class_errors.push(error);
    }
    if class_errors.is_empty() {
        return 0.0;
    }
    class_errors.iter().sum::<f64>() / class_errors.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Calibration {
    pub ece: f64,
    pub tace: f64,
}

impl Calibration {
    /// Both errors of raw model outputs, rounded to 3 decimals.
    pub fn of_outputs(outputs: &Array2<f32>, targets: &[i64]) -> Self {
        let probs = softmax_rows(outputs);
        Self {
            ece: round3(ece(&probs, targets, CALIBRATION_BINS)),
            tace: round3(tace(&probs, targets, CALIBRATION_BINS)),
        }
    }
}

/// Outputs `[N, n_out]` and targets of one scored split.
#[derive(Debug, Clone)]
pub struct EvalResult {
    pub accuracy: f64,
    pub outputs: Array2<f32>,
    pub targets: Vec<i64>,
}

impl EvalResult {
    pub fn calibration(&self) -> Calibration {
        Calibration::of_outputs(&self.outputs, &self.targets)
    }
}

/// Score `model` on `split`, each batch conditioned on `cl` training rows.
pub fn evaluate_real<B, M>(
    model: &M,
    source: &mut RealDataSource,
    split: EvalSplit,
    cl: usize,
    device: &B::Device,
) -> Result<EvalResult>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
{
    let n_out = model.n_out();
    let mut outputs = Vec::new();
    let mut targets = Vec::new();
    for batch in source.eval_batches::<B>(split, cl, device) {
        let query_targets = batch.query_targets(batch.single_eval_pos);
        let output = model.forward_inference(batch.x.inner(), batch.y.inner(), batch.single_eval_pos);
        outputs.extend(output.into_data().iter::<f32>());
        targets.extend(query_targets.into_data().iter::<f32>().map(|t| t as i64));
    }
    let outputs = Array2::from_shape_vec((targets.len(), n_out), outputs)
        .map_err(|err| TabPfnError::state(format!("evaluation output layout: {}", err)))?;
    Ok(EvalResult {
        accuracy: accuracy(&outputs, &targets),
        outputs,
        targets,
    })
}

/// Accuracy of `model` on the query rows of one batch.
pub fn evaluate_batch<B, M>(model: &M, batch: Batch<B>) -> Result<f64>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
{
    let pos = batch.single_eval_pos;
    let targets: Vec<i64> = batch
        .query_targets(pos)
        .into_data()
        .iter::<f32>()
        .map(|t| t as i64)
        .collect();
    let output = model.forward_inference(batch.x.inner(), batch.y.inner(), pos);
    let [_, _, n_out] = output.dims();
    let outputs = Array2::from_shape_vec((targets.len(), n_out), output.into_data().iter::<f32>().collect())
        .map_err(|err| TabPfnError::state(format!("evaluation output layout: {}", err)))?;
    Ok(accuracy(&outputs, &targets))
}
