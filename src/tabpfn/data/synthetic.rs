//! Synthetic priors sampled on the fly.
//!
//! Each batch holds `batch_size` tasks sharing one random linear model.
//! Features are standard normal plus Gaussian noise; targets come from a
//! linear decision boundary (classification, arg-max with ties resolved to
//! the smallest class) or a noisy linear response (regression).

use super::batch::{Batch, BatchSource, EvalPosSampler};
use crate::tabpfn::errors::{Result, TabPfnError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Seed offset for the fixed validation batch.
const VALIDATION_SEED_OFFSET: u64 = 0x5eed_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorKind {
    GaussianClassification,
    GaussianRegression,
}

impl FromStr for PriorKind {
    type Err = TabPfnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gaussian" | "gaussian_classification" => Ok(PriorKind::GaussianClassification),
            "gaussian_regression" => Ok(PriorKind::GaussianRegression),
            other => Err(TabPfnError::configuration(format!(
                "prior type not recognized: '{}'",
                other
            ))),
        }
    }
}

/// Dimensions shared by every batch of one prior.
#[derive(Debug, Clone, Copy)]
struct PriorShape {
    kind: PriorKind,
    num_features: usize,
    num_classes: usize,
    batch_size: usize,
    noise_level: f32,
}

impl PriorShape {
    fn generate<B: burn::tensor::backend::Backend>(
        &self,
        rng: &mut StdRng,
        single_eval_pos: usize,
        seq_len: usize,
        device: &B::Device,
    ) -> Batch<B> {
        let (f, b) = (self.num_features, self.batch_size);
        let mut normal = |std: f32| rng.sample::<f32, _>(StandardNormal) * std;

        let x: Vec<f32> = (0..seq_len * b * f)
            .map(|_| normal(1.0) + normal(self.noise_level))
            .collect();

        let y: Vec<f32> = match self.kind {
            PriorKind::GaussianClassification => {
                let c = self.num_classes.max(1);
                let weights: Vec<f32> = (0..f * c).map(|_| normal(1.0)).collect();
                let bias: Vec<f32> = (0..c).map(|_| normal(0.1)).collect();
                x.chunks(f)
                    .map(|row| {
                        let mut best = 0;
                        let mut best_logit = f32::NEG_INFINITY;
                        for class in 0..c {
                            let logit = bias[class]
                                + row
                                    .iter()
                                    .enumerate()
                                    .map(|(j, v)| v * weights[j * c + class])
                                    .sum::<f32>();
                            if logit > best_logit {
                                best_logit = logit;
                                best = class;
                            }
                        }
                        best as f32
                    })
                    .collect()
            }
            PriorKind::GaussianRegression => {
                let weights: Vec<f32> = (0..f).map(|_| normal(1.0)).collect();
                let scale = 1.0 / (f.max(1) as f32).sqrt();
                let noise: Vec<f32> = (0..seq_len * b).map(|_| normal(self.noise_level)).collect();
                x.chunks(f)
                    .zip(noise)
                    .map(|(row, eps)| {
                        row.iter().zip(&weights).map(|(v, w)| v * w).sum::<f32>() * scale + eps
                    })
                    .collect()
            }
        };

        Batch::from_host(x, y, seq_len, b, f, Some(single_eval_pos), device)
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticPrior {
    shape: PriorShape,
    steps_per_epoch: usize,
    bptt: usize,
    extra_samples: Option<usize>,
    sampler: EvalPosSampler,
    seed: u64,
    rng: StdRng,
}

impl SyntheticPrior {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: PriorKind,
        num_features: usize,
        num_classes: usize,
        batch_size: usize,
        steps_per_epoch: usize,
        bptt: usize,
        extra_samples: Option<usize>,
        sampler: EvalPosSampler,
        noise_level: f32,
        seed: u64,
    ) -> Result<Self> {
        if num_features == 0 || batch_size == 0 {
            return Err(TabPfnError::configuration(
                "synthetic prior needs at least one feature and one task per batch",
            ));
        }
        if extra_samples.is_none() && sampler.max_position() >= bptt {
            return Err(TabPfnError::configuration(format!(
                "eval positions up to {} leave no query rows in a window of {}",
                sampler.max_position(),
                bptt
            )));
        }
        Ok(Self {
            shape: PriorShape {
                kind,
                num_features,
                num_classes,
                batch_size,
                noise_level,
            },
            steps_per_epoch,
            bptt,
            extra_samples,
            sampler,
            seed,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn kind(&self) -> PriorKind {
        self.shape.kind
    }

    /// Split point and total length of the next batch.
    ///
    /// With extra samples the query block has fixed length and the window
    /// grows with the split point.
    fn eval_pos_seq_len(&mut self) -> (usize, usize) {
        let pos = self.sampler.sample(&mut self.rng);
        match self.extra_samples {
            Some(extra) => (pos, pos + extra),
            None => (pos, self.bptt),
        }
    }

    pub fn sample_batch<B: burn::tensor::backend::Backend>(&mut self, device: &B::Device) -> Batch<B> {
        let (pos, seq_len) = self.eval_pos_seq_len();
        let shape = self.shape;
        shape.generate(&mut self.rng, pos, seq_len, device)
    }
}

impl<B: burn::tensor::backend::Backend> BatchSource<B> for SyntheticPrior {
    fn num_features(&self) -> usize {
        self.shape.num_features
    }

    fn window(&self) -> usize {
        self.bptt
    }

    fn batches_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    fn epoch<'a>(&'a mut self, device: &'a B::Device) -> Box<dyn Iterator<Item = Batch<B>> + 'a> {
        let steps = self.steps_per_epoch;
        Box::new((0..steps).map(move |_| self.sample_batch::<B>(device)))
    }

    fn validation_batch(&self, device: &B::Device) -> Option<Batch<B>> {
        if self.shape.kind != PriorKind::GaussianClassification {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(VALIDATION_SEED_OFFSET));
        Some(self.shape.generate(&mut rng, self.bptt / 2, self.bptt, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn prior(extra: Option<usize>) -> SyntheticPrior {
        SyntheticPrior::new(
            PriorKind::GaussianClassification,
            4,
            3,
            2,
            5,
            16,
            extra,
            EvalPosSampler::Uniform { max: 12 },
            0.1,
            7,
        )
        .unwrap()
    }

    #[test]
    fn test_epoch_yields_configured_steps_and_shapes() {
        let device = Default::default();
        let mut source = prior(None);
        let batches: Vec<Batch<TestBackend>> =
            BatchSource::<TestBackend>::epoch(&mut source, &device).collect();
        assert_eq!(batches.len(), 5);
        for batch in &batches {
            assert_eq!(batch.x.dims(), [16, 2, 4]);
            let pos = batch.single_eval_pos.unwrap();
            assert!(pos < 16);
            let labels: Vec<f32> = batch.y.clone().into_data().iter::<f32>().collect();
            assert!(labels.iter().all(|&l| (0.0..3.0).contains(&l) && l.fract() == 0.0));
        }
    }

    #[test]
    fn test_extra_samples_fix_query_length() {
        let device = Default::default();
        let mut source = prior(Some(6));
        for batch in BatchSource::<TestBackend>::epoch(&mut source, &device) {
            let pos = batch.single_eval_pos.unwrap();
            assert_eq!(batch.seq_len(), pos + 6);
        }
    }

    #[test]
    fn test_validation_batch_is_fixed() {
        let device = Default::default();
        let source = prior(None);
        let a = BatchSource::<TestBackend>::validation_batch(&source, &device).unwrap();
        let b = BatchSource::<TestBackend>::validation_batch(&source, &device).unwrap();
        let a_x: Vec<f32> = a.x.into_data().iter::<f32>().collect();
        let b_x: Vec<f32> = b.x.into_data().iter::<f32>().collect();
        assert_eq!(a_x, b_x);
        assert_eq!(a.single_eval_pos, Some(8));
    }

    #[test]
    fn test_sampler_beyond_window_rejected() {
        let err = SyntheticPrior::new(
            PriorKind::GaussianRegression,
            2,
            1,
            1,
            1,
            8,
            None,
            EvalPosSampler::Fixed(8),
            0.0,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, TabPfnError::Configuration(_)));
    }
}
