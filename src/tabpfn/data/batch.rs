//! Batch contract shared by the synthetic prior and the real-data loader.
//!
//! All tensors follow the sequence-first layout used throughout the crate:
//! - `x`: `[S, B, F]` features
//! - `y`: `[S, B]` targets, also fed to the model for context rows
//!
//! Rows `[0, single_eval_pos)` are context, the rest are queries.

use super::real::RealDataSource;
use super::synthetic::SyntheticPrior;
use crate::tabpfn::errors::{Result, TabPfnError};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;

/// Label value excluded from classification losses.
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub x: Tensor<B, 3>,
    pub y: Tensor<B, 2>,
    pub single_eval_pos: Option<usize>,
}

impl<B: Backend> Batch<B> {
    /// Build a batch from host buffers laid out as `[S, B, F]` and `[S, B]`.
    pub fn from_host(
        x: Vec<f32>,
        y: Vec<f32>,
        seq_len: usize,
        batch_size: usize,
        num_features: usize,
        single_eval_pos: Option<usize>,
        device: &B::Device,
    ) -> Self {
        Self {
            x: Tensor::from_data(TensorData::new(x, [seq_len, batch_size, num_features]), device),
            y: Tensor::from_data(TensorData::new(y, [seq_len, batch_size]), device),
            single_eval_pos,
        }
    }

    pub fn seq_len(&self) -> usize {
        self.y.dims()[0]
    }

    /// Targets of the query rows, `[S - split, B]`.
    pub fn query_targets(&self, single_eval_pos: Option<usize>) -> Tensor<B, 2> {
        match single_eval_pos {
            Some(pos) => {
                let [s, b] = self.y.dims();
                self.y.clone().slice([pos..s, 0..b])
            }
            None => self.y.clone(),
        }
    }

    /// Shuffle the feature axis with one permutation shared by all rows.
    pub fn permute_features(self, rng: &mut StdRng) -> Self {
        let [_, _, f] = self.x.dims();
        let mut order: Vec<usize> = (0..f).collect();
        order.shuffle(rng);
        let indices: Vec<i64> = order.into_iter().map(|i| i as i64).collect();
        let device = self.x.device();
        let indices = Tensor::<B, 1, burn::tensor::Int>::from_data(
            TensorData::new(indices, [f]),
            &device,
        );
        Self {
            x: self.x.select(2, indices),
            ..self
        }
    }
}

/// Draws the context/query boundary for synthetic batches.
#[derive(Debug, Clone)]
pub enum EvalPosSampler {
    Fixed(usize),
    /// Uniform over `[0, max)`.
    Uniform { max: usize },
    /// Position `i` drawn with weight `1 / (max - i)`.
    Weighted { max: usize },
}

impl EvalPosSampler {
    pub fn from_name(name: &str, max: usize) -> Result<Self> {
        if max == 0 {
            return Err(TabPfnError::configuration(
                "eval position sampler needs a positive maximum",
            ));
        }
        match name {
            "fixed" => Ok(EvalPosSampler::Fixed(max)),
            "uniform" => Ok(EvalPosSampler::Uniform { max }),
            "weighted" => Ok(EvalPosSampler::Weighted { max }),
            other => Err(TabPfnError::configuration(format!(
                "eval position sampler not recognized: '{}'",
                other
            ))),
        }
    }

    pub fn sample(&self, rng: &mut StdRng) -> usize {
        match self {
            EvalPosSampler::Fixed(pos) => *pos,
            EvalPosSampler::Uniform { max } => rng.gen_range(0..*max),
            EvalPosSampler::Weighted { max } => {
                let weights: Vec<f64> = (0..*max).map(|i| 1.0 / (*max - i) as f64).collect();
                match WeightedIndex::new(&weights) {
                    Ok(dist) => dist.sample(rng),
                    Err(_) => 0,
                }
            }
        }
    }

    /// Largest split position this sampler can produce.
    pub fn max_position(&self) -> usize {
        match self {
            EvalPosSampler::Fixed(pos) => *pos,
            EvalPosSampler::Uniform { max } | EvalPosSampler::Weighted { max } => {
                max.saturating_sub(1)
            }
        }
    }
}

/// A restartable per-epoch sequence of batches.
pub trait BatchSource<B: Backend> {
    /// Feature width of every produced batch.
    fn num_features(&self) -> usize;

    /// Rows per batch window (`bptt`).
    fn window(&self) -> usize;

    fn batches_per_epoch(&self) -> usize;

    /// Lazily yields the batches of one epoch.
    fn epoch<'a>(&'a mut self, device: &'a B::Device) -> Box<dyn Iterator<Item = Batch<B>> + 'a>;

    /// Fixed held-out batch, if the source can score a model on its own.
    fn validation_batch(&self, _device: &B::Device) -> Option<Batch<B>> {
        None
    }
}

/// The two batch source variants, selected by the configured prior type.
#[derive(Debug, Clone)]
pub enum DataSource {
    Synthetic(SyntheticPrior),
    Real(RealDataSource),
}

impl DataSource {
    pub fn as_real(&self) -> Option<&RealDataSource> {
        match self {
            DataSource::Real(real) => Some(real),
            DataSource::Synthetic(_) => None,
        }
    }

    pub fn as_real_mut(&mut self) -> Option<&mut RealDataSource> {
        match self {
            DataSource::Real(real) => Some(real),
            DataSource::Synthetic(_) => None,
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, DataSource::Real(_))
    }
}

impl<B: Backend> BatchSource<B> for DataSource {
    fn num_features(&self) -> usize {
        match self {
            DataSource::Synthetic(prior) => BatchSource::<B>::num_features(prior),
            DataSource::Real(real) => BatchSource::<B>::num_features(real),
        }
    }

    fn window(&self) -> usize {
        match self {
            DataSource::Synthetic(prior) => BatchSource::<B>::window(prior),
            DataSource::Real(real) => BatchSource::<B>::window(real),
        }
    }

    fn batches_per_epoch(&self) -> usize {
        match self {
            DataSource::Synthetic(prior) => BatchSource::<B>::batches_per_epoch(prior),
            DataSource::Real(real) => BatchSource::<B>::batches_per_epoch(real),
        }
    }

    fn epoch<'a>(&'a mut self, device: &'a B::Device) -> Box<dyn Iterator<Item = Batch<B>> + 'a> {
        match self {
            DataSource::Synthetic(prior) => BatchSource::<B>::epoch(prior, device),
            DataSource::Real(real) => BatchSource::<B>::epoch(real, device),
        }
    }

    fn validation_batch(&self, device: &B::Device) -> Option<Batch<B>> {
        match self {
            DataSource::Synthetic(prior) => BatchSource::<B>::validation_batch(prior, device),
            DataSource::Real(real) => BatchSource::<B>::validation_batch(real, device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_sampler_names() {
        assert!(matches!(
            EvalPosSampler::from_name("fixed", 5),
            Ok(EvalPosSampler::Fixed(5))
        ));
        assert!(matches!(
            EvalPosSampler::from_name("triangular", 5),
            Err(TabPfnError::Configuration(_))
        ));
    }

    #[test]
    fn test_samplers_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let uniform = EvalPosSampler::Uniform { max: 7 };
        let weighted = EvalPosSampler::Weighted { max: 7 };
        for _ in 0..200 {
            assert!(uniform.sample(&mut rng) < 7);
            assert!(weighted.sample(&mut rng) < 7);
        }
        assert_eq!(EvalPosSampler::Fixed(4).sample(&mut rng), 4);
    }

    #[test]
    fn test_weighted_sampler_prefers_late_positions() {
        let mut rng = StdRng::seed_from_u64(9);
        let sampler = EvalPosSampler::Weighted { max: 10 };
        let draws: Vec<usize> = (0..2000).map(|_| sampler.sample(&mut rng)).collect();
        let last = draws.iter().filter(|&&d| d == 9).count();
        let first = draws.iter().filter(|&&d| d == 0).count();
        assert!(last > first);
    }

    #[test]
    fn test_query_targets_and_permutation() {
        let device = Default::default();
        let x: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let batch = Batch::<TestBackend>::from_host(x, vec![0.0, 1.0, 2.0, 3.0], 4, 1, 3, Some(1), &device);
        assert_eq!(batch.query_targets(Some(1)).dims(), [3, 1]);

        let mut rng = StdRng::seed_from_u64(0);
        let permuted = batch.clone().permute_features(&mut rng);
        let mut row: Vec<f32> = permuted
            .x
            .slice([0..1, 0..1, 0..3])
            .into_data()
            .iter::<f32>()
            .collect();
        row.sort_by(f32::total_cmp);
        assert_eq!(row, vec![0.0, 1.0, 2.0]);
    }
}
