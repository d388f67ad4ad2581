//  Copyright (c) Prior Labs GmbH 2025.

//! Prior-fitting model contract and the reference transformer.
//!
//! Tensor layout:
//! - input `x`: `[S, B, F]`, labels `y`: `[S, B]`
//! - output: `[S - single_eval_pos, B, n_out]`, one row per query
//!
//! With `single_eval_pos == None` every row is a query and only the prefix
//! (if any) serves as context.

use super::config::ModelConfig;
use burn::module::{AutodiffModule, Module, Param};
use burn::nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// What the training loop requires from a model.
pub trait PriorFittingModel<B: AutodiffBackend>: AutodiffModule<B> {
    fn forward(&self, x: Tensor<B, 3>, y: Tensor<B, 2>, single_eval_pos: Option<usize>) -> Tensor<B, 3>;

    /// Forward pass on the inner backend, with no autodiff graph.
    fn forward_inference(
        &self,
        x: Tensor<B::InnerBackend, 3>,
        y: Tensor<B::InnerBackend, 2>,
        single_eval_pos: Option<usize>,
    ) -> Tensor<B::InnerBackend, 3>;

    fn n_out(&self) -> usize;

    fn prefix(&self) -> Option<&PrefixEmbedding<B>>;

    /// Install `prefix` and hand back the one it replaces.
    fn replace_prefix(self, prefix: Option<PrefixEmbedding<B>>) -> (Self, Option<PrefixEmbedding<B>>);

    /// Draw new prefix values, keeping parameter ids.
    fn init_prefix_weights(self, rng: &mut StdRng) -> Self;

    /// Stop gradients everywhere except the prefix weight.
    fn freeze_parameters_except_prefix(self) -> Self {
        let (frozen, prefix) = self.no_grad().replace_prefix(None);
        frozen.replace_prefix(prefix.map(PrefixEmbedding::trainable)).0
    }
}

/// Learned prompt rows `[P, E]` with one label per row.
#[derive(Module, Debug)]
pub struct PrefixEmbedding<B: Backend> {
    pub weight: Param<Tensor<B, 2>>,
    pub y_labels: Param<Tensor<B, 1>>,
}

fn sample_prefix(size: usize, emsize: usize, n_out: usize, rng: &mut StdRng) -> (Vec<f32>, Vec<f32>) {
    let weight = (0..size * emsize)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    let labels = (0..size)
        .map(|_| rng.gen_range(0..n_out.max(1)) as f32)
        .collect();
    (weight, labels)
}

impl<B: Backend> PrefixEmbedding<B> {
    pub fn from_tensors(weight: Tensor<B, 2>, y_labels: Tensor<B, 1>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
            y_labels: Param::from_tensor(y_labels).set_require_grad(false),
        }
    }

    /// Standard-normal rows with labels drawn uniformly from `[0, n_out)`.
    pub fn random(size: usize, emsize: usize, n_out: usize, rng: &mut StdRng, device: &B::Device) -> Self {
        let (weight, labels) = sample_prefix(size, emsize, n_out, rng);
        Self::from_tensors(
            Tensor::from_data(TensorData::new(weight, [size, emsize]), device),
            Tensor::from_data(TensorData::new(labels, [size]), device),
        )
    }

    pub fn size(&self) -> usize {
        self.weight.val().dims()[0]
    }

    pub fn weight(&self) -> Tensor<B, 2> {
        self.weight.val()
    }

    pub fn y_labels(&self) -> Tensor<B, 1> {
        self.y_labels.val()
    }

    pub fn trainable(self) -> Self {
        Self {
            weight: self.weight.set_require_grad(true),
            y_labels: self.y_labels,
        }
    }

    /// New values under the existing parameter ids.
    pub fn reinitialized(self, n_out: usize, rng: &mut StdRng) -> Self {
        let current = self.weight.val();
        let [size, emsize] = current.dims();
        let device = current.device();
        let (weight, labels) = sample_prefix(size, emsize, n_out, rng);
        let weight = Tensor::<B, 2>::from_data(TensorData::new(weight, [size, emsize]), &device);
        let labels = Tensor::<B, 1>::from_data(TensorData::new(labels, [size]), &device);
        Self {
            weight: Param::initialized(self.weight.id, weight.require_grad()),
            y_labels: Param::initialized(self.y_labels.id, labels),
        }
    }
}

/// Single attention block: queries attend to prefix and context rows.
#[derive(Module, Debug)]
pub struct PriorTransformer<B: Backend> {
    x_encoder: Linear<B>,
    y_encoder: Linear<B>,
    attention: MultiHeadAttention<B>,
    norm: LayerNorm<B>,
    decoder: Linear<B>,
    prefix: Option<PrefixEmbedding<B>>,
    n_out: usize,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device, rng: &mut StdRng) -> PriorTransformer<B> {
        let prefix = (self.prefix_size > 0)
            .then(|| PrefixEmbedding::random(self.prefix_size, self.emsize, self.n_out, rng, device));
        PriorTransformer {
            x_encoder: LinearConfig::new(self.num_features, self.emsize).init(device),
            y_encoder: LinearConfig::new(1, self.emsize).init(device),
            attention: MultiHeadAttentionConfig::new(self.emsize, self.nhead)
                .with_dropout(self.dropout)
                .init(device),
            norm: LayerNormConfig::new(self.emsize).init(device),
            decoder: LinearConfig::new(self.emsize, self.n_out).init(device),
            prefix,
            n_out: self.n_out,
        }
    }
}

impl<B: Backend> PriorTransformer<B> {
    pub fn forward(&self, x: Tensor<B, 3>, y: Tensor<B, 2>, single_eval_pos: Option<usize>) -> Tensor<B, 3> {
        let [s, b, _] = x.dims();
        let pos = single_eval_pos.unwrap_or(0).min(s);
        let embedded = self.x_encoder.forward(x);
        let e = embedded.dims()[2];

        let mut context = Vec::with_capacity(2);
        if let Some(prefix) = &self.prefix {
            let p = prefix.size();
            let labels = prefix.y_labels().detach().reshape([p, 1, 1]);
            let rows = prefix.weight().reshape([p, 1, e]) + self.y_encoder.forward(labels);
            context.push(rows.repeat_dim(1, b));
        }
        if pos > 0 {
            let labels = y.slice([0..pos, 0..b]).reshape([pos, b, 1]);
            let rows = embedded.clone().slice([0..pos, 0..b, 0..e]) + self.y_encoder.forward(labels);
            context.push(rows);
        }

        let queries = embedded.slice([pos..s, 0..b, 0..e]);
        let hidden = if context.is_empty() {
            queries
        } else {
            let context = Tensor::cat(context, 0).swap_dims(0, 1);
            let attended = self
                .attention
                .forward(MhaInput::new(queries.clone().swap_dims(0, 1), context.clone(), context))
                .context
                .swap_dims(0, 1);
            self.norm.forward(queries + attended)
        };
        self.decoder.forward(hidden)
    }
}

impl<B: AutodiffBackend> PriorFittingModel<B> for PriorTransformer<B> {
    fn forward(&self, x: Tensor<B, 3>, y: Tensor<B, 2>, single_eval_pos: Option<usize>) -> Tensor<B, 3> {
        PriorTransformer::forward(self, x, y, single_eval_pos)
    }

    fn forward_inference(
        &self,
        x: Tensor<B::InnerBackend, 3>,
        y: Tensor<B::InnerBackend, 2>,
        single_eval_pos: Option<usize>,
    ) -> Tensor<B::InnerBackend, 3> {
        self.valid().forward(x, y, single_eval_pos)
    }

    fn n_out(&self) -> usize {
        self.n_out
    }

    fn prefix(&self) -> Option<&PrefixEmbedding<B>> {
        self.prefix.as_ref()
    }

    fn replace_prefix(mut self, prefix: Option<PrefixEmbedding<B>>) -> (Self, Option<PrefixEmbedding<B>>) {
        let previous = std::mem::replace(&mut self.prefix, prefix);
        (self, previous)
    }

    fn init_prefix_weights(mut self, rng: &mut StdRng) -> Self {
        let n_out = self.n_out;
        self.prefix = self.prefix.map(|prefix| prefix.reinitialized(n_out, rng));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn inputs(s: usize, b: usize, f: usize) -> (Tensor<TestBackend, 3>, Tensor<TestBackend, 2>) {
        let device = Default::default();
        let x: Vec<f32> = (0..s * b * f).map(|v| (v % 7) as f32 * 0.1).collect();
        let y: Vec<f32> = (0..s * b).map(|v| (v % 3) as f32).collect();
        (
            Tensor::from_data(TensorData::new(x, [s, b, f]), &device),
            Tensor::from_data(TensorData::new(y, [s, b]), &device),
        )
    }

    #[test]
    fn test_output_covers_query_rows() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let model: PriorTransformer<TestBackend> =
            ModelConfig::new(5, 3).with_emsize(8, 2).init(&device, &mut rng);
        let (x, y) = inputs(10, 2, 5);
        assert_eq!(PriorTransformer::forward(&model, x.clone(), y.clone(), Some(4)).dims(), [6, 2, 3]);
        assert_eq!(PriorTransformer::forward(&model, x, y, None).dims(), [10, 2, 3]);
    }

    #[test]
    fn test_prefix_only_context() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(1);
        let model: PriorTransformer<TestBackend> = ModelConfig::new(5, 3)
            .with_emsize(8, 2)
            .with_prefix_size(4)
            .init(&device, &mut rng);
        assert_eq!(model.prefix().map(PrefixEmbedding::size), Some(4));
        let (x, y) = inputs(6, 1, 5);
        assert_eq!(PriorTransformer::forward(&model, x, y, Some(0)).dims(), [6, 1, 3]);
    }

    #[test]
    fn test_freeze_leaves_only_prefix_trainable() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(2);
        let model: PriorTransformer<TestBackend> = ModelConfig::new(5, 3)
            .with_emsize(8, 2)
            .with_prefix_size(2)
            .init(&device, &mut rng)
            .freeze_parameters_except_prefix();
        let (x, y) = inputs(8, 1, 5);
        let grads = PriorTransformer::forward(&model, x, y, Some(3)).sum().backward();
        let prefix = model.prefix().unwrap();
        assert!(prefix.weight().grad(&grads).is_some());
        assert!(prefix.y_labels().grad(&grads).is_none());
        assert!(model.decoder.weight.val().grad(&grads).is_none());
        assert!(model.x_encoder.weight.val().grad(&grads).is_none());
    }

    #[test]
    fn test_reinit_keeps_ids_and_changes_values() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(3);
        let model: PriorTransformer<TestBackend> = ModelConfig::new(5, 3)
            .with_emsize(8, 2)
            .with_prefix_size(3)
            .init(&device, &mut rng);
        let before = model.prefix().unwrap();
        let (id, values) = (before.weight.id, before.weight().into_data().iter::<f32>().collect::<Vec<_>>());
        let model = model.init_prefix_weights(&mut rng);
        let after = model.prefix().unwrap();
        assert_eq!(after.weight.id, id);
        assert_ne!(after.weight().into_data().iter::<f32>().collect::<Vec<_>>(), values);
    }

    #[test]
    fn test_inference_forward_matches_and_skips_dropout() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(5);
        let model: PriorTransformer<TestBackend> =
            ModelConfig::new(5, 3).with_emsize(8, 2).init(&device, &mut rng);
        let (x, y) = inputs(10, 2, 5);
        let graph: Vec<f32> = PriorFittingModel::forward(&model, x.clone(), y.clone(), Some(4))
            .into_data()
            .iter::<f32>()
            .collect();
        let plain: Vec<f32> = model
            .forward_inference(x.clone().inner(), y.clone().inner(), Some(4))
            .into_data()
            .iter::<f32>()
            .collect();
        for (a, b) in graph.iter().zip(&plain) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }

        let noisy: PriorTransformer<TestBackend> = ModelConfig {
            dropout: 0.5,
            ..ModelConfig::new(5, 3).with_emsize(8, 2)
        }
        .init(&device, &mut rng);
        let run = |x: Tensor<TestBackend, 3>, y: Tensor<TestBackend, 2>| -> Vec<f32> {
            noisy
                .forward_inference(x.inner(), y.inner(), Some(4))
                .into_data()
                .iter::<f32>()
                .collect()
        };
        assert_eq!(run(x.clone(), y.clone()), run(x, y));
    }
}
