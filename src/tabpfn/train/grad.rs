//! Gradient utilities used at accumulation boundaries and by boosting.
//!
//! Parameter gradients are addressed through a [`ModuleVisitor`] walk, so
//! only parameters that actually received a gradient (the trainable prefix
//! when everything else is frozen) are read or rescaled.

use crate::tabpfn::errors::{Result, TabPfnError};
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use std::collections::HashMap;

/// Weight of the current member's gradient when blending.
pub const CURRENT_GRADIENT_WEIGHT: f32 = 0.65;

/// Added to the norm before computing the clip coefficient.
const CLIP_EPS: f32 = 1e-6;

/// Elementwise `sqrt(0.65 c^2 + 0.35 p^2)`, negated wherever its sign
/// differs from the sign of `current`.
pub fn blend_gradients<B: Backend, const D: usize>(current: Tensor<B, D>, prior: Tensor<B, D>) -> Tensor<B, D> {
    let blended = (current.clone().powf_scalar(2.0) * CURRENT_GRADIENT_WEIGHT
        + prior.powf_scalar(2.0) * (1.0 - CURRENT_GRADIENT_WEIGHT))
        .sqrt();
    let flip = blended.clone().sign().not_equal(current.sign());
    blended.clone().mask_where(flip, blended.neg())
}

struct SquaredNorm<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    total: f64,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.total += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

struct Rescale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    factor: f32,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register::<B::InnerBackend, D>(id, grad * self.factor);
        }
    }
}

/// Global L2 norm over every parameter gradient of `module`.
pub fn global_norm<B, M>(module: &M, grads: &GradientsParams) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm::<B> {
        grads,
        total: 0.0,
        _backend: std::marker::PhantomData,
    };
    module.visit(&mut visitor);
    visitor.total.sqrt() as f32
}

/// Multiply every parameter gradient of `module` by `factor`.
pub fn scale_gradients<B, M>(module: &M, grads: &mut GradientsParams, factor: f32)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = Rescale::<B> {
        grads,
        factor,
        _backend: std::marker::PhantomData,
    };
    module.visit(&mut visitor);
}

/// Clip the global gradient norm to `max_norm` and return the norm before
/// clipping. Gradients under the limit are left untouched.
///
/// A non-finite norm is an [`TabPfnError::Optimization`] error: the step
/// that owns these gradients must be skipped.
pub fn clip_global_norm<B, M>(module: &M, grads: &mut GradientsParams, max_norm: f32) -> Result<f32>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_norm(module, grads);
    if !norm.is_finite() {
        return Err(TabPfnError::optimization(format!(
            "non-finite gradient norm {}",
            norm
        )));
    }
    let coef = max_norm / (norm + CLIP_EPS);
    if coef < 1.0 {
        scale_gradients(module, grads, coef);
    }
    Ok(norm)
}

/// Output gradients of the first boosting epoch, keyed by batch index.
///
/// `current` fills up while a member trains; [`OutputGradients::advance`]
/// hands it over as the `prior` the next member blends against.
#[derive(Debug)]
pub struct OutputGradients<B: Backend> {
    prior: Option<HashMap<usize, Tensor<B, 3>>>,
    current: HashMap<usize, Tensor<B, 3>>,
}

impl<B: Backend> Default for OutputGradients<B> {
    fn default() -> Self {
        Self {
            prior: None,
            current: HashMap::new(),
        }
    }
}

impl<B: Backend> OutputGradients<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, batch: usize, grad: Tensor<B, 3>) {
        self.current.insert(batch, grad);
    }

    /// Blend `grad` against the previous member's gradient for `batch`.
    ///
    /// Returns `grad` unchanged for the first member, or when the previous
    /// member saw no batch of this shape at that index.
    pub fn blend(&self, batch: usize, grad: Tensor<B, 3>) -> Tensor<B, 3> {
        let prior = match self.prior.as_ref().and_then(|prior| prior.get(&batch)) {
            Some(prior) => prior,
            None => return grad,
        };
        if prior.dims() != grad.dims() {
            log::warn!(
                "prior output gradient of batch {} has shape {:?}, expected {:?}; not blending",
                batch,
                prior.dims(),
                grad.dims()
            );
            return grad;
        }
        blend_gradients(grad, prior.clone())
    }

    pub fn has_prior(&self) -> bool {
        self.prior.is_some()
    }

    /// Make the gradients collected so far the prior of the next member.
    pub fn advance(&mut self) {
        self.prior = Some(self.current.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use burn::nn::{Linear, LinearConfig};
    use burn::tensor::TensorData;

    type TestBackend = Autodiff<NdArray<f32>>;
    type Inner = NdArray<f32>;

    fn inner(values: Vec<f32>, shape: [usize; 2]) -> Tensor<Inner, 2> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn linear_with_grads(scale: f32) -> (Linear<TestBackend>, GradientsParams) {
        let linear: Linear<TestBackend> = LinearConfig::new(2, 2).init(&Default::default());
        let mut grads = GradientsParams::new();
        grads.register::<Inner, 2>(linear.weight.id, inner(vec![scale; 4], [2, 2]));
        if let Some(bias) = &linear.bias {
            grads.register::<Inner, 1>(
                bias.id,
                Tensor::from_data(TensorData::new(vec![0.0f32; 2], [2]), &Default::default()),
            );
        }
        (linear, grads)
    }

    #[test]
    fn test_clip_scales_large_norm_to_max() {
        let (linear, mut grads) = linear_with_grads(3.0);
        let before = clip_global_norm(&linear, &mut grads, 1.0).unwrap();
        approx::assert_abs_diff_eq!(before, 6.0, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(global_norm(&linear, &grads), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_clip_leaves_small_norm_unchanged() {
        let (linear, mut grads) = linear_with_grads(0.25);
        clip_global_norm(&linear, &mut grads, 1.0).unwrap();
        let weight: Vec<f32> = grads
            .get::<Inner, 2>(linear.weight.id)
            .unwrap()
            .into_data()
            .iter::<f32>()
            .collect();
        assert_eq!(weight, vec![0.25; 4]);
    }

    #[test]
    fn test_clip_rejects_non_finite_norm() {
        let (linear, mut grads) = linear_with_grads(f32::NAN);
        let err = clip_global_norm(&linear, &mut grads, 1.0).unwrap_err();
        assert!(matches!(err, TabPfnError::Optimization(_)));
    }

    #[test]
    fn test_blend_follows_current_sign() {
        let current = inner(vec![-1.0, 2.0, 0.0, 3.0], [2, 2]);
        let prior = inner(vec![1.0, -2.0, 1.0, 3.0], [2, 2]);
        let blended: Vec<f32> = blend_gradients(current, prior).into_data().iter::<f32>().collect();
        let expected_zero_row = (0.35f32).sqrt();
        approx::assert_abs_diff_eq!(blended[0], -1.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(blended[1], 2.0, epsilon = 1e-6);
        // sign(0) differs from the positive blend, so it is flipped
        approx::assert_abs_diff_eq!(blended[2], -expected_zero_row, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(blended[3], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_output_gradients_hand_over() {
        let mut store = OutputGradients::<Inner>::new();
        let grad = Tensor::<Inner, 3>::from_data(TensorData::new(vec![2.0f32], [1, 1, 1]), &Default::default());
        assert!(!store.has_prior());
        let first: Vec<f32> = store.blend(0, grad.clone()).into_data().iter::<f32>().collect();
        assert_eq!(first, vec![2.0]);

        store.store(0, grad.clone() * 0.0);
        store.advance();
        let blended: Vec<f32> = store.blend(0, grad).into_data().iter::<f32>().collect();
        approx::assert_abs_diff_eq!(blended[0], (0.65f32 * 4.0).sqrt(), epsilon = 1e-6);
    }
}
