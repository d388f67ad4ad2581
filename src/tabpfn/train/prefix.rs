//! Tuned-prompt bookkeeping.
//!
//! A [`PrefixState`] owns the trainable prefix while an experiment swaps in
//! a concatenated one. The original is moved into `backup`, never copied or
//! recomputed, so restoring it yields the exact tensors and parameter ids
//! that were active before.

use crate::tabpfn::architectures::{PrefixEmbedding, PriorFittingModel};
use crate::tabpfn::errors::{Result, TabPfnError};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor, TensorData};
use ndarray::{Array1, Array2};
use ndarray_npy::write_npy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::Path;

/// How a concatenated prefix is brought back to the original size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeControl {
    /// First `size` rows of a random permutation.
    Permutation,
    /// An equal leading slice of every constituent prefix.
    Slices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatStrategy {
    /// The prefix concatenated with itself.
    Duplicate,
    /// The prefix followed by up to `k - 1` saved member prefixes.
    RandInit { k: usize, size_ctl: Option<SizeControl> },
}

impl ConcatStrategy {
    /// Parse `duplicate` or `rand-init[-size-ctl[-perm]]-<k>`.
    pub fn parse(name: &str) -> Result<Self> {
        if name == "duplicate" {
            return Ok(ConcatStrategy::Duplicate);
        }
        if !name.starts_with("rand-init") {
            return Err(TabPfnError::configuration(format!(
                "concat method not recognized: '{}'",
                name
            )));
        }
        let k = name
            .rsplit('-')
            .next()
            .and_then(|k| k.parse::<usize>().ok())
            .filter(|&k| k > 0)
            .ok_or_else(|| {
                TabPfnError::configuration(format!(
                    "concat method '{}' must end with a positive member count",
                    name
                ))
            })?;
        let size_ctl = name.contains("size-ctl").then(|| {
            if name.contains("perm") {
                SizeControl::Permutation
            } else {
                SizeControl::Slices
            }
        });
        Ok(ConcatStrategy::RandInit { k, size_ctl })
    }
}

/// A finished member's prefix, kept on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedPrefix {
    pub weights: Array2<f32>,
    pub y_labels: Array1<f32>,
}

impl SavedPrefix {
    pub fn from_embedding<B: Backend>(prefix: &PrefixEmbedding<B>) -> Result<Self> {
        let weight = prefix.weight();
        let [size, emsize] = weight.dims();
        let weights = Array2::from_shape_vec((size, emsize), weight.into_data().iter::<f32>().collect())
            .map_err(|err| TabPfnError::state(format!("prefix weight layout: {}", err)))?;
        let y_labels = Array1::from_vec(prefix.y_labels().into_data().iter::<f32>().collect());
        Ok(Self { weights, y_labels })
    }

    /// Write `prefix_weights_{member}.npy` and `prefix_y_labels_{member}.npy`.
    pub fn write(&self, dir: &Path, member: usize) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        write_npy(dir.join(format!("prefix_weights_{}.npy", member)), &self.weights)?;
        write_npy(dir.join(format!("prefix_y_labels_{}.npy", member)), &self.y_labels)?;
        Ok(())
    }

    fn tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (size, emsize) = self.weights.dim();
        (
            Tensor::from_data(TensorData::new(self.weights.iter().copied().collect(), [size, emsize]), device),
            Tensor::from_data(TensorData::new(self.y_labels.to_vec(), [size]), device),
        )
    }
}

#[derive(Debug, Clone)]
pub struct PrefixState<B: Backend> {
    active: PrefixEmbedding<B>,
    backup: Option<PrefixEmbedding<B>>,
}

impl<B: Backend> PrefixState<B> {
    pub fn new(prefix: PrefixEmbedding<B>) -> Self {
        Self {
            active: prefix,
            backup: None,
        }
    }

    pub fn active(&self) -> &PrefixEmbedding<B> {
        &self.active
    }

    pub fn is_concatenated(&self) -> bool {
        self.backup.is_some()
    }

    /// Swap in a concatenation of the active prefix and `saved`.
    pub fn concatenate(self, strategy: ConcatStrategy, saved: &[SavedPrefix], rng: &mut StdRng) -> Result<Self> {
        if self.is_concatenated() {
            return Err(TabPfnError::state("prefix is already concatenated"));
        }
        let original = self.active;
        let weight = original.weight();
        let labels = original.y_labels();
        let device = weight.device();
        let size = original.size();

        let (weight, labels) = match strategy {
            ConcatStrategy::Duplicate => (
                Tensor::cat(vec![weight.clone(), weight], 0),
                Tensor::cat(vec![labels.clone(), labels], 0),
            ),
            ConcatStrategy::RandInit { k, size_ctl } => {
                let num = k.min(saved.len() + 1);
                log::info!("concatenating {} prefixes", num);
                if num == 1 {
                    return Ok(Self {
                        active: original.clone(),
                        backup: Some(original),
                    });
                }
                let (mut weights, mut all_labels) = (vec![weight], vec![labels]);
                for prefix in &saved[..num - 1] {
                    let (w, l) = prefix.tensors::<B>(&device);
                    weights.push(w);
                    all_labels.push(l);
                }
                let weight = Tensor::cat(weights, 0);
                let labels = Tensor::cat(all_labels, 0);
                match size_ctl {
                    None => (weight, labels),
                    Some(control) => {
                        let rows = size_control_rows(control, weight.dims()[0], size, num, rng);
                        let index = Tensor::<B, 1, Int>::from_data(
                            TensorData::new(rows.clone(), [rows.len()]),
                            &device,
                        );
                        (weight.select(0, index.clone()), labels.select(0, index))
                    }
                }
            }
        };

        Ok(Self {
            active: PrefixEmbedding::from_tensors(weight, labels),
            backup: Some(original),
        })
    }

    /// Put the original prefix back. A no-op if nothing was concatenated.
    pub fn restore(self) -> Self {
        match self.backup {
            Some(original) => Self::new(original),
            None => self,
        }
    }

    pub fn into_active(self) -> PrefixEmbedding<B> {
        self.active
    }
}

fn size_control_rows(control: SizeControl, total: usize, size: usize, num: usize, rng: &mut StdRng) -> Vec<i64> {
    match control {
        SizeControl::Permutation => {
            let mut order: Vec<i64> = (0..total as i64).collect();
            order.shuffle(rng);
            order.truncate(size);
            order
        }
        SizeControl::Slices => {
            let per_member = size / num;
            (0..num)
                .flat_map(|j| {
                    let start = j * size;
                    (start..start + per_member).map(|row| row as i64)
                })
                .collect()
        }
    }
}

/// Run `f` on `model` with a concatenated prefix, then restore the original
/// prefix and re-freeze everything else.
pub fn with_concatenated_prefix<B, M, R>(
    model: M,
    strategy: ConcatStrategy,
    saved: &[SavedPrefix],
    rng: &mut StdRng,
    f: impl FnOnce(&M) -> R,
) -> Result<(M, R)>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
{
    let (model, prefix) = model.replace_prefix(None);
    let prefix = prefix.ok_or_else(|| TabPfnError::state("model has no prefix to concatenate"))?;
    let state = PrefixState::new(prefix).concatenate(strategy, saved, rng)?;
    let (model, _) = model.replace_prefix(Some(state.active().clone()));

    let result = f(&model);

    let (model, _) = model.replace_prefix(Some(state.restore().into_active()));
    Ok((model.freeze_parameters_except_prefix(), result))
}
