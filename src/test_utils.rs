// Test utilities for backend-aware tensor construction and small fixtures
//
// Datasets, splits and models here are tiny and deterministic so unit and
// integration tests can train for an epoch in well under a second.

use crate::tabpfn::architectures::{ModelConfig, PriorTransformer};
use crate::tabpfn::data::{RealDataSource, SplitData, SplitIndices, SplitPart, TabularDataset, TargetType};
use crate::tabpfn::errors::Result;
use burn::tensor::{backend::Backend, Tensor};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Create f32 tensor from data slice with specified shape
///
/// Panics when the data length does not match the shape.
pub fn tensor_from_f32_vec<B: Backend, const D: usize>(
    data: &[f32],
    shape: &[usize],
    device: &B::Device,
) -> Tensor<B, D> {
    let expected_size: usize = shape.iter().product();
    assert_eq!(
        data.len(),
        expected_size,
        "Data length {} doesn't match shape {:?} (expected {})",
        data.len(),
        shape,
        expected_size
    );
    let flat_tensor = Tensor::<B, 1>::from_floats(data, device);
    flat_tensor.reshape(burn::tensor::Shape::from(shape))
}

/// Host values of a float tensor, row-major.
pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Rows whose label is the parity of the first feature's integer part.
pub fn parity_part(rows: usize, features: usize, offset: usize) -> SplitPart {
    let x = Array2::from_shape_fn((rows, features), |(r, c)| ((r + offset) * (c + 1) % 7) as f64);
    let y = Array1::from_shape_fn(rows, |r| ((r + offset) % 2) as f64);
    SplitPart { x, y }
}

pub fn parity_split(n_train: usize, n_eval: usize, features: usize) -> SplitData {
    SplitData {
        train: parity_part(n_train, features, 0),
        val: parity_part(n_eval, features, 1000),
        test: parity_part(n_eval, features, 2000),
    }
}

/// Binary dataset with one categorical column and `folds` disjoint splits.
pub fn binary_dataset(rows: usize, features: usize, folds: usize) -> Result<TabularDataset> {
    let part = parity_part(rows, features, 0);
    let splits = (0..folds)
        .map(|fold| {
            let rows_in: Vec<usize> = (0..rows).collect();
            let rotated: Vec<usize> = rows_in.iter().map(|r| (r + fold) % rows).collect();
            let third = rows / 3;
            SplitIndices {
                train: rotated[..third].to_vec(),
                val: rotated[third..2 * third].to_vec(),
                test: rotated[2 * third..].to_vec(),
            }
        })
        .collect();
    TabularDataset::new("parity", part.x, part.y, vec![0], TargetType::Binary, 1)?.with_splits(splits)
}

/// Real source over [`parity_split`] with a window of `bptt`.
pub fn parity_source(n_train: usize, bptt: usize, k: usize, max_features: usize) -> Result<RealDataSource> {
    RealDataSource::new(parity_split(n_train, 8, 3), max_features, bptt, k, 0)
}

/// Small reference model with an optional prefix.
pub fn small_model<B: Backend>(
    num_features: usize,
    n_out: usize,
    prefix_size: usize,
    device: &B::Device,
) -> PriorTransformer<B> {
    let mut rng = StdRng::seed_from_u64(0);
    ModelConfig::new(num_features, n_out)
        .with_emsize(8, 2)
        .with_prefix_size(prefix_size)
        .init(device, &mut rng)
}
