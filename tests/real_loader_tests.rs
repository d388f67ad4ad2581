/// Real Data Loader Tests
///
/// Window inflation, feature padding and the batches a fixed real dataset
/// yields per epoch and for evaluation.

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use tabpfn_pt::tabpfn::data::{bagging_subsets, inflate_window, BatchSource, EvalSplit, RealDataSource};
use tabpfn_pt::test_utils::{parity_source, parity_split};
use tabpfn_pt::TabPfnError;

type TestBackend = Autodiff<NdArray<f32>>;

#[test]
fn test_inflation_makes_batches_divisible() {
    for n in [1usize, 7, 50, 97, 128, 301] {
        for bptt in [1usize, 3, 8, 16] {
            for k in [1usize, 2, 3, 5] {
                let window = inflate_window(n, bptt, k);
                assert!(window >= bptt, "window shrank for n={} bptt={} k={}", n, bptt, k);
                assert_eq!((n / window) % k, 0, "n={} bptt={} k={}", n, bptt, k);
                // the smallest such window is chosen
                if window > bptt {
                    assert_ne!((n / (window - 1)) % k, 0);
                }
            }
        }
    }
}

#[test]
fn test_epoch_batches_match_accumulation() {
    let device = Default::default();
    let mut source = parity_source(50, 8, 4, 6).unwrap();
    let window = BatchSource::<TestBackend>::window(&source);
    let per_epoch = BatchSource::<TestBackend>::batches_per_epoch(&source);
    assert_eq!(per_epoch % 4, 0);
    assert_eq!(per_epoch, 50 / window);

    let batches: Vec<_> = BatchSource::<TestBackend>::epoch(&mut source, &device).collect();
    assert_eq!(batches.len(), per_epoch);
    for batch in &batches {
        assert_eq!(batch.x.dims(), [window, 1, 6]);
        assert!(batch.single_eval_pos.is_none());
    }
}

#[test]
fn test_padding_appends_zero_columns() {
    let device = Default::default();
    let mut source = parity_source(16, 8, 1, 5).unwrap();
    let batch = BatchSource::<TestBackend>::epoch(&mut source, &device).next().unwrap();
    let values: Vec<f32> = batch.x.slice([0..8, 0..1, 3..5]).into_data().iter::<f32>().collect();
    assert!(values.iter().all(|&v| v == 0.0));
}

#[test]
fn test_too_many_features_is_validation_error() {
    let err = RealDataSource::new(parity_split(16, 4, 6), 5, 8, 1, 0).unwrap_err();
    assert!(matches!(err, TabPfnError::Validation(_)));
}

#[test]
fn test_eval_batches_condition_on_training_rows() {
    let device = Default::default();
    let mut source = parity_source(16, 8, 1, 3).unwrap();
    let batches = source.eval_batches::<TestBackend>(EvalSplit::Test, 5, &device);
    let covered: usize = batches
        .iter()
        .map(|b| b.seq_len() - b.single_eval_pos.unwrap_or(0))
        .sum();
    assert_eq!(covered, source.eval_len(EvalSplit::Test));
    assert!(batches.iter().all(|b| b.single_eval_pos == Some(5)));
}

#[test]
fn test_bagging_subsets_are_half_and_reseeded() {
    let subsets = bagging_subsets(30, 3, 7);
    assert_eq!(subsets.len(), 3);
    assert!(subsets.iter().all(|rows| rows.len() == 15));
    assert_eq!(subsets, bagging_subsets(30, 3, 7));
    assert_eq!(subsets[1], bagging_subsets(30, 1, 8)[0]);
}
