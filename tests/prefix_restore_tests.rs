/// Prefix Restore Tests
///
/// Every concatenation strategy followed by a restore must give back the
/// exact prefix tensors, labels and size, on the bare state and through a
/// model.

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tabpfn_pt::tabpfn::architectures::{PrefixEmbedding, PriorFittingModel};
use tabpfn_pt::tabpfn::train::prefix::with_concatenated_prefix;
use tabpfn_pt::tabpfn::train::{ConcatStrategy, PrefixState, SavedPrefix, SizeControl};
use tabpfn_pt::test_utils::{small_model, tensor_values};

type TestBackend = Autodiff<NdArray<f32>>;

fn strategies() -> Vec<ConcatStrategy> {
    vec![
        ConcatStrategy::Duplicate,
        ConcatStrategy::RandInit { k: 1, size_ctl: None },
        ConcatStrategy::RandInit { k: 3, size_ctl: None },
        ConcatStrategy::RandInit {
            k: 3,
            size_ctl: Some(SizeControl::Permutation),
        },
        ConcatStrategy::RandInit {
            k: 2,
            size_ctl: Some(SizeControl::Slices),
        },
    ]
}

fn saved(count: usize, size: usize, emsize: usize) -> Vec<SavedPrefix> {
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(99);
    (0..count)
        .map(|_| {
            let prefix = PrefixEmbedding::<TestBackend>::random(size, emsize, 2, &mut rng, &device);
            SavedPrefix::from_embedding(&prefix).unwrap()
        })
        .collect()
}

#[test]
fn test_restore_is_bit_identical_for_every_strategy() {
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(5);
    let others = saved(2, 4, 8);

    for strategy in strategies() {
        let prefix = PrefixEmbedding::<TestBackend>::random(4, 8, 2, &mut rng, &device);
        let weights = tensor_values(prefix.weight());
        let labels = tensor_values(prefix.y_labels());

        let state = PrefixState::new(prefix)
            .concatenate(strategy, &others, &mut rng)
            .unwrap();
        assert!(state.is_concatenated());
        let restored = state.restore();
        assert!(!restored.is_concatenated());

        let active = restored.into_active();
        assert_eq!(active.size(), 4, "{:?}", strategy);
        assert_eq!(tensor_values(active.weight()), weights, "{:?}", strategy);
        assert_eq!(tensor_values(active.y_labels()), labels, "{:?}", strategy);
    }
}

#[test]
fn test_concatenated_sizes() {
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(1);
    let others = saved(1, 4, 8);
    let cases = [
        (ConcatStrategy::Duplicate, 8),
        (ConcatStrategy::RandInit { k: 5, size_ctl: None }, 8),
        (
            ConcatStrategy::RandInit {
                k: 2,
                size_ctl: Some(SizeControl::Permutation),
            },
            4,
        ),
    ];
    for (strategy, size) in cases {
        let prefix = PrefixEmbedding::<TestBackend>::random(4, 8, 2, &mut rng, &device);
        let state = PrefixState::new(prefix).concatenate(strategy, &others, &mut rng).unwrap();
        assert_eq!(state.active().size(), size, "{:?}", strategy);
    }
}

#[test]
fn test_model_prefix_restored_and_refrozen() {
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(3);
    let model = small_model::<TestBackend>(3, 2, 4, &device).freeze_parameters_except_prefix();
    let before = tensor_values(model.prefix().unwrap().weight());
    let id_before = model.prefix().unwrap().weight.id;

    let (model, seen_size) = with_concatenated_prefix(
        model,
        ConcatStrategy::Duplicate,
        &[],
        &mut rng,
        |m| m.prefix().map(|p| p.size()),
    )
    .unwrap();

    assert_eq!(seen_size, Some(8));
    let prefix = model.prefix().unwrap();
    assert_eq!(prefix.size(), 4);
    assert_eq!(prefix.weight.id, id_before);
    assert_eq!(tensor_values(prefix.weight()), before);

    let x = burn::tensor::Tensor::<TestBackend, 3>::ones([6, 1, 3], &device);
    let y = burn::tensor::Tensor::<TestBackend, 2>::zeros([6, 1], &device);
    let grads = PriorFittingModel::forward(&model, x, y, Some(3)).sum().backward();
    assert!(prefix.weight().grad(&grads).is_some());
    assert!(prefix.y_labels().grad(&grads).is_none());
}
