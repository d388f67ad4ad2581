/// Ensemble Combination Tests
///
/// Additive and averaged combination over three members, the acceptance
/// rule that zeroes non-improving members, and the summary document.

use ndarray::{array, Array2};
use serde_json::Value;
use tabpfn_pt::tabpfn::train::evaluation::accuracy;
use tabpfn_pt::tabpfn::train::report::ENSEMBLE_SUMMARY_FILE;
use tabpfn_pt::tabpfn::train::{Combination, EnsembleRun, EnsembleStrategy};

fn targets() -> Vec<i64> {
    vec![0, 1, 1, 0]
}

/// Gets rows 0 and 1 right.
fn first_member() -> Array2<f32> {
    array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.5], [0.2, 0.8]]
}

#[test]
fn test_three_member_boosting_matches_manual_sum() {
    let lr = 0.5;
    let second = array![[0.0, 0.0], [0.0, 0.0], [0.0, 2.0], [0.0, 0.0]];
    let third = array![[0.0, 0.0], [0.0, 0.0], [0.0, 0.0], [2.0, 0.0]];

    let mut run = EnsembleRun::new(
        EnsembleStrategy::Boosting,
        Combination::Additive { lr },
        first_member(),
        targets(),
        0.5,
    )
    .unwrap();
    let two = run.add_member(second.clone()).unwrap();
    let three = run.add_member(third.clone()).unwrap();
    assert!(two.accepted && three.accepted);

    let manual = first_member() + &(second * lr as f32) + &(third * lr as f32);
    assert_eq!(run.combined(), manual);
    assert_eq!(three.record.accuracy, accuracy(&manual, &targets()));
    assert_eq!(three.record.accuracy, 1.0);
}

#[test]
fn test_equal_accuracy_is_rejected_and_zeroed() {
    let mut run = EnsembleRun::new(
        EnsembleStrategy::Boosting,
        Combination::Additive { lr: 1.0 },
        first_member(),
        targets(),
        0.5,
    )
    .unwrap();
    // Flips row 2 right and row 1 wrong: same accuracy.
    let outcome = run
        .add_member(array![[0.0, 0.0], [2.0, 0.0], [0.0, 2.0], [0.0, 0.0]])
        .unwrap();
    assert!(!outcome.accepted);
    assert_eq!(run.output(1).unwrap(), &Array2::<f32>::zeros((4, 2)));
    assert_eq!(run.records()[&1], run.records()[&0]);
    assert_eq!(run.combined(), first_member());
}

#[test]
fn test_average_combination_over_random_reinit_members() {
    let mut run = EnsembleRun::new(
        EnsembleStrategy::RandomReinit,
        Combination::Average,
        first_member(),
        targets(),
        0.5,
    )
    .unwrap();
    let better = array![[1.0, 0.0], [0.0, 1.0], [0.0, 3.0], [3.0, 0.0]];
    let outcome = run.add_member(better.clone()).unwrap();
    assert!(outcome.accepted);
    assert_eq!(run.combined(), (first_member() + &better) / 2.0);
}

#[test]
fn test_summary_has_one_entry_per_member() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = EnsembleRun::new(
        EnsembleStrategy::Bagging,
        Combination::Average,
        first_member(),
        targets(),
        0.5,
    )
    .unwrap();
    run.add_member(first_member()).unwrap();
    run.add_member(first_member()).unwrap();
    run.write_summary(dir.path()).unwrap();

    let text = std::fs::read_to_string(dir.path().join(ENSEMBLE_SUMMARY_FILE)).unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    let members = value.as_object().unwrap();
    assert_eq!(members.len(), 3);
    for key in ["0", "1", "2"] {
        let record = &members[key];
        assert!(record["accuracy"].is_number());
        assert!(record["ece"].is_number());
        assert!(record["tace"].is_number());
    }
}
