//! Ensemble bookkeeping shared by boosting, bagging and random-reinit.
//!
//! Every member contributes its held-out outputs. After each member the
//! outputs are combined and scored against the member-0 targets. Under the
//! acceptance rule a member whose combination does not beat the previous
//! record is zeroed and the record carries over.

use super::config::{Combination, EnsembleStrategy};
use super::evaluation::{accuracy, Calibration};
use super::report::{write_ensemble_summary, EnsembleRecord};
use crate::tabpfn::errors::{Result, TabPfnError};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;

/// Outcome of adding one member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberOutcome {
    pub member: usize,
    pub accepted: bool,
    pub record: EnsembleRecord,
}

#[derive(Debug, Clone)]
pub struct EnsembleRun {
    strategy: EnsembleStrategy,
    combination: Combination,
    outputs: Vec<Array2<f32>>,
    targets: Vec<i64>,
    records: BTreeMap<usize, EnsembleRecord>,
}

fn record(score: f64, calibration: Calibration) -> EnsembleRecord {
    EnsembleRecord {
        accuracy: score,
        ece: calibration.ece,
        tace: calibration.tace,
    }
}

impl EnsembleRun {
    /// Start from the first member's outputs, targets and validation score.
    pub fn new(
        strategy: EnsembleStrategy,
        combination: Combination,
        first_output: Array2<f32>,
        targets: Vec<i64>,
        first_score: f64,
    ) -> Result<Self> {
        if first_output.nrows() != targets.len() {
            return Err(TabPfnError::validation(format!(
                "{} output rows for {} targets",
                first_output.nrows(),
                targets.len()
            )));
        }
        let calibration = Calibration::of_outputs(&first_output, &targets);
        let mut records = BTreeMap::new();
        records.insert(0, record(first_score, calibration));
        Ok(Self {
            strategy,
            combination,
            outputs: vec![first_output],
            targets,
            records,
        })
    }

    pub fn members(&self) -> usize {
        self.outputs.len()
    }

    pub fn records(&self) -> &BTreeMap<usize, EnsembleRecord> {
        &self.records
    }

    pub fn output(&self, member: usize) -> Option<&Array2<f32>> {
        self.outputs.get(member)
    }

    /// Combination of every member recorded so far.
    pub fn combined(&self) -> Array2<f32> {
        let mut combined = self.outputs[0].clone();
        match self.combination {
            Combination::Average => {
                for output in &self.outputs[1..] {
                    combined += output;
                }
                combined /= self.outputs.len() as f32;
            }
            Combination::Additive { lr } => {
                for output in &self.outputs[1..] {
                    combined.scaled_add(lr as f32, output);
                }
            }
        }
        combined
    }

    /// Record the next member and apply the acceptance rule.
    pub fn add_member(&mut self, output: Array2<f32>) -> Result<MemberOutcome> {
        if output.dim() != self.outputs[0].dim() {
            return Err(TabPfnError::validation(format!(
                "member output shape {:?} differs from {:?}",
                output.dim(),
                self.outputs[0].dim()
            )));
        }
        let member = self.outputs.len();
        self.outputs.push(output);

        let combined = self.combined();
        let score = accuracy(&combined, &self.targets);
        let previous = self.records[&(member - 1)];

        let accepted = !(self.strategy.uses_acceptance_rule() && score <= previous.accuracy);
        let current = if accepted {
            log::info!("ensembling accuracy is now {}", score);
            record(score, Calibration::of_outputs(&combined, &self.targets))
        } else {
            log::info!(
                "ensembling accuracy did not improve ({} <= {}), ignoring member {}",
                score,
                previous.accuracy,
                member
            );
            self.outputs[member].fill(0.0);
            previous
        };
        self.records.insert(member, current);
        Ok(MemberOutcome {
            member,
            accepted,
            record: current,
        })
    }

    pub fn write_summary(&self, dir: &Path) -> Result<()> {
        let path = write_ensemble_summary(dir, &self.records)?;
        log::debug!("saved ensembling summary to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn run(strategy: EnsembleStrategy, combination: Combination) -> EnsembleRun {
        // member 0 gets rows 0 and 1 right, row 2 wrong
        let first = array![[2.0, 0.0], [0.0, 2.0], [1.0, 0.0]];
        EnsembleRun::new(strategy, combination, first, vec![0, 1, 1], 0.667).unwrap()
    }

    #[test]
    fn test_additive_combination_matches_manual_sum() {
        let mut run = run(EnsembleStrategy::Boosting, Combination::Additive { lr: 0.5 });
        let second = array![[0.0, 0.0], [0.0, 0.0], [0.0, 4.0]];
        let outcome = run.add_member(second.clone()).unwrap();
        assert!(outcome.accepted);

        let manual = run.output(0).unwrap() + &(second * 0.5);
        assert_eq!(run.combined(), manual);
        assert_eq!(outcome.record.accuracy, 1.0);
    }

    #[test]
    fn test_non_improving_member_is_zeroed() {
        let mut run = run(EnsembleStrategy::RandomReinit, Combination::Additive { lr: 1.0 });
        let outcome = run.add_member(array![[0.0, 0.1], [0.0, 0.0], [0.0, 0.0]]).unwrap();
        assert!(!outcome.accepted);
        assert!(run.output(1).unwrap().iter().all(|&v| v == 0.0));
        assert_eq!(run.records()[&1], run.records()[&0]);
    }

    #[test]
    fn test_bagging_keeps_every_member() {
        let mut run = run(EnsembleStrategy::Bagging, Combination::Average);
        let outcome = run.add_member(array![[0.0, 5.0], [0.0, 0.0], [0.0, 0.0]]).unwrap();
        assert!(outcome.accepted);
        assert!(outcome.record.accuracy < 0.667);
        assert_eq!(run.combined()[[0, 1]], 2.5);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut run = run(EnsembleStrategy::Boosting, Combination::Average);
        assert!(matches!(
            run.add_member(array![[0.0, 1.0]]),
            Err(TabPfnError::Validation(_))
        ));
    }
}
