//! Training configuration and its resolved, typed form.

use crate::tabpfn::data::{EvalPosSampler, PriorKind, SubsetMethod};
use crate::tabpfn::errors::{self, TabPfnError};
use crate::tabpfn::settings::Settings;
use crate::tabpfn::train::loss::LossKind;
use crate::tabpfn::train::prefix::ConcatStrategy;
use burn::config::Config;

/// Flat run configuration, persisted next to checkpoints.
///
/// String-valued policies are resolved by [`TrainingPlan::resolve`] before
/// any training work starts.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Optimization configuration
    #[config(default = 10)]
    pub epochs: usize,
    #[config(default = 100)]
    pub steps_per_epoch: usize,
    /// Tasks per synthetic batch
    #[config(default = 8)]
    pub batch_size: usize,
    /// Rows per batch window
    #[config(default = 128)]
    pub bptt: usize,
    pub bptt_extra_samples: Option<usize>,
    #[config(default = 1e-3)]
    pub lr: f64,
    #[config(default = 0.0)]
    pub weight_decay: f64,
    #[config(default = 1)]
    pub warmup_epochs: usize,
    #[config(default = 1)]
    pub aggregate_k_gradients: usize,
    #[config(default = 1.0)]
    pub clip_norm: f32,
    #[config(default = false)]
    pub train_mixed_precision: bool,
    #[config(default = 10)]
    pub validation_period: usize,
    #[config(default = 0)]
    pub seed: u64,

    /// Loss and data
    #[config(default = "String::from(\"cross_entropy\")")]
    pub loss: String,
    #[config(default = "String::from(\"gaussian\")")]
    pub prior_type: String,
    #[config(default = 10)]
    pub num_features: usize,
    #[config(default = 2)]
    pub num_classes: usize,
    #[config(default = 0.1)]
    pub noise_level: f32,
    pub eval_pos_sampler: Option<String>,
    pub max_eval_pos: Option<usize>,
    #[config(default = false)]
    pub permute_feature_position_in_ensemble: bool,

    /// Real datasets
    pub dataset_path: Option<String>,
    #[config(default = 0)]
    pub fold: usize,
    #[config(default = 100)]
    pub max_features: usize,
    #[config(default = 0)]
    pub subset_features: i64,
    #[config(default = 0)]
    pub subset_rows: i64,
    #[config(default = "String::from(\"random\")")]
    pub subset_features_method: String,
    #[config(default = "String::from(\"random\")")]
    pub subset_rows_method: String,

    /// Model
    #[config(default = 64)]
    pub emsize: usize,
    #[config(default = 4)]
    pub nhead: usize,

    /// Prompt tuning
    #[config(default = false)]
    pub prompt_tuning: bool,
    #[config(default = 10)]
    pub tuned_prompt_size: usize,
    #[config(default = "String::new()")]
    pub concat_method: String,

    /// Ensembling
    #[config(default = "String::from(\"none\")")]
    pub ensemble: String,
    #[config(default = 1)]
    pub boosting_n_iters: usize,
    #[config(default = 1e-3)]
    pub boosting_lr: f64,
    #[config(default = false)]
    pub average_ensemble: bool,

    /// Output
    #[config(default = "String::from(\"tabpfn_pt\")")]
    pub model_string: String,
    pub save_path: Option<String>,
    #[config(default = 10)]
    pub save_every_k_epochs: usize,
    /// Checkpoint to load model and optimizer state from
    pub resume_from: Option<String>,
}

/// Epochs, steps and members a CI run is capped to.
const CI_EPOCHS: usize = 1;
const CI_STEPS_PER_EPOCH: usize = 4;
const CI_MEMBERS: usize = 2;

impl TrainingConfig {
    /// Fill run-wide defaults from `settings`.
    ///
    /// An unset save path becomes `<paths.save_path>/<model_string>`. Under
    /// `testing.ci` the run is capped in epochs, steps and ensemble members.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if self.save_path.is_none() {
            let dir = settings.paths.save_path.join(&self.model_string);
            self.save_path = Some(dir.to_string_lossy().into_owned());
        }
        if settings.testing.ci {
            log::info!("CI run: capping epochs, steps and ensemble members");
            self.epochs = self.epochs.min(CI_EPOCHS);
            self.steps_per_epoch = self.steps_per_epoch.min(CI_STEPS_PER_EPOCH);
            self.boosting_n_iters = self.boosting_n_iters.min(CI_MEMBERS);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleStrategy {
    None,
    Boosting,
    Bagging,
    RandomReinit,
}

impl EnsembleStrategy {
    pub fn from_name(name: &str) -> errors::Result<Self> {
        match name {
            "" | "none" => Ok(EnsembleStrategy::None),
            "boosting" => Ok(EnsembleStrategy::Boosting),
            "bagging" => Ok(EnsembleStrategy::Bagging),
            "rand_init" | "random_reinit" => Ok(EnsembleStrategy::RandomReinit),
            other => Err(TabPfnError::configuration(format!(
                "ensemble strategy not recognized: '{}'",
                other
            ))),
        }
    }

    pub fn is_ensemble(self) -> bool {
        self != EnsembleStrategy::None
    }

    /// Whether non-improving members are zeroed out after combination.
    pub fn uses_acceptance_rule(self) -> bool {
        matches!(self, EnsembleStrategy::Boosting | EnsembleStrategy::RandomReinit)
    }
}

/// How members are combined into one output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Combination {
    /// `out_0 + sum(lr * out_i)`
    Additive { lr: f64 },
    Average,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataKind {
    Synthetic(PriorKind),
    Real,
}

/// Typed view of a [`TrainingConfig`].
#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub loss: LossKind,
    pub data: DataKind,
    pub sampler: Option<EvalPosSampler>,
    pub ensemble: EnsembleStrategy,
    pub members: usize,
    pub combination: Combination,
    pub concat: Option<ConcatStrategy>,
    pub subset_features_method: SubsetMethod,
    pub subset_rows_method: SubsetMethod,
    pub n_out: usize,
}

impl TrainingPlan {
    /// Resolve every policy name, failing fast on the first unknown one.
    pub fn resolve(config: &TrainingConfig) -> errors::Result<Self> {
        let loss = LossKind::from_name(&config.loss)?;
        let data = match config.prior_type.as_str() {
            "real" => DataKind::Real,
            other => DataKind::Synthetic(other.parse()?),
        };

        let sampler = match &config.eval_pos_sampler {
            Some(name) => {
                let max = config.max_eval_pos.unwrap_or(config.bptt / 2);
                Some(EvalPosSampler::from_name(name, max)?)
            }
            None => None,
        };

        let ensemble = EnsembleStrategy::from_name(&config.ensemble)?;
        if ensemble.is_ensemble() && data != DataKind::Real {
            return Err(TabPfnError::configuration(
                "ensembling needs held-out real data to score members",
            ));
        }
        if ensemble == EnsembleStrategy::Bagging && config.average_ensemble {
            log::warn!("average_ensemble has no effect for bagging");
        }

        let concat = if config.concat_method.is_empty() {
            None
        } else {
            if !config.prompt_tuning {
                return Err(TabPfnError::configuration(
                    "concat_method requires prompt_tuning",
                ));
            }
            Some(ConcatStrategy::parse(&config.concat_method)?)
        };

        if config.aggregate_k_gradients == 0 {
            return Err(TabPfnError::configuration(
                "aggregate_k_gradients must be at least 1",
            ));
        }
        if config.validation_period == 0 {
            return Err(TabPfnError::configuration(
                "validation_period must be at least 1",
            ));
        }

        let n_out = match loss {
            LossKind::GaussianNll => 2,
            LossKind::Mse | LossKind::BceWithLogits => 1,
            LossKind::CrossEntropy => config.num_classes,
        };

        Ok(Self {
            loss,
            data,
            sampler,
            ensemble,
            members: if ensemble.is_ensemble() {
                config.boosting_n_iters.max(1)
            } else {
                1
            },
            combination: if config.average_ensemble {
                Combination::Average
            } else {
                Combination::Additive {
                    lr: config.boosting_lr,
                }
            },
            concat,
            subset_features_method: config.subset_features_method.parse()?,
            subset_rows_method: config.subset_rows_method.parse()?,
            n_out,
        })
    }

    pub fn is_real(&self) -> bool {
        self.data == DataKind::Real
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_config() -> TrainingConfig {
        TrainingConfig::new().with_prior_type("real".to_string())
    }

    #[test]
    fn test_defaults_resolve() {
        let plan = TrainingPlan::resolve(&TrainingConfig::new()).unwrap();
        assert_eq!(plan.loss, LossKind::CrossEntropy);
        assert_eq!(plan.ensemble, EnsembleStrategy::None);
        assert_eq!(plan.members, 1);
        assert_eq!(plan.n_out, 2);
        assert!(plan.concat.is_none());
    }

    #[test]
    fn test_unknown_names_fail_fast() {
        for config in [
            TrainingConfig::new().with_loss("hinge".to_string()),
            TrainingConfig::new().with_prior_type("mlp".to_string()),
            real_config().with_ensemble("stacking".to_string()),
            TrainingConfig::new().with_subset_rows_method("mutual_info".to_string()),
            TrainingConfig::new().with_eval_pos_sampler(Some("beta".to_string())),
            real_config()
                .with_prompt_tuning(true)
                .with_concat_method("triplicate".to_string()),
        ] {
            assert!(matches!(
                TrainingPlan::resolve(&config),
                Err(TabPfnError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_ensembling_synthetic_rejected() {
        let config = TrainingConfig::new().with_ensemble("boosting".to_string());
        assert!(matches!(
            TrainingPlan::resolve(&config),
            Err(TabPfnError::Configuration(_))
        ));
    }

    #[test]
    fn test_acceptance_rule_scope() {
        assert!(EnsembleStrategy::Boosting.uses_acceptance_rule());
        assert!(EnsembleStrategy::RandomReinit.uses_acceptance_rule());
        assert!(!EnsembleStrategy::Bagging.uses_acceptance_rule());
    }

    #[test]
    fn test_settings_fill_save_path_and_cap_ci_runs() {
        let mut settings = Settings::default();
        let config = TrainingConfig::new()
            .with_epochs(20)
            .with_model_string("m".to_string())
            .with_settings(&settings);
        assert_eq!(config.save_path.as_deref(), Some("runs/m"));
        assert_eq!(config.epochs, 20);

        settings.testing.ci = true;
        let config = real_config()
            .with_epochs(20)
            .with_steps_per_epoch(100)
            .with_boosting_n_iters(5)
            .with_save_path(Some("elsewhere".to_string()))
            .with_settings(&settings);
        assert_eq!(config.save_path.as_deref(), Some("elsewhere"));
        assert_eq!((config.epochs, config.steps_per_epoch, config.boosting_n_iters), (1, 4, 2));
    }

    #[test]
    fn test_config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = real_config().with_boosting_n_iters(3).with_lr(5e-4);
        config.save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.boosting_n_iters, 3);
        assert_eq!(loaded.prior_type, "real");
        assert_eq!(loaded.lr, 5e-4);
    }
}
