//! Training: losses, the step engine, prompt-tuning prefixes, ensembling
//! and the artifacts a run leaves behind.

pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod ensemble;
pub mod evaluation;
pub mod grad;
pub mod loss;
pub mod precision;
pub mod prefix;
pub mod report;
pub mod run;
pub mod schedule;
pub mod step;

pub use checkpoint::CheckpointManager;
pub use config::{Combination, DataKind, EnsembleStrategy, TrainingConfig, TrainingPlan};
pub use distributed::{DistributedContext, GradientSync, LocalGradientSync};
pub use ensemble::{EnsembleRun, MemberOutcome};
pub use evaluation::{Calibration, EvalResult};
pub use grad::{clip_global_norm, OutputGradients};
pub use loss::LossKind;
pub use prefix::{ConcatStrategy, PrefixState, SavedPrefix, SizeControl};
pub use report::{EnsembleRecord, EpochLog};
pub use run::{train, train_with_sync, InterruptFlag, TrainOutcome};
pub use step::{EpochStats, StepEngine, StepOptions};
