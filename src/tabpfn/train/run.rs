//! Top-level training: epochs, validation, checkpoints and ensemble members.
//!
//! Member 0 trains on the configured source. While ensembling, every further
//! member reseeds, re-draws the prefix and trains with the same optimizer;
//! its validation outputs are combined with the earlier members' and scored.
//! Under boosting the first epoch of member `i` blends the output gradients
//! stored while training member `i - 1`.

use super::checkpoint::{self, CheckpointManager};
use super::config::{EnsembleStrategy, TrainingConfig, TrainingPlan};
use super::distributed::{DistributedContext, GradientSync};
use super::ensemble::EnsembleRun;
use super::evaluation::{evaluate_batch, evaluate_real, EvalResult};
use super::grad::OutputGradients;
use super::precision::LossScaler;
use super::prefix::{with_concatenated_prefix, SavedPrefix};
use super::report::{flatten_config, write_config, ConfigEntry, EnsembleRecord, EpochLog};
use super::schedule::CosineWarmup;
use super::step::{EpochStats, StepEngine, StepOptions};
use crate::tabpfn::architectures::PriorFittingModel;
use crate::tabpfn::data::{bagging_subsets, BatchSource, DataSource, EvalSplit, RealDataSource};
use crate::tabpfn::errors::{Result, TabPfnError};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Set from a signal handler; checked between epochs.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the main process gets back from [`train`].
#[derive(Debug)]
pub struct TrainOutcome<M> {
    pub model: M,
    /// Mean loss of the last trained epoch.
    pub mean_loss: f64,
    pub positional_losses: Vec<f64>,
    pub last_log: Option<EpochLog>,
    /// Per-member ensemble records, present while ensembling.
    pub ensemble: Option<BTreeMap<usize, EnsembleRecord>>,
    pub interrupted: bool,
}

struct MemberResult {
    stats: EpochStats,
    last_log: Option<EpochLog>,
    /// Validation outputs of the last epoch that ran validation.
    eval: Option<EvalResult>,
}

struct Run<'a, B, M, O>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
    O: Optimizer<M, B>,
{
    config: &'a TrainingConfig,
    plan: TrainingPlan,
    engine: StepEngine<B, M, O>,
    schedule: CosineWarmup,
    source: DataSource,
    ctx: DistributedContext,
    interrupt: &'a InterruptFlag,
    device: &'a B::Device,
    save_dir: Option<PathBuf>,
    checkpoints: Option<CheckpointManager>,
    output_gradients: OutputGradients<B::InnerBackend>,
    saved_prefixes: Vec<SavedPrefix>,
    rng: StdRng,
    started: Instant,
}

/// Train `model` on `source` as configured, in a single process.
///
/// Returns `Some` on the main process only. An interrupt stops the current
/// member after its running epoch and skips the remaining members; the
/// ensemble summary is still written. A context spanning several processes
/// is rejected: use [`train_with_sync`] and supply the gradient reduction.
pub fn train<B, M>(
    model: M,
    source: DataSource,
    config: &TrainingConfig,
    ctx: DistributedContext,
    interrupt: &InterruptFlag,
    device: &B::Device,
) -> Result<Option<TrainOutcome<M>>>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
{
    run_training(model, source, config, ctx, None, interrupt, device)
}

/// [`train`] with `sync` reducing gradients across the processes of `ctx`.
pub fn train_with_sync<B, M>(
    model: M,
    source: DataSource,
    config: &TrainingConfig,
    ctx: DistributedContext,
    sync: Box<dyn GradientSync>,
    interrupt: &InterruptFlag,
    device: &B::Device,
) -> Result<Option<TrainOutcome<M>>>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
{
    run_training(model, source, config, ctx, Some(sync), interrupt, device)
}

fn run_training<B, M>(
    model: M,
    source: DataSource,
    config: &TrainingConfig,
    ctx: DistributedContext,
    sync: Option<Box<dyn GradientSync>>,
    interrupt: &InterruptFlag,
    device: &B::Device,
) -> Result<Option<TrainOutcome<M>>>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
{
    if ctx.is_distributed() && sync.is_none() {
        return Err(TabPfnError::configuration(format!(
            "rank {} of {}: training across processes needs a gradient sync",
            ctx.rank, ctx.world_size
        )));
    }
    let plan = TrainingPlan::resolve(config)?;
    if plan.is_real() != source.is_real() {
        return Err(TabPfnError::configuration(format!(
            "prior_type '{}' does not match the data source",
            config.prior_type
        )));
    }
    if model.n_out() != plan.n_out {
        return Err(TabPfnError::configuration(format!(
            "model has {} outputs, the {:?} loss needs {}",
            model.n_out(),
            plan.loss,
            plan.n_out
        )));
    }
    let model = if config.prompt_tuning {
        if model.prefix().is_none() {
            return Err(TabPfnError::configuration(
                "prompt tuning needs a model with a prefix",
            ));
        }
        model.freeze_parameters_except_prefix()
    } else {
        model
    };

    let weight_decay = (config.weight_decay > 0.0).then(|| WeightDecayConfig::new(config.weight_decay as f32));
    let optimizer = AdamConfig::new()
        .with_weight_decay(weight_decay)
        .init::<B, M>();
    let (model, optimizer) = match config.resume_from.as_ref() {
        Some(path) => checkpoint::resume(model, optimizer, Path::new(path), device)?,
        None => (model, optimizer),
    };

    let bptt = BatchSource::<B>::window(&source);
    let options = StepOptions {
        loss: plan.loss,
        aggregate_k_gradients: config.aggregate_k_gradients,
        clip_norm: config.clip_norm,
        boosting: plan.ensemble == EnsembleStrategy::Boosting,
        permute_features: config.permute_feature_position_in_ensemble,
        bptt,
    };
    let mut engine = StepEngine::new(optimizer, options, config.seed);
    if config.train_mixed_precision {
        engine = engine.with_loss_scaler(LossScaler::default());
    }
    if let Some(sync) = sync {
        engine = engine.with_gradient_sync(sync);
    }

    let save_dir = config.save_path.as_ref().map(PathBuf::from);
    let checkpoints = match (&save_dir, ctx.is_main() && !plan.ensemble.is_ensemble()) {
        (Some(dir), true) => Some(CheckpointManager::new(dir, config.model_string.clone())?),
        _ => None,
    };

    let run = Run {
        config,
        plan,
        engine,
        schedule: CosineWarmup::new(config.lr, config.warmup_epochs, config.epochs),
        source,
        ctx,
        interrupt,
        device,
        save_dir,
        checkpoints,
        output_gradients: OutputGradients::new(),
        saved_prefixes: Vec::new(),
        rng: StdRng::seed_from_u64(config.seed),
        started: Instant::now(),
    };
    run.persist_config(&model)?;
    run.execute(model)
}

impl<B, M, O> Run<'_, B, M, O>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
    O: Optimizer<M, B>,
{
    fn is_ensemble(&self) -> bool {
        self.plan.ensemble.is_ensemble()
    }

    fn persist_config(&self, model: &M) -> Result<()> {
        let Some(dir) = self.save_dir.as_ref().filter(|_| self.ctx.is_main()) else {
            return Ok(());
        };
        let mut extra = vec![
            ("n_out".to_string(), ConfigEntry::Value(serde_json::json!(self.plan.n_out))),
            (
                "bptt".to_string(),
                ConfigEntry::Value(serde_json::json!(BatchSource::<B>::window(&self.source))),
            ),
            (
                "scheduler".to_string(),
                ConfigEntry::Callable("cosine_with_warmup".to_string()),
            ),
            ("device".to_string(), ConfigEntry::opaque(self.device)),
        ];
        if let Some(prefix) = model.prefix() {
            extra.push((
                "prefix".to_string(),
                ConfigEntry::Tensor {
                    shape: prefix.weight().dims().to_vec(),
                },
            ));
        }
        let flat = flatten_config(self.config, extra)?;
        let path = write_config(dir, &self.config.model_string, &flat)?;
        log::info!("saved run configuration to {}", path.display());
        Ok(())
    }

    fn execute(mut self, model: M) -> Result<Option<TrainOutcome<M>>> {
        let subsets = match (&self.source, self.plan.ensemble) {
            (DataSource::Real(real), EnsembleStrategy::Bagging) => {
                bagging_subsets(real.train_len(), self.plan.members, self.config.seed)
            }
            _ => Vec::new(),
        };
        if let (Some(rows), Some(real)) = (subsets.first(), self.source.as_real_mut()) {
            real.restrict_to(rows.clone());
        }

        log::info!("starting training loop");
        let (mut model, first) = self.train_member(model, 0)?;
        self.output_gradients.advance();
        model = self.save_prefix(model, 0)?;

        let mut ensemble = None;
        if self.is_ensemble() {
            let eval = first
                .eval
                .as_ref()
                .ok_or_else(|| TabPfnError::state("first ensemble member was never validated"))?;
            let score = first.last_log.as_ref().and_then(|log| log.val_score).unwrap_or(0.0);
            let run = EnsembleRun::new(
                self.plan.ensemble,
                self.plan.combination,
                eval.outputs.clone(),
                eval.targets.clone(),
                score,
            )?;
            self.write_summary(&run)?;
            ensemble = Some(run);
        }

        let mut last = first;
        if let Some(run) = ensemble.as_mut() {
            log::info!("beginning ensembling");
            for member in 1..self.plan.members {
                if self.interrupt.is_set() {
                    break;
                }
                log::info!("ensembling iteration {} of {}", member + 1, self.plan.members);
                if let (Some(rows), Some(real)) = (subsets.get(member), self.source.as_real_mut()) {
                    real.restrict_to(rows.clone());
                }
                let seed = self.config.seed + member as u64;
                self.engine.reseed(seed);
                self.rng = StdRng::seed_from_u64(seed);
                model = model.init_prefix_weights(&mut self.rng);

                let (trained, result) = self.train_member(model, member)?;
                self.output_gradients.advance();
                let eval = result
                    .eval
                    .as_ref()
                    .ok_or_else(|| TabPfnError::state(format!("ensemble member {} was never validated", member)))?;
                run.add_member(eval.outputs.clone())?;
                model = self.save_prefix(trained, member)?;
                last = result;
            }
            self.write_summary(run)?;
        }

        if !self.ctx.is_main() {
            return Ok(None);
        }
        Ok(Some(TrainOutcome {
            model,
            mean_loss: last.stats.mean_loss,
            positional_losses: last.stats.positional_losses,
            last_log: last.last_log,
            ensemble: ensemble.map(|run| run.records().clone()),
            interrupted: self.interrupt.is_set(),
        }))
    }

    fn train_member(&mut self, mut model: M, member: usize) -> Result<(M, MemberResult)> {
        let mut result = MemberResult {
            stats: EpochStats::default(),
            last_log: None,
            eval: None,
        };
        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();
            let lr = self.schedule.lr();
            let boost_this_epoch = self.plan.ensemble == EnsembleStrategy::Boosting && epoch == 1;
            let boost = boost_this_epoch.then_some(&mut self.output_gradients);
            let (trained, stats) = self
                .engine
                .train_epoch(model, &mut self.source, lr, boost, self.device)?;

            let mut log = EpochLog {
                time: self.started.elapsed().as_secs_f64(),
                epoch,
                mean_loss: stats.mean_loss,
                ..EpochLog::default()
            };
            let (validated, eval) = self.validate(trained, epoch, &mut log)?;
            model = validated;
            if eval.is_some() {
                result.eval = eval;
            }

            if self.ctx.is_main() {
                log::info!(
                    "| end of epoch {:3} | time: {:5.2}s | mean loss {:5.2} | lr {:.2e} | data time {:5.2} | step time {:5.2} | forward time {:5.2} | nan share {:5.2} | ignore share {:5.4} | skipped steps {}{}",
                    epoch,
                    epoch_start.elapsed().as_secs_f64(),
                    stats.mean_loss,
                    lr,
                    stats.data_time,
                    stats.step_time,
                    stats.forward_time,
                    stats.nan_share,
                    stats.ignore_share,
                    stats.skipped_steps,
                    score_suffix(&log)
                );
                self.epoch_callback(&model, &log, member, epoch)?;
            }
            if log.val_score.is_some() {
                result.last_log = Some(log);
            }
            result.stats = stats;
            self.schedule.step();

            if self.interrupt.is_set() {
                log::warn!("interrupted after epoch {}", epoch);
                break;
            }
        }
        Ok((model, result))
    }

    /// Real sources are scored on val and test every `validation_period`
    /// epochs starting with the first; synthetic sources score their fixed
    /// batch on multiples of the period.
    fn validate(&mut self, model: M, epoch: usize, log: &mut EpochLog) -> Result<(M, Option<EvalResult>)> {
        let period = self.config.validation_period;
        let device = self.device;
        match &mut self.source {
            DataSource::Real(real) if (epoch - 1) % period == 0 => {
                let cl = BatchSource::<B>::window(real);
                let val = evaluate_real::<B, M>(&model, real, EvalSplit::Val, cl, device)?;
                let test = evaluate_real::<B, M>(&model, real, EvalSplit::Test, cl, device)?;
                log.set_val(val.accuracy, val.calibration());
                log.set_test(test.accuracy, test.calibration());
                if !self.config.prompt_tuning {
                    return Ok((model, Some(val)));
                }

                let (model, scored) = match self.plan.concat {
                    Some(strategy) => {
                        let (model, scored) = with_concatenated_prefix::<B, M, _>(
                            model,
                            strategy,
                            &self.saved_prefixes,
                            &mut self.rng,
                            |m| score_without_context::<B, M>(m, real, device),
                        )?;
                        (model, scored?)
                    }
                    None => {
                        let scored = score_without_context::<B, M>(&model, real, device)?;
                        (model, scored)
                    }
                };
                let (val_nc, test_nc) = scored;
                log.set_val_nc(val_nc.accuracy, val_nc.calibration());
                log.set_test_nc(test_nc.accuracy, test_nc.calibration());
                Ok((model, Some(val)))
            }
            DataSource::Synthetic(prior) if epoch % period == 0 => {
                if let Some(batch) = BatchSource::<B>::validation_batch(prior, device) {
                    log.val_score = Some(evaluate_batch::<B, M>(&model, batch)?);
                }
                Ok((model, None))
            }
            _ => Ok((model, None)),
        }
    }

    fn epoch_callback(&self, model: &M, log: &EpochLog, member: usize, epoch: usize) -> Result<()> {
        if let (Some(dir), Some(_)) = (&self.save_dir, log.val_score) {
            let ensemble_member = self.is_ensemble().then_some(member);
            log.write(dir, &self.config.model_string, ensemble_member)?;
        }
        if let Some(manager) = &self.checkpoints {
            let every = self.config.save_every_k_epochs;
            if every > 0 && epoch % every == 0 {
                manager.save(model, self.engine.optimizer(), member, epoch)?;
            }
        }
        Ok(())
    }

    fn save_prefix(&mut self, model: M, member: usize) -> Result<M> {
        if !self.config.prompt_tuning {
            return Ok(model);
        }
        let Some(prefix) = model.prefix() else {
            return Ok(model);
        };
        let saved = SavedPrefix::from_embedding(prefix)?;
        if let Some(dir) = self.save_dir.as_ref().filter(|_| self.ctx.is_main()) {
            saved.write(dir, member)?;
        }
        if self.plan.concat.is_some() {
            self.saved_prefixes.push(saved);
        }
        Ok(model)
    }

    fn write_summary(&self, run: &EnsembleRun) -> Result<()> {
        match self.save_dir.as_ref().filter(|_| self.ctx.is_main()) {
            Some(dir) => run.write_summary(dir),
            None => Ok(()),
        }
    }
}

/// Val and test scores with no training rows as context.
fn score_without_context<B, M>(
    model: &M,
    real: &mut RealDataSource,
    device: &B::Device,
) -> Result<(EvalResult, EvalResult)>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
{
    let val = evaluate_real::<B, M>(model, real, EvalSplit::Val, 0, device)?;
    let test = evaluate_real::<B, M>(model, real, EvalSplit::Test, 0, device)?;
    Ok((val, test))
}

fn score_suffix(log: &EpochLog) -> String {
    let mut suffix = String::new();
    let scores = [
        ("val score", log.val_score),
        ("test score", log.test_score),
        ("val score nc", log.val_score_nc),
        ("test score nc", log.test_score_nc),
        ("val ece", log.val_ece),
        ("val tace", log.val_tace),
    ];
    for (name, value) in scores {
        if let Some(value) = value {
            suffix.push_str(&format!(" | {} {}", name, value));
        }
    }
    suffix
}
