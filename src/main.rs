use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use burn::config::Config;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tabpfn_pt::tabpfn::architectures::{ModelConfig, PriorTransformer};
use tabpfn_pt::tabpfn::data::{
    BatchSource, DataSource, EvalPosSampler, RealDataSource, SubsetMaker, SyntheticPrior, TabularDataset,
};
use tabpfn_pt::tabpfn::train::{train, DataKind, DistributedContext, InterruptFlag, TrainingConfig, TrainingPlan};
use tabpfn_pt::{settings, Result, Settings, TabPfnError};
use tracing_subscriber::EnvFilter;

type Backend = Autodiff<NdArray<f32>>;

/// Path of the JSON training config; defaults are used when unset.
const CONFIG_ENV: &str = "TABPFN_TRAIN_CONFIG";

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tabpfn_pt=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run() {
        log::error!("training failed: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let settings = settings();
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => TrainingConfig::load(&path)
            .map_err(|err| TabPfnError::configuration(format!("cannot load {}: {}", path, err)))?,
        Err(_) => TrainingConfig::new(),
    }
    .with_settings(settings);
    let plan = TrainingPlan::resolve(&config)?;

    let device = Default::default();
    let source = build_source(&config, &plan, settings)?;
    let num_features = BatchSource::<Backend>::num_features(&source);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let prefix_size = if config.prompt_tuning { config.tuned_prompt_size } else { 0 };
    let model: PriorTransformer<Backend> = ModelConfig::new(num_features, plan.n_out)
        .with_emsize(config.emsize, config.nhead)
        .with_prefix_size(prefix_size)
        .init(&device, &mut rng);

    let interrupt = InterruptFlag::new();
    install_interrupt_handler(interrupt.clone());

    let ctx = DistributedContext::from_settings(settings);
    if let Some(outcome) = train(model, source, &config, ctx, &interrupt, &device)? {
        log::info!(
            "finished{}: mean loss {:.4}",
            if outcome.interrupted { " early" } else { "" },
            outcome.mean_loss
        );
        if let Some(records) = outcome.ensemble {
            for (member, record) in records {
                log::info!(
                    "member {}: accuracy {} ece {} tace {}",
                    member,
                    record.accuracy,
                    record.ece,
                    record.tace
                );
            }
        }
    }
    Ok(())
}

fn build_source(config: &TrainingConfig, plan: &TrainingPlan, settings: &Settings) -> Result<DataSource> {
    match plan.data {
        DataKind::Synthetic(kind) => {
            let sampler = plan.sampler.clone().unwrap_or(EvalPosSampler::Uniform {
                max: config.max_eval_pos.unwrap_or(config.bptt / 2).max(1),
            });
            let prior = SyntheticPrior::new(
                kind,
                config.num_features,
                config.num_classes,
                config.batch_size,
                config.steps_per_epoch,
                config.bptt,
                config.bptt_extra_samples,
                sampler,
                config.noise_level,
                config.seed,
            )?;
            Ok(DataSource::Synthetic(prior))
        }
        DataKind::Real => {
            let path = config
                .dataset_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| settings.paths.data_path.clone());
            let mut dataset = TabularDataset::read(&path)?;
            dataset.target_encode()?;
            if dataset.cat_dims().is_none() {
                dataset.cat_feature_encode()?;
            }
            log::info!(
                "loaded '{}': {} rows, {} features, {} classes",
                dataset.name(),
                dataset.num_instances(),
                dataset.num_features(),
                dataset.num_classes()
            );

            let mut maker = SubsetMaker::new(
                config.subset_features,
                config.subset_rows,
                plan.subset_features_method,
                plan.subset_rows_method,
            )?;
            let mut split = dataset.split_data(config.fold)?;
            split.impute_numeric(dataset.cat_idx());
            let split = maker.apply_to_split(split, config.seed)?;
            let mut real = RealDataSource::new(
                split,
                config.max_features,
                config.bptt,
                config.aggregate_k_gradients,
                config.seed,
            )?;
            if let Some(sampler) = plan.sampler.clone() {
                real = real.with_eval_pos_sampler(sampler);
            }
            Ok(DataSource::Real(real))
        }
    }
}

/// Trigger `interrupt` on Ctrl-C. Training stops after the running epoch.
fn install_interrupt_handler(interrupt: InterruptFlag) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                log::warn!("interrupt handler not installed: {}", err);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("received Ctrl-C, stopping after the current epoch");
                interrupt.trigger();
            }
        });
    });
}
