//! Model and optimizer checkpoints.
//!
//! Each checkpoint is a pair of full-precision gzipped MessagePack records
//! next to the run configuration:
//!   prior_diff_real_checkpoint{add_name}_n_{i}_epoch_{k}.cpkt.mpk.gz
//!   prior_diff_real_checkpoint{add_name}_n_{i}_epoch_{k}.cpkt.optim.mpk.gz

use crate::tabpfn::architectures::PriorFittingModel;
use crate::tabpfn::errors::{Result, TabPfnError};
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::fs;
use std::path::{Path, PathBuf};

/// Resumed weights must equal the saved ones bit for bit.
type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// Checkpoint base name; the recorder appends its own extension.
pub fn checkpoint_name(add_name: &str, run: usize, epoch: usize) -> String {
    format!("prior_diff_real_checkpoint{}_n_{}_epoch_{}.cpkt", add_name, run, epoch)
}

fn optimizer_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".optim");
    PathBuf::from(name)
}

/// Saves checkpoints under one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    add_name: String,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, add_name: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            add_name: add_name.into(),
        })
    }

    pub fn path(&self, run: usize, epoch: usize) -> PathBuf {
        self.dir.join(checkpoint_name(&self.add_name, run, epoch))
    }

    pub fn save<B, M, O>(&self, model: &M, optimizer: &O, run: usize, epoch: usize) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: PriorFittingModel<B>,
        O: Optimizer<M, B>,
    {
        let path = self.path(run, epoch);
        let recorder = CheckpointRecorder::new();
        model.clone().save_file(path.clone(), &recorder)?;
        recorder.record(optimizer.to_record(), optimizer_path(&path))?;
        log::info!("saved checkpoint {}", path.display());
        Ok(path)
    }
}

/// Restore model and optimizer state from `path`.
///
/// A checkpoint saved without a prefix keeps the model's current prefix.
pub fn resume<B, M, O>(model: M, optimizer: O, path: &Path, device: &B::Device) -> Result<(M, O)>
where
    B: AutodiffBackend,
    M: PriorFittingModel<B>,
    O: Optimizer<M, B>,
{
    let recorder = CheckpointRecorder::new();
    let fresh_prefix = model.prefix().cloned();
    let model = model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|err| match err {
            burn::record::RecorderError::FileNotFound(_) => TabPfnError::MissingFile(path.to_path_buf()),
            other => other.into(),
        })?;
    let model = match (model.prefix().is_some(), fresh_prefix) {
        (false, Some(prefix)) => {
            log::info!("checkpoint has no prefix, keeping the freshly initialised one");
            model.replace_prefix(Some(prefix)).0
        }
        (_, _) => model,
    };

    let optim_path = optimizer_path(path);
    let optimizer = match recorder.load(optim_path.clone(), device) {
        Ok(record) => optimizer.load_record(record),
        Err(err) => {
            log::warn!(
                "optimizer state {} not restored: {:?}",
                optim_path.display(),
                err
            );
            optimizer
        }
    };
    log::info!("resumed from {}", path.display());
    Ok((model, optimizer))
}
