//! JSON documents written during a run.

use super::config::TrainingConfig;
use super::evaluation::Calibration;
use crate::tabpfn::errors::{Result, TabPfnError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENSEMBLE_SUMMARY_FILE: &str = "ensembling_acc.json";

/// Scores of one validated epoch. Variants that were not computed are null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochLog {
    pub time: f64,
    pub epoch: usize,
    pub mean_loss: f64,
    pub val_score: Option<f64>,
    pub val_score_nc: Option<f64>,
    pub test_score: Option<f64>,
    pub test_score_nc: Option<f64>,
    pub val_ece: Option<f64>,
    pub val_tace: Option<f64>,
    pub test_ece: Option<f64>,
    pub test_tace: Option<f64>,
    pub val_ece_nc: Option<f64>,
    pub val_tace_nc: Option<f64>,
    pub test_ece_nc: Option<f64>,
    pub test_tace_nc: Option<f64>,
}

impl EpochLog {
    pub fn set_val(&mut self, score: f64, calibration: Calibration) {
        self.val_score = Some(score);
        self.val_ece = Some(calibration.ece);
        self.val_tace = Some(calibration.tace);
    }

    pub fn set_test(&mut self, score: f64, calibration: Calibration) {
        self.test_score = Some(score);
        self.test_ece = Some(calibration.ece);
        self.test_tace = Some(calibration.tace);
    }

    pub fn set_val_nc(&mut self, score: f64, calibration: Calibration) {
        self.val_score_nc = Some(score);
        self.val_ece_nc = Some(calibration.ece);
        self.val_tace_nc = Some(calibration.tace);
    }

    pub fn set_test_nc(&mut self, score: f64, calibration: Calibration) {
        self.test_score_nc = Some(score);
        self.test_ece_nc = Some(calibration.ece);
        self.test_tace_nc = Some(calibration.tace);
    }

    /// `{model_string}_{boost_iter}_log_{epoch}.json`, where `boost_iter`
    /// is `boost_iter_{member}` while ensembling and empty otherwise.
    pub fn file_name(model_string: &str, member: Option<usize>, epoch: usize) -> String {
        let boost_iter = member.map(|m| format!("boost_iter_{}", m)).unwrap_or_default();
        format!("{}_{}_log_{}.json", model_string, boost_iter, epoch)
    }

    pub fn write(&self, dir: &Path, model_string: &str, member: Option<usize>) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(model_string, member, self.epoch));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        log::debug!("saved epoch log to {}", path.display());
        Ok(path)
    }
}

/// Accuracy and calibration of the combined ensemble after one member.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleRecord {
    pub accuracy: f64,
    pub ece: f64,
    pub tace: f64,
}

pub fn write_ensemble_summary(dir: &Path, records: &BTreeMap<usize, EnsembleRecord>) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(ENSEMBLE_SUMMARY_FILE);
    fs::write(&path, serde_json::to_string_pretty(records)?)?;
    Ok(path)
}

/// A value headed for the persisted run configuration.
#[derive(Debug, Clone)]
pub enum ConfigEntry {
    Value(Value),
    /// A tensor, stored by shape only.
    Tensor { shape: Vec<usize> },
    /// A function or strategy object, stored by name.
    Callable(String),
    /// Anything else, stored by type name.
    Opaque(&'static str),
}

impl ConfigEntry {
    pub fn opaque<T>(_value: &T) -> Self {
        ConfigEntry::Opaque(std::any::type_name::<T>())
    }

    /// JSON for serialisable values, a descriptive string otherwise.
    pub fn coerce(self) -> Value {
        match self {
            ConfigEntry::Value(value) => value,
            ConfigEntry::Tensor { shape } => Value::String(format!("tensor{:?}", shape)),
            ConfigEntry::Callable(name) => Value::String(format!("<function {}>", name)),
            ConfigEntry::Opaque(type_name) => Value::String(format!("<{}>", type_name)),
        }
    }
}

impl From<Value> for ConfigEntry {
    fn from(value: Value) -> Self {
        ConfigEntry::Value(value)
    }
}

/// Flat key-value view of `config` plus run-specific `extra` entries.
pub fn flatten_config(config: &TrainingConfig, extra: Vec<(String, ConfigEntry)>) -> Result<Map<String, Value>> {
    let mut flat = match serde_json::to_value(config)? {
        Value::Object(map) => map,
        other => {
            return Err(TabPfnError::state(format!(
                "training config serialised to a non-object: {}",
                other
            )))
        }
    };
    for (key, entry) in extra {
        flat.insert(key, entry.coerce());
    }
    Ok(flat)
}

/// `config_diff_real_{model_string}_n_0.json` in `dir`.
pub fn write_config(dir: &Path, model_string: &str, flat: &Map<String, Value>) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("config_diff_real_{}_n_0.json", model_string));
    fs::write(&path, serde_json::to_string_pretty(flat)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_log_name_and_nulls() {
        assert_eq!(EpochLog::file_name("m", None, 3), "m__log_3.json");
        assert_eq!(EpochLog::file_name("m", Some(2), 1), "m_boost_iter_2_log_1.json");

        let dir = tempfile::tempdir().unwrap();
        let mut log = EpochLog {
            epoch: 1,
            mean_loss: 0.5,
            ..EpochLog::default()
        };
        log.set_val(0.75, Calibration { ece: 0.1, tace: 0.2 });
        let path = log.write(dir.path(), "m", None).unwrap();
        let value: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["val_score"], 0.75);
        assert!(value["test_score_nc"].is_null());
        assert_eq!(value.as_object().unwrap().len(), 15);
    }

    #[test]
    fn test_config_coercion() {
        let config = TrainingConfig::new();
        let flat = flatten_config(
            &config,
            vec![
                ("device".to_string(), ConfigEntry::opaque(&std::time::Duration::ZERO)),
                ("scheduler".to_string(), ConfigEntry::Callable("cosine_with_warmup".to_string())),
                ("prefix".to_string(), ConfigEntry::Tensor { shape: vec![10, 64] }),
                ("n_out".to_string(), serde_json::json!(2).into()),
            ],
        )
        .unwrap();
        assert_eq!(flat["epochs"], 10);
        assert_eq!(flat["n_out"], 2);
        assert_eq!(flat["prefix"], "tensor[10, 64]");
        assert!(flat["device"].as_str().unwrap().contains("Duration"));

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "m", &flat).unwrap();
        assert!(path.ends_with("config_diff_real_m_n_0.json"));
    }

    #[test]
    fn test_ensemble_summary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = BTreeMap::new();
        records.insert(0, EnsembleRecord { accuracy: 0.8, ece: 0.1, tace: 0.05 });
        let path = write_ensemble_summary(dir.path(), &records).unwrap();
        let value: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["0"]["accuracy"], 0.8);
    }
}
