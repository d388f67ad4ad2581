//! Normalized in-memory tabular dataset and its on-disk bundle.
//!
//! A bundle directory holds four artifacts:
//! `X.npy.gz`, `y.npy.gz`, `split_indeces.npy.gz` and `metadata.json`.
//! The split file stores one `(fold, kind, row)` triple per index with
//! `kind` 0/1/2 for train/val/test.

use crate::tabpfn::errors::{Result, TabPfnError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array1, Array2, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;

pub const X_FILE: &str = "X.npy.gz";
pub const Y_FILE: &str = "y.npy.gz";
pub const SPLIT_FILE: &str = "split_indeces.npy.gz";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Regression,
    Binary,
    Classification,
}

impl FromStr for TargetType {
    type Err = TabPfnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "regression" => Ok(TargetType::Regression),
            "binary" => Ok(TargetType::Binary),
            "classification" => Ok(TargetType::Classification),
            other => Err(TabPfnError::validation(format!(
                "unknown target type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetType::Regression => "regression",
            TargetType::Binary => "binary",
            TargetType::Classification => "classification",
        };
        f.write_str(name)
    }
}

/// Row indices of one train/val/test fold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub name: String,
    pub cat_idx: Vec<usize>,
    pub cat_dims: Option<Vec<usize>>,
    pub target_type: TargetType,
    pub num_classes: usize,
    pub num_features: usize,
    pub num_instances: usize,
    pub split_source: Option<String>,
    /// Fold count of the split array, empty folds included. Absent in
    /// bundles that predate it.
    #[serde(default)]
    pub num_folds: Option<usize>,
}

/// Row-selected features and targets for one part of a fold.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPart {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitData {
    pub train: SplitPart,
    pub val: SplitPart,
    pub test: SplitPart,
}

impl SplitData {
    /// Mean-impute missing numeric values using training statistics.
    ///
    /// Columns with no observed training value are zeroed in every part.
    /// Categorical columns pass through unchanged.
    pub fn impute_numeric(&mut self, cat_idx: &[usize]) {
        for col in 0..self.train.x.ncols() {
            if cat_idx.contains(&col) {
                continue;
            }
            let observed: Vec<f64> = self
                .train
                .x
                .column(col)
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .collect();
            let fill = if observed.is_empty() {
                None
            } else {
                Some(observed.iter().sum::<f64>() / observed.len() as f64)
            };
            for part in [&mut self.train, &mut self.val, &mut self.test] {
                part.x.column_mut(col).mapv_inplace(|v| match fill {
                    None => 0.0,
                    Some(mean) if v.is_nan() => mean,
                    Some(_) => v,
                });
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabularDataset {
    name: String,
    x: Array2<f64>,
    y: Array1<f64>,
    cat_idx: Vec<usize>,
    target_type: TargetType,
    num_classes: usize,
    cat_dims: Option<Vec<usize>>,
    split_indeces: Vec<SplitIndices>,
    split_source: Option<String>,
}

impl TabularDataset {
    /// Build a dataset, enforcing the shape and class-count invariants.
    pub fn new(
        name: impl Into<String>,
        x: Array2<f64>,
        y: Array1<f64>,
        cat_idx: Vec<usize>,
        target_type: TargetType,
        num_classes: usize,
    ) -> Result<Self> {
        let name = name.into();
        if x.nrows() != y.len() {
            return Err(TabPfnError::validation(format!(
                "dataset '{}': X has {} rows but y has {} entries",
                name,
                x.nrows(),
                y.len()
            )));
        }
        if let Some(&max) = cat_idx.iter().max() {
            if max >= x.ncols() {
                return Err(TabPfnError::validation(format!(
                    "dataset '{}': categorical index {} out of range for {} features",
                    name,
                    max,
                    x.ncols()
                )));
            }
        }
        match target_type {
            TargetType::Regression | TargetType::Binary if num_classes != 1 => {
                return Err(TabPfnError::validation(format!(
                    "dataset '{}': {} targets need num_classes == 1, got {}",
                    name, target_type, num_classes
                )));
            }
            TargetType::Classification if num_classes <= 2 => {
                return Err(TabPfnError::validation(format!(
                    "dataset '{}': classification needs num_classes > 2, got {}",
                    name, num_classes
                )));
            }
            _ => {}
        }

        let mut cat_idx = cat_idx;
        cat_idx.sort_unstable();
        cat_idx.dedup();

        Ok(Self {
            name,
            x,
            y,
            cat_idx,
            target_type,
            num_classes,
            cat_dims: None,
            split_indeces: Vec::new(),
            split_source: None,
        })
    }

    /// Attach fold indices, checking every index against the row count.
    pub fn with_splits(mut self, splits: Vec<SplitIndices>) -> Result<Self> {
        let n = self.num_instances();
        for (fold, split) in splits.iter().enumerate() {
            let out_of_range = split
                .train
                .iter()
                .chain(&split.val)
                .chain(&split.test)
                .find(|&&i| i >= n);
            if let Some(&i) = out_of_range {
                return Err(TabPfnError::validation(format!(
                    "fold {} references row {} but the dataset has {} rows",
                    fold, i, n
                )));
            }
        }
        self.split_indeces = splits;
        Ok(self)
    }

    pub fn with_split_source(mut self, source: impl Into<String>) -> Self {
        self.split_source = Some(source.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn cat_idx(&self) -> &[usize] {
        &self.cat_idx
    }

    pub fn cat_dims(&self) -> Option<&[usize]> {
        self.cat_dims.as_deref()
    }

    pub fn target_type(&self) -> TargetType {
        self.target_type
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn num_instances(&self) -> usize {
        self.x.nrows()
    }

    pub fn split_indeces(&self) -> &[SplitIndices] {
        &self.split_indeces
    }

    pub fn split_source(&self) -> Option<&str> {
        self.split_source.as_deref()
    }

    pub fn metadata(&self) -> DatasetMetadata {
        DatasetMetadata {
            name: self.name.clone(),
            cat_idx: self.cat_idx.clone(),
            cat_dims: self.cat_dims.clone(),
            target_type: self.target_type,
            num_classes: self.num_classes,
            num_features: self.num_features(),
            num_instances: self.num_instances(),
            split_source: self.split_source.clone(),
            num_folds: Some(self.split_indeces.len()),
        }
    }

    /// Map label values to dense class ids in sorted label order.
    ///
    /// Regression targets are left untouched. For classification the number
    /// of distinct labels must equal `num_classes`.
    pub fn target_encode(&mut self) -> Result<()> {
        if self.target_type == TargetType::Regression {
            log::debug!("dataset '{}': regression target left unencoded", self.name);
            return Ok(());
        }
        let (encoded, n_labels) = dense_encode(self.y.view())?;
        if self.target_type == TargetType::Classification && n_labels != self.num_classes {
            return Err(TabPfnError::validation(format!(
                "dataset '{}': found {} distinct labels, expected num_classes = {}",
                self.name, n_labels, self.num_classes
            )));
        }
        self.y = encoded;
        Ok(())
    }

    /// Replace every categorical column by dense ids and record cardinalities.
    pub fn cat_feature_encode(&mut self) -> Result<()> {
        if self.cat_dims.is_some() {
            return Err(TabPfnError::state(format!(
                "dataset '{}': categorical features are already encoded",
                self.name
            )));
        }
        let mut dims = Vec::with_capacity(self.cat_idx.len());
        for &col in &self.cat_idx {
            let (encoded, cardinality) = dense_encode(self.x.column(col))?;
            self.x.column_mut(col).assign(&encoded);
            dims.push(cardinality);
        }
        self.cat_dims = Some(dims);
        Ok(())
    }

    /// Select the train/val/test rows of one fold.
    pub fn split_data(&self, fold: usize) -> Result<SplitData> {
        let split = self.split_indeces.get(fold).ok_or_else(|| {
            TabPfnError::validation(format!(
                "dataset '{}' has {} folds, fold {} requested",
                self.name,
                self.split_indeces.len(),
                fold
            ))
        })?;
        Ok(SplitData {
            train: self.take_rows(&split.train),
            val: self.take_rows(&split.val),
            test: self.take_rows(&split.test),
        })
    }

    fn take_rows(&self, rows: &[usize]) -> SplitPart {
        SplitPart {
            x: self.x.select(Axis(0), rows),
            y: self.y.select(Axis(0), rows),
        }
    }

    /// Read a bundle directory written by [`TabularDataset::write`].
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        for file in [X_FILE, Y_FILE, SPLIT_FILE, METADATA_FILE] {
            let artifact = path.join(file);
            if !artifact.is_file() {
                return Err(TabPfnError::MissingFile(artifact));
            }
        }

        let x: Array2<f64> = read_gz_npy(&path.join(X_FILE))?;
        let y: Array1<f64> = read_gz_npy(&path.join(Y_FILE))?;
        let split_triples: Array2<i64> = read_gz_npy(&path.join(SPLIT_FILE))?;
        let metadata: DatasetMetadata =
            serde_json::from_reader(BufReader::new(File::open(path.join(METADATA_FILE))?))?;

        if metadata.num_features != x.ncols() || metadata.num_instances != x.nrows() {
            return Err(TabPfnError::validation(format!(
                "bundle {} metadata declares {}x{} but X is {}x{}",
                path.display(),
                metadata.num_instances,
                metadata.num_features,
                x.nrows(),
                x.ncols()
            )));
        }

        let mut dataset = Self::new(
            metadata.name,
            x,
            y,
            metadata.cat_idx,
            metadata.target_type,
            metadata.num_classes,
        )?
        .with_splits(decode_splits(&split_triples, metadata.num_folds)?)?;
        dataset.cat_dims = metadata.cat_dims;
        dataset.split_source = metadata.split_source;
        Ok(dataset)
    }

    /// Write the bundle; an existing directory is an error unless `overwrite`.
    pub fn write(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            return Err(TabPfnError::AlreadyExists(path.to_path_buf()));
        }
        fs::create_dir_all(path)?;

        write_gz_npy(&path.join(X_FILE), &self.x)?;
        write_gz_npy(&path.join(Y_FILE), &self.y)?;
        write_gz_npy(&path.join(SPLIT_FILE), &encode_splits(&self.split_indeces))?;

        let writer = BufWriter::new(File::create(path.join(METADATA_FILE))?);
        serde_json::to_writer_pretty(writer, &self.metadata())?;
        log::debug!("wrote dataset '{}' to {}", self.name, path.display());
        Ok(())
    }
}

/// Sorted-unique encoding: each value maps to its rank among distinct values.
fn dense_encode(values: ndarray::ArrayView1<'_, f64>) -> Result<(Array1<f64>, usize)> {
    if values.iter().any(|v| v.is_nan()) {
        return Err(TabPfnError::validation(
            "cannot encode a column containing NaN",
        ));
    }
    let mut levels: Vec<f64> = values.to_vec();
    levels.sort_by(f64::total_cmp);
    levels.dedup_by(|a, b| a.total_cmp(b) == Ordering::Equal);

    let encoded = values.mapv(|v| {
        levels
            .binary_search_by(|edge| edge.total_cmp(&v))
            .unwrap_or_default() as f64
    });
    Ok((encoded, levels.len()))
}

fn encode_splits(splits: &[SplitIndices]) -> Array2<i64> {
    let mut flat = Vec::new();
    for (fold, split) in splits.iter().enumerate() {
        for (kind, rows) in [&split.train, &split.val, &split.test].into_iter().enumerate() {
            for &row in rows {
                flat.extend_from_slice(&[fold as i64, kind as i64, row as i64]);
            }
        }
    }
    let n = flat.len() / 3;
    Array2::from_shape_vec((n, 3), flat).unwrap_or_else(|_| Array2::zeros((0, 3)))
}

/// Rebuild `num_folds` folds from `(fold, kind, row)` triples.
///
/// Without a stored count, fold ids are bounded by the number of triples.
fn decode_splits(triples: &Array2<i64>, num_folds: Option<usize>) -> Result<Vec<SplitIndices>> {
    if triples.nrows() > 0 && triples.ncols() != 3 {
        return Err(TabPfnError::validation(format!(
            "split index array must have 3 columns, found {}",
            triples.ncols()
        )));
    }
    let limit = num_folds.unwrap_or(triples.nrows());
    let mut splits: Vec<SplitIndices> = vec![SplitIndices::default(); num_folds.unwrap_or(0)];
    for row in triples.rows() {
        let (fold, kind, index) = (row[0], row[1], row[2]);
        if fold < 0 || index < 0 {
            return Err(TabPfnError::validation(format!(
                "negative split entry ({}, {}, {})",
                fold, kind, index
            )));
        }
        let fold = fold as usize;
        if fold >= limit {
            return Err(TabPfnError::validation(format!(
                "split entry names fold {}, bundle has {}",
                fold, limit
            )));
        }
        if splits.len() <= fold {
            splits.resize_with(fold + 1, SplitIndices::default);
        }
        let target = match kind {
            0 => &mut splits[fold].train,
            1 => &mut splits[fold].val,
            2 => &mut splits[fold].test,
            other => {
                return Err(TabPfnError::validation(format!(
                    "unknown split kind {}",
                    other
                )))
            }
        };
        target.push(index as usize);
    }
    Ok(splits)
}

fn write_gz_npy<S, D>(path: &Path, array: &ndarray::ArrayBase<S, D>) -> Result<()>
where
    S: ndarray::Data,
    S::Elem: ndarray_npy::WritableElement,
    D: ndarray::Dimension,
{
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
    array.write_npy(&mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn read_gz_npy<T: ReadNpyExt>(path: &Path) -> Result<T> {
    let decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    Ok(T::read_npy(decoder)?)
}
