//! Row/feature reduction policies for real datasets.

use super::dataset::{SplitData, SplitPart};
use super::mutual_info::{mutual_info_classif, select_k_best};
use crate::tabpfn::errors::{Result, TabPfnError};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsetMethod {
    Random,
    First,
    MutualInformation,
}

impl FromStr for SubsetMethod {
    type Err = TabPfnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(SubsetMethod::Random),
            "first" => Ok(SubsetMethod::First),
            "mutual_information" => Ok(SubsetMethod::MutualInformation),
            other => Err(TabPfnError::configuration(format!(
                "subset method not recognized: '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SubsetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubsetMethod::Random => "random",
            SubsetMethod::First => "first",
            SubsetMethod::MutualInformation => "mutual_information",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

/// Reduces a dataset to at most `subset_features` columns and `subset_rows`
/// rows. A count of zero or less disables reduction on that axis.
///
/// The mutual-information selector is fitted on the first `Train` call and
/// reused for every later call, whichever split it is. When bagging members
/// train on different row subsets, all of them share the columns chosen on
/// the first member's rows.
#[derive(Debug, Clone)]
pub struct SubsetMaker {
    subset_features: i64,
    subset_rows: i64,
    features_method: SubsetMethod,
    rows_method: SubsetMethod,
    feature_selector: Option<Vec<usize>>,
}

impl SubsetMaker {
    pub fn new(
        subset_features: i64,
        subset_rows: i64,
        features_method: SubsetMethod,
        rows_method: SubsetMethod,
    ) -> Result<Self> {
        if rows_method == SubsetMethod::MutualInformation {
            return Err(TabPfnError::configuration(
                "mutual_information selects features only, not rows",
            ));
        }
        Ok(Self {
            subset_features,
            subset_rows,
            features_method,
            rows_method,
            feature_selector: None,
        })
    }

    pub fn subset_features(&self) -> i64 {
        self.subset_features
    }

    pub fn subset_rows(&self) -> i64 {
        self.subset_rows
    }

    /// Columns chosen by the fitted mutual-information selector, if any.
    pub fn fitted_features(&self) -> Option<&[usize]> {
        self.feature_selector.as_deref()
    }

    /// Apply the configured reductions, features first, then rows.
    ///
    /// Feature sampling uses `seed`, row sampling `seed + 1`, so the two axes
    /// draw from independent streams.
    pub fn make_subset(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        split: Split,
        seed: u64,
    ) -> Result<(Array2<f64>, Array1<f64>)> {
        let mut x = self.select_features(x, y, split, seed)?;
        let mut y = y.clone();

        if let Some(k) = reduction(x.nrows(), self.subset_rows) {
            log::debug!("making {}-sized subset of {} rows", k, x.nrows());
            let rows = match self.rows_method {
                SubsetMethod::Random => {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
                    rand::seq::index::sample(&mut rng, x.nrows(), k).into_vec()
                }
                SubsetMethod::First => (0..k).collect(),
                SubsetMethod::MutualInformation => {
                    return Err(TabPfnError::configuration(
                        "mutual_information selects features only, not rows",
                    ))
                }
            };
            x = x.select(Axis(0), &rows);
            y = y.select(Axis(0), &rows);
        }

        Ok((x, y))
    }

    /// Reduce the training part in both axes, then carry the same feature
    /// selection over to val and test, keeping all of their rows.
    pub fn apply_to_split(&mut self, data: SplitData, seed: u64) -> Result<SplitData> {
        let (x, y) = self.make_subset(&data.train.x, &data.train.y, Split::Train, seed)?;
        let train = SplitPart { x, y };
        let val = SplitPart {
            x: self.select_features(&data.val.x, &data.val.y, Split::Val, seed)?,
            y: data.val.y,
        };
        let test = SplitPart {
            x: self.select_features(&data.test.x, &data.test.y, Split::Test, seed)?,
            y: data.test.y,
        };
        Ok(SplitData { train, val, test })
    }

    fn select_features(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        split: Split,
        seed: u64,
    ) -> Result<Array2<f64>> {
        let Some(k) = reduction(x.ncols(), self.subset_features) else {
            return Ok(x.clone());
        };
        log::debug!("making {}-sized subset of {} features", k, x.ncols());
        let columns = match self.features_method {
            SubsetMethod::Random => {
                let mut rng = StdRng::seed_from_u64(seed);
                rand::seq::index::sample(&mut rng, x.ncols(), k).into_vec()
            }
            SubsetMethod::First => (0..k).collect(),
            SubsetMethod::MutualInformation => self.mutual_information_columns(x, y, split, k)?,
        };
        Ok(x.select(Axis(1), &columns))
    }

    fn mutual_information_columns(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        split: Split,
        k: usize,
    ) -> Result<Vec<usize>> {
        if let Some(columns) = &self.feature_selector {
            if columns.iter().any(|&c| c >= x.ncols()) {
                return Err(TabPfnError::validation(format!(
                    "fitted feature selector expects at least {} columns, got {}",
                    columns.iter().max().map_or(0, |c| c + 1),
                    x.ncols()
                )));
            }
            return Ok(columns.clone());
        }
        if split != Split::Train {
            return Err(TabPfnError::state(
                "mutual information selector must be fitted on a train split first",
            ));
        }
        let started = std::time::Instant::now();
        let scores = mutual_info_classif(x, y.view());
        let columns = select_k_best(&scores, k);
        log::info!(
            "fitted mutual information feature selector in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        self.feature_selector = Some(columns.clone());
        Ok(columns)
    }
}

/// Target size when `0 < requested < current`.
fn reduction(current: usize, requested: i64) -> Option<usize> {
    if requested > 0 && (requested as usize) < current {
        Some(requested as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: usize, cols: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f64);
        let y = Array1::from_shape_fn(rows, |r| (r % 3) as f64);
        (x, y)
    }

    #[test]
    fn test_unknown_method_is_configuration_error() {
        assert!(matches!(
            "best".parse::<SubsetMethod>(),
            Err(TabPfnError::Configuration(_))
        ));
    }

    #[test]
    fn test_mutual_information_rows_rejected() {
        let err = SubsetMaker::new(2, 2, SubsetMethod::First, SubsetMethod::MutualInformation)
            .unwrap_err();
        assert!(matches!(err, TabPfnError::Configuration(_)));
    }

    #[test]
    fn test_disabled_axes_are_noop() {
        let (x, y) = grid(5, 4);
        let mut maker = SubsetMaker::new(0, -1, SubsetMethod::Random, SubsetMethod::Random).unwrap();
        let (sx, sy) = maker.make_subset(&x, &y, Split::Train, 0).unwrap();
        assert_eq!(sx, x);
        assert_eq!(sy, y);
    }

    #[test]
    fn test_random_feature_and_row_counts() {
        let (x, y) = grid(10, 6);
        let mut maker = SubsetMaker::new(3, 4, SubsetMethod::Random, SubsetMethod::Random).unwrap();
        let (sx, sy) = maker.make_subset(&x, &y, Split::Train, 11).unwrap();
        assert_eq!(sx.dim(), (4, 3));
        assert_eq!(sy.len(), 4);
        // Each kept row keeps its label.
        for (row, label) in sx.rows().into_iter().zip(sy.iter()) {
            let original = (row[0] as usize) / 6;
            assert_eq!(*label, (original % 3) as f64);
        }
    }

    #[test]
    fn test_split_shares_fitted_columns() {
        let part = |offset: usize| {
            let (x, y) = grid(12, 5);
            SplitPart { x: x + offset as f64, y }
        };
        let data = SplitData {
            train: part(0),
            val: part(100),
            test: part(200),
        };
        let mut maker =
            SubsetMaker::new(2, 0, SubsetMethod::MutualInformation, SubsetMethod::First).unwrap();
        let reduced = maker.apply_to_split(data, 0).unwrap();
        let columns = maker.fitted_features().unwrap().to_vec();
        assert_eq!(reduced.val.x.ncols(), 2);
        assert_eq!(reduced.val.x[[0, 0]], 100.0 + columns[0] as f64);
        assert_eq!(reduced.test.x[[0, 1]], 200.0 + columns[1] as f64);
    }

    #[test]
    fn test_split_samples_training_rows_only() {
        let (x, y) = grid(12, 5);
        let part = || SplitPart { x: x.clone(), y: y.clone() };
        let data = SplitData {
            train: part(),
            val: part(),
            test: part(),
        };
        let mut maker = SubsetMaker::new(3, 4, SubsetMethod::Random, SubsetMethod::Random).unwrap();
        let reduced = maker.apply_to_split(data, 7).unwrap();
        assert_eq!(reduced.train.x.dim(), (4, 3));
        assert_eq!(reduced.val.x.dim(), (12, 3));
        assert_eq!(reduced.test.y, y);
        // same seed, same columns in every part
        assert_eq!(reduced.val.x.row(0), reduced.test.x.row(0));
        let train_columns: Vec<f64> = reduced.train.x.row(0).iter().map(|v| v % 5.0).collect();
        let val_columns: Vec<f64> = reduced.val.x.row(0).iter().map(|v| v % 5.0).collect();
        assert_eq!(train_columns, val_columns);
    }

    #[test]
    fn test_mutual_information_transform_before_fit_is_state_error() {
        let (x, y) = grid(10, 6);
        let mut maker =
            SubsetMaker::new(2, 0, SubsetMethod::MutualInformation, SubsetMethod::First).unwrap();
        let err = maker.make_subset(&x, &y, Split::Val, 0).unwrap_err();
        assert!(matches!(err, TabPfnError::State(_)));
    }
}
