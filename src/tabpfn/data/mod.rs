//! Host-side tabular data: datasets, subset selection and batch sources.

pub mod batch;
pub mod dataset;
pub mod mutual_info;
pub mod real;
pub mod subset;
pub mod synthetic;

pub use batch::{Batch, BatchSource, DataSource, EvalPosSampler, IGNORE_INDEX};
pub use dataset::{DatasetMetadata, SplitData, SplitIndices, SplitPart, TabularDataset, TargetType};
pub use real::{bagging_subsets, inflate_window, EvalSplit, RealDataSource};
pub use subset::{Split, SubsetMaker, SubsetMethod};
pub use synthetic::{PriorKind, SyntheticPrior};
