//! Fixed real-data loader.
//!
//! Wraps the train/val/test parts of one dataset fold. Features are padded
//! with zero columns up to `max_features`. The training window is inflated
//! one row at a time until the number of full windows per epoch divides the
//! gradient accumulation factor.

use super::batch::{Batch, BatchSource, EvalPosSampler};
use super::dataset::{SplitData, SplitPart};
use crate::tabpfn::errors::{Result, TabPfnError};
use ndarray::{concatenate, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Feature width real datasets are padded to unless configured otherwise.
pub const DEFAULT_MAX_FEATURES: usize = 100;

/// Share of the training rows drawn for each bagging member.
pub const BAGGING_SPLIT_SIZE: f64 = 0.5;

/// Held-out part scored during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalSplit {
    Val,
    Test,
}

/// Grow `bptt` until `(n / bptt) % k == 0`. Never shrinks the window.
pub fn inflate_window(n: usize, bptt: usize, k: usize) -> usize {
    let k = k.max(1);
    let mut bptt = bptt.max(1);
    while (n / bptt) % k != 0 {
        bptt += 1;
    }
    bptt
}

/// Indices of each bagging member's training subset.
///
/// Member `i` draws `floor(0.5 * n)` rows without replacement from a
/// generator seeded with `seed + i`.
pub fn bagging_subsets(n: usize, members: usize, seed: u64) -> Vec<Vec<usize>> {
    let size = (BAGGING_SPLIT_SIZE * n as f64) as usize;
    (0..members)
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            rand::seq::index::sample(&mut rng, n, size).into_vec()
        })
        .collect()
}

fn pad_features(x: Array2<f64>, max_features: usize) -> Result<Array2<f64>> {
    let f = x.ncols();
    if f > max_features {
        return Err(TabPfnError::validation(format!(
            "dataset has {} features, more than the supported maximum of {}",
            f, max_features
        )));
    }
    if f == max_features {
        return Ok(x);
    }
    let zeros = Array2::<f64>::zeros((x.nrows(), max_features - f));
    concatenate(Axis(1), &[x.view(), zeros.view()])
        .map_err(|err| TabPfnError::validation(format!("padding failed: {}", err)))
}

fn shuffled(part: SplitPart, rng: &mut StdRng) -> SplitPart {
    let mut order: Vec<usize> = (0..part.y.len()).collect();
    order.shuffle(rng);
    SplitPart {
        x: part.x.select(Axis(0), &order),
        y: part.y.select(Axis(0), &order),
    }
}

#[derive(Debug, Clone)]
struct HostPart {
    x: Array2<f32>,
    y: Array1<f32>,
}

impl HostPart {
    fn new(part: SplitPart, max_features: usize) -> Result<Self> {
        let x = pad_features(part.x, max_features)?;
        Ok(Self {
            x: x.mapv(|v| v as f32),
            y: part.y.mapv(|v| v as f32),
        })
    }

    fn len(&self) -> usize {
        self.y.len()
    }

    fn rows(&self, rows: &[usize]) -> (Vec<f32>, Vec<f32>) {
        let x = self.x.select(Axis(0), rows);
        let y = self.y.select(Axis(0), rows);
        (x.iter().copied().collect(), y.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct RealDataSource {
    train: HostPart,
    val: HostPart,
    test: HostPart,
    num_features: usize,
    num_classes: usize,
    bptt: usize,
    aggregate_k_gradients: usize,
    active_rows: Vec<usize>,
    sampler: Option<EvalPosSampler>,
    rng: StdRng,
}

impl RealDataSource {
    /// Shuffle each part once with `seed`, pad features and size the window.
    pub fn new(
        data: SplitData,
        max_features: usize,
        bptt: usize,
        aggregate_k_gradients: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let train = shuffled(data.train, &mut rng);
        let val = shuffled(data.val, &mut rng);
        let test = shuffled(data.test, &mut rng);

        let mut labels: Vec<i64> = train.y.iter().map(|&v| v as i64).collect();
        labels.sort_unstable();
        labels.dedup();

        let train = HostPart::new(train, max_features)?;
        let n = train.len();
        let window = inflate_window(n, bptt, aggregate_k_gradients);
        if window != bptt {
            log::info!(
                "inflated window from {} to {} so {} batches split into groups of {}",
                bptt,
                window,
                n / window,
                aggregate_k_gradients
            );
        }

        Ok(Self {
            train,
            val: HostPart::new(val, max_features)?,
            test: HostPart::new(test, max_features)?,
            num_features: max_features,
            num_classes: labels.len(),
            bptt: window,
            aggregate_k_gradients: aggregate_k_gradients.max(1),
            active_rows: (0..n).collect(),
            sampler: None,
            rng,
        })
    }

    /// Draw the split point of training batches from `sampler`.
    ///
    /// Without a sampler every row of a training window is a query.
    pub fn with_eval_pos_sampler(mut self, sampler: EvalPosSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Distinct training labels seen at load time.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn eval_len(&self, split: EvalSplit) -> usize {
        self.part(split).len()
    }

    /// Restrict training to `rows`, re-inflating the window for the subset.
    pub fn restrict_to(&mut self, rows: Vec<usize>) {
        self.bptt = inflate_window(rows.len(), self.bptt, self.aggregate_k_gradients);
        self.active_rows = rows;
    }

    /// Train on every row again.
    pub fn use_all_rows(&mut self) {
        self.active_rows = (0..self.train.len()).collect();
    }

    fn part(&self, split: EvalSplit) -> &HostPart {
        match split {
            EvalSplit::Val => &self.val,
            EvalSplit::Test => &self.test,
        }
    }

    /// Leading `cl` rows of a freshly shuffled first training window.
    fn context_rows(&mut self, cl: usize) -> Vec<usize> {
        let mut order = self.active_rows.clone();
        order.shuffle(&mut self.rng);
        order.truncate(cl.min(self.bptt));
        order
    }

    /// Held-out batches of one split, each prefixed by `cl` training rows.
    ///
    /// Every batch has `single_eval_pos == Some(context_len)`; the final
    /// batch may be shorter than the window.
    pub fn eval_batches<B: burn::tensor::backend::Backend>(
        &mut self,
        split: EvalSplit,
        cl: usize,
        device: &B::Device,
    ) -> Vec<Batch<B>> {
        let context = self.context_rows(cl);
        let (ctx_x, ctx_y) = self.train.rows(&context);
        let part = self.part(split);
        let f = self.num_features;

        (0..part.len())
            .collect::<Vec<_>>()
            .chunks(self.bptt.max(1))
            .map(|rows| {
                let (qx, qy) = part.rows(rows);
                let x: Vec<f32> = ctx_x.iter().chain(&qx).copied().collect();
                let y: Vec<f32> = ctx_y.iter().chain(&qy).copied().collect();
                let seq_len = context.len() + rows.len();
                Batch::from_host(x, y, seq_len, 1, f, Some(context.len()), device)
            })
            .collect()
    }
}

impl<B: burn::tensor::backend::Backend> BatchSource<B> for RealDataSource {
    fn num_features(&self) -> usize {
        self.num_features
    }

    fn window(&self) -> usize {
        self.bptt
    }

    fn batches_per_epoch(&self) -> usize {
        self.active_rows.len() / self.bptt
    }

    /// Shuffled full windows; the trailing partial window is dropped.
    fn epoch<'a>(&'a mut self, device: &'a B::Device) -> Box<dyn Iterator<Item = Batch<B>> + 'a> {
        let mut order = self.active_rows.clone();
        order.shuffle(&mut self.rng);
        let bptt = self.bptt;
        let f = self.num_features;
        let train = &self.train;
        let sampler = self.sampler.as_ref();
        let rng = &mut self.rng;
        let n_batches = order.len() / bptt;
        Box::new((0..n_batches).map(move |i| {
            let (x, y) = train.rows(&order[i * bptt..(i + 1) * bptt]);
            let single_eval_pos = sampler.map(|s| s.sample(rng).min(bptt));
            Batch::from_host(x, y, bptt, 1, f, single_eval_pos, device)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use ndarray::Array;

    type TestBackend = NdArray<f32>;

    fn part(rows: usize, cols: usize, offset: usize) -> SplitPart {
        SplitPart {
            x: Array::from_shape_fn((rows, cols), |(r, c)| ((offset + r) * 10 + c) as f64),
            y: Array::from_shape_fn(rows, |r| ((offset + r) % 3) as f64),
        }
    }

    fn source(n_train: usize, bptt: usize, k: usize) -> RealDataSource {
        let data = SplitData {
            train: part(n_train, 3, 0),
            val: part(7, 3, 100),
            test: part(5, 3, 200),
        };
        RealDataSource::new(data, 6, bptt, k, 42).unwrap()
    }

    #[test]
    fn test_inflate_window_examples() {
        assert_eq!(inflate_window(100, 10, 4), 12);
        assert_eq!(inflate_window(100, 10, 1), 10);
        assert_eq!(inflate_window(5, 10, 3), 10);
    }

    #[test]
    fn test_too_many_features_rejected() {
        let data = SplitData {
            train: part(4, 8, 0),
            val: part(2, 8, 0),
            test: part(2, 8, 0),
        };
        let err = RealDataSource::new(data, 6, 2, 1, 0).unwrap_err();
        assert!(matches!(err, TabPfnError::Validation(_)));
    }

    #[test]
    fn test_epoch_pads_and_drops_last() {
        let device = Default::default();
        let mut src = source(23, 5, 2);
        let bptt = BatchSource::<TestBackend>::window(&src);
        assert_eq!((23 / bptt) % 2, 0);
        let batches: Vec<_> = BatchSource::<TestBackend>::epoch(&mut src, &device).collect();
        assert_eq!(batches.len(), 23 / bptt);
        for batch in &batches {
            assert_eq!(batch.x.dims(), [bptt, 1, 6]);
            assert_eq!(batch.single_eval_pos, None);
            let padding: Vec<f32> = batch
                .x
                .clone()
                .slice([0..bptt, 0..1, 3..6])
                .into_data()
                .iter::<f32>()
                .collect();
            assert!(padding.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_eval_batches_prefix_context() {
        let device = Default::default();
        let mut src = source(20, 4, 1);
        let batches = src.eval_batches::<TestBackend>(EvalSplit::Val, 3, &device);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].seq_len(), 3 + 4);
        assert_eq!(batches[1].seq_len(), 3 + 3);
        assert!(batches.iter().all(|b| b.single_eval_pos == Some(3)));

        let no_context = src.eval_batches::<TestBackend>(EvalSplit::Test, 0, &device);
        assert_eq!(no_context.len(), 2);
        assert_eq!(no_context[0].single_eval_pos, Some(0));
    }

    #[test]
    fn test_bagging_subsets_are_seeded_halves() {
        let a = bagging_subsets(11, 3, 5);
        let b = bagging_subsets(11, 3, 5);
        assert_eq!(a, b);
        assert!(a.iter().all(|s| s.len() == 5));
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn test_restrict_keeps_divisibility() {
        let mut src = source(40, 3, 4);
        src.restrict_to(bagging_subsets(40, 1, 0).remove(0));
        let bptt = BatchSource::<TestBackend>::window(&src);
        assert_eq!((20 / bptt) % 4, 0);
        assert!(bptt >= 3);
    }

    #[test]
    fn test_sampler_sets_training_split() {
        let device = Default::default();
        let mut src = source(20, 5, 1).with_eval_pos_sampler(EvalPosSampler::Fixed(2));
        for batch in BatchSource::<TestBackend>::epoch(&mut src, &device) {
            assert_eq!(batch.single_eval_pos, Some(2));
        }
    }
}
