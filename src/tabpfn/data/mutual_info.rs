//! Mutual information between continuous features and a discrete target.
//!
//! Nearest-neighbour estimator of Ross (2014), the continuous/discrete
//! variant of Kraskov et al. Each feature column is scaled to unit variance
//! before estimation. Points whose label occurs only once are ignored.

use ndarray::{Array2, ArrayView1};

/// Neighbours used by the estimator.
pub const DEFAULT_NEIGHBORS: usize = 3;

/// Digamma via recurrence up to x >= 8, then the asymptotic series.
/// Only ever evaluated on positive counts here.
pub fn digamma(mut x: f64) -> f64 {
    let mut s = 0.0;
    while x < 8.0 {
        s -= 1.0 / x;
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    s + x.ln() - 0.5 * inv - inv2 * (1.0 / 12.0) + inv2 * inv2 * (1.0 / 120.0)
        - inv2 * inv2 * inv2 * (1.0 / 252.0)
}

/// Largest float strictly below `r` toward zero.
fn next_toward_zero(r: f64) -> f64 {
    if r > 0.0 {
        f64::from_bits(r.to_bits() - 1)
    } else {
        r
    }
}

/// MI estimate for one continuous column `c` against labels `d`, clipped at 0.
pub fn mutual_info_continuous_discrete(
    c: ArrayView1<'_, f64>,
    d: ArrayView1<'_, f64>,
    n_neighbors: usize,
) -> f64 {
    let n = c.len();
    let mut radius = vec![0.0; n];
    let mut label_counts = vec![0usize; n];
    let mut k_all = vec![0usize; n];

    let mut labels: Vec<f64> = d.to_vec();
    labels.sort_by(f64::total_cmp);
    labels.dedup();

    for &label in &labels {
        let members: Vec<usize> = (0..n).filter(|&i| d[i] == label).collect();
        let count = members.len();
        if count > 1 {
            let k = n_neighbors.min(count - 1);
            for &i in &members {
                let mut dists: Vec<f64> = members
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| (c[i] - c[j]).abs())
                    .collect();
                dists.sort_by(f64::total_cmp);
                radius[i] = next_toward_zero(dists[k - 1]);
                k_all[i] = k;
            }
        }
        for &i in &members {
            label_counts[i] = count;
        }
    }

    let kept: Vec<usize> = (0..n).filter(|&i| label_counts[i] > 1).collect();
    let n_kept = kept.len();
    if n_kept == 0 {
        return 0.0;
    }

    let mut mean_k = 0.0;
    let mut mean_label = 0.0;
    let mut mean_m = 0.0;
    for &i in &kept {
        // Counts include the point itself.
        let m = kept
            .iter()
            .filter(|&&j| (c[i] - c[j]).abs() <= radius[i])
            .count();
        mean_k += digamma(k_all[i] as f64);
        mean_label += digamma(label_counts[i] as f64);
        mean_m += digamma(m as f64);
    }
    let scale = n_kept as f64;
    let mi = digamma(n_kept as f64) + mean_k / scale - mean_label / scale - mean_m / scale;
    mi.max(0.0)
}

/// Per-column MI scores of `x` against the labels `y`.
pub fn mutual_info_classif(x: &Array2<f64>, y: ArrayView1<'_, f64>) -> Vec<f64> {
    x.columns()
        .into_iter()
        .map(|column| {
            let n = column.len().max(1) as f64;
            let mean = column.sum() / n;
            let std = (column.mapv(|v| (v - mean).powi(2)).sum() / n).sqrt();
            let scaled = if std > 0.0 {
                column.mapv(|v| v / std)
            } else {
                column.to_owned()
            };
            mutual_info_continuous_discrete(scaled.view(), y, DEFAULT_NEIGHBORS)
        })
        .collect()
}

/// Indices of the `k` best-scoring columns, returned in ascending column order.
/// Ties keep the lower column index.
pub fn select_k_best(scores: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    let mut chosen: Vec<usize> = order.into_iter().take(k).collect();
    chosen.sort_unstable();
    chosen
}
