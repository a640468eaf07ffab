//! Running statistics and retrieval metrics.
//!
//! This module provides:
//!
//! - [`AverageMeter`]: tracks the latest value and running mean of a scalar
//!   (loss components, batch time, data time) for progress logging.
//! - [`evaluate_rankings`]: cumulative matching characteristic (CMC) and
//!   mean average precision (mAP) for a query × gallery distance matrix,
//!   following the standard video re-ID protocol: gallery entries that share
//!   both identity and camera with the query are ignored, and queries
//!   without any remaining true match are skipped.

use ndarray::Array2;

use crate::error::EvalError;

// ---------------------------------------------------------------------------
// AverageMeter
// ---------------------------------------------------------------------------

/// Current value and weighted running mean of a scalar.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    /// Most recent value.
    pub val: f64,
    /// Weighted sum of all values.
    pub sum: f64,
    /// Total weight seen.
    pub count: usize,
    /// `sum / count`, zero before the first update.
    pub avg: f64,
}

impl AverageMeter {
    /// Empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `val` observed over `n` samples.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

// ---------------------------------------------------------------------------
// RankingResult
// ---------------------------------------------------------------------------

/// CMC curve and mAP over the valid queries of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingResult {
    /// `cmc[k]` is the fraction of valid queries whose first true match is
    /// within the top `k + 1` results. Length equals the requested
    /// `max_rank`.
    pub cmc: Vec<f32>,
    /// Mean average precision (0-1 scale).
    pub map: f32,
    /// Queries that had at least one true match.
    pub num_valid_queries: usize,
}

impl RankingResult {
    /// Rank-1 accuracy, the primary model-selection metric.
    pub fn rank1(&self) -> f32 {
        self.cmc.first().copied().unwrap_or(0.0)
    }

    /// Accuracy at 1-based `rank`, `None` past the end of the curve.
    pub fn rank(&self, rank: usize) -> Option<f32> {
        rank.checked_sub(1).and_then(|k| self.cmc.get(k).copied())
    }

    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        format!(
            "mAP={:.1}%  Rank-1={:.1}%  (valid queries={})",
            self.map * 100.0,
            self.rank1() * 100.0,
            self.num_valid_queries
        )
    }
}

// ---------------------------------------------------------------------------
// evaluate_rankings
// ---------------------------------------------------------------------------

/// Compute CMC and mAP from a `[m, n]` query × gallery distance matrix.
///
/// Gallery entries are sorted by ascending distance; ties keep gallery order.
/// Per query, the CMC contribution is capped at one, truncated to
/// `max_rank` and padded with its final value when fewer gallery entries
/// remain after filtering.
///
/// # Errors
///
/// - [`EvalError::LabelMismatch`] when label vectors do not match the
///   matrix.
/// - [`EvalError::EmptyGallery`] when `n == 0`.
/// - [`EvalError::NoValidQueries`] when no query has a true match.
pub fn evaluate_rankings(
    distmat: &Array2<f32>,
    q_pids: &[usize],
    g_pids: &[usize],
    q_camids: &[usize],
    g_camids: &[usize],
    max_rank: usize,
) -> Result<RankingResult, EvalError> {
    let (m, n) = distmat.dim();
    if q_pids.len() != m || q_camids.len() != m || g_pids.len() != n || g_camids.len() != n {
        return Err(EvalError::LabelMismatch {
            rows: m,
            cols: n,
            queries: q_pids.len().min(q_camids.len()),
            gallery: g_pids.len().min(g_camids.len()),
        });
    }
    if n == 0 {
        return Err(EvalError::EmptyGallery);
    }

    let mut cmc_sum = vec![0.0f64; max_rank];
    let mut ap_sum = 0.0f64;
    let mut num_valid = 0usize;
    let mut order: Vec<usize> = Vec::with_capacity(n);

    for (qi, row) in distmat.outer_iter().enumerate() {
        order.clear();
        order.extend(0..n);
        // sort_by is stable, so equal distances keep gallery order.
        order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));

        let (q_pid, q_cam) = (q_pids[qi], q_camids[qi]);
        let matches: Vec<bool> = order
            .iter()
            .filter(|&&gi| !(g_pids[gi] == q_pid && g_camids[gi] == q_cam))
            .map(|&gi| g_pids[gi] == q_pid)
            .collect();

        let Some(first_hit) = matches.iter().position(|&hit| hit) else {
            continue;
        };
        num_valid += 1;

        for slot in cmc_sum.iter_mut().skip(first_hit) {
            *slot += 1.0;
        }

        let mut hits = 0usize;
        let mut precision_sum = 0.0f64;
        for (i, _) in matches.iter().enumerate().filter(|&(_, &hit)| hit) {
            hits += 1;
            precision_sum += hits as f64 / (i + 1) as f64;
        }
        ap_sum += precision_sum / hits as f64;
    }

    if num_valid == 0 {
        return Err(EvalError::NoValidQueries { num_queries: m });
    }

    let denom = num_valid as f64;
    Ok(RankingResult {
        cmc: cmc_sum.into_iter().map(|c| (c / denom) as f32).collect(),
        map: (ap_sum / denom) as f32,
        num_valid_queries: num_valid,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn average_meter_weights_by_count() {
        let mut m = AverageMeter::new();
        m.update(2.0, 1);
        m.update(4.0, 3);
        assert_abs_diff_eq!(m.val, 4.0);
        assert_eq!(m.count, 4);
        assert_abs_diff_eq!(m.avg, 3.5);
    }

    #[test]
    fn perfect_ranking() {
        let d = array![[0.1f32, 0.9], [0.8, 0.2]];
        let r = evaluate_rankings(&d, &[0, 1], &[0, 1], &[0, 0], &[1, 1], 2).unwrap();
        assert_eq!(r.cmc, vec![1.0, 1.0]);
        assert_abs_diff_eq!(r.map, 1.0);
        assert_eq!(r.num_valid_queries, 2);
    }

    #[test]
    fn same_camera_matches_are_ignored() {
        // The nearest gallery entry shares pid and camera with the query and
        // must be dropped, leaving the true cross-camera match at rank 2.
        let d = array![[0.0f32, 0.5, 0.3]];
        let r = evaluate_rankings(&d, &[7], &[7, 7, 3], &[0], &[0, 1, 1], 3).unwrap();
        assert_eq!(r.cmc, vec![0.0, 1.0, 1.0]);
        assert_abs_diff_eq!(r.map, 0.5);
    }

    #[test]
    fn ties_keep_gallery_order() {
        let d = array![[1.0f32, 1.0]];
        let r = evaluate_rankings(&d, &[0], &[1, 0], &[0], &[1, 1], 2).unwrap();
        assert_eq!(r.cmc, vec![0.0, 1.0]);
    }

    #[test]
    fn curve_is_padded_past_the_gallery() {
        let d = array![[0.2f32, 0.1]];
        let r = evaluate_rankings(&d, &[0], &[0, 1], &[0], &[1, 1], 5).unwrap();
        assert_eq!(r.cmc.len(), 5);
        assert_eq!(r.cmc, vec![0.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(r.rank(5), Some(1.0));
        assert_eq!(r.rank(6), None);
    }

    #[test]
    fn no_valid_queries_is_an_error() {
        let d = array![[0.2f32, 0.1]];
        let err = evaluate_rankings(&d, &[9], &[0, 1], &[0], &[1, 1], 2).unwrap_err();
        assert!(matches!(err, EvalError::NoValidQueries { num_queries: 1 }));
    }

    #[test]
    fn label_mismatch_is_an_error() {
        let d = array![[0.2f32, 0.1]];
        let err = evaluate_rankings(&d, &[0, 1], &[0, 1], &[0], &[1, 1], 2).unwrap_err();
        assert!(matches!(err, EvalError::LabelMismatch { .. }));
    }
}
