//! Loss functions for QAN training.
//!
//! Two supervision signals are applied at two granularities:
//!
//! - **Label-smoothed cross-entropy** on classifier logits.
//! - **Batch-hard triplet loss** on Euclidean distances between embeddings.
//!
//! ```text
//! L_img   = CE(frame logits, frame pids)   + Triplet(frame embeddings, frame pids)
//! L_seq   = CE(seq logits,   tracklet pids) + Triplet(pooled descriptors, tracklet pids)
//! L_total = L_img + L_seq
//! ```
//!
//! With `htri_only` the cross-entropy terms are dropped at both levels.

use tch::{Kind, Tensor};

use crate::error::LossError;

// ─────────────────────────────────────────────────────────────────────────────
// Cross-entropy with label smoothing
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-entropy against smoothed one-hot targets.
///
/// The target distribution for label `y` is `(1 − ε)·onehot(y) + ε / K`; the
/// loss is the batch mean of `−Σ_k target_k · log softmax(logits)_k`. With
/// `ε = 0` this is exactly the standard cross-entropy.
///
/// # Shapes
/// - `logits`: `[N, K]`
/// - `targets`: `[N]` integer class indices
/// - returns: scalar
///
/// # Errors
///
/// Returns [`LossError::LabelCount`] when `N` differs between the inputs.
pub fn cross_entropy_label_smooth(
    logits: &Tensor,
    targets: &Tensor,
    epsilon: f64,
) -> Result<Tensor, LossError> {
    check_rows(logits, targets)?;
    let num_classes = logits.size()[1] as f64;
    let log_probs = logits.log_softmax(1, Kind::Float);
    let one_hot = log_probs
        .zeros_like()
        .scatter_value(1, &targets.to_kind(Kind::Int64).unsqueeze(1), 1.0);
    let smoothed = one_hot * (1.0 - epsilon) + epsilon / num_classes;
    Ok((-smoothed * log_probs)
        .sum_dim_intlist(&[1i64][..], false, Kind::Float)
        .mean(Kind::Float))
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch-hard triplet loss
// ─────────────────────────────────────────────────────────────────────────────

/// Pairwise Euclidean distances within one batch, `‖a‖² + ‖b‖² − 2a·b`
/// clamped at `1e-12` before the square root.
///
/// # Shapes
/// - `x`: `[N, D]`
/// - returns: `[N, N]`
pub fn pairwise_euclidean(x: &Tensor) -> Tensor {
    let n = x.size()[0];
    let sq = x
        .pow_tensor_scalar(2)
        .sum_dim_intlist(&[1i64][..], true, Kind::Float)
        .expand([n, n], true);
    let gram = x.matmul(&x.tr());
    (&sq + &sq.tr() - gram * 2.0).clamp_min(1e-12).sqrt()
}

/// Batch-hard triplet loss.
///
/// For every anchor the hardest positive (same identity, another sample,
/// largest distance) and hardest negative (other identity, smallest distance)
/// are selected; the loss is the mean of `max(0, margin + d_ap − d_an)`.
///
/// # Shapes
/// - `embeddings`: `[N, D]`
/// - `targets`: `[N]` identity labels
/// - returns: scalar
///
/// # Errors
///
/// Returns [`LossError::DegenerateTripletBatch`] when any anchor has no
/// positive or no negative partner, and [`LossError::LabelCount`] when `N`
/// differs between the inputs.
pub fn batch_hard_triplet(
    embeddings: &Tensor,
    targets: &Tensor,
    margin: f64,
) -> Result<Tensor, LossError> {
    check_rows(embeddings, targets)?;
    let n = embeddings.size()[0];
    let device = embeddings.device();

    let targets = targets.to_kind(Kind::Int64);
    let same = targets.unsqueeze(1).eq_tensor(&targets.unsqueeze(0));
    let not_self = Tensor::eye(n, (Kind::Bool, device)).logical_not();
    let pos_mask = same.logical_and(&not_self);
    let neg_mask = same.logical_not();

    let without_pos = count_empty_rows(&pos_mask);
    let without_neg = count_empty_rows(&neg_mask);
    if without_pos > 0 || without_neg > 0 {
        return Err(LossError::DegenerateTripletBatch {
            anchors_without_positive: without_pos,
            anchors_without_negative: without_neg,
            batch: n,
        });
    }

    let dist = pairwise_euclidean(embeddings);
    let d_ap = dist
        .masked_fill(&pos_mask.logical_not(), f64::NEG_INFINITY)
        .amax(&[1i64][..], false);
    let d_an = dist
        .masked_fill(&neg_mask.logical_not(), f64::INFINITY)
        .amin(&[1i64][..], false);

    Ok((d_ap - d_an + margin).clamp_min(0.0).mean(Kind::Float))
}

fn count_empty_rows(mask: &Tensor) -> i64 {
    mask.any_dim(1, false).logical_not().sum(Kind::Int64).int64_value(&[])
}

fn check_rows(inputs: &Tensor, targets: &Tensor) -> Result<(), LossError> {
    let rows = inputs.size().first().copied().unwrap_or(0);
    let labels = targets.numel() as i64;
    if rows != labels {
        return Err(LossError::LabelCount { inputs: rows, labels });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Combined criterion
// ─────────────────────────────────────────────────────────────────────────────

/// One granularity's loss: the differentiable total plus scalar components
/// extracted for logging.
#[derive(Debug)]
pub struct LossTerms {
    /// Differentiable sum of the active terms.
    pub total: Tensor,
    /// Cross-entropy value, `None` when training with triplet terms only.
    pub xent: Option<f64>,
    /// Triplet value.
    pub htri: f64,
}

impl LossTerms {
    /// Scalar value of [`Self::total`].
    pub fn value(&self) -> f64 {
        self.total.double_value(&[])
    }
}

/// Identity cross-entropy plus batch-hard triplet, shared by the frame-level
/// and sequence-level terms.
#[derive(Debug, Clone, Copy)]
pub struct QanCriterion {
    /// Label-smoothing ε.
    pub epsilon: f64,
    /// Triplet margin.
    pub margin: f64,
    /// Drop the cross-entropy term.
    pub htri_only: bool,
}

impl QanCriterion {
    /// Build the criterion from the run configuration.
    pub fn from_config(cfg: &crate::config::TrainingConfig) -> Self {
        QanCriterion {
            epsilon: cfg.label_smoothing,
            margin: cfg.margin,
            htri_only: cfg.htri_only,
        }
    }

    /// Loss for one granularity: `CE(logits, labels) + Triplet(embeddings, labels)`.
    ///
    /// # Errors
    ///
    /// Propagates [`LossError`] from either term.
    pub fn terms(
        &self,
        logits: &Tensor,
        embeddings: &Tensor,
        labels: &Tensor,
    ) -> Result<LossTerms, LossError> {
        let htri = batch_hard_triplet(embeddings, labels, self.margin)?;
        let htri_value = htri.double_value(&[]);
        if self.htri_only {
            return Ok(LossTerms { total: htri, xent: None, htri: htri_value });
        }
        let xent = cross_entropy_label_smooth(logits, labels, self.epsilon)?;
        let xent_value = xent.double_value(&[]);
        Ok(LossTerms {
            total: xent + htri,
            xent: Some(xent_value),
            htri: htri_value,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
