//! Sequence aggregation of per-frame features.
//!
//! Quality-aware pooling turns `S` frame features and `S` unnormalised
//! quality scores into one descriptor per tracklet:
//!
//! ```text
//! w   = softmax(Q, over S)            [B, S]
//! W   = Σ_s  w[b,s] · F[b,s,:]        [B, D]
//! N   = Σ_s  w[b,s] (broadcast to D)  [B, D]
//! out = W / N
//! ```
//!
//! `N` is identically one after the softmax; the division is kept so the
//! descriptor is always an explicit convex combination of frame features.
//! All operations are differentiable `tch` compositions, so the same function
//! is used inside the training graph and under `no_grad` at evaluation.

use tch::{Kind, Tensor};

use crate::config::PoolingMode;
use crate::error::{TrainError, TrainResult};

/// Softmax-normalise quality scores over the sequence axis.
///
/// # Shapes
/// - `scores`: `[B, S]`
/// - returns: `[B, S]`, each row sums to one.
pub fn quality_weights(scores: &Tensor) -> Tensor {
    scores.softmax(1, Kind::Float)
}

/// Aggregate frame features into one descriptor per tracklet.
///
/// # Shapes
/// - `features`: `[B, S, D]`
/// - `scores`: `[B, S]` (only read in [`PoolingMode::QualityWeighted`])
/// - returns: `[B, D]`
///
/// # Errors
///
/// Returns [`TrainError::ShapeMismatch`] when `features` is not rank 3 or the
/// batch/sequence sizes of `features` and `scores` disagree.
pub fn pool_sequence(mode: PoolingMode, features: &Tensor, scores: &Tensor) -> TrainResult<Tensor> {
    let f_shape = features.size();
    if f_shape.len() != 3 {
        return Err(TrainError::shape_mismatch("pool_sequence features", vec![-1, -1, -1], f_shape));
    }
    let (b, s, d) = (f_shape[0], f_shape[1], f_shape[2]);

    let pooled = match mode {
        PoolingMode::Avg => features.mean_dim(&[1i64][..], false, Kind::Float),
        PoolingMode::Max => features.amax(&[1i64][..], false),
        PoolingMode::QualityWeighted => {
            let q_shape = scores.size();
            let scores = match q_shape.as_slice() {
                [qb, qs] if *qb == b && *qs == s => scores.shallow_clone(),
                [qb, qs, 1] if *qb == b && *qs == s => scores.squeeze_dim(2),
                _ => {
                    return Err(TrainError::shape_mismatch(
                        "pool_sequence scores",
                        vec![b, s],
                        q_shape,
                    ))
                }
            };
            let weights = quality_weights(&scores).unsqueeze(2).expand([b, s, d], true);
            let weighted = (features * &weights).sum_dim_intlist(&[1i64][..], false, Kind::Float);
            let norm = weights.sum_dim_intlist(&[1i64][..], false, Kind::Float);
            weighted / norm
        }
    };
    Ok(pooled)
}

/// Flatten per-frame outputs `[B·S, ..]` back into `[B, S, D]` features and
/// `[B, S]` scores.
///
/// # Errors
///
/// Returns [`TrainError::ShapeMismatch`] when the leading dimension is not
/// `batch * seq_len`.
pub fn unflatten_frames(
    embeddings: &Tensor,
    quality: &Tensor,
    batch: i64,
    seq_len: i64,
) -> TrainResult<(Tensor, Tensor)> {
    let e_shape = embeddings.size();
    if e_shape.len() != 2 || e_shape[0] != batch * seq_len {
        return Err(TrainError::shape_mismatch(
            "frame embeddings",
            vec![batch * seq_len, -1],
            e_shape,
        ));
    }
    let q_numel = quality.numel() as i64;
    if q_numel != batch * seq_len {
        return Err(TrainError::shape_mismatch(
            "frame quality scores",
            vec![batch * seq_len, 1],
            quality.size(),
        ));
    }
    let features = embeddings.view([batch, seq_len, e_shape[1]]);
    let scores = quality.view([batch, seq_len]);
    Ok((features, scores))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn features() -> Tensor {
        // B=2, S=3, D=2
        Tensor::from_slice(&[
            1.0f32, 10.0, 2.0, 20.0, 3.0, 30.0, //
            -1.0, 0.5, 4.0, -2.0, 0.0, 1.0,
        ])
        .view([2, 3, 2])
    }

    #[test]
    fn weights_sum_to_one() {
        let scores = Tensor::from_slice(&[0.3f32, -1.2, 4.0, 0.0, 0.0, 0.0]).view([2, 3]);
        let sums = quality_weights(&scores).sum_dim_intlist(&[1i64][..], false, Kind::Float);
        let sums = Vec::<f32>::try_from(sums).unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-6, "row sum {s}");
        }
    }

    #[test]
    fn avg_ignores_scores() {
        let f = features();
        let a = pool_sequence(PoolingMode::Avg, &f, &Tensor::zeros([2, 3], (Kind::Float, Device::Cpu))).unwrap();
        let b = pool_sequence(PoolingMode::Avg, &f, &Tensor::randn([2, 3], (Kind::Float, Device::Cpu))).unwrap();
        assert!(a.allclose(&b, 1e-6, 1e-6, false));
        let first = Vec::<f32>::try_from(a.get(0)).unwrap();
        assert!((first[0] - 2.0).abs() < 1e-6);
        assert!((first[1] - 20.0).abs() < 1e-6);
    }

    #[test]
    fn max_is_per_dimension() {
        let pooled = pool_sequence(PoolingMode::Max, &features(), &Tensor::zeros([2, 3], (Kind::Float, Device::Cpu))).unwrap();
        let v = Vec::<f32>::try_from(pooled.flatten(0, -1)).unwrap();
        assert_eq!(v, vec![3.0, 30.0, 4.0, 1.0]);
    }

    #[test]
    fn equal_scores_reduce_to_mean() {
        let f = features();
        let scores = Tensor::full([2, 3], 0.7, (Kind::Float, Device::Cpu));
        let qan = pool_sequence(PoolingMode::QualityWeighted, &f, &scores).unwrap();
        let avg = pool_sequence(PoolingMode::Avg, &f, &scores).unwrap();
        assert!(qan.allclose(&avg, 1e-5, 1e-5, false));
    }

    #[test]
    fn column_scores_are_accepted() {
        let f = features();
        let scores = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 0.0, 0.0, 5.0]);
        let flat = pool_sequence(PoolingMode::QualityWeighted, &f, &scores.view([2, 3])).unwrap();
        let col = pool_sequence(PoolingMode::QualityWeighted, &f, &scores.view([2, 3, 1])).unwrap();
        assert!(flat.allclose(&col, 1e-6, 1e-6, false));
    }

    #[test]
    fn wrong_rank_is_an_error() {
        let flat = Tensor::zeros([6, 2], (Kind::Float, Device::Cpu));
        let scores = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        let err = pool_sequence(PoolingMode::Avg, &flat, &scores).unwrap_err();
        assert!(matches!(err, TrainError::ShapeMismatch { .. }));
    }

    #[test]
    fn mismatched_scores_are_an_error() {
        let scores = Tensor::zeros([2, 4], (Kind::Float, Device::Cpu));
        let err = pool_sequence(PoolingMode::QualityWeighted, &features(), &scores).unwrap_err();
        assert!(matches!(err, TrainError::ShapeMismatch { .. }));
    }

    #[test]
    fn unflatten_checks_leading_dimension() {
        let emb = Tensor::zeros([6, 4], (Kind::Float, Device::Cpu));
        let q = Tensor::zeros([6, 1], (Kind::Float, Device::Cpu));
        let (f, s) = unflatten_frames(&emb, &q, 2, 3).unwrap();
        assert_eq!(f.size(), vec![2, 3, 4]);
        assert_eq!(s.size(), vec![2, 3]);
        assert!(unflatten_frames(&emb, &q, 3, 3).is_err());
    }
}
