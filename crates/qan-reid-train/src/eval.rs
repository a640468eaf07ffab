//! Retrieval evaluation on the query and gallery splits.
//!
//! ```text
//! tracklets ─► frames [B·S,3,H,W] ─► model (no grad, BN eval) ─► pool ─► [B, D]
//!                                                                    │
//!              query descriptors [m, D]   gallery descriptors [n, D] ◄┘
//!                          └───────► distance matrix [m, n] ─► CMC / mAP
//! ```
//!
//! Frames are sampled evenly from every tracklet and aggregated with the
//! configured [`PoolingMode`](crate::config::PoolingMode).

use ndarray::Array2;
use std::time::Instant;
use tch::{Device, Kind, Tensor};
use tracing::info;

use crate::config::TrainingConfig;
use crate::dataset::{ReidDataset, Tracklet};
use crate::error::{TrainError, TrainResult};
use crate::loader::TrackletLoader;
use crate::metrics::{evaluate_rankings, RankingResult};
use crate::model::QualityNet;
use crate::pooling::{pool_sequence, unflatten_frames};
use crate::sampler::{sequential_plan, FrameSampling};

/// Pooled descriptors of one split with their labels.
#[derive(Debug)]
pub struct Descriptors {
    /// `[N, D]`, on the CPU.
    pub features: Tensor,
    /// Identity per tracklet.
    pub pids: Vec<usize>,
    /// Camera per tracklet.
    pub camids: Vec<usize>,
}

/// Extract one pooled descriptor per tracklet of `split`.
///
/// # Errors
///
/// Returns [`TrainError::EmptyDataset`] for an empty split and propagates
/// loading and forward errors.
pub fn extract_descriptors(
    model: &QualityNet,
    dataset: &dyn ReidDataset,
    tracklets: &[Tracklet],
    split: &'static str,
    config: &TrainingConfig,
    device: Device,
) -> TrainResult<Descriptors> {
    if tracklets.is_empty() {
        return Err(TrainError::EmptyDataset { split });
    }
    let loader = TrackletLoader::new(
        dataset,
        tracklets,
        FrameSampling::Evenly,
        config.seq_len,
        (config.height, config.width),
        config.num_workers,
        config.seed,
    );
    let plan = sequential_plan(tracklets.len(), config.test_batch);

    let mut chunks = Vec::with_capacity(plan.len());
    let mut pids = Vec::with_capacity(tracklets.len());
    let mut camids = Vec::with_capacity(tracklets.len());
    loader.for_each_batch(&plan, 0, |_, batch, _| {
        let (b, s) = (batch.len() as i64, batch.seq_len() as i64);
        let out = model.forward_inference(&batch.frames_tensor(device))?;
        let (features, scores) = unflatten_frames(&out.embedding, &out.quality, b, s)?;
        let pooled = tch::no_grad(|| pool_sequence(config.pooling, &features, &scores))?;
        chunks.push(pooled.to_device(Device::Cpu));
        pids.extend(batch.pids);
        camids.extend(batch.camids);
        Ok(())
    })?;

    let features = Tensor::cat(&chunks, 0);
    info!(
        split,
        rows = features.size()[0],
        dim = features.size()[1],
        "Extracted descriptors"
    );
    Ok(Descriptors { features, pids, camids })
}

/// Squared Euclidean distances `‖q‖² + ‖g‖² − 2 q·g`, clamped at zero.
///
/// # Shapes
/// - `query`: `[m, D]`
/// - `gallery`: `[n, D]`
/// - returns: `[m, n]`
///
/// # Errors
///
/// Returns [`TrainError::ShapeMismatch`] when the inputs are not matrices of
/// equal width.
pub fn compute_distance_matrix(query: &Tensor, gallery: &Tensor) -> TrainResult<Array2<f32>> {
    let (q_shape, g_shape) = (query.size(), gallery.size());
    if q_shape.len() != 2 || g_shape.len() != 2 || q_shape[1] != g_shape[1] {
        return Err(TrainError::shape_mismatch("distance matrix gallery", q_shape, g_shape));
    }
    let (m, n) = (q_shape[0], g_shape[0]);
    let q = query.to_kind(Kind::Float);
    let g = gallery.to_kind(Kind::Float);
    let q_sq = q.pow_tensor_scalar(2).sum_dim_intlist(&[1i64][..], true, Kind::Float).expand([m, n], true);
    let g_sq = g.pow_tensor_scalar(2).sum_dim_intlist(&[1i64][..], true, Kind::Float).expand([n, m], true).tr();
    let dist = (q_sq + g_sq - q.matmul(&g.tr()) * 2.0).clamp_min(0.0);

    let values = Vec::<f32>::try_from(dist.contiguous().view([-1]))?;
    Array2::from_shape_vec((m as usize, n as usize), values)
        .map_err(|_| TrainError::shape_mismatch("distance matrix", vec![m, n], dist.size()))
}

/// Evaluate `model` on the query/gallery splits of `dataset`.
///
/// Logs mAP and the configured CMC ranks, and returns the full ranking
/// result (rank-1 is the model-selection metric).
///
/// # Errors
///
/// Propagates extraction errors and [`crate::error::EvalError`] from
/// ranking.
pub fn evaluate(
    model: &QualityNet,
    dataset: &dyn ReidDataset,
    config: &TrainingConfig,
    device: Device,
) -> TrainResult<RankingResult> {
    let start = Instant::now();
    let q = extract_descriptors(model, dataset, dataset.query(), "query", config, device)?;
    let g = extract_descriptors(model, dataset, dataset.gallery(), "gallery", config, device)?;

    info!("Computing distance matrix");
    let distmat = compute_distance_matrix(&q.features, &g.features)?;

    info!("Computing CMC and mAP");
    let result = evaluate_rankings(&distmat, &q.pids, &g.pids, &q.camids, &g.camids, config.max_rank)?;

    info!(pooling = %config.pooling, "Results: mAP {:.1}%", result.map * 100.0);
    for &r in &config.ranks {
        if let Some(acc) = result.rank(r) {
            info!("Rank-{:<3}: {:.1}%", r, acc * 100.0);
        }
    }
    info!(elapsed_ms = start.elapsed().as_millis() as u64, valid_queries = result.num_valid_queries, "Evaluation finished");
    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
