//! Checkpoint files.
//!
//! A checkpoint is a pair of files in the run's save directory:
//!
//! ```text
//! <save_dir>/checkpoint_ep<N>.ot     named parameter tensors (VarStore::save)
//! <save_dir>/checkpoint_ep<N>.json   CheckpointMeta
//! <save_dir>/best_model.ot / .json   copy of the best checkpoint so far
//! ```
//!
//! `N` counts completed epochs, so resuming from `checkpoint_ep3.ot`
//! continues with the fourth epoch. Loading is strict: the metadata must
//! describe the same architecture and every tensor must match a model
//! variable by name and shape. Nothing is copied unless every check passes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::Tensor;
use tracing::info;

use crate::config::BackboneKind;
use crate::error::{TrainError, TrainResult};
use crate::model::QualityNet;

/// File name of the best-so-far weights.
pub const BEST_MODEL_FILE: &str = "best_model.ot";

/// Metadata stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Completed epochs at save time.
    pub epoch: usize,
    /// Rank-1 accuracy of this checkpoint.
    pub rank1: f32,
    /// Best rank-1 seen so far in the run, including this one.
    pub best_rank1: f32,
    /// Epoch (completed count) at which `best_rank1` was reached.
    pub best_epoch: usize,
    /// Classifier width.
    pub num_classes: i64,
    /// Embedding width.
    pub embedding_dim: i64,
    /// Backbone variant.
    pub backbone: BackboneKind,
}

/// `<save_dir>/checkpoint_ep<epoch>.ot`.
pub fn checkpoint_path(save_dir: &Path, epoch: usize) -> PathBuf {
    save_dir.join(format!("checkpoint_ep{epoch}.ot"))
}

/// `<save_dir>/best_model.ot`.
pub fn best_model_path(save_dir: &Path) -> PathBuf {
    save_dir.join(BEST_MODEL_FILE)
}

/// Metadata file belonging to a weights file.
pub fn meta_path(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

/// Write the model and `meta` as `checkpoint_ep<meta.epoch>`, and refresh
/// `best_model` when `is_best`.
///
/// # Errors
///
/// Returns [`TrainError::Checkpoint`] when a file cannot be written.
pub fn save_checkpoint(
    model: &QualityNet,
    meta: &CheckpointMeta,
    save_dir: &Path,
    is_best: bool,
) -> TrainResult<PathBuf> {
    std::fs::create_dir_all(save_dir)
        .map_err(|e| TrainError::checkpoint(format!("cannot create directory: {e}"), save_dir))?;

    let weights = checkpoint_path(save_dir, meta.epoch);
    write_pair(model, meta, &weights)?;
    if is_best {
        let best = best_model_path(save_dir);
        for (from, to) in [(&weights, &best), (&meta_path(&weights), &meta_path(&best))] {
            std::fs::copy(from, to)
                .map_err(|e| TrainError::checkpoint(format!("cannot copy best model: {e}"), to))?;
        }
    }
    info!(path = %weights.display(), epoch = meta.epoch, rank1 = meta.rank1, is_best, "Checkpoint saved");
    Ok(weights)
}

fn write_pair(model: &QualityNet, meta: &CheckpointMeta, weights: &Path) -> TrainResult<()> {
    model
        .var_store()
        .save(weights)
        .map_err(|e| TrainError::checkpoint(format!("cannot write weights: {e}"), weights))?;
    let json = serde_json::to_string_pretty(meta)?;
    let meta_file = meta_path(weights);
    std::fs::write(&meta_file, json)
        .map_err(|e| TrainError::checkpoint(format!("cannot write metadata: {e}"), &meta_file))?;
    Ok(())
}

/// Read the metadata belonging to `weights`.
///
/// # Errors
///
/// Returns [`TrainError::Checkpoint`] when the file is missing or malformed.
pub fn read_meta(weights: &Path) -> TrainResult<CheckpointMeta> {
    let path = meta_path(weights);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| TrainError::checkpoint(format!("cannot read metadata: {e}"), &path))?;
    serde_json::from_str(&text)
        .map_err(|e| TrainError::checkpoint(format!("malformed metadata: {e}"), &path))
}

/// Restore `model` from `weights` and return its metadata.
///
/// # Errors
///
/// Returns [`TrainError::Checkpoint`] for a missing file, an architecture
/// mismatch, an unknown or missing tensor, or a shape mismatch. The model is
/// untouched on error.
pub fn load_checkpoint(model: &mut QualityNet, weights: &Path) -> TrainResult<CheckpointMeta> {
    if !weights.is_file() {
        return Err(TrainError::checkpoint("checkpoint file not found", weights));
    }
    let meta = read_meta(weights)?;
    if meta.backbone != model.backbone_kind()
        || meta.num_classes != model.num_classes()
        || meta.embedding_dim != model.embedding_dim()
    {
        return Err(TrainError::checkpoint(
            format!(
                "checkpoint is {}/K={}/D={}, model is {}/K={}/D={}",
                meta.backbone,
                meta.num_classes,
                meta.embedding_dim,
                model.backbone_kind(),
                model.num_classes(),
                model.embedding_dim()
            ),
            weights,
        ));
    }

    let mut stored: HashMap<String, Tensor> = Tensor::load_multi(weights)
        .map_err(|e| TrainError::checkpoint(format!("cannot read tensors: {e}"), weights))?
        .into_iter()
        .collect();

    let mut pairs = Vec::new();
    for (name, var) in model.var_store().variables() {
        let src = stored
            .remove(&name)
            .ok_or_else(|| TrainError::checkpoint(format!("missing tensor `{name}`"), weights))?;
        if src.size() != var.size() {
            return Err(TrainError::checkpoint(
                format!("`{name}` has shape {:?}, model expects {:?}", src.size(), var.size()),
                weights,
            ));
        }
        pairs.push((var, src));
    }
    if let Some(extra) = stored.keys().next() {
        return Err(TrainError::checkpoint(format!("unknown tensor `{extra}`"), weights));
    }

    tch::no_grad(|| {
        for (mut var, src) in pairs {
            var.copy_(&src.to_device(var.device()).to_kind(var.kind()));
        }
    });
    info!(path = %weights.display(), epoch = meta.epoch, rank1 = meta.rank1, "Checkpoint loaded");
    Ok(meta)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
