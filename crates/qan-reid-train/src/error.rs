//! Error types for the QAN re-identification training pipeline.
//!
//! Every module imports its error type from here rather than defining it
//! inline, so the hierarchy stays in one place.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / file loading / unsupported names)
//! ├── DatasetError  (tracklet lists, frame decoding, batching)
//! ├── LossError     (degenerate triplet batches)
//! ├── EvalError     (ranking with no valid queries, label mismatches)
//! └── tch::TchError (libtorch failures)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the training and evaluation pipeline.
///
/// Orchestration-level functions ([`crate::trainer::Trainer`] methods,
/// [`crate::eval::evaluate`], checkpoint helpers) return `TrainResult<T>`.
/// Lower-level functions return their module-specific error types which are
/// coerced into `TrainError` via [`From`].
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset loading or access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// A loss could not be computed for the current batch.
    #[error("Loss error: {0}")]
    Loss(#[from] LossError),

    /// Retrieval evaluation failed.
    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    /// libtorch reported a failure.
    #[error("Tensor backend error: {0}")]
    Tch(#[from] tch::TchError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The training split is empty and no training can be performed.
    #[error("Dataset split `{split}` is empty")]
    EmptyDataset {
        /// Which split was empty (`train`, `query` or `gallery`).
        split: &'static str,
    },

    /// A shape mismatch was detected between two tensors.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: &'static str,
        /// Expected shape.
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },

    /// A checkpoint could not be saved or loaded.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// Human-readable description.
        message: String,
        /// Path that was being accessed.
        path: PathBuf,
    },

    /// The requested compute device is not available.
    #[error("Device `{requested}` is unavailable and CPU fallback is disabled")]
    DeviceUnavailable {
        /// Description of the requested device.
        requested: String,
    },

    /// A training step produced a non-finite loss.
    #[error("Training step failed: {0}")]
    TrainingStep(String),
}

impl TrainError {
    /// Construct a [`TrainError::TrainingStep`].
    pub fn training_step<S: Into<String>>(msg: S) -> Self {
        TrainError::TrainingStep(msg.into())
    }

    /// Construct a [`TrainError::Checkpoint`].
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        TrainError::Checkpoint { message: msg.into(), path: path.into() }
    }

    /// Construct a [`TrainError::ShapeMismatch`].
    pub fn shape_mismatch(context: &'static str, expected: Vec<i64>, actual: Vec<i64>) -> Self {
        TrainError::ShapeMismatch { context, expected, actual }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`TrainingConfig`].
///
/// [`TrainingConfig`]: crate::config::TrainingConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A named choice (optimizer, dataset, pooling mode, backbone) is not
    /// supported.
    #[error("Unsupported {field} `{value}` (supported: {supported})")]
    Unsupported {
        /// Which option was being resolved.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Comma-separated list of accepted values.
        supported: String,
    },

    /// A configuration file could not be read from or written to disk.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }

    /// Construct a [`ConfigError::Unsupported`].
    pub fn unsupported(field: &'static str, value: impl Into<String>, supported: &[&str]) -> Self {
        ConfigError::Unsupported {
            field,
            value: value.into(),
            supported: supported.join(", "),
        }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while loading tracklets or assembling batches.
///
/// Training code must not suppress these: a missing frame ends the run.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A frame image could not be opened or decoded.
    #[error("Cannot decode frame `{path}`: {source}")]
    FrameDecode {
        /// Path of the frame.
        path: PathBuf,
        /// Underlying decoder error.
        #[source]
        source: image::ImageError,
    },

    /// A frame path is not known to the dataset that was asked to render it.
    #[error("Unknown frame `{path}` for dataset {dataset}")]
    UnknownFrame {
        /// Requested path.
        path: PathBuf,
        /// Dataset name.
        dataset: String,
    },

    /// A tracklet has no frames.
    #[error("Tracklet {index} (pid {pid}) has no frames")]
    EmptyTracklet {
        /// Position of the tracklet in its split.
        index: usize,
        /// Identity label of the tracklet.
        pid: usize,
    },

    /// A decoded frame does not have the configured shape.
    #[error("Frame `{path}` has shape {actual:?}, expected {expected:?}")]
    FrameShape {
        /// Path of the frame.
        path: PathBuf,
        /// Expected `[C, H, W]`.
        expected: [usize; 3],
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// The identity-balanced sampler cannot form a single batch.
    #[error("Identity sampler needs at least {required} identities per batch, split has {available}")]
    NotEnoughIdentities {
        /// Identities needed for one batch.
        required: usize,
        /// Identities present in the split.
        available: usize,
    },

    /// A training label is not below the number of training identities.
    #[error("Tracklet {index} has pid {pid}, labels must be below {num_pids}")]
    PidOutOfRange {
        /// Position of the tracklet in the training split.
        index: usize,
        /// Offending identity label.
        pid: usize,
        /// Number of training identities.
        num_pids: usize,
    },

    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (split has {len} tracklets)")]
    IndexOutOfBounds {
        /// The requested index.
        idx: usize,
        /// Total length of the split.
        len: usize,
    },

    /// A prefetch worker thread stopped without delivering its batch.
    #[error("Prefetch worker for batch {batch} disconnected")]
    WorkerDisconnected {
        /// Batch index that never arrived.
        batch: usize,
    },

    /// A raw array could not be shaped into a batch.
    #[error("Batch assembly failed: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

// ---------------------------------------------------------------------------
// LossError
// ---------------------------------------------------------------------------

/// Errors produced by the metric-learning losses.
#[derive(Debug, Error)]
pub enum LossError {
    /// At least one anchor in the batch has no positive (same identity, other
    /// sample) or no negative (different identity) partner.
    #[error(
        "Degenerate triplet batch: {anchors_without_positive} anchor(s) without a positive, \
         {anchors_without_negative} anchor(s) without a negative (batch of {batch})"
    )]
    DegenerateTripletBatch {
        /// Number of anchors lacking a positive.
        anchors_without_positive: i64,
        /// Number of anchors lacking a negative.
        anchors_without_negative: i64,
        /// Batch size.
        batch: i64,
    },

    /// Embeddings and labels disagree on the batch size.
    #[error("Loss input mismatch: {inputs} rows but {labels} labels")]
    LabelCount {
        /// Rows in the input tensor.
        inputs: i64,
        /// Number of labels.
        labels: i64,
    },
}

// ---------------------------------------------------------------------------
// EvalError
// ---------------------------------------------------------------------------

/// Errors produced by retrieval evaluation.
#[derive(Debug, Error)]
pub enum EvalError {
    /// No query had a valid match in the gallery.
    #[error("None of the {num_queries} query identities appear in the gallery under another camera")]
    NoValidQueries {
        /// Number of queries that were ranked.
        num_queries: usize,
    },

    /// The gallery is empty.
    #[error("Gallery is empty")]
    EmptyGallery,

    /// Label vectors do not match the distance matrix.
    #[error("Distance matrix is {rows}x{cols} but labels cover {queries} queries and {gallery} gallery entries")]
    LabelMismatch {
        /// Distance matrix rows.
        rows: usize,
        /// Distance matrix columns.
        cols: usize,
        /// Query label count.
        queries: usize,
        /// Gallery label count.
        gallery: usize,
    },
}
