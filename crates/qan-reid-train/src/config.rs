//! Training configuration for QAN video re-identification.
//!
//! [`TrainingConfig`] is the single source of truth for every hyper-parameter,
//! input shape, evaluation setting and infrastructure knob used by the
//! pipeline. It is serializable via [`serde`] so it can be stored next to a
//! run and restored from JSON.
//!
//! # Example
//!
//! ```rust
//! use qan_reid_train::config::{PoolingMode, TrainingConfig};
//!
//! let cfg = TrainingConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.seq_len, 15);
//! assert_eq!(cfg.pooling, PoolingMode::QualityWeighted);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Closed choices
// ---------------------------------------------------------------------------

/// Optimiser used for both parameter groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam with L2 weight decay.
    Adam,
    /// SGD with momentum 0.9.
    Sgd,
    /// RMSprop with momentum 0.9.
    #[serde(rename = "rmsprop")]
    RmsProp,
}

impl OptimizerKind {
    /// Names accepted by [`FromStr`].
    pub const NAMES: [&'static str; 3] = ["adam", "sgd", "rmsprop"];
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            other => Err(ConfigError::unsupported("optimizer", other, &Self::NAMES)),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::RmsProp => "rmsprop",
        };
        f.write_str(name)
    }
}

/// How per-frame features are aggregated into one descriptor per tracklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolingMode {
    /// Unweighted mean over the sequence axis.
    #[serde(rename = "avg")]
    Avg,
    /// Elementwise maximum over the sequence axis.
    #[serde(rename = "max")]
    Max,
    /// Softmax-normalised quality scores weight each frame.
    #[serde(rename = "qan")]
    QualityWeighted,
}

impl PoolingMode {
    /// Names accepted by [`FromStr`].
    pub const NAMES: [&'static str; 3] = ["avg", "max", "qan"];
}

impl FromStr for PoolingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avg" => Ok(PoolingMode::Avg),
            "max" => Ok(PoolingMode::Max),
            "qan" => Ok(PoolingMode::QualityWeighted),
            other => Err(ConfigError::unsupported("pooling mode", other, &Self::NAMES)),
        }
    }
}

impl fmt::Display for PoolingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolingMode::Avg => "avg",
            PoolingMode::Max => "max",
            PoolingMode::QualityWeighted => "qan",
        };
        f.write_str(name)
    }
}

/// Frame feature extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    /// Two conv/BN/ReLU stages with global average pooling; 64 features.
    Tiny,
    /// ResNet-18 without the final layer; 512 features.
    Resnet18,
    /// ResNet-34 without the final layer; 512 features.
    Resnet34,
    /// ResNet-50 without the final layer; 2048 features.
    Resnet50,
}

impl BackboneKind {
    /// Names accepted by [`FromStr`].
    pub const NAMES: [&'static str; 4] = ["tiny", "resnet18", "resnet34", "resnet50"];

    /// Width of the feature vector produced for every frame.
    pub fn feature_dim(self) -> i64 {
        match self {
            BackboneKind::Tiny => 64,
            BackboneKind::Resnet18 | BackboneKind::Resnet34 => 512,
            BackboneKind::Resnet50 => 2048,
        }
    }
}

impl FromStr for BackboneKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tiny" => Ok(BackboneKind::Tiny),
            "resnet18" => Ok(BackboneKind::Resnet18),
            "resnet34" => Ok(BackboneKind::Resnet34),
            "resnet50" => Ok(BackboneKind::Resnet50),
            other => Err(ConfigError::unsupported("backbone", other, &Self::NAMES)),
        }
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackboneKind::Tiny => "tiny",
            BackboneKind::Resnet18 => "resnet18",
            BackboneKind::Resnet34 => "resnet34",
            BackboneKind::Resnet50 => "resnet50",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a QAN training or evaluation run.
///
/// Defaults reproduce the reference experimental setup except for the
/// dataset, which defaults to the built-in `synthetic` set. Use
/// [`TrainingConfig::default()`] as a starting point and override individual
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------
    /// Registered dataset name, see [`crate::dataset::dataset_names`].
    /// Default: **`synthetic`**.
    pub dataset: String,

    /// Root directory that dataset loaders resolve frame paths against.
    pub data_root: PathBuf,

    /// Frame height after resizing. Default: **256**.
    pub height: usize,

    /// Frame width after resizing. Default: **128**.
    pub width: usize,

    /// Frames sampled from every tracklet (S). Default: **15**.
    pub seq_len: usize,

    /// Tracklets per training batch (B). Default: **16**.
    pub train_batch: usize,

    /// Tracklets per evaluation batch. Default: **4**.
    pub test_batch: usize,

    /// Tracklets drawn per identity by the identity sampler (K). Default: **4**.
    pub num_instances: usize,

    /// Prefetch worker threads. `0` loads batches on the calling thread.
    /// Default: **4**.
    pub num_workers: usize,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Frame feature extractor. Default: **resnet50**.
    pub backbone: BackboneKind,

    /// Width of the embedding shared by pooling and the classifier (D).
    /// Default: **128**.
    pub embedding_dim: usize,

    /// Named-tensor file (`.ot`) with pretrained backbone weights.
    pub pretrained_backbone: Option<PathBuf>,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Default: **adam**.
    pub optimizer: OptimizerKind,

    /// Base learning rate. Default: **3e-4**.
    pub learning_rate: f64,

    /// L2 weight-decay coefficient. Default: **5e-4**.
    pub weight_decay: f64,

    /// Epochs between step decays; `0` disables decay. Default: **200**.
    pub stepsize: usize,

    /// Multiplicative decay applied every `stepsize` epochs. Default: **0.1**.
    pub gamma: f64,

    /// Learning-rate multiplier for the backbone group. Default: **1.0**.
    pub backbone_lr_mult: f64,

    /// Learning-rate multiplier for the embedding, quality and classifier
    /// heads. Default: **10.0**.
    pub head_lr_mult: f64,

    /// Triplet margin. Default: **0.3**.
    pub margin: f64,

    /// Label-smoothing ε for the cross-entropy terms. Default: **0.1**.
    pub label_smoothing: f64,

    /// Train with triplet terms only. Default: **false**.
    pub htri_only: bool,

    /// Epoch at which training stops (exclusive). Default: **500**.
    pub max_epochs: usize,

    /// Epoch to start from when not resuming. Default: **0**.
    pub start_epoch: usize,

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------
    /// Pooling used at evaluation time. Training always pools with quality
    /// weights. Default: **qan**.
    pub pooling: PoolingMode,

    /// Evaluate every N epochs; `0` evaluates only after the final epoch.
    /// Default: **50**.
    pub eval_every: usize,

    /// CMC ranks reported in logs. Default: **[1, 5, 10, 20]**.
    pub ranks: Vec<usize>,

    /// Length of the CMC curve. Default: **50**.
    pub max_rank: usize,

    /// Log training progress every N batches. Default: **1**.
    pub print_freq: usize,

    // -----------------------------------------------------------------------
    // Checkpointing
    // -----------------------------------------------------------------------
    /// Directory that receives checkpoints and `best_model.*`.
    pub save_dir: PathBuf,

    /// Checkpoint weights (`.ot`) to resume from.
    pub resume: Option<PathBuf>,

    /// Skip training and evaluate once. Default: **false**.
    pub evaluate_only: bool,

    // -----------------------------------------------------------------------
    // Device
    // -----------------------------------------------------------------------
    /// Use a CUDA device when available. Default: **true**.
    pub use_gpu: bool,

    /// CUDA device index. Default: **0**.
    pub gpu_device_id: usize,

    /// Fall back to CPU when the requested GPU is missing. Default: **false**.
    pub cpu_fallback: bool,

    // -----------------------------------------------------------------------
    // Reproducibility
    // -----------------------------------------------------------------------
    /// Seed for `tch::manual_seed` and the samplers. Default: **1**.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            // Data
            dataset: "synthetic".to_string(),
            data_root: PathBuf::from("data"),
            height: 256,
            width: 128,
            seq_len: 15,
            train_batch: 16,
            test_batch: 4,
            num_instances: 4,
            num_workers: 4,
            // Model
            backbone: BackboneKind::Resnet50,
            embedding_dim: 128,
            pretrained_backbone: None,
            // Optimisation
            optimizer: OptimizerKind::Adam,
            learning_rate: 3e-4,
            weight_decay: 5e-4,
            stepsize: 200,
            gamma: 0.1,
            backbone_lr_mult: 1.0,
            head_lr_mult: 10.0,
            margin: 0.3,
            label_smoothing: 0.1,
            htri_only: false,
            max_epochs: 500,
            start_epoch: 0,
            // Evaluation
            pooling: PoolingMode::QualityWeighted,
            eval_every: 50,
            ranks: vec![1, 5, 10, 20],
            max_rank: 50,
            print_freq: 1,
            // Checkpointing
            save_dir: PathBuf::from("log"),
            resume: None,
            evaluate_only: false,
            // Device
            use_gpu: true,
            gpu_device_id: 0,
            cpu_fallback: false,
            // Reproducibility
            seed: 1,
        }
    }
}

impl TrainingConfig {
    /// Load a [`TrainingConfig`] from a JSON file at `path`.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed and the
    /// validation error if the loaded values are incoherent.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainingConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the directory cannot be created or
    /// the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Number of identities drawn per training batch (P = B / K).
    pub fn identities_per_batch(&self) -> usize {
        self.train_batch / self.num_instances.max(1)
    }

    /// Base learning rate at `epoch` under the step-decay schedule.
    pub fn lr_at_epoch(&self, epoch: usize) -> f64 {
        if self.stepsize == 0 {
            return self.learning_rate;
        }
        let decays = (epoch / self.stepsize) as i32;
        self.learning_rate * self.gamma.powi(decays)
    }

    /// Whether an evaluation pass is due once `epoch` (0-based) completes.
    pub fn is_eval_epoch(&self, epoch: usize) -> bool {
        let completed = epoch + 1;
        (self.eval_every > 0 && completed % self.eval_every == 0) || completed == self.max_epochs
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - Frame size, sequence length, batch sizes and `embedding_dim` are
    ///   non-zero.
    /// - `num_instances >= 2` and divides `train_batch`, with at least two
    ///   identities per batch.
    /// - `learning_rate > 0`, `weight_decay >= 0`, `gamma` in `(0, 1]`.
    /// - `margin >= 0`, `label_smoothing` in `[0, 1)`.
    /// - Both learning-rate multipliers are strictly positive.
    /// - `max_epochs > 0` and `start_epoch <= max_epochs`.
    /// - Every reported rank is within `[1, max_rank]`.
    /// - `print_freq >= 1`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::invalid_value("dataset", "must not be empty"));
        }

        // Frame geometry
        if self.height == 0 {
            return Err(ConfigError::invalid_value("height", "must be > 0"));
        }
        if self.width == 0 {
            return Err(ConfigError::invalid_value("width", "must be > 0"));
        }
        if self.seq_len == 0 {
            return Err(ConfigError::invalid_value("seq_len", "must be > 0"));
        }

        // Batching
        if self.train_batch == 0 {
            return Err(ConfigError::invalid_value("train_batch", "must be > 0"));
        }
        if self.test_batch == 0 {
            return Err(ConfigError::invalid_value("test_batch", "must be > 0"));
        }
        if self.num_instances < 2 {
            return Err(ConfigError::invalid_value(
                "num_instances",
                "must be >= 2 so every anchor has a positive",
            ));
        }
        if self.train_batch % self.num_instances != 0 {
            return Err(ConfigError::invalid_value(
                "train_batch",
                format!("must be a multiple of num_instances ({})", self.num_instances),
            ));
        }
        if self.identities_per_batch() < 2 {
            return Err(ConfigError::invalid_value(
                "train_batch",
                "must hold at least 2 identities so every anchor has a negative",
            ));
        }

        // Model
        if self.embedding_dim == 0 {
            return Err(ConfigError::invalid_value("embedding_dim", "must be > 0"));
        }

        // Optimisation
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::invalid_value("learning_rate", "must be > 0.0"));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::invalid_value("weight_decay", "must be >= 0.0"));
        }
        if self.gamma <= 0.0 || self.gamma > 1.0 {
            return Err(ConfigError::invalid_value("gamma", "must be in (0.0, 1.0]"));
        }
        if self.backbone_lr_mult <= 0.0 {
            return Err(ConfigError::invalid_value("backbone_lr_mult", "must be > 0.0"));
        }
        if self.head_lr_mult <= 0.0 {
            return Err(ConfigError::invalid_value("head_lr_mult", "must be > 0.0"));
        }
        if self.margin < 0.0 {
            return Err(ConfigError::invalid_value("margin", "must be >= 0.0"));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(ConfigError::invalid_value(
                "label_smoothing",
                "must be in [0.0, 1.0)",
            ));
        }

        // Epochs
        if self.max_epochs == 0 {
            return Err(ConfigError::invalid_value("max_epochs", "must be > 0"));
        }
        if self.start_epoch > self.max_epochs {
            return Err(ConfigError::invalid_value(
                "start_epoch",
                "must be <= max_epochs",
            ));
        }

        // Evaluation
        if self.max_rank == 0 {
            return Err(ConfigError::invalid_value("max_rank", "must be > 0"));
        }
        for &r in &self.ranks {
            if r == 0 || r > self.max_rank {
                return Err(ConfigError::invalid_value(
                    "ranks",
                    format!("each rank must be in [1, {}]", self.max_rank),
                ));
            }
        }
        if self.print_freq == 0 {
            return Err(ConfigError::invalid_value("print_freq", "must be > 0"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
