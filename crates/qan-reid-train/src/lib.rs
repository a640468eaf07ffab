//! # QAN Video Re-Identification Training
//!
//! This crate provides the training and evaluation pipeline for video-based
//! person re-identification with quality-aware pooling (QAN). A CNN embeds
//! every frame of a tracklet and scores its quality; the scores weight the
//! frame embeddings into one tracklet descriptor, and descriptors are ranked
//! by Euclidean distance for retrieval.
//!
//! ## Architecture
//!
//! ```text
//! TrainingConfig ──► Trainer ──► QualityNet (backbone + feature/classifier/quality heads)
//!       │               │              │
//!       │        IdentitySampler    pooling::pool_sequence
//!       │               │              │
//!       │        TrackletLoader    losses::QanCriterion (label-smoothed CE + batch-hard triplet)
//!       │               │
//!       │         ReidDataset (SyntheticReidDataset | custom)
//!       │
//!       └──► eval (distance matrix ─► metrics::evaluate_rankings) ──► checkpoint
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qan_reid_train::config::{BackboneKind, TrainingConfig};
//! use qan_reid_train::dataset::{SyntheticConfig, SyntheticReidDataset};
//! use qan_reid_train::trainer::Trainer;
//!
//! let config = TrainingConfig {
//!     backbone: BackboneKind::Tiny,
//!     use_gpu: false,
//!     max_epochs: 2,
//!     ..TrainingConfig::default()
//! };
//! let dataset = SyntheticReidDataset::new(SyntheticConfig::default());
//!
//! let mut trainer = Trainer::new(config, &dataset).expect("trainer builds");
//! let summary = trainer.fit().expect("training runs");
//! println!("best rank-1: {:?} at epoch {}", summary.best_rank1, summary.best_epoch);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod loader;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod pooling;
pub mod sampler;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use config::{BackboneKind, OptimizerKind, PoolingMode, TrainingConfig};
pub use dataset::{init_dataset, ReidDataset, SyntheticConfig, SyntheticReidDataset, Tracklet};
pub use error::{ConfigError, DatasetError, EvalError, LossError, TrainError, TrainResult};
pub use metrics::RankingResult;
pub use model::QualityNet;
pub use trainer::{FitSummary, Trainer};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
