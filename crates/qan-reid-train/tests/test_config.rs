//! Integration tests for [`qan_reid_train::config`].
//!
//! All tests are deterministic: they use only fixed values and the
//! `TrainingConfig::default()` constructor.

use qan_reid_train::config::{BackboneKind, OptimizerKind, PoolingMode, TrainingConfig};
use qan_reid_train::ConfigError;
use tempfile::tempdir;

// ---------------------------------------------------------------------------
// Default config invariants
// ---------------------------------------------------------------------------

/// The default configuration must pass its own validation.
#[test]
fn default_config_is_valid() {
    let cfg = TrainingConfig::default();
    cfg.validate()
        .expect("default TrainingConfig must be valid");
}

/// Default sizes follow the usual video re-ID setup: 256×128 frames,
/// 15-frame sequences, 4 identities × 4 tracklets per batch.
#[test]
fn default_shapes() {
    let cfg = TrainingConfig::default();
    assert_eq!((cfg.height, cfg.width), (256, 128));
    assert_eq!(cfg.seq_len, 15);
    assert_eq!(cfg.train_batch, 16);
    assert_eq!(cfg.num_instances, 4);
    assert_eq!(cfg.identities_per_batch(), 4);
    assert_eq!(cfg.ranks, vec![1, 5, 10, 20]);
}

/// Training defaults: Adam, lr 3e-4, decay ×0.1 every 200 epochs.
#[test]
fn default_optimisation() {
    let cfg = TrainingConfig::default();
    assert_eq!(cfg.optimizer, OptimizerKind::Adam);
    assert_eq!(cfg.backbone, BackboneKind::Resnet50);
    assert_eq!(cfg.pooling, PoolingMode::QualityWeighted);
    assert!((cfg.learning_rate - 3e-4).abs() < 1e-12);
    assert_eq!(cfg.stepsize, 200);
    assert_eq!(cfg.max_epochs, 500);
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// The learning rate decays by `gamma` at every multiple of `stepsize`.
#[test]
fn step_schedule_boundaries() {
    let cfg = TrainingConfig { learning_rate: 1.0, stepsize: 10, gamma: 0.5, ..TrainingConfig::default() };
    assert_eq!(cfg.lr_at_epoch(0), 1.0);
    assert_eq!(cfg.lr_at_epoch(9), 1.0);
    assert_eq!(cfg.lr_at_epoch(10), 0.5);
    assert_eq!(cfg.lr_at_epoch(25), 0.25);
}

/// `stepsize == 0` keeps the base rate for every epoch.
#[test]
fn zero_stepsize_disables_decay() {
    let cfg = TrainingConfig { stepsize: 0, ..TrainingConfig::default() };
    assert_eq!(cfg.lr_at_epoch(10_000), cfg.learning_rate);
}

/// Evaluation runs every `eval_every` completed epochs and always after the
/// last one.
#[test]
fn eval_epochs() {
    let cfg = TrainingConfig { eval_every: 3, max_epochs: 7, ..TrainingConfig::default() };
    let evals: Vec<usize> = (0..7).filter(|&e| cfg.is_eval_epoch(e)).collect();
    assert_eq!(evals, vec![2, 5, 6]);

    let final_only = TrainingConfig { eval_every: 0, max_epochs: 4, ..TrainingConfig::default() };
    let evals: Vec<usize> = (0..4).filter(|&e| final_only.is_eval_epoch(e)).collect();
    assert_eq!(evals, vec![3]);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid_field(cfg: TrainingConfig) -> &'static str {
    match cfg.validate() {
        Err(ConfigError::InvalidValue { field, .. }) => field,
        other => panic!("expected InvalidValue, got {other:?}"),
    }
}

/// A batch that is not a multiple of `num_instances` is rejected.
#[test]
fn train_batch_must_divide() {
    let cfg = TrainingConfig { train_batch: 10, num_instances: 4, ..TrainingConfig::default() };
    assert_eq!(invalid_field(cfg), "train_batch");
}

/// A batch of a single identity leaves anchors without negatives.
#[test]
fn single_identity_batch_rejected() {
    let cfg = TrainingConfig { train_batch: 4, num_instances: 4, ..TrainingConfig::default() };
    assert_eq!(invalid_field(cfg), "train_batch");
}

/// One tracklet per identity leaves anchors without positives.
#[test]
fn single_instance_rejected() {
    let cfg = TrainingConfig { train_batch: 8, num_instances: 1, ..TrainingConfig::default() };
    assert_eq!(invalid_field(cfg), "num_instances");
}

/// Each range rule names the offending field.
#[test]
fn range_rules() {
    let base = TrainingConfig::default;
    assert_eq!(invalid_field(TrainingConfig { seq_len: 0, ..base() }), "seq_len");
    assert_eq!(invalid_field(TrainingConfig { learning_rate: 0.0, ..base() }), "learning_rate");
    assert_eq!(invalid_field(TrainingConfig { weight_decay: -1.0, ..base() }), "weight_decay");
    assert_eq!(invalid_field(TrainingConfig { gamma: 1.5, ..base() }), "gamma");
    assert_eq!(invalid_field(TrainingConfig { margin: -0.1, ..base() }), "margin");
    assert_eq!(invalid_field(TrainingConfig { label_smoothing: 1.0, ..base() }), "label_smoothing");
    assert_eq!(invalid_field(TrainingConfig { head_lr_mult: 0.0, ..base() }), "head_lr_mult");
    assert_eq!(invalid_field(TrainingConfig { start_epoch: 600, ..base() }), "start_epoch");
    assert_eq!(invalid_field(TrainingConfig { ranks: vec![1, 60], ..base() }), "ranks");
    assert_eq!(invalid_field(TrainingConfig { print_freq: 0, ..base() }), "print_freq");
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Choice names parse case-insensitively.
#[test]
fn names_parse() {
    assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
    assert_eq!("rmsprop".parse::<OptimizerKind>().unwrap(), OptimizerKind::RmsProp);
    assert_eq!("qan".parse::<PoolingMode>().unwrap(), PoolingMode::QualityWeighted);
    assert_eq!("Max".parse::<PoolingMode>().unwrap(), PoolingMode::Max);
    assert_eq!("tiny".parse::<BackboneKind>().unwrap(), BackboneKind::Tiny);
}

/// Unknown names report the supported set.
#[test]
fn unknown_names_rejected() {
    match "adagrad".parse::<OptimizerKind>() {
        Err(ConfigError::Unsupported { field, value, supported }) => {
            assert_eq!(field, "optimizer");
            assert_eq!(value, "adagrad");
            assert!(supported.contains("rmsprop"), "{supported}");
        }
        other => panic!("expected Unsupported, got {other:?}"),
    }
    assert!("median".parse::<PoolingMode>().is_err());
    assert!("vgg16".parse::<BackboneKind>().is_err());
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

/// A saved configuration loads back with the same values.
#[test]
fn json_file_round_trip() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("nested").join("run.json");
    let cfg = TrainingConfig {
        pooling: PoolingMode::Avg,
        optimizer: OptimizerKind::Sgd,
        seq_len: 6,
        ..TrainingConfig::default()
    };
    cfg.to_json(&path).expect("write config");

    let loaded = TrainingConfig::from_json(&path).expect("read config");
    assert_eq!(loaded.pooling, PoolingMode::Avg);
    assert_eq!(loaded.optimizer, OptimizerKind::Sgd);
    assert_eq!(loaded.seq_len, 6);
}

/// Fields missing from the file take their defaults; serialized names are
/// the short CLI names.
#[test]
fn partial_json_uses_defaults() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("partial.json");
    std::fs::write(&path, r#"{ "pooling": "max", "optimizer": "rmsprop", "max_epochs": 3 }"#)
        .expect("write");
    let cfg = TrainingConfig::from_json(&path).expect("partial config loads");
    assert_eq!(cfg.pooling, PoolingMode::Max);
    assert_eq!(cfg.optimizer, OptimizerKind::RmsProp);
    assert_eq!(cfg.max_epochs, 3);
    assert_eq!(cfg.seq_len, 15);
}

/// Missing and malformed files are distinguished.
#[test]
fn bad_files() {
    let tmp = tempdir().expect("tempdir");
    let missing = tmp.path().join("absent.json");
    assert!(matches!(TrainingConfig::from_json(&missing), Err(ConfigError::FileRead { .. })));

    let broken = tmp.path().join("broken.json");
    std::fs::write(&broken, "{ not json").expect("write");
    assert!(matches!(TrainingConfig::from_json(&broken), Err(ConfigError::ParseError { .. })));
}
