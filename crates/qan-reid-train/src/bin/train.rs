//! `qan-train` binary: entry point for QAN video re-ID training and
//! evaluation.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin qan-train -- --dataset synthetic --backbone tiny --use-cpu --max-epoch 10
//! cargo run --bin qan-train -- --config run.json --resume log/checkpoint_ep200.ot
//! cargo run --bin qan-train -- --config run.json --resume log/best_model.ot --evaluate --pool avg
//! ```
//!
//! Options given on the command line override the values from `--config`.

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};

use qan_reid_train::config::TrainingConfig;
use qan_reid_train::dataset::init_dataset;
use qan_reid_train::trainer::Trainer;
use qan_reid_train::TrainResult;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "qan-train",
    version,
    about = "Train and evaluate quality-aware video person re-identification",
    long_about = None
)]
struct Args {
    /// JSON configuration file; defaults are used when absent.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    // Datasets
    /// Root directory of the dataset.
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,
    /// Registered dataset name.
    #[arg(short, long)]
    dataset: Option<String>,
    /// Batch-assembly worker threads (0 loads on the main thread).
    #[arg(short = 'j', long)]
    workers: Option<usize>,
    /// Frame height.
    #[arg(long)]
    height: Option<usize>,
    /// Frame width.
    #[arg(long)]
    width: Option<usize>,
    /// Frames sampled per tracklet.
    #[arg(long)]
    seq_len: Option<usize>,

    // Optimisation
    /// Optimiser: adam, sgd or rmsprop.
    #[arg(long)]
    optim: Option<String>,
    /// Number of training epochs.
    #[arg(long)]
    max_epoch: Option<usize>,
    /// First epoch when not resuming.
    #[arg(long)]
    start_epoch: Option<usize>,
    /// Tracklets per training batch.
    #[arg(long)]
    train_batch: Option<usize>,
    /// Tracklets per evaluation batch.
    #[arg(long)]
    test_batch: Option<usize>,
    /// Base learning rate.
    #[arg(long)]
    lr: Option<f64>,
    /// Epochs between learning-rate decays (0 disables decay).
    #[arg(long)]
    stepsize: Option<usize>,
    /// Learning-rate decay factor.
    #[arg(long)]
    gamma: Option<f64>,
    /// L2 weight decay.
    #[arg(long)]
    weight_decay: Option<f64>,
    /// Triplet margin.
    #[arg(long)]
    margin: Option<f64>,
    /// Tracklets per identity in a training batch.
    #[arg(long)]
    num_instances: Option<usize>,
    /// Train with the triplet loss only.
    #[arg(long)]
    htri_only: bool,

    // Architecture
    /// Evaluation pooling: avg, max or qan.
    #[arg(long)]
    pool: Option<String>,
    /// Backbone: tiny, resnet18, resnet34 or resnet50.
    #[arg(long)]
    backbone: Option<String>,
    /// Embedding width.
    #[arg(long)]
    embedding_dim: Option<usize>,

    // Miscellaneous
    /// Log progress every N batches.
    #[arg(long)]
    print_freq: Option<usize>,
    /// Random seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Checkpoint to resume from.
    #[arg(long, value_name = "PATH")]
    resume: Option<PathBuf>,
    /// Evaluate only, no training.
    #[arg(long)]
    evaluate: bool,
    /// Evaluate every N epochs (0 evaluates after the last epoch only).
    #[arg(long)]
    eval_step: Option<usize>,
    /// Directory for checkpoints.
    #[arg(long, value_name = "DIR")]
    save_dir: Option<PathBuf>,
    /// Run on the CPU.
    #[arg(long)]
    use_cpu: bool,
    /// CUDA device index.
    #[arg(long)]
    gpu_device: Option<usize>,
    /// Fall back to the CPU when the GPU is unavailable.
    #[arg(long)]
    cpu_fallback: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("QAN re-ID training v{}", qan_reid_train::VERSION);

    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> TrainResult<()> {
    let start = Instant::now();
    let config = build_config(args)?;
    config.validate()?;
    info!("Configuration: {:?}", config);

    let dataset = init_dataset(&config.dataset, &config.data_root)?;
    let evaluate_only = config.evaluate_only;
    let mut trainer = Trainer::new(config, dataset.as_ref())?;

    if evaluate_only {
        info!("Evaluate only");
        let result = trainer.evaluate()?;
        info!("{}", result.summary());
        return Ok(());
    }

    let summary = trainer.fit()?;
    if let Some(rank1) = summary.best_rank1 {
        info!("==> Best Rank-1 {:.1}%, achieved at epoch {}", rank1 * 100.0, summary.best_epoch);
    }
    info!(
        "Finished. Total elapsed time (h:m:s): {}. Training time (h:m:s): {}.",
        hms(start.elapsed().as_secs()),
        hms(summary.train_time.as_secs())
    );
    Ok(())
}

/// Defaults or `--config`, then every explicit command-line option.
fn build_config(args: Args) -> TrainResult<TrainingConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            TrainingConfig::from_json(path)?
        }
        None => TrainingConfig::default(),
    };

    macro_rules! set {
        ($($arg:ident => $field:ident),* $(,)?) => {
            $(if let Some(v) = args.$arg { config.$field = v; })*
        };
    }
    set! {
        root => data_root,
        dataset => dataset,
        workers => num_workers,
        height => height,
        width => width,
        seq_len => seq_len,
        max_epoch => max_epochs,
        start_epoch => start_epoch,
        train_batch => train_batch,
        test_batch => test_batch,
        lr => learning_rate,
        stepsize => stepsize,
        gamma => gamma,
        weight_decay => weight_decay,
        margin => margin,
        num_instances => num_instances,
        embedding_dim => embedding_dim,
        print_freq => print_freq,
        seed => seed,
        eval_step => eval_every,
        save_dir => save_dir,
        gpu_device => gpu_device_id,
    }

    if let Some(name) = args.optim {
        config.optimizer = name.parse()?;
    }
    if let Some(name) = args.pool {
        config.pooling = name.parse()?;
    }
    if let Some(name) = args.backbone {
        config.backbone = name.parse()?;
    }
    if args.resume.is_some() {
        config.resume = args.resume;
    }
    config.htri_only |= args.htri_only;
    config.evaluate_only |= args.evaluate;
    config.cpu_fallback |= args.cpu_fallback;
    if args.use_cpu {
        config.use_gpu = false;
    }
    Ok(config)
}

fn hms(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
