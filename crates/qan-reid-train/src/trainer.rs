//! Training loop orchestrator.
//!
//! [`Trainer`] owns the model, optimiser and identity sampler of one run and
//! moves through these states:
//!
//! ```text
//! Initializing ─► TrainingEpoch ─┬─► TrainingEpoch ─► …
//!                     ▲          └─► Evaluating ─► Checkpointing ─┐
//!                     └───────────────────────────────────────────┘
//!                                  … after max_epochs ─► Terminal
//! ```
//!
//! Per batch:
//!
//! ```text
//! frames [B·S,3,H,W] ─► forward_frame ─► logits, embeddings, quality
//!     L_img = CE(logits, frame pids) + Triplet(embeddings, frame pids)
//! embeddings, quality ─► quality-weighted pooling ─► descriptors [B, D]
//! descriptors ─► forward_descriptor ─► sequence logits
//!     L_seq = CE(seq logits, pids) + Triplet(descriptors, pids)
//! zero_grad ─► (L_img + L_seq).backward() ─► step
//! ```
//!
//! Training always pools with quality weights; the configured pooling mode
//! only applies to evaluation.

use std::time::{Duration, Instant};
use tch::{nn, nn::OptimizerConfig, Device};
use tracing::{info, warn};

use crate::checkpoint::{load_checkpoint, read_meta, save_checkpoint, CheckpointMeta};
use crate::config::{OptimizerKind, PoolingMode, TrainingConfig};
use crate::dataset::{log_summary, ReidDataset};
use crate::error::{DatasetError, TrainError, TrainResult};
use crate::eval;
use crate::loader::{Batch, TrackletLoader};
use crate::losses::QanCriterion;
use crate::metrics::{AverageMeter, RankingResult};
use crate::model::{QualityNet, BACKBONE_GROUP, HEAD_GROUP};
use crate::pooling::{pool_sequence, unflatten_frames};
use crate::sampler::{FrameSampling, IdentitySampler};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`Trainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Building the model, optimiser and sampler.
    Initializing,
    /// Iterating training batches.
    TrainingEpoch,
    /// Running retrieval evaluation.
    Evaluating,
    /// Writing a checkpoint.
    Checkpointing,
    /// `fit` has finished.
    Terminal,
}

/// Scalar losses of one optimisation step.
#[derive(Debug, Clone, Copy)]
pub struct StepLosses {
    /// Frame-level total.
    pub img: f64,
    /// Sequence-level total.
    pub seq: f64,
    /// Frame-level cross-entropy (absent with `htri_only`).
    pub xent_img: Option<f64>,
    /// Frame-level triplet.
    pub htri_img: f64,
    /// Sequence-level cross-entropy (absent with `htri_only`).
    pub xent_seq: Option<f64>,
    /// Sequence-level triplet.
    pub htri_seq: f64,
}

impl StepLosses {
    /// `img + seq`.
    pub fn total(&self) -> f64 {
        self.img + self.seq
    }
}

/// Averages over one training epoch.
#[derive(Debug, Clone)]
pub struct EpochStats {
    /// 0-based epoch index.
    pub epoch: usize,
    /// Optimisation steps taken.
    pub batches: usize,
    /// Mean frame-level loss.
    pub img_loss: f64,
    /// Mean sequence-level loss.
    pub seq_loss: f64,
    /// Wall-clock time of the epoch.
    pub duration: Duration,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct FitSummary {
    /// Best rank-1 over all evaluations of the run, `None` if none ran.
    pub best_rank1: Option<f32>,
    /// Completed-epoch count at which `best_rank1` was reached.
    pub best_epoch: usize,
    /// Completed epochs at the end of the run.
    pub epochs_completed: usize,
    /// Time spent in training epochs.
    pub train_time: Duration,
    /// Total wall-clock time of `fit`.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Pick the compute device requested by `config`.
///
/// # Errors
///
/// Returns [`TrainError::DeviceUnavailable`] when a GPU is requested but
/// missing and `cpu_fallback` is off.
pub fn resolve_device(config: &TrainingConfig) -> TrainResult<Device> {
    if !config.use_gpu {
        return Ok(Device::Cpu);
    }
    let id = config.gpu_device_id;
    if tch::Cuda::is_available() && id < tch::Cuda::device_count() as usize {
        return Ok(Device::Cuda(id));
    }
    if config.cpu_fallback {
        warn!(gpu = id, "CUDA device unavailable, falling back to CPU");
        return Ok(Device::Cpu);
    }
    Err(TrainError::DeviceUnavailable { requested: format!("cuda:{id}") })
}

fn build_optimizer(config: &TrainingConfig, vs: &nn::VarStore) -> TrainResult<nn::Optimizer> {
    let (lr, wd) = (config.learning_rate, config.weight_decay);
    let opt = match config.optimizer {
        OptimizerKind::Adam => nn::Adam { wd, ..Default::default() }.build(vs, lr)?,
        OptimizerKind::Sgd => nn::Sgd { momentum: 0.9, wd, ..Default::default() }.build(vs, lr)?,
        OptimizerKind::RmsProp => nn::RmsProp { momentum: 0.9, wd, ..Default::default() }.build(vs, lr)?,
    };
    Ok(opt)
}

/// Check the training split and build its identity-balanced sampler.
///
/// # Errors
///
/// [`TrainError::EmptyDataset`] for an empty split,
/// [`DatasetError::PidOutOfRange`] when a label is not below
/// `num_train_pids`, and [`DatasetError::NotEnoughIdentities`] when a single
/// batch cannot be formed.
fn training_sampler(dataset: &dyn ReidDataset, config: &TrainingConfig) -> TrainResult<IdentitySampler> {
    let train = dataset.train();
    if train.is_empty() {
        return Err(TrainError::EmptyDataset { split: "train" });
    }
    let num_pids = dataset.num_train_pids();
    if let Some((index, t)) = train.iter().enumerate().find(|(_, t)| t.pid >= num_pids) {
        return Err(DatasetError::PidOutOfRange { index, pid: t.pid, num_pids }.into());
    }
    Ok(IdentitySampler::new(train, config.train_batch, config.num_instances, config.seed)?)
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Drives training and evaluation of a [`QualityNet`] on one dataset.
pub struct Trainer<'a> {
    config: TrainingConfig,
    dataset: &'a dyn ReidDataset,
    model: QualityNet,
    optimizer: nn::Optimizer,
    criterion: QanCriterion,
    /// Built on the first training epoch when evaluating only.
    sampler: Option<IdentitySampler>,
    device: Device,
    epoch: usize,
    best_rank1: Option<f32>,
    best_epoch: usize,
    state: TrainerState,
}

impl<'a> Trainer<'a> {
    /// Validate `config`, build the model and optimiser, and restore
    /// `config.resume` when set.
    ///
    /// # Errors
    ///
    /// Returns configuration, device, dataset and checkpoint errors; all of
    /// them are reported before any training step.
    pub fn new(config: TrainingConfig, dataset: &'a dyn ReidDataset) -> TrainResult<Self> {
        config.validate()?;
        let device = resolve_device(&config)?;
        tch::manual_seed(config.seed as i64);
        log_summary(dataset);
        let sampler = if config.evaluate_only {
            None
        } else {
            Some(training_sampler(dataset, &config)?)
        };

        // Evaluation never reads the classifier, so its width only has to
        // match the checkpoint being restored.
        let num_classes = match (&config.resume, config.evaluate_only) {
            (Some(path), true) => read_meta(path)?.num_classes.max(1) as usize,
            (None, true) => dataset.num_train_pids().max(1),
            (_, false) => dataset.num_train_pids(),
        };
        let mut model = QualityNet::new(&config, num_classes, device)?;
        let optimizer = build_optimizer(&config, model.var_store())?;

        let mut epoch = config.start_epoch;
        let mut best_rank1 = None;
        let mut best_epoch = 0;
        if let Some(path) = &config.resume {
            info!(path = %path.display(), "Loading checkpoint");
            let meta = load_checkpoint(&mut model, path)?;
            epoch = meta.epoch;
            if meta.best_rank1.is_finite() {
                best_rank1 = Some(meta.best_rank1);
                best_epoch = meta.best_epoch;
            }
        }

        info!(
            device = ?device,
            optimizer = %config.optimizer,
            start_epoch = epoch,
            max_epochs = config.max_epochs,
            batches_per_epoch = sampler.as_ref().map_or(0, IdentitySampler::num_batches),
            "Trainer ready"
        );
        Ok(Trainer {
            criterion: QanCriterion::from_config(&config),
            config,
            dataset,
            model,
            optimizer,
            sampler,
            device,
            epoch,
            best_rank1,
            best_epoch,
            state: TrainerState::Initializing,
        })
    }

    /// Set both group learning rates for `epoch` under the step schedule.
    fn apply_lr(&mut self, epoch: usize) -> f64 {
        let base = self.config.lr_at_epoch(epoch);
        self.optimizer.set_lr_group(BACKBONE_GROUP, base * self.config.backbone_lr_mult);
        self.optimizer.set_lr_group(HEAD_GROUP, base * self.config.head_lr_mult);
        base
    }

    /// One forward/backward/update step on `batch`.
    ///
    /// # Errors
    ///
    /// Returns loss and shape errors, and [`TrainError::TrainingStep`] for a
    /// non-finite loss (no update is applied then).
    pub fn train_step(&mut self, batch: &Batch) -> TrainResult<StepLosses> {
        let (b, s) = (batch.len() as i64, batch.seq_len() as i64);
        let frames = batch.frames_tensor(self.device);
        let frame_pids = batch.frame_pids_tensor(self.device);
        let pids = batch.pids_tensor(self.device);

        let out = self.model.forward_frame(&frames, true)?;
        let img = self.criterion.terms(&out.logits, &out.embedding, &frame_pids)?;

        let (features, scores) = unflatten_frames(&out.embedding, &out.quality, b, s)?;
        let pooled = pool_sequence(PoolingMode::QualityWeighted, &features, &scores)?;
        let seq_logits = self.model.forward_descriptor(&pooled)?;
        let seq = self.criterion.terms(&seq_logits, &pooled, &pids)?;

        let total = &img.total + &seq.total;
        let value = total.double_value(&[]);
        if !value.is_finite() {
            return Err(TrainError::training_step(format!(
                "non-finite loss {value} at epoch {}",
                self.epoch + 1
            )));
        }
        self.optimizer.zero_grad();
        total.backward();
        self.optimizer.step();

        Ok(StepLosses {
            img: img.value(),
            seq: seq.value(),
            xent_img: img.xent,
            htri_img: img.htri,
            xent_seq: seq.xent,
            htri_seq: seq.htri,
        })
    }

    /// Run one epoch over the identity-balanced plan for `epoch`.
    ///
    /// # Errors
    ///
    /// Stops at the first loading or step error.
    pub fn train_epoch(&mut self, epoch: usize) -> TrainResult<EpochStats> {
        self.state = TrainerState::TrainingEpoch;
        let lr = self.apply_lr(epoch);
        let plan = match &self.sampler {
            Some(sampler) => sampler.epoch_plan(epoch),
            None => {
                let sampler = training_sampler(self.dataset, &self.config)?;
                let plan = sampler.epoch_plan(epoch);
                self.sampler = Some(sampler);
                plan
            }
        };
        let total_batches = plan.len();
        let dataset = self.dataset;
        let loader = TrackletLoader::new(
            dataset,
            dataset.train(),
            FrameSampling::Random,
            self.config.seq_len,
            (self.config.height, self.config.width),
            self.config.num_workers,
            self.config.seed,
        );
        info!(epoch = epoch + 1, lr, batches = total_batches, "Epoch started");

        let started = Instant::now();
        let (mut batch_time, mut data_time) = (AverageMeter::new(), AverageMeter::new());
        let (mut img, mut seq) = (AverageMeter::new(), AverageMeter::new());
        let (mut xent_img, mut htri_img) = (AverageMeter::new(), AverageMeter::new());
        let (mut xent_seq, mut htri_seq) = (AverageMeter::new(), AverageMeter::new());
        let mut end = Instant::now();
        let max_epochs = self.config.max_epochs;
        let print_freq = self.config.print_freq;

        loader.for_each_batch(&plan, epoch, |i, batch, waited| {
            data_time.update(waited.as_secs_f64(), 1);
            let (n_seq, n_img) = (batch.len(), batch.len() * batch.seq_len());
            let losses = self.train_step(&batch)?;

            img.update(losses.img, n_img);
            seq.update(losses.seq, n_seq);
            htri_img.update(losses.htri_img, n_img);
            htri_seq.update(losses.htri_seq, n_seq);
            if let (Some(xi), Some(xs)) = (losses.xent_img, losses.xent_seq) {
                xent_img.update(xi, n_img);
                xent_seq.update(xs, n_seq);
            }
            batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            if (i + 1) % print_freq == 0 {
                let head = format!(
                    "Epoch: [{}/{}][{}/{}]  Time {:.3} ({:.3})  Data {:.3} ({:.3})",
                    epoch + 1,
                    max_epochs,
                    i + 1,
                    total_batches,
                    batch_time.val,
                    batch_time.avg,
                    data_time.val,
                    data_time.avg
                );
                if xent_img.count == 0 {
                    info!(
                        "{head}  ImgLoss {:.6} ({:.6})  SeqLoss {:.6} ({:.6})",
                        img.val, img.avg, seq.val, seq.avg
                    );
                } else {
                    info!(
                        "{head}  ImgLoss {:.6} ({:.6})  ImgXent {:.6} ({:.6})  ImgHtri {:.6} ({:.6})  \
                         SeqLoss {:.6} ({:.6})  SeqXent {:.6} ({:.6})  SeqHtri {:.6} ({:.6})",
                        img.val, img.avg, xent_img.val, xent_img.avg, htri_img.val, htri_img.avg,
                        seq.val, seq.avg, xent_seq.val, xent_seq.avg, htri_seq.val, htri_seq.avg
                    );
                }
            }
            Ok(())
        })?;

        Ok(EpochStats {
            epoch,
            batches: total_batches,
            img_loss: img.avg,
            seq_loss: seq.avg,
            duration: started.elapsed(),
        })
    }

    /// Evaluate the current parameters on the query/gallery splits.
    ///
    /// # Errors
    ///
    /// Propagates extraction and ranking errors.
    pub fn evaluate(&mut self) -> TrainResult<RankingResult> {
        self.state = TrainerState::Evaluating;
        eval::evaluate(&self.model, self.dataset, &self.config, self.device)
    }

    /// Train from the current epoch to `max_epochs`, evaluating and
    /// checkpointing on evaluation epochs.
    ///
    /// # Errors
    ///
    /// Stops at the first error of any stage.
    pub fn fit(&mut self) -> TrainResult<FitSummary> {
        let start = Instant::now();
        let mut train_time = Duration::ZERO;
        info!(from = self.epoch, to = self.config.max_epochs, "Start training");

        for epoch in self.epoch..self.config.max_epochs {
            let stats = self.train_epoch(epoch)?;
            train_time += stats.duration;
            self.epoch = epoch + 1;
            info!(
                epoch = self.epoch,
                img_loss = stats.img_loss,
                seq_loss = stats.seq_loss,
                secs = stats.duration.as_secs_f64(),
                "Epoch finished"
            );

            if self.config.is_eval_epoch(epoch) {
                let rank1 = self.evaluate()?.rank1();
                let is_best = self.best_rank1.map_or(true, |best| rank1 > best);
                if is_best {
                    self.best_rank1 = Some(rank1);
                    self.best_epoch = self.epoch;
                }
                self.state = TrainerState::Checkpointing;
                let meta = CheckpointMeta {
                    epoch: self.epoch,
                    rank1,
                    best_rank1: self.best_rank1.unwrap_or(rank1),
                    best_epoch: self.best_epoch,
                    num_classes: self.model.num_classes(),
                    embedding_dim: self.model.embedding_dim(),
                    backbone: self.model.backbone_kind(),
                };
                save_checkpoint(&self.model, &meta, &self.config.save_dir, is_best)?;
            }
        }

        self.state = TrainerState::Terminal;
        match self.best_rank1 {
            Some(r) => info!("Best Rank-1 {:.1}%, achieved at epoch {}", r * 100.0, self.best_epoch),
            None => info!("No evaluation was run"),
        }
        Ok(FitSummary {
            best_rank1: self.best_rank1,
            best_epoch: self.best_epoch,
            epochs_completed: self.epoch,
            train_time,
            elapsed: start.elapsed(),
        })
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Best rank-1 seen so far.
    pub fn best_rank1(&self) -> Option<f32> {
        self.best_rank1
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// The model being trained.
    pub fn model(&self) -> &QualityNet {
        &self.model
    }

    /// Compute device of the run.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Active configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
