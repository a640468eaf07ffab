//! Batch assembly with a bounded prefetching worker pool.
//!
//! A [`TrackletLoader`] turns a batch plan (lists of tracklet indices, see
//! [`crate::sampler`]) into [`Batch`]es of shape `[B, S, 3, H, W]`.
//!
//! With `num_workers > 0` batches are assembled by scoped worker threads
//! that pull batch numbers from a shared counter and push results into a
//! bounded `sync_channel`. The consumer re-orders them and hands them to the
//! caller strictly in plan order. The first error, from either a worker or
//! the caller's closure, stops iteration; dropping the receiver makes every
//! blocked worker exit.

use ndarray::Array5;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::dataset::{ReidDataset, Tracklet};
use crate::error::{DatasetError, TrainError, TrainResult};
use crate::sampler::{mix_seed, sample_frame_indices, FrameSampling};

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One assembled batch of tracklets.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Frames, `[B, S, 3, H, W]`.
    pub images: Array5<f32>,
    /// Identity label per tracklet.
    pub pids: Vec<usize>,
    /// Camera per tracklet.
    pub camids: Vec<usize>,
}

impl Batch {
    /// Number of tracklets (B).
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    /// Returns `true` for a batch without tracklets.
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Frames per tracklet (S).
    pub fn seq_len(&self) -> usize {
        self.images.shape()[1]
    }

    /// Frames flattened to `[B·S, 3, H, W]` on `device`.
    pub fn frames_tensor(&self, device: Device) -> Tensor {
        let (b, s, c, h, w) = self.images.dim();
        let data: Vec<f32> = self.images.iter().copied().collect();
        Tensor::from_slice(&data)
            .view([(b * s) as i64, c as i64, h as i64, w as i64])
            .to_device(device)
    }

    /// Tracklet labels `[B]` as `Int64` on `device`.
    pub fn pids_tensor(&self, device: Device) -> Tensor {
        labels_tensor(self.pids.iter().copied(), device)
    }

    /// Tracklet labels repeated for each frame, `[B·S]`.
    pub fn frame_pids_tensor(&self, device: Device) -> Tensor {
        let s = self.seq_len();
        labels_tensor(self.pids.iter().flat_map(|&p| std::iter::repeat(p).take(s)), device)
    }
}

fn labels_tensor(labels: impl Iterator<Item = usize>, device: Device) -> Tensor {
    let v: Vec<i64> = labels.map(|p| p as i64).collect();
    Tensor::from_slice(&v).to_kind(Kind::Int64).to_device(device)
}

// ---------------------------------------------------------------------------
// TrackletLoader
// ---------------------------------------------------------------------------

/// Assembles batches of one split.
pub struct TrackletLoader<'a> {
    dataset: &'a dyn ReidDataset,
    tracklets: &'a [Tracklet],
    sampling: FrameSampling,
    seq_len: usize,
    height: usize,
    width: usize,
    num_workers: usize,
    seed: u64,
}

impl<'a> TrackletLoader<'a> {
    /// Create a loader over `tracklets`, which must belong to `dataset`.
    pub fn new(
        dataset: &'a dyn ReidDataset,
        tracklets: &'a [Tracklet],
        sampling: FrameSampling,
        seq_len: usize,
        (height, width): (usize, usize),
        num_workers: usize,
        seed: u64,
    ) -> Self {
        TrackletLoader {
            dataset,
            tracklets,
            sampling,
            seq_len,
            height,
            width,
            num_workers,
            seed,
        }
    }

    /// Number of tracklets in the split.
    pub fn len(&self) -> usize {
        self.tracklets.len()
    }

    /// Returns `true` when the split has no tracklets.
    pub fn is_empty(&self) -> bool {
        self.tracklets.is_empty()
    }

    /// Assemble batch `batch_no` of `epoch` synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] for out-of-range indices, empty tracklets,
    /// undecodable frames or frames of the wrong shape.
    pub fn assemble(&self, indices: &[usize], epoch: usize, batch_no: usize) -> Result<Batch, DatasetError> {
        let mut rng = StdRng::seed_from_u64(mix_seed(self.seed, epoch as u64, batch_no as u64));
        let (s, h, w) = (self.seq_len, self.height, self.width);
        let frame_len = 3 * h * w;
        let mut data = Vec::with_capacity(indices.len() * s * frame_len);
        let mut pids = Vec::with_capacity(indices.len());
        let mut camids = Vec::with_capacity(indices.len());

        for &idx in indices {
            let t = self.tracklets.get(idx).ok_or(DatasetError::IndexOutOfBounds {
                idx,
                len: self.tracklets.len(),
            })?;
            if t.is_empty() {
                return Err(DatasetError::EmptyTracklet { index: idx, pid: t.pid });
            }
            for f in sample_frame_indices(t.len(), s, self.sampling, &mut rng) {
                let path = &t.frames[f];
                let frame = self.dataset.load_frame(path, h, w)?;
                if frame.shape() != [3, h, w] {
                    return Err(DatasetError::FrameShape {
                        path: path.clone(),
                        expected: [3, h, w],
                        actual: frame.shape().to_vec(),
                    });
                }
                data.extend(frame.iter().copied());
            }
            pids.push(t.pid);
            camids.push(t.camid);
        }

        let images = Array5::from_shape_vec((indices.len(), s, 3, h, w), data)?;
        Ok(Batch { images, pids, camids })
    }

    /// Assemble every batch of `plan` and feed them to `f` in plan order.
    ///
    /// `f` receives the batch number, the batch, and the time spent waiting
    /// for it.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error from assembly or from `f`.
    pub fn for_each_batch<F>(&self, plan: &[Vec<usize>], epoch: usize, mut f: F) -> TrainResult<()>
    where
        F: FnMut(usize, Batch, Duration) -> TrainResult<()>,
    {
        if self.num_workers == 0 {
            for (i, indices) in plan.iter().enumerate() {
                let start = Instant::now();
                let batch = self.assemble(indices, epoch, i)?;
                f(i, batch, start.elapsed())?;
            }
            return Ok(());
        }

        let workers = self.num_workers.min(plan.len().max(1));
        let next = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel(workers * 2);
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(indices) = plan.get(i) else { break };
                    let result = self.assemble(indices, epoch, i);
                    if tx.send((i, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);
            debug!(workers, batches = plan.len(), "Prefetch workers started");
            Self::drain_in_order(rx, plan.len(), &mut f)
        })
    }

    fn drain_in_order<F>(
        rx: Receiver<(usize, Result<Batch, DatasetError>)>,
        total: usize,
        f: &mut F,
    ) -> TrainResult<()>
    where
        F: FnMut(usize, Batch, Duration) -> TrainResult<()>,
    {
        let mut pending: BTreeMap<usize, Batch> = BTreeMap::new();
        let mut wait = Instant::now();
        for expected in 0..total {
            let batch = loop {
                if let Some(b) = pending.remove(&expected) {
                    break b;
                }
                let (i, result) = rx
                    .recv()
                    .map_err(|_| TrainError::from(DatasetError::WorkerDisconnected { batch: expected }))?;
                pending.insert(i, result?);
            };
            f(expected, batch, wait.elapsed())?;
            wait = Instant::now();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
