//! Integration tests for [`qan_reid_train::dataset`], [`qan_reid_train::sampler`]
//! and [`qan_reid_train::loader`].
//!
//! Besides the built-in synthetic dataset, a small on-disk dataset of PNG
//! frames is written to a temporary directory to exercise the default
//! image-decoding frame loader.

use std::path::{Path, PathBuf};

use qan_reid_train::dataset::{ReidDataset, SyntheticConfig, SyntheticReidDataset, Tracklet};
use qan_reid_train::loader::TrackletLoader;
use qan_reid_train::sampler::{sequential_plan, FrameSampling, IdentitySampler};
use qan_reid_train::DatasetError;
use tch::Device;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// On-disk fixture
// ---------------------------------------------------------------------------

/// Tracklets of solid-colour PNG frames; the red channel encodes the frame
/// number so frame order can be observed after loading.
struct PngDataset {
    _dir: TempDir,
    train: Vec<Tracklet>,
}

impl PngDataset {
    fn new(lengths: &[(usize, usize)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut train = Vec::new();
        for (t, &(pid, n)) in lengths.iter().enumerate() {
            let frames = (0..n)
                .map(|f| {
                    let path = dir.path().join(format!("{pid:04}T{t}F{f:03}.png"));
                    image::RgbImage::from_pixel(6, 12, image::Rgb([(f * 20) as u8, 128, 0]))
                        .save(&path)
                        .expect("write png");
                    path
                })
                .collect();
            train.push(Tracklet { frames, pid, camid: t % 2 });
        }
        PngDataset { _dir: dir, train }
    }
}

impl ReidDataset for PngDataset {
    fn name(&self) -> &str {
        "png"
    }
    fn train(&self) -> &[Tracklet] {
        &self.train
    }
    fn query(&self) -> &[Tracklet] {
        &self.train[..0]
    }
    fn gallery(&self) -> &[Tracklet] {
        &self.train[..0]
    }
    fn num_train_pids(&self) -> usize {
        self.train.iter().map(|t| t.pid + 1).max().unwrap_or(0)
    }
}

/// Red-channel value of one loaded frame, mapped back to the frame number.
fn frame_number(images: &ndarray::Array5<f32>, b: usize, s: usize) -> usize {
    let red = images[[b, s, 0, 0, 0]] * 0.229 + 0.485;
    (red * 255.0 / 20.0).round() as usize
}

// ---------------------------------------------------------------------------
// Loading from disk
// ---------------------------------------------------------------------------

/// Evenly sampled frames of an on-disk tracklet come back in stride order.
#[test]
fn png_frames_load_in_order() {
    let ds = PngDataset::new(&[(0, 8), (1, 3)]);
    let loader = TrackletLoader::new(&ds, ds.train(), FrameSampling::Evenly, 4, (8, 4), 0, 1);
    let batch = loader.assemble(&[0, 1], 0, 0).expect("batch");
    assert_eq!(batch.images.shape(), &[2, 4, 3, 8, 4]);

    let first: Vec<usize> = (0..4).map(|s| frame_number(&batch.images, 0, s)).collect();
    assert_eq!(first, vec![0, 2, 4, 6]);
    // Three frames, padded with the last one.
    let second: Vec<usize> = (0..4).map(|s| frame_number(&batch.images, 1, s)).collect();
    assert_eq!(second, vec![0, 1, 2, 2]);
    assert_eq!(batch.pids, vec![0, 1]);
}

/// A deleted frame surfaces as a decode error for its batch.
#[test]
fn missing_png_is_reported() {
    let ds = PngDataset::new(&[(0, 2)]);
    std::fs::remove_file(&ds.train()[0].frames[1]).expect("remove frame");
    let loader = TrackletLoader::new(&ds, ds.train(), FrameSampling::Evenly, 2, (8, 4), 0, 1);
    let err = loader.assemble(&[0], 0, 0).unwrap_err();
    assert!(matches!(err, DatasetError::FrameDecode { .. }), "{err:?}");
}

/// An index past the split is rejected.
#[test]
fn out_of_range_index() {
    let ds = SyntheticReidDataset::new(SyntheticConfig::default());
    let loader = TrackletLoader::new(&ds, ds.query(), FrameSampling::Evenly, 2, (8, 4), 0, 1);
    let err = loader.assemble(&[99], 0, 0).unwrap_err();
    assert!(matches!(err, DatasetError::IndexOutOfBounds { idx: 99, len: 4 }));
}

/// An empty tracklet cannot be sampled.
#[test]
fn empty_tracklet_is_reported() {
    let ds = SyntheticReidDataset::new(SyntheticConfig::default());
    let empty = vec![Tracklet { frames: Vec::<PathBuf>::new(), pid: 3, camid: 0 }];
    let loader = TrackletLoader::new(&ds, &empty, FrameSampling::Random, 2, (8, 4), 0, 1);
    let err = loader.assemble(&[0], 0, 0).unwrap_err();
    assert!(matches!(err, DatasetError::EmptyTracklet { index: 0, pid: 3 }));
}

// ---------------------------------------------------------------------------
// Sampler + loader
// ---------------------------------------------------------------------------

/// Every training batch has P identities × K tracklets and flattens to
/// `B·S` frames with repeated frame labels.
#[test]
fn training_batches_are_identity_balanced() {
    let ds = SyntheticReidDataset::new(SyntheticConfig::default());
    let sampler = IdentitySampler::new(ds.train(), 4, 2, 9).expect("sampler");
    let plan = sampler.epoch_plan(0);
    assert_eq!(plan.len(), 4);

    let loader = TrackletLoader::new(&ds, ds.train(), FrameSampling::Random, 3, (8, 4), 0, 9);
    let mut seen = 0;
    loader
        .for_each_batch(&plan, 0, |i, batch, _| {
            assert_eq!(batch.len(), 4);
            let mut pids = batch.pids.clone();
            pids.sort_unstable();
            pids.dedup();
            assert_eq!(pids.len(), 2, "batch {i}: {:?}", batch.pids);

            assert_eq!(batch.frames_tensor(Device::Cpu).size(), vec![12, 3, 8, 4]);
            let frame_pids = Vec::<i64>::try_from(batch.frame_pids_tensor(Device::Cpu)).expect("labels");
            let expected: Vec<i64> = batch.pids.iter().flat_map(|&p| [p as i64; 3]).collect();
            assert_eq!(frame_pids, expected);
            seen += 1;
            Ok(())
        })
        .expect("epoch");
    assert_eq!(seen, 4);
}

/// Prefetching workers deliver exactly what the synchronous path assembles,
/// in plan order.
#[test]
fn prefetch_matches_synchronous_loading() {
    let ds = SyntheticReidDataset::new(SyntheticConfig::default());
    let plan = sequential_plan(ds.gallery().len(), 3);

    let collect = |workers: usize| {
        let loader = TrackletLoader::new(&ds, ds.gallery(), FrameSampling::Random, 4, (8, 4), workers, 5);
        let mut out = Vec::new();
        loader
            .for_each_batch(&plan, 2, |i, batch, _| {
                out.push((i, batch.pids.clone(), batch.images.clone()));
                Ok(())
            })
            .expect("epoch");
        out
    };

    let sync = collect(0);
    let threaded = collect(3);
    assert_eq!(sync.len(), 3);
    assert_eq!(sync, threaded);
    assert_eq!(sync.iter().map(|(i, ..)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
}

/// An error returned by the consumer stops the epoch.
#[test]
fn consumer_error_stops_loading() {
    let ds = SyntheticReidDataset::new(SyntheticConfig::default());
    let plan = sequential_plan(ds.train().len(), 2);
    let loader = TrackletLoader::new(&ds, ds.train(), FrameSampling::Evenly, 2, (8, 4), 2, 1);
    let mut calls = 0;
    let result = loader.for_each_batch(&plan, 0, |_, _, _| {
        calls += 1;
        Err(qan_reid_train::TrainError::training_step("stop"))
    });
    assert!(result.is_err());
    assert_eq!(calls, 1);
}

/// The synthetic registry builds paths under the configured root.
#[test]
fn registry_uses_root() {
    let ds = qan_reid_train::init_dataset("Synthetic", Path::new("/data/reid")).expect("dataset");
    assert_eq!(ds.name(), "synthetic");
    assert!(ds.train()[0].frames[0].starts_with("/data/reid/synthetic"));
    assert!(ds.load_frame(&ds.query()[0].frames[0], 8, 4).is_ok());
}
