//! Dataset abstractions for video person re-identification.
//!
//! This module defines the [`ReidDataset`] trait, the [`Tracklet`] record it
//! exposes, a frame decoder built on the `image` crate and one concrete
//! implementation:
//!
//! - [`SyntheticReidDataset`]: renders fully-deterministic, identity-dependent
//!   frames without touching the file system; used by unit tests,
//!   integration tests and dry runs. **Never uses random data.**
//!
//! Datasets are created by name through [`init_dataset`]. Frame selection
//! inside a tracklet and batch composition live in [`crate::sampler`]; batch
//! assembly and prefetching live in [`crate::loader`].
//!
//! # Example – synthetic dataset
//!
//! ```rust
//! use qan_reid_train::dataset::{ReidDataset, SyntheticConfig, SyntheticReidDataset};
//!
//! let ds = SyntheticReidDataset::new(SyntheticConfig::default());
//! assert_eq!(ds.num_train_pids(), 8);
//! let frame = ds.load_frame(&ds.train()[0].frames[0], 32, 16).unwrap();
//! assert_eq!(frame.shape(), &[3, 32, 16]);
//! ```

use ndarray::Array3;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{ConfigError, DatasetError};

/// Per-channel ImageNet mean applied by [`load_image_frame`].
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel ImageNet standard deviation applied by [`load_image_frame`].
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

// ---------------------------------------------------------------------------
// Tracklet
// ---------------------------------------------------------------------------

/// An ordered run of frames of one identity seen by one camera.
///
/// Training tracklets carry identity labels relabelled to `0..K`; query and
/// gallery tracklets keep the dataset's own identity numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracklet {
    /// Frame image paths in temporal order.
    pub frames: Vec<PathBuf>,
    /// Identity label.
    pub pid: usize,
    /// Camera identifier.
    pub camid: usize,
}

impl Tracklet {
    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` when the tracklet has no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ReidDataset trait
// ---------------------------------------------------------------------------

/// Common interface for video re-ID datasets.
///
/// Implementations must be `Send + Sync` so they can be shared across
/// prefetch threads without additional synchronisation.
pub trait ReidDataset: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Training tracklets, identities relabelled to `0..num_train_pids()`.
    fn train(&self) -> &[Tracklet];

    /// Query tracklets.
    fn query(&self) -> &[Tracklet];

    /// Gallery tracklets.
    fn gallery(&self) -> &[Tracklet];

    /// Number of distinct training identities (K).
    fn num_train_pids(&self) -> usize;

    /// Load one frame as a normalised `[3, height, width]` array.
    ///
    /// The default implementation decodes the file at `path`, see
    /// [`load_image_frame`].
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::FrameDecode`] if the image cannot be read.
    fn load_frame(&self, path: &Path, height: usize, width: usize) -> Result<Array3<f32>, DatasetError> {
        load_image_frame(path, height, width)
    }
}

/// Log identity and tracklet counts for every split.
pub fn log_summary(dataset: &dyn ReidDataset) {
    let ids = |ts: &[Tracklet]| ts.iter().map(|t| t.pid).collect::<HashSet<_>>().len();
    let frames = |ts: &[Tracklet]| ts.iter().map(Tracklet::len).collect::<Vec<_>>();
    let all: Vec<usize> = [dataset.train(), dataset.query(), dataset.gallery()]
        .into_iter()
        .flat_map(|s| frames(s))
        .collect();
    info!(
        dataset = dataset.name(),
        train_ids = ids(dataset.train()),
        train_tracklets = dataset.train().len(),
        query_ids = ids(dataset.query()),
        query_tracklets = dataset.query().len(),
        gallery_ids = ids(dataset.gallery()),
        gallery_tracklets = dataset.gallery().len(),
        min_frames = all.iter().min().copied().unwrap_or(0),
        max_frames = all.iter().max().copied().unwrap_or(0),
        "Dataset loaded"
    );
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// Decode an image file, resize it to `height × width` and normalise it
/// with [`IMAGENET_MEAN`] / [`IMAGENET_STD`].
///
/// Output layout is channel-first: `[3, height, width]`.
///
/// # Errors
///
/// Returns [`DatasetError::FrameDecode`] if the file cannot be opened or
/// decoded.
pub fn load_image_frame(path: &Path, height: usize, width: usize) -> Result<Array3<f32>, DatasetError> {
    let img = image::open(path).map_err(|source| DatasetError::FrameDecode {
        path: path.to_path_buf(),
        source,
    })?;
    let rgb = img
        .resize_exact(width as u32, height as u32, image::imageops::FilterType::Triangle)
        .to_rgb8();
    Ok(Array3::from_shape_fn((3, height, width), |(c, y, x)| {
        let p = rgb.get_pixel(x as u32, y as u32);
        (p[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
    }))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Names accepted by [`init_dataset`].
pub fn dataset_names() -> &'static [&'static str] {
    &["synthetic"]
}

/// Create a dataset by name.
///
/// # Errors
///
/// Returns [`ConfigError::Unsupported`] for an unknown name.
pub fn init_dataset(name: &str, root: &Path) -> Result<Box<dyn ReidDataset>, ConfigError> {
    match name.to_ascii_lowercase().as_str() {
        "synthetic" => Ok(Box::new(SyntheticReidDataset::with_root(
            SyntheticConfig::default(),
            root,
        ))),
        other => Err(ConfigError::unsupported("dataset", other, dataset_names())),
    }
}

// ---------------------------------------------------------------------------
// SyntheticReidDataset
// ---------------------------------------------------------------------------

/// Shape of a [`SyntheticReidDataset`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Identities in the training split. Default: **8**.
    pub num_train_ids: usize,
    /// Identities shared by query and gallery. Default: **4**.
    pub num_test_ids: usize,
    /// Training tracklets per identity, spread over cameras. Default: **2**.
    pub tracklets_per_id: usize,
    /// Cameras. Must be at least 2 for queries to have valid matches.
    /// Default: **2**.
    pub num_cameras: usize,
    /// Shortest tracklet. Default: **4**.
    pub min_frames: usize,
    /// Longest tracklet. Default: **12**.
    pub max_frames: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            num_train_ids: 8,
            num_test_ids: 4,
            tracklets_per_id: 2,
            num_cameras: 2,
            min_frames: 4,
            max_frames: 12,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameKey {
    pid: usize,
    camid: usize,
    frame: usize,
}

/// Deterministic dataset with identity-dependent rendered frames.
///
/// Frame paths are virtual; [`ReidDataset::load_frame`] renders them from
/// the identity, camera and frame number recorded at construction:
///
/// ```text
/// v[c, y, x] = 0.8 · sin(1.3·pid + 2.1·c)
///            + 0.3 · sin(2π · (y / H) · (1 + pid mod 4) + 0.4·frame + 0.9·cam)
///            + 0.1 · cam
/// ```
///
/// Training identities are `0..num_train_ids`; test identities follow
/// them. Each query is the camera-0 tracklet of a test identity, the
/// gallery holds one tracklet per camera (the camera-0 copy is filtered out
/// at ranking time).
pub struct SyntheticReidDataset {
    train: Vec<Tracklet>,
    query: Vec<Tracklet>,
    gallery: Vec<Tracklet>,
    num_train_pids: usize,
    frames: HashMap<PathBuf, FrameKey>,
}

impl SyntheticReidDataset {
    /// Build the dataset with virtual paths under `synthetic/`.
    pub fn new(config: SyntheticConfig) -> Self {
        Self::with_root(config, Path::new(""))
    }

    /// Build the dataset with virtual paths under `<root>/synthetic/`.
    pub fn with_root(config: SyntheticConfig, root: &Path) -> Self {
        let base = root.join("synthetic");
        let cams = config.num_cameras.max(1);
        let span = config.max_frames.saturating_sub(config.min_frames) + 1;
        let mut frames = HashMap::new();
        let mut make = |split: &str, pid: usize, camid: usize, t: usize| {
            let n = config.min_frames.max(1) + (pid * 7 + camid * 5 + t * 3) % span;
            let paths = (0..n)
                .map(|f| {
                    let p = base.join(split).join(format!("{pid:04}C{camid}T{t:02}F{f:03}.png"));
                    frames.insert(p.clone(), FrameKey { pid, camid, frame: f });
                    p
                })
                .collect();
            Tracklet { frames: paths, pid, camid }
        };

        let mut train = Vec::new();
        for pid in 0..config.num_train_ids {
            for t in 0..config.tracklets_per_id {
                train.push(make("train", pid, t % cams, t));
            }
        }
        let mut query = Vec::new();
        let mut gallery = Vec::new();
        for i in 0..config.num_test_ids {
            let pid = config.num_train_ids + i;
            query.push(make("query", pid, 0, 0));
            for cam in 0..cams {
                gallery.push(make("gallery", pid, cam, 1));
            }
        }

        SyntheticReidDataset {
            train,
            query,
            gallery,
            num_train_pids: config.num_train_ids,
            frames,
        }
    }

    fn render(key: FrameKey, height: usize, width: usize) -> Array3<f32> {
        let FrameKey { pid, camid, frame } = key;
        let freq = 1.0 + (pid % 4) as f32;
        Array3::from_shape_fn((3, height, width), |(c, y, _x)| {
            let colour = 0.8 * (1.3 * pid as f32 + 2.1 * c as f32).sin();
            let stripe = 0.3
                * (2.0 * std::f32::consts::PI * (y as f32 / height as f32) * freq
                    + 0.4 * frame as f32
                    + 0.9 * camid as f32)
                    .sin();
            colour + stripe + 0.1 * camid as f32
        })
    }
}

impl ReidDataset for SyntheticReidDataset {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn train(&self) -> &[Tracklet] {
        &self.train
    }

    fn query(&self) -> &[Tracklet] {
        &self.query
    }

    fn gallery(&self) -> &[Tracklet] {
        &self.gallery
    }

    fn num_train_pids(&self) -> usize {
        self.num_train_pids
    }

    fn load_frame(&self, path: &Path, height: usize, width: usize) -> Result<Array3<f32>, DatasetError> {
        let key = self.frames.get(path).ok_or_else(|| DatasetError::UnknownFrame {
            path: path.to_path_buf(),
            dataset: self.name().to_string(),
        })?;
        Ok(Self::render(*key, height, width))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
