//! Quality-aware sequence model using tch-rs (PyTorch Rust bindings).
//!
//! # Architecture
//!
//! ```text
//! frames [N, 3, H, W]
//!       │
//!       ▼
//! ┌─────────────────────┐
//! │  Backbone           │  tiny CNN or ResNet-18/34/50 without final layer
//! └─────────────────────┘
//!       │ [N, F]
//!       ▼
//! ┌─────────────────────┐
//! │  Embedding head     │  Linear(F → D)
//! └─────────────────────┘
//!       │ [N, D]
//!   ┌───┴────────┐
//!   ▼            ▼
//! ┌──────────┐ ┌─────────┐
//! │Classifier│ │ Quality │
//! │ D → K    │ │ D → 1   │
//! └──────────┘ └─────────┘
//! [N, K]       [N, 1]
//! ```
//!
//! The classifier is shared by both forward modes: [`QualityNet::forward_frame`]
//! runs the whole stack on frames, [`QualityNet::forward_descriptor`] only
//! re-classifies pooled `[B, D]` descriptors.
//!
//! Every layer is constructed once in [`QualityNet::new`] so parameters are
//! registered in the `VarStore` before an optimiser or checkpoint touches it.
//! The backbone lives in optimiser group [`BACKBONE_GROUP`], the three heads
//! in [`HEAD_GROUP`].

use std::collections::HashMap;
use std::path::Path;
use tch::{nn, nn::Module, nn::ModuleT, Device, Kind, Tensor};
use tracing::{debug, info};

use crate::config::{BackboneKind, TrainingConfig};
use crate::error::{TrainError, TrainResult};

/// Optimiser parameter group of the backbone.
pub const BACKBONE_GROUP: usize = 0;
/// Optimiser parameter group of the embedding, classifier and quality heads.
pub const HEAD_GROUP: usize = 1;

const BACKBONE_PREFIX: &str = "base";

// ---------------------------------------------------------------------------
// Public output type
// ---------------------------------------------------------------------------

/// Outputs of a frame-mode forward pass.
#[derive(Debug)]
pub struct FrameOutput {
    /// Identity logits: `[N, K]`.
    pub logits: Tensor,
    /// Frame embeddings: `[N, D]`.
    pub embedding: Tensor,
    /// Unnormalised quality scores: `[N, 1]`.
    pub quality: Tensor,
}

// ---------------------------------------------------------------------------
// QualityNet
// ---------------------------------------------------------------------------

/// Frame encoder with embedding, identity and quality heads.
pub struct QualityNet {
    vs: nn::VarStore,
    backbone: Box<dyn ModuleT>,
    embedding: nn::Linear,
    classifier: nn::Linear,
    quality: nn::Linear,
    kind: BackboneKind,
    num_classes: i64,
    embedding_dim: i64,
}

impl QualityNet {
    /// Build the model for `num_classes` training identities on `device`.
    ///
    /// When `config.pretrained_backbone` is set the backbone weights are
    /// imported from that file.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] for a zero class count and
    /// [`TrainError::Checkpoint`] when the pretrained weights do not fit.
    pub fn new(config: &TrainingConfig, num_classes: usize, device: Device) -> TrainResult<Self> {
        if num_classes == 0 {
            return Err(crate::error::ConfigError::invalid_value(
                "num_classes",
                "training split has no identities",
            )
            .into());
        }
        let vs = nn::VarStore::new(device);
        let kind = config.backbone;
        let feat_dim = kind.feature_dim();
        let embedding_dim = config.embedding_dim as i64;
        let num_classes = num_classes as i64;

        let (backbone, embedding, classifier, quality) = {
            let base = vs.root().set_group(BACKBONE_GROUP) / BACKBONE_PREFIX;
            let heads = vs.root().set_group(HEAD_GROUP);
            let backbone = build_backbone(&base, kind);
            let embedding =
                nn::linear(&heads / "feature", feat_dim, embedding_dim, Default::default());
            let classifier =
                nn::linear(&heads / "classifier", embedding_dim, num_classes, Default::default());
            let quality = nn::linear(&heads / "quality", embedding_dim, 1, Default::default());
            (backbone, embedding, classifier, quality)
        };

        let mut model = QualityNet {
            vs,
            backbone,
            embedding,
            classifier,
            quality,
            kind,
            num_classes,
            embedding_dim,
        };

        if let Some(path) = &config.pretrained_backbone {
            model.import_backbone(path)?;
        }
        info!(
            backbone = %kind,
            num_classes,
            embedding_dim,
            params = model.num_parameters(),
            "Model initialised"
        );
        Ok(model)
    }

    /// Frame-mode forward.
    ///
    /// `train` selects batch-norm behaviour; gradient tracking follows the
    /// caller's `no_grad` scope.
    ///
    /// # Shapes
    /// - `images`: `[N, 3, H, W]`
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::ShapeMismatch`] when `images` is not a batch of
    /// three-channel frames.
    pub fn forward_frame(&self, images: &Tensor, train: bool) -> TrainResult<FrameOutput> {
        let shape = images.size();
        if shape.len() != 4 || shape[1] != 3 {
            return Err(TrainError::shape_mismatch("forward_frame images", vec![-1, 3, -1, -1], shape));
        }
        let features = self.backbone.forward_t(images, train);
        let embedding = self.embedding.forward(&features);
        let logits = self.classifier.forward(&embedding);
        let quality = self.quality.forward(&embedding);
        Ok(FrameOutput { logits, embedding, quality })
    }

    /// Descriptor-mode forward: identity logits for pooled descriptors.
    ///
    /// # Shapes
    /// - `descriptors`: `[B, D]`
    /// - returns: `[B, K]`
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::ShapeMismatch`] when the descriptor width is not
    /// the embedding width.
    pub fn forward_descriptor(&self, descriptors: &Tensor) -> TrainResult<Tensor> {
        let shape = descriptors.size();
        if shape.len() != 2 || shape[1] != self.embedding_dim {
            return Err(TrainError::shape_mismatch(
                "forward_descriptor",
                vec![-1, self.embedding_dim],
                shape,
            ));
        }
        Ok(self.classifier.forward(descriptors))
    }

    /// Frame-mode forward without gradient tracking and with batch-norm in
    /// evaluation mode.
    pub fn forward_inference(&self, images: &Tensor) -> TrainResult<FrameOutput> {
        tch::no_grad(|| self.forward_frame(images, false))
    }

    /// Copy backbone weights from a named-tensor file.
    ///
    /// Every backbone variable must be present with an identical shape;
    /// entries without a counterpart (such as a classifier layer) are
    /// skipped. Nothing is copied unless every check passes.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Checkpoint`] for an unreadable file, a missing
    /// tensor or a shape mismatch.
    pub fn import_backbone(&mut self, path: &Path) -> TrainResult<()> {
        if !path.is_file() {
            return Err(TrainError::checkpoint("pretrained backbone file not found", path));
        }
        let loaded: HashMap<String, Tensor> = Tensor::load_multi(path)
            .map_err(|e| TrainError::checkpoint(format!("cannot read tensors: {e}"), path))?
            .into_iter()
            .collect();

        let prefix = format!("{BACKBONE_PREFIX}.");
        let mut pairs = Vec::new();
        for (name, var) in self.vs.variables() {
            let Some(key) = name.strip_prefix(&prefix) else {
                continue;
            };
            let src = loaded.get(key).ok_or_else(|| {
                TrainError::checkpoint(format!("pretrained weights lack `{key}`"), path)
            })?;
            if src.size() != var.size() {
                return Err(TrainError::checkpoint(
                    format!("`{key}` has shape {:?}, model expects {:?}", src.size(), var.size()),
                    path,
                ));
            }
            pairs.push((var, src));
        }

        let copied = pairs.len();
        tch::no_grad(|| {
            for (mut var, src) in pairs {
                var.copy_(&src.to_device(var.device()).to_kind(var.kind()));
            }
        });
        debug!(skipped = loaded.len().saturating_sub(copied), "Unused pretrained tensors");
        info!(path = %path.display(), tensors = copied, "Imported pretrained backbone");
        Ok(())
    }

    /// Backbone variant.
    pub fn backbone_kind(&self) -> BackboneKind {
        self.kind
    }

    /// Number of identity classes (K).
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    /// Embedding width (D).
    pub fn embedding_dim(&self) -> i64 {
        self.embedding_dim
    }

    /// Return all trainable variable tensors.
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.vs
            .trainable_variables()
            .into_iter()
            .map(|t| t.shallow_clone())
            .collect()
    }

    /// Count total trainable parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs.trainable_variables().iter().map(|t| t.numel()).sum()
    }

    /// Access the internal `VarStore` (e.g. to create an optimizer).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Mutable access to the internal `VarStore`.
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Compute device of the parameters.
    pub fn device(&self) -> Device {
        self.vs.device()
    }
}

// ---------------------------------------------------------------------------
// Backbones
// ---------------------------------------------------------------------------

fn build_backbone(path: &nn::Path, kind: BackboneKind) -> Box<dyn ModuleT> {
    use tch::vision::resnet;
    match kind {
        BackboneKind::Tiny => Box::new(tiny_backbone(path)),
        BackboneKind::Resnet18 => Box::new(resnet::resnet18_no_final_layer(path)),
        BackboneKind::Resnet34 => Box::new(resnet::resnet34_no_final_layer(path)),
        BackboneKind::Resnet50 => Box::new(resnet::resnet50_no_final_layer(path)),
    }
}

/// Small CPU-friendly extractor.
///
/// ```text
/// Conv(3→32, 3x3, s2) ─ BN ─ ReLU ─ Conv(32→64, 3x3, s2) ─ BN ─ ReLU ─ GAP
/// ```
///
/// Output: `[N, 64]`.
fn tiny_backbone(path: &nn::Path) -> nn::SequentialT {
    let cfg = nn::ConvConfig { stride: 2, padding: 1, bias: false, ..Default::default() };
    nn::seq_t()
        .add(nn::conv2d(path / "conv1", 3, 32, 3, cfg))
        .add(nn::batch_norm2d(path / "bn1", 32, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::conv2d(path / "conv2", 32, 64, 3, cfg))
        .add(nn::batch_norm2d(path / "bn2", 64, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn(|x| x.adaptive_avg_pool2d([1, 1]).flatten(1, -1))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> TrainingConfig {
        TrainingConfig {
            backbone: BackboneKind::Tiny,
            embedding_dim: 8,
            height: 16,
            width: 8,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn frame_forward_output_shapes() {
        tch::manual_seed(0);
        let model = QualityNet::new(&tiny_config(), 5, Device::Cpu).unwrap();
        let images = Tensor::randn([6, 3, 16, 8], (Kind::Float, Device::Cpu));
        let out = model.forward_frame(&images, true).unwrap();
        assert_eq!(out.logits.size(), vec![6, 5]);
        assert_eq!(out.embedding.size(), vec![6, 8]);
        assert_eq!(out.quality.size(), vec![6, 1]);
    }

    #[test]
    fn descriptor_forward_shares_classifier() {
        tch::manual_seed(0);
        let model = QualityNet::new(&tiny_config(), 3, Device::Cpu).unwrap();
        let images = Tensor::randn([2, 3, 16, 8], (Kind::Float, Device::Cpu));
        let out = model.forward_inference(&images).unwrap();
        let again = model.forward_descriptor(&out.embedding).unwrap();
        assert!(again.allclose(&out.logits, 1e-5, 1e-6, false));
    }

    #[test]
    fn wrong_descriptor_width_is_rejected() {
        let model = QualityNet::new(&tiny_config(), 3, Device::Cpu).unwrap();
        let bad = Tensor::zeros([2, 9], (Kind::Float, Device::Cpu));
        assert!(matches!(
            model.forward_descriptor(&bad),
            Err(TrainError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn grayscale_frames_are_rejected() {
        let model = QualityNet::new(&tiny_config(), 3, Device::Cpu).unwrap();
        let bad = Tensor::zeros([2, 1, 16, 8], (Kind::Float, Device::Cpu));
        assert!(model.forward_frame(&bad, false).is_err());
    }

    #[test]
    fn zero_classes_is_rejected() {
        assert!(QualityNet::new(&tiny_config(), 0, Device::Cpu).is_err());
    }

    #[test]
    fn parameters_are_registered_up_front() {
        let model = QualityNet::new(&tiny_config(), 4, Device::Cpu).unwrap();
        let names: Vec<String> = model.var_store().variables().into_keys().collect();
        assert!(names.iter().any(|n| n.starts_with("base.conv1")));
        assert!(names.iter().any(|n| n.starts_with("quality.")));
        // conv1 3*32*9 + bn1 2*32 + conv2 32*64*9 + bn2 2*64
        // + feature 64*8+8 + classifier 8*4+4 + quality 8+1
        let expected = 864 + 64 + 18432 + 128 + 520 + 36 + 9;
        assert_eq!(model.num_parameters(), expected);
    }

    #[test]
    fn missing_pretrained_file_is_a_checkpoint_error() {
        let cfg = TrainingConfig {
            pretrained_backbone: Some("/nonexistent/resnet.ot".into()),
            ..tiny_config()
        };
        assert!(matches!(
            QualityNet::new(&cfg, 2, Device::Cpu),
            Err(TrainError::Checkpoint { .. })
        ));
    }

    #[test]
    fn pretrained_backbone_round_trip() {
        tch::manual_seed(11);
        let source = QualityNet::new(&tiny_config(), 2, Device::Cpu).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tiny_backbone.ot");
        let named: Vec<(String, Tensor)> = source
            .var_store()
            .variables()
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix("base.").map(|s| (s.to_string(), v)))
            .collect();
        Tensor::save_multi(named.as_slice(), &path).unwrap();

        tch::manual_seed(12);
        let cfg = TrainingConfig { pretrained_backbone: Some(path), ..tiny_config() };
        let target = QualityNet::new(&cfg, 7, Device::Cpu).unwrap();
        let src_vars = source.var_store().variables();
        for (name, var) in target.var_store().variables() {
            if name.starts_with("base.") {
                assert!(var.equal(&src_vars[&name]), "{name} was not imported");
            }
        }
    }
}
