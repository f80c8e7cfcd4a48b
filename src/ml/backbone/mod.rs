// ============================================================
// Layer 5 — Pretrained Image Backbones
// ============================================================
// Convolutional networks used purely as feature extractors.
// The registry maps a backbone name to its architecture, its
// output shape and the input convention of its weights:
//
//   alexnet                      flat 256·6·6
//   densenet201                  flat 1920·7·7
//   resnet152                    flat 2048
//   resnet152-conv               grid 2048 x 7 x 7
//   resnet152caffe-torchvision   flat 2048       (stride in 1x1)
//   resnet152caffe-original      flat 2048       (stride in 1x1, BGR 0..255)
//   resnet152caffe-conv          grid 2048 x 7 x 7
//   vgg16                        flat 4096
//   inceptionv3                  known, but not available
//
// Pretrained weights are Burn records named <name>.mpk in the
// weights directory; without them a backbone starts random.
//
// Reference: Burn Book §6 (Records)
//            torchvision.models documentation

pub mod alexnet;
pub mod densenet;
pub mod frozen_bn;
pub mod resnet;
pub mod vgg;

use burn::{
    prelude::*,
    record::{DefaultRecorder, Recorder},
};
use std::path::Path;

use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureDim;
use alexnet::AlexNet;
use densenet::{DenseNet, DENSENET201_BLOCKS};
use resnet::{ResNet, RESNET152_BLOCKS};
use vgg::Vgg16;

/// What the pretrained weights expect as input pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputConvention {
    /// RGB, scaled to [0, 1], ImageNet mean/std normalised
    ImageNet,
    /// BGR, 0..255, Caffe channel means subtracted
    CaffeBgr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arch {
    AlexNet,
    DenseNet201,
    ResNet152 { stride_in_1x1: bool, pooled: bool },
    Vgg16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneInfo {
    pub name:  &'static str,
    pub dim:   FeatureDim,
    pub input: InputConvention,
    arch:      Arch,
}

const RESNET_GRID: FeatureDim = FeatureDim::Grid { channels: 2048, height: 7, width: 7 };

const REGISTRY: [BackboneInfo; 8] = [
    BackboneInfo {
        name:  "alexnet",
        dim:   FeatureDim::Flat(256 * 6 * 6),
        input: InputConvention::ImageNet,
        arch:  Arch::AlexNet,
    },
    BackboneInfo {
        name:  "densenet201",
        dim:   FeatureDim::Flat(1920 * 7 * 7),
        input: InputConvention::ImageNet,
        arch:  Arch::DenseNet201,
    },
    BackboneInfo {
        name:  "resnet152",
        dim:   FeatureDim::Flat(2048),
        input: InputConvention::ImageNet,
        arch:  Arch::ResNet152 { stride_in_1x1: false, pooled: true },
    },
    BackboneInfo {
        name:  "resnet152-conv",
        dim:   RESNET_GRID,
        input: InputConvention::ImageNet,
        arch:  Arch::ResNet152 { stride_in_1x1: false, pooled: false },
    },
    BackboneInfo {
        name:  "resnet152caffe-torchvision",
        dim:   FeatureDim::Flat(2048),
        input: InputConvention::ImageNet,
        arch:  Arch::ResNet152 { stride_in_1x1: true, pooled: true },
    },
    BackboneInfo {
        name:  "resnet152caffe-original",
        dim:   FeatureDim::Flat(2048),
        input: InputConvention::CaffeBgr,
        arch:  Arch::ResNet152 { stride_in_1x1: true, pooled: true },
    },
    BackboneInfo {
        name:  "resnet152caffe-conv",
        dim:   RESNET_GRID,
        input: InputConvention::ImageNet,
        arch:  Arch::ResNet152 { stride_in_1x1: true, pooled: false },
    },
    BackboneInfo {
        name:  "vgg16",
        dim:   FeatureDim::Flat(4096),
        input: InputConvention::ImageNet,
        arch:  Arch::Vgg16,
    },
];

/// Recognised names that cannot be built in this crate.
const UNAVAILABLE: [&str; 1] = ["inceptionv3"];

/// Look up a backbone by name.
pub fn lookup(name: &str) -> Result<BackboneInfo, CaptionError> {
    if let Some(info) = REGISTRY.iter().find(|b| b.name == name) {
        return Ok(*info);
    }
    if UNAVAILABLE.contains(&name) {
        return Err(CaptionError::BackboneUnavailable(name.to_string()));
    }
    Err(CaptionError::UnknownBackbone(name.to_string()))
}

// ─── Backbone module ──────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    AlexNet(AlexNet<B>),
    DenseNet(DenseNet<B>),
    ResNet(ResNet<B>),
    Vgg(Vgg16<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn build(info: &BackboneInfo, device: &B::Device) -> Self {
        match info.arch {
            Arch::AlexNet => Backbone::AlexNet(AlexNet::new(device)),
            Arch::DenseNet201 => Backbone::DenseNet(DenseNet::new(DENSENET201_BLOCKS, device)),
            Arch::ResNet152 { stride_in_1x1, pooled } => {
                Backbone::ResNet(ResNet::new(RESNET152_BLOCKS, stride_in_1x1, pooled, device))
            }
            Arch::Vgg16 => Backbone::Vgg(Vgg16::new(device)),
        }
    }

    /// images: [batch, 3, H, W] → [batch, C, h, w]; flat heads give h = w = 1.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Backbone::AlexNet(m) => m.forward(images),
            Backbone::DenseNet(m) => m.forward(images),
            Backbone::ResNet(m) => m.forward(images),
            Backbone::Vgg(m) => m.forward(images).unsqueeze_dim::<3>(2).unsqueeze_dim(3),
        }
    }

    /// Load `<dir>/<name>.mpk` if it exists; otherwise keep the random init.
    pub fn with_pretrained(self, name: &str, weights_dir: Option<&Path>, device: &B::Device) -> Self {
        let Some(dir) = weights_dir else {
            tracing::warn!("No weights directory given; backbone '{name}' is randomly initialised");
            return self;
        };
        let path = dir.join(format!("{name}.mpk"));
        if !path.exists() {
            tracing::warn!(
                "Pretrained weights '{}' not found; backbone '{name}' is randomly initialised",
                path.display()
            );
            return self;
        }
        match DefaultRecorder::new().load(path.clone(), device) {
            Ok(record) => {
                tracing::info!("Loaded pretrained weights for '{name}' from '{}'", path.display());
                self.load_record(record)
            }
            Err(e) => {
                tracing::warn!("Cannot load '{}': {e}; backbone '{name}' is randomly initialised", path.display());
                self
            }
        }
    }
}
