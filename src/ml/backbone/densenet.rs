// ============================================================
// Layer 5 — DenseNet-201 Backbone
// ============================================================
// Feature trunk only (no classifier):
//
//   conv0 7x7/2 → norm0 → relu → pool0 3x3/2
//   dense block (6)  → transition → dense block (12) → transition
//   dense block (48) → transition → dense block (32) → norm5
//
// Every dense layer adds growth_rate (32) channels, so the
// trunk ends at 1920 channels on a 7x7 grid for 224 input.

use burn::{
    nn::{
        conv::Conv2d,
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

use super::{frozen_bn::FrozenBatchNorm2d, resnet::conv};

const GROWTH: usize = 32;
const BN_SIZE: usize = 4;
pub const DENSENET201_BLOCKS: [usize; 4] = [6, 12, 48, 32];

#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    pub norm1: FrozenBatchNorm2d<B>,
    pub conv1: Conv2d<B>,
    pub norm2: FrozenBatchNorm2d<B>,
    pub conv2: Conv2d<B>,
}

impl<B: Backend> DenseLayer<B> {
    fn new(c_in: usize, device: &B::Device) -> Self {
        Self {
            norm1: FrozenBatchNorm2d::new(c_in, device),
            conv1: conv(c_in, BN_SIZE * GROWTH, 1, 1, 0, device),
            norm2: FrozenBatchNorm2d::new(BN_SIZE * GROWTH, device),
            conv2: conv(BN_SIZE * GROWTH, GROWTH, 3, 1, 1, device),
        }
    }

    /// Returns the input with GROWTH new channels appended.
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let y = self.conv1.forward(relu(self.norm1.forward(x.clone())));
        let y = self.conv2.forward(relu(self.norm2.forward(y)));
        Tensor::cat(vec![x, y], 1)
    }
}

#[derive(Module, Debug)]
pub struct Transition<B: Backend> {
    pub norm: FrozenBatchNorm2d<B>,
    pub conv: Conv2d<B>,
    pub pool: AvgPool2d,
}

#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub layers:     Vec<DenseLayer<B>>,
    pub transition: Option<Transition<B>>,
}

#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    pub conv0:  Conv2d<B>,
    pub norm0:  FrozenBatchNorm2d<B>,
    pub pool0:  MaxPool2d,
    pub blocks: Vec<DenseBlock<B>>,
    pub norm5:  FrozenBatchNorm2d<B>,
}

impl<B: Backend> DenseNet<B> {
    pub fn new(block_sizes: [usize; 4], device: &B::Device) -> Self {
        let mut channels = 64;
        let mut blocks = Vec::with_capacity(block_sizes.len());
        for (i, &n) in block_sizes.iter().enumerate() {
            let layers = (0..n)
                .map(|j| DenseLayer::new(channels + j * GROWTH, device))
                .collect();
            channels += n * GROWTH;

            let transition = (i + 1 < block_sizes.len()).then(|| {
                let t = Transition {
                    norm: FrozenBatchNorm2d::new(channels, device),
                    conv: conv(channels, channels / 2, 1, 1, 0, device),
                    pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                };
                channels /= 2;
                t
            });
            blocks.push(DenseBlock { layers, transition });
        }

        Self {
            conv0: conv(3, 64, 7, 2, 3, device),
            norm0: FrozenBatchNorm2d::new(64, device),
            pool0: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            blocks,
            norm5: FrozenBatchNorm2d::new(channels, device),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.norm0.forward(self.conv0.forward(images)));
        let mut x = self.pool0.forward(x);
        for block in &self.blocks {
            for layer in &block.layers {
                x = layer.forward(x);
            }
            if let Some(t) = &block.transition {
                x = t.pool.forward(t.conv.forward(relu(t.norm.forward(x))));
            }
        }
        self.norm5.forward(x)
    }
}
