// ============================================================
// Layer 5 — ResNet-152 Backbone
// ============================================================
// Bottleneck ResNet with the [3, 8, 36, 3] block layout.
//
//   conv 7x7/2 → bn → relu → maxpool 3x3/2
//   layer1 (64)  → layer2 (128)/2 → layer3 (256)/2 → layer4 (512)/2
//   expansion 4: layer4 outputs 2048 channels, 7x7 for 224 input
//
// Two heads:
//   pooled — global average pool, [batch, 2048]
//   grid   — the raw layer4 map,  [batch, 2048, 7, 7]
//
// Caffe-converted weights put the block stride on the first
// 1x1 convolution instead of the 3x3 one (stride_in_1x1).
//
// Reference: He et al. (2016) Deep Residual Learning

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

use super::frozen_bn::FrozenBatchNorm2d;

const EXPANSION: usize = 4;
pub const RESNET152_BLOCKS: [usize; 4] = [3, 8, 36, 3];

pub(super) fn conv<B: Backend>(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([c_in, c_out], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

// ─── Blocks ───────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn:   FrozenBatchNorm2d<B>,
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1:      Conv2d<B>,
    pub bn1:        FrozenBatchNorm2d<B>,
    pub conv2:      Conv2d<B>,
    pub bn2:        FrozenBatchNorm2d<B>,
    pub conv3:      Conv2d<B>,
    pub bn3:        FrozenBatchNorm2d<B>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(c_in: usize, planes: usize, stride: usize, stride_in_1x1: bool, device: &B::Device) -> Self {
        let (s1, s3) = if stride_in_1x1 { (stride, 1) } else { (1, stride) };
        let c_out = planes * EXPANSION;
        let downsample = (stride != 1 || c_in != c_out).then(|| Downsample {
            conv: conv(c_in, c_out, 1, stride, 0, device),
            bn:   FrozenBatchNorm2d::new(c_out, device),
        });

        Self {
            conv1: conv(c_in, planes, 1, s1, 0, device),
            bn1:   FrozenBatchNorm2d::new(planes, device),
            conv2: conv(planes, planes, 3, s3, 1, device),
            bn2:   FrozenBatchNorm2d::new(planes, device),
            conv3: conv(planes, c_out, 1, 1, 0, device),
            bn3:   FrozenBatchNorm2d::new(c_out, device),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(d) => d.bn.forward(d.conv.forward(x.clone())),
            None => x.clone(),
        };
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        relu(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResLayer<B: Backend> {
    pub blocks: Vec<Bottleneck<B>>,
}

// ─── ResNet ───────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub conv1:   Conv2d<B>,
    pub bn1:     FrozenBatchNorm2d<B>,
    pub maxpool: MaxPool2d,
    pub layers:  Vec<ResLayer<B>>,
    pub avgpool: AdaptiveAvgPool2d,
    /// false → return the layer4 grid
    pub pooled:  bool,
}

impl<B: Backend> ResNet<B> {
    pub fn new(blocks: [usize; 4], stride_in_1x1: bool, pooled: bool, device: &B::Device) -> Self {
        let mut c_in = 64;
        let mut layers = Vec::with_capacity(blocks.len());
        for (i, &n) in blocks.iter().enumerate() {
            let planes = 64 << i;
            let mut layer = ResLayer { blocks: Vec::with_capacity(n) };
            for j in 0..n {
                // only the first block of layers 2..4 downsamples
                let stride = if i > 0 && j == 0 { 2 } else { 1 };
                layer.blocks.push(Bottleneck::new(c_in, planes, stride, stride_in_1x1, device));
                c_in = planes * EXPANSION;
            }
            layers.push(layer);
        }

        Self {
            conv1: conv(3, 64, 7, 2, 3, device),
            bn1: FrozenBatchNorm2d::new(64, device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layers,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            pooled,
        }
    }

    /// images: [batch, 3, H, W] → [batch, 2048, H/32, W/32], pooled to 1x1 when configured
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let mut x = self.maxpool.forward(x);
        for layer in &self.layers {
            for block in &layer.blocks {
                x = block.forward(x);
            }
        }
        if self.pooled { self.avgpool.forward(x) } else { x }
    }
}
