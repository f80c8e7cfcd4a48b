use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// AlexNet convolutional trunk plus its 6x6 adaptive pool;
/// output [batch, 256, 6, 6].
#[derive(Module, Debug)]
pub struct AlexNet<B: Backend> {
    pub convs:   Vec<Conv2d<B>>,
    pub pool:    MaxPool2d,
    pub avgpool: AdaptiveAvgPool2d,
}

// (in, out, kernel, stride, padding, max-pool afterwards)
const LAYERS: [(usize, usize, usize, usize, usize, bool); 5] = [
    (3, 64, 11, 4, 2, true),
    (64, 192, 5, 1, 2, true),
    (192, 384, 3, 1, 1, false),
    (384, 256, 3, 1, 1, false),
    (256, 256, 3, 1, 1, true),
];

impl<B: Backend> AlexNet<B> {
    pub fn new(device: &B::Device) -> Self {
        let convs = LAYERS
            .iter()
            .map(|&(c_in, c_out, k, s, p, _)| {
                Conv2dConfig::new([c_in, c_out], [k, k])
                    .with_stride([s, s])
                    .with_padding(PaddingConfig2d::Explicit(p, p))
                    .init(device)
            })
            .collect();
        Self {
            convs,
            pool:    MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init(),
            avgpool: AdaptiveAvgPool2dConfig::new([6, 6]).init(),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for (conv, layer) in self.convs.iter().zip(LAYERS.iter()) {
            x = relu(conv.forward(x));
            if layer.5 {
                x = self.pool.forward(x);
            }
        }
        self.avgpool.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_output_is_256x6x6() {
        let device = Default::default();
        let net = AlexNet::<NdArray<f32>>::new(&device);
        let out = net.forward(Tensor::zeros([1, 3, 224, 224], &device));
        assert_eq!(out.dims(), [1, 256, 6, 6]);
    }
}
