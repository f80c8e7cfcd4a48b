use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// Channel plan of VGG-16; 0 marks a 2x2 max pool.
const VGG16: [usize; 18] = [64, 64, 0, 128, 128, 0, 256, 256, 256, 0, 512, 512, 512, 0, 512, 512, 512, 0];

/// VGG-16 with its classifier; the last classifier layer is a
/// fresh 4096→4096 projection, so the output is [batch, 4096].
#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    pub convs:   Vec<Conv2d<B>>,
    pub pool:    MaxPool2d,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc1:     Linear<B>,
    pub fc2:     Linear<B>,
    pub fc3:     Linear<B>,
}

impl<B: Backend> Vgg16<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut c_in = 3;
        let mut convs = Vec::new();
        for &c_out in VGG16.iter().filter(|&&c| c > 0) {
            convs.push(
                Conv2dConfig::new([c_in, c_out], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            c_in = c_out;
        }
        Self {
            convs,
            pool:    MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            avgpool: AdaptiveAvgPool2dConfig::new([7, 7]).init(),
            fc1:     LinearConfig::new(512 * 7 * 7, 4096).init(device),
            fc2:     LinearConfig::new(4096, 4096).init(device),
            fc3:     LinearConfig::new(4096, 4096).init(device),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut convs = self.convs.iter();
        let mut x = images;
        for &c in VGG16.iter() {
            if c == 0 {
                x = self.pool.forward(x);
            } else if let Some(conv) = convs.next() {
                x = relu(conv.forward(x));
            }
        }
        let x = self.avgpool.forward(x).flatten::<2>(1, 3);
        let x = relu(self.fc1.forward(x));
        let x = relu(self.fc2.forward(x));
        self.fc3.forward(x)
    }
}
