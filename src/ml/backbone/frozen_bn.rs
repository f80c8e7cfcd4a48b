use burn::{
    module::{Param, RunningState},
    prelude::*,
};

/// Batch norm that always normalises with its running statistics,
/// in training and inference alike. Pretrained backbones use it so
/// that small caption batches never shift the ImageNet statistics.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm2d<B: Backend> {
    pub gamma:        Param<Tensor<B, 1>>,
    pub beta:         Param<Tensor<B, 1>>,
    pub running_mean: RunningState<Tensor<B, 1>>,
    pub running_var:  RunningState<Tensor<B, 1>>,
    pub epsilon:      f64,
}

impl<B: Backend> FrozenBatchNorm2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            gamma:        Param::from_tensor(Tensor::ones([channels], device)),
            beta:         Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: RunningState::new(Tensor::zeros([channels], device)),
            running_var:  RunningState::new(Tensor::ones([channels], device)),
            epsilon:      1e-5,
        }
    }

    /// x: [batch, channels, height, width]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        let channels = x.dims()[1];
        let shape = [1, channels, 1, 1];

        let mean = self.running_mean.value().to_device(&device).reshape(shape);
        let std = self
            .running_var
            .value()
            .to_device(&device)
            .add_scalar(self.epsilon)
            .sqrt()
            .reshape(shape);

        x.sub(mean)
            .div(std)
            .mul(self.gamma.val().reshape(shape))
            .add(self.beta.val().reshape(shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    #[test]
    fn test_identity_with_default_statistics() {
        let device = Default::default();
        let bn = FrozenBatchNorm2d::<NdArray<f32>>::new(2, &device);
        let x = Tensor::<NdArray<f32>, 4>::random([3, 2, 2, 2], burn::tensor::Distribution::Default, &device);
        let y = bn.forward(x.clone());
        y.into_data().assert_approx_eq::<f32>(&x.into_data(), burn::tensor::Tolerance::absolute(1e-3));
    }

    #[test]
    fn test_training_backend_keeps_running_stats() {
        let device = Default::default();
        let bn = FrozenBatchNorm2d::<Autodiff<NdArray<f32>>>::new(1, &device);
        let x = Tensor::<Autodiff<NdArray<f32>>, 4>::full([4, 1, 2, 2], 3.0, &device);
        let _ = bn.forward(x);
        let mean: Vec<f32> = bn.running_mean.value().into_data().to_vec().unwrap();
        assert_eq!(mean, vec![0.0]);
    }
}
