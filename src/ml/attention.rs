// ============================================================
// Layer 5 — Spatial Attention
// ============================================================
// Additive attention over the locations of a feature grid,
// after Xu et al. (2015) and Lu et al. (2017):
//
//   e_l   = w · relu(W_img f_l + W_h h)       one logit per location
//   alpha = softmax_l(e)                       sums to 1 per example
//   ctx   = Σ_l alpha_l f_l
//
// Shapes:
//   features [B, L, C], hidden [B, H] → ctx [B, C], alpha [B, L]

use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::activation::{relu, softmax},
};

#[derive(Config, Debug)]
pub struct SpatialAttentionConfig {
    /// Channels C of one grid location
    pub feature_size: usize,
    pub hidden_size:  usize,
}

impl SpatialAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpatialAttention<B> {
        SpatialAttention {
            image_att:    LinearConfig::new(self.feature_size, self.hidden_size).init(device),
            lstm_att:     LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            combined_att: LinearConfig::new(self.hidden_size, 1).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct SpatialAttention<B: Backend> {
    pub image_att:    Linear<B>,
    pub lstm_att:     Linear<B>,
    pub combined_att: Linear<B>,
}

impl<B: Backend> SpatialAttention<B> {
    pub fn forward(&self, features: Tensor<B, 3>, hidden: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let att_img = self.image_att.forward(features.clone()); // [B, L, H]
        let att_h = self.lstm_att.forward(hidden).unsqueeze_dim::<3>(1); // [B, 1, H]

        let logits = self
            .combined_att
            .forward(relu(att_img + att_h))
            .squeeze_dim::<2>(2); // [B, L]
        let alphas = softmax(logits, 1);

        let context = (features * alphas.clone().unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .squeeze_dim::<2>(1); // [B, C]
        (context, alphas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_weights_are_a_distribution() {
        let device = Default::default();
        let att = SpatialAttentionConfig::new(6, 4).init::<TestBackend>(&device);
        let features = Tensor::<TestBackend, 3>::random([3, 5, 6], Distribution::Normal(0.0, 1.0), &device);
        let hidden = Tensor::<TestBackend, 2>::random([3, 4], Distribution::Normal(0.0, 1.0), &device);

        let (ctx, alphas) = att.forward(features, hidden);
        assert_eq!(ctx.dims(), [3, 6]);
        assert_eq!(alphas.dims(), [3, 5]);

        let sums: Vec<f32> = alphas.clone().sum_dim(1).into_data().to_vec().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        let values: Vec<f32> = alphas.into_data().to_vec().unwrap();
        assert!(values.iter().all(|&a| a >= 0.0));
    }

    #[test]
    fn test_context_of_identical_locations() {
        let device = Default::default();
        let att = SpatialAttentionConfig::new(2, 3).init::<TestBackend>(&device);
        // every location carries the same vector, so any weighting returns it
        let features = Tensor::<TestBackend, 3>::from_floats([[[1.0, -2.0], [1.0, -2.0], [1.0, -2.0]]], &device);
        let (ctx, _) = att.forward(features, Tensor::zeros([1, 3], &device));
        let v: Vec<f32> = ctx.into_data().to_vec().unwrap();
        assert!((v[0] - 1.0).abs() < 1e-5 && (v[1] + 2.0).abs() < 1e-5);
    }
}
