use burn::prelude::*;

use crate::domain::forcing::StepInput;

/// Build the next decoder input from the ground-truth embedding and
/// the embedding of the model's own prediction. `predicted` is only
/// evaluated when the choice needs it.
pub fn next_input<B: Backend>(
    choice:       StepInput,
    ground_truth: Tensor<B, 2>,
    predicted:    impl FnOnce() -> Tensor<B, 2>,
) -> Tensor<B, 2> {
    match choice {
        StepInput::GroundTruth => ground_truth,
        StepInput::Predicted => predicted(),
        StepInput::Blend(p) => ground_truth.mul_scalar(p) + predicted().mul_scalar(1.0 - p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn pair() -> (Tensor<TestBackend, 2>, Tensor<TestBackend, 2>) {
        let device = Default::default();
        (
            Tensor::from_floats([[1.0, 2.0]], &device),
            Tensor::from_floats([[3.0, 6.0]], &device),
        )
    }

    #[test]
    fn test_ground_truth_never_touches_prediction() {
        let (gt, _) = pair();
        let out = next_input(StepInput::GroundTruth, gt, || panic!("prediction evaluated"));
        let v: Vec<f32> = out.into_data().to_vec().unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn test_predicted_and_blend() {
        let (gt, pred) = pair();
        let v: Vec<f32> = next_input(StepInput::Predicted, gt.clone(), || pred.clone())
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(v, vec![3.0, 6.0]);

        let v: Vec<f32> = next_input(StepInput::Blend(0.25), gt, || pred)
            .into_data()
            .to_vec()
            .unwrap();
        // 0.25 * gt + 0.75 * pred
        assert!((v[0] - 2.5).abs() < 1e-6);
        assert!((v[1] - 5.0).abs() < 1e-6);
    }
}
