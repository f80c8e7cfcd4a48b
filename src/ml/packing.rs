// ============================================================
// Layer 5 — Packed Sequences
// ============================================================
// A packed sequence stores only the real (non-padding) steps of
// a length-sorted batch, time-major:
//
//   lengths = [5, 3]
//   t:        0  0  1  1  2  2  3  4
//   row:      0  1  0  1  0  1  0  0      → 8 entries
//
// batch_sizes[t] = #(lengths > t) is the number of rows still
// active at step t. It is non-increasing because the batcher
// sorts lengths in descending order; everything here relies on
// that, so unsorted lengths are rejected.

use anyhow::{bail, Result};
use burn::prelude::*;

/// Active rows per step; `len() == max(lengths)`.
pub fn batch_sizes(lengths: &[usize]) -> Result<Vec<usize>> {
    if lengths.windows(2).any(|w| w[0] < w[1]) {
        bail!("caption lengths must be sorted in descending order, got {lengths:?}");
    }
    let max_len = lengths.first().copied().unwrap_or(0);
    Ok((0..max_len)
        .map(|t| lengths.iter().take_while(|&&l| l > t).count())
        .collect())
}

/// Row indices into a `[batch * seq_len]` flattening, in packed order.
pub fn packed_indices(lengths: &[usize], seq_len: usize) -> Result<Vec<i64>> {
    let sizes = batch_sizes(lengths)?;
    if sizes.len() > seq_len {
        bail!("caption length {} exceeds padded length {seq_len}", sizes.len());
    }
    Ok(sizes
        .iter()
        .enumerate()
        .flat_map(|(t, &bt)| (0..bt).map(move |b| (b * seq_len + t) as i64))
        .collect())
}

/// [batch, seq, dim] → [sum(lengths), dim]
pub fn pack<B: Backend>(x: Tensor<B, 3>, lengths: &[usize]) -> Result<Tensor<B, 2>> {
    let [batch, seq, dim] = x.dims();
    let idx = index_tensor::<B>(&packed_indices(lengths, seq)?, &x.device());
    Ok(x.reshape([batch * seq, dim]).select(0, idx))
}

/// Packed targets: [batch, seq] ids → [sum(lengths)]
pub fn pack_ids<B: Backend>(ids: Tensor<B, 2, Int>, lengths: &[usize]) -> Result<Tensor<B, 1, Int>> {
    let [batch, seq] = ids.dims();
    let idx = index_tensor::<B>(&packed_indices(lengths, seq)?, &ids.device());
    Ok(ids.reshape([batch * seq]).select(0, idx))
}

fn index_tensor<B: Backend>(idx: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::from_data(TensorData::new(idx.to_vec(), [idx.len()]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_sizes_non_increasing() {
        let sizes = batch_sizes(&[5, 3]).unwrap();
        assert_eq!(sizes, vec![2, 2, 2, 1, 1]);
        assert_eq!(sizes.iter().sum::<usize>(), 8);
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_unsorted_lengths_rejected() {
        assert!(batch_sizes(&[3, 5]).is_err());
        assert!(batch_sizes(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_pack_ids_time_major() {
        let device = Default::default();
        let ids = Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::new(vec![10i64, 11, 12, 13, 14, 20, 21, 22, 0, 0], [2, 5]),
            &device,
        );
        let packed: Vec<i64> = pack_ids(ids, &[5, 3]).unwrap().into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(packed, vec![10, 20, 11, 21, 12, 22, 13, 14]);
    }

    #[test]
    fn test_pack_float_rows() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::from_data(
            TensorData::new((0..12).map(|v| v as f32).collect::<Vec<_>>(), [2, 3, 2]),
            &device,
        );
        let packed = pack(x, &[2, 1]).unwrap();
        assert_eq!(packed.dims(), [3, 2]);
        let v: Vec<f32> = packed.into_data().to_vec().unwrap();
        assert_eq!(v, vec![0.0, 1.0, 6.0, 7.0, 2.0, 3.0]);
    }
}
