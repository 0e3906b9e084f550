//! Batching, background prefetch and the causal LM loss

use candle_core::{Device, Tensor, D};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::mpsc::sync_channel;

use crate::tokenize::{TokenizedDataset, IGNORE_INDEX};

/// Record order for one epoch: dataset order, or a shuffle seeded by
/// `seed + epoch` so every epoch (and every resume) sees the same order.
pub fn epoch_order(len: usize, shuffle_seed: Option<u64>, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if let Some(seed) = shuffle_seed {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
    }
    order
}

/// Host-side micro-batch, flattened row-major.
///
/// Targets are already shifted: position `t` predicts `labels[t + 1]`.
/// Positions with nothing to predict carry weight 0.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    /// Batch index within the epoch
    pub index: usize,
    pub rows: usize,
    pub seq_len: usize,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub targets: Vec<u32>,
    pub loss_weights: Vec<f32>,
}

impl HostBatch {
    pub fn assemble(data: &TokenizedDataset, index: usize, rows: &[usize]) -> Self {
        let seq_len = data.max_length();
        let capacity = rows.len() * seq_len;
        let mut batch = HostBatch {
            index,
            rows: 0,
            seq_len,
            input_ids: Vec::with_capacity(capacity),
            attention_mask: Vec::with_capacity(capacity),
            targets: Vec::with_capacity(capacity),
            loss_weights: Vec::with_capacity(capacity),
        };

        for record in rows.iter().filter_map(|&i| data.get(i)) {
            batch.rows += 1;
            batch.input_ids.extend_from_slice(&record.input_ids);
            batch.attention_mask.extend_from_slice(&record.attention_mask);
            for t in 0..seq_len {
                match record.labels.get(t + 1) {
                    Some(&label) if label != IGNORE_INDEX && label >= 0 => {
                        batch.targets.push(label as u32);
                        batch.loss_weights.push(1.0);
                    }
                    _ => {
                        batch.targets.push(0);
                        batch.loss_weights.push(0.0);
                    }
                }
            }
        }
        batch
    }

    /// Number of positions contributing to the loss
    pub fn active_targets(&self) -> usize {
        self.loss_weights.iter().filter(|&&w| w > 0.0).count()
    }

    pub fn to_device(&self, device: &Device, contiguous: bool) -> candle_core::Result<DeviceBatch> {
        let shape = (self.rows, self.seq_len);
        let mut input_ids = Tensor::from_slice(&self.input_ids, shape, device)?;
        let mut attention_mask = Tensor::from_slice(&self.attention_mask, shape, device)?;
        if contiguous {
            input_ids = input_ids.contiguous()?;
            attention_mask = attention_mask.contiguous()?;
        }
        let n = self.rows * self.seq_len;
        Ok(DeviceBatch {
            input_ids,
            attention_mask,
            targets: Tensor::from_slice(&self.targets, (n, 1), device)?,
            loss_weights: Tensor::from_slice(&self.loss_weights, n, device)?,
            active_targets: self.active_targets(),
        })
    }
}

pub struct DeviceBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    /// `(rows * seq_len, 1)` u32
    pub targets: Tensor,
    /// `(rows * seq_len,)` f32
    pub loss_weights: Tensor,
    pub active_targets: usize,
}

/// Mean next-token cross-entropy over the weighted positions.
///
/// Built from log-softmax + gather so it backpropagates to the adapter.
pub fn compute_loss(logits: &Tensor, batch: &DeviceBatch) -> candle_core::Result<Tensor> {
    let (rows, seq_len, vocab) = logits.dims3()?;
    let logits = logits.reshape((rows * seq_len, vocab))?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&batch.targets, 1)?.squeeze(1)?;
    let weighted = picked.mul(&batch.loss_weights)?.sum_all()?;
    let denom = batch.active_targets.max(1) as f64;
    weighted.neg()? / denom
}

/// Assembles batches on a worker thread, `depth` batches ahead of the
/// consumer, in exactly the order given.
pub struct BatchPrefetcher<'a> {
    data: &'a TokenizedDataset,
    batch_size: usize,
    depth: usize,
}

impl<'a> BatchPrefetcher<'a> {
    pub fn new(data: &'a TokenizedDataset, batch_size: usize, depth: usize) -> Self {
        Self {
            data,
            batch_size: batch_size.max(1),
            depth: depth.max(1),
        }
    }

    /// Run `consume` over the batches of one epoch, skipping the first
    /// `skip` of them. The worker stops as soon as `consume` returns.
    pub fn epoch<T>(
        &self,
        order: &[usize],
        skip: usize,
        consume: impl FnOnce(&mut dyn Iterator<Item = HostBatch>) -> T,
    ) -> T {
        let data = self.data;
        let batch_size = self.batch_size;

        std::thread::scope(|scope| {
            let (sender, receiver) = sync_channel::<HostBatch>(self.depth);
            scope.spawn(move || {
                for (index, rows) in order.chunks(batch_size).enumerate().skip(skip) {
                    let batch = HostBatch::assemble(data, index, rows);
                    if sender.send(batch).is_err() {
                        break;
                    }
                }
            });

            let mut batches = receiver.into_iter();
            consume(&mut batches)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::TokenizedRecord;

    fn dataset(n: usize, len: usize) -> TokenizedDataset {
        let records = (0..n)
            .map(|i| {
                let ids: Vec<u32> = (0..len as u32).map(|t| (i as u32 * 10 + t) % 32).collect();
                let mut labels: Vec<i64> = ids.iter().map(|&x| x as i64).collect();
                labels[len - 1] = IGNORE_INDEX;
                TokenizedRecord {
                    attention_mask: vec![1; len],
                    input_ids: ids,
                    labels,
                }
            })
            .collect();
        TokenizedDataset::new(records, len).unwrap()
    }

    #[test]
    fn test_epoch_order() {
        assert_eq!(epoch_order(4, None, 3), vec![0, 1, 2, 3]);

        let a = epoch_order(16, Some(7), 0);
        assert_eq!(a, epoch_order(16, Some(7), 0));
        assert_ne!(a, epoch_order(16, Some(7), 1));
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_targets_are_shifted() {
        let data = dataset(1, 4);
        let batch = HostBatch::assemble(&data, 0, &[0]);

        // labels [0, 1, 2, IGNORE] -> targets [1, 2, -, -]
        assert_eq!(batch.targets[..2], [1, 2]);
        assert_eq!(batch.loss_weights, vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(batch.active_targets(), 2);
    }

    #[test]
    fn test_prefetch_order_and_skip() {
        let data = dataset(7, 3);
        let order = epoch_order(7, None, 0);
        let prefetcher = BatchPrefetcher::new(&data, 2, 1);

        let indices: Vec<usize> = prefetcher.epoch(&order, 1, |batches| batches.map(|b| b.index).collect());
        assert_eq!(indices, vec![1, 2, 3]);

        let rows: Vec<usize> = prefetcher.epoch(&order, 0, |batches| batches.map(|b| b.rows).collect());
        assert_eq!(rows, vec![2, 2, 2, 1]);
    }

    #[test]
    fn test_consumer_can_stop_early() {
        let data = dataset(40, 2);
        let order = epoch_order(40, None, 0);
        let prefetcher = BatchPrefetcher::new(&data, 1, 2);

        let first = prefetcher.epoch(&order, 0, |batches| batches.next().map(|b| b.index));
        assert_eq!(first, Some(0));
    }

    #[test]
    fn test_loss_is_finite_and_masked() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let data = dataset(2, 4);
        let batch = HostBatch::assemble(&data, 0, &[0, 1]).to_device(&device, true)?;

        // Uniform logits: loss = ln(vocab)
        let logits = Tensor::zeros((2, 4, 32), candle_core::DType::F32, &device)?;
        let loss = compute_loss(&logits, &batch)?.to_scalar::<f32>()?;
        assert!((loss - (32f32).ln()).abs() < 1e-5);
        Ok(())
    }
}
