//! Causal multi-head self-attention over (possibly adapted) projections

use candle_core::{DType, Device, Result, Tensor, D};

use crate::adapter::LoraLinear;

pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,

    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
}

impl MultiHeadAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        q_proj: LoraLinear,
        k_proj: LoraLinear,
        v_proj: LoraLinear,
        o_proj: LoraLinear,
    ) -> Self {
        Self {
            num_heads,
            head_dim: hidden_size / num_heads,
            hidden_size,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
        }
    }

    /// `mask` is additive and broadcastable to `(batch, heads, seq, seq)`.
    pub fn forward(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states, train)?;
        let k = self.k_proj.forward(hidden_states, train)?;
        let v = self.v_proj.forward(hidden_states, train)?;

        // (batch, seq, hidden) -> (batch, num_heads, seq, head_dim)
        let q = self.reshape_for_heads(&q)?;
        let k = self.reshape_for_heads(&k)?;
        let v = self.reshape_for_heads(&v)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = (q.matmul(&k_t)? / scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;

        // Plain-op softmax so gradients reach the projections
        let attn_probs = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = attn_probs.matmul(&v)?;

        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.hidden_size))?;

        self.o_proj.forward(&attn_output, train)
    }

    fn reshape_for_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

/// Additive mask: 0 where a query may attend, a large negative value elsewhere.
///
/// Output shape is `(batch, 1, seq, seq)` with padding applied, or
/// `(1, 1, seq, seq)` when no attention mask is given.
pub fn build_attention_mask(
    seq_len: usize,
    attention_mask: Option<&Tensor>,
    device: &Device,
) -> Result<Tensor> {
    let causal: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { MASKED } else { 0.0 }))
        .collect();
    let causal = Tensor::from_vec(causal, (1, 1, seq_len, seq_len), device)?;

    match attention_mask {
        Some(mask) => {
            let (batch_size, _) = mask.dims2()?;
            // 1 -> 0.0, 0 -> MASKED
            let padding = mask
                .to_dtype(DType::F32)?
                .affine(-(MASKED as f64), MASKED as f64)?
                .reshape((batch_size, 1, 1, seq_len))?;
            causal.broadcast_add(&padding)
        }
        None => Ok(causal),
    }
}

const MASKED: f32 = -1e9;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_shape_and_values() -> Result<()> {
        let device = Device::Cpu;
        let mask = build_attention_mask(3, None, &device)?;
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);

        let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0][0], 0.0);
        assert_eq!(rows[0][1], MASKED);
        assert_eq!(rows[2][1], 0.0);
        Ok(())
    }

    #[test]
    fn test_padding_is_masked() -> Result<()> {
        let device = Device::Cpu;
        let attention = Tensor::new(&[[1u32, 1, 0]], &device)?;
        let mask = build_attention_mask(3, Some(&attention), &device)?;
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);

        let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        // Last key is padding: masked even for the last query
        assert!(rows[2][2] < -1e8);
        assert_eq!(rows[2][0], 0.0);
        Ok(())
    }
}
