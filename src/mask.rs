// mask.rs
// Description: Attention masks (1.0 = attend, 0.0 = block) and their
//              application to attention scores and score gradients.
//              Masks are immutable after construction and broadcast over
//              the batch and head axes of [B, H, Sq, Sk] score tensors.
// History:
// - 2026-10-16: Causal, padding and target masks with broadcasting AND.

use ndarray::Array2;

use crate::error::{EngineError, EngineResult};
use crate::tensor::Tensor;

/// Score written at blocked positions. Finite so that a fully blocked row
/// still yields a valid (uniform) softmax instead of NaN.
pub const MASK_VALUE: f32 = -1e9;

#[derive(Clone, Debug, PartialEq)]
pub struct AttentionMask {
    i_seq_length: usize,
    mask: Tensor,
}

impl AttentionMask {
    /// Wraps a `[Sq,Sk]`, `[B,Sq,Sk]` or `[B,H,Sq,Sk]` tensor of 0/1 values.
    pub fn new(mask: Tensor) -> EngineResult<Self> {
        if mask.ndim() < 2 {
            return Err(EngineError::shape("attention_mask_rank", &[0, 0], mask.shape()));
        }
        Ok(Self {
            i_seq_length: mask.last_dim(),
            mask,
        })
    }

    /// Lower-triangular `[S,S]` mask including the diagonal.
    pub fn causal(i_seq_len: usize) -> EngineResult<Self> {
        let mut mask = Tensor::zeros(&[i_seq_len, i_seq_len])?;
        let v_data = mask.data_mut();
        for i in 0..i_seq_len {
            for j in 0..=i {
                v_data[i * i_seq_len + j] = 1.0;
            }
        }
        Self::new(mask)
    }

    /// `[B,H,Sq,Sk]` mask that blocks every key position holding `i_pad_id`.
    pub fn padding(
        a_q_tokens: &Array2<i64>,
        a_k_tokens: &Array2<i64>,
        i_num_heads: usize,
        i_pad_id: i64,
    ) -> EngineResult<Self> {
        let (i_batch, i_sq) = a_q_tokens.dim();
        let (i_batch_k, i_sk) = a_k_tokens.dim();
        if i_batch != i_batch_k {
            return Err(EngineError::shape("padding_mask_batch", &[i_batch, i_sk], &[i_batch_k, i_sk]));
        }
        if i_num_heads == 0 {
            return Err(EngineError::InvalidConfig("padding mask needs at least one head".to_string()));
        }

        let mut mask = Tensor::zeros(&[i_batch, i_num_heads, i_sq, i_sk])?;
        let v_data = mask.data_mut();
        for b in 0..i_batch {
            for h in 0..i_num_heads {
                for i in 0..i_sq {
                    let i_row = ((b * i_num_heads + h) * i_sq + i) * i_sk;
                    for j in 0..i_sk {
                        if a_k_tokens[[b, j]] != i_pad_id {
                            v_data[i_row + j] = 1.0;
                        }
                    }
                }
            }
        }
        Self::new(mask)
    }

    /// Decoder self-attention mask: causal AND key padding.
    pub fn target(a_tokens: &Array2<i64>, i_num_heads: usize, i_pad_id: i64) -> EngineResult<Self> {
        let causal = Self::causal(a_tokens.ncols())?;
        let padding = Self::padding(a_tokens, a_tokens, i_num_heads, i_pad_id)?;
        causal.and(&padding)
    }

    pub fn seq_length(&self) -> usize {
        self.i_seq_length
    }

    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }

    pub fn shape(&self) -> &[usize] {
        self.mask.shape()
    }

    fn query_len(&self) -> usize {
        let v_shape = self.mask.shape();
        v_shape[v_shape.len() - 2]
    }

    // Flat index into the mask for score position (b, h, i, j).
    fn offset(&self, b: usize, h: usize, i: usize, j: usize) -> usize {
        let i_sq = self.query_len();
        let i_sk = self.i_seq_length;
        match self.mask.shape() {
            [_, _] => i * i_sk + j,
            [_, _, _] => (b * i_sq + i) * i_sk + j,
            [_, i_heads, _, _] => ((b * i_heads + h) * i_sq + i) * i_sk + j,
            _ => 0,
        }
    }

    pub fn is_blocked(&self, b: usize, h: usize, i: usize, j: usize) -> bool {
        self.mask.data().get(self.offset(b, h, i, j)).copied().unwrap_or(0.0) == 0.0
    }

    /// Checks that the mask broadcasts onto a `[B,H,Sq,Sk]` score tensor.
    pub fn check_scores(&self, v_scores_shape: &[usize]) -> EngineResult<()> {
        let (i_batch, i_heads, i_sq, i_sk) = match v_scores_shape {
            [b, h, q, k] => (*b, *h, *q, *k),
            _ => return Err(EngineError::shape("mask_scores_rank", &[0, 0, 0, 0], v_scores_shape)),
        };
        let v_expected: Vec<usize> = match self.mask.ndim() {
            2 => vec![i_sq, i_sk],
            3 => vec![i_batch, i_sq, i_sk],
            _ => vec![i_batch, i_heads, i_sq, i_sk],
        };
        if self.mask.shape() != v_expected.as_slice() {
            return Err(EngineError::shape("mask_scores", &v_expected, self.mask.shape()));
        }
        Ok(())
    }

    /// Writes `MASK_VALUE` into every blocked score position.
    pub fn apply_inplace(&self, scores: &mut Tensor) -> EngineResult<()> {
        self.for_each_blocked(scores, MASK_VALUE)
    }

    /// Zeroes score gradients at blocked positions.
    pub fn zero_blocked_inplace(&self, grad_scores: &mut Tensor) -> EngineResult<()> {
        self.for_each_blocked(grad_scores, 0.0)
    }

    fn for_each_blocked(&self, target: &mut Tensor, d_value: f32) -> EngineResult<()> {
        self.check_scores(target.shape())?;
        let (i_batch, i_heads, i_sq, i_sk) = target.dims4("mask_target")?;
        let v_target = target.data_mut();
        for b in 0..i_batch {
            for h in 0..i_heads {
                for i in 0..i_sq {
                    let i_row = ((b * i_heads + h) * i_sq + i) * i_sk;
                    for j in 0..i_sk {
                        if self.is_blocked(b, h, i, j) {
                            v_target[i_row + j] = d_value;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Elementwise AND. A 2-D mask broadcasts over the batch (and head) axes
    /// of the other operand; a 3-D mask broadcasts over the head axis.
    pub fn and(&self, other: &AttentionMask) -> EngineResult<AttentionMask> {
        let (wide, narrow) = if self.mask.ndim() >= other.mask.ndim() {
            (self, other)
        } else {
            (other, self)
        };

        let v_shape = wide.mask.shape().to_vec();
        let (i_batch, i_heads, i_sq, i_sk) = match v_shape.as_slice() {
            [q, k] => (1, 1, *q, *k),
            [b, q, k] => (*b, 1, *q, *k),
            [b, h, q, k] => (*b, *h, *q, *k),
            _ => return Err(EngineError::shape("mask_and", &[0, 0], &v_shape)),
        };
        if narrow.query_len() != i_sq || narrow.i_seq_length != i_sk {
            return Err(EngineError::shape("mask_and", &[i_sq, i_sk], narrow.mask.shape()));
        }
        if narrow.mask.ndim() >= 3 && narrow.mask.shape()[0] != i_batch {
            return Err(EngineError::shape("mask_and_batch", &[i_batch], &narrow.mask.shape()[..1]));
        }
        if narrow.mask.ndim() == 4 && narrow.mask.shape() != v_shape.as_slice() {
            return Err(EngineError::shape("mask_and_heads", &v_shape, narrow.mask.shape()));
        }

        let mut out = Tensor::zeros(&v_shape)?;
        let v_out = out.data_mut();
        for b in 0..i_batch {
            for h in 0..i_heads {
                for i in 0..i_sq {
                    let i_row = ((b * i_heads + h) * i_sq + i) * i_sk;
                    for j in 0..i_sk {
                        if !wide.is_blocked(b, h, i, j) && !narrow.is_blocked(b, h, i, j) {
                            v_out[i_row + j] = 1.0;
                        }
                    }
                }
            }
        }
        AttentionMask::new(out)
    }
}

/// Returns a copy of `scores` with blocked positions set to `MASK_VALUE`.
pub fn apply_mask(scores: &Tensor, mask: &AttentionMask) -> EngineResult<Tensor> {
    let mut out = scores.clone();
    mask.apply_inplace(&mut out)?;
    Ok(out)
}
