// embedding.rs
// Description: Token lookup table, fixed sinusoidal positional table and the
//              combined embedding used on both the encoder and decoder side.
//              Token ids are i64 so that negative ids can be rejected rather
//              than wrapped.
// History:
// - 2026-10-16: Batched [B, S] lookup, id validation, sinusoidal positions,
//               scatter-add gradient accumulation.

use ndarray::Array2;
use rand::Rng;

use crate::error::{EngineError, EngineResult};
use crate::layer::{he_normal, Layer, Param};
use crate::tensor::Tensor;

/// Token ids seen by a forward pass, needed for the gradient scatter.
#[derive(Clone, Debug)]
pub struct EmbeddingCache {
    pub tokens: Array2<i64>,
}

pub struct TokenEmbedding {
    i_vocab_size: usize,
    i_model_dim: usize,
    // [vocab_size, model_dim]
    weight: Param,
}

impl TokenEmbedding {
    pub fn new<R: Rng + ?Sized>(i_vocab_size: usize, i_model_dim: usize, rng: &mut R) -> EngineResult<Self> {
        if i_vocab_size == 0 || i_model_dim == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "embedding dims must be positive, got {i_vocab_size}x{i_model_dim}"
            )));
        }
        Ok(Self {
            i_vocab_size,
            i_model_dim,
            weight: Param::new(
                "embedding.weight",
                he_normal(&[i_vocab_size, i_model_dim], i_vocab_size, rng)?,
            ),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.i_vocab_size
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    fn checked_index(&self, i_token_id: i64) -> EngineResult<usize> {
        usize::try_from(i_token_id)
            .ok()
            .filter(|&i| i < self.i_vocab_size)
            .ok_or(EngineError::InvalidTokenId {
                token_id: i_token_id,
                vocab_size: self.i_vocab_size,
            })
    }

    fn validate_tokens(&self, a_tokens: &Array2<i64>) -> EngineResult<Vec<usize>> {
        a_tokens.iter().map(|&i_id| self.checked_index(i_id)).collect()
    }

    /// Gathers one row per token: `[B, S] -> [B, S, D]`.
    pub fn forward(&self, a_tokens: &Array2<i64>) -> EngineResult<(Tensor, EmbeddingCache)> {
        let v_rows = self.validate_tokens(a_tokens)?;
        let (i_batch, i_seq) = a_tokens.dim();
        let i_d = self.i_model_dim;

        let mut out = Tensor::zeros(&[i_batch, i_seq, i_d])?;
        let v_weight = self.weight.value.data();
        for (v_out, &i_row) in out.data_mut().chunks_exact_mut(i_d).zip(v_rows.iter()) {
            v_out.copy_from_slice(&v_weight[i_row * i_d..(i_row + 1) * i_d]);
        }

        Ok((
            out,
            EmbeddingCache {
                tokens: a_tokens.clone(),
            },
        ))
    }

    /// Scatter-adds each position's gradient into its token's row.
    pub fn backward(&mut self, cache: &EmbeddingCache, grad_output: &Tensor) -> EngineResult<()> {
        let (i_batch, i_seq) = cache.tokens.dim();
        let i_d = self.i_model_dim;
        grad_output.expect_shape(&[i_batch, i_seq, i_d], "embedding_backward")?;
        let v_rows = self.validate_tokens(&cache.tokens)?;

        let grad = self.weight.grad_mut()?;
        let v_grad = grad.data_mut();
        for (v_g, &i_row) in grad_output.data().chunks_exact(i_d).zip(v_rows.iter()) {
            for (d_acc, &d) in v_grad[i_row * i_d..(i_row + 1) * i_d].iter_mut().zip(v_g.iter()) {
                *d_acc += d;
            }
        }
        Ok(())
    }
}

impl Layer for TokenEmbedding {
    fn layer_type(&self) -> &str {
        "TokenEmbedding"
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weight]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight]
    }
}

/// Fixed `[max_seq_len, D]` sinusoidal table; not trainable.
pub struct PositionalEncoding {
    i_max_seq_len: usize,
    i_model_dim: usize,
    table: Tensor,
}

impl PositionalEncoding {
    pub fn new(i_max_seq_len: usize, i_model_dim: usize) -> EngineResult<Self> {
        let mut table = Tensor::zeros(&[i_max_seq_len, i_model_dim])?;
        let v_table = table.data_mut();
        for p in 0..i_max_seq_len {
            for i in (0..i_model_dim).step_by(2) {
                let d_angle = p as f32 / 10000f32.powf(i as f32 / i_model_dim as f32);
                v_table[p * i_model_dim + i] = d_angle.sin();
                if i + 1 < i_model_dim {
                    v_table[p * i_model_dim + i + 1] = d_angle.cos();
                }
            }
        }
        Ok(Self {
            i_max_seq_len,
            i_model_dim,
            table,
        })
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn max_seq_len(&self) -> usize {
        self.i_max_seq_len
    }

    /// Adds rows `0..S` of the table to every batch entry of `[B, S, D]`.
    pub fn forward(&self, input: &Tensor) -> EngineResult<Tensor> {
        let (_, i_seq, i_d) = input.dims3("positional_forward")?;
        if i_d != self.i_model_dim {
            return Err(EngineError::shape("positional_forward", &[self.i_model_dim], &[i_d]));
        }
        if i_seq > self.i_max_seq_len {
            return Err(EngineError::shape("positional_seq_len", &[self.i_max_seq_len], &[i_seq]));
        }

        let mut out = input.clone();
        let i_block = i_seq * i_d;
        if i_block == 0 {
            return Ok(out);
        }
        let v_rows = &self.table.data()[..i_block];
        for v_seq in out.data_mut().chunks_exact_mut(i_block) {
            for (d_o, &d_p) in v_seq.iter_mut().zip(v_rows.iter()) {
                *d_o += d_p;
            }
        }
        Ok(out)
    }
}

/// Token lookup followed by the positional offset.
pub struct TransformerEmbedding {
    token: TokenEmbedding,
    positional: PositionalEncoding,
}

impl TransformerEmbedding {
    pub fn new<R: Rng + ?Sized>(
        i_vocab_size: usize,
        i_model_dim: usize,
        i_max_seq_len: usize,
        rng: &mut R,
    ) -> EngineResult<Self> {
        Ok(Self {
            token: TokenEmbedding::new(i_vocab_size, i_model_dim, rng)?,
            positional: PositionalEncoding::new(i_max_seq_len, i_model_dim)?,
        })
    }

    pub fn token(&self) -> &TokenEmbedding {
        &self.token
    }

    pub fn positional(&self) -> &PositionalEncoding {
        &self.positional
    }

    pub fn forward(&self, a_tokens: &Array2<i64>) -> EngineResult<(Tensor, EmbeddingCache)> {
        if a_tokens.ncols() > self.positional.max_seq_len() {
            return Err(EngineError::shape(
                "embedding_seq_len",
                &[self.positional.max_seq_len()],
                &[a_tokens.ncols()],
            ));
        }
        let (embedded, cache) = self.token.forward(a_tokens)?;
        Ok((self.positional.forward(&embedded)?, cache))
    }

    /// Positions are constant, so the gradient flows unchanged to the lookup.
    pub fn backward(&mut self, cache: &EmbeddingCache, grad_output: &Tensor) -> EngineResult<()> {
        self.token.backward(cache, grad_output)
    }

    pub(crate) fn positional_table_mut(&mut self) -> &mut Tensor {
        &mut self.positional.table
    }
}

impl Layer for TransformerEmbedding {
    fn layer_type(&self) -> &str {
        "TransformerEmbedding"
    }

    fn params(&self) -> Vec<&Param> {
        self.token.params()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.token.params_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tokens(i_batch: usize, v: &[i64]) -> Array2<i64> {
        Array2::from_shape_vec((i_batch, v.len() / i_batch), v.to_vec()).unwrap()
    }

    #[test]
    fn lookup_copies_rows() {
        let mut rng = StdRng::seed_from_u64(0);
        let emb = TokenEmbedding::new(5, 3, &mut rng).unwrap();
        let (out, cache) = emb.forward(&tokens(1, &[4, 0])).unwrap();
        assert_eq!(out.shape(), &[1, 2, 3]);
        assert_eq!(&out.data()[..3], &emb.weight().value.data()[12..15]);
        assert_eq!(&out.data()[3..], &emb.weight().value.data()[..3]);
        assert_eq!(cache.tokens, tokens(1, &[4, 0]));
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let emb = TokenEmbedding::new(5, 3, &mut rng).unwrap();
        let err = emb.forward(&tokens(1, &[1, 5])).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidTokenId {
                token_id: 5,
                vocab_size: 5
            }
        );
        assert!(emb.forward(&tokens(1, &[-1])).is_err());
    }

    #[test]
    fn backward_scatter_adds_repeated_tokens() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut emb = TokenEmbedding::new(4, 2, &mut rng).unwrap();
        let (_, cache) = emb.forward(&tokens(1, &[2, 2, 1])).unwrap();
        let g = Tensor::new(&[1, 3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        emb.backward(&cache, &g).unwrap();
        emb.backward(&cache, &g).unwrap();

        let grad = emb.weight().grad().unwrap();
        assert_eq!(grad.data(), &[0.0, 0.0, 10.0, 12.0, 8.0, 12.0, 0.0, 0.0]);
    }

    #[test]
    fn positional_table_values() {
        let pe = PositionalEncoding::new(4, 4).unwrap();
        let v_table = pe.table().data();
        // Position 0: sin(0) = 0, cos(0) = 1.
        assert_eq!(&v_table[..4], &[0.0, 1.0, 0.0, 1.0]);
        // Position 1, pair 0: angle 1.
        assert!((v_table[4] - 1f32.sin()).abs() < 1e-6);
        assert!((v_table[5] - 1f32.cos()).abs() < 1e-6);
        // Position 1, pair 1: angle 1 / 10000^(2/4) = 0.01.
        assert!((v_table[6] - 0.01f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn sequence_longer_than_table_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        let emb = TransformerEmbedding::new(10, 4, 2, &mut rng).unwrap();
        assert!(matches!(
            emb.forward(&tokens(1, &[1, 2, 3])),
            Err(EngineError::ShapeMismatch { .. })
        ));
        let (out, _) = emb.forward(&tokens(1, &[1, 2])).unwrap();
        let (raw, _) = emb.token().forward(&tokens(1, &[1, 2])).unwrap();
        let diff = math::add(&raw, &emb.positional().table().reshape(&[1, 2, 4]).unwrap()).unwrap();
        assert!(out.allclose(&diff, 1e-6));
    }
}
