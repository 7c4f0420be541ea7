// attention.rs
// Description: Multi-head scaled dot-product attention over [B, S, D]
//              activations, used as encoder self attention, masked decoder
//              self attention and decoder cross attention.
//              Full-width [D, D] projections are split into heads after the
//              projection; the backward pass returns input gradients and
//              commits all eight parameter gradients in one step.
// History:
// - 2026-10-16: Batched 4-D formulation, biases, cross attention, explicit masks.

use rand::Rng;

use crate::error::{EngineError, EngineResult};
use crate::layer::{he_normal, Layer, Param};
use crate::mask::AttentionMask;
use crate::math;
use crate::tensor::Tensor;

pub struct MultiHeadAttention {
    i_model_dim: usize,
    i_num_heads: usize,
    i_head_dim: usize,

    w_q: Param,
    b_q: Param,
    w_k: Param,
    b_k: Param,
    w_v: Param,
    b_v: Param,
    w_o: Param,
    b_o: Param,
}

/// Forward activations needed by the attention backward pass.
#[derive(Clone, Debug)]
pub struct AttentionCache {
    pub query_input: Tensor,
    pub key_value_input: Tensor,
    /// Per-head projections, `[B, H, S, Dh]`.
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Softmax output, `[B, H, Sq, Sk]`.
    pub weights: Tensor,
    /// Merged heads before the output projection, `[B, Sq, D]`.
    pub context: Tensor,
    pub b_self_attention: bool,
}

/// Input gradients of a cross-attention backward pass.
#[derive(Clone, Debug)]
pub struct AttentionGrads {
    pub grad_query: Tensor,
    pub grad_key_value: Tensor,
}

impl MultiHeadAttention {
    pub fn new<R: Rng + ?Sized>(i_model_dim: usize, i_num_heads: usize, rng: &mut R) -> EngineResult<Self> {
        if i_model_dim == 0 || i_num_heads == 0 {
            return Err(EngineError::InvalidConfig(
                "attention model_dim and num_heads must be positive".to_string(),
            ));
        }
        if i_model_dim % i_num_heads != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "attention model_dim {i_model_dim} not divisible by num_heads {i_num_heads}"
            )));
        }

        let v_w = [i_model_dim, i_model_dim];
        let v_b = [i_model_dim];
        Ok(Self {
            i_model_dim,
            i_num_heads,
            i_head_dim: i_model_dim / i_num_heads,
            w_q: Param::new("attention.w_q", he_normal(&v_w, i_model_dim, rng)?),
            b_q: Param::new("attention.b_q", Tensor::zeros(&v_b)?),
            w_k: Param::new("attention.w_k", he_normal(&v_w, i_model_dim, rng)?),
            b_k: Param::new("attention.b_k", Tensor::zeros(&v_b)?),
            w_v: Param::new("attention.w_v", he_normal(&v_w, i_model_dim, rng)?),
            b_v: Param::new("attention.b_v", Tensor::zeros(&v_b)?),
            w_o: Param::new("attention.w_o", he_normal(&v_w, i_model_dim, rng)?),
            b_o: Param::new("attention.b_o", Tensor::zeros(&v_b)?),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.i_num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.i_head_dim
    }

    fn scale(&self) -> f32 {
        1.0 / (self.i_head_dim as f32).sqrt()
    }

    pub fn forward_self(
        &self,
        input: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> EngineResult<(Tensor, AttentionCache)> {
        self.forward(input, input, mask, true)
    }

    pub fn forward_cross(
        &self,
        query_input: &Tensor,
        key_value_input: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> EngineResult<(Tensor, AttentionCache)> {
        self.forward(query_input, key_value_input, mask, false)
    }

    fn forward(
        &self,
        query_input: &Tensor,
        key_value_input: &Tensor,
        mask: Option<&AttentionMask>,
        b_self_attention: bool,
    ) -> EngineResult<(Tensor, AttentionCache)> {
        let (i_batch, _, i_dq) = query_input.dims3("attention_query")?;
        let (i_batch_kv, _, i_dkv) = key_value_input.dims3("attention_key_value")?;
        if i_dq != self.i_model_dim {
            return Err(EngineError::shape("attention_query", &[self.i_model_dim], &[i_dq]));
        }
        if i_dkv != self.i_model_dim || i_batch_kv != i_batch {
            return Err(EngineError::shape(
                "attention_key_value",
                &[i_batch, self.i_model_dim],
                &[i_batch_kv, i_dkv],
            ));
        }

        let q_proj = math::add_bias_3d(&math::mul_3_2(query_input, &self.w_q.value)?, &self.b_q.value)?;
        let k_proj = math::add_bias_3d(&math::mul_3_2(key_value_input, &self.w_k.value)?, &self.b_k.value)?;
        let v_proj = math::add_bias_3d(&math::mul_3_2(key_value_input, &self.w_v.value)?, &self.b_v.value)?;

        let q = math::reshape_3d_to_4d(&q_proj, self.i_num_heads)?;
        let k = math::reshape_3d_to_4d(&k_proj, self.i_num_heads)?;
        let v = math::reshape_3d_to_4d(&v_proj, self.i_num_heads)?;

        let mut scores = math::mul_4d_transpose(&q, &k, self.scale())?;
        if let Some(mask) = mask {
            mask.apply_inplace(&mut scores)?;
        }
        let weights = math::softmax_last_axis(&scores);

        let context = math::reshape_4d_to_3d(&math::matmul_4d(&weights, &v)?)?;
        let output = math::add_bias_3d(&math::mul_3_2(&context, &self.w_o.value)?, &self.b_o.value)?;

        log::trace!(
            "attention forward: self={} q={:?} kv={:?}",
            b_self_attention,
            query_input.shape(),
            key_value_input.shape()
        );

        Ok((
            output,
            AttentionCache {
                query_input: query_input.clone(),
                key_value_input: key_value_input.clone(),
                q,
                k,
                v,
                weights,
                context,
                b_self_attention,
            },
        ))
    }

    /// Backward for self attention; returns the gradient w.r.t. the single input.
    pub fn backward_self(
        &mut self,
        cache: &AttentionCache,
        grad_output: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> EngineResult<Tensor> {
        if !cache.b_self_attention {
            return Err(EngineError::InvalidConfig(
                "backward_self called with a cross-attention cache".to_string(),
            ));
        }
        let grads = self.backward(cache, grad_output, mask)?;
        math::add(&grads.grad_query, &grads.grad_key_value)
    }

    /// Backward for cross attention; query and key/value gradients stay separate.
    pub fn backward_cross(
        &mut self,
        cache: &AttentionCache,
        grad_output: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> EngineResult<AttentionGrads> {
        self.backward(cache, grad_output, mask)
    }

    fn backward(
        &mut self,
        cache: &AttentionCache,
        grad_output: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> EngineResult<AttentionGrads> {
        grad_output.expect_same_shape(&cache.query_input, "attention_backward")?;
        let d_scale = self.scale();

        // Output projection.
        let grad_w_o = math::weight_grad_3d(&cache.context, grad_output)?;
        let grad_b_o = math::bias_grad_3d(grad_output)?;
        let grad_context = math::mul_3_2_transposed(grad_output, &self.w_o.value)?;

        // Weighted sum over values.
        let grad_context_4d = math::reshape_3d_to_4d(&grad_context, self.i_num_heads)?;
        let grad_weights = math::mul_4d_transpose(&grad_context_4d, &cache.v, 1.0)?;
        let grad_v = math::matmul_4d_tn(&cache.weights, &grad_context_4d)?;

        // Softmax; blocked scores were constants in the forward pass.
        let mut grad_scores = math::softmax_backward_last_axis(&cache.weights, &grad_weights)?;
        if let Some(mask) = mask {
            mask.zero_blocked_inplace(&mut grad_scores)?;
        }

        // Scaled Q K^T.
        let grad_q = math::scale(&math::matmul_4d(&grad_scores, &cache.k)?, d_scale);
        let grad_k = math::scale(&math::matmul_4d_tn(&grad_scores, &cache.q)?, d_scale);

        // Input projections.
        let grad_q_proj = math::reshape_4d_to_3d(&grad_q)?;
        let grad_k_proj = math::reshape_4d_to_3d(&grad_k)?;
        let grad_v_proj = math::reshape_4d_to_3d(&grad_v)?;

        let grad_w_q = math::weight_grad_3d(&cache.query_input, &grad_q_proj)?;
        let grad_b_q = math::bias_grad_3d(&grad_q_proj)?;
        let grad_w_k = math::weight_grad_3d(&cache.key_value_input, &grad_k_proj)?;
        let grad_b_k = math::bias_grad_3d(&grad_k_proj)?;
        let grad_w_v = math::weight_grad_3d(&cache.key_value_input, &grad_v_proj)?;
        let grad_b_v = math::bias_grad_3d(&grad_v_proj)?;

        let grad_query = math::mul_3_2_transposed(&grad_q_proj, &self.w_q.value)?;
        let grad_key_value = math::add(
            &math::mul_3_2_transposed(&grad_k_proj, &self.w_k.value)?,
            &math::mul_3_2_transposed(&grad_v_proj, &self.w_v.value)?,
        )?;

        self.commit_grads([
            grad_w_q, grad_b_q, grad_w_k, grad_b_k, grad_w_v, grad_b_v, grad_w_o, grad_b_o,
        ])?;

        Ok(AttentionGrads {
            grad_query,
            grad_key_value,
        })
    }

    // Deltas in params() order. Validated as a whole before any accumulation.
    fn commit_grads(&mut self, v_deltas: [Tensor; 8]) -> EngineResult<()> {
        let mut v_params = self.params_mut();
        for (p, delta) in v_params.iter().zip(v_deltas.iter()) {
            delta.expect_shape(p.value.shape(), p.name)?;
        }
        for (p, delta) in v_params.iter_mut().zip(v_deltas.iter()) {
            p.accumulate_grad(delta)?;
        }
        Ok(())
    }
}

impl Layer for MultiHeadAttention {
    fn layer_type(&self) -> &str {
        "MultiHeadAttention"
    }

    fn params(&self) -> Vec<&Param> {
        vec![
            &self.w_q, &self.b_q, &self.w_k, &self.b_k, &self.w_v, &self.b_v, &self.w_o, &self.b_o,
        ]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![
            &mut self.w_q,
            &mut self.b_q,
            &mut self.w_k,
            &mut self.b_k,
            &mut self.w_v,
            &mut self.b_v,
            &mut self.w_o,
            &mut self.b_o,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample(v_shape: &[usize], d_phase: f32) -> Tensor {
        let i_len: usize = v_shape.iter().product();
        Tensor::new(v_shape, (0..i_len).map(|i| (i as f32 * 0.37 + d_phase).sin()).collect()).unwrap()
    }

    #[test]
    fn rejects_indivisible_heads() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            MultiHeadAttention::new(6, 4, &mut rng),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cross_attention_shapes_with_different_lengths() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut mha = MultiHeadAttention::new(8, 2, &mut rng).unwrap();
        assert_eq!(mha.parameters(), 4 * (8 * 8 + 8));

        let q = sample(&[2, 3, 8], 0.0);
        let kv = sample(&[2, 5, 8], 1.0);
        let (y, cache) = mha.forward_cross(&q, &kv, None).unwrap();
        assert_eq!(y.shape(), &[2, 3, 8]);
        assert_eq!(cache.weights.shape(), &[2, 2, 3, 5]);

        let grads = mha.backward_cross(&cache, &Tensor::ones(&[2, 3, 8]).unwrap(), None).unwrap();
        assert_eq!(grads.grad_query.shape(), &[2, 3, 8]);
        assert_eq!(grads.grad_key_value.shape(), &[2, 5, 8]);
        assert!(mha.params().iter().all(|p| p.grad().is_some()));
    }

    #[test]
    fn attention_weights_rows_sum_to_one_under_mask() {
        let mut rng = StdRng::seed_from_u64(4);
        let mha = MultiHeadAttention::new(4, 2, &mut rng).unwrap();
        let mask = AttentionMask::causal(3).unwrap();
        let (_, cache) = mha.forward_self(&sample(&[1, 3, 4], 0.5), Some(&mask)).unwrap();
        for v_row in cache.weights.data().chunks(3) {
            assert!((v_row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        // Row 0 only attends to key 0.
        assert!((cache.weights.data()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn backward_self_rejects_cross_cache() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut mha = MultiHeadAttention::new(4, 1, &mut rng).unwrap();
        let (_, cache) = mha
            .forward_cross(&sample(&[1, 2, 4], 0.0), &sample(&[1, 2, 4], 0.3), None)
            .unwrap();
        assert!(mha.backward_self(&cache, &Tensor::ones(&[1, 2, 4]).unwrap(), None).is_err());
    }

    #[test]
    fn failed_backward_commits_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut mha = MultiHeadAttention::new(4, 2, &mut rng).unwrap();
        let (_, cache) = mha.forward_self(&sample(&[1, 2, 4], 0.0), None).unwrap();
        let bad_mask = AttentionMask::causal(5).unwrap();
        let res = mha.backward_self(&cache, &Tensor::ones(&[1, 2, 4]).unwrap(), Some(&bad_mask));
        assert!(res.is_err());
        assert!(mha.params().iter().all(|p| p.grad().is_none()));
    }
}
