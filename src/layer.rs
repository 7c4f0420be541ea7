// layer.rs
// Description: Parameter storage and the Layer trait shared by every
//              parametrised component, plus the position-wise layers:
//              LayerNorm, FeedForward and the vocabulary OutputProjection.
//              Forward is &self and returns an explicit cache; backward is
//              &mut self, consumes the cache by reference and accumulates
//              parameter gradients. No optimizer state lives here.
// History:
// - 2026-10-16: Param with lazy accumulate-only gradients; LayerNorm, FeedForward.
// - 2026-10-16: Typed forward caches consumed by backward.
// - 2026-10-17: OutputProjection from model width to vocabulary logits.

use rand::Rng;

use crate::error::{EngineError, EngineResult};
use crate::math;
use crate::tensor::Tensor;

/// A trainable tensor and its lazily allocated gradient accumulator.
#[derive(Clone, Debug)]
pub struct Param {
    pub name: &'static str,
    pub value: Tensor,
    grad: Option<Tensor>,
}

impl Param {
    pub fn new(name: &'static str, value: Tensor) -> Self {
        Self {
            name,
            value,
            grad: None,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    /// `grad += delta`, allocating a zero gradient on first use.
    pub fn accumulate_grad(&mut self, delta: &Tensor) -> EngineResult<()> {
        delta.expect_shape(self.value.shape(), self.name)?;
        match self.grad.as_mut() {
            Some(grad) => math::add_assign(grad, delta),
            None => {
                let mut grad = Tensor::zeros(self.value.shape())?;
                math::add_assign(&mut grad, delta)?;
                self.grad = Some(grad);
                Ok(())
            }
        }
    }

    /// Resets the accumulator to zero, keeping the allocation.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.fill(0.0);
        }
    }

    /// Gradient accumulator, zero-allocated on first access.
    pub fn grad_mut(&mut self) -> EngineResult<&mut Tensor> {
        if self.grad.is_none() {
            self.grad = Some(Tensor::zeros(self.value.shape())?);
        }
        self.grad.as_mut().ok_or(EngineError::NullInput { context: self.name })
    }

    /// Split borrow for an optimizer step.
    pub fn value_and_grad_mut(&mut self) -> (&mut Tensor, Option<&Tensor>) {
        (&mut self.value, self.grad.as_ref())
    }
}

pub trait Layer {
    fn layer_type(&self) -> &str;

    // Deterministic order; checkpoints depend on it.
    fn params(&self) -> Vec<&Param>;
    fn params_mut(&mut self) -> Vec<&mut Param>;

    fn parameters(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    fn get_parameters_flat(&self) -> Vec<f32> {
        let mut v: Vec<f32> = Vec::with_capacity(self.parameters());
        for p in self.params() {
            v.extend_from_slice(p.value.data());
        }
        v
    }

    /// Unallocated gradients contribute zeros.
    fn get_gradients_flat(&self) -> Vec<f32> {
        let mut v: Vec<f32> = Vec::with_capacity(self.parameters());
        for p in self.params() {
            match p.grad() {
                Some(grad) => v.extend_from_slice(grad.data()),
                None => v.extend(std::iter::repeat(0.0).take(p.len())),
            }
        }
        v
    }

    /// Reads this layer's parameters from the front of `v_params` and returns
    /// how many values were consumed. Nothing is written when the buffer is short.
    fn set_parameters_flat(&mut self, v_params: &[f32]) -> EngineResult<usize> {
        let i_needed = self.parameters();
        if v_params.len() < i_needed {
            return Err(EngineError::shape(
                "set_parameters_flat",
                &[i_needed],
                &[v_params.len()],
            ));
        }
        let mut i_pos: usize = 0;
        for p in self.params_mut() {
            let i_len = p.len();
            p.value.data_mut().copy_from_slice(&v_params[i_pos..i_pos + i_len]);
            i_pos += i_len;
        }
        Ok(i_needed)
    }

    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }
}

/// He-style normal initialisation, `std = sqrt(2 / fan_in)`.
pub(crate) fn he_normal<R: Rng + ?Sized>(
    v_shape: &[usize],
    i_fan_in: usize,
    rng: &mut R,
) -> EngineResult<Tensor> {
    let d_std = (2.0 / (i_fan_in as f32).max(1.0)).sqrt();
    Tensor::random_normal(v_shape, d_std, rng)
}

pub struct LayerNorm {
    i_dim: usize,
    d_eps: f32,
    gamma: Param,
    beta: Param,
}

/// Per-vector statistics from a LayerNorm forward pass.
#[derive(Clone, Debug)]
pub struct LayerNormCache {
    pub input: Tensor,
    pub mean: Vec<f32>,
    pub variance: Vec<f32>,
    pub normalized: Tensor,
}

impl LayerNorm {
    pub fn new(i_dim: usize, d_eps: f32) -> EngineResult<Self> {
        if i_dim == 0 {
            return Err(EngineError::InvalidConfig("layer_norm dim must be positive".to_string()));
        }
        if !d_eps.is_finite() || d_eps <= 0.0 {
            return Err(EngineError::InvalidConfig(format!("layer_norm eps must be positive, got {d_eps}")));
        }
        Ok(Self {
            i_dim,
            d_eps,
            gamma: Param::new("layer_norm.gamma", Tensor::ones(&[i_dim])?),
            beta: Param::new("layer_norm.beta", Tensor::zeros(&[i_dim])?),
        })
    }

    pub fn dim(&self) -> usize {
        self.i_dim
    }

    pub fn gamma(&self) -> &Param {
        &self.gamma
    }

    pub fn beta(&self) -> &Param {
        &self.beta
    }

    /// Normalizes every vector along the last axis, then applies gamma/beta.
    pub fn forward(&self, input: &Tensor) -> EngineResult<(Tensor, LayerNormCache)> {
        if input.last_dim() != self.i_dim {
            return Err(EngineError::shape("layer_norm_forward", &[self.i_dim], &[input.last_dim()]));
        }
        let i_rows = input.len() / self.i_dim;
        let d_n = self.i_dim as f32;

        let mut normalized = Tensor::zeros(input.shape())?;
        let mut output = Tensor::zeros(input.shape())?;
        let mut v_mean: Vec<f32> = Vec::with_capacity(i_rows);
        let mut v_var: Vec<f32> = Vec::with_capacity(i_rows);

        let v_gamma = self.gamma.value.data();
        let v_beta = self.beta.value.data();

        for ((v_x, v_norm), v_out) in input
            .data()
            .chunks_exact(self.i_dim)
            .zip(normalized.data_mut().chunks_exact_mut(self.i_dim))
            .zip(output.data_mut().chunks_exact_mut(self.i_dim))
        {
            let d_mean = v_x.iter().sum::<f32>() / d_n;
            let d_var = v_x.iter().map(|&x| (x - d_mean) * (x - d_mean)).sum::<f32>() / d_n;
            let d_inv_std = 1.0 / (d_var + self.d_eps).sqrt();

            for i in 0..self.i_dim {
                v_norm[i] = (v_x[i] - d_mean) * d_inv_std;
                v_out[i] = v_gamma[i] * v_norm[i] + v_beta[i];
            }
            v_mean.push(d_mean);
            v_var.push(d_var);
        }

        Ok((
            output,
            LayerNormCache {
                input: input.clone(),
                mean: v_mean,
                variance: v_var,
                normalized,
            },
        ))
    }

    /// Exact LayerNorm gradient; accumulates into gamma and beta.
    pub fn backward(&mut self, cache: &LayerNormCache, grad_output: &Tensor) -> EngineResult<Tensor> {
        grad_output.expect_same_shape(&cache.input, "layer_norm_backward")?;
        let i_rows = cache.input.len() / self.i_dim;
        if cache.variance.len() != i_rows || cache.mean.len() != i_rows {
            return Err(EngineError::NullInput {
                context: "layer_norm_cache_stats",
            });
        }
        let d_n = self.i_dim as f32;

        let mut grad_input = Tensor::zeros(cache.input.shape())?;
        let mut grad_gamma = Tensor::zeros(&[self.i_dim])?;
        let mut grad_beta = Tensor::zeros(&[self.i_dim])?;
        let v_gamma = self.gamma.value.data();

        for (((v_g, v_norm), v_dx), &d_var) in grad_output
            .data()
            .chunks_exact(self.i_dim)
            .zip(cache.normalized.data().chunks_exact(self.i_dim))
            .zip(grad_input.data_mut().chunks_exact_mut(self.i_dim))
            .zip(cache.variance.iter())
        {
            let d_inv_std = 1.0 / (d_var + self.d_eps).sqrt();

            let mut d_sum_g = 0.0;
            let mut d_sum_gx = 0.0;
            for i in 0..self.i_dim {
                let d_scaled = v_g[i] * v_gamma[i];
                d_sum_g += d_scaled;
                d_sum_gx += d_scaled * v_norm[i];
            }
            let d_mean_g = d_sum_g / d_n;
            let d_mean_gx = d_sum_gx / d_n;

            for i in 0..self.i_dim {
                let d_scaled = v_g[i] * v_gamma[i];
                v_dx[i] = d_inv_std * (d_scaled - d_mean_g - v_norm[i] * d_mean_gx);
            }

            for (i, (d_dg, d_db)) in grad_gamma
                .data_mut()
                .iter_mut()
                .zip(grad_beta.data_mut().iter_mut())
                .enumerate()
            {
                *d_dg += v_g[i] * v_norm[i];
                *d_db += v_g[i];
            }
        }

        self.gamma.accumulate_grad(&grad_gamma)?;
        self.beta.accumulate_grad(&grad_beta)?;
        Ok(grad_input)
    }
}

impl Layer for LayerNorm {
    fn layer_type(&self) -> &str {
        "LayerNorm"
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.gamma, &self.beta]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

/// Position-wise `ReLU(x W1 + b1) W2 + b2`.
pub struct FeedForward {
    w1: Param,
    b1: Param,
    w2: Param,
    b2: Param,
}

#[derive(Clone, Debug)]
pub struct FeedForwardCache {
    pub input: Tensor,
    pub hidden_pre: Tensor,
    pub hidden: Tensor,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(i_model_dim: usize, i_ff_dim: usize, rng: &mut R) -> EngineResult<Self> {
        if i_model_dim == 0 || i_ff_dim == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "feed_forward dims must be positive, got {i_model_dim}x{i_ff_dim}"
            )));
        }
        Ok(Self {
            w1: Param::new("feed_forward.w1", he_normal(&[i_model_dim, i_ff_dim], i_model_dim, rng)?),
            b1: Param::new("feed_forward.b1", Tensor::zeros(&[i_ff_dim])?),
            w2: Param::new("feed_forward.w2", he_normal(&[i_ff_dim, i_model_dim], i_ff_dim, rng)?),
            b2: Param::new("feed_forward.b2", Tensor::zeros(&[i_model_dim])?),
        })
    }

    pub fn forward(&self, input: &Tensor) -> EngineResult<(Tensor, FeedForwardCache)> {
        let hidden_pre = math::add_bias_3d(&math::mul_3_2(input, &self.w1.value)?, &self.b1.value)?;
        let hidden = math::relu_forward(&hidden_pre);
        let output = math::add_bias_3d(&math::mul_3_2(&hidden, &self.w2.value)?, &self.b2.value)?;
        Ok((
            output,
            FeedForwardCache {
                input: input.clone(),
                hidden_pre,
                hidden,
            },
        ))
    }

    pub fn backward(&mut self, cache: &FeedForwardCache, grad_output: &Tensor) -> EngineResult<Tensor> {
        grad_output.expect_same_shape(&cache.input, "feed_forward_backward")?;

        let grad_w2 = math::weight_grad_3d(&cache.hidden, grad_output)?;
        let grad_b2 = math::bias_grad_3d(grad_output)?;
        let grad_hidden = math::mul_3_2_transposed(grad_output, &self.w2.value)?;

        let grad_hidden_pre = math::relu_backward(&grad_hidden, &cache.hidden_pre)?;
        let grad_w1 = math::weight_grad_3d(&cache.input, &grad_hidden_pre)?;
        let grad_b1 = math::bias_grad_3d(&grad_hidden_pre)?;
        let grad_input = math::mul_3_2_transposed(&grad_hidden_pre, &self.w1.value)?;

        self.w2.accumulate_grad(&grad_w2)?;
        self.b2.accumulate_grad(&grad_b2)?;
        self.w1.accumulate_grad(&grad_w1)?;
        self.b1.accumulate_grad(&grad_b1)?;
        Ok(grad_input)
    }
}

impl Layer for FeedForward {
    fn layer_type(&self) -> &str {
        "FeedForward"
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.w1, &self.b1, &self.w2, &self.b2]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w1, &mut self.b1, &mut self.w2, &mut self.b2]
    }
}

/// Final `x W_out + b_out` from model width to vocabulary logits.
pub struct OutputProjection {
    w_out: Param,
    b_out: Param,
}

#[derive(Clone, Debug)]
pub struct OutputProjectionCache {
    pub input: Tensor,
}

impl OutputProjection {
    pub fn new<R: Rng + ?Sized>(i_model_dim: usize, i_vocab_size: usize, rng: &mut R) -> EngineResult<Self> {
        if i_model_dim == 0 || i_vocab_size == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "output_projection dims must be positive, got {i_model_dim}x{i_vocab_size}"
            )));
        }
        Ok(Self {
            w_out: Param::new("output_projection.w_out", he_normal(&[i_model_dim, i_vocab_size], i_model_dim, rng)?),
            b_out: Param::new("output_projection.b_out", Tensor::zeros(&[i_vocab_size])?),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.b_out.len()
    }

    /// `[B, S, D]` activations to `[B, S, vocab]` logits.
    pub fn forward(&self, input: &Tensor) -> EngineResult<(Tensor, OutputProjectionCache)> {
        let logits = math::add_bias_3d(&math::mul_3_2(input, &self.w_out.value)?, &self.b_out.value)?;
        Ok((logits, OutputProjectionCache { input: input.clone() }))
    }

    pub fn backward(&mut self, cache: &OutputProjectionCache, grad_output: &Tensor) -> EngineResult<Tensor> {
        let (i_batch, i_seq, _) = cache.input.dims3("output_projection_cache")?;
        grad_output.expect_shape(&[i_batch, i_seq, self.vocab_size()], "output_projection_backward")?;

        let grad_w = math::weight_grad_3d(&cache.input, grad_output)?;
        let grad_b = math::bias_grad_3d(grad_output)?;
        let grad_input = math::mul_3_2_transposed(grad_output, &self.w_out.value)?;

        self.w_out.accumulate_grad(&grad_w)?;
        self.b_out.accumulate_grad(&grad_b)?;
        Ok(grad_input)
    }
}

impl Layer for OutputProjection {
    fn layer_type(&self) -> &str {
        "OutputProjection"
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.w_out, &self.b_out]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w_out, &mut self.b_out]
    }
}
