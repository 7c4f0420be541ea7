// math.rs
// Description: Tensor operators and their paired backward helpers.
//              Matmul families (2-D, 3-D, 4-D and the transposed variants
//              used by attention backward), per-token projection, bias add,
//              head split/merge, softmax, ReLU and dropout.
//              Every op validates shapes up front and returns a fresh tensor;
//              the only in-place ops are add_assign and scale_inplace, which
//              require identical shapes.
// History:
// - 2026-10-16: Batched 2-D/3-D/4-D matmul, softmax, ReLU on Tensor.
// - 2026-10-16: Dropout returns an explicit keep-mask for backward.
// - 2026-10-17: Dropout backward reads the mask through DropoutMask::kept.

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};
use rand::Rng;

use crate::config::{validate_dropout_prob, RunContext};
use crate::error::{EngineError, EngineResult};
use crate::tensor::Tensor;

#[derive(Clone, Copy)]
struct GemmSpec {
    a_dims: (usize, usize),
    b_dims: (usize, usize),
    b_trans_a: bool,
    b_trans_b: bool,
    out_dims: (usize, usize),
    d_alpha: f32,
}

// out = alpha * op(a) . op(b), where a/b/out are row-major blocks.
fn gemm_block(v_a: &[f32], v_b: &[f32], v_out: &mut [f32], spec: GemmSpec) -> EngineResult<()> {
    let a_view = ArrayView2::from_shape(spec.a_dims, v_a)?;
    let b_view = ArrayView2::from_shape(spec.b_dims, v_b)?;
    let mut a_out = ArrayViewMut2::from_shape(spec.out_dims, v_out)?;

    let a_op = if spec.b_trans_a { a_view.reversed_axes() } else { a_view };
    let b_op = if spec.b_trans_b { b_view.reversed_axes() } else { b_view };

    general_mat_mul(spec.d_alpha, &a_op, &b_op, 0.0, &mut a_out);
    Ok(())
}

fn batched_gemm(
    a: &Tensor,
    b: &Tensor,
    v_out_shape: &[usize],
    i_batches: usize,
    spec: GemmSpec,
) -> EngineResult<Tensor> {
    let mut out = Tensor::zeros(v_out_shape)?;

    let i_a_block = spec.a_dims.0 * spec.a_dims.1;
    let i_b_block = spec.b_dims.0 * spec.b_dims.1;
    let i_out_block = spec.out_dims.0 * spec.out_dims.1;
    if i_batches == 0 || i_a_block == 0 || i_b_block == 0 || i_out_block == 0 {
        return Ok(out);
    }

    for ((v_a, v_b), v_out) in a
        .data()
        .chunks_exact(i_a_block)
        .zip(b.data().chunks_exact(i_b_block))
        .zip(out.data_mut().chunks_exact_mut(i_out_block))
    {
        gemm_block(v_a, v_b, v_out, spec)?;
    }
    Ok(out)
}

/// `A[M,K] . B[K,N] -> [M,N]`
pub fn matmul_2d(a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    let (i_m, i_k) = a.dims2("matmul_2d_lhs")?;
    let (i_k2, i_n) = b.dims2("matmul_2d_rhs")?;
    if i_k != i_k2 {
        return Err(EngineError::shape("matmul_2d", &[i_k, i_n], b.shape()));
    }
    batched_gemm(
        a,
        b,
        &[i_m, i_n],
        1,
        GemmSpec {
            a_dims: (i_m, i_k),
            b_dims: (i_k, i_n),
            b_trans_a: false,
            b_trans_b: false,
            out_dims: (i_m, i_n),
            d_alpha: 1.0,
        },
    )
}

/// `A[B,M,K] . B[B,K,N] -> [B,M,N]`, one 2-D product per batch index.
pub fn matmul_3d(a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    let (i_batch, i_m, i_k) = a.dims3("matmul_3d_lhs")?;
    let (i_batch2, i_k2, i_n) = b.dims3("matmul_3d_rhs")?;
    if i_batch != i_batch2 || i_k != i_k2 {
        return Err(EngineError::shape("matmul_3d", &[i_batch, i_k, i_n], b.shape()));
    }
    batched_gemm(
        a,
        b,
        &[i_batch, i_m, i_n],
        i_batch,
        GemmSpec {
            a_dims: (i_m, i_k),
            b_dims: (i_k, i_n),
            b_trans_a: false,
            b_trans_b: false,
            out_dims: (i_m, i_n),
            d_alpha: 1.0,
        },
    )
}

/// `A[B,H,M,K] . B[B,H,K,N] -> [B,H,M,N]`, one 2-D product per (batch, head).
pub fn matmul_4d(a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    let (i_batch, i_heads, i_m, i_k) = a.dims4("matmul_4d_lhs")?;
    let (i_batch2, i_heads2, i_k2, i_n) = b.dims4("matmul_4d_rhs")?;
    if i_batch != i_batch2 || i_heads != i_heads2 || i_k != i_k2 {
        return Err(EngineError::shape(
            "matmul_4d",
            &[i_batch, i_heads, i_k, i_n],
            b.shape(),
        ));
    }
    batched_gemm(
        a,
        b,
        &[i_batch, i_heads, i_m, i_n],
        i_batch * i_heads,
        GemmSpec {
            a_dims: (i_m, i_k),
            b_dims: (i_k, i_n),
            b_trans_a: false,
            b_trans_b: false,
            out_dims: (i_m, i_n),
            d_alpha: 1.0,
        },
    )
}

/// `A[B,H,K,M]^T . B[B,H,K,N] -> [B,H,M,N]`.
pub fn matmul_4d_tn(a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    let (i_batch, i_heads, i_k, i_m) = a.dims4("matmul_4d_tn_lhs")?;
    let (i_batch2, i_heads2, i_k2, i_n) = b.dims4("matmul_4d_tn_rhs")?;
    if i_batch != i_batch2 || i_heads != i_heads2 || i_k != i_k2 {
        return Err(EngineError::shape(
            "matmul_4d_tn",
            &[i_batch, i_heads, i_k, i_n],
            b.shape(),
        ));
    }
    batched_gemm(
        a,
        b,
        &[i_batch, i_heads, i_m, i_n],
        i_batch * i_heads,
        GemmSpec {
            a_dims: (i_k, i_m),
            b_dims: (i_k, i_n),
            b_trans_a: true,
            b_trans_b: false,
            out_dims: (i_m, i_n),
            d_alpha: 1.0,
        },
    )
}

/// `scale * Q[B,H,Sq,Dh] . K[B,H,Sk,Dh]^T -> [B,H,Sq,Sk]`.
pub fn mul_4d_transpose(q: &Tensor, k: &Tensor, d_scale: f32) -> EngineResult<Tensor> {
    let (i_batch, i_heads, i_sq, i_dh) = q.dims4("mul_4d_transpose_q")?;
    let (i_batch2, i_heads2, i_sk, i_dh2) = k.dims4("mul_4d_transpose_k")?;
    if i_batch != i_batch2 || i_heads != i_heads2 || i_dh != i_dh2 {
        return Err(EngineError::shape(
            "mul_4d_transpose",
            &[i_batch, i_heads, i_sk, i_dh],
            k.shape(),
        ));
    }
    batched_gemm(
        q,
        k,
        &[i_batch, i_heads, i_sq, i_sk],
        i_batch * i_heads,
        GemmSpec {
            a_dims: (i_sq, i_dh),
            b_dims: (i_sk, i_dh),
            b_trans_a: false,
            b_trans_b: true,
            out_dims: (i_sq, i_sk),
            d_alpha: d_scale,
        },
    )
}

/// Per-token projection without bias: `input[B,S,D] . weight[D,N] -> [B,S,N]`.
pub fn mul_3_2(input: &Tensor, weight: &Tensor) -> EngineResult<Tensor> {
    let (i_batch, i_seq, i_d) = input.dims3("mul_3_2_input")?;
    let (i_d2, i_n) = weight.dims2("mul_3_2_weight")?;
    if i_d != i_d2 {
        return Err(EngineError::shape("mul_3_2", &[i_d, i_n], weight.shape()));
    }
    batched_gemm(
        input,
        weight,
        &[i_batch, i_seq, i_n],
        1,
        GemmSpec {
            a_dims: (i_batch * i_seq, i_d),
            b_dims: (i_d, i_n),
            b_trans_a: false,
            b_trans_b: false,
            out_dims: (i_batch * i_seq, i_n),
            d_alpha: 1.0,
        },
    )
}

/// Input gradient of `mul_3_2`: `grad[B,S,N] . weight[D,N]^T -> [B,S,D]`.
pub fn mul_3_2_transposed(grad: &Tensor, weight: &Tensor) -> EngineResult<Tensor> {
    let (i_batch, i_seq, i_n) = grad.dims3("mul_3_2_transposed_grad")?;
    let (i_d, i_n2) = weight.dims2("mul_3_2_transposed_weight")?;
    if i_n != i_n2 {
        return Err(EngineError::shape("mul_3_2_transposed", &[i_d, i_n], weight.shape()));
    }
    batched_gemm(
        grad,
        weight,
        &[i_batch, i_seq, i_d],
        1,
        GemmSpec {
            a_dims: (i_batch * i_seq, i_n),
            b_dims: (i_d, i_n),
            b_trans_a: false,
            b_trans_b: true,
            out_dims: (i_batch * i_seq, i_d),
            d_alpha: 1.0,
        },
    )
}

/// Weight gradient of `mul_3_2`: `sum_b input_b^T . grad_b -> [D,N]`.
pub fn weight_grad_3d(input: &Tensor, grad: &Tensor) -> EngineResult<Tensor> {
    let (i_batch, i_seq, i_d) = input.dims3("weight_grad_3d_input")?;
    let (i_batch2, i_seq2, i_n) = grad.dims3("weight_grad_3d_grad")?;
    if i_batch != i_batch2 || i_seq != i_seq2 {
        return Err(EngineError::shape("weight_grad_3d", &[i_batch, i_seq, i_n], grad.shape()));
    }
    batched_gemm(
        input,
        grad,
        &[i_d, i_n],
        1,
        GemmSpec {
            a_dims: (i_batch * i_seq, i_d),
            b_dims: (i_batch * i_seq, i_n),
            b_trans_a: true,
            b_trans_b: false,
            out_dims: (i_d, i_n),
            d_alpha: 1.0,
        },
    )
}

/// Bias gradient: sum of `grad[B,S,N]` over batch and sequence.
pub fn bias_grad_3d(grad: &Tensor) -> EngineResult<Tensor> {
    let (_, _, i_n) = grad.dims3("bias_grad_3d")?;
    let mut out = Tensor::zeros(&[i_n])?;
    if i_n == 0 {
        return Ok(out);
    }
    let v_out = out.data_mut();
    for v_row in grad.data().chunks_exact(i_n) {
        for (d_acc, &d_g) in v_out.iter_mut().zip(v_row.iter()) {
            *d_acc += d_g;
        }
    }
    Ok(out)
}

pub fn add(a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    a.expect_same_shape(b, "add")?;
    let mut out = a.clone();
    for (d_o, &d_b) in out.data_mut().iter_mut().zip(b.data().iter()) {
        *d_o += d_b;
    }
    Ok(out)
}

/// In-place `dst += src`; identical shapes required, `dst` untouched otherwise.
pub fn add_assign(dst: &mut Tensor, src: &Tensor) -> EngineResult<()> {
    dst.expect_same_shape(src, "add_assign")?;
    for (d_o, &d_s) in dst.data_mut().iter_mut().zip(src.data().iter()) {
        *d_o += d_s;
    }
    Ok(())
}

/// `input[B,S,D] + bias[D]` broadcast over batch and sequence.
pub fn add_bias_3d(input: &Tensor, bias: &Tensor) -> EngineResult<Tensor> {
    let (_, _, i_d) = input.dims3("add_bias_3d_input")?;
    bias.expect_shape(&[i_d], "add_bias_3d_bias")?;
    let mut out = input.clone();
    if i_d == 0 {
        return Ok(out);
    }
    for v_row in out.data_mut().chunks_exact_mut(i_d) {
        for (d_o, &d_b) in v_row.iter_mut().zip(bias.data().iter()) {
            *d_o += d_b;
        }
    }
    Ok(out)
}

pub fn scale(input: &Tensor, d_factor: f32) -> Tensor {
    input.map(|d| d * d_factor)
}

pub fn scale_inplace(input: &mut Tensor, d_factor: f32) {
    input.data_mut().iter_mut().for_each(|d| *d *= d_factor);
}

/// Head split: `[B,S,D] -> [B,H,S,D/H]`, sequence contiguous per head.
pub fn reshape_3d_to_4d(input: &Tensor, i_num_heads: usize) -> EngineResult<Tensor> {
    let (i_batch, i_seq, i_model) = input.dims3("reshape_3d_to_4d")?;
    if i_num_heads == 0 || i_model % i_num_heads != 0 {
        return Err(EngineError::shape(
            "reshape_3d_to_4d_heads",
            &[i_num_heads.max(1) * (i_model / i_num_heads.max(1))],
            &[i_model],
        ));
    }
    let i_head_dim = i_model / i_num_heads;
    let mut out = Tensor::zeros(&[i_batch, i_num_heads, i_seq, i_head_dim])?;

    let v_src = input.data();
    let v_dst = out.data_mut();
    for b in 0..i_batch {
        for s in 0..i_seq {
            for h in 0..i_num_heads {
                let i_src = (b * i_seq + s) * i_model + h * i_head_dim;
                let i_dst = ((b * i_num_heads + h) * i_seq + s) * i_head_dim;
                v_dst[i_dst..i_dst + i_head_dim].copy_from_slice(&v_src[i_src..i_src + i_head_dim]);
            }
        }
    }
    Ok(out)
}

/// Head merge: exact inverse of `reshape_3d_to_4d`.
pub fn reshape_4d_to_3d(input: &Tensor) -> EngineResult<Tensor> {
    let (i_batch, i_num_heads, i_seq, i_head_dim) = input.dims4("reshape_4d_to_3d")?;
    let i_model = i_num_heads * i_head_dim;
    let mut out = Tensor::zeros(&[i_batch, i_seq, i_model])?;

    let v_src = input.data();
    let v_dst = out.data_mut();
    for b in 0..i_batch {
        for h in 0..i_num_heads {
            for s in 0..i_seq {
                let i_src = ((b * i_num_heads + h) * i_seq + s) * i_head_dim;
                let i_dst = (b * i_seq + s) * i_model + h * i_head_dim;
                v_dst[i_dst..i_dst + i_head_dim].copy_from_slice(&v_src[i_src..i_src + i_head_dim]);
            }
        }
    }
    Ok(out)
}

/// Numerically stable softmax over the innermost axis.
pub fn softmax_last_axis(input: &Tensor) -> Tensor {
    let mut out = input.clone();
    let i_cols = input.last_dim();
    if i_cols == 0 {
        return out;
    }
    for v_row in out.data_mut().chunks_exact_mut(i_cols) {
        let d_max = v_row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut d_sum = 0.0;
        for d in v_row.iter_mut() {
            *d = (*d - d_max).exp();
            d_sum += *d;
        }
        let d_inv = 1.0 / d_sum.max(1e-30);
        v_row.iter_mut().for_each(|d| *d *= d_inv);
    }
    out
}

/// Row-wise Jacobian-vector product: `dS = P * (dP - sum(dP * P))`.
pub fn softmax_backward_last_axis(probs: &Tensor, grad_output: &Tensor) -> EngineResult<Tensor> {
    probs.expect_same_shape(grad_output, "softmax_backward")?;
    let mut out = Tensor::zeros(probs.shape())?;
    let i_cols = probs.last_dim();
    if i_cols == 0 {
        return Ok(out);
    }
    for ((v_p, v_g), v_o) in probs
        .data()
        .chunks_exact(i_cols)
        .zip(grad_output.data().chunks_exact(i_cols))
        .zip(out.data_mut().chunks_exact_mut(i_cols))
    {
        let d_dot: f32 = v_p.iter().zip(v_g.iter()).map(|(&p, &g)| p * g).sum();
        for ((d_o, &d_p), &d_g) in v_o.iter_mut().zip(v_p.iter()).zip(v_g.iter()) {
            *d_o = d_p * (d_g - d_dot);
        }
    }
    Ok(out)
}

pub fn relu_forward(input: &Tensor) -> Tensor {
    input.map(|d| d.max(0.0))
}

/// `grad * (pre_activation > 0)`.
pub fn relu_backward(grad_output: &Tensor, pre_activation: &Tensor) -> EngineResult<Tensor> {
    grad_output.expect_same_shape(pre_activation, "relu_backward")?;
    let mut out = grad_output.clone();
    for (d_g, &d_x) in out.data_mut().iter_mut().zip(pre_activation.data().iter()) {
        if d_x <= 0.0 {
            *d_g = 0.0;
        }
    }
    Ok(out)
}

/// Which elements survived a dropout forward call, and their rescale factor.
#[derive(Clone, Debug, PartialEq)]
pub struct DropoutMask {
    shape: Vec<usize>,
    v_keep: Vec<bool>,
    d_scale: f32,
}

impl DropoutMask {
    pub fn identity(v_shape: &[usize]) -> Self {
        let i_len = v_shape.iter().product();
        Self {
            shape: v_shape.to_vec(),
            v_keep: vec![true; i_len],
            d_scale: 1.0,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn scale(&self) -> f32 {
        self.d_scale
    }

    pub fn kept(&self, i_index: usize) -> bool {
        self.v_keep.get(i_index).copied().unwrap_or(false)
    }

    pub fn is_identity(&self) -> bool {
        self.d_scale == 1.0 && self.v_keep.iter().all(|&b| b)
    }

    pub fn dropped_count(&self) -> usize {
        self.v_keep.iter().filter(|&&b| !b).count()
    }
}

/// Bernoulli zeroing with `1 / (1 - prob)` rescaling of survivors.
///
/// Eval mode and `prob == 0` return the input unchanged with an identity mask.
pub fn dropout_forward(
    input: &Tensor,
    d_prob: f32,
    ctx: &mut RunContext,
) -> EngineResult<(Tensor, DropoutMask)> {
    validate_dropout_prob(d_prob)?;
    if !ctx.b_training || d_prob == 0.0 {
        return Ok((input.clone(), DropoutMask::identity(input.shape())));
    }

    let d_scale = 1.0 / (1.0 - d_prob);
    let rng = ctx.rng_mut();
    let mut out = input.clone();
    let mut v_keep: Vec<bool> = Vec::with_capacity(input.len());
    for d in out.data_mut().iter_mut() {
        let b_keep = rng.random::<f32>() >= d_prob;
        *d = if b_keep { *d * d_scale } else { 0.0 };
        v_keep.push(b_keep);
    }

    Ok((
        out,
        DropoutMask {
            shape: input.shape().to_vec(),
            v_keep,
            d_scale,
        },
    ))
}

/// Zeroes gradients of dropped elements and rescales the rest.
pub fn dropout_backward(grad_output: &Tensor, mask: &DropoutMask) -> EngineResult<Tensor> {
    grad_output.expect_shape(&mask.shape, "dropout_backward")?;
    if mask.is_identity() {
        return Ok(grad_output.clone());
    }
    let mut out = grad_output.clone();
    for (i, d_g) in out.data_mut().iter_mut().enumerate() {
        *d_g = if mask.kept(i) { *d_g * mask.d_scale } else { 0.0 };
    }
    Ok(out)
}
