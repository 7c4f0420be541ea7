// model.rs
// Description: Post-norm encoder and decoder layers, the stacks built from
//              them, and the Transformer wrapper that owns the shared
//              embedding, builds the padding/target masks and projects the
//              decoder output to vocabulary logits.
//              Layer order inside a block:
//                encoder: self attention -> norm1 -> feed forward -> norm2
//                decoder: self attention -> norm1 -> cross attention -> norm2
//                         -> feed forward -> norm3
//              Cross attention takes its queries from the norm1 output.
// History:
// - 2026-10-16: Encoder/decoder layers with dropout, residual gradients and
//               explicit caches; stacks; Transformer with weight export.
// - 2026-10-17: Output projection to logits; backward validates masks and
//               caches before any gradient is accumulated.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::attention::{AttentionCache, MultiHeadAttention};
use crate::config::{validate_dropout_prob, ModelConfig, RunContext};
use crate::embedding::{EmbeddingCache, TransformerEmbedding};
use crate::error::{EngineError, EngineResult};
use crate::layer::{
    FeedForward, FeedForwardCache, Layer, LayerNorm, LayerNormCache, OutputProjection,
    OutputProjectionCache, Param,
};
use crate::mask::AttentionMask;
use crate::math::{self, DropoutMask};
use crate::tensor::Tensor;
use crate::utils;

fn check_grad_shape(cached: &Tensor, v_grad_shape: &[usize], context: &'static str) -> EngineResult<()> {
    if cached.shape() != v_grad_shape {
        return Err(EngineError::shape(context, cached.shape(), v_grad_shape));
    }
    Ok(())
}

// A mask handed to backward must fit the scores cached by forward.
fn check_mask(mask: Option<&AttentionMask>, cache: &AttentionCache) -> EngineResult<()> {
    match mask {
        Some(mask) => mask.check_scores(cache.weights.shape()),
        None => Ok(()),
    }
}

pub struct EncoderLayer {
    self_attention: MultiHeadAttention,
    norm1: LayerNorm,
    feed_forward: FeedForward,
    norm2: LayerNorm,
    d_dropout_prob: f32,
}

#[derive(Clone, Debug)]
pub struct EncoderLayerCache {
    pub attention: AttentionCache,
    pub dropout1: DropoutMask,
    pub norm1: LayerNormCache,
    pub feed_forward: FeedForwardCache,
    pub dropout2: DropoutMask,
    pub norm2: LayerNormCache,
}

impl EncoderLayer {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        validate_dropout_prob(config.d_dropout_prob)?;
        Ok(Self {
            self_attention: MultiHeadAttention::new(config.i_model_dim, config.i_num_heads, rng)?,
            norm1: LayerNorm::new(config.i_model_dim, config.d_layer_norm_eps)?,
            feed_forward: FeedForward::new(config.i_model_dim, config.i_ff_dim, rng)?,
            norm2: LayerNorm::new(config.i_model_dim, config.d_layer_norm_eps)?,
            d_dropout_prob: config.d_dropout_prob,
        })
    }

    pub fn forward(
        &self,
        input: &Tensor,
        mask: Option<&AttentionMask>,
        ctx: &mut RunContext,
    ) -> EngineResult<(Tensor, EncoderLayerCache)> {
        let (attn_out, attention) = self.self_attention.forward_self(input, mask)?;
        let (attn_drop, dropout1) = math::dropout_forward(&attn_out, self.d_dropout_prob, ctx)?;
        let (x1, norm1) = self.norm1.forward(&math::add(&attn_drop, input)?)?;

        let (ff_out, feed_forward) = self.feed_forward.forward(&x1)?;
        let (ff_drop, dropout2) = math::dropout_forward(&ff_out, self.d_dropout_prob, ctx)?;
        let (x2, norm2) = self.norm2.forward(&math::add(&ff_drop, &x1)?)?;

        Ok((
            x2,
            EncoderLayerCache {
                attention,
                dropout1,
                norm1,
                feed_forward,
                dropout2,
                norm2,
            },
        ))
    }

    /// Fails if `mask` or the upstream gradient shape does not fit `cache`.
    /// Nothing is accumulated by the check.
    pub fn check_backward(
        &self,
        cache: &EncoderLayerCache,
        v_grad_shape: &[usize],
        mask: Option<&AttentionMask>,
    ) -> EngineResult<()> {
        check_grad_shape(&cache.norm2.input, v_grad_shape, "encoder_layer_backward")?;
        check_mask(mask, &cache.attention)
    }

    /// Reverse of `forward`; `mask` must be the mask used in the forward pass.
    pub fn backward(
        &mut self,
        cache: &EncoderLayerCache,
        grad_output: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> EngineResult<Tensor> {
        self.check_backward(cache, grad_output.shape(), mask)?;

        // x2 = LN2(drop(ff(x1)) + x1)
        let grad_sum2 = self.norm2.backward(&cache.norm2, grad_output)?;
        let grad_ff_out = math::dropout_backward(&grad_sum2, &cache.dropout2)?;
        let mut grad_x1 = self.feed_forward.backward(&cache.feed_forward, &grad_ff_out)?;
        math::add_assign(&mut grad_x1, &grad_sum2)?;

        // x1 = LN1(drop(attn(x)) + x)
        let grad_sum1 = self.norm1.backward(&cache.norm1, &grad_x1)?;
        let grad_attn_out = math::dropout_backward(&grad_sum1, &cache.dropout1)?;
        let mut grad_input = self
            .self_attention
            .backward_self(&cache.attention, &grad_attn_out, mask)?;
        math::add_assign(&mut grad_input, &grad_sum1)?;
        Ok(grad_input)
    }
}

impl Layer for EncoderLayer {
    fn layer_type(&self) -> &str {
        "EncoderLayer"
    }

    fn params(&self) -> Vec<&Param> {
        let mut v = self.self_attention.params();
        v.extend(self.norm1.params());
        v.extend(self.feed_forward.params());
        v.extend(self.norm2.params());
        v
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut v = self.self_attention.params_mut();
        v.extend(self.norm1.params_mut());
        v.extend(self.feed_forward.params_mut());
        v.extend(self.norm2.params_mut());
        v
    }
}

pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    norm1: LayerNorm,
    cross_attention: MultiHeadAttention,
    norm2: LayerNorm,
    feed_forward: FeedForward,
    norm3: LayerNorm,
    d_dropout_prob: f32,
}

#[derive(Clone, Debug)]
pub struct DecoderLayerCache {
    pub self_attention: AttentionCache,
    pub dropout1: DropoutMask,
    pub norm1: LayerNormCache,
    pub cross_attention: AttentionCache,
    pub dropout2: DropoutMask,
    pub norm2: LayerNormCache,
    pub feed_forward: FeedForwardCache,
    pub dropout3: DropoutMask,
    pub norm3: LayerNormCache,
}

/// Gradients leaving a decoder layer or stack.
#[derive(Clone, Debug)]
pub struct DecoderGrads {
    pub grad_input: Tensor,
    pub grad_encoder_output: Tensor,
}

impl DecoderLayer {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        validate_dropout_prob(config.d_dropout_prob)?;
        Ok(Self {
            self_attention: MultiHeadAttention::new(config.i_model_dim, config.i_num_heads, rng)?,
            norm1: LayerNorm::new(config.i_model_dim, config.d_layer_norm_eps)?,
            cross_attention: MultiHeadAttention::new(config.i_model_dim, config.i_num_heads, rng)?,
            norm2: LayerNorm::new(config.i_model_dim, config.d_layer_norm_eps)?,
            feed_forward: FeedForward::new(config.i_model_dim, config.i_ff_dim, rng)?,
            norm3: LayerNorm::new(config.i_model_dim, config.d_layer_norm_eps)?,
            d_dropout_prob: config.d_dropout_prob,
        })
    }

    pub fn forward(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_mask: Option<&AttentionMask>,
        cross_mask: Option<&AttentionMask>,
        ctx: &mut RunContext,
    ) -> EngineResult<(Tensor, DecoderLayerCache)> {
        let (sa_out, self_attention) = self.self_attention.forward_self(input, self_mask)?;
        let (sa_drop, dropout1) = math::dropout_forward(&sa_out, self.d_dropout_prob, ctx)?;
        let (y1, norm1) = self.norm1.forward(&math::add(&sa_drop, input)?)?;

        let (ca_out, cross_attention) = self.cross_attention.forward_cross(&y1, encoder_output, cross_mask)?;
        let (ca_drop, dropout2) = math::dropout_forward(&ca_out, self.d_dropout_prob, ctx)?;
        let (y2, norm2) = self.norm2.forward(&math::add(&ca_drop, &y1)?)?;

        let (ff_out, feed_forward) = self.feed_forward.forward(&y2)?;
        let (ff_drop, dropout3) = math::dropout_forward(&ff_out, self.d_dropout_prob, ctx)?;
        let (y3, norm3) = self.norm3.forward(&math::add(&ff_drop, &y2)?)?;

        Ok((
            y3,
            DecoderLayerCache {
                self_attention,
                dropout1,
                norm1,
                cross_attention,
                dropout2,
                norm2,
                feed_forward,
                dropout3,
                norm3,
            },
        ))
    }

    pub fn check_backward(
        &self,
        cache: &DecoderLayerCache,
        v_grad_shape: &[usize],
        self_mask: Option<&AttentionMask>,
        cross_mask: Option<&AttentionMask>,
    ) -> EngineResult<()> {
        check_grad_shape(&cache.norm3.input, v_grad_shape, "decoder_layer_backward")?;
        check_mask(self_mask, &cache.self_attention)?;
        check_mask(cross_mask, &cache.cross_attention)
    }

    pub fn backward(
        &mut self,
        cache: &DecoderLayerCache,
        grad_output: &Tensor,
        self_mask: Option<&AttentionMask>,
        cross_mask: Option<&AttentionMask>,
    ) -> EngineResult<DecoderGrads> {
        self.check_backward(cache, grad_output.shape(), self_mask, cross_mask)?;

        // y3 = LN3(drop(ff(y2)) + y2)
        let grad_sum3 = self.norm3.backward(&cache.norm3, grad_output)?;
        let grad_ff_out = math::dropout_backward(&grad_sum3, &cache.dropout3)?;
        let mut grad_y2 = self.feed_forward.backward(&cache.feed_forward, &grad_ff_out)?;
        math::add_assign(&mut grad_y2, &grad_sum3)?;

        // y2 = LN2(drop(cross(y1, enc)) + y1)
        let grad_sum2 = self.norm2.backward(&cache.norm2, &grad_y2)?;
        let grad_ca_out = math::dropout_backward(&grad_sum2, &cache.dropout2)?;
        let cross = self
            .cross_attention
            .backward_cross(&cache.cross_attention, &grad_ca_out, cross_mask)?;
        let mut grad_y1 = cross.grad_query;
        math::add_assign(&mut grad_y1, &grad_sum2)?;

        // y1 = LN1(drop(self_attn(y)) + y)
        let grad_sum1 = self.norm1.backward(&cache.norm1, &grad_y1)?;
        let grad_sa_out = math::dropout_backward(&grad_sum1, &cache.dropout1)?;
        let mut grad_input = self
            .self_attention
            .backward_self(&cache.self_attention, &grad_sa_out, self_mask)?;
        math::add_assign(&mut grad_input, &grad_sum1)?;

        Ok(DecoderGrads {
            grad_input,
            grad_encoder_output: cross.grad_key_value,
        })
    }
}

impl Layer for DecoderLayer {
    fn layer_type(&self) -> &str {
        "DecoderLayer"
    }

    fn params(&self) -> Vec<&Param> {
        let mut v = self.self_attention.params();
        v.extend(self.norm1.params());
        v.extend(self.cross_attention.params());
        v.extend(self.norm2.params());
        v.extend(self.feed_forward.params());
        v.extend(self.norm3.params());
        v
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut v = self.self_attention.params_mut();
        v.extend(self.norm1.params_mut());
        v.extend(self.cross_attention.params_mut());
        v.extend(self.norm2.params_mut());
        v.extend(self.feed_forward.params_mut());
        v.extend(self.norm3.params_mut());
        v
    }
}

pub struct Encoder {
    layers: Vec<EncoderLayer>,
}

#[derive(Clone, Debug)]
pub struct EncoderCache {
    pub layers: Vec<EncoderLayerCache>,
}

impl Encoder {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        let layers = (0..config.i_num_encoder_layers)
            .map(|_| EncoderLayer::new(config, &mut *rng))
            .collect::<EngineResult<Vec<EncoderLayer>>>()?;
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [EncoderLayer] {
        &mut self.layers
    }

    pub fn forward(
        &self,
        input: &Tensor,
        mask: Option<&AttentionMask>,
        ctx: &mut RunContext,
    ) -> EngineResult<(Tensor, EncoderCache)> {
        let mut v_caches: Vec<EncoderLayerCache> = Vec::with_capacity(self.layers.len());
        let mut act = input.clone();
        for (i_layer, layer) in self.layers.iter().enumerate() {
            let (next, cache) = layer.forward(&act, mask, ctx)?;
            log::trace!("encoder layer {} forward {:?}", i_layer, next.shape());
            act = next;
            v_caches.push(cache);
        }
        Ok((act, EncoderCache { layers: v_caches }))
    }

    /// Checks every layer cache against `mask` and `v_grad_shape` before a
    /// stack backward touches any gradient.
    pub fn check_backward(
        &self,
        cache: &EncoderCache,
        v_grad_shape: &[usize],
        mask: Option<&AttentionMask>,
    ) -> EngineResult<()> {
        if cache.layers.len() != self.layers.len() {
            return Err(EngineError::NullInput {
                context: "encoder_cache_layers",
            });
        }
        for (layer, layer_cache) in self.layers.iter().zip(cache.layers.iter()) {
            layer.check_backward(layer_cache, v_grad_shape, mask)?;
        }
        Ok(())
    }

    pub fn backward(
        &mut self,
        cache: &EncoderCache,
        grad_output: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> EngineResult<Tensor> {
        self.check_backward(cache, grad_output.shape(), mask)?;
        let mut grad = grad_output.clone();
        for (i_layer, (layer, layer_cache)) in self
            .layers
            .iter_mut()
            .zip(cache.layers.iter())
            .enumerate()
            .rev()
        {
            grad = layer.backward(layer_cache, &grad, mask)?;
            log::trace!("encoder layer {} backward", i_layer);
        }
        Ok(grad)
    }
}

impl Layer for Encoder {
    fn layer_type(&self) -> &str {
        "Encoder"
    }

    fn params(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }
}

pub struct Decoder {
    layers: Vec<DecoderLayer>,
}

#[derive(Clone, Debug)]
pub struct DecoderCache {
    pub layers: Vec<DecoderLayerCache>,
    encoder_shape: Vec<usize>,
}

impl Decoder {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        let layers = (0..config.i_num_decoder_layers)
            .map(|_| DecoderLayer::new(config, &mut *rng))
            .collect::<EngineResult<Vec<DecoderLayer>>>()?;
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [DecoderLayer] {
        &mut self.layers
    }

    pub fn forward(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_mask: Option<&AttentionMask>,
        cross_mask: Option<&AttentionMask>,
        ctx: &mut RunContext,
    ) -> EngineResult<(Tensor, DecoderCache)> {
        let mut v_caches: Vec<DecoderLayerCache> = Vec::with_capacity(self.layers.len());
        let mut act = input.clone();
        for (i_layer, layer) in self.layers.iter().enumerate() {
            let (next, cache) = layer.forward(&act, encoder_output, self_mask, cross_mask, ctx)?;
            log::trace!("decoder layer {} forward {:?}", i_layer, next.shape());
            act = next;
            v_caches.push(cache);
        }
        Ok((
            act,
            DecoderCache {
                layers: v_caches,
                encoder_shape: encoder_output.shape().to_vec(),
            },
        ))
    }

    pub fn check_backward(
        &self,
        cache: &DecoderCache,
        v_grad_shape: &[usize],
        self_mask: Option<&AttentionMask>,
        cross_mask: Option<&AttentionMask>,
    ) -> EngineResult<()> {
        if cache.layers.len() != self.layers.len() {
            return Err(EngineError::NullInput {
                context: "decoder_cache_layers",
            });
        }
        for (layer, layer_cache) in self.layers.iter().zip(cache.layers.iter()) {
            layer.check_backward(layer_cache, v_grad_shape, self_mask, cross_mask)?;
            check_grad_shape(
                &layer_cache.cross_attention.key_value_input,
                &cache.encoder_shape,
                "decoder_cache_encoder_output",
            )?;
        }
        Ok(())
    }

    /// Runs layers in reverse; the encoder-output gradient is the sum over
    /// every layer's cross attention.
    pub fn backward(
        &mut self,
        cache: &DecoderCache,
        grad_output: &Tensor,
        self_mask: Option<&AttentionMask>,
        cross_mask: Option<&AttentionMask>,
    ) -> EngineResult<DecoderGrads> {
        self.check_backward(cache, grad_output.shape(), self_mask, cross_mask)?;
        let mut grad = grad_output.clone();
        let mut grad_encoder_output = Tensor::zeros(&cache.encoder_shape)?;
        for (i_layer, (layer, layer_cache)) in self
            .layers
            .iter_mut()
            .zip(cache.layers.iter())
            .enumerate()
            .rev()
        {
            let grads = layer.backward(layer_cache, &grad, self_mask, cross_mask)?;
            math::add_assign(&mut grad_encoder_output, &grads.grad_encoder_output)?;
            grad = grads.grad_input;
            log::trace!("decoder layer {} backward", i_layer);
        }
        Ok(DecoderGrads {
            grad_input: grad,
            grad_encoder_output,
        })
    }
}

impl Layer for Decoder {
    fn layer_type(&self) -> &str {
        "Decoder"
    }

    fn params(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }
}

/// Shared embedding, encoder stack, decoder stack and output projection.
pub struct Transformer {
    config: ModelConfig,
    embedding: TransformerEmbedding,
    encoder: Encoder,
    decoder: Decoder,
    output_projection: OutputProjection,
}

#[derive(Clone, Debug)]
pub struct TransformerCache {
    pub source_embedding: EmbeddingCache,
    pub target_embedding: EmbeddingCache,
    pub encoder: EncoderCache,
    pub decoder: DecoderCache,
    pub output_projection: OutputProjectionCache,
    pub source_mask: AttentionMask,
    pub target_mask: AttentionMask,
    pub cross_mask: AttentionMask,
}

impl Transformer {
    /// Builds all layers from `config`, initialised from `config.u64_seed`.
    pub fn new(config: &ModelConfig) -> EngineResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.u64_seed);
        let embedding = TransformerEmbedding::new(
            config.i_vocab_size,
            config.i_model_dim,
            config.i_max_seq_len,
            &mut rng,
        )?;
        let encoder = Encoder::new(config, &mut rng)?;
        let decoder = Decoder::new(config, &mut rng)?;
        let output_projection = OutputProjection::new(config.i_model_dim, config.i_vocab_size, &mut rng)?;
        log::debug!(
            "transformer built: d_model={} heads={} enc={} dec={}",
            config.i_model_dim,
            config.i_num_heads,
            config.i_num_encoder_layers,
            config.i_num_decoder_layers
        );
        Ok(Self {
            config: config.clone(),
            embedding,
            encoder,
            decoder,
            output_projection,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn embedding(&self) -> &TransformerEmbedding {
        &self.embedding
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut Encoder {
        &mut self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut Decoder {
        &mut self.decoder
    }

    pub fn output_projection(&self) -> &OutputProjection {
        &self.output_projection
    }

    pub fn network_description(&self) -> String {
        let mut v_names: Vec<&str> = vec![self.embedding.layer_type()];
        v_names.extend(self.encoder.layers().iter().map(|l| l.layer_type()));
        v_names.extend(self.decoder.layers().iter().map(|l| l.layer_type()));
        v_names.push(self.output_projection.layer_type());
        v_names.join(", ")
    }

    /// Logits `[B, St, vocab]` for source `[B, Ss]` and target `[B, St]` ids.
    pub fn forward(
        &self,
        a_source: &Array2<i64>,
        a_target: &Array2<i64>,
        ctx: &mut RunContext,
    ) -> EngineResult<(Tensor, TransformerCache)> {
        let i_heads = self.config.i_num_heads;
        let i_pad = self.config.i_pad_token_id;
        let source_mask = AttentionMask::padding(a_source, a_source, i_heads, i_pad)?;
        let target_mask = AttentionMask::target(a_target, i_heads, i_pad)?;
        let cross_mask = AttentionMask::padding(a_target, a_source, i_heads, i_pad)?;

        let (source_embedded, source_embedding) = self.embedding.forward(a_source)?;
        let (memory, encoder) = self.encoder.forward(&source_embedded, Some(&source_mask), ctx)?;

        let (target_embedded, target_embedding) = self.embedding.forward(a_target)?;
        let (decoder_output, decoder) = self.decoder.forward(
            &target_embedded,
            &memory,
            Some(&target_mask),
            Some(&cross_mask),
            ctx,
        )?;
        let (logits, output_projection) = self.output_projection.forward(&decoder_output)?;

        log::debug!(
            "transformer forward: source={:?} target={:?} training={}",
            a_source.dim(),
            a_target.dim(),
            ctx.b_training
        );

        Ok((
            logits,
            TransformerCache {
                source_embedding,
                target_embedding,
                encoder,
                decoder,
                output_projection,
                source_mask,
                target_mask,
                cross_mask,
            },
        ))
    }

    /// Output projection, decoder, encoder, then both embedding scatters.
    /// `grad_output` is the gradient w.r.t. the logits.
    pub fn backward(&mut self, cache: &TransformerCache, grad_output: &Tensor) -> EngineResult<()> {
        let (i_batch, i_seq, _) = cache.output_projection.input.dims3("transformer_cache")?;
        grad_output.expect_shape(
            &[i_batch, i_seq, self.output_projection.vocab_size()],
            "transformer_backward",
        )?;
        self.decoder.check_backward(
            &cache.decoder,
            cache.output_projection.input.shape(),
            Some(&cache.target_mask),
            Some(&cache.cross_mask),
        )?;
        self.encoder.check_backward(
            &cache.encoder,
            &cache.decoder.encoder_shape,
            Some(&cache.source_mask),
        )?;

        let grad_decoder_output = self
            .output_projection
            .backward(&cache.output_projection, grad_output)?;
        let decoder_grads = self.decoder.backward(
            &cache.decoder,
            &grad_decoder_output,
            Some(&cache.target_mask),
            Some(&cache.cross_mask),
        )?;
        let grad_source = self.encoder.backward(
            &cache.encoder,
            &decoder_grads.grad_encoder_output,
            Some(&cache.source_mask),
        )?;
        self.embedding
            .backward(&cache.target_embedding, &decoder_grads.grad_input)?;
        self.embedding.backward(&cache.source_embedding, &grad_source)?;
        log::debug!("transformer backward done");
        Ok(())
    }

    pub fn weight_count(&self) -> usize {
        self.embedding.parameters()
            + self.embedding.positional().table().len()
            + self.encoder.parameters()
            + self.decoder.parameters()
            + self.output_projection.parameters()
    }

    /// Flat weights: embedding matrix, positional table, encoder layers,
    /// decoder layers, output projection.
    pub fn export_weights(&self) -> Vec<f32> {
        let mut v: Vec<f32> = Vec::with_capacity(self.weight_count());
        v.extend(self.embedding.get_parameters_flat());
        v.extend_from_slice(self.embedding.positional().table().data());
        v.extend(self.encoder.get_parameters_flat());
        v.extend(self.decoder.get_parameters_flat());
        v.extend(self.output_projection.get_parameters_flat());
        v
    }

    /// Inverse of `export_weights`; the length must match exactly.
    pub fn import_weights(&mut self, v_weights: &[f32]) -> EngineResult<()> {
        let i_expected = self.weight_count();
        if v_weights.len() != i_expected {
            return Err(EngineError::shape(
                "import_weights",
                &[i_expected],
                &[v_weights.len()],
            ));
        }

        let mut i_pos = self.embedding.set_parameters_flat(v_weights)?;
        let table = self.embedding.positional_table_mut();
        let i_table = table.len();
        utils::copy_into(table.data_mut(), &v_weights[i_pos..i_pos + i_table])?;
        i_pos += i_table;
        i_pos += self.encoder.set_parameters_flat(&v_weights[i_pos..])?;
        i_pos += self.decoder.set_parameters_flat(&v_weights[i_pos..])?;
        i_pos += self.output_projection.set_parameters_flat(&v_weights[i_pos..])?;

        log::debug!("imported {} weights", i_pos);
        Ok(())
    }
}

impl Layer for Transformer {
    fn layer_type(&self) -> &str {
        "Transformer"
    }

    fn params(&self) -> Vec<&Param> {
        let mut v = self.embedding.params();
        v.extend(self.encoder.params());
        v.extend(self.decoder.params());
        v.extend(self.output_projection.params());
        v
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut v = self.embedding.params_mut();
        v.extend(self.encoder.params_mut());
        v.extend(self.decoder.params_mut());
        v.extend(self.output_projection.params_mut());
        v
    }
}
