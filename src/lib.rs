// lib.rs
// Description: Transformer encoder-decoder with hand-derived backward passes.
//              Every forward call returns its output and a typed cache; the
//              paired backward call takes that cache, returns input gradients
//              and accumulates parameter gradients for an external optimizer.
// History:
// - 2026-10-16: Encoder-decoder stacks, masks, explicit caches.
// - 2026-10-17: Output projection to vocabulary logits.

pub mod attention;
pub mod config;
pub mod embedding;
pub mod error;
pub mod layer;
pub mod mask;
pub mod math;
pub mod model;
pub mod tensor;
pub mod utils;

pub use crate::attention::{AttentionCache, AttentionGrads, MultiHeadAttention};
pub use crate::config::{ModelConfig, RunContext, DEFAULT_LAYER_NORM_EPS};
pub use crate::embedding::{EmbeddingCache, PositionalEncoding, TokenEmbedding, TransformerEmbedding};
pub use crate::error::{EngineError, EngineResult};
pub use crate::layer::{
    FeedForward, FeedForwardCache, Layer, LayerNorm, LayerNormCache, OutputProjection,
    OutputProjectionCache, Param,
};
pub use crate::mask::{apply_mask, AttentionMask, MASK_VALUE};
pub use crate::math::DropoutMask;
pub use crate::model::{
    Decoder, DecoderCache, DecoderGrads, DecoderLayer, DecoderLayerCache, Encoder, EncoderCache,
    EncoderLayer, EncoderLayerCache, Transformer, TransformerCache,
};
pub use crate::tensor::Tensor;
