// config.rs
// Description: Model dimensions passed explicitly to every constructor, and
//              the per-pass run context (train or eval, dropout RNG).
// History:
// - 2026-10-16: ModelConfig with serde defaults and validation; RunContext.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const DEFAULT_LAYER_NORM_EPS: f32 = 1e-5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub i_model_dim: usize,
    pub i_num_heads: usize,
    pub i_ff_dim: usize,
    pub i_vocab_size: usize,
    pub i_max_seq_len: usize,
    pub i_num_encoder_layers: usize,
    pub i_num_decoder_layers: usize,
    pub d_dropout_prob: f32,
    pub d_layer_norm_eps: f32,
    pub i_pad_token_id: i64,
    pub u64_seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            i_model_dim: 128,
            i_num_heads: 4,
            i_ff_dim: 512,
            i_vocab_size: 1000,
            i_max_seq_len: 512,
            i_num_encoder_layers: 2,
            i_num_decoder_layers: 2,
            d_dropout_prob: 0.1,
            d_layer_norm_eps: DEFAULT_LAYER_NORM_EPS,
            i_pad_token_id: 0,
            u64_seed: 42,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.i_model_dim == 0 {
            return Err(EngineError::InvalidConfig("model_dim must be positive".to_string()));
        }
        if self.i_num_heads == 0 {
            return Err(EngineError::InvalidConfig("num_heads must be positive".to_string()));
        }
        if self.i_model_dim % self.i_num_heads != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "model_dim {} not divisible by num_heads {}",
                self.i_model_dim, self.i_num_heads
            )));
        }
        if self.i_ff_dim == 0 {
            return Err(EngineError::InvalidConfig("ff_dim must be positive".to_string()));
        }
        if self.i_vocab_size == 0 {
            return Err(EngineError::InvalidConfig("vocab_size must be positive".to_string()));
        }
        if self.i_max_seq_len == 0 {
            return Err(EngineError::InvalidConfig("max_seq_len must be positive".to_string()));
        }
        validate_dropout_prob(self.d_dropout_prob)?;
        if !self.d_layer_norm_eps.is_finite() || self.d_layer_norm_eps <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "layer_norm_eps must be positive, got {}",
                self.d_layer_norm_eps
            )));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.i_model_dim / self.i_num_heads.max(1)
    }

    pub fn from_json_str(s_json: &str) -> EngineResult<Self> {
        let config: ModelConfig = serde_json::from_str(s_json)
            .map_err(|e| EngineError::InvalidConfig(format!("config_parse_error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::InvalidConfig(format!("config_serialize_error: {e}")))
    }
}

pub(crate) fn validate_dropout_prob(d_prob: f32) -> EngineResult<()> {
    if !d_prob.is_finite() || !(0.0..1.0).contains(&d_prob) {
        return Err(EngineError::InvalidConfig(format!(
            "dropout probability must lie in [0, 1), got {d_prob}"
        )));
    }
    Ok(())
}

/// Per-pass state handed to forward calls that may apply dropout.
///
/// In eval mode dropout is the identity and the RNG is never touched, so
/// evaluation passes are deterministic.
pub struct RunContext {
    pub b_training: bool,
    rng: StdRng,
}

impl RunContext {
    pub fn training(u64_seed: u64) -> Self {
        Self {
            b_training: true,
            rng: StdRng::seed_from_u64(u64_seed),
        }
    }

    pub fn evaluation() -> Self {
        Self {
            b_training: false,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 32);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = ModelConfig {
            i_model_dim: 10,
            i_num_heads: 3,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_dropout_of_one() {
        let config = ModelConfig {
            d_dropout_prob: 1.0,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_and_partial_json() {
        let config = ModelConfig {
            i_model_dim: 16,
            i_num_heads: 2,
            ..ModelConfig::default()
        };
        let s_json = config.to_json_string().unwrap();
        let parsed = ModelConfig::from_json_str(&s_json).unwrap();
        assert_eq!(parsed, config);

        // Missing fields fall back to defaults.
        let partial = ModelConfig::from_json_str(r#"{"i_model_dim": 64, "i_num_heads": 8}"#).unwrap();
        assert_eq!(partial.i_model_dim, 64);
        assert_eq!(partial.i_ff_dim, ModelConfig::default().i_ff_dim);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let res = ModelConfig::from_json_str("{not json");
        assert!(matches!(res, Err(EngineError::InvalidConfig(_))));
    }
}
