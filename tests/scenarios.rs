mod common;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use transformer_backprop::math::{dropout_backward, dropout_forward};
use transformer_backprop::utils::{clip_grad_norm, grad_norm};
use transformer_backprop::{
    AttentionMask, EncoderLayer, EngineError, Layer, LayerNorm, ModelConfig, MultiHeadAttention,
    RunContext, Tensor, Transformer,
};

use common::{identity, sample, set_named};

#[test]
fn encoder_layer_is_layer_norm_of_doubled_input() {
    common::init_logging();
    let config = ModelConfig {
        i_model_dim: 2,
        i_num_heads: 1,
        i_ff_dim: 4,
        d_dropout_prob: 0.0,
        ..ModelConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let mut layer = EncoderLayer::new(&config, &mut rng).unwrap();

    // Single-token sequences: attention weight is 1, so W_v = W_o = I gives
    // the identity map. A zero second FF layer leaves only the residual.
    set_named(&mut layer, "attention.w_v", identity(2));
    set_named(&mut layer, "attention.w_o", identity(2));
    for s_bias in ["attention.b_q", "attention.b_k", "attention.b_v", "attention.b_o"] {
        set_named(&mut layer, s_bias, |_| 0.0);
    }
    set_named(&mut layer, "feed_forward.w2", |_| 0.0);
    set_named(&mut layer, "feed_forward.b2", |_| 0.0);

    let x = Tensor::new(&[2, 1, 2], vec![1.0, 3.0, 2.0, -1.0]).unwrap();
    let mut ctx = RunContext::evaluation();
    let (y, _) = layer.forward(&x, None, &mut ctx).unwrap();

    let ln = LayerNorm::new(2, config.d_layer_norm_eps).unwrap();
    let doubled = Tensor::new(&[2, 1, 2], vec![2.0, 6.0, 4.0, -2.0]).unwrap();
    let (expected, _) = ln.forward(&doubled).unwrap();

    assert!(y.allclose(&expected, 1e-3), "{:?} vs {:?}", y.data(), expected.data());
    // Hand-computed: each pair normalizes to (-1, 1) or (1, -1).
    let hand = Tensor::new(&[2, 1, 2], vec![-1.0, 1.0, 1.0, -1.0]).unwrap();
    assert!(y.allclose(&hand, 1e-3));
}

#[test]
fn masked_position_zero_ignores_later_tokens() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut mha = MultiHeadAttention::new(4, 1, &mut rng).unwrap();
    for s_weight in ["attention.w_q", "attention.w_k", "attention.w_v", "attention.w_o"] {
        set_named(&mut mha, s_weight, identity(4));
    }
    for s_bias in ["attention.b_q", "attention.b_k", "attention.b_v", "attention.b_o"] {
        set_named(&mut mha, s_bias, |_| 0.0);
    }
    let mask = AttentionMask::causal(4).unwrap();

    let x = Tensor::ones(&[1, 4, 4]).unwrap();
    let mut x_changed = x.clone();
    for d in x_changed.data_mut()[4..].iter_mut() {
        *d = 7.5;
    }

    let (y, cache) = mha.forward_self(&x, Some(&mask)).unwrap();
    let (y_changed, _) = mha.forward_self(&x_changed, Some(&mask)).unwrap();

    assert_eq!(&y.data()[..4], &y_changed.data()[..4]);
    assert_eq!(&y.data()[..4], &[1.0; 4]);
    assert!(y.data()[4..] != y_changed.data()[4..]);
    // Row 0 of the attention weights is one-hot on key 0.
    assert_eq!(&cache.weights.data()[..4], &[1.0, 0.0, 0.0, 0.0]);
}

#[test]
fn dropout_backward_follows_forward_mask() {
    let x = sample(&[3, 4, 8], 0.0).map(|d| d.abs() + 0.1);
    let mut ctx = RunContext::training(17);
    let (y, mask) = dropout_forward(&x, 0.25, &mut ctx).unwrap();
    let g = sample(&[3, 4, 8], 0.5);
    let gx = dropout_backward(&g, &mask).unwrap();

    for i in 0..y.len() {
        if y.data()[i] == 0.0 {
            assert_eq!(gx.data()[i], 0.0);
        } else {
            assert!((gx.data()[i] - g.data()[i] / 0.75).abs() < 1e-6);
        }
    }
    assert!(dropout_backward(&Tensor::ones(&[3, 4]).unwrap(), &mask).is_err());
}

#[test]
fn dropout_mask_survives_legitimate_zeros() {
    // Zero activations that were kept still pass their gradient through.
    let x = Tensor::zeros(&[64]).unwrap();
    let mut ctx = RunContext::training(5);
    let (y, mask) = dropout_forward(&x, 0.5, &mut ctx).unwrap();
    assert!(y.data().iter().all(|&d| d == 0.0));
    let gx = dropout_backward(&Tensor::ones(&[64]).unwrap(), &mask).unwrap();
    let i_passed = gx.data().iter().filter(|&&d| d != 0.0).count();
    assert_eq!(i_passed, 64 - mask.dropped_count());
    assert!(i_passed > 0);
}

fn tiny_config() -> ModelConfig {
    ModelConfig {
        i_model_dim: 8,
        i_num_heads: 2,
        i_ff_dim: 12,
        i_vocab_size: 16,
        i_max_seq_len: 10,
        i_num_encoder_layers: 2,
        i_num_decoder_layers: 2,
        d_dropout_prob: 0.2,
        ..ModelConfig::default()
    }
}

fn batch() -> (Array2<i64>, Array2<i64>) {
    (
        Array2::from_shape_vec((2, 5), vec![3, 9, 4, 1, 0, 5, 6, 0, 0, 0]).unwrap(),
        Array2::from_shape_vec((2, 4), vec![2, 7, 8, 0, 11, 12, 13, 14]).unwrap(),
    )
}

#[test]
fn evaluation_is_deterministic_and_training_is_seeded() {
    let model = Transformer::new(&tiny_config()).unwrap();
    let (a_src, a_tgt) = batch();

    let (eval_a, _) = model.forward(&a_src, &a_tgt, &mut RunContext::evaluation()).unwrap();
    let (eval_b, _) = model.forward(&a_src, &a_tgt, &mut RunContext::evaluation()).unwrap();
    assert_eq!(eval_a, eval_b);

    let (train_a, _) = model.forward(&a_src, &a_tgt, &mut RunContext::training(3)).unwrap();
    let (train_b, _) = model.forward(&a_src, &a_tgt, &mut RunContext::training(3)).unwrap();
    assert_eq!(train_a, train_b);
    assert_ne!(train_a, eval_a);
}

#[test]
fn transformer_gradients_accumulate_until_zeroed() {
    common::init_logging();
    let mut model = Transformer::new(&tiny_config()).unwrap();
    let (a_src, a_tgt) = batch();
    let mut ctx = RunContext::training(9);

    let (logits, cache) = model.forward(&a_src, &a_tgt, &mut ctx).unwrap();
    assert_eq!(logits.shape(), &[2, 4, 16]);
    let grad = sample(&[2, 4, 16], 0.3);

    model.backward(&cache, &grad).unwrap();
    let v_once = model.get_gradients_flat();
    model.backward(&cache, &grad).unwrap();
    let v_twice = model.get_gradients_flat();
    for (a, b) in v_once.iter().zip(v_twice.iter()) {
        assert!((2.0 * a - b).abs() <= 1e-4 * a.abs().max(1.0));
    }

    // Unused vocabulary rows get no gradient; used ones do.
    let embedding_grad = model.embedding().token().weight().grad().unwrap();
    assert!(embedding_grad.data()[10 * 8..11 * 8].iter().all(|&d| d == 0.0));
    assert!(embedding_grad.data()[3 * 8..4 * 8].iter().any(|&d| d != 0.0));

    let d_norm = clip_grad_norm(&mut model.params_mut(), 1.0).unwrap();
    assert!(d_norm > 1.0);
    assert!((grad_norm(&model.params()) - 1.0).abs() < 1e-3);

    model.zero_grad();
    assert!(model.get_gradients_flat().iter().all(|&d| d == 0.0));
}

#[test]
fn invalid_tokens_and_long_sequences_are_rejected() {
    let model = Transformer::new(&tiny_config()).unwrap();
    let (a_src, _) = batch();
    let mut ctx = RunContext::evaluation();

    let a_bad = Array2::from_shape_vec((2, 2), vec![1, 16, 2, 3]).unwrap();
    assert_eq!(
        model.forward(&a_src, &a_bad, &mut ctx).unwrap_err(),
        EngineError::InvalidTokenId {
            token_id: 16,
            vocab_size: 16
        }
    );

    let a_long = Array2::from_elem((1, 11), 1i64);
    let a_short = Array2::from_elem((1, 3), 1i64);
    assert!(matches!(
        model.forward(&a_long, &a_short, &mut ctx),
        Err(EngineError::ShapeMismatch { .. })
    ));
}

#[test]
fn weights_survive_export_import_through_json_config() {
    let config = tiny_config();
    let s_json = config.to_json_string().unwrap();
    let source = Transformer::new(&ModelConfig::from_json_str(&s_json).unwrap()).unwrap();
    let mut target = Transformer::new(&ModelConfig {
        u64_seed: 1234,
        ..config
    })
    .unwrap();

    target.import_weights(&source.export_weights()).unwrap();

    let (a_src, a_tgt) = batch();
    let mut ctx = RunContext::evaluation();
    let (y_source, _) = source.forward(&a_src, &a_tgt, &mut ctx).unwrap();
    let (y_target, _) = target.forward(&a_src, &a_tgt, &mut ctx).unwrap();
    assert_eq!(y_source, y_target);
}

#[test]
fn rejects_invalid_configuration() {
    let config = ModelConfig {
        i_model_dim: 6,
        i_num_heads: 4,
        ..ModelConfig::default()
    };
    assert!(matches!(Transformer::new(&config), Err(EngineError::InvalidConfig(_))));
}
