#![allow(dead_code)]

use transformer_backprop::{Layer, Tensor};

/// Outer step of the Richardson pair `(h, h/2)`. The extrapolation cancels
/// the `h^2` truncation term, so `h` can be large enough that f32 rounding in
/// the forward pass stays well below `FD_TOL * FD_FLOOR`.
pub const FD_EPS: f32 = 5e-2;
pub const FD_TOL: f64 = 1e-3;
/// Gradients smaller than this are compared with absolute error
/// `FD_TOL * FD_FLOOR`; larger ones with relative error `FD_TOL`.
pub const FD_FLOOR: f64 = 0.1;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic, non-symmetric test data in roughly [-1, 1].
pub fn sample(v_shape: &[usize], d_phase: f32) -> Tensor {
    let i_len: usize = v_shape.iter().product();
    Tensor::new(
        v_shape,
        (0..i_len)
            .map(|i| (i as f32 * 0.731 + d_phase).sin() * 0.9 + 0.05 * (i % 3) as f32)
            .collect(),
    )
    .unwrap()
}

/// Scalar `sum(output * weights)`; its gradient w.r.t. output is `weights`.
pub fn weighted_sum(output: &Tensor, weights: &Tensor) -> f64 {
    output
        .data()
        .iter()
        .zip(weights.data().iter())
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum()
}

pub fn relative_error(d_analytic: f64, d_numeric: f64) -> f64 {
    (d_analytic - d_numeric).abs() / d_analytic.abs().max(d_numeric.abs()).max(FD_FLOOR)
}

/// Richardson-extrapolated central difference, `(4 D(h/2) - D(h)) / 3`.
pub fn richardson(f_at: impl Fn(f32) -> f64) -> f64 {
    let central = |d_h: f32| (f_at(d_h) - f_at(-d_h)) / (2.0 * d_h as f64);
    (4.0 * central(FD_EPS / 2.0) - central(FD_EPS)) / 3.0
}

/// Central differences of `f` w.r.t. every element of `x`, compared to `analytic`.
pub fn check_input_grad(x: &Tensor, analytic: &Tensor, f: impl Fn(&Tensor) -> f64, s_label: &str) {
    assert_eq!(x.shape(), analytic.shape(), "{s_label}: gradient shape");
    for i in 0..x.len() {
        let d_numeric = richardson(|d_h| {
            let mut x_moved = x.clone();
            x_moved.data_mut()[i] += d_h;
            f(&x_moved)
        });
        let d_analytic = analytic.data()[i] as f64;
        assert!(
            relative_error(d_analytic, d_numeric) < FD_TOL,
            "{s_label}[{i}]: analytic {d_analytic} vs numeric {d_numeric}"
        );
    }
}

fn set_param<L: Layer>(layer: &mut L, i_param: usize, i_elem: usize, d_value: f32) {
    layer.params_mut()[i_param].value.data_mut()[i_elem] = d_value;
}

/// Compares every accumulated parameter gradient against central differences.
pub fn check_param_grads<L: Layer>(layer: &mut L, f: impl Fn(&L) -> f64) {
    let v_analytic: Vec<(&'static str, Vec<f32>)> = layer
        .params()
        .iter()
        .map(|p| (p.name, p.grad().expect("gradient allocated by backward").data().to_vec()))
        .collect();

    for (i_param, (s_name, v_grad)) in v_analytic.iter().enumerate() {
        for (i_elem, &d_grad) in v_grad.iter().enumerate() {
            let d_orig = layer.params()[i_param].value.data()[i_elem];
            let mut central = |d_h: f32| {
                set_param(layer, i_param, i_elem, d_orig + d_h);
                let d_plus = f(layer);
                set_param(layer, i_param, i_elem, d_orig - d_h);
                let d_minus = f(layer);
                set_param(layer, i_param, i_elem, d_orig);
                (d_plus - d_minus) / (2.0 * d_h as f64)
            };
            let d_numeric = (4.0 * central(FD_EPS / 2.0) - central(FD_EPS)) / 3.0;
            assert!(
                relative_error(d_grad as f64, d_numeric) < FD_TOL,
                "{s_name}[{i_elem}]: analytic {d_grad} vs numeric {d_numeric}"
            );
        }
    }
}

/// Overwrites parameters whose name matches, element by element.
pub fn set_named<L: Layer>(layer: &mut L, s_name: &str, f: impl Fn(usize) -> f32) {
    for p in layer.params_mut() {
        if p.name == s_name {
            for (i, d) in p.value.data_mut().iter_mut().enumerate() {
                *d = f(i);
            }
        }
    }
}

/// Keeps every ReLU unit strictly active: small first-layer weights, bias 1.
pub fn keep_relu_active<L: Layer>(layer: &mut L) {
    set_named(layer, "feed_forward.w1", |i| ((i as f32) * 0.37).sin() * 0.05);
    set_named(layer, "feed_forward.b1", |_| 1.0);
}

pub fn identity(i_dim: usize) -> impl Fn(usize) -> f32 {
    move |i| if i / i_dim == i % i_dim { 1.0 } else { 0.0 }
}
