// utils.rs
// Description: Helpers over parameter lists and flat buffers used by an
//              external optimizer step and by weight import: gradient norm,
//              global-norm clipping, gradient scaling and checked copies.
// History:
// - 2026-10-16: Parameter-list gradient utilities.
// - 2026-10-17: Clipping reuses grad_norm; copy_into backs weight import.

use crate::error::{EngineError, EngineResult};
use crate::layer::Param;

/// Global L2 norm over every allocated gradient.
pub fn grad_norm(params: &[&Param]) -> f32 {
    params
        .iter()
        .filter_map(|p| p.grad())
        .flat_map(|g| g.data().iter())
        .map(|&d| d * d)
        .sum::<f32>()
        .sqrt()
}

pub fn scale_gradients(params: &mut [&mut Param], d_factor: f32) {
    for p in params.iter_mut() {
        if p.grad().is_some() {
            if let Ok(grad) = p.grad_mut() {
                grad.data_mut().iter_mut().for_each(|d| *d *= d_factor);
            }
        }
    }
}

/// Rescales all gradients so their global norm is at most `d_max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [&mut Param], d_max_norm: f32) -> EngineResult<f32> {
    if !d_max_norm.is_finite() || d_max_norm <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "max gradient norm must be positive, got {d_max_norm}"
        )));
    }
    let v_shared: Vec<&Param> = params.iter().map(|p| &**p).collect();
    let d_norm = grad_norm(&v_shared);
    if d_norm > d_max_norm {
        let d_factor = d_max_norm / d_norm;
        log::debug!("clipping gradient norm {:.4} -> {:.4}", d_norm, d_max_norm);
        scale_gradients(params, d_factor);
    }
    Ok(d_norm)
}

/// Copies `v_src` into `v_dst`; lengths must match.
pub fn copy_into(v_dst: &mut [f32], v_src: &[f32]) -> EngineResult<()> {
    if v_dst.len() != v_src.len() {
        return Err(EngineError::shape("copy_into", &[v_dst.len()], &[v_src.len()]));
    }
    v_dst.copy_from_slice(v_src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn param_with_grad(v_grad: Vec<f32>) -> Param {
        let i_len = v_grad.len();
        let mut p = Param::new("p", Tensor::zeros(&[i_len]).unwrap());
        p.accumulate_grad(&Tensor::new(&[i_len], v_grad).unwrap()).unwrap();
        p
    }

    #[test]
    fn norm_skips_unallocated_gradients() {
        let a = param_with_grad(vec![3.0, 0.0]);
        let b = param_with_grad(vec![0.0, 4.0]);
        let c = Param::new("c", Tensor::zeros(&[3]).unwrap());
        assert!((grad_norm(&[&a, &b, &c]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn clipping_rescales_to_max_norm() {
        let mut a = param_with_grad(vec![3.0, 0.0]);
        let mut b = param_with_grad(vec![0.0, 4.0]);
        let d_before = clip_grad_norm(&mut [&mut a, &mut b], 1.0).unwrap();
        assert!((d_before - 5.0).abs() < 1e-6);
        assert!((grad_norm(&[&a, &b]) - 1.0).abs() < 1e-5);
        assert!((a.grad().unwrap().data()[0] - 0.6).abs() < 1e-6);

        // Below the threshold nothing changes.
        let d_again = clip_grad_norm(&mut [&mut a, &mut b], 10.0).unwrap();
        assert!((d_again - 1.0).abs() < 1e-5);
        assert!(clip_grad_norm(&mut [&mut a], 0.0).is_err());
    }

    #[test]
    fn scale_leaves_unallocated_alone() {
        let mut a = param_with_grad(vec![1.0, -2.0]);
        let mut c = Param::new("c", Tensor::zeros(&[2]).unwrap());
        scale_gradients(&mut [&mut a, &mut c], 0.5);
        assert_eq!(a.grad().unwrap().data(), &[0.5, -1.0]);
        assert!(c.grad().is_none());
    }

    #[test]
    fn copy_into_checks_length() {
        let mut v_dst = vec![0.0; 3];
        assert!(copy_into(&mut v_dst, &[1.0, 2.0]).is_err());
        assert_eq!(v_dst, vec![0.0; 3]);
        copy_into(&mut v_dst, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(v_dst, vec![1.0, 2.0, 3.0]);
    }
}
