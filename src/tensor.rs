// tensor.rs
// Description: Owned row-major f32 buffer with an explicit 1-4 dimensional
//              shape. Views for the heavy math are borrowed from ndarray on
//              demand; the tensor itself never aliases another buffer.
// History:
// - 2026-10-16: Tensor as the unit passed between layers, checked allocation.

use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{EngineError, EngineResult};

pub const MAX_DIMS: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

fn checked_len(v_shape: &[usize]) -> EngineResult<usize> {
    if v_shape.is_empty() || v_shape.len() > MAX_DIMS {
        return Err(EngineError::shape("tensor_rank", &[MAX_DIMS], v_shape));
    }
    v_shape
        .iter()
        .try_fold(1usize, |i_acc, &i_dim| i_acc.checked_mul(i_dim))
        .ok_or(EngineError::AllocationFailure { elements: usize::MAX })
}

fn try_alloc(i_len: usize, d_value: f32) -> EngineResult<Vec<f32>> {
    let mut v_data: Vec<f32> = Vec::new();
    v_data
        .try_reserve_exact(i_len)
        .map_err(|_| EngineError::AllocationFailure { elements: i_len })?;
    v_data.resize(i_len, d_value);
    Ok(v_data)
}

impl Tensor {
    pub fn new(v_shape: &[usize], v_data: Vec<f32>) -> EngineResult<Self> {
        let i_len = checked_len(v_shape)?;
        if v_data.len() != i_len {
            return Err(EngineError::shape("tensor_new", &[i_len], &[v_data.len()]));
        }
        Ok(Self {
            shape: v_shape.to_vec(),
            data: v_data,
        })
    }

    pub fn zeros(v_shape: &[usize]) -> EngineResult<Self> {
        Self::filled(v_shape, 0.0)
    }

    pub fn ones(v_shape: &[usize]) -> EngineResult<Self> {
        Self::filled(v_shape, 1.0)
    }

    pub fn filled(v_shape: &[usize], d_value: f32) -> EngineResult<Self> {
        let i_len = checked_len(v_shape)?;
        Ok(Self {
            shape: v_shape.to_vec(),
            data: try_alloc(i_len, d_value)?,
        })
    }

    /// Zero-mean normal initialisation (He style when `d_std = sqrt(2 / fan_in)`).
    pub fn random_normal<R: Rng + ?Sized>(
        v_shape: &[usize],
        d_std: f32,
        rng: &mut R,
    ) -> EngineResult<Self> {
        let normal = Normal::new(0.0, d_std.max(0.0))
            .map_err(|e| EngineError::InvalidConfig(format!("normal_init: {e}")))?;
        let mut t = Self::zeros(v_shape)?;
        for d in t.data.iter_mut() {
            *d = normal.sample(rng);
        }
        Ok(t)
    }

    pub fn from_array2(a_matrix: &Array2<f32>) -> Self {
        let (i_rows, i_cols) = a_matrix.dim();
        Self {
            shape: vec![i_rows, i_cols],
            data: a_matrix.iter().copied().collect(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Size of the innermost axis.
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.shape == other.shape
    }

    pub fn expect_shape(&self, v_expected: &[usize], context: &'static str) -> EngineResult<()> {
        if self.shape != v_expected {
            return Err(EngineError::shape(context, v_expected, &self.shape));
        }
        Ok(())
    }

    pub fn expect_same_shape(&self, other: &Tensor, context: &'static str) -> EngineResult<()> {
        self.expect_shape(&other.shape, context)
    }

    pub fn dims2(&self, context: &'static str) -> EngineResult<(usize, usize)> {
        match self.shape.as_slice() {
            [a, b] => Ok((*a, *b)),
            _ => Err(EngineError::shape(context, &[0, 0], &self.shape)),
        }
    }

    pub fn dims3(&self, context: &'static str) -> EngineResult<(usize, usize, usize)> {
        match self.shape.as_slice() {
            [a, b, c] => Ok((*a, *b, *c)),
            _ => Err(EngineError::shape(context, &[0, 0, 0], &self.shape)),
        }
    }

    pub fn dims4(&self, context: &'static str) -> EngineResult<(usize, usize, usize, usize)> {
        match self.shape.as_slice() {
            [a, b, c, d] => Ok((*a, *b, *c, *d)),
            _ => Err(EngineError::shape(context, &[0, 0, 0, 0], &self.shape)),
        }
    }

    pub fn view2(&self) -> EngineResult<ArrayView2<'_, f32>> {
        let (i_rows, i_cols) = self.dims2("tensor_view2")?;
        Ok(ArrayView2::from_shape((i_rows, i_cols), self.data.as_slice())?)
    }

    pub fn view2_mut(&mut self) -> EngineResult<ArrayViewMut2<'_, f32>> {
        let (i_rows, i_cols) = self.dims2("tensor_view2_mut")?;
        Ok(ArrayViewMut2::from_shape((i_rows, i_cols), self.data.as_mut_slice())?)
    }

    pub fn to_array2(&self) -> EngineResult<Array2<f32>> {
        Ok(self.view2()?.to_owned())
    }

    /// New tensor with the same data and a different shape of equal size.
    pub fn reshape(&self, v_shape: &[usize]) -> EngineResult<Tensor> {
        let i_len = checked_len(v_shape)?;
        if i_len != self.data.len() {
            return Err(EngineError::shape("tensor_reshape", &self.shape, v_shape));
        }
        Ok(Tensor {
            shape: v_shape.to_vec(),
            data: self.data.clone(),
        })
    }

    pub fn fill(&mut self, d_value: f32) {
        self.data.iter_mut().for_each(|d| *d = d_value);
    }

    /// Copies `src` into `self`; shapes must agree.
    pub fn copy_from(&mut self, src: &Tensor) -> EngineResult<()> {
        self.expect_same_shape(src, "tensor_copy_from")?;
        self.data.copy_from_slice(&src.data);
        Ok(())
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&d| f(d)).collect(),
        }
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        if !self.same_shape(other) {
            return f32::INFINITY;
        }
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    pub fn allclose(&self, other: &Tensor, d_tol: f32) -> bool {
        self.max_abs_diff(other) <= d_tol
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|d| d.is_finite())
    }
}
