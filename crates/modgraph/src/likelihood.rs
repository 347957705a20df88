//! Gaussian log-likelihood of a sample under a covariance.

use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, Side};

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::matrix::{vec_of, Matrix};

/// `ll = -1/2 (n log 2pi + log|S| + x^T S^-1 x)` for a sample `x` and a
/// symmetric positive definite covariance `S`.
///
/// The forward pass factors `S` once and caches `S^-1` and `S^-1 x` for
/// the reverse pass. Gradients:
///
/// - `dll/dx = -(S^-1 x)^T`
/// - `dll/dS = -1/2 vec(S^-1 - S^-1 x x^T S^-1)^T`
pub struct GaussianLogLikelihood {
    s_inv: Option<Matrix>,
    s_inv_x: Option<Matrix>,
}

impl GaussianLogLikelihood {
    pub const X_IN: usize = 0;
    pub const S_IN: usize = 1;

    pub fn new() -> Self {
        Self {
            s_inv: None,
            s_inv_x: None,
        }
    }
}

impl Default for GaussianLogLikelihood {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for GaussianLogLikelihood {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = vec_of(ports.value(Self::X_IN)?);
        let s = ports.value(Self::S_IN)?;
        let n = x.nrows();

        let chol =
            Llt::new(s.as_ref(), Side::Lower).map_err(|_| GraphError::NotPositiveDefinite)?;
        let s_inv = chol.solve(Mat::<f64>::identity(n, n));
        let s_inv_x = chol.solve(x.as_ref());

        let exponent = (x.transpose() * &s_inv_x)[(0, 0)];
        let factor = chol.L();
        let mut log_det = 0.0;
        for i in 0..n {
            log_det += factor[(i, i)].ln();
        }
        log_det *= 2.0;
        let log_z = n as f64 * (2.0 * std::f64::consts::PI).ln();
        let logpdf = -0.5 * (log_z + log_det + exponent);

        self.s_inv = Some(s_inv);
        self.s_inv_x = Some(s_inv_x);
        Ok(vec![Mat::from_fn(1, 1, |_, _| logpdf)])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = vec_of(ports.input(Self::X_IN)?);
        let s_inv = self.s_inv.as_ref().ok_or(GraphError::UseOfInvalid)?;
        let s_inv_x = self.s_inv_x.as_ref().ok_or(GraphError::UseOfInvalid)?;
        let n = x.nrows();

        let dll_dx = Mat::from_fn(1, n, |_, j| -s_inv_x[(j, 0)]);

        // -1/2 vec(S^-1 - S^-1 x x^T S^-1)^T, row by column-major index.
        let sxxs: Matrix = &(s_inv * &(&x * x.transpose())) * s_inv;
        let dll_ds = Mat::from_fn(1, n * n, |_, k| {
            let (i, j) = (k % n, k / n);
            0.5 * (sxxs[(i, j)] - s_inv[(i, j)])
        });

        let do_dx = ports.chain(0, Some(&dll_dx)).ok_or(GraphError::EmptyAdjoint)?;
        let do_ds = ports.chain(0, Some(&dll_ds)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![do_dx, do_ds])
    }
}

impl ModuleRef<GaussianLogLikelihood> {
    pub fn x_in(&self) -> InputRef {
        self.nth_input(GaussianLogLikelihood::X_IN)
    }

    pub fn s_in(&self) -> InputRef {
        self.nth_input(GaussianLogLikelihood::S_IN)
    }

    pub fn ll_out(&self) -> OutputRef {
        self.nth_output(0)
    }
}
