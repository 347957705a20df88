//! Kalman measurement update.

use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, Side};

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::kalman::{KalmanIn, KalmanOut};
use crate::matrix::{
    commutation_matrix, kron, llt_solve_right, numel, scale, sum_matrices, vec_of, Matrix,
};

/// Measurement update with outputs `x+`, `P+`, the innovation `v`, the
/// innovation covariance `S` and the post-fit residual `u`.
///
/// The forward pass caches the Cholesky factorisation of `S` and the
/// gain `K = P C^T S^-1`; the reverse pass aggregates the five outputs'
/// contributions into the three input adjoints by summation, skipping
/// outputs nothing consumes.
pub struct Update {
    obs: Option<Matrix>,
    y: Option<Matrix>,
    x0: Matrix,
    y0: Matrix,
    chol: Option<Llt<f64>>,
    gain: Option<Matrix>,
}

impl Update {
    pub const X_IN: usize = 0;
    pub const P_IN: usize = 1;
    pub const R_IN: usize = 2;
    pub const X_OUT: usize = 0;
    pub const P_OUT: usize = 1;
    pub const V_OUT: usize = 2;
    pub const S_OUT: usize = 3;
    pub const U_OUT: usize = 4;

    pub fn new() -> Self {
        Self {
            obs: None,
            y: None,
            x0: Mat::zeros(0, 1),
            y0: Mat::zeros(0, 1),
            chol: None,
            gain: None,
        }
    }

    /// Linear observation model `C` and observation `y`.
    pub fn set_linear_params(&mut self, c: Matrix, y: Matrix) {
        self.x0 = Mat::zeros(c.ncols(), 1);
        self.y0 = Mat::zeros(c.nrows(), 1);
        self.obs = Some(c);
        self.y = Some(y);
    }

    /// Linearised observation model: Jacobian `G` around `x0`, mapping
    /// to `y0`.
    pub fn set_nonlinear_params(&mut self, g: Matrix, y: Matrix, x0: Matrix, y0: Matrix) {
        self.obs = Some(g);
        self.y = Some(y);
        self.x0 = x0;
        self.y0 = y0;
    }

    pub fn obs_matrix(&self) -> Option<&Matrix> {
        self.obs.as_ref()
    }

    pub fn obs(&self) -> Option<&Matrix> {
        self.y.as_ref()
    }

    fn params(&self) -> Result<(&Matrix, &Matrix), GraphError> {
        match (&self.obs, &self.y) {
            (Some(c), Some(y)) => Ok((c, y)),
            _ => Err(GraphError::UnsetParams {
                module: "kalman update",
            }),
        }
    }
}

impl Default for Update {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Update {
    fn input_count(&self) -> usize {
        3
    }

    fn output_count(&self) -> usize {
        5
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let (c, y) = self.params()?;
        let x = vec_of(ports.value(Self::X_IN)?);
        let p = ports.value(Self::P_IN)?;
        let r = ports.value(Self::R_IN)?;

        let yhat = &(c * &(&x - &self.x0)) + &self.y0;
        let v = y - &yhat;
        let s = &(&(c * p) * c.transpose()) + r;

        let chol =
            Llt::new(s.as_ref(), Side::Lower).map_err(|_| GraphError::NotPositiveDefinite)?;
        let pct: Matrix = p * c.transpose();
        let k = llt_solve_right(&chol, pct.as_ref());

        let next_x = &x + &(&k * &v);
        let next_p = p - &(&(&k * c) * p);
        let post_yhat = &(c * &(&next_x - &self.x0)) + &self.y0;
        let u = y - &post_yhat;

        self.chol = Some(chol);
        self.gain = Some(k);
        Ok(vec![next_x, next_p, v, s, u])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let (c, _) = match (&self.obs, &self.y) {
            (Some(c), Some(y)) => (c, y),
            _ => {
                return Err(GraphError::UnsetParams {
                    module: "kalman update",
                })
            }
        };
        let chol = self.chol.as_ref().ok_or(GraphError::UseOfInvalid)?;
        let k = self.gain.as_ref().ok_or(GraphError::UseOfInvalid)?;

        let n = numel(ports.input(Self::X_IN)?);
        let v = ports.output(Self::V_OUT)?;
        let eye = Mat::<f64>::identity(n, n);
        let kc: Matrix = k * c;

        // x+ against each input.
        let dxout_dxin = &eye - &kc;
        let sv = chol.solve(v.as_ref());
        let ctsv: Matrix = c.transpose() * &sv;
        let dxout_dpin = &kron(ctsv.transpose(), eye.as_ref()) - &kron(ctsv.transpose(), kc.as_ref());
        let dxout_dr = scale(-1.0, kron(sv.transpose(), k.as_ref()).as_ref());

        let do_dxin_x = ports.chain(Self::X_OUT, Some(&dxout_dxin));
        let do_dpin_x = ports.chain(Self::X_OUT, Some(&dxout_dpin));
        let do_dr_x = ports.chain(Self::X_OUT, Some(&dxout_dr));

        // P+ against P and R.
        let eye_nn = Mat::<f64>::identity(n * n, n * n);
        let t_nn = commutation_matrix(n, n);
        let dpout_dpin = &(&eye_nn - &(&(&eye_nn + &t_nn) * &kron(eye.as_ref(), kc.as_ref())))
            + &kron(kc.as_ref(), kc.as_ref());
        let do_dpin_p = ports.chain(Self::P_OUT, Some(&dpout_dpin));
        let do_dr_p = ports.chain(Self::P_OUT, Some(&kron(k.as_ref(), k.as_ref())));

        // Innovation.
        let neg_c = scale(-1.0, c.as_ref());
        let do_dxin_v = ports.chain(Self::V_OUT, Some(&neg_c));

        // Innovation covariance.
        let do_dpin_s = ports.chain(Self::S_OUT, Some(&kron(c.as_ref(), c.as_ref())));
        let do_dr_s = ports.chain(Self::S_OUT, None);

        // Post-fit residual: chain the x+ Jacobians through -C.
        let do_dxin_u = ports.chain(Self::U_OUT, Some(&(&neg_c * &dxout_dxin)));
        let do_dpin_u = ports.chain(Self::U_OUT, Some(&(&neg_c * &dxout_dpin)));
        let do_dr_u = ports.chain(Self::U_OUT, Some(&(&neg_c * &dxout_dr)));

        let do_dxin = sum_matrices([do_dxin_x, do_dxin_v, do_dxin_u])?;
        let do_dpin = sum_matrices([do_dpin_x, do_dpin_p, do_dpin_s, do_dpin_u])?;
        let do_dr = sum_matrices([do_dr_x, do_dr_p, do_dr_s, do_dr_u])?;
        Ok(vec![do_dxin, do_dpin, do_dr])
    }
}

impl ModuleRef<Update> {
    pub fn r_in(&self) -> InputRef {
        self.nth_input(Update::R_IN)
    }

    pub fn v_out(&self) -> OutputRef {
        self.nth_output(Update::V_OUT)
    }

    pub fn s_out(&self) -> OutputRef {
        self.nth_output(Update::S_OUT)
    }

    pub fn u_out(&self) -> OutputRef {
        self.nth_output(Update::U_OUT)
    }
}

impl KalmanIn for ModuleRef<Update> {
    fn x_in(&self) -> InputRef {
        self.nth_input(Update::X_IN)
    }

    fn p_in(&self) -> InputRef {
        self.nth_input(Update::P_IN)
    }
}

impl KalmanOut for ModuleRef<Update> {
    fn x_out(&self) -> OutputRef {
        self.nth_output(Update::X_OUT)
    }

    fn p_out(&self) -> OutputRef {
        self.nth_output(Update::P_OUT)
    }
}
