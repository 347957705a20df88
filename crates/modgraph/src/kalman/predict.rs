//! Kalman prediction step.

use faer::Mat;

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::kalman::{KalmanIn, KalmanOut};
use crate::matrix::{kron, vec_of, Matrix};

/// `x+ = A (x - x0) + y0`, `P+ = A P A^T + Q`.
///
/// The linear parameterisation sets `x0 = y0 = 0`; the nonlinear one
/// supplies the Jacobian `F` and the linearisation points. Jacobians:
/// `dx+/dx = A`, `dP+/dP = A (x) A`, and the `Q` adjoint is the `P+`
/// accumulator unchanged.
pub struct Predict {
    trans: Option<Matrix>,
    x0: Matrix,
    y0: Matrix,
}

impl Predict {
    pub const X_IN: usize = 0;
    pub const P_IN: usize = 1;
    pub const Q_IN: usize = 2;
    pub const X_OUT: usize = 0;
    pub const P_OUT: usize = 1;

    pub fn new() -> Self {
        Self {
            trans: None,
            x0: Mat::zeros(0, 1),
            y0: Mat::zeros(0, 1),
        }
    }

    /// Linear transition `A`.
    pub fn set_linear_params(&mut self, a: Matrix) {
        let n = a.nrows();
        self.x0 = Mat::zeros(n, 1);
        self.y0 = Mat::zeros(n, 1);
        self.trans = Some(a);
    }

    /// Linearised transition: Jacobian `F` around `x0`, mapping to
    /// `y0`.
    pub fn set_nonlinear_params(&mut self, f: Matrix, x0: Matrix, y0: Matrix) {
        self.trans = Some(f);
        self.x0 = x0;
        self.y0 = y0;
    }

    fn trans(&self) -> Result<&Matrix, GraphError> {
        self.trans.as_ref().ok_or(GraphError::UnsetParams {
            module: "kalman predict",
        })
    }
}

impl Default for Predict {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Predict {
    fn input_count(&self) -> usize {
        3
    }

    fn output_count(&self) -> usize {
        2
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let a = self.trans()?;
        let x = vec_of(ports.value(Self::X_IN)?);
        let p = ports.value(Self::P_IN)?;
        let q = ports.value(Self::Q_IN)?;

        let delta = &x - &self.x0;
        let next_x = &(a * &delta) + &self.y0;
        let next_p = &(&(a * p) * a.transpose()) + q;
        Ok(vec![next_x, next_p])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let a = self.trans()?;

        let do_dx = ports
            .chain(Self::X_OUT, Some(a))
            .ok_or(GraphError::EmptyAdjoint)?;

        let dpout_dpin = kron(a.as_ref(), a.as_ref());
        let do_dp = ports
            .chain(Self::P_OUT, Some(&dpout_dpin))
            .ok_or(GraphError::EmptyAdjoint)?;
        let do_dq = ports
            .chain(Self::P_OUT, None)
            .ok_or(GraphError::EmptyAdjoint)?;

        Ok(vec![do_dx, do_dp, do_dq])
    }
}

impl ModuleRef<Predict> {
    pub fn q_in(&self) -> InputRef {
        self.nth_input(Predict::Q_IN)
    }
}

impl KalmanIn for ModuleRef<Predict> {
    fn x_in(&self) -> InputRef {
        self.nth_input(Predict::X_IN)
    }

    fn p_in(&self) -> InputRef {
        self.nth_input(Predict::P_IN)
    }
}

impl KalmanOut for ModuleRef<Predict> {
    fn x_out(&self) -> OutputRef {
        self.nth_output(Predict::X_OUT)
    }

    fn p_out(&self) -> OutputRef {
        self.nth_output(Predict::P_OUT)
    }
}
