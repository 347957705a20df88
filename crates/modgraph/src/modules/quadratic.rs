//! Quadratic forms `X^T C X`.

use faer::Mat;

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::matrix::{commutation_matrix, kron, Matrix};

/// `S = X^T C X` over square `n x n` operands.
///
/// The `X` Jacobian keeps the two-term form
/// `I (x) X^T C + T_{n,n} (I (x) X^T C^T)`, valid for non-symmetric `C`.
pub struct Xtcx;

impl Module for Xtcx {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = ports.value(0)?;
        let c = ports.value(1)?;
        Ok(vec![&(x.transpose() * c) * x])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = ports.input(0)?;
        let c = ports.input(1)?;
        let n = x.nrows();

        let eye = Mat::<f64>::identity(n, n);
        let xtc: Matrix = x.transpose() * c;
        let xtct: Matrix = x.transpose() * c.transpose();
        let t = commutation_matrix(n, n);

        let ds_dx = &kron(eye.as_ref(), xtc.as_ref())
            + &(&t * &kron(eye.as_ref(), xtct.as_ref()));
        let ds_dc = kron(x.transpose(), x.transpose());

        let do_dx = ports.chain(0, Some(&ds_dx)).ok_or(GraphError::EmptyAdjoint)?;
        let do_dc = ports.chain(0, Some(&ds_dc)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![do_dx, do_dc])
    }
}

impl ModuleRef<Xtcx> {
    pub fn x_in(&self) -> InputRef {
        self.nth_input(0)
    }

    pub fn c_in(&self) -> InputRef {
        self.nth_input(1)
    }

    pub fn s_out(&self) -> OutputRef {
        self.nth_output(0)
    }
}

/// `S = X^T C X` with `X` held as a fixed constant; only `C` is an
/// input.
pub struct InnerXtcx {
    x: Option<Matrix>,
}

impl InnerXtcx {
    pub fn new() -> Self {
        Self { x: None }
    }

    pub fn set_x(&mut self, x: Matrix) {
        self.x = Some(x);
    }
}

impl Default for InnerXtcx {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for InnerXtcx {
    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = self.x.as_ref().ok_or(GraphError::UnsetParams {
            module: "inner quadratic form",
        })?;
        let c = ports.value(0)?;
        Ok(vec![&(x.transpose() * c) * x])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = self.x.as_ref().ok_or(GraphError::UnsetParams {
            module: "inner quadratic form",
        })?;
        let ds_dc = kron(x.transpose(), x.transpose());
        let d = ports.chain(0, Some(&ds_dc)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![d])
    }
}

impl ModuleRef<InnerXtcx> {
    pub fn c_in(&self) -> InputRef {
        self.nth_input(0)
    }

    pub fn s_out(&self) -> OutputRef {
        self.nth_output(0)
    }
}
