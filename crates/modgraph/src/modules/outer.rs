//! Outer products of flattened operands.

use faer::Mat;

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::matrix::{kron, vec_of, Matrix};

/// `Y = L * R^T` over the column-major flattenings of both operands.
///
/// With `|L| = p` and `|R| = q`, the local Jacobians are
/// `dY/dL = R (x) I_p` and `dY/dR = I_q (x) L`.
pub struct OuterProduct;

impl Module for OuterProduct {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let l = vec_of(ports.value(0)?);
        let r = vec_of(ports.value(1)?);
        Ok(vec![&l * r.transpose()])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let l = vec_of(ports.input(0)?);
        let r = vec_of(ports.input(1)?);
        let p = l.nrows();
        let q = r.nrows();

        let dy_dl = kron(r.as_ref(), Mat::identity(p, p).as_ref());
        let dy_dr = kron(Mat::identity(q, q).as_ref(), l.as_ref());

        let do_dl = ports.chain(0, Some(&dy_dl)).ok_or(GraphError::EmptyAdjoint)?;
        let do_dr = ports.chain(0, Some(&dy_dr)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![do_dl, do_dr])
    }
}

impl ModuleRef<OuterProduct> {
    pub fn left_in(&self) -> InputRef {
        self.nth_input(0)
    }

    pub fn right_in(&self) -> InputRef {
        self.nth_input(1)
    }

    pub fn output(&self) -> OutputRef {
        self.nth_output(0)
    }
}

/// `Y = x * x^T`: the self outer product, whose Jacobian sums the two
/// partials `x (x) I + I (x) x`.
pub struct RepOuterProduct;

impl Module for RepOuterProduct {
    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = vec_of(ports.value(0)?);
        Ok(vec![&x * x.transpose()])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = vec_of(ports.input(0)?);
        let n = x.nrows();

        let eye = Mat::<f64>::identity(n, n);
        let dy_dx = &kron(x.as_ref(), eye.as_ref()) + &kron(eye.as_ref(), x.as_ref());

        let d = ports.chain(0, Some(&dy_dx)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![d])
    }
}

impl ModuleRef<RepOuterProduct> {
    pub fn input(&self) -> InputRef {
        self.nth_input(0)
    }

    pub fn output(&self) -> OutputRef {
        self.nth_output(0)
    }
}
