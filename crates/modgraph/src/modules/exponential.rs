//! Elementwise exponential.

use faer::Mat;

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::matrix::{numel, vec_of, Matrix};

/// `y = exp(x)` elementwise. The local Jacobian is `diag(vec(y))`,
/// read from the cached output value.
pub struct Exponential;

impl Module for Exponential {
    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = ports.value(0)?;
        Ok(vec![Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
            x[(i, j)].exp()
        })])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let y = ports.output(0)?;
        let n = numel(y);
        let v = vec_of(y);
        let dy_dx = Mat::from_fn(n, n, |i, j| if i == j { v[(i, 0)] } else { 0.0 });

        let d = ports.chain(0, Some(&dy_dx)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![d])
    }
}

impl ModuleRef<Exponential> {
    pub fn input(&self) -> InputRef {
        self.nth_input(0)
    }

    pub fn output(&self) -> OutputRef {
        self.nth_output(0)
    }
}
