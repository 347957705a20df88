//! Elementwise arithmetic, the matrix product and scaling.

use faer::Mat;

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::matrix::{kron, numel, scale, Matrix};

fn require_same_shape(l: &Matrix, r: &Matrix) -> Result<(), GraphError> {
    if l.nrows() != r.nrows() || l.ncols() != r.ncols() {
        return Err(GraphError::ShapeMismatch {
            lrows: l.nrows(),
            lcols: l.ncols(),
            rrows: r.nrows(),
            rcols: r.ncols(),
        });
    }
    Ok(())
}

/// `y = L + R`. Both adjoints are the output accumulator unchanged.
pub struct Addition;

impl Module for Addition {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let l = ports.value(0)?;
        let r = ports.value(1)?;
        require_same_shape(l, r)?;
        Ok(vec![l + r])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let d = ports.chain(0, None).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![d.clone(), d])
    }
}

impl ModuleRef<Addition> {
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

/// `y = L - R`. The right adjoint is negated.
pub struct Subtraction;

impl Module for Subtraction {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let l = ports.value(0)?;
        let r = ports.value(1)?;
        require_same_shape(l, r)?;
        Ok(vec![l - r])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let d = ports.chain(0, None).ok_or(GraphError::EmptyAdjoint)?;
        let neg = scale(-1.0, d.as_ref());
        Ok(vec![d, neg])
    }
}

impl ModuleRef<Subtraction> {
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

/// `Y = L * R` with the column-major Kronecker Jacobians
/// `dY/dL = R^T (x) I_m` and `dY/dR = I_n (x) L`.
pub struct Product;

impl Module for Product {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let l = ports.value(0)?;
        let r = ports.value(1)?;
        if l.ncols() != r.nrows() {
            return Err(GraphError::ShapeMismatch {
                lrows: l.nrows(),
                lcols: l.ncols(),
                rrows: r.nrows(),
                rcols: r.ncols(),
            });
        }
        Ok(vec![l * r])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let l = ports.input(0)?;
        let r = ports.input(1)?;
        let m = l.nrows();
        let n = r.ncols();

        let dy_dl = kron(r.transpose(), Mat::identity(m, m).as_ref());
        let dy_dr = kron(Mat::identity(n, n).as_ref(), l.as_ref());

        let do_dl = ports.chain(0, Some(&dy_dl)).ok_or(GraphError::EmptyAdjoint)?;
        let do_dr = ports.chain(0, Some(&dy_dr)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![do_dl, do_dr])
    }
}

impl ModuleRef<Product> {
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

/// `y = s * x` forward, `dL/dx = b * A` backward.
///
/// The backward scale decouples gradient conditioning from the forward
/// value; `with_scale` sets both sides to the same factor.
pub struct Scaling {
    forward: f64,
    backward: f64,
}

impl Scaling {
    pub fn new() -> Self {
        Self {
            forward: 1.0,
            backward: 1.0,
        }
    }

    pub fn with_scale(s: f64) -> Self {
        Self {
            forward: s,
            backward: s,
        }
    }

    pub fn set_forward_scale(&mut self, s: f64) {
        self.forward = s;
    }

    pub fn set_backward_scale(&mut self, s: f64) {
        self.backward = s;
    }
}

impl Default for Scaling {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Scaling {
    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let x = ports.value(0)?;
        Ok(vec![scale(self.forward, x.as_ref())])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let d = ports.chain(0, None).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![scale(self.backward, d.as_ref())])
    }
}

impl ModuleRef<Scaling> {
    pub fn input(&self) -> InputRef {
        self.nth_input(0)
    }

    pub fn output(&self) -> OutputRef {
        self.nth_output(0)
    }
}

/// Elementwise mean over a dynamic set of sources.
///
/// Sources are attached after construction with
/// [`Graph::attach_source`](crate::graph::Graph::attach_source); every
/// source must share one shape. The adjoint to each source is
/// `A * (I / n)`.
pub struct Mean;

impl Module for Mean {
    fn input_count(&self) -> usize {
        0
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let n = ports.count();
        if n == 0 {
            return Err(GraphError::EmptySum);
        }
        let mut acc = ports.value(0)?.clone();
        for slot in 1..n {
            let term = ports.value(slot)?;
            require_same_shape(&acc, term)?;
            acc = &acc + term;
        }
        Ok(vec![scale(1.0 / n as f64, acc.as_ref())])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let n = ports.input_count();
        let dim = numel(ports.output(0)?);
        let dy_dx = scale(1.0 / n as f64, Mat::<f64>::identity(dim, dim).as_ref());
        let d = ports.chain(0, Some(&dy_dx)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![d; n])
    }
}

impl ModuleRef<Mean> {
    pub fn output(&self) -> OutputRef {
        self.nth_output(0)
    }
}
