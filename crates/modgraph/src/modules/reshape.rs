//! Index-mapped embedding of a vector into a matrix template.

use faer::Mat;

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::matrix::{get_linear, numel, set_linear, Matrix};

/// A `(source, destination)` pair: `source` indexes the flat input
/// vector, `destination` is a column-major linear index into the output
/// template.
pub type IndexPair = (usize, usize);

/// Indices filling the diagonal of an `N x N` matrix from a length-`N`
/// vector.
pub fn gen_vec_to_diag_inds(n: usize) -> Vec<IndexPair> {
    (0..n).map(|i| (i, i + i * n)).collect()
}

/// Indices keeping only the diagonal of a dense `N x N` input.
pub fn gen_dense_to_diag_inds(n: usize) -> Vec<IndexPair> {
    (0..n).map(|i| (i + i * n, i + i * n)).collect()
}

/// Indices enumerating the entries on and below the `d`-th sub-diagonal
/// of an `N x N` matrix, column by column. With `d = 0` this is the
/// full lower triangle; with `d = 1` it is the strict one used for
/// unit-diagonal Cholesky factors.
pub fn gen_sub_diag_inds(n: usize, d: usize) -> Vec<IndexPair> {
    let mut inds = Vec::new();
    for j in 0..n.saturating_sub(d) {
        for i in (j + d)..n {
            inds.push((inds.len(), i + j * n));
        }
    }
    inds
}

/// Copies a stored template, then overwrites the configured entries
/// with entries of the flat input. The local Jacobian is the sparse
/// 0/1 matrix with a one at each `(destination, source)`.
pub struct Reshape {
    base_out: Matrix,
    inds: Vec<IndexPair>,
}

impl Reshape {
    pub fn new(base_out: Matrix, inds: Vec<IndexPair>) -> Self {
        debug_assert!(inds.iter().all(|&(_, dst)| dst < numel(&base_out)));
        Self { base_out, inds }
    }

    pub fn set_shape_params(&mut self, base_out: Matrix, inds: Vec<IndexPair>) {
        self.base_out = base_out;
        self.inds = inds;
    }

    pub fn shape_params(&self) -> (&Matrix, &[IndexPair]) {
        (&self.base_out, &self.inds)
    }
}

impl Module for Reshape {
    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        let l = ports.value(0)?;
        let mut out = self.base_out.clone();
        for &(src, dst) in &self.inds {
            if src >= numel(l) {
                return Err(GraphError::ShapeMismatch {
                    lrows: l.nrows(),
                    lcols: l.ncols(),
                    rrows: src + 1,
                    rcols: 1,
                });
            }
            set_linear(&mut out, dst, get_linear(l, src));
        }
        Ok(vec![out])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let in_size = numel(ports.input(0)?);
        let mut dl_dl = Mat::zeros(numel(&self.base_out), in_size);
        for &(src, dst) in &self.inds {
            dl_dl[(dst, src)] = 1.0;
        }
        let d = ports.chain(0, Some(&dl_dl)).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![d])
    }
}

impl ModuleRef<Reshape> {
    pub fn input(&self) -> InputRef {
        self.nth_input(0)
    }

    pub fn output(&self) -> OutputRef {
        self.nth_output(0)
    }
}
