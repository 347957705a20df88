//! Port state for the dataflow protocol.
//!
//! An input port holds at most one source and one cached forward value;
//! an output port holds its consumer list, a cached forward value, and
//! the adjoint accumulator filled during the reverse pass. A port is
//! *valid* exactly while it caches a forward value.

use smallvec::SmallVec;

use crate::error::GraphError;
use crate::graph::{InputRef, OutputRef};
use crate::matrix::{all_finite, numel, Matrix};

#[derive(Debug, Default)]
pub(crate) struct InPort {
    pub(crate) source: Option<OutputRef>,
    pub(crate) value: Option<Matrix>,
}

impl InPort {
    pub(crate) fn valid(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutPort {
    pub(crate) consumers: SmallVec<[InputRef; 4]>,
    pub(crate) value: Option<Matrix>,
    pub(crate) accumulator: Option<Matrix>,
    pub(crate) num_backs: usize,
}

impl OutPort {
    pub(crate) fn valid(&self) -> bool {
        self.value.is_some()
    }

    /// A port is ready once every registered consumer has contributed.
    /// A port without consumers is trivially ready.
    pub(crate) fn backprop_ready(&self) -> bool {
        self.num_backs == self.consumers.len()
    }

    /// Fold one adjoint contribution into the accumulator.
    ///
    /// Preconditions are checked in order: the port must be valid, the
    /// adjoint's column count must equal the flattened size of the
    /// cached value, and the adjoint must be non-empty and finite.
    /// Contributions beyond the consumer count are a fatal protocol
    /// violation.
    pub(crate) fn accumulate(&mut self, dodx: Matrix) -> Result<(), GraphError> {
        let value = self.value.as_ref().ok_or(GraphError::BackpropOnInvalid)?;
        let width = numel(value);
        if dodx.ncols() != width {
            return Err(GraphError::AdjointShapeMismatch {
                expected: width,
                actual: dodx.ncols(),
            });
        }
        if numel(&dodx) == 0 {
            return Err(GraphError::EmptyAdjoint);
        }
        if !all_finite(dodx.as_ref()) {
            return Err(GraphError::NonFiniteAdjoint);
        }

        match &mut self.accumulator {
            None => self.accumulator = Some(dodx),
            Some(acc) => {
                if acc.nrows() != dodx.nrows() {
                    return Err(GraphError::AdjointShapeMismatch {
                        expected: acc.nrows(),
                        actual: dodx.nrows(),
                    });
                }
                *acc = &*acc + &dodx;
            }
        }
        self.num_backs += 1;

        if self.num_backs > self.consumers.len() {
            return Err(GraphError::TooManyBackprops {
                got: self.num_backs,
                consumers: self.consumers.len(),
            });
        }
        Ok(())
    }

    /// Right-multiply the accumulator by a local Jacobian.
    ///
    /// Returns `None` while the accumulator is empty; with no Jacobian
    /// the accumulator itself is returned.
    pub(crate) fn chain_backprop(&self, dydx: Option<&Matrix>) -> Option<Matrix> {
        let acc = self.accumulator.as_ref()?;
        Some(match dydx {
            Some(jac) => acc * jac,
            None => acc.clone(),
        })
    }

    pub(crate) fn reset(&mut self) {
        self.value = None;
        self.accumulator = None;
        self.num_backs = 0;
    }
}
