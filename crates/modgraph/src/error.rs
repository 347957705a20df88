//! Error types for the graph engine.

use thiserror::Error;

/// Errors raised by the port protocol, the pass drivers and the pipeline.
///
/// Every error is fatal for the current pass: the graph is left in an
/// unspecified partially-propagated state and must be fully invalidated
/// before the next pass.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A value was read from a port that has not been forward-propagated.
    #[error("value read from an invalid port")]
    UseOfInvalid,

    /// A forward value arrived at an input port that already holds one.
    #[error("foreprop delivered to an already-valid input port")]
    DoubleForeprop,

    /// An adjoint arrived at an output port with no forward value.
    #[error("backprop delivered to an invalid output port")]
    BackpropOnInvalid,

    /// An adjoint's dimensions disagree with the port value or with the
    /// contributions already accumulated.
    #[error("adjoint dimension mismatch: expected {expected}, got {actual}")]
    AdjointShapeMismatch { expected: usize, actual: usize },

    /// A zero-sized adjoint was pushed into an output port.
    #[error("received an empty adjoint")]
    EmptyAdjoint,

    /// An output port received more adjoint contributions than it has
    /// consumers.
    #[error("received {got} backprops for {consumers} consumers")]
    TooManyBackprops { got: usize, consumers: usize },

    /// An adjoint contained a NaN or infinite entry.
    #[error("non-finite value in adjoint")]
    NonFiniteAdjoint,

    /// An unlink was requested for ports that are not linked.
    #[error("unlink requested for ports that are not linked")]
    UnregisterMissing,

    /// A module was forward-propagated before its parameters were set.
    #[error("{module} parameters not set before foreprop")]
    UnsetParams { module: &'static str },

    /// The flat parameter vector handed to the pipeline has the wrong
    /// length.
    #[error("parameter vector has {actual} elements, expected {expected}")]
    ParamDimMismatch { expected: usize, actual: usize },

    /// A matrix sum was requested but every term was empty.
    #[error("sum over matrices had no non-empty terms")]
    EmptySum,

    /// Forward operands have incompatible shapes.
    #[error("operand shape ({lrows}, {lcols}) incompatible with ({rrows}, {rcols})")]
    ShapeMismatch {
        lrows: usize,
        lcols: usize,
        rrows: usize,
        rcols: usize,
    },

    /// A symmetric factorisation failed; the matrix is not positive
    /// definite.
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,
}
