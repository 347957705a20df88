//! modgraph - modular differentiable computation over dense matrices.
//!
//! This crate evaluates directed acyclic graphs of matrix *modules* and
//! the Jacobian of any terminal output with respect to any parameter,
//! without derivative code at the call site. The motivating application
//! is parameterised Kalman-filter pipelines whose parameters are
//! learned by gradient descent; the engine itself is generic over the
//! module library.
//!
//! # Architecture
//!
//! ```text
//! Pipeline                      parameters, sinks, whole-cycle drivers
//!     |
//! Graph (arena)                 ModuleRef<M> / InputRef / OutputRef,
//!     |                         link/unlink, pass worklists
//! Module (trait)                foreprop / backprop over port views
//!     |
//! ports                         cached values, adjoint accumulators
//! ```
//!
//! Evaluation is push-based: firing a source synchronously evaluates
//! every module reachable through valid inputs, each module firing
//! exactly once as its last input arrives. The reverse pass mirrors
//! this, summing adjoint contributions at every output port and firing
//! a module once all of its outputs have heard from all of their
//! consumers. Between cycles the graph must be invalidated.
//!
//! Adjoints follow one convention throughout: the accumulator at an
//! output port has one row per scalar of interest and one column per
//! entry of the port's value (column-major); a module right-multiplies
//! it by the local Jacobian `dy/dx` to obtain the adjoint it pushes
//! upstream.
//!
//! # Example
//!
//! ```
//! use modgraph::matrix::Matrix;
//! use modgraph::modules::Scaling;
//! use modgraph::Pipeline;
//!
//! let mut pipeline = Pipeline::new();
//! let scaling = pipeline.graph_mut().add(Scaling::with_scale(3.0));
//! pipeline.register_input(scaling.input(), Matrix::identity(2, 2));
//! pipeline.register_output(scaling.output());
//!
//! pipeline.foreprop().unwrap();
//! pipeline.backprop().unwrap();
//!
//! let y = pipeline.get_output().unwrap();
//! assert_eq!(y.nrows(), 4);
//! assert_eq!(y[(0, 0)], 3.0);
//!
//! let jacobian = pipeline.get_derivative().unwrap();
//! assert_eq!((jacobian.nrows(), jacobian.ncols()), (4, 4));
//! assert_eq!(jacobian[(0, 0)], 3.0);
//! assert_eq!(jacobian[(1, 0)], 0.0);
//! ```

pub mod error;
pub mod graph;
pub mod kalman;
pub mod likelihood;
pub mod matrix;
pub mod modules;
pub mod pipeline;

pub use error::GraphError;
pub use graph::{
    BackpropPorts, Graph, InputRef, Module, ModuleId, ModuleRef, OutputRef, PortValues,
};
pub use matrix::Matrix;
pub use pipeline::{test_derivatives, DerivativeReport, Pipeline};
