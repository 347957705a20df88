//! Pipeline harness: pins parameters at the graph entry and sinks at
//! the exit, and drives whole evaluation cycles.

use faer::{Mat, MatRef};

use crate::error::GraphError;
use crate::graph::{Graph, InputRef, ModuleRef, OutputRef};
use crate::matrix::{flatten_matrices, hstack, numel, unvec, Matrix};
use crate::modules::{Constant, Sink};

/// Owns a graph together with one constant module per registered input
/// and one sink per registered output.
///
/// `backprop` seeds each sink with its block of the identity over the
/// concatenated output vector, so after the pass every parameter's
/// accumulator holds its column slice of the full Jacobian.
#[derive(Default)]
pub struct Pipeline {
    graph: Graph,
    params: Vec<ModuleRef<Constant>>,
    sinks: Vec<ModuleRef<Sink>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying graph, for wiring application modules.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable access to the underlying graph.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Pin a parameter: allocate a constant module holding `init` and
    /// link it to the given input port.
    pub fn register_input(&mut self, port: InputRef, init: Matrix) -> ModuleRef<Constant> {
        let param = self.graph.add(Constant::new(init));
        self.graph.link(param.out(), port);
        self.params.push(param);
        param
    }

    /// Pin a terminal: allocate a sink consuming the given output port.
    pub fn register_output(&mut self, port: OutputRef) -> ModuleRef<Sink> {
        let sink = self.graph.add(Sink);
        self.graph.link(port, sink.input());
        self.sinks.push(sink);
        sink
    }

    /// Fire every parameter in registration order; push-based
    /// propagation evaluates the rest of the graph.
    pub fn foreprop(&mut self) -> Result<(), GraphError> {
        for &param in &self.params {
            self.graph.foreprop(param.id())?;
        }
        Ok(())
    }

    /// Seed every sink with its slice of the identity over the
    /// concatenated output vector and drive the reverse pass.
    pub fn backprop(&mut self) -> Result<(), GraphError> {
        let mut widths = Vec::with_capacity(self.sinks.len());
        for &sink in &self.sinks {
            widths.push(numel(self.graph.input_value(sink.input())?));
        }
        let total: usize = widths.iter().sum();

        let mut offset = 0;
        for (&sink, &width) in self.sinks.iter().zip(&widths) {
            let seed = Mat::from_fn(total, width, |i, j| {
                if i == offset + j {
                    1.0
                } else {
                    0.0
                }
            });
            self.graph.backprop_input(sink.input(), seed)?;
            offset += width;
        }
        Ok(())
    }

    /// Invalidate every parameter and every sink, sweeping the whole
    /// reachable graph.
    pub fn invalidate(&mut self) {
        for &param in &self.params {
            self.graph.invalidate(param.id());
        }
        for &sink in &self.sinks {
            self.graph.invalidate(sink.id());
        }
    }

    /// Concatenation of every sink's cached value, column-major.
    pub fn get_output(&self) -> Result<Matrix, GraphError> {
        let mut values = Vec::with_capacity(self.sinks.len());
        for &sink in &self.sinks {
            values.push(self.graph.input_value(sink.input())?);
        }
        Ok(flatten_matrices(values))
    }

    /// Horizontal stack of every parameter's accumulator: the Jacobian
    /// of the concatenated output against the concatenated parameters.
    pub fn get_derivative(&self) -> Result<Matrix, GraphError> {
        let mut blocks = Vec::with_capacity(self.params.len());
        for &param in &self.params {
            let acc = self
                .graph
                .accumulator(param.out())
                .ok_or(GraphError::UseOfInvalid)?;
            blocks.push(acc.clone());
        }
        hstack(&blocks)
    }

    /// Flatten every parameter's stored value into one column.
    pub fn get_params(&self) -> Matrix {
        let values: Vec<&Matrix> = self
            .params
            .iter()
            .map(|&param| self.graph.module(param).value())
            .collect();
        flatten_matrices(values)
    }

    /// Restore every parameter from a flat column, invalidating the
    /// touched subgraphs.
    pub fn set_params(&mut self, flat: MatRef<'_, f64>) -> Result<(), GraphError> {
        let expected = self.param_dim();
        let actual = flat.nrows() * flat.ncols();
        if actual != expected {
            return Err(GraphError::ParamDimMismatch { expected, actual });
        }

        let mut offset = 0;
        for &param in &self.params {
            let (rows, cols) = {
                let value = self.graph.module(param).value();
                (value.nrows(), value.ncols())
            };
            let segment = Mat::from_fn(rows * cols, 1, |i, _| flat[(offset + i, 0)]);
            let value = unvec(segment.as_ref(), rows, cols);
            self.graph.configure(param, |m| m.set_value(value));
            offset += rows * cols;
        }
        Ok(())
    }

    /// Total number of scalar parameters.
    pub fn param_dim(&self) -> usize {
        self.params
            .iter()
            .map(|&param| numel(self.graph.module(param).value()))
            .sum()
    }
}

/// Per-parameter result of a finite-difference sweep.
#[derive(Debug, Clone)]
pub struct DerivativeReport {
    /// Largest absolute deviation between the predicted and observed
    /// output delta, per parameter.
    pub per_param: Vec<f64>,
    /// Largest entry of `per_param`.
    pub max_error: f64,
}

impl DerivativeReport {
    /// Whether every parameter stayed within the tolerance.
    pub fn within(&self, eps: f64) -> bool {
        self.max_error <= eps
    }
}

/// Sweep each parameter by `step`, comparing the analytic Jacobian
/// against the observed change of the pipeline output.
///
/// For each parameter index `i` the predicted delta `J e_i step` is
/// compared entrywise with `y(theta + step e_i) - y(theta)`; parameters
/// whose deviation exceeds `eps` are logged. The original parameters
/// are restored before returning.
pub fn test_derivatives(
    pipeline: &mut Pipeline,
    step: f64,
    eps: f64,
) -> Result<DerivativeReport, GraphError> {
    let theta0 = pipeline.get_params();

    pipeline.invalidate();
    pipeline.foreprop()?;
    pipeline.backprop()?;
    let y0 = pipeline.get_output()?;
    let jacobian = pipeline.get_derivative()?;

    let dim = theta0.nrows();
    let rows = y0.nrows();
    let mut per_param = Vec::with_capacity(dim);

    for i in 0..dim {
        let mut theta = theta0.clone();
        theta[(i, 0)] += step;
        pipeline.set_params(theta.as_ref())?;
        pipeline.invalidate();
        pipeline.foreprop()?;
        let y1 = pipeline.get_output()?;

        let mut worst = 0.0f64;
        for r in 0..rows {
            let predicted = jacobian[(r, i)] * step;
            let observed = y1[(r, 0)] - y0[(r, 0)];
            worst = worst.max((predicted - observed).abs());
        }
        if worst > eps {
            log::warn!("parameter {i}: derivative error {worst:.3e} exceeds {eps:.1e}");
        } else {
            log::debug!("parameter {i}: derivative error {worst:.3e}");
        }
        per_param.push(worst);
    }

    pipeline.set_params(theta0.as_ref())?;
    pipeline.invalidate();

    let max_error = per_param.iter().cloned().fold(0.0f64, f64::max);
    Ok(DerivativeReport {
        per_param,
        max_error,
    })
}
