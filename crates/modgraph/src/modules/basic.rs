//! Source and sink terminals.

use crate::error::GraphError;
use crate::graph::{BackpropPorts, InputRef, Module, ModuleRef, OutputRef, PortValues};
use crate::matrix::Matrix;

/// Constant source: one output that replays a stored value.
///
/// During the reverse pass the output's accumulator collects the
/// Jacobian with respect to the stored value; read it back through
/// [`Graph::accumulator`](crate::graph::Graph::accumulator).
pub struct Constant {
    value: Matrix,
}

impl Constant {
    pub fn new(value: Matrix) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Matrix {
        &self.value
    }

    pub fn set_value(&mut self, value: Matrix) {
        self.value = value;
    }
}

impl Module for Constant {
    fn input_count(&self) -> usize {
        0
    }

    fn output_count(&self) -> usize {
        1
    }

    fn foreprop(&mut self, _ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        Ok(vec![self.value.clone()])
    }

    fn backprop(&mut self, _ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        Ok(Vec::new())
    }
}

impl ModuleRef<Constant> {
    pub fn out(&self) -> OutputRef {
        self.nth_output(0)
    }
}

/// Terminal sink: one input, no outputs.
///
/// The forward pass parks the upstream value on the sink's input, where
/// [`Graph::input_value`](crate::graph::Graph::input_value) can read it.
/// The reverse pass is seeded externally by pushing an adjoint into the
/// input with
/// [`Graph::backprop_input`](crate::graph::Graph::backprop_input).
pub struct Sink;

impl Module for Sink {
    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        0
    }

    fn foreprop(&mut self, _ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        Ok(Vec::new())
    }

    fn backprop(&mut self, _ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        // Sinks have no outputs, so the driver never schedules them;
        // adjoints enter through the seeded input instead.
        Ok(Vec::new())
    }
}

impl ModuleRef<Sink> {
    pub fn input(&self) -> InputRef {
        self.nth_input(0)
    }
}
