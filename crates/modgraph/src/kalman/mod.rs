//! Kalman-filter modules: prediction, measurement update and the
//! `(x, P)` plumbing shared between them.
//!
//! Modules carrying a state estimate expose an `x` axis (the mean, a
//! column) and a `P` axis (the covariance). The [`KalmanIn`] /
//! [`KalmanOut`] traits attach those paired accessors to the typed
//! handles, so whole filter stages compose with [`link_kalman`]
//! regardless of the concrete module behind each end.

mod predict;
mod update;

pub use predict::Predict;
pub use update::Update;

use faer::Mat;

use crate::error::GraphError;
use crate::graph::{
    BackpropPorts, Graph, InputRef, Module, ModuleRef, OutputRef, PortValues,
};
use crate::matrix::{scale, Matrix};

/// Handle with `(x, P)` input ports.
pub trait KalmanIn {
    fn x_in(&self) -> InputRef;
    fn p_in(&self) -> InputRef;
}

/// Handle with `(x, P)` output ports.
pub trait KalmanOut {
    fn x_out(&self) -> OutputRef;
    fn p_out(&self) -> OutputRef;
}

/// Link both state axes of two filter stages in one step.
pub fn link_kalman(graph: &mut Graph, pre: &impl KalmanOut, post: &impl KalmanIn) {
    graph.link(pre.x_out(), post.x_in());
    graph.link(pre.p_out(), post.p_in());
}

/// Unlink both state axes of two filter stages.
pub fn unlink_kalman(
    graph: &mut Graph,
    pre: &impl KalmanOut,
    post: &impl KalmanIn,
) -> Result<(), GraphError> {
    graph.unlink(pre.x_out(), post.x_in())?;
    graph.unlink(pre.p_out(), post.p_in())
}

/// Constant source for a state pair: replays a stored `(x, P)`.
pub struct Prior {
    x: Matrix,
    p: Matrix,
}

impl Prior {
    pub fn new(x: Matrix, p: Matrix) -> Self {
        Self { x, p }
    }

    pub fn set_x(&mut self, x: Matrix) {
        self.x = x;
    }

    pub fn set_p(&mut self, p: Matrix) {
        self.p = p;
    }
}

impl Module for Prior {
    fn input_count(&self) -> usize {
        0
    }

    fn output_count(&self) -> usize {
        2
    }

    fn foreprop(&mut self, _ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        Ok(vec![self.x.clone(), self.p.clone()])
    }

    fn backprop(&mut self, _ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        Ok(Vec::new())
    }
}

impl KalmanOut for ModuleRef<Prior> {
    fn x_out(&self) -> OutputRef {
        self.nth_output(0)
    }

    fn p_out(&self) -> OutputRef {
        self.nth_output(1)
    }
}

/// Terminal for a state pair; the reverse pass is seeded through the
/// helpers below.
pub struct Posterior;

impl Module for Posterior {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        0
    }

    fn foreprop(&mut self, _ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        Ok(Vec::new())
    }

    fn backprop(&mut self, _ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        // Like sinks, posteriors are seeded externally.
        Ok(Vec::new())
    }
}

impl KalmanIn for ModuleRef<Posterior> {
    fn x_in(&self) -> InputRef {
        self.nth_input(0)
    }

    fn p_in(&self) -> InputRef {
        self.nth_input(1)
    }
}

/// Seed both axes of a posterior and drive the reverse wave.
pub fn backprop_posterior(
    graph: &mut Graph,
    post: ModuleRef<Posterior>,
    dodx: Matrix,
    dodp: Matrix,
) -> Result<(), GraphError> {
    graph.backprop_input(post.x_in(), dodx)?;
    graph.backprop_input(post.p_in(), dodp)
}

/// Seed only the `x` axis; the `P` axis receives a zero adjoint of the
/// matching width.
pub fn backprop_posterior_x(
    graph: &mut Graph,
    post: ModuleRef<Posterior>,
    dodx: Matrix,
) -> Result<(), GraphError> {
    let rows = dodx.nrows();
    let n = dodx.ncols();
    backprop_posterior(graph, post, dodx, Mat::zeros(rows, n * n))
}

/// Seed only the `P` axis; the `x` axis receives a zero adjoint of the
/// matching width.
pub fn backprop_posterior_p(
    graph: &mut Graph,
    post: ModuleRef<Posterior>,
    dodp: Matrix,
) -> Result<(), GraphError> {
    let rows = dodp.nrows();
    let n = (dodp.ncols() as f64).sqrt().round() as usize;
    backprop_posterior(graph, post, Mat::zeros(rows, n), dodp)
}

/// Identity pass-through of `(x, P)` that rescales the two adjoints on
/// the way back, for per-axis gradient conditioning.
pub struct KalmanScaling {
    x_scale: f64,
    p_scale: f64,
}

impl KalmanScaling {
    pub fn new() -> Self {
        Self {
            x_scale: 1.0,
            p_scale: 1.0,
        }
    }

    pub fn set_x_backward_scale(&mut self, s: f64) {
        self.x_scale = s;
    }

    pub fn set_p_backward_scale(&mut self, s: f64) {
        self.p_scale = s;
    }
}

impl Default for KalmanScaling {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for KalmanScaling {
    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        2
    }

    fn foreprop(&mut self, ports: PortValues<'_>) -> Result<Vec<Matrix>, GraphError> {
        Ok(vec![ports.value(0)?.clone(), ports.value(1)?.clone()])
    }

    fn backprop(&mut self, ports: BackpropPorts<'_>) -> Result<Vec<Matrix>, GraphError> {
        let dx = ports.chain(0, None).ok_or(GraphError::EmptyAdjoint)?;
        let dp = ports.chain(1, None).ok_or(GraphError::EmptyAdjoint)?;
        Ok(vec![
            scale(self.x_scale, dx.as_ref()),
            scale(self.p_scale, dp.as_ref()),
        ])
    }
}

impl KalmanIn for ModuleRef<KalmanScaling> {
    fn x_in(&self) -> InputRef {
        self.nth_input(0)
    }

    fn p_in(&self) -> InputRef {
        self.nth_input(1)
    }
}

impl KalmanOut for ModuleRef<KalmanScaling> {
    fn x_out(&self) -> OutputRef {
        self.nth_output(0)
    }

    fn p_out(&self) -> OutputRef {
        self.nth_output(1)
    }
}
