//! Protocol-level tests: validity, invalidation, adjoint accounting and
//! rewiring, independent of any derivative check.

use approx::assert_relative_eq;
use faer::Mat;
use modgraph::error::GraphError;
use modgraph::graph::Graph;
use modgraph::kalman::{
    backprop_posterior, backprop_posterior_x, link_kalman, unlink_kalman, KalmanIn, KalmanOut,
    KalmanScaling, Posterior, Prior,
};
use modgraph::matrix::{numel, random_uniform, Matrix};
use modgraph::modules::{Addition, Constant, Exponential, Mean, Product, Scaling, Sink, Subtraction};
use modgraph::Pipeline;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn mat(rows: usize, cols: usize, seed: u64) -> Matrix {
    let mut rng = StdRng::seed_from_u64(seed);
    random_uniform(&mut rng, rows, cols, -1.0, 1.0)
}

fn assert_mat_eq(a: &Matrix, b: &Matrix, eps: f64) {
    assert_eq!((a.nrows(), a.ncols()), (b.nrows(), b.ncols()));
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            assert_relative_eq!(a[(i, j)], b[(i, j)], epsilon = eps);
        }
    }
}

#[test]
fn test_invalidate_resets_everything() {
    let mut pipe = Pipeline::new();
    let add = pipe.graph_mut().add(Addition);
    let left = pipe.register_input(add.left_in(), mat(2, 2, 1));
    let right = pipe.register_input(add.right_in(), mat(2, 2, 2));
    pipe.register_output(add.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();

    assert!(pipe.graph().output_valid(add.output()));
    assert!(pipe.graph().accumulator(left.out()).is_some());
    assert!(pipe.graph().accumulator(right.out()).is_some());

    pipe.invalidate();

    assert!(!pipe.graph().output_valid(add.output()));
    assert!(!pipe.graph().input_valid(add.left_in()));
    assert!(!pipe.graph().output_valid(left.out()));
    assert!(pipe.graph().accumulator(left.out()).is_none());
    assert!(pipe.graph().accumulator(right.out()).is_none());
    assert!(matches!(
        pipe.get_output(),
        Err(GraphError::UseOfInvalid)
    ));
}

#[test]
fn test_foreprop_twice_without_invalidate() {
    let mut pipe = Pipeline::new();
    let add = pipe.graph_mut().add(Addition);
    pipe.register_input(add.left_in(), mat(2, 2, 3));
    pipe.register_input(add.right_in(), mat(2, 2, 4));
    pipe.register_output(add.output());

    pipe.foreprop().unwrap();
    assert!(matches!(pipe.foreprop(), Err(GraphError::DoubleForeprop)));
}

#[test]
fn test_backprop_twice_without_invalidate() {
    let mut pipe = Pipeline::new();
    let scaling = pipe.graph_mut().add(Scaling::with_scale(2.0));
    pipe.register_input(scaling.input(), mat(2, 2, 5));
    pipe.register_output(scaling.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();
    assert!(matches!(
        pipe.backprop(),
        Err(GraphError::TooManyBackprops {
            got: 2,
            consumers: 1
        })
    ));
}

#[test]
fn test_backprop_before_foreprop() {
    let mut graph = Graph::new();
    let source = graph.add(Constant::new(mat(2, 2, 6)));
    let sink = graph.add(Sink);
    graph.link(source.out(), sink.input());

    assert!(matches!(
        graph.backprop_input(sink.input(), Mat::identity(4, 4)),
        Err(GraphError::BackpropOnInvalid)
    ));
}

#[test]
fn test_adjoint_shape_and_finiteness_checks() {
    let mut graph = Graph::new();
    let source = graph.add(Constant::new(mat(2, 2, 7)));
    let sink = graph.add(Sink);
    graph.link(source.out(), sink.input());
    graph.foreprop(source.id()).unwrap();

    assert!(matches!(
        graph.backprop_input(sink.input(), Mat::identity(3, 3)),
        Err(GraphError::AdjointShapeMismatch {
            expected: 4,
            actual: 3
        })
    ));
    assert!(matches!(
        graph.backprop_input(sink.input(), Mat::from_fn(1, 4, |_, _| f64::NAN)),
        Err(GraphError::NonFiniteAdjoint)
    ));

    // A well-formed adjoint still lands after the rejected attempts.
    graph
        .backprop_input(sink.input(), Mat::identity(4, 4))
        .unwrap();
    assert!(graph.accumulator(source.out()).is_some());
}

#[test]
fn test_empty_adjoint_rejected() {
    let mut graph = Graph::new();
    let source = graph.add(Constant::new(Mat::zeros(0, 0)));
    let sink = graph.add(Sink);
    graph.link(source.out(), sink.input());
    graph.foreprop(source.id()).unwrap();

    assert!(matches!(
        graph.backprop_input(sink.input(), Mat::zeros(0, 0)),
        Err(GraphError::EmptyAdjoint)
    ));
}

#[test]
fn test_unlink_missing() {
    let mut graph = Graph::new();
    let source = graph.add(Constant::new(mat(2, 2, 8)));
    let sink = graph.add(Sink);

    assert!(matches!(
        graph.unlink(source.out(), sink.input()),
        Err(GraphError::UnregisterMissing)
    ));

    graph.link(source.out(), sink.input());
    graph.unlink(source.out(), sink.input()).unwrap();
    assert!(matches!(
        graph.unlink(source.out(), sink.input()),
        Err(GraphError::UnregisterMissing)
    ));
}

#[test]
fn test_relink_reproduces_output_and_jacobian() {
    let mut pipe = Pipeline::new();
    let prod = pipe.graph_mut().add(Product);
    let left = pipe.register_input(prod.left_in(), mat(2, 3, 9));
    pipe.register_input(prod.right_in(), mat(3, 2, 10));
    let sink = pipe.register_output(prod.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();
    let y0 = pipe.get_output().unwrap();
    let j0 = pipe.get_derivative().unwrap();

    // Detach both an interior edge and a parameter edge, then restore.
    pipe.graph_mut().unlink(prod.output(), sink.input()).unwrap();
    pipe.graph_mut().unlink(left.out(), prod.left_in()).unwrap();
    pipe.graph_mut().link(left.out(), prod.left_in());
    pipe.graph_mut().link(prod.output(), sink.input());

    pipe.invalidate();
    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();

    assert_mat_eq(&pipe.get_output().unwrap(), &y0, 0.0);
    assert_mat_eq(&pipe.get_derivative().unwrap(), &j0, 0.0);
}

#[test]
fn test_addition_adjoint_symmetry() {
    let mut pipe = Pipeline::new();
    let add = pipe.graph_mut().add(Addition);
    let left = pipe.register_input(add.left_in(), mat(2, 2, 11));
    let right = pipe.register_input(add.right_in(), mat(2, 2, 12));
    pipe.register_output(add.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();

    let dl = pipe.graph().accumulator(left.out()).unwrap();
    let dr = pipe.graph().accumulator(right.out()).unwrap();
    assert_mat_eq(dl, dr, 0.0);
    assert_mat_eq(dl, &Mat::identity(4, 4), 0.0);
}

#[test]
fn test_subtraction_adjoint_antisymmetry() {
    let mut pipe = Pipeline::new();
    let sub = pipe.graph_mut().add(Subtraction);
    let left = pipe.register_input(sub.left_in(), mat(2, 2, 13));
    let right = pipe.register_input(sub.right_in(), mat(2, 2, 14));
    pipe.register_output(sub.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();

    let dl = pipe.graph().accumulator(left.out()).unwrap();
    let dr = pipe.graph().accumulator(right.out()).unwrap();
    for j in 0..4 {
        for i in 0..4 {
            assert_relative_eq!(dl[(i, j)], -dr[(i, j)]);
        }
    }
}

#[test]
fn test_diamond_fanout_doubles_jacobian() {
    // One constant feeding both addends: y = x + x.
    let mut pipe = Pipeline::new();
    let add = pipe.graph_mut().add(Addition);
    let param = pipe.register_input(add.left_in(), mat(2, 2, 15));
    pipe.graph_mut().link(param.out(), add.right_in());
    pipe.register_output(add.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();

    let jac = pipe.get_derivative().unwrap();
    let expected = Mat::from_fn(4, 4, |i, j| if i == j { 2.0 } else { 0.0 });
    assert_mat_eq(&jac, &expected, 0.0);
}

#[test]
fn test_backprop_linearity() {
    let l_val = mat(2, 3, 16);
    let r_val = mat(3, 2, 17);

    let mut graph = Graph::new();
    let left = graph.add(Constant::new(l_val));
    let right = graph.add(Constant::new(r_val));
    let prod = graph.add(Product);
    let sink = graph.add(Sink);
    graph.link(left.out(), prod.left_in());
    graph.link(right.out(), prod.right_in());
    graph.link(prod.output(), sink.input());

    let mut run = |seed: Matrix| -> (Matrix, Matrix) {
        graph.invalidate(left.id());
        graph.foreprop(left.id()).unwrap();
        graph.foreprop(right.id()).unwrap();
        graph.backprop_input(sink.input(), seed).unwrap();
        (
            graph.accumulator(left.out()).unwrap().clone(),
            graph.accumulator(right.out()).unwrap().clone(),
        )
    };

    let a = mat(1, 4, 18);
    let b = mat(1, 4, 19);
    let combined = Mat::from_fn(1, 4, |i, j| 2.0 * a[(i, j)] + 3.0 * b[(i, j)]);

    let (dla, dra) = run(a);
    let (dlb, drb) = run(b);
    let (dlc, drc) = run(combined);

    let expect_l = Mat::from_fn(dla.nrows(), dla.ncols(), |i, j| {
        2.0 * dla[(i, j)] + 3.0 * dlb[(i, j)]
    });
    let expect_r = Mat::from_fn(dra.nrows(), dra.ncols(), |i, j| {
        2.0 * dra[(i, j)] + 3.0 * drb[(i, j)]
    });
    assert_mat_eq(&dlc, &expect_l, 1e-12);
    assert_mat_eq(&drc, &expect_r, 1e-12);
}

#[test]
fn test_chain_rule_composition() {
    // z = exp(2 x): the pipeline Jacobian must equal the product of the
    // per-module Jacobians in reverse order.
    let x = mat(2, 2, 20);

    let mut pipe = Pipeline::new();
    let scaling = pipe.graph_mut().add(Scaling::with_scale(2.0));
    let exp = pipe.graph_mut().add(Exponential);
    pipe.graph_mut().link(scaling.output(), exp.input());
    pipe.register_input(scaling.input(), x.clone());
    pipe.register_output(exp.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();
    let jac = pipe.get_derivative().unwrap();

    let expected = Mat::from_fn(4, 4, |i, j| {
        if i == j {
            2.0 * (2.0 * x[(i % 2, i / 2)]).exp()
        } else {
            0.0
        }
    });
    assert_mat_eq(&jac, &expected, 1e-12);
}

#[test]
fn test_mean_module() {
    let vals = [mat(2, 2, 21), mat(2, 2, 22), mat(2, 2, 23)];

    let mut pipe = Pipeline::new();
    let mean = pipe.graph_mut().add(Mean);
    for v in &vals {
        let slot = pipe.graph_mut().grow_input(mean.id());
        pipe.register_input(slot, v.clone());
    }
    pipe.register_output(mean.output());

    pipe.foreprop().unwrap();
    pipe.backprop().unwrap();

    let y = pipe.get_output().unwrap();
    for idx in 0..4 {
        let (i, j) = (idx % 2, idx / 2);
        let expected = (vals[0][(i, j)] + vals[1][(i, j)] + vals[2][(i, j)]) / 3.0;
        assert_relative_eq!(y[(idx, 0)], expected, epsilon = 1e-14);
    }

    let jac = pipe.get_derivative().unwrap();
    let expected = Mat::from_fn(4, 12, |i, j| if j % 4 == i { 1.0 / 3.0 } else { 0.0 });
    assert_mat_eq(&jac, &expected, 1e-14);
}

#[test]
fn test_prior_scaling_posterior() {
    let x = mat(3, 1, 24);
    let p = mat(3, 3, 25);

    let mut graph = Graph::new();
    let prior = graph.add(Prior::new(x.clone(), p.clone()));
    let scaling = graph.add(KalmanScaling::new());
    graph.configure(scaling, |m| {
        m.set_x_backward_scale(2.0);
        m.set_p_backward_scale(3.0);
    });
    let post = graph.add(Posterior);
    link_kalman(&mut graph, &prior, &scaling);
    link_kalman(&mut graph, &scaling, &post);

    graph.foreprop(prior.id()).unwrap();
    assert_mat_eq(graph.input_value(post.x_in()).unwrap(), &x, 0.0);
    assert_mat_eq(graph.input_value(post.p_in()).unwrap(), &p, 0.0);

    backprop_posterior(&mut graph, post, Mat::identity(3, 3), Mat::identity(9, 9)).unwrap();
    let dx = graph.accumulator(prior.x_out()).unwrap();
    let dp = graph.accumulator(prior.p_out()).unwrap();
    assert_mat_eq(dx, &Mat::from_fn(3, 3, |i, j| if i == j { 2.0 } else { 0.0 }), 0.0);
    assert_mat_eq(dp, &Mat::from_fn(9, 9, |i, j| if i == j { 3.0 } else { 0.0 }), 0.0);

    // Seeding only the x axis zero-pads the covariance adjoint.
    graph.invalidate(prior.id());
    graph.foreprop(prior.id()).unwrap();
    backprop_posterior_x(&mut graph, post, Mat::identity(3, 3)).unwrap();
    let dp = graph.accumulator(prior.p_out()).unwrap();
    assert_eq!(numel(dp), 27);
    for j in 0..9 {
        for i in 0..3 {
            assert_relative_eq!(dp[(i, j)], 0.0);
        }
    }
}

#[test]
fn test_unlink_kalman_detaches_both_axes() {
    let mut graph = Graph::new();
    let prior = graph.add(Prior::new(mat(3, 1, 26), mat(3, 3, 27)));
    let post = graph.add(Posterior);

    link_kalman(&mut graph, &prior, &post);
    unlink_kalman(&mut graph, &prior, &post).unwrap();
    assert!(matches!(
        unlink_kalman(&mut graph, &prior, &post),
        Err(GraphError::UnregisterMissing)
    ));
    assert_eq!(graph.num_consumers(prior.x_out()), 0);
    assert_eq!(graph.num_consumers(prior.p_out()), 0);
}
