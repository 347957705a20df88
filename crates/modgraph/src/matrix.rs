//! Dense matrix primitives shared by the whole engine.
//!
//! Every value flowing through the graph is a dynamically sized,
//! column-major `f64` matrix ([`faer::Mat`]). A zero-sized matrix is a
//! valid, distinguishable sentinel. Whenever a matrix is viewed as a
//! vector, the column-major flattening is used: entry `(i, j)` of an
//! `m x n` matrix lands at linear index `i + j * m`.
//!
//! The helpers here are the identities the derivative formulas are
//! written in: the Kronecker product, the commutation (vec-transpose)
//! matrix, stacking/flattening, the skip-empty sum and the
//! right-triangular solve over a symmetric factorisation.

use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, MatRef};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::GraphError;

/// Dense column-major matrix of doubles.
pub type Matrix = Mat<f64>;

/// Number of scalar entries of a matrix.
#[inline]
pub fn numel(m: &Matrix) -> usize {
    m.nrows() * m.ncols()
}

/// Whether a matrix is the zero-sized sentinel.
#[inline]
pub fn is_empty(m: &Matrix) -> bool {
    numel(m) == 0
}

/// Whether every entry is finite.
pub fn all_finite(m: MatRef<'_, f64>) -> bool {
    for j in 0..m.ncols() {
        for i in 0..m.nrows() {
            if !m[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

/// Scalar multiple `s * m`.
pub fn scale(s: f64, m: MatRef<'_, f64>) -> Matrix {
    Mat::from_fn(m.nrows(), m.ncols(), |i, j| s * m[(i, j)])
}

/// Read an entry by its column-major linear index.
#[inline]
pub fn get_linear(m: &Matrix, index: usize) -> f64 {
    m[(index % m.nrows(), index / m.nrows())]
}

/// Write an entry by its column-major linear index.
#[inline]
pub fn set_linear(m: &mut Matrix, index: usize, value: f64) {
    let rows = m.nrows();
    m[(index % rows, index / rows)] = value;
}

/// Column-major flattening of a matrix into a single column.
pub fn vec_of(m: &Matrix) -> Matrix {
    let rows = m.nrows();
    if rows == 0 {
        return Mat::zeros(0, 1);
    }
    Mat::from_fn(numel(m), 1, |i, _| m[(i % rows, i / rows)])
}

/// Inverse of [`vec_of`]: reshape a column into a `rows x cols` matrix.
pub fn unvec(v: MatRef<'_, f64>, rows: usize, cols: usize) -> Matrix {
    debug_assert_eq!(v.nrows() * v.ncols(), rows * cols);
    Mat::from_fn(rows, cols, |i, j| v[(i + j * rows, 0)])
}

/// Kronecker product `a (x) b`.
pub fn kron(a: MatRef<'_, f64>, b: MatRef<'_, f64>) -> Matrix {
    let (ar, ac) = (a.nrows(), a.ncols());
    let (br, bc) = (b.nrows(), b.ncols());
    Mat::from_fn(ar * br, ac * bc, |i, j| {
        a[(i / br, j / bc)] * b[(i % br, j % bc)]
    })
}

/// Commutation matrix `T_{m,n}`: the permutation with
/// `T_{m,n} * vec(A) = vec(A^T)` for any `m x n` matrix `A`.
pub fn commutation_matrix(m: usize, n: usize) -> Matrix {
    let d = m * n;
    let mut t = Mat::zeros(d, d);
    for j in 0..n {
        for i in 0..m {
            t[(j + i * n, i + j * m)] = 1.0;
        }
    }
    t
}

/// Flatten a sequence of matrices into one column, in order.
pub fn flatten_matrices<'a, I>(mats: I) -> Matrix
where
    I: IntoIterator<Item = &'a Matrix>,
{
    let mut data = Vec::new();
    for m in mats {
        let rows = m.nrows();
        for idx in 0..numel(m) {
            data.push(m[(idx % rows, idx / rows)]);
        }
    }
    let n = data.len();
    Mat::from_fn(n, 1, |i, _| data[i])
}

/// Stack matrices side by side. All operands must share a row count.
pub fn hstack(mats: &[Matrix]) -> Result<Matrix, GraphError> {
    let rows = mats.first().map(|m| m.nrows()).unwrap_or(0);
    let mut cols = 0;
    for m in mats {
        if m.nrows() != rows {
            return Err(GraphError::ShapeMismatch {
                lrows: rows,
                lcols: cols,
                rrows: m.nrows(),
                rcols: m.ncols(),
            });
        }
        cols += m.ncols();
    }
    let mut out = Mat::zeros(rows, cols);
    let mut at = 0;
    for m in mats {
        for j in 0..m.ncols() {
            for i in 0..rows {
                out[(i, at + j)] = m[(i, j)];
            }
        }
        at += m.ncols();
    }
    Ok(out)
}

/// Stack matrices on top of each other. All operands must share a
/// column count.
pub fn vstack(mats: &[Matrix]) -> Result<Matrix, GraphError> {
    let cols = mats.first().map(|m| m.ncols()).unwrap_or(0);
    let mut rows = 0;
    for m in mats {
        if m.ncols() != cols {
            return Err(GraphError::ShapeMismatch {
                lrows: rows,
                lcols: cols,
                rrows: m.nrows(),
                rcols: m.ncols(),
            });
        }
        rows += m.nrows();
    }
    let mut out = Mat::zeros(rows, cols);
    let mut at = 0;
    for m in mats {
        for j in 0..cols {
            for i in 0..m.nrows() {
                out[(at + i, j)] = m[(i, j)];
            }
        }
        at += m.nrows();
    }
    Ok(out)
}

/// Sum a sequence of optional matrices, skipping the absent terms.
///
/// All present terms must share one shape. Fails with
/// [`GraphError::EmptySum`] when nothing contributes.
pub fn sum_matrices<I>(terms: I) -> Result<Matrix, GraphError>
where
    I: IntoIterator<Item = Option<Matrix>>,
{
    let mut out: Option<Matrix> = None;
    for term in terms.into_iter().flatten() {
        match &mut out {
            None => out = Some(term),
            Some(acc) => {
                if acc.nrows() != term.nrows() || acc.ncols() != term.ncols() {
                    return Err(GraphError::ShapeMismatch {
                        lrows: acc.nrows(),
                        lcols: acc.ncols(),
                        rrows: term.nrows(),
                        rcols: term.ncols(),
                    });
                }
                *acc = &*acc + &term;
            }
        }
    }
    out.ok_or(GraphError::EmptySum)
}

/// Right solve `B * S^-1 = (S^-1 * B^T)^T` over a Cholesky
/// factorisation of a symmetric matrix `S`.
pub fn llt_solve_right(chol: &Llt<f64>, b: MatRef<'_, f64>) -> Matrix {
    chol.solve(b.transpose()).transpose().to_owned()
}

/// Matrix with entries drawn uniformly from `[lo, hi)`.
pub fn random_uniform<R: Rng>(rng: &mut R, rows: usize, cols: usize, lo: f64, hi: f64) -> Matrix {
    let data: Vec<f64> = (0..rows * cols).map(|_| rng.random_range(lo..hi)).collect();
    Mat::from_fn(rows, cols, |i, j| data[i + j * rows])
}

/// Matrix with standard normal entries.
pub fn random_normal<R: Rng>(rng: &mut R, rows: usize, cols: usize) -> Matrix {
    let data: Vec<f64> = (0..rows * cols).map(|_| rng.sample(StandardNormal)).collect();
    Mat::from_fn(rows, cols, |i, j| data[i + j * rows])
}

/// Random symmetric positive definite matrix `A * A^T`.
pub fn random_spd<R: Rng>(rng: &mut R, n: usize) -> Matrix {
    let a = random_uniform(rng, n, n, -1.0, 1.0);
    &a * a.transpose()
}
