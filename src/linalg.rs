//! Dense linear algebra used by the closed-form merges.
//!
//! All routines operate on `f64` matrices. The accumulated Gram matrices of the regression merge,
//! the Fisher normalisation and the covariance factorisations used by the prototype replay are the
//! only consumers, so only square (and mostly symmetric) inputs are supported.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative threshold under which a pivot or an eigenvalue is considered to be zero.
const RCOND: f64 = 1e-10;

/// Maximum number of Jacobi sweeps before the eigen decomposition gives up refining.
const MAX_SWEEPS: usize = 64;

#[derive(Debug, Error, PartialEq)]
/// Errors related to matrix factorisations.
pub enum LinalgError {
    #[error("expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("the matrix is singular")]
    Singular,
    #[error("the matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("the matrix contains non-finite values")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The floating point precision in which statistics are accumulated.
pub enum Precision {
    /// Every accumulated value is rounded through `f32`.
    Single,
    /// Values are kept in `f64`.
    Double,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Double
    }
}

impl Precision {
    /// Rounds the matrix to this precision in place.
    pub fn round(self, matrix: &mut Array2<f64>) {
        if let Precision::Single = self {
            matrix.mapv_inplace(|x| x as f32 as f64);
        }
    }
}

fn ensure_square(a: &ArrayView2<f64>) -> Result<usize, LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { rows, cols });
    }
    if a.iter().any(|x| !x.is_finite()) {
        return Err(LinalgError::NonFinite);
    }
    Ok(rows)
}

/// Inverts a square matrix by Gauss-Jordan elimination with partial pivoting.
///
/// # Errors
/// Fails if the matrix is not square, contains non-finite values, or if a pivot vanishes relative
/// to the largest absolute entry.
pub fn inverse(a: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    let n = ensure_square(&a)?;
    let scale = a.iter().fold(0_f64, |acc, x| acc.max(x.abs()));
    if n == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    if scale == 0. {
        return Err(LinalgError::Singular);
    }

    let mut lhs = a.to_owned();
    let mut rhs = Array2::<f64>::eye(n);
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                lhs[[i, col]]
                    .abs()
                    .partial_cmp(&lhs[[j, col]].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if lhs[[pivot, col]].abs() <= RCOND * scale {
            return Err(LinalgError::Singular);
        }
        if pivot != col {
            swap_rows(&mut lhs, pivot, col);
            swap_rows(&mut rhs, pivot, col);
        }

        let inv_pivot = 1. / lhs[[col, col]];
        lhs.row_mut(col).mapv_inplace(|x| x * inv_pivot);
        rhs.row_mut(col).mapv_inplace(|x| x * inv_pivot);

        let lhs_row = lhs.row(col).to_owned();
        let rhs_row = rhs.row(col).to_owned();
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = lhs[[row, col]];
            if factor != 0. {
                lhs.row_mut(row).scaled_add(-factor, &lhs_row);
                rhs.row_mut(row).scaled_add(-factor, &rhs_row);
            }
        }
    }
    Ok(rhs)
}

fn swap_rows(m: &mut Array2<f64>, i: usize, j: usize) {
    let (mut first, mut second) = m.multi_slice_mut((s![i, ..], s![j, ..]));
    ndarray::Zip::from(&mut first)
        .and(&mut second)
        .for_each(std::mem::swap);
}

/// Computes the eigen decomposition of a symmetric matrix with cyclic Jacobi rotations.
///
/// Returns the eigenvalues and the matrix whose columns are the corresponding eigenvectors. Only
/// the symmetric part of `a` is taken into account.
///
/// # Errors
/// Fails if the matrix is not square or contains non-finite values.
pub fn symmetric_eigen(a: ArrayView2<f64>) -> Result<(Array1<f64>, Array2<f64>), LinalgError> {
    let n = ensure_square(&a)?;
    let mut m = (&a + &a.t()) * 0.5;
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| m[[i, j]] * m[[i, j]])
            .sum();
        let total: f64 = m.iter().map(|x| x * x).sum();
        if off <= f64::EPSILON * f64::EPSILON * total || off == 0. {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m[[p, q]];
                if apq == 0. {
                    continue;
                }
                let theta = (m[[q, q]] - m[[p, p]]) / (2. * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.).sqrt());
                let t = if theta == 0. { 1. } else { t };
                let c = 1. / (t * t + 1.).sqrt();
                let s = t * c;

                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = c * mkp - s * mkq;
                    m[[k, q]] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = c * mpk - s * mqk;
                    m[[q, k]] = s * mpk + c * mqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    Ok((m.diag().to_owned(), v))
}

/// Computes the Moore-Penrose pseudo-inverse of a symmetric positive semi-definite matrix.
///
/// Eigenvalues below `RCOND` times the largest eigenvalue magnitude are treated as zero, so a
/// rank-deficient (or all-zero) input yields a finite result.
///
/// # Errors
/// Fails if the matrix is not square or contains non-finite values.
pub fn pinverse_symmetric(a: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    let (values, vectors) = symmetric_eigen(a)?;
    let largest = values.iter().fold(0_f64, |acc, x| acc.max(x.abs()));
    let cutoff = RCOND * largest;
    let inverted = values.mapv(|x| if x.abs() > cutoff && x != 0. { 1. / x } else { 0. });
    let scaled = &vectors * &inverted.insert_axis(Axis(0));
    Ok(scaled.dot(&vectors.t()))
}

/// Computes the lower triangular Cholesky factor `L` with `L Lᵀ = a`.
///
/// # Errors
/// Fails if the matrix is not square or not positive definite.
pub fn cholesky(a: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    let n = ensure_square(&a)?;
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let dot: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let d = a[[i, i]] - dot;
                if d <= 0. || !d.is_finite() {
                    return Err(LinalgError::NotPositiveDefinite);
                }
                l[[i, j]] = d.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - dot) / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Computes a square root factor `S` with `S Sᵀ = a` for a symmetric positive semi-definite matrix.
///
/// Tries a Cholesky factorisation first and falls back to the eigen decomposition with negative
/// eigenvalues clipped to zero.
///
/// # Errors
/// Fails if the matrix is not square or contains non-finite values.
pub fn psd_sqrt(a: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    match cholesky(a) {
        Ok(l) => Ok(l),
        Err(LinalgError::NotPositiveDefinite) => {
            let (values, vectors) = symmetric_eigen(a)?;
            let roots = values.mapv(|x| x.max(0.).sqrt());
            Ok(&vectors * &roots.insert_axis(Axis(0)))
        }
        Err(err) => Err(err),
    }
}

/// Blends a Gram matrix with its own diagonal: `alpha * G + (1 - alpha) * diag(G)`.
pub fn damp(gram: &Array2<f64>, alpha: f64) -> Array2<f64> {
    let mut damped = gram * alpha;
    for (i, d) in gram.diag().iter().enumerate() {
        damped[[i, i]] += (1. - alpha) * d;
    }
    damped
}

/// Computes the uncentered Gram matrix `XᵀX` of a batch of row vectors.
pub fn gram(x: ArrayView2<f32>) -> Array2<f64> {
    let x = x.mapv(f64::from);
    x.t().dot(&x)
}
