//! Dense matrices of [`Adouble`] and their exponential.
//!
//! `expm` uses scaling and squaring around a truncated Taylor series. Every
//! step is ordinary `Adouble` arithmetic, so the gradient of each entry is the
//! exact derivative of the computed exponential.

use ndarray::Array2;

use crate::ad::Adouble;
use crate::error::{EngineError, Result};

pub type AdMatrix = Array2<Adouble>;

const TAYLOR_MAX_TERMS: usize = 30;
const SCALED_NORM: f64 = 0.5;

pub fn zeros(rows: usize, cols: usize) -> AdMatrix {
    Array2::from_elem((rows, cols), Adouble::zero())
}

pub fn identity(n: usize) -> AdMatrix {
    Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j { Adouble::one() } else { Adouble::zero() }
    })
}

pub fn matmul(a: &AdMatrix, b: &AdMatrix) -> AdMatrix {
    let (n, inner) = a.dim();
    let m = b.ncols();
    debug_assert_eq!(inner, b.nrows(), "matmul shape mismatch");
    let mut out = zeros(n, m);
    for i in 0..n {
        for k in 0..inner {
            let aik = &a[(i, k)];
            if aik.value() == 0.0 && aik.is_constant() {
                continue;
            }
            for j in 0..m {
                let bkj = &b[(k, j)];
                if bkj.value() == 0.0 && bkj.is_constant() {
                    continue;
                }
                out[(i, j)] += aik * bkj;
            }
        }
    }
    out
}

pub fn scale(a: &AdMatrix, c: f64) -> AdMatrix {
    a.map(|x| x * c)
}

pub fn values(a: &AdMatrix) -> Array2<f64> {
    a.map(Adouble::value)
}

/// Infinity norm of the value part.
pub fn max_row_sum(a: &AdMatrix) -> f64 {
    a.rows()
        .into_iter()
        .map(|row| row.iter().map(|x| x.value().abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

pub fn all_finite(a: &AdMatrix) -> bool {
    a.iter().all(Adouble::is_finite)
}

pub fn expm(a: &AdMatrix) -> Result<AdMatrix> {
    let (n, m) = a.dim();
    if n != m {
        return Err(EngineError::invalid_config(format!(
            "matrix exponential of non-square {n}x{m} matrix"
        )));
    }
    if !all_finite(a) {
        return Err(EngineError::NonFinite(
            "matrix exponential input contains non-finite entries".to_string(),
        ));
    }

    let norm = max_row_sum(a);
    let squarings = if norm > SCALED_NORM {
        (norm / SCALED_NORM).log2().ceil() as i32
    } else {
        0
    };
    let scaled = scale(a, 0.5f64.powi(squarings));

    let mut result = identity(n);
    let mut term = identity(n);
    for k in 1..=TAYLOR_MAX_TERMS {
        term = scale(&matmul(&term, &scaled), 1.0 / k as f64);
        result.zip_mut_with(&term, |r, t| *r += t);
        if max_row_sum(&term) <= f64::EPSILON * max_row_sum(&result) {
            break;
        }
    }
    for _ in 0..squarings {
        result = matmul(&result, &result);
    }

    if !all_finite(&result) {
        return Err(EngineError::NonFinite(format!(
            "matrix exponential overflowed (norm {norm})"
        )));
    }
    Ok(result)
}
