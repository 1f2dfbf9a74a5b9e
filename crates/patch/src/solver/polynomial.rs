//! Polynomial fitting over positionally encoded symbols.
//!
//! Builds sample points `(key[i] + i * STRIDE, value[i])` — the positional
//! stride keeps repeated symbols at distinct abscissae so the Vandermonde
//! system has a unique solution — and fits the interpolating polynomial in
//! `f64`. Host evaluation and emitted IR share one operation order, so the
//! rounded result agrees on both sides at every trained point. Between
//! trained points nothing is promised, and nothing needs to be: the hidden
//! path only ever evaluates at the trained positions.

use crate::{Error, Result};
use filigree_core::ir::{CastOp, FOp, InstrKind, Operand, Subroutine, Ty};
use filigree_core::numeric::Width;
use petgraph::graph::NodeIndex;

/// Positional multiplier separating symbol positions on the x-axis.
pub const STRIDE: i64 = 255;

/// Interpolating polynomial in the power basis: `sum_j coeffs[j] * x^j`.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coeffs: Vec<f64>,
}

/// Fits a polynomial mapping each positionally encoded key byte to the
/// value byte at the same position.
pub fn fit_bytes(key: &[u8], value: &[u8]) -> Result<Polynomial> {
    if key.is_empty() || key.len() != value.len() {
        return Err(Error::UnsupportedSite(
            "polynomial fit requires equal, non-empty key and value".into(),
        ));
    }
    let xs: Vec<f64> = key
        .iter()
        .enumerate()
        .map(|(i, &b)| (b as i64 + i as i64 * STRIDE) as f64)
        .collect();
    let ys: Vec<f64> = value.iter().map(|&b| b as f64).collect();
    fit(&xs, &ys)
}

/// Scalar-key variant: every position shares the same key, offset by the
/// positional stride. Used by the time-query patcher, whose key is one
/// integer rather than a byte sequence.
pub fn fit_scalar(key: i64, value: &[u8]) -> Result<Polynomial> {
    if value.is_empty() {
        return Err(Error::UnsupportedSite(
            "polynomial fit requires a non-empty value".into(),
        ));
    }
    let xs: Vec<f64> = (0..value.len())
        .map(|i| (key + i as i64 * STRIDE) as f64)
        .collect();
    let ys: Vec<f64> = value.iter().map(|&b| b as f64).collect();
    fit(&xs, &ys)
}

/// Solves the n-by-n Vandermonde system by Gaussian elimination with partial
/// pivoting. The abscissae are pairwise distinct by construction, so a
/// vanishing pivot means the configuration itself is broken.
fn fit(xs: &[f64], ys: &[f64]) -> Result<Polynomial> {
    let n = xs.len();
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(n);
    for (i, &x) in xs.iter().enumerate() {
        let mut row = Vec::with_capacity(n + 1);
        for j in 0..n {
            row.push(x.powi(j as i32));
        }
        row.push(ys[i]);
        rows.push(row);
    }

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&a, &b| {
                rows[a][col]
                    .abs()
                    .partial_cmp(&rows[b][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if rows[pivot_row][col].abs() < 1e-12 {
            return Err(Error::SingularSystem(format!(
                "vanishing pivot in column {col}"
            )));
        }
        rows.swap(col, pivot_row);
        for row in col + 1..n {
            let factor = rows[row][col] / rows[col][col];
            for k in col..=n {
                rows[row][k] -= factor * rows[col][k];
            }
        }
    }

    let mut coeffs = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = rows[row][n];
        for col in row + 1..n {
            acc -= rows[row][col] * coeffs[col];
        }
        coeffs[row] = acc / rows[row][row];
    }
    Ok(Polynomial { coeffs })
}

/// Round-to-nearest for non-negative results: add half, truncate toward
/// zero, reduce to the symbol width. Identical to the emitted sequence.
pub fn round_to_symbol(v: f64) -> i64 {
    Width::W8.wrap((v + 0.5).trunc() as i64)
}

impl Polynomial {
    pub fn degree(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }

    /// Host-side evaluation in the exact operation order [`Polynomial::emit`]
    /// lowers: each term multiplies the variable up to its power and the
    /// coefficient last; terms accumulate left to right.
    pub fn evaluate(&self, x: f64) -> f64 {
        let mut sum: Option<f64> = None;
        for (j, &coeff) in self.coeffs.iter().enumerate() {
            let mut term: Option<f64> = None;
            for _ in 0..j {
                term = Some(match term {
                    None => x,
                    Some(t) => t * x,
                });
            }
            let term = match term {
                None => coeff,
                Some(t) => t * coeff,
            };
            sum = Some(match sum {
                None => term,
                Some(s) => s + term,
            });
        }
        sum.unwrap_or(0.0)
    }

    /// Lowers evaluation plus rounding into `block`; `x` must be an `F64`
    /// operand. Returns the rounded `I8` symbol.
    pub fn emit(
        &self,
        sub: &mut Subroutine,
        block: NodeIndex,
        x: Operand,
    ) -> Result<Operand> {
        let mut sum: Option<Operand> = None;
        for (j, &coeff) in self.coeffs.iter().enumerate() {
            let mut term: Option<Operand> = None;
            for _ in 0..j {
                term = Some(match term {
                    None => x,
                    Some(t) => {
                        let id = sub.push(block, InstrKind::FBin {
                            op: FOp::FMul,
                            lhs: t,
                            rhs: x,
                        })?;
                        Operand::Value(id)
                    }
                });
            }
            let term = match term {
                None => Operand::ConstF(coeff),
                Some(t) => {
                    let id = sub.push(block, InstrKind::FBin {
                        op: FOp::FMul,
                        lhs: t,
                        rhs: Operand::ConstF(coeff),
                    })?;
                    Operand::Value(id)
                }
            };
            sum = Some(match sum {
                None => term,
                Some(s) => {
                    let id = sub.push(block, InstrKind::FBin {
                        op: FOp::FAdd,
                        lhs: s,
                        rhs: term,
                    })?;
                    Operand::Value(id)
                }
            });
        }

        let sum = sum.unwrap_or(Operand::ConstF(0.0));
        let plus_half = sub.push(block, InstrKind::FBin {
            op: FOp::FAdd,
            lhs: sum,
            rhs: Operand::ConstF(0.5),
        })?;
        let rounded = sub.push(block, InstrKind::Cast {
            op: CastOp::FpToSi,
            from: Ty::F64,
            to: Ty::I8,
            value: Operand::Value(plus_half),
        })?;
        Ok(Operand::Value(rounded))
    }
}
