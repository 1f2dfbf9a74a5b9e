//! Closed-form key-to-value arithmetic.
//!
//! Synthesizes a short multiply / modulo / (optional) divide / add chain
//! whose runtime evaluation on the key yields the value. The corrective
//! constant is derived with the same fixed-width wrapping arithmetic the
//! emitted instructions perform, so replaying the chain inside the target
//! program reproduces the value bit-for-bit.

use crate::{Error, Result};
use filigree_core::ir::{BinOp, InstrKind, Operand, Subroutine, Ty};
use filigree_core::numeric::Width;
use petgraph::graph::NodeIndex;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One step of an obfuscation program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ObfStep {
    Mul(i64),
    Mod(i64),
    Div(i64),
    Add(i64),
}

/// An ordered arithmetic step sequence annotated with its integer domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObfuscationProgram {
    pub width: Width,
    pub steps: Vec<ObfStep>,
}

/// Synthesizes a program mapping `key` to `value` in the given domain.
///
/// Parameter ranges are strictly positive by construction, so the divide and
/// modulo steps can never see a zero; if one ever does, the step is reported
/// and omitted rather than emitted.
pub fn solve(width: Width, key: i64, value: i64, rng: &mut StdRng) -> ObfuscationProgram {
    // The 8-bit domain needs in-domain constants; wider domains use the
    // roomier ranges.
    let (mod_range, div_max) = match width {
        Width::W8 => (100..=127i64, 8i64),
        _ => (1000..=5999i64, 15i64),
    };

    let mut steps = Vec::with_capacity(4);
    let mut cur = width.wrap(key);

    let multiplier = rng.random_range(1..=20i64);
    cur = width.mul(cur, multiplier);
    steps.push(ObfStep::Mul(multiplier));

    let modulus = rng.random_range(mod_range);
    match width.srem(cur, modulus) {
        Ok(v) => {
            cur = v;
            steps.push(ObfStep::Mod(modulus));
        }
        Err(_) => tracing::warn!("arithmetic guard: zero modulus skipped"),
    }

    if rng.random_range(0..10) >= 3 {
        let divisor = rng.random_range(1..=div_max);
        match width.sdiv(cur, divisor) {
            Ok(v) => {
                cur = v;
                steps.push(ObfStep::Div(divisor));
            }
            Err(_) => tracing::warn!("arithmetic guard: zero divisor skipped"),
        }
    }

    let correction = width.sub(width.wrap(value), cur);
    steps.push(ObfStep::Add(correction));

    ObfuscationProgram { width, steps }
}

/// Replays the program on `key` in its declared domain.
pub fn evaluate(program: &ObfuscationProgram, key: i64) -> Result<i64> {
    let w = program.width;
    let mut cur = w.wrap(key);
    for step in &program.steps {
        cur = match step {
            ObfStep::Mul(m) => w.mul(cur, *m),
            ObfStep::Mod(m) => w
                .srem(cur, *m)
                .map_err(|_| Error::ArithmeticGuard("modulo by zero".into()))?,
            ObfStep::Div(d) => w
                .sdiv(cur, *d)
                .map_err(|_| Error::ArithmeticGuard("division by zero".into()))?,
            ObfStep::Add(c) => w.add(cur, *c),
        };
    }
    Ok(cur)
}

/// Lowers the program into `block`, returning the operand holding the final
/// value. The emitted instructions perform exactly the arithmetic
/// [`evaluate`] performs.
pub fn emit(
    program: &ObfuscationProgram,
    sub: &mut Subroutine,
    block: NodeIndex,
    input: Operand,
) -> Result<Operand> {
    let w = program.width;
    let ty = match w {
        Width::W8 => Ty::I8,
        Width::W32 => Ty::I32,
        Width::W64 => Ty::I64,
    };
    let mut cur = input;
    for step in &program.steps {
        let (op, constant) = match step {
            ObfStep::Mul(m) => (BinOp::Mul, *m),
            ObfStep::Mod(m) => (BinOp::SRem, *m),
            ObfStep::Div(d) => (BinOp::SDiv, *d),
            ObfStep::Add(c) => (BinOp::Add, *c),
        };
        let id = sub.push(block, InstrKind::Bin {
            op,
            width: w,
            lhs: cur,
            rhs: Operand::Const(constant, ty),
        })?;
        cur = Operand::Value(id);
    }
    Ok(cur)
}
