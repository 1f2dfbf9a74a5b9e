//! Site patchers, one per trigger kind.
//!
//! Each patcher validates its site, plans the derivation (gate program and
//! polynomial) entirely host-side, and only then touches the graph: split,
//! gate, arm, link. Any failed precondition rejects the site before the
//! first edit, so a rejected subroutine is byte-for-byte the one that came
//! in.

pub mod alloc;
pub mod parse_int;
pub mod query_time;
pub mod read_str;

pub use alloc::BufferAllocPatcher;
pub use parse_int::ParseIntPatcher;
pub use query_time::QueryTimePatcher;
pub use read_str::ReadStrPatcher;

use crate::solver::Polynomial;
use crate::{Patcher, Result};
use filigree_core::ir::{
    BinOp, CastOp, InstrKind, Operand, Pred, Subroutine, Terminator, Ty,
};
use filigree_core::numeric::Width;
use petgraph::graph::NodeIndex;

/// All four patchers in their dispatch order.
pub fn all() -> Vec<Box<dyn Patcher>> {
    vec![
        Box::new(ParseIntPatcher),
        Box::new(ReadStrPatcher),
        Box::new(QueryTimePatcher),
        Box::new(BufferAllocPatcher),
    ]
}

/// The blocks of an emitted hidden path: control enters at `entry` and the
/// caller wires `exit` to the continuation.
pub(crate) struct HiddenPath {
    pub entry: NodeIndex,
    pub exit: NodeIndex,
}

/// Emits the hidden disclosure path for byte-source sites.
///
/// A fresh buffer of `dest_len + 1` bytes is filled by walking `src` until a
/// NUL or newline (and, when `size_bound` is given, until the runtime size),
/// positionally encoding each byte and pushing it through the fitted
/// polynomial. The terminator byte is written at the loop's exit index, the
/// result goes to the disclosure sink, and the buffer's scope ends right
/// after the call.
pub(crate) fn emit_disclosure_loop(
    sub: &mut Subroutine,
    src: Operand,
    dest_len: Operand,
    size_bound: Option<Operand>,
    poly: &Polynomial,
) -> Result<HiddenPath> {
    let entry = sub.add_block();
    let test = sub.add_block();
    let body = sub.add_block();
    let event = sub.add_block();

    let dest_size = sub.push(entry, InstrKind::Bin {
        op: BinOp::Add,
        width: Width::W64,
        lhs: dest_len,
        rhs: Operand::Const(1, Ty::I64),
    })?;
    let dest = sub.push(entry, InstrKind::Alloc {
        heap: false,
        size: Operand::Value(dest_size),
    })?;
    // The scratch buffer is itself an allocation; mark it so a later sweep
    // cannot instrument the instrumentation.
    sub.mark_processed(dest);
    sub.set_term(entry, Terminator::Jump(test))?;

    let index = sub.add_phi(test, Ty::I64, vec![(entry, Operand::Const(0, Ty::I64))])?;
    let src_addr = sub.push(test, InstrKind::Gep {
        base: src,
        offset: Operand::Value(index),
    })?;
    let ch = sub.push(test, InstrKind::Load {
        ty: Ty::I8,
        ptr: Operand::Value(src_addr),
    })?;
    let not_nul = sub.push(test, InstrKind::Cmp {
        pred: Pred::Ne,
        width: Width::W8,
        lhs: Operand::Value(ch),
        rhs: Operand::Const(0, Ty::I8),
    })?;
    let not_newline = sub.push(test, InstrKind::Cmp {
        pred: Pred::Ne,
        width: Width::W8,
        lhs: Operand::Value(ch),
        rhs: Operand::Const(b'\n' as i64, Ty::I8),
    })?;
    let mut more = sub.push(test, InstrKind::Bin {
        op: BinOp::And,
        width: Width::W8,
        lhs: Operand::Value(not_nul),
        rhs: Operand::Value(not_newline),
    })?;
    if let Some(size) = size_bound {
        let in_bounds = sub.push(test, InstrKind::Cmp {
            pred: Pred::Ult,
            width: Width::W64,
            lhs: Operand::Value(index),
            rhs: size,
        })?;
        more = sub.push(test, InstrKind::Bin {
            op: BinOp::And,
            width: Width::W8,
            lhs: Operand::Value(more),
            rhs: Operand::Value(in_bounds),
        })?;
    }
    sub.set_term(test, Terminator::Branch {
        cond: Operand::Value(more),
        then_to: body,
        else_to: event,
    })?;

    // Positional encoding: x = byte + index * stride.
    let narrow_index = sub.push(body, InstrKind::Cast {
        op: CastOp::Trunc,
        from: Ty::I64,
        to: Ty::I32,
        value: Operand::Value(index),
    })?;
    let position = sub.push(body, InstrKind::Bin {
        op: BinOp::Mul,
        width: Width::W32,
        lhs: Operand::Value(narrow_index),
        rhs: Operand::Const(crate::solver::polynomial::STRIDE, Ty::I32),
    })?;
    let wide_ch = sub.push(body, InstrKind::Cast {
        op: CastOp::ZExt,
        from: Ty::I8,
        to: Ty::I32,
        value: Operand::Value(ch),
    })?;
    let encoded = sub.push(body, InstrKind::Bin {
        op: BinOp::Add,
        width: Width::W32,
        lhs: Operand::Value(wide_ch),
        rhs: Operand::Value(position),
    })?;
    let x = sub.push(body, InstrKind::Cast {
        op: CastOp::SiToFp,
        from: Ty::I32,
        to: Ty::F64,
        value: Operand::Value(encoded),
    })?;
    let symbol = poly.emit(sub, body, Operand::Value(x))?;
    let dest_addr = sub.push(body, InstrKind::Gep {
        base: Operand::Value(dest),
        offset: Operand::Value(index),
    })?;
    sub.push(body, InstrKind::Store {
        ty: Ty::I8,
        value: symbol,
        ptr: Operand::Value(dest_addr),
    })?;
    let next_index = sub.push(body, InstrKind::Bin {
        op: BinOp::Add,
        width: Width::W64,
        lhs: Operand::Value(index),
        rhs: Operand::Const(1, Ty::I64),
    })?;
    sub.set_term(body, Terminator::Jump(test))?;
    sub.add_incoming(test, index, body, Operand::Value(next_index))?;

    let end_addr = sub.push(event, InstrKind::Gep {
        base: Operand::Value(dest),
        offset: Operand::Value(index),
    })?;
    sub.push(event, InstrKind::Store {
        ty: Ty::I8,
        value: Operand::Const(0, Ty::I8),
        ptr: Operand::Value(end_addr),
    })?;
    sub.push(event, InstrKind::Call {
        callee: "printf".into(),
        args: vec![Operand::Value(dest)],
        ret: Ty::I32,
    })?;
    sub.push(event, InstrKind::EndScope {
        ptr: Operand::Value(dest),
    })?;

    Ok(HiddenPath { entry, exit: event })
}
