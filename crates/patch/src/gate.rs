//! Rolling hash gate.
//!
//! `res = 7`, then for each byte until a NUL or newline terminator (or the
//! byte bound): `res ^= (res << 5) + (res >> 2) + byte`, in unsigned
//! wrapping arithmetic of a fixed width. The host-side function computes the
//! expected digest of the secret key at build time; `emit_hash_loop` lowers
//! the identical loop into IR so the instrumented program computes the same
//! digest over the candidate buffer at runtime. This is a fast
//! discriminator, not a MAC: collisions are an accepted false-trigger risk.

use crate::Result;
use filigree_core::ir::{
    BinOp, CastOp, InstrKind, Operand, Pred, Subroutine, Terminator, Ty, ValueId,
};
use filigree_core::numeric::Width;
use petgraph::graph::NodeIndex;

/// Digest of `bytes` bounded by `limit` and the NUL/newline terminators,
/// computed in the given accumulator width. Bytes are sign-extended before
/// they enter the mix, exactly as the emitted loop sign-extends its loads.
pub fn rolling_hash(bytes: &[u8], limit: usize, width: Width) -> i64 {
    let mut res: i64 = 7;
    let mut count = 0usize;
    for &b in bytes {
        if count >= limit || b == 0 || b == b'\n' {
            break;
        }
        let c = b as i8 as i64;
        let mixed = width.add(width.add(width.shl(res, 5), width.lshr(res, 2)), c);
        res = width.xor(res, mixed);
        count += 1;
    }
    res
}

/// Handle to an emitted hash loop: the accumulator merge point (readable
/// from any block the exit block dominates) and the block control falls
/// into once the loop finishes.
pub struct HashLoop {
    pub value: ValueId,
    pub exit: NodeIndex,
}

/// Lowers the rolling hash into IR, starting from the un-terminated block
/// `from` and hashing the buffer `buf`.
///
/// With `bound = Some((runtime_len, key_len))` the loop additionally stops
/// after `min(runtime_len, key_len)` bytes — the lesser of the two, so a
/// candidate shorter than the key is never read past its end. A short
/// prefix whose digest collides with the key's can still open the gate;
/// that weakening of the discriminator is part of the detection semantics.
pub fn emit_hash_loop(
    sub: &mut Subroutine,
    from: NodeIndex,
    buf: Operand,
    width: Width,
    bound: Option<(Operand, i64)>,
) -> Result<HashLoop> {
    let acc_ty = match width {
        Width::W8 => Ty::I8,
        Width::W32 => Ty::I32,
        Width::W64 => Ty::I64,
    };

    let count_test = sub.add_block();
    let char_test = sub.add_block();
    let body = sub.add_block();
    let done = sub.add_block();

    // Loop-carried state: cursor, accumulator, and (when bounded) the byte
    // count.
    let cursor = sub.add_phi(count_test, Ty::Ptr, vec![(from, buf)])?;
    let state = sub.add_phi(count_test, acc_ty, vec![(from, Operand::Const(7, acc_ty))])?;
    let count = match bound {
        Some(_) => Some(sub.add_phi(
            count_test,
            Ty::I64,
            vec![(from, Operand::Const(0, Ty::I64))],
        )?),
        None => None,
    };
    sub.set_term(from, Terminator::Jump(count_test))?;

    match (&bound, count) {
        (Some((runtime_len, key_len)), Some(count)) => {
            let below_key = sub.push(count_test, InstrKind::Cmp {
                pred: Pred::Slt,
                width: Width::W64,
                lhs: Operand::Value(count),
                rhs: Operand::Const(*key_len, Ty::I64),
            })?;
            let below_len = sub.push(count_test, InstrKind::Cmp {
                pred: Pred::Slt,
                width: Width::W64,
                lhs: Operand::Value(count),
                rhs: *runtime_len,
            })?;
            let in_bounds = sub.push(count_test, InstrKind::Bin {
                op: BinOp::And,
                width: Width::W8,
                lhs: Operand::Value(below_key),
                rhs: Operand::Value(below_len),
            })?;
            sub.set_term(count_test, Terminator::Branch {
                cond: Operand::Value(in_bounds),
                then_to: char_test,
                else_to: done,
            })?;
        }
        _ => {
            sub.set_term(count_test, Terminator::Jump(char_test))?;
        }
    }

    let ch = sub.push(char_test, InstrKind::Load {
        ty: Ty::I8,
        ptr: Operand::Value(cursor),
    })?;
    let not_nul = sub.push(char_test, InstrKind::Cmp {
        pred: Pred::Ne,
        width: Width::W8,
        lhs: Operand::Value(ch),
        rhs: Operand::Const(0, Ty::I8),
    })?;
    let not_newline = sub.push(char_test, InstrKind::Cmp {
        pred: Pred::Ne,
        width: Width::W8,
        lhs: Operand::Value(ch),
        rhs: Operand::Const(b'\n' as i64, Ty::I8),
    })?;
    let more = sub.push(char_test, InstrKind::Bin {
        op: BinOp::And,
        width: Width::W8,
        lhs: Operand::Value(not_nul),
        rhs: Operand::Value(not_newline),
    })?;
    sub.set_term(char_test, Terminator::Branch {
        cond: Operand::Value(more),
        then_to: body,
        else_to: done,
    })?;

    let wide_ch = sub.push(body, InstrKind::Cast {
        op: CastOp::SExt,
        from: Ty::I8,
        to: acc_ty,
        value: Operand::Value(ch),
    })?;
    let shifted = sub.push(body, InstrKind::Bin {
        op: BinOp::Shl,
        width,
        lhs: Operand::Value(state),
        rhs: Operand::Const(5, acc_ty),
    })?;
    let folded = sub.push(body, InstrKind::Bin {
        op: BinOp::LShr,
        width,
        lhs: Operand::Value(state),
        rhs: Operand::Const(2, acc_ty),
    })?;
    let mixed = sub.push(body, InstrKind::Bin {
        op: BinOp::Add,
        width,
        lhs: Operand::Value(shifted),
        rhs: Operand::Value(folded),
    })?;
    let mixed = sub.push(body, InstrKind::Bin {
        op: BinOp::Add,
        width,
        lhs: Operand::Value(mixed),
        rhs: Operand::Value(wide_ch),
    })?;
    let next_state = sub.push(body, InstrKind::Bin {
        op: BinOp::Xor,
        width,
        lhs: Operand::Value(state),
        rhs: Operand::Value(mixed),
    })?;
    let next_cursor = sub.push(body, InstrKind::Gep {
        base: Operand::Value(cursor),
        offset: Operand::Const(1, Ty::I64),
    })?;
    let next_count = match count {
        Some(count) => Some(sub.push(body, InstrKind::Bin {
            op: BinOp::Add,
            width: Width::W64,
            lhs: Operand::Value(count),
            rhs: Operand::Const(1, Ty::I64),
        })?),
        None => None,
    };
    sub.set_term(body, Terminator::Jump(count_test))?;

    sub.add_incoming(count_test, cursor, body, Operand::Value(next_cursor))?;
    sub.add_incoming(count_test, state, body, Operand::Value(next_state))?;
    if let (Some(count), Some(next_count)) = (count, next_count) {
        sub.add_incoming(count_test, count, body, Operand::Value(next_count))?;
    }

    Ok(HashLoop {
        value: state,
        exit: done,
    })
}
