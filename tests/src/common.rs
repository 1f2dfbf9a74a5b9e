//! Shared builders for synthetic subroutines.

use filigree_core::ir::{
    BinOp, InstrKind, Operand, Pred, Subroutine, Terminator, Ty, ValueId,
};
use filigree_core::numeric::Width;
use filigree_core::seed::Seed;
use rand::rngs::StdRng;

pub fn rng() -> StdRng {
    Seed::from_hex("0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef")
        .unwrap()
        .create_deterministic_rng()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .try_init();
}

/// `f(buf)`: parses `buf`, branches on the sign of the result and joins the
/// two arms at a merge point.
///
/// ```text
/// b0: r = atoi(buf); t = r + 1; branch (r < 0) -> neg | pos
/// neg: jump merge            pos: jump merge
/// merge: s = phi [(neg, -1), (pos, t)]; return s
/// ```
pub fn atoi_subject() -> (Subroutine, ValueId) {
    let mut sub = Subroutine::new("parse_subject");
    let buf = sub.add_arg(Ty::Ptr);
    let b0 = sub.add_block();
    let neg = sub.add_block();
    let pos = sub.add_block();
    let merge = sub.add_block();
    sub.set_entry_block(b0);

    let r = sub
        .push(b0, InstrKind::Call {
            callee: "atoi".into(),
            args: vec![Operand::Value(buf)],
            ret: Ty::I32,
        })
        .unwrap();
    let t = sub
        .push(b0, InstrKind::Bin {
            op: BinOp::Add,
            width: Width::W32,
            lhs: Operand::Value(r),
            rhs: Operand::Const(1, Ty::I32),
        })
        .unwrap();
    let below = sub
        .push(b0, InstrKind::Cmp {
            pred: Pred::Slt,
            width: Width::W32,
            lhs: Operand::Value(r),
            rhs: Operand::Const(0, Ty::I32),
        })
        .unwrap();
    sub.set_term(b0, Terminator::Branch {
        cond: Operand::Value(below),
        then_to: neg,
        else_to: pos,
    })
    .unwrap();
    sub.set_term(neg, Terminator::Jump(merge)).unwrap();
    sub.set_term(pos, Terminator::Jump(merge)).unwrap();
    let s = sub
        .add_phi(merge, Ty::I32, vec![
            (neg, Operand::Const(-1, Ty::I32)),
            (pos, Operand::Value(t)),
        ])
        .unwrap();
    sub.set_term(merge, Terminator::Return(Some(Operand::Value(s))))
        .unwrap();
    sub.verify_merge_totality().unwrap();
    (sub, buf)
}

/// `f(buf)`: reads a line into `buf` and returns its first byte.
pub fn fgets_subject() -> (Subroutine, ValueId) {
    let mut sub = Subroutine::new("read_subject");
    let buf = sub.add_arg(Ty::Ptr);
    let b0 = sub.add_block();
    let b1 = sub.add_block();
    sub.set_entry_block(b0);

    sub.push(b0, InstrKind::Call {
        callee: "fgets".into(),
        args: vec![
            Operand::Value(buf),
            Operand::Const(64, Ty::I32),
            Operand::Const(0, Ty::Ptr),
        ],
        ret: Ty::Ptr,
    })
    .unwrap();
    sub.set_term(b0, Terminator::Jump(b1)).unwrap();
    let first = sub
        .push(b1, InstrKind::Load {
            ty: Ty::I8,
            ptr: Operand::Value(buf),
        })
        .unwrap();
    sub.set_term(b1, Terminator::Return(Some(Operand::Value(first))))
        .unwrap();
    (sub, buf)
}

/// `f()`: queries the clock and returns the raw seconds.
pub fn time_subject() -> Subroutine {
    let mut sub = Subroutine::new("time_subject");
    let b0 = sub.add_block();
    let b1 = sub.add_block();
    sub.set_entry_block(b0);
    let t = sub
        .push(b0, InstrKind::Call {
            callee: "time".into(),
            args: vec![Operand::Const(0, Ty::Ptr)],
            ret: Ty::I64,
        })
        .unwrap();
    sub.set_term(b0, Terminator::Jump(b1)).unwrap();
    sub.set_term(b1, Terminator::Return(Some(Operand::Value(t))))
        .unwrap();
    sub
}

/// `f()`: heap buffer filled from input, read once, then released.
///
/// ```text
/// b0: buf = malloc(16); fgets(buf, 16, 0); jump b1
/// b1: x = load buf[0]; jump b2
/// b2: free(buf); return x
/// ```
pub fn malloc_subject() -> Subroutine {
    let mut sub = Subroutine::new("buffer_subject");
    let b0 = sub.add_block();
    let b1 = sub.add_block();
    let b2 = sub.add_block();
    sub.set_entry_block(b0);

    let buf = sub
        .push(b0, InstrKind::Alloc {
            heap: true,
            size: Operand::Const(16, Ty::I64),
        })
        .unwrap();
    sub.push(b0, InstrKind::Call {
        callee: "fgets".into(),
        args: vec![
            Operand::Value(buf),
            Operand::Const(16, Ty::I32),
            Operand::Const(0, Ty::Ptr),
        ],
        ret: Ty::Ptr,
    })
    .unwrap();
    sub.set_term(b0, Terminator::Jump(b1)).unwrap();
    let x = sub
        .push(b1, InstrKind::Load {
            ty: Ty::I8,
            ptr: Operand::Value(buf),
        })
        .unwrap();
    sub.set_term(b1, Terminator::Jump(b2)).unwrap();
    sub.push(b2, InstrKind::Free {
        ptr: Operand::Value(buf),
    })
    .unwrap();
    sub.set_term(b2, Terminator::Return(Some(Operand::Value(x))))
        .unwrap();
    sub
}

/// Structural equality: same blocks with identical contents and the same
/// edge multiset.
pub fn assert_identical(before: &Subroutine, after: &Subroutine) {
    let a: Vec<_> = before.cfg.node_indices().collect();
    let b: Vec<_> = after.cfg.node_indices().collect();
    assert_eq!(a, b, "block sets differ");
    for (&na, &nb) in a.iter().zip(&b) {
        assert_eq!(before.cfg[na], after.cfg[nb], "block {} differs", na.index());
    }
    assert_eq!(before.cfg.edge_count(), after.cfg.edge_count());
}
