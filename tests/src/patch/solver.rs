//! Emitted derivation code must agree with the host-side solvers.

use crate::common;
use filigree_core::interp::{ExecEnv, Machine, RtVal};
use filigree_core::ir::{CastOp, InstrKind, Operand, Subroutine, Terminator, Ty};
use filigree_core::numeric::Width;
use filigree_patch::solver::{arithmetic, polynomial};

#[test]
fn emitted_chain_matches_host_evaluation() {
    let mut rng = common::rng();
    for &(width, key, value) in &[
        (Width::W8, 'k' as i64, 'v' as i64),
        (Width::W32, 1234, 987_654),
        (Width::W64, 1_711_922_400, -42),
    ] {
        let program = arithmetic::solve(width, key, value, &mut rng);

        let mut sub = Subroutine::new("chain");
        let arg_ty = match width {
            Width::W8 => Ty::I8,
            Width::W32 => Ty::I32,
            Width::W64 => Ty::I64,
        };
        let x = sub.add_arg(arg_ty);
        let block = sub.add_block();
        sub.set_entry_block(block);
        let out = arithmetic::emit(&program, &mut sub, block, Operand::Value(x)).unwrap();
        sub.set_term(block, Terminator::Return(Some(out))).unwrap();

        let mut machine = Machine::new(&sub, ExecEnv::default());
        let outcome = machine.run(&[RtVal::I(width.wrap(key))]).unwrap();
        assert_eq!(
            outcome.ret,
            Some(RtVal::I(arithmetic::evaluate(&program, key).unwrap()))
        );
        assert_eq!(outcome.ret, Some(RtVal::I(width.wrap(value))));
    }
}

#[test]
fn emitted_polynomial_matches_host_rounding() {
    let key = b"1234";
    let value = b"wxyz";
    let poly = polynomial::fit_bytes(key, value).unwrap();

    for (i, (&k, &v)) in key.iter().zip(value).enumerate() {
        let encoded = k as i64 + i as i64 * polynomial::STRIDE;

        let mut sub = Subroutine::new("poly");
        let enc = sub.add_arg(Ty::I32);
        let block = sub.add_block();
        sub.set_entry_block(block);
        let x = sub
            .push(block, InstrKind::Cast {
                op: CastOp::SiToFp,
                from: Ty::I32,
                to: Ty::F64,
                value: Operand::Value(enc),
            })
            .unwrap();
        let symbol = poly.emit(&mut sub, block, Operand::Value(x)).unwrap();
        sub.set_term(block, Terminator::Return(Some(symbol))).unwrap();

        let mut machine = Machine::new(&sub, ExecEnv::default());
        let outcome = machine.run(&[RtVal::I(encoded)]).unwrap();
        let host = polynomial::round_to_symbol(poly.evaluate(encoded as f64));
        assert_eq!(outcome.ret, Some(RtVal::I(host)));
        assert_eq!(host, v as i64);
    }
}
