use crate::common::{self, assert_identical};
use filigree_core::interp::{ExecEnv, Machine, RtVal};
use filigree_core::ir::{InstrKind, Operand, Subroutine, Terminator, Ty};
use filigree_core::{SecretPair, WatermarkConfig};
use filigree_patch::pass::run_subroutine;
use filigree_patch::patcher::ParseIntPatcher;
use filigree_patch::{CandidateSite, Patcher, SiteKind};

fn config() -> WatermarkConfig {
    WatermarkConfig {
        parse: Some(SecretPair::new("1234", "wxyz")),
        ..Default::default()
    }
}

#[test]
fn key_input_discloses_the_value() {
    common::init_tracing();
    let (mut sub, _) = common::atoi_subject();
    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config(), &mut rng).unwrap());
    sub.verify_merge_totality().unwrap();

    let mut machine = Machine::new(&sub, ExecEnv::default());
    let buf = machine.alloc_cstr(b"1234");
    let outcome = machine.run(&[RtVal::I(buf)]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(1235)));
    assert_eq!(outcome.disclosures, vec![b"wxyz".to_vec()]);
}

#[test]
fn other_inputs_are_trace_identical() {
    let (original, _) = common::atoi_subject();
    let mut patched = original.clone();
    let mut rng = common::rng();
    assert!(run_subroutine(&mut patched, &config(), &mut rng).unwrap());

    for input in [&b"0"[..], b"999", b"-77", b"junk", b"12345", b"123"] {
        let mut machine = Machine::new(&original, ExecEnv::default());
        let buf = machine.alloc_cstr(input);
        let want = machine.run(&[RtVal::I(buf)]).unwrap();

        let mut machine = Machine::new(&patched, ExecEnv::default());
        let buf = machine.alloc_cstr(input);
        let got = machine.run(&[RtVal::I(buf)]).unwrap();

        assert_eq!(got.ret, want.ret, "input {:?}", input);
        assert_eq!(got.merge_log, want.merge_log, "input {:?}", input);
        assert_eq!(got.extern_log, want.extern_log, "input {:?}", input);
        assert!(got.disclosures.is_empty());
    }
}

#[test]
fn strtol_with_constant_base_is_patched() {
    let mut sub = Subroutine::new("hex_parse");
    let buf = sub.add_arg(Ty::Ptr);
    let b0 = sub.add_block();
    let b1 = sub.add_block();
    sub.set_entry_block(b0);
    let r = sub
        .push(b0, InstrKind::Call {
            callee: "strtol".into(),
            args: vec![
                Operand::Value(buf),
                Operand::Const(0, Ty::Ptr),
                Operand::Const(16, Ty::I32),
            ],
            ret: Ty::I64,
        })
        .unwrap();
    sub.set_term(b0, Terminator::Jump(b1)).unwrap();
    sub.set_term(b1, Terminator::Return(Some(Operand::Value(r))))
        .unwrap();

    let config = WatermarkConfig {
        parse: Some(SecretPair::new("c0de", "shhh")),
        ..Default::default()
    };
    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config, &mut rng).unwrap());

    let mut machine = Machine::new(&sub, ExecEnv::default());
    let buf = machine.alloc_cstr(b"c0de");
    let outcome = machine.run(&[RtVal::I(buf)]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(0xc0de)));
    assert_eq!(outcome.disclosures, vec![b"shhh".to_vec()]);
}

#[test]
fn strtol_with_runtime_base_is_rejected() {
    let mut sub = Subroutine::new("dyn_base");
    let buf = sub.add_arg(Ty::Ptr);
    let base = sub.add_arg(Ty::I32);
    let b0 = sub.add_block();
    sub.set_entry_block(b0);
    let r = sub
        .push(b0, InstrKind::Call {
            callee: "strtol".into(),
            args: vec![
                Operand::Value(buf),
                Operand::Const(0, Ty::Ptr),
                Operand::Value(base),
            ],
            ret: Ty::I64,
        })
        .unwrap();
    sub.set_term(b0, Terminator::Return(Some(Operand::Value(r))))
        .unwrap();

    let before = sub.clone();
    let mut rng = common::rng();
    assert!(!run_subroutine(&mut sub, &config(), &mut rng).unwrap());
    assert_identical(&before, &sub);
}

#[test]
fn mismatched_secret_disables_the_kind() {
    let (mut sub, _) = common::atoi_subject();
    let before = sub.clone();
    let config = WatermarkConfig {
        parse: Some(SecretPair::new("ab", "xyz")),
        ..Default::default()
    };
    let mut rng = common::rng();
    assert!(!run_subroutine(&mut sub, &config, &mut rng).unwrap());
    assert_identical(&before, &sub);
}

#[test]
fn direct_entry_point_reports_application() {
    let (mut sub, _) = common::atoi_subject();
    let site = CandidateSite {
        block: sub.body_blocks()[0],
        index: 0,
        kind: SiteKind::ParseInt,
    };
    let mut rng = common::rng();
    let result = ParseIntPatcher
        .patch(&mut sub, &site, &config(), &mut rng)
        .unwrap();
    assert!(result.applied);

    // A second invocation on the same site must refuse to double-patch.
    let result = ParseIntPatcher
        .patch(&mut sub, &site, &config(), &mut rng)
        .unwrap();
    assert!(!result.applied);
}
