use crate::common::{self, assert_identical};
use filigree_core::interp::{ExecEnv, Machine, RtVal};
use filigree_core::ir::{InstrKind, Operand, Subroutine, Terminator, Ty, ValueId};
use filigree_core::{SecretPair, WatermarkConfig};
use filigree_patch::pass::run_subroutine;

/// f(arg): r = atoi(arg); buf = malloc(16); fgets(buf, 16, 0); free(buf);
/// return r — one candidate per kind the configuration enables.
fn mixed_subject() -> (Subroutine, ValueId) {
    let mut sub = Subroutine::new("mixed_subject");
    let arg = sub.add_arg(Ty::Ptr);
    let b0 = sub.add_block();
    let b1 = sub.add_block();
    let b2 = sub.add_block();
    sub.set_entry_block(b0);
    let r = sub
        .push(b0, InstrKind::Call {
            callee: "atoi".into(),
            args: vec![Operand::Value(arg)],
            ret: Ty::I32,
        })
        .unwrap();
    sub.set_term(b0, Terminator::Jump(b1)).unwrap();
    let buf = sub
        .push(b1, InstrKind::Alloc {
            heap: true,
            size: Operand::Const(16, Ty::I64),
        })
        .unwrap();
    sub.push(b1, InstrKind::Call {
        callee: "fgets".into(),
        args: vec![
            Operand::Value(buf),
            Operand::Const(16, Ty::I32),
            Operand::Const(0, Ty::Ptr),
        ],
        ret: Ty::Ptr,
    })
    .unwrap();
    sub.set_term(b1, Terminator::Jump(b2)).unwrap();
    sub.push(b2, InstrKind::Free {
        ptr: Operand::Value(buf),
    })
    .unwrap();
    sub.set_term(b2, Terminator::Return(Some(Operand::Value(r))))
        .unwrap();
    (sub, arg)
}

fn config() -> WatermarkConfig {
    WatermarkConfig {
        parse: Some(SecretPair::new("1234", "wxyz")),
        buffer: Some(SecretPair::new("mark", "abcd")),
        ..Default::default()
    }
}

#[test]
fn one_sweep_arms_every_enabled_kind() {
    common::init_tracing();
    let (mut sub, _) = mixed_subject();
    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config(), &mut rng).unwrap());
    sub.verify_merge_totality().unwrap();

    let env = ExecEnv {
        input_line: b"mark".to_vec(),
        now: 0,
    };
    let mut machine = Machine::new(&sub, env);
    let arg = machine.alloc_cstr(b"1234");
    let outcome = machine.run(&[RtVal::I(arg)]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(1234)));
    assert_eq!(
        outcome.disclosures,
        vec![b"wxyz".to_vec(), b"abcd".to_vec()]
    );
}

#[test]
fn a_second_sweep_makes_no_further_edits() {
    let (mut sub, _) = mixed_subject();
    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config(), &mut rng).unwrap());
    let once = sub.clone();
    assert!(!run_subroutine(&mut sub, &config(), &mut rng).unwrap());
    assert_identical(&once, &sub);
}

#[test]
fn empty_configuration_is_a_no_op() {
    let (mut sub, _) = mixed_subject();
    let before = sub.clone();
    let mut rng = common::rng();
    assert!(!run_subroutine(&mut sub, &WatermarkConfig::default(), &mut rng).unwrap());
    assert_identical(&before, &sub);
}

#[test]
fn unconfigured_kinds_are_left_alone() {
    // Only the parse kind is configured; the allocation and read sites must
    // survive untouched, which the unchanged block count demonstrates.
    let (mut sub, _) = mixed_subject();
    let blocks_before = sub.body_blocks().len();
    let config = WatermarkConfig {
        parse: Some(SecretPair::new("1234", "wxyz")),
        ..Default::default()
    };
    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config, &mut rng).unwrap());

    // The parse patch adds its continuation and four hidden blocks; nothing
    // else moved.
    assert_eq!(sub.body_blocks().len(), blocks_before + 5);
}
