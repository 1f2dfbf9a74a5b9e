use crate::common;
use filigree_core::interp::{ExecEnv, Machine, RtVal};

#[test]
fn atoi_subject_parses_and_merges() {
    let (sub, _) = common::atoi_subject();

    let mut machine = Machine::new(&sub, ExecEnv::default());
    let buf = machine.alloc_cstr(b"41");
    let outcome = machine.run(&[RtVal::I(buf)]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(42)));
    assert_eq!(outcome.extern_log, vec!["atoi".to_string()]);

    let mut machine = Machine::new(&sub, ExecEnv::default());
    let buf = machine.alloc_cstr(b"-5");
    let outcome = machine.run(&[RtVal::I(buf)]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(-1)));
}

#[test]
fn fgets_subject_reads_the_line() {
    let (sub, _) = common::fgets_subject();
    let env = ExecEnv {
        input_line: b"hello".to_vec(),
        now: 0,
    };
    let mut machine = Machine::new(&sub, env);
    let buf = machine.alloc_buffer(&[], 64, false);
    let outcome = machine.run(&[RtVal::I(buf)]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(b'h' as i64)));
}

#[test]
fn time_subject_reports_the_clock() {
    let sub = common::time_subject();
    let env = ExecEnv {
        input_line: Vec::new(),
        now: 1_711_922_400,
    };
    let mut machine = Machine::new(&sub, env);
    let outcome = machine.run(&[]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(1_711_922_400)));
}

#[test]
fn malloc_subject_frees_exactly_once() {
    let sub = common::malloc_subject();
    let env = ExecEnv {
        input_line: b"data".to_vec(),
        now: 0,
    };
    let mut machine = Machine::new(&sub, env);
    let outcome = machine.run(&[]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(b'd' as i64)));
}
