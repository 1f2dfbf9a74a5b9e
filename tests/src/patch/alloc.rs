use crate::common;
use filigree_core::interp::{ExecEnv, Machine, RtVal};
use filigree_core::ir::{InstrKind, Operand, Subroutine, Terminator, Ty};
use filigree_core::{SecretPair, WatermarkConfig};
use filigree_patch::pass::run_subroutine;

fn config() -> WatermarkConfig {
    WatermarkConfig {
        buffer: Some(SecretPair::new("mark", "xyzw")),
        ..Default::default()
    }
}

fn filled_with(line: &[u8]) -> ExecEnv {
    ExecEnv {
        input_line: line.to_vec(),
        now: 0,
    }
}

#[test]
fn keyed_heap_buffer_discloses_before_the_free() {
    let mut sub = common::malloc_subject();
    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config(), &mut rng).unwrap());
    sub.verify_merge_totality().unwrap();

    // The interpreter poisons freed regions, so this run also proves the
    // hash and the hidden path read the buffer strictly before its release.
    let mut machine = Machine::new(&sub, filled_with(b"mark"));
    let outcome = machine.run(&[]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(b'm' as i64)));
    assert_eq!(outcome.disclosures, vec![b"xyzw".to_vec()]);
}

#[test]
fn other_contents_behave_identically() {
    let original = common::malloc_subject();
    let mut patched = original.clone();
    let mut rng = common::rng();
    assert!(run_subroutine(&mut patched, &config(), &mut rng).unwrap());

    for line in [&b"data"[..], b"maro", b"mar", b""] {
        let mut machine = Machine::new(&original, filled_with(line));
        let want = machine.run(&[]).unwrap();
        let mut machine = Machine::new(&patched, filled_with(line));
        let got = machine.run(&[]).unwrap();
        assert_eq!(got.ret, want.ret, "line {:?}", line);
        assert_eq!(got.extern_log, want.extern_log, "line {:?}", line);
        assert!(got.disclosures.is_empty(), "line {:?}", line);
    }
}

#[test]
fn stack_buffer_site_uses_the_scope_end() {
    // f(): buf = alloca(8); fgets(buf, 8, 0); x = load buf; end-of-scope;
    // return x
    let mut sub = Subroutine::new("stack_subject");
    let b0 = sub.add_block();
    let b1 = sub.add_block();
    let b2 = sub.add_block();
    sub.set_entry_block(b0);
    let buf = sub
        .push(b0, InstrKind::Alloc {
            heap: false,
            size: Operand::Const(8, Ty::I64),
        })
        .unwrap();
    sub.push(b0, InstrKind::Call {
        callee: "fgets".into(),
        args: vec![
            Operand::Value(buf),
            Operand::Const(8, Ty::I32),
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
    sub.push(b2, InstrKind::EndScope {
        ptr: Operand::Value(buf),
    })
    .unwrap();
    sub.set_term(b2, Terminator::Return(Some(Operand::Value(x))))
        .unwrap();

    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config(), &mut rng).unwrap());

    let mut machine = Machine::new(&sub, filled_with(b"mark"));
    let outcome = machine.run(&[]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(b'm' as i64)));
    assert_eq!(outcome.disclosures, vec![b"xyzw".to_vec()]);

    let mut machine = Machine::new(&sub, filled_with(b"brand"));
    let outcome = machine.run(&[]).unwrap();
    assert_eq!(outcome.ret, Some(RtVal::I(b'b' as i64)));
    assert!(outcome.disclosures.is_empty());
}

#[test]
fn a_key_prefixed_content_still_triggers() {
    // The hash is bounded by min(key length, runtime size), so content that
    // merely starts with the key opens the gate. Accepted weakening of the
    // discriminator, not a defect.
    let mut sub = common::malloc_subject();
    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config(), &mut rng).unwrap());

    let mut machine = Machine::new(&sub, filled_with(b"marks"));
    let outcome = machine.run(&[]).unwrap();
    assert_eq!(outcome.disclosures.len(), 1);
    assert!(outcome.disclosures[0].starts_with(b"xyzw"));
}

#[test]
fn a_shorter_buffer_is_never_read_past_its_end() {
    // Allocation smaller than the key: the hash bound takes the minimum of
    // the two lengths, so the run must not fault.
    let mut sub = Subroutine::new("short_subject");
    let b0 = sub.add_block();
    let b1 = sub.add_block();
    sub.set_entry_block(b0);
    let buf = sub
        .push(b0, InstrKind::Alloc {
            heap: true,
            size: Operand::Const(2, Ty::I64),
        })
        .unwrap();
    sub.push(b0, InstrKind::Store {
        ty: Ty::I8,
        value: Operand::Const(b'm' as i64, Ty::I8),
        ptr: Operand::Value(buf),
    })
    .unwrap();
    sub.set_term(b0, Terminator::Jump(b1)).unwrap();
    sub.push(b1, InstrKind::Free {
        ptr: Operand::Value(buf),
    })
    .unwrap();
    sub.set_term(b1, Terminator::Return(None)).unwrap();

    let mut rng = common::rng();
    assert!(run_subroutine(&mut sub, &config(), &mut rng).unwrap());
    let mut machine = Machine::new(&sub, ExecEnv::default());
    let outcome = machine.run(&[]).unwrap();
    assert!(outcome.disclosures.is_empty());
}
