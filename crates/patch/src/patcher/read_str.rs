//! String-read patcher (`gets` / `fgets` / `getline` / `fread` family).
//!
//! Two-stage gate: a cheap runtime length check against the key's length,
//! then the rolling hash of the buffer routed through an arithmetic chain
//! and compared against the transformed key hash. The hidden path rebuilds
//! the secret value from the buffer's bytes.

use crate::patcher::emit_disclosure_loop;
use crate::solver::{arithmetic, polynomial};
use crate::{gate, splice, CandidateSite, PatchResult, Patcher, Result, SiteKind};
use filigree_core::ir::{InstrKind, Operand, Pred, Subroutine, Terminator, Ty};
use filigree_core::numeric::Width;
use filigree_core::WatermarkConfig;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

pub struct ReadStrPatcher;

impl Patcher for ReadStrPatcher {
    fn name(&self) -> &'static str {
        "ReadStrPatcher"
    }

    fn kind(&self) -> SiteKind {
        SiteKind::ReadStr
    }

    fn patch(
        &self,
        sub: &mut Subroutine,
        site: &CandidateSite,
        config: &WatermarkConfig,
        rng: &mut StdRng,
    ) -> Result<PatchResult> {
        let Some(pair) = config.read.as_ref().filter(|p| p.is_usable()) else {
            return Ok(PatchResult::rejected());
        };

        let instr = match sub.body(site.block)?.instrs.get(site.index) {
            Some(instr) => instr.clone(),
            None => return Ok(PatchResult::rejected()),
        };
        let InstrKind::Call { callee, args, .. } = &instr.kind else {
            return Ok(PatchResult::rejected());
        };
        if crate::classify_callee(callee) != Some(SiteKind::ReadStr) {
            return Ok(PatchResult::rejected());
        }
        if sub.is_processed(instr.id) {
            return Ok(PatchResult::rejected());
        }
        sub.mark_processed(instr.id);

        let is_getline = callee == "getline";
        let Some(&line_operand) = args.first() else {
            return Ok(PatchResult::rejected());
        };

        let key_hash = gate::rolling_hash(pair.key.as_bytes(), usize::MAX, Width::W64);
        let probe = rng.random_range(0..1_711_922_400i64);
        let program = arithmetic::solve(Width::W64, key_hash, probe, rng);
        let poly = match polynomial::fit_bytes(pair.key.as_bytes(), pair.value.as_bytes()) {
            Ok(poly) => poly,
            Err(e) => {
                debug!("polynomial fit failed, site rejected: {e}");
                return Ok(PatchResult::rejected());
            }
        };

        let continuation = splice::split_block(sub, site.block, site.index + 1)?;

        // Length precheck in the head block. The read keeps the newline, so
        // the candidate matches at key length plus one. `getline` already
        // returns the length; the others ask strlen.
        let runtime_len = if is_getline {
            Operand::Value(instr.id)
        } else {
            let len = sub.push(site.block, InstrKind::Call {
                callee: "strlen".into(),
                args: vec![line_operand],
                ret: Ty::I64,
            })?;
            Operand::Value(len)
        };
        let len_matches = sub.push(site.block, InstrKind::Cmp {
            pred: Pred::Eq,
            width: Width::W64,
            lhs: runtime_len,
            rhs: Operand::Const(pair.key.len() as i64 + 1, Ty::I64),
        })?;

        // Hash stage in its own block; getline hands over a pointer to the
        // line pointer, so dereference first.
        let hash_block = sub.add_block();
        let buf = if is_getline {
            let line = sub.push(hash_block, InstrKind::Load {
                ty: Ty::Ptr,
                ptr: line_operand,
            })?;
            Operand::Value(line)
        } else {
            line_operand
        };
        let hash_loop = gate::emit_hash_loop(sub, hash_block, buf, Width::W64, None)?;
        let derived = arithmetic::emit(
            &program,
            sub,
            hash_loop.exit,
            Operand::Value(hash_loop.value),
        )?;
        let cond = sub.push(hash_loop.exit, InstrKind::Cmp {
            pred: Pred::Eq,
            width: Width::W64,
            lhs: derived,
            rhs: Operand::Const(probe, Ty::I64),
        })?;

        sub.set_term(site.block, Terminator::Branch {
            cond: Operand::Value(len_matches),
            then_to: hash_block,
            else_to: continuation,
        })?;

        let hidden = emit_disclosure_loop(
            sub,
            buf,
            Operand::Const(pair.value.len() as i64, Ty::I64),
            None,
            &poly,
        )?;
        splice::insert_gate(
            sub,
            hash_loop.exit,
            hidden.entry,
            hidden.exit,
            continuation,
            Operand::Value(cond),
        )?;
        splice::bind_missing_with_dummies(sub, continuation)?;
        sub.verify_merge_totality().map_err(crate::Error::Core)?;

        info!("included string-read watermark in {}", sub.name);
        Ok(PatchResult::applied())
    }
}
