//! Time-query patcher (`time` / `gettimeofday`).
//!
//! The key is an epoch instant coarsened to minutes, so the watermark stays
//! triggerable for a whole minute. The runtime value is divided by sixty in
//! IR, routed through an arithmetic chain and compared; the hidden path
//! derives each value character from the scalar-key polynomial.

use crate::solver::{arithmetic, polynomial};
use crate::{splice, CandidateSite, PatchResult, Patcher, Result, SiteKind};
use filigree_core::ir::{
    BinOp, CastOp, InstrKind, Operand, Pred, Subroutine, Terminator, Ty,
};
use filigree_core::numeric::Width;
use filigree_core::WatermarkConfig;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

pub struct QueryTimePatcher;

impl Patcher for QueryTimePatcher {
    fn name(&self) -> &'static str {
        "QueryTimePatcher"
    }

    fn kind(&self) -> SiteKind {
        SiteKind::QueryTime
    }

    fn patch(
        &self,
        sub: &mut Subroutine,
        site: &CandidateSite,
        config: &WatermarkConfig,
        rng: &mut StdRng,
    ) -> Result<PatchResult> {
        let Some(secret) = config.time.as_ref().filter(|s| s.is_usable()) else {
            return Ok(PatchResult::rejected());
        };

        let instr = match sub.body(site.block)?.instrs.get(site.index) {
            Some(instr) => instr.clone(),
            None => return Ok(PatchResult::rejected()),
        };
        let InstrKind::Call { callee, args, .. } = &instr.kind else {
            return Ok(PatchResult::rejected());
        };
        if crate::classify_callee(callee) != Some(SiteKind::QueryTime) {
            return Ok(PatchResult::rejected());
        }
        if sub.is_processed(instr.id) {
            return Ok(PatchResult::rejected());
        }
        sub.mark_processed(instr.id);

        let is_time_of_day = callee == "gettimeofday";
        let out_param = args.first().copied();

        let key_minutes = secret.key_epoch / 60;
        let expected = rng.random_range(0..0x7FFF_FFFFi64);
        let program = arithmetic::solve(Width::W64, key_minutes, expected, rng);
        let poly = match polynomial::fit_scalar(key_minutes, secret.value.as_bytes()) {
            Ok(poly) => poly,
            Err(e) => {
                debug!("polynomial fit failed, site rejected: {e}");
                return Ok(PatchResult::rejected());
            }
        };

        let continuation = splice::split_block(sub, site.block, site.index + 1)?;

        // gettimeofday reports through its out parameter; time returns
        // directly.
        let seconds = if is_time_of_day {
            let Some(tv) = out_param else {
                return Ok(PatchResult::rejected());
            };
            let loaded = sub.push(site.block, InstrKind::Load {
                ty: Ty::I64,
                ptr: tv,
            })?;
            Operand::Value(loaded)
        } else {
            Operand::Value(instr.id)
        };
        let minutes = sub.push(site.block, InstrKind::Bin {
            op: BinOp::SDiv,
            width: Width::W64,
            lhs: seconds,
            rhs: Operand::Const(60, Ty::I64),
        })?;
        let derived = arithmetic::emit(&program, sub, site.block, Operand::Value(minutes))?;
        let cond = sub.push(site.block, InstrKind::Cmp {
            pred: Pred::Eq,
            width: Width::W64,
            lhs: derived,
            rhs: Operand::Const(expected, Ty::I64),
        })?;

        let hidden = self.emit_hidden_path(sub, minutes, secret.value.len() as i64, &poly)?;
        splice::insert_gate(
            sub,
            site.block,
            hidden.0,
            hidden.1,
            continuation,
            Operand::Value(cond),
        )?;
        sub.verify_merge_totality().map_err(crate::Error::Core)?;

        info!("included time-query watermark in {}", sub.name);
        Ok(PatchResult::applied())
    }
}

impl QueryTimePatcher {
    /// Hidden path for the scalar key: a counted loop deriving each value
    /// character from `minutes + i * stride`.
    fn emit_hidden_path(
        &self,
        sub: &mut Subroutine,
        minutes: filigree_core::ir::ValueId,
        value_len: i64,
        poly: &polynomial::Polynomial,
    ) -> Result<(petgraph::graph::NodeIndex, petgraph::graph::NodeIndex)> {
        let entry = sub.add_block();
        let test = sub.add_block();
        let body = sub.add_block();
        let event = sub.add_block();

        let dest = sub.push(entry, InstrKind::Alloc {
            heap: false,
            size: Operand::Const(value_len + 1, Ty::I64),
        })?;
        sub.mark_processed(dest);
        sub.set_term(entry, Terminator::Jump(test))?;

        let index = sub.add_phi(test, Ty::I64, vec![(entry, Operand::Const(0, Ty::I64))])?;
        let in_bounds = sub.push(test, InstrKind::Cmp {
            pred: Pred::Slt,
            width: Width::W64,
            lhs: Operand::Value(index),
            rhs: Operand::Const(value_len, Ty::I64),
        })?;
        sub.set_term(test, Terminator::Branch {
            cond: Operand::Value(in_bounds),
            then_to: body,
            else_to: event,
        })?;

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
            rhs: Operand::Const(polynomial::STRIDE, Ty::I32),
        })?;
        let narrow_minutes = sub.push(body, InstrKind::Cast {
            op: CastOp::Trunc,
            from: Ty::I64,
            to: Ty::I32,
            value: Operand::Value(minutes),
        })?;
        let encoded = sub.push(body, InstrKind::Bin {
            op: BinOp::Add,
            width: Width::W32,
            lhs: Operand::Value(narrow_minutes),
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
            offset: Operand::Const(value_len, Ty::I64),
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

        Ok((entry, event))
    }
}
