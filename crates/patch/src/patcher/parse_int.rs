//! Numeric-parse patcher (`atoi` / `atol` / `strtol` family).
//!
//! The gate assumes the call's result equals the numeric reading of the
//! secret key and routes it through a closed-form arithmetic chain; equality
//! with the chain's precomputed output opens the hidden path, which rebuilds
//! the secret value from the parsed input buffer character by character.

use crate::patcher::emit_disclosure_loop;
use crate::solver::{arithmetic, polynomial};
use crate::{splice, CandidateSite, PatchResult, Patcher, Result, SiteKind};
use filigree_core::interp::parse_c_long;
use filigree_core::ir::{InstrKind, Operand, Pred, Subroutine, Ty};
use filigree_core::WatermarkConfig;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

pub struct ParseIntPatcher;

impl Patcher for ParseIntPatcher {
    fn name(&self) -> &'static str {
        "ParseIntPatcher"
    }

    fn kind(&self) -> SiteKind {
        SiteKind::ParseInt
    }

    fn patch(
        &self,
        sub: &mut Subroutine,
        site: &CandidateSite,
        config: &WatermarkConfig,
        rng: &mut StdRng,
    ) -> Result<PatchResult> {
        let Some(pair) = config.parse.as_ref().filter(|p| p.is_usable()) else {
            return Ok(PatchResult::rejected());
        };

        let instr = match sub.body(site.block)?.instrs.get(site.index) {
            Some(instr) => instr.clone(),
            None => return Ok(PatchResult::rejected()),
        };
        let InstrKind::Call { callee, args, ret } = &instr.kind else {
            return Ok(PatchResult::rejected());
        };
        if crate::classify_callee(callee) != Some(SiteKind::ParseInt) {
            return Ok(PatchResult::rejected());
        }
        if sub.is_processed(instr.id) {
            return Ok(PatchResult::rejected());
        }
        sub.mark_processed(instr.id);

        // A non-constant base makes the offline parse of the key unsound.
        let base = if callee.ends_with("strtol") {
            match args.get(2) {
                Some(Operand::Const(base, _)) => *base as u32,
                _ => {
                    debug!("{}: non-constant base, site rejected", callee);
                    return Ok(PatchResult::rejected());
                }
            }
        } else {
            10
        };
        let Some(width) = ret.width() else {
            return Ok(PatchResult::rejected());
        };
        let Some(&input) = args.first() else {
            return Ok(PatchResult::rejected());
        };

        let key_number = parse_c_long(pair.key.as_bytes(), base);
        let expected = rng.random_range(0..0x7FFF_FFFFi64);
        let program = arithmetic::solve(width, key_number, expected, rng);
        let poly = match polynomial::fit_bytes(pair.key.as_bytes(), pair.value.as_bytes()) {
            Ok(poly) => poly,
            Err(e) => {
                debug!("polynomial fit failed, site rejected: {e}");
                return Ok(PatchResult::rejected());
            }
        };

        // All preconditions hold; edit transaction starts here.
        let continuation = splice::split_block(sub, site.block, site.index + 1)?;
        let derived = arithmetic::emit(&program, sub, site.block, Operand::Value(instr.id))?;
        let value_ty = match width {
            filigree_core::Width::W8 => Ty::I8,
            filigree_core::Width::W32 => Ty::I32,
            filigree_core::Width::W64 => Ty::I64,
        };
        let cond = sub.push(site.block, InstrKind::Cmp {
            pred: Pred::Eq,
            width,
            lhs: derived,
            rhs: Operand::Const(expected, value_ty),
        })?;

        let hidden = emit_disclosure_loop(
            sub,
            input,
            Operand::Const(pair.value.len() as i64, Ty::I64),
            None,
            &poly,
        )?;
        splice::insert_gate(
            sub,
            site.block,
            hidden.entry,
            hidden.exit,
            continuation,
            Operand::Value(cond),
        )?;
        sub.verify_merge_totality().map_err(crate::Error::Core)?;

        info!("included numeric-parse watermark in {}", sub.name);
        Ok(PatchResult::applied())
    }
}
