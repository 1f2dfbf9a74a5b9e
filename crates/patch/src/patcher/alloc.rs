//! Buffer-allocation patcher (stack arrays and heap allocations).
//!
//! The only patcher that must reason about lifetimes: the locator picks a
//! block after the buffer's last live use, any release of the buffer in that
//! block is relocated behind the inserted logic, and the gate hashes the
//! buffer bounded by the lesser of the key length and the runtime size.

use crate::patcher::emit_disclosure_loop;
use crate::solver::polynomial;
use crate::{gate, locator, splice, CandidateSite, PatchResult, Patcher, Result, SiteKind};
use filigree_core::dom::Analyses;
use filigree_core::ir::{Instr, InstrKind, Operand, Pred, Subroutine, Ty};
use filigree_core::numeric::Width;
use filigree_core::WatermarkConfig;
use rand::rngs::StdRng;
use tracing::{debug, info};

pub struct BufferAllocPatcher;

impl Patcher for BufferAllocPatcher {
    fn name(&self) -> &'static str {
        "BufferAllocPatcher"
    }

    fn kind(&self) -> SiteKind {
        SiteKind::BufferAlloc
    }

    fn patch(
        &self,
        sub: &mut Subroutine,
        site: &CandidateSite,
        config: &WatermarkConfig,
        _rng: &mut StdRng,
    ) -> Result<PatchResult> {
        let Some(pair) = config.buffer.as_ref().filter(|p| p.is_usable()) else {
            return Ok(PatchResult::rejected());
        };

        let instr = match sub.body(site.block)?.instrs.get(site.index) {
            Some(instr) => instr.clone(),
            None => return Ok(PatchResult::rejected()),
        };
        let InstrKind::Alloc { size, .. } = &instr.kind else {
            return Ok(PatchResult::rejected());
        };
        if sub.is_processed(instr.id) {
            return Ok(PatchResult::rejected());
        }
        sub.mark_processed(instr.id);
        let buffer = Operand::Value(instr.id);
        let size = *size;

        let expected = gate::rolling_hash(pair.key.as_bytes(), pair.key.len(), Width::W32);
        let poly = match polynomial::fit_bytes(pair.key.as_bytes(), pair.value.as_bytes()) {
            Ok(poly) => poly,
            Err(e) => {
                debug!("polynomial fit failed, site rejected: {e}");
                return Ok(PatchResult::rejected());
            }
        };

        let analyses = Analyses::compute(sub);
        let Some(spot) = locator::locate(sub, site.block, site.index, &analyses) else {
            debug!("no safe insertion point for {:?}, site rejected", instr.id);
            return Ok(PatchResult::rejected());
        };

        // Releases of this buffer move behind the instrumentation so the
        // hash and the hidden path never touch freed memory.
        let relocated = extract_frees(sub, spot, buffer)?;
        let keep = sub.body(spot)?.instrs.len();
        let continuation = splice::split_block(sub, spot, keep)?;
        let cont_body = sub.body_mut(continuation)?;
        for free in relocated.into_iter().rev() {
            cont_body.instrs.insert(0, free);
        }

        let hash_loop = gate::emit_hash_loop(
            sub,
            spot,
            buffer,
            Width::W32,
            Some((size, pair.key.len() as i64)),
        )?;
        let cond = sub.push(hash_loop.exit, InstrKind::Cmp {
            pred: Pred::Eq,
            width: Width::W32,
            lhs: Operand::Value(hash_loop.value),
            rhs: Operand::Const(expected, Ty::I32),
        })?;

        let hidden = emit_disclosure_loop(sub, buffer, size, Some(size), &poly)?;
        splice::insert_gate(
            sub,
            hash_loop.exit,
            hidden.entry,
            hidden.exit,
            continuation,
            Operand::Value(cond),
        )?;
        sub.verify_merge_totality().map_err(crate::Error::Core)?;

        info!("included buffer watermark in {}", sub.name);
        Ok(PatchResult::applied())
    }
}

/// Removes every release of `buffer` from `block` and returns them in their
/// original order.
fn extract_frees(
    sub: &mut Subroutine,
    block: petgraph::graph::NodeIndex,
    buffer: Operand,
) -> Result<Vec<Instr>> {
    let body = sub.body_mut(block)?;
    let mut kept = Vec::with_capacity(body.instrs.len());
    let mut frees = Vec::new();
    for instr in body.instrs.drain(..) {
        match &instr.kind {
            InstrKind::Free { ptr } if *ptr == buffer => frees.push(instr),
            _ => kept.push(instr),
        }
    }
    body.instrs = kept;
    Ok(frees)
}
