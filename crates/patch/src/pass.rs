//! Sweep driver.
//!
//! Walks one subroutine at a time, discovering candidate sites in program
//! order and handing each to its patcher. A site's edits complete (or the
//! site is rejected, leaving no trace) before the next site is discovered,
//! because later sites' positions only make sense in the post-edit graph.
//! Per-site failures are contained; only a structural-invariant violation —
//! a programming defect, not an input condition — aborts the sweep.

use crate::patcher;
use crate::{classify_callee, site_value, CandidateSite, Error, Result, SiteKind};
use filigree_core::ir::InstrKind;
use filigree_core::result::Error as CoreError;
use filigree_core::{Subroutine, WatermarkConfig};
use rand::rngs::StdRng;
use tracing::debug;

/// Applies every enabled patcher kind across the subroutine. Returns whether
/// anything changed, so a driver tracking modification can skip downstream
/// work on an untouched graph.
pub fn run_subroutine(
    sub: &mut Subroutine,
    config: &WatermarkConfig,
    rng: &mut StdRng,
) -> Result<bool> {
    let patchers = patcher::all();
    let mut changed = false;

    while let Some(site) = next_candidate(sub) {
        let Some(active) = patchers.iter().find(|p| p.kind() == site.kind) else {
            mark_visited(sub, &site);
            continue;
        };

        match active.patch(sub, &site, config, rng) {
            Ok(result) => {
                if result.applied {
                    changed = true;
                }
            }
            Err(Error::Core(CoreError::StructuralInvariant(message))) => {
                return Err(Error::Core(CoreError::StructuralInvariant(message)));
            }
            Err(e) => {
                debug!("{}: site rejected: {e}", active.name());
            }
        }
        // The patcher marks the site on every path past its precondition
        // checks; cover the early-exit paths so the sweep always advances.
        mark_visited(sub, &site);
    }

    Ok(changed)
}

/// First unvisited candidate in program order: a hooked call or an
/// allocation.
fn next_candidate(sub: &Subroutine) -> Option<CandidateSite> {
    for block in sub.body_blocks() {
        let body = sub.body(block).ok()?;
        for (index, instr) in body.instrs.iter().enumerate() {
            if sub.is_processed(instr.id) {
                continue;
            }
            let kind = match &instr.kind {
                InstrKind::Call { callee, .. } => classify_callee(callee),
                InstrKind::Alloc { .. } => Some(SiteKind::BufferAlloc),
                _ => None,
            };
            if let Some(kind) = kind {
                return Some(CandidateSite { block, index, kind });
            }
        }
    }
    None
}

fn mark_visited(sub: &mut Subroutine, site: &CandidateSite) {
    if let Ok(id) = site_value(sub, site) {
        sub.mark_processed(id);
    }
}
