//! Safe insertion point location for buffer sites.
//!
//! Observing a buffer is only sound while the buffer is alive, so the
//! instrumentation must land strictly after the last live use and strictly
//! before the release. Heap buffers are anchored at a deallocation of the
//! same pointer (the free is relocated behind the inserted logic); stack
//! buffers at their last direct use or end-of-scope marker; and when neither
//! is discoverable the fallback picks a block that the allocation dominates
//! and that post-dominates every use. No point found means the site is
//! skipped, never an error.

use filigree_core::dom::Analyses;
use filigree_core::ir::{InstrKind, Operand, Subroutine, ValueId};
use petgraph::graph::NodeIndex;
use tracing::debug;

/// Returns the block instrumentation may be attached to, or `None` when the
/// site has no safe point.
pub fn locate(
    sub: &Subroutine,
    alloc_block: NodeIndex,
    alloc_index: usize,
    analyses: &Analyses,
) -> Option<NodeIndex> {
    let body = sub.body(alloc_block).ok()?;
    let instr = body.instrs.get(alloc_index)?;
    let (alloc_id, heap) = match &instr.kind {
        InstrKind::Alloc { heap, .. } => (instr.id, *heap),
        _ => return None,
    };

    if heap {
        if let Some(block) = find_free_block(sub, alloc_block, alloc_index, alloc_id, analyses) {
            return Some(block);
        }
        // A heap buffer with no discoverable release falls through to the
        // last-use policy.
    }

    if let Some(block) = find_last_use_block(sub, alloc_block, alloc_index, alloc_id, analyses) {
        return Some(block);
    }

    find_post_dominating_block(sub, alloc_block, alloc_id, analyses)
}

/// First block dominated by the allocation that frees the same pointer,
/// preferring one outside any loop. Instrumenting after the release would
/// read freed memory, so callers place themselves before the free.
fn find_free_block(
    sub: &Subroutine,
    alloc_block: NodeIndex,
    alloc_index: usize,
    alloc_id: ValueId,
    analyses: &Analyses,
) -> Option<NodeIndex> {
    let mut first: Option<NodeIndex> = None;
    for block in sub.body_blocks() {
        if !analyses.dominates(alloc_block, block) {
            continue;
        }
        let start = if block == alloc_block { alloc_index + 1 } else { 0 };
        let body = sub.body(block).ok()?;
        let frees_here = body.instrs[start..].iter().any(|instr| {
            matches!(&instr.kind, InstrKind::Free { ptr } if *ptr == Operand::Value(alloc_id))
        });
        if frees_here {
            if first.is_none() {
                first = Some(block);
            }
            if !analyses.in_loop(block) {
                return Some(block);
            }
        }
    }
    if first.is_some() {
        debug!("only in-loop release blocks found for {:?}", alloc_id);
    }
    first
}

/// Last dominated block that directly uses the allocation as an operand, or
/// the block carrying its end-of-scope marker.
fn find_last_use_block(
    sub: &Subroutine,
    alloc_block: NodeIndex,
    alloc_index: usize,
    alloc_id: ValueId,
    analyses: &Analyses,
) -> Option<NodeIndex> {
    let mut last: Option<NodeIndex> = None;
    for block in sub.body_blocks() {
        if !analyses.dominates(alloc_block, block) {
            continue;
        }
        let start = if block == alloc_block { alloc_index + 1 } else { 0 };
        let body = sub.body(block).ok()?;
        for instr in &body.instrs[start..] {
            if let InstrKind::EndScope { ptr } = &instr.kind {
                if *ptr == Operand::Value(alloc_id) {
                    return Some(block);
                }
            }
            if uses_value(&instr.kind, alloc_id) {
                last = Some(block);
            }
        }
    }
    last
}

/// First block dominated by the allocation whose exit post-dominates every
/// block using the allocation.
fn find_post_dominating_block(
    sub: &Subroutine,
    alloc_block: NodeIndex,
    alloc_id: ValueId,
    analyses: &Analyses,
) -> Option<NodeIndex> {
    let mut use_blocks: Vec<NodeIndex> = Vec::new();
    for block in sub.body_blocks() {
        let body = sub.body(block).ok()?;
        if body
            .instrs
            .iter()
            .any(|instr| uses_value(&instr.kind, alloc_id))
        {
            use_blocks.push(block);
        }
    }

    sub.body_blocks().into_iter().find(|&block| {
        analyses.dominates(alloc_block, block)
            && use_blocks
                .iter()
                .all(|&used| analyses.post_dominates(block, used))
    })
}

fn uses_value(kind: &InstrKind, id: ValueId) -> bool {
    let hit = |op: &Operand| *op == Operand::Value(id);
    match kind {
        InstrKind::Bin { lhs, rhs, .. }
        | InstrKind::FBin { lhs, rhs, .. }
        | InstrKind::Cmp { lhs, rhs, .. } => hit(lhs) || hit(rhs),
        InstrKind::Cast { value, .. } => hit(value),
        InstrKind::Call { args, .. } => args.iter().any(hit),
        InstrKind::Alloc { size, .. } => hit(size),
        InstrKind::Free { ptr } | InstrKind::EndScope { ptr } => hit(ptr),
        InstrKind::Load { ptr, .. } => hit(ptr),
        InstrKind::Store { value, ptr, .. } => hit(value) || hit(ptr),
        InstrKind::Gep { base, offset } => hit(base) || hit(offset),
    }
}
