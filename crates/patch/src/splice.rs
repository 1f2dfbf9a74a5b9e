//! CFG splicing: block splitting, merge-point repair and gate insertion.
//!
//! The shared edit transaction every patcher runs: carve the site's block
//! into a head and a continuation, rebind every downstream merge point that
//! named the old block, then wire the gate branch and the hidden path in.
//! Omitting the rebind step corrupts every downstream value selection, so it
//! lives inside [`split_block`] rather than with the callers.

use crate::{Error, Result};
use filigree_core::ir::{Operand, Subroutine, Terminator};
use petgraph::graph::NodeIndex;
use tracing::debug;

/// Splits `block` after its first `keep` instructions. The tail (and the
/// terminator) moves into a fresh continuation block; the head is left
/// un-terminated for the caller's gate. Every merge point in a successor of
/// the continuation that listed the old block as a predecessor is rebound to
/// the continuation, carrying the identical selected value.
pub fn split_block(sub: &mut Subroutine, block: NodeIndex, keep: usize) -> Result<NodeIndex> {
    let continuation = sub.add_block();

    let head = sub.body_mut(block)?;
    if keep > head.instrs.len() {
        return Err(Error::UnsupportedSite(format!(
            "cannot keep {} instructions of a block holding {}",
            keep,
            head.instrs.len()
        )));
    }
    let tail = head.instrs.split_off(keep);
    let term = head.term.take();

    let cont_body = sub.body_mut(continuation)?;
    cont_body.instrs = tail;
    cont_body.term = term;

    sub.rebuild_edges(block)?;
    sub.rebuild_edges(continuation)?;
    repair_merge_points(sub, block, continuation)?;

    debug!(
        "split block {} at {} -> continuation {}",
        block.index(),
        keep,
        continuation.index()
    );
    Ok(continuation)
}

/// Rebinds merge points in every successor of `new_block` that still name
/// `old_block` as the arriving edge.
pub fn repair_merge_points(
    sub: &mut Subroutine,
    old_block: NodeIndex,
    new_block: NodeIndex,
) -> Result<()> {
    for succ in sub.succs(new_block) {
        let body = sub.body_mut(succ)?;
        for phi in &mut body.phis {
            for (pred, _) in &mut phi.incomings {
                if *pred == old_block {
                    *pred = new_block;
                }
            }
        }
    }
    Ok(())
}

/// Wires the gate: `head` branches on `cond` to the hidden path or the
/// continuation, and the hidden path's last block falls through to the
/// continuation. Merge points in the continuation then gain a synthetic
/// typed binding for any predecessor edge the new wiring introduced, keeping
/// every selector total.
pub fn insert_gate(
    sub: &mut Subroutine,
    head: NodeIndex,
    hidden_entry: NodeIndex,
    hidden_exit: NodeIndex,
    continuation: NodeIndex,
    cond: Operand,
) -> Result<()> {
    sub.set_term(head, Terminator::Branch {
        cond,
        then_to: hidden_entry,
        else_to: continuation,
    })?;
    sub.set_term(hidden_exit, Terminator::Jump(continuation))?;
    bind_missing_with_dummies(sub, continuation)?;
    Ok(())
}

/// Adds a typed dummy binding for every predecessor edge a merge point in
/// `block` does not yet cover. The dummy is never observed along any other
/// computation; it only keeps the selector total over all edges.
pub fn bind_missing_with_dummies(sub: &mut Subroutine, block: NodeIndex) -> Result<usize> {
    let preds = sub.preds(block);
    let body = sub.body_mut(block)?;
    let mut added = 0usize;
    for phi in &mut body.phis {
        for pred in &preds {
            if !phi.incomings.iter().any(|(from, _)| from == pred) {
                phi.incomings.push((*pred, phi.ty.zero()));
                added += 1;
            }
        }
    }
    if added > 0 {
        debug!(
            "added {} dummy bindings in block {}",
            added,
            block.index()
        );
    }
    Ok(added)
}
