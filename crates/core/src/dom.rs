//! Dominance, post-dominance and loop-membership queries.
//!
//! The relations are read-only placement aids: passes consult them to decide
//! where instrumentation may go and recompute them after every structural
//! edit that could change them. Nothing here mutates the graph.

use crate::ir::Subroutine;
use petgraph::algo::dominators::{simple_fast, Dominators};
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::visit::Reversed;
use std::collections::HashSet;

/// Dominator tree, post-dominator tree and loop membership for one
/// subroutine, valid until the next structural edit.
pub struct Analyses {
    dom: Dominators<NodeIndex>,
    postdom: Dominators<NodeIndex>,
    in_loop: HashSet<NodeIndex>,
}

impl Analyses {
    /// Computes all three relations from scratch.
    pub fn compute(sub: &Subroutine) -> Self {
        let dom = simple_fast(&sub.cfg, sub.entry());
        let postdom = simple_fast(Reversed(&sub.cfg), sub.exit());

        let mut in_loop = HashSet::new();
        for scc in tarjan_scc(&sub.cfg) {
            let cyclic = scc.len() > 1
                || (scc.len() == 1 && sub.cfg.find_edge(scc[0], scc[0]).is_some());
            if cyclic {
                in_loop.extend(scc);
            }
        }

        Self {
            dom,
            postdom,
            in_loop,
        }
    }

    /// True iff every path from entry to `b` passes through `a`.
    /// A block dominates itself.
    pub fn dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        walk_idoms(&self.dom, a, b)
    }

    /// True iff every path from `b` to exit passes through `a`.
    pub fn post_dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        walk_idoms(&self.postdom, a, b)
    }

    /// True iff the block sits on a control-flow cycle.
    pub fn in_loop(&self, node: NodeIndex) -> bool {
        self.in_loop.contains(&node)
    }
}

fn walk_idoms(tree: &Dominators<NodeIndex>, a: NodeIndex, b: NodeIndex) -> bool {
    let mut cur = b;
    loop {
        if cur == a {
            return true;
        }
        match tree.immediate_dominator(cur) {
            Some(idom) => cur = idom,
            // Unreachable from the tree root.
            None => return false,
        }
    }
}
