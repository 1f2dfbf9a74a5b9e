//! Subroutine IR: basic blocks, merge points and edit utilities.
//!
//! The graph is the source of truth: blocks know how they connect, merge
//! points carry one binding per predecessor edge, and every structural edit
//! flows through a small set of helpers that keep the petgraph edge set in
//! sync with block terminators. Instrumentation passes describe control flow
//! in terms of blocks; this module is responsible for keeping the adjacency
//! relation and the merge-point bindings consistent while they do so.
//!
//! The guiding principles are:
//! - **Block-first view.** Passes create blocks, fill them with instructions
//!   and set a terminator; edges are derived, never written by hand.
//! - **Total merge points.** A merge point must hold exactly one incoming
//!   binding per predecessor edge at all times. `verify_merge_totality`
//!   checks the invariant after structural surgery.
//! - **Stable value identity.** `ValueId`s are minted by the subroutine and
//!   survive block splits, so bindings and uses never need rewriting when
//!   instructions move between blocks.

use crate::numeric::Width;
use crate::result::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifier of an SSA value minted by a [`Subroutine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Value types carried by operands and instruction results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    I8,
    I32,
    I64,
    F64,
    Ptr,
}

impl Ty {
    /// Integer domain width, if the type is an integer.
    pub fn width(self) -> Option<Width> {
        match self {
            Ty::I8 => Some(Width::W8),
            Ty::I32 => Some(Width::W32),
            Ty::I64 => Some(Width::W64),
            _ => None,
        }
    }

    /// Byte footprint of a load or store of this type.
    pub fn size(self) -> usize {
        match self {
            Ty::I8 => 1,
            Ty::I32 => 4,
            Ty::I64 | Ty::F64 | Ty::Ptr => 8,
        }
    }

    /// Zero constant of this type, used for synthetic merge-point bindings.
    pub fn zero(self) -> Operand {
        match self {
            Ty::F64 => Operand::ConstF(0.0),
            other => Operand::Const(0, other),
        }
    }
}

/// Instruction or merge-point operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// Reference to a value defined by an instruction, merge point or argument.
    Value(ValueId),
    /// Typed integer (or pointer) constant.
    Const(i64, Ty),
    /// Double-precision float constant.
    ConstF(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    Shl,
    LShr,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FOp {
    FAdd,
    FMul,
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pred {
    Eq,
    Ne,
    Slt,
    Sle,
    Ult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    SExt,
    ZExt,
    Trunc,
    SiToFp,
    FpToSi,
}

/// Instruction payloads. Every instruction defines the value identified by
/// its [`Instr::id`]; void-like instructions simply leave it unused.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    Bin {
        op: BinOp,
        width: Width,
        lhs: Operand,
        rhs: Operand,
    },
    FBin {
        op: FOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Integer compare producing 0 or 1 as an `I8`.
    Cmp {
        pred: Pred,
        width: Width,
        lhs: Operand,
        rhs: Operand,
    },
    Cast {
        op: CastOp,
        from: Ty,
        to: Ty,
        value: Operand,
    },
    /// Call to a named external function.
    Call {
        callee: String,
        args: Vec<Operand>,
        ret: Ty,
    },
    /// Stack or heap allocation of `size` bytes; defines a pointer.
    Alloc {
        heap: bool,
        size: Operand,
    },
    /// Heap deallocation.
    Free {
        ptr: Operand,
    },
    Load {
        ty: Ty,
        ptr: Operand,
    },
    Store {
        ty: Ty,
        value: Operand,
        ptr: Operand,
    },
    /// Pointer plus byte offset; defines a pointer.
    Gep {
        base: Operand,
        offset: Operand,
    },
    /// Marks the end of a stack allocation's useful lifetime.
    EndScope {
        ptr: Operand,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub id: ValueId,
    pub kind: InstrKind,
}

/// A merge point at the head of a block: selects one operand per
/// predecessor edge (phi-equivalent).
#[derive(Debug, Clone, PartialEq)]
pub struct MergePoint {
    pub id: ValueId,
    pub ty: Ty,
    pub incomings: Vec<(NodeIndex, Operand)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(NodeIndex),
    Branch {
        cond: Operand,
        then_to: NodeIndex,
        else_to: NodeIndex,
    },
    Return(Option<Operand>),
}

/// Concrete contents of a body block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockBody {
    pub phis: Vec<MergePoint>,
    pub instrs: Vec<Instr>,
    pub term: Option<Terminator>,
}

/// CFG node representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Entry,
    Exit,
    Body(BlockBody),
}

/// Edge types record how control reaches a successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeType {
    Fallthrough,
    Jump,
    BranchTrue,
    BranchFalse,
}

/// A subroutine owns its graph, its value namespace and the bookkeeping the
/// instrumentation passes rely on (argument list, processed-site marks).
#[derive(Debug, Clone)]
pub struct Subroutine {
    pub name: String,
    pub cfg: StableDiGraph<Block, EdgeType>,
    entry: NodeIndex,
    exit: NodeIndex,
    args: Vec<(ValueId, Ty)>,
    next_value: u32,
    processed: HashSet<ValueId>,
}

impl Subroutine {
    pub fn new(name: impl Into<String>) -> Self {
        let mut cfg = StableDiGraph::new();
        let entry = cfg.add_node(Block::Entry);
        let exit = cfg.add_node(Block::Exit);
        Self {
            name: name.into(),
            cfg,
            entry,
            exit,
            args: Vec::new(),
            next_value: 0,
            processed: HashSet::new(),
        }
    }

    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn exit(&self) -> NodeIndex {
        self.exit
    }

    /// Declares a subroutine argument and returns its value handle.
    pub fn add_arg(&mut self, ty: Ty) -> ValueId {
        let id = self.fresh();
        self.args.push((id, ty));
        id
    }

    pub fn args(&self) -> &[(ValueId, Ty)] {
        &self.args
    }

    /// Mints a fresh value identifier.
    pub fn fresh(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    /// Adds an empty body block. The block participates in control flow once
    /// it receives a terminator or becomes the entry block.
    pub fn add_block(&mut self) -> NodeIndex {
        self.cfg.add_node(Block::Body(BlockBody::default()))
    }

    /// Wires the synthetic entry node to the subroutine's first real block.
    pub fn set_entry_block(&mut self, block: NodeIndex) {
        let stale: Vec<_> = self
            .cfg
            .edges_directed(self.entry, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for e in stale {
            self.cfg.remove_edge(e);
        }
        self.cfg.add_edge(self.entry, block, EdgeType::Fallthrough);
    }

    /// First body block in control-flow order, if the entry is wired.
    pub fn entry_block(&self) -> Option<NodeIndex> {
        self.cfg
            .neighbors_directed(self.entry, Direction::Outgoing)
            .next()
    }

    pub fn body(&self, node: NodeIndex) -> Result<&BlockBody> {
        match self.cfg.node_weight(node) {
            Some(Block::Body(body)) => Ok(body),
            _ => Err(Error::InvalidBlockStructure(format!(
                "node {} is not a body block",
                node.index()
            ))),
        }
    }

    pub fn body_mut(&mut self, node: NodeIndex) -> Result<&mut BlockBody> {
        match self.cfg.node_weight_mut(node) {
            Some(Block::Body(body)) => Ok(body),
            _ => Err(Error::InvalidBlockStructure(format!(
                "node {} is not a body block",
                node.index()
            ))),
        }
    }

    /// All body blocks in creation order (the subroutine's program order).
    pub fn body_blocks(&self) -> Vec<NodeIndex> {
        self.cfg
            .node_indices()
            .filter(|&n| matches!(self.cfg[n], Block::Body(_)))
            .collect()
    }

    /// Appends an instruction to a block and returns the defined value.
    pub fn push(&mut self, block: NodeIndex, kind: InstrKind) -> Result<ValueId> {
        let id = self.fresh();
        self.body_mut(block)?.instrs.push(Instr { id, kind });
        Ok(id)
    }

    /// Adds a merge point with explicit incoming bindings.
    pub fn add_phi(
        &mut self,
        block: NodeIndex,
        ty: Ty,
        incomings: Vec<(NodeIndex, Operand)>,
    ) -> Result<ValueId> {
        let id = self.fresh();
        self.body_mut(block)?.phis.push(MergePoint { id, ty, incomings });
        Ok(id)
    }

    /// Adds an incoming binding to an existing merge point.
    pub fn add_incoming(
        &mut self,
        block: NodeIndex,
        phi: ValueId,
        pred: NodeIndex,
        value: Operand,
    ) -> Result<()> {
        let body = self.body_mut(block)?;
        match body.phis.iter_mut().find(|p| p.id == phi) {
            Some(p) => {
                p.incomings.push((pred, value));
                Ok(())
            }
            None => Err(Error::InvalidBlockStructure(format!(
                "block {} has no merge point {:?}",
                block.index(),
                phi
            ))),
        }
    }

    /// Sets a block's terminator and rebuilds its outgoing edges.
    pub fn set_term(&mut self, block: NodeIndex, term: Terminator) -> Result<()> {
        self.body_mut(block)?.term = Some(term);
        self.rebuild_edges(block)
    }

    /// Drops and regenerates the outgoing edges of a block from its
    /// terminator, keeping graph metadata in sync after edits.
    pub fn rebuild_edges(&mut self, block: NodeIndex) -> Result<()> {
        let outgoing: Vec<_> = self
            .cfg
            .edges_directed(block, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for e in outgoing {
            self.cfg.remove_edge(e);
        }

        let term = self.body(block)?.term.clone();
        match term {
            None => {}
            Some(Terminator::Jump(target)) => {
                self.cfg.add_edge(block, target, EdgeType::Jump);
            }
            Some(Terminator::Branch {
                then_to, else_to, ..
            }) => {
                self.cfg.add_edge(block, then_to, EdgeType::BranchTrue);
                if else_to != then_to {
                    self.cfg.add_edge(block, else_to, EdgeType::BranchFalse);
                }
            }
            Some(Terminator::Return(_)) => {
                self.cfg.add_edge(block, self.exit, EdgeType::Fallthrough);
            }
        }
        Ok(())
    }

    /// Predecessor body blocks of a node.
    pub fn preds(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut preds: Vec<_> = self
            .cfg
            .neighbors_directed(node, Direction::Incoming)
            .filter(|&p| matches!(self.cfg[p], Block::Body(_)))
            .collect();
        preds.sort();
        preds.dedup();
        preds
    }

    /// Successor blocks of a node (body blocks only).
    pub fn succs(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut succs: Vec<_> = self
            .cfg
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|&s| matches!(self.cfg[s], Block::Body(_)))
            .collect();
        succs.sort();
        succs.dedup();
        succs
    }

    /// Marks a site value as already instrumented so a later sweep cannot
    /// pick it up again.
    pub fn mark_processed(&mut self, id: ValueId) {
        self.processed.insert(id);
    }

    pub fn is_processed(&self, id: ValueId) -> bool {
        self.processed.contains(&id)
    }

    /// Checks that every merge point holds exactly one binding per
    /// predecessor edge. A violation is an unrecoverable programming defect
    /// in whatever edit ran last, not a user-facing condition.
    pub fn verify_merge_totality(&self) -> Result<()> {
        for node in self.body_blocks() {
            let preds = self.preds(node);
            let body = self.body(node)?;
            for phi in &body.phis {
                let mut seen: Vec<NodeIndex> = Vec::new();
                for (pred, _) in &phi.incomings {
                    if !preds.contains(pred) {
                        return Err(Error::StructuralInvariant(format!(
                            "merge point {:?} in block {} binds non-predecessor {}",
                            phi.id,
                            node.index(),
                            pred.index()
                        )));
                    }
                    if seen.contains(pred) {
                        return Err(Error::StructuralInvariant(format!(
                            "merge point {:?} in block {} binds predecessor {} twice",
                            phi.id,
                            node.index(),
                            pred.index()
                        )));
                    }
                    seen.push(*pred);
                }
                for pred in &preds {
                    if !seen.contains(pred) {
                        return Err(Error::StructuralInvariant(format!(
                            "merge point {:?} in block {} is missing predecessor {}",
                            phi.id,
                            node.index(),
                            pred.index()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
