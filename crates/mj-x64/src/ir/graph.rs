//! The SSA-form IR graph the backend consumes.
//!
//! Nodes live in an arena owned by the [`Graph`]; edges are [`NodeId`]
//! indices, never owning references. Memory dependencies flow through
//! explicit `Mem`-mode edges, so the intra-block schedule falls out of a
//! plain topological walk.

use crate::error::{Error, Result};
use crate::x64::Width;

/// Index of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Bit width and kind of the value a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Int32,
    Int64,
    Bool,
    Mem,
    Tuple,
    Control,
}

impl Mode {
    /// Machine width of a value-carrying mode.
    #[must_use]
    pub const fn width(self) -> Option<Width> {
        match self {
            Self::Int32 => Some(Width::Dword),
            Self::Int64 => Some(Width::Qword),
            Self::Bool => Some(Width::Byte),
            Self::Mem | Self::Tuple | Self::Control => None,
        }
    }

    #[must_use]
    pub const fn is_value(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::Bool)
    }
}

/// Comparison relation of a `Cmp` node, consumed by the conditional exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Eq,
    Ne,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

impl Relation {
    #[must_use]
    pub const fn negated(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Less => Self::GreaterEq,
            Self::LessEq => Self::Greater,
            Self::Greater => Self::LessEq,
            Self::GreaterEq => Self::Less,
        }
    }
}

/// Which component a `Proj` selects out of its tuple-valued predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjKind {
    /// The argument tuple of `Start`.
    ArgTuple,
    /// Argument `i` out of the argument tuple.
    Arg(u32),
    /// The memory component.
    Mem,
    /// The value result.
    Res,
    /// Control when the condition holds.
    True,
    /// Control when the condition does not hold.
    False,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    End,
    Block,
    /// Unconditional control transfer out of its block.
    Jmp,
    /// Conditional control transfer; single predecessor is a `Cmp`.
    Cond,
    Proj(ProjKind),
    Phi,
    Const(i64),
    /// A global symbol, materialised only at use sites.
    Address(String),
    Add,
    Sub,
    Mul,
    And,
    Neg,
    /// Division; predecessors are `[mem, dividend, divisor]`.
    Div,
    /// Remainder; predecessors are `[mem, dividend, divisor]`.
    Mod,
    Cmp(Relation),
    /// Predecessors are `[mem, ptr]`; results selected via `Proj`.
    Load,
    /// Predecessors are `[mem, ptr, value]`; produces the new memory state.
    Store,
    /// Direct call of a mangled symbol; predecessors are `[mem, args...]`.
    Call(String),
    /// Predecessors are `[mem]` or `[mem, value]`.
    Return,
}

impl NodeKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::End => "End",
            Self::Block => "Block",
            Self::Jmp => "Jmp",
            Self::Cond => "Cond",
            Self::Proj(_) => "Proj",
            Self::Phi => "Phi",
            Self::Const(_) => "Const",
            Self::Address(_) => "Address",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::And => "And",
            Self::Neg => "Neg",
            Self::Div => "Div",
            Self::Mod => "Mod",
            Self::Cmp(_) => "Cmp",
            Self::Load => "Load",
            Self::Store => "Store",
            Self::Call(_) => "Call",
            Self::Return => "Return",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub mode: Mode,
    pub preds: Vec<NodeId>,
    /// The block this node belongs to. For `Block` nodes, the node itself.
    pub block: NodeId,
}

/// An immutable SSA graph for one procedure.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    start: NodeId,
    end: NodeId,
    entry: NodeId,
    param_modes: Vec<Mode>,
}

impl Graph {
    pub(crate) fn new(
        name: String,
        nodes: Vec<Node>,
        start: NodeId,
        end: NodeId,
        entry: NodeId,
        param_modes: Vec<Mode>,
    ) -> Self {
        Self {
            name,
            nodes,
            start,
            end,
            entry,
            param_modes,
        }
    }

    /// The mangled symbol this procedure is emitted under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[must_use]
    pub fn start(&self) -> NodeId {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> NodeId {
        self.end
    }

    /// The entry block.
    #[must_use]
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    #[must_use]
    pub fn param_modes(&self) -> &[Mode] {
        &self.param_modes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids in arena order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }

    /// All `Block` nodes in arena order.
    pub fn blocks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ids()
            .filter(|id| matches!(self.node(*id).kind, NodeKind::Block))
    }

    /// Structural sanity checks used by debug assertions and tests.
    pub fn validate(&self) -> Result<()> {
        for id in self.ids() {
            let node = self.node(id);
            for &pred in &node.preds {
                if pred.index() >= self.nodes.len() {
                    return Err(Error::MalformedGraph(format!(
                        "node {} has dangling predecessor {}",
                        id.0, pred.0
                    )));
                }
            }
            match &node.kind {
                NodeKind::Phi if node.mode != Mode::Mem => {
                    let block = self.node(node.block);
                    if node.preds.len() != block.preds.len() {
                        return Err(Error::MalformedGraph(format!(
                            "Phi {} has {} operands but its block has {} predecessors",
                            id.0,
                            node.preds.len(),
                            block.preds.len()
                        )));
                    }
                }
                NodeKind::Block => {
                    for &pred in &node.preds {
                        let kind = &self.node(pred).kind;
                        let is_control = matches!(
                            kind,
                            NodeKind::Jmp | NodeKind::Proj(ProjKind::True | ProjKind::False)
                        );
                        if !is_control {
                            return Err(Error::MalformedGraph(format!(
                                "block {} has non-control predecessor {} ({})",
                                id.0,
                                pred.0,
                                kind.name()
                            )));
                        }
                    }
                }
                NodeKind::Return => {
                    if node.preds.is_empty() {
                        return Err(Error::MalformedGraph(format!(
                            "Return {} is missing its memory predecessor",
                            id.0
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
