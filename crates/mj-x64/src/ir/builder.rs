//! Programmatic construction of well-formed IR graphs.
//!
//! The upstream lowering stage (and every test in this crate) builds graphs
//! through this interface instead of wiring arena nodes by hand.

use super::graph::{Graph, Mode, Node, NodeId, NodeKind, ProjKind, Relation};

pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    start: NodeId,
    end: NodeId,
    entry: NodeId,
    param_modes: Vec<Mode>,
    arg_tuple: NodeId,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(name: &str, param_modes: &[Mode]) -> Self {
        let mut nodes = Vec::new();
        let mut push = |kind, mode, preds: Vec<NodeId>, block| {
            let id = NodeId(nodes.len() as u32);
            nodes.push(Node {
                kind,
                mode,
                preds,
                block,
            });
            id
        };
        // The entry block's id is fixed up once known; the first three nodes
        // form the permanent header of every graph.
        let entry = NodeId(0);
        let entry = push(NodeKind::Block, Mode::Control, vec![], entry);
        let start = push(NodeKind::Start, Mode::Tuple, vec![], entry);
        let arg_tuple = push(
            NodeKind::Proj(ProjKind::ArgTuple),
            Mode::Tuple,
            vec![start],
            entry,
        );
        let end = push(NodeKind::End, Mode::Control, vec![], entry);
        Self {
            name: name.to_owned(),
            nodes,
            start,
            end,
            entry,
            param_modes: param_modes.to_vec(),
            arg_tuple,
        }
    }

    fn push(&mut self, kind: NodeKind, mode: Mode, preds: Vec<NodeId>, block: NodeId) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            mode,
            preds,
            block,
        });
        id
    }

    #[must_use]
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn new_block(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind: NodeKind::Block,
            mode: Mode::Control,
            preds: vec![],
            block: id,
        });
        id
    }

    /// Appends a control-flow edge: `jump` (a `Jmp` or a `Cond` projection)
    /// transfers into `block`.
    pub fn add_pred(&mut self, block: NodeId, jump: NodeId) {
        self.nodes[block.index()].preds.push(jump);
    }

    /// The initial memory state.
    pub fn start_mem(&mut self) -> NodeId {
        let start = self.start;
        let entry = self.entry;
        self.push(NodeKind::Proj(ProjKind::Mem), Mode::Mem, vec![start], entry)
    }

    /// Parameter `i`, projected out of the argument tuple.
    pub fn arg(&mut self, i: u32) -> NodeId {
        let mode = self.param_modes[i as usize];
        let tuple = self.arg_tuple;
        let entry = self.entry;
        self.push(NodeKind::Proj(ProjKind::Arg(i)), mode, vec![tuple], entry)
    }

    pub fn const_(&mut self, mode: Mode, value: i64) -> NodeId {
        let entry = self.entry;
        self.push(NodeKind::Const(value), mode, vec![], entry)
    }

    pub fn const_i32(&mut self, value: i32) -> NodeId {
        self.const_(Mode::Int32, i64::from(value))
    }

    pub fn address(&mut self, symbol: &str) -> NodeId {
        let entry = self.entry;
        self.push(
            NodeKind::Address(symbol.to_owned()),
            Mode::Int64,
            vec![],
            entry,
        )
    }

    fn binop(&mut self, kind: NodeKind, block: NodeId, lhs: NodeId, rhs: NodeId) -> NodeId {
        let mode = self.nodes[lhs.index()].mode;
        self.push(kind, mode, vec![lhs, rhs], block)
    }

    pub fn add(&mut self, block: NodeId, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.binop(NodeKind::Add, block, lhs, rhs)
    }

    pub fn sub(&mut self, block: NodeId, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.binop(NodeKind::Sub, block, lhs, rhs)
    }

    pub fn mul(&mut self, block: NodeId, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.binop(NodeKind::Mul, block, lhs, rhs)
    }

    pub fn and(&mut self, block: NodeId, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.binop(NodeKind::And, block, lhs, rhs)
    }

    pub fn neg(&mut self, block: NodeId, value: NodeId) -> NodeId {
        let mode = self.nodes[value.index()].mode;
        self.push(NodeKind::Neg, mode, vec![value], block)
    }

    /// Division; returns `(quotient, new_mem)`.
    pub fn div(&mut self, block: NodeId, mem: NodeId, lhs: NodeId, rhs: NodeId) -> (NodeId, NodeId) {
        let mode = self.nodes[lhs.index()].mode;
        let tuple = self.push(NodeKind::Div, Mode::Tuple, vec![mem, lhs, rhs], block);
        let res = self.push(NodeKind::Proj(ProjKind::Res), mode, vec![tuple], block);
        let mem = self.push(NodeKind::Proj(ProjKind::Mem), Mode::Mem, vec![tuple], block);
        (res, mem)
    }

    /// Remainder; returns `(remainder, new_mem)`.
    pub fn modulo(
        &mut self,
        block: NodeId,
        mem: NodeId,
        lhs: NodeId,
        rhs: NodeId,
    ) -> (NodeId, NodeId) {
        let mode = self.nodes[lhs.index()].mode;
        let tuple = self.push(NodeKind::Mod, Mode::Tuple, vec![mem, lhs, rhs], block);
        let res = self.push(NodeKind::Proj(ProjKind::Res), mode, vec![tuple], block);
        let mem = self.push(NodeKind::Proj(ProjKind::Mem), Mode::Mem, vec![tuple], block);
        (res, mem)
    }

    pub fn cmp(&mut self, block: NodeId, relation: Relation, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(NodeKind::Cmp(relation), Mode::Bool, vec![lhs, rhs], block)
    }

    /// Conditional exit of `block`; returns the `(true, false)` projections
    /// to be wired into the successor blocks.
    pub fn cond(&mut self, block: NodeId, cmp: NodeId) -> (NodeId, NodeId) {
        let cond = self.push(NodeKind::Cond, Mode::Tuple, vec![cmp], block);
        let t = self.push(
            NodeKind::Proj(ProjKind::True),
            Mode::Control,
            vec![cond],
            block,
        );
        let f = self.push(
            NodeKind::Proj(ProjKind::False),
            Mode::Control,
            vec![cond],
            block,
        );
        (t, f)
    }

    pub fn jmp(&mut self, block: NodeId) -> NodeId {
        self.push(NodeKind::Jmp, Mode::Control, vec![], block)
    }

    /// A Phi over value or memory operands, aligned positionally with the
    /// block's predecessors.
    pub fn phi(&mut self, block: NodeId, mode: Mode, operands: &[NodeId]) -> NodeId {
        self.push(NodeKind::Phi, mode, operands.to_vec(), block)
    }

    /// Replaces the operands of a Phi, for loop-carried values that are only
    /// known once the loop body is built.
    pub fn set_phi_operands(&mut self, phi: NodeId, operands: &[NodeId]) {
        debug_assert!(matches!(self.nodes[phi.index()].kind, NodeKind::Phi));
        self.nodes[phi.index()].preds = operands.to_vec();
    }

    /// Load through `ptr`; returns `(value, new_mem)`.
    pub fn load(&mut self, block: NodeId, mem: NodeId, ptr: NodeId, mode: Mode) -> (NodeId, NodeId) {
        let tuple = self.push(NodeKind::Load, Mode::Tuple, vec![mem, ptr], block);
        let res = self.push(NodeKind::Proj(ProjKind::Res), mode, vec![tuple], block);
        let mem = self.push(NodeKind::Proj(ProjKind::Mem), Mode::Mem, vec![tuple], block);
        (res, mem)
    }

    /// Store `value` through `ptr`; returns the new memory state.
    pub fn store(&mut self, block: NodeId, mem: NodeId, ptr: NodeId, value: NodeId) -> NodeId {
        self.push(NodeKind::Store, Mode::Mem, vec![mem, ptr, value], block)
    }

    /// Call the mangled symbol `target`. Returns `(result, new_mem)` where
    /// `result` is present when `result_mode` is.
    pub fn call(
        &mut self,
        block: NodeId,
        mem: NodeId,
        target: &str,
        args: &[NodeId],
        result_mode: Option<Mode>,
    ) -> (Option<NodeId>, NodeId) {
        let mut preds = vec![mem];
        preds.extend_from_slice(args);
        let tuple = self.push(NodeKind::Call(target.to_owned()), Mode::Tuple, preds, block);
        let res = result_mode
            .map(|mode| self.push(NodeKind::Proj(ProjKind::Res), mode, vec![tuple], block));
        let mem = self.push(NodeKind::Proj(ProjKind::Mem), Mode::Mem, vec![tuple], block);
        (res, mem)
    }

    /// Terminates `block` with a return and wires it into `End`.
    pub fn ret(&mut self, block: NodeId, mem: NodeId, value: Option<NodeId>) {
        let mut preds = vec![mem];
        if let Some(v) = value {
            preds.push(v);
        }
        let ret = self.push(NodeKind::Return, Mode::Control, preds, block);
        let end = self.end;
        self.nodes[end.index()].preds.push(ret);
    }

    #[must_use]
    pub fn finish(self) -> Graph {
        Graph::new(
            self.name,
            self.nodes,
            self.start,
            self.end,
            self.entry,
            self.param_modes,
        )
    }
}
