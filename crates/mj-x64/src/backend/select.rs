//! Instruction selection.
//!
//! Walks each linearised block in a topological order of its data and memory
//! dependencies and emits two-address x86-64 instructions over virtual
//! registers. Calling-convention and fixed-register requirements (argument
//! passing, division, return values) are encoded as hard constraints on
//! fresh virtual registers; Phis become block metadata for the move
//! resolver.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::abi;
use crate::error::{Error, Result};
use crate::ir::{Graph, Mode, NodeId, NodeKind, ProjKind, Relation};
use crate::x64::{AddrMode, Instr, Operand, Reg, RegRef, VirtReg, VirtRegSupply, Width};

use super::schedule::Schedule;

/// Ordinal of a block in the linearised order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a block transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Terminal block; ends in a return.
    Zero,
    /// Unconditional jump.
    One(BlockId),
    /// Conditional jump on the relation established by the block's final
    /// `cmp`: `(relation, true_target, false_target)`.
    Two(Relation, BlockId, BlockId),
}

impl Exit {
    /// Successor blocks, true target first.
    #[must_use]
    pub fn targets(&self) -> Vec<BlockId> {
        match *self {
            Self::Zero => vec![],
            Self::One(t) => vec![t],
            Self::Two(_, t, f) => vec![t, f],
        }
    }
}

/// A Phi attached to a block head: one source operand per predecessor,
/// positionally aligned with `LowBlock::preds`.
#[derive(Debug, Clone)]
pub struct Phi {
    pub dst: VirtReg,
    pub width: Width,
    pub srcs: Vec<Operand>,
}

#[derive(Debug, Clone)]
pub struct LowBlock {
    pub instrs: Vec<Instr>,
    pub phis: Vec<Phi>,
    pub exit: Exit,
    pub preds: Vec<BlockId>,
    /// For loop headers, the last block of the loop body.
    pub loop_end: Option<BlockId>,
}

/// One procedure after instruction selection: linearised blocks of virtual
/// register instructions.
#[derive(Debug)]
pub struct LowFunc {
    pub name: String,
    pub blocks: Vec<LowBlock>,
    pub vregs: VirtRegSupply,
}

impl LowFunc {
    /// End position of a block on the lifetime axis; exceeds the def slot of
    /// the final instruction.
    #[must_use]
    pub fn block_end(&self, block: BlockId) -> u32 {
        2 * self.blocks[block.index()].instrs.len() as u32 + 2
    }
}

pub fn select(graph: &Graph, schedule: &Schedule) -> Result<LowFunc> {
    Selector::new(graph, schedule).run()
}

struct Selector<'g> {
    graph: &'g Graph,
    schedule: &'g Schedule,
    vregs: VirtRegSupply,
    values: HashMap<NodeId, Operand>,
    done: HashSet<NodeId>,
    /// Deferred compares: operands of a `Cmp`, emitted at the terminator so
    /// no intervening instruction clobbers the flags.
    cmp_operands: HashMap<NodeId, (Operand, Operand)>,
    /// Control node -> ordinal of the block it enters.
    target_of: HashMap<NodeId, usize>,
    ordinal_of: HashMap<NodeId, usize>,
    blocks: Vec<LowBlock>,
    /// Phi sources that referred to not-yet-emitted nodes (loop-carried
    /// values): `(block, phi index, operand index, node)`.
    phi_fixups: Vec<(usize, usize, usize, NodeId)>,
    cur: usize,
}

impl<'g> Selector<'g> {
    fn new(graph: &'g Graph, schedule: &'g Schedule) -> Self {
        let mut target_of = HashMap::new();
        let mut ordinal_of = HashMap::new();
        for (ordinal, &block) in schedule.blocks.iter().enumerate() {
            ordinal_of.insert(block, ordinal);
            for &jump in &graph.node(block).preds {
                target_of.insert(jump, ordinal);
            }
        }
        Self {
            graph,
            schedule,
            vregs: VirtRegSupply::new(),
            values: HashMap::new(),
            done: HashSet::new(),
            cmp_operands: HashMap::new(),
            target_of,
            ordinal_of,
            blocks: Vec::new(),
            phi_fixups: Vec::new(),
            cur: 0,
        }
    }

    fn run(mut self) -> Result<LowFunc> {
        for ordinal in 0..self.schedule.len() {
            self.cur = ordinal;
            let block = self.schedule.blocks[ordinal];
            let preds = self.graph.node(block).preds.clone();
            self.blocks.push(LowBlock {
                instrs: Vec::new(),
                phis: Vec::new(),
                exit: Exit::Zero,
                preds: preds
                    .iter()
                    .map(|&jump| BlockId(self.ordinal_of[&self.graph.node(jump).block] as u32))
                    .collect(),
                loop_end: self.schedule.loop_end[ordinal].map(|e| BlockId(e as u32)),
            });
            if ordinal == 0 {
                self.lower_params();
            }
            self.declare_phis(block);
            self.lower_block(block)?;
            self.lower_exit(block)?;
        }
        self.resolve_phi_fixups()?;
        trace!(
            vregs = self.vregs.len(),
            blocks = self.blocks.len(),
            "instruction selection finished"
        );
        Ok(LowFunc {
            name: self.graph.name().to_owned(),
            blocks: self.blocks,
            vregs: self.vregs,
        })
    }

    fn push(&mut self, instr: Instr) {
        self.blocks[self.cur].instrs.push(instr);
    }

    /// Incoming parameters: the first six arrive in the argument registers
    /// and are copied out of constrained temporaries immediately; the rest
    /// are loaded from the caller's frame.
    fn lower_params(&mut self) {
        for (i, mode) in self.graph.param_modes().iter().enumerate() {
            let Some(width) = mode.width() else { continue };
            let value = self.vregs.fresh(width);
            let dst = Operand::Reg(width, RegRef::Virt(value));
            if i < abi::ARG_REGS.len() {
                let incoming = self.vregs.fresh_constrained(width, abi::ARG_REGS[i]);
                self.push(Instr::Mov {
                    src: Operand::Reg(width, RegRef::Virt(incoming)),
                    dst,
                });
            } else {
                let disp = abi::FIRST_STACK_PARAM_OFFSET
                    + abi::WORD_SIZE * (i - abi::ARG_REGS.len()) as i32;
                self.push(Instr::Mov {
                    src: Operand::Mem(width, AddrMode::base_disp(RegRef::Phys(Reg::Bp), disp)),
                    dst,
                });
            }
            // Remember the copied value for the matching argument projection.
            self.values.insert(self.arg_proj(i), dst);
        }
    }

    /// The `Proj(Arg(i))` node, if the procedure references parameter `i`.
    fn arg_proj(&self, i: usize) -> NodeId {
        for id in self.graph.ids() {
            if let NodeKind::Proj(ProjKind::Arg(n)) = self.graph.node(id).kind
                && n as usize == i
            {
                return id;
            }
        }
        // Unused parameter: park the value under a node id nothing refers to.
        self.graph.start()
    }

    /// Registers the block's Phis so their destinations exist before any
    /// intra-block use; sources are resolved once every block is emitted.
    fn declare_phis(&mut self, block: NodeId) {
        for id in self.graph.ids() {
            let node = self.graph.node(id);
            if node.block != block || !matches!(node.kind, NodeKind::Phi) {
                continue;
            }
            self.done.insert(id);
            let Some(width) = node.mode.width() else {
                continue; // memory Phis produce no code
            };
            let dst = self.vregs.fresh(width);
            self.values.insert(id, Operand::Reg(width, RegRef::Virt(dst)));
            let phi_index = self.blocks[self.cur].phis.len();
            let placeholder = Operand::Imm(width, 0);
            self.blocks[self.cur].phis.push(Phi {
                dst,
                width,
                srcs: vec![placeholder; node.preds.len()],
            });
            for (j, &src) in node.preds.iter().enumerate() {
                self.phi_fixups.push((self.cur, phi_index, j, src));
            }
        }
    }

    fn lower_block(&mut self, block: NodeId) -> Result<()> {
        for id in self.graph.ids() {
            if self.graph.node(id).block == block {
                self.emit(id)?;
            }
        }
        Ok(())
    }

    fn emit(&mut self, id: NodeId) -> Result<()> {
        if !self.done.insert(id) {
            return Ok(());
        }
        let node = self.graph.node(id).clone();
        match &node.kind {
            NodeKind::Start
            | NodeKind::End
            | NodeKind::Block
            | NodeKind::Jmp
            | NodeKind::Phi
            | NodeKind::Address(_)
            | NodeKind::Proj(ProjKind::ArgTuple | ProjKind::True | ProjKind::False) => {}
            NodeKind::Cond => self.emit(node.preds[0])?,
            NodeKind::Const(value) => {
                self.values.insert(id, Operand::Imm(self.width_of(id)?, *value));
            }
            NodeKind::Proj(ProjKind::Arg(_)) => {
                // Parameter copies are emitted up front; an argument
                // projection without a recorded value is a malformed graph.
                if !self.values.contains_key(&id) {
                    return Err(Error::MalformedGraph(format!(
                        "argument projection {} outside the entry block",
                        id.0
                    )));
                }
            }
            NodeKind::Proj(ProjKind::Mem) => self.emit(node.preds[0])?,
            NodeKind::Proj(ProjKind::Res) => {
                self.emit(node.preds[0])?;
                let result = self.values.get(&node.preds[0]).copied().ok_or_else(|| {
                    Error::InvariantViolation {
                        node: id.0,
                        message: "result projection on a value-less node".to_owned(),
                    }
                })?;
                self.values.insert(id, result);
            }
            NodeKind::Add | NodeKind::Sub | NodeKind::Mul | NodeKind::And => {
                self.lower_binop(id, &node.kind, node.preds[0], node.preds[1])?;
            }
            NodeKind::Neg => {
                let value = self.operand_of(node.preds[0])?;
                let dst = self.copy_to_temp(value);
                self.push(Instr::Neg { dst });
                self.values.insert(id, dst);
            }
            NodeKind::Cmp(_) => {
                let lhs = self.operand_of(node.preds[0])?;
                let rhs = self.operand_of(node.preds[1])?;
                self.cmp_operands.insert(id, (lhs, rhs));
            }
            NodeKind::Div => self.lower_division(id, &node, true)?,
            NodeKind::Mod => self.lower_division(id, &node, false)?,
            NodeKind::Load => {
                self.emit(node.preds[0])?;
                let ptr = self.operand_of(node.preds[1])?;
                let ptr = self.force_reg(ptr);
                let Operand::Reg(_, base) = ptr else {
                    unreachable!()
                };
                let width = self.result_width(id)?;
                let dst = Operand::Reg(width, RegRef::Virt(self.vregs.fresh(width)));
                self.push(Instr::Mov {
                    src: Operand::Mem(width, AddrMode::base(base)),
                    dst,
                });
                self.values.insert(id, dst);
            }
            NodeKind::Store => {
                self.emit(node.preds[0])?;
                let ptr = self.operand_of(node.preds[1])?;
                let value = self.operand_of(node.preds[2])?;
                let ptr = self.force_reg(ptr);
                let Operand::Reg(_, base) = ptr else {
                    unreachable!()
                };
                let value = self.legal_imm_src(value);
                self.push(Instr::Mov {
                    src: value,
                    dst: Operand::Mem(value.width(), AddrMode::base(base)),
                });
            }
            NodeKind::Call(target) => self.lower_call(id, target.clone(), &node.preds)?,
            NodeKind::Return => {
                self.emit(node.preds[0])?;
                if let Some(&value) = node.preds.get(1) {
                    let value = self.operand_of(value)?;
                    let width = value.width();
                    let out = self.vregs.fresh_constrained(width, abi::RETURN_REG);
                    self.push(Instr::Mov {
                        src: value,
                        dst: Operand::Reg(width, RegRef::Virt(out)),
                    });
                }
            }
        }
        Ok(())
    }

    fn lower_binop(
        &mut self,
        id: NodeId,
        kind: &NodeKind,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<()> {
        let lhs = self.operand_of(lhs)?;
        let rhs = self.operand_of(rhs)?;
        let dst = self.copy_to_temp(lhs);
        let src = self.legal_imm_src(rhs);
        let src = match kind {
            // imul has no immediate form in its two-address encoding.
            NodeKind::Mul => self.force_reg(src),
            _ => src,
        };
        let instr = match kind {
            NodeKind::Add => Instr::Add { src, dst },
            NodeKind::Sub => Instr::Sub { src, dst },
            NodeKind::Mul => Instr::Imul { src, dst },
            NodeKind::And => Instr::And { src, dst },
            _ => unreachable!(),
        };
        self.push(instr);
        self.values.insert(id, dst);
        Ok(())
    }

    fn lower_division(&mut self, id: NodeId, node: &crate::ir::Node, quotient: bool) -> Result<()> {
        self.emit(node.preds[0])?;
        let lhs = self.operand_of(node.preds[1])?;
        let rhs = self.operand_of(node.preds[2])?;
        let width = lhs.width();
        if width != Width::Dword {
            return Err(Error::UnsupportedMode {
                node: id.0,
                mode: format!("{width:?} division"),
            });
        }
        // Dividend lives in A; cltd sign-extends it into D before idiv.
        let dividend = self.vregs.fresh_constrained(width, Reg::A);
        self.push(Instr::Mov {
            src: lhs,
            dst: Operand::Reg(width, RegRef::Virt(dividend)),
        });
        self.push(Instr::Cltd);
        let divisor = self.force_reg(rhs);
        let constrained = if quotient {
            self.vregs.fresh_constrained(width, Reg::A)
        } else {
            self.vregs.fresh_constrained(width, Reg::D)
        };
        self.push(Instr::Idiv {
            divisor,
            dividend: RegRef::Virt(dividend),
            quotient: quotient.then_some(RegRef::Virt(constrained)),
            remainder: (!quotient).then_some(RegRef::Virt(constrained)),
        });
        let result = Operand::Reg(width, RegRef::Virt(self.vregs.fresh(width)));
        self.push(Instr::Mov {
            src: Operand::Reg(width, RegRef::Virt(constrained)),
            dst: result,
        });
        self.values.insert(id, result);
        Ok(())
    }

    fn lower_call(&mut self, id: NodeId, target: String, preds: &[NodeId]) -> Result<()> {
        self.emit(preds[0])?;
        let args: Vec<Operand> = preds[1..]
            .iter()
            .map(|&arg| self.operand_of(arg))
            .collect::<Result<_>>()?;

        let stack_args = args.len().saturating_sub(abi::ARG_REGS.len());
        let region = align_up(abi::WORD_SIZE * stack_args as i32, abi::STACK_ALIGNMENT);
        if region > 0 {
            self.push(Instr::Sub {
                src: Operand::Imm(Width::Qword, i64::from(region)),
                dst: Operand::reg(Width::Qword, Reg::Sp),
            });
        }

        let mut arg_regs = Vec::new();
        for (i, &arg) in args.iter().enumerate() {
            let width = arg.width();
            if i < abi::ARG_REGS.len() {
                let incoming = self.vregs.fresh_constrained(width, abi::ARG_REGS[i]);
                self.push(Instr::Mov {
                    src: arg,
                    dst: Operand::Reg(width, RegRef::Virt(incoming)),
                });
                arg_regs.push(RegRef::Virt(incoming));
            } else {
                let disp = abi::WORD_SIZE * (i - abi::ARG_REGS.len()) as i32;
                let src = self.legal_imm_src(arg);
                self.push(Instr::Mov {
                    src,
                    dst: Operand::Mem(width, AddrMode::base_disp(RegRef::Phys(Reg::Sp), disp)),
                });
            }
        }

        let result_width = self.result_width(id).ok();
        let result_temp =
            result_width.map(|w| self.vregs.fresh_constrained(w, abi::RETURN_REG));
        self.push(Instr::Call {
            target,
            args: arg_regs,
            result: result_temp.map(RegRef::Virt),
        });
        if let (Some(width), Some(temp)) = (result_width, result_temp) {
            let result = Operand::Reg(width, RegRef::Virt(self.vregs.fresh(width)));
            self.push(Instr::Mov {
                src: Operand::Reg(width, RegRef::Virt(temp)),
                dst: result,
            });
            self.values.insert(id, result);
        }

        if region > 0 {
            self.push(Instr::Add {
                src: Operand::Imm(Width::Qword, i64::from(region)),
                dst: Operand::reg(Width::Qword, Reg::Sp),
            });
        }
        Ok(())
    }

    fn lower_exit(&mut self, block: NodeId) -> Result<()> {
        let mut exit = Exit::Zero;
        for id in self.graph.ids() {
            let node = self.graph.node(id);
            if node.block != block {
                continue;
            }
            match &node.kind {
                NodeKind::Jmp => {
                    exit = Exit::One(BlockId(self.target_of[&id] as u32));
                }
                NodeKind::Cond => {
                    let cmp = node.preds[0];
                    let NodeKind::Cmp(relation) = self.graph.node(cmp).kind else {
                        return Err(Error::InvariantViolation {
                            node: id.0,
                            message: "Cond predecessor is not a Cmp".to_owned(),
                        });
                    };
                    let (mut lhs, rhs) = self.cmp_operands.get(&cmp).copied().ok_or_else(|| {
                        Error::InvariantViolation {
                            node: cmp.0,
                            message: "Cmp operands were never evaluated".to_owned(),
                        }
                    })?;
                    // The left side carries the flags and must be a register.
                    if matches!(lhs, Operand::Imm(..)) {
                        lhs = self.force_reg(lhs);
                    }
                    let rhs = self.legal_imm_src(rhs);
                    self.push(Instr::Cmp { lhs, rhs });
                    let (t, f) = self.cond_targets(id)?;
                    exit = Exit::Two(relation, t, f);
                }
                _ => {}
            }
        }
        self.blocks[self.cur].exit = exit;
        Ok(())
    }

    fn cond_targets(&self, cond: NodeId) -> Result<(BlockId, BlockId)> {
        let mut true_target = None;
        let mut false_target = None;
        for id in self.graph.ids() {
            let node = self.graph.node(id);
            if node.preds.first() == Some(&cond) {
                match node.kind {
                    NodeKind::Proj(ProjKind::True) => {
                        true_target = self.target_of.get(&id).copied();
                    }
                    NodeKind::Proj(ProjKind::False) => {
                        false_target = self.target_of.get(&id).copied();
                    }
                    _ => {}
                }
            }
        }
        match (true_target, false_target) {
            (Some(t), Some(f)) => Ok((BlockId(t as u32), BlockId(f as u32))),
            _ => Err(Error::InvariantViolation {
                node: cond.0,
                message: "Cond is missing a branch target".to_owned(),
            }),
        }
    }

    fn resolve_phi_fixups(&mut self) -> Result<()> {
        for (block, phi, j, src) in std::mem::take(&mut self.phi_fixups) {
            let operand = match &self.graph.node(src).kind {
                NodeKind::Const(value) => Operand::Imm(self.width_of(src)?, *value),
                NodeKind::Address(symbol) => {
                    // Materialise into the predecessor so the value exists
                    // on that edge.
                    let pred = self.blocks[block].preds[j];
                    let dst = Operand::Reg(
                        Width::Qword,
                        RegRef::Virt(self.vregs.fresh(Width::Qword)),
                    );
                    self.blocks[pred.index()].instrs.push(Instr::Lea {
                        symbol: symbol.clone(),
                        dst,
                    });
                    dst
                }
                _ => self.values.get(&src).copied().ok_or_else(|| {
                    Error::InvariantViolation {
                        node: src.0,
                        message: "Phi source was never emitted".to_owned(),
                    }
                })?,
            };
            self.blocks[block].phis[phi].srcs[j] = operand;
        }
        Ok(())
    }

    fn operand_of(&mut self, id: NodeId) -> Result<Operand> {
        if let NodeKind::Address(symbol) = &self.graph.node(id).kind {
            // Addresses are materialised at each use site.
            let symbol = symbol.clone();
            let dst = Operand::Reg(Width::Qword, RegRef::Virt(self.vregs.fresh(Width::Qword)));
            self.push(Instr::Lea { symbol, dst });
            return Ok(dst);
        }
        self.emit(id)?;
        self.values
            .get(&id)
            .copied()
            .ok_or_else(|| Error::UnsupportedNode(self.graph.node(id).kind.name().to_owned()))
    }

    /// Copies an operand into a fresh temporary, the destination of a
    /// two-address instruction.
    fn copy_to_temp(&mut self, src: Operand) -> Operand {
        let width = src.width();
        let dst = Operand::Reg(width, RegRef::Virt(self.vregs.fresh(width)));
        self.push(Instr::Mov { src, dst });
        dst
    }

    /// Forces an operand into a register position.
    fn force_reg(&mut self, op: Operand) -> Operand {
        match op {
            Operand::Reg(..) => op,
            Operand::Imm(..) | Operand::Mem(..) => self.copy_to_temp(op),
        }
    }

    /// Immediates wider than 32 bits cannot be encoded inline anywhere but a
    /// register move; materialise them first.
    fn legal_imm_src(&mut self, op: Operand) -> Operand {
        if matches!(op, Operand::Imm(..)) && !op.is_imm32() {
            self.force_reg(op)
        } else {
            op
        }
    }

    fn width_of(&self, id: NodeId) -> Result<Width> {
        let node = self.graph.node(id);
        node.mode.width().ok_or_else(|| Error::UnsupportedMode {
            node: id.0,
            mode: format!("{}", node.mode),
        })
    }

    /// Width of the value a tuple node's `Res` projection selects.
    fn result_width(&self, tuple: NodeId) -> Result<Width> {
        for id in self.graph.ids() {
            let node = self.graph.node(id);
            if node.preds.first() == Some(&tuple)
                && matches!(node.kind, NodeKind::Proj(ProjKind::Res))
            {
                return self.width_of(id);
            }
        }
        Err(Error::InvariantViolation {
            node: tuple.0,
            message: "tuple node has no result projection".to_owned(),
        })
    }
}

const fn align_up(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::schedule;
    use crate::ir::GraphBuilder;
    use crate::x64::InstrKind;

    fn lower(graph: &Graph) -> LowFunc {
        let schedule = schedule::linearize(graph).unwrap();
        select(graph, &schedule).unwrap()
    }

    #[test]
    fn constants_stay_immediate_until_used() {
        let mut b = GraphBuilder::new("t", &[]);
        let entry = b.entry();
        let one = b.const_i32(1);
        let two = b.const_i32(2);
        let sum = b.add(entry, one, two);
        let mem = b.start_mem();
        b.ret(entry, mem, Some(sum));
        let func = lower(&b.finish());

        let instrs = &func.blocks[0].instrs;
        // mov $1 -> t; add $2, t; mov t -> A-constrained out
        assert_eq!(instrs[0].kind(), InstrKind::Mov);
        assert_eq!(instrs[1].kind(), InstrKind::Add);
        assert!(matches!(
            instrs[1],
            Instr::Add {
                src: Operand::Imm(_, 2),
                ..
            }
        ));
    }

    #[test]
    fn subtraction_copies_the_left_operand() {
        let mut b = GraphBuilder::new("t", &[Mode::Int32, Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let y = b.arg(1);
        let diff = b.sub(entry, x, y);
        let mem = b.start_mem();
        b.ret(entry, mem, Some(diff));
        let func = lower(&b.finish());

        let instrs = &func.blocks[0].instrs;
        // Find the sub; its dst must have been freshly copied from x.
        let sub_at = instrs
            .iter()
            .position(|i| i.kind() == InstrKind::Sub)
            .unwrap();
        let Instr::Sub { dst, .. } = &instrs[sub_at] else {
            unreachable!()
        };
        let Instr::Mov { dst: copied, .. } = &instrs[sub_at - 1] else {
            panic!("expected the left operand to be copied into a temporary");
        };
        assert_eq!(copied, dst);
    }

    #[test]
    fn division_constrains_dividend_and_quotient_to_a() {
        let mut b = GraphBuilder::new("t", &[Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let seven = b.const_i32(7);
        let mem = b.start_mem();
        let (q, mem) = b.div(entry, mem, x, seven);
        b.ret(entry, mem, Some(q));
        let func = lower(&b.finish());

        let instrs = &func.blocks[0].instrs;
        let idiv_at = instrs
            .iter()
            .position(|i| i.kind() == InstrKind::Idiv)
            .unwrap();
        assert_eq!(instrs[idiv_at - 2].kind(), InstrKind::Cltd);
        let Instr::Idiv {
            dividend, quotient, ..
        } = &instrs[idiv_at]
        else {
            unreachable!()
        };
        let dividend = dividend.as_virt().unwrap();
        let quotient = quotient.unwrap().as_virt().unwrap();
        assert_eq!(func.vregs.constraint(dividend), Some(Reg::A));
        assert_eq!(func.vregs.constraint(quotient), Some(Reg::A));
    }

    #[test]
    fn call_moves_arguments_into_constrained_registers() {
        let mut b = GraphBuilder::new("t", &[Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let mem = b.start_mem();
        let (_, mem) = b.call(entry, mem, "print_int", &[x], None);
        b.ret(entry, mem, None);
        let func = lower(&b.finish());

        let instrs = &func.blocks[0].instrs;
        let call_at = instrs
            .iter()
            .position(|i| i.kind() == InstrKind::Call)
            .unwrap();
        let Instr::Call { args, result, .. } = &instrs[call_at] else {
            unreachable!()
        };
        assert_eq!(args.len(), 1);
        assert_eq!(
            func.vregs.constraint(args[0].as_virt().unwrap()),
            Some(Reg::Di)
        );
        assert!(result.is_none());
    }

    #[test]
    fn eighth_argument_goes_to_the_stack() {
        let mut b = GraphBuilder::new("t", &[]);
        let entry = b.entry();
        let args: Vec<_> = (0..8).map(|i| b.const_i32(i)).collect();
        let mem = b.start_mem();
        let (_, mem) = b.call(entry, mem, "callee", &args, Some(Mode::Int32));
        b.ret(entry, mem, None);
        let func = lower(&b.finish());

        let instrs = &func.blocks[0].instrs;
        // Stack region reserved and released, 16-byte aligned.
        assert!(matches!(
            instrs.first(),
            Some(Instr::Sub {
                src: Operand::Imm(_, 16),
                ..
            })
        ));
        assert!(instrs.iter().any(|i| matches!(
            i,
            Instr::Mov {
                dst: Operand::Mem(_, mode),
                ..
            } if mode.base == RegRef::Phys(Reg::Sp) && mode.disp == 8
        )));
        assert!(matches!(
            instrs.last(),
            Some(Instr::Add {
                src: Operand::Imm(_, 16),
                ..
            })
        ));
    }

    #[test]
    fn long_immediate_is_materialised_for_stores() {
        let mut b = GraphBuilder::new("t", &[Mode::Int64]);
        let entry = b.entry();
        let ptr = b.arg(0);
        let big = b.const_(Mode::Int64, 0x1_0000_0000);
        let mem = b.start_mem();
        let mem = b.store(entry, mem, ptr, big);
        b.ret(entry, mem, None);
        let func = lower(&b.finish());

        // The store source must be a register, fed by a 64-bit move.
        let store = func.blocks[0]
            .instrs
            .iter()
            .find(|i| matches!(i, Instr::Mov { dst: Operand::Mem(..), .. }))
            .unwrap();
        let Instr::Mov { src, .. } = store else {
            unreachable!()
        };
        assert!(matches!(src, Operand::Reg(..)));
        assert!(func.blocks[0].instrs.iter().any(|i| matches!(
            i,
            Instr::Mov {
                src: Operand::Imm(_, 0x1_0000_0000),
                dst: Operand::Reg(..),
            }
        )));
    }

    #[test]
    fn phi_sources_follow_predecessor_order() {
        let mut b = GraphBuilder::new("t", &[]);
        let entry = b.entry();
        let one = b.const_i32(1);
        let two = b.const_i32(2);
        let cmp = b.cmp(entry, Relation::Less, two, one);
        let (t, f) = b.cond(entry, cmp);
        let less = b.new_block();
        let ge = b.new_block();
        b.add_pred(less, t);
        b.add_pred(ge, f);
        let exit = b.new_block();
        let jl = b.jmp(less);
        let jg = b.jmp(ge);
        b.add_pred(exit, jl);
        b.add_pred(exit, jg);
        let phi = b.phi(exit, Mode::Int32, &[one, two]);
        let mem = b.start_mem();
        b.ret(exit, mem, Some(phi));
        let func = lower(&b.finish());

        let exit_block = func
            .blocks
            .iter()
            .find(|blk| !blk.phis.is_empty())
            .unwrap();
        assert_eq!(exit_block.phis[0].srcs.len(), 2);
        assert!(matches!(exit_block.phis[0].srcs[0], Operand::Imm(_, 1)));
        assert!(matches!(exit_block.phis[0].srcs[1], Operand::Imm(_, 2)));
    }
}
