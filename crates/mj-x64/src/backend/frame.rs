//! Stack frame layout.
//!
//! Spill slots are allocated contiguously downward from the frame base and
//! keyed on the root virtual register, so every split of one value shares a
//! single slot. The prologue/epilogue pair also saves whichever callee-saved
//! registers the allocator handed out.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::abi;
use crate::x64::{AddrMode, Instr, Operand, Reg, RegRef, VirtReg, Width};

use super::select::{Exit, LowFunc};

/// A spill slot; the frame-relative offset is fixed once allocation is done
/// and the callee-saved register count is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot {
    pub index: u32,
    pub width: Width,
}

#[derive(Debug, Default)]
pub struct Frame {
    slots: BTreeMap<VirtReg, StackSlot>,
    used_callee_saved: BTreeSet<Reg>,
}

impl Frame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The spill slot of `root`, allocating one on first request.
    pub fn slot_for(&mut self, root: VirtReg, width: Width) -> StackSlot {
        let next = u32::try_from(self.slots.len()).expect("stack slot supply exhausted");
        *self
            .slots
            .entry(root)
            .or_insert(StackSlot { index: next, width })
    }

    /// Records that the allocator assigned a callee-saved register.
    pub fn note_assignment(&mut self, reg: Reg) {
        if abi::is_callee_saved(reg) {
            self.used_callee_saved.insert(reg);
        }
    }

    #[must_use]
    pub fn used_callee_saved(&self) -> impl Iterator<Item = Reg> + '_ {
        self.used_callee_saved.iter().copied()
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Offset of a slot relative to `rbp`; the saved callee registers sit
    /// between the saved base pointer and the slot area.
    #[must_use]
    pub fn slot_offset(&self, slot: StackSlot) -> i32 {
        let saved = self.used_callee_saved.len() as i32;
        -abi::WORD_SIZE * (saved + 1 + slot.index as i32)
    }

    /// Bytes subtracted from `rsp` after the pushes; padded so the stack is
    /// 16-byte aligned at every call site.
    #[must_use]
    pub fn frame_size(&self) -> i32 {
        let pushed = abi::WORD_SIZE * self.used_callee_saved.len() as i32;
        let mut size = abi::WORD_SIZE * self.slots.len() as i32;
        while (pushed + size) % abi::STACK_ALIGNMENT != 0 {
            size += abi::WORD_SIZE;
        }
        size
    }

    fn prologue(&self) -> Vec<Instr> {
        let mut instrs = vec![
            Instr::Push {
                src: Operand::reg(Width::Qword, Reg::Bp),
            },
            Instr::Mov {
                src: Operand::reg(Width::Qword, Reg::Sp),
                dst: Operand::reg(Width::Qword, Reg::Bp),
            },
        ];
        for reg in self.used_callee_saved() {
            instrs.push(Instr::Push {
                src: Operand::reg(Width::Qword, reg),
            });
        }
        let size = self.frame_size();
        if size > 0 {
            instrs.push(Instr::Sub {
                src: Operand::Imm(Width::Qword, i64::from(size)),
                dst: Operand::reg(Width::Qword, Reg::Sp),
            });
        }
        instrs
    }

    fn epilogue(&self) -> Vec<Instr> {
        let mut instrs = Vec::new();
        let size = self.frame_size();
        if size > 0 {
            instrs.push(Instr::Add {
                src: Operand::Imm(Width::Qword, i64::from(size)),
                dst: Operand::reg(Width::Qword, Reg::Sp),
            });
        }
        for reg in self.used_callee_saved().collect::<Vec<_>>().into_iter().rev() {
            instrs.push(Instr::Pop {
                dst: Operand::reg(Width::Qword, reg),
            });
        }
        instrs.push(Instr::Pop {
            dst: Operand::reg(Width::Qword, Reg::Bp),
        });
        instrs.push(Instr::Ret);
        instrs
    }

    /// Inserts the prologue at the entry and an epilogue plus `ret` into
    /// every return block.
    pub fn apply(&self, func: &mut LowFunc) {
        let prologue = self.prologue();
        func.blocks[0].instrs.splice(0..0, prologue);
        for block in &mut func.blocks {
            if matches!(block.exit, Exit::Zero) {
                block.instrs.extend(self.epilogue());
            }
        }
    }

    /// A memory operand addressing `slot` through the frame base.
    #[must_use]
    pub fn slot_operand(&self, slot: StackSlot) -> Operand {
        Operand::Mem(
            slot.width,
            AddrMode::base_disp(RegRef::Phys(Reg::Bp), self.slot_offset(slot)),
        )
    }
}
