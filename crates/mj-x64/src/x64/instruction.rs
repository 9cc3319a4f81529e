use super::{Reg, RegRef, Width};

/// A memory addressing mode: `disp(base, index, scale)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMode {
    pub base: RegRef,
    /// Optional index register and scale factor (1, 2, 4 or 8).
    pub index: Option<(RegRef, u8)>,
    pub disp: i32,
}

impl AddrMode {
    #[must_use]
    pub const fn base(base: RegRef) -> Self {
        Self {
            base,
            index: None,
            disp: 0,
        }
    }

    #[must_use]
    pub const fn base_disp(base: RegRef, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(Width, i64),
    Reg(Width, RegRef),
    Mem(Width, AddrMode),
}

impl Operand {
    #[must_use]
    pub const fn width(&self) -> Width {
        match self {
            Self::Imm(w, _) | Self::Reg(w, _) | Self::Mem(w, _) => *w,
        }
    }

    #[must_use]
    pub const fn reg(width: Width, reg: Reg) -> Self {
        Self::Reg(width, RegRef::Phys(reg))
    }

    /// True for an immediate that fits the 32-bit signed field most
    /// instructions offer. Larger values must be materialised via a
    /// register move first.
    #[must_use]
    pub fn is_imm32(&self) -> bool {
        matches!(self, Self::Imm(_, v) if i32::try_from(*v).is_ok())
    }

    #[must_use]
    pub const fn is_mem(&self) -> bool {
        matches!(self, Self::Mem(..))
    }
}

/// How an instruction touches a register position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Use,
    Def,
    /// Two-address destination: read and written at the same instruction.
    UseDef,
}

/// Discriminant of [`Instr`], used by tests and the peephole pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrKind {
    Mov,
    Lea,
    Add,
    Sub,
    And,
    Imul,
    Neg,
    Cmp,
    Cltd,
    Idiv,
    Call,
    Push,
    Pop,
    Ret,
}

/// A machine instruction over [`Operand`]s.
///
/// Register positions hold virtual registers until allocation rewrites them
/// into physical registers or stack-relative memory operands. Block
/// terminators (jumps, conditional jumps) are represented by the block's
/// exit, not as instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Mov {
        src: Operand,
        dst: Operand,
    },
    /// Materialises the address of a global symbol (rip-relative).
    Lea {
        symbol: String,
        dst: Operand,
    },
    Add {
        src: Operand,
        dst: Operand,
    },
    Sub {
        src: Operand,
        dst: Operand,
    },
    And {
        src: Operand,
        dst: Operand,
    },
    Imul {
        src: Operand,
        dst: Operand,
    },
    Neg {
        dst: Operand,
    },
    /// Sets flags to `lhs - rhs`; consumed by the block's conditional exit.
    Cmp {
        lhs: Operand,
        rhs: Operand,
    },
    /// Sign-extends `eax` into `edx:eax` ahead of a division.
    Cltd,
    /// Signed division of `edx:eax` by `divisor`. The implicit registers
    /// are carried explicitly so lifetime analysis sees them: the dividend
    /// is constrained to `A`, the quotient/remainder results to `A`/`D`.
    Idiv {
        divisor: Operand,
        dividend: RegRef,
        quotient: Option<RegRef>,
        remainder: Option<RegRef>,
    },
    /// Direct call. `args` lists the constrained argument registers so the
    /// allocator keeps them live up to the call; `result` is the
    /// `A`-constrained return value, if any.
    Call {
        target: String,
        args: Vec<RegRef>,
        result: Option<RegRef>,
    },
    Push {
        src: Operand,
    },
    Pop {
        dst: Operand,
    },
    Ret,
}

impl Instr {
    #[must_use]
    pub const fn kind(&self) -> InstrKind {
        match self {
            Self::Mov { .. } => InstrKind::Mov,
            Self::Lea { .. } => InstrKind::Lea,
            Self::Add { .. } => InstrKind::Add,
            Self::Sub { .. } => InstrKind::Sub,
            Self::And { .. } => InstrKind::And,
            Self::Imul { .. } => InstrKind::Imul,
            Self::Neg { .. } => InstrKind::Neg,
            Self::Cmp { .. } => InstrKind::Cmp,
            Self::Cltd => InstrKind::Cltd,
            Self::Idiv { .. } => InstrKind::Idiv,
            Self::Call { .. } => InstrKind::Call,
            Self::Push { .. } => InstrKind::Push,
            Self::Pop { .. } => InstrKind::Pop,
            Self::Ret => InstrKind::Ret,
        }
    }

    /// A plain register-or-immediate to register copy. These are the
    /// instructions hint propagation and the peephole pass care about.
    #[must_use]
    pub const fn is_move(&self) -> bool {
        matches!(self, Self::Mov { .. })
    }

    /// Physical registers this instruction may overwrite beyond its
    /// explicit operands. Lifetime analysis turns these into fixed
    /// intervals at the instruction's position.
    #[must_use]
    pub fn clobbers(&self) -> &'static [Reg] {
        match self {
            Self::Call { .. } => &crate::abi::CALLER_SAVED,
            Self::Cltd => &[Reg::D],
            Self::Idiv { .. } => &[Reg::A, Reg::D],
            _ => &[],
        }
    }

    /// Visits every register read by this instruction, with the flag
    /// telling whether that use may legally be rewritten into a memory
    /// operand instead of a register.
    pub fn visit_uses(&self, f: &mut impl FnMut(RegRef, bool)) {
        fn addr_regs(op: &Operand, f: &mut dyn FnMut(RegRef, bool)) {
            if let Operand::Mem(_, mode) = op {
                f(mode.base, false);
                if let Some((index, _)) = mode.index {
                    f(index, false);
                }
            }
        }
        fn operand(op: &Operand, may_be_mem: bool, f: &mut dyn FnMut(RegRef, bool)) {
            match op {
                Operand::Reg(_, r) => f(*r, may_be_mem),
                Operand::Mem(..) => addr_regs(op, f),
                Operand::Imm(..) => {}
            }
        }
        match self {
            Self::Mov { src, dst } => {
                operand(src, true, f);
                addr_regs(dst, f);
            }
            Self::Add { src, dst }
            | Self::Sub { src, dst }
            | Self::And { src, dst }
            | Self::Imul { src, dst } => {
                operand(src, true, f);
                operand(dst, false, f);
            }
            Self::Neg { dst } => operand(dst, false, f),
            Self::Cmp { lhs, rhs } => {
                operand(lhs, true, f);
                operand(rhs, true, f);
            }
            Self::Idiv {
                divisor, dividend, ..
            } => {
                operand(divisor, true, f);
                f(*dividend, false);
            }
            Self::Call { args, .. } => {
                for arg in args {
                    f(*arg, false);
                }
            }
            Self::Push { src } => operand(src, true, f),
            Self::Pop { dst } => addr_regs(dst, f),
            Self::Lea { .. } | Self::Cltd | Self::Ret => {}
        }
    }

    /// Visits every register written by this instruction.
    pub fn visit_defs(&self, f: &mut impl FnMut(RegRef, bool)) {
        fn reg_operand(op: &Operand, may_be_mem: bool, f: &mut dyn FnMut(RegRef, bool)) {
            if let Operand::Reg(_, r) = op {
                f(*r, may_be_mem);
            }
        }
        match self {
            Self::Mov { dst, .. } => reg_operand(dst, true, f),
            Self::Lea { dst, .. } => reg_operand(dst, false, f),
            Self::Add { dst, .. }
            | Self::Sub { dst, .. }
            | Self::And { dst, .. }
            | Self::Imul { dst, .. }
            | Self::Neg { dst } => reg_operand(dst, false, f),
            Self::Idiv {
                quotient,
                remainder,
                ..
            } => {
                if let Some(q) = quotient {
                    f(*q, false);
                }
                if let Some(r) = remainder {
                    f(*r, false);
                }
            }
            Self::Call { result, .. } => {
                if let Some(r) = result {
                    f(*r, false);
                }
            }
            Self::Pop { dst } => reg_operand(dst, true, f),
            Self::Cmp { .. } | Self::Cltd | Self::Push { .. } | Self::Ret => {}
        }
    }

    /// Visits every operand together with its role, for rewriting after
    /// allocation. Address-mode registers are reached via the operands.
    pub fn visit_operands_mut(&mut self, f: &mut impl FnMut(&mut Operand, Role)) {
        match self {
            Self::Mov { src, dst } => {
                f(src, Role::Use);
                f(dst, Role::Def);
            }
            Self::Lea { dst, .. } => f(dst, Role::Def),
            Self::Add { src, dst }
            | Self::Sub { src, dst }
            | Self::And { src, dst }
            | Self::Imul { src, dst } => {
                f(src, Role::Use);
                f(dst, Role::UseDef);
            }
            Self::Neg { dst } => f(dst, Role::UseDef),
            Self::Cmp { lhs, rhs } => {
                f(lhs, Role::Use);
                f(rhs, Role::Use);
            }
            Self::Idiv { divisor, .. } => f(divisor, Role::Use),
            Self::Push { src } => f(src, Role::Use),
            Self::Pop { dst } => f(dst, Role::Def),
            Self::Cltd | Self::Call { .. } | Self::Ret => {}
        }
    }

    /// Visits the bare register references that are not operands
    /// (the implicit division and call registers).
    pub fn visit_reg_refs_mut(&mut self, f: &mut impl FnMut(&mut RegRef)) {
        match self {
            Self::Idiv {
                dividend,
                quotient,
                remainder,
                ..
            } => {
                f(dividend);
                if let Some(q) = quotient {
                    f(q);
                }
                if let Some(r) = remainder {
                    f(r);
                }
            }
            Self::Call { args, result, .. } => {
                for arg in args {
                    f(arg);
                }
                if let Some(r) = result {
                    f(r);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::VirtReg;

    fn vreg_op(id: u32) -> Operand {
        Operand::Reg(Width::Dword, RegRef::Virt(VirtReg(id)))
    }

    #[test]
    fn two_address_dst_is_use_and_def() {
        let add = Instr::Add {
            src: vreg_op(0),
            dst: vreg_op(1),
        };
        let mut uses = vec![];
        add.visit_uses(&mut |r, _| uses.push(r));
        let mut defs = vec![];
        add.visit_defs(&mut |r, _| defs.push(r));
        assert_eq!(uses.len(), 2);
        assert_eq!(defs, vec![RegRef::Virt(VirtReg(1))]);
    }

    #[test]
    fn mov_source_may_become_memory() {
        let mov = Instr::Mov {
            src: vreg_op(0),
            dst: vreg_op(1),
        };
        let mut flags = vec![];
        mov.visit_uses(&mut |_, may_be_mem| flags.push(may_be_mem));
        assert_eq!(flags, vec![true]);
    }

    #[test]
    fn address_mode_registers_are_uses() {
        let store = Instr::Mov {
            src: vreg_op(0),
            dst: Operand::Mem(
                Width::Dword,
                AddrMode::base_disp(RegRef::Virt(VirtReg(1)), 8),
            ),
        };
        let mut uses = vec![];
        store.visit_uses(&mut |r, may_be_mem| uses.push((r, may_be_mem)));
        assert_eq!(
            uses,
            vec![
                (RegRef::Virt(VirtReg(0)), true),
                (RegRef::Virt(VirtReg(1)), false)
            ]
        );
    }

    #[test]
    fn idiv_reports_implicit_registers() {
        let idiv = Instr::Idiv {
            divisor: vreg_op(2),
            dividend: RegRef::Virt(VirtReg(0)),
            quotient: Some(RegRef::Virt(VirtReg(1))),
            remainder: None,
        };
        let mut uses = vec![];
        idiv.visit_uses(&mut |r, _| uses.push(r));
        let mut defs = vec![];
        idiv.visit_defs(&mut |r, _| defs.push(r));
        assert_eq!(uses.len(), 2);
        assert_eq!(defs, vec![RegRef::Virt(VirtReg(1))]);
        assert_eq!(idiv.clobbers(), &[Reg::A, Reg::D]);
    }
}
