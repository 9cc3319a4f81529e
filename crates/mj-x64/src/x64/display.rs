//! AT&T syntax rendering of operands and instructions.
//!
//! This is the surface the external assembly emitter consumes; tests also
//! compare against it.

use std::fmt;

use super::{AddrMode, Instr, Operand, RegRef, Width};

fn fmt_reg_ref(f: &mut fmt::Formatter<'_>, reg: RegRef, width: Width) -> fmt::Result {
    match reg {
        RegRef::Phys(r) => write!(f, "%{}", r.name(width)),
        RegRef::Virt(v) => write!(f, "%{v}"),
    }
}

struct DisplayAddr(AddrMode);

impl fmt::Display for DisplayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self.0;
        if mode.disp != 0 {
            write!(f, "{}", mode.disp)?;
        }
        write!(f, "(")?;
        // Address arithmetic is always full-width.
        fmt_reg_ref(f, mode.base, Width::Qword)?;
        if let Some((index, scale)) = mode.index {
            write!(f, ",")?;
            fmt_reg_ref(f, index, Width::Qword)?;
            write!(f, ",{scale}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imm(_, value) => write!(f, "${value}"),
            Self::Reg(width, reg) => fmt_reg_ref(f, *reg, *width),
            Self::Mem(_, mode) => write!(f, "{}", DisplayAddr(*mode)),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mov { src, dst } => {
                // Immediates beyond 32 bits need the movabs encoding and a
                // register destination; the selector guarantees the latter.
                if matches!(src, Operand::Imm(..)) && !src.is_imm32() {
                    write!(f, "movabsq {src}, {dst}")
                } else {
                    write!(f, "mov{} {src}, {dst}", dst.width().suffix())
                }
            }
            Self::Lea { symbol, dst } => write!(f, "leaq {symbol}(%rip), {dst}"),
            Self::Add { src, dst } => write!(f, "add{} {src}, {dst}", dst.width().suffix()),
            Self::Sub { src, dst } => write!(f, "sub{} {src}, {dst}", dst.width().suffix()),
            Self::And { src, dst } => write!(f, "and{} {src}, {dst}", dst.width().suffix()),
            Self::Imul { src, dst } => write!(f, "imul{} {src}, {dst}", dst.width().suffix()),
            Self::Neg { dst } => write!(f, "neg{} {dst}", dst.width().suffix()),
            // AT&T compares `dst - src`, so the right-hand side comes first.
            Self::Cmp { lhs, rhs } => write!(f, "cmp{} {rhs}, {lhs}", lhs.width().suffix()),
            Self::Cltd => write!(f, "cltd"),
            Self::Idiv { divisor, .. } => {
                write!(f, "idiv{} {divisor}", divisor.width().suffix())
            }
            Self::Call { target, .. } => write!(f, "call {target}"),
            Self::Push { src } => write!(f, "pushq {src}"),
            Self::Pop { dst } => write!(f, "popq {dst}"),
            Self::Ret => write!(f, "ret"),
        }
    }
}
