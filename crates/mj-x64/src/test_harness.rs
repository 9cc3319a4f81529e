//! Test harness for mj-x64 unit and integration tests.
//!
//! This module provides graph-building shortcuts and pattern assertions
//! over emitted machine instructions. It is only available when running
//! tests (`#[cfg(test)]`) or with the `test-harness` feature.
//!
//! # Example
//!
//! ```rust
//! use mj_x64::ir::{GraphBuilder, Mode};
//! use mj_x64::test_harness::*;
//!
//! let mut b = GraphBuilder::new("f", &[Mode::Int32]);
//! let entry = b.entry();
//! let x = b.arg(0);
//! let one = b.const_i32(1);
//! let sum = b.add(entry, x, one);
//! let mem = b.start_mem();
//! b.ret(entry, mem, Some(sum));
//!
//! let compiled = compile(&b.finish());
//! let instrs = all_instrs(&compiled);
//! assert!(has_kind(&instrs, Kind::Add));
//! ```

#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::manual_assert
)]

use crate::backend::CompiledFunction;
use crate::ir::Graph;
use crate::x64::{Instr, InstrKind, Operand, Reg, RegRef};

pub use crate::x64::InstrKind as Kind;

/// Compile a graph, panicking with the error message on failure.
pub fn compile(graph: &Graph) -> CompiledFunction {
    crate::compile_function(graph).expect("compilation failed")
}

/// Every instruction of a compiled procedure in linear order.
pub fn all_instrs(compiled: &CompiledFunction) -> Vec<Instr> {
    compiled.instrs().cloned().collect()
}

/// Pattern matching for instruction fields.
#[derive(Debug, Clone)]
pub enum Pat<T> {
    /// Match any value.
    Any,
    /// Match an exact value.
    Exact(T),
    /// Match if the value satisfies the predicate.
    Predicate(fn(&T) -> bool),
}

impl<T: PartialEq> Pat<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
            Pat::Predicate(pred) => pred(value),
        }
    }
}

/// Pattern for matching instructions in tests.
#[derive(Debug, Clone)]
pub enum InstrPattern {
    /// Match any instruction.
    Any,
    /// Match any instruction of the given kind.
    Kind(InstrKind),
    Mov {
        src: Pat<Operand>,
        dst: Pat<Operand>,
    },
    Add {
        src: Pat<Operand>,
        dst: Pat<Operand>,
    },
    Sub {
        src: Pat<Operand>,
        dst: Pat<Operand>,
    },
    Imul {
        src: Pat<Operand>,
        dst: Pat<Operand>,
    },
    Cmp {
        lhs: Pat<Operand>,
        rhs: Pat<Operand>,
    },
    Idiv {
        divisor: Pat<Operand>,
    },
    Call {
        target: Pat<String>,
    },
    Cltd,
    Push,
    Pop,
    Ret,
}

impl InstrPattern {
    pub fn matches(&self, instr: &Instr) -> bool {
        use InstrPattern as P;
        match (self, instr) {
            (P::Any, _) => true,
            (P::Kind(kind), i) => i.kind() == *kind,
            (P::Mov { src, dst }, Instr::Mov { src: s, dst: d }) => {
                src.matches(s) && dst.matches(d)
            }
            (P::Add { src, dst }, Instr::Add { src: s, dst: d }) => {
                src.matches(s) && dst.matches(d)
            }
            (P::Sub { src, dst }, Instr::Sub { src: s, dst: d }) => {
                src.matches(s) && dst.matches(d)
            }
            (P::Imul { src, dst }, Instr::Imul { src: s, dst: d }) => {
                src.matches(s) && dst.matches(d)
            }
            (P::Cmp { lhs, rhs }, Instr::Cmp { lhs: l, rhs: r }) => {
                lhs.matches(l) && rhs.matches(r)
            }
            (P::Idiv { divisor }, Instr::Idiv { divisor: d, .. }) => divisor.matches(d),
            (P::Call { target }, Instr::Call { target: t, .. }) => target.matches(t),
            (P::Cltd, Instr::Cltd) => true,
            (P::Push, Instr::Push { .. }) => true,
            (P::Pop, Instr::Pop { .. }) => true,
            (P::Ret, Instr::Ret) => true,
            _ => false,
        }
    }
}

/// Find a consecutive pattern in an instruction sequence.
///
/// Returns the index of the first match, or `None`.
pub fn find_pattern(instrs: &[Instr], pattern: &[InstrPattern]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }
    'outer: for start in 0..=instrs.len().saturating_sub(pattern.len()) {
        for (i, pat) in pattern.iter().enumerate() {
            if !pat.matches(&instrs[start + i]) {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}

/// Assert that an instruction sequence contains a consecutive pattern.
pub fn assert_has_pattern(instrs: &[Instr], pattern: &[InstrPattern]) {
    if find_pattern(instrs, pattern).is_none() {
        panic!(
            "Pattern not found in instruction sequence.\n\nExpected pattern:\n{}\n\nActual instructions:\n{}",
            pattern
                .iter()
                .map(|p| format!("  {p:?}"))
                .collect::<Vec<_>>()
                .join("\n"),
            format_instrs(instrs)
        );
    }
}

fn format_instrs(instrs: &[Instr]) -> String {
    instrs
        .iter()
        .map(|i| format!("  {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Count instructions of a specific kind.
pub fn count_kind(instrs: &[Instr], kind: InstrKind) -> usize {
    instrs.iter().filter(|i| i.kind() == kind).count()
}

/// Check whether the sequence contains an instruction of the given kind.
pub fn has_kind(instrs: &[Instr], kind: InstrKind) -> bool {
    instrs.iter().any(|i| i.kind() == kind)
}

/// Physical registers an instruction writes.
pub fn written_regs(instr: &Instr) -> Vec<Reg> {
    let mut regs = Vec::new();
    instr.visit_defs(&mut |r, _| {
        if let RegRef::Phys(reg) = r {
            regs.push(reg);
        }
    });
    regs
}
