//! The code-generation pipeline.
//!
//! One procedure flows through five stages: block linearisation,
//! instruction selection, lifetime analysis, linear-scan register
//! allocation, and move resolution with a final peephole pass. The result
//! is a list of labelled blocks over physical registers only, rendered in
//! AT&T syntax for the external assembly emitter.

use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::ir::{Graph, Relation};
use crate::x64::Instr;

pub mod frame;
pub mod lifetime;
pub mod moves;
pub mod peephole;
pub mod regalloc;
pub mod schedule;
pub mod select;

pub use select::{BlockId, Exit, LowBlock, LowFunc, Phi};

/// A fully compiled procedure: linearised blocks of physical-register
/// instructions with prologue and epilogues in place.
#[derive(Debug)]
pub struct CompiledFunction {
    func: LowFunc,
    frame_size: i32,
    spill_slots: usize,
}

impl CompiledFunction {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.func.name
    }

    #[must_use]
    pub fn blocks(&self) -> &[LowBlock] {
        &self.func.blocks
    }

    #[must_use]
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    #[must_use]
    pub fn spill_slots(&self) -> usize {
        self.spill_slots
    }

    /// Every instruction in linear order, terminators excluded.
    pub fn instrs(&self) -> impl Iterator<Item = &Instr> {
        self.func.blocks.iter().flat_map(|b| b.instrs.iter())
    }

    #[must_use]
    pub fn block_label(&self, block: BlockId) -> String {
        format!(".L{}_{}", self.func.name, block.0)
    }
}

/// Compiles one procedure from its SSA graph down to x86-64.
pub fn compile_function(graph: &Graph) -> Result<CompiledFunction> {
    graph.validate()?;
    let schedule = schedule::linearize(graph)?;
    let mut func = select::select(graph, &schedule)?;
    let lifetimes = lifetime::analyze(&func);
    let mut frame = frame::Frame::new();
    let assignment = regalloc::allocate(&func, &lifetimes, &mut frame)?;
    moves::resolve(&mut func, &lifetimes, &assignment, &frame)?;
    frame.apply(&mut func);
    peephole::run(&mut func);
    debug!(
        name = %func.name,
        blocks = func.blocks.len(),
        spill_slots = frame.slot_count(),
        "compiled procedure"
    );
    Ok(CompiledFunction {
        frame_size: frame.frame_size(),
        spill_slots: frame.slot_count(),
        func,
    })
}

const fn condition_suffix(relation: Relation) -> &'static str {
    match relation {
        Relation::Eq => "e",
        Relation::Ne => "ne",
        Relation::Less => "l",
        Relation::LessEq => "le",
        Relation::Greater => "g",
        Relation::GreaterEq => "ge",
    }
}

impl fmt::Display for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".globl {}", self.func.name)?;
        writeln!(f, "{}:", self.func.name)?;
        for (i, block) in self.func.blocks.iter().enumerate() {
            if i > 0 {
                writeln!(f, "{}:", self.block_label(BlockId(i as u32)))?;
            }
            for instr in &block.instrs {
                writeln!(f, "\t{instr}")?;
            }
            let next = BlockId(i as u32 + 1);
            match block.exit {
                Exit::Zero => {}
                Exit::One(t) => {
                    // Fall through to the next block in linear order.
                    if t != next {
                        writeln!(f, "\tjmp {}", self.block_label(t))?;
                    }
                }
                Exit::Two(relation, t, target_f) => {
                    writeln!(
                        f,
                        "\tj{} {}",
                        condition_suffix(relation),
                        self.block_label(t)
                    )?;
                    if target_f != next {
                        writeln!(f, "\tjmp {}", self.block_label(target_f))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    #[test]
    fn empty_body_gets_prologue_and_epilogue_only() {
        let mut b = GraphBuilder::new("mjMain", &[]);
        let entry = b.entry();
        let mem = b.start_mem();
        let zero = b.const_i32(0);
        b.ret(entry, mem, Some(zero));
        let compiled = compile_function(&b.finish()).unwrap();

        assert_eq!(compiled.blocks().len(), 1);
        assert_eq!(compiled.frame_size(), 0);
        assert_eq!(compiled.spill_slots(), 0);
        let text = compiled.to_string();
        assert!(text.starts_with(".globl mjMain\nmjMain:\n"));
        assert!(text.contains("pushq %rbp"));
        assert!(text.contains("movq %rsp, %rbp"));
        assert!(text.contains("movl $0, %eax"));
        assert!(text.contains("popq %rbp"));
        assert!(text.trim_end().ends_with("ret"));
    }

    #[test]
    fn no_virtual_registers_survive_allocation() {
        let mut b = GraphBuilder::new("f", &[crate::ir::Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let one = b.const_i32(1);
        let sum = b.add(entry, x, one);
        let mem = b.start_mem();
        b.ret(entry, mem, Some(sum));
        let compiled = compile_function(&b.finish()).unwrap();

        let text = compiled.to_string();
        assert!(!text.contains("%v"), "virtual register leaked:\n{text}");
    }
}
