//! Peephole cleanup of the allocated instruction stream.
//!
//! Runs last, after move resolution: splits and edge reconciliation freely
//! emit copies that turn out to be `mov x, x` once both sides land in the
//! same location.

use crate::x64::Instr;

use super::select::LowFunc;

fn is_self_move(instr: &Instr) -> bool {
    matches!(instr, Instr::Mov { src, dst } if src == dst)
}

pub fn run(func: &mut LowFunc) {
    for block in &mut func.blocks {
        let len = block.instrs.len();
        let keep: Vec<bool> = block.instrs.iter().map(|i| !is_self_move(i)).collect();
        if keep.iter().all(|&k| k) {
            continue;
        }
        let mut write = 0;
        for read in 0..len {
            if keep[read] {
                if write != read {
                    block.instrs.swap(write, read);
                }
                write += 1;
            }
        }
        block.instrs.truncate(write);
    }
}
