//! Values living across call sites.
//!
//! Two calls in the same block with an argument alive across the first one:
//! the intermediate value must end up either in a callee-saved register or
//! in a stack slot while a call is in flight, never in a caller-saved
//! register.

use mj_x64::abi;
use mj_x64::backend::lifetime::{self, BlockPosition};
use mj_x64::backend::regalloc::{self, Location};
use mj_x64::backend::select::{self, BlockId};
use mj_x64::backend::{frame, schedule};
use mj_x64::ir::{Graph, GraphBuilder, Mode};
use mj_x64::x64::Instr;

/// print_int(x); print_int(x); return x;
fn double_print() -> Graph {
    let mut b = GraphBuilder::new("twice", &[Mode::Int32]);
    let entry = b.entry();
    let x = b.arg(0);
    let mem = b.start_mem();
    let (_, mem) = b.call(entry, mem, "print_int", &[x], None);
    let (_, mem) = b.call(entry, mem, "print_int", &[x], None);
    b.ret(entry, mem, Some(x));
    b.finish()
}

#[test]
fn live_across_call_means_callee_saved_or_stack() {
    let graph = double_print();
    let schedule = schedule::linearize(&graph).unwrap();
    let func = select::select(&graph, &schedule).unwrap();
    let lifetimes = lifetime::analyze(&func);
    let mut fr = frame::Frame::new();
    let assignment = regalloc::allocate(&func, &lifetimes, &mut fr).unwrap();

    let call_positions: Vec<BlockPosition> = func.blocks[0]
        .instrs
        .iter()
        .enumerate()
        .filter(|(_, i)| matches!(i, Instr::Call { .. }))
        .map(|(k, _)| BlockPosition::new(BlockId(0), lifetime::use_slot(k)))
        .collect();
    assert_eq!(call_positions.len(), 2);

    for (vreg, interval) in &lifetimes.intervals {
        if func.vregs.constraint(*vreg).is_some() {
            continue;
        }
        for &p in &call_positions {
            // Values whose lifetime strictly crosses the call.
            let crosses = interval.covers(p)
                && interval.start() < p
                && p < interval.end();
            if !crosses {
                continue;
            }
            let loc = assignment
                .location_at(*vreg, p)
                .expect("live value has a location");
            match loc {
                Location::Stack(_) => {}
                Location::Reg(r) => assert!(
                    abi::is_callee_saved(r),
                    "{vreg} crosses a call in caller-saved {r:?}"
                ),
            }
        }
    }
}

#[test]
fn compiled_function_restores_saved_registers() {
    let graph = double_print();
    let compiled = mj_x64::compile_function(&graph).unwrap();
    let text = compiled.to_string();

    // If a callee-saved register was used it must be pushed and popped;
    // if the value was spilled instead there must be a frame.
    let saved: Vec<_> = abi::CALLEE_SAVED
        .iter()
        .filter(|r| text.contains(&format!("pushq %{}", r.name(mj_x64::x64::Width::Qword))))
        .collect();
    assert!(
        !saved.is_empty() || compiled.spill_slots() > 0,
        "value across calls neither saved nor spilled:\n{text}"
    );
    for r in saved {
        let name = r.name(mj_x64::x64::Width::Qword);
        assert!(
            text.contains(&format!("popq %{name}")),
            "%{name} pushed but never restored:\n{text}"
        );
    }
    assert_eq!(text.matches("call print_int").count(), 2);
}

#[test]
fn argument_register_is_reloaded_for_each_call() {
    let graph = double_print();
    let compiled = mj_x64::compile_function(&graph).unwrap();
    let text = compiled.to_string();
    // Both calls need their argument staged into %edi.
    assert!(text.matches("%edi").count() >= 2, "{text}");
}
