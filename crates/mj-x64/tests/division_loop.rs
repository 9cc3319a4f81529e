//! Division lowering and its fixed-register discipline.
//!
//! `x / 7` inside a loop re-materialises the dividend into `A` on every
//! iteration; the quotient comes out of `A` as well. The loop-invariant
//! `x` itself must keep a register across the loop instead of bouncing
//! through the stack.

use mj_x64::backend::regalloc::{self, Location};
use mj_x64::backend::{frame, lifetime, schedule, select};
use mj_x64::ir::{Graph, GraphBuilder, Mode, Relation};
use mj_x64::test_harness::*;
use mj_x64::x64::Reg;

/// while (acc < x) { acc = acc + x / 7; }
fn division_loop() -> Graph {
    let mut b = GraphBuilder::new("divloop", &[Mode::Int32]);
    let entry = b.entry();
    let x = b.arg(0);
    let zero = b.const_i32(0);
    let seven = b.const_i32(7);
    let start_mem = b.start_mem();
    let j0 = b.jmp(entry);
    let header = b.new_block();
    b.add_pred(header, j0);
    let acc = b.phi(header, Mode::Int32, &[zero, zero]);
    let mem_phi = b.phi(header, Mode::Mem, &[start_mem, start_mem]);
    let cmp = b.cmp(header, Relation::Less, acc, x);
    let (t, f) = b.cond(header, cmp);
    let body = b.new_block();
    b.add_pred(body, t);
    let (q, body_mem) = b.div(body, mem_phi, x, seven);
    let next = b.add(body, acc, q);
    let jb = b.jmp(body);
    b.add_pred(header, jb);
    b.set_phi_operands(acc, &[zero, next]);
    b.set_phi_operands(mem_phi, &[start_mem, body_mem]);
    let after = b.new_block();
    b.add_pred(after, f);
    b.ret(after, mem_phi, Some(acc));
    b.finish()
}

#[test]
fn quotient_carries_the_a_constraint() {
    let graph = division_loop();
    let schedule = schedule::linearize(&graph).unwrap();
    let func = select::select(&graph, &schedule).unwrap();

    let (dividend, quotient) = func
        .blocks
        .iter()
        .flat_map(|b| &b.instrs)
        .find_map(|i| match i {
            mj_x64::x64::Instr::Idiv {
                dividend, quotient, ..
            } => Some((dividend.as_virt().unwrap(), quotient.unwrap().as_virt().unwrap())),
            _ => None,
        })
        .expect("loop body divides");
    assert_eq!(func.vregs.constraint(dividend), Some(Reg::A));
    assert_eq!(func.vregs.constraint(quotient), Some(Reg::A));
}

#[test]
fn dividend_is_rematerialised_every_iteration() {
    let graph = division_loop();
    let compiled = compile(&graph);
    let instrs = all_instrs(&compiled);

    // cltd directly precedes the division, with the dividend moved into
    // eax just before.
    assert_has_pattern(
        &instrs,
        &[
            InstrPattern::Cltd,
            InstrPattern::Idiv { divisor: Pat::Any },
        ],
    );
    let text = compiled.to_string();
    assert!(text.contains("cltd"));
    assert!(text.contains("idivl"));
    // The mov into eax sits inside the loop body, not hoisted before it.
    let body_start = text.find(".Ldivloop_2:").expect("body label");
    let idiv_at = text.find("idivl").unwrap();
    assert!(idiv_at > body_start);
    let mov_to_eax = text[body_start..idiv_at]
        .matches("%eax")
        .count();
    assert!(mov_to_eax >= 1, "dividend not loaded into eax in the body");
}

#[test]
fn loop_invariant_dividend_keeps_a_register_across_the_loop() {
    let graph = division_loop();
    let schedule = schedule::linearize(&graph).unwrap();
    let func = select::select(&graph, &schedule).unwrap();
    let lifetimes = lifetime::analyze(&func);
    let mut fr = frame::Frame::new();
    let assignment = regalloc::allocate(&func, &lifetimes, &mut fr).unwrap();

    // x is the parameter copy: the value the idiv's dividend mov reads.
    // Across the loop (header entry) it must sit in a register; the A/D
    // turbulence of the division must not push it onto the stack.
    let header_entry = lifetime::BlockPosition::block_start(select::BlockId(1));
    for (vreg, interval) in &lifetimes.intervals {
        if func.vregs.constraint(*vreg).is_some() {
            continue;
        }
        if interval.covers(header_entry) {
            let loc = assignment.location_at(*vreg, header_entry).unwrap();
            assert!(
                matches!(loc, Location::Reg(_)),
                "loop-carried {vreg} was spilled at the header"
            );
        }
    }
}
