//! Property-based checks of the interval algebra and pipeline laws.

use proptest::prelude::*;

use mj_x64::backend::lifetime::{BlockPosition, LifetimeInterval};
use mj_x64::backend::select::BlockId;
use mj_x64::backend::peephole;
use mj_x64::ir::{GraphBuilder, Mode};
use mj_x64::x64::VirtReg;

/// A small random interval: a few non-adjacent ranges with uses inside.
fn interval_strategy() -> impl Strategy<Value = LifetimeInterval> {
    proptest::collection::vec((0u32..4, 0u32..20, 1u32..10), 1..4).prop_map(|descrs| {
        let mut interval = LifetimeInterval::new(VirtReg(0));
        for (block, from, len) in descrs {
            let from = from * 2;
            interval.add_range(BlockId(block), from, from + len * 2);
        }
        // Sprinkle a use at the start and end of every range.
        for r in interval.ranges.clone() {
            interval.add_use(BlockPosition::new(r.block, r.from), false);
            interval.add_use(BlockPosition::new(r.block, r.to), true);
        }
        interval
    })
}

proptest! {
    /// Splitting an interval and rejoining the halves restores it.
    #[test]
    fn split_then_rejoin_is_identity(interval in interval_strategy(), block in 0u32..4, pos in 1u32..40) {
        let at = BlockPosition::new(BlockId(block), pos);
        prop_assume!(interval.start() < at && at <= interval.end());
        let (before, after) = interval.split_before(at);

        let mut rejoined = LifetimeInterval::new(interval.vreg);
        for r in before.ranges.iter().chain(after.ranges.iter()) {
            rejoined.add_range(r.block, r.from, r.to);
        }
        for (&p, &site) in before.uses.iter().chain(after.uses.iter()) {
            rejoined.add_use(p, site.may_be_replaced_by_memory_access);
        }
        prop_assert_eq!(&rejoined.ranges, &interval.ranges);
        prop_assert_eq!(&rejoined.uses, &interval.uses);
    }

    /// Every use of a split half lies within that half's ranges.
    #[test]
    fn split_halves_keep_their_uses_covered(interval in interval_strategy(), block in 0u32..4, pos in 1u32..40) {
        let at = BlockPosition::new(BlockId(block), pos);
        prop_assume!(interval.start() < at && at <= interval.end());
        let (before, after) = interval.split_before(at);
        for half in [&before, &after] {
            for &p in half.uses.keys() {
                // A use may sit in a hole of the original interval only if
                // it was outside every range to begin with.
                prop_assert_eq!(half.covers(p), interval.covers(p));
            }
        }
        if let (Some(b_last), Some(a_first)) = (before.ranges.last(), after.ranges.first()) {
            prop_assert!(
                BlockPosition::new(b_last.block, b_last.to)
                    < BlockPosition::new(a_first.block, a_first.from)
            );
        }
    }
}

/// Inserting a `mov x, x` and letting the peephole drop it must yield the
/// same stream as never inserting it.
#[test]
fn self_move_insertion_is_invisible() {
    use mj_x64::x64::{Instr, Operand, Reg, Width};

    let build = || {
        let mut b = GraphBuilder::new("law", &[Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let one = b.const_i32(1);
        let sum = b.add(entry, x, one);
        let mem = b.start_mem();
        b.ret(entry, mem, Some(sum));
        b.finish()
    };

    let baseline = mj_x64::compile_function(&build()).unwrap();

    // Recompile, then splice a self move into the middle and run the
    // peephole again: the streams must agree.
    let graph = build();
    let schedule = mj_x64::backend::schedule::linearize(&graph).unwrap();
    let mut func = mj_x64::backend::select::select(&graph, &schedule).unwrap();
    let lifetimes = mj_x64::backend::lifetime::analyze(&func);
    let mut frame = mj_x64::backend::frame::Frame::new();
    let assignment =
        mj_x64::backend::regalloc::allocate(&func, &lifetimes, &mut frame).unwrap();
    mj_x64::backend::moves::resolve(&mut func, &lifetimes, &assignment, &frame).unwrap();
    frame.apply(&mut func);
    func.blocks[0].instrs.insert(
        1,
        Instr::Mov {
            src: Operand::reg(Width::Dword, Reg::A),
            dst: Operand::reg(Width::Dword, Reg::A),
        },
    );
    peephole::run(&mut func);

    let baseline_instrs: Vec<String> = baseline.instrs().map(ToString::to_string).collect();
    let patched_instrs: Vec<String> = func
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter())
        .map(ToString::to_string)
        .collect();
    assert_eq!(baseline_instrs, patched_instrs);
}

/// Identical input graphs produce byte-identical assembly.
#[test]
fn compilation_is_deterministic() {
    let build = || {
        let mut b = GraphBuilder::new("det", &[Mode::Int32, Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let y = b.arg(1);
        let mem = b.start_mem();
        let (q, mem) = b.div(entry, mem, x, y);
        let p = b.mul(entry, q, y);
        let s = b.sub(entry, x, p);
        let (_, mem) = b.call(entry, mem, "print_int", &[s], None);
        b.ret(entry, mem, Some(s));
        b.finish()
    };
    let first = mj_x64::compile_function(&build()).unwrap().to_string();
    let second = mj_x64::compile_function(&build()).unwrap().to_string();
    assert_eq!(first, second);
}
