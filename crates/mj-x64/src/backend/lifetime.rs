//! Lifetime analysis.
//!
//! Computes, for every virtual register, an interval of live ranges with use
//! sites and register hints over the linearised block order, plus fixed
//! intervals recording forced occupancy of physical registers at call and
//! division sites. Positions follow the def/use slot scheme: instruction `k`
//! uses at `2k+1` and defines at `2k+2`; block entry is position `0`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::x64::{Instr, Operand, Reg, RegRef, VirtReg};

use super::select::{BlockId, Exit, LowFunc};

/// A point on the lifetime axis: `(block ordinal, slot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPosition {
    pub block: BlockId,
    pub pos: u32,
}

impl BlockPosition {
    #[must_use]
    pub const fn new(block: BlockId, pos: u32) -> Self {
        Self { block, pos }
    }

    #[must_use]
    pub const fn block_start(block: BlockId) -> Self {
        Self { block, pos: 0 }
    }

    /// Past every real position.
    pub const INFINITY: Self = Self {
        block: BlockId(u32::MAX),
        pos: u32::MAX,
    };
}

/// Use slot of instruction `k`.
#[must_use]
pub const fn use_slot(k: usize) -> u32 {
    2 * k as u32 + 1
}

/// Def slot of instruction `k`.
#[must_use]
pub const fn def_slot(k: usize) -> u32 {
    2 * k as u32 + 2
}

/// A closed interval of positions within one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub block: BlockId,
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseSite {
    /// Whether this use may receive a memory operand instead of a register
    /// (for example the source of a plain `mov`).
    pub may_be_replaced_by_memory_access: bool,
}

/// The lifetime of one virtual register: ordered, non-overlapping live
/// ranges (at most one per block), the use sites lying inside them, and two
/// advisory hint sets.
#[derive(Debug, Clone)]
pub struct LifetimeInterval {
    pub vreg: VirtReg,
    pub ranges: Vec<LiveRange>,
    pub uses: BTreeMap<BlockPosition, UseSite>,
    /// Registers this value is copied out of (propagated backward from
    /// constrained sources).
    pub from_hints: BTreeSet<Reg>,
    /// Registers this value is copied into (propagated forward from
    /// constrained destinations).
    pub to_hints: BTreeSet<Reg>,
}

impl LifetimeInterval {
    #[must_use]
    pub fn new(vreg: VirtReg) -> Self {
        Self {
            vreg,
            ranges: Vec::new(),
            uses: BTreeMap::new(),
            from_hints: BTreeSet::new(),
            to_hints: BTreeSet::new(),
        }
    }

    /// First covered position.
    #[must_use]
    pub fn start(&self) -> BlockPosition {
        self.ranges
            .first()
            .map_or(BlockPosition::INFINITY, |r| BlockPosition::new(r.block, r.from))
    }

    /// Last covered position.
    #[must_use]
    pub fn end(&self) -> BlockPosition {
        self.ranges
            .last()
            .map_or(BlockPosition::INFINITY, |r| BlockPosition::new(r.block, r.to))
    }

    #[must_use]
    pub fn covers(&self, pos: BlockPosition) -> bool {
        self.ranges
            .iter()
            .any(|r| r.block == pos.block && r.from <= pos.pos && pos.pos <= r.to)
    }

    /// Entirely to the left of `pos` on the global axis.
    #[must_use]
    pub fn ends_before(&self, pos: BlockPosition) -> bool {
        self.end() < pos
    }

    #[must_use]
    pub fn first_use(&self) -> Option<BlockPosition> {
        self.uses.keys().next().copied()
    }

    #[must_use]
    pub fn next_use_after(&self, pos: BlockPosition) -> Option<BlockPosition> {
        self.uses.range(pos..).next().map(|(p, _)| *p)
    }

    /// First use whose operand cannot be rewritten into a memory access.
    #[must_use]
    pub fn first_use_needing_register(&self) -> Option<BlockPosition> {
        self.uses
            .iter()
            .find(|(_, site)| !site.may_be_replaced_by_memory_access)
            .map(|(p, _)| *p)
    }

    #[must_use]
    pub fn next_use_needing_register_after(&self, pos: BlockPosition) -> Option<BlockPosition> {
        self.uses
            .range(pos..)
            .find(|(_, site)| !site.may_be_replaced_by_memory_access)
            .map(|(p, _)| *p)
    }

    /// First position covered by both intervals.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<BlockPosition> {
        first_intersection(&self.ranges, &other.ranges)
    }

    /// Inserts a range, merging with an existing range of the same block on
    /// overlap or adjacency so the one-range-per-block invariant holds.
    pub fn add_range(&mut self, block: BlockId, from: u32, to: u32) {
        debug_assert!(from <= to);
        let at = self
            .ranges
            .partition_point(|r| (r.block, r.from) < (block, from));
        self.ranges.insert(at, LiveRange { block, from, to });
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<LiveRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.block == r.block && r.from <= last.to.saturating_add(1) => {
                    last.to = last.to.max(r.to);
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    pub fn add_use(&mut self, pos: BlockPosition, may_be_replaced_by_memory_access: bool) {
        self.uses
            .entry(pos)
            .and_modify(|site| {
                site.may_be_replaced_by_memory_access &= may_be_replaced_by_memory_access;
            })
            .or_insert(UseSite {
                may_be_replaced_by_memory_access,
            });
    }

    /// Splits into `(before, after)` at `pos`: `before` keeps the ranges and
    /// uses strictly left of `pos`, `after` the remainder. `before` inherits
    /// the `from_hints`, `after` the `to_hints`.
    #[must_use]
    pub fn split_before(&self, pos: BlockPosition) -> (Self, Self) {
        let mut before = Self::new(self.vreg);
        let mut after = Self::new(self.vreg);
        for r in &self.ranges {
            if BlockPosition::new(r.block, r.to) < pos {
                before.ranges.push(*r);
            } else if pos <= BlockPosition::new(r.block, r.from) {
                after.ranges.push(*r);
            } else {
                // pos falls inside this range; r.block == pos.block here.
                if r.from < pos.pos {
                    before.ranges.push(LiveRange {
                        block: r.block,
                        from: r.from,
                        to: pos.pos - 1,
                    });
                }
                after.ranges.push(LiveRange {
                    block: r.block,
                    from: pos.pos,
                    to: r.to,
                });
            }
        }
        for (&p, &site) in &self.uses {
            if p < pos {
                before.uses.insert(p, site);
            } else {
                after.uses.insert(p, site);
            }
        }
        before.from_hints = self.from_hints.clone();
        after.to_hints = self.to_hints.clone();
        (before, after)
    }
}

/// Forced occupancy of one physical register. Unlike virtual intervals,
/// fixed intervals may hold several ranges per block.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    pub reg: Reg,
    pub ranges: Vec<LiveRange>,
}

impl FixedInterval {
    #[must_use]
    pub fn new(reg: Reg) -> Self {
        Self {
            reg,
            ranges: Vec::new(),
        }
    }

    pub fn add_range(&mut self, block: BlockId, from: u32, to: u32) {
        let at = self
            .ranges
            .partition_point(|r| (r.block, r.from) < (block, from));
        self.ranges.insert(at, LiveRange { block, from, to });
    }

    #[must_use]
    pub fn intersection(&self, interval: &LifetimeInterval) -> Option<BlockPosition> {
        first_intersection(&self.ranges, &interval.ranges)
    }
}

fn first_intersection(a: &[LiveRange], b: &[LiveRange]) -> Option<BlockPosition> {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (ra, rb) = (a[i], b[j]);
        if (ra.block, ra.to) < (rb.block, rb.from) {
            i += 1;
        } else if (rb.block, rb.to) < (ra.block, ra.from) {
            j += 1;
        } else {
            debug_assert_eq!(ra.block, rb.block);
            return Some(BlockPosition::new(ra.block, ra.from.max(rb.from)));
        }
    }
    None
}

/// The result of lifetime analysis for one procedure.
#[derive(Debug)]
pub struct Lifetimes {
    pub intervals: BTreeMap<VirtReg, LifetimeInterval>,
    pub fixed: BTreeMap<Reg, FixedInterval>,
    /// Values live at each block's entry, Phi destinations excluded.
    pub live_in: Vec<BTreeSet<VirtReg>>,
}

impl Lifetimes {
    #[must_use]
    pub fn interval(&self, vreg: VirtReg) -> Option<&LifetimeInterval> {
        self.intervals.get(&vreg)
    }
}

fn successors(func: &LowFunc) -> Vec<Vec<usize>> {
    func.blocks
        .iter()
        .map(|block| match block.exit {
            Exit::Zero => vec![],
            Exit::One(t) => vec![t.index()],
            Exit::Two(_, t, f) => vec![t.index(), f.index()],
        })
        .collect()
}

fn virt(reg: RegRef) -> Option<VirtReg> {
    reg.as_virt()
}

/// Phi-argument-aware liveness fixed point; a Phi source is used at the end
/// of the predecessor it flows in from.
fn flow_liveness(
    func: &LowFunc,
    succs: &[Vec<usize>],
) -> (Vec<BTreeSet<VirtReg>>, Vec<BTreeSet<VirtReg>>) {
    let n = func.blocks.len();
    let mut gen_sets = vec![BTreeSet::new(); n];
    let mut kill = vec![BTreeSet::new(); n];
    for (b, block) in func.blocks.iter().enumerate() {
        let mut defined: BTreeSet<VirtReg> =
            block.phis.iter().map(|phi| phi.dst).collect();
        kill[b].extend(defined.iter().copied());
        for instr in &block.instrs {
            instr.visit_uses(&mut |r, _| {
                if let Some(v) = virt(r)
                    && !defined.contains(&v)
                {
                    gen_sets[b].insert(v);
                }
            });
            instr.visit_defs(&mut |r, _| {
                if let Some(v) = virt(r) {
                    defined.insert(v);
                    kill[b].insert(v);
                }
            });
        }
    }

    let mut live_in = vec![BTreeSet::new(); n];
    let mut live_out = vec![BTreeSet::new(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..n).rev() {
            let mut out = BTreeSet::new();
            for &s in &succs[b] {
                out.extend(live_in[s].iter().copied());
                let succ = &func.blocks[s];
                for (j, &pred) in succ.preds.iter().enumerate() {
                    if pred.index() != b {
                        continue;
                    }
                    for phi in &succ.phis {
                        if let Operand::Reg(_, r) = phi.srcs[j]
                            && let Some(v) = virt(r)
                        {
                            out.insert(v);
                        }
                    }
                }
            }
            let mut inn = gen_sets[b].clone();
            inn.extend(out.difference(&kill[b]).copied());
            if inn != live_in[b] || out != live_out[b] {
                live_in[b] = inn;
                live_out[b] = out;
                changed = true;
            }
        }
    }
    (live_in, live_out)
}

/// Whether `instr` defines a virtual register hard-constrained to `reg`; if
/// so the clobber range stops at the use slot so the constrained definition
/// itself can claim the register.
fn defines_constrained(func: &LowFunc, instr: &Instr, reg: Reg) -> bool {
    let mut found = false;
    instr.visit_defs(&mut |r, _| {
        if let Some(v) = virt(r)
            && func.vregs.constraint(v) == Some(reg)
        {
            found = true;
        }
    });
    found
}

pub fn analyze(func: &LowFunc) -> Lifetimes {
    let succs = successors(func);
    let (live_in, live_out) = flow_liveness(func, &succs);

    let mut intervals: BTreeMap<VirtReg, LifetimeInterval> = BTreeMap::new();
    let mut fixed: BTreeMap<Reg, FixedInterval> = BTreeMap::new();

    for b in (0..func.blocks.len()).rev() {
        let bid = BlockId(b as u32);
        let end = func.block_end(bid);
        let block = &func.blocks[b];

        // Values live out of this block stay alive to its end; the open map
        // tracks the still-growing range of each live value.
        let mut open: BTreeMap<VirtReg, (u32, u32)> = live_out[b]
            .iter()
            .map(|&v| (v, (0, end)))
            .collect();

        // Phi sources of successors are read at the end of this block.
        for &s in &succs[b] {
            let succ = &func.blocks[s];
            for (j, &pred) in succ.preds.iter().enumerate() {
                if pred.index() != b {
                    continue;
                }
                for phi in &succ.phis {
                    if let Operand::Reg(_, r) = phi.srcs[j]
                        && let Some(v) = virt(r)
                    {
                        intervals
                            .entry(v)
                            .or_insert_with(|| LifetimeInterval::new(v))
                            .add_use(BlockPosition::new(bid, end), true);
                    }
                }
            }
        }

        for (k, instr) in block.instrs.iter().enumerate().rev() {
            let up = use_slot(k);
            let dp = def_slot(k);

            let mut defs = Vec::new();
            instr.visit_defs(&mut |r, may| {
                if let Some(v) = virt(r) {
                    defs.push((v, may));
                }
            });
            for (v, may) in defs {
                let interval = intervals
                    .entry(v)
                    .or_insert_with(|| LifetimeInterval::new(v));
                interval.add_use(BlockPosition::new(bid, dp), may);
                match open.remove(&v) {
                    Some((_, to)) => interval.add_range(bid, dp, to),
                    // A dead definition still occupies its def slot.
                    None => interval.add_range(bid, dp, dp),
                }
            }

            for &reg in instr.clobbers() {
                let to = if defines_constrained(func, instr, reg) {
                    up
                } else {
                    dp
                };
                fixed
                    .entry(reg)
                    .or_insert_with(|| FixedInterval::new(reg))
                    .add_range(bid, up, to);
            }

            let mut uses = Vec::new();
            instr.visit_uses(&mut |r, may| {
                if let Some(v) = virt(r) {
                    uses.push((v, may));
                }
            });
            for (v, may) in uses {
                intervals
                    .entry(v)
                    .or_insert_with(|| LifetimeInterval::new(v))
                    .add_use(BlockPosition::new(bid, up), may);
                open.entry(v).or_insert((0, up));
            }
        }

        // Phi destinations are defined at block entry.
        for phi in &block.phis {
            let interval = intervals
                .entry(phi.dst)
                .or_insert_with(|| LifetimeInterval::new(phi.dst));
            interval.add_use(BlockPosition::block_start(bid), true);
            match open.remove(&phi.dst) {
                Some((_, to)) => interval.add_range(bid, 0, to),
                None => interval.add_range(bid, 0, 0),
            }
        }

        // Whatever is still open is live into the block.
        for (v, (from, to)) in open {
            intervals
                .entry(v)
                .or_insert_with(|| LifetimeInterval::new(v))
                .add_range(bid, from, to);
        }

        // Values live into a loop header must survive the whole loop body;
        // a hole would let the allocator hand their register out mid-loop.
        if let Some(loop_end) = block.loop_end {
            for &v in &live_in[b] {
                let interval = intervals
                    .entry(v)
                    .or_insert_with(|| LifetimeInterval::new(v));
                for j in b..=loop_end.index() {
                    let jid = BlockId(j as u32);
                    interval.add_range(jid, 0, func.block_end(jid));
                }
            }
        }
    }

    // Hint propagation over copies: a move into a constrained destination
    // suggests that register to the source, and vice versa.
    for block in &func.blocks {
        for instr in &block.instrs {
            let Instr::Mov {
                src: Operand::Reg(_, src),
                dst: Operand::Reg(_, dst),
            } = instr
            else {
                continue;
            };
            let (src, dst) = (virt(*src), virt(*dst));
            if let (Some(s), Some(d)) = (src, dst) {
                if let Some(c) = func.vregs.constraint(d)
                    && let Some(interval) = intervals.get_mut(&s)
                {
                    interval.to_hints.insert(c);
                }
                if let Some(c) = func.vregs.constraint(s)
                    && let Some(interval) = intervals.get_mut(&d)
                {
                    interval.from_hints.insert(c);
                }
            }
        }
    }

    // A Phi is a copy per predecessor: its sources inherit the registers
    // the destination is headed for, so the allocator can place the value
    // where the Phi move wants it and the move dissolves.
    for block in &func.blocks {
        for phi in &block.phis {
            let mut dst_hints = intervals
                .get(&phi.dst)
                .map(|i| i.to_hints.clone())
                .unwrap_or_default();
            if let Some(c) = func.vregs.constraint(phi.dst) {
                dst_hints.insert(c);
            }
            for src in &phi.srcs {
                if let Operand::Reg(_, r) = src
                    && let Some(v) = virt(*r)
                    && let Some(interval) = intervals.get_mut(&v)
                {
                    interval.to_hints.extend(dst_hints.iter().copied());
                }
            }
        }
    }

    debug_assert!(intervals.values().all(check_invariants));
    trace!(
        intervals = intervals.len(),
        fixed = fixed.len(),
        "lifetime analysis finished"
    );
    Lifetimes {
        intervals,
        fixed,
        live_in,
    }
}

/// Every use lies inside a range; at most one range per block.
fn check_invariants(interval: &LifetimeInterval) -> bool {
    let one_per_block = interval
        .ranges
        .windows(2)
        .all(|w| w[0].block != w[1].block && (w[0].block, w[0].to) < (w[1].block, w[1].from));
    let uses_covered = interval.uses.keys().all(|&p| interval.covers(p));
    one_per_block && uses_covered
}
