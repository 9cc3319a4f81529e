//! Linear-scan register allocation with interval splitting.
//!
//! Follows the interval-splitting variant of linear scan: intervals are
//! processed in ascending start order through the `unhandled` / `active` /
//! `inactive` / `handled` sets; a register is taken outright when it is free
//! for the whole interval, partially when it is free for a prefix, and
//! otherwise either the current interval or the incumbent with the furthest
//! next use is spilled. Hard constraints displace incumbents; fixed
//! intervals are never displaced.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::abi;
use crate::error::{Error, Result};
use crate::x64::{Reg, VirtReg};

use super::frame::{Frame, StackSlot};
use super::lifetime::{BlockPosition, LifetimeInterval, Lifetimes};
use super::select::{BlockId, LowFunc};

/// Where a value lives over one interval piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(Reg),
    Stack(StackSlot),
}

impl Location {
    #[must_use]
    pub const fn reg(self) -> Option<Reg> {
        match self {
            Self::Reg(r) => Some(r),
            Self::Stack(_) => None,
        }
    }
}

/// Final allocation: for every virtual register, its interval pieces (in
/// ascending order) each mapped to a register or a stack slot.
#[derive(Debug, Default)]
pub struct Assignment {
    pieces: BTreeMap<VirtReg, Vec<(LifetimeInterval, Location)>>,
}

impl Assignment {
    /// The location of `vreg` at `pos`. Positions in lifetime holes resolve
    /// to the piece whose overall span contains them.
    #[must_use]
    pub fn location_at(&self, vreg: VirtReg, pos: BlockPosition) -> Option<Location> {
        let pieces = self.pieces.get(&vreg)?;
        if let Some((_, loc)) = pieces.iter().find(|(i, _)| i.covers(pos)) {
            return Some(*loc);
        }
        pieces
            .iter()
            .find(|(i, _)| i.start() <= pos && pos <= i.end())
            .map(|(_, loc)| *loc)
    }

    #[must_use]
    pub fn pieces_of(&self, vreg: VirtReg) -> &[(LifetimeInterval, Location)] {
        self.pieces.get(&vreg).map_or(&[], Vec::as_slice)
    }

    /// All allocated virtual registers.
    pub fn vregs(&self) -> impl Iterator<Item = VirtReg> + '_ {
        self.pieces.keys().copied()
    }

    fn insert(&mut self, interval: LifetimeInterval, location: Location) {
        let list = self.pieces.entry(interval.vreg).or_default();
        list.push((interval, location));
        list.sort_by_key(|(i, _)| i.start());
    }
}

struct Entry {
    interval: LifetimeInterval,
    root: VirtReg,
    constraint: Option<Reg>,
    location: Option<Location>,
}

pub fn allocate(func: &LowFunc, lifetimes: &Lifetimes, frame: &mut Frame) -> Result<Assignment> {
    Allocator::new(func, lifetimes, frame).run()
}

struct Allocator<'a> {
    func: &'a LowFunc,
    lifetimes: &'a Lifetimes,
    frame: &'a mut Frame,
    entries: Vec<Entry>,
    /// Sorted by `(start, virtual register id)` for deterministic order.
    unhandled: BTreeSet<(BlockPosition, u32, usize)>,
    active: Vec<usize>,
    inactive: Vec<usize>,
}

impl<'a> Allocator<'a> {
    fn new(func: &'a LowFunc, lifetimes: &'a Lifetimes, frame: &'a mut Frame) -> Self {
        let mut this = Self {
            func,
            lifetimes,
            frame,
            entries: Vec::new(),
            unhandled: BTreeSet::new(),
            active: Vec::new(),
            inactive: Vec::new(),
        };
        for (&vreg, interval) in &lifetimes.intervals {
            if interval.ranges.is_empty() {
                continue;
            }
            let constraint = func.vregs.constraint(vreg);
            let mut interval = interval.clone();
            if let Some(c) = constraint {
                // Register constraints never reach over block borders for
                // selector-generated code; fall back to a split that demotes
                // the constraint to a hint if that assumption breaks.
                let first_block = interval.start().block;
                debug_assert_eq!(
                    interval.end().block,
                    first_block,
                    "constrained interval crosses a block border"
                );
                if interval.end().block != first_block {
                    let border = BlockPosition::block_start(BlockId(first_block.0 + 1));
                    let (head, mut tail) = interval.split_before(border);
                    tail.from_hints.insert(c);
                    interval = head;
                    this.push_unhandled(Entry {
                        interval: tail,
                        root: vreg,
                        constraint: None,
                        location: None,
                    });
                }
            }
            this.push_unhandled(Entry {
                interval,
                root: vreg,
                constraint,
                location: None,
            });
        }
        this
    }

    fn push_unhandled(&mut self, entry: Entry) {
        let idx = self.entries.len();
        let key = (entry.interval.start(), entry.interval.vreg.0, idx);
        self.entries.push(entry);
        self.unhandled.insert(key);
    }

    fn run(mut self) -> Result<Assignment> {
        while let Some((position, _, idx)) = self.unhandled.pop_first() {
            self.retire(position);
            trace!(
                vreg = self.entries[idx].interval.vreg.0,
                block = position.block.0,
                pos = position.pos,
                "processing interval"
            );
            if !self.try_allocate(idx, position) {
                self.allocate_blocked(idx, position)?;
            }
            match self.entries[idx].location {
                Some(Location::Reg(reg)) => {
                    self.frame.note_assignment(reg);
                    self.active.push(idx);
                }
                Some(Location::Stack(_)) | None => {}
            }
        }

        let mut assignment = Assignment::default();
        let mut spilled = 0usize;
        for entry in self.entries {
            let location = entry.location.ok_or_else(|| {
                Error::Internal(format!(
                    "interval of v{} left without a location",
                    entry.interval.vreg.0
                ))
            })?;
            if matches!(location, Location::Stack(_)) {
                spilled += 1;
            }
            assignment.insert(entry.interval, location);
        }
        debug!(
            intervals = assignment.pieces.len(),
            spilled, "register allocation finished"
        );
        Ok(assignment)
    }

    /// Moves intervals between `active`, `inactive` and handled according to
    /// the current position.
    fn retire(&mut self, position: BlockPosition) {
        let entries = &self.entries;
        let mut still_active = Vec::new();
        let mut newly_inactive = Vec::new();
        for &i in &self.active {
            if entries[i].interval.ends_before(position) {
                // handled
            } else if !entries[i].interval.covers(position) {
                newly_inactive.push(i);
            } else {
                still_active.push(i);
            }
        }
        let mut still_inactive = newly_inactive;
        let mut newly_active = Vec::new();
        for &i in &self.inactive {
            if entries[i].interval.ends_before(position) {
                // handled
            } else if entries[i].interval.covers(position) {
                newly_active.push(i);
            } else {
                still_inactive.push(i);
            }
        }
        still_active.extend(newly_active);
        self.active = still_active;
        self.inactive = still_inactive;
    }

    fn reg_of(&self, idx: usize) -> Option<Reg> {
        self.entries[idx].location.and_then(Location::reg)
    }

    /// For each register, the position at which it stops being free for the
    /// current interval.
    fn free_until(&self, idx: usize) -> BTreeMap<Reg, BlockPosition> {
        let current = &self.entries[idx].interval;
        let mut free: BTreeMap<Reg, BlockPosition> = abi::ALLOCATABLE
            .iter()
            .map(|&r| (r, BlockPosition::INFINITY))
            .collect();
        for &i in &self.active {
            if let Some(r) = self.reg_of(i) {
                free.insert(r, BlockPosition::new(BlockId(0), 0));
            }
        }
        for &i in &self.inactive {
            if let Some(r) = self.reg_of(i)
                && let Some(p) = self.entries[i].interval.intersection(current)
            {
                let slot = free.get_mut(&r).expect("allocatable register");
                *slot = (*slot).min(p);
            }
        }
        for (&r, fx) in &self.lifetimes.fixed {
            if let Some(slot) = free.get_mut(&r)
                && let Some(p) = fx.intersection(current)
            {
                *slot = (*slot).min(p);
            }
        }
        free
    }

    fn try_allocate(&mut self, idx: usize, position: BlockPosition) -> bool {
        let free = self.free_until(idx);
        let current = &self.entries[idx].interval;
        let to = current.end();

        if let Some(c) = self.entries[idx].constraint {
            // The constraint is hard: only that register is considered, and
            // a blocked register falls through to forced displacement.
            let f = free[&c];
            if f <= position {
                return false;
            }
            if f < to {
                self.split_current(idx, f);
            }
            self.entries[idx].location = Some(Location::Reg(c));
            return true;
        }

        // Honour hints first when one covers the whole interval.
        let hints: BTreeSet<Reg> = current
            .from_hints
            .iter()
            .chain(current.to_hints.iter())
            .copied()
            .collect();
        let mut best: Option<(Reg, BlockPosition)> = None;
        for &r in &abi::ALLOCATABLE {
            if hints.contains(&r)
                && free[&r] >= to
                && best.is_none_or(|(_, f)| free[&r] > f)
            {
                best = Some((r, free[&r]));
            }
        }
        if best.is_none() {
            for &r in &abi::ALLOCATABLE {
                if best.is_none_or(|(_, f)| free[&r] > f) {
                    best = Some((r, free[&r]));
                }
            }
        }
        let (reg, f) = best.expect("at least one allocatable register");
        if f <= position {
            return false;
        }
        if f < to {
            // Register only free for a prefix: take it and split there.
            self.split_current(idx, f);
        }
        self.entries[idx].location = Some(Location::Reg(reg));
        true
    }

    fn allocate_blocked(&mut self, idx: usize, position: BlockPosition) -> Result<()> {
        let constraint = self.entries[idx].constraint;
        let current = &self.entries[idx].interval;

        let mut next_use: BTreeMap<Reg, BlockPosition> = abi::ALLOCATABLE
            .iter()
            .map(|&r| (r, BlockPosition::INFINITY))
            .collect();
        for &i in &self.active {
            if let Some(r) = self.reg_of(i) {
                let nu = self.entries[i]
                    .interval
                    .next_use_after(position)
                    .unwrap_or(BlockPosition::INFINITY);
                let slot = next_use.get_mut(&r).expect("allocatable register");
                *slot = (*slot).min(nu);
            }
        }
        for &i in &self.inactive {
            if let Some(r) = self.reg_of(i)
                && self.entries[i].interval.intersection(current).is_some()
            {
                let nu = self.entries[i]
                    .interval
                    .next_use_after(position)
                    .unwrap_or(BlockPosition::INFINITY);
                let slot = next_use.get_mut(&r).expect("allocatable register");
                *slot = (*slot).min(nu);
            }
        }
        for (&r, fx) in &self.lifetimes.fixed {
            if let Some(slot) = next_use.get_mut(&r)
                && let Some(p) = fx.intersection(current)
            {
                *slot = (*slot).min(p);
            }
        }

        let candidates: Vec<Reg> = match constraint {
            Some(c) => vec![c],
            None => abi::ALLOCATABLE.to_vec(),
        };
        let mut best: Option<(Reg, BlockPosition)> = None;
        for &r in &candidates {
            if best.is_none_or(|(_, nu)| next_use[&r] > nu) {
                best = Some((r, next_use[&r]));
            }
        }
        let (reg, reg_next_use) = best.expect("candidate register");

        let first_use = self.entries[idx].interval.first_use_needing_register();
        let spill_current = constraint.is_none()
            && match first_use {
                None => true,
                Some(fu) => fu > reg_next_use,
            };
        if spill_current {
            // All incumbents are used before this interval needs a
            // register; keep them and make this one memory-resident up to
            // its first register-requiring use.
            let root = self.entries[idx].root;
            let width = self.func.vregs.width(self.entries[idx].interval.vreg);
            let slot = self.frame.slot_for(root, width);
            match first_use {
                None => {
                    self.entries[idx].location = Some(Location::Stack(slot));
                }
                Some(fu) => {
                    debug_assert!(fu > position);
                    self.split_current(idx, fu);
                    self.entries[idx].location = Some(Location::Stack(slot));
                }
            }
            return Ok(());
        }

        // Displace the incumbents on `reg`.
        if let Some(fx) = self.lifetimes.fixed.get(&reg)
            && fx.intersection(&self.entries[idx].interval) == Some(position)
        {
            return Err(Error::ConstraintCollision(self.entries[idx].interval.vreg.0));
        }
        self.entries[idx].location = Some(Location::Reg(reg));

        let displaced_active: Vec<usize> = self
            .active
            .iter()
            .copied()
            .filter(|&i| self.reg_of(i) == Some(reg))
            .collect();
        for i in displaced_active {
            self.split_and_spill(i, position)?;
        }
        let displaced_inactive: Vec<usize> = self
            .inactive
            .iter()
            .copied()
            .filter(|&i| {
                self.reg_of(i) == Some(reg)
                    && self.entries[i]
                        .interval
                        .intersection(&self.entries[idx].interval)
                        .is_some()
            })
            .collect();
        for i in displaced_inactive {
            let p = self.entries[i]
                .interval
                .intersection(&self.entries[idx].interval)
                .expect("checked above");
            self.split_current(i, p);
        }

        // A later fixed range on this register still forces a split; an
        // intersection at the start is a hard collision, which must be
        // unreachable for well-formed input.
        if let Some(fx) = self.lifetimes.fixed.get(&reg)
            && let Some(p) = fx.intersection(&self.entries[idx].interval)
        {
            if p <= position {
                return Err(Error::ConstraintCollision(
                    self.entries[idx].interval.vreg.0,
                ));
            }
            self.split_current(idx, p);
        }
        Ok(())
    }

    /// Splits the interval of `idx` at `at`; the tail becomes a fresh
    /// unhandled entry, the head stays in place.
    fn split_current(&mut self, idx: usize, at: BlockPosition) {
        let entry = &mut self.entries[idx];
        debug_assert!(entry.interval.start() < at);
        let (head, tail) = entry.interval.split_before(at);
        if tail.ranges.is_empty() {
            return;
        }
        entry.interval = head;
        let root = entry.root;
        let constraint = entry.constraint;
        self.push_unhandled(Entry {
            interval: tail,
            root,
            constraint,
            location: None,
        });
    }

    /// Splits a displaced incumbent at `at` and parks the tail in its stack
    /// slot until the next use that requires a register.
    fn split_and_spill(&mut self, idx: usize, at: BlockPosition) -> Result<()> {
        let entry = &mut self.entries[idx];
        let (head, tail) = entry.interval.split_before(at);
        entry.interval = head;
        if tail.ranges.is_empty() {
            return Ok(());
        }
        let root = entry.root;
        debug_assert!(
            entry.constraint.is_none(),
            "hard-constrained intervals are never displaced"
        );
        let width = self.func.vregs.width(tail.vreg);
        match tail.next_use_needing_register_after(at) {
            None => {
                let slot = self.frame.slot_for(root, width);
                self.entries.push(Entry {
                    interval: tail,
                    root,
                    constraint: None,
                    location: Some(Location::Stack(slot)),
                });
            }
            Some(u) if u <= at => {
                // The incumbent needs its register at the displacement
                // point itself; let it compete again.
                self.push_unhandled(Entry {
                    interval: tail,
                    root,
                    constraint: None,
                    location: None,
                });
            }
            Some(u) => {
                let (mid, rest) = tail.split_before(u);
                let slot = self.frame.slot_for(root, width);
                self.entries.push(Entry {
                    interval: mid,
                    root,
                    constraint: None,
                    location: Some(Location::Stack(slot)),
                });
                if !rest.ranges.is_empty() {
                    self.push_unhandled(Entry {
                        interval: rest,
                        root,
                        constraint: None,
                        location: None,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{lifetime, schedule, select};
    use crate::ir::{Graph, GraphBuilder, Mode};

    fn allocate_graph(graph: &Graph) -> (LowFunc, Lifetimes, Assignment, Frame) {
        let schedule = schedule::linearize(graph).unwrap();
        let func = select::select(graph, &schedule).unwrap();
        let lifetimes = lifetime::analyze(&func);
        let mut frame = Frame::new();
        let assignment = allocate(&func, &lifetimes, &mut frame).unwrap();
        (func, lifetimes, assignment, frame)
    }

    #[test]
    fn simple_function_needs_no_spills() {
        let mut b = GraphBuilder::new("t", &[Mode::Int32, Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let y = b.arg(1);
        let sum = b.add(entry, x, y);
        let mem = b.start_mem();
        b.ret(entry, mem, Some(sum));
        let (_, _, assignment, frame) = allocate_graph(&b.finish());

        assert_eq!(frame.slot_count(), 0);
        for v in assignment.vregs().collect::<Vec<_>>() {
            for (_, loc) in assignment.pieces_of(v) {
                assert!(matches!(loc, Location::Reg(_)));
            }
        }
    }

    #[test]
    fn constraints_are_honoured() {
        let mut b = GraphBuilder::new("t", &[Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let seven = b.const_i32(7);
        let mem = b.start_mem();
        let (q, mem) = b.div(entry, mem, x, seven);
        b.ret(entry, mem, Some(q));
        let (func, _, assignment, _) = allocate_graph(&b.finish());

        for v in func.vregs.iter() {
            if let Some(c) = func.vregs.constraint(v) {
                for (_, loc) in assignment.pieces_of(v) {
                    assert_eq!(loc.reg(), Some(c), "constraint of {v} violated");
                }
            }
        }
    }

    #[test]
    fn value_across_call_avoids_caller_saved_registers() {
        let mut b = GraphBuilder::new("t", &[Mode::Int32]);
        let entry = b.entry();
        let x = b.arg(0);
        let mem = b.start_mem();
        let (_, mem) = b.call(entry, mem, "print_int", &[x], None);
        // x is used again after the call.
        let (_, mem) = b.call(entry, mem, "print_int", &[x], None);
        b.ret(entry, mem, None);
        let (func, lifetimes, assignment, _) = allocate_graph(&b.finish());

        // The copy of x (mov incoming -> x) survives both calls; at every
        // position covering a call it must not sit in a caller-saved
        // register.
        let call_positions: Vec<BlockPosition> = func.blocks[0]
            .instrs
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, crate::x64::Instr::Call { .. }))
            .map(|(k, _)| BlockPosition::new(BlockId(0), lifetime::use_slot(k)))
            .collect();
        assert_eq!(call_positions.len(), 2);

        for (vreg, interval) in &lifetimes.intervals {
            for &p in &call_positions {
                if interval.covers(p) && func.vregs.constraint(*vreg).is_none() {
                    let loc = assignment.location_at(*vreg, p).unwrap();
                    if let Some(r) = loc.reg() {
                        assert!(
                            !abi::is_caller_saved(r),
                            "{vreg} sits in caller-saved {r:?} across a call"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn deterministic_across_runs() {
        let build = || {
            let mut b = GraphBuilder::new("t", &[Mode::Int32, Mode::Int32]);
            let entry = b.entry();
            let x = b.arg(0);
            let y = b.arg(1);
            let s = b.add(entry, x, y);
            let p = b.mul(entry, s, y);
            let mem = b.start_mem();
            b.ret(entry, mem, Some(p));
            b.finish()
        };
        let (_, _, a1, _) = allocate_graph(&build());
        let (_, _, a2, _) = allocate_graph(&build());
        let locs = |a: &Assignment| {
            a.vregs()
                .flat_map(|v| a.pieces_of(v).iter().map(|(i, l)| (i.vreg, i.start(), *l)))
                .collect::<Vec<_>>()
        };
        assert_eq!(locs(&a1), locs(&a2));
    }
}
