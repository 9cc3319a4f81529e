//! Move resolution and Phi lowering.
//!
//! After allocation every virtual register position is rewritten into its
//! assigned physical register or stack slot. Three classes of moves are
//! inserted: connections at interval split points, reconciliation of
//! locations across block edges, and the parallel moves realising Phis.
//! Parallel moves are sequentialised with the standard cycle-breaking
//! scheme, staging one cycle member through the reserved scratch register.

use tracing::trace;

use crate::abi;
use crate::error::{Error, Result};
use crate::x64::{AddrMode, Instr, Operand, Reg, RegRef, Role, VirtReg, Width};

use super::frame::Frame;
use super::lifetime::{def_slot, use_slot, BlockPosition, Lifetimes};
use super::regalloc::{Assignment, Location};
use super::select::{BlockId, LowFunc};

/// A pending parallel move: source, destination, operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParallelMove {
    src: MoveSrc,
    dst: Location,
    width: Width,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveSrc {
    Loc(Location),
    Imm(i64),
}

pub fn resolve(
    func: &mut LowFunc,
    lifetimes: &Lifetimes,
    assignment: &Assignment,
    frame: &Frame,
) -> Result<()> {
    let mut insertions: Vec<Vec<(usize, Instr)>> = vec![Vec::new(); func.blocks.len()];

    collect_split_connections(func, assignment, frame, &mut insertions);
    collect_edge_moves(func, lifetimes, assignment, frame, &mut insertions)?;
    rewrite_operands(func, assignment, frame)?;
    apply_insertions(func, insertions);
    legalize(func);
    for block in &mut func.blocks {
        block.phis.clear();
    }
    trace!("move resolution finished");
    Ok(())
}

fn loc_operand(loc: Location, width: Width, frame: &Frame) -> Operand {
    match loc {
        Location::Reg(r) => Operand::Reg(width, RegRef::Phys(r)),
        Location::Stack(slot) => Operand::Mem(
            width,
            AddrMode::base_disp(RegRef::Phys(Reg::Bp), frame.slot_offset(slot)),
        ),
    }
}

/// Connects consecutive pieces of a split interval inside a block: the move
/// goes immediately before the position where the location changes.
fn collect_split_connections(
    func: &LowFunc,
    assignment: &Assignment,
    frame: &Frame,
    insertions: &mut [Vec<(usize, Instr)>],
) {
    for v in assignment.vregs() {
        let pieces = assignment.pieces_of(v);
        let width = func.vregs.width(v);
        for w in pieces.windows(2) {
            let (head, head_loc) = &w[0];
            let (tail, tail_loc) = &w[1];
            if head_loc == tail_loc {
                continue;
            }
            let start = tail.start();
            if start.pos == 0 {
                // Split lies on a block boundary; edge reconciliation
                // inserts the move in the predecessor.
                continue;
            }
            let prev = BlockPosition::new(start.block, start.pos - 1);
            if !head.covers(prev) {
                // The value is dead across the gap; it is redefined or
                // reloaded through block edges instead.
                continue;
            }
            let mov = Instr::Mov {
                src: loc_operand(*head_loc, width, frame),
                dst: loc_operand(*tail_loc, width, frame),
            };
            insertions[start.block.index()].push((start.pos as usize / 2, mov));
        }
    }
}

/// Reconciles value locations across every control-flow edge and realises
/// the Phis of the target block.
fn collect_edge_moves(
    func: &LowFunc,
    lifetimes: &Lifetimes,
    assignment: &Assignment,
    frame: &Frame,
    insertions: &mut [Vec<(usize, Instr)>],
) -> Result<()> {
    for p in 0..func.blocks.len() {
        let pid = BlockId(p as u32);
        let targets = func.blocks[p].exit.targets();
        let end_p = BlockPosition::new(pid, func.block_end(pid));
        for s in &targets {
            let s = s.index();
            let start_s = BlockPosition::block_start(BlockId(s as u32));
            let mut moves: Vec<ParallelMove> = Vec::new();

            for &v in &lifetimes.live_in[s] {
                let (Some(from), Some(to)) = (
                    assignment.location_at(v, end_p),
                    assignment.location_at(v, start_s),
                ) else {
                    continue;
                };
                if from != to {
                    moves.push(ParallelMove {
                        src: MoveSrc::Loc(from),
                        dst: to,
                        width: func.vregs.width(v),
                    });
                }
            }

            let succ = &func.blocks[s];
            if let Some(j) = succ.preds.iter().position(|&pb| pb == pid) {
                for phi in &succ.phis {
                    let dst = assignment
                        .location_at(phi.dst, start_s)
                        .ok_or_else(|| {
                            Error::Internal(format!("Phi destination {} unallocated", phi.dst))
                        })?;
                    let src = match phi.srcs[j] {
                        Operand::Imm(_, value) => MoveSrc::Imm(value),
                        Operand::Reg(_, RegRef::Virt(v)) => {
                            MoveSrc::Loc(assignment.location_at(v, end_p).ok_or_else(|| {
                                Error::Internal(format!("Phi source {v} unallocated"))
                            })?)
                        }
                        Operand::Reg(_, RegRef::Phys(r)) => MoveSrc::Loc(Location::Reg(r)),
                        Operand::Mem(..) => {
                            return Err(Error::Internal(
                                "memory operand as Phi source".to_owned(),
                            ));
                        }
                    };
                    if src == MoveSrc::Loc(dst) {
                        continue;
                    }
                    moves.push(ParallelMove {
                        src,
                        dst,
                        width: phi.width,
                    });
                }
            }

            if moves.is_empty() {
                continue;
            }
            let sequence = sequentialize(&moves, frame);
            // Moves go into the predecessor before its terminator; when the
            // predecessor branches conditionally they belong to this edge
            // only, so they land at the successor's head instead. One of
            // the two placements must be unique (no critical edges).
            if targets.len() == 1 {
                insertions[p].extend(sequence.into_iter().map(|i| (usize::MAX, i)));
            } else {
                debug_assert!(
                    succ.preds.len() == 1,
                    "critical edge {p} -> {s} cannot carry moves"
                );
                insertions[s].extend(sequence.into_iter().map(|i| (0, i)));
            }
        }
    }
    Ok(())
}

/// Orders a parallel move set so every source is read before its location
/// is overwritten; cycles are broken through the scratch register.
fn sequentialize(moves: &[ParallelMove], frame: &Frame) -> Vec<Instr> {
    let mut pending = moves.to_vec();
    let mut out = Vec::new();
    while !pending.is_empty() {
        let mut progress = false;
        let mut i = 0;
        while i < pending.len() {
            let dst = pending[i].dst;
            let dst_is_read = pending
                .iter()
                .enumerate()
                .any(|(k, m)| k != i && m.src == MoveSrc::Loc(dst));
            if dst_is_read {
                i += 1;
            } else {
                emit_move(pending[i], frame, &mut out);
                pending.remove(i);
                progress = true;
            }
        }
        if !progress {
            // Pure cycle: park the first destination in the scratch
            // register and redirect its readers there.
            let parked = pending[0].dst;
            out.push(Instr::Mov {
                src: loc_operand(parked, Width::Qword, frame),
                dst: Operand::reg(Width::Qword, abi::SCRATCH),
            });
            for m in &mut pending {
                if m.src == MoveSrc::Loc(parked) {
                    m.src = MoveSrc::Loc(Location::Reg(abi::SCRATCH));
                }
            }
        }
    }
    out
}

fn emit_move(m: ParallelMove, frame: &Frame, out: &mut Vec<Instr>) {
    let dst = loc_operand(m.dst, m.width, frame);
    match m.src {
        MoveSrc::Imm(value) => {
            let imm = Operand::Imm(m.width, value);
            if !imm.is_imm32() && dst.is_mem() {
                // 64-bit immediates cannot be stored directly.
                out.push(Instr::Mov {
                    src: imm,
                    dst: Operand::reg(Width::Qword, abi::SCRATCH),
                });
                out.push(Instr::Mov {
                    src: Operand::reg(m.width, abi::SCRATCH),
                    dst,
                });
            } else {
                out.push(Instr::Mov { src: imm, dst });
            }
        }
        MoveSrc::Loc(src) => {
            let src = loc_operand(src, m.width, frame);
            if src.is_mem() && dst.is_mem() {
                // Slot-to-slot transfer without touching a register.
                out.push(Instr::Push {
                    src: widen_mem(src),
                });
                out.push(Instr::Pop {
                    dst: widen_mem(dst),
                });
            } else {
                out.push(Instr::Mov { src, dst });
            }
        }
    }
}

/// Stack slots are word-sized; push/pop traffic addresses the whole word.
fn widen_mem(op: Operand) -> Operand {
    match op {
        Operand::Mem(_, mode) => Operand::Mem(Width::Qword, mode),
        other => other,
    }
}

/// Replaces every virtual register position with its allocated location.
fn rewrite_operands(func: &mut LowFunc, assignment: &Assignment, frame: &Frame) -> Result<()> {
    let resolve_reg = |v: VirtReg, pos: BlockPosition| -> Result<Location> {
        assignment
            .location_at(v, pos)
            .ok_or_else(|| Error::Internal(format!("{v} has no location at {pos:?}")))
    };
    for (b, block) in func.blocks.iter_mut().enumerate() {
        let bid = BlockId(b as u32);
        for (k, instr) in block.instrs.iter_mut().enumerate() {
            let up = BlockPosition::new(bid, use_slot(k));
            let dp = BlockPosition::new(bid, def_slot(k));
            let mut failure = None;
            instr.visit_operands_mut(&mut |op, role| {
                let pos = match role {
                    Role::Use | Role::UseDef => up,
                    Role::Def => dp,
                };
                match op {
                    Operand::Reg(w, RegRef::Virt(v)) => match resolve_reg(*v, pos) {
                        Ok(loc) => *op = loc_operand(loc, *w, frame),
                        Err(e) => failure = Some(e),
                    },
                    Operand::Mem(_, mode) => {
                        // Address registers are read at the use slot and
                        // must hold a register location.
                        for r in std::iter::once(&mut mode.base)
                            .chain(mode.index.iter_mut().map(|(r, _)| r))
                        {
                            if let RegRef::Virt(v) = *r {
                                match resolve_reg(v, up).map(Location::reg) {
                                    Ok(Some(reg)) => *r = RegRef::Phys(reg),
                                    Ok(None) => {
                                        failure = Some(Error::Internal(format!(
                                            "address register {v} was spilled"
                                        )));
                                    }
                                    Err(e) => failure = Some(e),
                                }
                            }
                        }
                    }
                    Operand::Imm(..) | Operand::Reg(_, RegRef::Phys(_)) => {}
                }
            });
            // Implicit division and call registers are hard-constrained and
            // therefore never spilled.
            instr.visit_reg_refs_mut(&mut |r| {
                if let RegRef::Virt(v) = *r {
                    match assignment.pieces_of(v).first().map(|(_, loc)| loc.reg()) {
                        Some(Some(reg)) => *r = RegRef::Phys(reg),
                        _ => {
                            failure = Some(Error::Internal(format!(
                                "constrained register {v} without register location"
                            )));
                        }
                    }
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Applies position-keyed insertions: index `k` inserts before instruction
/// `k`, `usize::MAX` appends behind the last instruction.
fn apply_insertions(func: &mut LowFunc, insertions: Vec<Vec<(usize, Instr)>>) {
    for (block, mut pending) in func.blocks.iter_mut().zip(insertions) {
        if pending.is_empty() {
            continue;
        }
        pending.sort_by_key(|(at, _)| *at);
        let mut rebuilt = Vec::with_capacity(block.instrs.len() + pending.len());
        let mut queue = pending.into_iter().peekable();
        for (k, instr) in block.instrs.drain(..).enumerate() {
            while queue.peek().is_some_and(|(at, _)| *at <= k) {
                rebuilt.push(queue.next().unwrap().1);
            }
            rebuilt.push(instr);
        }
        rebuilt.extend(queue.map(|(_, i)| i));
        block.instrs = rebuilt;
    }
}

/// Expands the few operand combinations x86 cannot encode directly:
/// memory-to-memory moves, wide immediates into memory, and fully
/// memory-resident compares.
fn legalize(func: &mut LowFunc) {
    for block in &mut func.blocks {
        let instrs = std::mem::take(&mut block.instrs);
        let mut rebuilt = Vec::with_capacity(instrs.len());
        for instr in instrs {
            match instr {
                Instr::Mov { src, dst } if src.is_mem() && dst.is_mem() => {
                    rebuilt.push(Instr::Push {
                        src: widen_mem(src),
                    });
                    rebuilt.push(Instr::Pop {
                        dst: widen_mem(dst),
                    });
                }
                Instr::Mov { src, dst }
                    if matches!(src, Operand::Imm(..)) && !src.is_imm32() && dst.is_mem() =>
                {
                    rebuilt.push(Instr::Mov {
                        src,
                        dst: Operand::reg(Width::Qword, abi::SCRATCH),
                    });
                    rebuilt.push(Instr::Mov {
                        src: Operand::reg(dst.width(), abi::SCRATCH),
                        dst,
                    });
                }
                Instr::Cmp { lhs, rhs } if lhs.is_mem() && rhs.is_mem() => {
                    rebuilt.push(Instr::Mov {
                        src: rhs,
                        dst: Operand::reg(rhs.width(), abi::SCRATCH),
                    });
                    rebuilt.push(Instr::Cmp {
                        lhs,
                        rhs: Operand::reg(rhs.width(), abi::SCRATCH),
                    });
                }
                Instr::Cmp { lhs, rhs } if matches!(lhs, Operand::Imm(..)) => {
                    rebuilt.push(Instr::Mov {
                        src: lhs,
                        dst: Operand::reg(lhs.width(), abi::SCRATCH),
                    });
                    rebuilt.push(Instr::Cmp {
                        lhs: Operand::reg(lhs.width(), abi::SCRATCH),
                        rhs,
                    });
                }
                other => rebuilt.push(other),
            }
        }
        block.instrs = rebuilt;
    }
}
