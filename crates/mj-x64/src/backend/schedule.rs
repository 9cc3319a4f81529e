//! Block linearisation.
//!
//! Produces a total order over basic blocks in which every block's immediate
//! dominator appears earlier, the blocks of a natural loop are contiguous
//! with the header first, and the entry block comes first. The order is the
//! position axis for lifetime analysis.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::error::{Error, Result};
use crate::ir::{Graph, NodeId, NodeKind};

/// The linearised control-flow graph, with predecessor/successor edges and
/// loop extents expressed in linear ordinals.
#[derive(Debug)]
pub struct Schedule {
    /// Block nodes in linear order; the index is the `linearizedOrdinal`.
    pub blocks: Vec<NodeId>,
    pub preds: Vec<Vec<usize>>,
    pub succs: Vec<Vec<usize>>,
    /// For a loop header, the ordinal of the last block of its loop body.
    pub loop_end: Vec<Option<usize>>,
}

impl Schedule {
    #[must_use]
    pub fn ordinal_of(&self, block: NodeId) -> Option<usize> {
        self.blocks.iter().position(|&b| b == block)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// CFG restricted to blocks reachable from the entry, in discovery order.
struct Cfg {
    blocks: Vec<NodeId>,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
}

fn build_cfg(graph: &Graph) -> Cfg {
    // Every control edge is a (jump node, target block) pair; the source
    // block is the jump node's owner.
    let mut edges: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for target in graph.blocks() {
        for &jump in &graph.node(target).preds {
            let source = graph.node(jump).block;
            edges.entry(source).or_default().push(target);
        }
    }

    let mut blocks = vec![graph.entry()];
    let mut seen: BTreeSet<NodeId> = blocks.iter().copied().collect();
    let mut cursor = 0;
    while cursor < blocks.len() {
        let block = blocks[cursor];
        cursor += 1;
        for &succ in edges.get(&block).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(succ) {
                blocks.push(succ);
            }
        }
    }

    let index: BTreeMap<NodeId, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, &b)| (b, i))
        .collect();
    let mut preds = vec![Vec::new(); blocks.len()];
    let mut succs = vec![Vec::new(); blocks.len()];
    for (i, &block) in blocks.iter().enumerate() {
        for &succ in edges.get(&block).map(Vec::as_slice).unwrap_or_default() {
            let j = index[&succ];
            succs[i].push(j);
            preds[j].push(i);
        }
    }
    Cfg {
        blocks,
        preds,
        succs,
    }
}

/// Iterative immediate-dominator computation over a reverse postorder.
fn dominators(cfg: &Cfg) -> Vec<usize> {
    let n = cfg.blocks.len();
    let rpo = reverse_postorder(cfg);
    let mut rpo_index = vec![0usize; n];
    for (i, &b) in rpo.iter().enumerate() {
        rpo_index[b] = i;
    }

    let mut idom = vec![usize::MAX; n];
    idom[0] = 0;
    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom = usize::MAX;
            for &p in &cfg.preds[b] {
                if idom[p] == usize::MAX {
                    continue;
                }
                new_idom = if new_idom == usize::MAX {
                    p
                } else {
                    intersect(new_idom, p, &idom, &rpo_index)
                };
            }
            if new_idom != usize::MAX && idom[b] != new_idom {
                idom[b] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

fn intersect(a: usize, b: usize, idom: &[usize], rpo_index: &[usize]) -> usize {
    let (mut a, mut b) = (a, b);
    while a != b {
        while rpo_index[a] > rpo_index[b] {
            a = idom[a];
        }
        while rpo_index[b] > rpo_index[a] {
            b = idom[b];
        }
    }
    a
}

fn reverse_postorder(cfg: &Cfg) -> Vec<usize> {
    let n = cfg.blocks.len();
    let mut visited = vec![false; n];
    let mut post = Vec::with_capacity(n);
    // Explicit stack with a successor cursor per frame.
    let mut stack = vec![(0usize, 0usize)];
    visited[0] = true;
    while let Some(&(block, cursor)) = stack.last() {
        if let Some(&succ) = cfg.succs[block].get(cursor) {
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            post.push(block);
            stack.pop();
        }
    }
    post.reverse();
    post
}

fn dominates(a: usize, b: usize, idom: &[usize]) -> bool {
    let mut cur = b;
    loop {
        if cur == a {
            return true;
        }
        if cur == 0 {
            return false;
        }
        cur = idom[cur];
    }
}

/// Natural loop bodies keyed by header, and the back edges that define them.
fn loop_bodies(cfg: &Cfg, idom: &[usize]) -> Result<BTreeMap<usize, BTreeSet<usize>>> {
    let mut bodies: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (b, succs) in cfg.succs.iter().enumerate() {
        for &h in succs {
            if !dominates(h, b, idom) {
                continue;
            }
            // Back edge b -> h: the body is everything that reaches b
            // without passing through h.
            let body = bodies.entry(h).or_default();
            body.insert(h);
            let mut work = vec![b];
            while let Some(x) = work.pop() {
                if body.insert(x) {
                    work.extend(cfg.preds[x].iter().copied());
                }
            }
        }
    }
    // A retreating edge into a non-dominating target would mean an
    // irreducible CFG, which structured source cannot produce.
    for (h, body) in &bodies {
        for &b in body {
            if b != *h && !dominates(*h, b, idom) {
                return Err(Error::MalformedGraph(format!(
                    "irreducible loop around block {h}"
                )));
            }
        }
    }
    Ok(bodies)
}

struct Orderer<'a> {
    cfg: &'a Cfg,
    idom: &'a [usize],
    loops: &'a BTreeMap<usize, BTreeSet<usize>>,
    /// Innermost loop header of each block, if any.
    innermost: Vec<Option<usize>>,
    remaining: Vec<usize>,
    emitted: Vec<bool>,
    /// Ready blocks, routed to the innermost loop region containing them.
    ready: BTreeMap<Option<usize>, BTreeSet<usize>>,
    order: Vec<usize>,
}

impl Orderer<'_> {
    fn release(&mut self, block: usize) {
        for &succ in &self.cfg.succs[block] {
            if self.is_back_edge(block, succ) {
                continue;
            }
            self.remaining[succ] -= 1;
            if self.remaining[succ] == 0 {
                let region = self.innermost[succ];
                self.ready.entry(region).or_default().insert(succ);
            }
        }
    }

    fn is_back_edge(&self, from: usize, to: usize) -> bool {
        dominates(to, from, self.idom)
    }

    /// Emits every block of `region` (None is the region outside all loops),
    /// recursing into inner loops so each loop body stays contiguous.
    fn emit_region(&mut self, region: Option<usize>) {
        while let Some(block) = self
            .ready
            .get_mut(&region)
            .and_then(|set| set.pop_first())
        {
            if self.emitted[block] {
                continue;
            }
            self.order.push(block);
            self.emitted[block] = true;
            self.release(block);
            // A just-emitted loop header owns the rest of its body.
            if region != Some(block) && self.loops.contains_key(&block) {
                self.emit_region(Some(block));
            }
        }
    }
}

/// Computes the block linearisation for `graph`.
pub fn linearize(graph: &Graph) -> Result<Schedule> {
    let cfg = build_cfg(graph);
    let n = cfg.blocks.len();
    let idom = dominators(&cfg);
    let loops = loop_bodies(&cfg, &idom)?;

    // Innermost loop membership: the smallest body containing the block.
    let mut innermost = vec![None; n];
    for (b, slot) in innermost.iter_mut().enumerate() {
        let mut best: Option<(usize, usize)> = None;
        for (&h, body) in &loops {
            if body.contains(&b) && b != h {
                let size = body.len();
                if best.is_none_or(|(s, _)| size < s) {
                    best = Some((size, h));
                }
            }
        }
        *slot = best.map(|(_, h)| h);
    }

    let mut remaining = vec![0usize; n];
    for (b, preds) in cfg.preds.iter().enumerate() {
        remaining[b] = preds
            .iter()
            .filter(|&&p| !dominates(b, p, &idom))
            .count();
    }

    let mut orderer = Orderer {
        cfg: &cfg,
        idom: &idom,
        loops: &loops,
        innermost,
        remaining,
        emitted: vec![false; n],
        ready: BTreeMap::new(),
        order: Vec::with_capacity(n),
    };
    orderer.ready.entry(None).or_default().insert(0);
    orderer.emit_region(None);

    if orderer.order.len() != n {
        return Err(Error::MalformedGraph(
            "block linearisation did not reach every block".to_owned(),
        ));
    }

    let order = orderer.order;
    let mut ordinal = vec![0usize; n];
    for (i, &b) in order.iter().enumerate() {
        ordinal[b] = i;
    }

    let blocks: Vec<NodeId> = order.iter().map(|&b| cfg.blocks[b]).collect();
    let preds: Vec<Vec<usize>> = order
        .iter()
        .map(|&b| cfg.preds[b].iter().map(|&p| ordinal[p]).collect())
        .collect();
    let succs: Vec<Vec<usize>> = order
        .iter()
        .map(|&b| cfg.succs[b].iter().map(|&s| ordinal[s]).collect())
        .collect();
    let mut loop_end = vec![None; n];
    for (&h, body) in &loops {
        let last = body.iter().map(|&b| ordinal[b]).max().unwrap_or(ordinal[h]);
        loop_end[ordinal[h]] = Some(last);
    }

    trace!(blocks = n, loops = loops.len(), "linearised control flow");
    debug_assert!(matches!(
        graph.node(blocks[0]).kind,
        NodeKind::Block
    ));
    Ok(Schedule {
        blocks,
        preds,
        succs,
        loop_end,
    })
}
