//! Stencil matching.
//!
//! A stencil is a fixed hardware compute shape. Matching assigns each stencil slot
//! a distinct block index whose strides through every output and input satisfy the
//! slot's stride classes and whose range is compatible with the slot size. The
//! block is then tiled so that the inner block iterates exactly the stencil shape.

use crate::config::StencilPass;
use crate::error::PassError;
use crate::hardware::{Hardware, Stencil, StencilIndex};
use crate::ir::{Block, Index, NodeId, Program, RefDir, Refinement};
use crate::pipeline::PassStats;
use crate::tags;
use crate::tile::apply_tile_keeping;
use log::debug;
use std::collections::BTreeSet;

/// One slot binding of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBinding {
    pub slot: String,
    pub idx: String,
    /// Inner extent along this index
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StencilMatch {
    pub bindings: Vec<SlotBinding>,
    pub cost: u64,
}

fn stride_ok(class: i32, stride: i64) -> bool {
    match class {
        0 => stride == 0,
        1 => stride == 1,
        _ => true,
    }
}

fn slot_size(slot: &StencilIndex, idx: &Index) -> Option<u64> {
    if slot.size < 0 {
        return Some(idx.range);
    }
    let size = slot.size as u64;
    if size <= idx.range && idx.range % size == 0 {
        Some(size)
    } else {
        None
    }
}

fn admissible(slot: &StencilIndex, idx: &Index, outs: &[&Refinement], ins: &[&Refinement]) -> Option<u64> {
    let strides_ok = slot
        .outs
        .iter()
        .zip(outs)
        .all(|(&class, r)| stride_ok(class, r.flat_stride(&idx.name)))
        && slot
            .ins
            .iter()
            .zip(ins)
            .all(|(&class, r)| stride_ok(class, r.flat_stride(&idx.name)));
    if strides_ok {
        slot_size(slot, idx)
    } else {
        None
    }
}

fn assignment_cost(block: &Block, bindings: &[SlotBinding], startup: u64) -> u64 {
    let mut outer = 1u64;
    let mut inner = 1u64;
    for idx in block.real_idxs() {
        let t = bindings
            .iter()
            .find(|b| b.idx == idx.name)
            .map(|b| b.size)
            .unwrap_or(1);
        outer *= (idx.range + t - 1) / t;
        inner *= t;
    }
    outer * (startup + inner)
}

struct Search<'a> {
    block: &'a Block,
    stencil: &'a Stencil,
    idxs: Vec<&'a Index>,
    outs: Vec<&'a Refinement>,
    ins: Vec<&'a Refinement>,
    current: Vec<SlotBinding>,
    best: Option<StencilMatch>,
}

impl<'a> Search<'a> {
    fn step(&mut self, slot: usize) {
        if slot == self.stencil.idxs.len() {
            let cost = assignment_cost(self.block, &self.current, self.stencil.startup_cost);
            if self.best.as_ref().map(|b| cost < b.cost).unwrap_or(true) {
                self.best = Some(StencilMatch {
                    bindings: self.current.clone(),
                    cost,
                });
            }
            return;
        }
        let want = &self.stencil.idxs[slot];
        for i in 0..self.idxs.len() {
            let idx = self.idxs[i];
            if self.current.iter().any(|b| b.idx == idx.name) {
                continue;
            }
            if let Some(size) = admissible(want, idx, &self.outs, &self.ins) {
                self.current.push(SlotBinding {
                    slot: want.name.clone(),
                    idx: idx.name.clone(),
                    size,
                });
                self.step(slot + 1);
                self.current.pop();
            }
        }
    }
}

/// Cheapest assignment of `stencil` onto `block`, if any.
pub fn match_stencil(block: &Block, stencil: &Stencil) -> Option<StencilMatch> {
    let outs: Vec<&Refinement> = block.refs.iter().filter(|r| r.dir.is_write()).collect();
    let ins: Vec<&Refinement> = block.refs.iter().filter(|r| r.dir == RefDir::In).collect();
    let shapes_fit = stencil
        .idxs
        .iter()
        .all(|s| s.outs.len() == outs.len() && s.ins.len() == ins.len());
    if !shapes_fit || stencil.idxs.is_empty() {
        return None;
    }
    let mut search = Search {
        block,
        stencil,
        idxs: block.real_idxs().collect(),
        outs,
        ins,
        current: Vec::new(),
        best: None,
    };
    search.step(0);
    search.best
}

/// Cheapest admissible stencil; the earlier stencil wins a tie.
pub fn best_match(block: &Block, stencils: &[Stencil]) -> Option<(usize, StencilMatch)> {
    let mut best: Option<(usize, StencilMatch)> = None;
    for (n, stencil) in stencils.iter().enumerate() {
        if let Some(m) = match_stencil(block, stencil) {
            debug!("stencil {} fits '{}' at cost {}", n, block.name, m.cost);
            if best.as_ref().map(|(_, b)| m.cost < b.cost).unwrap_or(true) {
                best = Some((n, m));
            }
        }
    }
    best
}

fn apply_match(
    prog: &mut Program,
    id: NodeId,
    found: &StencilMatch,
    pass: &StencilPass,
) -> Result<(), PassError> {
    let block = prog.block(id)?;
    let tile: Vec<u64> = block
        .idxs
        .iter()
        .map(|idx| {
            found
                .bindings
                .iter()
                .find(|b| b.idx == idx.name)
                .map(|b| b.size)
                .unwrap_or(1)
        })
        .collect();
    let bound: BTreeSet<String> = found.bindings.iter().map(|b| b.idx.clone()).collect();
    let inner = apply_tile_keeping(prog, id, &tile, &bound)?;

    let inner_block = prog.block_mut(inner)?;
    inner_block.tags = tags::tag_set(pass.inner_set.iter().cloned());
    for binding in &found.bindings {
        if let Some(idx) = inner_block.idxs.iter_mut().find(|i| i.name == binding.idx && !i.is_passthrough()) {
            idx.tags.insert(binding.slot.clone());
        }
    }
    tags::add_tags(&mut prog.block_mut(id)?.tags, &pass.outer_set);
    Ok(())
}

pub fn run(prog: &mut Program, pass: &StencilPass, hw: &Hardware) -> Result<PassStats, PassError> {
    let stencils = if pass.stencils.is_empty() {
        hw.stencils()
    } else {
        pass.stencils.clone()
    };
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        let block = prog.block(id)?;
        let (n, found) = best_match(block, &stencils).ok_or_else(|| {
            PassError::unsatisfiable("stencil", &block.name, "no stencil admits an assignment")
        })?;
        debug!(
            "stencil: block '{}' uses stencil {} ({:?})",
            block.name, n, found.bindings
        );
        apply_match(prog, id, &found, pass)?;
        stats.rewritten += 1;
    }
    Ok(stats)
}
