//! Threading of dense inner loops.
//!
//! The innermost indexes of a matched block are split off into an inner block of
//! at most `threads` iterations, one per thread. Tiles always divide the range,
//! so no bound constraint is introduced.

use crate::config::ThreadInnerPass;
use crate::error::PassError;
use crate::ir::{Block, NodeId, Program};
use crate::pipeline::PassStats;
use crate::tags;
use crate::tile::apply_tile;
use log::debug;

/// Largest divisor of `range` not above `limit`.
fn largest_divisor(range: u64, limit: u64) -> u64 {
    (1..=limit.min(range)).rev().find(|d| range % d == 0).unwrap_or(1)
}

/// Per-index thread tile, filled from the innermost index outward.
fn thread_tile(block: &Block, threads: u64) -> Vec<u64> {
    let mut tile = vec![1u64; block.idxs.len()];
    let mut remaining = threads;
    for (n, idx) in block.idxs.iter().enumerate().rev() {
        if remaining <= 1 {
            break;
        }
        if idx.is_passthrough() {
            continue;
        }
        let t = largest_divisor(idx.range, remaining);
        tile[n] = t;
        remaining /= t;
    }
    tile
}

fn thread_block(prog: &mut Program, id: NodeId, pass: &ThreadInnerPass) -> Result<bool, PassError> {
    let block = prog.block(id)?;
    if !block.constraints.is_empty() {
        debug!("thread_inner: '{}' has constraints, skipped", block.name);
        return Ok(false);
    }
    let tile = thread_tile(block, pass.threads);
    let lanes: u64 = tile.iter().product();
    if lanes <= 1 {
        return Ok(false);
    }
    let name = block.name.clone();
    let inner = apply_tile(prog, id, &tile)?;
    prog.block_mut(inner)?.tags = tags::tag_set([pass.thread_tag.as_str()]);
    debug!("thread_inner: '{}' runs {} lanes", name, lanes);
    Ok(true)
}

pub fn run(prog: &mut Program, pass: &ThreadInnerPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        if thread_block(prog, id, pass)? {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}
