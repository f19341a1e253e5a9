//! Work and memory partitioning across symmetric units.
//!
//! `partition_compute` splits a block into an outer block iterating one step per
//! unit and an inner block carrying the work of one unit. `partition_memory`
//! picks the index along which the block's buffers are banked across units.

use crate::config::PartitionPass;
use crate::error::PassError;
use crate::ir::{Block, Index, NodeId, Program};
use crate::pipeline::PassStats;
use crate::tags;
use crate::tile::{apply_tile, tile_extents};
use log::debug;
use std::collections::BTreeMap;

/// Indexes every output is indexed by; splitting one of them never makes two
/// units write the same element.
fn splittable(block: &Block) -> Vec<&Index> {
    block
        .real_idxs()
        .filter(|i| i.range > 1)
        .filter(|i| {
            block
                .refs
                .iter()
                .filter(|r| r.dir.is_write())
                .all(|r| r.uses_index(&i.name))
        })
        .collect()
}

fn split_block(prog: &mut Program, id: NodeId, pass: &PartitionPass) -> Result<bool, PassError> {
    let block = prog.block(id)?;
    let chosen = match splittable(block).into_iter().max_by(|a, b| {
        // first index wins a tie
        a.range.cmp(&b.range).then(std::cmp::Ordering::Greater)
    }) {
        Some(idx) => idx.name.clone(),
        None => {
            debug!("partition_compute: '{}' has no splittable index", block.name);
            return Ok(false);
        }
    };
    let tile: Vec<u64> = block
        .idxs
        .iter()
        .map(|i| {
            if i.is_passthrough() {
                1
            } else if i.name == chosen {
                (i.range + pass.num_parts - 1) / pass.num_parts
            } else {
                i.range
            }
        })
        .collect();
    let original_tags = block.tags.clone();
    let inner = apply_tile(prog, id, &tile)?;
    prog.block_mut(inner)?.tags = original_tags;

    let outer = prog.block_mut(id)?;
    outer.tags = tags::tag_set(pass.set_tag.iter().cloned());
    if let Some(tag) = &pass.idx_tag {
        if let Some(idx) = outer.idxs.iter_mut().find(|i| i.name == chosen) {
            idx.tags.insert(tag.clone());
        }
    }
    debug!(
        "partition_compute: '{}' split along '{}' into {} parts",
        outer.name,
        chosen,
        outer.iteration_count()
    );
    Ok(true)
}

pub fn partition_compute(prog: &mut Program, pass: &PartitionPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    if pass.num_parts <= 1 {
        return Ok(stats);
    }
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        if split_block(prog, id, pass)? {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}

/// Bytes of every view that would be spread across banks if `idx` were banked.
fn bank_score(block: &Block, ranges: &BTreeMap<String, u64>, idx: &str) -> u64 {
    block
        .refs
        .iter()
        .filter(|r| !r.dir.is_alloc() && r.uses_index(idx))
        .map(|r| tile_extents(r, ranges).iter().product::<u64>() * r.shape.dtype.size_bytes())
        .sum()
}

fn bank_block(block: &mut Block, pass: &PartitionPass) -> bool {
    let ranges: BTreeMap<String, u64> = block
        .real_idxs()
        .map(|i| (i.name.clone(), i.range))
        .collect();
    let mut best: Option<(String, u64)> = None;
    for idx in block.real_idxs().filter(|i| i.range >= pass.num_parts) {
        let score = bank_score(block, &ranges, &idx.name);
        if score > 0 && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
            best = Some((idx.name.clone(), score));
        }
    }
    let chosen = match best {
        Some((name, _)) => name,
        None => return false,
    };
    for r in block.refs.iter_mut().filter(|r| !r.dir.is_alloc()) {
        r.bank_dim = r.access.iter().position(|a| a.uses(&chosen));
    }
    tags::add_tags(&mut block.tags, &pass.set_tag.iter().cloned().collect::<Vec<_>>());
    if let Some(tag) = &pass.idx_tag {
        if let Some(idx) = block.idxs.iter_mut().find(|i| i.name == chosen) {
            idx.tags.insert(tag.clone());
        }
    }
    debug!("partition_memory: '{}' banked along '{}'", block.name, chosen);
    true
}

pub fn partition_memory(prog: &mut Program, pass: &PartitionPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    if pass.num_parts <= 1 {
        return Ok(stats);
    }
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        if bank_block(prog.block_mut(id)?, pass) {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}
