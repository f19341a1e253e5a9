//! Location assignment for blocks, their children and their allocations.

use crate::config::{LocateBlockPass, LocateInnerBlockPass, LocateMemoryPass};
use crate::error::PassError;
use crate::ir::Program;
use crate::pipeline::PassStats;
use log::debug;

pub fn locate_block(prog: &mut Program, pass: &LocateBlockPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        let block = prog.block_mut(id)?;
        if block.location != pass.loc {
            block.location = pass.loc.clone();
            stats.rewritten += 1;
        }
        debug!("locate_block: '{}' -> {:?}", block.name, pass.loc);
    }
    Ok(stats)
}

/// Stamp the location on direct child blocks of each match that satisfy
/// `inner_reqs`; the matched block itself is unchanged.
pub fn locate_inner_block(
    prog: &mut Program,
    pass: &LocateInnerBlockPass,
) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        for child in prog.block(id)?.stmts.clone() {
            let eligible = prog
                .try_block(child)
                .map(|b| b.has_tags(&pass.inner_reqs))
                .unwrap_or(false);
            if eligible {
                let block = prog.block_mut(child)?;
                block.location = pass.loc.clone();
                debug!("locate_inner_block: '{}' -> {:?}", block.name, pass.loc);
                stats.rewritten += 1;
            }
        }
    }
    Ok(stats)
}

/// Stamp the location on every buffer allocated by a matching block.
pub fn locate_memory(prog: &mut Program, pass: &LocateMemoryPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        let mut changed = false;
        for r in prog.block_mut(id)?.refs.iter_mut().filter(|r| r.dir.is_alloc()) {
            r.location = pass.loc.clone();
            changed = true;
        }
        if changed {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}
