//! Scalarization of single-element local buffers.
//!
//! When a one-element buffer allocated by a block is only ever stored to and
//! loaded from by that block's own statements, every load is replaced by the
//! scalar most recently stored. The loads, the stores and the buffer go away.

use crate::config::ScalarizePass;
use crate::deps::effects;
use crate::error::PassError;
use crate::ir::{NodeId, Program, Stmt};
use crate::pipeline::PassStats;
use log::debug;

enum Access {
    Store { scalar: String },
    Load { scalar: String },
}

/// Every use of `name` in statement order, or `None` if some use is not a plain
/// load/store or a load comes before the first store.
fn accesses(prog: &Program, stmts: &[NodeId], name: &str) -> Result<Option<Vec<(NodeId, Access)>>, PassError> {
    let mut out = Vec::new();
    let mut stored = false;
    for &s in stmts {
        let node = prog.node(s)?;
        if !effects(&node.stmt).touches(name) {
            continue;
        }
        match &node.stmt {
            Stmt::Store { from, into } if into == name && from != name => {
                stored = true;
                out.push((s, Access::Store { scalar: from.clone() }));
            }
            Stmt::Load { from, into } if from == name && into != name && stored => {
                out.push((s, Access::Load { scalar: into.clone() }));
            }
            _ => return Ok(None),
        }
    }
    Ok(Some(out))
}

fn scalarize_ref(prog: &mut Program, id: NodeId, name: &str) -> Result<bool, PassError> {
    let stmts = prog.block(id)?.stmts.clone();
    let uses = match accesses(prog, &stmts, name)? {
        Some(u) => u,
        None => return Ok(false),
    };
    let mut current = String::new();
    for (s, access) in uses {
        match access {
            Access::Store { scalar } => current = scalar,
            Access::Load { scalar } => {
                let later: Vec<NodeId> = prog
                    .block(id)?
                    .stmts
                    .iter()
                    .copied()
                    .skip_while(|&x| x != s)
                    .skip(1)
                    .collect();
                for l in later {
                    prog.node_mut(l)?.stmt.rename_use(&scalar, &current);
                }
            }
        }
        prog.splice_out(id, s)?;
    }
    prog.block_mut(id)?.refs.retain(|r| r.into != name);
    Ok(true)
}

pub fn run(prog: &mut Program, pass: &ScalarizePass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        let candidates: Vec<String> = prog
            .block(id)?
            .refs
            .iter()
            .filter(|r| r.dir.is_alloc() && r.shape.elem_count() == 1)
            .map(|r| r.into.clone())
            .collect();
        let mut changed = false;
        for name in candidates {
            if scalarize_ref(prog, id, &name)? {
                debug!("scalarize: '{}' replaced by scalars", name);
                changed = true;
            }
        }
        if changed {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}
