//! Loop unrolling.
//!
//! A matched block is replaced, in its parent, by one copy per value of the
//! unrolled indexes. Each copy has those indexes fixed to constants; copies whose
//! constraints become false are dropped.

use crate::affine::Affine;
use crate::config::UnrollPass;
use crate::error::PassError;
use crate::ir::{Block, NodeId, Program};
use crate::pipeline::PassStats;
use log::debug;
use std::collections::BTreeSet;

fn unrolled_indexes(block: &Block, pass: &UnrollPass) -> Vec<(String, u64)> {
    block
        .real_idxs()
        .filter(|i| match &pass.expand_idx {
            Some(sel) => &i.name == sel || i.tags.contains(sel),
            None => true,
        })
        .map(|i| (i.name.clone(), i.range))
        .collect()
}

/// Every assignment of the unrolled indexes, first index slowest.
fn assignments(idxs: &[(String, u64)]) -> Vec<Vec<i64>> {
    let mut out = vec![Vec::new()];
    for (_, range) in idxs {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                (0..*range as i64).map(move |v| {
                    let mut next = prefix.clone();
                    next.push(v);
                    next
                })
            })
            .collect();
    }
    out
}

/// Fix `values` in the copy `id`. Returns false when the copy never runs.
fn specialize(
    prog: &mut Program,
    id: NodeId,
    idxs: &[(String, u64)],
    values: &[i64],
    name: String,
    view_suffix: Option<String>,
) -> Result<bool, PassError> {
    let fix = |a: &Affine| {
        idxs.iter()
            .zip(values)
            .fold(a.clone(), |acc, ((n, _), &v)| acc.substitute(n, &Affine::constant(v)))
    };
    let block = prog.block_mut(id)?;
    block.name = name;
    block.idxs.retain(|i| !idxs.iter().any(|(n, _)| n == &i.name));
    for r in &mut block.refs {
        r.access = r.access.iter().map(fix).collect();
    }
    let mut constraints = Vec::new();
    for c in block.constraints.iter().map(fix) {
        if c.is_constant() {
            if c.constant_term() < 0 {
                return Ok(false);
            }
        } else {
            constraints.push(c);
        }
    }
    block.constraints = constraints;

    let mut renames = Vec::new();
    if let Some(suffix) = view_suffix {
        for r in block.refs.iter_mut().filter(|r| !r.dir.is_alloc()) {
            let renamed = format!("{}{}", r.into, suffix);
            renames.push((r.into.clone(), renamed.clone()));
            r.into = renamed;
        }
    }
    for child in prog.block(id)?.stmts.clone() {
        let node = prog.node_mut(child)?;
        for (old, new) in &renames {
            node.stmt.rename_use(old, new);
        }
        if let Some(cb) = node.stmt.as_block_mut() {
            for idx in cb.idxs.iter_mut().filter(|i| i.is_passthrough()) {
                idx.affine = fix(&idx.affine);
            }
        }
    }
    Ok(true)
}

fn unroll_block(
    prog: &mut Program,
    parent: NodeId,
    id: NodeId,
    pass: &UnrollPass,
) -> Result<bool, PassError> {
    let block = prog.block(id)?;
    let idxs = unrolled_indexes(block, pass);
    if idxs.is_empty() {
        return Ok(false);
    }
    // iterations writing the same element must stay ordered
    let chained = block
        .refs
        .iter()
        .filter(|r| r.dir.is_write())
        .any(|r| idxs.iter().any(|(n, _)| !r.uses_index(n)));
    let base = pass.part_name.clone().unwrap_or_else(|| block.name.clone());
    let deps: BTreeSet<NodeId> = prog.node(id)?.deps.clone();

    let mut copies = Vec::new();
    for (k, values) in assignments(&idxs).iter().enumerate() {
        let copy = prog.deep_clone(id)?;
        let suffix = pass.make_views.then(|| format!("_{}", k));
        if !specialize(prog, copy, &idxs, values, format!("{}#{}", base, k), suffix)? {
            prog.free(copy);
            continue;
        }
        let mut copy_deps = deps.clone();
        if chained {
            copy_deps.extend(copies.last().copied());
        }
        prog.node_mut(copy)?.deps = copy_deps;
        copies.push(copy);
    }
    debug!(
        "unroll: '{}' expanded into {} copies over {:?}",
        base,
        copies.len(),
        idxs.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>()
    );

    let stmts = &mut prog.block_mut(parent)?.stmts;
    if let Some(pos) = stmts.iter().position(|&s| s == id) {
        stmts.remove(pos);
        for (n, &copy) in copies.iter().enumerate() {
            stmts.insert(pos + n, copy);
        }
    }
    let replacement: Vec<NodeId> = if copies.is_empty() {
        deps.into_iter().collect()
    } else {
        copies
    };
    prog.replace_dep(parent, id, &replacement)?;
    prog.free(id);
    Ok(true)
}

pub fn run(prog: &mut Program, pass: &UnrollPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    let parents = prog.parents();
    // innermost first, so an outer copy clones children that are already unrolled
    for id in prog.select(&pass.reqs).into_iter().rev() {
        stats.matched += 1;
        let parent = match parents.get(&id) {
            Some(&p) => p,
            None => {
                debug!("unroll: skipping the root block");
                continue;
            }
        };
        if unroll_block(prog, parent, id, pass)? {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}
