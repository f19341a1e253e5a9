//! Layout transposition for reductions.
//!
//! For a matched block, an accumulation index is one the block iterates but no
//! output is indexed by. Inputs walked along such an index are re-laid-out at
//! their allocation so that the dimension it walks becomes contiguous. The new
//! strides are pushed down to every view of the buffer.

use crate::config::TransposePass;
use crate::error::PassError;
use crate::ir::{NodeId, Program, RefDir, TensorShape};
use crate::pipeline::PassStats;
use crate::tags;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};

/// Dense strides with `inner` contiguous and the other dimensions keeping their
/// relative order.
fn strides_with_inner(shape: &TensorShape, inner: usize) -> Vec<i64> {
    let mut order: Vec<usize> = (0..shape.rank()).filter(|&d| d != inner).collect();
    order.sort_by_key(|&d| std::cmp::Reverse(shape.dims[d].stride.abs()));
    order.push(inner);
    let mut strides = vec![0i64; shape.rank()];
    let mut step = 1i64;
    for &d in order.iter().rev() {
        strides[d] = step;
        step *= shape.dims[d].size as i64;
    }
    strides
}

/// Walk from the view `name` of block `id` up to the block allocating it.
fn find_allocation(
    prog: &Program,
    parents: &HashMap<NodeId, NodeId>,
    id: NodeId,
    name: &str,
) -> Result<Option<(NodeId, String)>, PassError> {
    let mut cur = id;
    let mut name = name.to_string();
    loop {
        let block = prog.block(cur)?;
        let r = match block.ref_by_name(&name) {
            Some(r) => r,
            None => return Ok(None),
        };
        if r.dir.is_alloc() {
            return Ok(Some((cur, name)));
        }
        match parents.get(&cur) {
            Some(&up) => {
                name = r.from.clone();
                cur = up;
            }
            None => return Ok(None),
        }
    }
}

fn transpose_block(
    prog: &mut Program,
    parents: &HashMap<NodeId, NodeId>,
    id: NodeId,
    pass: &TransposePass,
) -> Result<bool, PassError> {
    let block = prog.block(id)?;
    let accum: Vec<String> = block
        .real_idxs()
        .filter(|i| i.range > 1)
        .filter(|i| {
            !block
                .refs
                .iter()
                .filter(|r| r.dir.is_write())
                .any(|r| r.uses_index(&i.name))
        })
        .map(|i| i.name.clone())
        .collect();

    let mut wanted: Vec<(String, usize)> = Vec::new();
    for r in block.refs.iter().filter(|r| r.dir == RefDir::In) {
        for k in &accum {
            if let Some(d) = r.access.iter().position(|a| a.uses(k)) {
                if r.shape.contiguous_dim() != Some(d) {
                    wanted.push((r.into.clone(), d));
                }
                break;
            }
        }
    }

    let mut done: BTreeSet<(NodeId, String)> = BTreeSet::new();
    let mut changed = false;
    for (view, dim) in wanted {
        let (owner, alloc) = match find_allocation(prog, parents, id, &view)? {
            Some(found) => found,
            None => {
                warn!(
                    "transpose: '{}' in '{}' is a program input; layout left unchanged",
                    view,
                    prog.block(id)?.name
                );
                continue;
            }
        };
        if !done.insert((owner, alloc.clone())) {
            continue;
        }
        let shape = match prog.block(owner)?.ref_by_name(&alloc) {
            Some(r) if tags::matches(&r.tags, &pass.alloc_reqs) => r.shape.clone(),
            _ => continue,
        };
        if shape.rank() <= dim {
            continue;
        }
        let strides = strides_with_inner(&shape, dim);
        let touched = prog.restride(owner, &alloc, &strides)?;
        debug!(
            "transpose: '{}' re-strided to {:?} ({} views)",
            alloc, strides, touched
        );
        changed = true;
    }
    Ok(changed)
}

pub fn run(prog: &mut Program, pass: &TransposePass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    let parents = prog.parents();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        if transpose_block(prog, &parents, id, pass)? {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}
