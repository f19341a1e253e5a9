//! Shared tiling rewrite.
//!
//! Splitting block `B` by a tile vector `t` turns it into an outer block (same
//! statement id, index `i` ranging over `ceil(r_i / t_i)` tile starts) holding a
//! single inner block (index `i` ranging over `t_i` within the tile). Outer views
//! are widened to the tile extent; inner views refine them with the in-tile part of
//! the access. When the original index value is still needed (constraints, child
//! pass-through indexes, uneven tiles) the inner block re-derives it as
//! `t_i * i_o + i` through a pass-through index `i_o`.

use crate::affine::Affine;
use crate::error::PassError;
use crate::ir::{Block, Index, NodeId, Program, RefDir, Refinement, Stmt, TensorDim};
use std::collections::{BTreeMap, BTreeSet};

/// Split `id` by `tile` (one entry per index, pass-through indexes must be 1).
/// Returns the id of the new inner block; the outer block keeps `id`.
pub fn apply_tile(prog: &mut Program, id: NodeId, tile: &[u64]) -> Result<NodeId, PassError> {
    apply_tile_keeping(prog, id, tile, &BTreeSet::new())
}

/// Like [`apply_tile`], but every index named in `keep` gets a real inner index
/// even when its tile size is 1.
pub fn apply_tile_keeping(
    prog: &mut Program,
    id: NodeId,
    tile: &[u64],
    keep: &BTreeSet<String>,
) -> Result<NodeId, PassError> {
    let block = prog.block(id)?.clone();
    if tile.len() != block.idxs.len() {
        return Err(PassError::unsatisfiable(
            "tile",
            &block.name,
            format!("{} tile sizes for {} indexes", tile.len(), block.idxs.len()),
        ));
    }
    for (idx, &t) in block.idxs.iter().zip(tile) {
        if t == 0 || (idx.is_passthrough() && t != 1) {
            return Err(PassError::unsatisfiable(
                "tile",
                &block.name,
                format!("invalid tile size {} for index '{}'", t, idx.name),
            ));
        }
    }
    let sizes: BTreeMap<String, u64> = block
        .idxs
        .iter()
        .zip(tile)
        .map(|(i, &t)| (i.name.clone(), t))
        .collect();

    // Index names whose original value the inner block still has to see
    let mut needed: BTreeSet<String> = BTreeSet::new();
    for c in &block.constraints {
        needed.extend(c.names().map(str::to_string));
    }
    for &child in &block.stmts {
        if let Some(cb) = prog.try_block(child) {
            for idx in &cb.idxs {
                needed.extend(idx.affine.names().map(str::to_string));
            }
        }
    }
    for (idx, &t) in block.idxs.iter().zip(tile) {
        if !idx.is_passthrough() && idx.range % t != 0 {
            needed.insert(idx.name.clone());
        }
    }

    let mut inner = Block::new(block.name.clone());
    let mut subst: BTreeMap<String, Affine> = BTreeMap::new();
    for (idx, &t) in block.idxs.iter().zip(tile) {
        if idx.is_passthrough() {
            if needed.contains(&idx.name) {
                inner
                    .idxs
                    .push(Index::passthrough(idx.name.clone(), Affine::index(&idx.name)));
            }
            continue;
        }
        let kept = keep.contains(&idx.name);
        if t > 1 || kept {
            let mut real = Index::new(idx.name.clone(), t);
            real.tags = idx.tags.clone();
            inner.idxs.push(real);
        }
        if !needed.contains(&idx.name) {
            continue;
        }
        if t == 1 && !kept {
            inner
                .idxs
                .push(Index::passthrough(idx.name.clone(), Affine::index(&idx.name)));
        } else {
            let outer_name = unique_idx(&block, &inner, &format!("{}_o", idx.name));
            inner
                .idxs
                .push(Index::passthrough(outer_name.clone(), Affine::index(&idx.name)));
            let original = Affine::term(&outer_name, t as i64) + Affine::index(&idx.name);
            if idx.range % t != 0 {
                inner
                    .constraints
                    .push(Affine::constant(idx.range as i64 - 1) - original.clone());
            }
            subst.insert(idx.name.clone(), original);
        }
    }
    inner.constraints.splice(
        0..0,
        block.constraints.iter().map(|c| c.substitute_all(&subst)),
    );

    let mut outer_refs = Vec::new();
    for r in &block.refs {
        if r.dir == RefDir::None {
            inner.refs.push(r.clone());
            continue;
        }
        let mut outer_ref = r.clone();
        outer_ref.access = r
            .access
            .iter()
            .map(|a| {
                let mut scaled = Affine::constant(a.constant_term());
                for (name, c) in a.terms() {
                    let t = sizes.get(name).copied().unwrap_or(1) as i64;
                    scaled = scaled + Affine::term(name, c * t);
                }
                scaled
            })
            .collect();
        outer_ref.shape.dims = tile_extents(r, &sizes)
            .into_iter()
            .zip(&r.shape.dims)
            .map(|(size, d)| TensorDim {
                size,
                stride: d.stride,
            })
            .collect();
        outer_refs.push(outer_ref);

        let in_tile = r
            .access
            .iter()
            .map(|a| {
                a.retain(|name| sizes.get(name).map(|&t| t > 1).unwrap_or(false))
                    - Affine::constant(a.constant_term())
            })
            .collect();
        let mut inner_ref =
            Refinement::new(r.dir, r.into.clone(), r.into.clone(), in_tile, r.shape.clone());
        inner_ref.agg_op = r.agg_op.clone();
        inner_ref.location = r.location.clone();
        inner_ref.bank_dim = r.bank_dim;
        inner_ref.tags = r.tags.clone();
        inner.refs.push(inner_ref);
    }

    // Children move under the inner block; their pass-throughs see the original values
    for &child in &block.stmts {
        if let Some(cb) = prog.node_mut(child)?.stmt.as_block_mut() {
            for idx in cb.idxs.iter_mut().filter(|i| i.is_passthrough()) {
                idx.affine = idx.affine.substitute_all(&subst);
            }
        }
    }
    inner.stmts = block.stmts.clone();
    let inner_id = prog.alloc(Stmt::Block(inner));

    let outer = prog.block_mut(id)?;
    for (idx, &t) in outer.idxs.iter_mut().zip(tile) {
        if !idx.is_passthrough() {
            idx.range = (idx.range + t - 1) / t;
        }
    }
    outer.constraints.clear();
    outer.refs = outer_refs;
    outer.stmts = vec![inner_id];
    Ok(inner_id)
}

fn unique_idx(outer: &Block, inner: &Block, base: &str) -> String {
    let taken = |n: &str| outer.idx_by_name(n).is_some() || inner.idx_by_name(n).is_some();
    if !taken(base) {
        return base.to_string();
    }
    (0..)
        .map(|n| format!("{}_{}", base, n))
        .find(|c| !taken(c))
        .unwrap_or_else(|| base.to_string())
}

/// Extent of a view of `r` covering a whole tile, per dimension.
pub fn tile_extents(r: &Refinement, tile: &BTreeMap<String, u64>) -> Vec<u64> {
    r.access
        .iter()
        .zip(&r.shape.dims)
        .map(|(a, d)| {
            a.terms()
                .map(|(name, c)| {
                    c.unsigned_abs()
                        .saturating_mul(tile.get(name).copied().unwrap_or(1).saturating_sub(1))
                })
                .fold(d.size, u64::saturating_add)
        })
        .collect()
}
