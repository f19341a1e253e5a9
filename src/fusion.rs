//! Loop fusion.
//!
//! Two consecutive sibling blocks `a` and `b` with the same iteration space are
//! wrapped by one block `F` iterating that space once. `a` and `b` become children
//! of `F` whose indexes pass `F`'s through, so both bodies run for the same point
//! back to back. Fusion is only done when every buffer the two blocks share is
//! accessed at the same element by both.

use crate::affine::Affine;
use crate::config::FusionPass;
use crate::deps::effects;
use crate::error::PassError;
use crate::ir::{Block, Index, NodeId, Program, RefDir, Refinement, Stmt};
use crate::pipeline::PassStats;
use crate::tags;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Map each index name of `b` to the index of `a` it runs with.
fn index_mapping(a: &Block, b: &Block) -> Option<BTreeMap<String, String>> {
    if a.idxs.iter().chain(&b.idxs).any(Index::is_passthrough) || a.idxs.len() != b.idxs.len() {
        return None;
    }
    let by_name: Option<BTreeMap<String, String>> = b
        .idxs
        .iter()
        .map(|bi| {
            a.idx_by_name(&bi.name)
                .filter(|ai| ai.range == bi.range)
                .map(|ai| (bi.name.clone(), ai.name.clone()))
        })
        .collect();
    if by_name.is_some() {
        return by_name;
    }
    a.idxs
        .iter()
        .zip(&b.idxs)
        .map(|(ai, bi)| (ai.range == bi.range).then(|| (bi.name.clone(), ai.name.clone())))
        .collect()
}

fn renamed_access(r: &Refinement, mapping: &BTreeMap<String, String>) -> Vec<Affine> {
    let subst: BTreeMap<String, Affine> = mapping
        .iter()
        .map(|(from, to)| (from.clone(), Affine::index(to)))
        .collect();
    r.access.iter().map(|a| a.substitute_all(&subst)).collect()
}

/// Refinements of the fused block, keyed by the parent buffer they view.
fn fused_refs(a: &Block, b: &Block, mapping: &BTreeMap<String, String>) -> Option<Vec<Refinement>> {
    let mut refs: Vec<Refinement> = Vec::new();
    for r in a.refs.iter().filter(|r| !r.dir.is_alloc()) {
        let mut outer = r.clone();
        outer.into = r.from.clone();
        outer.offset = None;
        refs.push(outer);
    }
    for r in b.refs.iter().filter(|r| !r.dir.is_alloc()) {
        let access = renamed_access(r, mapping);
        match refs.iter_mut().find(|o| o.into == r.from) {
            Some(shared) => {
                if shared.access != access || shared.shape != r.shape {
                    return None;
                }
                shared.dir = shared.dir.union(r.dir);
                if shared.agg_op.is_none() {
                    shared.agg_op = r.agg_op.clone();
                }
            }
            None => {
                let mut outer = r.clone();
                outer.into = r.from.clone();
                outer.access = access;
                outer.offset = None;
                refs.push(outer);
            }
        }
    }
    Some(refs)
}

/// Turn a fused child into a pass-through of the fused block's index space.
fn nest_child(block: &mut Block, mapping: &BTreeMap<String, String>) {
    for idx in &mut block.idxs {
        let outer = mapping.get(&idx.name).cloned().unwrap_or_else(|| idx.name.clone());
        *idx = Index::passthrough(idx.name.clone(), Affine::index(&outer));
    }
    for r in block.refs.iter_mut().filter(|r| !r.dir.is_alloc()) {
        r.access = vec![Affine::zero(); r.shape.rank()];
    }
}

fn fuse_pair(
    prog: &mut Program,
    parent: NodeId,
    a_id: NodeId,
    b_id: NodeId,
    pass: &FusionPass,
) -> Result<Option<NodeId>, PassError> {
    let a = prog.block(a_id)?.clone();
    let b = prog.block(b_id)?.clone();
    let mapping = match index_mapping(&a, &b) {
        Some(m) => m,
        None => {
            debug!("fusion: '{}' and '{}' iterate different spaces", a.name, b.name);
            return Ok(None);
        }
    };
    let refs = match fused_refs(&a, &b, &mapping) {
        Some(r) => r,
        None => {
            debug!("fusion: '{}' and '{}' disagree on a shared buffer", a.name, b.name);
            return Ok(None);
        }
    };

    let mut fused = Block::new(format!("{}+{}", a.name, b.name));
    fused.idxs = a.idxs.clone();
    fused.refs = refs;
    fused.location = a.location.clone();
    fused.tags = tags::tag_set(pass.fused_set.iter().cloned());

    let identity: BTreeMap<String, String> = a
        .idxs
        .iter()
        .map(|i| (i.name.clone(), i.name.clone()))
        .collect();
    if let Some(block) = prog.node_mut(a_id)?.stmt.as_block_mut() {
        nest_child(block, &identity);
    }
    if let Some(block) = prog.node_mut(b_id)?.stmt.as_block_mut() {
        nest_child(block, &mapping);
    }

    let mut outer_deps: BTreeSet<NodeId> = prog.node(a_id)?.deps.clone();
    outer_deps.extend(prog.node(b_id)?.deps.iter().copied());
    outer_deps.remove(&a_id);

    let fa = effects(&prog.node(a_id)?.stmt);
    let fb = effects(&prog.node(b_id)?.stmt);
    let ordered = fa.writes.iter().any(|n| fb.touches(n)) || fb.writes.iter().any(|n| fa.touches(n));
    prog.node_mut(a_id)?.deps.clear();
    prog.node_mut(b_id)?.deps = if ordered {
        BTreeSet::from([a_id])
    } else {
        BTreeSet::new()
    };

    fused.stmts = vec![a_id, b_id];
    let f_id = prog.alloc(Stmt::Block(fused));
    prog.node_mut(f_id)?.deps = outer_deps;

    let siblings = &mut prog.block_mut(parent)?.stmts;
    if let Some(pos) = siblings.iter().position(|&s| s == a_id) {
        siblings[pos] = f_id;
    }
    siblings.retain(|&s| s != b_id);
    prog.replace_dep(parent, a_id, &[f_id])?;
    prog.replace_dep(parent, b_id, &[f_id])?;
    // the fused block must not wait on itself
    prog.node_mut(f_id)?.deps.remove(&f_id);
    Ok(Some(f_id))
}

pub fn run(prog: &mut Program, pass: &FusionPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for parent in prog.select(&pass.parent_reqs) {
        let mut k = 0;
        loop {
            let stmts = prog.block(parent)?.stmts.clone();
            if k + 1 >= stmts.len() {
                break;
            }
            let (a, b) = (stmts[k], stmts[k + 1]);
            let a_ok = prog.try_block(a).map(|x| x.has_tags(&pass.a_reqs)).unwrap_or(false);
            let b_ok = prog.try_block(b).map(|x| x.has_tags(&pass.b_reqs)).unwrap_or(false);
            if a_ok && b_ok {
                stats.matched += 1;
                if let Some(f) = fuse_pair(prog, parent, a, b, pass)? {
                    debug!("fusion: fused {} and {} into {}", a, b, f);
                    stats.rewritten += 1;
                }
            }
            k += 1;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Operation, TensorDim, TensorShape};

    fn unit(strides: &[i64]) -> TensorShape {
        TensorShape {
            dtype: DataType::Float32,
            dims: strides.iter().map(|&stride| TensorDim { size: 1, stride }).collect(),
        }
    }

    fn eltwise(name: &str, tag: &str, idx: &[&str], input: &str, output: &str) -> Block {
        let mut b = Block::new(name);
        b.tags = tags::tag_set([tag]);
        b.idxs = idx.iter().map(|n| Index::new(*n, 16)).collect();
        let access: Vec<Affine> = idx.iter().map(|n| Affine::index(n)).collect();
        b.refs = vec![
            Refinement::new(RefDir::In, input, "in", access.clone(), unit(&[16, 1])),
            Refinement::new(RefDir::Out, output, "out", access, unit(&[16, 1])),
        ];
        b
    }

    fn parent_with(a: Block, b: Block) -> (Program, NodeId, NodeId, NodeId) {
        let mut root = Block::new("main");
        root.tags = tags::tag_set(["fusable"]);
        let mut prog = Program::new(root);
        let p = prog.root();
        let a_id = prog.push(p, Stmt::Block(a)).unwrap();
        prog.push(a_id, Stmt::Special(Operation::new("f", &["in"], &["out"]))).unwrap();
        let b_id = prog.push(p, Stmt::Block(b)).unwrap();
        prog.push(b_id, Stmt::Special(Operation::new("g", &["in"], &["out"]))).unwrap();
        prog.node_mut(b_id).unwrap().deps.insert(a_id);
        (prog, p, a_id, b_id)
    }

    fn pass() -> FusionPass {
        FusionPass {
            parent_reqs: vec!["fusable".into()],
            a_reqs: vec!["matmul_a".into()],
            b_reqs: vec!["matmul_b".into()],
            fused_set: vec!["fused".into()],
        }
    }

    #[test]
    fn test_fuse_by_position() {
        let a = eltwise("a", "matmul_a", &["i", "j"], "X", "T");
        let b = eltwise("b", "matmul_b", &["x", "y"], "T", "Y");
        let (mut prog, p, a_id, b_id) = parent_with(a, b);
        let stats = run(&mut prog, &pass()).unwrap();
        assert_eq!(stats.rewritten, 1);

        let stmts = prog.block(p).unwrap().stmts.clone();
        assert_eq!(stmts.len(), 1);
        let f = prog.block(stmts[0]).unwrap();
        assert!(f.tags.contains("fused"));
        assert_eq!(f.stmts, vec![a_id, b_id]);
        assert_eq!(f.idxs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(), vec!["i", "j"]);
        let t = f.ref_by_name("T").unwrap();
        assert_eq!(t.dir, RefDir::InOut);
        assert!(f.ref_by_name("X").unwrap().dir == RefDir::In);

        let bb = prog.block(b_id).unwrap();
        assert_eq!(bb.idxs[0].affine, Affine::index("i"));
        assert!(bb.refs[0].access.iter().all(Affine::is_zero));
        assert!(prog.node(b_id).unwrap().deps.contains(&a_id));
        assert!(prog.validate().is_ok());
    }

    #[test]
    fn test_mismatched_access_is_left_alone() {
        let a = eltwise("a", "matmul_a", &["i", "j"], "X", "T");
        let mut b = eltwise("b", "matmul_b", &["i", "j"], "T", "Y");
        // b reads T transposed
        b.refs[0].access = vec![Affine::index("j"), Affine::index("i")];
        let (mut prog, p, _, _) = parent_with(a, b);
        let before = prog.clone();
        let stats = run(&mut prog, &pass()).unwrap();
        assert_eq!((stats.matched, stats.rewritten), (1, 0));
        assert_eq!(prog, before);
        assert_eq!(prog.block(p).unwrap().stmts.len(), 2);
    }

    #[test]
    fn test_different_ranges() {
        let a = eltwise("a", "matmul_a", &["i", "j"], "X", "T");
        let mut b = eltwise("b", "matmul_b", &["i", "j"], "T", "Y");
        b.idxs[1].range = 8;
        assert!(index_mapping(&a, &b).is_none());
    }
}
