//! Removal of unused indexes and refinements.

use crate::config::{PruneIndexesPass, PruneRefinementsPass};
use crate::deps::effects;
use crate::error::PassError;
use crate::ir::{NodeId, Program};
use crate::pipeline::PassStats;
use log::debug;
use std::collections::BTreeSet;

/// Index names of `id` that something still refers to.
fn used_indexes(prog: &Program, id: NodeId) -> Result<BTreeSet<String>, PassError> {
    let block = prog.block(id)?;
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut note = |a: &crate::affine::Affine| used.extend(a.names().map(str::to_string));
    block.refs.iter().flat_map(|r| &r.access).for_each(&mut note);
    block.constraints.iter().for_each(&mut note);
    for &s in &block.stmts {
        if let Some(child) = prog.try_block(s) {
            child.idxs.iter().map(|i| &i.affine).for_each(&mut note);
        }
    }
    Ok(used)
}

pub fn prune_idxs(prog: &mut Program, pass: &PruneIndexesPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        let used = used_indexes(prog, id)?;
        let block = prog.block_mut(id)?;
        // repeating a reduction changes its result
        let accumulates = block.refs.iter().any(|r| r.accumulates());
        let before = block.idxs.len();
        block
            .idxs
            .retain(|i| used.contains(&i.name) || (i.range > 1 && accumulates));
        if block.idxs.len() != before {
            debug!(
                "prune_idxs: '{}' dropped {} indexes",
                block.name,
                before - block.idxs.len()
            );
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}

pub fn prune_refs(prog: &mut Program, pass: &PruneRefinementsPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        // the root's refinements are the program's interface
        if id == prog.root() {
            continue;
        }
        let mut used = BTreeSet::new();
        for &s in &prog.block(id)?.stmts {
            used.extend(effects(&prog.node(s)?.stmt).names().cloned());
        }
        let block = prog.block_mut(id)?;
        let before = block.refs.len();
        block.refs.retain(|r| used.contains(&r.into));
        if block.refs.len() != before {
            debug!(
                "prune_refs: '{}' dropped {} refinements",
                block.name,
                before - block.refs.len()
            );
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::Affine;
    use crate::ir::{Block, DataType, Index, Operation, RefDir, Refinement, Stmt, TensorShape};
    use crate::tags::tag_set;

    fn block(agg: Option<&str>) -> (Program, NodeId) {
        let mut b = Block::new("k");
        b.tags = tag_set(["k"]);
        b.idxs = vec![
            Index::new("i", 8),
            Index::new("j", 4),
            Index::new("u", 1),
            Index::new("c", 2),
        ];
        b.constraints = vec![Affine::index("c") - Affine::constant(1)];
        let shape = TensorShape::dense(DataType::Float32, &[1]);
        let mut out = Refinement::new(RefDir::Out, "O", "o", vec![Affine::index("i")], shape.clone());
        out.agg_op = agg.map(str::to_string);
        b.refs = vec![
            out,
            Refinement::new(RefDir::In, "X", "x", vec![Affine::zero()], shape.clone()),
            Refinement::alloc("scratch", shape),
        ];
        let mut prog = Program::new(Block::new("main"));
        let id = prog.push(prog.root(), Stmt::Block(b)).unwrap();
        prog.push(id, Stmt::Special(Operation::new("f", &["x"], &["o"]))).unwrap();
        (prog, id)
    }

    fn names(prog: &Program, id: NodeId) -> Vec<String> {
        prog.block(id).unwrap().idxs.iter().map(|i| i.name.clone()).collect()
    }

    #[test]
    fn test_prune_idxs_without_accumulation() {
        let (mut prog, id) = block(None);
        prune_idxs(&mut prog, &PruneIndexesPass { reqs: vec!["k".into()] }).unwrap();
        assert_eq!(names(&prog, id), vec!["i", "c"]);
    }

    #[test]
    fn test_prune_idxs_keeps_reduction_ranges() {
        let (mut prog, id) = block(Some("add"));
        prune_idxs(&mut prog, &PruneIndexesPass { reqs: vec!["k".into()] }).unwrap();
        assert_eq!(names(&prog, id), vec!["i", "j", "c"]);
    }

    #[test]
    fn test_prune_idxs_keeps_child_references() {
        let (mut prog, id) = block(None);
        let mut child = Block::new("child");
        child.idxs = vec![Index::passthrough("j", Affine::index("j"))];
        prog.push(id, Stmt::Block(child)).unwrap();
        prune_idxs(&mut prog, &PruneIndexesPass { reqs: vec!["k".into()] }).unwrap();
        assert_eq!(names(&prog, id), vec!["i", "j", "c"]);
    }

    #[test]
    fn test_prune_refs() {
        let (mut prog, id) = block(None);
        let stats = prune_refs(&mut prog, &PruneRefinementsPass { reqs: vec!["k".into()] }).unwrap();
        assert_eq!(stats.rewritten, 1);
        let refs: Vec<&str> = prog.block(id).unwrap().refs.iter().map(|r| r.into.as_str()).collect();
        assert_eq!(refs, vec!["o", "x"]);
    }

    #[test]
    fn test_prune_refs_keeps_root_interface() {
        let mut root = Block::new("main");
        root.tags = tag_set(["k"]);
        let shape = TensorShape::dense(DataType::Float32, &[4]);
        root.refs = vec![
            Refinement::new(RefDir::In, "", "X", vec![Affine::zero()], shape.clone()),
            Refinement::new(RefDir::Out, "", "unused", vec![Affine::zero()], shape),
        ];
        let mut prog = Program::new(root);
        let id = prog.root();
        prog.push(id, Stmt::Special(Operation::new("f", &["X"], &[]))).unwrap();
        let stats = prune_refs(&mut prog, &PruneRefinementsPass { reqs: vec!["k".into()] }).unwrap();
        assert_eq!((stats.matched, stats.rewritten), (1, 0));
        assert_eq!(prog.block(id).unwrap().refs.len(), 2);
    }
}
