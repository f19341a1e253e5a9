//! Statement dependency analysis.
//!
//! Dependencies are recorded between sibling statements of one block. A statement
//! depends on the last writer of everything it reads (RAW), and on the last writer
//! plus every reader since then of everything it writes (WAW, WAR).

use crate::config::ComputeDepsPass;
use crate::error::PassError;
use crate::ir::{NodeId, Program, Stmt};
use crate::pipeline::PassStats;
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Names a statement reads and writes, in its parent's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

impl Effects {
    pub fn touches(&self, name: &str) -> bool {
        self.reads.contains(name) || self.writes.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.reads.union(&self.writes)
    }
}

pub fn effects(stmt: &Stmt) -> Effects {
    let mut fx = Effects::default();
    match stmt {
        Stmt::Block(block) => {
            for r in block.refs.iter().filter(|r| !r.from.is_empty()) {
                if r.dir.is_read() {
                    fx.reads.insert(r.from.clone());
                }
                if r.dir.is_write() {
                    fx.writes.insert(r.from.clone());
                }
            }
        }
        Stmt::Load { from, into } | Stmt::Store { from, into } => {
            fx.reads.insert(from.clone());
            fx.writes.insert(into.clone());
        }
        Stmt::Intrinsic(op) | Stmt::Special(op) => {
            fx.reads.extend(op.inputs.iter().cloned());
            fx.writes.extend(op.outputs.iter().cloned());
        }
    }
    fx
}

/// Recompute the dependency edges of `block`'s direct statements.
pub fn compute_block_deps(prog: &mut Program, block: NodeId) -> Result<usize, PassError> {
    let stmts = prog.block(block)?.stmts.clone();
    let mut last_writer: HashMap<String, NodeId> = HashMap::new();
    let mut readers: HashMap<String, Vec<NodeId>> = HashMap::new();
    let mut edges = 0;

    for &s in &stmts {
        let fx = effects(&prog.node(s)?.stmt);
        let mut deps = BTreeSet::new();
        for name in &fx.reads {
            if let Some(&w) = last_writer.get(name) {
                deps.insert(w);
            }
        }
        for name in &fx.writes {
            if let Some(&w) = last_writer.get(name) {
                deps.insert(w);
            }
            if let Some(rs) = readers.get(name) {
                deps.extend(rs.iter().copied().filter(|&r| r != s));
            }
        }
        for name in &fx.reads {
            readers.entry(name.clone()).or_default().push(s);
        }
        for name in &fx.writes {
            last_writer.insert(name.clone(), s);
            readers.remove(name);
        }
        edges += deps.len();
        prog.node_mut(s)?.deps = deps;
    }
    Ok(edges)
}

pub fn run(prog: &mut Program, pass: &ComputeDepsPass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        let edges = compute_block_deps(prog, id)?;
        debug!("compute_deps: block {} has {} edges", id, edges);
        stats.rewritten += 1;
    }
    Ok(stats)
}

/// Transitive predecessors of each of `stmts`, following recorded deps.
pub fn ancestors(
    prog: &Program,
    stmts: &[NodeId],
) -> Result<BTreeMap<NodeId, BTreeSet<NodeId>>, PassError> {
    let mut out: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    // statements are in dependency order, so one forward sweep suffices
    for &s in stmts {
        let mut all = BTreeSet::new();
        for dep in &prog.node(s)?.deps {
            all.insert(*dep);
            if let Some(up) = out.get(dep) {
                all.extend(up.iter().copied());
            }
        }
        out.insert(s, all);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Operation};

    fn special(name: &str, ins: &[&str], outs: &[&str]) -> Stmt {
        Stmt::Special(Operation::new(name, ins, outs))
    }

    #[test]
    fn test_raw_war_waw() {
        let mut prog = Program::new(Block::new("main"));
        let root = prog.root();
        let w1 = prog.push(root, special("w1", &[], &["X"])).unwrap();
        let r1 = prog.push(root, special("r1", &["X"], &["Y"])).unwrap();
        let r2 = prog.push(root, special("r2", &["X"], &["Z"])).unwrap();
        let w2 = prog.push(root, special("w2", &[], &["X"])).unwrap();
        let indep = prog.push(root, special("other", &["W"], &["V"])).unwrap();

        compute_block_deps(&mut prog, root).unwrap();

        assert!(prog.node(w1).unwrap().deps.is_empty());
        assert_eq!(prog.node(r1).unwrap().deps, BTreeSet::from([w1]));
        assert_eq!(prog.node(r2).unwrap().deps, BTreeSet::from([w1]));
        assert_eq!(prog.node(w2).unwrap().deps, BTreeSet::from([w1, r1, r2]));
        assert!(prog.node(indep).unwrap().deps.is_empty());
        assert!(prog.validate().is_ok());
    }

    #[test]
    fn test_ancestors_are_transitive() {
        let mut prog = Program::new(Block::new("main"));
        let root = prog.root();
        let a = prog.push(root, special("a", &[], &["X"])).unwrap();
        let b = prog.push(root, special("b", &["X"], &["Y"])).unwrap();
        let c = prog.push(root, special("c", &["Y"], &["Z"])).unwrap();
        compute_block_deps(&mut prog, root).unwrap();
        let anc = ancestors(&prog, &[a, b, c]).unwrap();
        assert_eq!(anc[&c], BTreeSet::from([a, b]));
        assert!(anc[&a].is_empty());
    }
}
