//! Allocation localization.
//!
//! A local buffer that only one child block touches is moved into that child:
//! the child's view of it becomes the allocation itself. A child that received a
//! buffer is examined again on the next sweep, so allocations sink as deep as
//! their uses allow.

use crate::affine::Affine;
use crate::config::LocalizePass;
use crate::deps::effects;
use crate::error::PassError;
use crate::ir::{NodeId, Program, RefDir};
use crate::pipeline::PassStats;
use log::debug;
use std::collections::BTreeSet;

pub struct Localizer {
    reqs: Vec<String>,
    frontier: Option<BTreeSet<NodeId>>,
    stats: PassStats,
}

impl Localizer {
    pub fn new(pass: &LocalizePass) -> Self {
        Localizer {
            reqs: pass.reqs.clone(),
            frontier: None,
            stats: PassStats::default(),
        }
    }

    /// Process the current frontier once. Returns whether anything moved.
    pub fn sweep(&mut self, prog: &mut Program) -> Result<bool, PassError> {
        let frontier = match self.frontier.take() {
            Some(f) => f,
            None => {
                let matched: BTreeSet<NodeId> = prog.select(&self.reqs).into_iter().collect();
                self.stats.matched = matched.len();
                matched
            }
        };
        let mut next = BTreeSet::new();
        for id in frontier {
            if prog.try_block(id).is_none() {
                continue;
            }
            let moved = localize_block(prog, id)?;
            if !moved.is_empty() {
                self.stats.rewritten += 1;
            }
            next.extend(moved);
        }
        let changed = !next.is_empty();
        self.frontier = Some(next);
        Ok(changed)
    }

    pub fn stats(&self) -> PassStats {
        self.stats.clone()
    }
}

/// Sole child block using `name`, if exactly one statement uses it and that
/// statement is a block with a single view of it.
fn sole_user(prog: &Program, id: NodeId, name: &str) -> Result<Option<NodeId>, PassError> {
    let mut users = Vec::new();
    for &s in &prog.block(id)?.stmts {
        if effects(&prog.node(s)?.stmt).touches(name) {
            users.push(s);
        }
    }
    if let [only] = users.as_slice() {
        if let Some(child) = prog.try_block(*only) {
            if child.refs.iter().filter(|r| r.from == name).count() == 1 {
                return Ok(Some(*only));
            }
        }
    }
    Ok(None)
}

/// Move every eligible allocation of `id` one level down. Returns the children
/// that received one.
fn localize_block(prog: &mut Program, id: NodeId) -> Result<BTreeSet<NodeId>, PassError> {
    let allocs: Vec<String> = prog
        .block(id)?
        .refs
        .iter()
        .filter(|r| r.dir.is_alloc())
        .map(|r| r.into.clone())
        .collect();
    let mut receivers = BTreeSet::new();
    for name in allocs {
        let child = match sole_user(prog, id, &name)? {
            Some(c) => c,
            None => continue,
        };
        let parent = prog.block_mut(id)?;
        let pos = match parent.refs.iter().position(|r| r.into == name) {
            Some(p) => p,
            None => continue,
        };
        let alloc = parent.refs.remove(pos);
        let child_block = prog.block_mut(child)?;
        let mut sunk = None;
        if let Some(view) = child_block.refs.iter_mut().find(|r| r.from == name) {
            view.dir = RefDir::None;
            view.from.clear();
            view.access = vec![Affine::zero(); view.shape.rank()];
            view.shape = view.shape.densified();
            view.location = alloc.location.clone();
            view.offset = None;
            view.agg_op = None;
            view.tags.extend(alloc.tags.iter().cloned());
            debug!(
                "localize: '{}' moved into '{}' as '{}'",
                name, child_block.name, view.into
            );
            let dense: Vec<i64> = view.shape.dims.iter().map(|d| d.stride).collect();
            sunk = Some((view.into.clone(), dense));
        }
        if let Some((into, dense)) = sunk {
            prog.restride(child, &into, &dense)?;
        }
        receivers.insert(child);
    }
    Ok(receivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, DataType, Index, Operation, Refinement, Stmt, TensorShape};
    use crate::location::Location;
    use crate::pipeline::Pipeline;
    use crate::tags;

    fn view(dir: RefDir, from: &str, into: &str, sizes: &[u64]) -> Refinement {
        Refinement::new(
            dir,
            from,
            into,
            vec![Affine::zero(); sizes.len()],
            TensorShape::dense(DataType::Float32, sizes),
        )
    }

    /// main allocates T; only `outer` uses it, and within `outer` only `inner`.
    fn nested() -> (Program, NodeId, NodeId, NodeId) {
        let mut root = Block::new("main");
        root.tags = tags::tag_set(["main"]);
        let mut t = Refinement::alloc("T", TensorShape::dense(DataType::Float32, &[8]));
        t.location = Some(Location::new("SRAM"));
        root.refs = vec![t];
        let mut prog = Program::new(root);
        let main = prog.root();

        let mut outer = Block::new("outer");
        outer.idxs = vec![Index::new("i", 4)];
        outer.refs = vec![view(RefDir::InOut, "T", "t", &[8])];
        let outer_id = prog.push(main, Stmt::Block(outer)).unwrap();

        let mut inner = Block::new("inner");
        inner.refs = vec![view(RefDir::Out, "t", "tt", &[8])];
        let inner_id = prog.push(outer_id, Stmt::Block(inner)).unwrap();
        prog.push(inner_id, Stmt::Special(Operation::new("fill", &[], &["tt"])))
            .unwrap();
        prog.push(main, Stmt::Special(Operation::new("other", &["X"], &["Y"])))
            .unwrap();
        (prog, main, outer_id, inner_id)
    }

    #[test]
    fn test_sinks_to_deepest_user() {
        let (mut prog, main, outer, inner) = nested();
        let pass = LocalizePass {
            reqs: vec!["main".into()],
        };
        let mut localizer = Localizer::new(&pass);
        assert!(localizer.sweep(&mut prog).unwrap());
        assert!(prog.block(main).unwrap().refs.is_empty());
        assert!(prog.block(outer).unwrap().ref_by_name("t").unwrap().dir.is_alloc());

        assert!(localizer.sweep(&mut prog).unwrap());
        assert!(prog.block(outer).unwrap().refs.is_empty());
        let tt = prog.block(inner).unwrap().ref_by_name("tt").unwrap().clone();
        assert_eq!(tt.dir, RefDir::None);
        assert!(tt.from.is_empty());
        assert_eq!(tt.location, Some(Location::new("SRAM")));

        assert!(!localizer.sweep(&mut prog).unwrap());
        assert_eq!(localizer.stats().matched, 1);
        assert_eq!(localizer.stats().rewritten, 2);
    }

    #[test]
    fn test_shared_buffer_stays() {
        let (mut prog, main, _, _) = nested();
        let mut other = Block::new("second");
        other.refs = vec![view(RefDir::In, "T", "t", &[8])];
        prog.push(main, Stmt::Block(other)).unwrap();
        let mut localizer = Localizer::new(&LocalizePass {
            reqs: vec!["main".into()],
        });
        assert!(!localizer.sweep(&mut prog).unwrap());
        assert!(prog.block(main).unwrap().ref_by_name("T").is_some());
    }

    #[test]
    fn test_driver_runs_to_fixpoint() {
        let (mut prog, _, _, inner) = nested();
        let config = crate::config::Config::from_json_str(
            r#"{ "passes": [ { "name": "loc", "localize": { "reqs": ["main"] } } ] }"#,
        )
        .unwrap();
        let pipeline = Pipeline::from_config(&config).unwrap();
        let report = pipeline.run(&mut prog).unwrap();
        assert_eq!(report.passes[0].stats.rewritten, 2);
        assert!(prog.block(inner).unwrap().ref_by_name("tt").unwrap().dir.is_alloc());
    }

    #[test]
    fn test_sunk_window_restrides_views() {
        let mut root = Block::new("main");
        root.tags = tags::tag_set(["main"]);
        root.refs = vec![Refinement::alloc("T", TensorShape::dense(DataType::Float32, &[4, 4]))];
        let mut prog = Program::new(root);
        let main = prog.root();

        let window = TensorShape::dense(DataType::Float32, &[2, 2]).with_strides(&[4, 1]);
        let mut outer = Block::new("outer");
        outer.refs = vec![Refinement::new(RefDir::InOut, "T", "t", vec![Affine::zero(); 2], window)];
        let outer_id = prog.push(main, Stmt::Block(outer)).unwrap();
        let element = TensorShape::dense(DataType::Float32, &[1, 1]).with_strides(&[4, 1]);
        let mut users = Vec::new();
        for (name, dir) in [("write", RefDir::Out), ("read", RefDir::In)] {
            let mut b = Block::new(name);
            b.refs = vec![Refinement::new(dir, "t", "e", vec![Affine::zero(); 2], element.clone())];
            users.push(prog.push(outer_id, Stmt::Block(b)).unwrap());
        }

        let mut localizer = Localizer::new(&LocalizePass {
            reqs: vec!["main".into()],
        });
        assert!(localizer.sweep(&mut prog).unwrap());
        let t = prog.block(outer_id).unwrap().ref_by_name("t").unwrap();
        assert!(t.dir.is_alloc());
        for u in users {
            let e = prog.block(u).unwrap().ref_by_name("e").unwrap();
            let strides: Vec<i64> = e.shape.dims.iter().map(|d| d.stride).collect();
            assert_eq!(strides, vec![2, 1]);
        }
    }
}
