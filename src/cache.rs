//! Cache insertion and the copy blocks shared with the scheduler.
//!
//! Caching refinement `X` of block `B` allocates `X_cache` in `B`, redirects every
//! use inside `B` to it and brackets the body with a `cache_in` copy (for readable
//! views) and a `cache_out` copy (for writable views).

use crate::affine::Affine;
use crate::config::CachePass;
use crate::deps::effects;
use crate::error::{IrError, PassError};
use crate::ir::{Block, Index, NodeId, Program, RefDir, Refinement, Stmt, TensorDim, TensorShape};
use crate::location::Location;
use crate::pipeline::PassStats;
use crate::tags;
use log::debug;
use std::collections::BTreeSet;

/// An element-wise copy between two buffers of the same sizes.
pub(crate) struct Transfer<'a> {
    pub name: String,
    pub tag: &'static str,
    pub src: &'a str,
    pub src_shape: &'a TensorShape,
    pub dst: &'a str,
    pub dst_shape: &'a TensorShape,
    pub agg_op: Option<String>,
    pub loc: Option<Location>,
}

fn unit_view(shape: &TensorShape) -> TensorShape {
    TensorShape {
        dtype: shape.dtype,
        dims: shape
            .dims
            .iter()
            .map(|d| TensorDim {
                size: 1,
                stride: d.stride,
            })
            .collect(),
    }
}

/// Allocate a detached copy block; the caller links it into a parent.
pub(crate) fn transfer_block(prog: &mut Program, t: Transfer<'_>) -> Result<NodeId, IrError> {
    let mut block = Block::new(t.name);
    block.tags = tags::tag_set([t.tag]);
    block.location = t.loc;
    let names: Vec<String> = (0..t.src_shape.rank()).map(|d| format!("i{}", d)).collect();
    block.idxs = names
        .iter()
        .zip(&t.src_shape.dims)
        .map(|(n, d)| Index::new(n.clone(), d.size))
        .collect();
    let access: Vec<Affine> = names.iter().map(|n| Affine::index(n)).collect();
    block.refs.push(Refinement::new(
        RefDir::In,
        t.src,
        "src",
        access.clone(),
        unit_view(t.src_shape),
    ));
    let mut dst = Refinement::new(RefDir::Out, t.dst, "dst", access, unit_view(t.dst_shape));
    dst.agg_op = t.agg_op;
    block.refs.push(dst);

    let id = prog.alloc(Stmt::Block(block));
    let load = prog.push(
        id,
        Stmt::Load {
            from: "src".into(),
            into: "$x".into(),
        },
    )?;
    let store = prog.push(
        id,
        Stmt::Store {
            from: "$x".into(),
            into: "dst".into(),
        },
    )?;
    prog.node_mut(store)?.deps.insert(load);
    Ok(id)
}

fn cache_ref(prog: &mut Program, id: NodeId, name: &str, pass: &CachePass) -> Result<(), PassError> {
    let block = prog.block(id)?;
    let orig = block
        .ref_by_name(name)
        .cloned()
        .ok_or_else(|| IrError::UnknownRefinement {
            block: block.name.clone(),
            name: name.to_string(),
        })?;
    let cache_name = block.unique_ref_name(&format!("{}_cache", name));
    let stmts = block.stmts.clone();

    let mut local = Refinement::alloc(cache_name.clone(), orig.shape.densified());
    local.location = pass.mem_loc.clone();
    local.tags = orig.tags.clone();
    let local_shape = local.shape.clone();
    prog.block_mut(id)?.refs.push(local);

    let mut users = Vec::new();
    for &s in &stmts {
        let node = prog.node_mut(s)?;
        if effects(&node.stmt).touches(name) {
            node.stmt.rename_use(name, &cache_name);
            users.push(s);
        }
    }
    let dense: Vec<i64> = local_shape.dims.iter().map(|d| d.stride).collect();
    prog.restride(id, &cache_name, &dense)?;

    let mut cache_in = None;
    if orig.dir.is_read() {
        let xfer = transfer_block(
            prog,
            Transfer {
                name: format!("cache_in_{}", name),
                tag: "cache_in",
                src: name,
                src_shape: &orig.shape,
                dst: &cache_name,
                dst_shape: &local_shape,
                agg_op: None,
                loc: pass.xfer_loc.clone(),
            },
        )?;
        for &u in &users {
            prog.node_mut(u)?.deps.insert(xfer);
        }
        prog.block_mut(id)?.stmts.insert(0, xfer);
        cache_in = Some(xfer);
    }
    if orig.dir.is_write() {
        let xfer = transfer_block(
            prog,
            Transfer {
                name: format!("cache_out_{}", name),
                tag: "cache_out",
                src: &cache_name,
                src_shape: &local_shape,
                dst: name,
                dst_shape: &orig.shape,
                agg_op: orig.agg_op.clone(),
                loc: pass.xfer_loc.clone(),
            },
        )?;
        let deps: BTreeSet<NodeId> = users.iter().copied().chain(cache_in).collect();
        prog.node_mut(xfer)?.deps = deps;
        prog.block_mut(id)?.stmts.push(xfer);
    }
    debug!("cache: '{}' cached as '{}'", name, cache_name);
    Ok(())
}

pub fn run(prog: &mut Program, pass: &CachePass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        let targets: Vec<String> = prog
            .block(id)?
            .refs
            .iter()
            .filter(|r| r.dir != RefDir::None && pass.dirs.contains(&r.dir))
            .filter(|r| tags::matches(&r.tags, &pass.ref_reqs))
            .map(|r| r.into.clone())
            .collect();
        for name in &targets {
            cache_ref(prog, id, name, pass)?;
        }
        if !targets.is_empty() {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Operation};

    fn kernel() -> (Program, NodeId, NodeId) {
        let mut prog = Program::new(Block::new("main"));
        let mut b = Block::new("k");
        b.tags = tags::tag_set(["kernel"]);
        let shape = TensorShape::dense(DataType::Float32, &[4, 8]);
        b.refs = vec![
            Refinement::new(RefDir::In, "X", "X", vec![Affine::zero(); 2], shape.clone()),
            Refinement::new(RefDir::Out, "Y", "Y", vec![Affine::zero(); 2], shape),
        ];
        let id = prog.push(prog.root(), Stmt::Block(b)).unwrap();
        let op = prog
            .push(id, Stmt::Special(Operation::new("relu", &["X"], &["Y"])))
            .unwrap();
        (prog, id, op)
    }

    #[test]
    fn test_cache_inputs_and_outputs() {
        let (mut prog, id, op) = kernel();
        let pass = CachePass {
            reqs: vec!["kernel".into()],
            mem_loc: Some(Location::new("SRAM")),
            xfer_loc: Some(Location::new("DMA")),
            ..CachePass::default()
        };
        let stats = run(&mut prog, &pass).unwrap();
        assert_eq!(stats.rewritten, 1);

        let b = prog.block(id).unwrap();
        let xc = b.ref_by_name("X_cache").unwrap();
        assert_eq!(xc.dir, RefDir::None);
        assert_eq!(xc.location, Some(Location::new("SRAM")));
        assert!(b.ref_by_name("Y_cache").is_some());
        assert_eq!(b.stmts.len(), 3);

        let (cin, cout) = (b.stmts[0], b.stmts[2]);
        let cin_block = prog.block(cin).unwrap();
        assert!(cin_block.tags.contains("cache_in"));
        assert_eq!(cin_block.location, Some(Location::new("DMA")));
        assert_eq!(cin_block.idxs.iter().map(|i| i.range).collect::<Vec<_>>(), vec![4, 8]);
        assert!(prog.block(cout).unwrap().tags.contains("cache_out"));

        match &prog.node(op).unwrap().stmt {
            Stmt::Special(o) => {
                assert_eq!(o.inputs, vec!["X_cache".to_string()]);
                assert_eq!(o.outputs, vec!["Y_cache".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(prog.node(op).unwrap().deps.contains(&cin));
        assert!(prog.node(cout).unwrap().deps.contains(&op));
        assert!(prog.validate().is_ok());
    }

    #[test]
    fn test_direction_and_ref_filters() {
        let (mut prog, id, _) = kernel();
        let pass = CachePass {
            reqs: vec!["kernel".into()],
            dirs: vec![RefDir::In],
            ..CachePass::default()
        };
        run(&mut prog, &pass).unwrap();
        let b = prog.block(id).unwrap();
        assert!(b.ref_by_name("X_cache").is_some());
        assert!(b.ref_by_name("Y_cache").is_none());

        let (mut prog, id, _) = kernel();
        let pass = CachePass {
            reqs: vec!["kernel".into()],
            ref_reqs: vec!["hot".into()],
            ..CachePass::default()
        };
        let stats = run(&mut prog, &pass).unwrap();
        assert_eq!(stats.rewritten, 0);
        assert_eq!(prog.block(id).unwrap().stmts.len(), 1);
    }

    #[test]
    fn test_inner_views_use_cache_layout() {
        let mut prog = Program::new(Block::new("main"));
        let mut outer = Block::new("tile");
        outer.tags = tags::tag_set(["kernel"]);
        let window = TensorShape::dense(DataType::Float32, &[32, 32]).with_strides(&[64, 1]);
        outer.refs = vec![Refinement::new(RefDir::Out, "C", "C", vec![Affine::zero(); 2], window)];
        let id = prog.push(prog.root(), Stmt::Block(outer)).unwrap();
        let mut inner = Block::new("body");
        inner.idxs = vec![Index::new("i", 32), Index::new("j", 32)];
        inner.refs = vec![Refinement::new(
            RefDir::Out,
            "C",
            "c",
            vec![Affine::index("i"), Affine::index("j")],
            TensorShape::dense(DataType::Float32, &[1, 1]).with_strides(&[64, 1]),
        )];
        let inner = prog.push(id, Stmt::Block(inner)).unwrap();

        let pass = CachePass {
            reqs: vec!["kernel".into()],
            ..CachePass::default()
        };
        run(&mut prog, &pass).unwrap();
        let view = prog.block(inner).unwrap().ref_by_name("c").unwrap();
        assert_eq!(view.from, "C_cache");
        let strides: Vec<i64> = view.shape.dims.iter().map(|d| d.stride).collect();
        assert_eq!(strides, vec![32, 1]);
        assert!(prog.validate().is_ok());
    }
}
