//! Memory placement.
//!
//! Buffers allocated at a target memory location get byte offsets such that any two
//! whose lifetimes may overlap occupy disjoint ranges. Two buffers may share space
//! only when every statement using one is ordered (through the dependency graph)
//! before every statement using the other.

use crate::config::MemoryPlacementPass;
use crate::deps::{ancestors, effects};
use crate::error::PassError;
use crate::hardware::Hardware;
use crate::ir::{NodeId, Program};
use crate::location::Location;
use crate::pipeline::PassStats;
use crate::schedule::align_up;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// A buffer awaiting an offset.
#[derive(Debug, Clone)]
struct Candidate {
    /// Block owning the allocation
    owner: NodeId,
    name: String,
    size: u64,
    location: Location,
    /// Statements of the matched block during which the buffer is live
    users: BTreeSet<NodeId>,
}

fn disjoint_in_time(
    a: &Candidate,
    b: &Candidate,
    before: &BTreeMap<NodeId, BTreeSet<NodeId>>,
) -> bool {
    // a buffer no statement touches is live for the whole block
    if a.users.is_empty() || b.users.is_empty() {
        return false;
    }
    let precedes = |x: &Candidate, y: &Candidate| {
        y.users.iter().all(|u| {
            before
                .get(u)
                .map(|anc| x.users.iter().all(|v| anc.contains(v)))
                .unwrap_or(false)
        })
    };
    precedes(a, b) || precedes(b, a)
}

fn collect(
    prog: &Program,
    id: NodeId,
    pass: &MemoryPlacementPass,
) -> Result<Vec<Candidate>, PassError> {
    let targeted = |loc: &Option<Location>| -> Option<Location> {
        loc.as_ref()
            .filter(|l| pass.locs.iter().any(|sel| l.is_within(sel)))
            .cloned()
    };
    let block = prog.block(id)?;
    let mut out = Vec::new();

    for r in block.refs.iter().filter(|r| r.dir.is_alloc()) {
        if let Some(location) = targeted(&r.location) {
            let mut users = BTreeSet::new();
            for &s in &block.stmts {
                if effects(&prog.node(s)?.stmt).touches(&r.into) {
                    users.insert(s);
                }
            }
            out.push(Candidate {
                owner: id,
                name: r.into.clone(),
                size: r.shape.byte_size(),
                location,
                users,
            });
        }
    }

    for &child in &block.stmts {
        let mut stack = vec![child];
        while let Some(cur) = stack.pop() {
            if let Some(inner) = prog.try_block(cur) {
                for r in inner.refs.iter().filter(|r| r.dir.is_alloc()) {
                    if let Some(location) = targeted(&r.location) {
                        out.push(Candidate {
                            owner: cur,
                            name: r.into.clone(),
                            size: r.shape.byte_size(),
                            location,
                            users: BTreeSet::from([child]),
                        });
                    }
                }
                stack.extend(inner.stmts.iter().copied());
            }
        }
    }
    Ok(out)
}

/// Lowest aligned offset of `size` bytes clear of every `busy` range.
fn lowest_offset(busy: &mut Vec<(u64, u64)>, size: u64, alignment: u64) -> u64 {
    busy.sort_unstable();
    let mut offset = 0;
    for &(start, end) in busy.iter() {
        if offset + size <= start {
            break;
        }
        offset = offset.max(align_up(end, alignment));
    }
    offset
}

fn place_block(
    prog: &mut Program,
    id: NodeId,
    pass: &MemoryPlacementPass,
    hw: &Hardware,
) -> Result<usize, PassError> {
    let candidates = collect(prog, id, pass)?;
    if candidates.is_empty() {
        return Ok(0);
    }
    let block_name = prog.block(id)?.name.clone();
    let stmts = prog.block(id)?.stmts.clone();
    let before = ancestors(prog, &stmts)?;

    let mut groups: BTreeMap<Location, Vec<usize>> = BTreeMap::new();
    for (n, c) in candidates.iter().enumerate() {
        groups.entry(c.location.clone()).or_default().push(n);
    }

    let mut offsets = vec![0u64; candidates.len()];
    for (location, mut members) in groups {
        let capacity = hw.memory_bytes(&location).ok_or_else(|| {
            PassError::unsatisfiable(
                "memory_placement",
                &block_name,
                format!("'{}' is not a memory unit", location),
            )
        })?;
        // largest first, stable on discovery order
        members.sort_by(|&a, &b| candidates[b].size.cmp(&candidates[a].size));
        let mut placed: Vec<usize> = Vec::new();
        for &m in &members {
            let mut busy: Vec<(u64, u64)> = placed
                .iter()
                .filter(|&&p| !disjoint_in_time(&candidates[m], &candidates[p], &before))
                .map(|&p| (offsets[p], offsets[p] + candidates[p].size))
                .collect();
            let offset = lowest_offset(&mut busy, candidates[m].size, pass.alignment);
            if offset + candidates[m].size > capacity {
                return Err(PassError::unsatisfiable(
                    "memory_placement",
                    &block_name,
                    format!(
                        "'{}' ({} bytes) does not fit in {} ({} bytes)",
                        candidates[m].name, candidates[m].size, location, capacity
                    ),
                ));
            }
            debug!(
                "memory_placement: '{}' at {}+{}",
                candidates[m].name, location, offset
            );
            offsets[m] = offset;
            placed.push(m);
        }
    }

    for (c, offset) in candidates.iter().zip(offsets) {
        if let Some(r) = prog.block_mut(c.owner)?.ref_by_name_mut(&c.name) {
            r.offset = Some(offset);
        }
    }
    Ok(candidates.len())
}

pub fn run(
    prog: &mut Program,
    pass: &MemoryPlacementPass,
    hw: &Hardware,
) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        if place_block(prog, id, pass, hw)? > 0 {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::compute_block_deps;
    use crate::ir::{Block, DataType, Operation, Refinement, Stmt, TensorShape};
    use crate::tags;

    fn hw(kib: u64) -> Hardware {
        serde_json::from_str(&format!(
            r#"{{ "memory_units": {{ "SRAM": {{ "size_KiB": {} }} }} }}"#,
            kib
        ))
        .unwrap()
    }

    fn local(name: &str, elems: u64) -> Refinement {
        let mut r = Refinement::alloc(name, TensorShape::dense(DataType::Float32, &[elems]));
        r.location = Some(Location::new("SRAM"));
        r
    }

    fn pass() -> MemoryPlacementPass {
        MemoryPlacementPass {
            reqs: vec!["main".into()],
            locs: vec![Location::new("SRAM")],
            alignment: 64,
        }
    }

    /// a -> b -> c chain over T0, T1, T2 plus an unrelated buffer U used by d.
    fn chain() -> (Program, NodeId) {
        let mut root = Block::new("main");
        root.tags = tags::tag_set(["main"]);
        root.refs = vec![local("T0", 256), local("T1", 100), local("T2", 256), local("U", 16)];
        let mut prog = Program::new(root);
        let id = prog.root();
        prog.push(id, Stmt::Special(Operation::new("a", &[], &["T0"]))).unwrap();
        prog.push(id, Stmt::Special(Operation::new("b", &["T0"], &["T1"]))).unwrap();
        prog.push(id, Stmt::Special(Operation::new("c", &["T1"], &["T2"]))).unwrap();
        prog.push(id, Stmt::Special(Operation::new("d", &[], &["U"]))).unwrap();
        compute_block_deps(&mut prog, id).unwrap();
        (prog, id)
    }

    fn span(prog: &Program, id: NodeId, name: &str) -> (u64, u64) {
        let r = prog.block(id).unwrap().ref_by_name(name).unwrap();
        let off = r.offset.unwrap();
        (off, off + r.shape.byte_size())
    }

    #[test]
    fn test_reuse_follows_dependencies() {
        let (mut prog, id) = chain();
        run(&mut prog, &pass(), &hw(4)).unwrap();
        let t0 = span(&prog, id, "T0");
        let t1 = span(&prog, id, "T1");
        let t2 = span(&prog, id, "T2");
        let u = span(&prog, id, "U");
        // T0 is dead once c runs, so T2 may take its place; T1 overlaps both lifetimes
        assert_eq!(t0.0, 0);
        assert_eq!(t2.0, 0);
        assert!(t1.0 >= t0.1 && t1.0 % 64 == 0);
        // U is unordered against everything
        for other in [t0, t1, t2] {
            assert!(u.0 >= other.1 || u.1 <= other.0);
        }
    }

    #[test]
    fn test_overflow_is_fatal() {
        let (mut prog, id) = chain();
        prog.block_mut(id).unwrap().refs[0] = local("T0", 2048);
        assert!(matches!(
            run(&mut prog, &pass(), &hw(4)),
            Err(PassError::Unsatisfiable { pass: "memory_placement", .. })
        ));
    }

    #[test]
    fn test_child_allocations_conflict_per_statement() {
        let mut root = Block::new("main");
        root.tags = tags::tag_set(["main"]);
        let mut prog = Program::new(root);
        let id = prog.root();
        let mut k1 = Block::new("k1");
        k1.refs = vec![local("x", 64), local("y", 64)];
        let mut k2 = Block::new("k2");
        k2.refs = vec![local("z", 64)];
        let a = prog.push(id, Stmt::Block(k1)).unwrap();
        let b = prog.push(id, Stmt::Block(k2)).unwrap();
        prog.node_mut(b).unwrap().deps.insert(a);

        run(&mut prog, &pass(), &hw(1)).unwrap();
        let x = prog.block(a).unwrap().ref_by_name("x").unwrap().offset.unwrap();
        let y = prog.block(a).unwrap().ref_by_name("y").unwrap().offset.unwrap();
        let z = prog.block(b).unwrap().ref_by_name("z").unwrap().offset.unwrap();
        assert_ne!(x, y);
        assert_eq!(z, 0);
    }

    #[test]
    fn test_untouched_buffer_is_always_live() {
        let (mut prog, id) = chain();
        prog.block_mut(id).unwrap().refs.push(local("idle", 256));
        run(&mut prog, &pass(), &hw(4)).unwrap();
        let idle = span(&prog, id, "idle");
        for name in ["T0", "T1", "T2", "U"] {
            let other = span(&prog, id, name);
            assert!(idle.0 >= other.1 || idle.1 <= other.0, "idle overlaps {}", name);
        }
    }

    #[test]
    fn test_overlapping_lifetimes_get_disjoint_ranges() {
        let mut root = Block::new("main");
        root.tags = tags::tag_set(["main"]);
        root.refs = vec![
            local("A", 64),
            local("B", 32),
            local("C", 64),
            local("D", 16),
            local("E", 64),
            local("F", 8),
        ];
        let mut prog = Program::new(root);
        let id = prog.root();
        let ops: [(&str, &[&str], &[&str]); 6] = [
            ("s0", &[], &["A"]),
            ("s1", &["A"], &["B"]),
            ("s2", &["B"], &["C"]),
            ("s3", &["A", "C"], &["D"]),
            ("s4", &["D"], &["E"]),
            ("s5", &[], &["F"]),
        ];
        for (name, ins, outs) in ops {
            prog.push(id, Stmt::Special(Operation::new(name, ins, outs))).unwrap();
        }
        compute_block_deps(&mut prog, id).unwrap();
        run(&mut prog, &pass(), &hw(4)).unwrap();

        let live_together = [
            ("A", "B"),
            ("A", "C"),
            ("A", "D"),
            ("B", "C"),
            ("C", "D"),
            ("D", "E"),
            ("F", "A"),
            ("F", "B"),
            ("F", "C"),
            ("F", "D"),
            ("F", "E"),
        ];
        for (x, y) in live_together {
            let (a, b) = (span(&prog, id, x), span(&prog, id, y));
            assert!(a.1 <= b.0 || b.1 <= a.0, "{} and {} overlap", x, y);
        }
        // E starts after A's last use, so some space is shared
        let end = ["A", "B", "C", "D", "E", "F"]
            .iter()
            .map(|n| span(&prog, id, n).1)
            .max()
            .unwrap();
        assert!(end < 256 + 128 + 256 + 64 + 256 + 32);
    }
}
