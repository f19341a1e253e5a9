//! Tile-size search.
//!
//! Every index may be tiled by a divisor of its range (or a power-of-two divisor).
//! A candidate is admissible when the bytes its tile touches respect every active
//! `max_*` limit; its cost is the number of transfer lines the tile loads and
//! stores, weighted by the input/output multipliers, per unit of compute volume.
//! Exhaustive search keeps the cheapest candidate; fast search hill-climbs from
//! the all-ones tile and stops at the first local optimum.

use crate::config::AutotilePass;
use crate::error::PassError;
use crate::ir::{Block, NodeId, Program, Refinement};
use crate::pipeline::PassStats;
use crate::tags;
use crate::tile::{apply_tile, tile_extents};
use log::debug;
use std::collections::BTreeMap;

const EPSILON: f64 = 1e-9;

/// Measurements of one candidate tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileEval {
    pub feasible: bool,
    pub cost: f64,
    /// Product of the tile sizes
    pub volume: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub total_bytes: u64,
}

impl TileEval {
    /// Strictly preferable: cheaper, or as cheap with more work per tile.
    fn beats(&self, other: &TileEval) -> bool {
        if self.cost < other.cost - EPSILON {
            return true;
        }
        (self.cost - other.cost).abs() <= EPSILON && self.volume > other.volume
    }
}

/// Admissible tile sizes for an index of `range`, ascending.
pub fn candidates(range: u64, only_po2: bool) -> Vec<u64> {
    let range = range.max(1);
    let mut out = Vec::new();
    let mut d = 1u64;
    while d <= range / d {
        if range % d == 0 {
            out.push(d);
            if d != range / d {
                out.push(range / d);
            }
        }
        d += 1;
    }
    out.retain(|t| !only_po2 || t.is_power_of_two());
    out.sort_unstable();
    out
}

fn product(values: &[u64]) -> u64 {
    values.iter().fold(1u64, |acc, &v| acc.saturating_mul(v))
}

fn transfer_lines(r: &Refinement, extents: &[u64], cache_width: u64) -> u64 {
    let elem = r.shape.dtype.size_bytes();
    match (cache_width, r.shape.contiguous_dim()) {
        (0, _) | (_, None) => product(extents),
        (cw, Some(c)) => extents
            .iter()
            .enumerate()
            .map(|(d, &e)| if d == c { e.saturating_mul(elem).div_ceil(cw) } else { e })
            .fold(1u64, |acc, v| acc.saturating_mul(v)),
    }
}

/// Measure `tile` (one entry per index of `block`) against `pass`'s limits.
pub fn evaluate(block: &Block, tile: &[u64], pass: &AutotilePass) -> TileEval {
    let sizes: BTreeMap<String, u64> = block
        .idxs
        .iter()
        .zip(tile)
        .map(|(i, &t)| (i.name.clone(), t))
        .collect();
    let volume = product(tile);

    let (mut input_bytes, mut output_bytes, mut total_bytes) = (0, 0, 0);
    let (mut in_lines, mut out_lines) = (0u64, 0u64);
    for r in block.refs.iter().filter(|r| !r.dir.is_alloc()) {
        let extents = tile_extents(r, &sizes);
        let bytes = product(&extents).saturating_mul(r.shape.dtype.size_bytes());
        let lines = transfer_lines(r, &extents, pass.cache_width);
        total_bytes = bytes.saturating_add(total_bytes);
        if r.dir.is_read() {
            input_bytes = bytes.saturating_add(input_bytes);
            in_lines = lines.saturating_add(in_lines);
        }
        if r.dir.is_write() {
            output_bytes = bytes.saturating_add(output_bytes);
            out_lines = lines.saturating_add(out_lines);
        }
    }

    let within = |limit: u64, value: u64| limit == 0 || value <= limit;
    let feasible = within(pass.max_input_size, input_bytes)
        && within(pass.max_output_size, output_bytes)
        && within(pass.max_total_size, total_bytes)
        && within(pass.max_sizes_product, volume);
    let cost = (pass.input_cost * in_lines as f64 + pass.output_cost * out_lines as f64)
        / volume.max(1) as f64;

    TileEval {
        feasible,
        cost,
        volume,
        input_bytes,
        output_bytes,
        total_bytes,
    }
}

fn option_lists(block: &Block, pass: &AutotilePass) -> Vec<Vec<u64>> {
    block
        .idxs
        .iter()
        .map(|i| {
            if i.is_passthrough() {
                vec![1]
            } else {
                candidates(i.range, pass.only_po2)
            }
        })
        .collect()
}

fn exhaustive(block: &Block, pass: &AutotilePass, options: &[Vec<u64>]) -> Option<(Vec<u64>, TileEval)> {
    let mut best: Option<(Vec<u64>, TileEval)> = None;
    let mut pos = vec![0usize; options.len()];
    loop {
        let tile: Vec<u64> = pos.iter().zip(options).map(|(&p, o)| o[p]).collect();
        let eval = evaluate(block, &tile, pass);
        if eval.feasible && best.as_ref().map(|(_, b)| eval.beats(b)).unwrap_or(true) {
            best = Some((tile, eval));
        }
        // odometer, last index fastest
        let mut d = options.len();
        loop {
            if d == 0 {
                return best;
            }
            d -= 1;
            pos[d] += 1;
            if pos[d] < options[d].len() {
                break;
            }
            pos[d] = 0;
        }
    }
}

fn hill_climb(block: &Block, pass: &AutotilePass, options: &[Vec<u64>]) -> Option<(Vec<u64>, TileEval)> {
    let mut pos = vec![0usize; options.len()];
    let start: Vec<u64> = pos.iter().zip(options).map(|(&p, o)| o[p]).collect();
    let mut current = evaluate(block, &start, pass);
    if !current.feasible {
        return None;
    }
    loop {
        let mut step: Option<(Vec<usize>, TileEval)> = None;
        for d in 0..options.len() {
            let moves = [pos[d].checked_add(1), pos[d].checked_sub(1)];
            for next in moves.iter().flatten().copied() {
                if next >= options[d].len() {
                    continue;
                }
                let mut cand = pos.clone();
                cand[d] = next;
                let tile: Vec<u64> = cand.iter().zip(options).map(|(&p, o)| o[p]).collect();
                let eval = evaluate(block, &tile, pass);
                if !eval.feasible || !eval.beats(&current) {
                    continue;
                }
                if step.as_ref().map(|(_, s)| eval.beats(s)).unwrap_or(true) {
                    step = Some((cand, eval));
                }
            }
        }
        match step {
            Some((next, eval)) => {
                pos = next;
                current = eval;
            }
            None => break,
        }
    }
    let tile = pos.iter().zip(options).map(|(&p, o)| o[p]).collect();
    Some((tile, current))
}

/// Best admissible tile for `block`, or `None` when no candidate fits the limits.
pub fn search(block: &Block, pass: &AutotilePass) -> Option<(Vec<u64>, TileEval)> {
    let options = option_lists(block, pass);
    if pass.fast {
        hill_climb(block, pass, &options)
    } else {
        exhaustive(block, pass, &options)
    }
}

fn is_trivial(block: &Block, tile: &[u64]) -> bool {
    let all_ones = tile.iter().all(|&t| t == 1);
    let whole = block
        .idxs
        .iter()
        .zip(tile)
        .all(|(i, &t)| i.is_passthrough() || t == i.range);
    all_ones || whole
}

fn autotile_block(prog: &mut Program, id: NodeId, pass: &AutotilePass) -> Result<bool, PassError> {
    let block = prog.block(id)?.clone();
    if pass.skip_1d && block.real_idxs().count() <= 1 {
        debug!("autotile: skipping 1-D block '{}'", block.name);
        return Ok(false);
    }
    let (tile, eval) = search(&block, pass).ok_or_else(|| {
        PassError::unsatisfiable("autotile", &block.name, "no tile size satisfies the size limits")
    })?;
    debug!(
        "autotile: block '{}' tile {:?} cost {:.6} ({} bytes)",
        block.name, tile, eval.cost, eval.total_bytes
    );
    if pass.elide_trivial && is_trivial(&block, &tile) {
        debug!("autotile: eliding trivial split of '{}'", block.name);
        return Ok(false);
    }

    let inner = apply_tile(prog, id, &tile)?;
    let mut inner_tags = tags::tag_set(pass.inner_set.iter().cloned());
    if pass.copy_tags {
        inner_tags.extend(block.tags.iter().cloned());
    }
    prog.block_mut(inner)?.tags = inner_tags;

    let outer = prog.block_mut(id)?;
    if pass.clear_outer {
        outer.tags.clear();
    }
    tags::add_tags(&mut outer.tags, &pass.outer_set);
    if pass.clear_location {
        outer.location = None;
    }
    Ok(true)
}

pub fn run(prog: &mut Program, pass: &AutotilePass) -> Result<PassStats, PassError> {
    let mut stats = PassStats::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        if autotile_block(prog, id, pass)? {
            stats.rewritten += 1;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::Affine;
    use crate::ir::{DataType, Index, Operation, RefDir, Stmt, TensorDim, TensorShape};

    fn view(dir: RefDir, name: &str, access: Vec<Affine>, strides: &[i64]) -> Refinement {
        let shape = TensorShape {
            dtype: DataType::Float32,
            dims: strides.iter().map(|&stride| TensorDim { size: 1, stride }).collect(),
        };
        Refinement::new(dir, name, name, access, shape)
    }

    fn outer_product(n: u64) -> Block {
        let mut b = Block::new("op");
        b.tags = tags::tag_set(["contraction"]);
        b.idxs = vec![Index::new("i", n), Index::new("j", n)];
        b.refs = vec![
            view(RefDir::In, "A", vec![Affine::index("i")], &[1]),
            view(RefDir::In, "B", vec![Affine::index("j")], &[1]),
            view(
                RefDir::Out,
                "C",
                vec![Affine::index("i"), Affine::index("j")],
                &[n as i64, 1],
            ),
        ];
        b
    }

    fn limited(fast: bool) -> AutotilePass {
        AutotilePass {
            reqs: vec!["contraction".into()],
            outer_set: vec!["outer".into()],
            inner_set: vec!["inner".into()],
            only_po2: true,
            fast,
            max_total_size: 8192,
            ..AutotilePass::default()
        }
    }

    #[test]
    fn test_candidates() {
        assert_eq!(candidates(12, false), vec![1, 2, 3, 4, 6, 12]);
        assert_eq!(candidates(12, true), vec![1, 2, 4]);
        assert_eq!(candidates(1, true), vec![1]);
        assert_eq!(candidates(36, false), vec![1, 2, 3, 4, 6, 9, 12, 18, 36]);
        let wide = candidates(1 << 40, true);
        assert_eq!(wide.len(), 41);
        assert_eq!(wide.last(), Some(&(1 << 40)));
    }

    #[test]
    fn test_huge_ranges_saturate() {
        let b = outer_product(1 << 40);
        let e = evaluate(&b, &[1 << 40, 1 << 40], &limited(false));
        assert_eq!(e.volume, u64::MAX);
        assert!(!e.feasible);
        assert_eq!(e.total_bytes, u64::MAX);
    }

    #[test]
    fn test_fast_search_stops_at_local_optimum() {
        // one line holds 16 floats: 16 and 48 tie on cost, 24 needs two lines
        let mut b = Block::new("row");
        b.idxs = vec![Index::new("i", 48)];
        b.refs = vec![view(RefDir::In, "A", vec![Affine::index("i")], &[1])];
        let pass = AutotilePass {
            cache_width: 64,
            ..AutotilePass::default()
        };
        let (best, _) = search(&b, &pass).unwrap();
        assert_eq!(best, vec![48]);
        let fast = AutotilePass { fast: true, ..pass };
        let (local, eval) = search(&b, &fast).unwrap();
        assert_eq!(local, vec![16]);
        assert!((eval.cost - 1.0 / 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_bytes_and_cost() {
        let b = outer_product(64);
        let e = evaluate(&b, &[32, 32], &limited(false));
        assert_eq!(e.input_bytes, 2 * 32 * 4);
        assert_eq!(e.output_bytes, 32 * 32 * 4);
        assert_eq!(e.total_bytes, 4096 + 256);
        assert!(e.feasible);
        assert!((e.cost - (64.0 + 1024.0) / 1024.0).abs() < 1e-12);
        assert!(!evaluate(&b, &[64, 32], &limited(false)).feasible);
    }

    #[test]
    fn test_cache_width_groups_contiguous_elements() {
        let b = outer_product(64);
        let pass = AutotilePass {
            cache_width: 64,
            ..AutotilePass::default()
        };
        let e = evaluate(&b, &[16, 16], &pass);
        // A, B: 16 floats = one line each; C: 16 rows of one line
        assert!((e.cost - (2.0 + 16.0) / 256.0).abs() < 1e-12);
    }

    #[test]
    fn test_exhaustive_is_optimal() {
        let b = outer_product(64);
        let pass = limited(false);
        let (tile, best) = search(&b, &pass).unwrap();
        assert_eq!(tile, vec![32, 32]);
        for a in candidates(64, true) {
            for c in candidates(64, true) {
                let e = evaluate(&b, &[a, c], &pass);
                if e.feasible {
                    assert!(best.cost <= e.cost + EPSILON);
                }
            }
        }
    }

    #[test]
    fn test_fast_search_reaches_same_tile() {
        let b = outer_product(64);
        let (tile, _) = search(&b, &limited(true)).unwrap();
        assert_eq!(tile, vec![32, 32]);
    }

    #[test]
    fn test_rewrite_and_tags() {
        let mut prog = Program::new(Block::new("main"));
        let id = prog.push(prog.root(), Stmt::Block(outer_product(64))).unwrap();
        prog.push(id, Stmt::Intrinsic(Operation::new("mul", &["A", "B"], &["C"])))
            .unwrap();
        let stats = run(&mut prog, &limited(false)).unwrap();
        assert_eq!(stats.rewritten, 1);

        let outer = prog.block(id).unwrap();
        assert_eq!(outer.idxs.iter().map(|i| i.range).collect::<Vec<_>>(), vec![2, 2]);
        assert!(outer.tags.contains("outer") && outer.tags.contains("contraction"));
        let inner = prog.block(outer.stmts[0]).unwrap();
        assert_eq!(inner.idxs.iter().map(|i| i.range).collect::<Vec<_>>(), vec![32, 32]);
        assert_eq!(inner.tags, tags::tag_set(["inner"]));
    }

    #[test]
    fn test_infeasible_and_trivial() {
        let mut prog = Program::new(Block::new("main"));
        prog.push(prog.root(), Stmt::Block(outer_product(64))).unwrap();
        let tight = AutotilePass {
            max_total_size: 4,
            ..limited(false)
        };
        assert!(matches!(
            run(&mut prog.clone(), &tight),
            Err(PassError::Unsatisfiable { pass: "autotile", .. })
        ));

        let roomy = AutotilePass {
            max_total_size: 0,
            elide_trivial: true,
            ..limited(false)
        };
        let before = prog.clone();
        let stats = run(&mut prog, &roomy).unwrap();
        assert_eq!((stats.matched, stats.rewritten), (1, 0));
        assert_eq!(prog, before);
    }
}
