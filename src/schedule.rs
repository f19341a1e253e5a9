//! Residency-bounded list scheduling.
//!
//! The children of a matched block run out of a local memory of fixed size. Each
//! statement needs every buffer it touches to be resident; buffers are placed
//! first-fit, and when nothing fits the least recently used buffer the statement
//! does not need is evicted (spilled first when dirty). Reusing evicted space
//! gates the newcomer on the victim's users through synthetic dependencies, so the
//! residency bound holds in every execution order the dependencies allow.

use crate::cache::{transfer_block, Transfer};
use crate::config::SchedulePass;
use crate::deps::effects;
use crate::error::PassError;
use crate::hardware::Hardware;
use crate::ir::{NodeId, Program, Refinement, Stmt};
use crate::location::Location;
use crate::pipeline::PassStats;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Transfer and residency statistics of a schedule pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub swap_ins: usize,
    pub swap_outs: usize,
    pub synthetic_deps: usize,
    /// Largest number of bytes resident at once
    pub peak_bytes: u64,
}

impl ScheduleReport {
    pub fn merge(&mut self, other: &ScheduleReport) {
        self.swap_ins += other.swap_ins;
        self.swap_outs += other.swap_outs;
        self.synthetic_deps += other.synthetic_deps;
        self.peak_bytes = self.peak_bytes.max(other.peak_bytes);
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    let a = alignment.max(1);
    (value + a - 1) / a * a
}

/// One stay of a buffer in local memory.
#[derive(Debug, Clone)]
struct Residency {
    local: String,
    offset: u64,
    size: u64,
    dirty: bool,
    last_use: usize,
    users: Vec<NodeId>,
    swap_in: Option<NodeId>,
}

fn first_fit(
    resident: &BTreeMap<String, Residency>,
    size: u64,
    budget: u64,
    alignment: u64,
) -> Option<u64> {
    let mut spans: Vec<(u64, u64)> = resident
        .values()
        .map(|r| (r.offset, r.offset + r.size))
        .collect();
    spans.sort_unstable();
    let mut candidate = 0;
    for (start, end) in spans {
        if candidate + size <= start {
            break;
        }
        candidate = candidate.max(align_up(end, alignment));
    }
    if candidate + size <= budget {
        Some(candidate)
    } else {
        None
    }
}

struct BlockScheduler {
    mem_loc: Location,
    xfer_loc: Location,
    budget: u64,
    report: ScheduleReport,
    order: Vec<NodeId>,
    resident: BTreeMap<String, Residency>,
    /// Latest spill of each buffer whose contents live outside
    spilled: BTreeMap<String, NodeId>,
    new_refs: Vec<Refinement>,
    taken: BTreeSet<String>,
}

impl BlockScheduler {
    fn local_name(&mut self, base: &str) -> String {
        let name = (0..)
            .map(|n| format!("{}^{}", base, n))
            .find(|c| !self.taken.contains(c))
            .unwrap_or_else(|| format!("{}^", base));
        self.taken.insert(name.clone());
        name
    }

    fn transfer(
        &mut self,
        prog: &mut Program,
        tag: &'static str,
        src: (&str, &Refinement),
        dst: (&str, &Refinement),
        deps: BTreeSet<NodeId>,
    ) -> Result<NodeId, PassError> {
        let id = transfer_block(
            prog,
            Transfer {
                name: format!("{}_{}", tag, if tag == "swap_in" { src.0 } else { dst.0 }),
                tag,
                src: src.0,
                src_shape: &src.1.shape,
                dst: dst.0,
                dst_shape: &dst.1.shape,
                agg_op: None,
                loc: Some(self.xfer_loc.clone()),
            },
        )?;
        prog.node_mut(id)?.deps = deps;
        self.order.push(id);
        Ok(id)
    }

    fn local_ref(&self, name: &str) -> Option<&Refinement> {
        self.new_refs.iter().find(|r| r.into == name)
    }

    /// Spill `victim` if it is dirty and return what reusing its space must wait for.
    fn evict(
        &mut self,
        prog: &mut Program,
        exterior: &Refinement,
        victim: Residency,
    ) -> Result<BTreeSet<NodeId>, PassError> {
        let mut users: BTreeSet<NodeId> = victim.users.iter().copied().collect();
        users.extend(victim.swap_in);
        if !victim.dirty {
            return Ok(users);
        }
        let local = self
            .local_ref(&victim.local)
            .cloned()
            .ok_or_else(|| PassError::unsatisfiable("schedule", &victim.local, "lost local buffer"))?;
        let out = self.transfer(
            prog,
            "swap_out",
            (victim.local.as_str(), &local),
            (exterior.into.as_str(), exterior),
            users,
        )?;
        self.spilled.insert(exterior.into.clone(), out);
        self.report.swap_outs += 1;
        Ok(BTreeSet::from([out]))
    }

    fn resident_bytes(&self) -> u64 {
        self.resident.values().map(|r| r.size).sum()
    }
}

/// Schedule the children of `id`. Returns `None` when the block is not eligible.
pub fn schedule_block(
    prog: &mut Program,
    id: NodeId,
    pass: &SchedulePass,
    budget: u64,
) -> Result<Option<ScheduleReport>, PassError> {
    let block = prog.block(id)?.clone();
    for &s in &block.stmts {
        if !matches!(prog.node(s)?.stmt, Stmt::Block(_) | Stmt::Special(_)) {
            warn!(
                "schedule: block '{}' has a {} child, skipping",
                block.name,
                prog.node(s)?.stmt.kind_name()
            );
            return Ok(None);
        }
    }
    let (mem_loc, xfer_loc) = match (&pass.mem_loc, &pass.xfer_loc) {
        (Some(m), Some(x)) => (m.clone(), x.clone()),
        _ => {
            return Err(PassError::unsatisfiable(
                "schedule",
                &block.name,
                "memory and transfer locations are required",
            ))
        }
    };
    let size_of = |name: &str| -> u64 {
        block
            .ref_by_name(name)
            .map(|r| align_up(r.shape.byte_size(), pass.alignment))
            .unwrap_or(0)
    };

    let mut uses: HashMap<NodeId, Vec<String>> = HashMap::new();
    let mut writes: HashMap<NodeId, BTreeSet<String>> = HashMap::new();
    for &s in &block.stmts {
        let fx = effects(&prog.node(s)?.stmt);
        let names: Vec<String> = fx
            .names()
            .filter(|n| block.ref_by_name(n).is_some())
            .cloned()
            .collect();
        let need: u64 = names.iter().map(|n| size_of(n)).sum();
        if need > budget {
            return Err(PassError::unsatisfiable(
                "schedule",
                &block.name,
                format!("a statement needs {} bytes, budget is {}", need, budget),
            ));
        }
        uses.insert(s, names);
        writes.insert(s, fx.writes);
    }
    let position: HashMap<NodeId, usize> =
        block.stmts.iter().enumerate().map(|(p, &s)| (s, p)).collect();

    let mut sched = BlockScheduler {
        mem_loc,
        xfer_loc,
        budget,
        report: ScheduleReport::default(),
        order: Vec::new(),
        resident: BTreeMap::new(),
        spilled: BTreeMap::new(),
        new_refs: Vec::new(),
        taken: block.refs.iter().map(|r| r.into.clone()).collect(),
    };
    let mut pending = block.stmts.clone();
    let mut done: BTreeSet<NodeId> = BTreeSet::new();

    for step in 0..block.stmts.len() {
        // ready statement with the most resident bytes, earliest on a tie
        let mut choice: Option<(usize, u64, usize)> = None;
        for (slot, &s) in pending.iter().enumerate() {
            if !prog.node(s)?.deps.iter().all(|d| done.contains(d)) {
                continue;
            }
            let reuse: u64 = uses[&s]
                .iter()
                .filter(|n| sched.resident.contains_key(*n))
                .map(|n| size_of(n))
                .sum();
            let better = match choice {
                None => true,
                Some((_, best, pos)) => reuse > best || (reuse == best && position[&s] < pos),
            };
            if better {
                choice = Some((slot, reuse, position[&s]));
            }
        }
        let slot = choice
            .map(|(slot, _, _)| slot)
            .ok_or_else(|| PassError::unsatisfiable("schedule", &block.name, "dependency cycle"))?;
        let s = pending.remove(slot);
        let needed = uses[&s].clone();
        let original_deps = prog.node(s)?.deps.clone();
        let mut extra_deps = BTreeSet::new();

        // space freed for this statement, reused by any of its placements
        let mut freed = BTreeSet::new();
        let mut queue: VecDeque<String> = needed.iter().cloned().collect();
        while let Some(pending_name) = queue.pop_front() {
            let name = &pending_name;
            if let Some(res) = sched.resident.get(name) {
                extra_deps.extend(res.swap_in);
                continue;
            }
            let exterior = block
                .ref_by_name(name)
                .cloned()
                .ok_or_else(|| PassError::unsatisfiable("schedule", &block.name, "unknown buffer"))?;
            let size = size_of(name);
            let offset = loop {
                if let Some(o) = first_fit(&sched.resident, size, sched.budget, pass.alignment) {
                    break o;
                }
                let victim = sched
                    .resident
                    .iter()
                    .filter(|(n, _)| !needed.contains(n))
                    .min_by_key(|(n, r)| (r.last_use, (*n).clone()))
                    .map(|(n, _)| n.clone());
                let victims = match victim {
                    Some(v) => vec![v],
                    None => {
                        // only this statement's buffers are left and they leave no
                        // gap: spill them all and lay the working set out from 0
                        if sched.resident.is_empty() {
                            return Err(PassError::unsatisfiable(
                                "schedule",
                                &block.name,
                                format!("'{}' does not fit in {} bytes", name, sched.budget),
                            ));
                        }
                        debug!("schedule: compacting working set of statement {}", s);
                        let held: Vec<String> = sched.resident.keys().cloned().collect();
                        queue.extend(held.iter().cloned());
                        held
                    }
                };
                for victim in victims {
                    let res = match sched.resident.remove(&victim) {
                        Some(r) => r,
                        None => continue,
                    };
                    debug!("schedule: evicting '{}' for '{}'", victim, name);
                    let victim_ref = block.ref_by_name(&victim).cloned().ok_or_else(|| {
                        PassError::unsatisfiable("schedule", &block.name, "unknown buffer")
                    })?;
                    freed.extend(sched.evict(prog, &victim_ref, res)?);
                }
            };
            let gates = freed.clone();

            let local_name = sched.local_name(name);
            let mut local = Refinement::alloc(local_name.clone(), exterior.shape.densified());
            local.location = Some(sched.mem_loc.clone());
            local.offset = Some(offset);
            sched.new_refs.push(local.clone());

            let has_data = exterior.dir.is_read() || sched.spilled.contains_key(name);
            let swap_in = if has_data {
                let mut deps = gates.clone();
                deps.extend(sched.spilled.get(name).copied());
                sched.report.synthetic_deps += gates.len();
                let xfer = sched.transfer(
                    prog,
                    "swap_in",
                    (name.as_str(), &exterior),
                    (local_name.as_str(), &local),
                    deps,
                )?;
                sched.report.swap_ins += 1;
                extra_deps.insert(xfer);
                Some(xfer)
            } else {
                sched.report.synthetic_deps += gates.difference(&original_deps).count();
                extra_deps.extend(gates);
                None
            };
            sched.resident.insert(
                name.clone(),
                Residency {
                    local: local_name,
                    offset,
                    size,
                    dirty: false,
                    last_use: step,
                    users: Vec::new(),
                    swap_in,
                },
            );
        }

        let node = prog.node_mut(s)?;
        for name in &needed {
            if let Some(res) = sched.resident.get_mut(name) {
                node.stmt.rename_use(name, &res.local);
                res.last_use = step;
                res.users.push(s);
                if writes[&s].contains(name) {
                    res.dirty = true;
                }
            }
        }
        node.deps.extend(extra_deps);
        sched.report.peak_bytes = sched.report.peak_bytes.max(sched.resident_bytes());
        sched.order.push(s);
        done.insert(s);
    }

    // write back what the block exports
    let leftovers: Vec<(String, Residency)> = std::mem::take(&mut sched.resident).into_iter().collect();
    for (name, res) in leftovers {
        let exterior = match block.ref_by_name(&name) {
            Some(r) if r.dir.is_write() && res.dirty => r.clone(),
            _ => continue,
        };
        sched.evict(prog, &exterior, res)?;
    }

    debug!(
        "schedule: block '{}' peak {} of {} bytes",
        block.name, sched.report.peak_bytes, budget
    );
    let layouts: Vec<(String, Vec<i64>)> = sched
        .new_refs
        .iter()
        .map(|r| (r.into.clone(), r.shape.dims.iter().map(|d| d.stride).collect()))
        .collect();
    let out = prog.block_mut(id)?;
    out.stmts = sched.order;
    out.refs.extend(sched.new_refs);
    // child views of a local keep the exterior layout until restrided
    for (name, strides) in layouts {
        prog.restride(id, &name, &strides)?;
    }
    Ok(Some(sched.report))
}

pub fn run(prog: &mut Program, pass: &SchedulePass, hw: &Hardware) -> Result<PassStats, PassError> {
    let budget = if pass.mem_kib > 0 {
        pass.mem_kib * 1024
    } else {
        pass.mem_loc
            .as_ref()
            .and_then(|loc| hw.memory_bytes(loc))
            .unwrap_or(0)
    };
    let mut stats = PassStats::default();
    let mut report = ScheduleReport::default();
    for id in prog.select(&pass.reqs) {
        stats.matched += 1;
        if let Some(r) = schedule_block(prog, id, pass, budget)? {
            report.merge(&r);
            stats.rewritten += 1;
        }
    }
    stats.schedule = Some(report);
    Ok(stats)
}
