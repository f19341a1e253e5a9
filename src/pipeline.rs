//! Pass driver.
//!
//! The driver runs a validated pass list strictly in order over a working copy of
//! the program. Each pass kind is dispatched through one exhaustive match; the
//! transformed tree replaces the caller's only after every pass succeeded.
//!
//! # Usage
//!
//! ```no_run
//! use stripeopt::config::Config;
//! use stripeopt::ir::Program;
//! use stripeopt::pipeline::Pipeline;
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("accel.json"))?;
//! let mut program = Program::load(Path::new("kernel.json"))?;
//! let report = Pipeline::from_config(&config)?.run(&mut program)?;
//! println!("{}", report);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::{Config, Pass, PassKind};
use crate::error::{ConfigError, PassError, PipelineError};
use crate::hardware::Hardware;
use crate::ir::Program;
use crate::schedule::ScheduleReport;
use crate::{
    autotile, cache, deps, fusion, localize, locate, partition, placement, prune, scalarize,
    schedule, stencil, thread, transpose, unroll,
};
use log::{debug, info};
use std::fmt;

// ============================================================================
// Reports
// ============================================================================

/// What a single pass invocation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassStats {
    /// Nodes selected by the pass predicate
    pub matched: usize,
    /// Nodes actually rewritten
    pub rewritten: usize,
    /// Residency statistics, for schedule passes
    pub schedule: Option<ScheduleReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub name: String,
    pub kind: &'static str,
    pub stats: PassStats,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub passes: Vec<PassReport>,
}

impl PipelineReport {
    pub fn total_rewritten(&self) -> usize {
        self.passes.iter().map(|p| p.stats.rewritten).sum()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<4} {:<24} {:<20} {:>8} {:>10}", "#", "pass", "kind", "matched", "rewritten")?;
        for (i, p) in self.passes.iter().enumerate() {
            writeln!(
                f,
                "{:<4} {:<24} {:<20} {:>8} {:>10}",
                i, p.name, p.kind, p.stats.matched, p.stats.rewritten
            )?;
            if let Some(s) = &p.stats.schedule {
                writeln!(
                    f,
                    "     swap_in={} swap_out={} synthetic_deps={} peak_bytes={}",
                    s.swap_ins, s.swap_outs, s.synthetic_deps, s.peak_bytes
                )?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Iteration bound for fixpoint passes. `None` derives one from the program:
    /// `(refinements + 1) * (statements + 1)`.
    pub fixpoint_limit: Option<usize>,
}

/// Failure of one pass, before it is attributed to a position in the list.
enum Failure {
    Pass(PassError),
    Fixpoint(usize),
}

impl From<PassError> for Failure {
    fn from(err: PassError) -> Self {
        Failure::Pass(err)
    }
}

/// Run `step` until it reports no change, at most `limit` times.
fn run_to_fixpoint(
    limit: usize,
    mut step: impl FnMut() -> Result<bool, PassError>,
) -> Result<usize, Failure> {
    let mut rounds = 0;
    while step()? {
        rounds += 1;
        if rounds >= limit {
            return Err(Failure::Fixpoint(limit));
        }
    }
    Ok(rounds)
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    hardware: Hardware,
    passes: Vec<Pass>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(hardware: Hardware, passes: Vec<Pass>) -> Self {
        Pipeline {
            hardware,
            passes,
            options: PipelineOptions::default(),
        }
    }

    /// Validate `config` and build a driver for it.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Pipeline::new(config.hardware.clone(), config.passes()?))
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hardware
    }

    /// Run every pass in order. On failure `prog` is left untouched.
    pub fn run(&self, prog: &mut Program) -> Result<PipelineReport, PipelineError> {
        prog.validate()?;
        let mut work = prog.clone();
        let limit = self
            .options
            .fixpoint_limit
            .unwrap_or_else(|| (work.ref_count() + 1) * (work.len() + 1))
            .max(1);

        let mut report = PipelineReport::default();
        for (index, pass) in self.passes.iter().enumerate() {
            debug!("pass #{} '{}' ({}) starting", index, pass.name, pass.kind.label());
            let stats = match self.run_pass(&mut work, pass, limit) {
                Ok(stats) => stats,
                Err(Failure::Pass(source)) => {
                    return Err(PipelineError::Pass {
                        index,
                        name: pass.name.clone(),
                        source,
                    })
                }
                Err(Failure::Fixpoint(limit)) => {
                    return Err(PipelineError::FixpointLimit {
                        pass: pass.name.clone(),
                        limit,
                    })
                }
            };
            work.validate().map_err(|e| PipelineError::Pass {
                index,
                name: pass.name.clone(),
                source: e.into(),
            })?;
            info!(
                "pass '{}' ({}): matched {}, rewrote {}",
                pass.name,
                pass.kind.label(),
                stats.matched,
                stats.rewritten
            );
            report.passes.push(PassReport {
                name: pass.name.clone(),
                kind: pass.kind.label(),
                stats,
            });
        }

        *prog = work;
        Ok(report)
    }

    fn run_pass(&self, prog: &mut Program, pass: &Pass, limit: usize) -> Result<PassStats, Failure> {
        let stats = match &pass.kind {
            PassKind::Cache(p) => cache::run(prog, p)?,
            PassKind::ComputeDeps(p) => deps::run(prog, p)?,
            PassKind::Fusion(p) => fusion::run(prog, p)?,
            PassKind::Localize(p) => {
                let mut localizer = localize::Localizer::new(p);
                let rounds = run_to_fixpoint(limit, || localizer.sweep(prog))?;
                debug!("localize settled after {} rounds", rounds);
                localizer.stats()
            }
            PassKind::LocateBlock(p) => locate::locate_block(prog, p)?,
            PassKind::LocateInnerBlock(p) => locate::locate_inner_block(prog, p)?,
            PassKind::LocateMemory(p) => locate::locate_memory(prog, p)?,
            PassKind::MemoryPlacement(p) => placement::run(prog, p, &self.hardware)?,
            PassKind::Scalarize(p) => scalarize::run(prog, p)?,
            PassKind::Stencil(p) => stencil::run(prog, p, &self.hardware)?,
            PassKind::Autotile(p) => autotile::run(prog, p)?,
            PassKind::Schedule(p) => schedule::run(prog, p, &self.hardware)?,
            PassKind::Transpose(p) => transpose::run(prog, p)?,
            PassKind::PartitionCompute(p) => partition::partition_compute(prog, p)?,
            PassKind::PartitionMemory(p) => partition::partition_memory(prog, p)?,
            PassKind::Unroll(p) => unroll::run(prog, p)?,
            PassKind::PruneIndexes(p) => prune::prune_idxs(prog, p)?,
            PassKind::PruneRefinements(p) => prune::prune_refs(prog, p)?,
            PassKind::ThreadInner(p) => thread::run(prog, p)?,
        };
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocateBlockPass, PassEntry};
    use crate::ir::{Block, Stmt};
    use crate::location::Location;
    use crate::tags::tag_set;

    fn program() -> Program {
        let mut prog = Program::new(Block::new("main"));
        let mut k = Block::new("k");
        k.tags = tag_set(["kernel"]);
        prog.push(prog.root(), Stmt::Block(k)).unwrap();
        prog
    }

    fn hardware() -> Hardware {
        serde_json::from_str(r#"{ "execution_units": { "MAC": {} } }"#).unwrap()
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let mut prog = program();
        let before = prog.clone();
        let report = Pipeline::new(hardware(), Vec::new()).run(&mut prog).unwrap();
        assert!(report.passes.is_empty());
        assert_eq!(prog, before);
    }

    #[test]
    fn test_passes_run_in_order() {
        let mut prog = program();
        let passes = vec![
            Pass {
                name: "first".into(),
                kind: PassKind::LocateBlock(LocateBlockPass {
                    reqs: vec!["kernel".into()],
                    loc: Some(Location::new("MAC")),
                }),
            },
            Pass {
                name: "nomatch".into(),
                kind: PassKind::LocateBlock(LocateBlockPass {
                    reqs: vec!["absent".into()],
                    loc: Some(Location::new("MAC")),
                }),
            },
        ];
        let report = Pipeline::new(hardware(), passes).run(&mut prog).unwrap();
        assert_eq!(report.passes.len(), 2);
        assert_eq!(report.passes[0].stats.matched, 1);
        assert_eq!(report.passes[1].stats, PassStats::default());
        let k = prog.select(&["kernel".to_string()])[0];
        assert_eq!(prog.block(k).unwrap().location, Some(Location::new("MAC")));
    }

    #[test]
    fn test_bad_config_never_starts() {
        let config = Config {
            hardware: hardware(),
            passes: vec![PassEntry {
                name: "broken".into(),
                ..PassEntry::default()
            }],
        };
        assert!(matches!(
            Pipeline::from_config(&config),
            Err(ConfigError::PassKind { found: 0, .. })
        ));
    }

    #[test]
    fn test_fixpoint_bound() {
        let mut calls = 0;
        let result = run_to_fixpoint(5, || {
            calls += 1;
            Ok(true)
        });
        assert!(matches!(result, Err(Failure::Fixpoint(5))));
        assert_eq!(calls, 5);

        let mut remaining = 3;
        let rounds = run_to_fixpoint(10, || {
            remaining -= 1;
            Ok(remaining > 0)
        });
        assert!(matches!(rounds, Ok(2)));
    }
}
