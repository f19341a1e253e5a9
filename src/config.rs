//! Pipeline configuration record.
//!
//! A configuration is the hardware description plus an ordered list of pass
//! entries. Each entry names exactly one pass kind; [`Config::passes`] converts the
//! raw entries into the closed [`PassKind`] sum type and checks every location and
//! numeric field against the hardware before anything runs.

use crate::error::ConfigError;
use crate::hardware::{Hardware, Stencil, UnitClass};
use crate::ir::RefDir;
use crate::location::Location;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// Pass records
// ============================================================================

/// Wrap selected refinements in a nearer-memory buffer with transfers in and out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePass {
    pub reqs: Vec<String>,
    /// Tags a refinement must carry to be cached
    pub ref_reqs: Vec<String>,
    /// Directions to cache
    pub dirs: Vec<RefDir>,
    pub mem_loc: Option<Location>,
    pub xfer_loc: Option<Location>,
}

impl Default for CachePass {
    fn default() -> Self {
        CachePass {
            reqs: Vec::new(),
            ref_reqs: Vec::new(),
            dirs: vec![RefDir::In, RefDir::Out, RefDir::InOut],
            mem_loc: None,
            xfer_loc: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeDepsPass {
    pub reqs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionPass {
    pub parent_reqs: Vec<String>,
    pub a_reqs: Vec<String>,
    pub b_reqs: Vec<String>,
    /// Tags put on the fused block
    pub fused_set: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizePass {
    pub reqs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocateBlockPass {
    pub reqs: Vec<String>,
    pub loc: Option<Location>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocateInnerBlockPass {
    pub reqs: Vec<String>,
    /// Tags the direct children must carry
    pub inner_reqs: Vec<String>,
    pub loc: Option<Location>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocateMemoryPass {
    pub reqs: Vec<String>,
    pub loc: Option<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPlacementPass {
    pub reqs: Vec<String>,
    /// Memory locations whose buffers get offsets
    pub locs: Vec<Location>,
    pub alignment: u64,
}

impl Default for MemoryPlacementPass {
    fn default() -> Self {
        MemoryPlacementPass {
            reqs: Vec::new(),
            locs: Vec::new(),
            alignment: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalarizePass {
    pub reqs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StencilPass {
    pub reqs: Vec<String>,
    pub outer_set: Vec<String>,
    pub inner_set: Vec<String>,
    /// Candidate shapes; empty means every stencil of the execution units
    pub stencils: Vec<Stencil>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotilePass {
    pub reqs: Vec<String>,
    pub outer_set: Vec<String>,
    pub inner_set: Vec<String>,
    pub only_po2: bool,
    /// Hill-climb instead of searching every candidate
    pub fast: bool,
    pub skip_1d: bool,
    pub max_output_size: u64,
    pub max_input_size: u64,
    pub max_total_size: u64,
    pub max_sizes_product: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    /// Bytes per transfer line; 0 counts every element separately
    pub cache_width: u64,
    pub elide_trivial: bool,
    pub copy_tags: bool,
    pub clear_outer: bool,
    pub clear_location: bool,
}

impl Default for AutotilePass {
    fn default() -> Self {
        AutotilePass {
            reqs: Vec::new(),
            outer_set: Vec::new(),
            inner_set: Vec::new(),
            only_po2: false,
            fast: false,
            skip_1d: false,
            max_output_size: 0,
            max_input_size: 0,
            max_total_size: 0,
            max_sizes_product: 0,
            input_cost: 1.0,
            output_cost: 1.0,
            cache_width: 0,
            elide_trivial: false,
            copy_tags: false,
            clear_outer: false,
            clear_location: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulePass {
    pub reqs: Vec<String>,
    pub mem_loc: Option<Location>,
    /// Residency budget; 0 means the capacity of `mem_loc`
    #[serde(rename = "mem_KiB")]
    pub mem_kib: u64,
    pub alignment: u64,
    pub xfer_loc: Option<Location>,
}

impl Default for SchedulePass {
    fn default() -> Self {
        SchedulePass {
            reqs: Vec::new(),
            mem_loc: None,
            mem_kib: 0,
            alignment: 16,
            xfer_loc: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransposePass {
    pub reqs: Vec<String>,
    /// Tags an allocating block must carry for its buffer to be reordered
    pub alloc_reqs: Vec<String>,
}

/// Shared by `partition_compute` and `partition_memory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionPass {
    pub reqs: Vec<String>,
    pub num_parts: u64,
    /// Tag put on the outer block
    pub set_tag: Option<String>,
    /// Tag put on the index that was split
    pub idx_tag: Option<String>,
}

impl Default for PartitionPass {
    fn default() -> Self {
        PartitionPass {
            reqs: Vec::new(),
            num_parts: 1,
            set_tag: None,
            idx_tag: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnrollPass {
    pub reqs: Vec<String>,
    /// Only unroll the index carrying this tag; every index when unset
    pub expand_idx: Option<String>,
    /// Base name of the copies; the block name when unset
    pub part_name: Option<String>,
    /// Give each copy its own refinement names
    pub make_views: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneIndexesPass {
    pub reqs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneRefinementsPass {
    pub reqs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadInnerPass {
    pub reqs: Vec<String>,
    pub threads: u64,
    pub thread_tag: String,
}

impl Default for ThreadInnerPass {
    fn default() -> Self {
        ThreadInnerPass {
            reqs: Vec::new(),
            threads: 1,
            thread_tag: "thread".to_string(),
        }
    }
}

// ============================================================================
// Pass entries
// ============================================================================

/// A pass entry as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_deps: Option<ComputeDepsPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusion: Option<FusionPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localize: Option<LocalizePass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locate_block: Option<LocateBlockPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locate_inner_block: Option<LocateInnerBlockPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locate_memory: Option<LocateMemoryPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_placement: Option<MemoryPlacementPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scalarize: Option<ScalarizePass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stencil: Option<StencilPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autotile: Option<AutotilePass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SchedulePass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transpose: Option<TransposePass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_compute: Option<PartitionPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_memory: Option<PartitionPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unroll: Option<UnrollPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_idxs: Option<PruneIndexesPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_refs: Option<PruneRefinementsPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_inner: Option<ThreadInnerPass>,
}

/// The one active payload of a pass entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PassKind {
    Cache(CachePass),
    ComputeDeps(ComputeDepsPass),
    Fusion(FusionPass),
    Localize(LocalizePass),
    LocateBlock(LocateBlockPass),
    LocateInnerBlock(LocateInnerBlockPass),
    LocateMemory(LocateMemoryPass),
    MemoryPlacement(MemoryPlacementPass),
    Scalarize(ScalarizePass),
    Stencil(StencilPass),
    Autotile(AutotilePass),
    Schedule(SchedulePass),
    Transpose(TransposePass),
    PartitionCompute(PartitionPass),
    PartitionMemory(PartitionPass),
    Unroll(UnrollPass),
    PruneIndexes(PruneIndexesPass),
    PruneRefinements(PruneRefinementsPass),
    ThreadInner(ThreadInnerPass),
}

impl PassKind {
    /// Configuration key of this kind.
    pub fn label(&self) -> &'static str {
        match self {
            PassKind::Cache(_) => "cache",
            PassKind::ComputeDeps(_) => "compute_deps",
            PassKind::Fusion(_) => "fusion",
            PassKind::Localize(_) => "localize",
            PassKind::LocateBlock(_) => "locate_block",
            PassKind::LocateInnerBlock(_) => "locate_inner_block",
            PassKind::LocateMemory(_) => "locate_memory",
            PassKind::MemoryPlacement(_) => "memory_placement",
            PassKind::Scalarize(_) => "scalarize",
            PassKind::Stencil(_) => "stencil",
            PassKind::Autotile(_) => "autotile",
            PassKind::Schedule(_) => "schedule",
            PassKind::Transpose(_) => "transpose",
            PassKind::PartitionCompute(_) => "partition_compute",
            PassKind::PartitionMemory(_) => "partition_memory",
            PassKind::Unroll(_) => "unroll",
            PassKind::PruneIndexes(_) => "prune_idxs",
            PassKind::PruneRefinements(_) => "prune_refs",
            PassKind::ThreadInner(_) => "thread_inner",
        }
    }
}

/// A validated pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    pub name: String,
    pub kind: PassKind,
}

impl PassEntry {
    /// Extract the single active payload.
    pub fn kind(&self) -> Result<PassKind, ConfigError> {
        let mut kinds = Vec::new();
        if let Some(p) = &self.cache {
            kinds.push(PassKind::Cache(p.clone()));
        }
        if let Some(p) = &self.compute_deps {
            kinds.push(PassKind::ComputeDeps(p.clone()));
        }
        if let Some(p) = &self.fusion {
            kinds.push(PassKind::Fusion(p.clone()));
        }
        if let Some(p) = &self.localize {
            kinds.push(PassKind::Localize(p.clone()));
        }
        if let Some(p) = &self.locate_block {
            kinds.push(PassKind::LocateBlock(p.clone()));
        }
        if let Some(p) = &self.locate_inner_block {
            kinds.push(PassKind::LocateInnerBlock(p.clone()));
        }
        if let Some(p) = &self.locate_memory {
            kinds.push(PassKind::LocateMemory(p.clone()));
        }
        if let Some(p) = &self.memory_placement {
            kinds.push(PassKind::MemoryPlacement(p.clone()));
        }
        if let Some(p) = &self.scalarize {
            kinds.push(PassKind::Scalarize(p.clone()));
        }
        if let Some(p) = &self.stencil {
            kinds.push(PassKind::Stencil(p.clone()));
        }
        if let Some(p) = &self.autotile {
            kinds.push(PassKind::Autotile(p.clone()));
        }
        if let Some(p) = &self.schedule {
            kinds.push(PassKind::Schedule(p.clone()));
        }
        if let Some(p) = &self.transpose {
            kinds.push(PassKind::Transpose(p.clone()));
        }
        if let Some(p) = &self.partition_compute {
            kinds.push(PassKind::PartitionCompute(p.clone()));
        }
        if let Some(p) = &self.partition_memory {
            kinds.push(PassKind::PartitionMemory(p.clone()));
        }
        if let Some(p) = &self.unroll {
            kinds.push(PassKind::Unroll(p.clone()));
        }
        if let Some(p) = &self.prune_idxs {
            kinds.push(PassKind::PruneIndexes(p.clone()));
        }
        if let Some(p) = &self.prune_refs {
            kinds.push(PassKind::PruneRefinements(p.clone()));
        }
        if let Some(p) = &self.thread_inner {
            kinds.push(PassKind::ThreadInner(p.clone()));
        }

        if kinds.len() != 1 {
            return Err(ConfigError::PassKind {
                name: self.name.clone(),
                found: kinds.len(),
            });
        }
        Ok(kinds.remove(0))
    }
}

// ============================================================================
// Validation
// ============================================================================

fn invalid(pass: &str, field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        pass: pass.to_string(),
        field,
        reason: reason.into(),
    }
}

fn check_opt(
    hw: &Hardware,
    pass: &str,
    loc: &Option<Location>,
    class: Option<UnitClass>,
) -> Result<(), ConfigError> {
    match loc {
        Some(loc) => hw.check_location(pass, loc, class),
        None => Ok(()),
    }
}

fn require(
    hw: &Hardware,
    pass: &str,
    field: &'static str,
    loc: &Option<Location>,
    class: UnitClass,
) -> Result<(), ConfigError> {
    match loc {
        Some(loc) => hw.check_location(pass, loc, Some(class)),
        None => Err(invalid(pass, field, "a location is required")),
    }
}

fn check_cost(pass: &str, field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(pass, field, format!("{} is not a non-negative cost", value)))
    }
}

impl Pass {
    /// Check this pass's fields against the hardware description.
    pub fn validate(&self, hw: &Hardware) -> Result<(), ConfigError> {
        let name = self.name.as_str();
        match &self.kind {
            PassKind::Cache(p) => {
                check_opt(hw, name, &p.mem_loc, Some(UnitClass::Memory))?;
                check_opt(hw, name, &p.xfer_loc, Some(UnitClass::Transfer))?;
            }
            PassKind::LocateBlock(p) => check_opt(hw, name, &p.loc, None)?,
            PassKind::LocateInnerBlock(p) => check_opt(hw, name, &p.loc, None)?,
            PassKind::LocateMemory(p) => check_opt(hw, name, &p.loc, Some(UnitClass::Memory))?,
            PassKind::MemoryPlacement(p) => {
                if p.locs.is_empty() {
                    return Err(invalid(name, "locs", "at least one location is required"));
                }
                for loc in &p.locs {
                    hw.check_location(name, loc, Some(UnitClass::Memory))?;
                }
                if p.alignment == 0 {
                    return Err(invalid(name, "alignment", "must be at least 1"));
                }
            }
            PassKind::Stencil(p) => {
                if p.stencils.is_empty() && hw.stencils().is_empty() {
                    return Err(invalid(
                        name,
                        "stencils",
                        "no stencils given and no execution unit declares any",
                    ));
                }
                for stencil in &p.stencils {
                    if stencil.idxs.iter().any(|i| i.size == 0 || i.size < -1) {
                        return Err(invalid(name, "stencils", "sizes must be positive or -1"));
                    }
                }
            }
            PassKind::Autotile(p) => {
                check_cost(name, "input_cost", p.input_cost)?;
                check_cost(name, "output_cost", p.output_cost)?;
            }
            PassKind::Schedule(p) => {
                require(hw, name, "mem_loc", &p.mem_loc, UnitClass::Memory)?;
                require(hw, name, "xfer_loc", &p.xfer_loc, UnitClass::Transfer)?;
                if p.alignment == 0 {
                    return Err(invalid(name, "alignment", "must be at least 1"));
                }
                let capacity = p
                    .mem_loc
                    .as_ref()
                    .and_then(|loc| hw.memory_bytes(loc))
                    .unwrap_or(0);
                if p.mem_kib == 0 && capacity == 0 {
                    return Err(invalid(
                        name,
                        "mem_KiB",
                        "zero budget and the memory unit declares no capacity",
                    ));
                }
            }
            PassKind::PartitionCompute(p) | PassKind::PartitionMemory(p) => {
                if p.num_parts == 0 {
                    return Err(invalid(name, "num_parts", "must be at least 1"));
                }
            }
            PassKind::ThreadInner(p) => {
                if p.threads == 0 {
                    return Err(invalid(name, "threads", "must be at least 1"));
                }
            }
            PassKind::ComputeDeps(_)
            | PassKind::Fusion(_)
            | PassKind::Localize(_)
            | PassKind::Scalarize(_)
            | PassKind::Transpose(_)
            | PassKind::Unroll(_)
            | PassKind::PruneIndexes(_)
            | PassKind::PruneRefinements(_) => {}
        }
        Ok(())
    }
}

// ============================================================================
// Configuration record
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub hardware: Hardware,
    #[serde(default)]
    pub passes: Vec<PassEntry>,
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Config, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        Config::from_json_str(&text)
    }

    /// Validate the hardware and every entry, yielding the passes in order.
    pub fn passes(&self) -> Result<Vec<Pass>, ConfigError> {
        self.hardware.validate()?;
        let mut out = Vec::with_capacity(self.passes.len());
        for entry in &self.passes {
            let pass = Pass {
                name: entry.name.clone(),
                kind: entry.kind()?,
            };
            pass.validate(&self.hardware)?;
            out.push(pass);
        }
        Ok(out)
    }
}
