//! StripeOpt: tag-driven optimization passes for nested-block tensor programs
//!
//! This library rewrites a tree of loop-nest blocks so that it fits a configurable
//! accelerator:
//! 1. Load a hardware description and an ordered pass list ([`config`])
//! 2. Select blocks by tag and rewrite them one pass at a time ([`pipeline`])
//! 3. Hand the transformed tree to a downstream code generator
//!
//! # Core Pipeline Flow
//! ```text
//! config.json ─┐
//!              ├─> Pipeline ──> pass 0 ──> pass 1 ──> ... ──> transformed Program
//! program.json ┘      │
//!                     └─> Hardware (units, buses, stencils)
//! ```
//!
//! # Module Organization
//!
//! ## Program Model
//! - [`ir`]: Blocks, refinements, indexes and the statement arena
//! - [`affine`]: Affine index polynomials
//! - [`tags`]: Tag sets and the selection predicate
//! - [`location`]: Hardware unit references
//! - [`serialize`]: JSON form of a program
//! - [`printer`]: Text dump of a program
//!
//! ## Configuration
//! - [`hardware`]: Execution, memory and transfer units, buses, stencils
//! - [`config`]: Pass records and their validation
//! - [`error`]: Error types for every layer
//!
//! ## Search and Allocation Passes
//! - [`autotile`]: Tile-size search under size limits
//! - [`stencil`]: Matching loop nests to hardware compute shapes
//! - [`schedule`]: List scheduling under a memory budget with swapping
//! - [`placement`]: Offsets for local buffers by liveness
//!
//! ## Structural Passes
//! - [`tile`]: Shared outer/inner tiling rewrite
//! - [`cache`]: Cache buffers and copy blocks
//! - [`deps`]: Statement dependency analysis
//! - [`fusion`], [`localize`], [`locate`], [`scalarize`], [`partition`],
//!   [`unroll`], [`transpose`], [`prune`], [`thread`]

// ============================================================================
// Program Model
// ============================================================================

pub mod affine;
pub mod ir;
pub mod location;
pub mod printer;
pub mod serialize;
pub mod tags;

// ============================================================================
// Configuration
// ============================================================================

pub mod config;
pub mod error;
pub mod hardware;

// ============================================================================
// Driver
// ============================================================================

pub mod pipeline;

// ============================================================================
// Passes
// ============================================================================

pub mod autotile;
pub mod cache;
pub mod deps;
pub mod fusion;
pub mod localize;
pub mod locate;
pub mod partition;
pub mod placement;
pub mod prune;
pub mod scalarize;
pub mod schedule;
pub mod stencil;
pub mod thread;
pub mod tile;
pub mod transpose;
pub mod unroll;

pub use config::{Config, Pass, PassKind};
pub use error::{ConfigError, IrError, PassError, PipelineError};
pub use hardware::Hardware;
pub use ir::{Block, NodeId, Program, RefDir, Refinement, Stmt};
pub use pipeline::{Pipeline, PipelineOptions, PipelineReport};
