//! Error types for every layer of the pipeline.
//!
//! Configuration problems are detected before the first pass runs. Pass failures
//! abort the whole run; the driver never exposes a partially transformed tree.

use crate::ir::NodeId;
use thiserror::Error;

/// Structural problems in the block tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    /// A statement id does not name a live arena slot
    #[error("statement {0} does not exist")]
    MissingNode(NodeId),

    /// A statement was expected to be a block
    #[error("statement {0} is not a block")]
    NotABlock(NodeId),

    /// A statement is listed under more than one parent (or twice under one)
    #[error("statement {0} is owned more than once")]
    SharedNode(NodeId),

    /// A dependency edge points at something other than an earlier sibling
    #[error("statement {node} depends on {dep}, which is not an earlier sibling")]
    BadDependency { node: NodeId, dep: NodeId },

    /// A block refers to a refinement name that does not exist
    #[error("block '{block}' has no refinement named '{name}'")]
    UnknownRefinement { block: String, name: String },

    /// Program text could not be decoded
    #[error("failed to decode program: {0}")]
    Decode(String),
}

/// Problems with the pipeline configuration record.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A pass entry sets no pass kind or several of them
    #[error("pass '{name}' must set exactly one pass kind, found {found}")]
    PassKind { name: String, found: usize },

    /// A location names no unit of the hardware description
    #[error("pass '{pass}' references unknown location '{location}'")]
    UnknownLocation { pass: String, location: String },

    /// A location names a unit of the wrong class
    #[error("pass '{pass}': location '{location}' must be a {expected} unit")]
    WrongUnitClass {
        pass: String,
        location: String,
        expected: &'static str,
    },

    /// A location's unit index exceeds the unit's instance count
    #[error("location '{location}' selects unit {unit} but only {count} exist")]
    UnitOutOfRange {
        location: String,
        unit: u64,
        count: u64,
    },

    /// A bus names a unit that does not exist
    #[error("bus {bus} references unknown unit '{unit}'")]
    UnknownBusUnit { bus: usize, unit: String },

    /// A numeric field is outside its valid domain
    #[error("pass '{pass}': invalid {field}: {reason}")]
    InvalidField {
        pass: String,
        field: &'static str,
        reason: String,
    },

    /// A location string could not be parsed
    #[error("malformed location '{0}' (expected NAME or NAME[unit])")]
    MalformedLocation(String),

    /// JSON decoding failed
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading the configuration failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single pass invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PassError {
    /// The pass could not satisfy its constraints for a matched block
    #[error("{pass}: cannot rewrite block '{block}': {reason}")]
    Unsatisfiable {
        pass: &'static str,
        block: String,
        reason: String,
    },

    /// The tree was found in an inconsistent state
    #[error(transparent)]
    Ir(#[from] IrError),
}

impl PassError {
    pub(crate) fn unsatisfiable(
        pass: &'static str,
        block: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        PassError::Unsatisfiable {
            pass,
            block: block.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The configuration was rejected before any pass ran
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A pass failed; the run was aborted
    #[error("pass #{index} '{name}' failed: {source}")]
    Pass {
        index: usize,
        name: String,
        #[source]
        source: PassError,
    },

    /// A fixpoint pass kept changing the tree past its iteration bound
    #[error("pass '{pass}' did not reach a fixpoint within {limit} iterations")]
    FixpointLimit { pass: String, limit: usize },

    /// The input tree was malformed
    #[error("invalid program: {0}")]
    Ir(#[from] IrError),
}
