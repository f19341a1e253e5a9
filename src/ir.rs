//! Tagged block IR.
//!
//! A [`Program`] owns every statement in an arena addressed by [`NodeId`]. Blocks
//! list their children by id, and dependency edges are id sets over earlier
//! siblings, so inserting or deleting statements never invalidates other
//! references. The tree shape (every live node owned by exactly one parent) is
//! checked by [`Program::validate`].

use crate::affine::Affine;
use crate::error::IrError;
use crate::location::Location;
use crate::tags::{self, Tags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

// ============================================================================
// Element types and shapes
// ============================================================================

/// Element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float16,
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Bool,
    Custom(u64), // Custom type with size in bytes
}

impl DataType {
    pub fn size_bytes(&self) -> u64 {
        match self {
            DataType::Bool | DataType::Int8 => 1,
            DataType::Float16 | DataType::Int16 => 2,
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float64 | DataType::Int64 => 8,
            DataType::Custom(size) => *size,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Float32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDim {
    pub size: u64,
    /// Distance between consecutive elements of this dimension, in elements
    pub stride: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    #[serde(default)]
    pub dtype: DataType,
    pub dims: Vec<TensorDim>,
}

impl TensorShape {
    /// Row-major dense shape.
    pub fn dense(dtype: DataType, sizes: &[u64]) -> Self {
        let mut dims = vec![TensorDim { size: 0, stride: 0 }; sizes.len()];
        let mut stride = 1i64;
        for (d, &size) in sizes.iter().enumerate().rev() {
            dims[d] = TensorDim { size, stride };
            stride *= size.max(1) as i64;
        }
        TensorShape { dtype, dims }
    }

    /// Same sizes with the given strides.
    pub fn with_strides(&self, strides: &[i64]) -> Self {
        TensorShape {
            dtype: self.dtype,
            dims: self
                .dims
                .iter()
                .zip(strides)
                .map(|(d, &stride)| TensorDim {
                    size: d.size,
                    stride,
                })
                .collect(),
        }
    }

    /// Dense row-major shape over the same sizes.
    pub fn densified(&self) -> Self {
        TensorShape::dense(self.dtype, &self.sizes())
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.dims.iter().map(|d| d.size).collect()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn elem_count(&self) -> u64 {
        self.dims.iter().map(|d| d.size).product()
    }

    /// Bytes needed to hold the shape densely.
    pub fn byte_size(&self) -> u64 {
        self.elem_count() * self.dtype.size_bytes()
    }

    /// The unit-stride dimension, if any.
    pub fn contiguous_dim(&self) -> Option<usize> {
        self.dims.iter().rposition(|d| d.stride.abs() == 1)
    }
}

// ============================================================================
// Indexes and refinements
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub range: u64,
    /// Non-zero for pass-through indexes, whose value is this affine over the
    /// parent's indexes
    #[serde(default, skip_serializing_if = "Affine::is_zero")]
    pub affine: Affine,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: Tags,
}

impl Index {
    pub fn new(name: impl Into<String>, range: u64) -> Self {
        Index {
            name: name.into(),
            range,
            affine: Affine::zero(),
            tags: Tags::new(),
        }
    }

    pub fn passthrough(name: impl Into<String>, affine: Affine) -> Self {
        Index {
            name: name.into(),
            range: 1,
            affine,
            tags: Tags::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        !self.affine.is_zero()
    }
}

/// Access direction of a refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefDir {
    /// The block allocates the buffer itself
    None,
    In,
    Out,
    InOut,
}

impl RefDir {
    pub fn is_read(&self) -> bool {
        matches!(self, RefDir::In | RefDir::InOut)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, RefDir::Out | RefDir::InOut)
    }

    pub fn is_alloc(&self) -> bool {
        matches!(self, RefDir::None)
    }

    /// Direction covering both `self` and `other`.
    pub fn union(self, other: RefDir) -> RefDir {
        let read = self.is_read() || other.is_read();
        let write = self.is_write() || other.is_write();
        match (read, write) {
            (true, true) => RefDir::InOut,
            (true, false) => RefDir::In,
            (false, true) => RefDir::Out,
            (false, false) => RefDir::None,
        }
    }
}

impl fmt::Display for RefDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefDir::None => "none",
            RefDir::In => "in",
            RefDir::Out => "out",
            RefDir::InOut => "inout",
        };
        write!(f, "{}", s)
    }
}

/// A named, directioned view onto a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refinement {
    pub dir: RefDir,
    /// Name of the parent's refinement this view refines; empty for allocations
    #[serde(default)]
    pub from: String,
    /// Name of the view inside this block
    pub into: String,
    /// Per-dimension offset of the view, over this block's indexes
    #[serde(default)]
    pub access: Vec<Affine>,
    pub shape: TensorShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Byte offset inside the location's memory, once placed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Dimension split across memory units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_dim: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: Tags,
}

impl Refinement {
    pub fn new(
        dir: RefDir,
        from: impl Into<String>,
        into: impl Into<String>,
        access: Vec<Affine>,
        shape: TensorShape,
    ) -> Self {
        Refinement {
            dir,
            from: from.into(),
            into: into.into(),
            access,
            shape,
            agg_op: None,
            location: None,
            offset: None,
            bank_dim: None,
            tags: Tags::new(),
        }
    }

    /// Local allocation of a dense buffer.
    pub fn alloc(into: impl Into<String>, shape: TensorShape) -> Self {
        let rank = shape.rank();
        Refinement::new(RefDir::None, "", into, vec![Affine::zero(); rank], shape)
    }

    /// Element stride of index `idx` through this view's access (0 when unused).
    pub fn flat_stride(&self, idx: &str) -> i64 {
        self.access
            .iter()
            .zip(&self.shape.dims)
            .map(|(a, d)| a.coeff(idx) * d.stride)
            .sum()
    }

    /// Whether this view's access depends on `idx`.
    pub fn uses_index(&self, idx: &str) -> bool {
        self.access.iter().any(|a| a.uses(idx))
    }

    /// Accumulating outputs cannot be replayed.
    pub fn accumulates(&self) -> bool {
        self.dir.is_write()
            && self
                .agg_op
                .as_deref()
                .map(|op| op != "assign")
                .unwrap_or(false)
    }
}

// ============================================================================
// Statements
// ============================================================================

/// Stable handle of a statement in a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The central loop-nest node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comments: String,
    #[serde(default)]
    pub idxs: Vec<Index>,
    /// Each constraint must evaluate to >= 0 for an iteration to run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Affine>,
    #[serde(default)]
    pub refs: Vec<Refinement>,
    #[serde(skip)]
    pub stmts: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: Tags,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Block {
            name: name.into(),
            ..Block::default()
        }
    }

    pub fn has_tags(&self, required: &[String]) -> bool {
        tags::matches(&self.tags, required)
    }

    pub fn ref_by_name(&self, name: &str) -> Option<&Refinement> {
        self.refs.iter().find(|r| r.into == name)
    }

    pub fn ref_by_name_mut(&mut self, name: &str) -> Option<&mut Refinement> {
        self.refs.iter_mut().find(|r| r.into == name)
    }

    pub fn idx_by_name(&self, name: &str) -> Option<&Index> {
        self.idxs.iter().find(|i| i.name == name)
    }

    /// Indexes that iterate (not pass-through).
    pub fn real_idxs(&self) -> impl Iterator<Item = &Index> {
        self.idxs.iter().filter(|i| !i.is_passthrough())
    }

    /// Number of iterations of this block's own index space.
    pub fn iteration_count(&self) -> u64 {
        self.real_idxs().map(|i| i.range).product()
    }

    /// A refinement name not yet used in this block.
    pub fn unique_ref_name(&self, base: &str) -> String {
        unique_name(base, |n| self.ref_by_name(n).is_some())
    }

    /// An index name not yet used in this block.
    pub fn unique_idx_name(&self, base: &str) -> String {
        unique_name(base, |n| self.idx_by_name(n).is_some())
    }
}

fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (0..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Intrinsic or special call: named inputs produce named outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Operation {
    pub fn new(name: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        Operation {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Block(Block),
    /// Read one element of a buffer into a scalar
    Load { from: String, into: String },
    /// Write a scalar into one element of a buffer
    Store { from: String, into: String },
    /// Scalar computation
    Intrinsic(Operation),
    /// Opaque whole-buffer operation
    Special(Operation),
}

impl Stmt {
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Stmt::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut Block> {
        match self {
            Stmt::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Stmt::Block(_) => "block",
            Stmt::Load { .. } => "load",
            Stmt::Store { .. } => "store",
            Stmt::Intrinsic(_) => "intrinsic",
            Stmt::Special(_) => "special",
        }
    }

    /// Rename every use of the parent-level name `old` to `new`: refinement
    /// sources of a child block, load/store operands and call operands.
    pub fn rename_use(&mut self, old: &str, new: &str) {
        let fix = |s: &mut String| {
            if s == old {
                *s = new.to_string();
            }
        };
        match self {
            Stmt::Block(b) => b.refs.iter_mut().for_each(|r| fix(&mut r.from)),
            Stmt::Load { from, into } | Stmt::Store { from, into } => {
                fix(from);
                fix(into);
            }
            Stmt::Intrinsic(op) | Stmt::Special(op) => {
                op.inputs.iter_mut().for_each(fix);
                op.outputs.iter_mut().for_each(fix);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub stmt: Stmt,
    /// Earlier siblings this statement must wait for
    pub deps: BTreeSet<NodeId>,
}

impl Node {
    pub fn new(stmt: Stmt) -> Self {
        Node {
            stmt,
            deps: BTreeSet::new(),
        }
    }
}

// ============================================================================
// Program arena
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    nodes: Vec<Option<Node>>,
    root: NodeId,
}

impl Program {
    pub fn new(root: Block) -> Self {
        Program {
            nodes: vec![Some(Node::new(Stmt::Block(root)))],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Allocate a detached statement.
    pub fn alloc(&mut self, stmt: Stmt) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node::new(stmt)));
        id
    }

    /// Allocate a statement and append it to `parent`.
    pub fn push(&mut self, parent: NodeId, stmt: Stmt) -> Result<NodeId, IrError> {
        self.block(parent)?;
        let id = self.alloc(stmt);
        self.block_mut(parent)?.stmts.push(id);
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, IrError> {
        self.get(id).ok_or(IrError::MissingNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, IrError> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(IrError::MissingNode(id))
    }

    pub fn try_block(&self, id: NodeId) -> Option<&Block> {
        self.get(id).and_then(|n| n.stmt.as_block())
    }

    pub fn block(&self, id: NodeId) -> Result<&Block, IrError> {
        self.node(id)?
            .stmt
            .as_block()
            .ok_or(IrError::NotABlock(id))
    }

    pub fn block_mut(&mut self, id: NodeId) -> Result<&mut Block, IrError> {
        self.node_mut(id)?
            .stmt
            .as_block_mut()
            .ok_or(IrError::NotABlock(id))
    }

    /// Release `id` and everything below it.
    pub fn free(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(slot) = self.nodes.get_mut(cur.0 as usize) {
                if let Some(node) = slot.take() {
                    if let Stmt::Block(b) = node.stmt {
                        stack.extend(b.stmts);
                    }
                }
            }
        }
    }

    /// Number of live statements.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of refinements across all blocks.
    pub fn ref_count(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .filter_map(|n| n.stmt.as_block())
            .map(|b| b.refs.len())
            .sum()
    }

    /// Blocks in pre-order (parent before children, children in statement order).
    pub fn blocks_preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(block) = self.try_block(id) {
                out.push(id);
                stack.extend(block.stmts.iter().rev().copied());
            }
        }
        out
    }

    /// Pre-order snapshot of the blocks whose tags satisfy `required`.
    pub fn select(&self, required: &[String]) -> Vec<NodeId> {
        self.blocks_preorder()
            .into_iter()
            .filter(|&id| {
                self.try_block(id)
                    .map(|b| b.has_tags(required))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Child -> parent map for every statement under the root.
    pub fn parents(&self) -> HashMap<NodeId, NodeId> {
        let mut map = HashMap::new();
        for id in self.blocks_preorder() {
            if let Some(block) = self.try_block(id) {
                for &child in &block.stmts {
                    map.insert(child, id);
                }
            }
        }
        map
    }

    /// Copy the subtree rooted at `id` into fresh arena slots.
    ///
    /// Dependencies inside copied blocks are remapped to the copies; the returned
    /// root copy has no dependencies.
    pub fn deep_clone(&mut self, id: NodeId) -> Result<NodeId, IrError> {
        let stmt = self.node(id)?.stmt.clone();
        let new_id = self.alloc(stmt);
        if let Some(children) = self.try_block(id).map(|b| b.stmts.clone()) {
            let mut remap = BTreeMap::new();
            let mut copies = Vec::with_capacity(children.len());
            for child in children {
                let copy = self.deep_clone(child)?;
                let deps = self.node(child)?.deps.clone();
                self.node_mut(copy)?.deps = deps
                    .iter()
                    .map(|d| remap.get(d).copied().unwrap_or(*d))
                    .collect();
                remap.insert(child, copy);
                copies.push(copy);
            }
            self.block_mut(new_id)?.stmts = copies;
        }
        Ok(new_id)
    }

    /// Check tree shape and dependency edges.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(IrError::SharedNode(id));
            }
            let node = self.node(id)?;
            if let Stmt::Block(block) = &node.stmt {
                let mut earlier = BTreeSet::new();
                for &child in &block.stmts {
                    for dep in &self.node(child)?.deps {
                        if !earlier.contains(dep) {
                            return Err(IrError::BadDependency {
                                node: child,
                                dep: *dep,
                            });
                        }
                    }
                    earlier.insert(child);
                    stack.push(child);
                }
            }
        }
        Ok(())
    }

    /// Replace `old` in the deps of `parent`'s statements by `new`.
    pub fn replace_dep(
        &mut self,
        parent: NodeId,
        old: NodeId,
        new: &[NodeId],
    ) -> Result<(), IrError> {
        let stmts = self.block(parent)?.stmts.clone();
        for s in stmts {
            let node = self.node_mut(s)?;
            if node.deps.remove(&old) {
                node.deps.extend(new.iter().copied());
            }
        }
        Ok(())
    }

    /// Give buffer `name` of block `id` new strides and push them down to every
    /// view of it below. Views of a different rank keep their own layout.
    pub fn restride(&mut self, id: NodeId, name: &str, strides: &[i64]) -> Result<usize, IrError> {
        let mut touched = 0;
        let mut stack = vec![(id, name.to_string())];
        while let Some((cur, buf)) = stack.pop() {
            let block = self.block_mut(cur)?;
            if let Some(r) = block.ref_by_name_mut(&buf) {
                if r.shape.rank() == strides.len() {
                    r.shape = r.shape.with_strides(strides);
                    touched += 1;
                }
            }
            for child in block.stmts.clone() {
                if let Some(cb) = self.try_block(child) {
                    for view in cb.refs.iter().filter(|v| v.from == buf) {
                        stack.push((child, view.into.clone()));
                    }
                }
            }
        }
        Ok(touched)
    }

    /// Remove `id` from `parent`, handing its dependencies to its dependents.
    pub fn splice_out(&mut self, parent: NodeId, id: NodeId) -> Result<(), IrError> {
        let deps: Vec<NodeId> = self.node(id)?.deps.iter().copied().collect();
        self.block_mut(parent)?.stmts.retain(|&s| s != id);
        self.replace_dep(parent, id, &deps)?;
        self.free(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(sizes: &[u64]) -> TensorShape {
        TensorShape::dense(DataType::Float32, sizes)
    }

    #[test]
    fn test_dense_shape() {
        let s = shape(&[4, 8, 16]);
        let strides: Vec<i64> = s.dims.iter().map(|d| d.stride).collect();
        assert_eq!(strides, vec![128, 16, 1]);
        assert_eq!(s.byte_size(), 4 * 8 * 16 * 4);
        assert_eq!(s.contiguous_dim(), Some(2));
    }

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::Float32.size_bytes(), 4);
        assert_eq!(DataType::Float64.size_bytes(), 8);
        assert_eq!(DataType::Int8.size_bytes(), 1);
        assert_eq!(DataType::Custom(3).size_bytes(), 3);
    }

    #[test]
    fn test_refdir_union() {
        assert_eq!(RefDir::In.union(RefDir::Out), RefDir::InOut);
        assert_eq!(RefDir::None.union(RefDir::In), RefDir::In);
        assert_eq!(RefDir::None.union(RefDir::None), RefDir::None);
    }

    #[test]
    fn test_flat_stride() {
        let r = Refinement::new(
            RefDir::In,
            "A",
            "A",
            vec![Affine::index("i"), Affine::index("k")],
            TensorShape {
                dtype: DataType::Float32,
                dims: vec![
                    TensorDim { size: 1, stride: 64 },
                    TensorDim { size: 1, stride: 1 },
                ],
            },
        );
        assert_eq!(r.flat_stride("i"), 64);
        assert_eq!(r.flat_stride("k"), 1);
        assert_eq!(r.flat_stride("j"), 0);
    }

    #[test]
    fn test_push_select_and_parents() {
        let mut root = Block::new("main");
        root.tags = tags::tag_set(["program"]);
        let mut prog = Program::new(root);
        let mut kernel = Block::new("kernel");
        kernel.tags = tags::tag_set(["kernel"]);
        let k = prog.push(prog.root(), Stmt::Block(kernel)).unwrap();
        let l = prog
            .push(
                k,
                Stmt::Load {
                    from: "A".into(),
                    into: "$a".into(),
                },
            )
            .unwrap();

        assert_eq!(prog.select(&["kernel".to_string()]), vec![k]);
        assert_eq!(prog.select(&[]), vec![prog.root(), k]);
        let parents = prog.parents();
        assert_eq!(parents[&k], prog.root());
        assert_eq!(parents[&l], k);
        assert!(prog.validate().is_ok());
    }

    #[test]
    fn test_deep_clone_remaps_deps() {
        let mut prog = Program::new(Block::new("main"));
        let b = prog.push(prog.root(), Stmt::Block(Block::new("b"))).unwrap();
        let s0 = prog
            .push(b, Stmt::Special(Operation::new("zero", &[], &["X"])))
            .unwrap();
        let s1 = prog
            .push(b, Stmt::Special(Operation::new("relu", &["X"], &["Y"])))
            .unwrap();
        prog.node_mut(s1).unwrap().deps.insert(s0);

        let copy = prog.deep_clone(b).unwrap();
        let copied = prog.block(copy).unwrap().stmts.clone();
        assert_eq!(copied.len(), 2);
        assert_ne!(copied[0], s0);
        let deps = &prog.node(copied[1]).unwrap().deps;
        assert!(deps.contains(&copied[0]));
        assert!(!deps.contains(&s0));
    }

    #[test]
    fn test_validate_rejects_shared_and_bad_deps() {
        let mut prog = Program::new(Block::new("main"));
        let a = prog.push(prog.root(), Stmt::Block(Block::new("a"))).unwrap();
        let b = prog.push(prog.root(), Stmt::Block(Block::new("b"))).unwrap();
        prog.node_mut(a).unwrap().deps.insert(b);
        assert_eq!(
            prog.validate(),
            Err(IrError::BadDependency { node: a, dep: b })
        );

        prog.node_mut(a).unwrap().deps.clear();
        prog.block_mut(b).unwrap().stmts.push(a);
        assert_eq!(prog.validate(), Err(IrError::SharedNode(a)));
    }

    #[test]
    fn test_splice_out_forwards_deps() {
        let mut prog = Program::new(Block::new("main"));
        let root = prog.root();
        let a = prog.push(root, Stmt::Block(Block::new("a"))).unwrap();
        let b = prog.push(root, Stmt::Block(Block::new("b"))).unwrap();
        let c = prog.push(root, Stmt::Block(Block::new("c"))).unwrap();
        prog.node_mut(b).unwrap().deps.insert(a);
        prog.node_mut(c).unwrap().deps.insert(b);
        prog.splice_out(root, b).unwrap();
        assert_eq!(prog.block(root).unwrap().stmts, vec![a, c]);
        assert!(prog.node(c).unwrap().deps.contains(&a));
        assert!(prog.get(b).is_none());
    }
}
