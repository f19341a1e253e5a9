//! Human-readable dump of a program tree.
//!
//! ```text
//! #0 block main [main]
//!   none T float32[8:1] @SRAM +0
//!   0 #1 special produce() -> (T)
//!   1 #2 block k [i:4] [kernel] deps(0)
//!     in T -> t float32[1:1] (i)
//! ```

use crate::ir::{Block, NodeId, Program, Refinement, Stmt, TensorShape};
use crate::tags::Tags;
use std::fmt::{self, Write};

/// Wrapper implementing `Display` for a whole program.
pub struct ProgramDisplay<'a>(pub &'a Program);

impl Program {
    pub fn display(&self) -> ProgramDisplay<'_> {
        ProgramDisplay(self)
    }
}

fn tag_list(tags: &Tags) -> String {
    tags.iter().cloned().collect::<Vec<_>>().join(",")
}

fn shape_str(shape: &TensorShape) -> String {
    let dims: Vec<String> = shape
        .dims
        .iter()
        .map(|d| format!("{}:{}", d.size, d.stride))
        .collect();
    let dtype = format!("{:?}", shape.dtype).to_lowercase();
    format!("{}[{}]", dtype, dims.join(", "))
}

fn write_ref(out: &mut String, pad: &str, r: &Refinement) -> fmt::Result {
    write!(out, "{}{} ", pad, r.dir)?;
    if !r.from.is_empty() {
        write!(out, "{} -> ", r.from)?;
    }
    write!(out, "{} {}", r.into, shape_str(&r.shape))?;
    if r.access.iter().any(|a| !a.is_zero()) {
        let access: Vec<String> = r.access.iter().map(|a| a.to_string()).collect();
        write!(out, " ({})", access.join(", "))?;
    }
    if let Some(op) = &r.agg_op {
        write!(out, " agg:{}", op)?;
    }
    if let Some(loc) = &r.location {
        write!(out, " @{}", loc)?;
    }
    if let Some(offset) = r.offset {
        write!(out, " +{}", offset)?;
    }
    if let Some(dim) = r.bank_dim {
        write!(out, " bank:{}", dim)?;
    }
    if !r.tags.is_empty() {
        write!(out, " [{}]", tag_list(&r.tags))?;
    }
    writeln!(out)
}

fn write_block_header(out: &mut String, block: &Block) -> fmt::Result {
    write!(out, "block {}", block.name)?;
    if !block.idxs.is_empty() {
        let idxs: Vec<String> = block
            .idxs
            .iter()
            .map(|i| {
                if i.is_passthrough() {
                    format!("{}={}", i.name, i.affine)
                } else {
                    format!("{}:{}", i.name, i.range)
                }
            })
            .collect();
        write!(out, " [{}]", idxs.join(", "))?;
    }
    if !block.tags.is_empty() {
        write!(out, " [{}]", tag_list(&block.tags))?;
    }
    if let Some(loc) = &block.location {
        write!(out, " @{}", loc)?;
    }
    Ok(())
}

fn write_stmt(
    out: &mut String,
    prog: &Program,
    id: NodeId,
    depth: usize,
    position: Option<usize>,
    siblings: &[NodeId],
) -> fmt::Result {
    let pad = "  ".repeat(depth);
    let node = match prog.get(id) {
        Some(n) => n,
        None => return writeln!(out, "{}<missing {}>", pad, id),
    };
    write!(out, "{}", pad)?;
    if let Some(p) = position {
        write!(out, "{} ", p)?;
    }
    write!(out, "{} ", id)?;
    match &node.stmt {
        Stmt::Block(block) => write_block_header(out, block)?,
        Stmt::Load { from, into } => write!(out, "load {} -> {}", from, into)?,
        Stmt::Store { from, into } => write!(out, "store {} -> {}", from, into)?,
        Stmt::Intrinsic(op) | Stmt::Special(op) => write!(
            out,
            "{} {}({}) -> ({})",
            node.stmt.kind_name(),
            op.name,
            op.inputs.join(", "),
            op.outputs.join(", ")
        )?,
    }
    if !node.deps.is_empty() {
        let deps: Vec<String> = node
            .deps
            .iter()
            .map(|d| match siblings.iter().position(|s| s == d) {
                Some(p) => p.to_string(),
                None => d.to_string(),
            })
            .collect();
        write!(out, " deps({})", deps.join(", "))?;
    }
    writeln!(out)?;

    if let Stmt::Block(block) = &node.stmt {
        let inner = "  ".repeat(depth + 1);
        if !block.constraints.is_empty() {
            let cs: Vec<String> = block.constraints.iter().map(|c| format!("{} >= 0", c)).collect();
            writeln!(out, "{}where {}", inner, cs.join(", "))?;
        }
        for r in &block.refs {
            write_ref(out, &inner, r)?;
        }
        for (n, &child) in block.stmts.iter().enumerate() {
            write_stmt(out, prog, child, depth + 1, Some(n), &block.stmts)?;
        }
    }
    Ok(())
}

impl fmt::Display for ProgramDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_stmt(&mut out, self.0, self.0.root(), 0, None, &[])?;
        f.write_str(&out)
    }
}
