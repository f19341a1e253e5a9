//! Nested JSON form of a [`Program`].
//!
//! On disk a block carries its own fields plus a `stmts` array; each statement has a
//! `kind` and refers to its dependencies by position among earlier siblings.

use crate::error::IrError;
use crate::ir::{Block, NodeId, Operation, Program, Stmt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDoc {
    #[serde(flatten)]
    pub block: Block,
    #[serde(default)]
    pub stmts: Vec<StmtDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmtDoc {
    /// Positions of earlier siblings this statement depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<usize>,
    #[serde(flatten)]
    pub op: OpDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpDoc {
    Block(BlockDoc),
    Load { from: String, into: String },
    Store { from: String, into: String },
    Intrinsic(Operation),
    Special(Operation),
}

impl Program {
    /// Build the arena form of a nested document.
    pub fn from_doc(doc: BlockDoc) -> Result<Program, IrError> {
        let mut prog = Program::new(doc.block);
        let root = prog.root();
        prog.block_mut(root)?.stmts.clear();
        attach_children(&mut prog, root, doc.stmts)?;
        prog.validate()?;
        Ok(prog)
    }

    /// Nested document for the whole tree.
    pub fn to_doc(&self) -> Result<BlockDoc, IrError> {
        block_doc(self, self.root())
    }

    pub fn from_json(text: &str) -> Result<Program, IrError> {
        let doc: BlockDoc =
            serde_json::from_str(text).map_err(|e| IrError::Decode(e.to_string()))?;
        Program::from_doc(doc)
    }

    pub fn to_json(&self) -> Result<String, IrError> {
        serde_json::to_string_pretty(&self.to_doc()?).map_err(|e| IrError::Decode(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Program, IrError> {
        let text = fs::read_to_string(path)
            .map_err(|e| IrError::Decode(format!("{}: {}", path.display(), e)))?;
        Program::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), IrError> {
        fs::write(path, self.to_json()?)
            .map_err(|e| IrError::Decode(format!("{}: {}", path.display(), e)))
    }
}

fn attach_children(
    prog: &mut Program,
    parent: NodeId,
    stmts: Vec<StmtDoc>,
) -> Result<(), IrError> {
    let mut ids = Vec::with_capacity(stmts.len());
    for (pos, doc) in stmts.into_iter().enumerate() {
        let (stmt, children) = match doc.op {
            OpDoc::Block(BlockDoc { mut block, stmts }) => {
                block.stmts.clear();
                (Stmt::Block(block), Some(stmts))
            }
            OpDoc::Load { from, into } => (Stmt::Load { from, into }, None),
            OpDoc::Store { from, into } => (Stmt::Store { from, into }, None),
            OpDoc::Intrinsic(op) => (Stmt::Intrinsic(op), None),
            OpDoc::Special(op) => (Stmt::Special(op), None),
        };
        let id = prog.push(parent, stmt)?;
        for dep in doc.deps {
            let target = ids.get(dep).copied().filter(|_| dep < pos).ok_or_else(|| {
                IrError::Decode(format!(
                    "statement {} of block {} depends on position {}",
                    pos, parent, dep
                ))
            })?;
            prog.node_mut(id)?.deps.insert(target);
        }
        ids.push(id);
        if let Some(children) = children {
            attach_children(prog, id, children)?;
        }
    }
    Ok(())
}

fn block_doc(prog: &Program, id: NodeId) -> Result<BlockDoc, IrError> {
    let block = prog.block(id)?;
    let position: HashMap<NodeId, usize> = block
        .stmts
        .iter()
        .enumerate()
        .map(|(pos, &s)| (s, pos))
        .collect();
    let mut stmts = Vec::with_capacity(block.stmts.len());
    for &child in &block.stmts {
        let node = prog.node(child)?;
        let op = match &node.stmt {
            Stmt::Block(_) => OpDoc::Block(block_doc(prog, child)?),
            Stmt::Load { from, into } => OpDoc::Load {
                from: from.clone(),
                into: into.clone(),
            },
            Stmt::Store { from, into } => OpDoc::Store {
                from: from.clone(),
                into: into.clone(),
            },
            Stmt::Intrinsic(op) => OpDoc::Intrinsic(op.clone()),
            Stmt::Special(op) => OpDoc::Special(op.clone()),
        };
        let mut deps: Vec<usize> = node
            .deps
            .iter()
            .filter_map(|d| position.get(d).copied())
            .collect();
        deps.sort_unstable();
        stmts.push(StmtDoc { deps, op });
    }
    let mut header = block.clone();
    header.stmts.clear();
    Ok(BlockDoc {
        block: header,
        stmts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"{
        "name": "main",
        "refs": [
            { "dir": "in", "into": "A", "shape": { "dtype": "float32", "dims": [ { "size": 8, "stride": 1 } ] } },
            { "dir": "out", "into": "B", "shape": { "dtype": "float32", "dims": [ { "size": 8, "stride": 1 } ] } }
        ],
        "stmts": [
            {
                "kind": "block",
                "name": "relu",
                "tags": ["eltwise"],
                "idxs": [ { "name": "i", "range": 8 } ],
                "refs": [
                    { "dir": "in", "from": "A", "into": "A", "access": [ { "i": 1 } ],
                      "shape": { "dims": [ { "size": 1, "stride": 1 } ] } },
                    { "dir": "out", "from": "B", "into": "B", "access": [ { "i": 1 } ],
                      "shape": { "dims": [ { "size": 1, "stride": 1 } ] } }
                ],
                "stmts": [
                    { "kind": "load", "from": "A", "into": "$a" },
                    { "kind": "intrinsic", "name": "relu", "inputs": ["$a"], "outputs": ["$b"], "deps": [0] },
                    { "kind": "store", "from": "$b", "into": "B", "deps": [1] }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_load_nested_program() {
        let prog = Program::from_json(PROGRAM).unwrap();
        let root = prog.block(prog.root()).unwrap();
        assert_eq!(root.refs.len(), 2);
        let relu_id = root.stmts[0];
        let relu = prog.block(relu_id).unwrap();
        assert!(relu.tags.contains("eltwise"));
        assert_eq!(relu.idxs[0].range, 8);
        assert_eq!(relu.stmts.len(), 3);
        let store = prog.node(relu.stmts[2]).unwrap();
        assert!(store.deps.contains(&relu.stmts[1]));
    }

    #[test]
    fn test_document_survives_rewrite() {
        let prog = Program::from_json(PROGRAM).unwrap();
        let again = Program::from_json(&prog.to_json().unwrap()).unwrap();
        assert_eq!(again.to_doc().unwrap().stmts.len(), 1);
        let relu = again.block(again.block(again.root()).unwrap().stmts[0]).unwrap();
        assert_eq!(relu.refs[0].access[0].coeff("i"), 1);
        assert_eq!(relu.stmts.len(), 3);
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let bad = r#"{ "name": "main", "stmts": [
            { "kind": "special", "name": "a", "deps": [1] },
            { "kind": "special", "name": "b" }
        ] }"#;
        assert!(matches!(Program::from_json(bad), Err(IrError::Decode(_))));
    }
}
