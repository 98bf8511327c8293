//! Program Analysis
//!
//! Function recovery and the per-function facts later stages consume:
//! control flow graphs with natural loops, call sites, data references, and the
//! inter-procedural call graph.

pub mod call_graph;
pub mod control_flow;
pub mod disassembler;
pub mod references;

use crate::engine::decoder::{Instruction, InstructionKind};
use control_flow::{ControlFlowGraph, Loop};
use references::DataReference;

/// Call instruction inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSite {
    /// Address of the call instruction
    pub address: u64,
    /// Direct callee, `None` for indirect calls
    pub target: Option<u64>,
}

/// A recovered function.
///
/// # Memory Layout
/// - `instructions` is the only instruction storage; CFG blocks index into it
#[derive(Debug, Clone)]
pub struct Function {
    /// Entry point address
    pub entry: u64,
    /// Symbol name if the container provided one
    pub name: Option<String>,
    /// Name of the section the function was decoded from
    pub section: String,
    /// Instructions sorted by address
    pub instructions: Vec<Instruction>,
    pub cfg: ControlFlowGraph,
    /// Natural loops with inferred trip counts, by header block
    pub loops: Vec<Loop>,
    pub call_sites: Vec<CallSite>,
    pub data_refs: Vec<DataReference>,
}

impl Function {
    /// Whether `address` is the address of one of this function's instructions.
    pub fn contains(&self, address: u64) -> bool {
        self.instructions
            .binary_search_by_key(&address, |inst| inst.address)
            .is_ok()
    }

    /// Instructions of one CFG block.
    pub fn block_instructions(&self, block: u32) -> &[Instruction] {
        self.cfg
            .nodes
            .get(block as usize)
            .and_then(|b| self.instructions.get(b.instructions.clone()))
            .unwrap_or(&[])
    }

    /// Display name: symbol name, or `sub_<entry>`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("sub_{:x}", self.entry),
        }
    }

    /// Count of instructions of a kind within a set of blocks.
    pub fn count_kind<'a>(&'a self, blocks: impl Iterator<Item = u32> + 'a, kind: InstructionKind) -> usize {
        blocks
            .map(|b| self.block_instructions(b).iter().filter(|i| i.kind == kind).count())
            .sum()
    }
}
