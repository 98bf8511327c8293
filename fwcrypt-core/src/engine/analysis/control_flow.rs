//! Control Flow Analysis
//!
//! This module provides control flow graph (CFG) construction and loop analysis for a
//! function's decoded instructions. The CFG drives structural matching of cryptographic
//! round loops.
//!
//! # Memory Optimizations
//! - `EdgeType` uses `#[repr(u8)]` to save 3 bytes per edge
//! - `BasicBlock.successors` and `predecessors` use `SmallVec<[u32; 2]>` (most blocks have ≤2)
//! - `Loop.body` uses `BitVec` for efficient membership testing (instead of `HashSet<usize>`)
//! - Blocks reference the function's instruction list by index range instead of cloning
//!
//! # CFG Construction Algorithm
//! 1. **Identify block boundaries**: Entry point, branch targets, and fall-through points
//!    (after the delay slot on architectures that have one)
//! 2. **Build basic blocks**: Linear sequences of instructions with single entry/exit
//! 3. **Identify edges**: Connect blocks based on branch targets and fall-through
//!
//! # Loop Detection Algorithm
//! Uses depth-first search (DFS) to find back edges, which indicate loops.
//! A back edge is an edge from a node to an ancestor in the DFS tree. The natural loop
//! body is every block that reaches the back edge's source without passing the header.

use crate::engine::decoder::{Instruction, InstructionKind, Operand};
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

/// Largest loop trip count accepted from a compare immediate.
pub const MAX_TRIP_COUNT: i64 = 128;

/// Control flow graph of one function.
///
/// # Graph Properties
/// - Directed graph (edges have direction)
/// - May contain cycles (loops)
/// - Single entry point (function entry), always block 0
/// - Block ids are in ascending address order
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    /// Basic blocks in the control flow graph
    pub nodes: Vec<BasicBlock>,
    /// Edges between basic blocks
    pub edges: Vec<Edge>,
    /// Entry block ID (function entry point)
    pub entry_block: u32,
}

/// Basic block in the control flow graph.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Basic block identifier (unique within function)
    pub id: u32,
    /// Start address of this basic block
    pub start_address: u64,
    /// Address just past the last instruction
    pub end_address: u64,
    /// Indices into the owning function's instruction list
    pub instructions: Range<usize>,
    /// Successor basic block IDs (targets of branches)
    pub successors: SmallVec<[u32; 2]>,
    /// Predecessor basic block IDs (blocks that branch to this block)
    pub predecessors: SmallVec<[u32; 2]>,
    /// Block ends in an indirect jump whose target is not known
    pub unresolved_successor: bool,
}

/// Edge in the control flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    /// Source basic block ID
    pub from: u32,
    /// Target basic block ID
    pub to: u32,
    /// Type of edge (determines control flow semantics)
    pub edge_type: EdgeType,
}

/// Type of control flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EdgeType {
    /// Unconditional branch (always taken)
    Unconditional = 0,
    /// Conditional branch - taken path
    ConditionalTrue = 1,
    /// Conditional branch - not-taken path
    ConditionalFalse = 2,
    /// Block ends without a branch because the next block starts
    FallThrough = 3,
}

/// Natural loop in the control flow graph.
#[derive(Debug, Clone)]
pub struct Loop {
    /// Loop header block ID (entry point of loop)
    pub header: u32,
    /// Back edges (latch -> header)
    pub back_edges: SmallVec<[(u32, u32); 2]>,
    /// Loop body (set of blocks in the loop), one bit per block
    pub body: BitVec<u32>,
    /// Blocks inside the loop with a successor outside it
    pub exits: SmallVec<[u32; 2]>,
    /// Iteration count inferred from the loop's compare, if any
    pub trip_count: Option<u32>,
}

impl Loop {
    /// Number of blocks in the loop body.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.body.count_ones()
    }

    /// Block ids of the loop body in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.body.iter_ones().map(|idx| idx as u32)
    }

    /// Number of CFG edges with both endpoints in the loop body.
    pub fn edge_count(&self, cfg: &ControlFlowGraph) -> usize {
        cfg.edges
            .iter()
            .filter(|e| self.contains(e.from) && self.contains(e.to))
            .count()
    }

    #[inline]
    pub fn contains(&self, block: u32) -> bool {
        self.body.get(block as usize).map(|b| *b).unwrap_or(false)
    }
}

/// Control flow analyzer for building and analyzing CFGs.
pub struct ControlFlowAnalyzer;

impl ControlFlowAnalyzer {
    /// Build a control flow graph from a function's instructions.
    ///
    /// # Arguments
    /// * `instructions` - Decoded instructions sorted by address
    /// * `entry_address` - Entry address of the function
    ///
    /// # Returns
    /// `ControlFlowGraph` - blocks in address order; an empty graph for no instructions
    ///
    /// # Examples
    /// ```rust,ignore
    /// let cfg = ControlFlowAnalyzer::build_cfg(&function.instructions, function.entry);
    /// let loops = ControlFlowAnalyzer::detect_loops(&cfg);
    /// ```
    pub fn build_cfg(instructions: &[Instruction], entry_address: u64) -> ControlFlowGraph {
        let mut nodes: Vec<BasicBlock> = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();
        let mut address_to_block: HashMap<u64, u32> = HashMap::new();

        // First pass: identify basic block boundaries
        let mut block_starts: HashSet<u64> = HashSet::new();
        block_starts.insert(entry_address);
        for (idx, inst) in instructions.iter().enumerate() {
            if !inst.kind.is_block_terminator() {
                continue;
            }
            if let Some(target) = inst.target {
                block_starts.insert(target);
            }
            let after: usize = if inst.delay_slot { idx + 2 } else { idx + 1 };
            if let Some(next) = instructions.get(after) {
                block_starts.insert(next.address);
            }
        }

        // Second pass: build basic blocks
        let mut start: usize = 0;
        let mut slot_pending: bool = false;
        for idx in 0..instructions.len() {
            let inst: &Instruction = &instructions[idx];
            let ends_here: bool = slot_pending || (inst.kind.is_block_terminator() && !inst.delay_slot);
            slot_pending = inst.kind.is_block_terminator() && inst.delay_slot;
            let next: Option<&Instruction> = instructions.get(idx + 1);
            let boundary: bool = match next {
                Some(n) => {
                    ends_here
                        || (block_starts.contains(&n.address) && !slot_pending)
                        || n.address != inst.next_address()
                }
                None => true,
            };
            if boundary {
                let block_id: u32 = nodes.len() as u32;
                let first: &Instruction = &instructions[start];
                address_to_block.insert(first.address, block_id);
                nodes.push(BasicBlock {
                    id: block_id,
                    start_address: first.address,
                    end_address: inst.next_address(),
                    instructions: start..idx + 1,
                    successors: SmallVec::new(),
                    predecessors: SmallVec::new(),
                    unresolved_successor: false,
                });
                start = idx + 1;
                slot_pending = false;
            }
        }

        // Third pass: identify edges
        for block_idx in 0..nodes.len() {
            let from: u32 = block_idx as u32;
            let control: Option<&Instruction> = Self::control_instruction(&nodes[block_idx], instructions);
            let fall_through: Option<u32> = address_to_block.get(&nodes[block_idx].end_address).copied();
            match control.map(|inst| (inst.kind, inst.target)) {
                Some((InstructionKind::Branch, target)) => {
                    if let Some(&to) = target.as_ref().and_then(|t| address_to_block.get(t)) {
                        edges.push(Edge {
                            from,
                            to,
                            edge_type: EdgeType::Unconditional,
                        });
                    }
                }
                Some((InstructionKind::ConditionalBranch, target)) => {
                    if let Some(&to) = target.as_ref().and_then(|t| address_to_block.get(t)) {
                        edges.push(Edge {
                            from,
                            to,
                            edge_type: EdgeType::ConditionalTrue,
                        });
                    }
                    if let Some(to) = fall_through {
                        edges.push(Edge {
                            from,
                            to,
                            edge_type: EdgeType::ConditionalFalse,
                        });
                    }
                }
                Some((InstructionKind::IndirectJump, _)) => nodes[block_idx].unresolved_successor = true,
                Some((InstructionKind::Return, _)) => {}
                _ => {
                    if let Some(to) = fall_through {
                        edges.push(Edge {
                            from,
                            to,
                            edge_type: EdgeType::FallThrough,
                        });
                    }
                }
            }
        }

        for edge in edges.iter() {
            if let Some(block) = nodes.get_mut(edge.from as usize) {
                if !block.successors.contains(&edge.to) {
                    block.successors.push(edge.to);
                }
            }
            if let Some(block) = nodes.get_mut(edge.to as usize) {
                if !block.predecessors.contains(&edge.from) {
                    block.predecessors.push(edge.from);
                }
            }
        }

        let entry_block: u32 = address_to_block.get(&entry_address).copied().unwrap_or(0);
        ControlFlowGraph {
            nodes,
            edges,
            entry_block,
        }
    }

    /// The instruction that decides where a block goes next.
    ///
    /// This is the last instruction, or the one before it when the last is a delay slot.
    pub fn control_instruction<'a>(block: &BasicBlock, instructions: &'a [Instruction]) -> Option<&'a Instruction> {
        let range: &[Instruction] = instructions.get(block.instructions.clone())?;
        match range {
            [.., branch, _slot] if branch.delay_slot && branch.kind.is_block_terminator() => Some(branch),
            [.., last] => Some(last),
            [] => None,
        }
    }

    /// Detect natural loops using depth-first search.
    ///
    /// Loops sharing a header are merged. The result is ordered by header block id.
    pub fn detect_loops(cfg: &ControlFlowGraph) -> Vec<Loop> {
        let block_count: usize = cfg.nodes.len();
        if block_count == 0 {
            return Vec::new();
        }
        let mut visited: BitVec<u32> = bitvec![u32, Lsb0; 0; block_count];
        let mut in_stack: BitVec<u32> = bitvec![u32, Lsb0; 0; block_count];
        let mut back_edges: Vec<(u32, u32)> = Vec::new();

        // Iterative DFS: (node, next successor index)
        let mut stack: Vec<(u32, usize)> = vec![(cfg.entry_block, 0)];
        visited.set(cfg.entry_block as usize, true);
        in_stack.set(cfg.entry_block as usize, true);
        while let Some((node, succ_idx)) = stack.last_mut() {
            let block: &BasicBlock = &cfg.nodes[*node as usize];
            if let Some(&succ) = block.successors.get(*succ_idx) {
                *succ_idx += 1;
                let from: u32 = *node;
                if !visited[succ as usize] {
                    visited.set(succ as usize, true);
                    in_stack.set(succ as usize, true);
                    stack.push((succ, 0));
                } else if in_stack[succ as usize] {
                    back_edges.push((from, succ));
                }
            } else {
                in_stack.set(*node as usize, false);
                stack.pop();
            }
        }

        let mut loops: Vec<Loop> = Vec::new();
        for (latch, header) in back_edges {
            let body: BitVec<u32> = Self::natural_loop_body(cfg, header, latch);
            if let Some(existing) = loops.iter_mut().find(|l| l.header == header) {
                existing.body |= body;
                existing.back_edges.push((latch, header));
            } else {
                loops.push(Loop {
                    header,
                    back_edges: SmallVec::from_slice(&[(latch, header)]),
                    body,
                    exits: SmallVec::new(),
                    trip_count: None,
                });
            }
        }

        for loop_ in loops.iter_mut() {
            let mut exits: SmallVec<[u32; 2]> = SmallVec::new();
            for block in loop_.body.iter_ones() {
                let leaves: bool = cfg.nodes[block]
                    .successors
                    .iter()
                    .any(|s| !loop_.body[*s as usize]);
                if leaves {
                    exits.push(block as u32);
                }
            }
            loop_.exits = exits;
            loop_.back_edges.sort_unstable();
        }
        loops.sort_by_key(|l| l.header);
        loops
    }

    /// Blocks that reach `latch` backwards without crossing `header`.
    fn natural_loop_body(cfg: &ControlFlowGraph, header: u32, latch: u32) -> BitVec<u32> {
        let mut body: BitVec<u32> = bitvec![u32, Lsb0; 0; cfg.nodes.len()];
        body.set(header as usize, true);
        let mut worklist: Vec<u32> = Vec::new();
        if !body[latch as usize] {
            body.set(latch as usize, true);
            worklist.push(latch);
        }
        while let Some(block) = worklist.pop() {
            for &pred in cfg.nodes[block as usize].predecessors.iter() {
                if !body[pred as usize] {
                    body.set(pred as usize, true);
                    worklist.push(pred);
                }
            }
        }
        body
    }

    /// Infer the iteration count of a loop.
    ///
    /// # Algorithm
    /// 1. A compare against an immediate in a latch or the header gives the bound directly
    /// 2. Otherwise, a register-register compare or a flag-setting decrement in the latch
    ///    identifies a counter register, and the last immediate loaded into it before the
    ///    header gives the bound
    ///
    /// # Returns
    /// `Option<u32>` - trip count in `1..=MAX_TRIP_COUNT`, `None` if not inferable
    pub fn infer_trip_count(cfg: &ControlFlowGraph, instructions: &[Instruction], loop_: &Loop) -> Option<u32> {
        let mut candidates: SmallVec<[u32; 3]> = loop_.back_edges.iter().map(|(latch, _)| *latch).collect();
        candidates.push(loop_.header);

        for &block_id in candidates.iter() {
            let block: &BasicBlock = cfg.nodes.get(block_id as usize)?;
            let body: &[Instruction] = instructions.get(block.instructions.clone())?;
            for inst in body.iter().rev() {
                if inst.kind == InstructionKind::Compare {
                    if let Some(value) = inst.immediate().filter(|v| (1..=MAX_TRIP_COUNT).contains(v)) {
                        return Some(value as u32);
                    }
                }
            }
        }

        let header_address: u64 = cfg.nodes.get(loop_.header as usize)?.start_address;
        for &block_id in candidates.iter() {
            let block: &BasicBlock = cfg.nodes.get(block_id as usize)?;
            let body: &[Instruction] = instructions.get(block.instructions.clone())?;
            for register in Self::counter_registers(body) {
                if let Some(value) = Self::initial_value(instructions, register, header_address) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Registers that plausibly hold a loop counter in a latch block.
    fn counter_registers(body: &[Instruction]) -> SmallVec<[u8; 4]> {
        let mut registers: SmallVec<[u8; 4]> = SmallVec::new();
        for inst in body.iter().rev() {
            match inst.kind {
                InstructionKind::ConditionalBranch | InstructionKind::Compare => {
                    for op in inst.operands.iter() {
                        if let Operand::Register(r) = op {
                            if !registers.contains(r) {
                                registers.push(*r);
                            }
                        }
                    }
                }
                InstructionKind::Arithmetic if inst.immediate().map(|v| v.abs() == 1).unwrap_or(false) => {
                    if let Some(r) = inst.destination() {
                        if !registers.contains(&r) {
                            registers.push(r);
                        }
                    }
                }
                _ => {}
            }
        }
        registers
    }

    /// Last immediate moved into `register` before `before`.
    fn initial_value(instructions: &[Instruction], register: u8, before: u64) -> Option<u32> {
        instructions
            .iter()
            .rev()
            .filter(|inst| inst.address < before)
            .find(|inst| inst.destination() == Some(register) && inst.kind == InstructionKind::Move)
            .and_then(|inst| match inst.operands.get(1) {
                Some(Operand::Immediate(v)) if (1..=MAX_TRIP_COUNT).contains(v) => Some(*v as u32),
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decoder::arm::decode_word;

    fn arm(words: &[u32], base: u64) -> Vec<Instruction> {
        words
            .iter()
            .enumerate()
            .map(|(i, w)| decode_word(*w, base + i as u64 * 4).unwrap())
            .collect()
    }

    /// mov r2,#0 ; loop: ldr r3,[r1,r2] ; eor r0,r0,r3 ; add r2,r2,#1 ; cmp r2,#10 ; bne loop ; bx lr
    fn round_loop() -> Vec<Instruction> {
        arm(
            &[0xE3A02000, 0xE7913002, 0xE0200003, 0xE2822001, 0xE352000A, 0x1AFFFFFA, 0xE12FFF1E],
            0x1000,
        )
    }

    #[test]
    fn test_build_cfg_blocks_and_edges() {
        let instructions = round_loop();
        let cfg = ControlFlowAnalyzer::build_cfg(&instructions, 0x1000);
        assert_eq!(cfg.nodes.len(), 3);
        assert_eq!(cfg.nodes[1].start_address, 0x1004);
        assert_eq!(cfg.nodes[1].instructions, 1..6);
        assert!(cfg.edges.contains(&Edge {
            from: 0,
            to: 1,
            edge_type: EdgeType::FallThrough
        }));
        assert!(cfg.edges.contains(&Edge {
            from: 1,
            to: 1,
            edge_type: EdgeType::ConditionalTrue
        }));
        assert!(cfg.edges.contains(&Edge {
            from: 1,
            to: 2,
            edge_type: EdgeType::ConditionalFalse
        }));
    }

    #[test]
    fn test_detect_loop_and_trip_count() {
        let instructions = round_loop();
        let cfg = ControlFlowAnalyzer::build_cfg(&instructions, 0x1000);
        let loops = ControlFlowAnalyzer::detect_loops(&cfg);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].header, 1);
        assert_eq!(loops[0].block_count(), 1);
        assert_eq!(loops[0].exits.as_slice(), &[1]);
        assert_eq!(ControlFlowAnalyzer::infer_trip_count(&cfg, &instructions, &loops[0]), Some(10));
    }

    #[test]
    fn test_trip_count_from_down_counter() {
        // mov r3,#14 ; loop: eor r0,r0,r1 ; subs r3,r3,#1 ; bne loop ; bx lr
        let instructions = arm(&[0xE3A0300E, 0xE0200001, 0xE2533001, 0x1AFFFFFC, 0xE12FFF1E], 0x2000);
        let cfg = ControlFlowAnalyzer::build_cfg(&instructions, 0x2000);
        let loops = ControlFlowAnalyzer::detect_loops(&cfg);
        assert_eq!(loops.len(), 1);
        assert_eq!(ControlFlowAnalyzer::infer_trip_count(&cfg, &instructions, &loops[0]), Some(14));
    }

    #[test]
    fn test_indirect_jump_marks_unresolved() {
        // ldr r0,[r1] ; bx r0
        let instructions = arm(&[0xE5910000, 0xE12FFF10], 0x3000);
        let cfg = ControlFlowAnalyzer::build_cfg(&instructions, 0x3000);
        assert_eq!(cfg.nodes.len(), 1);
        assert!(cfg.nodes[0].unresolved_successor);
        assert!(cfg.edges.is_empty());
    }

    #[test]
    fn test_empty_function() {
        let cfg = ControlFlowAnalyzer::build_cfg(&[], 0);
        assert!(cfg.nodes.is_empty());
        assert!(ControlFlowAnalyzer::detect_loops(&cfg).is_empty());
    }
}
