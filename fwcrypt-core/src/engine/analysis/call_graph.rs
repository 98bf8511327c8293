//! Call Graph
//!
//! Inter-procedural call graph over recovered functions. Nodes are stable indices into
//! the function list (entry order); edges are explicit (caller, callee) pairs with the
//! call-site addresses that produce them.

use crate::engine::analysis::Function;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};

/// Call graph node.
#[derive(Debug, Clone)]
pub struct FunctionNode {
    pub entry: u64,
    /// Callee node indices, ascending
    pub callees: SmallVec<[u32; 4]>,
    /// Caller node indices, ascending
    pub callers: SmallVec<[u32; 4]>,
}

/// Caller -> callee edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    pub caller: u32,
    pub callee: u32,
    /// Call instruction addresses, ascending
    pub call_sites: SmallVec<[u64; 2]>,
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    pub nodes: Vec<FunctionNode>,
    pub edges: Vec<CallEdge>,
    index: HashMap<u64, u32>,
}

impl CallGraph {
    /// Build the call graph from direct call sites.
    ///
    /// Calls whose target is not a function entry are ignored.
    pub fn build(functions: &[Function]) -> Self {
        let index: HashMap<u64, u32> = functions
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.entry, idx as u32))
            .collect();
        let mut nodes: Vec<FunctionNode> = functions
            .iter()
            .map(|f| FunctionNode {
                entry: f.entry,
                callees: SmallVec::new(),
                callers: SmallVec::new(),
            })
            .collect();
        let mut edge_index: HashMap<(u32, u32), usize> = HashMap::new();
        let mut edges: Vec<CallEdge> = Vec::new();

        for (caller_idx, function) in functions.iter().enumerate() {
            let caller: u32 = caller_idx as u32;
            for site in function.call_sites.iter() {
                let callee: u32 = match site.target.and_then(|t| index.get(&t)) {
                    Some(&callee) => callee,
                    None => continue,
                };
                match edge_index.get(&(caller, callee)) {
                    Some(&e) => edges[e].call_sites.push(site.address),
                    None => {
                        edge_index.insert((caller, callee), edges.len());
                        edges.push(CallEdge {
                            caller,
                            callee,
                            call_sites: SmallVec::from_slice(&[site.address]),
                        });
                        nodes[caller_idx].callees.push(callee);
                        nodes[callee as usize].callers.push(caller);
                    }
                }
            }
        }
        for node in nodes.iter_mut() {
            node.callees.sort_unstable();
            node.callers.sort_unstable();
        }
        for edge in edges.iter_mut() {
            edge.call_sites.sort_unstable();
        }
        edges.sort_by_key(|e| (e.caller, e.callee));

        Self { nodes, edges, index }
    }

    /// Node index of the function with this entry address.
    #[inline]
    pub fn node_of(&self, entry: u64) -> Option<u32> {
        self.index.get(&entry).copied()
    }

    /// Hop distances ignoring edge direction, up to `max_hops`.
    pub fn undirected_distances(&self, from: u32, max_hops: u32) -> HashMap<u32, u32> {
        self.bfs(from, max_hops, |node| {
            node.callees.iter().chain(node.callers.iter()).copied().collect()
        })
    }

    /// Hop distances following calls (caller to callee), up to `max_hops`.
    pub fn forward_distances(&self, from: u32, max_hops: u32) -> HashMap<u32, u32> {
        self.bfs(from, max_hops, |node| node.callees.iter().copied().collect())
    }

    /// Hop distances following calls backwards (callee to caller), up to `max_hops`.
    pub fn caller_distances(&self, from: u32, max_hops: u32) -> HashMap<u32, u32> {
        self.bfs(from, max_hops, |node| node.callers.iter().copied().collect())
    }

    /// Whether `from` reaches `to` by calls within `max_hops` (a node reaches itself).
    pub fn reaches(&self, from: u32, to: u32, max_hops: u32) -> bool {
        self.forward_distances(from, max_hops).contains_key(&to)
    }

    /// Closest function that (transitively) calls both `a` and `b`.
    ///
    /// Minimizes the larger of the two distances, then their sum, then the node index.
    pub fn nearest_common_caller(&self, a: u32, b: u32, max_hops: u32) -> Option<u32> {
        let from_a: HashMap<u32, u32> = self.caller_distances(a, max_hops);
        let from_b: HashMap<u32, u32> = self.caller_distances(b, max_hops);
        from_a
            .iter()
            .filter_map(|(node, da)| from_b.get(node).map(|db| (*node, *da, *db)))
            .min_by_key(|(node, da, db)| ((*da).max(*db), da + db, *node))
            .map(|(node, _, _)| node)
    }

    /// Earliest call site in `caller` whose callee is or reaches `target`.
    pub fn first_call_site_toward(&self, caller: u32, target: u32, max_hops: u32) -> Option<u64> {
        self.edges
            .iter()
            .filter(|e| e.caller == caller)
            .filter(|e| e.callee == target || self.reaches(e.callee, target, max_hops))
            .filter_map(|e| e.call_sites.first().copied())
            .min()
    }

    fn bfs<F>(&self, from: u32, max_hops: u32, neighbors: F) -> HashMap<u32, u32>
    where
        F: Fn(&FunctionNode) -> SmallVec<[u32; 8]>,
    {
        let mut distances: HashMap<u32, u32> = HashMap::new();
        if from as usize >= self.nodes.len() {
            return distances;
        }
        let mut queue: VecDeque<u32> = VecDeque::new();
        distances.insert(from, 0);
        queue.push_back(from);
        while let Some(node) = queue.pop_front() {
            let depth: u32 = distances[&node];
            if depth >= max_hops {
                continue;
            }
            for next in neighbors(&self.nodes[node as usize]) {
                if !distances.contains_key(&next) {
                    distances.insert(next, depth + 1);
                    queue.push_back(next);
                }
            }
        }
        distances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::analysis::control_flow::ControlFlowGraph;
    use crate::engine::analysis::CallSite;

    fn function(entry: u64, calls: &[(u64, u64)]) -> Function {
        Function {
            entry,
            name: None,
            section: ".text".to_string(),
            instructions: Vec::new(),
            cfg: ControlFlowGraph::default(),
            loops: Vec::new(),
            call_sites: calls
                .iter()
                .map(|(address, target)| CallSite {
                    address: *address,
                    target: Some(*target),
                })
                .collect(),
            data_refs: Vec::new(),
        }
    }

    /// main(0x100) calls keygen(0x200) then encrypt(0x300); encrypt calls mac(0x400).
    fn sample() -> CallGraph {
        CallGraph::build(&[
            function(0x100, &[(0x110, 0x200), (0x120, 0x300)]),
            function(0x200, &[]),
            function(0x300, &[(0x310, 0x400)]),
            function(0x400, &[]),
        ])
    }

    #[test]
    fn test_build_edges() {
        let graph = sample();
        assert_eq!(graph.edges.len(), 3);
        assert_eq!(graph.nodes[0].callees.as_slice(), &[1, 2]);
        assert_eq!(graph.nodes[3].callers.as_slice(), &[2]);
        assert_eq!(graph.node_of(0x300), Some(2));
    }

    #[test]
    fn test_reachability_and_distances() {
        let graph = sample();
        assert!(graph.reaches(0, 3, 5));
        assert!(!graph.reaches(3, 0, 5));
        assert!(!graph.reaches(0, 3, 1));
        let distances = graph.undirected_distances(1, 5);
        assert_eq!(distances.get(&3), Some(&3));
    }

    #[test]
    fn test_common_caller_ordering() {
        let graph = sample();
        assert_eq!(graph.nearest_common_caller(1, 3, 5), Some(0));
        assert_eq!(graph.first_call_site_toward(0, 1, 5), Some(0x110));
        assert_eq!(graph.first_call_site_toward(0, 3, 5), Some(0x120));
    }
}
