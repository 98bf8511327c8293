//! Protocol Sequence Reconstruction
//!
//! Orders detected primitives into protocol graphs (keygen → exchange → encrypt →
//! authenticate → verify) and scores each graph against known protocol templates.
//!
//! # Reconstruction Algorithm
//! 1. **Grouping**: detections whose functions are within the hop bound of each other in
//!    the undirected call graph form one instance (union-find, transitive)
//! 2. **Precedence** between two members:
//!    - same function: lower reference site first
//!    - one function reaches the other through calls: caller first
//!    - otherwise: call-site order inside the nearest common caller
//!    - mutual reachability produces edges both ways
//! 3. **Cycle check**: DFS coloring; a cyclic instance is reported as a diagnostic and
//!    excluded
//! 4. **Ordering**: Kahn's algorithm, ties by primary offset then kind; edges reduced to
//!    their transitive reduction
//! 5. **Roles and anomaly**: each node gets a role; the anomaly score is the smallest
//!    normalized edit distance to a template
//!
//! Graphs use stable integer node ids and an explicit edge list.

use crate::engine::analysis::call_graph::CallGraph;
use crate::engine::error::Diagnostic;
use crate::engine::matcher::{Detection, PrimitiveKind};
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Default call-graph distance within which detections belong to one protocol.
pub const DEFAULT_HOP_BOUND: u32 = 5;
/// Template distance above which a graph counts as a custom protocol.
pub const CUSTOM_PROTOCOL_THRESHOLD: f64 = 0.5;

/// Role of a primitive invocation within a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolRole {
    KeyGen = 0,
    Exchange = 1,
    Encrypt = 2,
    Authenticate = 3,
    Verify = 4,
    Hash = 5,
}

impl ProtocolRole {
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolRole::KeyGen => "KeyGen",
            ProtocolRole::Exchange => "Key Exchange",
            ProtocolRole::Encrypt => "Encrypt",
            ProtocolRole::Authenticate => "Authenticate",
            ProtocolRole::Verify => "Verify",
            ProtocolRole::Hash => "Hash",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolNode {
    /// Position in topological order
    pub id: u32,
    pub role: ProtocolRole,
    pub label: String,
    /// Algorithm name of the linked detection
    pub primitive: String,
    pub kind: PrimitiveKind,
    /// Index of the linked detection in the report
    pub detection: usize,
    pub offsets: Vec<u64>,
    pub function: u64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolEdge {
    pub from: u32,
    pub to: u32,
}

/// One reconstructed protocol instance. Edges always form a DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolGraph {
    pub instance: usize,
    pub nodes: Vec<ProtocolNode>,
    pub edges: Vec<ProtocolEdge>,
    /// Distance to the nearest template in [0,1]; 1.0 for custom protocols
    pub anomaly_score: f64,
    /// Name of the nearest template, `None` for custom protocols
    pub template: Option<String>,
}

/// Output of reconstruction.
#[derive(Debug, Clone, Default)]
pub struct ProtocolAnalysis {
    pub graphs: Vec<ProtocolGraph>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Known protocol shape: a role chain.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolTemplate {
    pub name: &'static str,
    pub roles: &'static [ProtocolRole],
}

impl ProtocolTemplate {
    fn edge_pairs(&self) -> Vec<(ProtocolRole, ProtocolRole)> {
        self.roles.windows(2).map(|w| (w[0], w[1])).collect()
    }
}

pub const TEMPLATES: &[ProtocolTemplate] = &[
    ProtocolTemplate {
        name: "TLS-like handshake",
        roles: &[
            ProtocolRole::KeyGen,
            ProtocolRole::Exchange,
            ProtocolRole::Encrypt,
            ProtocolRole::Authenticate,
            ProtocolRole::Verify,
        ],
    },
    ProtocolTemplate {
        name: "AEAD session",
        roles: &[ProtocolRole::KeyGen, ProtocolRole::Encrypt, ProtocolRole::Authenticate],
    },
    ProtocolTemplate {
        name: "Signed update",
        roles: &[ProtocolRole::Hash, ProtocolRole::Verify],
    },
    ProtocolTemplate {
        name: "Key exchange with bulk encryption",
        roles: &[ProtocolRole::Exchange, ProtocolRole::Encrypt],
    },
];

/// Detection taking part in reconstruction.
#[derive(Debug, Clone, Copy)]
struct Member {
    detection: usize,
    node: u32,
    site: u64,
    offset: u64,
    kind: PrimitiveKind,
}

impl Member {
    fn tie_key(&self) -> (u64, &'static str) {
        (self.offset, self.kind.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precedence {
    Before,
    After,
    Both,
    Unordered,
}

pub struct ProtocolReconstructor {
    hop_bound: u32,
}

impl Default for ProtocolReconstructor {
    fn default() -> Self {
        Self::new(DEFAULT_HOP_BOUND)
    }
}

impl ProtocolReconstructor {
    pub fn new(hop_bound: u32) -> Self {
        Self { hop_bound }
    }

    /// Reconstruct protocol graphs from detections.
    ///
    /// # Arguments
    /// * `detections` - Matcher output; only detections with a source function take part
    /// * `call_graph` - Call graph of the image's functions
    ///
    /// # Returns
    /// `ProtocolAnalysis` - acyclic graphs in instance order, plus one
    /// `CyclicProtocolGraph` diagnostic per excluded instance
    pub fn reconstruct(&self, detections: &[Detection], call_graph: &CallGraph) -> ProtocolAnalysis {
        let members: Vec<Member> = detections
            .iter()
            .enumerate()
            .filter_map(|(idx, d)| {
                let node: u32 = call_graph.node_of(d.function?)?;
                Some(Member {
                    detection: idx,
                    node,
                    site: d.site.unwrap_or_else(|| d.primary_offset()),
                    offset: d.primary_offset(),
                    kind: d.kind,
                })
            })
            .collect();

        let mut analysis = ProtocolAnalysis::default();
        let mut instance: usize = 0;
        for group in self.group(&members, call_graph) {
            if group.len() < 2 {
                continue;
            }
            let group_members: Vec<Member> = group.iter().map(|&m| members[m]).collect();
            match self.build_graph(instance, &group_members, detections, call_graph) {
                Ok(graph) => {
                    log::debug!(
                        "Protocol instance {}: {} nodes, {} edges, anomaly {:.2}",
                        instance,
                        graph.nodes.len(),
                        graph.edges.len(),
                        graph.anomaly_score
                    );
                    analysis.graphs.push(graph);
                }
                Err(diagnostic) => {
                    log::warn!("{}", diagnostic.message);
                    analysis.diagnostics.push(diagnostic);
                }
            }
            instance += 1;
        }
        log::info!(
            "Reconstructed {} protocol graphs ({} cyclic)",
            analysis.graphs.len(),
            analysis.diagnostics.len()
        );
        analysis
    }

    /// Union-find over call-graph proximity; groups ordered by lowest member offset.
    fn group(&self, members: &[Member], call_graph: &CallGraph) -> Vec<Vec<usize>> {
        let mut parent: Vec<usize> = (0..members.len()).collect();
        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        let mut distances: HashMap<u32, HashMap<u32, u32>> = HashMap::new();
        for i in 0..members.len() {
            let near = distances
                .entry(members[i].node)
                .or_insert_with(|| call_graph.undirected_distances(members[i].node, self.hop_bound));
            let linked: Vec<usize> = (i + 1..members.len())
                .filter(|&j| near.contains_key(&members[j].node))
                .collect();
            for j in linked {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..members.len() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
        for group in groups.iter_mut() {
            group.sort_by(|a, b| members[*a].tie_key().cmp(&members[*b].tie_key()));
        }
        groups.sort_by(|a, b| members[a[0]].tie_key().cmp(&members[b[0]].tie_key()));
        groups
    }

    fn precedence(&self, a: &Member, b: &Member, call_graph: &CallGraph) -> Precedence {
        if a.node == b.node {
            return match (a.site, a.tie_key()).cmp(&(b.site, b.tie_key())) {
                Ordering::Less => Precedence::Before,
                Ordering::Greater => Precedence::After,
                Ordering::Equal => Precedence::Unordered,
            };
        }
        let forward: bool = call_graph.reaches(a.node, b.node, self.hop_bound);
        let backward: bool = call_graph.reaches(b.node, a.node, self.hop_bound);
        match (forward, backward) {
            (true, true) => return Precedence::Both,
            (true, false) => return Precedence::Before,
            (false, true) => return Precedence::After,
            (false, false) => {}
        }

        let Some(caller) = call_graph.nearest_common_caller(a.node, b.node, self.hop_bound) else {
            return Precedence::Unordered;
        };
        let site_a = call_graph.first_call_site_toward(caller, a.node, self.hop_bound);
        let site_b = call_graph.first_call_site_toward(caller, b.node, self.hop_bound);
        match (site_a, site_b) {
            (Some(sa), Some(sb)) if sa < sb => Precedence::Before,
            (Some(sa), Some(sb)) if sa > sb => Precedence::After,
            _ => Precedence::Unordered,
        }
    }

    fn build_graph(
        &self,
        instance: usize,
        members: &[Member],
        detections: &[Detection],
        call_graph: &CallGraph,
    ) -> Result<ProtocolGraph, Diagnostic> {
        let n: usize = members.len();
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for i in 0..n {
            for j in i + 1..n {
                match self.precedence(&members[i], &members[j], call_graph) {
                    Precedence::Before => {
                        successors[i].insert(j);
                    }
                    Precedence::After => {
                        successors[j].insert(i);
                    }
                    Precedence::Both => {
                        successors[i].insert(j);
                        successors[j].insert(i);
                    }
                    Precedence::Unordered => {}
                }
            }
        }

        if let Some(cycle) = find_cycle(&successors) {
            let names: Vec<String> = cycle
                .iter()
                .map(|&m| format!("{}@0x{:X}", members[m].kind, members[m].offset))
                .collect();
            return Err(Diagnostic::cyclic_protocol(instance, &names));
        }

        let order: Vec<usize> = topological_order(members, &successors);
        let mut position: Vec<u32> = vec![0; n];
        for (pos, &m) in order.iter().enumerate() {
            position[m] = pos as u32;
        }

        let reach: Vec<BitVec> = reachability(&order, &successors, n);
        let mut edges: Vec<ProtocolEdge> = Vec::new();
        for (u, succ) in successors.iter().enumerate() {
            for &v in succ.iter() {
                let redundant: bool = succ.iter().any(|&w| w != v && reach[w][v]);
                if !redundant {
                    edges.push(ProtocolEdge {
                        from: position[u],
                        to: position[v],
                    });
                }
            }
        }
        edges.sort();

        // roles in topological order so an Encrypt ancestor is known before its descendants
        let mut roles: Vec<ProtocolRole> = vec![ProtocolRole::Hash; n];
        for &m in order.iter() {
            let encrypt_before: bool = order
                .iter()
                .take_while(|&&o| o != m)
                .any(|&o| roles[o] == ProtocolRole::Encrypt && reach[o][m]);
            roles[m] = role_of(members[m].kind, encrypt_before);
        }

        let nodes: Vec<ProtocolNode> = order
            .iter()
            .map(|&m| {
                let detection: &Detection = &detections[members[m].detection];
                ProtocolNode {
                    id: position[m],
                    role: roles[m],
                    label: roles[m].label().to_string(),
                    primitive: detection.algorithm_name(),
                    kind: detection.kind,
                    detection: members[m].detection,
                    offsets: detection.offsets.clone(),
                    function: detection.function.unwrap_or(0),
                    confidence: detection.confidence,
                }
            })
            .collect();

        let role_sequence: Vec<ProtocolRole> = nodes.iter().map(|node| node.role).collect();
        let edge_roles: Vec<(ProtocolRole, ProtocolRole)> = edges
            .iter()
            .map(|e| (nodes[e.from as usize].role, nodes[e.to as usize].role))
            .collect();
        let (anomaly_score, template) = score_against_templates(&role_sequence, &edge_roles);

        Ok(ProtocolGraph {
            instance,
            nodes,
            edges,
            anomaly_score,
            template,
        })
    }
}

/// Role of a primitive kind.
pub fn role_of(kind: PrimitiveKind, encrypt_before: bool) -> ProtocolRole {
    match kind.family() {
        PrimitiveKind::Prng => ProtocolRole::KeyGen,
        PrimitiveKind::Rsa | PrimitiveKind::Ecc if encrypt_before => ProtocolRole::Verify,
        PrimitiveKind::Rsa | PrimitiveKind::Ecc => ProtocolRole::Exchange,
        PrimitiveKind::Aes | PrimitiveKind::Des | PrimitiveKind::ChaCha20 | PrimitiveKind::Proprietary => {
            ProtocolRole::Encrypt
        }
        PrimitiveKind::Poly1305 => ProtocolRole::Authenticate,
        _ => ProtocolRole::Hash,
    }
}

/// Members on a cycle, if the precedence graph has one (DFS coloring).
fn find_cycle(successors: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;
    let n: usize = successors.len();
    let mut color: Vec<u8> = vec![WHITE; n];

    for root in 0..n {
        if color[root] != WHITE {
            continue;
        }
        let mut path: Vec<usize> = vec![root];
        let mut stack: Vec<std::collections::btree_set::Iter<'_, usize>> = vec![successors[root].iter()];
        color[root] = GRAY;
        while let Some(iter) = stack.last_mut() {
            match iter.next() {
                Some(&next) if color[next] == GRAY => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                Some(&next) if color[next] == WHITE => {
                    color[next] = GRAY;
                    path.push(next);
                    stack.push(successors[next].iter());
                }
                Some(_) => {}
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        color[done] = BLACK;
                    }
                }
            }
        }
    }
    None
}

/// Kahn's algorithm with ready members ordered by (offset, kind name).
fn topological_order(members: &[Member], successors: &[BTreeSet<usize>]) -> Vec<usize> {
    let n: usize = members.len();
    let mut in_degree: Vec<usize> = vec![0; n];
    for succ in successors.iter() {
        for &v in succ.iter() {
            in_degree[v] += 1;
        }
    }
    let key = |m: usize| (members[m].offset, members[m].kind.name(), m);
    let mut ready: BTreeSet<(u64, &'static str, usize)> =
        (0..n).filter(|&m| in_degree[m] == 0).map(key).collect();
    let mut order: Vec<usize> = Vec::with_capacity(n);
    while let Some(first) = ready.iter().next().copied() {
        ready.remove(&first);
        let m: usize = first.2;
        order.push(m);
        for &v in successors[m].iter() {
            in_degree[v] -= 1;
            if in_degree[v] == 0 {
                ready.insert(key(v));
            }
        }
    }
    order
}

/// Strict descendants of every member, computed in reverse topological order.
fn reachability(order: &[usize], successors: &[BTreeSet<usize>], n: usize) -> Vec<BitVec> {
    let mut reach: Vec<BitVec> = vec![bitvec![0; n]; n];
    for &u in order.iter().rev() {
        let mut bits: BitVec = bitvec![0; n];
        for &v in successors[u].iter() {
            bits.set(v, true);
            for descendant in reach[v].iter_ones() {
                bits.set(descendant, true);
            }
        }
        reach[u] = bits;
    }
    reach
}

/// Levenshtein distance between two sequences.
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current: Vec<usize> = vec![0; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution: usize = previous[j] + usize::from(x != y);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Smallest normalized distance to a template, and that template's name.
///
/// Distances above [`CUSTOM_PROTOCOL_THRESHOLD`] yield `(1.0, None)`.
pub fn score_against_templates(
    roles: &[ProtocolRole],
    edge_roles: &[(ProtocolRole, ProtocolRole)],
) -> (f64, Option<String>) {
    let mut best: Option<(f64, &'static str)> = None;
    for template in TEMPLATES.iter() {
        let template_edges = template.edge_pairs();
        let span: usize = roles.len().max(template.roles.len()) + edge_roles.len().max(template_edges.len());
        if span == 0 {
            continue;
        }
        let distance: usize = edit_distance(roles, template.roles) + edit_distance(edge_roles, &template_edges);
        let normalized: f64 = distance as f64 / span as f64;
        if best.map_or(true, |(score, _)| normalized < score) {
            best = Some((normalized, template.name));
        }
    }
    match best {
        Some((score, name)) if score <= CUSTOM_PROTOCOL_THRESHOLD => (score, Some(name.to_string())),
        _ => (1.0, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::analysis::control_flow::ControlFlowGraph;
    use crate::engine::analysis::{CallSite, Function};
    use crate::engine::matcher::DetectionMetadata;

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

    fn detection(kind: PrimitiveKind, offset: u64, function: u64, site: u64) -> Detection {
        Detection {
            kind,
            confidence: 0.8,
            offsets: vec![offset],
            section: Some(".text".to_string()),
            function: Some(function),
            site: Some(site),
            signature_score: 1.0,
            structural_score: 0.5,
            metadata: DetectionMetadata::default(),
        }
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance(b"kitten", b"sitting"), 3);
        assert_eq!(edit_distance::<u8>(&[], b"abc"), 3);
    }

    #[test]
    fn test_aead_session_in_call_order() {
        // main(0x100) calls rng(0x200), cipher(0x300), mac(0x400) in that order
        let functions = vec![
            function(0x100, &[(0x110, 0x200), (0x120, 0x300), (0x130, 0x400)]),
            function(0x200, &[]),
            function(0x300, &[]),
            function(0x400, &[]),
        ];
        let graph = CallGraph::build(&functions);
        // offsets deliberately out of call order
        let detections = vec![
            detection(PrimitiveKind::Poly1305, 0x1000, 0x400, 0x404),
            detection(PrimitiveKind::Aes128, 0x2000, 0x300, 0x304),
            detection(PrimitiveKind::Prng, 0x3000, 0x200, 0x204),
        ];
        let analysis = ProtocolReconstructor::default().reconstruct(&detections, &graph);
        assert!(analysis.diagnostics.is_empty());
        assert_eq!(analysis.graphs.len(), 1);
        let g = &analysis.graphs[0];
        let roles: Vec<ProtocolRole> = g.nodes.iter().map(|n| n.role).collect();
        assert_eq!(
            roles,
            vec![ProtocolRole::KeyGen, ProtocolRole::Encrypt, ProtocolRole::Authenticate]
        );
        // transitive reduction keeps the chain only
        assert_eq!(
            g.edges,
            vec![ProtocolEdge { from: 0, to: 1 }, ProtocolEdge { from: 1, to: 2 }]
        );
        assert_eq!(g.anomaly_score, 0.0);
        assert_eq!(g.template.as_deref(), Some("AEAD session"));
    }

    #[test]
    fn test_verify_after_encrypt() {
        let functions = vec![function(0x100, &[])];
        let graph = CallGraph::build(&functions);
        let detections = vec![
            detection(PrimitiveKind::Aes, 0x500, 0x100, 0x104),
            detection(PrimitiveKind::Rsa, 0x600, 0x100, 0x108),
        ];
        let analysis = ProtocolReconstructor::default().reconstruct(&detections, &graph);
        let g = &analysis.graphs[0];
        assert_eq!(g.nodes[1].role, ProtocolRole::Verify);
    }

    #[test]
    fn test_mutual_recursion_is_reported() {
        // 0x100 and 0x200 call each other
        let functions = vec![function(0x100, &[(0x104, 0x200)]), function(0x200, &[(0x204, 0x100)])];
        let graph = CallGraph::build(&functions);
        let detections = vec![
            detection(PrimitiveKind::Sha256, 0x900, 0x100, 0x108),
            detection(PrimitiveKind::Ecc, 0xA00, 0x200, 0x208),
        ];
        let analysis = ProtocolReconstructor::default().reconstruct(&detections, &graph);
        assert!(analysis.graphs.is_empty());
        assert_eq!(analysis.diagnostics.len(), 1);
        assert_eq!(analysis.diagnostics[0].code, "CyclicProtocolGraph");
    }

    #[test]
    fn test_singletons_and_distant_functions() {
        // 0x100 -> 0x200 -> ... -> 0x800 chain of 7 hops
        let entries: Vec<u64> = (1..=8).map(|i| i * 0x100).collect();
        let functions: Vec<Function> = entries
            .iter()
            .enumerate()
            .map(|(i, &e)| match entries.get(i + 1) {
                Some(&next) => function(e, &[(e + 4, next)]),
                None => function(e, &[]),
            })
            .collect();
        let graph = CallGraph::build(&functions);
        let detections = vec![
            detection(PrimitiveKind::Aes, 0x100, 0x100, 0x104),
            detection(PrimitiveKind::Sha1, 0x800, 0x800, 0x804),
        ];
        let analysis = ProtocolReconstructor::new(5).reconstruct(&detections, &graph);
        assert!(analysis.graphs.is_empty());
        assert!(analysis.diagnostics.is_empty());
        let widened = ProtocolReconstructor::new(7).reconstruct(&detections, &graph);
        assert_eq!(widened.graphs.len(), 1);
    }

    #[test]
    fn test_custom_protocol() {
        let roles = [ProtocolRole::Hash, ProtocolRole::Hash, ProtocolRole::Hash];
        let edges = [
            (ProtocolRole::Hash, ProtocolRole::Hash),
            (ProtocolRole::Hash, ProtocolRole::Hash),
        ];
        assert_eq!(score_against_templates(&roles, &edges), (1.0, None));
    }
}
