use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;

use thiserror::Error;

use crate::graph::{Adjacency, NodeId, NodeType, TunnelNode, TunnelProfile};

/// Default node cap. The chain resolver's longest-path search is exponential
/// on dense graphs, so profile size is bounded here.
pub const DEFAULT_MAX_NODES: usize = 64;

/// A structural or semantic problem that blocks execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("profile needs at least two nodes, found {0}")]
    TooFewNodes(usize),
    #[error("profile has {count} nodes, the limit is {limit}")]
    TooManyNodes { count: usize, limit: usize },
    #[error("profile needs exactly one local machine node, found {0}")]
    LocalMachineCount(usize),
    #[error("duplicate node id '{0}'")]
    DuplicateNode(NodeId),
    #[error("{node} ({node_type}) is missing required field '{field}'")]
    MissingField {
        node: NodeId,
        node_type: NodeType,
        field: &'static str,
    },
    #[error("{node}: {field} {value} is outside 1-65535")]
    PortOutOfRange {
        node: NodeId,
        field: &'static str,
        value: u32,
    },
    #[error("{node}: '{value}' is not a valid hostname or IP address")]
    InvalidHost { node: NodeId, value: String },
    #[error("edge {from} -> {to} references missing node '{missing}'")]
    DanglingEdge {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },
    #[error("edge {0} -> {0} is a self-loop")]
    SelfLoop(NodeId),
    #[error("cycle detected: {}", format_path(.0))]
    Cycle(Vec<NodeId>),
}

/// Non-fatal findings. Warnings never block execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationWarning {
    #[error("{0} is not reachable from the local machine")]
    Unreachable(NodeId),
    #[error("{0}: no remote host or connected target host, forwarding to localhost")]
    DefaultedToLocalhost(NodeId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// A self-loop counts: it is a cycle of length one.
    pub fn has_cycle(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, ValidationError::Cycle(_) | ValidationError::SelfLoop(_)))
    }
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    max_nodes: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

/// Validate with the default node cap.
pub fn validate(profile: &TunnelProfile) -> ValidationReport {
    Validator::default().validate(profile)
}

impl Validator {
    pub fn new(max_nodes: usize) -> Self {
        Self { max_nodes }
    }

    /// Run every check and accumulate the findings. Pure: no I/O, no logging.
    pub fn validate(&self, profile: &TunnelProfile) -> ValidationReport {
        let mut report = ValidationReport::default();

        let count = profile.nodes.len();
        if count < 2 {
            report.errors.push(ValidationError::TooFewNodes(count));
        }
        if count > self.max_nodes {
            report.errors.push(ValidationError::TooManyNodes {
                count,
                limit: self.max_nodes,
            });
        }

        let locals = profile.nodes_of(NodeType::LocalMachine).count();
        if locals != 1 {
            report.errors.push(ValidationError::LocalMachineCount(locals));
        }

        let mut seen = HashSet::new();
        for node in &profile.nodes {
            if !seen.insert(&node.id) {
                report.errors.push(ValidationError::DuplicateNode(node.id.clone()));
            }
        }

        check_edges(profile, &mut report);

        let adj = Adjacency::build(profile);
        for (i, node) in profile.nodes.iter().enumerate() {
            check_node(node, &adj, i, &mut report);
        }

        for cycle in find_cycles(&adj) {
            report.errors.push(ValidationError::Cycle(cycle));
        }

        if let Some(root) = profile.root() {
            for id in unreachable_from(&adj, &root.id) {
                report.warnings.push(ValidationWarning::Unreachable(id));
            }
        }

        report
    }
}

fn check_edges(profile: &TunnelProfile, report: &mut ValidationReport) {
    let known: HashSet<&NodeId> = profile.nodes.iter().map(|n| &n.id).collect();
    for edge in &profile.edges {
        for end in [&edge.source, &edge.target] {
            if !known.contains(end) {
                report.errors.push(ValidationError::DanglingEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    missing: end.clone(),
                });
            }
        }
        if edge.source == edge.target {
            report.errors.push(ValidationError::SelfLoop(edge.source.clone()));
        }
    }
}

fn check_node(node: &TunnelNode, adj: &Adjacency<'_>, index: usize, report: &mut ValidationReport) {
    let missing = |field: &'static str| ValidationError::MissingField {
        node: node.id.clone(),
        node_type: node.node_type,
        field,
    };

    for (field, value) in [
        ("local_port", node.local_port),
        ("remote_port", node.remote_port),
    ] {
        if let Some(port) = value {
            if !(1..=65535).contains(&port) {
                report.errors.push(ValidationError::PortOutOfRange {
                    node: node.id.clone(),
                    field,
                    value: port,
                });
            }
        }
    }

    if let Some(bind) = node.bind_address.as_deref() {
        if bind != "*" && !is_valid_host(bind) {
            report.errors.push(ValidationError::InvalidHost {
                node: node.id.clone(),
                value: bind.to_string(),
            });
        }
    }

    match node.node_type {
        NodeType::LocalMachine => {}
        NodeType::SshHost => {
            if node.host_id.as_deref().is_none_or(|h| h.trim().is_empty()) {
                report.errors.push(missing("host_id"));
            }
        }
        NodeType::TargetHost => match node.remote_host.as_deref() {
            None | Some("") => report.errors.push(missing("remote_host")),
            Some(host) if !is_valid_host(host) => {
                report.errors.push(ValidationError::InvalidHost {
                    node: node.id.clone(),
                    value: host.to_string(),
                });
            }
            Some(_) => {}
        },
        NodeType::LocalPort => {
            if node.local_port.is_none() {
                report.errors.push(missing("local_port"));
            }
            if node.remote_port.is_none() {
                report.errors.push(missing("remote_port"));
            }
        }
        NodeType::RemotePort => {
            if node.remote_port.is_none() {
                report.errors.push(missing("remote_port"));
            }
            if node.local_port.is_none() {
                report.errors.push(missing("local_port"));
            }
            let explicit = node
                .remote_host
                .as_deref()
                .is_some_and(|h| !h.trim().is_empty());
            let connected_target = adj
                .neighbours(index)
                .any(|n| adj.node(n).is(NodeType::TargetHost));
            if !explicit && !connected_target {
                report
                    .warnings
                    .push(ValidationWarning::DefaultedToLocalhost(node.id.clone()));
            }
        }
        NodeType::DynamicProxy => {
            if node.local_port.is_none() {
                report.errors.push(missing("local_port"));
            }
        }
    }
}

/// Iterative DFS with an explicit on-stack set; a successor that is still on
/// the stack closes a cycle. Each distinct cycle (by node set) is reported once.
fn find_cycles(adj: &Adjacency<'_>) -> Vec<Vec<NodeId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::New; adj.len()];
    let mut cycles = Vec::new();
    let mut reported: HashSet<Vec<usize>> = HashSet::new();

    for start in 0..adj.len() {
        if marks[start] != Mark::New {
            continue;
        }
        // (node, next outgoing edge to try)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::OnStack;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let succ = adj.outgoing(node).get(top.1).copied();
            top.1 += 1;
            match succ {
                Some(s) => match marks[s] {
                    Mark::New => {
                        marks[s] = Mark::OnStack;
                        stack.push((s, 0));
                    }
                    Mark::OnStack => {
                        let from = stack.iter().position(|&(n, _)| n == s).unwrap_or(0);
                        let members: Vec<usize> = stack[from..].iter().map(|&(n, _)| n).collect();
                        let mut key = members.clone();
                        key.sort_unstable();
                        if reported.insert(key) {
                            let mut path: Vec<NodeId> =
                                members.iter().map(|&n| adj.node(n).id.clone()).collect();
                            path.push(adj.node(s).id.clone());
                            cycles.push(path);
                        }
                    }
                    Mark::Done => {}
                },
                None => {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }

    cycles
}

/// BFS over outgoing edges from `root`; returns every node not reached.
fn unreachable_from(adj: &Adjacency<'_>, root: &NodeId) -> Vec<NodeId> {
    let Some(start) = adj.index_of(root) else {
        return Vec::new();
    };
    let mut reached = vec![false; adj.len()];
    reached[start] = true;
    let mut queue = VecDeque::from([start]);
    while let Some(n) = queue.pop_front() {
        for &s in adj.outgoing(n) {
            if !reached[s] {
                reached[s] = true;
                queue.push_back(s);
            }
        }
    }
    reached
        .iter()
        .enumerate()
        .filter(|(_, r)| !**r)
        .map(|(i, _)| adj.node(i).id.clone())
        .collect()
}

/// RFC 1123 hostname or IP literal (IPv6 may be bracketed).
pub fn is_valid_host(value: &str) -> bool {
    let bare = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);
    if bare.parse::<IpAddr>().is_ok() {
        return true;
    }
    if value.is_empty() || value.len() > 253 {
        return false;
    }
    let value = value.strip_suffix('.').unwrap_or(value);
    value.split('.').all(|label| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= 63
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TunnelNode;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn local() -> TunnelNode {
        TunnelNode::new("local", NodeType::LocalMachine)
    }

    fn ssh(id: &str) -> TunnelNode {
        TunnelNode::new(id, NodeType::SshHost).with_host_id(id)
    }

    fn chain_profile() -> TunnelProfile {
        TunnelProfile::new("p", "chain")
            .node(local())
            .node(ssh("a"))
            .node(ssh("b"))
            .node(
                TunnelNode::new("web", NodeType::LocalPort)
                    .with_local_port(8080)
                    .with_remote_port(80)
                    .with_remote_host("web.internal"),
            )
            .edge("local", "a")
            .edge("a", "b")
            .edge("b", "web")
    }

    #[test]
    fn valid_chain_passes() {
        let report = validate(&chain_profile());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn single_node_is_rejected() {
        let profile = TunnelProfile::new("p", "").node(local());
        let report = validate(&profile);
        assert_eq!(report.errors, vec![ValidationError::TooFewNodes(1)]);
    }

    #[test]
    fn local_machine_count_is_checked() {
        let none = TunnelProfile::new("p", "").node(ssh("a")).node(ssh("b"));
        assert!(validate(&none)
            .errors
            .contains(&ValidationError::LocalMachineCount(0)));

        let two = chain_profile().node(TunnelNode::new("local2", NodeType::LocalMachine));
        assert!(validate(&two)
            .errors
            .contains(&ValidationError::LocalMachineCount(2)));
    }

    #[test]
    fn errors_accumulate() {
        let profile = TunnelProfile::new("p", "")
            .node(local())
            .node(TunnelNode::new("a", NodeType::SshHost))
            .node(TunnelNode::new("d", NodeType::DynamicProxy).with_local_port(70000))
            .edge("local", "a")
            .edge("a", "nowhere");
        let report = validate(&profile);
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors.contains(&ValidationError::MissingField {
            node: NodeId::new("a"),
            node_type: NodeType::SshHost,
            field: "host_id",
        }));
        assert!(report.errors.contains(&ValidationError::PortOutOfRange {
            node: NodeId::new("d"),
            field: "local_port",
            value: 70000,
        }));
    }

    #[test]
    fn remote_port_requires_both_ports() {
        let profile = TunnelProfile::new("p", "")
            .node(local())
            .node(ssh("a"))
            .node(TunnelNode::new("r", NodeType::RemotePort).with_remote_host("localhost"))
            .edge("local", "a")
            .edge("a", "r");
        let report = validate(&profile);
        let fields: Vec<&str> = report
            .errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::MissingField { field, .. } => Some(*field),
                _ => None,
            })
            .collect();
        assert_eq!(fields, vec!["remote_port", "local_port"]);
    }

    #[test]
    fn remote_port_without_target_warns() {
        let profile = TunnelProfile::new("p", "")
            .node(local())
            .node(ssh("a"))
            .node(
                TunnelNode::new("r", NodeType::RemotePort)
                    .with_remote_port(9000)
                    .with_local_port(3000),
            )
            .edge("local", "a")
            .edge("a", "r");
        let report = validate(&profile);
        assert!(report.is_valid());
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::DefaultedToLocalhost(NodeId::new("r"))]
        );
    }

    #[test]
    fn remote_port_with_incoming_target_does_not_warn() {
        let profile = TunnelProfile::new("p", "")
            .node(local())
            .node(ssh("a"))
            .node(
                TunnelNode::new("r", NodeType::RemotePort)
                    .with_remote_port(9000)
                    .with_local_port(3000),
            )
            .node(TunnelNode::new("t", NodeType::TargetHost).with_remote_host("devbox"))
            .edge("local", "a")
            .edge("a", "t")
            .edge("t", "r");
        let report = validate(&profile);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn invalid_target_hostname_is_an_error() {
        let profile = TunnelProfile::new("p", "")
            .node(local())
            .node(TunnelNode::new("t", NodeType::TargetHost).with_remote_host("-bad-.example"))
            .edge("local", "t");
        let report = validate(&profile);
        assert_eq!(
            report.errors,
            vec![ValidationError::InvalidHost {
                node: NodeId::new("t"),
                value: "-bad-.example".to_string(),
            }]
        );
    }

    #[test]
    fn cycle_is_detected() {
        let profile = chain_profile().edge("b", "a");
        let report = validate(&profile);
        assert!(!report.is_valid());
        assert!(report.has_cycle());
        assert!(report.errors.contains(&ValidationError::Cycle(vec![
            NodeId::new("a"),
            NodeId::new("b"),
            NodeId::new("a"),
        ])));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let profile = chain_profile().edge("a", "a");
        let report = validate(&profile);
        assert!(!report.is_valid());
        assert!(report.has_cycle());
        assert!(report
            .errors
            .contains(&ValidationError::SelfLoop(NodeId::new("a"))));
    }

    #[test]
    fn unreachable_nodes_only_warn() {
        let profile = chain_profile().node(TunnelNode::new("orphan", NodeType::DynamicProxy).with_local_port(1080));
        let report = validate(&profile);
        assert!(report.is_valid());
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::Unreachable(NodeId::new("orphan"))]
        );
    }

    #[test]
    fn node_cap_is_enforced() {
        let report = Validator::new(3).validate(&chain_profile());
        assert!(report
            .errors
            .contains(&ValidationError::TooManyNodes { count: 4, limit: 3 }));
    }

    #[test]
    fn hostname_rules() {
        assert!(is_valid_host("db-1.internal"));
        assert!(is_valid_host("10.0.0.1"));
        assert!(is_valid_host("::1"));
        assert!(is_valid_host("[fe80::1]"));
        assert!(is_valid_host("example.com."));
        assert!(!is_valid_host(""));
        assert!(!is_valid_host("a..b"));
        assert!(!is_valid_host("under_score.com"));
        assert!(!is_valid_host("-lead.com"));
        assert!(!is_valid_host(&"a".repeat(64)));
    }

    /// A random DAG: edges only go from lower to higher index, node 0 is the
    /// local machine and every other node is an SSH host.
    fn dag(n: usize, edges: &[(usize, usize)]) -> TunnelProfile {
        let mut profile = TunnelProfile::new("p", "").node(local());
        for i in 1..n {
            profile = profile.node(ssh(&format!("h{i}")));
        }
        let name = |i: usize| if i == 0 { "local".to_string() } else { format!("h{i}") };
        for &(a, b) in edges {
            let (x, y) = (a % n, b % n);
            let (lo, hi) = (x.min(y), x.max(y));
            if lo != hi {
                profile = profile.edge(&name(lo), &name(hi));
            }
        }
        profile
    }

    proptest! {
        #[test]
        fn prop_acyclic_profiles_are_valid(
            n in 2usize..12,
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..30),
        ) {
            let report = validate(&dag(n, &edges));
            prop_assert!(report.is_valid(), "{:?}", report.errors);
        }

        #[test]
        fn prop_any_cycle_invalidates(
            n in 3usize..12,
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..30),
        ) {
            // Close a loop h1 -> h2 -> h1 on top of an otherwise valid DAG.
            let profile = dag(n, &edges).edge("h1", "h2").edge("h2", "h1");
            let report = validate(&profile);
            prop_assert!(!report.is_valid());
            prop_assert!(report.has_cycle());
        }
    }
}
