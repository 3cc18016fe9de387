use std::collections::{BTreeSet, HashMap, HashSet};

use cascade_core::error::{CascadeError, Result};
use cascade_core::graph::{WorkflowGraph, WorkflowNode};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Execution view of a workflow graph.
///
/// Built once per cascade. Construction validates every edge and rejects
/// cycles, so nothing downstream ever sees an unschedulable graph. Visual
/// nodes and the edges touching them are dropped; paused nodes stay in the
/// adjacency so their descendants remain reachable.
pub struct Topology<'a> {
    graph: &'a WorkflowGraph,
    /// Node indices into `graph.nodes` that take part in execution.
    executable: Vec<usize>,
    index: HashMap<&'a str, usize>,
    forward: Vec<Vec<usize>>,
    reverse: Vec<Vec<usize>>,
    /// Kahn order over all executable nodes, ties by declaration order.
    order: Vec<usize>,
}

impl<'a> Topology<'a> {
    pub fn build(graph: &'a WorkflowGraph) -> Result<Self> {
        let index: HashMap<&str, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut forward = vec![Vec::new(); graph.nodes.len()];
        let mut reverse = vec![Vec::new(); graph.nodes.len()];

        for edge in &graph.edges {
            let src = *index
                .get(edge.source.as_str())
                .ok_or_else(|| CascadeError::UnknownNodeReference {
                    node_id: edge.source.clone(),
                })?;
            let dst = *index
                .get(edge.target.as_str())
                .ok_or_else(|| CascadeError::UnknownNodeReference {
                    node_id: edge.target.clone(),
                })?;

            if !graph.nodes[src].kind.is_executable() || !graph.nodes[dst].kind.is_executable() {
                continue;
            }
            // Parallel edges between different ports collapse to one dependency
            if !forward[src].contains(&dst) {
                forward[src].push(dst);
                reverse[dst].push(src);
            }
        }

        let executable: Vec<usize> = (0..graph.nodes.len())
            .filter(|&i| graph.nodes[i].kind.is_executable())
            .collect();

        let mut topo = Self {
            graph,
            executable,
            index,
            forward,
            reverse,
            order: Vec::new(),
        };
        topo.detect_cycle()?;
        topo.order = topo.kahn();
        Ok(topo)
    }

    /// White/grey/black DFS. Returns the first cycle found in declaration
    /// order, closed on its entry node.
    fn detect_cycle(&self) -> Result<()> {
        let mut marks = vec![Mark::White; self.graph.nodes.len()];
        let mut stack = Vec::new();

        for &start in &self.executable {
            if marks[start] == Mark::White {
                if let Some(path) = self.visit(start, &mut marks, &mut stack) {
                    return Err(CascadeError::CycleDetected { path });
                }
            }
        }
        Ok(())
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<String>> {
        marks[node] = Mark::Grey;
        stack.push(node);

        for &next in &self.forward[node] {
            match marks[next] {
                Mark::Grey => {
                    let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut path: Vec<String> = stack[from..]
                        .iter()
                        .map(|&i| self.graph.nodes[i].id.clone())
                        .collect();
                    path.push(self.graph.nodes[next].id.clone());
                    return Some(path);
                }
                Mark::White => {
                    if let Some(path) = self.visit(next, marks, stack) {
                        return Some(path);
                    }
                }
                Mark::Black => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Black;
        None
    }

    fn kahn(&self) -> Vec<usize> {
        let mut in_degree = vec![0usize; self.graph.nodes.len()];
        for &n in &self.executable {
            for &next in &self.forward[n] {
                in_degree[next] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = self
            .executable
            .iter()
            .copied()
            .filter(|&n| in_degree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.executable.len());

        while let Some(n) = ready.pop_first() {
            order.push(n);
            for &next in &self.forward[n] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        order
    }

    fn require(&self, node_id: &str) -> Result<usize> {
        self.index
            .get(node_id)
            .copied()
            .ok_or_else(|| CascadeError::NodeNotFound {
                workflow_id: self.graph.id.clone(),
                node_id: node_id.to_string(),
            })
    }

    /// The start node plus everything reachable from it, in execution order.
    /// Paused nodes are left out; their descendants are kept.
    pub fn downstream_closure(&self, start_node_id: &str) -> Result<Vec<&'a WorkflowNode>> {
        let start = self.require(start_node_id)?;

        let mut reachable = HashSet::new();
        let mut stack = vec![start];
        while let Some(n) = stack.pop() {
            if reachable.insert(n) {
                stack.extend(self.forward[n].iter().copied());
            }
        }

        let graph = self.graph;
        Ok(self
            .order
            .iter()
            .filter(|n| reachable.contains(*n))
            .map(|&n| &graph.nodes[n])
            .filter(|node| !node.paused)
            .collect())
    }

    /// Every executable, unpaused node in execution order.
    pub fn executable_nodes(&self) -> Vec<&'a WorkflowNode> {
        let graph = self.graph;
        self.order
            .iter()
            .map(|&n| &graph.nodes[n])
            .filter(|node| !node.paused)
            .collect()
    }

    /// Direct executable predecessors, paused ones included.
    pub fn upstream_of(&self, node_id: &str) -> Vec<&'a WorkflowNode> {
        let graph = self.graph;
        match self.index.get(node_id) {
            Some(&n) => self.reverse[n].iter().map(|&p| &graph.nodes[p]).collect(),
            None => vec![],
        }
    }

    /// Direct executable successors.
    pub fn downstream_of(&self, node_id: &str) -> Vec<&'a WorkflowNode> {
        let graph = self.graph;
        match self.index.get(node_id) {
            Some(&n) => self.forward[n].iter().map(|&s| &graph.nodes[s]).collect(),
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::graph::{NodeKind, WorkflowNode};

    fn ids(nodes: &[&WorkflowNode]) -> Vec<String> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn edges_respected_in_order() {
        // Declared out of dependency order on purpose
        let graph = WorkflowGraph::new("wf")
            .with_node(WorkflowNode::new("d", NodeKind::Output))
            .with_node(WorkflowNode::new("b", NodeKind::Transform))
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("c", NodeKind::Transform))
            .with_edge("a", "b")
            .with_edge("a", "c")
            .with_edge("b", "d")
            .with_edge("c", "d");
        let topo = Topology::build(&graph).unwrap();
        let order = ids(&topo.executable_nodes());

        for edge in &graph.edges {
            assert!(position(&order, &edge.source) < position(&order, &edge.target));
        }
        // b before c: declaration order breaks the tie
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_reports_path() {
        let graph = WorkflowGraph::new("wf")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("b", NodeKind::Transform))
            .with_node(WorkflowNode::new("c", NodeKind::Transform))
            .with_edge("a", "b")
            .with_edge("b", "c")
            .with_edge("c", "b");
        match Topology::build(&graph) {
            Err(CascadeError::CycleDetected { path }) => assert_eq!(path, vec!["b", "c", "b"]),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("cycle not detected"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let graph = WorkflowGraph::new("wf")
            .with_node(WorkflowNode::new("a", NodeKind::Transform))
            .with_edge("a", "a");
        assert!(matches!(
            Topology::build(&graph),
            Err(CascadeError::CycleDetected { .. })
        ));
    }

    #[test]
    fn unknown_edge_endpoint_rejected() {
        let graph = WorkflowGraph::new("wf")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_edge("a", "ghost");
        match Topology::build(&graph) {
            Err(CascadeError::UnknownNodeReference { node_id }) => assert_eq!(node_id, "ghost"),
            _ => panic!("expected UnknownNodeReference"),
        }
    }

    #[test]
    fn visual_nodes_do_not_join_execution() {
        // A note wired into a loop must not count as a cycle
        let graph = WorkflowGraph::new("wf")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("memo", NodeKind::Note))
            .with_node(WorkflowNode::new("b", NodeKind::Transform))
            .with_edge("a", "memo")
            .with_edge("memo", "a")
            .with_edge("a", "b");
        let topo = Topology::build(&graph).unwrap();
        assert_eq!(ids(&topo.executable_nodes()), vec!["a", "b"]);
        assert_eq!(ids(&topo.downstream_closure("a").unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn closure_skips_paused_but_keeps_descendants() {
        let graph = WorkflowGraph::new("wf")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("b", NodeKind::Transform).paused())
            .with_node(WorkflowNode::new("c", NodeKind::Output))
            .with_node(WorkflowNode::new("x", NodeKind::Ingest))
            .with_edge("a", "b")
            .with_edge("b", "c");
        let topo = Topology::build(&graph).unwrap();
        assert_eq!(ids(&topo.downstream_closure("a").unwrap()), vec!["a", "c"]);
        assert_eq!(ids(&topo.upstream_of("c")), vec!["b"]);
        assert_eq!(ids(&topo.downstream_of("a")), vec!["b"]);
        assert!(topo.downstream_closure("missing").is_err());
    }

    #[test]
    fn closure_from_middle_excludes_ancestors() {
        let graph = cascade_test_utils::fixtures::fan_out();
        let topo = Topology::build(&graph).unwrap();
        assert_eq!(ids(&topo.downstream_closure("b").unwrap()), vec!["b", "d"]);
    }
}
