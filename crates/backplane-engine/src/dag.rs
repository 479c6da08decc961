// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG construction and level scheduling.
//!
//! Levels are computed with Kahn's algorithm: level `n` holds every node whose
//! predecessors all sit in levels `< n`. Within a level, nodes keep their
//! declaration order so event streams are reproducible.

use std::collections::{HashMap, HashSet};

use crate::definition::{EdgeDefinition, NodeDefinition, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// Validated graph view over a [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: Vec<NodeDefinition>,
    index: HashMap<String, usize>,
    out_edges: HashMap<String, Vec<EdgeDefinition>>,
    predecessors: HashMap<String, Vec<String>>,
    levels: Vec<Vec<String>>,
}

impl Dag {
    /// Builds the graph, rejecting duplicate ids, dangling edges and cycles.
    pub fn build(def: &WorkflowDefinition) -> Result<Self> {
        if def.nodes.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "workflow has no nodes".into(),
            ));
        }

        let mut index = HashMap::with_capacity(def.nodes.len());
        for (i, node) in def.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(EngineError::InvalidDefinition(format!(
                    "node at position {i} has an empty id"
                )));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut out_edges: HashMap<String, Vec<EdgeDefinition>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &def.edges {
            for end in [&edge.source, &edge.target] {
                if !index.contains_key(end) {
                    return Err(EngineError::InvalidDefinition(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
            out_edges
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
            let preds = predecessors.entry(edge.target.clone()).or_default();
            if !preds.contains(&edge.source) {
                preds.push(edge.source.clone());
            }
        }

        let mut dag = Self {
            nodes: def.nodes.clone(),
            index,
            out_edges,
            predecessors,
            levels: Vec::new(),
        };
        dag.levels = dag.compute_levels()?;
        Ok(dag)
    }

    fn compute_levels(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| {
                let deg = self.predecessors.get(&n.id).map_or(0, Vec::len);
                (n.id.as_str(), deg)
            })
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0usize;
        let mut current: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.id.as_str()] == 0)
            .map(|n| n.id.clone())
            .collect();

        while !current.is_empty() {
            placed += current.len();
            let mut released = HashSet::new();
            for id in &current {
                for succ in self.successors(id) {
                    if let Some(deg) = in_degree.get_mut(succ) {
                        *deg -= 1;
                        if *deg == 0 {
                            released.insert(succ.to_string());
                        }
                    }
                }
            }
            levels.push(current);
            current = self
                .nodes
                .iter()
                .filter(|n| released.contains(&n.id))
                .map(|n| n.id.clone())
                .collect();
        }

        if placed != self.nodes.len() {
            let cycle = self.find_cycle().join(" -> ");
            return Err(EngineError::InvalidDefinition(format!(
                "workflow contains a cycle: {cycle}"
            )));
        }
        Ok(levels)
    }

    /// Depth-first search for one cycle path, used for the error message.
    fn find_cycle(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        for node in &self.nodes {
            let mut path = Vec::new();
            if let Err(cycle) = self.dfs(&node.id, &mut visited, &mut path) {
                return cycle;
            }
        }
        Vec::new()
    }

    fn dfs<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> std::result::Result<(), Vec<String>> {
        if let Some(pos) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Err(cycle);
        }
        if !visited.insert(id) {
            return Ok(());
        }
        path.push(id);
        for succ in self.successors(id) {
            self.dfs(succ, visited, path)?;
        }
        path.pop();
        Ok(())
    }

    fn successors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.out_edges
            .get(id)
            .into_iter()
            .flatten()
            .map(|e| e.target.as_str())
    }

    /// Execution levels in topological order.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Looks up a node.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.index.get(id).map(|i| &self.nodes[*i])
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes. Always false for a built graph.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct predecessors of a node.
    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Outgoing edges of a node.
    pub fn out_edges(&self, id: &str) -> &[EdgeDefinition] {
        self.out_edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// First edge connecting `source` to `target`.
    pub fn edge_between(&self, source: &str, target: &str) -> Option<&EdgeDefinition> {
        self.out_edges(source).iter().find(|e| e.target == target)
    }

    /// Every node reachable from `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.successors(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.successors(next));
            }
        }
        seen
    }

    /// Nodes with no outgoing edges.
    pub fn sinks(&self) -> Vec<&NodeDefinition> {
        self.nodes
            .iter()
            .filter(|n| self.out_edges(&n.id).is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(nodes: &[&str], edges: &[(&str, &str)]) -> WorkflowDefinition {
        WorkflowDefinition::from_value(&json!({
            "nodes": nodes.iter().map(|id| json!({"id": id, "type": "start"})).collect::<Vec<_>>(),
            "edges": edges.iter().map(|(s, t)| json!({"source": s, "target": t})).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn test_linear_levels() {
        let dag = Dag::build(&def(&["a", "b", "c"], &[("a", "b"), ("b", "c")])).unwrap();
        assert_eq!(
            dag.levels(),
            &[vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
        assert_eq!(dag.predecessors("c"), &["b".to_string()]);
        assert_eq!(dag.sinks().len(), 1);
    }

    #[test]
    fn test_diamond_levels() {
        let dag = Dag::build(&def(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        ))
        .unwrap();
        assert_eq!(dag.levels().len(), 3);
        assert_eq!(dag.levels()[1], vec!["b".to_string(), "c".to_string()]);
        let desc = dag.descendants("b");
        assert!(desc.contains("d"));
        assert!(!desc.contains("c"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = Dag::build(&def(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]))
            .unwrap_err();
        match err {
            EngineError::InvalidDefinition(msg) => assert!(msg.contains("cycle"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let err = Dag::build(&def(&["a"], &[("a", "ghost")])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = Dag::build(&def(&["a", "a"], &[])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }
}
