//! Derivative relevance between design variables and responses.
//!
//! A variable is relevant to the pair `(response, design_var)` when it lies on
//! some dependency path from the design variable to the response.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{TransferError, TransferResult};

/// Inputs needing a transfer, keyed by the group that owns their connection.
pub type FdSubgroupInputs = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Input,
    Output,
}

/// A variable of the model-level dependency graph.
#[derive(Debug, Clone, PartialEq)]
pub struct VarNode {
    pub path: String,
    pub kind: VarKind,
    pub design_var: bool,
    pub response: bool,
    pub distributed: bool,
}

impl VarNode {
    pub fn input(path: &str) -> Self {
        VarNode {
            path: path.to_string(),
            kind: VarKind::Input,
            design_var: false,
            response: false,
            distributed: false,
        }
    }

    pub fn output(path: &str) -> Self {
        VarNode { kind: VarKind::Output, ..Self::input(path) }
    }

    pub fn with_design_var(mut self) -> Self {
        self.design_var = true;
        self
    }

    pub fn with_response(mut self) -> Self {
        self.response = true;
        self
    }

    pub fn with_distributed(mut self) -> Self {
        self.distributed = true;
        self
    }
}

/// Variables on the dependency paths of one `(response, design_var)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relevant {
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
}

impl Relevant {
    pub fn contains(&self, path: &str) -> bool {
        self.inputs.contains(path) || self.outputs.contains(path)
    }
}

/// Read-only dependency graph of a model.
///
/// Edges run from sources to connected inputs and from component inputs to
/// the outputs depending on them.
#[derive(Debug, Clone, Default)]
pub struct RelevanceGraph {
    graph: DiGraph<VarNode, ()>,
    index: FxHashMap<String, NodeIndex>,
}

impl RelevanceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable, replacing the tags of an existing one with the same path.
    pub fn add_var(&mut self, node: VarNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node.path) {
            self.graph[idx] = node;
            return idx;
        }
        let path = node.path.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(path, idx);
        idx
    }

    /// Records that `to` depends on `from`.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> TransferResult<()> {
        let a = self.node_index(from)?;
        let b = self.node_index(to)?;
        self.graph.update_edge(a, b, ());
        Ok(())
    }

    pub fn node(&self, path: &str) -> Option<&VarNode> {
        self.index.get(path).map(|&idx| &self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &VarNode> + '_ {
        self.graph.node_weights()
    }

    fn node_index(&self, path: &str) -> TransferResult<NodeIndex> {
        self.index.get(path).copied().ok_or_else(|| TransferError::UnknownVariable(path.to_string()))
    }

    /// Variables reachable from `design_var` that can also reach `response`.
    pub fn relevant(&self, response: &str, design_var: &str) -> TransferResult<Relevant> {
        let resp = self.node_index(response)?;
        let dv = self.node_index(design_var)?;

        let mut downstream = FxHashSet::default();
        let mut dfs = Dfs::new(&self.graph, dv);
        while let Some(n) = dfs.next(&self.graph) {
            downstream.insert(n);
        }

        let reversed = Reversed(&self.graph);
        let mut relevant = Relevant::default();
        let mut dfs = Dfs::new(reversed, resp);
        while let Some(n) = dfs.next(reversed) {
            if !downstream.contains(&n) {
                continue;
            }
            let node = &self.graph[n];
            match node.kind {
                VarKind::Input => relevant.inputs.insert(node.path.clone()),
                VarKind::Output => relevant.outputs.insert(node.path.clone()),
            };
        }
        Ok(relevant)
    }
}

/// Longest common dotted prefix of two paths.
pub fn common_subpath(a: &str, b: &str) -> String {
    a.split('.')
        .zip(b.split('.'))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect::<Vec<_>>()
        .join(".")
}

/// Model-level data needed to flag inputs of an approximated group.
#[derive(Debug, Clone)]
pub struct RelevanceContext {
    pub graph: Arc<RelevanceGraph>,
    /// Source of every connected input in the model.
    pub model_connections: BTreeMap<String, String>,
    /// Every input of the group, on any rank.
    pub group_inputs: Vec<String>,
    /// Inputs of the group whose source is also inside the group.
    pub internal_inputs: BTreeSet<String>,
}

impl RelevanceContext {
    /// Boundary inputs of `group_path` lying on a path from an outside design
    /// variable to an inside distributed response that crosses a distributed
    /// variable of the group, keyed by the group owning their connection.
    pub fn fd_subgroup_inputs(&self, group_path: &str) -> FdSubgroupInputs {
        let prefix = format!("{group_path}.");
        let inside = |path: &str| path.starts_with(&prefix);

        let inner_resps: Vec<&VarNode> =
            self.graph.nodes().filter(|n| n.response && inside(&n.path)).collect();
        let outer_dvs: Vec<&VarNode> =
            self.graph.nodes().filter(|n| n.design_var && !inside(&n.path)).collect();
        let inner_dists: BTreeSet<&str> = self
            .graph
            .nodes()
            .filter(|n| n.distributed && inside(&n.path))
            .map(|n| n.path.as_str())
            .collect();

        let mut result = FdSubgroupInputs::new();
        if inner_resps.is_empty() || outer_dvs.is_empty() || inner_dists.is_empty() {
            return result;
        }

        let boundary: BTreeSet<&str> = self
            .group_inputs
            .iter()
            .map(String::as_str)
            .filter(|inp| !self.internal_inputs.contains(*inp))
            .collect();

        let mut dependent = BTreeSet::new();
        for resp in inner_resps.iter().filter(|r| inner_dists.contains(r.path.as_str())) {
            for dv in &outer_dvs {
                let Ok(rel) = self.graph.relevant(&resp.path, &dv.path) else { continue };
                if !inner_dists.iter().any(|d| rel.contains(d)) {
                    continue;
                }
                dependent.extend(boundary.iter().filter(|inp| rel.inputs.contains(**inp)).copied());
            }
        }

        for inp in dependent {
            if let Some(src) = self.model_connections.get(inp) {
                result.entry(common_subpath(src, inp)).or_default().insert(inp.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ivc.x -> g.c1.x -> g.c1.y (dist) -> g.c2.a -> g.c2.f (dist response)
    fn chain(dist_response: bool) -> RelevanceGraph {
        let mut g = RelevanceGraph::new();
        g.add_var(VarNode::output("ivc.x").with_design_var());
        g.add_var(VarNode::input("g.c1.x"));
        g.add_var(VarNode::output("g.c1.y").with_distributed());
        g.add_var(VarNode::input("g.c2.a"));
        let f = VarNode::output("g.c2.f").with_response();
        g.add_var(if dist_response { f.with_distributed() } else { f });
        g.add_var(VarNode::output("other.z"));
        for (a, b) in [
            ("ivc.x", "g.c1.x"),
            ("g.c1.x", "g.c1.y"),
            ("g.c1.y", "g.c2.a"),
            ("g.c2.a", "g.c2.f"),
            ("ivc.x", "other.z"),
        ] {
            g.add_dependency(a, b).unwrap();
        }
        g
    }

    fn context(graph: RelevanceGraph) -> RelevanceContext {
        RelevanceContext {
            graph: Arc::new(graph),
            model_connections: [("g.c1.x", "ivc.x"), ("g.c2.a", "g.c1.y")]
                .into_iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            group_inputs: vec!["g.c1.x".to_string(), "g.c2.a".to_string()],
            internal_inputs: ["g.c2.a".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_relevant_excludes_side_branches() {
        let g = chain(true);
        let rel = g.relevant("g.c2.f", "ivc.x").unwrap();
        assert!(rel.inputs.contains("g.c1.x"));
        assert!(rel.outputs.contains("g.c1.y"));
        assert!(!rel.contains("other.z"));
    }

    #[test]
    fn test_common_subpath() {
        assert_eq!(common_subpath("g.c1.y", "g.c2.x"), "g");
        assert_eq!(common_subpath("ivc.x", "g.c1.x"), "");
        assert_eq!(common_subpath("a.b.c", "a.b.d"), "a.b");
    }

    #[test]
    fn test_fd_subgroup_inputs_flags_boundary_input() {
        let flagged = context(chain(true)).fd_subgroup_inputs("g");
        assert_eq!(flagged.len(), 1);
        assert!(flagged[""].contains("g.c1.x"));
    }

    #[test]
    fn test_fd_subgroup_inputs_requires_distributed_response() {
        assert!(context(chain(false)).fd_subgroup_inputs("g").is_empty());
    }

    #[test]
    fn test_unknown_variable() {
        let mut g = chain(true);
        assert!(matches!(g.add_dependency("nope", "g.c1.x"), Err(TransferError::UnknownVariable(_))));
    }
}
