//! The mutable dependency graph driving both build phases.
//!
//! Nodes are [`FileNode`]s keyed by path; a directed edge `parent -> child`
//! means "parent depends on child". The graph is deliberately allowed to be
//! cyclic during analysis (real source graphs are), and only the assembly
//! phase demands an acyclic view, produced by [`Graph::remove_cycles`].

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::node::FileNode;

/// Handle to a graph shared between concurrently processed files. Guards are
/// only ever held for synchronous mutation, never across a suspension point.
pub type SharedGraph = std::sync::Arc<parking_lot::Mutex<Graph>>;

#[derive(Default, Clone)]
pub struct Graph {
    inner: StableDiGraph<FileNode, ()>,
    index: HashMap<Utf8PathBuf, NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.node_count() == 0
    }

    pub fn contains(&self, path: impl AsRef<Utf8Path>) -> bool {
        self.index.contains_key(path.as_ref())
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&FileNode> {
        let ix = *self.index.get(path.as_ref())?;
        self.inner.node_weight(ix)
    }

    pub fn get_mut(&mut self, path: impl AsRef<Utf8Path>) -> Option<&mut FileNode> {
        let ix = *self.index.get(path.as_ref())?;
        self.inner.node_weight_mut(ix)
    }

    /// Add a file to the graph, or fetch it when already present. Idempotent:
    /// a second call never resets the existing node's type tags or lifecycle
    /// flags, including `is_entry`.
    pub fn add_node(&mut self, path: impl Into<Utf8PathBuf>, is_entry: bool) -> &mut FileNode {
        let ix = self.index_or_insert(path.into(), is_entry);
        self.inner.node_weight_mut(ix).expect("node index is live")
    }

    /// Record that `parent` depends on `child`. Both endpoints are created on
    /// demand; repeated calls with the same pair are no-ops. Dependency
    /// declaration order is preserved and observable via
    /// [`dependencies_of`](Self::dependencies_of).
    pub fn add_dependency(
        &mut self,
        parent: impl Into<Utf8PathBuf>,
        child: impl Into<Utf8PathBuf>,
    ) {
        let parent = self.index_or_insert(parent.into(), false);
        let child = self.index_or_insert(child.into(), false);
        self.inner.update_edge(parent, child, ());
    }

    /// Remove the `parent -> child` edge, if present. Used by assembly-phase
    /// handlers that inline a dependency and unroll its edge.
    pub fn remove_dependency(
        &mut self,
        parent: impl AsRef<Utf8Path>,
        child: impl AsRef<Utf8Path>,
    ) -> bool {
        let Some(&parent) = self.index.get(parent.as_ref()) else {
            return false;
        };
        let Some(&child) = self.index.get(child.as_ref()) else {
            return false;
        };
        match self.inner.find_edge(parent, child) {
            Some(edge) => self.inner.remove_edge(edge).is_some(),
            None => false,
        }
    }

    /// Remove a file and all of its edges.
    pub fn remove_node(&mut self, path: impl AsRef<Utf8Path>) -> bool {
        match self.index.remove(path.as_ref()) {
            Some(ix) => self.inner.remove_node(ix).is_some(),
            None => false,
        }
    }

    /// Direct dependencies of `path` in declaration order. Unknown paths
    /// yield an empty list rather than an error.
    pub fn dependencies_of(&self, path: impl AsRef<Utf8Path>) -> Vec<Utf8PathBuf> {
        self.adjacent(path.as_ref(), Direction::Outgoing)
    }

    /// Every file reachable from `path` through dependency edges, excluding
    /// `path` itself. Cycle-safe: each node is visited at most once.
    pub fn dependencies_of_deep(&self, path: impl AsRef<Utf8Path>) -> Vec<Utf8PathBuf> {
        self.reachable(path.as_ref(), Direction::Outgoing)
    }

    /// Direct dependants of `path` (files with an edge pointing at it).
    pub fn dependants_of(&self, path: impl AsRef<Utf8Path>) -> Vec<Utf8PathBuf> {
        self.adjacent(path.as_ref(), Direction::Incoming)
    }

    /// Every file that transitively depends on `path`, excluding `path`.
    pub fn dependants_of_deep(&self, path: impl AsRef<Utf8Path>) -> Vec<Utf8PathBuf> {
        self.reachable(path.as_ref(), Direction::Incoming)
    }

    /// All node paths, in insertion order.
    pub fn paths(&self) -> Vec<Utf8PathBuf> {
        self.inner
            .node_indices()
            .map(|ix| self.inner[ix].path.clone())
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FileNode> {
        self.inner.node_indices().map(|ix| &self.inner[ix])
    }

    /// Drop the minimal set of depth-first back edges needed to make the
    /// graph acyclic. The traversal is rooted at entry nodes in insertion
    /// order, then at any remaining nodes in path order, so the edge choice
    /// is deterministic for a given construction sequence. Never fails; the
    /// result always admits a topological order. Returns the number of edges
    /// removed.
    pub fn remove_cycles(&mut self) -> usize {
        #[derive(PartialEq)]
        enum Mark {
            Active,
            Done,
        }

        let mut roots: Vec<NodeIndex> = self
            .inner
            .node_indices()
            .filter(|&ix| self.inner[ix].is_entry)
            .collect();
        let mut rest: Vec<NodeIndex> = self
            .inner
            .node_indices()
            .filter(|&ix| !self.inner[ix].is_entry)
            .collect();
        rest.sort_by(|&a, &b| self.inner[a].path.cmp(&self.inner[b].path));
        roots.extend(rest);

        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();
        let mut removed = 0;

        for root in roots {
            if marks.contains_key(&root) {
                continue;
            }
            marks.insert(root, Mark::Active);
            let children = self.children(root);
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = vec![(root, children, 0)];

            while let Some(top) = stack.len().checked_sub(1) {
                let (node, next) = {
                    let frame = &mut stack[top];
                    if frame.2 < frame.1.len() {
                        let child = frame.1[frame.2];
                        frame.2 += 1;
                        (frame.0, Some(child))
                    } else {
                        (frame.0, None)
                    }
                };

                let Some(child) = next else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                };

                match marks.get(&child) {
                    Some(Mark::Active) => {
                        // back edge: this edge closes a cycle
                        if let Some(edge) = self.inner.find_edge(node, child) {
                            self.inner.remove_edge(edge);
                            removed += 1;
                        }
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Active);
                        let grandchildren = self.children(child);
                        stack.push((child, grandchildren, 0));
                    }
                }
            }
        }

        removed
    }

    /// Remove every node not reachable from the given entries. Run before
    /// assembly so stale nodes from a previous build are not processed.
    /// Returns the number of nodes removed.
    pub fn prune(&mut self, entries: &[Utf8PathBuf]) -> usize {
        let mut keep: HashSet<NodeIndex> = HashSet::new();
        for entry in entries {
            let Some(&start) = self.index.get(entry.as_path()) else {
                continue;
            };
            let mut dfs = Dfs::new(&self.inner, start);
            while let Some(ix) = dfs.next(&self.inner) {
                keep.insert(ix);
            }
        }

        let orphans: Vec<NodeIndex> = self
            .inner
            .node_indices()
            .filter(|ix| !keep.contains(ix))
            .collect();
        let count = orphans.len();
        for ix in orphans {
            if let Some(node) = self.inner.remove_node(ix) {
                self.index.remove(&node.path);
            }
        }
        count
    }

    /// Node paths ordered dependencies-first. Only well-defined once the
    /// graph is acyclic; call [`remove_cycles`](Self::remove_cycles) first.
    pub fn topological_order(&self) -> Result<Vec<Utf8PathBuf>, GraphError> {
        match toposort(&self.inner, None) {
            Ok(mut order) => {
                // toposort puts dependants first; edges point parent -> child
                order.reverse();
                Ok(order
                    .into_iter()
                    .map(|ix| self.inner[ix].path.clone())
                    .collect())
            }
            Err(cycle) => Err(GraphError::Cycle {
                path: self.inner[cycle.node_id()].path.clone(),
            }),
        }
    }

    /// Serializable view of the graph: node state plus edges, without the
    /// opaque plugin metadata. Suitable for persisting incremental state
    /// between processes.
    pub fn snapshot(&self) -> Snapshot {
        let nodes = self
            .inner
            .node_indices()
            .map(|ix| {
                let node = &self.inner[ix];
                NodeSnapshot {
                    path: node.path.clone(),
                    file_type: node.file_type.clone(),
                    initial_type: node.initial_type().to_string(),
                    is_entry: node.is_entry,
                    analyzed: node.is_analyzed(),
                }
            })
            .collect();

        let mut edges = Vec::with_capacity(self.inner.edge_count());
        for ix in self.inner.node_indices() {
            let parent = self.inner[ix].path.clone();
            for child in self.adjacent_ix(ix, Direction::Outgoing) {
                edges.push((parent.clone(), self.inner[child].path.clone()));
            }
        }

        Snapshot { nodes, edges }
    }

    /// Rebuild a graph from a snapshot. Plugin metadata is not restored;
    /// nodes come back with their flags, so an `analyzed` file stays skipped
    /// until something invalidates it.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut graph = Self::new();
        for node in snapshot.nodes {
            graph.inner_insert(FileNode::from_parts(
                node.path,
                node.file_type,
                node.initial_type,
                node.is_entry,
                node.analyzed,
            ));
        }
        for (parent, child) in snapshot.edges {
            graph.add_dependency(parent, child);
        }
        graph
    }

    fn index_or_insert(&mut self, path: Utf8PathBuf, is_entry: bool) -> NodeIndex {
        match self.index.get(&path) {
            Some(&ix) => ix,
            None => self.inner_insert(FileNode::new(path, is_entry)),
        }
    }

    fn inner_insert(&mut self, node: FileNode) -> NodeIndex {
        let path = node.path.clone();
        let ix = self.inner.add_node(node);
        self.index.insert(path, ix);
        ix
    }

    fn children(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.adjacent_ix(ix, Direction::Outgoing)
    }

    fn adjacent_ix(&self, ix: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        // petgraph iterates adjacency newest-first; reverse for declaration order
        let mut adjacent: Vec<NodeIndex> = self.inner.neighbors_directed(ix, direction).collect();
        adjacent.reverse();
        adjacent
    }

    fn adjacent(&self, path: &Utf8Path, direction: Direction) -> Vec<Utf8PathBuf> {
        let Some(&ix) = self.index.get(path) else {
            return Vec::new();
        };
        self.adjacent_ix(ix, direction)
            .into_iter()
            .map(|ix| self.inner[ix].path.clone())
            .collect()
    }

    fn reachable(&self, path: &Utf8Path, direction: Direction) -> Vec<Utf8PathBuf> {
        let Some(&start) = self.index.get(path) else {
            return Vec::new();
        };

        let mut seen: HashSet<NodeIndex> = HashSet::from([start]);
        let mut queue: Vec<NodeIndex> = self.adjacent_ix(start, direction);
        let mut found = Vec::new();

        while !queue.is_empty() {
            let mut next = Vec::new();
            for ix in queue {
                if !seen.insert(ix) {
                    continue;
                }
                found.push(self.inner[ix].path.clone());
                next.extend(self.adjacent_ix(ix, direction));
            }
            queue = next;
        }

        found
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.inner.node_count())
            .field("edges", &self.inner.edge_count())
            .finish()
    }
}

/// Serializable graph state, as produced by [`Graph::snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub path: Utf8PathBuf,
    pub file_type: String,
    pub initial_type: String,
    pub is_entry: bool,
    pub analyzed: bool,
}
