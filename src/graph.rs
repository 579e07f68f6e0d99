//! Deduplicated, possibly cyclic dependency graph of modules
//!
//! Nodes live in an arena and refer to each other by index. Children and parents are plain index
//! lists, so cycles need no special ownership handling: the graph is freed as a unit.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::common::{lower, WalkError};
use crate::context::{Context, Module};
use crate::image::ImageParser;

/// Stable handle of a node inside its `DependencyGraph`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct DependencyNode<T> {
    context: T,
    children: Vec<NodeId>,
    parents: Vec<NodeId>,
}

impl<T> DependencyNode<T> {
    pub fn context(&self) -> &T {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut T {
        &mut self.context
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }
}

/// Arena of nodes; the first node added is the root
#[derive(Debug, Clone)]
pub struct DependencyGraph<T> {
    nodes: Vec<DependencyNode<T>>,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<T: Context> DependencyGraph<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, context: T) -> NodeId {
        self.nodes.push(DependencyNode {
            context,
            children: Vec::new(),
            parents: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(NodeId(0))
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Panics if `id` comes from another graph
    pub fn node(&self, id: NodeId) -> &DependencyNode<T> {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DependencyNode<T> {
        &mut self.nodes[id.0]
    }

    pub fn context(&self, id: NodeId) -> &T {
        &self.nodes[id.0].context
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DependencyNode<T>)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// First node whose context has the given identity
    pub fn find(&self, identity: &str) -> Option<NodeId> {
        self.nodes()
            .find(|(_, n)| n.context.identity() == identity)
            .map(|(id, _)| id)
    }

    /// Add the parent's back-reference to a node, at most once per parent
    pub fn append_parent(&mut self, child: NodeId, parent: NodeId) {
        let parents = &mut self.nodes[child.0].parents;
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }
}

impl<T: Context + Clone> DependencyGraph<T> {
    /// Attach `child` under `parent`
    ///
    /// Children are unique by identity: if `parent` already has a different node with the same
    /// identity, the context of `child` is merged into that node and `child` is not attached.
    /// Returns the node that ends up as the child.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> NodeId {
        let existing = self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|&c| c == child || self.context(c).identity() == self.context(child).identity());
        match existing {
            Some(c) if c == child => c,
            Some(c) => {
                let other = self.nodes[child.0].context.clone();
                self.nodes[c.0].context.merge(other);
                c
            }
            None => {
                self.nodes[parent.0].children.push(child);
                child
            }
        }
    }
}

/// Module whose imports are still being walked
struct Frame {
    node: NodeId,
    depth: usize,
    imports: Vec<String>,
    next: usize,
}

impl Frame {
    fn new(graph: &DependencyGraph<Module>, node: NodeId, depth: usize) -> Self {
        Self {
            node,
            depth,
            imports: graph
                .context(node)
                .imports()
                .map(|i| i.name().to_owned())
                .collect(),
            next: 0,
        }
    }
}

/// Builds the dependency graph of a module by parsing it and, recursively, everything it imports
///
/// Modules are registered by name before their own imports are walked, which is what stops
/// cycles. The walk keeps its own stack, so arbitrarily long import chains do not grow the call
/// stack.
pub struct GraphBuilder<'p, P: ImageParser + ?Sized> {
    parser: &'p P,
    max_depth: Option<usize>,
}

impl<'p, P: ImageParser + ?Sized> GraphBuilder<'p, P> {
    pub fn new(parser: &'p P) -> Self {
        Self {
            parser,
            max_depth: None,
        }
    }

    /// Do not parse modules deeper than `max_depth` imports below the root
    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Build the graph rooted at `root`
    ///
    /// Only a failure to parse the root itself is returned. Modules further down that cannot be
    /// found or parsed are recorded as unresolved imports of the module that imports them.
    pub fn build(&self, root: &str) -> Result<DependencyGraph<Module>, WalkError> {
        let mut graph = DependencyGraph::new();
        let mut registry: HashMap<String, NodeId> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();

        let module = self.parser.parse_root(root)?;
        let root_name = module.name().to_owned();
        let root_id = graph.add(module);
        registry.insert(root_name, root_id);
        registry.insert(lower(root), root_id);

        let mut stack = vec![Frame::new(&graph, root_id, 0)];
        while let Some(frame) = stack.last_mut() {
            if frame.next == frame.imports.len() {
                stack.pop();
                continue;
            }
            let parent = frame.node;
            let depth = frame.depth;
            let name = frame.imports[frame.next].clone();
            frame.next += 1;

            if let Some(&existing) = registry.get(&name) {
                let child = graph.append_child(parent, existing);
                graph.append_parent(child, parent);
                continue;
            }
            if failed.contains(&name) {
                graph.node_mut(parent).context_mut().mark_unresolved(&name);
                continue;
            }
            if self.max_depth.is_some_and(|max| depth >= max) {
                continue;
            }

            match self.parser.parse(&name) {
                // another spelling of a module that is already in the graph
                Ok(module) if registry.contains_key(module.name()) => {
                    let existing = registry[module.name()];
                    debug!("{} is already known as {}", name, module.name());
                    registry.insert(name, existing);
                    let child = graph.append_child(parent, existing);
                    graph.append_parent(child, parent);
                }
                Ok(module) => {
                    let module_name = module.name().to_owned();
                    let id = graph.add(module);
                    registry.insert(module_name, id);
                    registry.insert(name, id);
                    let child = graph.append_child(parent, id);
                    graph.append_parent(child, parent);
                    if child == id {
                        stack.push(Frame::new(&graph, id, depth + 1));
                    }
                }
                Err(e) if e.is_local() => {
                    warn!(
                        "{} imported by {} is unresolved: {}",
                        name,
                        graph.context(parent),
                        e
                    );
                    graph.node_mut(parent).context_mut().mark_unresolved(&name);
                    failed.insert(name);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("built graph of {} with {} modules", root, graph.len());
        Ok(graph)
    }
}
