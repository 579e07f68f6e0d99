//! Cycle-safe walks over a `DependencyGraph`
//!
//! Both walks deliver every node reachable from the root to the visitor exactly once, whatever
//! the shape of the graph.

use std::collections::{HashSet, VecDeque};

use crate::common::WalkError;
use crate::context::Context;
use crate::graph::{DependencyGraph, NodeId};

/// Node handed to a visitor, together with the graph it belongs to
#[derive(Debug)]
pub struct NodeRef<'g, T> {
    graph: &'g DependencyGraph<T>,
    id: NodeId,
}

impl<T> Clone for NodeRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeRef<'_, T> {}

impl<'g, T: Context> NodeRef<'g, T> {
    pub fn new(graph: &'g DependencyGraph<T>, id: NodeId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn context(&self) -> &'g T {
        self.graph.context(self.id)
    }

    pub fn children(&self) -> impl Iterator<Item = NodeRef<'g, T>> + 'g {
        let graph = self.graph;
        graph
            .node(self.id)
            .children()
            .iter()
            .map(move |&id| NodeRef::new(graph, id))
    }

    pub fn parents(&self) -> impl Iterator<Item = NodeRef<'g, T>> + 'g {
        let graph = self.graph;
        graph
            .node(self.id)
            .parents()
            .iter()
            .map(move |&id| NodeRef::new(graph, id))
    }
}

pub trait Visitor<T> {
    fn visit(&mut self, node: NodeRef<'_, T>, depth: usize) -> Result<(), WalkError>;
}

impl<T, F> Visitor<T> for F
where
    F: FnMut(NodeRef<'_, T>, usize),
{
    fn visit(&mut self, node: NodeRef<'_, T>, depth: usize) -> Result<(), WalkError> {
        self(node, depth);
        Ok(())
    }
}

/// A strategy for walking a graph from a root
pub trait Traversal {
    fn traverse<T: Context, V: Visitor<T> + ?Sized>(
        &self,
        graph: &DependencyGraph<T>,
        root: NodeId,
        visitor: &mut V,
    ) -> Result<(), WalkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Visit a node before its children
    Pre,
    /// Visit a node after all of its children
    Post,
}

/// Depth-first walk along child edges
///
/// Runs on an explicit stack. A node reached again through another path or a cycle is neither
/// visited nor descended into a second time.
#[derive(Debug, Clone, Copy)]
pub struct DepthFirst {
    pub direction: Direction,
}

impl DepthFirst {
    pub fn pre_order() -> Self {
        Self {
            direction: Direction::Pre,
        }
    }

    pub fn post_order() -> Self {
        Self {
            direction: Direction::Post,
        }
    }

    fn pre<T: Context, V: Visitor<T> + ?Sized>(
        graph: &DependencyGraph<T>,
        root: NodeId,
        visitor: &mut V,
    ) -> Result<(), WalkError> {
        let mut visited = HashSet::new();
        let mut stack = vec![(root, 0)];
        while let Some((id, depth)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            visitor.visit(NodeRef::new(graph, id), depth)?;
            // reversed, so that children come off the stack in order
            for &child in graph.node(id).children().iter().rev() {
                if !visited.contains(&child) {
                    stack.push((child, depth + 1));
                }
            }
        }
        Ok(())
    }

    fn post<T: Context, V: Visitor<T> + ?Sized>(
        graph: &DependencyGraph<T>,
        root: NodeId,
        visitor: &mut V,
    ) -> Result<(), WalkError> {
        let mut visited = HashSet::from([root]);
        // node, depth, index of the next child to descend into
        let mut stack = vec![(root, 0, 0)];
        while let Some(top) = stack.last_mut() {
            let (id, depth, next) = *top;
            match graph.node(id).children().get(next) {
                Some(&child) => {
                    top.2 += 1;
                    if visited.insert(child) {
                        stack.push((child, depth + 1, 0));
                    }
                }
                None => {
                    stack.pop();
                    visitor.visit(NodeRef::new(graph, id), depth)?;
                }
            }
        }
        Ok(())
    }
}

impl Traversal for DepthFirst {
    fn traverse<T: Context, V: Visitor<T> + ?Sized>(
        &self,
        graph: &DependencyGraph<T>,
        root: NodeId,
        visitor: &mut V,
    ) -> Result<(), WalkError> {
        match self.direction {
            Direction::Pre => Self::pre(graph, root, visitor),
            Direction::Post => Self::post(graph, root, visitor),
        }
    }
}

/// Breadth-first walk following both child and parent edges
///
/// Children are queued one level deeper, parents one level shallower (never below zero). Each
/// node is visited at the depth of whichever entry for it is dequeued first.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreadthFirst;

impl Traversal for BreadthFirst {
    fn traverse<T: Context, V: Visitor<T> + ?Sized>(
        &self,
        graph: &DependencyGraph<T>,
        root: NodeId,
        visitor: &mut V,
    ) -> Result<(), WalkError> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(root, 0usize)]);
        while let Some((id, depth)) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            visitor.visit(NodeRef::new(graph, id), depth)?;
            let node = graph.node(id);
            queue.extend(node.children().iter().map(|&c| (c, depth + 1)));
            queue.extend(
                node.parents()
                    .iter()
                    .map(|&p| (p, depth.saturating_sub(1))),
            );
        }
        Ok(())
    }
}
