//! Graph, node and operation definitions.
//!
//! The executor treats operations as opaque: it asks them how many tasks and
//! how much scratch they want, then calls them once per participating thread.

use crate::params::ComputeParams;
use std::fmt;
use std::sync::Arc;

/// Cached element counts and byte strides of a node's output (innermost first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub ne: [usize; 4],
    pub nb: [usize; 4],
}

impl Shape {
    /// A contiguous shape with elements of `elem_size` bytes.
    pub fn new(ne: [usize; 4], elem_size: usize) -> Self {
        let mut nb = [elem_size; 4];
        for i in 1..4 {
            nb[i] = nb[i - 1] * ne[i - 1];
        }
        Shape { ne, nb }
    }

    pub fn vector(n: usize) -> Self {
        Shape::new([n, 1, 1, 1], 4)
    }

    /// `rows` rows of `cols` 4-byte elements.
    pub fn matrix(cols: usize, rows: usize) -> Self {
        Shape::new([cols, rows, 1, 1], 4)
    }

    pub fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    pub fn nrows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn is_empty(&self) -> bool {
        self.ne.contains(&0)
    }
}

/// One kind of graph operation, as seen by the scheduler.
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    /// How many threads this op can use at a budget of `n_threads`.
    fn n_tasks(&self, _shape: &Shape, _n_threads: usize) -> usize {
        1
    }

    /// Total scratch bytes needed when running on `n_tasks` threads.
    fn scratch_size(&self, _shape: &Shape, _n_tasks: usize) -> usize {
        0
    }

    /// Runs this thread's share. Only threads with `ith < n_tasks` are called.
    fn compute(&self, shape: &Shape, params: &mut ComputeParams<'_>);
}

#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub op: Option<Arc<dyn Operation>>,
    pub shape: Shape,
}

impl Node {
    pub fn new(name: impl Into<String>, op: Arc<dyn Operation>, shape: Shape) -> Self {
        Node {
            name: name.into(),
            op: Some(op),
            shape,
        }
    }

    /// A marker node with nothing to compute.
    pub fn noop(name: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            op: None,
            shape: Shape::vector(0),
        }
    }

    /// No-op nodes are skipped on every thread without a barrier.
    pub fn is_noop(&self) -> bool {
        self.op.is_none() || self.shape.is_empty()
    }

    pub(crate) fn n_tasks(&self, n_threads: usize) -> usize {
        match &self.op {
            Some(op) if !self.is_noop() => op.n_tasks(&self.shape, n_threads),
            _ => 1,
        }
    }

    pub(crate) fn scratch_size(&self, n_tasks: usize) -> usize {
        match &self.op {
            Some(op) if !self.is_noop() => op.scratch_size(&self.shape, n_tasks),
            _ => 0,
        }
    }

    pub(crate) fn compute(&self, params: &mut ComputeParams<'_>) {
        if let Some(op) = &self.op {
            op.compute(&self.shape, params);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("op", &self.op.as_ref().map(|op| op.name().to_string()))
            .field("shape", &self.shape.ne)
            .finish()
    }
}

/// Nodes in execution order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its index.
    pub fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn add(&mut self, name: impl Into<String>, op: Arc<dyn Operation>, shape: Shape) -> usize {
        self.push(Node::new(name, op, shape))
    }

    pub fn add_noop(&mut self, name: impl Into<String>) -> usize {
        self.push(Node::noop(name))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<Node> for Graph {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        Graph {
            nodes: iter.into_iter().collect(),
        }
    }
}
