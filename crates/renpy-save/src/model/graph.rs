//! The node arena shared by the decoders and encoders.

use std::ops::{Index, IndexMut};

use rustc_hash::FxHashMap;

use crate::model::value::{Constructor, Instance, Node, NodeId, State, Value, ValueMap, ValueSet};
use crate::registry::TypeHandle;

/// Arena of identity-bearing nodes.
///
/// A graph is built by one decode (binary or text) and consumed by one
/// encode. Node ids are assigned in allocation order and never reused.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocates a node and returns its id.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    /// Iterates over `(id, node)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    // =========================================================================
    // Builders
    // =========================================================================

    /// Adds a list and returns a reference to it.
    pub fn sequence(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.add(Node::Sequence(items)))
    }

    /// Adds a dict and returns a reference to it. Later duplicates of a key
    /// overwrite earlier ones, keeping the first position.
    pub fn mapping(&mut self, pairs: impl IntoIterator<Item = (Value, Value)>) -> Value {
        let map: ValueMap = pairs.into_iter().collect();
        Value::Ref(self.add(Node::Mapping(map)))
    }

    /// Adds a set and returns a reference to it.
    pub fn set(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        let set: ValueSet = items.into_iter().collect();
        Value::Ref(self.add(Node::Set(set)))
    }

    /// Adds an instance and returns a reference to it.
    pub fn instance(&mut self, ty: TypeHandle, state: State) -> Value {
        self.instance_with(ty, Constructor::default(), state)
    }

    /// Adds an instance created by `ctor` and returns a reference to it.
    pub fn instance_with(&mut self, ty: TypeHandle, ctor: Constructor, state: State) -> Value {
        Value::Ref(self.add(Node::Instance(Instance { ty, ctor, state })))
    }

    /// Name of the shape behind `value`, looking through references.
    pub fn shape_name(&self, value: &Value) -> &'static str {
        match value {
            Value::Ref(id) => self.get(*id).map_or("dangling ref", Node::kind_name),
            other => other.variant_name(),
        }
    }

    // =========================================================================
    // Comparison
    // =========================================================================

    /// Compares `a` in this graph with `b` in `other` by shape and sharing.
    ///
    /// Node ids may differ between the graphs, but the correspondence must
    /// be one-to-one: if two positions share a node on one side they must
    /// share a node on the other. Types compare by `(module, name)`, so the
    /// graphs may come from different registries.
    pub fn structurally_equal(&self, a: &Value, other: &Graph, b: &Value) -> bool {
        let mut cmp = Comparison {
            left: self,
            right: other,
            forward: FxHashMap::default(),
            backward: FxHashMap::default(),
        };
        cmp.values(a, b)
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }
}

impl IndexMut<NodeId> for Graph {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }
}

struct Comparison<'a> {
    left: &'a Graph,
    right: &'a Graph,
    forward: FxHashMap<NodeId, NodeId>,
    backward: FxHashMap<NodeId, NodeId>,
}

impl Comparison<'_> {
    fn values(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Ref(x), Value::Ref(y)) => self.refs(*x, *y),
            (Value::Tuple(xs), Value::Tuple(ys)) => self.all(xs, ys),
            (Value::Global(x), Value::Global(y)) => {
                x.module() == y.module() && x.name() == y.name()
            }
            (Value::Ref(_), _) | (_, Value::Ref(_)) => false,
            (Value::Tuple(_), _) | (_, Value::Tuple(_)) => false,
            _ => a == b,
        }
    }

    fn all<'v>(
        &mut self,
        xs: impl IntoIterator<Item = &'v Value, IntoIter: ExactSizeIterator>,
        ys: impl IntoIterator<Item = &'v Value, IntoIter: ExactSizeIterator>,
    ) -> bool {
        let (xs, ys) = (xs.into_iter(), ys.into_iter());
        xs.len() == ys.len() && xs.zip(ys).all(|(x, y)| self.values(x, y))
    }

    fn refs(&mut self, x: NodeId, y: NodeId) -> bool {
        match (self.forward.get(&x), self.backward.get(&y)) {
            (Some(fx), Some(by)) => return *fx == y && *by == x,
            (None, None) => {}
            _ => return false,
        }
        self.forward.insert(x, y);
        self.backward.insert(y, x);

        let (left, right) = (self.left, self.right);
        let (Some(left), Some(right)) = (left.get(x), right.get(y)) else {
            return false;
        };
        match (left, right) {
            (Node::Sequence(xs), Node::Sequence(ys)) => self.all(xs, ys),
            (Node::Set(xs), Node::Set(ys)) => self.all(xs, ys),
            (Node::Mapping(xs), Node::Mapping(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys.iter())
                        .all(|((kx, vx), (ky, vy))| self.values(kx, ky) && self.values(vx, vy))
            }
            (Node::Instance(xi), Node::Instance(yi)) => {
                xi.ty.module() == yi.ty.module()
                    && xi.ty.name() == yi.ty.name()
                    && self.constructors(&xi.ctor, &yi.ctor)
                    && self.states(&xi.state, &yi.state)
            }
            _ => false,
        }
    }

    fn constructors(&mut self, a: &Constructor, b: &Constructor) -> bool {
        match (a, b) {
            (Constructor::New(xs), Constructor::New(ys)) | (Constructor::Call(xs), Constructor::Call(ys)) => {
                self.all(xs, ys)
            }
            _ => false,
        }
    }

    fn states(&mut self, a: &State, b: &State) -> bool {
        match (a, b) {
            (State::None, State::None) => true,
            (State::Dict(x), State::Dict(y))
            | (State::List(x), State::List(y))
            | (State::Set(x), State::Set(y)) => self.refs(*x, *y),
            (State::Scalar(x), State::Scalar(y)) => self.values(x, y),
            _ => false,
        }
    }
}
