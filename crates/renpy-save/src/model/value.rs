//! Graph values, nodes and instance state.
//!
//! Immutable data (`None`, numbers, strings, bytes, tuples, type references)
//! lives inline in [`Value`]. Everything with identity (lists, dicts, sets
//! and instances) lives in the [`Graph`](super::Graph) arena as a [`Node`]
//! and is referenced by [`NodeId`], which is how sharing and cycles are
//! expressed.

use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;
use rustc_hash::FxBuildHasher;

use crate::registry::{TypeHandle, TypeKind};

/// Insertion-ordered mapping with arbitrary keys.
pub type ValueMap = IndexMap<Value, Value, FxBuildHasher>;

/// Insertion-ordered set.
pub type ValueSet = IndexSet<Value, FxBuildHasher>;

/// Index of a node in a [`Graph`](super::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value in the object graph.
///
/// Equality and hashing follow the host runtime's rules for dict keys:
/// immutable variants compare by value (floats bitwise, so `NaN` keys stay
/// usable), [`Value::Ref`] compares by node identity.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    /// Arbitrary precision integer.
    Int(BigInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Immutable fixed-arity sequence.
    Tuple(Vec<Value>),
    /// A class or callable stored as data.
    Global(TypeHandle),
    /// Reference to an identity-bearing node.
    Ref(NodeId),
}

impl Value {
    pub fn int(v: i64) -> Value {
        Value::Int(BigInt::from(v))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Returns the node id if this is a reference.
    pub fn as_ref_id(&self) -> Option<NodeId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// `true` for the scalar variants that a text record could key on.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::None
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Str(_)
                | Value::Bytes(_)
        )
    }

    /// Short name of the variant, for error messages. References report
    /// `"ref"`; use [`Graph::shape_name`](super::Graph::shape_name) to see
    /// through them.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Global(_) => "global",
            Value::Ref(_) => "ref",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Global(a), Value::Global(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::None => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Tuple(items) => items.hash(state),
            Value::Global(ty) => ty.hash(state),
            Value::Ref(id) => id.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::int(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::Ref(id)
    }
}

/// An identity-bearing value stored in the graph arena.
#[derive(Debug, Clone)]
pub enum Node {
    Sequence(Vec<Value>),
    Mapping(ValueMap),
    Set(ValueSet),
    Instance(Instance),
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Sequence(_) => "list",
            Node::Mapping(_) => "dict",
            Node::Set(_) => "set",
            Node::Instance(_) => "instance",
        }
    }
}

/// An object of a registry type.
#[derive(Debug, Clone)]
pub struct Instance {
    pub ty: TypeHandle,
    /// How the object was created, before `state` was applied.
    pub ctor: Constructor,
    pub state: State,
}

impl Instance {
    /// An empty shell, the first phase of two-phase construction.
    pub fn shell(ty: TypeHandle) -> Self {
        Self {
            ty,
            ctor: Constructor::default(),
            state: State::None,
        }
    }
}

/// The call that creates an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Constructor {
    /// `cls.__new__(cls, *args)`, as `NEWOBJ` does. Most objects have no
    /// arguments here.
    New(Vec<Value>),
    /// `cls(*args)`, from a `__reduce__` returning the class itself.
    Call(Vec<Value>),
}

impl Default for Constructor {
    fn default() -> Self {
        Constructor::New(Vec::new())
    }
}

impl Constructor {
    pub fn args(&self) -> &[Value] {
        match self {
            Constructor::New(args) | Constructor::Call(args) => args,
        }
    }

    /// `true` for a bare `__new__` with no arguments.
    pub fn is_plain(&self) -> bool {
        matches!(self, Constructor::New(args) if args.is_empty())
    }
}

/// Instance state, in the shape it was constructed with.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum State {
    #[default]
    None,
    /// A mapping node: attributes, or the contents of a dict-like type.
    Dict(NodeId),
    /// A sequence node: the contents of a list-like type.
    List(NodeId),
    /// A set node: the contents of a set-like type.
    Set(NodeId),
    /// Any other state value.
    Scalar(Value),
}

impl State {
    /// Picks the state shape for `value` given to an instance of `kind`.
    ///
    /// `nodes` resolves references; on mismatch the shape name of `value`
    /// is returned.
    pub fn shape(
        nodes: &super::Graph,
        kind: TypeKind,
        value: Value,
    ) -> Result<State, &'static str> {
        if matches!(value, Value::None) {
            return Ok(State::None);
        }
        let node = value.as_ref_id().and_then(|id| nodes.get(id).map(|n| (id, n)));
        match (kind, node) {
            (_, Some((id, Node::Mapping(_)))) => Ok(State::Dict(id)),
            (TypeKind::List, Some((id, Node::Sequence(_)))) => Ok(State::List(id)),
            (TypeKind::Set, Some((id, Node::Set(_)))) => Ok(State::Set(id)),
            (TypeKind::Generic, _) => Ok(State::Scalar(value)),
            _ => Err(nodes.shape_name(&value)),
        }
    }

    /// The state as a plain value, as it appears in the text form.
    pub fn to_value(&self) -> Value {
        match self {
            State::None => Value::None,
            State::Dict(id) | State::List(id) | State::Set(id) => Value::Ref(*id),
            State::Scalar(v) => v.clone(),
        }
    }
}
