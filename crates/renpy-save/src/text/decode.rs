//! Tagged JSON → graph.

use num_bigint::BigInt;
use rustc_hash::FxHashMap;
use serde_json::{Map, Number, Value as Json};
use tracing::debug;

use crate::error::{TextErrorKind, TextFormatError};
use crate::limits::MAX_NESTING;
use crate::model::{Constructor, Graph, Instance, Node, NodeId, State, Value, ValueMap, ValueSet};
use crate::registry::{TypeKind, TypeRegistry};
use crate::text::{json_kind, Path, ARGS, CLASS, ID, KIND, MODULE, NEWARGS, SINGLE_KEY_TAGS, STATE, VALUE};

/// Rebuilds a graph from its tagged JSON form, resolving class names
/// through `registry`.
pub fn from_text(document: &Json, registry: &TypeRegistry) -> Result<(Graph, Value), TextFormatError> {
    from_text_at(document, registry, "")
}

/// Like [`from_text`], with error paths prefixed by `root`.
pub(crate) fn from_text_at(
    document: &Json,
    registry: &TypeRegistry,
    root: &str,
) -> Result<(Graph, Value), TextFormatError> {
    let mut decoder = TextDecoder {
        registry,
        graph: Graph::new(),
        anchors: FxHashMap::default(),
        path: Path::new(root),
        depth: 0,
    };
    let value = decoder.value(document)?;
    debug!(
        nodes = decoder.graph.len(),
        anchors = decoder.anchors.len(),
        "rebuilt graph from text"
    );
    Ok((decoder.graph, value))
}

/// What a JSON object stands for.
enum Form<'a> {
    Instance,
    Tag(&'a str, &'a Json),
    Anchor,
    Record,
}

fn classify(obj: &Map<String, Json>) -> Form<'_> {
    if obj.contains_key(CLASS) || obj.contains_key(MODULE) {
        return Form::Instance;
    }
    if obj.len() == 1 {
        if let Some((key, body)) = obj.iter().next() {
            if SINGLE_KEY_TAGS.contains(&key.as_str()) {
                return Form::Tag(key, body);
            }
        }
    }
    if obj.len() == 2 && obj.contains_key(ID) && obj.contains_key(VALUE) {
        return Form::Anchor;
    }
    Form::Record
}

fn number(n: &Number) -> Value {
    if let Some(v) = n.as_i64() {
        Value::int(v)
    } else if let Some(v) = n.as_u64() {
        Value::Int(BigInt::from(v))
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "nan" => Some(f64::NAN),
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

struct TextDecoder<'r> {
    registry: &'r TypeRegistry,
    graph: Graph,
    anchors: FxHashMap<u64, NodeId>,
    path: Path,
    depth: usize,
}

impl TextDecoder<'_> {
    fn value(&mut self, json: &Json) -> Result<Value, TextFormatError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.path.error(TextErrorKind::NestingTooDeep { max: MAX_NESTING }));
        }
        let value = match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => number(n),
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => {
                let id = self.graph.add(Node::Sequence(Vec::new()));
                self.fill_sequence(id, items)?;
                Value::Ref(id)
            }
            Json::Object(obj) => match classify(obj) {
                Form::Instance => self.instance(obj)?,
                Form::Tag(tag, body) => self.tagged(tag, body)?,
                Form::Anchor => self.anchored(obj)?,
                Form::Record => {
                    let id = self.graph.add(Node::Mapping(ValueMap::default()));
                    self.fill_record(id, obj)?;
                    Value::Ref(id)
                }
            },
        };
        self.depth -= 1;
        Ok(value)
    }

    fn expected(&self, context: &'static str, expected: &'static str, found: &Json) -> TextFormatError {
        self.path.error(TextErrorKind::Expected {
            context,
            expected,
            found: json_kind(found),
        })
    }

    fn tagged(&mut self, tag: &str, body: &Json) -> Result<Value, TextFormatError> {
        let text = |this: &Self, context: &'static str| {
            body.as_str().ok_or_else(|| this.expected(context, "string", body))
        };
        let invalid = |this: &Self, context: &'static str, text: &str| {
            this.path.error(TextErrorKind::InvalidLiteral {
                context,
                text: text.to_owned(),
            })
        };

        match tag {
            "ref" => {
                let id = body.as_u64().ok_or_else(|| self.expected("ref", "unsigned integer", body))?;
                let node = self
                    .anchors
                    .get(&id)
                    .ok_or_else(|| self.path.error(TextErrorKind::DanglingRef { id }))?;
                Ok(Value::Ref(*node))
            }
            "int" => {
                let s = text(self, "int")?;
                s.parse::<BigInt>().map(Value::Int).map_err(|_| invalid(self, "int", s))
            }
            "float" => {
                let s = text(self, "float")?;
                parse_float(s).map(Value::Float).ok_or_else(|| invalid(self, "float", s))
            }
            "bytes" => {
                let s = text(self, "bytes")?;
                hex::decode(s).map(Value::Bytes).map_err(|_| invalid(self, "bytes", s))
            }
            "global" => match body.as_array().map(Vec::as_slice) {
                Some([Json::String(module), Json::String(name)]) => {
                    Ok(Value::Global(self.registry.resolve(module, name)))
                }
                _ => Err(self.expected("global", "[module, name] array", body)),
            },
            "tuple" => {
                let items = body.as_array().ok_or_else(|| self.expected("tuple", "array", body))?;
                let outer = self.path.push("tuple");
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let mark = self.path.push(i);
                    out.push(self.value(item)?);
                    self.path.truncate(mark);
                }
                self.path.truncate(outer);
                Ok(Value::Tuple(out))
            }
            "set" => {
                let id = self.graph.add(Node::Set(ValueSet::default()));
                self.fill_set(id, body)?;
                Ok(Value::Ref(id))
            }
            "pairs" => {
                let id = self.graph.add(Node::Mapping(ValueMap::default()));
                self.fill_pairs(id, body)?;
                Ok(Value::Ref(id))
            }
            _ => unreachable!("classify only yields known tags"),
        }
    }

    fn anchor_id(&mut self, json: &Json) -> Result<u64, TextFormatError> {
        let mark = self.path.push(ID);
        let id = json.as_u64().ok_or_else(|| self.expected("id", "unsigned integer", json))?;
        if self.anchors.contains_key(&id) {
            return Err(self.path.error(TextErrorKind::DuplicateId { id }));
        }
        self.path.truncate(mark);
        Ok(id)
    }

    /// `{"id": n, "value": ...}` around a list, dict or set.
    ///
    /// The empty node is registered under its id before the body is read
    /// so the body can refer back to it.
    fn anchored(&mut self, obj: &Map<String, Json>) -> Result<Value, TextFormatError> {
        let anchor = self.anchor_id(&obj[ID])?;
        let body = &obj[VALUE];

        let mark = self.path.push(VALUE);
        let id = match body {
            Json::Array(items) => {
                let id = self.graph.add(Node::Sequence(Vec::new()));
                self.anchors.insert(anchor, id);
                self.fill_sequence(id, items)?;
                id
            }
            Json::Object(inner) => match classify(inner) {
                Form::Tag("set", members) => {
                    let id = self.graph.add(Node::Set(ValueSet::default()));
                    self.anchors.insert(anchor, id);
                    self.fill_set(id, members)?;
                    id
                }
                Form::Tag("pairs", pairs) => {
                    let id = self.graph.add(Node::Mapping(ValueMap::default()));
                    self.anchors.insert(anchor, id);
                    self.fill_pairs(id, pairs)?;
                    id
                }
                Form::Record => {
                    let id = self.graph.add(Node::Mapping(ValueMap::default()));
                    self.anchors.insert(anchor, id);
                    self.fill_record(id, inner)?;
                    id
                }
                _ => return Err(self.expected("anchored value", "list, dict or set", body)),
            },
            other => return Err(self.expected("anchored value", "list, dict or set", other)),
        };
        self.path.truncate(mark);
        Ok(Value::Ref(id))
    }

    fn instance(&mut self, obj: &Map<String, Json>) -> Result<Value, TextFormatError> {
        const KEYS: &[&str] = &[CLASS, MODULE, STATE, ID, KIND, ARGS, NEWARGS];
        if let Some(key) = obj.keys().find(|k| !KEYS.contains(&k.as_str())) {
            return Err(self.path.error(TextErrorKind::UnexpectedKey {
                tag: "instance",
                key: key.clone(),
            }));
        }
        if obj.contains_key(ARGS) && obj.contains_key(NEWARGS) {
            return Err(self.path.error(TextErrorKind::UnexpectedKey {
                tag: "instance",
                key: NEWARGS.to_owned(),
            }));
        }
        let field = |this: &Self, key: &'static str| match obj.get(key) {
            Some(Json::String(s)) => Ok(s.as_str()),
            Some(other) => Err(this.expected(key, "string", other)),
            None => Err(this.path.error(TextErrorKind::MissingKey { tag: "instance", key })),
        };
        let name = field(self, CLASS)?;
        let module = field(self, MODULE)?;

        let ty = self.registry.resolve(module, name);
        if let Some(kind) = obj.get(KIND) {
            let mark = self.path.push(KIND);
            let text = kind.as_str().ok_or_else(|| self.expected(KIND, "string", kind))?;
            let kind = TypeKind::from_name(text).ok_or_else(|| {
                self.path.error(TextErrorKind::InvalidLiteral {
                    context: KIND,
                    text: text.to_owned(),
                })
            })?;
            self.registry
                .refine(&ty, kind)
                .map_err(|e| self.path.error(TextErrorKind::Registry(e)))?;
            self.path.truncate(mark);
        }
        let id = self.graph.add(Node::Instance(Instance::shell(ty.clone())));
        if let Some(anchor) = obj.get(ID) {
            let anchor = self.anchor_id(anchor)?;
            self.anchors.insert(anchor, id);
        }

        let ctor = match (obj.get(ARGS), obj.get(NEWARGS)) {
            (Some(args), _) => Some(Constructor::Call(self.arguments(ARGS, args)?)),
            (None, Some(args)) => Some(Constructor::New(self.arguments(NEWARGS, args)?)),
            (None, None) => None,
        };
        if let (Some(ctor), Node::Instance(inst)) = (ctor, &mut self.graph[id]) {
            inst.ctor = ctor;
        }

        let state = match obj.get(STATE) {
            Some(json) => {
                let mark = self.path.push(STATE);
                let state = self.value(json)?;
                self.path.truncate(mark);
                state
            }
            None => Value::None,
        };
        let state = State::shape(&self.graph, ty.kind(), state).map_err(|found| {
            self.path.error(TextErrorKind::StateShape {
                module: module.to_owned(),
                name: name.to_owned(),
                kind: ty.kind(),
                found,
            })
        })?;
        if let Node::Instance(inst) = &mut self.graph[id] {
            inst.state = state;
        }
        Ok(Value::Ref(id))
    }

    fn arguments(&mut self, key: &'static str, json: &Json) -> Result<Vec<Value>, TextFormatError> {
        let outer = self.path.push(key);
        let items = json.as_array().ok_or_else(|| self.expected(key, "array", json))?;
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mark = self.path.push(i);
            out.push(self.value(item)?);
            self.path.truncate(mark);
        }
        self.path.truncate(outer);
        Ok(out)
    }

    fn fill_sequence(&mut self, id: NodeId, items: &[Json]) -> Result<(), TextFormatError> {
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mark = self.path.push(i);
            out.push(self.value(item)?);
            self.path.truncate(mark);
        }
        self.graph[id] = Node::Sequence(out);
        Ok(())
    }

    fn fill_set(&mut self, id: NodeId, body: &Json) -> Result<(), TextFormatError> {
        let outer = self.path.push("set");
        let members = body.as_array().ok_or_else(|| self.expected("set", "array", body))?;
        let mut out = ValueSet::with_capacity_and_hasher(members.len(), Default::default());
        for (i, member) in members.iter().enumerate() {
            let mark = self.path.push(i);
            out.insert(self.value(member)?);
            self.path.truncate(mark);
        }
        self.path.truncate(outer);
        self.graph[id] = Node::Set(out);
        Ok(())
    }

    fn fill_pairs(&mut self, id: NodeId, body: &Json) -> Result<(), TextFormatError> {
        let outer = self.path.push("pairs");
        let pairs = body.as_array().ok_or_else(|| self.expected("pairs", "array", body))?;
        let mut out = ValueMap::with_capacity_and_hasher(pairs.len(), Default::default());
        for (i, pair) in pairs.iter().enumerate() {
            let entry = self.path.push(i);
            let Some([key, value]) = pair.as_array().map(Vec::as_slice) else {
                return Err(self.expected("pairs entry", "[key, value] array", pair));
            };
            let mark = self.path.push(0);
            let key = self.value(key)?;
            self.path.truncate(mark);
            let mark = self.path.push(1);
            let value = self.value(value)?;
            self.path.truncate(mark);
            self.path.truncate(entry);
            out.insert(key, value);
        }
        self.path.truncate(outer);
        self.graph[id] = Node::Mapping(out);
        Ok(())
    }

    fn fill_record(&mut self, id: NodeId, obj: &Map<String, Json>) -> Result<(), TextFormatError> {
        let mut out = ValueMap::with_capacity_and_hasher(obj.len(), Default::default());
        for (key, value) in obj {
            let mark = self.path.push(key);
            let value = self.value(value)?;
            self.path.truncate(mark);
            out.insert(Value::Str(key.clone()), value);
        }
        self.graph[id] = Node::Mapping(out);
        Ok(())
    }
}
