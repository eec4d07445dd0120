//! Graph → tagged JSON.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::error::{TextErrorKind, TextFormatError};
use crate::limits::MAX_NESTING;
use crate::model::{Constructor, Graph, Node, NodeId, State, Value, ValueMap};
use crate::registry::TypeKind;
use crate::text::{is_reserved, Path, TextOptions, ARGS, CLASS, ID, KIND, MODULE, NEWARGS, STATE, VALUE};

/// Renders `root` as a JSON document.
///
/// Nodes reachable more than once from `root` are anchored with ids
/// numbered from 0 in depth-first order of first occurrence.
pub fn to_text(graph: &Graph, root: &Value, options: &TextOptions) -> Result<Json, TextFormatError> {
    let mut emitter = Emitter {
        graph,
        options: *options,
        counts: count_references(graph, root),
        anchors: FxHashMap::default(),
        path: Path::default(),
        depth: 0,
    };
    let out = emitter.emit(root)?;
    debug!(
        nodes = emitter.counts.len(),
        anchors = emitter.anchors.len(),
        "rendered graph as text"
    );
    Ok(out)
}

/// Counts how many positions reachable from `root` refer to each node.
fn count_references(graph: &Graph, root: &Value) -> FxHashMap<NodeId, u32> {
    fn bump(counts: &mut FxHashMap<NodeId, u32>, pending: &mut Vec<NodeId>, id: NodeId) {
        let count = counts.entry(id).or_insert(0);
        *count += 1;
        if *count == 1 {
            pending.push(id);
        }
    }

    let mut counts = FxHashMap::default();
    let mut pending = Vec::new();
    let mut values = vec![root];
    loop {
        while let Some(value) = values.pop() {
            match value {
                Value::Tuple(items) => values.extend(items),
                Value::Ref(id) => bump(&mut counts, &mut pending, *id),
                _ => {}
            }
        }
        let Some(id) = pending.pop() else {
            break;
        };
        match graph.get(id) {
            Some(Node::Sequence(items)) => values.extend(items),
            Some(Node::Mapping(map)) => {
                for (key, value) in map {
                    values.push(key);
                    values.push(value);
                }
            }
            Some(Node::Set(members)) => values.extend(members),
            Some(Node::Instance(inst)) => {
                values.extend(inst.ctor.args());
                match &inst.state {
                    State::None => {}
                    State::Dict(content) | State::List(content) | State::Set(content) => {
                        bump(&mut counts, &mut pending, *content)
                    }
                    State::Scalar(value) => values.push(value),
                }
            }
            None => {}
        }
    }
    counts
}

fn tag(name: &str, body: Json) -> Json {
    let mut obj = Map::new();
    obj.insert(name.to_owned(), body);
    Json::Object(obj)
}

fn int_json(v: &BigInt) -> Json {
    if let Some(n) = v.to_i64() {
        Json::from(n)
    } else if let Some(n) = v.to_u64() {
        Json::from(n)
    } else {
        tag("int", Json::String(v.to_string()))
    }
}

fn float_json(v: f64) -> Json {
    match serde_json::Number::from_f64(v) {
        Some(n) => Json::Number(n),
        None if v.is_nan() => tag("float", Json::from("nan")),
        None if v > 0.0 => tag("float", Json::from("inf")),
        None => tag("float", Json::from("-inf")),
    }
}

/// Key text in lossy mode, following `json.dumps`.
fn stringify_key(key: &Value) -> Option<String> {
    Some(match key {
        Value::Str(s) => s.clone(),
        Value::None => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_nan() => "NaN".to_owned(),
        Value::Float(f) if f.is_infinite() => {
            if *f > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
        }
        Value::Float(f) => format!("{f:?}"),
        _ => return None,
    })
}

struct Emitter<'g> {
    graph: &'g Graph,
    options: TextOptions,
    counts: FxHashMap<NodeId, u32>,
    anchors: FxHashMap<NodeId, u64>,
    path: Path,
    depth: usize,
}

impl Emitter<'_> {
    fn emit(&mut self, value: &Value) -> Result<Json, TextFormatError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.path.error(TextErrorKind::NestingTooDeep { max: MAX_NESTING }));
        }
        let out = match value {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => int_json(i),
            Value::Float(f) => float_json(*f),
            Value::Str(s) => Json::String(s.clone()),
            Value::Bytes(b) => tag("bytes", Json::String(hex::encode(b))),
            Value::Tuple(items) => tag("tuple", self.emit_items("tuple", items)?),
            Value::Global(ty) => tag("global", serde_json::json!([ty.module(), ty.name()])),
            Value::Ref(id) => self.emit_node(*id)?,
        };
        self.depth -= 1;
        Ok(out)
    }

    fn emit_items<'v>(
        &mut self,
        segment: &str,
        items: impl IntoIterator<Item = &'v Value>,
    ) -> Result<Json, TextFormatError> {
        let outer = self.path.push(segment);
        let mut out = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            let mark = self.path.push(i);
            out.push(self.emit(item)?);
            self.path.truncate(mark);
        }
        self.path.truncate(outer);
        Ok(Json::Array(out))
    }

    fn emit_node(&mut self, id: NodeId) -> Result<Json, TextFormatError> {
        if let Some(&anchor) = self.anchors.get(&id) {
            return Ok(tag("ref", Json::from(anchor)));
        }
        let graph = self.graph;
        let node = graph.get(id).ok_or_else(|| {
            self.path.error(TextErrorKind::Expected {
                context: "reference",
                expected: "a node of the graph",
                found: "dangling node id",
            })
        })?;
        let anchor = if self.counts.get(&id).copied().unwrap_or(0) > 1 {
            let anchor = self.anchors.len() as u64;
            self.anchors.insert(id, anchor);
            Some(anchor)
        } else {
            None
        };

        if let Node::Instance(inst) = node {
            let mut obj = Map::new();
            obj.insert(CLASS.to_owned(), Json::from(inst.ty.name()));
            obj.insert(MODULE.to_owned(), Json::from(inst.ty.module()));
            if let Some(anchor) = anchor {
                obj.insert(ID.to_owned(), Json::from(anchor));
            }
            // Builtin types have a fixed kind; a synthesized one only knows
            // it from how its instances were filled.
            let kind = inst.ty.kind();
            if inst.ty.is_synthesized() && kind != TypeKind::Generic {
                obj.insert(KIND.to_owned(), Json::from(kind.as_str()));
            }
            match &inst.ctor {
                ctor if ctor.is_plain() => {}
                Constructor::New(args) => {
                    let args = self.emit_items(NEWARGS, args)?;
                    obj.insert(NEWARGS.to_owned(), args);
                }
                Constructor::Call(args) => {
                    let args = self.emit_items(ARGS, args)?;
                    obj.insert(ARGS.to_owned(), args);
                }
            }
            let mark = self.path.push(STATE);
            let state = self.emit(&inst.state.to_value())?;
            self.path.truncate(mark);
            obj.insert(STATE.to_owned(), state);
            return Ok(Json::Object(obj));
        }

        let Some(anchor) = anchor else {
            return self.emit_collection(node);
        };
        let mark = self.path.push(VALUE);
        let body = self.emit_collection(node)?;
        self.path.truncate(mark);
        let mut obj = Map::new();
        obj.insert(ID.to_owned(), Json::from(anchor));
        obj.insert(VALUE.to_owned(), body);
        Ok(Json::Object(obj))
    }

    fn emit_collection(&mut self, node: &Node) -> Result<Json, TextFormatError> {
        match node {
            Node::Sequence(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let mark = self.path.push(i);
                    out.push(self.emit(item)?);
                    self.path.truncate(mark);
                }
                Ok(Json::Array(out))
            }
            Node::Set(members) => Ok(tag("set", self.emit_items("set", members)?)),
            Node::Mapping(map) => self.emit_mapping(map),
            Node::Instance(_) => unreachable!("instances are rendered by emit_node"),
        }
    }

    /// Record keys for `map`, or `None` if it has to be written as pairs.
    fn record_keys(&self, map: &ValueMap) -> Option<Vec<String>> {
        let keys: Vec<String> = map
            .keys()
            .map(|key| match key {
                Value::Str(s) => Some(s.clone()),
                other if self.options.stringify_keys => stringify_key(other),
                _ => None,
            })
            .collect::<Option<_>>()?;
        if self.options.stringify_keys {
            let mut seen = FxHashSet::default();
            if !keys.iter().all(|k| seen.insert(k.as_str())) {
                return None;
            }
        }
        let names: Vec<&str> = keys.iter().map(String::as_str).collect();
        (!is_reserved(&names)).then_some(keys)
    }

    fn emit_mapping(&mut self, map: &ValueMap) -> Result<Json, TextFormatError> {
        if let Some(keys) = self.record_keys(map) {
            let mut obj = Map::new();
            for (key, value) in keys.into_iter().zip(map.values()) {
                let mark = self.path.push(&key);
                let value = self.emit(value)?;
                self.path.truncate(mark);
                obj.insert(key, value);
            }
            return Ok(Json::Object(obj));
        }

        let outer = self.path.push("pairs");
        let mut pairs = Vec::with_capacity(map.len());
        for (i, (key, value)) in map.iter().enumerate() {
            let entry = self.path.push(i);
            let mark = self.path.push(0);
            let key = self.emit(key)?;
            self.path.truncate(mark);
            let mark = self.path.push(1);
            let value = self.emit(value)?;
            self.path.truncate(mark);
            self.path.truncate(entry);
            pairs.push(Json::Array(vec![key, value]));
        }
        self.path.truncate(outer);
        Ok(tag("pairs", Json::Array(pairs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeRegistry;
    use serde_json::json;

    fn render(graph: &Graph, root: &Value) -> Json {
        to_text(graph, root, &TextOptions::default()).unwrap()
    }

    #[test]
    fn test_primitives() {
        let graph = Graph::new();
        let big = Value::Int(BigInt::from(1u8) << 70);
        let root = Value::Tuple(vec![
            Value::None,
            Value::Bool(true),
            Value::int(-5),
            Value::Int(BigInt::from(u64::MAX)),
            big,
            Value::Float(1.0),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(f64::NAN),
            Value::str("hi"),
            Value::Bytes(vec![0xde, 0xad]),
        ]);
        assert_eq!(
            render(&graph, &root),
            json!({"tuple": [
                null, true, -5, u64::MAX, {"int": "1180591620717411303424"},
                1.0, {"float": "-inf"}, {"float": "nan"}, "hi", {"bytes": "dead"}
            ]})
        );
    }

    #[test]
    fn test_scenario_dict_with_list_and_set() {
        let mut graph = Graph::new();
        let list = graph.sequence(vec![Value::int(1), Value::int(2), Value::int(3)]);
        let set = graph.set(vec![Value::int(1), Value::int(2)]);
        let root = graph.mapping(vec![("a".into(), list), ("b".into(), set)]);
        assert_eq!(render(&graph, &root), json!({"a": [1, 2, 3], "b": {"set": [1, 2]}}));
    }

    #[test]
    fn test_instance_record() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let items = graph.add(Node::Sequence(vec![Value::int(1), Value::int(2), Value::int(3)]));
        let root = graph.instance(
            registry.resolve("renpy.revertable", "RevertableList"),
            State::List(items),
        );
        assert_eq!(
            render(&graph, &root),
            json!({"class": "RevertableList", "module": "renpy.revertable", "state": [1, 2, 3]})
        );
    }

    #[test]
    fn test_non_string_keys_use_pairs() {
        let mut graph = Graph::new();
        let root = graph.mapping(vec![
            (Value::int(1), Value::str("one")),
            (Value::Tuple(vec![Value::int(1)]), Value::None),
        ]);
        assert_eq!(
            render(&graph, &root),
            json!({"pairs": [[1, "one"], [{"tuple": [1]}, null]]})
        );
    }

    #[test]
    fn test_stringified_keys() {
        let mut graph = Graph::new();
        let root = graph.mapping(vec![
            (Value::int(1), Value::str("one")),
            (Value::Bool(false), Value::None),
        ]);
        let out = to_text(&graph, &root, &TextOptions::stringified_keys()).unwrap();
        assert_eq!(out, json!({"1": "one", "false": null}));

        // Keys that collide once stringified stay as pairs.
        let clash = graph.mapping(vec![(Value::int(1), Value::None), (Value::str("1"), Value::None)]);
        let out = to_text(&graph, &clash, &TextOptions::stringified_keys()).unwrap();
        assert!(out.get("pairs").is_some());
    }

    #[test]
    fn test_reserved_keys_are_escaped() {
        let mut graph = Graph::new();
        let root = graph.mapping(vec![("class".into(), Value::str("warrior"))]);
        assert_eq!(render(&graph, &root), json!({"pairs": [["class", "warrior"]]}));

        let root = graph.mapping(vec![("set".into(), Value::int(1))]);
        assert_eq!(render(&graph, &root), json!({"pairs": [["set", 1]]}));

        let root = graph.mapping(vec![("set".into(), Value::int(1)), ("x".into(), Value::int(2))]);
        assert_eq!(render(&graph, &root), json!({"set": 1, "x": 2}));
    }

    #[test]
    fn test_shared_and_cyclic_nodes_are_anchored() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let shared = graph.sequence(vec![Value::int(7)]);
        let hero = graph.instance(registry.resolve("store", "Hero"), State::None);
        let attrs = graph.mapping(vec![("me".into(), hero.clone())]);
        if let Node::Instance(inst) = &mut graph[hero.as_ref_id().unwrap()] {
            inst.state = State::Dict(attrs.as_ref_id().unwrap());
        }
        let root = graph.sequence(vec![shared.clone(), hero, shared]);
        assert_eq!(
            render(&graph, &root),
            json!([
                {"id": 0, "value": [7]},
                {"class": "Hero", "module": "store", "id": 1, "state": {"me": {"ref": 1}}},
                {"ref": 0}
            ])
        );
    }

    #[test]
    fn test_learned_kind_and_arguments() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let bag = registry.resolve("store", "Bag");
        registry.refine(&bag, TypeKind::List).unwrap();
        let items = graph.add(Node::Sequence(Vec::new()));
        let bag = graph.instance(bag, State::List(items));
        let point = graph.instance_with(
            registry.resolve("store", "Point"),
            Constructor::Call(vec![Value::int(1)]),
            State::None,
        );
        let tag = graph.instance_with(
            registry.resolve("store", "Tag"),
            Constructor::New(vec![Value::str("x")]),
            State::None,
        );
        let items = graph.add(Node::Sequence(Vec::new()));
        let seeded = graph.instance(
            registry.resolve("renpy.revertable", "RevertableList"),
            State::List(items),
        );
        let root = graph.sequence(vec![bag, point, tag, seeded]);
        assert_eq!(
            render(&graph, &root),
            json!([
                {"class": "Bag", "module": "store", "kind": "list", "state": []},
                {"class": "Point", "module": "store", "args": [1], "state": null},
                {"class": "Tag", "module": "store", "newargs": ["x"], "state": null},
                {"class": "RevertableList", "module": "renpy.revertable", "state": []}
            ])
        );
    }

    #[test]
    fn test_shared_constructor_argument_is_anchored() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let shared = graph.sequence(vec![Value::int(1)]);
        let point = graph.instance_with(
            registry.resolve("store", "Point"),
            Constructor::Call(vec![shared.clone()]),
            State::None,
        );
        let root = graph.sequence(vec![point, shared]);
        assert_eq!(
            render(&graph, &root),
            json!([
                {"class": "Point", "module": "store", "args": [{"id": 0, "value": [1]}], "state": null},
                {"ref": 0}
            ])
        );
    }

    #[test]
    fn test_global_value() {
        let registry = TypeRegistry::new();
        let graph = Graph::new();
        let root = Value::Global(registry.resolve("store", "Hero"));
        assert_eq!(render(&graph, &root), json!({"global": ["store", "Hero"]}));
    }

    #[test]
    fn test_errors_carry_path() {
        let mut graph = Graph::new();
        let root = graph.mapping(vec![("a".into(), Value::Tuple(vec![Value::Ref(NodeId(9))]))]);
        let err = to_text(&graph, &root, &TextOptions::default()).unwrap_err();
        assert_eq!(err.path, "/a/tuple/0");

        let mut deep = Value::None;
        for _ in 0..=MAX_NESTING {
            deep = Value::Tuple(vec![deep]);
        }
        let err = to_text(&graph, &deep, &TextOptions::default()).unwrap_err();
        assert_eq!(err.kind, TextErrorKind::NestingTooDeep { max: MAX_NESTING });
    }
}
