//! Object graph → pickle stream.
//!
//! One depth-first pass. Every identity-bearing node is memoized as soon as
//! its empty shell is on the stack, before its contents are written, so
//! shared and cyclic references become memo loads.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::codec::opcode::Opcode;
use crate::codec::primitives::Writer;
use crate::error::EncodeError;
use crate::limits::{BATCH_SIZE, DEFAULT_PROTOCOL, MAX_NESTING, MAX_PROTOCOL, MIN_ENCODE_PROTOCOL};
use crate::model::{Constructor, Graph, Instance, Node, NodeId, State, Value};
use crate::registry::{TypeHandle, TypeKind};

/// Options for encoding a graph.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    /// Pickle protocol to write, 2 through 5.
    ///
    /// Protocol 2 is what Ren'Py writes; every Ren'Py version loads it.
    pub protocol: u8,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL,
        }
    }
}

impl EncodeOptions {
    /// Creates default (protocol 2) encoding options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options for a specific protocol.
    pub fn with_protocol(protocol: u8) -> Self {
        Self { protocol }
    }
}

/// Encodes the value `root` of `graph` as a pickle stream.
pub fn encode_pickle(graph: &Graph, root: &Value, options: &EncodeOptions) -> Result<Vec<u8>, EncodeError> {
    let protocol = options.protocol;
    if !(MIN_ENCODE_PROTOCOL..=MAX_PROTOCOL).contains(&protocol) {
        return Err(EncodeError::UnsupportedProtocol { protocol });
    }

    let mut encoder = Encoder {
        graph,
        protocol,
        w: Writer::with_capacity(graph.len() * 16),
        memo: FxHashMap::default(),
        globals: FxHashMap::default(),
        builtins: FxHashMap::default(),
        open: FxHashSet::default(),
        next_memo: 0,
        depth: 0,
    };
    encoder.op(Opcode::Proto);
    encoder.w.write_byte(protocol);
    encoder.save(root)?;
    encoder.op(Opcode::Stop);

    debug!(
        protocol,
        bytes = encoder.w.len(),
        memo = encoder.next_memo,
        "encoded pickle stream"
    );
    Ok(encoder.w.into_bytes())
}

struct Encoder<'g> {
    graph: &'g Graph,
    protocol: u8,
    w: Writer,
    memo: FxHashMap<NodeId, u32>,
    globals: FxHashMap<TypeHandle, u32>,
    builtins: FxHashMap<(&'static str, &'static str), u32>,
    /// Nodes whose construction is in progress but not yet memoized.
    open: FxHashSet<NodeId>,
    next_memo: u32,
    depth: usize,
}

impl Encoder<'_> {
    fn op(&mut self, opcode: Opcode) {
        self.w.write_byte(opcode as u8);
    }

    fn builtins_module(&self) -> &'static str {
        if self.protocol < 3 { "__builtin__" } else { "builtins" }
    }

    // =========================================================================
    // Memo
    // =========================================================================

    /// Memoizes the value on top of the stack and returns its key.
    fn put(&mut self) -> u32 {
        let key = self.next_memo;
        self.next_memo += 1;
        if self.protocol >= 4 {
            self.op(Opcode::Memoize);
        } else if let Ok(short) = u8::try_from(key) {
            self.op(Opcode::BinPut);
            self.w.write_byte(short);
        } else {
            self.op(Opcode::LongBinPut);
            self.w.write_u32_le(key);
        }
        key
    }

    fn get(&mut self, key: u32) {
        if let Ok(short) = u8::try_from(key) {
            self.op(Opcode::BinGet);
            self.w.write_byte(short);
        } else {
            self.op(Opcode::LongBinGet);
            self.w.write_u32_le(key);
        }
    }

    fn memoize(&mut self, id: NodeId) {
        let key = self.put();
        self.memo.insert(id, key);
    }

    // =========================================================================
    // Values
    // =========================================================================

    fn save(&mut self, value: &Value) -> Result<(), EncodeError> {
        match value {
            Value::None => self.op(Opcode::None),
            Value::Bool(true) => self.op(Opcode::NewTrue),
            Value::Bool(false) => self.op(Opcode::NewFalse),
            Value::Int(v) => self.save_int(v),
            Value::Float(v) => {
                self.op(Opcode::BinFloat);
                self.w.write_f64_be(*v);
            }
            Value::Str(s) => self.save_str(s),
            Value::Bytes(b) => self.save_bytes(b)?,
            Value::Tuple(items) => {
                self.enter()?;
                self.save_tuple(items)?;
                self.depth -= 1;
            }
            Value::Global(ty) => self.save_global(ty)?,
            Value::Ref(id) => {
                self.enter()?;
                self.save_node(*id)?;
                self.depth -= 1;
            }
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), EncodeError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(EncodeError::NestingTooDeep { max: MAX_NESTING });
        }
        Ok(())
    }

    fn save_int(&mut self, v: &BigInt) {
        match v.to_i64() {
            Some(n @ 0..=0xff) => {
                self.op(Opcode::BinInt1);
                self.w.write_byte(n as u8);
            }
            Some(n @ 0..=0xffff) => {
                self.op(Opcode::BinInt2);
                self.w.write_u16_le(n as u16);
            }
            Some(n) if i32::try_from(n).is_ok() => {
                self.op(Opcode::BinInt);
                self.w.write_i32_le(n as i32);
            }
            _ => {
                let bytes = v.to_signed_bytes_le();
                if let Ok(len) = u8::try_from(bytes.len()) {
                    self.op(Opcode::Long1);
                    self.w.write_byte(len);
                } else {
                    self.op(Opcode::Long4);
                    self.w.write_i32_le(bytes.len() as i32);
                }
                self.w.write_bytes(&bytes);
            }
        }
    }

    fn save_str(&mut self, s: &str) {
        let len = s.len();
        if len < 256 && self.protocol >= 4 {
            self.op(Opcode::ShortBinUnicode);
            self.w.write_byte(len as u8);
        } else if let Ok(len) = u32::try_from(len) {
            self.op(Opcode::BinUnicode);
            self.w.write_u32_le(len);
        } else {
            self.op(Opcode::BinUnicode8);
            self.w.write_u64_le(len as u64);
        }
        self.w.write_bytes(s.as_bytes());
    }

    fn save_bytes(&mut self, b: &[u8]) -> Result<(), EncodeError> {
        if self.protocol < 3 {
            // Python 3 writes bytes at protocol 2 as _codecs.encode(latin1 text, 'latin1')
            self.save_builtin("_codecs", "encode")?;
            let text: String = b.iter().map(|&byte| char::from(byte)).collect();
            self.save_str(&text);
            self.save_str("latin1");
            self.op(Opcode::Tuple2);
            self.op(Opcode::Reduce);
            return Ok(());
        }
        let len = b.len();
        if len < 256 {
            self.op(Opcode::ShortBinBytes);
            self.w.write_byte(len as u8);
        } else if let Ok(len) = u32::try_from(len) {
            self.op(Opcode::BinBytes);
            self.w.write_u32_le(len);
        } else {
            self.op(Opcode::BinBytes8);
            self.w.write_u64_le(len as u64);
        }
        self.w.write_bytes(b);
        Ok(())
    }

    fn save_tuple(&mut self, items: &[Value]) -> Result<(), EncodeError> {
        let opcode = match items.len() {
            0 => {
                self.op(Opcode::EmptyTuple);
                return Ok(());
            }
            1 => Opcode::Tuple1,
            2 => Opcode::Tuple2,
            3 => Opcode::Tuple3,
            _ => {
                self.op(Opcode::Mark);
                Opcode::Tuple
            }
        };
        for item in items {
            self.save(item)?;
        }
        self.op(opcode);
        Ok(())
    }

    fn write_global(&mut self, module: &str, name: &str) -> Result<(), EncodeError> {
        if self.protocol >= 4 {
            self.save_str(module);
            self.save_str(name);
            self.op(Opcode::StackGlobal);
            return Ok(());
        }
        if module.contains('\n') || name.contains('\n') {
            return Err(EncodeError::InvalidGlobal {
                module: module.to_owned(),
                name: name.to_owned(),
                protocol: self.protocol,
            });
        }
        self.op(Opcode::Global);
        self.w.write_line(module);
        self.w.write_line(name);
        Ok(())
    }

    fn save_global(&mut self, ty: &TypeHandle) -> Result<(), EncodeError> {
        if let Some(&key) = self.globals.get(ty) {
            self.get(key);
            return Ok(());
        }
        self.write_global(ty.module(), ty.name())?;
        let key = self.put();
        self.globals.insert(ty.clone(), key);
        Ok(())
    }

    fn save_builtin(&mut self, module: &'static str, name: &'static str) -> Result<(), EncodeError> {
        if let Some(&key) = self.builtins.get(&(module, name)) {
            self.get(key);
            return Ok(());
        }
        self.write_global(module, name)?;
        let key = self.put();
        self.builtins.insert((module, name), key);
        Ok(())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    fn save_node(&mut self, id: NodeId) -> Result<(), EncodeError> {
        if let Some(&key) = self.memo.get(&id) {
            self.get(key);
            return Ok(());
        }
        if self.open.contains(&id) {
            return Err(EncodeError::UnsupportedCycle { node: id.index() });
        }

        let graph = self.graph;
        let node = graph
            .get(id)
            .ok_or(EncodeError::DanglingNode { node: id.index() })?;
        match node {
            Node::Sequence(items) => {
                self.op(Opcode::EmptyList);
                self.memoize(id);
                self.batch(items.iter(), Opcode::Append, Opcode::Appends)?;
            }
            Node::Mapping(map) => {
                self.op(Opcode::EmptyDict);
                self.memoize(id);
                self.batch_pairs(map.iter())?;
            }
            Node::Set(set) => {
                if self.protocol >= 4 {
                    self.op(Opcode::EmptySet);
                    self.memoize(id);
                    self.batch_additems(set.iter())?;
                } else {
                    let module = self.builtins_module();
                    self.save_builtin(module, "set")?;
                    self.save_reduced_members(id, set.iter())?;
                }
            }
            Node::Instance(inst) => self.save_instance(graph, id, inst)?,
        }
        Ok(())
    }

    /// Writes `cls([members])` for the callable already on the stack,
    /// memoizing the result once it exists.
    fn save_reduced_members<'v>(
        &mut self,
        id: NodeId,
        members: impl Iterator<Item = &'v Value>,
    ) -> Result<(), EncodeError> {
        self.open.insert(id);
        self.op(Opcode::EmptyList);
        self.batch(members, Opcode::Append, Opcode::Appends)?;
        self.op(Opcode::Tuple1);
        self.op(Opcode::Reduce);
        self.open.remove(&id);
        self.memoize(id);
        Ok(())
    }

    fn save_instance(&mut self, graph: &Graph, id: NodeId, inst: &Instance) -> Result<(), EncodeError> {
        let kind = inst.ty.kind();

        if let (TypeKind::Set, State::Set(content), true) = (kind, &inst.state, self.protocol < 4) {
            let Some(Node::Set(members)) = graph.get(*content) else {
                return Err(EncodeError::MalformedState {
                    context: "set state",
                    expected: "set",
                });
            };
            self.save_global(&inst.ty)?;
            return self.save_reduced_members(id, members.iter());
        }

        self.save_global(&inst.ty)?;
        // The arguments exist before the object does.
        self.open.insert(id);
        match &inst.ctor {
            Constructor::New(args) => {
                self.save_tuple(args)?;
                self.op(Opcode::NewObj);
            }
            Constructor::Call(args) => {
                self.save_tuple(args)?;
                self.op(Opcode::Reduce);
            }
        }
        self.open.remove(&id);
        self.memoize(id);

        // Empty contents still get an (empty) batch so they read back as
        // contents rather than as no state.
        match (&inst.state, kind) {
            (State::None, _) => {}
            (State::List(content), TypeKind::List) => {
                let Some(Node::Sequence(items)) = graph.get(*content) else {
                    return Err(EncodeError::MalformedState {
                        context: "list state",
                        expected: "list",
                    });
                };
                if items.is_empty() {
                    self.empty_batch(Opcode::Appends);
                }
                self.batch(items.iter(), Opcode::Append, Opcode::Appends)?;
            }
            (State::Dict(content), TypeKind::Dict) => {
                let Some(Node::Mapping(map)) = graph.get(*content) else {
                    return Err(EncodeError::MalformedState {
                        context: "dict state",
                        expected: "dict",
                    });
                };
                if map.is_empty() {
                    self.empty_batch(Opcode::SetItems);
                }
                self.batch_pairs(map.iter())?;
            }
            (State::Set(content), TypeKind::Set) => {
                let Some(Node::Set(members)) = graph.get(*content) else {
                    return Err(EncodeError::MalformedState {
                        context: "set state",
                        expected: "set",
                    });
                };
                if members.is_empty() {
                    self.empty_batch(Opcode::AddItems);
                }
                self.batch_additems(members.iter())?;
            }
            (state, _) => {
                self.save(&state.to_value())?;
                self.op(Opcode::Build);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Batches
    // =========================================================================

    fn empty_batch(&mut self, many: Opcode) {
        self.op(Opcode::Mark);
        self.op(many);
    }

    /// Appends `items` to the list on top of the stack, in batches.
    fn batch<'v>(
        &mut self,
        items: impl Iterator<Item = &'v Value>,
        single: Opcode,
        many: Opcode,
    ) -> Result<(), EncodeError> {
        let items: Vec<&Value> = items.collect();
        for chunk in items.chunks(BATCH_SIZE) {
            if let [item] = chunk {
                self.save(item)?;
                self.op(single);
                continue;
            }
            self.op(Opcode::Mark);
            for item in chunk {
                self.save(item)?;
            }
            self.op(many);
        }
        Ok(())
    }

    fn batch_pairs<'v>(&mut self, pairs: impl Iterator<Item = (&'v Value, &'v Value)>) -> Result<(), EncodeError> {
        let pairs: Vec<_> = pairs.collect();
        for chunk in pairs.chunks(BATCH_SIZE) {
            if let [(key, value)] = chunk {
                self.save(key)?;
                self.save(value)?;
                self.op(Opcode::SetItem);
                continue;
            }
            self.op(Opcode::Mark);
            for (key, value) in chunk {
                self.save(key)?;
                self.save(value)?;
            }
            self.op(Opcode::SetItems);
        }
        Ok(())
    }

    fn batch_additems<'v>(&mut self, members: impl Iterator<Item = &'v Value>) -> Result<(), EncodeError> {
        let members: Vec<_> = members.collect();
        for chunk in members.chunks(BATCH_SIZE) {
            self.op(Opcode::Mark);
            for member in chunk {
                self.save(member)?;
            }
            self.op(Opcode::AddItems);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode::{decode_pickle, DecodeOptions};
    use crate::registry::TypeRegistry;

    fn roundtrip(graph: &Graph, root: &Value, protocol: u8) -> (Graph, Value) {
        let bytes = encode_pickle(graph, root, &EncodeOptions::with_protocol(protocol)).unwrap();
        let decoded = decode_pickle(&bytes, &TypeRegistry::new(), &DecodeOptions::default()).unwrap();
        assert_eq!(decoded.protocol, protocol);
        (decoded.graph, decoded.root)
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_roundtrip_shared_and_cyclic() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let shared = graph.sequence(vec![Value::int(1), Value::str("x")]);
        let hero = graph.instance(registry.resolve("store", "Hero"), State::None);
        let attrs = graph.mapping(vec![
            ("me".into(), hero.clone()),
            ("bag".into(), shared.clone()),
            ("pos".into(), Value::Tuple(vec![Value::Float(1.5), Value::int(-3)])),
        ]);
        if let Node::Instance(inst) = &mut graph[hero.as_ref_id().unwrap()] {
            inst.state = State::Dict(attrs.as_ref_id().unwrap());
        }
        let root = graph.sequence(vec![hero, shared.clone(), shared]);

        for protocol in [2, 3, 4, 5] {
            let (decoded, decoded_root) = roundtrip(&graph, &root, protocol);
            assert!(graph.structurally_equal(&root, &decoded, &decoded_root), "protocol {protocol}");
        }
    }

    #[test]
    fn test_self_containing_list() {
        let mut graph = Graph::new();
        let list = graph.sequence(vec![]);
        let id = list.as_ref_id().unwrap();
        if let Node::Sequence(items) = &mut graph[id] {
            items.push(list.clone());
        }
        let bytes = encode_pickle(&graph, &list, &EncodeOptions::new()).unwrap();
        // EMPTY_LIST, BINPUT 0, BINGET 0, APPEND
        assert_eq!(bytes, b"\x80\x02]q\x00h\x00a.");
    }

    #[test]
    fn test_set_protocol_2_uses_reduce() {
        let mut graph = Graph::new();
        let set = graph.set(vec![Value::int(1), Value::int(2)]);
        let bytes = encode_pickle(&graph, &set, &EncodeOptions::new()).unwrap();
        assert!(contains(&bytes, b"c__builtin__\nset\n"));

        let (decoded, root) = roundtrip(&graph, &set, 2);
        assert!(graph.structurally_equal(&set, &decoded, &root));

        let bytes = encode_pickle(&graph, &set, &EncodeOptions::with_protocol(4)).unwrap();
        assert!(contains(&bytes, &[Opcode::EmptySet as u8]));
    }

    #[test]
    fn test_bytes_by_protocol() {
        let graph = Graph::new();
        let value = Value::Bytes(vec![0x00, 0xff, b'a']);

        let bytes = encode_pickle(&graph, &value, &EncodeOptions::new()).unwrap();
        assert!(contains(&bytes, b"c_codecs\nencode\n"));
        assert_eq!(roundtrip(&graph, &value, 2).1, value);

        let bytes = encode_pickle(&graph, &value, &EncodeOptions::with_protocol(3)).unwrap();
        assert_eq!(bytes, b"\x80\x03C\x03\x00\xffa.");
    }

    #[test]
    fn test_big_integer_matches_cpython() {
        let graph = Graph::new();
        let big = Value::Int(BigInt::from(1u8) << 70);
        let bytes = encode_pickle(&graph, &big, &EncodeOptions::new()).unwrap();
        assert_eq!(bytes, b"\x80\x02\x8a\x09\x00\x00\x00\x00\x00\x00\x00\x00\x40.");
        let small = encode_pickle(&graph, &Value::int(-1), &EncodeOptions::new()).unwrap();
        assert_eq!(small, b"\x80\x02J\xff\xff\xff\xff.");
    }

    #[test]
    fn test_revertable_containers() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let items = graph.add(Node::Sequence(vec![Value::int(1), Value::int(2), Value::int(3)]));
        let list = graph.instance(
            registry.resolve("renpy.revertable", "RevertableList"),
            State::List(items),
        );
        let members = graph.add(Node::Set([Value::str("a")].into_iter().collect()));
        let set = graph.instance(
            registry.resolve("renpy.revertable", "RevertableSet"),
            State::Set(members),
        );
        let root = Value::Tuple(vec![list, set]);

        for protocol in [2, 4] {
            let (decoded, decoded_root) = roundtrip(&graph, &root, protocol);
            assert!(graph.structurally_equal(&root, &decoded, &decoded_root), "protocol {protocol}");
        }

        let bytes = encode_pickle(&graph, &root, &EncodeOptions::new()).unwrap();
        // The list's items are appended onto the instance itself.
        assert!(contains(&bytes, b"RevertableList\nq\x00)\x81q\x01(K\x01K\x02K\x03e"));
    }

    #[test]
    fn test_empty_revertable_containers_keep_contents() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let mut root = Vec::new();
        for (name, node) in [
            ("RevertableList", Node::Sequence(Vec::new())),
            ("RevertableDict", Node::Mapping(Default::default())),
            ("RevertableSet", Node::Set(Default::default())),
        ] {
            let content = graph.add(node);
            let state = match name {
                "RevertableList" => State::List(content),
                "RevertableDict" => State::Dict(content),
                _ => State::Set(content),
            };
            root.push(graph.instance(registry.resolve("renpy.revertable", name), state));
        }
        let root = Value::Tuple(root);

        for protocol in [2, 4] {
            let (decoded, decoded_root) = roundtrip(&graph, &root, protocol);
            assert!(graph.structurally_equal(&root, &decoded, &decoded_root), "protocol {protocol}");
            let Value::Tuple(items) = &decoded_root else { panic!("expected tuple") };
            for item in items {
                let Some(Node::Instance(inst)) = decoded.get(item.as_ref_id().unwrap()) else {
                    panic!("expected instance");
                };
                assert_ne!(inst.state, State::None, "protocol {protocol}");
            }
        }

        let bytes = encode_pickle(&graph, &root, &EncodeOptions::new()).unwrap();
        assert!(contains(&bytes, b"RevertableList\nq\x00)\x81q\x01(e"));
        assert!(contains(&bytes, b"RevertableDict\nq\x02)\x81q\x03(u"));
    }

    #[test]
    fn test_constructor_arguments() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let attrs = graph.mapping(vec![("a".into(), Value::int(2))]);
        let point = graph.instance_with(
            registry.resolve("store", "Point"),
            Constructor::Call(vec![Value::int(1)]),
            State::Dict(attrs.as_ref_id().unwrap()),
        );
        let tag = graph.instance_with(
            registry.resolve("store", "Tag"),
            Constructor::New(vec![Value::str("x")]),
            State::None,
        );
        let root = Value::Tuple(vec![point, tag]);

        let bytes = encode_pickle(&graph, &root, &EncodeOptions::new()).unwrap();
        // cls((1,)) REDUCE, then the attributes through BUILD.
        assert!(contains(&bytes, b"Point\nq\x00K\x01\x85Rq\x01}"));
        assert!(contains(&bytes, b"X\x01\x00\x00\x00x\x85\x81"));

        for protocol in [2, 4] {
            let (decoded, decoded_root) = roundtrip(&graph, &root, protocol);
            assert!(graph.structurally_equal(&root, &decoded, &decoded_root), "protocol {protocol}");
        }
    }

    #[test]
    fn test_constructor_argument_cycle() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let list = graph.sequence(vec![]);
        let node = graph.instance_with(
            registry.resolve("store", "Node"),
            Constructor::Call(vec![list.clone()]),
            State::None,
        );
        if let Node::Sequence(items) = &mut graph[list.as_ref_id().unwrap()] {
            items.push(node.clone());
        }
        assert_eq!(
            encode_pickle(&graph, &node, &EncodeOptions::new()),
            Err(EncodeError::UnsupportedCycle {
                node: node.as_ref_id().unwrap().index()
            })
        );
    }

    #[test]
    fn test_set_reached_through_itself() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let hero = graph.instance(registry.resolve("store", "Hero"), State::None);
        let set = graph.set(vec![hero.clone()]);
        let attrs = graph.mapping(vec![("party".into(), set.clone())]);
        if let Node::Instance(inst) = &mut graph[hero.as_ref_id().unwrap()] {
            inst.state = State::Dict(attrs.as_ref_id().unwrap());
        }

        let err = encode_pickle(&graph, &set, &EncodeOptions::new()).unwrap_err();
        assert_eq!(
            err,
            EncodeError::UnsupportedCycle {
                node: set.as_ref_id().unwrap().index()
            }
        );

        // EMPTY_SET is memoized before its members.
        let (decoded, root) = roundtrip(&graph, &set, 4);
        assert!(graph.structurally_equal(&set, &decoded, &root));
    }

    #[test]
    fn test_errors() {
        let graph = Graph::new();
        assert_eq!(
            encode_pickle(&graph, &Value::None, &EncodeOptions::with_protocol(1)),
            Err(EncodeError::UnsupportedProtocol { protocol: 1 })
        );
        assert_eq!(
            encode_pickle(&graph, &Value::Ref(NodeId(4)), &EncodeOptions::new()),
            Err(EncodeError::DanglingNode { node: 4 })
        );

        let mut deep = Value::None;
        for _ in 0..=MAX_NESTING {
            deep = Value::Tuple(vec![deep]);
        }
        assert_eq!(
            encode_pickle(&graph, &deep, &EncodeOptions::new()),
            Err(EncodeError::NestingTooDeep { max: MAX_NESTING })
        );
    }

    #[test]
    fn test_globals_are_memoized() {
        let registry = TypeRegistry::new();
        let mut graph = Graph::new();
        let ty = registry.resolve("store", "Coin");
        let a = graph.instance(ty.clone(), State::None);
        let b = graph.instance(ty.clone(), State::None);
        let root = Value::Tuple(vec![a, b, Value::Global(ty)]);
        let bytes = encode_pickle(&graph, &root, &EncodeOptions::new()).unwrap();
        assert_eq!(bytes.windows(5).filter(|w| w == b"Coin\n").count(), 1);
        let (decoded, decoded_root) = roundtrip(&graph, &root, 2);
        assert!(graph.structurally_equal(&root, &decoded, &decoded_root));
    }
}
