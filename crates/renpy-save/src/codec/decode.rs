//! Pickle stream → object graph.
//!
//! A stack machine with the same structure as CPython's unpickler: an
//! operand stack, a stack of saved stacks for `MARK`, and a memo. Every
//! identity-bearing value is allocated in the [`Graph`] arena when its
//! opcode executes, so memo entries and stack slots only ever hold
//! [`Value::Ref`]s to it and sharing falls out for free.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::codec::opcode::{read_instruction, Arg, Opcode};
use crate::codec::primitives::Reader;
use crate::error::{DecodeError, DecodeErrorKind};
use crate::limits::{MAX_MEMO_ENTRIES, MAX_PROTOCOL, MAX_STACK_DEPTH};
use crate::model::{Constructor, Graph, Node, NodeId, State, Value};
use crate::registry::{TypeHandle, TypeKind, TypeRegistry};

/// Resource limits for decoding untrusted streams.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Maximum number of memo entries.
    pub max_memo: usize,
    /// Maximum number of values on the stack, counting values hidden
    /// under marks.
    pub max_stack: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_memo: MAX_MEMO_ENTRIES,
            max_stack: MAX_STACK_DEPTH,
        }
    }
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_memo(mut self, max_memo: usize) -> Self {
        self.max_memo = max_memo;
        self
    }

    pub fn with_max_stack(mut self, max_stack: usize) -> Self {
        self.max_stack = max_stack;
        self
    }
}

/// A decoded stream.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub graph: Graph,
    pub root: Value,
    /// Protocol declared by the stream's `PROTO` opcode (0 if absent).
    pub protocol: u8,
}

/// Decodes a pickle stream, resolving types through the process-wide
/// registry with default limits.
pub fn decode_pickle_global(input: &[u8]) -> Result<Decoded, DecodeError> {
    decode_pickle(input, TypeRegistry::global(), &DecodeOptions::default())
}

/// Decodes a pickle stream into a graph.
///
/// Trailing bytes after `STOP` are ignored, as CPython does. On any error
/// nothing is returned; the registry may still have learned new
/// identifiers, which is harmless.
pub fn decode_pickle(
    input: &[u8],
    registry: &TypeRegistry,
    options: &DecodeOptions,
) -> Result<Decoded, DecodeError> {
    let mut machine = Machine {
        registry,
        options,
        graph: Graph::new(),
        stack: Vec::new(),
        marks: Vec::new(),
        marked: 0,
        memo: FxHashMap::default(),
        protocol: 0,
        offset: 0,
    };
    let mut reader = Reader::new(input);

    while !reader.is_empty() {
        let instruction = read_instruction(&mut reader)?;
        machine.offset = instruction.offset;
        if instruction.opcode == Opcode::Stop {
            let root = machine.stop()?;
            debug!(
                protocol = machine.protocol,
                nodes = machine.graph.len(),
                memo = machine.memo.len(),
                bytes = reader.position(),
                "decoded pickle stream"
            );
            return Ok(Decoded {
                graph: machine.graph,
                root,
                protocol: machine.protocol,
            });
        }
        machine.execute(instruction.opcode, instruction.arg)?;
    }
    Err(DecodeError::new(input.len(), DecodeErrorKind::MissingStop))
}

fn is_builtins(module: &str) -> bool {
    module == "__builtin__" || module == "builtins"
}

fn is_copyreg(module: &str) -> bool {
    module == "copy_reg" || module == "copyreg"
}

struct Machine<'r> {
    registry: &'r TypeRegistry,
    options: &'r DecodeOptions,
    graph: Graph,
    stack: Vec<Value>,
    marks: Vec<Vec<Value>>,
    /// Number of values saved under marks.
    marked: usize,
    memo: FxHashMap<u64, Value>,
    protocol: u8,
    /// Offset of the instruction being executed.
    offset: usize,
}

impl Machine<'_> {
    fn error(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError::new(self.offset, kind)
    }

    fn mismatch(&self, opcode: Opcode, expected: &'static str, found: &Value) -> DecodeError {
        self.error(DecodeErrorKind::TypeMismatch {
            opcode: opcode.name(),
            expected,
            found: self.graph.shape_name(found),
        })
    }

    // =========================================================================
    // Stack
    // =========================================================================

    fn push(&mut self, value: Value) -> Result<(), DecodeError> {
        let depth = self.stack.len() + self.marked;
        if depth >= self.options.max_stack {
            return Err(self.error(DecodeErrorKind::LengthExceedsLimit {
                field: "stack",
                len: depth + 1,
                max: self.options.max_stack,
            }));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, opcode: Opcode) -> Result<Value, DecodeError> {
        self.stack.pop().ok_or_else(|| {
            self.error(DecodeErrorKind::StackUnderflow {
                opcode: opcode.name(),
            })
        })
    }

    fn top(&self, opcode: Opcode) -> Result<&Value, DecodeError> {
        self.stack.last().ok_or_else(|| {
            self.error(DecodeErrorKind::StackUnderflow {
                opcode: opcode.name(),
            })
        })
    }

    /// Pops everything above the topmost mark, restoring the stack below it.
    fn pop_mark(&mut self, opcode: Opcode) -> Result<Vec<Value>, DecodeError> {
        let saved = self.marks.pop().ok_or_else(|| {
            self.error(DecodeErrorKind::MissingMark {
                opcode: opcode.name(),
            })
        })?;
        self.marked -= saved.len();
        Ok(std::mem::replace(&mut self.stack, saved))
    }

    fn pop_tuple(&mut self, opcode: Opcode) -> Result<Vec<Value>, DecodeError> {
        match self.pop(opcode)? {
            Value::Tuple(items) => Ok(items),
            other => Err(self.mismatch(opcode, "tuple", &other)),
        }
    }

    fn pop_global(&mut self, opcode: Opcode) -> Result<TypeHandle, DecodeError> {
        match self.pop(opcode)? {
            Value::Global(ty) => Ok(ty),
            other => Err(self.mismatch(opcode, "class", &other)),
        }
    }

    fn pop_str(&mut self, opcode: Opcode) -> Result<String, DecodeError> {
        match self.pop(opcode)? {
            Value::Str(s) => Ok(s),
            other => Err(self.mismatch(opcode, "str", &other)),
        }
    }

    fn stop(&mut self) -> Result<Value, DecodeError> {
        if self.stack.len() != 1 || !self.marks.is_empty() {
            return Err(self.error(DecodeErrorKind::UnbalancedStop {
                depth: self.stack.len(),
                marks: self.marks.len(),
            }));
        }
        self.pop(Opcode::Stop)
    }

    // =========================================================================
    // Memo
    // =========================================================================

    fn memo_put(&mut self, key: u64, opcode: Opcode) -> Result<(), DecodeError> {
        let value = self.top(opcode)?.clone();
        if self.memo.len() >= self.options.max_memo && !self.memo.contains_key(&key) {
            return Err(self.error(DecodeErrorKind::LengthExceedsLimit {
                field: "memo",
                len: self.memo.len() + 1,
                max: self.options.max_memo,
            }));
        }
        self.memo.insert(key, value);
        Ok(())
    }

    fn memo_get(&mut self, key: u64) -> Result<(), DecodeError> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or_else(|| self.error(DecodeErrorKind::MemoMiss { key }))?;
        self.push(value)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn execute(&mut self, opcode: Opcode, arg: Arg<'_>) -> Result<(), DecodeError> {
        use Opcode as Op;

        match opcode {
            Op::Proto => {
                let protocol = match arg {
                    Arg::Uint(v) => v as u8,
                    _ => 0,
                };
                if protocol > MAX_PROTOCOL {
                    return Err(self.error(DecodeErrorKind::UnsupportedProtocol { protocol }));
                }
                self.protocol = protocol;
            }
            Op::Frame => {}
            Op::Stop => unreachable!("STOP is handled by the caller"),
            Op::Mark => {
                self.marked += self.stack.len();
                let saved = std::mem::take(&mut self.stack);
                self.marks.push(saved);
            }
            Op::Pop => {
                if self.stack.pop().is_none() {
                    self.pop_mark(opcode)?;
                }
            }
            Op::PopMark => {
                self.pop_mark(opcode)?;
            }
            Op::Dup => {
                let top = self.top(opcode)?.clone();
                self.push(top)?;
            }

            // Literals
            Op::None => self.push(Value::None)?,
            Op::NewTrue => self.push(Value::Bool(true))?,
            Op::NewFalse => self.push(Value::Bool(false))?,
            Op::Int
            | Op::BinInt
            | Op::BinInt1
            | Op::BinInt2
            | Op::Long
            | Op::Long1
            | Op::Long4
            | Op::Float
            | Op::BinFloat
            | Op::String
            | Op::BinString
            | Op::ShortBinString
            | Op::Unicode
            | Op::BinUnicode
            | Op::ShortBinUnicode
            | Op::BinUnicode8 => {
                let value = literal(arg);
                self.push(value)?;
            }
            Op::BinBytes | Op::ShortBinBytes | Op::BinBytes8 | Op::ByteArray8 => {
                let value = match arg {
                    Arg::Bytes(b) => Value::Bytes(b.into_owned()),
                    _ => Value::Bytes(Vec::new()),
                };
                self.push(value)?;
            }

            // Containers
            Op::EmptyList => {
                let list = self.graph.sequence(Vec::new());
                self.push(list)?;
            }
            Op::List => {
                let items = self.pop_mark(opcode)?;
                let list = self.graph.sequence(items);
                self.push(list)?;
            }
            Op::EmptyDict => {
                let dict = self.graph.mapping(Vec::new());
                self.push(dict)?;
            }
            Op::Dict => {
                let items = self.pop_mark(opcode)?;
                let pairs = self.pairs(opcode, items)?;
                let dict = self.graph.mapping(pairs);
                self.push(dict)?;
            }
            Op::EmptySet => {
                let set = self.graph.set(Vec::new());
                self.push(set)?;
            }
            Op::FrozenSet => {
                let items = self.pop_mark(opcode)?;
                let set = self.graph.set(items);
                self.push(set)?;
            }
            Op::EmptyTuple => self.push(Value::Tuple(Vec::new()))?,
            Op::Tuple => {
                let items = self.pop_mark(opcode)?;
                self.push(Value::Tuple(items))?;
            }
            Op::Tuple1 | Op::Tuple2 | Op::Tuple3 => {
                let n = match opcode {
                    Op::Tuple1 => 1,
                    Op::Tuple2 => 2,
                    _ => 3,
                };
                if self.stack.len() < n {
                    return Err(self.error(DecodeErrorKind::StackUnderflow {
                        opcode: opcode.name(),
                    }));
                }
                let items = self.stack.split_off(self.stack.len() - n);
                self.push(Value::Tuple(items))?;
            }
            Op::Append => {
                let item = self.pop(opcode)?;
                self.append(opcode, vec![item])?;
            }
            Op::Appends => {
                let items = self.pop_mark(opcode)?;
                self.append(opcode, items)?;
            }
            Op::SetItem => {
                let value = self.pop(opcode)?;
                let key = self.pop(opcode)?;
                self.set_items(opcode, vec![(key, value)])?;
            }
            Op::SetItems => {
                let items = self.pop_mark(opcode)?;
                let pairs = self.pairs(opcode, items)?;
                self.set_items(opcode, pairs)?;
            }
            Op::AddItems => {
                let items = self.pop_mark(opcode)?;
                self.add_items(opcode, items)?;
            }

            // Memo
            Op::Put | Op::BinPut | Op::LongBinPut => {
                let key = match arg {
                    Arg::Uint(key) => key,
                    _ => 0,
                };
                self.memo_put(key, opcode)?;
            }
            Op::Memoize => {
                let key = self.memo.len() as u64;
                self.memo_put(key, opcode)?;
            }
            Op::Get | Op::BinGet | Op::LongBinGet => {
                let key = match arg {
                    Arg::Uint(key) => key,
                    _ => 0,
                };
                self.memo_get(key)?;
            }

            // Types and instances
            Op::Global => {
                if let Arg::Global { module, name } = arg {
                    let ty = self.registry.resolve(module, name);
                    self.push(Value::Global(ty))?;
                }
            }
            Op::StackGlobal => {
                let name = self.pop_str(opcode)?;
                let module = self.pop_str(opcode)?;
                let ty = self.registry.resolve(&module, &name);
                self.push(Value::Global(ty))?;
            }
            Op::NewObj => {
                let args = self.pop_tuple(opcode)?;
                let cls = self.pop_global(opcode)?;
                let instance = self.construct(cls, Constructor::New(args))?;
                self.push(instance)?;
            }
            Op::NewObjEx => {
                let kwargs = self.pop(opcode)?;
                let args = self.pop_tuple(opcode)?;
                let cls = self.pop_global(opcode)?;
                if !self.is_empty_mapping(&kwargs) {
                    return Err(self.error(DecodeErrorKind::BadReduce {
                        callable: cls.to_string(),
                    }));
                }
                let instance = self.construct(cls, Constructor::New(args))?;
                self.push(instance)?;
            }
            Op::Obj => {
                let mut items = self.pop_mark(opcode)?.into_iter();
                let cls = match items.next() {
                    Some(Value::Global(ty)) => ty,
                    Some(other) => return Err(self.mismatch(opcode, "class", &other)),
                    None => {
                        return Err(self.error(DecodeErrorKind::StackUnderflow {
                            opcode: opcode.name(),
                        }));
                    }
                };
                let instance = self.construct(cls, Constructor::Call(items.collect()))?;
                self.push(instance)?;
            }
            Op::Inst => {
                let args = self.pop_mark(opcode)?;
                if let Arg::Global { module, name } = arg {
                    let cls = self.registry.resolve(module, name);
                    let instance = self.construct(cls, Constructor::Call(args))?;
                    self.push(instance)?;
                }
            }
            Op::Reduce => {
                let args = self.pop_tuple(opcode)?;
                let callable = self.pop_global(opcode)?;
                let value = self.reduce(callable, args)?;
                self.push(value)?;
            }
            Op::Build => {
                let state = self.pop(opcode)?;
                let target = self.top(opcode)?.clone();
                self.build(target, state)?;
            }

            Op::PersId
            | Op::BinPersId
            | Op::Ext1
            | Op::Ext2
            | Op::Ext4
            | Op::NextBuffer
            | Op::ReadOnlyBuffer => {
                return Err(self.error(DecodeErrorKind::UnsupportedOpcode {
                    name: opcode.name(),
                }));
            }
        }
        Ok(())
    }

    fn pairs(&self, opcode: Opcode, items: Vec<Value>) -> Result<Vec<(Value, Value)>, DecodeError> {
        if items.len() % 2 != 0 {
            return Err(self.error(DecodeErrorKind::TypeMismatch {
                opcode: opcode.name(),
                expected: "key/value pairs",
                found: "odd number of items",
            }));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        Ok(pairs)
    }

    fn is_empty_mapping(&self, value: &Value) -> bool {
        match value {
            Value::None => true,
            Value::Ref(id) => matches!(self.graph.get(*id), Some(Node::Mapping(m)) if m.is_empty()),
            _ => false,
        }
    }

    // =========================================================================
    // Collection mutation
    // =========================================================================

    /// Resolves the collection node an `APPEND(S)`/`SETITEM(S)`/`ADDITEMS`
    /// targets: the node itself, or the content node of an instance of the
    /// matching kind (created on first use, refining a placeholder type).
    fn content_node(&mut self, opcode: Opcode, kind: TypeKind) -> Result<NodeId, DecodeError> {
        let target = self.top(opcode)?.clone();
        let expected = kind.as_str();
        let Some(id) = target.as_ref_id() else {
            return Err(self.mismatch(opcode, expected, &target));
        };
        let (ty, state) = match &self.graph[id] {
            Node::Sequence(_) if kind == TypeKind::List => return Ok(id),
            Node::Mapping(_) if kind == TypeKind::Dict => return Ok(id),
            Node::Set(_) if kind == TypeKind::Set => return Ok(id),
            Node::Instance(inst) => (inst.ty.clone(), inst.state.clone()),
            _ => return Err(self.mismatch(opcode, expected, &target)),
        };

        self.registry
            .refine(&ty, kind)
            .map_err(|e| self.error(DecodeErrorKind::Registry(e)))?;

        let content = match (kind, state) {
            (TypeKind::List, State::List(content))
            | (TypeKind::Dict, State::Dict(content))
            | (TypeKind::Set, State::Set(content)) => return Ok(content),
            (_, State::None) => match kind {
                TypeKind::List => self.graph.add(Node::Sequence(Vec::new())),
                TypeKind::Dict => self.graph.add(Node::Mapping(Default::default())),
                _ => self.graph.add(Node::Set(Default::default())),
            },
            _ => {
                return Err(self.error(DecodeErrorKind::StateShape {
                    module: ty.module().to_owned(),
                    name: ty.name().to_owned(),
                    kind,
                    found: "populated state",
                }));
            }
        };
        if let Node::Instance(inst) = &mut self.graph[id] {
            inst.state = match kind {
                TypeKind::List => State::List(content),
                TypeKind::Dict => State::Dict(content),
                _ => State::Set(content),
            };
        }
        Ok(content)
    }

    fn append(&mut self, opcode: Opcode, items: Vec<Value>) -> Result<(), DecodeError> {
        let id = self.content_node(opcode, TypeKind::List)?;
        if let Node::Sequence(list) = &mut self.graph[id] {
            list.extend(items);
        }
        Ok(())
    }

    fn set_items(&mut self, opcode: Opcode, pairs: Vec<(Value, Value)>) -> Result<(), DecodeError> {
        let id = self.content_node(opcode, TypeKind::Dict)?;
        if let Node::Mapping(map) = &mut self.graph[id] {
            map.extend(pairs);
        }
        Ok(())
    }

    fn add_items(&mut self, opcode: Opcode, items: Vec<Value>) -> Result<(), DecodeError> {
        let id = self.content_node(opcode, TypeKind::Set)?;
        if let Node::Set(set) = &mut self.graph[id] {
            set.extend(items);
        }
        Ok(())
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// The items of a list, set or tuple argument.
    fn items_of(&self, value: &Value) -> Option<Vec<Value>> {
        match value {
            Value::Tuple(items) => Some(items.clone()),
            Value::Ref(id) => match self.graph.get(*id)? {
                Node::Sequence(items) => Some(items.clone()),
                Node::Set(items) => Some(items.iter().cloned().collect()),
                _ => None,
            },
            _ => None,
        }
    }

    fn bad_reduce(&self, callable: &TypeHandle) -> DecodeError {
        self.error(DecodeErrorKind::BadReduce {
            callable: callable.to_string(),
        })
    }

    /// Creates an instance of a registry type: a generic object remembering
    /// how it was created, or a collection subclass holding a copy of its
    /// single argument.
    fn construct(&mut self, cls: TypeHandle, ctor: Constructor) -> Result<Value, DecodeError> {
        let kind = cls.kind();
        let state = match (kind, ctor.args()) {
            (TypeKind::Generic, _) => return Ok(self.graph.instance_with(cls, ctor, State::None)),
            // Creating an empty container carries nothing worth keeping.
            (_, []) => State::None,
            (TypeKind::List, [arg]) => {
                let items = self.items_of(arg).ok_or_else(|| self.bad_reduce(&cls))?;
                State::List(self.graph.add(Node::Sequence(items)))
            }
            (TypeKind::Set, [arg]) => {
                let items = self.items_of(arg).ok_or_else(|| self.bad_reduce(&cls))?;
                State::Set(self.graph.add(Node::Set(items.into_iter().collect())))
            }
            (TypeKind::Dict, [Value::Ref(src)]) => match self.graph.get(*src) {
                Some(Node::Mapping(map)) => {
                    let map = map.clone();
                    State::Dict(self.graph.add(Node::Mapping(map)))
                }
                _ => return Err(self.bad_reduce(&cls)),
            },
            _ => return Err(self.bad_reduce(&cls)),
        };
        Ok(self.graph.instance(cls, state))
    }

    fn reduce(&mut self, callable: TypeHandle, args: Vec<Value>) -> Result<Value, DecodeError> {
        let (module, name) = (callable.module(), callable.name());

        if is_builtins(module) {
            match (name, args.as_slice()) {
                ("set" | "frozenset", []) => return Ok(self.graph.set(Vec::new())),
                ("set" | "frozenset", [arg]) => {
                    let items = self.items_of(arg).ok_or_else(|| self.bad_reduce(&callable))?;
                    return Ok(self.graph.set(items));
                }
                ("list", []) => return Ok(self.graph.sequence(Vec::new())),
                ("list", [arg]) => {
                    let items = self.items_of(arg).ok_or_else(|| self.bad_reduce(&callable))?;
                    return Ok(self.graph.sequence(items));
                }
                ("tuple", []) => return Ok(Value::Tuple(Vec::new())),
                ("tuple", [arg]) => {
                    let items = self.items_of(arg).ok_or_else(|| self.bad_reduce(&callable))?;
                    return Ok(Value::Tuple(items));
                }
                ("dict", []) => return Ok(self.graph.mapping(Vec::new())),
                ("dict", [Value::Ref(src)]) => {
                    if let Some(Node::Mapping(map)) = self.graph.get(*src) {
                        let map = map.clone();
                        return Ok(Value::Ref(self.graph.add(Node::Mapping(map))));
                    }
                    return Err(self.bad_reduce(&callable));
                }
                ("bytes" | "bytearray", []) => return Ok(Value::Bytes(Vec::new())),
                ("bytes" | "bytearray", [Value::Bytes(b)]) => return Ok(Value::Bytes(b.clone())),
                ("bytes" | "bytearray", [Value::Str(text), Value::Str(encoding)]) => {
                    return encode_text(text, encoding)
                        .map(Value::Bytes)
                        .ok_or_else(|| self.bad_reduce(&callable));
                }
                ("set" | "frozenset" | "list" | "tuple" | "dict" | "bytes" | "bytearray", _) => {
                    return Err(self.bad_reduce(&callable));
                }
                _ => {}
            }
        }

        if module == "_codecs" && name == "encode" {
            return match args.as_slice() {
                [Value::Str(text)] => Ok(Value::Bytes(text.as_bytes().to_vec())),
                [Value::Str(text), Value::Str(encoding)] => encode_text(text, encoding)
                    .map(Value::Bytes)
                    .ok_or_else(|| self.bad_reduce(&callable)),
                _ => Err(self.bad_reduce(&callable)),
            };
        }

        if is_copyreg(module) && name == "_reconstructor" {
            // _reconstructor(cls, base, state): base.__new__(cls, state)
            let mut args = args.into_iter();
            let (Some(Value::Global(cls)), Some(_base), Some(state)) =
                (args.next(), args.next(), args.next())
            else {
                return Err(self.bad_reduce(&callable));
            };
            let ctor_args = match state {
                Value::None => Vec::new(),
                state => vec![state],
            };
            return self.construct(cls, Constructor::New(ctor_args));
        }

        self.construct(callable, Constructor::Call(args))
    }

    /// Applies `BUILD`'s state to the instance on top of the stack.
    fn build(&mut self, target: Value, value: Value) -> Result<(), DecodeError> {
        let Some(id) = target.as_ref_id() else {
            return Err(self.mismatch(Opcode::Build, "instance", &target));
        };
        let (ty, current) = match &self.graph[id] {
            Node::Instance(inst) => (inst.ty.clone(), inst.state.clone()),
            _ => return Err(self.mismatch(Opcode::Build, "instance", &target)),
        };
        if matches!(value, Value::None) {
            return Ok(());
        }
        let kind = ty.kind();

        // Set subclasses whose __getstate__ returns ({member: True, ...},)
        if kind == TypeKind::Set {
            if let Some(members) = self.set_members_state(&value) {
                let content = match current {
                    State::Set(content) => content,
                    State::None => {
                        let content = self.graph.add(Node::Set(Default::default()));
                        self.set_state(id, State::Set(content));
                        content
                    }
                    _ => return Err(self.state_shape(&ty, "populated state")),
                };
                if let Node::Set(set) = &mut self.graph[content] {
                    set.extend(members);
                }
                return Ok(());
            }
        }

        // A second BUILD would replace state that is already there.
        if current != State::None {
            return Err(self.state_shape(&ty, "populated state"));
        }
        let state = State::shape(&self.graph, kind, value).map_err(|found| self.state_shape(&ty, found))?;
        self.set_state(id, state);
        Ok(())
    }

    fn set_members_state(&self, value: &Value) -> Option<Vec<Value>> {
        let Value::Tuple(items) = value else {
            return None;
        };
        let [Value::Ref(id)] = items.as_slice() else {
            return None;
        };
        match self.graph.get(*id)? {
            Node::Mapping(map) => Some(map.keys().cloned().collect()),
            _ => None,
        }
    }

    fn set_state(&mut self, id: NodeId, state: State) {
        if let Node::Instance(inst) = &mut self.graph[id] {
            inst.state = state;
        }
    }

    fn state_shape(&self, ty: &TypeHandle, found: &'static str) -> DecodeError {
        self.error(DecodeErrorKind::StateShape {
            module: ty.module().to_owned(),
            name: ty.name().to_owned(),
            kind: ty.kind(),
            found,
        })
    }
}

fn literal(arg: Arg<'_>) -> Value {
    match arg {
        Arg::Int(v) => Value::int(v),
        Arg::Long(v) => Value::Int(v),
        Arg::Bool(v) => Value::Bool(v),
        Arg::Float(v) => Value::Float(v),
        Arg::Text(s) => Value::Str(s.into_owned()),
        // Python 2 `str` is bytes; text is the common case in saves.
        Arg::Bytes(b) => match String::from_utf8(b.into_owned()) {
            Ok(s) => Value::Str(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        Arg::None | Arg::Uint(_) | Arg::Global { .. } => Value::None,
    }
}

/// `str.encode(encoding)` for the codecs CPython uses when pickling bytes.
fn encode_text(text: &str, encoding: &str) -> Option<Vec<u8>> {
    match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
        "latin1" | "latin-1" | "iso-8859-1" | "l1" => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect(),
        "utf-8" | "utf8" => Some(text.as_bytes().to_vec()),
        "ascii" => text.is_ascii().then(|| text.as_bytes().to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &[u8]) -> Decoded {
        decode_pickle(data, &TypeRegistry::new(), &DecodeOptions::default()).unwrap()
    }

    fn decode_err(data: &[u8]) -> DecodeError {
        decode_pickle(data, &TypeRegistry::new(), &DecodeOptions::default()).unwrap_err()
    }

    fn node(decoded: &Decoded, value: &Value) -> Node {
        decoded.graph[value.as_ref_id().unwrap()].clone()
    }

    #[test]
    fn test_dict_with_list_protocol_2() {
        // pickle.dumps({'a': [1, 2, 3]}, 2)
        let data = b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01]q\x02(K\x01K\x02K\x03es.";
        let decoded = decode(data);
        assert_eq!(decoded.protocol, 2);
        let Node::Mapping(map) = node(&decoded, &decoded.root) else {
            panic!("expected dict");
        };
        let list = &map[&Value::from("a")];
        let Node::Sequence(items) = node(&decoded, list) else {
            panic!("expected list");
        };
        assert_eq!(items, vec![Value::int(1), Value::int(2), Value::int(3)]);
    }

    #[test]
    fn test_shared_reference_via_memo() {
        // x = []; pickle.dumps([x, x], 2)
        let data = b"\x80\x02]q\x00(]q\x01h\x01e.";
        let decoded = decode(data);
        let Node::Sequence(items) = node(&decoded, &decoded.root) else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], items[1]);
        assert!(items[0].as_ref_id().is_some());
    }

    #[test]
    fn test_self_referencing_list() {
        // x = []; x.append(x); pickle.dumps(x, 2)
        let data = b"\x80\x02]q\x00h\x00a.";
        let decoded = decode(data);
        let Node::Sequence(items) = node(&decoded, &decoded.root) else {
            panic!("expected list");
        };
        assert_eq!(items, vec![decoded.root.clone()]);
    }

    #[test]
    fn test_newobj_build_instance() {
        // copyreg-style object with __dict__ {'hp': 5}
        let data = b"\x80\x02cstore\nHero\nq\x00)\x81q\x01}q\x02X\x02\x00\x00\x00hpq\x03K\x05sb.";
        let decoded = decode(data);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        assert!(inst.ty.is("store", "Hero"));
        let State::Dict(attrs) = inst.state else {
            panic!("expected dict state, got {:?}", inst.state);
        };
        let Node::Mapping(map) = &decoded.graph[attrs] else {
            panic!("expected mapping");
        };
        assert_eq!(map[&Value::from("hp")], Value::int(5));
    }

    #[test]
    fn test_revertable_list_appends() {
        let data = b"\x80\x02crenpy.revertable\nRevertableList\nq\x00)\x81q\x01(K\x01K\x02K\x03e.";
        let decoded = decode(data);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        let State::List(content) = inst.state else {
            panic!("expected list state");
        };
        let Node::Sequence(items) = &decoded.graph[content] else {
            panic!("expected sequence");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_placeholder_refined_by_setitems() {
        let registry = TypeRegistry::new();
        let data = b"\x80\x02cstore\nLedger\n)\x81(X\x01\x00\x00\x00kK\x01u.";
        let decoded = decode_pickle(data, &registry, &DecodeOptions::default()).unwrap();
        assert_eq!(registry.resolve("store", "Ledger").kind(), TypeKind::Dict);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        assert!(matches!(inst.state, State::Dict(_)));
    }

    #[test]
    fn test_registry_inconsistency() {
        // RevertableObject is a seeded generic type; APPENDS on it is inconsistent.
        let data = b"\x80\x02crenpy.revertable\nRevertableObject\n)\x81(K\x01e.";
        let err = decode_err(data);
        assert!(matches!(err.kind, DecodeErrorKind::Registry(_)));
        assert_eq!(err.offset, 42);
    }

    #[test]
    fn test_set_reduce_protocol_2() {
        // pickle.dumps({1, 2}, 2)
        let data = b"\x80\x02c__builtin__\nset\nq\x00]q\x01(K\x01K\x02e\x85q\x02Rq\x03.";
        let decoded = decode(data);
        let Node::Set(set) = node(&decoded, &decoded.root) else {
            panic!("expected set");
        };
        assert_eq!(set.len(), 2);
        assert!(set.contains(&Value::int(2)));
    }

    #[test]
    fn test_revertable_set_with_getstate() {
        // RevertableSet({1}) pickled by Python 3 at protocol 2: REDUCE with
        // the members, then BUILD with ({member: True},)
        let data = b"\x80\x02crenpy.revertable\nRevertableSet\n]K\x01a\x85R}K\x02\x88s\x85b.";
        let decoded = decode(data);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        let State::Set(content) = inst.state else {
            panic!("expected set state");
        };
        let Node::Set(set) = &decoded.graph[content] else {
            panic!("expected set node");
        };
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_codecs_encode_bytes() {
        // pickle.dumps(b'\xff', 2)
        let data = b"\x80\x02c_codecs\nencode\nq\x00X\x02\x00\x00\x00\xc3\xbfq\x01X\x06\x00\x00\x00latin1q\x02\x86q\x03Rq\x04.";
        let decoded = decode(data);
        assert_eq!(decoded.root, Value::Bytes(vec![0xff]));
    }

    #[test]
    fn test_copyreg_reconstructor() {
        // protocol 0 object: _reconstructor(Hero, object, None) then BUILD
        let data = b"ccopy_reg\n_reconstructor\np0\n(cstore\nHero\np1\nc__builtin__\nobject\np2\nNtp3\nRp4\n(dp5\nVhp\np6\nI5\nsb.";
        let decoded = decode(data);
        assert_eq!(decoded.protocol, 0);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        assert!(inst.ty.is("store", "Hero"));
        assert!(matches!(inst.state, State::Dict(_)));
    }

    #[test]
    fn test_protocol_4_stream() {
        // pickle.dumps({'s': {1}, 'b': b'x', 't': (1, 'a')}, 4)
        let data = b"\x80\x04\x95\x23\x00\x00\x00\x00\x00\x00\x00}\x94(\x8c\x01s\x94\x8f\x94(K\x01\x90\x8c\x01b\x94C\x01x\x94\x8c\x01t\x94K\x01\x8c\x01a\x94\x86\x94u.";
        let decoded = decode(data);
        assert_eq!(decoded.protocol, 4);
        let Node::Mapping(map) = node(&decoded, &decoded.root) else {
            panic!("expected dict");
        };
        assert!(matches!(node(&decoded, &map[&Value::from("s")]), Node::Set(_)));
        assert_eq!(map[&Value::from("b")], Value::Bytes(b"x".to_vec()));
        assert_eq!(
            map[&Value::from("t")],
            Value::Tuple(vec![Value::int(1), Value::from("a")])
        );
    }

    #[test]
    fn test_stack_global() {
        let data = b"\x80\x04\x8c\x05store\x8c\x04Hero\x93)\x81.";
        let decoded = decode(data);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        assert!(inst.ty.is("store", "Hero"));
        assert_eq!(inst.state, State::None);
    }

    #[test]
    fn test_global_as_data() {
        let data = b"\x80\x02cstore\nHero\n\x85.";
        let decoded = decode(data);
        let Value::Tuple(items) = &decoded.root else {
            panic!("expected tuple");
        };
        assert!(matches!(&items[0], Value::Global(ty) if ty.is("store", "Hero")));
    }

    #[test]
    fn test_generic_reduce_keeps_args() {
        let data = b"\x80\x02cstore\nPoint\nK\x01K\x02\x86R.";
        let decoded = decode(data);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        assert_eq!(inst.ctor, Constructor::Call(vec![Value::int(1), Value::int(2)]));
        assert_eq!(inst.state, State::None);
    }

    #[test]
    fn test_reduce_then_build_keeps_both() {
        // Point.__reduce__ returning (Point, (1,), {'a': 2})
        let data = b"\x80\x02cstore\nPoint\nK\x01\x85R}X\x01\x00\x00\x00aK\x02sb.";
        let decoded = decode(data);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        assert_eq!(inst.ctor, Constructor::Call(vec![Value::int(1)]));
        let State::Dict(attrs) = inst.state else {
            panic!("expected dict state, got {:?}", inst.state);
        };
        let Node::Mapping(map) = &decoded.graph[attrs] else {
            panic!("expected mapping");
        };
        assert_eq!(map[&Value::from("a")], Value::int(2));
    }

    #[test]
    fn test_newobj_args_and_second_build() {
        // copyreg.__newobj__ with __getnewargs__ returning ('x',)
        let data = b"\x80\x02cstore\nTag\nX\x01\x00\x00\x00x\x85\x81.";
        let decoded = decode(data);
        let Node::Instance(inst) = node(&decoded, &decoded.root) else {
            panic!("expected instance");
        };
        assert_eq!(inst.ctor, Constructor::New(vec![Value::from("x")]));

        let data = b"\x80\x02cstore\nTag\n)\x81K\x01bK\x02b.";
        let err = decode_err(data);
        assert!(matches!(err.kind, DecodeErrorKind::StateShape { found: "populated state", .. }));
        assert_eq!(err.offset, 20);
    }

    #[test]
    fn test_big_integers() {
        // 2**70 and -(2**70) as LONG1
        let data = b"\x80\x02\x8a\x09\x00\x00\x00\x00\x00\x00\x00\x00\x40\x8a\x09\x00\x00\x00\x00\x00\x00\x00\x00\xc0\x86.";
        let decoded = decode(data);
        let big = num_bigint::BigInt::from(1u8) << 70u32;
        assert_eq!(
            decoded.root,
            Value::Tuple(vec![Value::Int(big.clone()), Value::Int(-big)])
        );
    }

    #[test]
    fn test_protocol_0_strings() {
        let data = b"(lp0\nS'abc'\np1\naS'\\xff'\np2\na.";
        let decoded = decode(data);
        let Node::Sequence(items) = node(&decoded, &decoded.root) else {
            panic!("expected list");
        };
        assert_eq!(items, vec![Value::from("abc"), Value::Bytes(vec![0xff])]);
    }

    #[test]
    fn test_errors() {
        let err = decode_err(b"\x80\x02a.");
        assert_eq!(err.offset, 2);
        assert_eq!(err.kind, DecodeErrorKind::StackUnderflow { opcode: "APPEND" });

        let err = decode_err(b"\x80\x02h\x07.");
        assert_eq!(err.kind, DecodeErrorKind::MemoMiss { key: 7 });

        let err = decode_err(b"\x80\x02N");
        assert_eq!(err.kind, DecodeErrorKind::MissingStop);

        let err = decode_err(b"\x80\x02NN.");
        assert!(matches!(err.kind, DecodeErrorKind::UnbalancedStop { depth: 2, marks: 0 }));

        let err = decode_err(b"\x80\x02e.");
        assert_eq!(err.kind, DecodeErrorKind::MissingMark { opcode: "APPENDS" });

        let err = decode_err(b"\x80\x09N.");
        assert_eq!(err.kind, DecodeErrorKind::UnsupportedProtocol { protocol: 9 });

        let err = decode_err(b"\x80\x02Q.");
        assert_eq!(err.kind, DecodeErrorKind::UnsupportedOpcode { name: "BINPERSID" });

        let err = decode_err(b"\x80\x02K\x01K\x02a.");
        assert!(matches!(err.kind, DecodeErrorKind::TypeMismatch { opcode: "APPEND", .. }));
    }

    #[test]
    fn test_state_shape_mismatch() {
        // A dict-kind type given a list as BUILD state.
        let data = b"\x80\x02crenpy.revertable\nRevertableDict\n)\x81]b.";
        let err = decode_err(data);
        assert!(matches!(err.kind, DecodeErrorKind::StateShape { kind: TypeKind::Dict, .. }));
    }

    #[test]
    fn test_stack_limit() {
        let options = DecodeOptions::new().with_max_stack(3);
        let err = decode_pickle(b"\x80\x02(NNNN", &TypeRegistry::new(), &options).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::LengthExceedsLimit { field: "stack", .. }));
        assert_eq!(err.offset, 6);
    }
}
