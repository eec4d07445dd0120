//! Type registry for `(module, name)` identifiers found in save files.
//!
//! A fixed seed table declares the Ren'Py types whose semantic kind is known
//! (list-like, dict-like, set-like or plain objects). Every other identifier
//! is synthesized on first use as a [`TypeKind::Generic`] placeholder and
//! cached, so the same identifier always yields the same [`TypeHandle`] for
//! the lifetime of the registry.
//!
//! The process-wide registry is [`TypeRegistry::global`]. Both decode paths
//! use it by default, which keeps a binary → text → binary conversion within
//! one process idempotent: a placeholder refined to `List` while reading the
//! pickle stream is still `List` when the edited document is read back.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::RegistryInconsistency;

/// Semantic kind of a type, as far as the converter cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeKind {
    /// Plain object restored through `__setstate__`/`__dict__`.
    Generic = 0,
    /// `list` subclass: contents arrive through `APPEND(S)`.
    List = 1,
    /// `dict` subclass: contents arrive through `SETITEM(S)`.
    Dict = 2,
    /// `set` subclass: contents arrive through `ADDITEMS` or a reduce call.
    Set = 3,
}

impl TypeKind {
    fn from_u8(v: u8) -> TypeKind {
        match v {
            1 => TypeKind::List,
            2 => TypeKind::Dict,
            3 => TypeKind::Set,
            _ => TypeKind::Generic,
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn from_name(name: &str) -> Option<TypeKind> {
        Some(match name {
            "generic" => TypeKind::Generic,
            "list" => TypeKind::List,
            "dict" => TypeKind::Dict,
            "set" => TypeKind::Set,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Generic => "generic",
            TypeKind::List => "list",
            TypeKind::Dict => "dict",
            TypeKind::Set => "set",
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOrigin {
    /// Declared in the seed table; its kind is fixed.
    Seed,
    /// Created on first encounter; its kind may be refined once.
    Synthesized,
}

/// A registry entry.
#[derive(Debug)]
pub struct TypeInfo {
    module: String,
    name: String,
    origin: TypeOrigin,
    kind: AtomicU8,
}

/// Shared handle to a registry entry.
///
/// Handles compare and hash by identity: two handles are equal only if they
/// were returned by the same registry for the same identifier.
#[derive(Clone)]
pub struct TypeHandle(Arc<TypeInfo>);

impl TypeHandle {
    fn new(module: &str, name: &str, origin: TypeOrigin, kind: TypeKind) -> Self {
        Self(Arc::new(TypeInfo {
            module: module.to_owned(),
            name: name.to_owned(),
            origin,
            kind: AtomicU8::new(kind as u8),
        }))
    }

    /// The dotted module path (the `module` key in the text form).
    pub fn module(&self) -> &str {
        &self.0.module
    }

    /// The class name (the `class` key in the text form).
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> TypeKind {
        TypeKind::from_u8(self.0.kind.load(Ordering::Acquire))
    }

    pub fn origin(&self) -> TypeOrigin {
        self.0.origin
    }

    pub fn is_synthesized(&self) -> bool {
        self.0.origin == TypeOrigin::Synthesized
    }

    /// Returns `true` if this handle names `module.name`.
    pub fn is(&self, module: &str, name: &str) -> bool {
        self.0.module == module && self.0.name == name
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeHandle {}

impl Hash for TypeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.module(), self.name(), self.kind())
    }
}

impl fmt::Display for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module(), self.name())
    }
}

// =============================================================================
// SEED TABLE
// =============================================================================

/// Ren'Py types with known semantics. The `renpy.python` entries are the
/// Ren'Py 7 locations of the revertable containers.
const SEED: &[(&str, &str, TypeKind)] = &[
    ("renpy.revertable", "RevertableList", TypeKind::List),
    ("renpy.revertable", "RevertableDict", TypeKind::Dict),
    ("renpy.revertable", "RevertableSet", TypeKind::Set),
    ("renpy.revertable", "RevertableObject", TypeKind::Generic),
    ("renpy.python", "RevertableList", TypeKind::List),
    ("renpy.python", "RevertableDict", TypeKind::Dict),
    ("renpy.python", "RevertableSet", TypeKind::Set),
    ("renpy.python", "RevertableObject", TypeKind::Generic),
    ("renpy.ast", "PyExpr", TypeKind::Generic),
    ("renpy.character", "HistoryEntry", TypeKind::Generic),
    ("store", "VoiceInfo", TypeKind::Generic),
    ("store._console", "TracedExpressionsList", TypeKind::List),
    ("renpy.execution", "Delete", TypeKind::Generic),
    ("renpy.execution", "Context", TypeKind::Generic),
    ("renpy.display.layout", "Null", TypeKind::Generic),
    ("renpy.styledata.styleclass", "Style", TypeKind::Generic),
    ("renpy.rollback", "RollbackLog", TypeKind::Generic),
    ("renpy.rollback", "Rollback", TypeKind::Generic),
    ("renpy.audio.audio", "MusicContext", TypeKind::Generic),
    ("renpy.display.image", "ShownImageInfo", TypeKind::Generic),
];

lazy_static! {
    static ref GLOBAL: TypeRegistry = TypeRegistry::new();
}

// =============================================================================
// REGISTRY
// =============================================================================

type Entries = FxHashMap<String, FxHashMap<String, TypeHandle>>;

/// Maps `(module, name)` identifiers to [`TypeHandle`]s.
///
/// Lookup-or-insert happens under a mutex, so a registry can be shared
/// between threads without handle identity diverging.
#[derive(Debug)]
pub struct TypeRegistry {
    entries: Mutex<Entries>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Creates a registry holding only the seed table.
    pub fn new() -> Self {
        let mut entries = Entries::default();
        for &(module, name, kind) in SEED {
            entries
                .entry(module.to_owned())
                .or_default()
                .insert(name.to_owned(), TypeHandle::new(module, name, TypeOrigin::Seed, kind));
        }
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static TypeRegistry {
        &GLOBAL
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // Entries are only ever inserted whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves an identifier, synthesizing a generic placeholder on first
    /// use. Never fails.
    pub fn resolve(&self, module: &str, name: &str) -> TypeHandle {
        let mut entries = self.lock();
        if let Some(handle) = entries.get(module).and_then(|names| names.get(name)) {
            return handle.clone();
        }
        trace!(module, name, "synthesizing placeholder type");
        let handle = TypeHandle::new(module, name, TypeOrigin::Synthesized, TypeKind::Generic);
        entries
            .entry(module.to_owned())
            .or_default()
            .insert(name.to_owned(), handle.clone());
        handle
    }

    /// Looks up an identifier without synthesizing it.
    pub fn get(&self, module: &str, name: &str) -> Option<TypeHandle> {
        self.lock()
            .get(module)
            .and_then(|names| names.get(name))
            .cloned()
    }

    /// Records that instances of `handle` behave as `kind`.
    ///
    /// A synthesized generic placeholder is promoted; a type that already
    /// has `kind` is left alone. Anything else is an inconsistency.
    pub fn refine(&self, handle: &TypeHandle, kind: TypeKind) -> Result<(), RegistryInconsistency> {
        let current = handle.kind();
        if current == kind {
            return Ok(());
        }
        if handle.is_synthesized() && current == TypeKind::Generic {
            match handle.0.kind.compare_exchange(
                TypeKind::Generic as u8,
                kind as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(module = handle.module(), name = handle.name(), %kind, "refined placeholder kind");
                    return Ok(());
                }
                Err(raced) if TypeKind::from_u8(raced) == kind => return Ok(()),
                Err(raced) => {
                    return Err(inconsistency(handle, TypeKind::from_u8(raced), kind));
                }
            }
        }
        Err(inconsistency(handle, current, kind))
    }

    /// Number of identifiers known to the registry.
    pub fn len(&self) -> usize {
        self.lock().values().map(|names| names.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn inconsistency(handle: &TypeHandle, existing: TypeKind, requested: TypeKind) -> RegistryInconsistency {
    RegistryInconsistency {
        module: handle.module().to_owned(),
        name: handle.name().to_owned(),
        existing,
        requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_kinds() {
        let registry = TypeRegistry::new();
        let list = registry.resolve("renpy.revertable", "RevertableList");
        assert_eq!(list.kind(), TypeKind::List);
        assert_eq!(list.origin(), TypeOrigin::Seed);
        assert_eq!(
            registry.resolve("renpy.python", "RevertableDict").kind(),
            TypeKind::Dict
        );
        assert_eq!(
            registry.resolve("renpy.revertable", "RevertableSet").kind(),
            TypeKind::Set
        );
        assert_eq!(registry.len(), SEED.len());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let registry = TypeRegistry::new();
        let a = registry.resolve("store", "Inventory");
        let b = registry.resolve("store", "Inventory");
        assert_eq!(a, b);
        assert!(a.is_synthesized());
        assert_eq!(a.kind(), TypeKind::Generic);
        assert_eq!(registry.len(), SEED.len() + 1);
    }

    #[test]
    fn test_distinct_identifiers_get_distinct_handles() {
        let registry = TypeRegistry::new();
        let a = registry.resolve("store", "Inventory");
        let b = registry.resolve("store.items", "Inventory");
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_does_not_synthesize() {
        let registry = TypeRegistry::new();
        assert!(registry.get("store", "Nope").is_none());
        assert_eq!(registry.len(), SEED.len());
    }

    #[test]
    fn test_refine_placeholder_once() {
        let registry = TypeRegistry::new();
        let bag = registry.resolve("store", "Bag");
        registry.refine(&bag, TypeKind::List).unwrap();
        assert_eq!(bag.kind(), TypeKind::List);
        // Same kind again is fine, and visible through a fresh lookup.
        registry.refine(&bag, TypeKind::List).unwrap();
        assert_eq!(registry.resolve("store", "Bag").kind(), TypeKind::List);

        let err = registry.refine(&bag, TypeKind::Dict).unwrap_err();
        assert_eq!(err.existing, TypeKind::List);
        assert_eq!(err.requested, TypeKind::Dict);
    }

    #[test]
    fn test_refine_seed_is_fixed() {
        let registry = TypeRegistry::new();
        let obj = registry.resolve("renpy.revertable", "RevertableObject");
        assert!(registry.refine(&obj, TypeKind::List).is_err());
        let list = registry.resolve("renpy.revertable", "RevertableList");
        assert!(registry.refine(&list, TypeKind::List).is_ok());
    }

    #[test]
    fn test_kind_names() {
        for kind in [TypeKind::Generic, TypeKind::List, TypeKind::Dict, TypeKind::Set] {
            assert_eq!(TypeKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(TypeKind::from_name("tuple"), None);
    }

    #[test]
    fn test_global_is_shared() {
        let a = TypeRegistry::global().resolve("store.test_global", "Thing");
        let b = TypeRegistry::global().resolve("store.test_global", "Thing");
        assert_eq!(a, b);
    }
}
