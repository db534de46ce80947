//! Cache keys and their canonical serialization.
//!
//! A [`Key`] is what a consumer hands the engine; a [`CacheKey`] is what the
//! engine actually indexes by. Serialization happens once per evaluation,
//! before any cache access:
//!
//! - primitives serialize by value,
//! - lists serialize element-wise (`@a,b,`),
//! - objects serialize by identity (`~<id>`), where `<id>` is assigned on
//!   first sight by the [`IdentityMap`] owned by the serializer.
//!
//! `Null`, `false`, the empty string, the empty list, and a lazy key that
//! fails or yields nothing are all inactive.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::KeyError;

/// Prune dead identity entries after this many fresh assignments.
const PRUNE_EVERY: u64 = 256;

/// Reference-counted opaque object used inside keys.
///
/// Two `ObjectRef`s hash identically iff they point at the same allocation,
/// whatever the contents.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Any + Send + Sync>);

impl ObjectRef {
    pub fn new<V: Any + Send + Sync>(value: V) -> Self {
        Self(Arc::new(value))
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.0.downcast_ref::<V>()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// One component of a key.
#[derive(Debug, Clone)]
pub enum KeyArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<KeyArg>),
    Object(ObjectRef),
}

impl KeyArg {
    /// Values that make a top-level key inactive.
    fn is_inactive(&self) -> bool {
        match self {
            Self::Null | Self::Bool(false) => true,
            Self::Str(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for KeyArg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for KeyArg {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for KeyArg {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for KeyArg {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for KeyArg {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for KeyArg {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for KeyArg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<ObjectRef> for KeyArg {
    fn from(v: ObjectRef) -> Self {
        Self::Object(v)
    }
}

impl From<Vec<KeyArg>> for KeyArg {
    fn from(v: Vec<KeyArg>) -> Self {
        Self::List(v)
    }
}

/// A key-producing function, evaluated once per evaluation.
pub type LazyKeyFn = Arc<dyn Fn() -> Result<Option<KeyArg>, KeyError> + Send + Sync>;

/// A key as supplied by a consumer.
#[derive(Clone, Default)]
pub enum Key {
    #[default]
    Inactive,
    Static(KeyArg),
    Lazy(LazyKeyFn),
}

impl Key {
    /// Key made of several ordered arguments.
    pub fn list<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<KeyArg>,
    {
        Self::Static(KeyArg::List(args.into_iter().map(Into::into).collect()))
    }

    /// Key computed on each evaluation. `Ok(None)` or `Err(_)` is inactive.
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> Result<Option<KeyArg>, KeyError> + Send + Sync + 'static,
    {
        Self::Lazy(Arc::new(f))
    }

    /// Resolve to a concrete argument, or `None` if inactive.
    fn resolve(&self) -> Option<KeyArg> {
        let arg = match self {
            Self::Inactive => return None,
            Self::Static(arg) => arg.clone(),
            Self::Lazy(f) => match f() {
                Ok(Some(arg)) => arg,
                Ok(None) | Err(_) => return None,
            },
        };
        if arg.is_inactive() {
            None
        } else {
            Some(arg)
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("Inactive"),
            Self::Static(arg) => f.debug_tuple("Static").field(arg).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

macro_rules! key_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Key {
                fn from(arg: $ty) -> Self {
                    Self::Static(KeyArg::from(arg))
                }
            }

            impl From<Option<$ty>> for Key {
                fn from(arg: Option<$ty>) -> Self {
                    match arg {
                        Some(arg) => Self::Static(KeyArg::from(arg)),
                        None => Self::Inactive,
                    }
                }
            }
        )*
    };
}

key_from!(&str, String, i64, i32, u32, f64, bool, ObjectRef, Vec<KeyArg>);

impl From<KeyArg> for Key {
    fn from(arg: KeyArg) -> Self {
        Self::Static(arg)
    }
}

/// The resolved, serialized form of an active key.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    serialized: String,
    args: Vec<KeyArg>,
    original: KeyArg,
}

impl ActiveKey {
    pub fn serialized(&self) -> &str {
        &self.serialized
    }

    /// Arguments passed to the fetcher: list elements, or the single value.
    pub fn args(&self) -> &[KeyArg] {
        &self.args
    }

    pub fn original(&self) -> &KeyArg {
        &self.original
    }
}

impl PartialEq for ActiveKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for ActiveKey {}

impl fmt::Display for ActiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

/// Result of serializing a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Inactive,
    Active(ActiveKey),
}

impl CacheKey {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn serialized(&self) -> Option<&str> {
        match self {
            Self::Active(key) => Some(key.serialized()),
            Self::Inactive => None,
        }
    }

    pub fn as_active(&self) -> Option<&ActiveKey> {
        match self {
            Self::Active(key) => Some(key),
            Self::Inactive => None,
        }
    }
}

/// Per-instance table assigning sequential ids to object references.
///
/// Entries hold a `Weak` to the object, which keeps the allocation (not the
/// value) alive, so an address cannot be reused by another object while its
/// entry exists.
#[derive(Default)]
pub struct IdentityMap {
    ids: HashMap<usize, (Weak<dyn Any + Send + Sync>, u64)>,
    next_id: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `obj`, assigning the next one on first sight.
    pub fn id_of(&mut self, obj: &ObjectRef) -> u64 {
        let addr = obj.addr();
        if let Some((_, id)) = self.ids.get(&addr) {
            return *id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.ids.insert(addr, (Arc::downgrade(&obj.0), id));
        if id % PRUNE_EVERY == 0 {
            self.prune();
        }
        id
    }

    /// Drop entries whose objects are gone.
    pub fn prune(&mut self) {
        self.ids.retain(|_, (weak, _)| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Turns [`Key`]s into [`CacheKey`]s.
///
/// Cloning shares the identity map, so clones agree on object ids.
#[derive(Clone, Default)]
pub struct KeySerializer {
    identities: Arc<Mutex<IdentityMap>>,
}

impl KeySerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key` and compute its cache key.
    ///
    /// A top-level string is used verbatim; every other shape goes through
    /// the stable hash. Both land in the same namespace, so the string `"7"`
    /// and the number `7` name the same entry, as does a string spelling out
    /// a list encoding such as `@"a",`. Strings are only quoted inside lists.
    pub fn serialize(&self, key: &Key) -> CacheKey {
        let Some(original) = key.resolve() else {
            return CacheKey::Inactive;
        };

        let serialized = match &original {
            KeyArg::Str(s) => s.clone(),
            other => self.stable_hash(other),
        };
        let args = match &original {
            KeyArg::List(items) => items.clone(),
            other => vec![other.clone()],
        };

        CacheKey::Active(ActiveKey {
            serialized,
            args,
            original,
        })
    }

    /// Number of distinct objects seen (live or not yet pruned).
    pub fn tracked_objects(&self) -> usize {
        self.identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn stable_hash(&self, arg: &KeyArg) -> String {
        let mut out = String::new();
        self.write_hash(arg, &mut out);
        out
    }

    fn write_hash(&self, arg: &KeyArg, out: &mut String) {
        use std::fmt::Write;

        match arg {
            KeyArg::Null => out.push_str("null"),
            KeyArg::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            KeyArg::Int(n) => {
                let _ = write!(out, "{}", n);
            }
            KeyArg::Float(n) => {
                let _ = write!(out, "{}", n);
            }
            KeyArg::Str(s) => {
                // JSON quoting keeps "1" and 1 apart inside lists.
                let quoted = serde_json::to_string(s).unwrap_or_else(|_| format!("{:?}", s));
                out.push_str(&quoted);
            }
            KeyArg::List(items) => {
                out.push('@');
                for item in items {
                    self.write_hash(item, out);
                    out.push(',');
                }
            }
            KeyArg::Object(obj) => {
                let id = self
                    .identities
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .id_of(obj);
                let _ = write!(out, "~{}", id);
            }
        }
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn primitive_strategy() -> impl Strategy<Value = KeyArg> {
        prop_oneof![
            Just(KeyArg::Null),
            any::<bool>().prop_map(KeyArg::Bool),
            any::<i64>().prop_map(KeyArg::Int),
            "[a-z/]{0,12}".prop_map(KeyArg::Str),
        ]
    }

    fn arg_strategy() -> impl Strategy<Value = KeyArg> {
        primitive_strategy().prop_recursive(3, 16, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(KeyArg::List)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: serialization of value keys is stable across calls and
        /// across serializer instances.
        #[test]
        fn prop_value_keys_are_stable(arg in arg_strategy()) {
            let a = KeySerializer::new();
            let b = KeySerializer::new();
            let key = Key::Static(arg);
            prop_assert_eq!(a.serialize(&key), a.serialize(&key));
            prop_assert_eq!(a.serialize(&key), b.serialize(&key));
        }

        /// Property: lists of distinct length never collide.
        #[test]
        fn prop_list_length_is_encoded(items in prop::collection::vec(primitive_strategy(), 1..6)) {
            let s = KeySerializer::new();
            let full = s.serialize(&Key::Static(KeyArg::List(items.clone())));
            let mut shorter = items;
            shorter.pop();
            let short = s.serialize(&Key::Static(KeyArg::List(shorter)));
            prop_assert_ne!(full, short);
        }

        /// Property: n distinct objects yield n distinct serialized keys.
        #[test]
        fn prop_distinct_objects_distinct_keys(n in 1usize..32) {
            let s = KeySerializer::new();
            let objects: Vec<ObjectRef> = (0..n).map(ObjectRef::new).collect();
            let mut seen = std::collections::HashSet::new();
            for obj in &objects {
                let key = s.serialize(&Key::from(obj.clone()));
                prop_assert!(seen.insert(key.serialized().map(str::to_string)));
            }
        }
    }
}
