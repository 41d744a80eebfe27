use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::types::{self, Type, TypeId};
use crate::{BlockId, Buffer, CastError, Module};

/// Discriminant of a [`Value`], stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    Null = 0,
    Int,
    Float,
    Bool,
    Str,
    List,
    Map,
    Record,
    Func,
    Module,
    Opaque,
    Error,
    Moved,
}

/// Map key. Persistent-state paths are sequences of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Name(Arc<str>),
    Index(i64),
    Bool(bool),
}

impl Key {
    pub fn name(name: &str) -> Self {
        Self::Name(name.into())
    }

    /// Keys can be built from strings, integers and booleans.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(Self::Name(s.get().as_str().into())),
            Value::Int(i) => Some(Self::Index(*i)),
            Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Name(name) => Value::str(name),
            Self::Index(i) => Value::Int(*i),
            Self::Bool(b) => Value::Bool(*b),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Index(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Self::name(name)
    }
}

impl From<i64> for Key {
    fn from(index: i64) -> Self {
        Self::Index(index)
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub ty: Arc<Type>,
    pub fields: Vec<Value>,
}

/// A block together with the values it closed over.
#[derive(Debug, Clone)]
pub struct Closure {
    pub block: BlockId,
    pub bindings: Vec<Value>,
}

/// Host pointer carried through the VM without interpretation.
#[derive(Clone)]
pub struct Opaque(pub Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({:#x})", self.addr())
    }
}

/// A runtime value cell.
///
/// Cloning a value is the `copy` operation: containers share their buffer
/// and bump its refcount. Mutation goes through [`touch`] (or the `*_mut`
/// accessors, which touch first), so copies never alias.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Buffer<String>),
    List(Buffer<Vec<Value>>),
    Map(Buffer<IndexMap<Key, Value>>),
    Record(Buffer<Record>),
    Func(Arc<Closure>),
    Module(Arc<Module>),
    Opaque(Opaque),
    Error(Arc<str>),
    /// Left behind by [`move_value`]. Must not be read again.
    Moved,
}

impl Value {
    pub fn str(s: &str) -> Self {
        Self::Str(Buffer::new(s.to_owned()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Buffer::new(items))
    }

    pub fn map(entries: IndexMap<Key, Value>) -> Self {
        Self::Map(Buffer::new(entries))
    }

    pub fn empty_map() -> Self {
        Self::map(IndexMap::new())
    }

    pub fn error(message: &str) -> Self {
        Self::Error(message.into())
    }

    pub fn func(block: BlockId, bindings: Vec<Value>) -> Self {
        Self::Func(Arc::new(Closure { block, bindings }))
    }

    pub fn tag(&self) -> ValueTag {
        match self {
            Self::Null => ValueTag::Null,
            Self::Int(_) => ValueTag::Int,
            Self::Float(_) => ValueTag::Float,
            Self::Bool(_) => ValueTag::Bool,
            Self::Str(_) => ValueTag::Str,
            Self::List(_) => ValueTag::List,
            Self::Map(_) => ValueTag::Map,
            Self::Record(_) => ValueTag::Record,
            Self::Func(_) => ValueTag::Func,
            Self::Module(_) => ValueTag::Module,
            Self::Opaque(_) => ValueTag::Opaque,
            Self::Error(_) => ValueTag::Error,
            Self::Moved => ValueTag::Moved,
        }
    }

    /// Runtime type identity, as seen by method dispatch.
    pub fn type_id(&self) -> TypeId {
        match self {
            Self::Null => TypeId::NULL,
            Self::Int(_) => TypeId::INT,
            Self::Float(_) => TypeId::FLOAT,
            Self::Bool(_) => TypeId::BOOL,
            Self::Str(_) => TypeId::STRING,
            Self::List(_) => TypeId::LIST,
            Self::Map(_) => TypeId::MAP,
            Self::Record(record) => record.get().ty.id,
            Self::Func(_) => TypeId::FUNC,
            Self::Module(module) => module.ty.id,
            Self::Opaque(_) => TypeId::OPAQUE,
            Self::Error(_) => TypeId::ERROR,
            Self::Moved => TypeId::MOVED,
        }
    }

    pub fn type_descriptor(&self) -> Arc<Type> {
        match self {
            Self::Record(record) => record.get().ty.clone(),
            Self::Module(module) => module.ty.clone(),
            other => types::builtin(other.type_id()).clone(),
        }
    }

    pub fn type_name(&self) -> String {
        self.type_descriptor().name.to_string()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_moved(&self) -> bool {
        matches!(self, Self::Moved)
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Self::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Integers are widened to floats.
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Self::Float(x) => Some(x),
            Self::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.get()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items.get()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<Key, Value>> {
        match self {
            Self::Map(map) => Some(map.get()),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record.get()),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&Closure> {
        match self {
            Self::Func(func) => Some(func),
            _ => None,
        }
    }

    /// Exclusive access to a list's elements, duplicating a shared buffer.
    pub fn list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Self::List(items) => Some(items.touch()),
            _ => None,
        }
    }

    /// Exclusive access to a map's entries, duplicating a shared buffer.
    pub fn map_mut(&mut self) -> Option<&mut IndexMap<Key, Value>> {
        match self {
            Self::Map(map) => Some(map.touch()),
            _ => None,
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Self::Record(record) => Some(record.touch()),
            _ => None,
        }
    }

    pub fn string_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Str(s) => Some(s.touch()),
            _ => None,
        }
    }

    /// Refcount of the backing buffer, for buffer-backed values.
    pub fn refcount(&self) -> Option<usize> {
        match self {
            Self::Str(buf) => Some(buf.refcount()),
            Self::List(buf) => Some(buf.refcount()),
            Self::Map(buf) => Some(buf.refcount()),
            Self::Record(buf) => Some(buf.refcount()),
            _ => None,
        }
    }

    /// Element count of containers and strings.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.get().chars().count()),
            Self::List(items) => Some(items.get().len()),
            Self::Map(map) => Some(map.get().len()),
            Self::Record(record) => Some(record.get().fields.len()),
            _ => None,
        }
    }

    /// Element access by position. Past-the-end yields `None`.
    pub fn get_index(&self, index: usize) -> Option<Value> {
        (self.type_descriptor().ops.get_index)(self, index)
    }

    /// Replace with an element at `index` of a list or record, touching the
    /// container first. Returns `false` when `index` is out of range.
    pub fn set_index(&mut self, index: usize, item: Value) -> bool {
        let slot = match self {
            Self::List(items) => items.touch().get_mut(index),
            Self::Record(record) => record.touch().fields.get_mut(index),
            _ => None,
        };
        match slot {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        }
    }

    /// Structural equality through the type's `equals` operation.
    pub fn equals(&self, other: &Value) -> bool {
        (self.type_descriptor().ops.equals)(self, other)
    }

    pub fn hash_into(&self, state: &mut dyn Hasher) {
        (self.type_descriptor().ops.hash)(self, state)
    }

    /// Take the value out, leaving the cell poisoned.
    pub fn take(&mut self) -> Value {
        std::mem::replace(self, Value::Moved)
    }

    /// Retype the cell: the old payload goes through the old type's `release`,
    /// then the new type's `initialize` builds the new payload.
    pub fn change_type(&mut self, ty: &Arc<Type>) {
        let old = self.type_descriptor();
        (old.ops.release)(self);
        *self = (ty.ops.initialize)(ty);
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_into(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.type_descriptor().ops.to_string)(self, f)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::list(items)
    }
}

// ── cell operations ─────────────────────────────────────────────────

/// `dst` becomes an independently mutable view of `src`, sharing its buffer.
pub fn copy(src: &Value, dst: &mut Value) {
    let ty = src.type_descriptor();
    *dst = (ty.ops.copy)(src);
}

/// Transfer ownership of `src` into `dst` without refcount traffic. `src` is
/// left as [`Value::Moved`].
pub fn move_value(src: &mut Value, dst: &mut Value) {
    *dst = src.take();
}

pub fn swap(a: &mut Value, b: &mut Value) {
    std::mem::swap(a, b);
}

/// Make `value`'s buffer exclusively owned so it can be mutated in place.
pub fn touch(value: &mut Value) {
    let ty = value.type_descriptor();
    (ty.ops.touch)(value);
}

/// Cast `src` into `ty`, writing `dst` only on success.
pub fn cast(src: &Value, ty: &Arc<Type>, dst: &mut Value) -> Result<(), CastError> {
    let converted = ty.cast(src)?;
    *dst = converted;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TypeRegistry;
    use crate::buffer::live_buffers;

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|&i| Value::Int(i)).collect())
    }

    #[test]
    fn copy_shares_buffer() {
        let a = ints(&[1, 2, 3]);
        let mut b = Value::Null;
        copy(&a, &mut b);
        assert_eq!(a.refcount(), Some(2));
        assert_eq!(a, b);
    }

    #[test]
    fn touched_copy_is_independent() {
        let a = ints(&[1, 2, 3]);
        let mut b = a.clone();
        let mut c = a.clone();
        assert_eq!(a.refcount(), Some(3));

        touch(&mut c);
        assert!(c.set_index(0, Value::Int(99)));

        assert_eq!(a.get_index(0), Some(Value::Int(1)));
        assert_eq!(b.get_index(0), Some(Value::Int(1)));
        assert_eq!(c.get_index(0), Some(Value::Int(99)));
        assert_eq!(a.refcount(), Some(2));
        assert_eq!(c.refcount(), Some(1));

        // and the other direction
        b.list_mut().expect("list").push(Value::Int(4));
        assert_eq!(a.len(), Some(3));
        assert_eq!(b.len(), Some(4));
    }

    #[test]
    fn nested_containers_copy_on_write() {
        let inner = ints(&[1]);
        let outer = Value::list(vec![inner.clone(), inner]);
        let mut copy_of_outer = outer.clone();

        let first = &mut copy_of_outer.list_mut().expect("list")[0];
        first.list_mut().expect("list")[0] = Value::Int(7);

        assert_eq!(outer.to_string(), "[[1], [1]]");
        assert_eq!(copy_of_outer.to_string(), "[[7], [1]]");
    }

    #[test]
    fn move_poisons_source_without_refcount_traffic() {
        let mut a = ints(&[1]);
        let mut b = Value::Null;
        move_value(&mut a, &mut b);
        assert!(a.is_moved());
        assert_eq!(b.refcount(), Some(1));
    }

    #[test]
    fn swap_exchanges_payloads() {
        let mut a = Value::Int(1);
        let mut b = Value::str("x");
        swap(&mut a, &mut b);
        assert_eq!(a.as_str(), Some("x"));
        assert_eq!(b.as_int(), Some(1));
    }

    #[test]
    fn operations_release_buffers_exactly_once() {
        let base = live_buffers();
        {
            let mut a = ints(&[1, 2]);
            let mut b = Value::Null;
            copy(&a, &mut b);
            let mut c = Value::Null;
            move_value(&mut b, &mut c);
            swap(&mut a, &mut c);
            assert_eq!(live_buffers(), base + 1);

            c.list_mut().expect("list").push(Value::Int(3));
            assert_eq!(live_buffers(), base + 2);

            a = Value::Null;
            assert!(a.is_null());
            assert_eq!(live_buffers(), base + 1);
        }
        assert_eq!(live_buffers(), base);
    }

    #[test]
    fn cast_int_to_float() {
        let mut dst = Value::Null;
        cast(&Value::Int(3), &types::float(), &mut dst).expect("cast");
        assert_eq!(dst.as_float(), Some(3.0));
    }

    #[test]
    fn failed_cast_leaves_destination_untouched() {
        let mut dst = Value::Int(5);
        let err = cast(&Value::str("nope"), &types::int(), &mut dst)
            .expect_err("string is not an int");
        assert_eq!(err.to_string(), "couldn't cast string to type int");
        assert_eq!(dst.as_int(), Some(5));
    }

    #[test]
    fn cast_list_to_record() {
        let mut registry = TypeRegistry::new();
        let point = registry
            .define_record("Point", [("x", types::float()), ("y", types::float())]);

        let mut dst = Value::Null;
        cast(&Value::list(vec![Value::Int(1), Value::Float(2.5)]), &point, &mut dst)
            .expect("cast");
        assert_eq!(dst.type_id(), point.id);
        assert_eq!(dst.to_string(), "Point(x: 1.0, y: 2.5)");

        let mut untouched = Value::Null;
        assert!(cast(&ints(&[1, 2, 3]), &point, &mut untouched).is_err());
        assert!(untouched.is_null());
    }

    #[test]
    fn change_type_reinitializes() {
        let mut cell = ints(&[1]);
        cell.change_type(&types::int());
        assert_eq!(cell.as_int(), Some(0));
        assert_eq!(cell.tag(), ValueTag::Int);
        assert_eq!(cell.type_id(), TypeId::INT);
    }

    #[test]
    fn past_the_end_index_is_not_found() {
        assert_eq!(ints(&[1]).get_index(1), None);
        assert_eq!(Value::str("ab").get_index(1), Some(Value::str("b")));
        let mut list = ints(&[1]);
        assert!(!list.set_index(3, Value::Null));
    }

    #[test]
    fn display_quotes_nested_strings() {
        let mut map = IndexMap::new();
        map.insert(Key::name("a"), Value::list(vec![Value::str("x"), Value::Null]));
        map.insert(Key::Index(2), Value::Bool(true));
        assert_eq!(Value::map(map).to_string(), "{a: [\"x\", null], 2: true}");
        assert_eq!(Value::str("plain").to_string(), "plain");
    }

    #[test]
    fn equal_values_hash_alike() {
        use std::collections::hash_map::DefaultHasher;

        let hash = |v: &Value| {
            let mut h = DefaultHasher::new();
            v.hash(&mut h);
            h.finish()
        };
        let a = ints(&[1, 2]);
        let b = ints(&[1, 2]);
        assert_eq!(a, b);
        assert_eq!(hash(&a), hash(&b));

        for (int, float) in [(1, 1.0), (0, -0.0), (-7, -7.0)] {
            assert_eq!(Value::Int(int), Value::Float(float));
            assert_eq!(hash(&Value::Int(int)), hash(&Value::Float(float)));
        }
        let mixed = Value::list(vec![Value::Int(3), Value::Float(0.5)]);
        let floats = Value::list(vec![Value::Float(3.0), Value::Float(0.5)]);
        assert_eq!(mixed, floats);
        assert_eq!(hash(&mixed), hash(&floats));

        let mut forward = IndexMap::new();
        forward.insert(Key::name("x"), Value::Int(1));
        forward.insert(Key::Index(2), Value::str("y"));
        let mut backward = IndexMap::new();
        backward.insert(Key::Index(2), Value::str("y"));
        backward.insert(Key::name("x"), Value::Float(1.0));
        let (forward, backward) = (Value::map(forward), Value::map(backward));
        assert_eq!(forward, backward);
        assert_eq!(hash(&forward), hash(&backward));
        assert_ne!(hash(&forward), hash(&Value::empty_map()));
    }
}
