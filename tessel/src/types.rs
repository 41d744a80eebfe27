//! Type descriptors and their operation tables.
//!
//! Every [`Value`] resolves to a [`Type`]. The type's [`TypeOps`] table is
//! what the runtime calls to initialize, copy, compare, print, cast, hash,
//! index and touch values of that type.

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;

use crate::value::ValueTag;
use crate::{BlockId, Buffer, CastError, Key, Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const NULL: Self = Self(0);
    pub const INT: Self = Self(1);
    pub const FLOAT: Self = Self(2);
    pub const BOOL: Self = Self(3);
    pub const STRING: Self = Self(4);
    pub const LIST: Self = Self(5);
    pub const MAP: Self = Self(6);
    pub const FUNC: Self = Self(7);
    pub const MODULE: Self = Self(8);
    pub const OPAQUE: Self = Self(9);
    pub const ERROR: Self = Self(10);
    pub const ANY: Self = Self(11);
    pub const MOVED: Self = Self(12);

    const BUILTIN_COUNT: u32 = 13;
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: Arc<str>,
    pub ty: Arc<Type>,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Null,
    Int,
    Float,
    Bool,
    String,
    List,
    Map,
    Func,
    Module,
    Opaque,
    Error,
    Any,
    Moved,
    Record(Vec<Field>),
}

/// Operation table shared by all values of a type.
pub struct TypeOps {
    pub initialize: fn(&Arc<Type>) -> Value,
    pub release: fn(&mut Value),
    pub copy: fn(&Value) -> Value,
    pub equals: fn(&Value, &Value) -> bool,
    pub to_string: fn(&Value, &mut fmt::Formatter<'_>) -> fmt::Result,
    /// Convert a value *into* this type. Called on the target type's table.
    pub cast: fn(&Value, &Arc<Type>) -> Result<Value, CastError>,
    pub hash: fn(&Value, &mut dyn Hasher),
    pub get_index: fn(&Value, usize) -> Option<Value>,
    pub touch: fn(&mut Value),
}

pub struct Type {
    pub id: TypeId,
    pub name: Arc<str>,
    pub kind: TypeKind,
    pub ops: &'static TypeOps,
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({} #{})", self.name, self.id.0)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Type {
    pub fn fields(&self) -> &[Field] {
        match &self.kind {
            TypeKind::Record(fields) => fields,
            _ => &[],
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self.kind, TypeKind::Record(_))
    }

    /// A fresh value of this type, built by its `initialize` operation.
    pub fn initial_value(self: &Arc<Self>) -> Value {
        (self.ops.initialize)(self)
    }

    /// Convert `value` into this type with the type's `cast` operation.
    pub fn cast(self: &Arc<Self>, value: &Value) -> Result<Value, CastError> {
        (self.ops.cast)(value, self)
    }
}

// ── operations ──────────────────────────────────────────────────────

fn init_null(_: &Arc<Type>) -> Value {
    Value::Null
}

fn init_int(_: &Arc<Type>) -> Value {
    Value::Int(0)
}

fn init_float(_: &Arc<Type>) -> Value {
    Value::Float(0.0)
}

fn init_bool(_: &Arc<Type>) -> Value {
    Value::Bool(false)
}

fn init_string(_: &Arc<Type>) -> Value {
    Value::str("")
}

fn init_list(_: &Arc<Type>) -> Value {
    Value::list(Vec::new())
}

fn init_map(_: &Arc<Type>) -> Value {
    Value::map(IndexMap::new())
}

fn init_error(_: &Arc<Type>) -> Value {
    Value::error("")
}

fn init_record(ty: &Arc<Type>) -> Value {
    let fields = ty.fields().iter().map(|f| f.ty.initial_value()).collect();
    Value::Record(Buffer::new(Record {
        ty: ty.clone(),
        fields,
    }))
}

fn release_value(value: &mut Value) {
    *value = Value::Null;
}

fn copy_value(value: &Value) -> Value {
    value.clone()
}

fn touch_none(_: &mut Value) {}

fn touch_buffer(value: &mut Value) {
    match value {
        Value::Str(buf) => {
            buf.touch();
        }
        Value::List(buf) => {
            buf.touch();
        }
        Value::Map(buf) => {
            buf.touch();
        }
        Value::Record(buf) => {
            buf.touch();
        }
        _ => {}
    }
}

fn index_none(_: &Value, _: usize) -> Option<Value> {
    None
}

fn index_string(value: &Value, index: usize) -> Option<Value> {
    let s = value.as_str()?;
    let c = s.chars().nth(index)?;
    Some(Value::str(c.encode_utf8(&mut [0; 4])))
}

fn index_list(value: &Value, index: usize) -> Option<Value> {
    value.as_list()?.get(index).cloned()
}

fn index_map(value: &Value, index: usize) -> Option<Value> {
    value.as_map()?.get_index(index).map(|(_, v)| v.clone())
}

fn index_record(value: &Value, index: usize) -> Option<Value> {
    value.as_record()?.fields.get(index).cloned()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
            *x as f64 == *y
        }
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x.ptr_eq(y) || x.get() == y.get(),
        (Value::List(x), Value::List(y)) => {
            x.ptr_eq(y) || slices_equal(x.get(), y.get())
        }
        (Value::Map(x), Value::Map(y)) => {
            x.ptr_eq(y)
                || (x.get().len() == y.get().len()
                    && x.get().iter().all(|(k, v)| {
                        y.get().get(k).is_some_and(|w| w.equals(v))
                    }))
        }
        (Value::Record(x), Value::Record(y)) => {
            x.ptr_eq(y)
                || (x.get().ty.id == y.get().ty.id
                    && slices_equal(&x.get().fields, &y.get().fields))
        }
        (Value::Func(x), Value::Func(y)) => {
            Arc::ptr_eq(x, y)
                || (x.block == y.block && slices_equal(&x.bindings, &y.bindings))
        }
        (Value::Module(x), Value::Module(y)) => Arc::ptr_eq(x, y),
        (Value::Opaque(x), Value::Opaque(y)) => x.ptr_eq(y),
        (Value::Error(x), Value::Error(y)) => x == y,
        _ => false,
    }
}

fn slices_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
}

fn hash_value(value: &Value, state: &mut dyn Hasher) {
    match value {
        Value::Int(i) => return hash_number(*i as f64, state),
        Value::Float(x) => return hash_number(*x, state),
        _ => state.write_u8(value.tag() as u8),
    }
    match value {
        Value::Null | Value::Moved | Value::Int(_) | Value::Float(_) => {}
        Value::Bool(b) => state.write_u8(*b as u8),
        Value::Str(s) => state.write(s.get().as_bytes()),
        Value::Error(s) => state.write(s.as_bytes()),
        Value::List(items) => hash_slice(items.get(), state),
        Value::Record(r) => {
            state.write_u32(r.get().ty.id.0);
            hash_slice(&r.get().fields, state);
        }
        // maps compare without regard to order, so entry hashes are summed
        Value::Map(map) => {
            let entries = map.get();
            let sum = entries.iter().fold(0u64, |sum, (key, item)| {
                let mut entry = ENTRY_HASHER.build_hasher();
                key.hash(&mut entry);
                item.hash_into(&mut entry);
                sum.wrapping_add(entry.finish())
            });
            state.write_usize(entries.len());
            state.write_u64(sum);
        }
        Value::Func(func) => {
            state.write_u32(func.block.0);
            hash_slice(&func.bindings, state);
        }
        Value::Module(module) => state.write_u32(module.ty.id.0),
        Value::Opaque(opaque) => state.write_usize(opaque.addr()),
    }
}

/// Ints and floats that compare equal hash as the same `f64`.
fn hash_number(x: f64, state: &mut dyn Hasher) {
    state.write_u8(ValueTag::Float as u8);
    // -0.0 == 0.0
    state.write_u64(if x == 0.0 { 0 } else { x.to_bits() });
}

static ENTRY_HASHER: ahash::RandomState = ahash::RandomState::with_seeds(
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0x2545_f491_4f6c_dd1d,
);

fn hash_slice(items: &[Value], state: &mut dyn Hasher) {
    state.write_usize(items.len());
    for item in items {
        item.hash_into(state);
    }
}

fn fmt_value(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Int(i) => write!(f, "{i}"),
        Value::Float(x) => write!(f, "{x:?}"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Str(s) => f.write_str(s.get()),
        Value::Error(message) => write!(f, "error: {message}"),
        Value::List(items) => {
            f.write_str("[")?;
            fmt_elements(items.get(), f)?;
            f.write_str("]")
        }
        Value::Map(map) => {
            f.write_str("{")?;
            for (i, (key, item)) in map.get().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}: ")?;
                fmt_element(item, f)?;
            }
            f.write_str("}")
        }
        Value::Record(record) => {
            let record = record.get();
            write!(f, "{}(", record.ty.name)?;
            for (i, (field, item)) in
                record.ty.fields().iter().zip(&record.fields).enumerate()
            {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: ", field.name)?;
                fmt_element(item, f)?;
            }
            f.write_str(")")
        }
        Value::Func(func) => write!(f, "<func #{}>", func.block.0),
        Value::Module(module) => write!(f, "<module {}>", module.name),
        Value::Opaque(_) => f.write_str("<opaque>"),
        Value::Moved => f.write_str("<moved>"),
    }
}

fn fmt_elements(items: &[Value], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        fmt_element(item, f)?;
    }
    Ok(())
}

fn fmt_element(item: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match item {
        Value::Str(s) => write!(f, "{:?}", s.get()),
        other => fmt_value(other, f),
    }
}

fn cast_error(value: &Value, ty: &Arc<Type>) -> CastError {
    CastError {
        from: value.type_name(),
        to: ty.name.to_string(),
    }
}

fn cast_exact(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    if value.type_id() == ty.id {
        Ok(value.clone())
    } else {
        Err(cast_error(value, ty))
    }
}

fn cast_any(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    match value {
        Value::Moved => Err(cast_error(value, ty)),
        _ => Ok(value.clone()),
    }
}

fn cast_never(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    Err(cast_error(value, ty))
}

fn cast_int(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    match *value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Float(x)
            if x.fract() == 0.0 && x >= i64::MIN as f64 && x < i64::MAX as f64 =>
        {
            Ok(Value::Int(x as i64))
        }
        _ => Err(cast_error(value, ty)),
    }
}

fn cast_float(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    match *value {
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Float(x) => Ok(Value::Float(x)),
        _ => Err(cast_error(value, ty)),
    }
}

fn cast_list(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    match value {
        Value::List(_) => Ok(value.clone()),
        Value::Record(record) => Ok(Value::list(record.get().fields.clone())),
        _ => Err(cast_error(value, ty)),
    }
}

fn cast_record(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    let items = match value {
        Value::Record(record) if record.get().ty.id == ty.id => {
            return Ok(value.clone());
        }
        Value::Record(record) => &record.get().fields,
        Value::List(items) => items.get(),
        _ => return Err(cast_error(value, ty)),
    };

    let fields = ty.fields();
    if items.len() != fields.len() {
        return Err(cast_error(value, ty));
    }

    let cast_fields = items
        .iter()
        .zip(fields)
        .map(|(item, field)| field.ty.cast(item))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| cast_error(value, ty))?;

    Ok(Value::Record(Buffer::new(Record {
        ty: ty.clone(),
        fields: cast_fields,
    })))
}

fn cast_module(value: &Value, ty: &Arc<Type>) -> Result<Value, CastError> {
    match value {
        Value::Module(module) if ty.id == TypeId::MODULE || module.ty.id == ty.id => {
            Ok(value.clone())
        }
        _ => Err(cast_error(value, ty)),
    }
}

macro_rules! type_ops {
    ($name:ident, init: $init:expr, cast: $cast:expr, index: $index:expr, touch: $touch:expr) => {
        pub static $name: TypeOps = TypeOps {
            initialize: $init,
            release: release_value,
            copy: copy_value,
            equals: values_equal,
            to_string: fmt_value,
            cast: $cast,
            hash: hash_value,
            get_index: $index,
            touch: $touch,
        };
    };
}

type_ops!(NULL_OPS, init: init_null, cast: cast_exact, index: index_none, touch: touch_none);
type_ops!(INT_OPS, init: init_int, cast: cast_int, index: index_none, touch: touch_none);
type_ops!(FLOAT_OPS, init: init_float, cast: cast_float, index: index_none, touch: touch_none);
type_ops!(BOOL_OPS, init: init_bool, cast: cast_exact, index: index_none, touch: touch_none);
type_ops!(STRING_OPS, init: init_string, cast: cast_exact, index: index_string, touch: touch_buffer);
type_ops!(LIST_OPS, init: init_list, cast: cast_list, index: index_list, touch: touch_buffer);
type_ops!(MAP_OPS, init: init_map, cast: cast_exact, index: index_map, touch: touch_buffer);
type_ops!(FUNC_OPS, init: init_null, cast: cast_exact, index: index_none, touch: touch_none);
type_ops!(MODULE_OPS, init: init_null, cast: cast_module, index: index_none, touch: touch_none);
type_ops!(OPAQUE_OPS, init: init_null, cast: cast_exact, index: index_none, touch: touch_none);
type_ops!(ERROR_OPS, init: init_error, cast: cast_exact, index: index_none, touch: touch_none);
type_ops!(ANY_OPS, init: init_null, cast: cast_any, index: index_none, touch: touch_none);
type_ops!(MOVED_OPS, init: init_null, cast: cast_never, index: index_none, touch: touch_none);
type_ops!(RECORD_OPS, init: init_record, cast: cast_record, index: index_record, touch: touch_buffer);

// ── builtin descriptors ─────────────────────────────────────────────

static BUILTINS: LazyLock<Vec<Arc<Type>>> = LazyLock::new(|| {
    let builtin = |id: TypeId, name: &str, kind: TypeKind, ops: &'static TypeOps| {
        Arc::new(Type {
            id,
            name: name.into(),
            kind,
            ops,
        })
    };
    vec![
        builtin(TypeId::NULL, "null", TypeKind::Null, &NULL_OPS),
        builtin(TypeId::INT, "int", TypeKind::Int, &INT_OPS),
        builtin(TypeId::FLOAT, "float", TypeKind::Float, &FLOAT_OPS),
        builtin(TypeId::BOOL, "bool", TypeKind::Bool, &BOOL_OPS),
        builtin(TypeId::STRING, "string", TypeKind::String, &STRING_OPS),
        builtin(TypeId::LIST, "list", TypeKind::List, &LIST_OPS),
        builtin(TypeId::MAP, "map", TypeKind::Map, &MAP_OPS),
        builtin(TypeId::FUNC, "func", TypeKind::Func, &FUNC_OPS),
        builtin(TypeId::MODULE, "module", TypeKind::Module, &MODULE_OPS),
        builtin(TypeId::OPAQUE, "opaque", TypeKind::Opaque, &OPAQUE_OPS),
        builtin(TypeId::ERROR, "error", TypeKind::Error, &ERROR_OPS),
        builtin(TypeId::ANY, "any", TypeKind::Any, &ANY_OPS),
        builtin(TypeId::MOVED, "moved", TypeKind::Moved, &MOVED_OPS),
    ]
});

/// Descriptor for one of the builtin types.
///
/// # Panics
///
/// Panics if `id` is not one of the `TypeId` builtin constants.
pub fn builtin(id: TypeId) -> &'static Arc<Type> {
    &BUILTINS[id.0 as usize]
}

pub fn null() -> Arc<Type> {
    builtin(TypeId::NULL).clone()
}

pub fn int() -> Arc<Type> {
    builtin(TypeId::INT).clone()
}

pub fn float() -> Arc<Type> {
    builtin(TypeId::FLOAT).clone()
}

pub fn boolean() -> Arc<Type> {
    builtin(TypeId::BOOL).clone()
}

pub fn string() -> Arc<Type> {
    builtin(TypeId::STRING).clone()
}

pub fn list() -> Arc<Type> {
    builtin(TypeId::LIST).clone()
}

pub fn map() -> Arc<Type> {
    builtin(TypeId::MAP).clone()
}

pub fn func() -> Arc<Type> {
    builtin(TypeId::FUNC).clone()
}

pub fn any() -> Arc<Type> {
    builtin(TypeId::ANY).clone()
}

// ── registry ────────────────────────────────────────────────────────

/// All types known to a [`World`](crate::World), plus the methods attached
/// to each of them.
pub struct TypeRegistry {
    types: Vec<Arc<Type>>,
    by_name: HashMap<Arc<str>, TypeId, ahash::RandomState>,
    methods: HashMap<TypeId, HashMap<Arc<str>, BlockId, ahash::RandomState>, ahash::RandomState>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let types: Vec<Arc<Type>> = BUILTINS.iter().cloned().collect();
        debug_assert_eq!(types.len(), TypeId::BUILTIN_COUNT as usize);
        let by_name = types.iter().map(|ty| (ty.name.clone(), ty.id)).collect();
        Self {
            types,
            by_name,
            methods: HashMap::default(),
        }
    }

    fn next_id(&self) -> TypeId {
        TypeId(self.types.len() as u32)
    }

    /// Declare a record type with the given named, typed fields.
    pub fn define_record<N: Into<Arc<str>>>(
        &mut self,
        name: &str,
        fields: impl IntoIterator<Item = (N, Arc<Type>)>,
    ) -> Arc<Type> {
        let fields = fields
            .into_iter()
            .map(|(name, ty)| Field {
                name: name.into(),
                ty,
            })
            .collect();
        let ty = Arc::new(Type {
            id: self.next_id(),
            name: name.into(),
            kind: TypeKind::Record(fields),
            ops: &RECORD_OPS,
        });
        self.insert(ty)
    }

    /// Declare the private type of one module value.
    pub fn define_module_type(&mut self, name: &str) -> Arc<Type> {
        let ty = Arc::new(Type {
            id: self.next_id(),
            name: name.into(),
            kind: TypeKind::Module,
            ops: &MODULE_OPS,
        });
        self.insert(ty)
    }

    fn insert(&mut self, ty: Arc<Type>) -> Arc<Type> {
        self.by_name.insert(ty.name.clone(), ty.id);
        self.types.push(ty.clone());
        ty
    }

    pub fn get(&self, id: TypeId) -> Option<&Arc<Type>> {
        self.types.get(id.0 as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Type>> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn add_method(&mut self, ty: TypeId, name: &str, block: BlockId) {
        self.methods
            .entry(ty)
            .or_default()
            .insert(name.into(), block);
    }

    pub fn method(&self, ty: TypeId, name: &str) -> Option<BlockId> {
        self.methods.get(&ty)?.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
