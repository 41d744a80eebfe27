//! Persistent state threading.
//!
//! State is a tree of maps. Every stateful frame reads an *incoming* subtree
//! and accumulates an *outgoing* map; a child pushed under key `k` sees
//! `incoming[k]` of its parent, and on return its outgoing map is stored back
//! at `k` (or `k` is removed when the child saved nothing). Paths are
//! sequences of keys, so the tree survives recompiles and can be written to
//! disk independently of any program.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::types::Type;
use crate::{BlockId, Key, Value, World};

pub type StatePath = Vec<Key>;

/// Incoming state for a child pushed under `key`.
pub fn child_incoming(parent_incoming: &Value, key: &Key) -> Value {
    parent_incoming
        .as_map()
        .and_then(|map| map.get(key))
        .cloned()
        .unwrap_or_default()
}

/// Fold a returning child's outgoing map into its parent's.
pub fn merge_outgoing(
    parent_outgoing: &mut IndexMap<Key, Value>,
    key: Key,
    child_outgoing: IndexMap<Key, Value>,
) {
    if child_outgoing.is_empty() {
        parent_outgoing.shift_remove(&key);
    } else {
        parent_outgoing.insert(key, Value::map(child_outgoing));
    }
}

pub fn read(incoming: &Value, name: &str) -> Value {
    child_incoming(incoming, &Key::name(name))
}

/// Saving null deletes the entry.
pub fn write(outgoing: &mut IndexMap<Key, Value>, name: &str, value: Value) {
    if value.is_null() {
        outgoing.shift_remove(&Key::name(name));
    } else {
        outgoing.insert(Key::name(name), value);
    }
}

pub fn lookup_path<'a>(tree: &'a Value, path: &[Key]) -> Option<&'a Value> {
    path.iter()
        .try_fold(tree, |node, key| node.as_map()?.get(key))
}

/// Point every closure over `old` in `tree` at `new`. Containers that hold
/// no such closure stay shared.
pub fn rebind_blocks(tree: &mut Value, old: BlockId, new: BlockId) {
    if !refers_to(tree, old) {
        return;
    }
    if let Value::Func(func) = tree {
        let closure = Arc::make_mut(func);
        if closure.block == old {
            closure.block = new;
        }
        for binding in &mut closure.bindings {
            rebind_blocks(binding, old, new);
        }
    } else if let Some(items) = tree.list_mut() {
        items.iter_mut().for_each(|item| rebind_blocks(item, old, new));
    } else if let Some(map) = tree.map_mut() {
        map.values_mut().for_each(|item| rebind_blocks(item, old, new));
    } else if let Some(record) = tree.record_mut() {
        record.fields.iter_mut().for_each(|field| rebind_blocks(field, old, new));
    }
}

fn refers_to(value: &Value, block: BlockId) -> bool {
    let any = |items: &[Value]| items.iter().any(|item| refers_to(item, block));
    match value {
        Value::Func(func) => func.block == block || any(func.bindings.as_slice()),
        Value::List(items) => any(items.get().as_slice()),
        Value::Map(map) => map.get().values().any(|item| refers_to(item, block)),
        Value::Record(record) => any(record.get().fields.as_slice()),
        _ => false,
    }
}

// ── persistence ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum PersistedKey {
    Name(String),
    Index(i64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum PersistedValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<PersistedValue>),
    Map(Vec<(PersistedKey, PersistedValue)>),
    Record {
        name: String,
        fields: Vec<PersistedValue>,
    },
    Error(String),
}

impl PersistedKey {
    fn from_key(key: &Key) -> Self {
        match key {
            Key::Name(name) => Self::Name(name.to_string()),
            Key::Index(i) => Self::Index(*i),
            Key::Bool(b) => Self::Bool(*b),
        }
    }

    fn into_key(self) -> Key {
        match self {
            Self::Name(name) => Key::name(&name),
            Self::Index(i) => Key::Index(i),
            Self::Bool(b) => Key::Bool(b),
        }
    }
}

impl PersistedValue {
    fn from_value(value: &Value) -> Result<Self, StateError> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Int(i) => Self::Int(*i),
            Value::Float(x) => Self::Float(*x),
            Value::Bool(b) => Self::Bool(*b),
            Value::Str(s) => Self::Str(s.get().clone()),
            Value::List(items) => Self::List(
                items
                    .get()
                    .iter()
                    .map(Self::from_value)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => Self::Map(
                map.get()
                    .iter()
                    .map(|(k, v)| Ok((PersistedKey::from_key(k), Self::from_value(v)?)))
                    .collect::<Result<_, StateError>>()?,
            ),
            Value::Record(record) => {
                let record = record.get();
                Self::Record {
                    name: record.ty.name.to_string(),
                    fields: record
                        .fields
                        .iter()
                        .map(Self::from_value)
                        .collect::<Result<_, _>>()?,
                }
            }
            Value::Error(message) => Self::Error(message.to_string()),
            other => return Err(StateError::NotPersistable(other.type_name())),
        })
    }

    fn into_value(self, world: &World) -> Result<Value, StateError> {
        Ok(match self {
            Self::Null => Value::Null,
            Self::Int(i) => Value::Int(i),
            Self::Float(x) => Value::Float(x),
            Self::Bool(b) => Value::Bool(b),
            Self::Str(s) => Value::str(&s),
            Self::List(items) => Value::list(
                items
                    .into_iter()
                    .map(|item| item.into_value(world))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => Value::map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k.into_key(), v.into_value(world)?)))
                    .collect::<Result<_, StateError>>()?,
            ),
            Self::Record { name, fields } => {
                let ty: Arc<Type> = world
                    .type_by_name(&name)
                    .filter(|ty| ty.is_record())
                    .ok_or(StateError::UnknownType(name))?;
                let fields = fields
                    .into_iter()
                    .map(|field| field.into_value(world))
                    .collect::<Result<Vec<_>, _>>()?;
                ty.cast(&Value::list(fields))?
            }
            Self::Error(message) => Value::error(&message),
        })
    }
}

pub fn to_json(tree: &Value) -> Result<String, StateError> {
    let persisted = PersistedValue::from_value(tree)?;
    Ok(serde_json::to_string_pretty(&persisted)?)
}

/// Record types are resolved by name against `world`.
pub fn from_json(world: &World, text: &str) -> Result<Value, StateError> {
    let persisted: PersistedValue = serde_json::from_str(text)?;
    persisted.into_value(world)
}

pub fn save_file(path: impl AsRef<Path>, tree: &Value) -> Result<(), StateError> {
    fs::write(path, to_json(tree)?)?;
    Ok(())
}

pub fn load_file(world: &World, path: impl AsRef<Path>) -> Result<Value, StateError> {
    let text = fs::read_to_string(path)?;
    from_json(world, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;
    use crate::WorldCreateInfo;

    fn tree() -> Value {
        let mut inner = IndexMap::new();
        inner.insert(Key::name("count"), Value::Int(3));
        inner.insert(Key::Index(0), Value::list(vec![Value::Float(0.5), Value::str("x")]));
        let mut root = IndexMap::new();
        root.insert(Key::name("counter"), Value::map(inner));
        root.insert(Key::Bool(true), Value::error("stale"));
        Value::map(root)
    }

    #[test]
    fn child_state_is_threaded_by_key() {
        let incoming = tree();
        let child = child_incoming(&incoming, &Key::name("counter"));
        assert_eq!(read(&child, "count"), Value::Int(3));
        assert!(child_incoming(&incoming, &Key::Index(7)).is_null());
        assert!(read(&Value::Null, "count").is_null());
    }

    #[test]
    fn empty_child_outgoing_removes_key() {
        let mut parent = IndexMap::new();
        parent.insert(Key::Index(1), Value::Int(0));

        let mut child = IndexMap::new();
        write(&mut child, "n", Value::Int(5));
        merge_outgoing(&mut parent, Key::Index(1), child);
        assert_eq!(
            lookup_path(&Value::map(parent.clone()), &[Key::Index(1), Key::name("n")]),
            Some(&Value::Int(5))
        );

        merge_outgoing(&mut parent, Key::Index(1), IndexMap::new());
        assert!(parent.is_empty());
    }

    #[test]
    fn saving_null_deletes() {
        let mut out = IndexMap::new();
        write(&mut out, "a", Value::Int(1));
        write(&mut out, "a", Value::Null);
        assert!(out.is_empty());
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let world = World::new(WorldCreateInfo::default());
        let point = world.define_record("Point", &[("x", types::int()), ("y", types::int())]);
        let mut root = tree();
        root.map_mut()
            .expect("map")
            .insert(Key::name("p"), point.cast(&Value::list(vec![Value::Int(1), Value::Int(2)])).expect("cast"));

        let text = to_json(&root).expect("serializes");
        let back = from_json(&world, &text).expect("deserializes");
        assert_eq!(back, root);
        assert_eq!(
            lookup_path(&back, &[Key::name("p")]).map(Value::type_id),
            Some(point.id)
        );
    }

    #[test]
    fn rebinding_touches_only_containers_with_closures() {
        let (old, new, other) = (crate::BlockId(1), crate::BlockId(2), crate::BlockId(3));
        let plain = Value::list(vec![Value::Int(1)]);
        let nested = Value::func(other, vec![Value::func(old, Vec::new())]);
        let mut entries = IndexMap::new();
        entries.insert(Key::name("plain"), plain.clone());
        entries.insert(Key::name("f"), nested);
        let mut root = Value::map(entries);
        let before = root.clone();

        rebind_blocks(&mut root, old, new);
        let f = lookup_path(&root, &[Key::name("f")]).and_then(Value::as_func).expect("func");
        assert_eq!(f.block, other);
        assert_eq!(f.bindings[0].as_func().map(|c| c.block), Some(new));
        assert_eq!(plain.refcount(), Some(3));
        assert_ne!(root, before);

        let mut untouched = before.clone();
        rebind_blocks(&mut untouched, crate::BlockId(9), new);
        assert_eq!(untouched.refcount(), Some(2));
    }

    #[test]
    fn functions_are_not_persistable() {
        let value = Value::func(crate::BlockId(0), Vec::new());
        assert!(matches!(to_json(&value), Err(StateError::NotPersistable(_))));
    }

    #[test]
    fn unknown_record_type_is_rejected() {
        let world = World::new(WorldCreateInfo::default());
        let text = r#"{"type":"record","value":{"name":"Ghost","fields":[]}}"#;
        assert!(matches!(from_json(&world, text), Err(StateError::UnknownType(name)) if name == "Ghost"));
    }
}
