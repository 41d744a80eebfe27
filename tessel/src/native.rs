//! Host functions callable from bytecode through `Native <idx>`.
//!
//! A native runs against the active frame: it reads its arguments with
//! [`Stack::input`] and writes results with [`Stack::set_output`].

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

use rand::Rng;

use crate::{CompileError, Key, RuntimeError, Stack, Value};

pub type NativeFn = fn(&mut Stack) -> Result<(), RuntimeError>;

#[derive(Clone)]
pub struct NativeDesc {
    pub name: Arc<str>,
    pub func: NativeFn,
}

impl NativeDesc {
    pub fn new(name: &str, func: NativeFn) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl std::fmt::Debug for NativeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NativeDesc").field(&self.name).finish()
    }
}

/// Name-indexed table of natives. Indices never change once handed out.
#[derive(Debug, Default)]
pub struct NativeTable {
    entries: Vec<NativeDesc>,
    by_name: HashMap<Arc<str>, u16, ahash::RandomState>,
}

impl NativeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `func` under `name`. Registering a name twice patches the
    /// existing entry and returns its index.
    pub fn register(&mut self, name: &str, func: NativeFn) -> Result<u16, CompileError> {
        if let Some(idx) = self.patch(name, func) {
            return Ok(idx);
        }
        let idx = u16::try_from(self.entries.len()).map_err(|_| {
            CompileError::PoolOverflow {
                block: name.to_owned(),
                pool: "native",
            }
        })?;
        let desc = NativeDesc::new(name, func);
        self.by_name.insert(desc.name.clone(), idx);
        self.entries.push(desc);
        Ok(idx)
    }

    /// Swap the function behind `name`, keeping its index.
    pub fn patch(&mut self, name: &str, func: NativeFn) -> Option<u16> {
        let idx = *self.by_name.get(name)?;
        self.entries[idx as usize].func = func;
        Some(idx)
    }

    pub fn get(&self, idx: u16) -> Option<&NativeDesc> {
        self.entries.get(idx as usize)
    }

    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn default_natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::new("print", native_print),
        NativeDesc::new("to_string", native_to_string),
        NativeDesc::new("length", native_length),
        NativeDesc::new("rand", native_rand),
        NativeDesc::new("env", native_env),
        NativeDesc::new("error", native_error),
        NativeDesc::new("hash", native_hash),
        NativeDesc::new("emit", native_emit),
    ]
}

fn argument(stack: &Stack, index: usize) -> Result<Value, RuntimeError> {
    stack
        .input(index)
        .cloned()
        .ok_or_else(|| RuntimeError::invariant(format!("native argument {index} missing")))
}

fn native_print(stack: &mut Stack) -> Result<(), RuntimeError> {
    let line = (0..stack.input_count())
        .filter_map(|i| stack.input(i))
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
    Ok(())
}

fn native_to_string(stack: &mut Stack) -> Result<(), RuntimeError> {
    let value = argument(stack, 0)?;
    stack.set_output(0, Value::str(&value.to_string()))
}

fn native_length(stack: &mut Stack) -> Result<(), RuntimeError> {
    let value = argument(stack, 0)?;
    let len = value
        .len()
        .ok_or_else(|| RuntimeError::type_mismatch("container", value.type_name()))?;
    stack.set_output(0, Value::Int(len as i64))
}

/// `rand()` is a float in `[0, 1)`, `rand(lo, hi)` an int in `[lo, hi)`.
/// Draws from the stack's seeded generator, so runs are reproducible.
fn native_rand(stack: &mut Stack) -> Result<(), RuntimeError> {
    if stack.input_count() < 2 {
        let x: f64 = stack.rng().random();
        return stack.set_output(0, Value::Float(x));
    }
    let bound = |value: Value| {
        value
            .as_int()
            .ok_or_else(|| RuntimeError::type_mismatch("int", value.type_name()))
    };
    let lo = bound(argument(stack, 0)?)?;
    let hi = bound(argument(stack, 1)?)?;
    if lo >= hi {
        return Err(stack.raise_error(&format!("rand: empty range {lo}..{hi}")));
    }
    let n = stack.rng().random_range(lo..hi);
    stack.set_output(0, Value::Int(n))
}

fn native_env(stack: &mut Stack) -> Result<(), RuntimeError> {
    let name = argument(stack, 0)?;
    let key = Key::from_value(&name)
        .ok_or_else(|| RuntimeError::type_mismatch("string", name.type_name()))?;
    let value = stack.env(&key).cloned().unwrap_or_default();
    stack.set_output(0, value)
}

fn native_error(stack: &mut Stack) -> Result<(), RuntimeError> {
    let message = argument(stack, 0)?;
    Err(stack.raise_error(&message.to_string()))
}

fn native_hash(stack: &mut Stack) -> Result<(), RuntimeError> {
    let value = argument(stack, 0)?;
    let hasher = ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    );
    stack.set_output(0, Value::Int(hasher.hash_one(&value) as i64))
}

/// `emit(channel, message)`: hand `message` to the host if it expects
/// `channel`.
fn native_emit(stack: &mut Stack) -> Result<(), RuntimeError> {
    let channel = argument(stack, 0)?;
    let channel = Key::from_value(&channel)
        .ok_or_else(|| RuntimeError::type_mismatch("channel key", channel.type_name()))?;
    let message = argument(stack, 1)?;
    stack.emit(&channel, message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;
    use crate::{RunOutcome, Signature, StackCreateInfo, World, WorldCreateInfo};

    #[test]
    fn register_twice_patches_in_place() {
        fn one(stack: &mut Stack) -> Result<(), RuntimeError> {
            stack.set_output(0, Value::Int(1))
        }
        fn two(stack: &mut Stack) -> Result<(), RuntimeError> {
            stack.set_output(0, Value::Int(2))
        }

        let mut table = NativeTable::new();
        let a = table.register("k", one).expect("fits");
        let b = table.register("k", two).expect("fits");
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(a).map(|d| d.func as usize), Some(two as usize));
        assert_eq!(table.patch("missing", one), None);
    }

    fn run_native(native: &str, args: &[Value]) -> (Stack, Result<RunOutcome, RuntimeError>) {
        let world = World::new(WorldCreateInfo::default());
        let mut sig = Signature::new(native);
        for (i, _) in args.iter().enumerate() {
            sig = sig.input(&format!("a{i}"), types::any());
        }
        let sig = sig.optional_output("result", types::any(), args.len() as u16);
        let id = world.add_native_block(sig, native);
        let mut stack = Stack::new(world, StackCreateInfo::default());
        let result = stack.push_frame(id, args.to_vec()).and_then(|_| stack.run());
        (stack, result)
    }

    #[test]
    fn length_and_to_string() {
        let (stack, result) =
            run_native("length", &[Value::list(vec![Value::Int(1), Value::Null])]);
        assert_eq!(result, Ok(RunOutcome::Finished));
        assert_eq!(stack.output(0), Some(&Value::Int(2)));

        let (stack, _) = run_native("to_string", &[Value::Float(2.0)]);
        assert_eq!(stack.output(0).and_then(Value::as_str), Some("2.0"));
    }

    #[test]
    fn rand_is_seeded_and_bounded() {
        let (a, _) = run_native("rand", &[Value::Int(0), Value::Int(1000)]);
        let (b, _) = run_native("rand", &[Value::Int(0), Value::Int(1000)]);
        let n = a.output(0).and_then(Value::as_int).expect("int");
        assert!((0..1000).contains(&n));
        assert_eq!(a.output(0), b.output(0));

        let (stack, result) = run_native("rand", &[Value::Int(3), Value::Int(3)]);
        assert!(matches!(result, Err(RuntimeError::HostRaised(_))));
        assert!(stack.error_occurred());
    }

    #[test]
    fn emit_needs_a_key() {
        let (stack, result) = run_native("emit", &[Value::Null, Value::Int(1)]);
        assert_eq!(result, Err(RuntimeError::type_mismatch("channel key", "null")));
        assert!(stack.error_occurred());
    }

    #[test]
    fn error_native_raises() {
        let (stack, result) = run_native("error", &[Value::str("boom")]);
        assert_eq!(result, Err(RuntimeError::HostRaised("boom".into())));
        assert!(matches!(stack.output(0), Some(Value::Error(msg)) if &**msg == "boom"));
    }
}
