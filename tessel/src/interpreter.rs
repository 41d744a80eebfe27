//! The dispatch loop.
//!
//! [`Stack::run`] executes the active frame's program one instruction at a
//! time until the root frame returns, a `Pause` is reached, the stack is
//! cancelled, or an error is raised. The loop holds on to the active
//! program and only refetches it after instructions that can leave the
//! frame.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytecode::Instruction;

use crate::dispatch::SendSite;
use crate::error::RuntimeError;
use crate::frame::Pc;
use crate::stack::{Link, offset_register};
use crate::value::{self, ValueTag};
use crate::{CompileError, Key, Program, RunOutcome, RunPhase, Stack, Value, state};

enum Flow {
    Continue,
    /// The active frame changed or may have; refetch its program.
    Reload,
    Pause,
    Finish,
}

fn jump_target(pc: usize, offset: i16) -> Result<usize, RuntimeError> {
    pc.checked_add_signed(offset as isize)
        .ok_or_else(|| RuntimeError::invariant(format!("jump {offset:+} from {pc} leaves the program")))
}

fn int_of(value: &Value) -> Result<i64, RuntimeError> {
    value
        .as_int()
        .ok_or_else(|| RuntimeError::type_mismatch("int", value.type_name()))
}

fn float_of(value: &Value) -> Result<f64, RuntimeError> {
    value
        .as_float()
        .ok_or_else(|| RuntimeError::type_mismatch("float", value.type_name()))
}

fn bool_of(value: &Value) -> Result<bool, RuntimeError> {
    value
        .as_bool()
        .ok_or_else(|| RuntimeError::type_mismatch("bool", value.type_name()))
}

fn pool_miss(pool: &str, idx: u16) -> RuntimeError {
    RuntimeError::invariant(format!("{pool} pool index {idx} out of range"))
}

impl Stack {
    /// Run (or resume) until the root frame returns or execution pauses.
    pub fn run(&mut self) -> Result<RunOutcome, RuntimeError> {
        match self.phase {
            RunPhase::Finished => {
                return match self.error() {
                    Some(err) => Err(err.error.clone()),
                    None => Ok(self.last_outcome.unwrap_or(RunOutcome::Finished)),
                };
            }
            RunPhase::Running => {
                return Err(RuntimeError::invariant("stack is already running"));
            }
            RunPhase::Ready => {}
        }
        if self.frames.is_empty() {
            return Err(RuntimeError::invariant("no frame to run"));
        }

        self.phase = RunPhase::Running;
        let result = self.restart_if_stale().and_then(|()| self.execute());
        match result {
            Ok(outcome) => {
                self.phase = match outcome {
                    RunOutcome::Paused => RunPhase::Ready,
                    RunOutcome::Finished | RunOutcome::Cancelled => RunPhase::Finished,
                };
                self.last_outcome = Some(outcome);
                log::trace!("stack {} run ended: {outcome:?}", self.id());
                Ok(outcome)
            }
            Err(err) => {
                self.record_error(err.clone());
                Err(err)
            }
        }
    }

    /// A block that was replaced while this stack was paused invalidates
    /// every pc into its old program. Unwind to the root and start it over
    /// against the last committed state.
    fn restart_if_stale(&mut self) -> Result<(), RuntimeError> {
        let stale = self.frames.iter().any(|frame| {
            !self.world
                .program(frame.program)
                .is_ok_and(|program| program.version == frame.version)
        });
        if !stale {
            return Ok(());
        }
        while self.frames.len() > 1 {
            self.pop_frame();
        }
        let root_program = self.active()?.program;
        let program = self.world.program(root_program)?;
        let tree = self.state.clone();
        let root = self.active_mut()?;
        let inputs = root.input_count;
        for register in root.registers.iter_mut().skip(inputs) {
            *register = Value::Null;
        }
        root.resize_registers(program.registers.max(inputs));
        root.version = program.version;
        root.pc = Pc {
            offset: 0,
            node: program.node_at(0),
        };
        root.incoming = tree;
        root.outgoing.clear();
        log::debug!("'{}' changed while paused; restarting root frame", program.name());
        Ok(())
    }

    fn current_program(&self) -> Result<Arc<Program>, RuntimeError> {
        let frame = self.active()?;
        let program = self.world.program(frame.program)?;
        if program.version != frame.version {
            return Err(RuntimeError::invariant(format!(
                "'{}' was replaced while running",
                program.name()
            )));
        }
        Ok(program)
    }

    fn execute(&mut self) -> Result<RunOutcome, RuntimeError> {
        let mut program = self.current_program()?;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                log::debug!("stack {} cancelled", self.id());
                return Ok(RunOutcome::Cancelled);
            }
            let Some(top) = self.frames.len().checked_sub(1) else {
                return Err(RuntimeError::invariant("frame list emptied while running"));
            };
            let pc = self.frames[top].pc.offset;
            let (instruction, next) = program
                .instruction_at(pc)
                .map_err(CompileError::from)?;
            self.frames[top].pc.offset = next;

            match self.step(&program, instruction, next) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Reload) => program = self.current_program()?,
                Ok(Flow::Pause) => {
                    self.frames[top].pc.node = program.node_at(next);
                    return Ok(RunOutcome::Paused);
                }
                Ok(Flow::Finish) => return Ok(RunOutcome::Finished),
                Err(err) => {
                    // point at the faulting instruction
                    if let Some(frame) = self.frames.get_mut(top) {
                        frame.pc = Pc {
                            offset: pc,
                            node: program.node_at(pc),
                        };
                    }
                    return Err(err);
                }
            }
        }
    }

    fn step(
        &mut self,
        program: &Program,
        instruction: Instruction,
        next: usize,
    ) -> Result<Flow, RuntimeError> {
        match instruction {
            Instruction::LoadConst { dst, idx } => {
                let value = program
                    .constant(idx)
                    .cloned()
                    .ok_or_else(|| pool_miss("constant", idx))?;
                self.set_register(dst, value)?;
            }
            Instruction::LoadInt { dst, value } => {
                self.set_register(dst, Value::Int(value as i64))?;
            }
            Instruction::SetNull { dst } => self.set_register(dst, Value::Null)?,
            Instruction::SetEmptyList { dst } => {
                self.set_register(dst, Value::list(Vec::new()))?;
            }
            Instruction::Copy { dst, src } => {
                let mut copied = Value::Null;
                value::copy(self.register(src)?, &mut copied);
                self.set_register(dst, copied)?;
            }
            Instruction::Move { dst, src } => {
                if dst != src {
                    self.register(src)?;
                    let mut moved = Value::Null;
                    value::move_value(self.register_mut(src)?, &mut moved);
                    self.set_register(dst, moved)?;
                }
            }
            Instruction::Swap { a, b } => {
                let frame = self.active_mut()?;
                let len = frame.registers.len();
                if a as usize >= len || b as usize >= len {
                    return Err(RuntimeError::invariant(format!(
                        "swap r{a}, r{b} out of range"
                    )));
                }
                frame.registers.swap(a as usize, b as usize);
            }
            Instruction::Cast { dst, src, type_idx } => {
                let ty = program
                    .type_ref(type_idx)
                    .ok_or_else(|| pool_miss("type", type_idx))?;
                let converted = ty.cast(self.register(src)?)?;
                self.set_register(dst, converted)?;
            }

            Instruction::AddInt { dst, lhs, rhs } => {
                let (a, b) = self.ints(lhs, rhs)?;
                self.set_register(dst, Value::Int(a.wrapping_add(b)))?;
            }
            Instruction::SubInt { dst, lhs, rhs } => {
                let (a, b) = self.ints(lhs, rhs)?;
                self.set_register(dst, Value::Int(a.wrapping_sub(b)))?;
            }
            Instruction::MulInt { dst, lhs, rhs } => {
                let (a, b) = self.ints(lhs, rhs)?;
                self.set_register(dst, Value::Int(a.wrapping_mul(b)))?;
            }
            Instruction::DivInt { dst, lhs, rhs } => {
                let (a, b) = self.ints(lhs, rhs)?;
                if b == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                self.set_register(dst, Value::Int(a.wrapping_div(b)))?;
            }
            Instruction::AddFloat { dst, lhs, rhs } => {
                let (a, b) = self.floats(lhs, rhs)?;
                self.set_register(dst, Value::Float(a + b))?;
            }
            Instruction::SubFloat { dst, lhs, rhs } => {
                let (a, b) = self.floats(lhs, rhs)?;
                self.set_register(dst, Value::Float(a - b))?;
            }
            Instruction::MulFloat { dst, lhs, rhs } => {
                let (a, b) = self.floats(lhs, rhs)?;
                self.set_register(dst, Value::Float(a * b))?;
            }
            Instruction::DivFloat { dst, lhs, rhs } => {
                let (a, b) = self.floats(lhs, rhs)?;
                if b == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                self.set_register(dst, Value::Float(a / b))?;
            }
            Instruction::Equals { dst, lhs, rhs } => {
                let equal = self.register(lhs)?.equals(self.register(rhs)?);
                self.set_register(dst, Value::Bool(equal))?;
            }
            Instruction::LessThan { dst, lhs, rhs } => {
                let less = match (self.register(lhs)?, self.register(rhs)?) {
                    (Value::Int(a), Value::Int(b)) => a < b,
                    (Value::Str(a), Value::Str(b)) => a.get() < b.get(),
                    (a, b) => float_of(a)? < float_of(b)?,
                };
                self.set_register(dst, Value::Bool(less))?;
            }
            Instruction::Increment { reg } => {
                let slot = self.register_mut(reg)?;
                *slot = match *slot {
                    Value::Int(i) => Value::Int(i.wrapping_add(1)),
                    Value::Float(x) => Value::Float(x + 1.0),
                    ref other => {
                        return Err(RuntimeError::type_mismatch("int", other.type_name()));
                    }
                };
            }

            Instruction::GetIndex {
                dst,
                container,
                index,
            } => {
                let target = self.register(container)?;
                let index = self.register(index)?;
                let found = match target {
                    Value::Map(map) => Key::from_value(index).and_then(|key| map.get().get(&key).cloned()),
                    Value::List(_) | Value::Str(_) | Value::Record(_) => {
                        usize::try_from(int_of(index)?)
                            .ok()
                            .and_then(|i| target.get_index(i))
                    }
                    other => {
                        return Err(RuntimeError::type_mismatch("container", other.type_name()));
                    }
                };
                self.set_register(dst, found.unwrap_or_default())?;
            }
            Instruction::SetIndex {
                container,
                index,
                src,
            } => {
                let item = self.register(src)?.clone();
                let index = self.register(index)?.clone();
                self.set_index(container, &index, item)?;
            }
            Instruction::Append { list, src } => {
                let item = self.register(src)?.clone();
                let target = self.register_mut(list)?;
                match target.list_mut() {
                    Some(items) => items.push(item),
                    None => {
                        return Err(RuntimeError::type_mismatch("list", target.type_name()));
                    }
                }
            }
            Instruction::Length { dst, container } => {
                let target = self.register(container)?;
                let len = target
                    .len()
                    .ok_or_else(|| RuntimeError::type_mismatch("container", target.type_name()))?;
                self.set_register(dst, Value::Int(len as i64))?;
            }

            Instruction::Jump { offset } => {
                self.active_mut()?.pc.offset = jump_target(next, offset)?;
            }
            Instruction::JumpIf { cond, offset } => {
                if bool_of(self.register(cond)?)? {
                    self.active_mut()?.pc.offset = jump_target(next, offset)?;
                }
            }
            Instruction::JumpIfNot { cond, offset } => {
                if !bool_of(self.register(cond)?)? {
                    self.active_mut()?.pc.offset = jump_target(next, offset)?;
                }
            }
            Instruction::JumpIfDone {
                index,
                container,
                offset,
            } => {
                let i = int_of(self.register(index)?)?;
                let target = self.register(container)?;
                let len = target
                    .len()
                    .ok_or_else(|| RuntimeError::type_mismatch("container", target.type_name()))?;
                if i >= len as i64 {
                    self.active_mut()?.pc.offset = jump_target(next, offset)?;
                }
            }

            Instruction::Call {
                block_idx,
                base,
                argc,
                out,
            } => {
                let block = program
                    .block_ref(block_idx)
                    .ok_or_else(|| pool_miss("block", block_idx))?;
                let args = self.arguments(base, argc as usize)?;
                self.enter(block, args, Link::returning_to(out))?;
            }
            Instruction::CallKeyed {
                block_idx,
                base,
                argc,
                out,
                key,
            } => {
                let block = program
                    .block_ref(block_idx)
                    .ok_or_else(|| pool_miss("block", block_idx))?;
                let key_value = self.register(key)?;
                let key = Key::from_value(key_value).ok_or_else(|| {
                    RuntimeError::type_mismatch("state key", key_value.type_name())
                })?;
                let args = self.arguments(base, argc as usize)?;
                let link = Link {
                    key: Some(key),
                    ..Link::returning_to(out)
                };
                self.enter(block, args, link)?;
            }
            Instruction::CallFunc { base, argc, out } => {
                let callee = self.register(base)?;
                let closure = callee
                    .as_func()
                    .cloned()
                    .ok_or_else(|| RuntimeError::type_mismatch("func", callee.type_name()))?;
                let args = self.arguments(offset_register(base, 1)?, argc as usize)?;
                let link = Link {
                    bindings: closure.bindings,
                    ..Link::returning_to(out)
                };
                self.enter(closure.block, args, link)?;
            }
            Instruction::CallFuncApply { func, args, out } => {
                let callee = self.register(func)?;
                let closure = callee
                    .as_func()
                    .cloned()
                    .ok_or_else(|| RuntimeError::type_mismatch("func", callee.type_name()))?;
                let list = self.register(args)?;
                let args = list
                    .as_list()
                    .map(<[Value]>::to_vec)
                    .ok_or_else(|| RuntimeError::type_mismatch("list", list.type_name()))?;
                let link = Link {
                    bindings: closure.bindings,
                    ..Link::returning_to(out)
                };
                self.enter(closure.block, args, link)?;
            }
            Instruction::CallMethod {
                name_idx,
                base,
                argc,
                out,
                site,
            } => {
                let name = program
                    .name_ref(name_idx)
                    .ok_or_else(|| pool_miss("name", name_idx))?;
                self.send(SendSite {
                    name,
                    base,
                    argc,
                    out,
                    program: program.index,
                    site,
                })?;
            }
            Instruction::MakeFunc {
                dst,
                block_idx,
                first,
                count,
            } => {
                let block = program
                    .block_ref(block_idx)
                    .ok_or_else(|| pool_miss("block", block_idx))?;
                let bindings = self.arguments(first, count as usize)?;
                self.set_register(dst, Value::func(block, bindings))?;
            }
            Instruction::SplatBindings { first, count } => {
                let bindings = self.active()?.bindings.clone();
                if bindings.len() != count as usize {
                    return Err(RuntimeError::invariant(format!(
                        "expected {count} bindings, frame has {}",
                        bindings.len()
                    )));
                }
                for (i, binding) in bindings.into_iter().enumerate() {
                    self.set_register(offset_register(first, i)?, binding)?;
                }
            }
            Instruction::VarargsToList { first } => {
                let frame = self.active_mut()?;
                let first = first as usize;
                if first >= frame.registers.len() {
                    return Err(RuntimeError::invariant(format!("varargs start r{first} out of range")));
                }
                let end = frame.input_count.max(first);
                let items = frame.registers[first..end]
                    .iter_mut()
                    .map(std::mem::take)
                    .collect();
                frame.registers[first] = Value::list(items);
            }
            Instruction::GrowFrame { size } => {
                let frame = self.active_mut()?;
                if frame.registers.len() < size as usize {
                    frame.resize_registers(size as usize);
                }
            }
            Instruction::Native { idx } => {
                let native = self
                    .world
                    .native(idx)
                    .ok_or_else(|| pool_miss("native", idx))?;
                native(self)?;
                // a native may fail through `raise_error` and still return Ok
                if let Some(err) = self.error() {
                    return Err(err.error.clone());
                }
            }

            Instruction::GetState { dst, name_idx } => {
                let name = program
                    .name_ref(name_idx)
                    .ok_or_else(|| pool_miss("name", name_idx))?;
                let frame = self.active()?;
                let value = if frame.is_stateful() {
                    state::read(&frame.incoming, name)
                } else {
                    Value::Null
                };
                self.set_register(dst, value)?;
            }
            Instruction::SaveState { name_idx, src } => {
                let name = program
                    .name_ref(name_idx)
                    .ok_or_else(|| pool_miss("name", name_idx))?;
                let value = self.register(src)?.clone();
                let frame = self.active_mut()?;
                if frame.is_stateful() {
                    state::write(&mut frame.outgoing, name, value);
                }
            }
            Instruction::RetainFrame => self.active_mut()?.retain = true,
            Instruction::Pause => return Ok(Flow::Pause),
            Instruction::Return => {
                return Ok(if self.leave(program)? {
                    Flow::Finish
                } else {
                    Flow::Reload
                });
            }
        }
        Ok(if instruction.leaves_frame() {
            Flow::Reload
        } else {
            Flow::Continue
        })
    }

    fn ints(&self, lhs: u16, rhs: u16) -> Result<(i64, i64), RuntimeError> {
        Ok((int_of(self.register(lhs)?)?, int_of(self.register(rhs)?)?))
    }

    fn floats(&self, lhs: u16, rhs: u16) -> Result<(f64, f64), RuntimeError> {
        Ok((float_of(self.register(lhs)?)?, float_of(self.register(rhs)?)?))
    }

    fn set_index(&mut self, container: u16, index: &Value, item: Value) -> Result<(), RuntimeError> {
        let target = self.register_mut(container)?;
        match target.tag() {
            ValueTag::Map => {
                let key = Key::from_value(index)
                    .ok_or_else(|| RuntimeError::type_mismatch("key", index.type_name()))?;
                if let Some(map) = target.map_mut() {
                    map.insert(key, item);
                }
                Ok(())
            }
            ValueTag::List | ValueTag::Record => {
                let i = int_of(index)?;
                let len = target.len().unwrap_or(0);
                let out_of_range = RuntimeError::IndexOutOfRange { index: i, len };
                let Some(slot) = usize::try_from(i).ok().filter(|&slot| slot < len) else {
                    return Err(out_of_range);
                };
                // record fields keep their declared types
                let item = match target.as_record() {
                    Some(record) => match record.ty.fields().get(slot) {
                        Some(field) => field.ty.cast(&item)?,
                        None => return Err(out_of_range),
                    },
                    None => item,
                };
                if target.set_index(slot, item) {
                    Ok(())
                } else {
                    Err(out_of_range)
                }
            }
            _ => Err(RuntimeError::type_mismatch("container", target.type_name())),
        }
    }

    /// Handle `Return`: cast the outputs, hand them to the caller and fold
    /// the frame's state into its parent. Returns `true` when the root frame
    /// returned.
    fn leave(&mut self, program: &Program) -> Result<bool, RuntimeError> {
        let frame = self.active()?;
        let mut outputs = Vec::with_capacity(program.signature.outputs.len());
        for (index, slot) in program.signature.outputs.iter().enumerate() {
            let value = frame.registers.get(slot.register as usize).ok_or_else(|| {
                RuntimeError::invariant(format!("output register r{} out of range", slot.register))
            })?;
            let placeholder = &slot.placeholder;
            let value = if value.is_null() && placeholder.optional {
                Value::Null
            } else {
                placeholder
                    .ty
                    .cast(value)
                    .map_err(|err| RuntimeError::OutputTypeMismatch {
                        block: program.name().to_owned(),
                        index,
                        expected: err.to,
                        got: err.from,
                    })?
            };
            outputs.push(value);
        }

        if frame.parent.is_none() {
            let frame = self.active_mut()?;
            for (slot, value) in program.signature.outputs.iter().zip(outputs) {
                frame.registers[slot.register as usize] = value;
            }
            let outgoing = std::mem::take(&mut frame.outgoing);
            self.state = if outgoing.is_empty() {
                Value::Null
            } else {
                Value::map(outgoing)
            };
            return Ok(true);
        }

        let child = self
            .pop_frame()
            .ok_or_else(|| RuntimeError::invariant("return without a frame"))?;
        let parent = self.active_mut()?;
        if let Some(key) = child.state_key {
            state::merge_outgoing(&mut parent.outgoing, key, child.outgoing);
        }
        if let Some(out) = child.return_to {
            let out = out as usize;
            if parent.registers.len() < out + outputs.len() {
                parent.resize_registers(out + outputs.len());
            }
            for (i, value) in outputs.into_iter().enumerate() {
                parent.registers[out + i] = value;
            }
        }
        Ok(false)
    }
}
