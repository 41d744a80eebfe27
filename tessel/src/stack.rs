//! Execution stacks: the frames of one running program plus everything that
//! persists between runs (state tree, env, caches, entropy).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use indexmap::IndexMap;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::cache::{CacheStats, InlineCaches};
use crate::error::ErrorKind;
use crate::frame::{Frame, FrameInfo, Pc, RetainedFrame};
use crate::{BlockId, Key, RuntimeError, Value, World, state};

static NEXT_STACK_ID: AtomicU64 = AtomicU64::new(1);

/// Default maximum frame depth.
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug, Clone)]
pub struct StackCreateInfo {
    pub max_frames: usize,
    pub inline_cache: bool,
    /// Seed of the generator behind the `rand` native.
    pub seed: u64,
    /// Register vectors kept around for reuse by later frames.
    pub register_pool: usize,
}

impl Default for StackCreateInfo {
    fn default() -> Self {
        Self {
            max_frames: MAX_FRAMES,
            inline_cache: true,
            seed: 0x5eed,
            register_pool: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Ready,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    /// Hit a `Pause`; `run` again to resume.
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    KeepState,
    DiscardState,
}

/// The error that ended a run and where it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct StackError {
    pub error: RuntimeError,
    pub frame: usize,
    pub block: Option<BlockId>,
    pub pc: Pc,
}

impl StackError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

/// Stops a running stack from another thread. The loop notices before its
/// next instruction.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How a new frame hangs off its caller.
#[derive(Debug, Default)]
pub(crate) struct Link {
    pub return_to: Option<u16>,
    pub key: Option<Key>,
    pub bindings: Vec<Value>,
}

impl Link {
    pub fn returning_to(out: u16) -> Self {
        Self {
            return_to: Some(out),
            ..Self::default()
        }
    }
}

pub struct Stack {
    id: u64,
    pub(crate) world: Arc<World>,
    pub(crate) frames: Vec<Frame>,
    pool: Vec<Vec<Value>>,
    pub(crate) state: Value,
    pub(crate) caches: InlineCaches,
    error: Option<StackError>,
    pub(crate) phase: RunPhase,
    rng: StdRng,
    retained: Vec<RetainedFrame>,
    env: IndexMap<Key, Value>,
    /// Channels the host is listening on. A channel that is not expected
    /// drops what is emitted to it.
    messages: IndexMap<Key, Vec<Value>>,
    pub(crate) cancel: Arc<AtomicBool>,
    /// How the last run ended, reported again by `run` on a finished stack.
    pub(crate) last_outcome: Option<RunOutcome>,
    pub(crate) info: StackCreateInfo,
}

impl Stack {
    pub fn new(world: Arc<World>, info: StackCreateInfo) -> Self {
        Self {
            id: NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed),
            world,
            frames: Vec::new(),
            pool: Vec::new(),
            state: Value::Null,
            caches: InlineCaches::default(),
            error: None,
            phase: RunPhase::Ready,
            rng: StdRng::seed_from_u64(info.seed),
            retained: Vec::new(),
            env: IndexMap::new(),
            messages: IndexMap::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            last_outcome: None,
            info,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    // ── frames ─────────────────────────────────────────────────────

    /// Push `block` with `inputs` on top of the stack. On a finished stack
    /// this starts a new run from an empty frame list, and a cancellation
    /// of the previous run no longer applies.
    pub fn push_frame(&mut self, block: BlockId, inputs: Vec<Value>) -> Result<(), RuntimeError> {
        if self.phase == RunPhase::Finished {
            self.start_over();
        }
        self.enter(block, inputs, Link::default())
    }

    fn start_over(&mut self) {
        self.clear_frames();
        self.error = None;
        self.phase = RunPhase::Ready;
        self.last_outcome = None;
        self.cancel.store(false, Ordering::Release);
    }

    /// Check arguments against `block`'s signature and push a frame for it.
    /// Nothing is pushed or written when the check fails.
    pub(crate) fn enter(
        &mut self,
        block: BlockId,
        mut args: Vec<Value>,
        link: Link,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.info.max_frames {
            return Err(RuntimeError::StackOverflow {
                depth: self.frames.len(),
            });
        }
        let index = self.world.compile_block(block)?;
        let program = self.world.program(index)?;
        let signature = &program.signature;

        let got = args.len();
        if got < signature.required_inputs()
            || (got > signature.inputs.len() && !signature.variadic)
        {
            return Err(RuntimeError::ArityMismatch {
                block: signature.name.to_string(),
                expected: signature.inputs.len(),
                got,
            });
        }
        for (i, arg) in args.iter_mut().enumerate() {
            let Some(placeholder) = signature.input_placeholder(i) else {
                continue;
            };
            if arg.is_null() && placeholder.optional {
                continue;
            }
            *arg = placeholder.ty.cast(arg)?;
        }

        let mut registers = self.pool.pop().unwrap_or_default();
        registers.clear();
        registers.resize(program.registers.max(got), Value::Null);
        for (slot, arg) in registers.iter_mut().zip(args) {
            *slot = arg;
        }

        let mut frame = Frame::new(block, index, program.version, registers);
        frame.parent = self.frames.len().checked_sub(1);
        frame.incoming = match (frame.parent, &link.key) {
            (None, _) => self.state.clone(),
            (Some(parent), Some(key)) => state::child_incoming(&self.frames[parent].incoming, key),
            (Some(_), None) => Value::Null,
        };
        frame.state_key = link.key;
        frame.bindings = link.bindings;
        frame.return_to = link.return_to;
        frame.input_count = got;
        frame.pc.node = program.node_at(0);
        log::trace!(
            "push '{}' at depth {} ({} registers)",
            program.name(),
            self.frames.len(),
            frame.registers.len()
        );
        self.frames.push(frame);
        Ok(())
    }

    /// Remove the active frame, snapshotting it first if it was retained.
    /// Its register vector goes back to the pool.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        let mut frame = self.frames.pop()?;
        if frame.retain {
            self.retained.push(RetainedFrame {
                block: frame.block,
                registers: frame.registers.clone(),
                incoming: frame.incoming.clone(),
                outgoing: frame.outgoing.clone(),
            });
        }
        let mut registers = std::mem::take(&mut frame.registers);
        if self.pool.len() < self.info.register_pool {
            registers.clear();
            self.pool.push(registers);
        }
        log::trace!("pop {} at depth {}", frame.block, self.frames.len());
        Some(frame)
    }

    fn clear_frames(&mut self) {
        while self.pop_frame().is_some() {}
    }

    pub fn resize_registers(&mut self, count: usize) -> Result<(), RuntimeError> {
        self.active_mut()?.resize_registers(count);
        Ok(())
    }

    pub(crate) fn active(&self) -> Result<&Frame, RuntimeError> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::invariant("no active frame"))
    }

    pub(crate) fn active_mut(&mut self) -> Result<&mut Frame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::invariant("no active frame"))
    }

    /// Read a register of the active frame.
    pub(crate) fn register(&self, reg: u16) -> Result<&Value, RuntimeError> {
        let value = self
            .active()?
            .registers
            .get(reg as usize)
            .ok_or_else(|| RuntimeError::invariant(format!("register r{reg} out of range")))?;
        if cfg!(debug_assertions) && value.is_moved() {
            return Err(RuntimeError::invariant(format!("read of moved register r{reg}")));
        }
        Ok(value)
    }

    pub(crate) fn register_mut(&mut self, reg: u16) -> Result<&mut Value, RuntimeError> {
        self.active_mut()?
            .registers
            .get_mut(reg as usize)
            .ok_or_else(|| RuntimeError::invariant(format!("register r{reg} out of range")))
    }

    pub(crate) fn set_register(&mut self, reg: u16, value: Value) -> Result<(), RuntimeError> {
        *self.register_mut(reg)? = value;
        Ok(())
    }

    /// Copies of `count` registers starting at `base`.
    pub(crate) fn arguments(&self, base: u16, count: usize) -> Result<Vec<Value>, RuntimeError> {
        (0..count)
            .map(|i| self.register(offset_register(base, i)?).cloned())
            .collect()
    }

    // ── host access ────────────────────────────────────────────────

    /// Input `index` of the active frame, i.e. its register `index`.
    pub fn input(&self, index: usize) -> Option<&Value> {
        self.frames.last()?.registers.get(index)
    }

    pub fn input_count(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.input_count)
    }

    pub fn set_input(&mut self, index: usize, value: Value) -> Result<(), RuntimeError> {
        let slot = self
            .active_mut()?
            .registers
            .get_mut(index)
            .ok_or_else(|| RuntimeError::invariant(format!("input {index} out of range")))?;
        *slot = value;
        Ok(())
    }

    fn output_register(&self, index: usize) -> Option<usize> {
        let frame = self.frames.last()?;
        let block = self.world.block(frame.block).ok()?;
        let slot = block.signature.outputs.get(index)?;
        Some(slot.register as usize)
    }

    /// Output `index` of the active frame: the register its block declares
    /// for that output.
    pub fn output(&self, index: usize) -> Option<&Value> {
        let reg = self.output_register(index)?;
        self.frames.last()?.registers.get(reg)
    }

    pub fn set_output(&mut self, index: usize, value: Value) -> Result<(), RuntimeError> {
        let reg = self
            .output_register(index)
            .ok_or_else(|| RuntimeError::invariant(format!("output {index} not declared")))?;
        let frame = self.active_mut()?;
        if frame.registers.len() <= reg {
            frame.resize_registers(reg + 1);
        }
        frame.registers[reg] = value;
        Ok(())
    }

    /// All declared outputs of the active frame, in order.
    pub fn outputs(&self) -> Vec<Value> {
        (0..)
            .map_while(|i| self.output_register(i).map(|_| self.output(i).cloned().unwrap_or_default()))
            .collect()
    }

    /// Fail the current run with `message`. The message is also left as an
    /// error value in the active frame's first output.
    pub fn raise_error(&mut self, message: &str) -> RuntimeError {
        let error = RuntimeError::HostRaised(message.to_owned());
        if self.output_register(0).is_some() {
            let _ = self.set_output(0, Value::error(message));
        }
        self.record_error(error.clone());
        error
    }

    pub(crate) fn record_error(&mut self, error: RuntimeError) {
        let frame = self.frames.len().saturating_sub(1);
        let (block, pc) = match self.frames.last() {
            Some(f) => {
                let node = self
                    .world
                    .program(f.program)
                    .ok()
                    .and_then(|p| p.node_at(f.pc.offset));
                (Some(f.block), Pc { offset: f.pc.offset, node })
            }
            None => (None, Pc::default()),
        };
        log::debug!("stack {} failed in frame {frame}: {error}", self.id);
        self.error = Some(StackError {
            error,
            frame,
            block,
            pc,
        });
        self.phase = RunPhase::Finished;
    }

    pub fn error_occurred(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&StackError> {
        self.error.as_ref()
    }

    // ── lifecycle ──────────────────────────────────────────────────

    /// Drop all frames and errors so the stack can be run again.
    pub fn reset(&mut self, policy: ResetPolicy) {
        self.start_over();
        self.retained.clear();
        if policy == ResetPolicy::DiscardState {
            self.state = Value::Null;
        }
    }

    /// An independent copy of this stack: frames, state, env, phase and
    /// generator position. The copy gets its own id and cancel flag.
    pub fn duplicate(&self) -> Stack {
        Stack {
            id: NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed),
            world: self.world.clone(),
            frames: self.frames.clone(),
            pool: Vec::new(),
            state: self.state.clone(),
            caches: self.caches.clone(),
            error: self.error.clone(),
            phase: self.phase,
            rng: self.rng.clone(),
            retained: self.retained.clone(),
            env: self.env.clone(),
            messages: self.messages.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            last_outcome: self.last_outcome,
            info: self.info.clone(),
        }
    }

    /// Push `block`, run it to completion and return its outputs. The frame
    /// is popped afterwards.
    pub fn call(&mut self, block: BlockId, inputs: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        self.push_frame(block, inputs)?;
        match self.run()? {
            RunOutcome::Finished => {
                let outputs = self.outputs();
                self.clear_frames();
                self.phase = RunPhase::Ready;
                Ok(outputs)
            }
            outcome => Err(RuntimeError::invariant(format!(
                "'{block}' did not finish: {outcome:?}"
            ))),
        }
    }

    /// Frames from the root up, with their resolved source nodes.
    pub fn frame_list(&self) -> Vec<FrameInfo> {
        self.frames
            .iter()
            .enumerate()
            .map(|(depth, frame)| {
                let program = self.world.program(frame.program).ok();
                FrameInfo {
                    block: frame.block,
                    name: program
                        .as_ref()
                        .map(|p| p.name().to_owned())
                        .unwrap_or_default(),
                    pc: Pc {
                        offset: frame.pc.offset,
                        node: program.and_then(|p| p.node_at(frame.pc.offset)),
                    },
                    depth,
                }
            })
            .collect()
    }

    // ── migration ──────────────────────────────────────────────────

    /// Rebind the stack to a new main block. Frames and any pending error
    /// are dropped; state, env and message channels carry over. The new
    /// root is pushed with `inputs` and is ready to run.
    pub fn migrate_to(&mut self, block: BlockId, inputs: Vec<Value>) -> Result<(), RuntimeError> {
        self.change_main(block, inputs, Vec::new())
    }

    /// [`migrate_to`](Self::migrate_to) a closure. Its bindings become the
    /// root frame's bindings.
    pub fn migrate_to_func(&mut self, func: &Value, inputs: Vec<Value>) -> Result<(), RuntimeError> {
        let closure = func
            .as_func()
            .ok_or_else(|| RuntimeError::type_mismatch("func", func.type_name()))?;
        let (block, bindings) = (closure.block, closure.bindings.clone());
        self.change_main(block, inputs, bindings)
    }

    /// Code that lived in `old` now lives in `new`. Closures over `old` in
    /// the state tree are rebound, and a root frame running `old` starts
    /// over as `new` with the same inputs.
    pub fn migrate(&mut self, old: BlockId, new: BlockId) -> Result<(), RuntimeError> {
        state::rebind_blocks(&mut self.state, old, new);
        let Some(root) = self.frames.first().filter(|root| root.block == old) else {
            return Ok(());
        };
        let inputs = root.registers.iter().take(root.input_count).cloned().collect();
        let bindings = root.bindings.clone();
        self.change_main(new, inputs, bindings)
    }

    fn change_main(
        &mut self,
        block: BlockId,
        inputs: Vec<Value>,
        bindings: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        self.start_over();
        self.retained.clear();
        log::debug!("stack {} now runs {block}", self.id);
        let link = Link {
            bindings,
            ..Link::default()
        };
        self.enter(block, inputs, link)
    }

    // ── message channels ───────────────────────────────────────────

    /// Start collecting messages emitted on `channel`. Expecting a channel
    /// again drops whatever it held.
    pub fn expect_messages(&mut self, channel: impl Into<Key>) {
        self.messages.insert(channel.into(), Vec::new());
    }

    /// Everything emitted on `channel` since it was expected. The channel
    /// stops collecting until it is expected again.
    pub fn consume_messages(&mut self, channel: &Key) -> Result<Vec<Value>, RuntimeError> {
        self.messages.shift_remove(channel).ok_or_else(|| {
            RuntimeError::HostRaised(format!("message channel was not expected: {channel}"))
        })
    }

    /// Queue `message` on `channel`. Returns `false` and drops the message
    /// when nobody expects that channel.
    pub fn emit(&mut self, channel: &Key, message: Value) -> bool {
        match self.messages.get_mut(channel) {
            Some(queue) => {
                queue.push(message);
                true
            }
            None => {
                log::trace!("stack {} dropped message on '{channel}'", self.id);
                false
            }
        }
    }

    // ── state, env, entropy ────────────────────────────────────────

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Replace the persistent state tree. Takes effect for the next root
    /// frame pushed.
    pub fn set_state(&mut self, tree: Value) {
        self.state = tree;
    }

    pub fn env(&self, key: &Key) -> Option<&Value> {
        self.env.get(key)
    }

    pub fn set_env(&mut self, key: impl Into<Key>, value: Value) {
        self.env.insert(key.into(), value);
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.caches.stats
    }

    pub fn retained(&self) -> &[RetainedFrame] {
        &self.retained
    }

    pub fn take_retained(&mut self) -> Vec<RetainedFrame> {
        std::mem::take(&mut self.retained)
    }
}

/// Register `by` slots past `base`.
pub(crate) fn offset_register(base: u16, by: usize) -> Result<u16, RuntimeError> {
    u16::try_from(by)
        .ok()
        .and_then(|by| base.checked_add(by))
        .ok_or_else(|| RuntimeError::invariant(format!("register r{base}+{by} out of range")))
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("id", &self.id)
            .field("depth", &self.frames.len())
            .field("phase", &self.phase)
            .field("error", &self.error)
            .finish()
    }
}
