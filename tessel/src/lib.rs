//! Tessel: a small register-bytecode runtime for dataflow programs.
//!
//! A [`World`] owns blocks, their compiled [`Program`]s, natives and types.
//! A [`Stack`] runs programs against it, threading a persistent state tree
//! through keyed calls and caching method lookups per call site.

mod block;
mod buffer;
pub mod cache;
mod dispatch;
mod error;
mod frame;
mod interpreter;
mod module;
mod native;
mod program;
mod stack;
pub mod state;
pub mod types;
pub mod value;
mod world;

pub use block::{Block, BlockId, Lowering, NativeBody, OutputSlot, Placeholder, Signature};
pub use buffer::{Buffer, live_buffers};
pub use cache::{CACHE_LINES, CacheStats};
pub use dispatch::resolve;
pub use error::{CastError, CompileError, ErrorKind, Result, RuntimeError, StateError};
pub use frame::{Frame, FrameInfo, Pc, RetainedFrame};
pub use module::{Member, Module};
pub use native::{NativeDesc, NativeFn, NativeTable, default_natives};
pub use program::{Program, ProgramBuilder, ProgramIndex};
pub use stack::{
    CancelHandle, MAX_FRAMES, ResetPolicy, RunOutcome, RunPhase, Stack, StackCreateInfo,
    StackError,
};
pub use types::{Type, TypeId, TypeRegistry};
pub use value::{Closure, Key, Opaque, Record, Value, ValueTag};
pub use world::{World, WorldCreateInfo};
