/// Bytecode opcodes.
///
/// Register operands are 8-bit by default. The [`Wide`](Op::Wide) prefix
/// promotes register operands to 16-bit. Pool indices (constants, blocks,
/// types, names, natives) and call-site indices are always 16-bit. Jump
/// offsets are always signed 16-bit, relative to the end of the instruction.
///
/// The [`ExtraWide`](Op::ExtraWide) prefix promotes operands to 32-bit.
/// Currently only used with [`LoadInt`](Op::LoadInt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Prefix: the next instruction uses 16-bit register/immediate operands.
    Wide = 0x00,

    /// Prefix: the next instruction uses 32-bit operands.
    /// Currently only valid before [`LoadInt`](Op::LoadInt).
    ExtraWide,

    /// Copy a constant pool entry into a register.
    /// Operands: `dst:u8` (wide: `u16`), `idx:u16`
    LoadConst,

    /// Load a small integer literal into a register.
    /// Operands: `dst:u8`, `value:i8` (wide: `u16`, `i16`; extra-wide: `u16`, `i32`)
    LoadInt,

    /// Operands: `dst:u8` (wide: `u16`)
    SetNull,

    /// Operands: `dst:u8` (wide: `u16`)
    SetEmptyList,

    /// Value-preserving duplicate, shares container buffers.
    /// Operands: `dst:u8` (wide: `u16`), `src:u8` (wide: `u16`)
    Copy,

    /// Ownership transfer; the source register is poisoned.
    /// Operands: `dst:u8` (wide: `u16`), `src:u8` (wide: `u16`)
    Move,

    /// Operands: `a:u8` (wide: `u16`), `b:u8` (wide: `u16`)
    Swap,

    /// Cast `src` to a type pool entry and store it in `dst`.
    /// Operands: `dst:u8`, `src:u8` (wide: `u16`), `type_idx:u16`
    Cast,

    /// Integer fast paths. Operands: `dst`, `lhs`, `rhs` registers.
    AddInt,
    SubInt,
    MulInt,
    DivInt,

    /// Float fast paths. Operands: `dst`, `lhs`, `rhs` registers.
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,

    /// Structural equality. Operands: `dst`, `lhs`, `rhs` registers.
    Equals,

    /// Numeric comparison. Operands: `dst`, `lhs`, `rhs` registers.
    LessThan,

    /// Add one to an integer register in place.
    /// Operands: `reg:u8` (wide: `u16`)
    Increment,

    /// Operands: `dst`, `container`, `index` registers.
    GetIndex,

    /// Operands: `container`, `index`, `src` registers.
    SetIndex,

    /// Operands: `list`, `src` registers.
    Append,

    /// Operands: `dst`, `container` registers.
    Length,

    /// Unconditional relative jump.
    /// Operands: `offset:i16`
    Jump,

    /// Jump if the condition register holds `true`.
    /// Operands: `cond:u8` (wide: `u16`), `offset:i16`
    JumpIf,

    /// Jump if the condition register holds `false`.
    /// Operands: `cond:u8` (wide: `u16`), `offset:i16`
    JumpIfNot,

    /// Jump if the integer `index` is at or past the length of `container`.
    /// Operands: `index:u8`, `container:u8` (wide: `u16`), `offset:i16`
    JumpIfDone,

    /// Call a block. Arguments live in `base..base+argc`, outputs are written
    /// to `out..`.
    /// Operands: `block_idx:u16`, `base:u8` (wide: `u16`), `argc:u8`, `out:u8` (wide: `u16`)
    Call,

    /// Like [`Call`](Op::Call), and the child frame threads persistent state
    /// under the key held in the `key` register.
    /// Operands: `block_idx:u16`, `base`, `argc:u8`, `out`, `key`
    CallKeyed,

    /// Call the closure held in `base` with arguments `base+1..base+1+argc`.
    /// Operands: `base:u8` (wide: `u16`), `argc:u8`, `out:u8` (wide: `u16`)
    CallFunc,

    /// Call the closure held in `func` with the items of the list in `args`
    /// as its arguments.
    /// Operands: `func`, `args`, `out` registers
    CallFuncApply,

    /// Dynamically dispatched call on the runtime type of `base`.
    /// Operands: `name_idx:u16`, `base`, `argc:u8`, `out`, `site:u16`
    CallMethod,

    /// Create a closure binding `first..first+count`.
    /// Operands: `dst`, `block_idx:u16`, `first`, `count:u8`
    MakeFunc,

    /// Copy the frame's closure bindings into `first..first+count`.
    /// Operands: `first:u8` (wide: `u16`), `count:u8`
    SplatBindings,

    /// Collapse inputs from `first` onward into a single list at `first`.
    /// Operands: `first:u8` (wide: `u16`)
    VarargsToList,

    /// Resize the active frame's register file.
    /// Operands: `size:u16`
    GrowFrame,

    /// Invoke a host function by native table index.
    /// Operands: `idx:u16`
    Native,

    /// Read the frame's incoming state under a name.
    /// Operands: `dst:u8` (wide: `u16`), `name_idx:u16`
    GetState,

    /// Write the frame's outgoing state under a name.
    /// Operands: `name_idx:u16`, `src:u8` (wide: `u16`)
    SaveState,

    /// Keep a snapshot of the active frame after it is popped.
    RetainFrame,

    /// Suspend execution, returning control to the host.
    Pause,

    /// Finish the active frame, handing its outputs to the caller.
    Return,
}

impl Op {
    pub const COUNT: usize = Op::Return as usize + 1;

    /// Whether this opcode has operands affected by the `Wide` or `ExtraWide`
    /// prefix.
    pub const fn has_scalable_operands(self) -> bool {
        !matches!(
            self,
            Op::Wide
                | Op::ExtraWide
                | Op::Jump
                | Op::GrowFrame
                | Op::Native
                | Op::RetainFrame
                | Op::Pause
                | Op::Return
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
