use crate::op::Op;

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`] and the conditional variants.
/// Resolve it with [`BytecodeBuilder::bind`].
#[derive(Debug)]
#[must_use = "an unbound label leaves a zero jump offset in the stream"]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the jump instruction (base for relative offset).
    base: usize,
}

/// Builds a bytecode byte sequence.
///
/// The builder automatically emits the [`Op::Wide`] prefix when any register
/// operand of an instruction exceeds `u8::MAX`.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    /// Emits `op`, preceded by `Wide` when one of `regs` does not fit a byte.
    /// Returns whether the wide encoding was selected.
    fn emit_scaled(&mut self, op: Op, regs: &[u16]) -> bool {
        let wide = regs.iter().any(|&reg| reg > u8::MAX as u16);
        if wide {
            self.emit_op(Op::Wide);
        }
        self.emit_op(op);
        wide
    }

    fn emit_reg(&mut self, reg: u16, wide: bool) {
        if wide {
            self.emit_u16(reg);
        } else {
            self.emit_u8(reg as u8);
        }
    }

    fn emit_unary(&mut self, op: Op, reg: u16) {
        let wide = self.emit_scaled(op, &[reg]);
        self.emit_reg(reg, wide);
    }

    fn emit_pair(&mut self, op: Op, a: u16, b: u16) {
        let wide = self.emit_scaled(op, &[a, b]);
        self.emit_reg(a, wide);
        self.emit_reg(b, wide);
    }

    fn emit_triple(&mut self, op: Op, a: u16, b: u16, c: u16) {
        let wide = self.emit_scaled(op, &[a, b, c]);
        self.emit_reg(a, wide);
        self.emit_reg(b, wide);
        self.emit_reg(c, wide);
    }

    // ── register transfer ──────────────────────────────────────────

    /// `LoadConst <dst> <idx:u16>`
    pub fn load_const(&mut self, dst: u16, idx: u16) {
        let wide = self.emit_scaled(Op::LoadConst, &[dst]);
        self.emit_reg(dst, wide);
        self.emit_u16(idx);
    }

    /// `LoadInt <dst> <value>`: load a small integer into a register.
    ///
    /// Selects 8-bit, 16-bit (`Wide`), or 32-bit (`ExtraWide`) encoding
    /// based on the value and the register.
    pub fn load_int(&mut self, dst: u16, value: i32) {
        let narrow_reg = dst <= u8::MAX as u16;
        match i8::try_from(value) {
            Ok(v) if narrow_reg => {
                self.emit_op(Op::LoadInt);
                self.emit_u8(dst as u8);
                self.emit_u8(v as u8);
                return;
            }
            _ => {}
        }
        if let Ok(v) = i16::try_from(value) {
            self.emit_op(Op::Wide);
            self.emit_op(Op::LoadInt);
            self.emit_u16(dst);
            self.emit_i16(v);
        } else {
            self.emit_op(Op::ExtraWide);
            self.emit_op(Op::LoadInt);
            self.emit_u16(dst);
            self.emit_i32(value);
        }
    }

    /// `SetNull <dst>`
    pub fn set_null(&mut self, dst: u16) {
        self.emit_unary(Op::SetNull, dst);
    }

    /// `SetEmptyList <dst>`
    pub fn set_empty_list(&mut self, dst: u16) {
        self.emit_unary(Op::SetEmptyList, dst);
    }

    /// `Copy <dst> <src>`
    pub fn copy(&mut self, dst: u16, src: u16) {
        self.emit_pair(Op::Copy, dst, src);
    }

    /// `Move <dst> <src>`: leaves `src` poisoned.
    pub fn move_(&mut self, dst: u16, src: u16) {
        self.emit_pair(Op::Move, dst, src);
    }

    /// `Swap <a> <b>`
    pub fn swap(&mut self, a: u16, b: u16) {
        self.emit_pair(Op::Swap, a, b);
    }

    /// `Cast <dst> <src> <type_idx:u16>`
    pub fn cast(&mut self, dst: u16, src: u16, type_idx: u16) {
        self.emit_pair(Op::Cast, dst, src);
        self.emit_u16(type_idx);
    }

    // ── arithmetic ─────────────────────────────────────────────────

    pub fn add_int(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::AddInt, dst, lhs, rhs);
    }

    pub fn sub_int(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::SubInt, dst, lhs, rhs);
    }

    pub fn mul_int(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::MulInt, dst, lhs, rhs);
    }

    pub fn div_int(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::DivInt, dst, lhs, rhs);
    }

    pub fn add_float(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::AddFloat, dst, lhs, rhs);
    }

    pub fn sub_float(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::SubFloat, dst, lhs, rhs);
    }

    pub fn mul_float(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::MulFloat, dst, lhs, rhs);
    }

    pub fn div_float(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::DivFloat, dst, lhs, rhs);
    }

    pub fn equals(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::Equals, dst, lhs, rhs);
    }

    pub fn less_than(&mut self, dst: u16, lhs: u16, rhs: u16) {
        self.emit_triple(Op::LessThan, dst, lhs, rhs);
    }

    pub fn increment(&mut self, reg: u16) {
        self.emit_unary(Op::Increment, reg);
    }

    // ── containers ─────────────────────────────────────────────────

    /// `GetIndex <dst> <container> <index>`
    pub fn get_index(&mut self, dst: u16, container: u16, index: u16) {
        self.emit_triple(Op::GetIndex, dst, container, index);
    }

    /// `SetIndex <container> <index> <src>`
    pub fn set_index(&mut self, container: u16, index: u16, src: u16) {
        self.emit_triple(Op::SetIndex, container, index, src);
    }

    /// `Append <list> <src>`
    pub fn append(&mut self, list: u16, src: u16) {
        self.emit_pair(Op::Append, list, src);
    }

    /// `Length <dst> <container>`
    pub fn length(&mut self, dst: u16, container: u16) {
        self.emit_pair(Op::Length, dst, container);
    }

    // ── calls ──────────────────────────────────────────────────────

    /// `Call <block_idx:u16> <base> <argc:u8> <out>`
    pub fn call(&mut self, block_idx: u16, base: u16, argc: u8, out: u16) {
        let wide = self.emit_scaled(Op::Call, &[base, out]);
        self.emit_u16(block_idx);
        self.emit_reg(base, wide);
        self.emit_u8(argc);
        self.emit_reg(out, wide);
    }

    /// `CallKeyed <block_idx:u16> <base> <argc:u8> <out> <key>`
    pub fn call_keyed(
        &mut self,
        block_idx: u16,
        base: u16,
        argc: u8,
        out: u16,
        key: u16,
    ) {
        let wide = self.emit_scaled(Op::CallKeyed, &[base, out, key]);
        self.emit_u16(block_idx);
        self.emit_reg(base, wide);
        self.emit_u8(argc);
        self.emit_reg(out, wide);
        self.emit_reg(key, wide);
    }

    /// `CallFunc <base> <argc:u8> <out>`: the closure lives in `base`.
    pub fn call_func(&mut self, base: u16, argc: u8, out: u16) {
        let wide = self.emit_scaled(Op::CallFunc, &[base, out]);
        self.emit_reg(base, wide);
        self.emit_u8(argc);
        self.emit_reg(out, wide);
    }

    /// `CallFuncApply <func> <args> <out>`: spreads the list in `args` over
    /// the closure's inputs.
    pub fn call_func_apply(&mut self, func: u16, args: u16, out: u16) {
        self.emit_triple(Op::CallFuncApply, func, args, out);
    }

    /// `CallMethod <name_idx:u16> <base> <argc:u8> <out> <site:u16>`.
    ///
    /// The receiver is argument 0, in `base`.
    pub fn call_method(
        &mut self,
        name_idx: u16,
        base: u16,
        argc: u8,
        out: u16,
        site: u16,
    ) {
        let wide = self.emit_scaled(Op::CallMethod, &[base, out]);
        self.emit_u16(name_idx);
        self.emit_reg(base, wide);
        self.emit_u8(argc);
        self.emit_reg(out, wide);
        self.emit_u16(site);
    }

    /// `MakeFunc <dst> <block_idx:u16> <first> <count:u8>`
    pub fn make_func(&mut self, dst: u16, block_idx: u16, first: u16, count: u8) {
        let wide = self.emit_scaled(Op::MakeFunc, &[dst, first]);
        self.emit_reg(dst, wide);
        self.emit_u16(block_idx);
        self.emit_reg(first, wide);
        self.emit_u8(count);
    }

    /// `SplatBindings <first> <count:u8>`
    pub fn splat_bindings(&mut self, first: u16, count: u8) {
        let wide = self.emit_scaled(Op::SplatBindings, &[first]);
        self.emit_reg(first, wide);
        self.emit_u8(count);
    }

    /// `VarargsToList <first>`
    pub fn varargs_to_list(&mut self, first: u16) {
        self.emit_unary(Op::VarargsToList, first);
    }

    /// `GrowFrame <size:u16>`
    pub fn grow_frame(&mut self, size: u16) {
        self.emit_op(Op::GrowFrame);
        self.emit_u16(size);
    }

    /// `Native <idx:u16>`
    pub fn native(&mut self, idx: u16) {
        self.emit_op(Op::Native);
        self.emit_u16(idx);
    }

    // ── state ──────────────────────────────────────────────────────

    /// `GetState <dst> <name_idx:u16>`
    pub fn get_state(&mut self, dst: u16, name_idx: u16) {
        let wide = self.emit_scaled(Op::GetState, &[dst]);
        self.emit_reg(dst, wide);
        self.emit_u16(name_idx);
    }

    /// `SaveState <name_idx:u16> <src>`
    pub fn save_state(&mut self, name_idx: u16, src: u16) {
        let wide = self.emit_scaled(Op::SaveState, &[src]);
        self.emit_u16(name_idx);
        self.emit_reg(src, wide);
    }

    pub fn retain_frame(&mut self) {
        self.emit_op(Op::RetainFrame);
    }

    pub fn pause(&mut self) {
        self.emit_op(Op::Pause);
    }

    pub fn return_(&mut self) {
        self.emit_op(Op::Return);
    }

    // ── jumps ──────────────────────────────────────────────────────

    /// Emit an unconditional forward jump. Returns a [`Label`] that must be
    /// resolved later with [`bind`](Self::bind).
    pub fn jump(&mut self) -> Label {
        self.emit_op(Op::Jump);
        self.emit_offset_placeholder()
    }

    /// Emit a forward jump taken when `cond` holds `true`.
    pub fn jump_if(&mut self, cond: u16) -> Label {
        self.emit_unary(Op::JumpIf, cond);
        self.emit_offset_placeholder()
    }

    /// Emit a forward jump taken when `cond` holds `false`.
    pub fn jump_if_not(&mut self, cond: u16) -> Label {
        self.emit_unary(Op::JumpIfNot, cond);
        self.emit_offset_placeholder()
    }

    /// Emit a forward jump taken once `index` reaches the length of
    /// `container`.
    pub fn jump_if_done(&mut self, index: u16, container: u16) -> Label {
        self.emit_pair(Op::JumpIfDone, index, container);
        self.emit_offset_placeholder()
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as isize - label.base as isize) as i16;
        self.buf[label.offset_pos..label.offset_pos + 2]
            .copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit an unconditional backward jump to `target` (a byte offset obtained
    /// from [`current_offset`](Self::current_offset)).
    pub fn jump_back(&mut self, target: usize) {
        self.emit_op(Op::Jump);
        self.emit_back_offset(target);
    }

    /// Emit a backward jump to `target` taken when `cond` holds `true`.
    pub fn jump_back_if(&mut self, cond: u16, target: usize) {
        self.emit_unary(Op::JumpIf, cond);
        self.emit_back_offset(target);
    }

    /// Emit a backward jump to `target` taken when `cond` holds `false`.
    pub fn jump_back_if_not(&mut self, cond: u16, target: usize) {
        self.emit_unary(Op::JumpIfNot, cond);
        self.emit_back_offset(target);
    }

    fn emit_back_offset(&mut self, target: usize) {
        let base = self.buf.len() + 2;
        let offset = (target as isize - base as isize) as i16;
        self.emit_i16(offset);
    }

    fn emit_offset_placeholder(&mut self) -> Label {
        let offset_pos = self.buf.len();
        self.emit_i16(0); // placeholder
        let base = self.buf.len();
        Label { offset_pos, base }
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
