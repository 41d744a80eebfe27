use thiserror::Error;

use crate::instruction::Instruction;
use crate::op::Op;

/// Operand width selected by an optional prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Width {
    Normal = 0,
    Wide = 1,
    ExtraWide = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("bytecode truncated at offset {0}")]
    Truncated(usize),
    #[error("invalid opcode 0x{byte:02x} at offset {offset}")]
    InvalidOpcode { byte: u8, offset: usize },
    #[error("prefix not valid before {op:?} at offset {offset}")]
    InvalidPrefix { op: Op, offset: usize },
}

/// Decode the instruction starting at `pc`. Returns the instruction and the
/// offset of the instruction that follows it.
pub fn decode_at(
    bytes: &[u8],
    pc: usize,
) -> Result<(Instruction, usize), DecodeError> {
    let mut decoder = BytecodeDecoder { bytes, pos: pc };
    let instr = decoder.decode()?;
    Ok((instr, decoder.pos))
}

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Every read is bounds-checked, so malformed or truncated bytecode yields a
/// [`DecodeError`] instead of reading past the slice.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Whether the decoder has reached the end of the bytecode.
    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Option<Result<Instruction, DecodeError>> {
        if self.is_at_end() {
            return None;
        }
        let result = self.decode();
        if result.is_err() {
            // stop iterating after the first malformed instruction
            self.pos = self.bytes.len();
        }
        Some(result)
    }

    fn decode(&mut self) -> Result<Instruction, DecodeError> {
        let start = self.pos;
        let op = self.read_op()?;

        match op {
            Op::Wide => {
                let next = self.read_op()?;
                if !next.has_scalable_operands() {
                    return Err(DecodeError::InvalidPrefix {
                        op: next,
                        offset: start,
                    });
                }
                self.decode_op(next, Width::Wide, start)
            }
            Op::ExtraWide => {
                let next = self.read_op()?;
                if next != Op::LoadInt {
                    return Err(DecodeError::InvalidPrefix {
                        op: next,
                        offset: start,
                    });
                }
                self.decode_op(next, Width::ExtraWide, start)
            }
            _ => self.decode_op(op, Width::Normal, start),
        }
    }

    fn decode_op(
        &mut self,
        op: Op,
        width: Width,
        start: usize,
    ) -> Result<Instruction, DecodeError> {
        let wide = width as u8 >= Width::Wide as u8;

        let instr = match op {
            Op::Wide | Op::ExtraWide => {
                return Err(DecodeError::InvalidPrefix { op, offset: start });
            }

            Op::LoadConst => {
                let dst = self.read_reg(wide)?;
                let idx = self.read_u16()?;
                Instruction::LoadConst { dst, idx }
            }

            Op::LoadInt => {
                let dst = self.read_reg(wide)?;
                let value = match width {
                    Width::Normal => self.read_u8()? as i8 as i32,
                    Width::Wide => self.read_i16()? as i32,
                    Width::ExtraWide => self.read_i32()?,
                };
                Instruction::LoadInt { dst, value }
            }

            Op::SetNull => Instruction::SetNull { dst: self.read_reg(wide)? },
            Op::SetEmptyList => Instruction::SetEmptyList {
                dst: self.read_reg(wide)?,
            },

            Op::Copy => {
                let (dst, src) = self.read_pair(wide)?;
                Instruction::Copy { dst, src }
            }
            Op::Move => {
                let (dst, src) = self.read_pair(wide)?;
                Instruction::Move { dst, src }
            }
            Op::Swap => {
                let (a, b) = self.read_pair(wide)?;
                Instruction::Swap { a, b }
            }
            Op::Cast => {
                let (dst, src) = self.read_pair(wide)?;
                let type_idx = self.read_u16()?;
                Instruction::Cast { dst, src, type_idx }
            }

            Op::AddInt => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::AddInt { dst, lhs, rhs }
            }
            Op::SubInt => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::SubInt { dst, lhs, rhs }
            }
            Op::MulInt => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::MulInt { dst, lhs, rhs }
            }
            Op::DivInt => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::DivInt { dst, lhs, rhs }
            }
            Op::AddFloat => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::AddFloat { dst, lhs, rhs }
            }
            Op::SubFloat => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::SubFloat { dst, lhs, rhs }
            }
            Op::MulFloat => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::MulFloat { dst, lhs, rhs }
            }
            Op::DivFloat => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::DivFloat { dst, lhs, rhs }
            }
            Op::Equals => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::Equals { dst, lhs, rhs }
            }
            Op::LessThan => {
                let (dst, lhs, rhs) = self.read_triple(wide)?;
                Instruction::LessThan { dst, lhs, rhs }
            }
            Op::Increment => Instruction::Increment {
                reg: self.read_reg(wide)?,
            },

            Op::GetIndex => {
                let (dst, container, index) = self.read_triple(wide)?;
                Instruction::GetIndex {
                    dst,
                    container,
                    index,
                }
            }
            Op::SetIndex => {
                let (container, index, src) = self.read_triple(wide)?;
                Instruction::SetIndex {
                    container,
                    index,
                    src,
                }
            }
            Op::Append => {
                let (list, src) = self.read_pair(wide)?;
                Instruction::Append { list, src }
            }
            Op::Length => {
                let (dst, container) = self.read_pair(wide)?;
                Instruction::Length { dst, container }
            }

            Op::Jump => Instruction::Jump {
                offset: self.read_i16()?,
            },
            Op::JumpIf => {
                let cond = self.read_reg(wide)?;
                let offset = self.read_i16()?;
                Instruction::JumpIf { cond, offset }
            }
            Op::JumpIfNot => {
                let cond = self.read_reg(wide)?;
                let offset = self.read_i16()?;
                Instruction::JumpIfNot { cond, offset }
            }
            Op::JumpIfDone => {
                let (index, container) = self.read_pair(wide)?;
                let offset = self.read_i16()?;
                Instruction::JumpIfDone {
                    index,
                    container,
                    offset,
                }
            }

            Op::Call => {
                let block_idx = self.read_u16()?;
                let base = self.read_reg(wide)?;
                let argc = self.read_u8()?;
                let out = self.read_reg(wide)?;
                Instruction::Call {
                    block_idx,
                    base,
                    argc,
                    out,
                }
            }
            Op::CallKeyed => {
                let block_idx = self.read_u16()?;
                let base = self.read_reg(wide)?;
                let argc = self.read_u8()?;
                let out = self.read_reg(wide)?;
                let key = self.read_reg(wide)?;
                Instruction::CallKeyed {
                    block_idx,
                    base,
                    argc,
                    out,
                    key,
                }
            }
            Op::CallFunc => {
                let base = self.read_reg(wide)?;
                let argc = self.read_u8()?;
                let out = self.read_reg(wide)?;
                Instruction::CallFunc { base, argc, out }
            }
            Op::CallFuncApply => {
                let (func, args, out) = self.read_triple(wide)?;
                Instruction::CallFuncApply { func, args, out }
            }
            Op::CallMethod => {
                let name_idx = self.read_u16()?;
                let base = self.read_reg(wide)?;
                let argc = self.read_u8()?;
                let out = self.read_reg(wide)?;
                let site = self.read_u16()?;
                Instruction::CallMethod {
                    name_idx,
                    base,
                    argc,
                    out,
                    site,
                }
            }
            Op::MakeFunc => {
                let dst = self.read_reg(wide)?;
                let block_idx = self.read_u16()?;
                let first = self.read_reg(wide)?;
                let count = self.read_u8()?;
                Instruction::MakeFunc {
                    dst,
                    block_idx,
                    first,
                    count,
                }
            }
            Op::SplatBindings => {
                let first = self.read_reg(wide)?;
                let count = self.read_u8()?;
                Instruction::SplatBindings { first, count }
            }
            Op::VarargsToList => Instruction::VarargsToList {
                first: self.read_reg(wide)?,
            },
            Op::GrowFrame => Instruction::GrowFrame {
                size: self.read_u16()?,
            },
            Op::Native => Instruction::Native {
                idx: self.read_u16()?,
            },

            Op::GetState => {
                let dst = self.read_reg(wide)?;
                let name_idx = self.read_u16()?;
                Instruction::GetState { dst, name_idx }
            }
            Op::SaveState => {
                let name_idx = self.read_u16()?;
                let src = self.read_reg(wide)?;
                Instruction::SaveState { name_idx, src }
            }

            Op::RetainFrame => Instruction::RetainFrame,
            Op::Pause => Instruction::Pause,
            Op::Return => Instruction::Return,
        };

        Ok(instr)
    }

    fn read_op(&mut self) -> Result<Op, DecodeError> {
        let offset = self.pos;
        let byte = self.read_u8()?;
        Op::try_from(byte)
            .map_err(|byte| DecodeError::InvalidOpcode { byte, offset })
    }

    #[inline(always)]
    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let bytes = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated(self.pos))?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    #[inline(always)]
    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    #[inline(always)]
    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    #[inline(always)]
    fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    #[inline(always)]
    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    #[inline(always)]
    fn read_reg(&mut self, wide: bool) -> Result<u16, DecodeError> {
        if wide {
            self.read_u16()
        } else {
            self.read_u8().map(u16::from)
        }
    }

    fn read_pair(&mut self, wide: bool) -> Result<(u16, u16), DecodeError> {
        Ok((self.read_reg(wide)?, self.read_reg(wide)?))
    }

    fn read_triple(
        &mut self,
        wide: bool,
    ) -> Result<(u16, u16, u16), DecodeError> {
        Ok((
            self.read_reg(wide)?,
            self.read_reg(wide)?,
            self.read_reg(wide)?,
        ))
    }
}

impl<'a> Iterator for BytecodeDecoder<'a> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next()
    }
}
