//! Compiled programs and the builder lowerings emit into.

use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytecode::{
    BytecodeBuilder, DecodeError, Instruction, SourceMapBuilder, decode_at,
    source_map_lookup,
};

use crate::types::Type;
use crate::{Block, BlockId, CompileError, Signature, Value, World};

/// Stable handle on a compiled program. Recompiling a block after it was
/// replaced keeps its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramIndex(pub u32);

/// The flat instruction stream of one block, plus the pools its
/// instructions index into.
#[derive(Debug)]
pub struct Program {
    pub index: ProgramIndex,
    pub block: BlockId,
    /// Block version this program was lowered from.
    pub version: u32,
    pub signature: Signature,
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub blocks: Vec<BlockId>,
    pub types: Vec<Arc<Type>>,
    pub names: Vec<Arc<str>>,
    /// Number of inline-cache sites used by `CallMethod`.
    pub call_sites: u16,
    pub registers: usize,
    source_map: Vec<u8>,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn instruction_at(
        &self,
        pc: usize,
    ) -> Result<(Instruction, usize), DecodeError> {
        decode_at(&self.code, pc)
    }

    /// Graph node the instruction at `pc` was lowered from.
    pub fn node_at(&self, pc: usize) -> Option<u32> {
        source_map_lookup(&self.source_map, pc as u32)
    }

    pub fn constant(&self, idx: u16) -> Option<&Value> {
        self.constants.get(idx as usize)
    }

    pub fn block_ref(&self, idx: u16) -> Option<BlockId> {
        self.blocks.get(idx as usize).copied()
    }

    pub fn type_ref(&self, idx: u16) -> Option<&Arc<Type>> {
        self.types.get(idx as usize)
    }

    pub fn name_ref(&self, idx: u16) -> Option<&Arc<str>> {
        self.names.get(idx as usize)
    }

    /// Human readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} (v{}, {} registers, {} sites)",
            self.name(),
            self.version,
            self.registers,
            self.call_sites
        );
        let mut pc = 0;
        while pc < self.code.len() {
            match decode_at(&self.code, pc) {
                Ok((instruction, next)) => {
                    let _ = write!(out, "{pc:>5}  {instruction}");
                    if let Some(comment) = self.operand_comment(&instruction) {
                        let _ = write!(out, "  ; {comment}");
                    }
                    out.push('\n');
                    pc = next;
                }
                Err(err) => {
                    let _ = writeln!(out, "{pc:>5}  <{err}>");
                    break;
                }
            }
        }
        for (idx, constant) in self.constants.iter().enumerate() {
            let _ = writeln!(out, "  #{idx} = {constant}");
        }
        out
    }

    fn operand_comment(&self, instruction: &Instruction) -> Option<String> {
        match *instruction {
            Instruction::Call { block_idx, .. }
            | Instruction::CallKeyed { block_idx, .. }
            | Instruction::MakeFunc { block_idx, .. } => {
                self.block_ref(block_idx).map(|id| id.to_string())
            }
            Instruction::CallMethod { name_idx, .. }
            | Instruction::GetState { name_idx, .. }
            | Instruction::SaveState { name_idx, .. } => {
                self.name_ref(name_idx).map(|name| name.to_string())
            }
            Instruction::Cast { type_idx, .. } => {
                self.type_ref(type_idx).map(|ty| ty.name.to_string())
            }
            _ => None,
        }
    }
}

/// Collects bytecode and pools while a block is lowered.
///
/// Derefs to [`BytecodeBuilder`] for plain register instructions; the
/// methods defined here take pool-backed operands (blocks, names, types,
/// natives) and intern them.
pub struct ProgramBuilder<'w> {
    world: &'w World,
    block: &'w Block,
    code: BytecodeBuilder,
    constants: Vec<Value>,
    blocks: Vec<BlockId>,
    types: Vec<Arc<Type>>,
    names: Vec<Arc<str>>,
    call_sites: u16,
    source_map: SourceMapBuilder,
}

impl<'w> ProgramBuilder<'w> {
    pub(crate) fn new(world: &'w World, block: &'w Block) -> Self {
        Self {
            world,
            block,
            code: BytecodeBuilder::new(),
            constants: Vec::new(),
            blocks: Vec::new(),
            types: Vec::new(),
            names: Vec::new(),
            call_sites: 0,
            source_map: SourceMapBuilder::new(),
        }
    }

    pub fn world(&self) -> &World {
        self.world
    }

    pub fn block(&self) -> &Block {
        self.block
    }

    fn pool_index(&self, len: usize, pool: &'static str) -> Result<u16, CompileError> {
        u16::try_from(len).map_err(|_| CompileError::PoolOverflow {
            block: self.block.name().to_owned(),
            pool,
        })
    }

    /// A lowering failure attributed to the block being compiled.
    pub fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Lowering {
            block: self.block.name().to_owned(),
            message: message.into(),
        }
    }

    /// Attribute the instructions emitted from here on to graph node `node`.
    pub fn node(&mut self, node: u32) {
        self.source_map.add(self.code.current_offset() as u32, node);
    }

    pub fn constant(&mut self, value: Value) -> Result<u16, CompileError> {
        if let Some(pos) = self
            .constants
            .iter()
            .position(|c| c.tag() == value.tag() && c.equals(&value))
        {
            return self.pool_index(pos, "constant");
        }
        let idx = self.pool_index(self.constants.len(), "constant")?;
        self.constants.push(value);
        Ok(idx)
    }

    pub fn block_ref(&mut self, block: BlockId) -> Result<u16, CompileError> {
        if let Some(pos) = self.blocks.iter().position(|b| *b == block) {
            return self.pool_index(pos, "block");
        }
        let idx = self.pool_index(self.blocks.len(), "block")?;
        self.blocks.push(block);
        Ok(idx)
    }

    pub fn type_ref(&mut self, ty: &Arc<Type>) -> Result<u16, CompileError> {
        if let Some(pos) = self.types.iter().position(|t| t.id == ty.id) {
            return self.pool_index(pos, "type");
        }
        let idx = self.pool_index(self.types.len(), "type")?;
        self.types.push(ty.clone());
        Ok(idx)
    }

    pub fn name_ref(&mut self, name: &str) -> Result<u16, CompileError> {
        if let Some(pos) = self.names.iter().position(|n| &**n == name) {
            return self.pool_index(pos, "name");
        }
        let idx = self.pool_index(self.names.len(), "name")?;
        self.names.push(name.into());
        Ok(idx)
    }

    fn call_site(&mut self) -> Result<u16, CompileError> {
        let site = self.call_sites;
        self.call_sites = self.call_sites.checked_add(1).ok_or_else(|| {
            CompileError::PoolOverflow {
                block: self.block.name().to_owned(),
                pool: "call site",
            }
        })?;
        Ok(site)
    }

    /// Load any constant into `dst`, picking the shortest encoding.
    pub fn load(&mut self, dst: u16, value: Value) -> Result<(), CompileError> {
        match value {
            Value::Null => self.code.set_null(dst),
            Value::Int(i) if i32::try_from(i).is_ok() => {
                self.code.load_int(dst, i as i32)
            }
            value => {
                let idx = self.constant(value)?;
                self.code.load_const(dst, idx);
            }
        }
        Ok(())
    }

    pub fn call(
        &mut self,
        block: BlockId,
        base: u16,
        argc: u8,
        out: u16,
    ) -> Result<(), CompileError> {
        let idx = self.block_ref(block)?;
        self.code.call(idx, base, argc, out);
        Ok(())
    }

    /// Call `block` under the state key held in register `key`.
    pub fn call_keyed(
        &mut self,
        block: BlockId,
        base: u16,
        argc: u8,
        out: u16,
        key: u16,
    ) -> Result<(), CompileError> {
        let idx = self.block_ref(block)?;
        self.code.call_keyed(idx, base, argc, out, key);
        Ok(())
    }

    /// Dynamic call of method `name` on the receiver in `base`. Each send
    /// gets its own inline-cache site.
    pub fn send(
        &mut self,
        name: &str,
        base: u16,
        argc: u8,
        out: u16,
    ) -> Result<(), CompileError> {
        let name_idx = self.name_ref(name)?;
        let site = self.call_site()?;
        self.code.call_method(name_idx, base, argc, out, site);
        Ok(())
    }

    pub fn make_func(
        &mut self,
        dst: u16,
        block: BlockId,
        first: u16,
        count: u8,
    ) -> Result<(), CompileError> {
        let idx = self.block_ref(block)?;
        self.code.make_func(dst, idx, first, count);
        Ok(())
    }

    pub fn cast(&mut self, dst: u16, src: u16, ty: &Arc<Type>) -> Result<(), CompileError> {
        let idx = self.type_ref(ty)?;
        self.code.cast(dst, src, idx);
        Ok(())
    }

    pub fn get_state(&mut self, dst: u16, name: &str) -> Result<(), CompileError> {
        let idx = self.name_ref(name)?;
        self.code.get_state(dst, idx);
        Ok(())
    }

    pub fn save_state(&mut self, name: &str, src: u16) -> Result<(), CompileError> {
        let idx = self.name_ref(name)?;
        self.code.save_state(idx, src);
        Ok(())
    }

    /// Call the host function registered as `name`. The bytecode embeds the
    /// native's table index, which survives patching.
    pub fn native(&mut self, name: &str) -> Result<(), CompileError> {
        let idx = self
            .world
            .native_index(name)
            .ok_or_else(|| CompileError::UnknownNative(name.to_owned()))?;
        self.code.native(idx);
        Ok(())
    }

    pub(crate) fn finish(self, index: ProgramIndex) -> Program {
        Program {
            index,
            block: self.block.id,
            version: self.block.version,
            signature: self.block.signature.clone(),
            registers: self.block.signature.register_count(),
            code: self.code.into_bytes(),
            constants: self.constants,
            blocks: self.blocks,
            types: self.types,
            names: self.names,
            call_sites: self.call_sites,
            source_map: self.source_map.finish(),
        }
    }
}

impl Deref for ProgramBuilder<'_> {
    type Target = BytecodeBuilder;

    fn deref(&self) -> &Self::Target {
        &self.code
    }
}

impl DerefMut for ProgramBuilder<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.code
    }
}
