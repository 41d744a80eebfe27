//! Everything a set of stacks runs against: blocks, compiled programs,
//! natives, types and method tables.
//!
//! A world is shared behind an `Arc`. Tables sit behind `parking_lot`
//! locks: lookups take read locks, compilation and replacement write.
//! No lock is held while a block is being lowered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::block::NativeBody;
use crate::module::{Member, Module};
use crate::native::{NativeDesc, NativeFn, NativeTable, default_natives};
use crate::types::{Type, TypeId, TypeRegistry};
use crate::{
    Block, BlockId, CompileError, Lowering, Program, ProgramBuilder,
    ProgramIndex, Signature, Value,
};

#[derive(Debug, Clone)]
pub struct WorldCreateInfo {
    /// Register `print`, `to_string`, `length`, `rand`, `env`, `error` and
    /// `hash`.
    pub default_natives: bool,
    pub extra_natives: Vec<NativeDesc>,
}

impl Default for WorldCreateInfo {
    fn default() -> Self {
        Self {
            default_natives: true,
            extra_natives: Vec::new(),
        }
    }
}

struct ProgramSlot {
    block: BlockId,
    /// `None` after the block was replaced, until the next compile.
    program: Option<Arc<Program>>,
}

#[derive(Default)]
struct ProgramTable {
    by_block: HashMap<BlockId, ProgramIndex, ahash::RandomState>,
    slots: Vec<ProgramSlot>,
}

pub struct World {
    blocks: RwLock<Vec<Arc<Block>>>,
    programs: RwLock<ProgramTable>,
    natives: RwLock<NativeTable>,
    types: RwLock<TypeRegistry>,
    /// Bumped whenever a dispatch target may have changed.
    epoch: AtomicU64,
}

impl World {
    pub fn new(info: WorldCreateInfo) -> Arc<Self> {
        let mut natives = NativeTable::new();
        let descs = info
            .default_natives
            .then(default_natives)
            .unwrap_or_default()
            .into_iter()
            .chain(info.extra_natives);
        for desc in descs {
            if let Err(err) = natives.register(&desc.name, desc.func) {
                log::warn!("dropping native '{}': {err}", desc.name);
            }
        }
        Arc::new(Self {
            blocks: RwLock::new(Vec::new()),
            programs: RwLock::new(ProgramTable::default()),
            natives: RwLock::new(natives),
            types: RwLock::new(TypeRegistry::new()),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // ── blocks ─────────────────────────────────────────────────────

    pub fn add_block<F>(&self, signature: Signature, lower: F) -> BlockId
    where
        F: Fn(&Signature, &mut ProgramBuilder<'_>) -> Result<(), CompileError>
            + Send
            + Sync
            + 'static,
    {
        self.add_lowered_block(signature, Arc::new(lower))
    }

    pub fn add_lowered_block(
        &self,
        signature: Signature,
        lowering: Arc<dyn Lowering>,
    ) -> BlockId {
        let mut blocks = self.blocks.write();
        let id = BlockId(blocks.len() as u32);
        log::trace!("add block {id} '{}'", signature.name);
        blocks.push(Arc::new(Block {
            id,
            version: 0,
            signature,
            lowering,
        }));
        id
    }

    /// A block whose body is the native `native`.
    pub fn add_native_block(&self, signature: Signature, native: &str) -> BlockId {
        self.add_lowered_block(signature, Arc::new(NativeBody(native.to_owned())))
    }

    /// Swap in a new definition for `id`. The block's compiled program is
    /// dropped and rebuilt on next use under the same program index.
    pub fn replace_block<F>(
        &self,
        id: BlockId,
        signature: Signature,
        lower: F,
    ) -> Result<u32, CompileError>
    where
        F: Fn(&Signature, &mut ProgramBuilder<'_>) -> Result<(), CompileError>
            + Send
            + Sync
            + 'static,
    {
        let version = {
            let mut blocks = self.blocks.write();
            let slot = blocks
                .get_mut(id.0 as usize)
                .ok_or(CompileError::UnknownBlock(id))?;
            let version = slot.version + 1;
            *slot = Arc::new(Block {
                id,
                version,
                signature,
                lowering: Arc::new(lower),
            });
            version
        };
        {
            let mut table = self.programs.write();
            if let Some(index) = table.by_block.get(&id).copied() {
                table.slots[index.0 as usize].program = None;
            }
        }
        self.bump_epoch();
        log::debug!("replaced block {id}, now version {version}");
        Ok(version)
    }

    pub fn block(&self, id: BlockId) -> Result<Arc<Block>, CompileError> {
        self.blocks
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or(CompileError::UnknownBlock(id))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    // ── programs ───────────────────────────────────────────────────

    /// Compile `id`, or return the cached program index when the block has
    /// not changed since its last compile.
    pub fn compile_block(&self, id: BlockId) -> Result<ProgramIndex, CompileError> {
        let block = self.block(id)?;
        let index = {
            let mut table = self.programs.write();
            match table.by_block.get(&id).copied() {
                Some(index) => {
                    let cached = &table.slots[index.0 as usize].program;
                    if cached.as_ref().is_some_and(|p| p.version == block.version) {
                        return Ok(index);
                    }
                    index
                }
                None => {
                    let index = ProgramIndex(table.slots.len() as u32);
                    table.slots.push(ProgramSlot {
                        block: id,
                        program: None,
                    });
                    table.by_block.insert(id, index);
                    index
                }
            }
        };

        let mut builder = ProgramBuilder::new(self, &block);
        block.lowering.lower(&block.signature, &mut builder)?;
        let program = Arc::new(builder.finish(index));
        log::debug!(
            "compiled '{}' v{} into program {} ({} bytes)",
            block.name(),
            block.version,
            index.0,
            program.code.len()
        );

        let mut table = self.programs.write();
        let slot = &mut table.slots[index.0 as usize];
        // A replacement that landed while we were lowering wins.
        if self.block(id)?.version == block.version {
            slot.program = Some(program);
        }
        Ok(index)
    }

    /// The current program behind `index`, recompiling if its block was
    /// replaced since.
    pub fn program(&self, index: ProgramIndex) -> Result<Arc<Program>, CompileError> {
        let block = {
            let table = self.programs.read();
            let slot = table
                .slots
                .get(index.0 as usize)
                .ok_or(CompileError::UnknownProgram(index.0))?;
            if let Some(program) = &slot.program {
                return Ok(program.clone());
            }
            slot.block
        };
        self.compile_block(block)?;
        let table = self.programs.read();
        table.slots[index.0 as usize]
            .program
            .clone()
            .ok_or(CompileError::UnknownProgram(index.0))
    }

    pub fn program_block(&self, index: ProgramIndex) -> Result<BlockId, CompileError> {
        self.programs
            .read()
            .slots
            .get(index.0 as usize)
            .map(|slot| slot.block)
            .ok_or(CompileError::UnknownProgram(index.0))
    }

    // ── natives ────────────────────────────────────────────────────

    pub fn register_native(&self, name: &str, func: NativeFn) -> Result<u16, CompileError> {
        self.natives.write().register(name, func)
    }

    /// Point an existing native at a new function. Bytecode that already
    /// embeds the index picks up the change on its next call.
    pub fn patch_native(&self, name: &str, func: NativeFn) -> Result<u16, CompileError> {
        let idx = self
            .natives
            .write()
            .patch(name, func)
            .ok_or_else(|| CompileError::UnknownNative(name.to_owned()))?;
        log::debug!("patched native '{name}' at index {idx}");
        Ok(idx)
    }

    pub fn native(&self, idx: u16) -> Option<NativeFn> {
        self.natives.read().get(idx).map(|desc| desc.func)
    }

    pub fn native_name(&self, idx: u16) -> Option<Arc<str>> {
        self.natives.read().get(idx).map(|desc| desc.name.clone())
    }

    pub fn native_index(&self, name: &str) -> Option<u16> {
        self.natives.read().index_of(name)
    }

    // ── types and methods ──────────────────────────────────────────

    pub fn define_record(&self, name: &str, fields: &[(&str, Arc<Type>)]) -> Arc<Type> {
        self.types
            .write()
            .define_record(name, fields.iter().map(|(n, ty)| (*n, ty.clone())))
    }

    pub fn type_by_name(&self, name: &str) -> Option<Arc<Type>> {
        self.types.read().by_name(name).cloned()
    }

    pub fn type_of(&self, value: &Value) -> TypeId {
        value.type_id()
    }

    pub fn add_method(&self, ty: TypeId, name: &str, block: BlockId) {
        self.types.write().add_method(ty, name, block);
        self.bump_epoch();
    }

    pub fn method(&self, ty: TypeId, name: &str) -> Option<BlockId> {
        self.types.read().method(ty, name)
    }

    /// Build a module value. Each module gets a type of its own.
    pub fn create_module<'a>(
        &self,
        name: &str,
        members: impl IntoIterator<Item = (&'a str, Member)>,
    ) -> Value {
        let ty = self.types.write().define_module_type(name);
        let members: IndexMap<Arc<str>, Member> = members
            .into_iter()
            .map(|(name, member)| (Arc::from(name), member))
            .collect();
        Value::Module(Arc::new(Module::new(ty, members)))
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("blocks", &self.blocks.read().len())
            .field("programs", &self.programs.read().slots.len())
            .field("natives", &self.natives.read().len())
            .field("types", &self.types.read().len())
            .field("epoch", &self.epoch())
            .finish()
    }
}
