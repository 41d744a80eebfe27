//! Dynamic method dispatch for `CallMethod`.
//!
//! Resolution order on a cache miss: a method registered on the receiver's
//! type, then a member of a module receiver, then a key of a map receiver.

use crate::cache::{CacheLine, ResolutionKind};
use crate::module::Member;
use crate::stack::{Link, offset_register};
use crate::{BlockId, Key, ProgramIndex, RuntimeError, Stack, Value, World};

/// Slow path: find what `name` means for `receiver`.
pub fn resolve(world: &World, receiver: &Value, name: &str) -> (ResolutionKind, Option<BlockId>) {
    let ty = world.type_of(receiver);
    if let Some(block) = world.method(ty, name) {
        return (ResolutionKind::Method, Some(block));
    }
    match receiver {
        Value::Module(module) => match module.member(name) {
            Some(Member::Function(block)) => (ResolutionKind::ModuleMember, Some(*block)),
            Some(Member::Value(_)) => (ResolutionKind::ModuleMember, None),
            None => (ResolutionKind::NotFound, None),
        },
        Value::Map(_) => (ResolutionKind::MapKey, None),
        _ => (ResolutionKind::NotFound, None),
    }
}

/// Operands of one `CallMethod` instruction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendSite<'a> {
    pub name: &'a str,
    pub base: u16,
    pub argc: u8,
    pub out: u16,
    pub program: ProgramIndex,
    pub site: u16,
}

impl Stack {
    fn lookup_line(&mut self, send: &SendSite<'_>, receiver: &Value) -> CacheLine {
        let type_id = self.world.type_of(receiver);
        let epoch = self.world.epoch();
        if self.info.inline_cache {
            let cache = self
                .caches
                .site(send.program.0 as usize, send.site as usize);
            if let Some(line) = cache.lookup(type_id, epoch) {
                self.caches.stats.hits += 1;
                return line;
            }
        }
        let (kind, target) = resolve(&self.world, receiver, send.name);
        let line = CacheLine {
            type_id,
            kind,
            target,
            epoch,
        };
        if self.info.inline_cache {
            self.caches.stats.misses += 1;
            log::trace!(
                "inline cache miss: '{}' on {} at site {}",
                send.name,
                receiver.type_name(),
                send.site
            );
            self.caches
                .site(send.program.0 as usize, send.site as usize)
                .insert(line);
        }
        line
    }

    pub(crate) fn send(&mut self, send: SendSite<'_>) -> Result<(), RuntimeError> {
        let receiver = self.register(send.base)?.clone();
        let line = self.lookup_line(&send, &receiver);
        let not_found = || RuntimeError::MethodNotFound {
            name: send.name.to_owned(),
            receiver: receiver.type_name(),
        };
        match (line.kind, line.target) {
            (ResolutionKind::Method, Some(block)) => {
                let args = self.arguments(send.base, send.argc as usize)?;
                self.enter(block, args, Link::returning_to(send.out))
            }
            (ResolutionKind::ModuleMember, Some(block)) => {
                // the module itself is not passed on
                let argc = (send.argc as usize).saturating_sub(1);
                let args = self.arguments(offset_register(send.base, 1)?, argc)?;
                self.enter(block, args, Link::returning_to(send.out))
            }
            (ResolutionKind::ModuleMember, None) => {
                let value = match &receiver {
                    Value::Module(module) => match module.member(send.name) {
                        Some(Member::Value(value)) => value.clone(),
                        _ => return Err(not_found()),
                    },
                    _ => return Err(not_found()),
                };
                self.set_register(send.out, value)
            }
            (ResolutionKind::MapKey, _) => {
                let value = receiver
                    .as_map()
                    .and_then(|map| map.get(&Key::name(send.name)))
                    .cloned()
                    .ok_or_else(not_found)?;
                self.set_register(send.out, value)
            }
            _ => Err(not_found()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorldCreateInfo;
    use crate::types::{self, TypeId};
    use crate::Signature;

    #[test]
    fn resolution_order() {
        let world = World::new(WorldCreateInfo::default());
        let len = world.add_native_block(
            Signature::new("len").input("self", types::any()),
            "length",
        );
        world.add_method(TypeId::LIST, "len", len);

        let list = Value::list(Vec::new());
        assert_eq!(resolve(&world, &list, "len"), (ResolutionKind::Method, Some(len)));
        assert_eq!(resolve(&world, &list, "size"), (ResolutionKind::NotFound, None));
        assert_eq!(
            resolve(&world, &Value::empty_map(), "anything"),
            (ResolutionKind::MapKey, None)
        );

        let module = world.create_module(
            "m",
            [
                ("f", Member::Function(len)),
                ("k", Member::Value(Value::Int(1))),
            ],
        );
        assert_eq!(resolve(&world, &module, "f"), (ResolutionKind::ModuleMember, Some(len)));
        assert_eq!(resolve(&world, &module, "k"), (ResolutionKind::ModuleMember, None));
        assert_eq!(resolve(&world, &module, "g"), (ResolutionKind::NotFound, None));
    }
}
