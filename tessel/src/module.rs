use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::types::Type;
use crate::{BlockId, Value};

#[derive(Debug, Clone)]
pub enum Member {
    Function(BlockId),
    Value(Value),
}

/// A namespace value. Method calls on a module resolve to its members.
///
/// Each module has its own type, so inline caches keyed on type identity
/// keep different modules apart.
pub struct Module {
    pub ty: Arc<Type>,
    pub name: Arc<str>,
    members: IndexMap<Arc<str>, Member>,
}

impl Module {
    pub(crate) fn new(ty: Arc<Type>, members: IndexMap<Arc<str>, Member>) -> Self {
        Self {
            name: ty.name.clone(),
            ty,
            members,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &Member)> {
        self.members.iter().map(|(name, member)| (&**name, member))
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .finish()
    }
}
