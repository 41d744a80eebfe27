//! Blocks: the unit of compilation.
//!
//! A block is a signature plus a [`Lowering`] that emits its body into a
//! [`ProgramBuilder`]. Inputs occupy registers `0..inputs.len()` on entry;
//! each output names the register it is read from when the block returns.

use std::fmt;
use std::sync::Arc;

use crate::types::Type;
use crate::{CompileError, ProgramBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Placeholder {
    pub name: Arc<str>,
    pub ty: Arc<Type>,
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct OutputSlot {
    pub placeholder: Placeholder,
    pub register: u16,
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub name: Arc<str>,
    pub inputs: Vec<Placeholder>,
    /// The last input repeats for any extra arguments.
    pub variadic: bool,
    pub outputs: Vec<OutputSlot>,
    pub locals: u16,
}

impl Signature {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            variadic: false,
            outputs: Vec::new(),
            locals: 0,
        }
    }

    pub fn input(mut self, name: &str, ty: Arc<Type>) -> Self {
        self.inputs.push(Placeholder {
            name: name.into(),
            ty,
            optional: false,
        });
        self
    }

    pub fn optional_input(mut self, name: &str, ty: Arc<Type>) -> Self {
        self.inputs.push(Placeholder {
            name: name.into(),
            ty,
            optional: true,
        });
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn output(mut self, name: &str, ty: Arc<Type>, register: u16) -> Self {
        self.outputs.push(OutputSlot {
            placeholder: Placeholder {
                name: name.into(),
                ty,
                optional: false,
            },
            register,
        });
        self
    }

    pub fn optional_output(
        mut self,
        name: &str,
        ty: Arc<Type>,
        register: u16,
    ) -> Self {
        self.outputs.push(OutputSlot {
            placeholder: Placeholder {
                name: name.into(),
                ty,
                optional: true,
            },
            register,
        });
        self
    }

    pub fn locals(mut self, count: u16) -> Self {
        self.locals = count;
        self
    }

    /// Registers a fresh frame for this block needs.
    pub fn register_count(&self) -> usize {
        let outputs = self
            .outputs
            .iter()
            .map(|slot| slot.register as usize + 1)
            .max()
            .unwrap_or(0);
        (self.locals as usize).max(self.inputs.len()).max(outputs)
    }

    /// Inputs a caller must supply. Trailing optional inputs may be left out,
    /// and so may the repeated input of a variadic block.
    pub fn required_inputs(&self) -> usize {
        let mut required = self.inputs.len();
        if self.variadic {
            required = required.saturating_sub(1);
        }
        while required > 0 && self.inputs[required - 1].optional {
            required -= 1;
        }
        required
    }

    /// Placeholder that argument `index` is checked against.
    pub fn input_placeholder(&self, index: usize) -> Option<&Placeholder> {
        match self.inputs.get(index) {
            Some(placeholder) => Some(placeholder),
            None if self.variadic => self.inputs.last(),
            None => None,
        }
    }
}

/// Lowers a block body to bytecode.
pub trait Lowering: Send + Sync {
    fn lower(
        &self,
        signature: &Signature,
        program: &mut ProgramBuilder<'_>,
    ) -> Result<(), CompileError>;
}

impl<F> Lowering for F
where
    F: Fn(&Signature, &mut ProgramBuilder<'_>) -> Result<(), CompileError>
        + Send
        + Sync,
{
    fn lower(
        &self,
        signature: &Signature,
        program: &mut ProgramBuilder<'_>,
    ) -> Result<(), CompileError> {
        self(signature, program)
    }
}

/// Body of a block that calls a single native function and returns.
#[derive(Debug, Clone)]
pub struct NativeBody(pub String);

impl Lowering for NativeBody {
    fn lower(
        &self,
        _signature: &Signature,
        program: &mut ProgramBuilder<'_>,
    ) -> Result<(), CompileError> {
        program.native(&self.0)?;
        program.return_();
        Ok(())
    }
}

pub struct Block {
    pub id: BlockId,
    /// Bumped every time the block is replaced.
    pub version: u32,
    pub signature: Signature,
    pub(crate) lowering: Arc<dyn Lowering>,
}

impl Block {
    pub fn name(&self) -> &str {
        &self.signature.name
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("name", &self.signature.name)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    #[test]
    fn register_count_covers_inputs_outputs_and_locals() {
        let sig = Signature::new("f")
            .input("a", types::int())
            .input("b", types::int())
            .output("out", types::int(), 5);
        assert_eq!(sig.register_count(), 6);
        assert_eq!(sig.clone().locals(9).register_count(), 9);
    }

    #[test]
    fn optional_and_variadic_inputs_are_not_required() {
        let sig = Signature::new("f")
            .input("a", types::int())
            .optional_input("b", types::int());
        assert_eq!(sig.required_inputs(), 1);

        let sig = Signature::new("sum")
            .input("first", types::int())
            .input("rest", types::int())
            .variadic();
        assert_eq!(sig.required_inputs(), 1);
        assert_eq!(sig.input_placeholder(7).map(|p| &*p.name), Some("rest"));
    }
}
