use indexmap::IndexMap;

use crate::{BlockId, Key, ProgramIndex, Value};

/// Program counter: an instruction offset plus the graph node it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pc {
    pub offset: usize,
    pub node: Option<u32>,
}

/// One activation of a block.
#[derive(Debug, Clone)]
pub struct Frame {
    pub block: BlockId,
    pub program: ProgramIndex,
    /// Version of the program the pc points into.
    pub version: u32,
    pub registers: Vec<Value>,
    pub pc: Pc,
    pub parent: Option<usize>,
    /// Key this frame's state lives under in its parent, if any.
    pub state_key: Option<Key>,
    pub incoming: Value,
    pub outgoing: IndexMap<Key, Value>,
    pub bindings: Vec<Value>,
    pub retain: bool,
    pub input_count: usize,
    /// First caller register receiving this frame's outputs.
    pub return_to: Option<u16>,
}

impl Frame {
    pub(crate) fn new(
        block: BlockId,
        program: ProgramIndex,
        version: u32,
        registers: Vec<Value>,
    ) -> Self {
        Self {
            block,
            program,
            version,
            registers,
            pc: Pc::default(),
            parent: None,
            state_key: None,
            incoming: Value::Null,
            outgoing: IndexMap::new(),
            bindings: Vec::new(),
            retain: false,
            input_count: 0,
            return_to: None,
        }
    }

    /// Grow or shrink the register file. Newly exposed slots are null.
    pub fn resize_registers(&mut self, count: usize) {
        self.registers.resize(count, Value::Null);
    }

    /// Frames that don't carry a state key see no incoming state and drop
    /// whatever they save.
    pub fn is_stateful(&self) -> bool {
        self.parent.is_none() || self.state_key.is_some()
    }
}

/// What a retained frame leaves behind when it is popped.
#[derive(Debug, Clone)]
pub struct RetainedFrame {
    pub block: BlockId,
    pub registers: Vec<Value>,
    pub incoming: Value,
    pub outgoing: IndexMap<Key, Value>,
}

/// Reflection entry for one live frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub block: BlockId,
    pub name: String,
    pub pc: Pc,
    pub depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_nulls_exposed_slots() {
        let mut frame = Frame::new(BlockId(0), ProgramIndex(0), 0, vec![Value::Int(1); 2]);
        frame.resize_registers(1);
        frame.resize_registers(3);
        assert_eq!(frame.registers, vec![Value::Int(1), Value::Null, Value::Null]);
    }

    #[test]
    fn only_keyed_children_are_stateful() {
        let mut frame = Frame::new(BlockId(0), ProgramIndex(0), 0, Vec::new());
        assert!(frame.is_stateful());
        frame.parent = Some(0);
        assert!(!frame.is_stateful());
        frame.state_key = Some(Key::Index(2));
        assert!(frame.is_stateful());
    }
}
