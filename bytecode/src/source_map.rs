//! Compact pc → graph node table.
//!
//! The map is a run of `(pc, node)` pairs sorted by pc, stored as deltas
//! from the previous pair. The pc delta is an unsigned LEB128-style VLQ,
//! the node delta is zigzag-folded first since nodes may go backwards.

/// Collects `(pc, node)` pairs while code is emitted.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    pairs: Vec<(u32, u32)>,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions from `pc` onward belong to `node`. Repeating the current
    /// node is a no-op; a second node at the same pc overrides the first.
    pub fn add(&mut self, pc: u32, node: u32) {
        match self.pairs.last_mut() {
            Some(&mut (_, last)) if last == node => {}
            Some(last) if last.0 == pc => last.1 = node,
            _ => self.pairs.push((pc, node)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pairs.len() * 2);
        let mut prev = (0u32, 0i64);
        for (pc, node) in self.pairs {
            write_vlq(pc - prev.0, &mut out);
            write_vlq(fold(node as i64 - prev.1), &mut out);
            prev = (pc, node as i64);
        }
        out
    }
}

/// Decoded `(pc, node)` pairs of an encoded map. Stops at the first
/// malformed pair.
struct Pairs<'a> {
    bytes: &'a [u8],
    pos: usize,
    pc: u32,
    node: i64,
}

impl Iterator for Pairs<'_> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let pc_delta = read_vlq(self.bytes, &mut self.pos)?;
        let node_delta = unfold(read_vlq(self.bytes, &mut self.pos)?);
        self.pc = self.pc.checked_add(pc_delta)?;
        self.node += node_delta;
        Some((self.pc, self.node as u32))
    }
}

/// Node of the last pair at or before `pc`.
pub fn source_map_lookup(encoded: &[u8], pc: u32) -> Option<u32> {
    Pairs {
        bytes: encoded,
        pos: 0,
        pc: 0,
        node: 0,
    }
    .take_while(|&(start, _)| start <= pc)
    .last()
    .map(|(_, node)| node)
}

fn write_vlq(mut value: u32, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_vlq(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let mut value = 0u32;
    for shift in (0..35).step_by(7) {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn fold(value: i64) -> u32 {
    ((value << 1) ^ (value >> 63)) as u32
}

fn unfold(value: u32) -> i64 {
    i64::from(value >> 1) ^ -i64::from(value & 1)
}
