use super::rle::Rle;
use crate::vm::instruction::OpCode;
use crate::vm::value::Value;

/// Bytecode for a single function: code bytes, a parallel line table with one
/// entry per code byte, and the constant pool the code indexes into.
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: Rle<u64>,
}

/// Constant indices are a single byte, so a chunk holds at most 256 constants.
pub const MAX_CONSTANTS: usize = 256;

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, instr: OpCode, line: u64) {
        self.code.push(instr.into());
        self.lines.push(line);
    }

    pub fn write_byte(&mut self, byte: u8, line: u64) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_index(&mut self, op_code: OpCode, index: u8, line: u64) {
        self.write(op_code, line);
        self.write_byte(index, line);
    }

    /// Appends a constant and returns its index, or `None` once the pool is
    /// full. The compiler turns `None` into a compile error.
    pub fn add_constant(&mut self, constant: Value) -> Option<u8> {
        if self.constants.len() >= MAX_CONSTANTS {
            return None;
        }
        self.constants.push(constant);
        Some((self.constants.len() - 1) as u8)
    }

    pub fn read_constant(&self, index: u8) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    pub fn line(&self, offset: usize) -> u64 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}
