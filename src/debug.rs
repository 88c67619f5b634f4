use crate::compiler::chunk::Chunk;
use crate::vm::instruction::OpCode;
use crate::vm::value::{Object, Value};

/// Trace switches, compiled in like the C-style `#define` debugging flags.
pub const TRACE_EXECUTION_INSTR: bool = false;
pub const TRACE_EXECUTION_STACK: bool = false;
pub const LOG_COMPILED_CODE: bool = false;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    let mut previous_line = None;
    while offset < chunk.code.len() {
        let current_line = chunk.line(offset);
        let line = if previous_line == Some(current_line) {
            "   |".to_owned()
        } else {
            format!("{:4}", current_line)
        };
        previous_line = Some(current_line);

        let (text, bytes) = disassemble_instruction(chunk, offset);
        println!("{:04} {} {}", offset, line, text);

        offset += bytes;
    }
}

/// Renders the instruction at `offset` and reports how many bytes it spans,
/// so callers can walk from one instruction boundary to the next.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let op_code = match chunk.code.get(offset) {
        Some(byte) => OpCode::from(*byte),
        None => return ("<end>".to_owned(), 1),
    };

    match op_code {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Negate
        | OpCode::Not
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Print
        | OpCode::Pop
        | OpCode::Index
        | OpCode::Store
        | OpCode::CloseUpvalue
        | OpCode::Return => (op_code.name().to_owned(), 1),

        OpCode::Constant | OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal => {
            constant_instruction(chunk, op_code, offset)
        }

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::List => byte_instruction(chunk, op_code, offset),

        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op_code, offset, 1),
        OpCode::Loop => jump_instruction(chunk, op_code, offset, -1),

        OpCode::Closure => closure_instruction(chunk, offset),
    }
}

fn constant_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    match chunk.code.get(offset + 1) {
        Some(index) => {
            let value = chunk
                .read_constant(*index)
                .map(|v| format!("{}", v))
                .unwrap_or_else(|| "<missing>".to_owned());
            (
                format!("{}\t[index] {}\t[contains] {}", op_code.name(), index, value),
                2,
            )
        }
        None => (format!("{}\t<truncated>", op_code.name()), 2),
    }
}

fn byte_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    match chunk.code.get(offset + 1) {
        Some(byte) => (format!("{}\t{}", op_code.name(), byte), 2),
        None => (format!("{}\t<truncated>", op_code.name()), 2),
    }
}

fn jump_instruction(chunk: &Chunk, op_code: OpCode, offset: usize, sign: i64) -> (String, usize) {
    match (chunk.code.get(offset + 1), chunk.code.get(offset + 2)) {
        (Some(lo), Some(hi)) => {
            let jump = (*hi as i64) << 8 | *lo as i64;
            let target = offset as i64 + 3 + sign * jump;
            (format!("{}\t{} -> {}", op_code.name(), offset, target), 3)
        }
        _ => (format!("{}\t<truncated>", op_code.name()), 3),
    }
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let index = match chunk.code.get(offset + 1) {
        Some(index) => *index,
        None => return ("Closure\t<truncated>".to_owned(), 2),
    };

    let (name, upvalue_count) = match chunk.read_constant(index) {
        Some(Value::Object(Object::Function(function))) => {
            (function.function_name().to_owned(), function.upvalue_count)
        }
        _ => ("<missing>".to_owned(), 0),
    };

    let mut text = format!("Closure\t[index] {}\t<fn {}>", index, name);
    for i in 0..upvalue_count {
        let pair = offset + 2 + i * 2;
        if let (Some(is_local), Some(slot)) = (chunk.code.get(pair), chunk.code.get(pair + 1)) {
            let kind = if *is_local == 1 { "local" } else { "upvalue" };
            text.push_str(&format!("\n          |    {} {}", kind, slot));
        }
    }

    (text, 2 + upvalue_count * 2)
}
