mod call_frame;
pub mod instruction;
pub mod natives;
pub mod object;
pub mod value;
pub mod vm;

pub use call_frame::CallFrame;
pub use self::vm::VM;

use std::borrow::Cow;

use thiserror::Error;

use crate::compiler::CompileError;

pub type Result<T> = std::result::Result<T, VMError>;

#[derive(Debug, Error)]
pub enum VMError {
    #[error("Compile error")]
    CompileError(#[from] CompileError),

    #[error("{0}")]
    RuntimeError(Cow<'static, str>),

    #[error("Trying to access empty stack.")]
    EmptyStack,

    #[error("Instruction pointer out of bounds.")]
    InstructionOutOfBounds,

    #[error("Trying to access empty list of call frames.")]
    NoCallFrame,
}
