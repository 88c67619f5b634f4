pub mod chunk;
pub mod compiler;
pub mod rle;
pub mod scanner;
pub mod token;
mod util;

use thiserror::Error;

use scanner::ScannerError;

pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Number of compiler errors: {}", .0.len())]
    Aggregate(Vec<CompileError>),

    #[error("{0}")]
    Scanner(#[from] ScannerError),

    #[error("Error parsing number: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),

    #[error("[line {line}] Error at {at}: {message}")]
    Parse {
        message: &'static str,
        at: String,
        line: u64,
    },

    #[error("Too many constants in one chunk.")]
    TooManyConstants,

    #[error("Too many local variables in function.")]
    LocalCount,

    #[error("Too many closure variables in function.")]
    UpvalueCount,

    #[error("Can't have more than 255 arguments.")]
    ArgumentCount,

    #[error("Can't have more than 255 parameters.")]
    ParameterCount,

    #[error("Cannot have more than 255 items in a list literal.")]
    ListLimit,

    #[error("Too much code to jump over.")]
    InvalidJump,

    #[error("Already a variable with this name in this scope.")]
    VariableAlreadyDeclared,

    #[error("Can't read local variable in its own initializer.")]
    LocalInitializer,

    #[error("Can't return from top-level code.")]
    ReturnAtTopLevel,

    #[error("Could not find token while parsing (should not happen)")]
    TokenNotFound,

    #[error("Internal error")]
    InternalError,
}
