use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::value::Value;
use crate::compiler::chunk::Chunk;

/// Immutable result of compiling one function. The top-level script is a
/// `Function` with no name.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Option<String>,
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

impl Function {
    pub fn blank() -> Self {
        Self {
            name: None,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
        }
    }

    pub fn new(name: String) -> Self {
        Self {
            name: Some(name),
            ..Self::blank()
        }
    }

    pub fn function_name(&self) -> &str {
        self.name.as_deref().unwrap_or("script")
    }
}

/// Runtime pairing of a function with its captured upvalues. The upvalue
/// vector is filled in while the closure is already on the stack, hence the
/// interior mutability.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: RefCell<Vec<Rc<RefCell<Upvalue>>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Self {
        let upvalue_count = function.upvalue_count;
        Self {
            function,
            upvalues: RefCell::new(Vec::with_capacity(upvalue_count)),
        }
    }
}

/// Indirection cell for a variable captured by a closure. While the variable's
/// stack slot is live the cell points at it; once the slot is about to die the
/// cell takes ownership of the value.
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

pub type NativeFunction = fn(usize, &[Value]) -> Result<Value, String>;

#[derive(Clone)]
pub struct NativeFn {
    pub name: String,
    pub fun: NativeFunction,
}

impl NativeFn {
    pub fn new(name: String, fun: NativeFunction) -> Self {
        Self { name, fun }
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}
