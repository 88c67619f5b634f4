use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use colored::*;

use super::instruction::OpCode;
use super::natives;
use super::object::{Closure, Function, NativeFn, NativeFunction, Upvalue};
use super::value::{Object, Value};
use super::{CallFrame, Result, VMError};
use crate::compiler::compiler::Compiler;
use crate::debug::{self, TRACE_EXECUTION_INSTR, TRACE_EXECUTION_STACK};

const MAX_FRAMES: usize = 128;

pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        let mut vm = Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
        };

        vm.define_native("clock", natives::clock);
        vm.define_native("mod", natives::modulo);
        vm.define_native("list", natives::list);
        vm.define_native("append", natives::append);
        vm.define_native("pop", natives::pop);
        vm.define_native("len", natives::len);
        vm
    }

    /// Registers a host function under `name` in the global table.
    pub fn define_native(&mut self, name: &str, function: NativeFunction) {
        let native = NativeFn::new(name.to_owned(), function);
        self.globals
            .insert(name.to_owned(), Value::Object(Object::Native(Rc::new(native))));
    }

    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let function = Compiler::new(source).compile()?;
        self.interpret_function(function)
    }

    pub fn interpret_function(&mut self, function: Function) -> Result<()> {
        let closure = Rc::new(Closure::new(Rc::new(function)));
        self.stack
            .push(Value::Object(Object::Closure(closure.clone())));
        self.call(closure, 0)?;

        if let Err(err) = self.run() {
            eprintln!("{}", err);
            self.print_stack_trace();
            self.reset();
            return Err(err);
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let mut frame = self.frames.pop().ok_or(VMError::NoCallFrame)?;
        let result = self.execute(&mut frame);
        if result.is_err() {
            // Keep the active frame for the stack trace.
            self.frames.push(frame);
        }
        result
    }

    fn execute(&mut self, frame: &mut CallFrame) -> Result<()> {
        while !frame.at_end() {
            let instruction = OpCode::from(frame.next_instruction()?);

            if TRACE_EXECUTION_STACK || TRACE_EXECUTION_INSTR {
                self.trace(frame);
            }

            match instruction {
                OpCode::Return => {
                    let result = self.pop()?;
                    self.close_upvalues(frame.stack_base);

                    if self.frames.is_empty() {
                        // Script frame: drop it and its closure slot.
                        self.stack.truncate(frame.stack_base);
                        return Ok(());
                    }

                    self.stack.truncate(frame.stack_base);
                    *frame = self.frames.pop().ok_or(VMError::NoCallFrame)?;
                    self.stack.push(result);
                }
                OpCode::Constant => {
                    let constant = frame.next_instruction_as_constant()?;
                    self.stack.push(constant);
                }
                OpCode::Nil => {
                    self.stack.push(Value::Nil);
                }
                OpCode::True => {
                    self.stack.push(Value::Bool(true));
                }
                OpCode::False => {
                    self.stack.push(Value::Bool(false));
                }
                OpCode::Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.stack.push(Value::Bool(lhs.equals(&rhs)));
                }
                OpCode::Greater => {
                    self.op_compare(|lhs, rhs| lhs > rhs)?;
                }
                OpCode::Less => {
                    self.op_compare(|lhs, rhs| lhs < rhs)?;
                }
                OpCode::Not => {
                    let value = self.pop()?;
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(value) => self.stack.push(Value::Number(-value)),
                        _ => {
                            return Err(VMError::RuntimeError(
                                "Operand must be a number.".into(),
                            ))
                        }
                    }
                }
                OpCode::Add => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    match (&lhs, &rhs) {
                        (Value::Number(lhs), Value::Number(rhs)) => {
                            self.stack.push(Value::Number(lhs + rhs));
                        }
                        // A string on either side stringifies the other side.
                        (Value::Object(Object::String(_)), _)
                        | (_, Value::Object(Object::String(_))) => {
                            self.stack.push(Value::string(format!("{}{}", lhs, rhs)));
                        }
                        _ => {
                            return Err(VMError::RuntimeError(
                                "Operands must be numbers.".into(),
                            ))
                        }
                    }
                }
                OpCode::Subtract => {
                    self.op_binary(|lhs, rhs| lhs - rhs)?;
                }
                OpCode::Multiply => {
                    self.op_binary(|lhs, rhs| lhs * rhs)?;
                }
                OpCode::Divide => {
                    self.op_binary(|lhs, rhs| lhs / rhs)?;
                }
                OpCode::Print => {
                    let value = self.pop()?;
                    println!("{}", value);
                }
                OpCode::Pop => {
                    self.stack.pop();
                }
                OpCode::DefineGlobal => {
                    let name = global_name(frame.next_instruction_as_constant()?)?;
                    if self.globals.contains_key(name.as_str()) {
                        return Err(VMError::RuntimeError(
                            format!("Variable {} is already defined.", name).into(),
                        ));
                    }
                    let value = self.pop()?;
                    self.globals.insert(name.as_str().to_owned(), value);
                }
                OpCode::GetGlobal => {
                    let name = global_name(frame.next_instruction_as_constant()?)?;
                    let value = match self.globals.get(name.as_str()) {
                        Some(value) => value.clone(),
                        None => {
                            return Err(VMError::RuntimeError(
                                format!("Undefined variable '{}'.", name).into(),
                            ))
                        }
                    };
                    self.stack.push(value);
                }
                OpCode::SetGlobal => {
                    let name = global_name(frame.next_instruction_as_constant()?)?;
                    if !self.globals.contains_key(name.as_str()) {
                        return Err(VMError::RuntimeError(
                            format!("Undefined variable '{}'.", name).into(),
                        ));
                    }
                    // Assignment is an expression; the value stays on the stack.
                    let value = self.stack.last().ok_or(VMError::EmptyStack)?.clone();
                    self.globals.insert(name.as_str().to_owned(), value);
                }
                OpCode::GetLocal => {
                    let slot = frame.next_instruction()? as usize;
                    let value = self
                        .stack
                        .get(frame.stack_base + slot)
                        .ok_or(VMError::EmptyStack)?
                        .clone();
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = frame.next_instruction()? as usize;
                    let value = self.stack.last().ok_or(VMError::EmptyStack)?.clone();
                    self.stack[frame.stack_base + slot] = value;
                }
                OpCode::GetUpvalue => {
                    let slot = frame.next_instruction()? as usize;
                    let upvalue = frame
                        .closure
                        .upvalues
                        .borrow()
                        .get(slot)
                        .cloned()
                        .ok_or(VMError::InstructionOutOfBounds)?;
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(slot) => self
                            .stack
                            .get(*slot)
                            .ok_or(VMError::EmptyStack)?
                            .clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = frame.next_instruction()? as usize;
                    let upvalue = frame
                        .closure
                        .upvalues
                        .borrow()
                        .get(slot)
                        .cloned()
                        .ok_or(VMError::InstructionOutOfBounds)?;
                    let value = self.stack.last().ok_or(VMError::EmptyStack)?.clone();
                    match &mut *upvalue.borrow_mut() {
                        Upvalue::Open(slot) => self.stack[*slot] = value,
                        Upvalue::Closed(cell) => *cell = value,
                    };
                }
                OpCode::Jump => {
                    let offset = frame.next_instruction_as_jump()?;
                    frame.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    // The condition stays on the stack; the branch paths pop it.
                    let offset = frame.next_instruction_as_jump()?;
                    let condition = self.stack.last().ok_or(VMError::EmptyStack)?;
                    if !condition.is_truthy() {
                        frame.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = frame.next_instruction_as_jump()?;
                    frame.ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = frame.next_instruction()? as usize;
                    let callee_index = self
                        .stack
                        .len()
                        .checked_sub(arg_count + 1)
                        .ok_or(VMError::EmptyStack)?;
                    let callee = self
                        .stack
                        .get(callee_index)
                        .ok_or(VMError::EmptyStack)?
                        .clone();

                    self.frames.push(frame.clone());
                    if let Err(err) = self.call_value(callee, arg_count) {
                        self.frames.pop();
                        return Err(err);
                    }
                    *frame = self.frames.pop().ok_or(VMError::NoCallFrame)?;
                }
                OpCode::Closure => {
                    let function = match frame.next_instruction_as_constant()? {
                        Value::Object(Object::Function(function)) => function,
                        _ => return Err(VMError::InstructionOutOfBounds),
                    };
                    let upvalue_count = function.upvalue_count;
                    let closure = Rc::new(Closure::new(function));
                    self.stack
                        .push(Value::Object(Object::Closure(closure.clone())));

                    for _ in 0..upvalue_count {
                        let is_local = frame.next_instruction()? == 1;
                        let index = frame.next_instruction()? as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(frame.stack_base + index)
                        } else {
                            frame
                                .closure
                                .upvalues
                                .borrow()
                                .get(index)
                                .cloned()
                                .ok_or(VMError::InstructionOutOfBounds)?
                        };
                        closure.upvalues.borrow_mut().push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    // The local leaving scope is on top of the stack.
                    let top = self.stack.len().checked_sub(1).ok_or(VMError::EmptyStack)?;
                    self.close_upvalues(top);
                    self.stack.pop();
                }
                OpCode::List => {
                    let count = frame.next_instruction()? as usize;
                    let start = self
                        .stack
                        .len()
                        .checked_sub(count)
                        .ok_or(VMError::EmptyStack)?;
                    let items = self.stack.split_off(start);
                    self.stack.push(Value::list(items));
                }
                OpCode::Index => {
                    let index = self.pop()?;
                    let list = self.pop()?;
                    let items = as_list(&list)?;
                    let index = list_index(&index)?;

                    let value = items
                        .borrow()
                        .get(index)
                        .cloned()
                        .ok_or_else(|| {
                            VMError::RuntimeError("List index out of range.".into())
                        })?;
                    self.stack.push(value);
                }
                OpCode::Store => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let list = self.pop()?;
                    let items = as_list(&list)?;
                    let index = list_index(&index)?;

                    let mut items = items.borrow_mut();
                    if index >= items.len() {
                        return Err(VMError::RuntimeError("List index out of range.".into()));
                    }
                    items[index] = value.clone();
                    drop(items);

                    self.stack.push(value);
                }
            }
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(VMError::EmptyStack)
    }

    fn op_binary(&mut self, op: fn(f64, f64) -> f64) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.stack.push(Value::Number(op(lhs, rhs)));
                Ok(())
            }
            _ => Err(VMError::RuntimeError("Operands must be numbers.".into())),
        }
    }

    fn op_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.stack.push(Value::Bool(op(lhs, rhs)));
                Ok(())
            }
            _ => Err(VMError::RuntimeError("Operands must be numbers.".into())),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        match callee {
            Value::Object(Object::Closure(closure)) => self.call(closure, arg_count),
            Value::Object(Object::Function(function)) => {
                // A bare function is wrapped in a closure on the fly.
                let closure = Rc::new(Closure::new(function));
                let callee_index = self.stack.len() - arg_count - 1;
                self.stack[callee_index] = Value::Object(Object::Closure(closure.clone()));
                self.call(closure, arg_count)
            }
            Value::Object(Object::Native(native)) => {
                let args_start = self.stack.len() - arg_count;
                let result = (native.fun)(arg_count, &self.stack[args_start..]);
                match result {
                    Ok(value) => {
                        self.stack.truncate(args_start - 1);
                        self.stack.push(value);
                        Ok(())
                    }
                    Err(message) => Err(VMError::RuntimeError(message.into())),
                }
            }
            _ => Err(VMError::RuntimeError(
                "Can only call functions and classes.".into(),
            )),
        }
    }

    fn call(&mut self, closure: Rc<Closure>, arg_count: usize) -> Result<()> {
        let arity = closure.function.arity;
        if arg_count != arity {
            return Err(VMError::RuntimeError(
                format!("Expect {} arguments but got {}.", arity, arg_count).into(),
            ));
        }

        if self.frames.len() == MAX_FRAMES {
            return Err(VMError::RuntimeError("Stack overflow.".into()));
        }

        let stack_base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame::new(closure, stack_base));
        Ok(())
    }

    /// Returns the open upvalue for a stack slot, creating one if no closure
    /// has captured that slot yet. Sharing the cell is what lets sibling
    /// closures observe each other's writes.
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        for upvalue in self.open_upvalues.iter().rev() {
            if let Upvalue::Open(open_slot) = &*upvalue.borrow() {
                if *open_slot == slot {
                    return upvalue.clone();
                }
            }
        }

        let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.push(upvalue.clone());
        upvalue
    }

    /// Closes every open upvalue pointing at `from` or above: the captured
    /// value moves off the stack into the cell.
    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            let slot = match &*upvalue.borrow() {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => return false,
            };
            if slot >= from {
                let value = stack.get(slot).cloned().unwrap_or(Value::Nil);
                *upvalue.borrow_mut() = Upvalue::Closed(value);
                false
            } else {
                true
            }
        });
    }

    fn trace(&self, frame: &CallFrame) {
        if TRACE_EXECUTION_STACK {
            let stack = self
                .stack
                .iter()
                .map(|value| format!("[ {} ]", value))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{}\t\t{}", "[STACK]".yellow(), stack);
        }
        if TRACE_EXECUTION_INSTR {
            let offset = frame.ip - 1;
            let (text, _) = debug::disassemble_instruction(&frame.function().chunk, offset);
            println!("{}\t{:04}\t{}", "[Instruction]".green(), offset, text);
        }
    }

    fn print_stack_trace(&self) {
        for frame in self.frames.iter().rev() {
            let function = frame.function();
            // The ip sits on the next instruction.
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            if function.name.is_none() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}()", line, function.function_name());
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }
}

fn global_name(constant: Value) -> Result<Rc<String>> {
    match constant {
        Value::Object(Object::String(name)) => Ok(name),
        _ => Err(VMError::InstructionOutOfBounds),
    }
}

fn as_list(value: &Value) -> Result<&Rc<RefCell<Vec<Value>>>> {
    match value {
        Value::Object(Object::List(items)) => Ok(items),
        _ => Err(VMError::RuntimeError("Invalid type to index into.".into())),
    }
}

fn list_index(value: &Value) -> Result<usize> {
    match value {
        Value::Number(index) if index.fract() == 0.0 && *index >= 0.0 => Ok(*index as usize),
        Value::Number(_) => Err(VMError::RuntimeError("List index out of range.".into())),
        _ => Err(VMError::RuntimeError("List index is not a number.".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::chunk::Chunk;

    fn run(source: &str) -> Result<VM> {
        let mut vm = VM::new();
        vm.interpret(source)?;
        Ok(vm)
    }

    fn run_err(source: &str) -> VMError {
        let mut vm = VM::new();
        vm.interpret(source).unwrap_err()
    }

    fn global(vm: &VM, name: &str) -> Value {
        vm.globals
            .get(name)
            .unwrap_or_else(|| panic!("global {} not defined", name))
            .clone()
    }

    fn assert_global(vm: &VM, name: &str, expected: Value) {
        let actual = global(vm, name);
        assert!(
            actual.equals(&expected),
            "global {} was {}, expected {}",
            name,
            actual,
            expected
        );
    }

    fn runtime_message(err: VMError) -> String {
        match err {
            VMError::RuntimeError(message) => message.into_owned(),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn vm_raw_instructions() {
        let add_constant = |chunk: &mut Chunk, value| {
            let index = chunk.add_constant(Value::Number(value)).unwrap();
            chunk.write_index(OpCode::Constant, index, 0);
        };

        let mut chunk = Chunk::new();
        add_constant(&mut chunk, 1.2);
        add_constant(&mut chunk, 3.4);
        chunk.write(OpCode::Add, 0);
        add_constant(&mut chunk, 5.6);
        chunk.write(OpCode::Divide, 0);
        chunk.write(OpCode::Negate, 0);
        chunk.write(OpCode::Return, 0);

        let mut function = Function::blank();
        function.chunk = chunk;

        let mut vm = VM::new();
        assert!(vm.interpret_function(function).is_ok());
    }

    #[test]
    fn vm_math() {
        let vm = run("var r = (-1 + 2) * 3 - -4;").unwrap();
        assert_global(&vm, "r", Value::Number(7.0));
    }

    #[test]
    fn vm_precedence() {
        let vm = run("var r = 1 + 2 * 3;").unwrap();
        assert_global(&vm, "r", Value::Number(7.0));
    }

    #[test]
    fn vm_unary_and_comparison() {
        let vm = run("var r = !(5 - 4 > 3 * 2 == !nil);").unwrap();
        assert_global(&vm, "r", Value::Bool(true));
    }

    #[test]
    fn vm_string_concat() {
        let vm = run(r#"var r = "st" + "ri" + "ng";"#).unwrap();
        assert_global(&vm, "r", Value::string("string".to_owned()));
    }

    #[test]
    fn vm_string_mixed_add() {
        let vm = run(r#"var r = "a" + 1 + "b";"#).unwrap();
        assert_global(&vm, "r", Value::string("a1b".to_owned()));

        let vm = run(r#"var r = 1 + "a";"#).unwrap();
        assert_global(&vm, "r", Value::string("1a".to_owned()));
    }

    #[test]
    fn vm_print_smoke() {
        assert!(run("print 3 + (4 * 3) * (1 + (2 + 3));").is_ok());
        assert!(run("print [1, 2, 3];").is_ok());
        assert!(run(r#"print "hello";"#).is_ok());
    }

    #[test]
    fn vm_globals() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        "#;
        let vm = run(source).unwrap();
        assert_global(
            &vm,
            "breakfast",
            Value::string("beignets with cafe au lait".to_owned()),
        );
    }

    #[test]
    fn vm_globals_persist_between_interprets() {
        let mut vm = VM::new();
        vm.interpret("var a = 1;").unwrap();
        vm.interpret("var b = a + 1;").unwrap();
        assert_global(&vm, "b", Value::Number(2.0));
    }

    #[test]
    fn vm_global_redefinition_errors() {
        let message = runtime_message(run_err("var a = 1; var a = 2;"));
        assert_eq!(message, "Variable a is already defined.");
    }

    #[test]
    fn vm_undefined_global() {
        let message = runtime_message(run_err("print missing;"));
        assert_eq!(message, "Undefined variable 'missing'.");

        let message = runtime_message(run_err("missing = 1;"));
        assert_eq!(message, "Undefined variable 'missing'.");
    }

    #[test]
    fn vm_locals() {
        let source = r#"
        var r = 0;
        {
            var a = 1;
            var b = a;
            b = b + 1;
            var c = a + b;
            r = c;
        }
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "r", Value::Number(3.0));
    }

    #[test]
    fn vm_local_shadowing_binds_innermost() {
        let source = r#"
        var r = 0;
        var a = 1;
        {
            var a = 2;
            r = a;
        }
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "r", Value::Number(2.0));
        assert_global(&vm, "a", Value::Number(1.0));
    }

    #[test]
    fn vm_if_else() {
        let source = r#"
        var a = 1;
        var b = 1;
        if (a == 1) { a = 10; } else { a = 20; }
        if (b == 2) { b = 100; } else { b = 200; }
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "a", Value::Number(10.0));
        assert_global(&vm, "b", Value::Number(200.0));
    }

    #[test]
    fn vm_and_or() {
        let source = r#"
        var a = true and false;
        var b = true or false;
        var c = nil and 3;
        var d = 0 or 5;
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "a", Value::Bool(false));
        assert_global(&vm, "b", Value::Bool(true));
        assert_global(&vm, "c", Value::Nil);
        // Zero is falsey, so `or` evaluates its right side.
        assert_global(&vm, "d", Value::Number(5.0));
    }

    #[test]
    fn vm_while() {
        let vm = run("var a = 0; while (a < 10) { a = a + 1; }").unwrap();
        assert_global(&vm, "a", Value::Number(10.0));
    }

    #[test]
    fn vm_for_sum() {
        let source = "var a = 0; for (var i = 0; i < 5; i = i + 1) { a = a + i; }";
        let vm = run(source).unwrap();
        assert_global(&vm, "a", Value::Number(10.0));
    }

    #[test]
    fn vm_for_existing_variable_initializer() {
        let source = "var i; var a = 0; for (i = 3; i < 6; i = i + 1) { a = a + i; }";
        let vm = run(source).unwrap();
        assert_global(&vm, "a", Value::Number(12.0));
        assert_global(&vm, "i", Value::Number(6.0));
    }

    #[test]
    fn vm_increment_suffixes() {
        let source = r#"
        var a = 5;
        var pre = a++;
        var b = a;
        a--;
        var c = a;
        "#;
        let vm = run(source).unwrap();
        // Post-increment: the expression yields the pre-update value.
        assert_global(&vm, "pre", Value::Number(5.0));
        assert_global(&vm, "b", Value::Number(6.0));
        assert_global(&vm, "c", Value::Number(5.0));
    }

    #[test]
    fn vm_functions_and_returns() {
        let source = r#"
        fun f(a, b) { return a - b; }
        var r = f(10, 3);
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "r", Value::Number(7.0));
    }

    #[test]
    fn vm_function_without_return_yields_nil() {
        let vm = run("fun f() {} var r = f();").unwrap();
        assert_global(&vm, "r", Value::Nil);
    }

    #[test]
    fn vm_arity_mismatch() {
        let message = runtime_message(run_err("fun f(a, b) { return a - b; } f(1);"));
        assert_eq!(message, "Expect 2 arguments but got 1.");
    }

    #[test]
    fn vm_call_non_callable() {
        let message = runtime_message(run_err("var a = 1; a();"));
        assert_eq!(message, "Can only call functions and classes.");
    }

    #[test]
    fn vm_stack_overflow() {
        let message = runtime_message(run_err("fun f() { f(); } f();"));
        assert_eq!(message, "Stack overflow.");
    }

    #[test]
    fn vm_fibonacci_rec() {
        let source = r#"
        fun fib(n) {
            if (n < 2) { return n; }
            return fib(n - 2) + fib(n - 1);
        }
        var r = fib(10);
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "r", Value::Number(55.0));
    }

    #[test]
    fn vm_closure_counter() {
        let source = r#"
        fun make() {
            var x = 0;
            fun inc() {
                x = x + 1;
                return x;
            }
            return inc;
        }
        var c = make();
        var a = c();
        var b = c();
        var d = c();
        "#;
        let vm = run(source).unwrap();
        // The closure keeps mutating its captured cell across calls.
        assert_global(&vm, "a", Value::Number(1.0));
        assert_global(&vm, "b", Value::Number(2.0));
        assert_global(&vm, "d", Value::Number(3.0));
    }

    #[test]
    fn vm_sibling_closures_share_cell() {
        let source = r#"
        var get;
        var set;
        fun make() {
            var x = 0;
            fun g() { return x; }
            fun s(v) { x = v; }
            get = g;
            set = s;
        }
        make();
        set(41);
        var observed = get();
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "observed", Value::Number(41.0));
    }

    #[test]
    fn vm_closure_over_block_local() {
        let source = r#"
        var get;
        {
            var x = 10;
            fun g() { return x; }
            get = g;
        }
        var r = get();
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "r", Value::Number(10.0));
    }

    #[test]
    fn vm_transitive_capture() {
        let source = r#"
        fun outer() {
            var x = "value";
            fun middle() {
                fun inner() {
                    return x;
                }
                return inner;
            }
            return middle;
        }
        var mid = outer();
        var in_ = mid();
        var r = in_();
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "r", Value::string("value".to_owned()));
    }

    #[test]
    fn vm_closures_capture_distinct_calls() {
        let source = r#"
        fun make(value) {
            fun closure() { return value; }
            return closure;
        }
        var doughnut = make("doughnut");
        var bagel = make("bagel");
        var a = doughnut();
        var b = bagel();
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "a", Value::string("doughnut".to_owned()));
        assert_global(&vm, "b", Value::string("bagel".to_owned()));
    }

    #[test]
    fn vm_list_literal_and_subscript() {
        let source = r#"
        var xs = [10, 20, 30];
        xs[1] = 99;
        var a = xs[0];
        var b = xs[1];
        var c = xs[2];
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "a", Value::Number(10.0));
        assert_global(&vm, "b", Value::Number(99.0));
        assert_global(&vm, "c", Value::Number(30.0));
    }

    #[test]
    fn vm_store_is_an_expression() {
        let vm = run("var xs = [1]; var r = xs[0] = 5;").unwrap();
        assert_global(&vm, "r", Value::Number(5.0));
    }

    #[test]
    fn vm_index_out_of_range() {
        let message = runtime_message(run_err("var xs = [1, 2]; var r = xs[2];"));
        assert_eq!(message, "List index out of range.");
    }

    #[test]
    fn vm_index_type_errors() {
        let message = runtime_message(run_err("var a = 1; var r = a[0];"));
        assert_eq!(message, "Invalid type to index into.");

        let message = runtime_message(run_err(r#"var xs = [1]; var r = xs["0"];"#));
        assert_eq!(message, "List index is not a number.");
    }

    #[test]
    fn vm_native_mod() {
        let vm = run("var r = mod(10, 3);").unwrap();
        assert_global(&vm, "r", Value::Number(1.0));
    }

    #[test]
    fn vm_native_list_surface() {
        let source = r#"
        var xs = list(2);
        var empty_slot = xs[0];
        append(xs, 7);
        var n = len(xs);
        var last = pop(xs);
        var after = len(xs);
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "empty_slot", Value::Nil);
        assert_global(&vm, "n", Value::Number(3.0));
        assert_global(&vm, "last", Value::Number(7.0));
        assert_global(&vm, "after", Value::Number(2.0));
    }

    #[test]
    fn vm_native_error_propagates() {
        let message = runtime_message(run_err("pop([]);"));
        assert_eq!(message, "Cannot pop from an empty list.");
    }

    #[test]
    fn vm_native_clock_returns_number() {
        let vm = run("var r = clock();").unwrap();
        match global(&vm, "r") {
            Value::Number(seconds) => assert!(seconds > 0.0),
            other => panic!("expected number, got {}", other),
        }
    }

    #[test]
    fn vm_negate_type_error() {
        let message = runtime_message(run_err(r#"var r = -"a";"#));
        assert_eq!(message, "Operand must be a number.");
    }

    #[test]
    fn vm_arithmetic_type_error() {
        let message = runtime_message(run_err("var r = true + 1;"));
        assert_eq!(message, "Operands must be numbers.");
    }

    #[test]
    fn vm_equality() {
        let source = r#"
        var a = 1 == 1;
        var b = 1 == 2;
        var c = "x" == "x";
        var d = nil == nil;
        var e = 1 == "1";
        var f = [1] == [1];
        "#;
        let vm = run(source).unwrap();
        assert_global(&vm, "a", Value::Bool(true));
        assert_global(&vm, "b", Value::Bool(false));
        assert_global(&vm, "c", Value::Bool(true));
        assert_global(&vm, "d", Value::Bool(true));
        assert_global(&vm, "e", Value::Bool(false));
        assert_global(&vm, "f", Value::Bool(true));
    }

    #[test]
    fn vm_stack_balanced_after_script() {
        let vm = run("var a = 1; print a; { var b = 2; b = b + 1; }").unwrap();
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn vm_runtime_error_resets_stack() {
        let mut vm = VM::new();
        assert!(vm.interpret("print missing;").is_err());
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        // The VM stays usable afterwards.
        assert!(vm.interpret("var a = 1;").is_ok());
    }

    #[test]
    fn vm_compile_error_result() {
        let mut vm = VM::new();
        match vm.interpret("print ;") {
            Err(VMError::CompileError(_)) => {}
            other => panic!("expected compile error, got {:?}", other),
        }
    }
}
