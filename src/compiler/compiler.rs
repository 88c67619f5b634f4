use std::rc::Rc;

use super::scanner::Scanner;
use super::token::{Token, TokenKind};
use super::{CompileError, Result};
use crate::debug::{self, LOG_COMPILED_CODE};
use crate::vm::instruction::OpCode;
use crate::vm::object::Function;
use crate::vm::value::{Object, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_LIST_ITEMS: usize = 255;
const MAX_ARITY: usize = 255;

#[derive(Debug)]
struct Local<'src> {
    name: Token<'src>,

    // Nesting level of this local; -1 marks declared-but-uninitialized.
    depth: i64,

    // Whether a closure has captured this slot, so leaving the scope must
    // close it instead of popping it.
    is_captured: bool,
}

impl<'src> Local<'src> {
    fn new(name: Token<'src>, depth: i64) -> Self {
        Self {
            name,
            depth,
            is_captured: false,
        }
    }
}

#[derive(Debug)]
struct UpvalueDescriptor {
    index: u8,
    is_local: bool,
}

#[derive(Debug, PartialEq)]
enum FunctionKind {
    Function,
    Script,
}

/// Per-function compilation state. Nested function declarations push a new
/// state; the enclosing ones below it on the stack are consulted when a name
/// resolves to a captured variable.
#[derive(Debug)]
struct FunctionState<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: i64,
}

impl<'src> FunctionState<'src> {
    fn script() -> Self {
        Self {
            function: Function::blank(),
            kind: FunctionKind::Script,
            // Slot 0 always holds the called closure itself.
            locals: vec![Local::new(Token::empty(), 0)],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    fn new(name: String) -> Self {
        Self {
            function: Function::new(name),
            kind: FunctionKind::Function,
            locals: vec![Local::new(Token::empty(), 0)],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    fn emit_return(&mut self, line: u64) {
        self.function.chunk.write(OpCode::Nil, line);
        self.function.chunk.write(OpCode::Return, line);
    }

    /// Newest-to-oldest scan; the index of a match is the frame slot.
    fn resolve_local(&self, token: &Token<'src>) -> Result<Option<u8>> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if token.data == local.name.data {
                if local.depth == -1 {
                    return Err(CompileError::LocalInitializer);
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn add_local(&mut self, name: Token<'src>) -> Result<()> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(CompileError::LocalCount);
        }
        self.locals.push(Local::new(name, -1));
        Ok(())
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8> {
        // Reuse an existing descriptor for the same capture.
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }

        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(CompileError::UpvalueCount);
        }
        self.upvalues.push(UpvalueDescriptor { index, is_local });
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }

    fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.locals.last_mut() {
            local.depth = self.scope_depth;
        }
    }
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    parser: Parser<'src>,
    states: Vec<FunctionState<'src>>,
    errors: Vec<CompileError>,
}

impl<'src> Compiler<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            scanner: Scanner::new(source),
            parser: Parser::new(),
            states: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Compiles the whole source into the script function. On any error the
    /// compiler still consumes tokens to the end for diagnostic coverage, but
    /// no function is returned.
    pub fn compile(mut self) -> Result<Function> {
        self.advance();
        self.states.push(FunctionState::script());

        while !self.match_token(TokenKind::EOF)? {
            self.decl()?;
        }

        let mut state = self.states.pop().ok_or(CompileError::InternalError)?;
        state.emit_return(self.parser.line());

        if !self.errors.is_empty() {
            return Err(CompileError::Aggregate(self.errors));
        }

        if LOG_COMPILED_CODE {
            debug::disassemble_chunk(&state.function.chunk, state.function.function_name());
        }
        Ok(state.function)
    }

    /// Loads the next token, reporting and skipping error tokens.
    fn advance(&mut self) {
        std::mem::swap(&mut self.parser.previous, &mut self.parser.current);

        loop {
            match self.scanner.scan_token() {
                Ok(token) => {
                    self.parser.current = Some(token);
                    return;
                }
                Err(err) => {
                    eprintln!("{}", err);
                    self.errors.push(err.into());
                }
            }
        }
    }

    fn match_token(&mut self, kind: TokenKind) -> Result<bool> {
        if self.parser.check_current(kind)? {
            self.advance();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, expected: TokenKind, message: &'static str) -> Result<()> {
        if self.parser.check_current(expected)? {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn error_at_current(&self, message: &'static str) -> CompileError {
        error_at(self.parser.current.as_ref(), message)
    }

    fn error_at_previous(&self, message: &'static str) -> CompileError {
        error_at(self.parser.previous.as_ref(), message)
    }

    /// Reports a failed declaration and skips ahead to the next statement
    /// boundary so one mistake does not cascade.
    fn decl(&mut self) -> Result<()> {
        if let Err(err) = self.declaration() {
            match &err {
                CompileError::Parse { .. } | CompileError::Scanner(_) => eprintln!("{}", err),
                _ => eprintln!("[line {}] Error: {}", self.parser.line(), err),
            }
            self.errors.push(err);
            self.synchronize()?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        loop {
            if let Some(previous) = &self.parser.previous {
                if previous.kind == TokenKind::Semicolon {
                    return Ok(());
                }
            }

            match self.parser.current()?.kind {
                TokenKind::EOF
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return Ok(()),
                _ => {}
            }

            self.advance();
        }
    }

    fn state(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().expect("function state stack empty")
    }

    fn state_ref(&self) -> &FunctionState<'src> {
        self.states.last().expect("function state stack empty")
    }

    fn code_len(&self) -> usize {
        self.state_ref().function.chunk.code.len()
    }

    fn emit(&mut self, op_code: OpCode) {
        let line = self.parser.line();
        self.state().function.chunk.write(op_code, line);
    }

    fn emit_bytes(&mut self, op_code: OpCode, index: u8) {
        let line = self.parser.line();
        self.state().function.chunk.write_index(op_code, index, line);
    }

    /// Emits a jump with a placeholder operand and returns the operand's
    /// offset so it can be patched once the target is known.
    fn emit_jump(&mut self, op_code: OpCode) -> usize {
        let line = self.parser.line();
        let chunk = &mut self.state().function.chunk;
        chunk.write(op_code, line);
        chunk.write_byte(0xff, line);
        chunk.write_byte(0xff, line);
        chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) -> Result<()> {
        let code = &mut self.state().function.chunk.code;

        // Adjust for the two operand bytes themselves.
        let jump = code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(CompileError::InvalidJump);
        }
        code[offset] = (jump & 0xff) as u8;
        code[offset + 1] = ((jump >> 8) & 0xff) as u8;
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<()> {
        self.emit(OpCode::Loop);

        // Skip backwards over the operand bytes as well.
        let offset = self.code_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(CompileError::InvalidJump);
        }
        let line = self.parser.line();
        let chunk = &mut self.state().function.chunk;
        chunk.write_byte((offset & 0xff) as u8, line);
        chunk.write_byte(((offset >> 8) & 0xff) as u8, line);
        Ok(())
    }

    fn add_constant(&mut self, constant: Value) -> Result<u8> {
        self.state()
            .function
            .chunk
            .add_constant(constant)
            .ok_or(CompileError::TooManyConstants)
    }

    fn identifier_constant(&mut self, name: &str) -> Result<u8> {
        self.add_constant(Value::string(name.to_owned()))
    }

    // ---- declarations ----

    fn declaration(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Fun)? {
            self.fun_declaration()
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn var_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect variable name.")?;

        if self.match_token(TokenKind::Equal)? {
            self.expression()?;
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        )?;

        self.define_variable(global)
    }

    fn fun_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect function name.")?;
        // The name is usable inside the body, enabling recursion.
        self.state().mark_initialized();
        self.function()?;
        self.define_variable(global)
    }

    fn function(&mut self) -> Result<()> {
        let name = self.parser.previous()?.data.to_owned();
        self.states.push(FunctionState::new(name));
        self.state().scope_depth += 1;

        let body = self.function_signature_and_body();

        // Pop the nested state before propagating any error so panic-mode
        // recovery never leaves an orphan on the state stack.
        let mut state = self.states.pop().ok_or(CompileError::InternalError)?;
        body?;

        state.emit_return(self.parser.line());

        if LOG_COMPILED_CODE {
            debug::disassemble_chunk(&state.function.chunk, state.function.function_name());
        }

        let upvalues = state.upvalues;
        let index = self.add_constant(Value::Object(Object::Function(Rc::new(state.function))))?;
        self.emit_bytes(OpCode::Closure, index);

        let line = self.parser.line();
        for upvalue in &upvalues {
            let chunk = &mut self.state().function.chunk;
            chunk.write_byte(upvalue.is_local as u8, line);
            chunk.write_byte(upvalue.index, line);
        }
        Ok(())
    }

    fn function_signature_and_body(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after function name.")?;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                self.state().function.arity += 1;
                if self.state_ref().function.arity > MAX_ARITY {
                    return Err(CompileError::ParameterCount);
                }

                let parameter = self.parse_variable("Expect parameter name.")?;
                self.define_variable(parameter)?;

                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::ParenRight, "Expect ')' after parameters.")?;

        self.consume(TokenKind::BraceLeft, "Expect '{' before function body.")?;
        self.block()
    }

    fn parse_variable(&mut self, message: &'static str) -> Result<u8> {
        self.consume(TokenKind::Identifier, message)?;

        self.declare_variable()?;
        if self.state_ref().scope_depth > 0 {
            return Ok(0);
        }

        let name = self.parser.previous()?.data;
        self.identifier_constant(name)
    }

    fn declare_variable(&mut self) -> Result<()> {
        // Globals are late-bound; only locals are declared here.
        if self.state_ref().scope_depth == 0 {
            return Ok(());
        }

        let name = *self.parser.previous()?;
        let state = self.state_ref();
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if name.data == local.name.data {
                return Err(CompileError::VariableAlreadyDeclared);
            }
        }

        self.state().add_local(name)
    }

    fn define_variable(&mut self, index: u8) -> Result<()> {
        if self.state_ref().scope_depth > 0 {
            self.state().mark_initialized();
            return Ok(());
        }
        self.emit_bytes(OpCode::DefineGlobal, index);
        Ok(())
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Print)? {
            self.print_statement()
        } else if self.match_token(TokenKind::If)? {
            self.if_statement()
        } else if self.match_token(TokenKind::Return)? {
            self.return_statement()
        } else if self.match_token(TokenKind::While)? {
            self.while_statement()
        } else if self.match_token(TokenKind::For)? {
            self.for_statement()
        } else if self.match_token(TokenKind::BraceLeft)? {
            self.scope_enter();
            self.block()?;
            self.scope_leave();
            Ok(())
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.")?;
        self.emit(OpCode::Print);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<()> {
        if self.state_ref().kind == FunctionKind::Script {
            return Err(CompileError::ReturnAtTopLevel);
        }

        if self.match_token(TokenKind::Semicolon)? {
            let line = self.parser.line();
            self.state().emit_return(line);
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
            self.emit(OpCode::Return);
        }
        Ok(())
    }

    fn if_statement(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop); // Condition, on the true path.
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump)?;
        self.emit(OpCode::Pop); // Condition, on the false path.

        if self.match_token(TokenKind::Else)? {
            self.statement()?;
        }
        self.patch_jump(else_jump)
    }

    fn while_statement(&mut self) -> Result<()> {
        let loop_start = self.code_len();

        self.consume(TokenKind::ParenLeft, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        self.statement()?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<()> {
        self.scope_enter();
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'for'.")?;

        // Initializer clause: empty, a fresh declaration, or a reassignment
        // of an existing variable (compiled as an expression statement).
        if self.match_token(TokenKind::Semicolon)? {
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.code_len();

        // Condition clause.
        let exit_jump = if self.match_token(TokenKind::Semicolon)? {
            None
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.")?;

            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit(OpCode::Pop);
            Some(exit_jump)
        };

        // Increment clause. It runs after the body, so first entry jumps over
        // it into the body; the body loops back here, and the increment loops
        // back to the condition.
        if !self.match_token(TokenKind::ParenRight)? {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();

            self.expression()?;
            self.emit(OpCode::Pop);
            self.consume(TokenKind::ParenRight, "Expect ')' after for clauses.")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.statement()?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit(OpCode::Pop);
        }
        self.scope_leave();
        Ok(())
    }

    fn scope_enter(&mut self) {
        self.state().scope_depth += 1;
    }

    fn scope_leave(&mut self) {
        let line = self.parser.line();
        let state = self.state();
        state.scope_depth -= 1;

        while let Some(local) = state.locals.last() {
            if local.depth <= state.scope_depth {
                break;
            }
            if local.is_captured {
                state.function.chunk.write(OpCode::CloseUpvalue, line);
            } else {
                state.function.chunk.write(OpCode::Pop, line);
            }
            state.locals.pop();
        }
    }

    fn block(&mut self) -> Result<()> {
        while !self.parser.check_current(TokenKind::BraceRight)?
            && !self.parser.check_current(TokenKind::EOF)?
        {
            self.decl()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after block.")
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<()> {
        self.advance();

        let kind = self.parser.previous()?.kind;
        let prefix = match Self::get_rule(kind).prefix {
            Some(prefix) => prefix,
            None => return Err(self.error_at_previous("Expect expression.")),
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign)?;

        while precedence <= Self::get_rule(self.parser.current()?.kind).precedence {
            self.advance();
            let infix = Self::get_rule(self.parser.previous()?.kind)
                .infix
                .ok_or(CompileError::InternalError)?;
            infix(self, can_assign)?;
        }

        // An `=` still sitting here means the target to its left was not
        // assignable.
        if can_assign && self.parser.check_current(TokenKind::Equal)? {
            return Err(self.error_at_current("Invalid assignment target."));
        }

        Ok(())
    }

    fn grouping(&mut self, _can_assign: bool) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after expression.")
    }

    fn number(&mut self, _can_assign: bool) -> Result<()> {
        let value = self.parser.previous()?.data.parse::<f64>()?;
        let index = self.add_constant(Value::Number(value))?;
        self.emit_bytes(OpCode::Constant, index);
        Ok(())
    }

    fn string(&mut self, _can_assign: bool) -> Result<()> {
        let lexeme = self.parser.previous()?.data;
        // Strip the surrounding quotes; interior escapes stay as written.
        let string = lexeme[1..lexeme.len() - 1].to_owned();
        let index = self.add_constant(Value::string(string))?;
        self.emit_bytes(OpCode::Constant, index);
        Ok(())
    }

    fn literal(&mut self, _can_assign: bool) -> Result<()> {
        match self.parser.previous()?.kind {
            TokenKind::Nil => self.emit(OpCode::Nil),
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            _ => return Err(CompileError::InternalError),
        }
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Result<()> {
        let token = *self.parser.previous()?;
        self.named_variable(token, can_assign)
    }

    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) -> Result<()> {
        let (arg, get_op, set_op) = if let Some(arg) = self.state_ref().resolve_local(&token)? {
            (arg, OpCode::GetLocal, OpCode::SetLocal)
        } else if let Some(arg) = self.resolve_upvalue(self.states.len() - 1, &token)? {
            (arg, OpCode::GetUpvalue, OpCode::SetUpvalue)
        } else {
            let arg = self.identifier_constant(token.data)?;
            (arg, OpCode::GetGlobal, OpCode::SetGlobal)
        };

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.emit_bytes(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::PlusPlus)? {
            self.emit_increment(get_op, set_op, arg, OpCode::Add)?;
        } else if can_assign && self.match_token(TokenKind::MinusMinus)? {
            self.emit_increment(get_op, set_op, arg, OpCode::Subtract)?;
        } else {
            self.emit_bytes(get_op, arg);
        }
        Ok(())
    }

    /// Post-increment: the pre-update value stays on the stack, a copy is
    /// adjusted by one and written back, and the write's result is popped.
    fn emit_increment(
        &mut self,
        get_op: OpCode,
        set_op: OpCode,
        arg: u8,
        op: OpCode,
    ) -> Result<()> {
        self.emit_bytes(get_op, arg);
        self.emit_bytes(get_op, arg);
        let one = self.add_constant(Value::Number(1.0))?;
        self.emit_bytes(OpCode::Constant, one);
        self.emit(op);
        self.emit_bytes(set_op, arg);
        self.emit(OpCode::Pop);
        Ok(())
    }

    /// Resolves a capture in the function state at `state_index`, recursively
    /// lifting it through every enclosing function.
    fn resolve_upvalue(&mut self, state_index: usize, token: &Token<'src>) -> Result<Option<u8>> {
        if state_index == 0 {
            return Ok(None);
        }
        let enclosing = state_index - 1;

        if let Some(local) = self.states[enclosing].resolve_local(token)? {
            self.states[enclosing].locals[local as usize].is_captured = true;
            let index = self.states[state_index].add_upvalue(local, true)?;
            return Ok(Some(index));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, token)? {
            let index = self.states[state_index].add_upvalue(upvalue, false)?;
            return Ok(Some(index));
        }

        Ok(None)
    }

    fn unary(&mut self, _can_assign: bool) -> Result<()> {
        let operator = self.parser.previous()?.kind;
        self.parse_precedence(Precedence::Unary)?;

        match operator {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => return Err(CompileError::InternalError),
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> Result<()> {
        let operator = self.parser.previous()?.kind;

        // Left-associative: the right operand binds one level tighter.
        let rule = Self::get_rule(operator);
        self.parse_precedence(rule.precedence.higher())?;

        match operator {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::Less => self.emit(OpCode::Less),
            TokenKind::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenKind::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenKind::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => return Err(CompileError::InternalError),
        }
        Ok(())
    }

    fn and(&mut self, _can_assign: bool) -> Result<()> {
        // Falsey left operand short-circuits past the right one.
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or(&mut self, _can_assign: bool) -> Result<()> {
        // Falsey left operand falls through to the right one; a truthy left
        // operand jumps past it.
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump)?;
        self.emit(OpCode::Pop);

        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn call(&mut self, _can_assign: bool) -> Result<()> {
        let arg_count = self.argument_list()?;
        self.emit_bytes(OpCode::Call, arg_count);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8> {
        let mut arg_count: usize = 0;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                self.expression()?;
                if arg_count == MAX_ARITY {
                    return Err(CompileError::ArgumentCount);
                }
                arg_count += 1;

                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }

        self.consume(TokenKind::ParenRight, "Expect ')' after arguments.")?;
        Ok(arg_count as u8)
    }

    fn list(&mut self, _can_assign: bool) -> Result<()> {
        let mut count: usize = 0;
        if !self.parser.check_current(TokenKind::BracketRight)? {
            loop {
                if self.parser.check_current(TokenKind::BracketRight)? {
                    break; // Trailing comma.
                }

                // Elements bind above assignment so `,` stays a separator.
                self.parse_precedence(Precedence::Or)?;

                if count == MAX_LIST_ITEMS {
                    return Err(CompileError::ListLimit);
                }
                count += 1;

                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }

        self.consume(TokenKind::BracketRight, "Expect ']' after list literal.")?;
        self.emit_bytes(OpCode::List, count as u8);
        Ok(())
    }

    fn subscript(&mut self, can_assign: bool) -> Result<()> {
        self.parse_precedence(Precedence::Or)?;
        self.consume(TokenKind::BracketRight, "Expect ']' after index.")?;

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.emit(OpCode::Store);
        } else {
            self.emit(OpCode::Index);
        }
        Ok(())
    }

    fn get_rule(kind: TokenKind) -> ParseRule<'src> {
        match kind {
            TokenKind::ParenLeft => {
                ParseRule::new(Some(Self::grouping), Some(Self::call), Precedence::Call)
            }
            TokenKind::BracketLeft => {
                ParseRule::new(Some(Self::list), Some(Self::subscript), Precedence::Subscript)
            }
            TokenKind::Minus => {
                ParseRule::new(Some(Self::unary), Some(Self::binary), Precedence::Term)
            }
            TokenKind::Plus => ParseRule::new(None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash => ParseRule::new(None, Some(Self::binary), Precedence::Factor),
            TokenKind::Star => ParseRule::new(None, Some(Self::binary), Precedence::Factor),
            TokenKind::Bang => ParseRule::new(Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual => ParseRule::new(None, Some(Self::binary), Precedence::Equality),
            TokenKind::EqualEqual => ParseRule::new(None, Some(Self::binary), Precedence::Equality),
            TokenKind::Greater => ParseRule::new(None, Some(Self::binary), Precedence::Comparison),
            TokenKind::GreaterEqual => {
                ParseRule::new(None, Some(Self::binary), Precedence::Comparison)
            }
            TokenKind::Less => ParseRule::new(None, Some(Self::binary), Precedence::Comparison),
            TokenKind::LessEqual => {
                ParseRule::new(None, Some(Self::binary), Precedence::Comparison)
            }
            TokenKind::Identifier => ParseRule::new(Some(Self::variable), None, Precedence::None),
            TokenKind::String => ParseRule::new(Some(Self::string), None, Precedence::None),
            TokenKind::Number => ParseRule::new(Some(Self::number), None, Precedence::None),
            TokenKind::And => ParseRule::new(None, Some(Self::and), Precedence::And),
            TokenKind::Or => ParseRule::new(None, Some(Self::or), Precedence::Or),
            TokenKind::False => ParseRule::new(Some(Self::literal), None, Precedence::None),
            TokenKind::True => ParseRule::new(Some(Self::literal), None, Precedence::None),
            TokenKind::Nil => ParseRule::new(Some(Self::literal), None, Precedence::None),
            _ => ParseRule::new(None, None, Precedence::None),
        }
    }
}

fn error_at(token: Option<&Token<'_>>, message: &'static str) -> CompileError {
    match token {
        Some(token) if token.kind == TokenKind::EOF => CompileError::Parse {
            message,
            at: "end".to_owned(),
            line: token.line,
        },
        Some(token) => CompileError::Parse {
            message,
            at: format!("'{}'", token.data),
            line: token.line,
        },
        None => CompileError::Parse {
            message,
            at: "end".to_owned(),
            line: 0,
        },
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool) -> Result<()>;

#[derive(Clone, Copy)]
struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

impl<'src> ParseRule<'src> {
    fn new(
        prefix: Option<ParseFn<'src>>,
        infix: Option<ParseFn<'src>>,
        precedence: Precedence,
    ) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // ==, !=
    Comparison, // <, >, <=, >=
    Term,       // +, -
    Factor,     // *, /
    Unary,      // !, -
    Call,       // ()
    Subscript,  // []
    Primary,
}

impl Precedence {
    fn higher(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Subscript,
            Precedence::Subscript => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

struct Parser<'src> {
    current: Option<Token<'src>>,
    previous: Option<Token<'src>>,
}

impl<'src> Parser<'src> {
    fn new() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }

    fn previous(&self) -> Result<&Token<'src>> {
        self.previous.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn current(&self) -> Result<&Token<'src>> {
        self.current.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn check_current(&self, kind: TokenKind) -> Result<bool> {
        Ok(self.current()?.kind == kind)
    }

    fn line(&self) -> u64 {
        self.previous.as_ref().map(|token| token.line).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug;

    fn compile(source: &str) -> Result<Function> {
        Compiler::new(source).compile()
    }

    #[test]
    fn simple_test() {
        assert!(compile("(-1 + 2) * 3 - -4;").is_ok());
    }

    #[test]
    fn compile_math() {
        assert!(compile("1.5 + 1.3 * 3.5;").is_ok());
    }

    #[test]
    fn compile_print() {
        assert!(compile("print 1;").is_ok());
    }

    #[test]
    fn compile_expected_bytes() {
        let function = compile("print 1 + 2 * 3;").unwrap();
        let expected: Vec<u8> = vec![
            OpCode::Constant.into(),
            0,
            OpCode::Constant.into(),
            1,
            OpCode::Constant.into(),
            2,
            OpCode::Multiply.into(),
            OpCode::Add.into(),
            OpCode::Print.into(),
            OpCode::Nil.into(),
            OpCode::Return.into(),
        ];
        assert_eq!(function.chunk.code, expected);
    }

    #[test]
    fn compile_constants() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        print breakfast;
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_weird_assignments() {
        assert!(compile("a * b = c + d;").is_err());
    }

    #[test]
    fn compile_assign_to_itself() {
        let source = r#"
        var a = 1;
        {
            var a = a;
        }"#;
        assert!(compile(source).is_err());
    }

    #[test]
    fn compile_redeclaration_same_scope() {
        assert!(compile("{ var a = 1; var a = 2; }").is_err());
        // A shadow in an inner scope is fine.
        assert!(compile("{ var a = 1; { var b = a; } }").is_ok());
    }

    #[test]
    fn compile_if_statement() {
        assert!(compile("if (1) {}").is_ok());
        assert!(compile("if (1) {} else {}").is_ok());
    }

    #[test]
    fn compile_and_or() {
        assert!(compile("print true and false;").is_ok());
        assert!(compile("print true or false;").is_ok());
    }

    #[test]
    fn compile_while() {
        assert!(compile("while (true) {}").is_ok());
    }

    #[test]
    fn compile_for_basic() {
        assert!(compile("for (var i = 0; i < 10; i = i + 1) {}").is_ok());
    }

    #[test]
    fn compile_for_clauses_optional() {
        assert!(compile("var i; for (i = 0; i < 3; i = i + 1) { print i; }").is_ok());
        assert!(compile("for (;;) {}").is_ok());
    }

    #[test]
    fn compile_increment_suffixes() {
        assert!(compile("var a = 0; a++;").is_ok());
        assert!(compile("var a = 0; a--;").is_ok());
        assert!(compile("{ var a = 0; a++; }").is_ok());
    }

    #[test]
    fn compile_comments() {
        assert!(compile("# nothing here\nprint 1; # trailing\n").is_ok());
    }

    #[test]
    fn compile_fun_simple() {
        let source = r#"
        fun hello() {}
        fun hello2(a) {}
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_fun_arity_recorded() {
        let function = compile("fun f(a, b, c) { return a; }").unwrap();
        let nested = match function.chunk.read_constant(1) {
            Some(Value::Object(Object::Function(f))) => f.clone(),
            other => panic!("expected function constant, got {:?}", other),
        };
        assert_eq!(nested.arity, 3);
        assert_eq!(nested.upvalue_count, 0);
    }

    #[test]
    fn compile_return_at_top_level() {
        assert!(compile("return 1;").is_err());
        assert!(compile("fun f() { return 1; } f();").is_ok());
    }

    #[test]
    fn compile_fibonacci_rec() {
        let source = r#"
            fun fib(n) {
                if (n == 0) {
                    return 0;
                }
                return fib(n-2) + fib(n-1);
            }
            var a = fib(20);
            print a;
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_closure_counts_upvalues() {
        let source = r#"
            fun outer() {
                var x = 1;
                fun inner() {
                    print x;
                    x = x + 1;
                }
                return inner;
            }
        "#;
        let function = compile(source).unwrap();
        let outer = match function.chunk.read_constant(1) {
            Some(Value::Object(Object::Function(f))) => f.clone(),
            other => panic!("expected function constant, got {:?}", other),
        };
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|constant| match constant {
                Value::Object(Object::Function(f)) => Some(f.clone()),
                _ => None,
            })
            .expect("inner function constant");
        // `x` is read and written but captured once.
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn compile_transitive_capture() {
        let source = r#"
            fun outer() {
                var x = "value";
                fun middle() {
                    fun inner() {
                        print x;
                    }
                    return inner;
                }
                return middle;
            }
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_lists() {
        assert!(compile("var xs = [1, 2, 3];").is_ok());
        assert!(compile("var xs = [1, 2, 3,];").is_ok());
        assert!(compile("var xs = [];").is_ok());
        assert!(compile("var x = [1, 2][0];").is_ok());
        assert!(compile("var xs = [1]; xs[0] = 2;").is_ok());
    }

    #[test]
    fn compile_list_too_long() {
        let mut source = String::from("var xs = [");
        for i in 0..257 {
            source.push_str(&format!("{}, ", i));
        }
        source.push_str("];");
        assert!(compile(&source).is_err());
    }

    #[test]
    fn compile_too_many_constants() {
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("print {}.5;", i));
        }
        assert!(compile(&source).is_err());
    }

    #[test]
    fn compile_subscript_store_bytes() {
        let function = compile("var xs = [7]; xs[0] = 9;").unwrap();
        assert!(function.chunk.code.contains(&OpCode::Store.into()));
        assert!(!function.chunk.code.contains(&OpCode::Index.into()));
    }

    #[test]
    fn compile_errors_do_not_abort_scan() {
        // Both statements are bad; panic mode recovers between them and both
        // are reported in the aggregate.
        let err = compile("var 1 = 2; print ;").unwrap_err();
        match err {
            CompileError::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {:?}", other),
        }
    }

    #[test]
    fn jumps_land_on_instruction_boundaries() {
        let source = r#"
            var total = 0;
            for (var i = 0; i < 5; i = i + 1) {
                if (i == 2 or i == 3) {
                    total = total + i;
                } else {
                    while (false) { total = 0; }
                }
            }
            print total and 1;
        "#;
        let function = compile(source).unwrap();
        let chunk = &function.chunk;

        let mut boundaries = std::collections::HashSet::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            boundaries.insert(offset);
            let (_, bytes) = debug::disassemble_instruction(chunk, offset);
            offset += bytes;
        }
        boundaries.insert(chunk.code.len());

        let mut offset = 0;
        while offset < chunk.code.len() {
            let op_code = OpCode::from(chunk.code[offset]);
            let (_, bytes) = debug::disassemble_instruction(chunk, offset);
            match op_code {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    let jump = (chunk.code[offset + 2] as usize) << 8
                        | chunk.code[offset + 1] as usize;
                    assert!(boundaries.contains(&(offset + 3 + jump)));
                }
                OpCode::Loop => {
                    let jump = (chunk.code[offset + 2] as usize) << 8
                        | chunk.code[offset + 1] as usize;
                    assert!(boundaries.contains(&(offset + 3 - jump)));
                }
                _ => {}
            }
            offset += bytes;
        }
    }

    #[test]
    fn every_code_byte_has_a_line() {
        let function = compile("var a = 1;\nif (a) {\n print a;\n}\n").unwrap();
        let chunk = &function.chunk;
        for offset in 0..chunk.code.len() {
            assert!(chunk.lines.get(offset).is_some());
        }
    }
}
