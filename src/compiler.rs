use crate::chunk::{Chunk, OpCode};
use crate::objects::object::Object;
use crate::objects::object_function::ObjectFunction;
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;
use crate::vm::Vm;

/// Single-pass compiler: scans, parses and emits bytecode in one traversal.
/// One `Compiler` per nested function compilation; the innermost is active.
pub struct Parser<'a> {
    vm: &'a mut Vm,
    scanner: Scanner<'a>,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'a>>,
    class_compilers: Vec<ClassCompiler>,
}

struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

struct Compiler<'a> {
    function: *mut ObjectFunction,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

struct ClassCompiler {
    has_superclass: bool,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Term,
            7 => Precedence::Factor,
            8 => Precedence::Unary,
            9 => Precedence::Call,
            10 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParserFn = fn(&mut Parser<'_>, bool);

#[derive(Debug, Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(
        prefix: Option<ParserFn>,
        infix: Option<ParserFn>,
        precedence: Precedence,
    ) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

const RULES: [ParseRule; TokenType::Eof as usize + 1] = {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::Eof as usize + 1];

    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.grouping()),
        Some(|parser, _can_assign| parser.call()),
        Precedence::Call,
    );

    rules[TokenType::Dot as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.dot(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Plus as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Slash as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Star as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Bang as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        None,
        Precedence::None,
    );

    rules[TokenType::BangEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::EqualEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::Greater as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::GreaterEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Less as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::LessEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );

    rules[TokenType::String as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.string()),
        None,
        Precedence::None,
    );

    rules[TokenType::Number as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.number()),
        None,
        Precedence::None,
    );

    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.and_()),
        Precedence::And,
    );

    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.or_()),
        Precedence::Or,
    );

    rules[TokenType::False as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::True as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::Nil as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::Super as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.super_()),
        None,
        Precedence::None,
    );

    rules[TokenType::This as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.this_()),
        None,
        Precedence::None,
    );

    rules
};

impl<'a> Parser<'a> {
    pub fn new(vm: &'a mut Vm, source: &'a str) -> Parser<'a> {
        let mut parser = Parser {
            vm,
            scanner: Scanner::new(source),
            current: Self::synthetic_token(TokenType::Eof, ""),
            previous: Self::synthetic_token(TokenType::Eof, ""),
            had_error: false,
            panic_mode: false,
            compilers: vec![],
            class_compilers: vec![],
        };
        parser.init_compiler(FunctionType::Script);
        parser
    }

    pub fn compile(mut self) -> Option<*mut ObjectFunction> {
        self.advance();

        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let function = self.end_compiler();
        if self.had_error {
            None
        } else {
            Some(function)
        }
    }

    fn synthetic_token(token_type: TokenType, value: &'static str) -> Token<'static> {
        Token {
            token_type,
            value,
            line: 0,
        }
    }

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("no active compiler")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("no active compiler")
    }

    fn specific_compiler(&self, compiler_index: usize) -> &Compiler<'a> {
        &self.compilers[compiler_index]
    }

    fn specific_compiler_mut(&mut self, compiler_index: usize) -> &mut Compiler<'a> {
        &mut self.compilers[compiler_index]
    }

    fn current_chunk(&self) -> &Chunk {
        unsafe { &(*self.current_compiler().function).chunk }
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        unsafe { &mut (*self.current_compiler().function).chunk }
    }

    fn current_locals(&self) -> &Vec<Local<'a>> {
        &self.current_compiler().locals
    }

    fn current_locals_mut(&mut self) -> &mut Vec<Local<'a>> {
        &mut self.current_compiler_mut().locals
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }
            // Error tokens carry their message as the lexeme.
            let message = self.current.value;
            self.error_at_current(message);
        }
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_constant(&mut self, value: Value) {
        let byte = self.make_constant(value);
        self.emit_bytes(OpCode::Constant.to_byte(), byte);
    }

    fn emit_return(&mut self) {
        // Initializers implicitly return the receiver in slot zero.
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal.to_byte(), 0);
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.emit_byte(OpCode::Return.to_byte());
    }

    /// Begin compiling a function body. The function object lives on the
    /// heap already, so it is parked on the VM's compiler-root stack to
    /// survive collections triggered while its code is being built.
    fn init_compiler(&mut self, function_type: FunctionType) {
        let name = if function_type == FunctionType::Script {
            String::new()
        } else {
            // Called right after the name token was consumed.
            self.previous.value.to_string()
        };
        let function = self.vm.allocate_function(name);
        self.vm.compiler_roots.push(function);

        let mut compiler = Compiler {
            function,
            function_type,
            locals: vec![],
            upvalues: vec![],
            scope_depth: 0,
        };

        // Slot zero holds the callee; inside methods it is the receiver.
        let slot_zero = if function_type == FunctionType::Method
            || function_type == FunctionType::Initializer
        {
            Self::synthetic_token(TokenType::This, "this")
        } else {
            Self::synthetic_token(TokenType::Eof, "")
        };
        compiler.locals.push(Local {
            name: slot_zero,
            depth: 0,
            is_captured: false,
        });

        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> *mut ObjectFunction {
        self.emit_return();

        let compiler = self.compilers.pop().expect("compiler stack underflow");
        let function = compiler.function;
        unsafe {
            (*function).upvalue_count = compiler.upvalues.len();
        }

        debug_feature::disassemble_chunk(self, function);

        self.vm.compiler_roots.pop();
        function
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().find_constant(&value) {
            return index as u8;
        }

        let constant_index = self.current_chunk_mut().add_constant(value);
        if constant_index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant_index as u8
    }

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration();
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.clone();
        let name_constant = self.identifier_constant(self.previous.clone());
        self.declare_variable();

        self.emit_bytes(OpCode::Class.to_byte(), name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);

            if Self::identifier_equal(&class_name, &self.previous) {
                self.error("A class can't inherit from itself.");
            }

            // 'super' lives in a scope of its own so every method closure
            // of this class captures the same superclass slot.
            self.begin_scope();
            self.add_local(Self::synthetic_token(TokenType::Super, "super"));
            self.define_variable(0);

            self.named_variable(class_name.clone(), false);
            self.emit_byte(OpCode::Inherit.to_byte());
            self.class_compilers
                .last_mut()
                .expect("class compiler stack underflow")
                .has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop.to_byte());

        let has_superclass = self
            .class_compilers
            .last()
            .expect("class compiler stack underflow")
            .has_superclass;
        if has_superclass {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.clone());

        let function_type = if self.previous.value == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);

        self.emit_bytes(OpCode::Method.to_byte(), constant);
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it counts as initialized as soon
        // as its name is bound.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);

        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let function = self.current_compiler().function;
                let overflow = unsafe { (*function).arity } == u8::MAX;
                if overflow {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    unsafe {
                        (*function).arity += 1;
                    }
                }

                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = self.current_compiler().upvalues.clone();
        let function = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function as *mut Object));
        self.emit_bytes(OpCode::Closure.to_byte(), constant);

        for upvalue in upvalues.iter() {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn variable_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.clone())
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }

        let mut duplicate = false;
        let variable_name = self.previous.clone();
        let scope_depth = self.current_compiler().scope_depth;
        for local in self.current_locals().iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if Self::identifier_equal(&variable_name, &local.name) {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(variable_name);
    }

    fn add_local(&mut self, variable_name: Token<'a>) {
        if self.current_locals().len() > u8::MAX as usize {
            self.error("Too many local variables in function.");
            return;
        }

        // Depth -1 marks the variable as declared but not yet initialized;
        // mark_initialized patches it once the initializer has compiled.
        self.current_locals_mut().push(Local {
            name: variable_name,
            depth: -1,
            is_captured: false,
        });
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_bytes(OpCode::DefineGlobal.to_byte(), global);
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }
        self.current_locals_mut()
            .last_mut()
            .expect("no local to initialize")
            .depth = scope_depth;
    }

    fn identifier_constant(&mut self, token: Token) -> u8 {
        let string = self.vm.copy_string(token.value);
        self.make_constant(Value::Obj(string as *mut Object))
    }

    fn identifier_equal(left: &Token, right: &Token) -> bool {
        left.token_type == right.token_type && left.value == right.value
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign)
    }

    fn named_variable(&mut self, name: Token, can_assign: bool) {
        let mut opcode_get = OpCode::GetLocal.to_byte();
        let mut opcode_set = OpCode::SetLocal.to_byte();
        let current_compiler_index = self.compilers.len() - 1;
        let mut index = self.resolve_local(current_compiler_index, &name);
        if index == -1 {
            index = self.resolve_upvalue(current_compiler_index, &name);
            if index == -1 {
                // Not a local or upvalue anywhere; it is a global.
                index = self.identifier_constant(name) as i32;
                opcode_get = OpCode::GetGlobal.to_byte();
                opcode_set = OpCode::SetGlobal.to_byte();
            } else {
                opcode_get = OpCode::GetUpvalue.to_byte();
                opcode_set = OpCode::SetUpvalue.to_byte();
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(opcode_set, index as u8);
        } else {
            self.emit_bytes(opcode_get, index as u8);
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token) -> i32 {
        let mut found: i32 = -1;
        let mut uninitialized = false;
        for (index, local) in self
            .specific_compiler(compiler_index)
            .locals
            .iter()
            .enumerate()
            .rev()
        {
            if Self::identifier_equal(name, &local.name) {
                found = index as i32;
                uninitialized = local.depth == -1;
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.specific_compiler_mut(compiler_index - 1).locals[local as usize].is_captured =
                true;
            return self.add_upvalue(compiler_index, local as usize, true) as i32;
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue as usize, false) as i32;
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: usize, is_local: bool) -> usize {
        {
            let compiler = self.specific_compiler_mut(compiler_index);
            for (existing, upvalue) in compiler.upvalues.iter().enumerate() {
                if upvalue.is_local == is_local && upvalue.index as usize == index {
                    return existing;
                }
            }
            if compiler.upvalues.len() < u8::MAX as usize {
                compiler.upvalues.push(Upvalue {
                    index: index as u8,
                    is_local,
                });
                return compiler.upvalues.len() - 1;
            }
        }
        self.error("Too many closure variables in function.");
        0
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print.to_byte());
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return.to_byte());
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.statement();

        let else_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());
        self.patch_jump_offset(then_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump_offset(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump_offset(exit_jump);
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // No initializer clause.
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte()));
            self.emit_byte(OpCode::Pop.to_byte());
        }

        if !self.match_token(TokenType::RightParen) {
            // The increment clause runs after the body, so jump over it now
            // and loop back to it from the body's end.
            let body_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_byte(OpCode::Pop.to_byte());
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump_offset(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump_offset(exit_jump);
            self.emit_byte(OpCode::Pop.to_byte());
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn emit_jump_bytes(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump_offset(&mut self, offset: usize) {
        // -2 to adjust for the jump offset operand itself.
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        let chunk = self.current_chunk_mut();
        chunk.write_by_offset(offset, ((jump >> 8) & 0xff) as u8);
        chunk.write_by_offset(offset + 1, (jump & 0xff) as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop.to_byte());

        // +2 to skip over the operand of the Loop instruction itself.
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        let scope_depth = self.current_compiler().scope_depth;
        loop {
            let captured = match self.current_locals().last() {
                Some(local) if local.depth > scope_depth => local.is_captured,
                _ => break,
            };
            // Captured locals migrate to the heap instead of vanishing.
            let opcode = if captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit_byte(opcode.to_byte());
            self.current_locals_mut().pop();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }

        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.value;
        // Trim the surrounding quotation marks.
        let string = self.vm.copy_string(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(string as *mut Object));
    }

    fn literal(&mut self) {
        match self.previous.token_type {
            TokenType::False => self.emit_byte(OpCode::False.to_byte()),
            TokenType::True => self.emit_byte(OpCode::True.to_byte()),
            TokenType::Nil => self.emit_byte(OpCode::Nil.to_byte()),
            _ => unreachable!("Unexpected literal token."),
        }
    }

    fn unary(&mut self) {
        let operator_type = self.previous.token_type;

        self.parse_precedence(Precedence::Unary);

        match operator_type {
            TokenType::Bang => self.emit_byte(OpCode::Not.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Negate.to_byte()),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator_type = self.previous.token_type;
        let rule = &RULES[operator_type as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator_type {
            TokenType::BangEqual => {
                self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal.to_byte()),
            TokenType::Greater => self.emit_byte(OpCode::Greater.to_byte()),
            TokenType::GreaterEqual => {
                self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Less => self.emit_byte(OpCode::Less.to_byte()),
            TokenType::LessEqual => {
                self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Plus => self.emit_byte(OpCode::Add.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Subtract.to_byte()),
            TokenType::Star => self.emit_byte(OpCode::Multiply.to_byte()),
            TokenType::Slash => self.emit_byte(OpCode::Divide.to_byte()),
            _ => unreachable!("Unexpected binary operator: {}", operator_type),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::And);
        self.patch_jump_offset(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        let end_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());

        self.patch_jump_offset(else_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        self.parse_precedence(Precedence::Or);
        self.patch_jump_offset(end_jump);
    }

    fn call(&mut self) {
        let argument_count = self.argument_list();
        self.emit_bytes(OpCode::Call.to_byte(), argument_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.clone());

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty.to_byte(), name);
        } else if self.match_token(TokenType::LeftParen) {
            // Property access followed by a call collapses into one opcode.
            let argument_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke.to_byte(), name);
            self.emit_byte(argument_count);
        } else {
            self.emit_bytes(OpCode::GetProperty.to_byte(), name);
        }
    }

    fn this_(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self
            .class_compilers
            .last()
            .expect("class compiler stack underflow")
            .has_superclass
        {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.clone());

        self.named_variable(Self::synthetic_token(TokenType::This, "this"), false);
        if self.match_token(TokenType::LeftParen) {
            let argument_count = self.argument_list();
            self.named_variable(Self::synthetic_token(TokenType::Super, "super"), false);
            self.emit_bytes(OpCode::SuperInvoke.to_byte(), name);
            self.emit_byte(argument_count);
        } else {
            self.named_variable(Self::synthetic_token(TokenType::Super, "super"), false);
            self.emit_bytes(OpCode::GetSuper.to_byte(), name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argument_count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argument_count >= 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argument_count += 1;
                }

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argument_count as u8
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence as u8 <= Precedence::Assignment as u8;
        if let Some(prefix) = &RULES[self.previous.token_type as usize].prefix {
            prefix(self, can_assign);
        } else {
            self.error("Expect expression.");
            return;
        }

        while precedence as u8 <= RULES[self.current.token_type as usize].precedence as u8 {
            self.advance();
            if let Some(infix) = &RULES[self.previous.token_type as usize].infix {
                infix(self, can_assign);
            } else {
                self.error("Expect infix parse function.");
                return;
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => (),
            }

            self.advance();
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(&self.previous.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(&self.current.clone(), message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);

        match token.token_type {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => {}
            _ => eprint!(" at '{}'", token.value),
        }

        eprintln!(": {}", message);
        self.had_error = true;
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;

    pub fn disassemble_chunk(parser: &Parser, function: *mut ObjectFunction) {
        if parser.had_error {
            return;
        }
        let function = unsafe { &*function };
        let name = if function.name.is_empty() {
            "<script>"
        } else {
            &function.name
        };
        crate::debug::disassemble_chunk(&function.chunk, name);
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_chunk(_parser: &Parser, _function: *mut ObjectFunction) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object::ObjectType;

    fn compile_source(vm: &mut Vm, source: &str) -> Option<*mut ObjectFunction> {
        let parser = Parser::new(vm, source);
        parser.compile()
    }

    #[test]
    fn test_compile_expression_statement() {
        let mut vm = Vm::new();
        let function = compile_source(&mut vm, "1 + 2;").expect("compile failed");
        let chunk = unsafe { &(*function).chunk };

        assert_eq!(
            chunk.code,
            vec![
                OpCode::Constant.to_byte(),
                0,
                OpCode::Constant.to_byte(),
                1,
                OpCode::Add.to_byte(),
                OpCode::Pop.to_byte(),
                OpCode::Nil.to_byte(),
                OpCode::Return.to_byte(),
            ]
        );
        assert_eq!(chunk.constants[0], Value::Number(1.0));
        assert_eq!(chunk.constants[1], Value::Number(2.0));
    }

    #[test]
    fn test_repeated_literals_share_constant_slot() {
        let mut vm = Vm::new();
        let function = compile_source(&mut vm, "1 + 1;").expect("compile failed");
        let chunk = unsafe { &(*function).chunk };
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn test_locals_compile_to_slots() {
        let mut vm = Vm::new();
        let function =
            compile_source(&mut vm, "{ var a = 1; var b = a; }").expect("compile failed");
        let chunk = unsafe { &(*function).chunk };
        assert!(chunk.code.contains(&OpCode::GetLocal.to_byte()));
        assert!(!chunk.code.contains(&OpCode::GetGlobal.to_byte()));
    }

    #[test]
    fn test_nested_function_records_upvalue() {
        let mut vm = Vm::new();
        let function = compile_source(
            &mut vm,
            "fun outer() { var x = 1; fun inner() { return x; } }",
        )
        .expect("compile failed");

        let outer = unsafe { &(*function).chunk }
            .iter_constants()
            .find_map(|constant| match constant {
                Value::Obj(object)
                    if unsafe { (**object).obj_type } == ObjectType::ObjFunction =>
                {
                    Some(*object as *mut ObjectFunction)
                }
                _ => None,
            })
            .expect("outer function constant missing");

        let inner = unsafe { &(*outer).chunk }
            .iter_constants()
            .find_map(|constant| match constant {
                Value::Obj(object)
                    if unsafe { (**object).obj_type } == ObjectType::ObjFunction =>
                {
                    Some(*object as *mut ObjectFunction)
                }
                _ => None,
            })
            .expect("inner function constant missing");

        assert_eq!(unsafe { (*inner).upvalue_count }, 1);
        assert_eq!(unsafe { &(*inner).name }, "inner");
    }

    #[test]
    fn test_compiler_roots_are_balanced() {
        let mut vm = Vm::new();
        compile_source(&mut vm, "fun f() { fun g() {} } var x = 1;");
        assert!(vm.compiler_roots.is_empty());
    }

    #[test]
    fn test_syntax_error_returns_none() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "var;").is_none());
        assert!(compile_source(&mut vm, "1 +;").is_none());
        assert!(compile_source(&mut vm, "(1 + 2;").is_none());
    }

    #[test]
    fn test_invalid_assignment_target() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "1 = 2;").is_none());
        assert!(compile_source(&mut vm, "a + b = 1;").is_none());
    }

    #[test]
    fn test_duplicate_local_is_an_error() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "{ var a = 1; var a = 2; }").is_none());
    }

    #[test]
    fn test_local_in_own_initializer_is_an_error() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "{ var a = a; }").is_none());
    }

    #[test]
    fn test_return_outside_function_is_an_error() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "return 1;").is_none());
    }

    #[test]
    fn test_value_return_from_initializer_is_an_error() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "class C { init() { return 1; } }").is_none());
    }

    #[test]
    fn test_this_outside_class_is_an_error() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "print this;").is_none());
    }

    #[test]
    fn test_super_misuse_is_an_error() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "print super.m;").is_none());
        assert!(compile_source(&mut vm, "class A { m() { super.m(); } }").is_none());
    }

    #[test]
    fn test_self_inheritance_is_an_error() {
        let mut vm = Vm::new();
        assert!(compile_source(&mut vm, "class A < A {}").is_none());
    }

    #[test]
    fn test_constant_pool_overflow_is_an_error() {
        let mut vm = Vm::new();
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{} = {};", i, i));
        }
        assert!(compile_source(&mut vm, &source).is_none());
    }

    #[test]
    fn test_string_literals_are_interned_at_compile_time() {
        let mut vm = Vm::new();
        let function =
            compile_source(&mut vm, "\"twin\"; \"twin\";").expect("compile failed");
        let chunk = unsafe { &(*function).chunk };
        // Same interned pointer, deduplicated into one constant slot.
        assert_eq!(chunk.constants.len(), 1);
    }
}
