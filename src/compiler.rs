use crate::{
    chunk::{Chunk, OpCode},
    objects::{
        object_function::{FunctionKind, ObjectFunction},
        object_manager::ObjectManager,
    },
    scanner::{Scanner, Token, TokenType},
    table::Table,
    value::{make_float_value, make_int_value, make_ref_value, Value},
};
use std::io::Write;

const MAX_LOCALS: usize = 256;
const MAX_PARAMETERS: u32 = 255;

pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Option<Box<Scanner<'a>>>,
    has_error: bool,
    panic_mode: bool,
    // set when an error fires at Eof; the REPL uses it to ask for more input
    eof_error: bool,
    repl_mode: bool,
    compilers: Vec<Compiler<'a>>,
    class_compilers: Vec<ClassCompiler>,
    object_manager: &'a mut ObjectManager,
    intern_strings: &'a mut Table,
}

struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    is_const: bool,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct Upvalue {
    index: usize,
    is_local: bool,
}

struct ClassCompiler {
    has_superclass: bool,
}

struct Compiler<'a> {
    function: Box<ObjectFunction>,
    kind: FunctionKind,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
    // loop compilation state; saved and restored around nested loops
    break_point: i32,
    continue_point: i32,
    continue_depth: i32,
}

impl<'a> Compiler<'a> {
    pub fn new(kind: FunctionKind) -> Self {
        Compiler {
            function: Box::new(ObjectFunction::new(kind, String::new())),
            kind,
            locals: vec![],
            upvalues: vec![],
            scope_depth: 0,
            break_point: -1,
            continue_point: -1,
            continue_depth: 0,
        }
    }
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
    Factor,     // * / %
    Power,      // **
    Unary,      // ! -
    Call,       // . () []
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
            8 => Precedence::Power,
            9 => Precedence::Unary,
            10 => Precedence::Call,
            11 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParserFn = fn(&mut Parser<'_>, can_assign: bool);

#[derive(Debug, Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParserFn>, infix: Option<ParserFn>, precedence: Precedence) -> Self {
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
        Some(|parser, can_assign| parser.call(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::LeftBracket as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.array_literal()),
        Some(|parser, can_assign| parser.index(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::LeftBrace as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.map_literal()),
        None,
        Precedence::None,
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

    rules[TokenType::Plus as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Term);

    rules[TokenType::Slash as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Factor);

    rules[TokenType::Star as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Factor);

    rules[TokenType::Percent as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Factor);

    rules[TokenType::StarStar as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Power);

    rules[TokenType::Int as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.int_num()), None, Precedence::None);

    rules[TokenType::Float as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.float_num()), None, Precedence::None);

    rules[TokenType::String as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.string()), None, Precedence::None);

    rules[TokenType::False as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::True as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::Nil as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::Bang as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.unary()), None, Precedence::None);

    rules[TokenType::BangEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Equality);

    rules[TokenType::EqualEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Equality);

    rules[TokenType::Greater as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::GreaterEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::Less as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::LessEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );

    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.and(can_assign)),
        Precedence::And,
    );

    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.or(can_assign)),
        Precedence::Or,
    );

    rules[TokenType::This as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.this_()), None, Precedence::None);

    rules[TokenType::Super as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.super_()), None, Precedence::None);

    rules[TokenType::Fun as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.lambda()), None, Precedence::None);

    rules
};

fn synthetic_token(value: &'static str) -> Token<'static> {
    Token {
        token_type: TokenType::Identifier,
        value,
        line: 0,
    }
}

impl<'a> Parser<'a> {
    pub fn new(
        object_manager: &'a mut ObjectManager,
        intern_strings: &'a mut Table,
        repl_mode: bool,
    ) -> Box<Parser<'a>> {
        let mut parser = Box::new(Parser {
            current: Token::empty(),
            previous: Token::empty(),
            scanner: None,
            has_error: false,
            panic_mode: false,
            eof_error: false,
            repl_mode,
            compilers: vec![],
            class_compilers: vec![],
            object_manager,
            intern_strings,
        });
        parser.init_compiler(FunctionKind::Script);
        parser
    }

    /// Did the only error happen at end of input? The REPL treats that as an
    /// unfinished statement and prompts for a continuation line.
    pub fn error_at_eof(&self) -> bool {
        self.eof_error
    }

    pub fn compile(&mut self, source: &'a str) -> Option<Box<ObjectFunction>> {
        self.scanner = Some(Scanner::new(source));
        self.current = Token::empty();
        self.previous = Token::empty();

        self.advance();

        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let function = self.end_compiler();
        if self.has_error {
            None
        } else {
            function
        }
    }

    fn specific_compiler(&self, compiler_index: usize) -> &Compiler<'a> {
        self.compilers.get(compiler_index).expect("compiler index is invalid.")
    }

    fn specific_compiler_mut(&mut self, compiler_index: usize) -> &mut Compiler<'a> {
        self.compilers.get_mut(compiler_index).expect("compiler index is invalid.")
    }

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("No compiler.")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("No compiler.")
    }

    fn current_function(&self) -> &ObjectFunction {
        &self.current_compiler().function
    }

    fn current_function_mut(&mut self) -> &mut ObjectFunction {
        &mut self.current_compiler_mut().function
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_function().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_function_mut().chunk
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
            if let Some(scanner) = &mut self.scanner {
                self.current = scanner.scan_token();
                if self.current.token_type != TokenType::Error {
                    break;
                }

                self.error_at_current(self.current.value);
            } else {
                panic!("Compiler was not initialized correctly.");
            }
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

    fn consume(&mut self, token_type: TokenType, message: &'static str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }

        self.error_at_current(message);
    }

    /// In REPL mode the final semicolon of a line may be omitted.
    fn consume_semicolon(&mut self, message: &'static str) {
        if self.repl_mode && self.check(TokenType::Eof) {
            return;
        }
        self.consume(TokenType::Semicolon, message);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        self.emit_byte(op.to_byte());
        self.emit_byte(operand);
    }

    fn emit_op_u16(&mut self, op: OpCode, operand: u16) {
        self.emit_byte(op.to_byte());
        let line = self.previous.line;
        self.current_chunk_mut().write_u16(operand, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_u16(OpCode::LoadConstant, index);
    }

    fn emit_return(&mut self) {
        if self.current_compiler().kind == FunctionKind::Initializer {
            self.emit_op_u8(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::LoadNil);
        }
        self.emit_op(OpCode::Return);
    }

    fn init_compiler(&mut self, kind: FunctionKind) {
        let mut compiler = Compiler::new(kind);
        // When compiling a function declaration, init_compiler() runs right
        // after the function's name was parsed, so the name is the previous
        // token.
        if kind == FunctionKind::Function || kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            compiler.function.name = self.previous.value.to_string();
        }

        // slot zero holds the callee, or the receiver inside methods
        let slot_zero_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            synthetic_token("this")
        } else {
            Token::empty()
        };
        compiler.locals.push(Local {
            name: slot_zero_name,
            depth: 0,
            is_const: false,
            is_captured: false,
        });
        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> Option<Box<ObjectFunction>> {
        self.emit_return();

        if self.current_function().name.is_empty() {
            debug_feature::disassemble_chunk(self, "<script>");
        } else {
            let function_name = self.current_function().name.clone();
            debug_feature::disassemble_chunk(self, &function_name);
        }

        let upvalue_count = self.current_compiler().upvalues.len();
        let mut function = std::mem::replace(
            &mut self.current_compiler_mut().function,
            Box::new(ObjectFunction::new(FunctionKind::Script, String::new())),
        );
        function.upvalue_count = upvalue_count;
        self.compilers.pop();
        Some(function)
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        // Strings are interned, so the pointer-equality scan also
        // deduplicates string constants.
        if let Some(index) = self.current_chunk().find_constant(&value) {
            return index as u16;
        }

        let constant_index = self.current_chunk_mut().add_constant(value);
        if constant_index > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant_index as u16
    }

    fn int_num(&mut self) {
        match self.previous.value.parse::<i32>() {
            Ok(num) => self.emit_constant(make_int_value(num)),
            Err(_) => self.error("int literal out of range."),
        }
    }

    fn float_num(&mut self) {
        let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(make_float_value(value));
    }

    fn string(&mut self) {
        // trim the leading and trailing quotation marks
        let content = &self.previous.value[1..self.previous.value.len() - 1];
        let string = self.object_manager.alloc_string(self.intern_strings, content);
        self.emit_constant(make_ref_value(string as *mut _));
    }

    fn identifier_constant(&mut self, name: &Token) -> u16 {
        let string = self.object_manager.alloc_string(self.intern_strings, name.value);
        self.make_constant(make_ref_value(string as *mut _))
    }

    fn declaration(&mut self) {
        if self.match_token(TokenType::Var) {
            self.var_declaration(false);
        } else if self.match_token(TokenType::Const) {
            self.const_declaration(false);
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration(false);
        } else if self.match_token(TokenType::Class) {
            self.class_declaration(false);
        } else if self.match_token(TokenType::Pub) {
            self.pub_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn pub_declaration(&mut self) {
        if self.current_compiler().scope_depth > 0 {
            self.error("'pub' is only allowed at the top level.");
        }
        if self.match_token(TokenType::Var) {
            self.var_declaration(true);
        } else if self.match_token(TokenType::Const) {
            self.const_declaration(true);
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration(true);
        } else if self.match_token(TokenType::Class) {
            self.class_declaration(true);
        } else {
            self.error_at_current("Expect a declaration after 'pub'.");
        }
    }

    fn var_declaration(&mut self, is_pub: bool) {
        if self.check(TokenType::LeftBracket) {
            self.destructuring_declaration(is_pub);
            return;
        }

        let global = self.parse_variable("Expect variable name.", false);

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::LoadNil);
        }
        self.consume_semicolon("Expect ';' after variable declaration.");

        self.define_variable(global, if is_pub { OpCode::DefPubGlobal } else { OpCode::DefGlobal });
    }

    fn const_declaration(&mut self, is_pub: bool) {
        let global = self.parse_variable("Expect constant name.", true);

        self.consume(TokenType::Equal, "A const variable must be initialized.");
        self.expression();
        self.consume_semicolon("Expect ';' after constant declaration.");

        self.define_variable(
            global,
            if is_pub { OpCode::DefPubGlobalConst } else { OpCode::DefGlobalConst },
        );
    }

    /// `var [a, b, c] = expr;` unpacks a fixed-length array into fresh
    /// bindings.
    fn destructuring_declaration(&mut self, is_pub: bool) {
        self.consume(TokenType::LeftBracket, "Expect '[' in destructuring declaration.");
        let mut names: Vec<Token<'a>> = vec![];
        loop {
            self.consume(TokenType::Identifier, "Expect binding name.");
            names.push(self.previous.clone());
            if !self.match_token(TokenType::Comma) {
                break;
            }
        }
        self.consume(TokenType::RightBracket, "Expect ']' after binding names.");
        self.consume(TokenType::Equal, "Destructuring requires an initializer.");
        self.expression();
        self.consume_semicolon("Expect ';' after declaration.");

        if names.len() > u16::MAX as usize {
            self.error("Too many bindings to unpack.");
            return;
        }
        self.emit_op_u16(OpCode::UnpackArray, names.len() as u16);

        if self.current_compiler().scope_depth > 0 {
            // elements land on the stack in order, becoming the local slots
            for name in names {
                self.previous = name;
                self.declare_variable(false);
                self.mark_initialized();
            }
        } else {
            // globals pop from the top, so define them in reverse
            let def_op = if is_pub { OpCode::DefPubGlobal } else { OpCode::DefGlobal };
            for name in names.iter().rev() {
                let index = self.identifier_constant(name);
                self.emit_op_u16(def_op, index);
            }
        }
    }

    fn parse_variable(&mut self, message: &'static str, is_const: bool) -> u16 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable(is_const);
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&self.previous.clone())
    }

    fn declare_variable(&mut self, is_const: bool) {
        if self.current_compiler().scope_depth == 0 {
            // top level: globals are late-bound, nothing to declare
            return;
        }

        let mut err = false;
        let variable_name = self.previous.clone();
        let scope_depth = self.current_compiler().scope_depth;
        for local in self.current_locals().iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }

            if Self::identifier_equal(&variable_name, &local.name) {
                err = true;
                break;
            }
        }
        if err {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(variable_name, is_const);
    }

    fn add_local(&mut self, variable_name: Token<'a>, is_const: bool) {
        if self.current_locals().len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }

        // depth -1 marks the variable uninitialized until its initializer has
        // been compiled, so `var a = a;` is caught
        self.current_locals_mut().push(Local {
            name: variable_name,
            depth: -1,
            is_const,
            is_captured: false,
        });
    }

    fn define_variable(&mut self, global: u16, def_op: OpCode) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_op_u16(def_op, global);
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }

        self.current_locals_mut().last_mut().unwrap().depth = scope_depth;
    }

    fn function_declaration(&mut self, is_pub: bool) {
        let global = self.parse_variable("Expect function name.", false);
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global, if is_pub { OpCode::DefPubGlobal } else { OpCode::DefGlobal });
    }

    fn function(&mut self, kind: FunctionKind) {
        self.init_compiler(kind);

        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            self.parameter_list();
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = self.current_compiler().upvalues.clone();

        let function = self.end_compiler().expect("Unexpected function object.");
        let function_ptr = self.object_manager.adopt_function(function);
        let function_constant_index = self.make_constant(make_ref_value(function_ptr as *mut _));
        self.emit_op_u16(OpCode::MakeClosure, function_constant_index);

        for upvalue in upvalues.iter() {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index as u8);
        }
    }

    /// fixed parameters, then optional `name = expr` ones, then at most one
    /// trailing `*rest`.
    fn parameter_list(&mut self) {
        let mut seen_optional = false;
        loop {
            if self.current_function().var_arg {
                self.error("The variadic parameter must be the last one.");
            }
            if self.current_function().max_arity() >= MAX_PARAMETERS {
                self.error("Can't have more than 255 parameters.");
            }

            if self.match_token(TokenType::Star) {
                self.consume(TokenType::Identifier, "Expect parameter name after '*'.");
                self.declare_variable(false);
                self.mark_initialized();
                self.current_function_mut().var_arg = true;
            } else {
                self.consume(TokenType::Identifier, "Expect parameter name.");
                self.declare_variable(false);
                self.mark_initialized();
                let slot = self.current_locals().len() - 1;

                if self.match_token(TokenType::Equal) {
                    seen_optional = true;
                    self.current_function_mut().optional_arity += 1;
                    self.compile_default_value(slot as u8);
                } else {
                    if seen_optional {
                        self.error("A required parameter cannot follow an optional one.");
                    }
                    self.current_function_mut().fixed_arity += 1;
                }
            }

            if !self.match_token(TokenType::Comma) {
                break;
            }
        }
    }

    /// Fill-in code for one optional parameter: when the caller supplied no
    /// value the slot holds `Absence` and the default expression replaces it.
    fn compile_default_value(&mut self, slot: u8) {
        self.emit_op_u8(OpCode::GetLocal, slot);
        let to_supplied = self.emit_jump(OpCode::JumpIfNotAbsence);
        self.emit_op(OpCode::Pop);
        self.expression();
        self.emit_op_u8(OpCode::SetLocal, slot);
        self.emit_op(OpCode::Pop);
        let to_end = self.emit_jump(OpCode::Jump);
        self.patch_jump(to_supplied);
        self.emit_op(OpCode::Pop);
        self.patch_jump(to_end);
    }

    fn lambda(&mut self) {
        self.function(FunctionKind::Lambda);
    }

    fn class_declaration(&mut self, is_pub: bool) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable(false);

        self.emit_op_u16(OpCode::MakeClass, name_constant);
        self.define_variable(name_constant, if is_pub { OpCode::DefPubGlobal } else { OpCode::DefGlobal });

        self.class_compilers.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);

            if Self::identifier_equal(&class_name, &self.previous) {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local(synthetic_token("super"), false);
            self.mark_initialized();

            self.named_variable(class_name.clone(), false);
            self.emit_op(OpCode::Inherit);
            self.class_compilers.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if self.match_token(TokenType::Static) {
                self.static_field();
            } else {
                self.method();
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.class_compilers.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let kind = if self.previous.value == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op(OpCode::MakeMethod);
    }

    fn static_field(&mut self) {
        self.consume(TokenType::Identifier, "Expect static field name.");
        let name_constant = self.identifier_constant(&self.previous.clone());
        self.consume(TokenType::Equal, "A static field must be initialized.");
        self.expression();
        self.consume_semicolon("Expect ';' after static field.");
        self.emit_op_u16(OpCode::MakeStaticField, name_constant);
    }

    fn this_(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable(synthetic_token("this"), false);
    }

    fn super_(&mut self) {
        match self.class_compilers.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class_compiler) if !class_compiler.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name_constant = self.identifier_constant(&self.previous.clone());

        self.named_variable(synthetic_token("this"), false);
        if self.match_token(TokenType::LeftParen) {
            let argument_count = self.argument_list();
            self.named_variable(synthetic_token("super"), false);
            self.emit_op_u16(OpCode::SuperInvoke, name_constant);
            self.emit_byte(argument_count);
        } else {
            self.named_variable(synthetic_token("super"), false);
            self.emit_op_u16(OpCode::SuperAccess, name_constant);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argument_count: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                if self.match_token(TokenType::Star) {
                    // `f(*arr)` splats a trailing array into the call
                    self.expression();
                    self.emit_op(OpCode::ArrAsVarArg);
                    argument_count += 1;
                    if !self.check(TokenType::RightParen) {
                        self.error("A spread argument must be the last one.");
                    }
                    break;
                }
                self.expression();
                if argument_count >= 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argument_count += 1;

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argument_count as u8
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign)
    }

    fn match_assign(&mut self) -> Option<TokenType> {
        for token_type in [
            TokenType::Equal,
            TokenType::PlusEqual,
            TokenType::MinusEqual,
            TokenType::StarEqual,
            TokenType::SlashEqual,
            TokenType::PercentEqual,
        ] {
            if self.match_token(token_type) {
                return Some(token_type);
            }
        }
        None
    }

    fn compound_op(assign: TokenType) -> OpCode {
        match assign {
            TokenType::PlusEqual => OpCode::Add,
            TokenType::MinusEqual => OpCode::Subtract,
            TokenType::StarEqual => OpCode::Multiply,
            TokenType::SlashEqual => OpCode::Divide,
            TokenType::PercentEqual => OpCode::Mod,
            _ => unreachable!("not a compound assignment operator"),
        }
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        enum Target {
            Local(u8),
            Upvalue(u8),
            Global(u16),
        }

        let current_compiler_index = self.compilers.len() - 1;
        let mut is_const = false;
        let target = if let Some(slot) = self.resolve_local(current_compiler_index, &name, &mut is_const) {
            Target::Local(slot as u8)
        } else if let Some(slot) = self.resolve_upvalue(current_compiler_index, &name) {
            Target::Upvalue(slot as u8)
        } else {
            Target::Global(self.identifier_constant(&name))
        };

        let assign = if can_assign { self.match_assign() } else { None };
        match assign {
            None => match target {
                Target::Local(slot) => self.emit_op_u8(OpCode::GetLocal, slot),
                Target::Upvalue(slot) => self.emit_op_u8(OpCode::GetUpvalue, slot),
                Target::Global(index) => self.emit_op_u16(OpCode::GetGlobal, index),
            },
            Some(assign_type) => {
                if is_const {
                    self.error("cannot re-assign a const variable");
                    return;
                }
                if assign_type != TokenType::Equal {
                    // x op= e  compiles as  x = x op e
                    match target {
                        Target::Local(slot) => self.emit_op_u8(OpCode::GetLocal, slot),
                        Target::Upvalue(slot) => self.emit_op_u8(OpCode::GetUpvalue, slot),
                        Target::Global(index) => self.emit_op_u16(OpCode::GetGlobal, index),
                    }
                    self.expression();
                    self.emit_op(Self::compound_op(assign_type));
                } else {
                    self.expression();
                }
                match target {
                    Target::Local(slot) => self.emit_op_u8(OpCode::SetLocal, slot),
                    Target::Upvalue(slot) => self.emit_op_u8(OpCode::SetUpvalue, slot),
                    Target::Global(index) => self.emit_op_u16(OpCode::SetGlobal, index),
                }
            }
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token, is_const: &mut bool) -> Option<usize> {
        let compiler = self.specific_compiler(compiler_index);
        let mut uninitialized = false;
        let mut found = None;
        for (index, local) in compiler.locals.iter().enumerate().rev() {
            if Self::identifier_equal(name, &local.name) {
                if local.depth == -1 {
                    uninitialized = true;
                } else {
                    *is_const = local.is_const;
                    found = Some(index);
                }
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn identifier_equal(left: &Token, right: &Token) -> bool {
        left.value == right.value && !left.value.is_empty()
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> Option<usize> {
        if compiler_index == 0 {
            return None;
        }
        let mut is_const = false;
        if let Some(local) = self.resolve_local(compiler_index - 1, name, &mut is_const) {
            self.specific_compiler_mut(compiler_index - 1).locals[local].is_captured = true;
            return Some(self.add_upvalue(compiler_index, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(compiler_index - 1, name) {
            return Some(self.add_upvalue(compiler_index, upvalue, false));
        }

        None
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: usize, is_local: bool) -> usize {
        let compiler = self.specific_compiler_mut(compiler_index);
        for (upvalue_index, upvalue) in compiler.upvalues.iter().enumerate() {
            if upvalue.is_local == is_local && upvalue.index == index {
                return upvalue_index;
            }
        }
        compiler.upvalues.push(Upvalue { index, is_local });
        compiler.function.upvalue_count = compiler.upvalues.len();
        compiler.function.upvalue_count - 1
    }

    fn and(&mut self, _can_assign: bool) {
        let to_end = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(to_end);
    }

    fn or(&mut self, _can_assign: bool) {
        let to_end = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(to_end);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::Break) {
            self.break_statement();
        } else if self.match_token(TokenType::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenType::Try) {
            self.try_statement();
        } else if self.match_token(TokenType::Import) {
            self.import_statement();
        } else if self.match_token(TokenType::Export) {
            self.export_statement();
        } else if self.match_token(TokenType::Print) {
            self.print_statement();
        } else {
            self.expression_statement();
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let to_else = self.emit_jump(OpCode::PopJumpIfFalse);
        self.statement();

        let to_after = self.emit_jump(OpCode::Jump);
        self.patch_jump(to_else);

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(to_after);
    }

    /// Emit a jump with a placeholder offset; returns the offset of the
    /// operand for `patch_jump`.
    fn emit_jump(&mut self, jump_op: OpCode) -> usize {
        self.emit_op(jump_op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, operand_offset: usize) {
        // -2 to adjust for the operand bytes themselves
        let jump_offset = self.current_chunk().len() - operand_offset - 2;
        if jump_offset > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        self.current_chunk_mut().patch_u16(operand_offset, jump_offset as u16);
    }

    /// Backward jump to an absolute earlier position.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::JumpBack);

        // +2 to skip the operand of the JumpBack instruction itself
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        let line = self.previous.line;
        self.current_chunk_mut().write_u16(offset as u16, line);
    }

    /// Jump to an absolute destination, picking the direction.
    fn emit_goto(&mut self, dest: usize) {
        let after_jump = self.current_chunk().len() + 3;
        if dest >= after_jump {
            let to_dest = self.emit_jump(OpCode::Jump);
            let diff = dest - after_jump;
            self.current_chunk_mut().patch_u16(to_dest, diff as u16);
        } else {
            self.emit_loop(dest);
        }
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        let scope_depth = self.current_compiler().scope_depth;
        loop {
            let current_locals = self.current_locals();
            match current_locals.last() {
                Some(local) if local.depth > scope_depth => {
                    let op = if local.is_captured {
                        OpCode::CloseUpvalue
                    } else {
                        OpCode::Pop
                    };
                    self.emit_op(op);
                    self.current_locals_mut().pop();
                }
                _ => break,
            }
        }
    }

    /// Pops for every local deeper than `to_depth`, without touching the
    /// compiler's local bookkeeping (the loop body still owns those slots).
    fn emit_pops_to_clear(&mut self, to_depth: i32) {
        let pops: Vec<bool> = self
            .current_locals()
            .iter()
            .rev()
            .take_while(|local| local.depth > to_depth)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in pops {
            let op = if is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit_op(op);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }

        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn return_statement(&mut self) {
        if self.current_compiler().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume_semicolon("Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume_semicolon("Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    /// break leaves a `false` sentinel and jumps back to the loop's exit
    /// check, which consumes the sentinel and leaves the loop.
    fn break_statement(&mut self) {
        if self.current_compiler().break_point < 0 {
            self.error("cannot use break outside of a loop");
            return;
        }
        self.consume_semicolon("Expect ';' after 'break'.");
        let to_depth = self.current_compiler().continue_depth;
        self.emit_pops_to_clear(to_depth);
        self.emit_op(OpCode::LoadFalse);
        let break_point = self.current_compiler().break_point as usize;
        self.emit_goto(break_point);
    }

    fn continue_statement(&mut self) {
        if self.current_compiler().continue_point < 0 {
            self.error("cannot use continue outside of a loop");
            return;
        }
        self.consume_semicolon("Expect ';' after 'continue'.");
        let to_depth = self.current_compiler().continue_depth;
        self.emit_pops_to_clear(to_depth);
        let continue_point = self.current_compiler().continue_point as usize;
        self.emit_goto(continue_point);
    }

    fn save_loop_points(&self) -> (i32, i32, i32) {
        let compiler = self.current_compiler();
        (compiler.break_point, compiler.continue_point, compiler.continue_depth)
    }

    fn restore_loop_points(&mut self, saved: (i32, i32, i32)) {
        let compiler = self.current_compiler_mut();
        compiler.break_point = saved.0;
        compiler.continue_point = saved.1;
        compiler.continue_depth = saved.2;
    }

    fn while_statement(&mut self) {
        let saved = self.save_loop_points();

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        let condition = self.current_chunk().len();
        {
            let depth = self.current_compiler().scope_depth;
            let compiler = self.current_compiler_mut();
            compiler.continue_point = condition as i32;
            compiler.continue_depth = depth;
        }

        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        self.current_compiler_mut().break_point = self.current_chunk().len() as i32;
        let to_end = self.emit_jump(OpCode::PopJumpIfFalse);

        self.statement();
        self.emit_loop(condition);

        self.patch_jump(to_end);

        self.restore_loop_points(saved);
    }

    fn for_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        self.begin_scope();

        if self.check(TokenType::Var) && self.is_for_in() {
            self.for_in_statement();
            return;
        }

        let saved = self.save_loop_points();

        // initializer
        if self.match_token(TokenType::Semicolon) {
            // none
        } else if self.match_token(TokenType::Var) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let condition = self.current_chunk().len();
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
        } else {
            self.emit_op(OpCode::LoadTrue);
        }

        self.current_compiler_mut().break_point = self.current_chunk().len() as i32;
        let to_end = self.emit_jump(OpCode::PopJumpIfFalse);
        let to_body = self.emit_jump(OpCode::Jump);

        // increment clause; continue lands here
        let increment = self.current_chunk().len();
        {
            let depth = self.current_compiler().scope_depth;
            let compiler = self.current_compiler_mut();
            compiler.continue_point = increment as i32;
            compiler.continue_depth = depth;
        }
        if !self.match_token(TokenType::RightParen) {
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
        }
        self.emit_loop(condition);

        // body
        self.patch_jump(to_body);
        self.statement();
        self.emit_loop(increment);

        self.patch_jump(to_end);

        self.restore_loop_points(saved);
        self.end_scope();
    }

    /// Lookahead after `for (`: distinguishes `for (var x in e)` from the
    /// three-clause form. Only called with `var` as the current token.
    fn is_for_in(&self) -> bool {
        let scanner = self.scanner.as_ref().expect("scanner is set during compilation");
        let mut probe = Scanner::new(scanner.remaining_source());
        // current == `var`; the probe starts right after it
        let name = probe.scan_token();
        if name.token_type != TokenType::Identifier {
            return false;
        }
        probe.scan_token().token_type == TokenType::In
    }

    /// for (var item in expr) statement
    ///
    /// The iterator lives in a hidden local under the loop variable;
    /// `JumpForIter` pushes the next element or exits.
    fn for_in_statement(&mut self) {
        let saved = self.save_loop_points();

        self.consume(TokenType::Var, "Expect 'var' in for-in.");
        self.consume(TokenType::Identifier, "Expect loop variable name.");
        let loop_variable = self.previous.clone();
        self.consume(TokenType::In, "Expect 'in' in for-in.");

        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after for-in iterable.");
        self.emit_op(OpCode::GetIterator);
        // hidden local owning the iterator; the space in the name keeps it
        // unreferencable from source
        self.add_local(synthetic_token("(iter)"), false);
        self.mark_initialized();

        let iterate = self.current_chunk().len();
        {
            let depth = self.current_compiler().scope_depth;
            let compiler = self.current_compiler_mut();
            compiler.continue_point = iterate as i32;
            compiler.continue_depth = depth;
            compiler.break_point = iterate as i32;
        }
        let to_end = self.emit_jump(OpCode::JumpForIter);

        self.begin_scope();
        self.previous = loop_variable;
        self.declare_variable(false);
        self.mark_initialized();

        self.statement();
        self.end_scope();
        self.emit_loop(iterate);

        self.patch_jump(to_end);
        self.restore_loop_points(saved);
        self.end_scope();
    }

    /// switch evaluates the subject once; each case compares without popping
    /// and every arm ends with a jump to the end (no fall-through).
    fn switch_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'switch'.");

        let to_start = self.emit_jump(OpCode::Jump);
        // trampoline: arms jump back here, which jumps to the end
        let temp = self.current_chunk().len();
        let to_end = self.emit_jump(OpCode::Jump);
        self.patch_jump(to_start);

        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after switch subject.");
        self.consume(TokenType::LeftBrace, "Expect '{' after switch.");

        let mut bridge: Option<usize> = None;
        while !self.check(TokenType::Eof) && self.match_token(TokenType::Case) {
            if let Some(from) = bridge {
                self.patch_jump(from);
                self.emit_op(OpCode::Pop);
            }
            if self.match_token(TokenType::Nil)
                || self.match_token(TokenType::False)
                || self.match_token(TokenType::True)
            {
                self.literal();
            } else if self.match_token(TokenType::Float) {
                self.float_num();
            } else if self.match_token(TokenType::Int) {
                self.int_num();
            } else if self.match_token(TokenType::String) {
                self.string();
            } else {
                self.error_at_current("only constant values can be used as switch cases");
                return;
            }
            self.consume(TokenType::Colon, "Expect ':' after each case.");
            bridge = Some(self.emit_jump(OpCode::JumpIfNotEqual));
            self.emit_op(OpCode::Pop);
            self.emit_op(OpCode::Pop);

            while !self.check(TokenType::Eof)
                && !self.check(TokenType::Case)
                && !self.check(TokenType::Default)
                && !self.check(TokenType::RightBrace)
            {
                self.statement();
            }
            self.emit_loop(temp);
        }

        // no case matched: drop the last case value, then the subject
        if let Some(from) = bridge {
            self.patch_jump(from);
            self.emit_op(OpCode::Pop);
        }
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenType::Default) {
            self.consume(TokenType::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenType::Eof) && !self.check(TokenType::RightBrace) {
                self.statement();
            }
        }

        self.patch_jump(to_end);
        self.consume(TokenType::RightBrace, "Expect '}' after switch.");
    }

    /// try { ... } catch (e) { ... }
    fn try_statement(&mut self) {
        let to_catch = self.emit_jump(OpCode::SetTry);

        self.consume(TokenType::LeftBrace, "Expect '{' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_op(OpCode::SkipCatch);
        let to_end = self.emit_jump(OpCode::Jump);

        // handler: the error instance arrives on top of the stack
        self.patch_jump(to_catch);
        self.consume(TokenType::Catch, "Expect 'catch' after try block.");
        self.consume(TokenType::LeftParen, "Expect '(' after 'catch'.");
        self.begin_scope();
        self.consume(TokenType::Identifier, "Expect error variable name.");
        self.declare_variable(false);
        self.mark_initialized();
        self.consume(TokenType::RightParen, "Expect ')' after error variable.");
        self.consume(TokenType::LeftBrace, "Expect '{' after catch clause.");
        self.block();
        self.end_scope();

        self.patch_jump(to_end);
    }

    /// import "path" as name;
    fn import_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Import);
        self.emit_op(OpCode::RestoreModule);

        self.consume(TokenType::As, "Expect 'as' after import path.");
        self.consume(TokenType::Identifier, "Expect module binding name.");
        let name = self.previous.clone();
        self.consume_semicolon("Expect ';' after import.");

        if self.current_compiler().scope_depth > 0 {
            self.previous = name;
            self.declare_variable(false);
            self.mark_initialized();
        } else {
            let index = self.identifier_constant(&name);
            self.emit_op_u16(OpCode::DefGlobal, index);
        }
    }

    /// export name; marks an existing global as public
    fn export_statement(&mut self) {
        self.consume(TokenType::Identifier, "Expect global name after 'export'.");
        let index = self.identifier_constant(&self.previous.clone());
        self.consume_semicolon("Expect ';' after export.");
        self.emit_op_u16(OpCode::Export, index);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume_semicolon("Expect ';' after expression.");
        let auto_print = self.repl_mode
            && self.compilers.len() == 1
            && self.current_compiler().scope_depth == 0;
        if auto_print {
            self.emit_op(OpCode::ReplAutoPrint);
        } else {
            self.emit_op(OpCode::Pop);
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn unary(&mut self) {
        let operator_type = self.previous.token_type;

        self.parse_precedence(Precedence::Unary);

        match operator_type {
            TokenType::Bang => self.emit_op(OpCode::Not),
            TokenType::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator_type = self.previous.token_type;
        let rule = &RULES[operator_type as usize];
        // `**` is right-associative: recurse at the same level
        if operator_type == TokenType::StarStar {
            self.parse_precedence(rule.precedence);
        } else {
            self.parse_precedence((rule.precedence as u8 + 1).into());
        }

        match operator_type {
            TokenType::BangEqual => {
                self.emit_op(OpCode::TestEqual);
                self.emit_op(OpCode::Not);
            }
            TokenType::EqualEqual => self.emit_op(OpCode::TestEqual),
            TokenType::Greater => self.emit_op(OpCode::TestGreater),
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::TestLess);
                self.emit_op(OpCode::Not);
            }
            TokenType::Less => self.emit_op(OpCode::TestLess),
            TokenType::LessEqual => {
                self.emit_op(OpCode::TestGreater);
                self.emit_op(OpCode::Not);
            }
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            TokenType::Percent => self.emit_op(OpCode::Mod),
            TokenType::StarStar => self.emit_op(OpCode::Power),
            _ => unreachable!("Unexpected binary operator: {}", operator_type),
        }
    }

    fn literal(&mut self) {
        let operator_type = self.previous.token_type;
        match operator_type {
            TokenType::False => self.emit_op(OpCode::LoadFalse),
            TokenType::True => self.emit_op(OpCode::LoadTrue),
            TokenType::Nil => self.emit_op(OpCode::LoadNil),
            _ => unreachable!("Unexpected literal operator: {}", operator_type),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argument_count = self.argument_list();
        self.emit_op_u8(OpCode::Call, argument_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name_constant = self.identifier_constant(&self.previous.clone());

        if self.match_token(TokenType::LeftParen) {
            let argument_count = self.argument_list();
            self.emit_op_u16(OpCode::PropertyInvoke, name_constant);
            self.emit_byte(argument_count);
            return;
        }

        let assign = if can_assign { self.match_assign() } else { None };
        match assign {
            None => self.emit_op_u16(OpCode::GetProperty, name_constant),
            Some(TokenType::Equal) => {
                self.expression();
                self.emit_op_u16(OpCode::SetProperty, name_constant);
            }
            Some(assign_type) => {
                // obj.f op= e: keep the receiver around for the write-back
                self.emit_op(OpCode::Copy);
                self.emit_op_u16(OpCode::GetProperty, name_constant);
                self.expression();
                self.emit_op(Self::compound_op(assign_type));
                self.emit_op_u16(OpCode::SetProperty, name_constant);
            }
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightBracket, "Expect ']' after index.");

        let assign = if can_assign { self.match_assign() } else { None };
        match assign {
            None => self.emit_op(OpCode::IndexingGet),
            Some(TokenType::Equal) => {
                self.expression();
                self.emit_op(OpCode::IndexingSet);
            }
            Some(assign_type) => {
                // a[i] op= e: duplicate container and index for the write-back
                self.emit_op(OpCode::Copy2);
                self.emit_op(OpCode::IndexingGet);
                self.expression();
                self.emit_op(Self::compound_op(assign_type));
                self.emit_op(OpCode::IndexingSet);
            }
        }
    }

    /// `[a, b, c]` builds an array; `[n; m]` builds an n-by-m nil-filled
    /// nested array (any number of dimensions).
    fn array_literal(&mut self) {
        if self.match_token(TokenType::RightBracket) {
            self.emit_op_u16(OpCode::MakeArray, 0);
            return;
        }

        self.expression();
        if self.match_token(TokenType::Semicolon) {
            let mut dimensions: u32 = 1;
            while !self.check(TokenType::RightBracket) {
                self.expression();
                dimensions += 1;
                if !self.match_token(TokenType::Semicolon) {
                    break;
                }
            }
            self.consume(TokenType::RightBracket, "Expect ']' after array dimensions.");
            if dimensions > u8::MAX as u32 {
                self.error("Too many array dimensions.");
                return;
            }
            self.emit_op_u8(OpCode::DimensionArray, dimensions as u8);
            return;
        }

        let mut length: u32 = 1;
        while self.match_token(TokenType::Comma) {
            if self.check(TokenType::RightBracket) {
                break;
            }
            self.expression();
            length += 1;
            if length > u16::MAX as u32 {
                self.error("Too many elements in array literal.");
                return;
            }
        }
        self.consume(TokenType::RightBracket, "Expect ']' after array elements.");
        self.emit_op_u16(OpCode::MakeArray, length as u16);
    }

    /// `{k1: v1, k2: v2}`; keys are arbitrary expressions.
    fn map_literal(&mut self) {
        self.emit_op(OpCode::NewMap);
        if self.match_token(TokenType::RightBrace) {
            return;
        }
        loop {
            self.expression();
            self.consume(TokenType::Colon, "Expect ':' between map key and value.");
            self.expression();
            self.emit_op(OpCode::MapAddPair);
            if !self.match_token(TokenType::Comma) {
                break;
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after map entries.");
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        if let Some(prefix) = &RULES[self.previous.token_type as usize].prefix {
            prefix(self, can_assign);
        } else {
            self.error("Expect expression.");
            return;
        }

        while precedence as u8 <= (&RULES[self.current.token_type as usize]).precedence as u8 {
            self.advance();
            if let Some(infix) = &RULES[self.previous.token_type as usize].infix {
                infix(self, can_assign);
            } else {
                self.error("Expect infix parse function.");
                return;
            }
        }

        if can_assign && self.match_assign().is_some() {
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
                token_type
                    if matches!(
                        token_type,
                        TokenType::Class
                            | TokenType::Fun
                            | TokenType::Var
                            | TokenType::Const
                            | TokenType::For
                            | TokenType::If
                            | TokenType::While
                            | TokenType::Switch
                            | TokenType::Try
                            | TokenType::Import
                            | TokenType::Pub
                            | TokenType::Print
                            | TokenType::Return
                    ) =>
                {
                    return
                }
                _ => (),
            }

            self.advance()
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
        if token.token_type == TokenType::Eof {
            self.eof_error = true;
        }
        write!(&mut std::io::stderr(), "[line {}] Compile Error", token.line)
            .expect("Failed to write to stderr");

        match token.token_type {
            TokenType::Eof => {
                write!(&mut std::io::stderr(), " at end").expect("Failed to write to stderr")
            }
            TokenType::Error => {}
            _ => write!(&mut std::io::stderr(), " at '{}'", token.value)
                .expect("Failed to write to stderr"),
        };

        writeln!(&mut std::io::stderr(), ": {}", message).expect("Failed to write to stderr");
        self.has_error = true;
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use crate::debug;

    use super::*;

    pub fn disassemble_chunk(parser: &mut Parser, name: &str) {
        if !parser.has_error {
            debug::disassemble_chunk(parser.current_chunk(), name, false);
        }
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_chunk(_parser: &mut Parser, _name: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> Option<Box<ObjectFunction>> {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let mut parser = Parser::new(&mut object_manager, &mut intern_strings, false);
        let function = parser.compile(source);
        // nested functions stay behind in the manager; the top-level one is
        // owned by the caller in these tests
        std::mem::forget(object_manager);
        function
    }

    #[test]
    fn test_compile_expression_statement() {
        let function = compile_source("!(5 - 4 > 3 * 2 == !nil);").unwrap();
        let chunk = &function.chunk;

        let expected = [
            (OpCode::LoadConstant, Some(0u16)),
            (OpCode::LoadConstant, Some(1)),
            (OpCode::Subtract, None),
            (OpCode::LoadConstant, Some(2)),
            (OpCode::LoadConstant, Some(3)),
            (OpCode::Multiply, None),
            (OpCode::TestGreater, None),
            (OpCode::LoadNil, None),
            (OpCode::Not, None),
            (OpCode::TestEqual, None),
            (OpCode::Not, None),
            (OpCode::Pop, None),
            (OpCode::LoadNil, None),
            (OpCode::Return, None),
        ];
        let mut offset = 0;
        for (op, operand) in expected {
            assert_eq!(chunk.read_from_offset(offset).unwrap(), op.to_byte());
            offset += 1;
            if let Some(value) = operand {
                assert_eq!(chunk.read_u16(offset), value);
                offset += 2;
            }
        }
        assert_eq!(offset, chunk.len());
    }

    #[test]
    fn test_int_and_float_constants_distinct() {
        let function = compile_source("1; 1.0;").unwrap();
        assert_eq!(function.chunk.constants.len(), 2);
    }

    #[test]
    fn test_string_constants_deduplicated() {
        let function = compile_source("\"hi\"; \"hi\"; \"hi\";").unwrap();
        assert_eq!(function.chunk.constants.len(), 1);
    }

    #[test]
    fn test_function_declaration_arities() {
        let function = compile_source(
            "fun f(a, b, c = 1, *rest) {
                return a + b;
            }",
        )
        .unwrap();
        let inner = function
            .chunk
            .iter_constants()
            .find_map(|constant| {
                if crate::value::is_ref_of(constant, crate::objects::object::ObjectType::ObjFunction) {
                    Some(crate::value::as_ref(constant) as *mut ObjectFunction)
                } else {
                    None
                }
            })
            .expect("nested function constant");
        unsafe {
            assert_eq!((*inner).fixed_arity, 2);
            assert_eq!((*inner).optional_arity, 1);
            assert!((*inner).var_arg);
        }
    }

    #[test]
    fn test_closure_captures_upvalue() {
        let function = compile_source(
            "fun outer() {
                var n = 0;
                fun inner() {
                    n = n + 1;
                    return n;
                }
                return inner;
            }",
        )
        .unwrap();
        let outer = function
            .chunk
            .iter_constants()
            .find_map(|constant| {
                if crate::value::is_ref_of(constant, crate::objects::object::ObjectType::ObjFunction) {
                    Some(crate::value::as_ref(constant) as *mut ObjectFunction)
                } else {
                    None
                }
            })
            .expect("outer function constant");
        let inner = unsafe {
            (*outer)
                .chunk
                .iter_constants()
                .find_map(|constant| {
                    if crate::value::is_ref_of(constant, crate::objects::object::ObjectType::ObjFunction)
                    {
                        Some(crate::value::as_ref(constant) as *mut ObjectFunction)
                    } else {
                        None
                    }
                })
                .expect("inner function constant")
        };
        unsafe {
            assert_eq!((*inner).upvalue_count, 1);
        }
    }

    #[test]
    fn test_const_local_reassignment_is_error() {
        assert!(compile_source("{ const a = 1; a = 2; }").is_none());
    }

    #[test]
    fn test_duplicate_local_is_error() {
        assert!(compile_source("{ var a = 1; var a = 2; }").is_none());
    }

    #[test]
    fn test_self_initialization_is_error() {
        assert!(compile_source("{ var a = a; }").is_none());
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(compile_source("1 + 2 = 3;").is_none());
    }

    #[test]
    fn test_break_outside_loop_is_error() {
        assert!(compile_source("break;").is_none());
    }

    #[test]
    fn test_switch_and_loops_compile() {
        assert!(compile_source(
            "var x = 2;
            switch (x) { case 1: print \"one\"; case 2: print \"two\"; default: print \"d\"; }
            while (x > 0) { x -= 1; if (x == 1) { break; } }
            for (var i = 0; i < 3; i += 1) { continue; }"
        )
        .is_some());
    }

    #[test]
    fn test_class_with_super_compiles() {
        assert!(compile_source(
            "class A { greet() { print \"A\"; } }
            class B < A { greet() { super.greet(); print \"B\"; } static count = 0; }"
        )
        .is_some());
    }

    #[test]
    fn test_for_in_compiles() {
        assert!(compile_source("for (var item in [1, 2, 3]) { print item; }").is_some());
    }

    #[test]
    fn test_try_catch_compiles() {
        assert!(compile_source("try { print missing; } catch (e) { print e; }").is_some());
    }

    #[test]
    fn test_containers_compile() {
        assert!(compile_source(
            "var arr = [1, 2, 3];
            var grid = [2; 3];
            var m = {\"k\": 1, 2: \"v\"};
            arr[0] += 5;
            m[\"k\"] = arr[1];"
        )
        .is_some());
    }
}
