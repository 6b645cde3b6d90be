//! Single-pass Pratt parser/compiler
//!
//! A precedence table maps each token type to `(prefix, infix, precedence)`;
//! `parse_precedence` drives the rules and threads `can_assign` down so only
//! assignment-level calls may consume a trailing `=`. Bytecode is emitted
//! directly into the chunk of the function under construction; there is no
//! AST. Compiler state is a stack of frames (one per nested function) plus a
//! class-state chain and the process-wide registry of `final` global names.
//!
//! The frames themselves are a GC root: any collection during compilation
//! marks every in-progress function's constants, so values parked in
//! constant pools survive allocation churn inside the compiler.

use crate::Session;
use crate::scanner::{Scanner, Token, TokenKind};
use slo_core::chunk::Chunk;
use slo_core::error::{ExceptionKind, SloError};
use slo_core::heap::{GcRoots, Heap};
use slo_core::object::{FunctionObj, ObjKind, ObjRef};
use slo_core::opcode::OpCode;
use slo_core::table::Table;
use slo_core::value::Value;
use tracing::debug;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ELIF_BRANCHES: usize = 56;
const UNINITIALIZED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =  +=  -=  *=  /=
    Or,         // or
    And,        // and
    Equality,   // ==  !=
    Comparison, // <  >  <=  >=  has
    Term,       // +  -
    Factor,     // *  /  %  **
    Unary,      // !  -
    Postfix,    // ++  --
    Call,       // .  ()  []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Postfix,
            Precedence::Postfix => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth, or UNINITIALIZED while the initialiser is running
    depth: i32,
    captured: bool,
    is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
    is_final: bool,
}

#[derive(Debug)]
struct LoopState {
    /// Backward-jump target; for loops with an increment clause this points
    /// at the increment so `continue` runs it
    start: usize,
    scope_depth: i32,
    breaks: Vec<usize>,
}

struct CompilerFrame {
    function: FunctionObj,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopState>,
}

struct ClassState {
    has_superclass: bool,
}

type ParseFn<'src, 'ctx> = fn(&mut Parser<'src, 'ctx>, bool);

struct Rule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

/// Roots while compiling: the enclosing globals plus every in-progress
/// function on the compiler chain.
struct CompileRoots<'a> {
    compilers: &'a [CompilerFrame],
    globals: &'a Table,
}

impl GcRoots for CompileRoots<'_> {
    fn mark(&self, heap: &mut Heap) {
        heap.mark_table(self.globals);
        for frame in self.compilers {
            if let Some(name) = frame.function.name {
                heap.mark_ref(name);
            }
            if let Some(file) = frame.function.file {
                heap.mark_ref(file);
            }
            for value in &frame.function.chunk.constants {
                heap.mark_value(*value);
            }
        }
    }
}

pub struct Parser<'src, 'ctx> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<SloError>,
    compilers: Vec<CompilerFrame>,
    classes: Vec<ClassState>,
    heap: &'ctx mut Heap,
    session: &'ctx mut Session,
    globals: &'ctx Table,
    file: String,
    file_ref: ObjRef,
    source: &'src str,
}

/// Compile a source buffer into the top-level script function.
pub fn compile(
    source: &str,
    file: &str,
    heap: &mut Heap,
    session: &mut Session,
    globals: &Table,
) -> Result<ObjRef, Vec<SloError>> {
    debug!(file, bytes = source.len(), "compiling");
    let mut parser = Parser::new(source, file, heap, session, globals);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    parser.maybe_collect();
    let (function, _) = parser.end_function();
    let errors = std::mem::take(&mut parser.errors);
    let had_error = parser.had_error;
    let function = parser.heap.alloc(ObjKind::Function(function));
    if had_error { Err(errors) } else { Ok(function) }
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    fn new(
        source: &'src str,
        file: &str,
        heap: &'ctx mut Heap,
        session: &'ctx mut Session,
        globals: &'ctx Table,
    ) -> Self {
        let file_ref = heap.intern(file);
        let script = FunctionObj::new(None, Some(file_ref));
        let script_frame = CompilerFrame {
            function: script,
            kind: FunctionKind::Script,
            locals: vec![Local {
                name: String::new(),
                depth: 0,
                captured: false,
                is_final: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        };
        Parser {
            scanner: Scanner::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            compilers: vec![script_frame],
            classes: Vec::new(),
            heap,
            session,
            globals,
            file: file.to_string(),
            file_ref,
            source,
        }
    }

    // --- frame plumbing --------------------------------------------------

    fn frame(&self) -> &CompilerFrame {
        self.compilers.last().expect("compiler stack is never empty")
    }

    fn frame_mut(&mut self) -> &mut CompilerFrame {
        self.compilers
            .last_mut()
            .expect("compiler stack is never empty")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.frame_mut().function.chunk
    }

    fn offset(&self) -> usize {
        self.frame().function.chunk.code.len()
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let roots = CompileRoots {
            compilers: &self.compilers,
            globals: self.globals,
        };
        self.heap.collect(&roots);
    }

    // --- token plumbing --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            let token = self.current;
            self.error_at_token(token, message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // --- error reporting -------------------------------------------------

    fn error_at_token(&mut self, token: Token<'_>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let mut err = SloError::new(
            ExceptionKind::Syntax,
            message,
            self.file.clone(),
            token.line,
            token.column,
        );
        if token.line >= 1
            && let Some(line_text) = self.source.lines().nth(token.line as usize - 1)
        {
            err = err.with_snippet(line_text);
        }
        self.errors.push(err);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at_token(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at_token(token, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Func
                | TokenKind::Var
                | TokenKind::Final
                | TokenKind::Enum
                | TokenKind::Import
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Assert
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- emission ---------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_arg(&mut self, op: OpCode, arg: u8) {
        self.emit_op(op);
        self.emit_byte(arg);
    }

    fn emit_u16(&mut self, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        // Identical constants share a slot; interning makes equal strings
        // identical handles, so plain equality is enough.
        if let Some(existing) = self
            .frame()
            .function
            .chunk
            .constants
            .iter()
            .position(|c| *c == value)
        {
            return existing as u8;
        }
        match self.chunk_mut().add_constant(value) {
            Some(k) => k,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let k = self.make_constant(value);
        self.emit_op_arg(OpCode::Constant, k);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.heap.intern(name);
        self.make_constant(Value::Obj(s))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.offset() - 2
    }

    fn patch_jump(&mut self, at: usize) {
        let jump = self.offset() - at - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        let chunk = self.chunk_mut();
        chunk.code[at] = hi;
        chunk.code[at + 1] = lo;
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let distance = self.offset() - start + 2;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        self.emit_u16(distance as u16);
    }

    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit_op_arg(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // --- scopes and variables ---------------------------------------------

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;
        loop {
            let frame = self.frame();
            let Some(local) = frame.locals.last() else {
                break;
            };
            if local.depth <= frame.scope_depth {
                break;
            }
            let captured = local.captured;
            self.frame_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Emit pops for locals deeper than `target_depth` without ending their
    /// scopes; used by break/continue.
    fn emit_scope_pops(&mut self, target_depth: i32) {
        let pops: Vec<bool> = self
            .frame()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > target_depth)
            .map(|l| l.captured)
            .collect();
        for captured in pops {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: String, is_final: bool) {
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame_mut().locals.push(Local {
            name,
            depth: UNINITIALIZED,
            captured: false,
            is_final,
        });
    }

    /// Bind the value currently on top of the stack as a hidden,
    /// already-initialised local.
    fn add_synthetic_local(&mut self, name: &str) -> u8 {
        let depth = self.frame().scope_depth;
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return 0;
        }
        self.frame_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
            is_final: false,
        });
        (self.frame().locals.len() - 1) as u8
    }

    fn declare_variable(&mut self, is_final: bool) {
        let name = self.previous.lexeme.to_string();
        if self.frame().scope_depth == 0 {
            if self.session.final_globals.contains(&name) {
                self.error(&format!("Cannot redefine final variable '{name}'."));
            }
            return;
        }
        // A final binding may not be shadowed at a narrower scope.
        if self.session.final_globals.contains(&name) {
            self.error(&format!("Cannot shadow final variable '{name}'."));
            return;
        }
        let shadows_final = self
            .compilers
            .iter()
            .any(|f| f.locals.iter().any(|l| l.is_final && l.name == name));
        if shadows_final {
            self.error(&format!("Cannot shadow final variable '{name}'."));
            return;
        }
        let duplicate = {
            let frame = self.frame();
            frame
                .locals
                .iter()
                .rev()
                .take_while(|l| l.depth == UNINITIALIZED || l.depth >= frame.scope_depth)
                .any(|l| l.name == name)
        };
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name, is_final);
    }

    fn parse_variable(&mut self, message: &str, is_final: bool) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(is_final);
        if self.frame().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        if is_final {
            self.session.final_globals.insert(name.clone());
        }
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        if let Some(local) = self.frame_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8, is_final: bool) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if is_final {
            self.emit_op_arg(OpCode::DefineFinalGlobal, global);
        } else {
            self.emit_op_arg(OpCode::DefineGlobal, global);
        }
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let found = self.compilers[frame_idx]
            .locals
            .iter()
            .rposition(|l| l.name == name);
        let index = found?;
        if self.compilers[frame_idx].locals[index].depth == UNINITIALIZED {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(index as u8)
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool, is_final: bool) -> u8 {
        if let Some(existing) = self.compilers[frame_idx]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            return existing as u8;
        }
        if self.compilers[frame_idx].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let frame = &mut self.compilers[frame_idx];
        frame.upvalues.push(UpvalueDesc {
            index,
            is_local,
            is_final,
        });
        frame.function.upvalue_count = frame.upvalues.len();
        (frame.upvalues.len() - 1) as u8
    }

    /// Walk outward through enclosing compilers looking for a captured
    /// variable, registering an upvalue in every intervening frame.
    /// Final-ness propagates so a captured `final` stays unassignable.
    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(frame_idx - 1, name) {
            let enclosing = &mut self.compilers[frame_idx - 1];
            enclosing.locals[local as usize].captured = true;
            let is_final = enclosing.locals[local as usize].is_final;
            return Some(self.add_upvalue(frame_idx, local, true, is_final));
        }
        if let Some(upvalue) = self.resolve_upvalue(frame_idx - 1, name) {
            let is_final = self.compilers[frame_idx - 1].upvalues[upvalue as usize].is_final;
            return Some(self.add_upvalue(frame_idx, upvalue, false, is_final));
        }
        None
    }

    // --- declarations -----------------------------------------------------

    fn declaration(&mut self) {
        self.maybe_collect();
        if self.matches(TokenKind::Final) {
            self.consume(TokenKind::Var, "Expect 'var' after 'final'.");
            self.var_declaration(true);
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Func) {
            self.func_declaration();
        } else if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Enum) {
            self.enum_declaration();
        } else if self.matches(TokenKind::Import) {
            self.import_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_final: bool) {
        let global = self.parse_variable("Expect variable name.", is_final);
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            if is_final {
                self.error("Final variable requires an initialiser.");
            }
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, is_final);
    }

    fn func_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", false);
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global, false);
    }

    fn begin_function(&mut self, kind: FunctionKind, name: &str) {
        let name_ref = self.heap.intern(name);
        let function = FunctionObj::new(Some(name_ref), Some(self.file_ref));
        let receiver = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "self"
        } else {
            ""
        };
        self.compilers.push(CompilerFrame {
            function,
            kind,
            locals: vec![Local {
                name: receiver.to_string(),
                depth: 0,
                captured: false,
                is_final: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        });
    }

    fn end_function(&mut self) -> (FunctionObj, Vec<UpvalueDesc>) {
        self.emit_return();
        let frame = self
            .compilers
            .pop()
            .expect("compiler stack is never empty");
        (frame.function, frame.upvalues)
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme.to_string();
        self.begin_function(kind, &name);
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.frame().function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let arity = self.frame().function.arity.wrapping_add(1);
                self.frame_mut().function.arity = arity;
                let param = self.parse_variable("Expect parameter name.", false);
                self.define_variable(param, false);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        // Collect while the frame is still a root, then allocate without an
        // intervening safe point.
        self.maybe_collect();
        let (function, upvalues) = self.end_function();
        let function = self.heap.alloc(ObjKind::Function(function));
        let k = self.make_constant(Value::Obj(function));
        self.emit_op_arg(OpCode::Closure, k);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable(false);
        self.emit_op_arg(OpCode::Class, name_constant);
        self.define_variable(name_constant, false);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.matches(TokenKind::Extends) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            if self.previous.lexeme == class_name {
                self.error("A class can't inherit from itself.");
            }
            let superclass_name = self.previous.lexeme.to_string();
            self.named_variable(&superclass_name, false);
            self.begin_scope();
            self.add_synthetic_local("super");
            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().map(|c| c.has_superclass).unwrap_or(false) {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Func, "Expect 'func' before method name.");
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "__init__" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op_arg(OpCode::Method, name_constant);
    }

    fn enum_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect enum name.");
        let name_constant = self.identifier_constant(self.previous.lexeme);
        self.declare_variable(false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before enum body.");
        let mut count: u16 = 0;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "Expect enum member name.");
            if count == u8::MAX as u16 {
                self.error("Too many enum members.");
            }
            let member = self.heap.string_value(self.previous.lexeme);
            self.emit_constant(member);
            self.emit_constant(Value::Number(f64::from(count)));
            count += 1;
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after enum body.");
        self.emit_op(OpCode::Enum);
        self.emit_byte(count as u8);
        self.emit_byte(name_constant);
        self.define_variable(name_constant, false);
    }

    fn import_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect module name after 'import'.");
        let name_constant = self.identifier_constant(self.previous.lexeme);
        if self.matches(TokenKind::As) {
            self.consume(TokenKind::Identifier, "Expect alias after 'as'.");
            let alias_constant = self.identifier_constant(self.previous.lexeme);
            self.emit_op_arg(OpCode::ImportAs, name_constant);
            self.emit_byte(alias_constant);
        } else {
            self.emit_op_arg(OpCode::Import, name_constant);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
    }

    // --- statements -------------------------------------------------------

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Assert) {
            self.assert_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let mut end_jumps = Vec::new();
        let mut else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        while self.matches(TokenKind::Elif) {
            if end_jumps.len() >= MAX_ELIF_BRANCHES {
                self.error("Too many elif branches.");
            }
            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(else_jump);
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::LeftParen, "Expect '(' after 'elif'.");
            self.expression();
            self.consume(TokenKind::RightParen, "Expect ')' after condition.");
            else_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.statement();
        }
        end_jumps.push(self.emit_jump(OpCode::Jump));
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.offset();
        self.push_loop(loop_start);
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.pop_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Var) {
            self.consume(TokenKind::Identifier, "Expect variable name.");
            let name = self.previous.lexeme.to_string();
            if self.matches(TokenKind::In) {
                self.for_in_statement(&name);
                return;
            }
            // Traditional loop with a declared induction variable
            self.declare_variable(false);
            if self.matches(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.consume(TokenKind::Semicolon, "Expect ';' after loop initialiser.");
            self.define_variable(0, false);
        } else if self.matches(TokenKind::Semicolon) {
            // no initialiser
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop initialiser.");
            self.emit_op(OpCode::Pop);
        }

        let mut loop_start = self.offset();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.check(TokenKind::RightParen) {
            // The increment textually precedes the body but runs after it:
            // jump over it into the body, loop back to it each iteration.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.offset();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
        }

        self.push_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.pop_loop();
        self.end_scope();
    }

    /// Lower `for (var x in iterable) body` onto the container protocol:
    /// two hidden locals hold the iterable and a running index, the head
    /// tests `index >= len(iterable)`, and each iteration fetches the
    /// element through the container's `__index__` method.
    fn for_in_statement(&mut self, name: &str) {
        self.expression();
        let iter_slot = self.add_synthetic_local("@iter");
        self.emit_constant(Value::Number(0.0));
        let idx_slot = self.add_synthetic_local("@idx");
        self.consume(TokenKind::RightParen, "Expect ')' after loop iterable.");

        // continue and the loop tail land on the increment
        let first_pass = self.emit_jump(OpCode::Jump);
        let increment_start = self.offset();
        self.emit_op_arg(OpCode::GetLocal, idx_slot);
        self.emit_constant(Value::Number(1.0));
        self.emit_op(OpCode::Add);
        self.emit_op_arg(OpCode::SetLocal, idx_slot);
        self.emit_op(OpCode::Pop);
        self.patch_jump(first_pass);

        self.emit_op_arg(OpCode::GetLocal, idx_slot);
        self.emit_op_arg(OpCode::GetLocal, iter_slot);
        self.emit_op(OpCode::Len);
        self.emit_op(OpCode::GreaterEqual);
        let exit_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);

        self.push_loop(increment_start);
        self.begin_scope();
        self.emit_op_arg(OpCode::GetLocal, iter_slot);
        self.emit_op_arg(OpCode::GetLocal, idx_slot);
        let index_method = self.identifier_constant("__index__");
        self.emit_op_arg(OpCode::Invoke, index_method);
        self.emit_byte(1);
        self.add_synthetic_local(name);

        self.statement();
        self.end_scope();
        self.emit_loop(increment_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.pop_loop();
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frame().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn push_loop(&mut self, start: usize) {
        let depth = self.frame().scope_depth;
        self.frame_mut().loops.push(LoopState {
            start,
            scope_depth: depth,
            breaks: Vec::new(),
        });
    }

    fn pop_loop(&mut self) {
        if let Some(state) = self.frame_mut().loops.pop() {
            for jump in state.breaks {
                self.patch_jump(jump);
            }
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let Some(loop_state) = self.frame().loops.last() else {
            self.error("Can't use 'break' outside of a loop.");
            return;
        };
        let depth = loop_state.scope_depth;
        self.emit_scope_pops(depth);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(state) = self.frame_mut().loops.last_mut() {
            state.breaks.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some(loop_state) = self.frame().loops.last() else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        let depth = loop_state.scope_depth;
        let start = loop_state.start;
        self.emit_scope_pops(depth);
        self.emit_loop(start);
    }

    fn assert_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after assert value.");
        self.emit_op(OpCode::Assert);
    }

    // --- expressions ------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);
        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn get_rule(kind: TokenKind) -> Rule<'src, 'ctx> {
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'ctx>>,
            Option<ParseFn<'src, 'ctx>>,
            Precedence,
        ) = match kind {
            TokenKind::LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            TokenKind::LeftBracket => (Some(Self::list), Some(Self::index), Precedence::Call),
            TokenKind::LeftBrace => (Some(Self::dict), None, Precedence::None),
            TokenKind::Dot => (None, Some(Self::dot), Precedence::Call),
            TokenKind::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => (None, Some(Self::binary), Precedence::Term),
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent | TokenKind::StarStar => {
                (None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::Bang => (Some(Self::unary), None, Precedence::None),
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                (Some(Self::prefix_incdec), None, Precedence::None)
            }
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                (None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Has
            | TokenKind::HasNot => (None, Some(Self::binary), Precedence::Comparison),
            TokenKind::And => (None, Some(Self::and_), Precedence::And),
            TokenKind::Or => (None, Some(Self::or_), Precedence::Or),
            TokenKind::Identifier => (Some(Self::variable), None, Precedence::None),
            TokenKind::Str => (Some(Self::string), None, Precedence::None),
            TokenKind::Number => (Some(Self::number), None, Precedence::None),
            TokenKind::True | TokenKind::False | TokenKind::Nil => {
                (Some(Self::literal), None, Precedence::None)
            }
            TokenKind::SelfKw => (Some(Self::self_), None, Precedence::None),
            TokenKind::Super => (Some(Self::super_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        Rule {
            prefix,
            infix,
            precedence,
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or_default();
        self.emit_constant(Value::Number(value));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let precedence = Self::get_rule(op).precedence;
        self.parse_precedence(precedence.next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::StarStar => self.emit_op(OpCode::Pow),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEqual),
            TokenKind::Has => self.emit_op(OpCode::Has),
            TokenKind::HasNot => self.emit_op(OpCode::HasNot),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_arg(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                }
                count = count.wrapping_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_arg(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_arg(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_arg(OpCode::GetProperty, name);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == u16::MAX {
                    self.error("Too many elements in list literal.");
                }
                count = count.wrapping_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightBracket) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        self.emit_op(OpCode::List);
        self.emit_u16(count);
    }

    fn dict(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after dict key.");
                self.expression();
                if count == u16::MAX {
                    self.error("Too many entries in dict literal.");
                }
                count = count.wrapping_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dict entries.");
        self.emit_op(OpCode::Dict);
        self.emit_u16(count);
    }

    /// `a[i]` read/write, `a[i] op= v` read-modify-write, and `a[i:j]`
    /// slices with nil standing in for omitted bounds.
    fn index(&mut self, can_assign: bool) {
        if self.matches(TokenKind::Colon) {
            self.emit_op(OpCode::Nil);
            if self.check(TokenKind::RightBracket) {
                self.emit_op(OpCode::Nil);
            } else {
                self.expression();
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after slice.");
            self.emit_op(OpCode::Slice);
            return;
        }
        self.expression();
        if self.matches(TokenKind::Colon) {
            if self.check(TokenKind::RightBracket) {
                self.emit_op(OpCode::Nil);
            } else {
                self.expression();
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after slice.");
            self.emit_op(OpCode::Slice);
            return;
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else if can_assign && self.check_compound() {
            let op = self.compound_op();
            self.emit_op(OpCode::Dup2);
            self.emit_op(OpCode::GetIndex);
            self.expression();
            self.emit_op(op);
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn check_compound(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::SlashEqual
        )
    }

    /// Consume the compound operator sitting at `current`.
    fn compound_op(&mut self) -> OpCode {
        self.advance();
        match self.previous.kind {
            TokenKind::PlusEqual => OpCode::Add,
            TokenKind::MinusEqual => OpCode::Subtract,
            TokenKind::StarEqual => OpCode::Multiply,
            TokenKind::SlashEqual => OpCode::Divide,
            _ => unreachable!("checked by check_compound"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame_idx = self.compilers.len() - 1;
        let (get_op, set_op, arg, is_final) = match self.resolve_local(frame_idx, name) {
            Some(slot) => {
                let is_final = self.compilers[frame_idx].locals[slot as usize].is_final;
                (OpCode::GetLocal, OpCode::SetLocal, slot, is_final)
            }
            None => match self.resolve_upvalue(frame_idx, name) {
                Some(index) => {
                    let is_final =
                        self.compilers[frame_idx].upvalues[index as usize].is_final;
                    (OpCode::GetUpvalue, OpCode::SetUpvalue, index, is_final)
                }
                None => {
                    let arg = self.identifier_constant(name);
                    let is_final = self.session.final_globals.contains(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, arg, is_final)
                }
            },
        };

        if can_assign && self.matches(TokenKind::Equal) {
            if is_final {
                self.error(&format!("Cannot assign to final variable '{name}'."));
            }
            self.expression();
            self.emit_op_arg(set_op, arg);
        } else if can_assign && self.check_compound() {
            let op = self.compound_op();
            if is_final {
                self.error(&format!("Cannot assign to final variable '{name}'."));
            }
            self.emit_op_arg(get_op, arg);
            self.expression();
            self.emit_op(op);
            self.emit_op_arg(set_op, arg);
        } else if can_assign
            && (self.check(TokenKind::PlusPlus) || self.check(TokenKind::MinusMinus))
        {
            self.advance();
            let op = if self.previous.kind == TokenKind::PlusPlus {
                OpCode::Add
            } else {
                OpCode::Subtract
            };
            if is_final {
                self.error(&format!("Cannot assign to final variable '{name}'."));
            }
            // Postfix: yield the old value, then mutate.
            self.emit_op_arg(get_op, arg);
            self.emit_op_arg(get_op, arg);
            self.emit_constant(Value::Number(1.0));
            self.emit_op(op);
            self.emit_op_arg(set_op, arg);
            self.emit_op(OpCode::Pop);
        } else {
            self.emit_op_arg(get_op, arg);
        }
    }

    /// Prefix `++x` / `--x`: mutate first, yield the new value.
    fn prefix_incdec(&mut self, _can_assign: bool) {
        let op = if self.previous.kind == TokenKind::PlusPlus {
            OpCode::Add
        } else {
            OpCode::Subtract
        };
        self.consume(TokenKind::Identifier, "Expect variable name after prefix operator.");
        let name = self.previous.lexeme.to_string();
        let frame_idx = self.compilers.len() - 1;
        let (get_op, set_op, arg, is_final) = match self.resolve_local(frame_idx, &name) {
            Some(slot) => {
                let is_final = self.compilers[frame_idx].locals[slot as usize].is_final;
                (OpCode::GetLocal, OpCode::SetLocal, slot, is_final)
            }
            None => match self.resolve_upvalue(frame_idx, &name) {
                Some(index) => {
                    let is_final =
                        self.compilers[frame_idx].upvalues[index as usize].is_final;
                    (OpCode::GetUpvalue, OpCode::SetUpvalue, index, is_final)
                }
                None => {
                    let arg = self.identifier_constant(&name);
                    let is_final = self.session.final_globals.contains(&name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, arg, is_final)
                }
            },
        };
        if is_final {
            self.error(&format!("Cannot assign to final variable '{name}'."));
        }
        self.emit_op_arg(get_op, arg);
        self.emit_constant(Value::Number(1.0));
        self.emit_op(op);
        self.emit_op_arg(set_op, arg);
    }

    fn self_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'self' outside of a class.");
            return;
        }
        self.named_variable("self", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => {
                self.error("Can't use 'super' outside of a class.");
            }
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);
        self.named_variable("self", false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_arg(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op_arg(OpCode::GetSuper, name);
        }
    }

    /// String literals, including `${ expr }` interpolation: literal chunks
    /// become constants, each embedded expression re-enters the parser on
    /// its substring, and adjacent pieces are joined by INTERPOLATE.
    fn string(&mut self, _can_assign: bool) {
        let token = self.previous;
        let content = &token.lexeme[1..token.lexeme.len() - 1];
        let segments = segment_string(content);
        if !segments.iter().any(|s| matches!(s, Segment::Expr(_))) {
            let value = self.heap.string_value(content);
            self.emit_constant(value);
            return;
        }
        let mut pieces: Vec<Segment<'src>> = Vec::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) if text.is_empty() => {}
                other => pieces.push(other),
            }
        }
        // INTERPOLATE is binary; seed with an empty literal when the string
        // opens with an expression.
        if !matches!(pieces.first(), Some(Segment::Literal(_))) {
            pieces.insert(0, Segment::Literal(""));
        }
        for (i, piece) in pieces.iter().enumerate() {
            match piece {
                Segment::Literal(text) => {
                    let value = self.heap.string_value(text);
                    self.emit_constant(value);
                }
                Segment::Expr(src) => self.compile_embedded(src, token.line),
            }
            if i > 0 {
                self.emit_op(OpCode::Interpolate);
            }
        }
    }

    fn compile_embedded(&mut self, src: &'src str, line: u32) {
        let saved_scanner = std::mem::replace(&mut self.scanner, Scanner::with_line(src, line));
        let saved_current = self.current;
        let saved_previous = self.previous;
        self.advance();
        self.expression();
        if !self.check(TokenKind::Eof) {
            self.error_at_current("Expect end of interpolated expression.");
        }
        self.scanner = saved_scanner;
        self.current = saved_current;
        self.previous = saved_previous;
    }
}

#[derive(Debug, Clone, Copy)]
enum Segment<'a> {
    Literal(&'a str),
    Expr(&'a str),
}

/// Split raw string content on `${ ... }` markers, honouring escapes and
/// nested braces. The scanner guarantees braces balance before the closing
/// quote.
fn segment_string(content: &str) -> Vec<Segment<'_>> {
    let bytes = content.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                parts.push(Segment::Literal(&content[start..i]));
                let mut depth = 1usize;
                let mut j = i + 2;
                while j < bytes.len() && depth > 0 {
                    match bytes[j] {
                        b'{' => depth += 1,
                        b'}' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                if depth > 0 {
                    parts.push(Segment::Literal(&content[i..]));
                    return parts;
                }
                parts.push(Segment::Expr(&content[i + 2..j - 1]));
                i = j;
                start = j;
            }
            _ => i += 1,
        }
    }
    parts.push(Segment::Literal(&content[start..]));
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_compile(source: &str) -> Result<ObjRef, Vec<SloError>> {
        let mut heap = Heap::new();
        let mut session = Session::default();
        let globals = Table::new();
        compile(source, "test.slo", &mut heap, &mut session, &globals)
    }

    fn compile_ok(source: &str) {
        if let Err(errors) = try_compile(source) {
            panic!("unexpected compile errors: {:?}", errors);
        }
    }

    fn first_error(source: &str) -> SloError {
        match try_compile(source) {
            Ok(_) => panic!("expected a compile error"),
            Err(errors) => errors.into_iter().next().expect("at least one error"),
        }
    }

    #[test]
    fn test_simple_expression_bytecode() {
        let mut heap = Heap::new();
        let mut session = Session::default();
        let globals = Table::new();
        let function =
            compile("1 + 2;", "test.slo", &mut heap, &mut session, &globals).expect("compiles");
        let ObjKind::Function(f) = &heap.objects.get(function).kind else {
            panic!("expected function");
        };
        assert_eq!(
            f.chunk.code,
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::Constant as u8,
                1,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
        assert_eq!(f.chunk.constants, vec![Value::Number(1.0), Value::Number(2.0)]);
    }

    #[test]
    fn test_statements_compile() {
        compile_ok("var x = 1; x = x + 1; print(x);");
        compile_ok("if (1 < 2) { var y = 3; } elif (true) { } else { }");
        compile_ok("while (true) { break; }");
        compile_ok("for (var i = 0; i < 10; i = i + 1) { continue; }");
        compile_ok("for (var x in [1, 2, 3]) { print(x); }");
        compile_ok("func f(a, b) { return a + b; } f(1, 2);");
        compile_ok("class A { func __init__() { self.x = 1; } func m() { return self.x; } }");
        compile_ok("class A { func m() { return 1; } } class B extends A { func m() { return super.m(); } }");
        compile_ok("enum Color { Red, Green, Blue } print(Color.Red);");
        compile_ok("import math; import math as m;");
        compile_ok("var d = {\"a\": 1}; d[\"b\"] = 2; d[\"a\"] += 1;");
        compile_ok("var l = [1, 2, 3]; print(l[1:]); print(l[:2]); print(l[0:1]);");
        compile_ok("var s = \"x=${1 + 2}\"; assert s == \"x=3\";");
        compile_ok("var n = 0; ++n; n++; --n; n--;");
        compile_ok("print(1 has not 2);");
    }

    #[test]
    fn test_final_reassignment_is_compile_error() {
        let err = first_error("final var x = 1; x = 2;");
        assert_eq!(err.kind, ExceptionKind::Syntax);
        assert!(err.message.contains("final variable 'x'"));
    }

    #[test]
    fn test_final_shadowing_is_compile_error() {
        let err = first_error("final var x = 1; { var x = 2; }");
        assert!(err.message.contains("shadow final variable 'x'"));
        let err = first_error("func f() { final var y = 1; { var y = 2; } } ");
        assert!(err.message.contains("shadow final variable 'y'"));
    }

    #[test]
    fn test_final_requires_initialiser() {
        let err = first_error("final var x;");
        assert!(err.message.contains("requires an initialiser"));
    }

    #[test]
    fn test_captured_final_cannot_be_assigned() {
        let err = first_error(
            "func outer() { final var k = 1; func inner() { k = 2; } return inner; }",
        );
        assert!(err.message.contains("final variable 'k'"));
    }

    #[test]
    fn test_local_in_own_initializer() {
        let err = first_error("{ var a = 1; { var a = a; } }");
        assert!(err.message.contains("own initializer"));
    }

    #[test]
    fn test_return_outside_function() {
        let err = first_error("return 1;");
        assert!(err.message.contains("top-level"));
    }

    #[test]
    fn test_return_value_from_initializer() {
        let err = first_error("class A { func __init__() { return 1; } }");
        assert!(err.message.contains("initializer"));
    }

    #[test]
    fn test_break_outside_loop() {
        let err = first_error("break;");
        assert!(err.message.contains("'break'"));
    }

    #[test]
    fn test_self_outside_class() {
        let err = first_error("print(self);");
        assert!(err.message.contains("'self'"));
    }

    #[test]
    fn test_self_inheritance_rejected() {
        let err = first_error("class A extends A { }");
        assert!(err.message.contains("inherit from itself"));
    }

    #[test]
    fn test_error_carries_position_and_snippet() {
        let err = first_error("var x = ;");
        assert_eq!(err.file, "test.slo");
        assert_eq!(err.line, 1);
        assert_eq!(err.snippet.as_deref(), Some("var x = ;"));
    }

    #[test]
    fn test_errors_accumulate_across_statements() {
        let errors = match try_compile("var = 1;\nbreak;\n") {
            Err(e) => e,
            Ok(_) => panic!("expected errors"),
        };
        assert!(errors.len() >= 2);
    }

    #[test]
    fn test_upvalue_descriptors_emitted() {
        let mut heap = Heap::new();
        let mut session = Session::default();
        let globals = Table::new();
        let script = compile(
            "func make() { var i = 0; func inc() { i = i + 1; return i; } return inc; }",
            "test.slo",
            &mut heap,
            &mut session,
            &globals,
        )
        .expect("compiles");
        // The inner function captures one upvalue from `make`.
        let ObjKind::Function(script_fn) = &heap.objects.get(script).kind else {
            panic!("expected function");
        };
        let make_fn = script_fn
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match &heap.objects.get(*r).kind {
                    ObjKind::Function(f) if f.upvalue_count == 0 && f.arity == 0 => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("make function in constants");
        let inc_fn = make_fn
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match &heap.objects.get(*r).kind {
                    ObjKind::Function(f) => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("inc function in constants");
        assert_eq!(inc_fn.upvalue_count, 1);
    }

    #[test]
    fn test_segment_string_nested_braces() {
        let parts = segment_string("a${ {1: 2} }b");
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[1], Segment::Expr(" {1: 2} ")));
    }

    #[test]
    fn test_too_many_constants_reported() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{i} = {i}.5;\n"));
        }
        let err = first_error(&source);
        assert!(err.message.contains("Too many constants"));
    }
}
