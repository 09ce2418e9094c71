use std::rc::Rc;

use log::{debug, log_enabled, Level};

use crate::chunk::Chunk;
use crate::dis;
use crate::error::{ErrorBundle, LoxError};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::opcode::OpCode;
use crate::value::{intern, Fun, IStr, Value};

/// Depth marking a local that is declared but not yet initialized.
const UNINIT: i32 = -1;

/// Slot numbers and upvalue indices are single bytes.
const MAX_LOCALS: usize = 256;
const MAX_UPVALS: usize = 256;

/// Compiles `src` to the implicit top-level function.
///
/// In REPL mode a failed pass is retried once with the whole line parsed as a
/// single expression whose value becomes the script's return value; if the
/// retry fails too, both diagnostics are chained.
pub fn compile(src: &str, is_repl: bool) -> Result<Fun, ErrorBundle> {
    let decls = Compiler::new(src).run(|c| {
        while !c.matches(TokenKind::Eof) {
            c.decl();
        }
    });
    match decls {
        Err(decl_errs) if is_repl => {
            let expr = Compiler::new(src).run(|c| {
                c.expr();
                c.emit_op(OpCode::Return);
            });
            expr.map_err(|expr_errs| decl_errs.with_cause(expr_errs))
        }
        other => other,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FunType {
    Script,
    Fun,
    Method,
    Init,
}

struct Local {
    name: String,
    depth: i32,
    captured: bool,
}

/// An upvalue as seen by the function that owns it: either a local slot of
/// the immediately enclosing function, or one of its upvalues.
#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalRef {
    is_local: bool,
    idx: u8,
}

struct LoopCtx {
    start: usize,
    end_holes: Vec<usize>,
}

/// Per-function compile state. Frames form a stack; the enclosing function is
/// the one below, consulted only during name resolution.
struct FunFrame {
    fun: Fun,
    fun_type: FunType,
    locals: Vec<Local>,
    upvals: Vec<UpvalRef>,
    depth: i32,
    loops: Vec<LoopCtx>,
}

impl FunFrame {
    fn new(fun_type: FunType, name: Option<IStr>) -> Self {
        // Slot 0 is reserved for the callee: it holds `this` inside methods
        // and initializers, and stays anonymous in plain functions.
        let slot0 = if fun_type == FunType::Fun { "" } else { "this" };
        FunFrame {
            fun: Fun { name, arity: 0, upval_count: 0, chunk: Chunk::new() },
            fun_type,
            locals: vec![Local { name: slot0.to_string(), depth: 0, captured: false }],
            upvals: vec![],
            depth: 0,
            loops: vec![],
        }
    }
}

pub struct Compiler<'a> {
    src: &'a str,
    lex: Lexer<'a>,
    cur: Token,
    prev: Token,

    frames: Vec<FunFrame>,
    class_depth: usize,

    errors: ErrorBundle,
    // Whether we are in the error recovery process, dropping further reports
    // until the next synchronization point.
    panic_mode: bool,
}

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct Rule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    prec: Prec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assign, // =
    Or,     // or
    And,    // and
    Equal,  // == !=
    Comp,   // < > <= >=
    Term,   // + -
    Factor, // * /
    Unary,  // ! -
    Call,   // . ()
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assign,
            Prec::Assign => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equal,
            Prec::Equal => Prec::Comp,
            Prec::Comp => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call | Prec::Primary => Prec::Primary,
        }
    }
}

fn rule_of<'a>(kind: TokenKind) -> Rule<'a> {
    use TokenKind::*;
    let (prefix, infix, prec): (Option<ParseFn<'a>>, Option<ParseFn<'a>>, Prec) = match kind {
        LParen => (Some(Compiler::grouping), Some(Compiler::call), Prec::Call),
        Dot => (None, Some(Compiler::dot), Prec::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Prec::Term),
        Plus => (None, Some(Compiler::binary), Prec::Term),
        Slash | Star => (None, Some(Compiler::binary), Prec::Factor),
        Bang => (Some(Compiler::unary), None, Prec::None),
        BangEqual | EqualEqual => (None, Some(Compiler::binary), Prec::Equal),
        Greater | GreaterEqual | Less | LessEqual => (None, Some(Compiler::binary), Prec::Comp),
        Ident => (Some(Compiler::variable), None, Prec::None),
        Str => (Some(Compiler::string), None, Prec::None),
        Num => (Some(Compiler::number), None, Prec::None),
        And => (None, Some(Compiler::and_), Prec::And),
        Or => (None, Some(Compiler::or_), Prec::Or),
        This => (Some(Compiler::this_), None, Prec::None),
        True | False | Nil => (Some(Compiler::lit), None, Prec::None),
        _ => (None, None, Prec::None),
    };
    Rule { prefix, infix, prec }
}

impl<'a> Compiler<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            lex: Lexer::new(src),
            cur: Token::eof(),
            prev: Token::eof(),
            frames: vec![FunFrame::new(FunType::Script, None)],
            class_depth: 0,
            errors: ErrorBundle::default(),
            panic_mode: false,
        }
    }

    fn run(mut self, rule: impl FnOnce(&mut Self)) -> Result<Fun, ErrorBundle> {
        self.advance();
        rule(&mut self);
        let (fun, _) = self.end_frame();
        if self.errors.is_empty() {
            Ok(fun)
        } else {
            Err(self.errors)
        }
    }

    /* Parsing helpers */

    fn text(&self, t: &Token) -> &'a str {
        &self.src[t.start..t.end]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn check_prev(&self, kind: TokenKind) -> bool {
        self.prev.kind == kind
    }

    fn advance(&mut self) {
        self.prev = self.cur;
        // Skip and report bad input until the scanner produces a token.
        loop {
            match self.lex.next() {
                Ok(tok) => {
                    self.cur = tok;
                    break;
                }
                Err(err) => self.report(err),
            }
        }
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, reason: &str) -> bool {
        if !self.check(kind) {
            self.error_at_cur(reason);
            return false;
        }
        self.advance();
        true
    }

    /* Error handling */

    fn report(&mut self, err: LoxError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(err);
    }

    fn error_at(&mut self, tok: Token, reason: &str) {
        let what = match tok.kind {
            TokenKind::Eof => "EOF".to_string(),
            TokenKind::Ident => format!("identifier `{}`", self.text(&tok)),
            _ => format!("`{}`", self.text(&tok)),
        };
        self.report(LoxError::Compile {
            line: tok.line,
            reason: format!("at {what}, {reason}"),
        });
    }

    fn error(&mut self, reason: &str) {
        self.error_at(self.prev, reason);
    }

    fn error_at_cur(&mut self, reason: &str) {
        self.error_at(self.cur, reason);
    }

    fn sync(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) && !self.check_prev(TokenKind::Semi) {
            match self.cur.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    /* Emitting helpers */

    fn frame(&self) -> &FunFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut FunFrame {
        self.frames.last_mut().unwrap()
    }

    fn code_len(&self) -> usize {
        self.frame().fun.chunk.code.len()
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.prev.line;
        self.frame_mut().fun.chunk.write_op(op, line);
    }

    fn emit_u8(&mut self, b: u8) {
        let line = self.prev.line;
        self.frame_mut().fun.chunk.write_u8(b, line);
    }

    fn emit_pair(&mut self, op: OpCode, b: u8) {
        self.emit_op(op);
        self.emit_u8(b);
    }

    fn mk_const(&mut self, v: Value) -> u8 {
        let idx = self.frame_mut().fun.chunk.add_const(v);
        if idx > u8::MAX as usize {
            panic!("too many consts in one chunk");
        }
        idx as u8
    }

    fn emit_const(&mut self, v: Value) {
        let c = self.mk_const(v);
        self.emit_pair(OpCode::Const, c);
    }

    fn ident_const(&mut self, tok: &Token) -> u8 {
        let name = intern(self.text(tok));
        self.mk_const(Value::Str(name))
    }

    fn emit_return(&mut self) {
        if self.frame().fun_type == FunType::Init {
            // An initializer always returns its receiver.
            self.emit_pair(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Emits a forward jump with a two-byte placeholder and returns the
    /// placeholder's offset for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u8(0xff);
        self.emit_u8(0xff);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the two bytes of the jump operand itself.
        let jump = self.code_len() - (offset + 2);
        if jump > u16::MAX as usize {
            panic!("too much code to jump over");
        }
        Chunk::write_u16_at(&mut self.frame_mut().fun.chunk.code, offset, jump as u16);
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let back = self.code_len() + 2 - start;
        if back > u16::MAX as usize {
            panic!("loop body too large");
        }
        self.emit_u8((back >> 8) as u8);
        self.emit_u8((back & 0xff) as u8);
    }

    /* Function frames */

    fn push_frame(&mut self, fun_type: FunType, name: Option<IStr>) {
        self.frames.push(FunFrame::new(fun_type, name));
    }

    fn end_frame(&mut self) -> (Fun, Vec<UpvalRef>) {
        self.emit_return();
        let frame = self.frames.pop().unwrap();
        let mut fun = frame.fun;
        fun.upval_count = frame.upvals.len();
        if log_enabled!(Level::Debug) {
            debug!("{}", dis::disassemble(&fun.chunk, fun.name()));
        }
        (fun, frame.upvals)
    }

    /* Scopes and variables */

    fn begin_scope(&mut self) {
        self.frame_mut().depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame_mut().depth -= 1;
        loop {
            let frame = self.frame();
            let captured = match frame.locals.last() {
                Some(local) if local.depth > frame.depth => local.captured,
                _ => break,
            };
            self.frame_mut().locals.pop();
            // A captured local is lifted into its upvalue cell, anything else
            // is simply discarded.
            self.emit_op(if captured { OpCode::CloseUpval } else { OpCode::Pop });
        }
    }

    fn add_local(&mut self, name: &str) {
        if self.frame().locals.len() >= MAX_LOCALS {
            panic!("too many variables in function");
        }
        self.frame_mut().locals.push(Local {
            name: name.to_string(),
            depth: UNINIT,
            captured: false,
        });
    }

    fn decl_var(&mut self) {
        if self.frame().depth == 0 {
            return;
        }
        let name = self.prev;
        let text = self.text(&name);
        let frame = self.frame();
        let mut clash = false;
        // Search back to the start of the current block only; shadowing an
        // outer block's local is allowed.
        for local in frame.locals.iter().rev() {
            if local.depth != UNINIT && local.depth < frame.depth {
                break;
            }
            if local.name == text {
                clash = true;
                break;
            }
        }
        if clash {
            self.error("already a variable with this name in this scope");
        }
        self.add_local(text);
    }

    /// Parses a variable name, declaring it. Returns the name's constant
    /// index for globals; locals stay on the stack and get `None`.
    fn parse_var(&mut self, reason: &str) -> Option<u8> {
        if !self.consume(TokenKind::Ident, reason) {
            self.advance();
            return None;
        }
        self.decl_var();
        if self.frame().depth > 0 {
            return None;
        }
        let tok = self.prev;
        Some(self.ident_const(&tok))
    }

    fn mark_init(&mut self) {
        let frame = self.frame_mut();
        if frame.depth == 0 {
            return;
        }
        if let Some(local) = frame.locals.last_mut() {
            local.depth = frame.depth;
        }
    }

    fn def_var(&mut self, global: Option<u8>) {
        match global {
            Some(idx) if self.frame().depth == 0 => self.emit_pair(OpCode::DefGlobal, idx),
            _ => self.mark_init(),
        }
    }

    fn resolve_local(&mut self, fi: usize, name: &Token) -> Option<usize> {
        let text = self.text(name);
        let mut uninit = false;
        let mut found = None;
        for (i, local) in self.frames[fi].locals.iter().enumerate().rev() {
            if local.name == text {
                uninit = local.depth == UNINIT;
                found = Some(i);
                break;
            }
        }
        if uninit {
            self.error("can't read local variable in its own initializer");
        }
        found
    }

    /// Resolves `name` as an upvalue of frame `fi`, capturing through every
    /// function between it and the frame that owns the variable.
    fn resolve_upval(&mut self, fi: usize, name: &Token) -> Option<u8> {
        if fi == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(fi - 1, name) {
            self.frames[fi - 1].locals[local].captured = true;
            return Some(self.add_upval(fi, UpvalRef { is_local: true, idx: local as u8 }));
        }
        if let Some(idx) = self.resolve_upval(fi - 1, name) {
            return Some(self.add_upval(fi, UpvalRef { is_local: false, idx }));
        }
        None
    }

    fn add_upval(&mut self, fi: usize, upval: UpvalRef) -> u8 {
        if let Some(i) = self.frames[fi].upvals.iter().position(|u| *u == upval) {
            return i as u8;
        }
        if self.frames[fi].upvals.len() >= MAX_UPVALS {
            self.error("too many closure variables in function");
            return 0;
        }
        let frame = &mut self.frames[fi];
        frame.upvals.push(upval);
        frame.fun.upval_count = frame.upvals.len();
        (frame.upvals.len() - 1) as u8
    }

    fn named_var(&mut self, name: Token, can_assign: bool) {
        let fi = self.frames.len() - 1;
        let (arg, get, set) = if let Some(slot) = self.resolve_local(fi, &name) {
            (slot as u8, OpCode::GetLocal, OpCode::SetLocal)
        } else if let Some(idx) = self.resolve_upval(fi, &name) {
            (idx, OpCode::GetUpval, OpCode::SetUpval)
        } else {
            (self.ident_const(&name), OpCode::GetGlobal, OpCode::SetGlobal)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expr();
            self.emit_pair(set, arg);
        } else {
            self.emit_pair(get, arg);
        }
    }

    /* Declarations and statements */

    fn decl(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_decl();
        } else if self.matches(TokenKind::Fun) {
            self.fun_decl();
        } else if self.matches(TokenKind::Var) {
            self.var_decl();
        } else {
            self.stmt();
        }
        if self.panic_mode {
            self.sync();
        }
    }

    fn var_decl(&mut self) {
        let global = self.parse_var("expect variable name");
        let valid = self.check_prev(TokenKind::Ident);
        if self.matches(TokenKind::Equal) {
            self.expr();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semi, "expect ';' after variable declaration");
        if valid {
            self.def_var(global);
        }
    }

    fn fun_decl(&mut self) {
        let global = self.parse_var("expect function name");
        let valid = self.check_prev(TokenKind::Ident);
        // Initialized before the body so the function can call itself.
        self.mark_init();
        self.fun_(FunType::Fun);
        if valid {
            self.def_var(global);
        }
    }

    /// Compiles a parameter list and body into a fresh function frame, then
    /// emits the closure construction in the enclosing function.
    fn fun_(&mut self, fun_type: FunType) {
        let name = intern(self.text(&self.prev));
        self.push_frame(fun_type, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LParen, "expect '(' after function name");
        if !self.check(TokenKind::RParen) {
            loop {
                self.frame_mut().fun.arity += 1;
                if self.frame().fun.arity > u8::MAX as usize {
                    self.error_at_cur("too many parameters");
                }
                let param = self.parse_var("expect parameter name");
                self.def_var(param);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expect ')' after parameters");
        self.consume(TokenKind::LBrace, "expect '{' before function body");
        self.block();

        // The frame ends with the function body, so the lingering outermost
        // scope never needs closing.
        let (fun, upvals) = self.end_frame();
        let c = self.mk_const(Value::Fun(Rc::new(fun)));
        self.emit_pair(OpCode::Closure, c);
        for upval in upvals {
            self.emit_u8(upval.is_local as u8);
            self.emit_u8(upval.idx);
        }
    }

    fn class_decl(&mut self) {
        if !self.consume(TokenKind::Ident, "expect class name") {
            return;
        }
        let name_tok = self.prev;
        let name_const = self.ident_const(&name_tok);
        self.decl_var();
        self.emit_pair(OpCode::Class, name_const);
        self.def_var(Some(name_const));

        self.class_depth += 1;
        // Put the class back on the stack so methods can attach to it.
        self.named_var(name_tok, false);
        self.consume(TokenKind::LBrace, "expect '{' before class body");
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RBrace, "expect '}' after class body");
        self.emit_op(OpCode::Pop);
        self.class_depth -= 1;
    }

    fn method(&mut self) {
        if !self.consume(TokenKind::Ident, "expect method name") {
            return;
        }
        let name_tok = self.prev;
        let name_const = self.ident_const(&name_tok);
        let fun_type = if self.text(&name_tok) == "init" {
            FunType::Init
        } else {
            FunType::Method
        };
        self.fun_(fun_type);
        self.emit_pair(OpCode::Method, name_const);
    }

    fn stmt(&mut self) {
        if self.matches(TokenKind::Break) {
            if !self.in_loop() {
                self.error("expect 'break' in a loop");
                return;
            }
            self.break_stmt();
        } else if self.matches(TokenKind::Continue) {
            if !self.in_loop() {
                self.error("expect 'continue' in a loop");
                return;
            }
            self.continue_stmt();
        } else if self.matches(TokenKind::Print) {
            self.print_stmt();
        } else if self.matches(TokenKind::For) {
            self.for_stmt();
        } else if self.matches(TokenKind::If) {
            self.if_stmt();
        } else if self.matches(TokenKind::Return) {
            if self.frame().fun_type == FunType::Script {
                self.error("can't return from top-level code");
                return;
            }
            self.return_stmt();
        } else if self.matches(TokenKind::While) {
            self.while_stmt();
        } else if self.matches(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expr_stmt();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.decl();
        }
        self.consume(TokenKind::RBrace, "expect '}' after block");
    }

    fn expr_stmt(&mut self) {
        self.expr();
        self.consume(TokenKind::Semi, "expect ';' after value");
        self.emit_op(OpCode::Pop);
    }

    fn print_stmt(&mut self) {
        self.expr();
        self.consume(TokenKind::Semi, "expect ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn if_stmt(&mut self) {
        self.consume(TokenKind::LParen, "expect '(' after 'if'");
        self.expr();
        self.consume(TokenKind::RParen, "expect ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpUnless);
        self.emit_op(OpCode::Pop); // Drop the predicate before the then branch.
        self.stmt();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop); // Drop the predicate before the else branch.
        if self.matches(TokenKind::Else) {
            self.stmt();
        }
        self.patch_jump(else_jump);
    }

    fn while_stmt(&mut self) {
        let loop_start = self.code_len();
        self.consume(TokenKind::LParen, "expect '(' after 'while'");
        self.expr();
        self.consume(TokenKind::RParen, "expect ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpUnless);
        self.emit_op(OpCode::Pop); // Pop the condition.

        self.begin_loop(loop_start);
        self.stmt();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop); // Pop the condition on the exit path.
        self.end_loop();
    }

    fn for_stmt(&mut self) {
        // for (init; cond; incr) body
        self.begin_scope();
        self.consume(TokenKind::LParen, "expect '(' after 'for'");

        if self.matches(TokenKind::Semi) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_decl();
        } else {
            self.expr_stmt();
        }

        let mut loop_start = self.code_len();
        let cond_start = loop_start;
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semi) {
            self.expr();
            self.consume(TokenKind::Semi, "expect ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpUnless));
            self.emit_op(OpCode::Pop); // Pop the condition.
        }

        if !self.matches(TokenKind::RParen) {
            // The increment runs after the body, so jump over it now and
            // point the loop's restart at it.
            let body_jump = self.emit_jump(OpCode::Jump);
            let incr_start = self.code_len();
            self.expr();
            self.emit_op(OpCode::Pop); // Pure side effect.
            self.consume(TokenKind::RParen, "expect ')' after for clauses");

            self.emit_loop(cond_start);
            loop_start = incr_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.stmt();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop); // Pop the condition on the exit path.
        }
        self.end_loop();
        self.end_scope();
    }

    fn begin_loop(&mut self, start: usize) {
        self.frame_mut().loops.push(LoopCtx { start, end_holes: vec![] });
    }

    fn end_loop(&mut self) {
        let ctx = self.frame_mut().loops.pop().unwrap();
        for hole in ctx.end_holes {
            self.patch_jump(hole);
        }
    }

    fn in_loop(&self) -> bool {
        !self.frame().loops.is_empty()
    }

    fn break_stmt(&mut self) {
        self.consume(TokenKind::Semi, "expect ';' after 'break'");
        let hole = self.emit_jump(OpCode::Jump);
        self.frame_mut().loops.last_mut().unwrap().end_holes.push(hole);
    }

    fn continue_stmt(&mut self) {
        self.consume(TokenKind::Semi, "expect ';' after 'continue'");
        let start = self.frame().loops.last().unwrap().start;
        self.emit_loop(start);
    }

    fn return_stmt(&mut self) {
        if self.matches(TokenKind::Semi) {
            self.emit_return();
            return;
        }
        if self.frame().fun_type == FunType::Init {
            self.error("can't return a value from an initializer");
        }
        self.expr();
        self.consume(TokenKind::Semi, "expect ';' after return value");
        self.emit_op(OpCode::Return);
    }

    /* Expressions */

    fn expr(&mut self) {
        self.parse_prec(Prec::Assign);
    }

    fn parse_prec(&mut self, prec: Prec) {
        self.advance();

        // Parse the LHS.
        let Some(prefix) = rule_of(self.prev.kind).prefix else {
            self.error("expect expression");
            return;
        };
        let can_assign = prec <= Prec::Assign;
        prefix(self, can_assign);

        // Parse any RHS binding at least as tightly as `prec`.
        while rule_of(self.cur.kind).prec >= prec {
            self.advance();
            let infix = rule_of(self.prev.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
            self.advance();
        }
    }

    fn number(&mut self, _can_assign: bool) {
        match self.text(&self.prev).parse::<f64>() {
            Ok(n) => self.emit_const(Value::Num(n)),
            Err(_) => self.error("invalid number literal"),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        // Copy the lexeme inside the quotes.
        let raw = self.text(&self.prev);
        let unquoted = intern(&raw[1..raw.len() - 1]);
        self.emit_const(Value::Str(unquoted));
    }

    fn lit(&mut self, _can_assign: bool) {
        match self.prev.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expr();
        self.consume(TokenKind::RParen, "expect ')' after expression");
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_var(self.prev, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_depth == 0 {
            self.error("can't use 'this' outside of a class");
            return;
        }
        self.named_var(self.prev, false);
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.prev.kind;
        self.parse_prec(Prec::Unary);
        match op {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Neg),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.prev.kind;
        self.parse_prec(rule_of(op).prec.next());
        match op {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mul),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        // A falsey LHS short-circuits and stays as the result; a truthy LHS
        // is dropped in favor of the RHS.
        let end_jump = self.emit_jump(OpCode::JumpUnless);
        self.emit_op(OpCode::Pop);
        self.parse_prec(Prec::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        // A truthy LHS short-circuits and stays as the result; a falsey LHS
        // is dropped in favor of the RHS.
        let else_jump = self.emit_jump(OpCode::JumpUnless);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_prec(Prec::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.arg_list();
        self.emit_pair(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        if !self.consume(TokenKind::Ident, "expect property name after '.'") {
            return;
        }
        let name_tok = self.prev;
        let name_const = self.ident_const(&name_tok);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expr();
            self.emit_pair(OpCode::SetProp, name_const);
        } else if self.matches(TokenKind::LParen) {
            // Fused property-get-then-call.
            let argc = self.arg_list();
            self.emit_pair(OpCode::Invoke, name_const);
            self.emit_u8(argc);
        } else {
            self.emit_pair(OpCode::GetProp, name_const);
        }
    }

    fn arg_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expr();
                argc += 1;
                if argc >= u8::MAX as usize {
                    self.error("too many arguments");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expect ')' after arguments");
        argc.min(u8::MAX as usize) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dis::disassemble;

    fn compile_ok(src: &str) -> Fun {
        compile(src, false).expect("compile error")
    }

    fn compile_err(src: &str) -> ErrorBundle {
        compile(src, false).expect_err("expected a compile error")
    }

    fn count_ops(fun: &Fun, mnemonic: &str) -> usize {
        disassemble(&fun.chunk, "test")
            .lines()
            .filter(|l| l.split_whitespace().any(|w| w == mnemonic))
            .count()
    }

    #[test]
    fn script_has_no_name_and_zero_arity() {
        let fun = compile_ok("1 + 2;");
        assert!(fun.name.is_none());
        assert_eq!(fun.arity, 0);
        assert_eq!(fun.upval_count, 0);
    }

    #[test]
    fn every_block_local_is_popped_exactly_once() {
        let fun = compile_ok("{ var a = 1; var b = 2; }");
        // One pop per local at block exit; no expression statements here.
        assert_eq!(count_ops(&fun, "Pop"), 2);
        assert_eq!(count_ops(&fun, "CloseUpval"), 0);
    }

    #[test]
    fn captured_local_closes_instead_of_popping() {
        let fun = compile_ok("{ var x = 1; fun f() { x = 2; } }");
        assert_eq!(count_ops(&fun, "CloseUpval"), 1);
        // The function local `f` still pops.
        assert_eq!(count_ops(&fun, "Pop"), 1);
    }

    #[test]
    fn closure_upvalue_counts_flow_into_the_prototype() {
        let fun = compile_ok(
            "fun outer() {
                 var x = 1;
                 fun mid() {
                     fun inner() { x = x + 1; }
                 }
             }",
        );
        let outer = fun
            .chunk
            .consts
            .iter()
            .find_map(|c| match c {
                Value::Fun(f) if f.name() == "outer" => Some(f.clone()),
                _ => None,
            })
            .expect("outer prototype");
        let mid = outer
            .chunk
            .consts
            .iter()
            .find_map(|c| match c {
                Value::Fun(f) if f.name() == "mid" => Some(f.clone()),
                _ => None,
            })
            .expect("mid prototype");
        let inner = mid
            .chunk
            .consts
            .iter()
            .find_map(|c| match c {
                Value::Fun(f) if f.name() == "inner" => Some(f.clone()),
                _ => None,
            })
            .expect("inner prototype");
        // `mid` captures `x` only to pass it through to `inner`.
        assert_eq!(outer.upval_count, 0);
        assert_eq!(mid.upval_count, 1);
        assert_eq!(inner.upval_count, 1);
    }

    #[test]
    fn repl_fallback_compiles_a_bare_expression() {
        assert!(compile("2 + 2", false).is_err());
        let fun = compile("2 + 2", true).expect("fallback should parse");
        assert_eq!(count_ops(&fun, "Add"), 1);
    }

    #[test]
    fn own_initializer_read_is_rejected() {
        let errs = compile_err("{ var foo = foo; }");
        assert!(errs
            .to_string()
            .contains("can't read local variable in its own initializer"));
    }

    #[test]
    fn redeclaration_in_same_scope_is_rejected() {
        let errs = compile_err("{ var a = 1; var a = 2; }");
        assert!(errs
            .to_string()
            .contains("already a variable with this name in this scope"));
    }

    #[test]
    fn invalid_assignment_target() {
        let errs = compile_err("1 + 2 = 3;");
        assert!(errs.to_string().contains("invalid assignment target"));
    }

    #[test]
    fn jump_statements_need_a_loop() {
        assert!(compile_err("break;").to_string().contains("expect 'break' in a loop"));
        assert!(compile_err("continue;")
            .to_string()
            .contains("expect 'continue' in a loop"));
    }

    #[test]
    fn closures_cannot_jump_out_of_the_defining_loop() {
        let errs = compile_err("for (var i = 0; i < 10; i = i + 1) { fun g() { break; } }");
        assert!(errs.to_string().contains("expect 'break' in a loop"));
    }

    #[test]
    fn nested_loops_bind_break_to_the_innermost_one() {
        let fun = compile_ok(
            "while (true) {
                 while (true) { break; }
                 break;
             }",
        );
        assert_eq!(count_ops(&fun, "Loop"), 2);
    }

    #[test]
    fn initializer_may_not_return_a_value() {
        let errs = compile_err("class Bar { init(name) { return name; } }");
        assert!(errs
            .to_string()
            .contains("can't return a value from an initializer"));
        assert!(compile("class Foo { init(name) { return; } }", false).is_ok());
    }

    #[test]
    fn this_outside_a_class_is_rejected() {
        let errs = compile_err("fun foo() { return this; }");
        assert!(errs.to_string().contains("can't use 'this' outside of a class"));
    }

    #[test]
    fn top_level_return_is_rejected() {
        let errs = compile_err("return true;");
        assert!(errs.to_string().contains("can't return from top-level code"));
    }

    #[test]
    fn recovery_reports_several_errors_in_one_pass() {
        let errs = compile_err("var 1 = 2; print; var foo = ;");
        assert!(errs.len() > 1);
    }

    #[test]
    fn line_numbers_flow_into_diagnostics() {
        let errs = compile_err("var a = 1;\nvar b = ;\n");
        assert_eq!(
            errs.errors()[0],
            LoxError::Compile {
                line: 2,
                reason: "at `;`, expect expression".to_string()
            }
        );
    }
}
