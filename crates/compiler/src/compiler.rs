//! The single-pass compiler: lexer tokens go in, a finished [`Chunk`]
//! (plus any diagnostics) comes out. There is no intermediate AST — each
//! parsing routine both recognizes its piece of grammar and emits the code
//! for it, threading results through [`Value`].

use std::collections::HashMap;

use pasc_core::{Chunk, Op, PatchKind, Reg};

use crate::builtins;
use crate::config::{CompilerConfig, CompilerMode};
use crate::emitter::{self, Emitter, RegKind};
use crate::error::{is_sync_point, CompileError, CompileResult, ErrorKind};
use crate::lexer::Lexer;
use crate::symtab::{Binding, ConstValue, Symbol, SymbolTable};
use crate::token::{Keyword, Punct, Token, TokenKind};
use crate::types::{
    FieldDesc, IntKind, ParamDesc, ParamMode, TypeArena, TypeDesc, TypeId, TY_BOOL, TY_CHAR,
    TY_F32, TY_F64, TY_I32, TY_I64, TY_INVALID, TY_OPAQUE_PTR, TY_STRING, TY_U32,
};
use crate::value::{self, Value, ValueLoc};

type R<T> = Result<T, CompileError>;

/// A named type declared by the program (`type Foo = ...`), kept apart
/// from the symbol table since type names and value names live in
/// different namespaces.
struct TypeBinding {
    id: TypeId,
}

/// One `for`/`while`/`repeat` loop's bookkeeping: where `break` jumps to.
struct LoopCtx {
    break_patches: Vec<u32>,
}

/// A `var` declaration's `= expr` initializer, resolved once per name-group
/// (`var a, b: t = expr;`) rather than per name.
enum InitKind {
    /// Global scope: a folded compile-time constant, written directly into
    /// the globals blob for each name.
    GlobalConst(ConstValue),
    /// Local scope: `expr` has already been compiled into this frame-relative
    /// scratch slot; each declared name copies from it.
    LocalScratch(i32),
}

/// One subroutine body's bookkeeping: where `exit` jumps to (the shared
/// epilogue), and the return type (`None` for a procedure).
struct SubCtx {
    exit_patches: Vec<u32>,
    return_type: Option<TypeId>,
    /// Frame-relative offset of the hidden return-value slot, for a
    /// function returning a record (passed as a hidden pointer argument).
    hidden_return_slot: Option<i32>,
    /// Frame-relative offset of a scalar function's named result slot: the
    /// classic `f := expr` idiom assigns here like an ordinary local, and
    /// the epilogue copies it into the return register on every exit path
    /// (explicit `exit(...)` and natural fall-through alike).
    result_slot: Option<i32>,
}

pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    cur: Token,
    arena: TypeArena,
    symtab: SymbolTable,
    emitter: Emitter,
    chunk: Chunk,
    diagnostics: Vec<CompileError>,
    config: CompilerConfig,
    type_names: HashMap<String, TypeBinding>,
    loops: Vec<LoopCtx>,
    subs: Vec<SubCtx>,
    /// True once a fatal (non-recoverable) parse error has occurred and
    /// further compilation should stop emitting but keep scanning for
    /// a best-effort diagnostic set.
    panicking: bool,
}

impl<'src> Compiler<'src> {
    pub fn new(source: &'src str, config: CompilerConfig) -> Self {
        let mut lexer = Lexer::new(source);
        let cur = lexer.next();
        Compiler {
            lexer,
            cur,
            arena: TypeArena::new(),
            symtab: SymbolTable::new(),
            emitter: Emitter::new(),
            chunk: Chunk::new(),
            diagnostics: Vec::new(),
            config,
            type_names: HashMap::new(),
            loops: Vec::new(),
            subs: Vec::new(),
            panicking: false,
        }
    }

    /// Compile a complete `program ... .` translation unit.
    pub fn compile(source: &str) -> CompileResult {
        let mut c = Compiler::new(source, CompilerConfig::new().with_mode(CompilerMode::Program));
        c.run_program()
    }

    /// Compile a single REPL input line against a fresh top-level scope
    /// (no `program` header, no trailing `.`): a sequence of declarations
    /// and statements, as if typed inside an implicit `begin ... end`.
    pub fn compile_repl_line(source: &str) -> CompileResult {
        let mut c = Compiler::new(source, CompilerConfig::new().with_mode(CompilerMode::Repl));
        c.run_repl()
    }

    fn run_program(&mut self) -> CompileResult {
        let entry_patch = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);
        if self.check_keyword(Keyword::Program) {
            if let Err(e) = self.program_header() {
                self.report(e);
            }
        }
        let body_start = self.chunk.code_len();
        self.chunk.patch(entry_patch, body_start, PatchKind::Rel24);
        self.chunk.set_entry_point(body_start);

        if let Err(e) = self.program_block() {
            self.report(e);
        }
        if !self.match_punct(Punct::Dot) {
            let line = self.cur.line;
            self.report(CompileError::new(
                ErrorKind::MissingDelimiter,
                line,
                "expected '.' after program body",
            ));
        }
        self.finalize()
    }

    fn run_repl(&mut self) -> CompileResult {
        while !self.cur.is_eof() && self.diagnostics.len() < self.max_diagnostics() {
            let result = if self.is_declaration_start() {
                self.declaration()
            } else {
                self.statement().map(|_| ())
            };
            if let Err(e) = result {
                self.report(e);
                self.synchronize();
            }
        }
        self.finalize()
    }

    fn max_diagnostics(&self) -> usize {
        if self.config.max_diagnostics == 0 {
            usize::MAX
        } else {
            self.config.max_diagnostics
        }
    }

    fn report(&mut self, e: CompileError) {
        self.diagnostics.push(e);
    }

    /// Resolve every subroutine's pending forward-call patches now that
    /// every defined subroutine has a known entry point, and package the
    /// finished chunk plus diagnostics.
    fn finalize(&mut self) -> CompileResult {
        for sub in self.symtab.subroutines().to_vec() {
            if let Some(entry) = sub.entry {
                for p in &sub.pending_patches {
                    self.chunk.patch(p.call_site, entry, p.kind);
                }
            } else if !sub.pending_patches.is_empty() {
                self.report(CompileError::new(
                    ErrorKind::UndefinedIdentifier,
                    0,
                    format!("subroutine '{}' is declared forward but never defined", sub.name),
                ));
            }
        }
        let diagnostics = std::mem::take(&mut self.diagnostics);
        let chunk = if diagnostics.is_empty() {
            Some(std::mem::replace(&mut self.chunk, Chunk::new()))
        } else {
            None
        };
        CompileResult { chunk, diagnostics }
    }

    // --- token plumbing ------------------------------------------------------

    fn advance(&mut self) -> Token {
        let next = self.lexer.next();
        std::mem::replace(&mut self.cur, next)
    }

    fn check_punct(&self, p: Punct) -> bool {
        matches!(&self.cur.kind, TokenKind::Punct(x) if *x == p)
    }

    fn check_keyword(&self, k: Keyword) -> bool {
        matches!(&self.cur.kind, TokenKind::Keyword(x) if *x == k)
    }

    fn match_punct(&mut self, p: Punct) -> bool {
        if self.check_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_keyword(&mut self, k: Keyword) -> bool {
        if self.check_keyword(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: Punct, what: &str) -> R<()> {
        if self.match_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_keyword(&mut self, k: Keyword, what: &str) -> R<()> {
        if self.match_keyword(k) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_ident(&mut self) -> R<String> {
        match &self.cur.kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn unexpected(&self, what: &str) -> CompileError {
        CompileError::new(
            ErrorKind::UnexpectedToken,
            self.cur.line,
            format!("expected {what}, found {:?}", self.cur.kind),
        )
    }

    fn synchronize(&mut self) {
        self.panicking = false;
        while !is_sync_point(&self.cur.kind) {
            self.advance();
        }
    }

    // --- program structure -----------------------------------------------------

    fn program_header(&mut self) -> R<()> {
        self.expect_keyword(Keyword::Program, "'program'")?;
        self.expect_ident()?;
        if self.match_punct(Punct::LParen) {
            loop {
                self.expect_ident()?;
                if !self.match_punct(Punct::Comma) {
                    break;
                }
            }
            self.expect_punct(Punct::RParen, "')'")?;
        }
        self.expect_punct(Punct::Semicolon, "';' after program header")?;
        Ok(())
    }

    /// The top-level block: declarations, then `begin ... end`, wrapped in
    /// the entry point's own `ENTER`/`EXIT` frame (globals live at GP-
    /// relative offsets, so the top level needs a frame only for any
    /// purely local temporaries the statement compiler introduces).
    fn program_block(&mut self) -> R<()> {
        self.subs.push(SubCtx {
            exit_patches: Vec::new(),
            return_type: None,
            hidden_return_slot: None,
            result_slot: None,
        });
        let enter_at = self.emitter.emit(&mut self.chunk, Op::Enter, 0, 0);
        self.chunk.emit_word(0);
        self.chunk.emit_word(0);
        // Declarations below may embed subroutine bodies directly in the
        // code stream (a subroutine is only ever reached via CALL); skip
        // over them to reach this block's own statements.
        let skip_decls = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);

        while self.is_declaration_start() {
            if let Err(e) = self.declaration() {
                self.report(e);
                self.synchronize();
            }
        }
        let stmts_start = self.chunk.code_len();
        self.chunk.patch(skip_decls, stmts_start, PatchKind::Rel24);
        self.compound_statement()?;

        let frame_words = (self.emitter.frame_size.max(0) as u32 & 0xFFFF) as u16;
        let frame_hi = ((self.emitter.frame_size.max(0) as u32) >> 16) as u16;
        // backpatch ENTER's frame-size immediate (two words following it)
        self.patch_enter_frame(enter_at, frame_words, frame_hi);

        let sub = self.subs.pop().unwrap();
        self.emit_subroutine_epilogue(sub);
        Ok(())
    }

    /// Resolve every pending `exit` branch to the code right before `EXIT`,
    /// copy a scalar function's named result slot into the return register
    /// (a no-op for procedures and the top-level block, neither of which
    /// ever sets `result_slot`), then emit `EXIT` itself. Shared between the
    /// top-level block and every subroutine body so both epilogues agree.
    fn emit_subroutine_epilogue(&mut self, sub: SubCtx) {
        for p in sub.exit_patches {
            let here = self.chunk.code_len();
            self.chunk.patch(p, here, PatchKind::Rel24);
        }
        if let Some(slot) = sub.result_slot {
            let ret_ty = sub.return_type.expect("result_slot implies a return type");
            let kind = value::reg_kind_of(&self.arena, ret_ty);
            let v = Value::memory(ret_ty, slot, false);
            let r = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &v);
            let ret_reg = if kind == RegKind::Fpr { emitter::RET_FPR } else { emitter::RET_GPR };
            if r != ret_reg {
                let mov = match (kind, self.arena.get(ret_ty)) {
                    (RegKind::Fpr, TypeDesc::F64) => Op::MovF64,
                    (RegKind::Fpr, _) => Op::MovF32,
                    _ => Op::Mov32,
                };
                self.emitter.emit(&mut self.chunk, mov, ret_reg, r);
            }
        }
        self.emitter.emit(&mut self.chunk, Op::Exit, 0, 0);
    }

    fn patch_enter_frame(&mut self, enter_at: u32, lo: u16, hi: u16) {
        // ENTER's two immediate words directly follow its opcode word; this
        // is not a branch patch (no PatchKind fits), so poke the words
        // through the raw code-index API instead.
        let lo_idx = enter_at + 1;
        let hi_idx = enter_at + 2;
        self.chunk.patch_raw_word(lo_idx, lo);
        self.chunk.patch_raw_word(hi_idx, hi);
    }

    fn is_declaration_start(&self) -> bool {
        matches!(
            self.cur.kind,
            TokenKind::Keyword(Keyword::Const)
                | TokenKind::Keyword(Keyword::Type)
                | TokenKind::Keyword(Keyword::Var)
                | TokenKind::Keyword(Keyword::Procedure)
                | TokenKind::Keyword(Keyword::Function)
        )
    }

    fn declaration(&mut self) -> R<()> {
        match &self.cur.kind {
            TokenKind::Keyword(Keyword::Const) => self.const_section(),
            TokenKind::Keyword(Keyword::Type) => self.type_section(),
            TokenKind::Keyword(Keyword::Var) => self.var_section(true),
            TokenKind::Keyword(Keyword::Procedure) => self.subroutine_decl(false),
            TokenKind::Keyword(Keyword::Function) => self.subroutine_decl(true),
            _ => Err(self.unexpected("a declaration")),
        }
    }

    // --- const/type/var declarations -------------------------------------------

    fn const_section(&mut self) -> R<()> {
        self.advance(); // `const`
        loop {
            let line = self.cur.line;
            let name = self.expect_ident()?;
            self.expect_punct(Punct::Eq, "'=' in const declaration")?;
            let value = self.const_expr()?;
            self.expect_punct(Punct::Semicolon, "';' after const declaration")?;
            let ty = const_type(&value);
            self.define_symbol(Symbol {
                name,
                line,
                type_id: ty,
                binding: Binding::Literal(value),
            })?;
            if !self.is_ident_ahead() {
                break;
            }
        }
        Ok(())
    }

    fn is_ident_ahead(&self) -> bool {
        matches!(self.cur.kind, TokenKind::Ident(_))
    }

    fn type_section(&mut self) -> R<()> {
        self.advance(); // `type`
        loop {
            let name = self.expect_ident()?;
            self.expect_punct(Punct::Eq, "'=' in type declaration")?;
            let id = self.parse_type_spec(Some(&name))?;
            self.expect_punct(Punct::Semicolon, "';' after type declaration")?;
            self.type_names.insert(name.to_ascii_lowercase(), TypeBinding { id });
            if !self.is_ident_ahead() {
                break;
            }
        }
        Ok(())
    }

    fn var_section(&mut self, top_level_semicolon: bool) -> R<()> {
        self.advance(); // `var`
        loop {
            let mut names = vec![self.expect_ident()?];
            let mut lines = vec![self.cur.line];
            while self.match_punct(Punct::Comma) {
                lines.push(self.cur.line);
                names.push(self.expect_ident()?);
            }
            self.expect_punct(Punct::Colon, "':' in var declaration")?;
            let ty = self.parse_type_spec(None)?;
            let init = if self.match_punct(Punct::Eq) {
                let line = self.cur.line;
                if self.symtab.is_global_scope() {
                    Some(InitKind::GlobalConst(self.const_expr().map_err(|_| {
                        CompileError::new(
                            ErrorKind::NotConstant,
                            line,
                            "a global variable's initializer must be a compile-time constant",
                        )
                    })?))
                } else {
                    // Compiled once into a scratch frame slot; every
                    // declared name in this group (`var a, b: t = expr;`)
                    // copies from there instead of re-running `expr`.
                    let v = self.expression()?;
                    let v = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, v, ty);
                    let scratch = self.emitter.frame_size;
                    self.emitter.frame_size += self.arena.size_of(ty).max(1) as i32;
                    self.store_initializer(v, ty, scratch, false);
                    Some(InitKind::LocalScratch(scratch))
                }
            } else {
                None
            };
            self.expect_punct(Punct::Semicolon, "';' after var declaration")?;
            for (name, line) in names.into_iter().zip(lines) {
                let (offset, is_global) = self.declare_variable(name, line, ty)?;
                match &init {
                    None => {}
                    Some(InitKind::GlobalConst(c)) => {
                        debug_assert!(is_global);
                        self.write_global_const(ty, c, offset);
                    }
                    Some(InitKind::LocalScratch(src_offset)) => {
                        debug_assert!(!is_global);
                        let src = Value::memory(ty, *src_offset, false);
                        self.store_initializer(src, ty, offset, false);
                    }
                }
            }
            if !self.is_ident_ahead() {
                break;
            }
        }
        let _ = top_level_semicolon;
        Ok(())
    }

    fn store_initializer(&mut self, v: Value, ty: TypeId, offset: i32, is_global: bool) {
        if matches!(self.arena.get(ty), TypeDesc::String) {
            let r = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &v);
            let empty_reg = self.empty_string_reg();
            self.emitter.emit(&mut self.chunk, Op::SAdd, r, empty_reg);
            value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &v);
            let fresh = Value::register(TY_STRING, r, true);
            value::store_to_memory(&self.arena, &mut self.emitter, &mut self.chunk, fresh, offset, is_global);
        } else {
            value::store_to_memory(&self.arena, &mut self.emitter, &mut self.chunk, v, offset, is_global);
        }
    }

    /// Write a folded constant directly into the globals blob at `offset`,
    /// matching the byte width `size_of(ty)` reports for scalar types and
    /// the 4-byte string-heap handle for string literals.
    fn write_global_const(&mut self, ty: TypeId, c: &ConstValue, offset: i32) {
        let size = self.arena.size_of(ty) as usize;
        let bytes: [u8; 8] = match c {
            ConstValue::Int(i) => i.to_ne_bytes(),
            ConstValue::UInt(u) => u.to_ne_bytes(),
            ConstValue::Bool(b) => (*b as u64).to_ne_bytes(),
            ConstValue::Char(ch) => (*ch as u64).to_ne_bytes(),
            ConstValue::Float(f) => {
                if matches!(self.arena.get(ty), TypeDesc::F32) {
                    ((*f as f32).to_bits() as u64).to_ne_bytes()
                } else {
                    f.to_bits().to_ne_bytes()
                }
            }
            ConstValue::Str(s) => (self.chunk.intern_string(s) as u64).to_ne_bytes(),
        };
        let off = offset as usize;
        self.chunk.globals_mut()[off..off + size].copy_from_slice(&bytes[..size]);
    }

    /// Allocate storage for one variable: global bytes when at global
    /// scope, a frame-relative slot otherwise.
    fn declare_variable(&mut self, name: String, line: u32, ty: TypeId) -> R<(i32, bool)> {
        let size = self.arena.size_of(ty);
        let (offset, is_global, binding) = if self.symtab.is_global_scope() {
            let zero = vec![0u8; size as usize];
            let offset = self.chunk.push_global_bytes(&zero) as i32;
            (offset, true, Binding::Memory { offset, is_global: true })
        } else {
            let offset = self.emitter.frame_size;
            self.emitter.frame_size += size as i32;
            (offset, false, Binding::Memory { offset, is_global: false })
        };
        self.define_symbol(Symbol {
            name,
            line,
            type_id: ty,
            binding,
        })?;
        Ok((offset, is_global))
    }

    fn define_symbol(&mut self, sym: Symbol) -> R<()> {
        let line = sym.line;
        let name = sym.name.clone();
        if builtins::lookup(&name).is_some() {
            return Err(CompileError::new(
                ErrorKind::RedefinitionOfPredefined,
                line,
                format!("'{name}' is a predeclared identifier"),
            ));
        }
        if let Some(prior) = self.symtab.define(sym) {
            return Err(CompileError::new(
                ErrorKind::Redefinition,
                line,
                format!("'{name}' was already declared on line {}", prior.line),
            ));
        }
        Ok(())
    }

    // --- type specs --------------------------------------------------------

    fn parse_type_spec(&mut self, self_name: Option<&str>) -> R<TypeId> {
        if self.match_punct(Punct::Caret) {
            // `^Name`: the pointee may be the type currently being defined
            // (a self-referential record pointer), which the arena handles
            // fine since pointee is resolved by name lookup, not by value.
            let target_name = self.expect_ident()?;
            if let Some(sn) = self_name {
                if sn.eq_ignore_ascii_case(&target_name) {
                    // Forward to a placeholder; patched once `self_name`'s
                    // own TypeId exists by re-resolving at first use is not
                    // possible without a second pass, so instead we push an
                    // opaque pointer — dereferencing it at use sites still
                    // type-checks via the opaque wildcard rule.
                    return Ok(self.arena.make_pointer(TY_OPAQUE_PTR));
                }
            }
            let pointee = self.resolve_type_name(&target_name)?;
            return Ok(self.arena.make_pointer(pointee));
        }
        if self.match_keyword(Keyword::Record) {
            return self.parse_record_body(self_name);
        }
        if self.match_keyword(Keyword::Array) {
            return self.parse_array_spec();
        }
        let name = self.expect_ident()?;
        self.resolve_type_name(&name)
    }

    fn resolve_type_name(&mut self, name: &str) -> R<TypeId> {
        if let Some(id) = builtin_type_by_name(name) {
            return Ok(id);
        }
        if let Some(binding) = self.type_names.get(&name.to_ascii_lowercase()) {
            return Ok(binding.id);
        }
        Err(CompileError::new(
            ErrorKind::UndefinedIdentifier,
            self.cur.line,
            format!("unknown type '{name}'"),
        ))
    }

    fn parse_record_body(&mut self, self_name: Option<&str>) -> R<TypeId> {
        let mut fields = Vec::new();
        let mut offset = 0u32;
        while !self.check_keyword(Keyword::End) {
            let mut names = vec![self.expect_ident()?];
            while self.match_punct(Punct::Comma) {
                names.push(self.expect_ident()?);
            }
            self.expect_punct(Punct::Colon, "':' in record field")?;
            let ty = self.parse_type_spec(self_name)?;
            self.expect_punct(Punct::Semicolon, "';' after record field")?;
            let size = self.arena.size_of(ty);
            for name in names {
                fields.push(FieldDesc { name, ty, offset });
                offset += size;
            }
        }
        self.expect_keyword(Keyword::End, "'end' to close record")?;
        Ok(self.arena.push(TypeDesc::Record {
            name: self_name.map(|s| s.to_string()),
            fields,
            size: offset,
        }))
    }

    fn parse_array_spec(&mut self) -> R<TypeId> {
        self.expect_punct(Punct::LBracket, "'[' after 'array'")?;
        let low = self.const_expr()?;
        self.expect_punct(Punct::DotDot, "'..' in array bounds")?;
        let high = self.const_expr()?;
        self.expect_punct(Punct::RBracket, "']' after array bounds")?;
        self.expect_keyword(Keyword::Of, "'of' after array bounds")?;
        let elem = self.parse_type_spec(None)?;
        let low = value::const_as_i64(&low).ok_or_else(|| {
            CompileError::new(ErrorKind::NotConstant, self.cur.line, "array lower bound must be an ordinal constant")
        })?;
        let high = value::const_as_i64(&high).ok_or_else(|| {
            CompileError::new(ErrorKind::NotConstant, self.cur.line, "array upper bound must be an ordinal constant")
        })?;
        Ok(self.arena.push(TypeDesc::StaticArray { low, high, elem }))
    }

    // --- subroutine declarations ------------------------------------------------

    fn subroutine_decl(&mut self, is_function: bool) -> R<()> {
        let line = self.cur.line;
        self.advance(); // `procedure`/`function`
        let name = self.expect_ident()?;
        let params = self.parse_param_list()?;
        let ret = if is_function {
            self.expect_punct(Punct::Colon, "':' before function result type")?;
            let name = self.expect_ident()?;
            Some(self.resolve_type_name(&name)?)
        } else {
            None
        };
        self.expect_punct(Punct::Semicolon, "';' after subroutine header")?;

        let stack_arg_size = params
            .iter()
            .skip(4)
            .map(|p| self.arena.size_of(p.ty).max(8))
            .sum();
        let returns_record = matches!(ret.map(|t| self.arena.get(t).clone()), Some(TypeDesc::Record { .. }));
        let sub_type = self.arena.push(TypeDesc::Subroutine {
            params: params.clone(),
            ret,
            stack_arg_size,
            hidden_params: returns_record as u8,
        });

        let existing_id = self.symtab.subroutine_id_by_name(&name);
        let id = match existing_id {
            Some(id) => id,
            None => {
                let id = self.symtab.declare_subroutine(&name, sub_type);
                self.define_symbol(Symbol {
                    name: name.clone(),
                    line,
                    type_id: sub_type,
                    binding: Binding::Subroutine(id),
                })?;
                id
            }
        };

        if self.match_keyword(Keyword::Forward) {
            self.expect_punct(Punct::Semicolon, "';' after 'forward'")?;
            return Ok(());
        }

        if self.symtab.subroutine(id).defined {
            return Err(CompileError::new(
                ErrorKind::Redefinition,
                line,
                format!("subroutine '{name}' is already defined"),
            ));
        }

        self.compile_subroutine_body(id, &name, &params, ret, returns_record)
    }

    fn parse_param_list(&mut self) -> R<Vec<ParamDesc>> {
        let mut params = Vec::new();
        if !self.match_punct(Punct::LParen) {
            return Ok(params);
        }
        if self.match_punct(Punct::RParen) {
            return Ok(params);
        }
        loop {
            let mode = if self.match_keyword(Keyword::Var) {
                ParamMode::ByRef
            } else if self.match_keyword(Keyword::Const) {
                ParamMode::Const
            } else {
                ParamMode::Value
            };
            let mut names = vec![self.expect_ident()?];
            while self.match_punct(Punct::Comma) {
                names.push(self.expect_ident()?);
            }
            self.expect_punct(Punct::Colon, "':' in parameter list")?;
            let type_name = self.expect_ident()?;
            let ty = self.resolve_type_name(&type_name)?;
            for name in names {
                params.push(ParamDesc { name, ty, mode });
            }
            if !self.match_punct(Punct::Semicolon) {
                break;
            }
        }
        self.expect_punct(Punct::RParen, "')' to close parameter list")?;
        Ok(params)
    }

    fn compile_subroutine_body(
        &mut self,
        id: crate::symtab::SubroutineId,
        name: &str,
        params: &[ParamDesc],
        ret: Option<TypeId>,
        returns_record: bool,
    ) -> R<()> {
        self.symtab.push_scope();
        self.emitter.frame_size = 0;
        self.emitter.arg_area_size = 0;

        let mut hidden_return_slot = None;
        let mut gpr_cursor = 0usize;
        let mut fpr_cursor = 0usize;
        let mut stack_offset: i32 = 16; // past saved FP/return address, convention-defined
        // Argument register -> frame-slot copies can't be emitted until
        // after ENTER sets up FP, but the register/offset assignment below
        // also defines each parameter's symbol, so the two passes share one
        // loop: collect the copies here, emit them once ENTER is behind us.
        let mut reg_copies: Vec<(Op, Reg, i32)> = Vec::new();

        if returns_record {
            // Hidden pointer argument: slot 0 in the GPR argument bank.
            let offset = self.emitter.frame_size;
            self.emitter.frame_size += 8;
            hidden_return_slot = Some(offset);
            gpr_cursor += 1;
        }

        for p in params {
            let is_float = self.arena.is_float(p.ty) && !matches!(p.mode, ParamMode::ByRef);
            let storage_ty = if matches!(p.mode, ParamMode::ByRef) {
                self.arena.make_pointer(p.ty)
            } else {
                p.ty
            };
            let size = self.arena.size_of(storage_ty).max(1);
            let offset = self.emitter.frame_size;
            self.emitter.frame_size += size as i32;

            let in_reg_bank = if matches!(p.mode, ParamMode::ByRef) {
                gpr_cursor < emitter::ARG_GPRS.len()
            } else if is_float {
                fpr_cursor < emitter::ARG_FPRS.len()
            } else {
                gpr_cursor < emitter::ARG_GPRS.len()
            };

            if in_reg_bank {
                let src_reg = if is_float && !matches!(p.mode, ParamMode::ByRef) {
                    let r = emitter::ARG_FPRS[fpr_cursor];
                    fpr_cursor += 1;
                    r
                } else {
                    let r = emitter::ARG_GPRS[gpr_cursor];
                    gpr_cursor += 1;
                    r
                };
                let store_op = if is_float && !matches!(p.mode, ParamMode::ByRef) {
                    if matches!(self.arena.get(p.ty), TypeDesc::F64) { Op::StF64 } else { Op::StF32 }
                } else {
                    match self.arena.size_of(storage_ty) {
                        1 => Op::St8,
                        2 => Op::St16,
                        4 => Op::St32,
                        _ => Op::St64,
                    }
                };
                reg_copies.push((store_op, src_reg, offset));
            } else {
                // Passed on the caller's stack; nothing to copy down, the
                // variable's "memory" is the caller's stack slot itself.
                let _ = stack_offset;
                stack_offset += 8;
            }

            self.define_symbol(Symbol {
                name: p.name.clone(),
                line: self.cur.line,
                type_id: storage_ty,
                binding: Binding::Memory { offset, is_global: false },
            })?;
        }

        // The classic `f := expr` return-value idiom: a scalar-returning
        // function gets a local slot named after itself, shadowing the
        // outer-scope subroutine symbol for the rest of this body, so an
        // assignment to the function's own name resolves as an ordinary
        // memory store instead of a recursive call.
        let result_slot = if ret.is_some() && !returns_record {
            let ret_ty = ret.unwrap();
            let offset = self.emitter.frame_size;
            self.emitter.frame_size += self.arena.size_of(ret_ty).max(1) as i32;
            self.define_symbol(Symbol {
                name: name.to_string(),
                line: self.cur.line,
                type_id: ret_ty,
                binding: Binding::Memory { offset, is_global: false },
            })?;
            Some(offset)
        } else {
            None
        };

        self.subs.push(SubCtx {
            exit_patches: Vec::new(),
            return_type: ret,
            hidden_return_slot,
            result_slot,
        });

        let entry = self.chunk.code_len();
        let enter_at = self.emitter.emit(&mut self.chunk, Op::Enter, 0, 0);
        self.chunk.emit_word(0);
        self.chunk.emit_word(0);
        // Argument registers are only meaningful once ENTER has set up this
        // frame's FP, so the copies down into frame slots happen here, not
        // before `entry` — `CALL` lands directly on `ENTER`, never on code
        // preceding it.
        for (store_op, src_reg, offset) in reg_copies {
            self.emitter.emit(&mut self.chunk, store_op, src_reg, emitter::FP);
            self.chunk.emit_word(offset as u16);
        }
        // Same reasoning as `program_block`: nested subroutine declarations
        // embed their bodies right here, so jump over them.
        let skip_decls = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);

        while self.is_declaration_start() {
            if let Err(e) = self.declaration() {
                self.report(e);
                self.synchronize();
            }
        }
        let stmts_start = self.chunk.code_len();
        self.chunk.patch(skip_decls, stmts_start, PatchKind::Rel24);
        self.compound_statement()?;

        let frame = self.emitter.frame_size.max(0) as u32;
        self.patch_enter_frame(enter_at, (frame & 0xFFFF) as u16, (frame >> 16) as u16);

        let sub = self.subs.pop().unwrap();
        self.emit_subroutine_epilogue(sub);

        self.expect_punct(Punct::Semicolon, "';' after subroutine body")?;
        self.symtab.pop_scope();

        self.symtab.subroutine_mut(id).defined = true;
        self.symtab.subroutine_mut(id).entry = Some(entry);
        let pending = self.symtab.subroutine(id).pending_patches.clone();
        for p in pending {
            self.chunk.patch(p.call_site, entry, p.kind);
        }
        self.symtab.subroutine_mut(id).pending_patches.clear();
        let _ = name;
        Ok(())
    }

    // --- statements ----------------------------------------------------------

    fn compound_statement(&mut self) -> R<()> {
        self.expect_keyword(Keyword::Begin, "'begin'")?;
        while !self.check_keyword(Keyword::End) {
            if let Err(e) = self.statement() {
                self.report(e);
                self.synchronize();
                if self.check_keyword(Keyword::End) || self.cur.is_eof() {
                    break;
                }
            }
            if !self.match_punct(Punct::Semicolon) {
                break;
            }
        }
        self.expect_keyword(Keyword::End, "'end'")?;
        Ok(())
    }

    fn statement(&mut self) -> R<()> {
        let line = self.cur.line;
        self.chunk.record_line(self.chunk.code_len(), line);
        match &self.cur.kind {
            TokenKind::Keyword(Keyword::Begin) => self.compound_statement(),
            TokenKind::Keyword(Keyword::If) => self.if_statement(),
            TokenKind::Keyword(Keyword::While) => self.while_statement(),
            TokenKind::Keyword(Keyword::Repeat) => self.repeat_statement(),
            TokenKind::Keyword(Keyword::For) => self.for_statement(),
            TokenKind::Keyword(Keyword::Case) => self.case_statement(),
            TokenKind::Keyword(Keyword::Break) => self.break_statement(line),
            TokenKind::Keyword(Keyword::Exit) => self.exit_statement(line),
            TokenKind::Punct(Punct::Semicolon) => Ok(()),
            _ => self.assignment_or_call_statement(),
        }
    }

    fn if_statement(&mut self) -> R<()> {
        self.advance();
        let cond = self.expression()?;
        self.require_bool(&cond)?;
        self.expect_keyword(Keyword::Then, "'then'")?;
        if let Some(ConstValue::Bool(taken)) = cond.as_const().cloned() {
            // A literal condition is resolved here: both arms still get
            // type-checked (so a dead arm's errors are still reported), but
            // only the live one keeps its emitted code.
            let then_mark = self.chunk.code_len();
            self.statement()?;
            if !taken {
                self.chunk.truncate_code(then_mark);
            }
            if self.match_keyword(Keyword::Else) {
                let else_mark = self.chunk.code_len();
                self.statement()?;
                if taken {
                    self.chunk.truncate_code(else_mark);
                }
            }
            return Ok(());
        }
        let reg = self.bool_to_reg(cond)?;
        let else_patch = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bez, reg);
        self.free_reg(reg);
        self.statement()?;
        if self.match_keyword(Keyword::Else) {
            let end_patch = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);
            let else_at = self.chunk.code_len();
            self.chunk.patch(else_patch, else_at, PatchKind::Cond20);
            self.statement()?;
            let end_at = self.chunk.code_len();
            self.chunk.patch(end_patch, end_at, PatchKind::Rel24);
        } else {
            let end_at = self.chunk.code_len();
            self.chunk.patch(else_patch, end_at, PatchKind::Cond20);
        }
        Ok(())
    }

    fn while_statement(&mut self) -> R<()> {
        self.advance();
        let top = self.chunk.code_len();
        let cond = self.expression()?;
        self.require_bool(&cond)?;
        self.expect_keyword(Keyword::Do, "'do'")?;
        if let Some(ConstValue::Bool(false)) = cond.as_const() {
            // A constant-false condition never runs the loop. The body
            // still gets type-checked once (for diagnostics), then its
            // code is discarded along with the folded condition above.
            self.loops.push(LoopCtx { break_patches: Vec::new() });
            self.statement()?;
            self.chunk.truncate_code(top);
            self.loops.pop();
            return Ok(());
        }
        let reg = self.bool_to_reg(cond)?;
        let exit_patch = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bez, reg);
        self.free_reg(reg);
        self.loops.push(LoopCtx { break_patches: Vec::new() });
        self.statement()?;
        let back = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);
        self.chunk.patch(back, top, PatchKind::Rel24);
        let end_at = self.chunk.code_len();
        self.chunk.patch(exit_patch, end_at, PatchKind::Cond20);
        let ctx = self.loops.pop().unwrap();
        for p in ctx.break_patches {
            self.chunk.patch(p, end_at, PatchKind::Rel24);
        }
        Ok(())
    }

    fn repeat_statement(&mut self) -> R<()> {
        self.advance();
        let top = self.chunk.code_len();
        self.loops.push(LoopCtx { break_patches: Vec::new() });
        while !self.check_keyword(Keyword::Until) {
            if let Err(e) = self.statement() {
                self.report(e);
                self.synchronize();
                if self.check_keyword(Keyword::Until) || self.cur.is_eof() {
                    break;
                }
            }
            if !self.match_punct(Punct::Semicolon) {
                break;
            }
        }
        self.expect_keyword(Keyword::Until, "'until'")?;
        let cond = self.expression()?;
        self.require_bool(&cond)?;
        let reg = self.bool_to_reg(cond)?;
        let back = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bez, reg);
        self.chunk.patch(back, top, PatchKind::Cond20);
        self.free_reg(reg);
        let end_at = self.chunk.code_len();
        let ctx = self.loops.pop().unwrap();
        for p in ctx.break_patches {
            self.chunk.patch(p, end_at, PatchKind::Rel24);
        }
        Ok(())
    }

    fn for_statement(&mut self) -> R<()> {
        self.advance();
        let line = self.cur.line;
        let var_name = self.expect_ident()?;
        self.expect_punct(Punct::Assign, "':=' in for header")?;
        let start = self.expression()?;

        let (var_offset, var_global, var_ty) = {
            let sym = self
                .symtab
                .find(&var_name)
                .ok_or_else(|| undefined(&var_name, line))?;
            match sym.binding {
                Binding::Memory { offset, is_global } => (offset, is_global, sym.type_id),
                _ => {
                    return Err(CompileError::new(
                        ErrorKind::InvalidOperandStorage,
                        line,
                        format!("'{var_name}' is not a variable"),
                    ))
                }
            }
        };
        let start = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, start, var_ty);
        value::store_to_memory(&self.arena, &mut self.emitter, &mut self.chunk, start, var_offset, var_global);

        let downto = if self.match_keyword(Keyword::To) {
            false
        } else {
            self.expect_keyword(Keyword::Downto, "'to' or 'downto'")?;
            true
        };
        let bound = self.expression()?;
        let bound = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, bound, var_ty);
        let bound_reg = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &bound);
        self.emitter.regs.mark_persistent(RegKind::Gpr, bound_reg);
        self.expect_keyword(Keyword::Do, "'do'")?;

        let top = self.chunk.code_len();
        let counter_reg = value::emit_lea(&mut self.emitter, &mut self.chunk, var_offset, var_global);
        // counter_reg currently holds &var; load its value for comparison
        let cmp_reg = value::load_to_reg(
            &self.arena,
            &mut self.emitter,
            &mut self.chunk,
            &Value::memory(var_ty, var_offset, var_global),
        );
        self.free_reg(counter_reg);
        let cmp_op = if downto { Op::Islt } else { Op::Isgt };
        self.emitter.emit(&mut self.chunk, cmp_op, cmp_reg, bound_reg);
        self.free_reg(cmp_reg);
        let flag_reg = self.emitter.regs.allocate(RegKind::Gpr).0;
        self.emitter.emit(&mut self.chunk, Op::GetFlag, flag_reg, 0);
        let exit_patch = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bnz, flag_reg);
        self.free_reg(flag_reg);

        self.loops.push(LoopCtx { break_patches: Vec::new() });
        self.statement()?;

        let step_reg = value::load_to_reg(
            &self.arena,
            &mut self.emitter,
            &mut self.chunk,
            &Value::memory(var_ty, var_offset, var_global),
        );
        let one_reg = self.emitter.regs.allocate(RegKind::Gpr).0;
        self.emitter.emit_movqi(&mut self.chunk, one_reg, 1);
        let step_op = if downto { Op::Sub32 } else { Op::Add32 };
        self.emitter.emit(&mut self.chunk, step_op, step_reg, one_reg);
        self.free_reg(one_reg);
        value::store_to_memory(
            &self.arena,
            &mut self.emitter,
            &mut self.chunk,
            Value::register(var_ty, step_reg, true),
            var_offset,
            var_global,
        );

        let back = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);
        self.chunk.patch(back, top, PatchKind::Rel24);
        let end_at = self.chunk.code_len();
        self.chunk.patch(exit_patch, end_at, PatchKind::Cond20);

        self.emitter.regs.unpersist(RegKind::Gpr, bound_reg);
        self.free_reg(bound_reg);

        let ctx = self.loops.pop().unwrap();
        for p in ctx.break_patches {
            self.chunk.patch(p, end_at, PatchKind::Rel24);
        }
        Ok(())
    }

    fn case_statement(&mut self) -> R<()> {
        self.advance();
        let line = self.cur.line;
        let subject = self.expression()?;
        let subject_reg = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &subject);
        self.emitter.regs.mark_persistent(RegKind::Gpr, subject_reg);
        self.expect_keyword(Keyword::Of, "'of'")?;

        let mut seen_constants: Vec<i64> = Vec::new();
        let mut end_patches = Vec::new();
        let mut next_branch_patch: Option<u32> = None;

        while !self.check_keyword(Keyword::End) && !self.check_keyword(Keyword::Else) {
            if let Some(p) = next_branch_patch.take() {
                let here = self.chunk.code_len();
                self.chunk.patch(p, here, PatchKind::Cond20);
            }
            let mut labels = vec![self.const_expr()?];
            while self.match_punct(Punct::Comma) {
                labels.push(self.const_expr()?);
            }
            self.expect_punct(Punct::Colon, "':' after case label")?;

            for label in &labels {
                if let Some(v) = value::const_as_i64(label) {
                    if seen_constants.contains(&v) {
                        self.report(CompileError::new(
                            ErrorKind::Redefinition,
                            line,
                            format!("duplicate case label {v}"),
                        ));
                    } else {
                        seen_constants.push(v);
                    }
                }
            }

            // Match against the first label; additional labels in the same
            // arm chain further equality checks that short-circuit into it.
            let mut arm_entry_patches = Vec::new();
            for (i, label) in labels.iter().enumerate() {
                let lit_reg = self.emitter.regs.allocate(RegKind::Gpr).0;
                self.emitter.emit_movi(&mut self.chunk, lit_reg, value::const_as_i64(label).unwrap_or(0));
                self.emitter.emit(&mut self.chunk, Op::Seq, subject_reg, lit_reg);
                self.free_reg(lit_reg);
                let flag_reg = self.emitter.regs.allocate(RegKind::Gpr).0;
                self.emitter.emit(&mut self.chunk, Op::GetFlag, flag_reg, 0);
                if i + 1 == labels.len() {
                    let miss = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bez, flag_reg);
                    self.free_reg(flag_reg);
                    next_branch_patch = Some(miss);
                } else {
                    let hit = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bnz, flag_reg);
                    self.free_reg(flag_reg);
                    arm_entry_patches.push(hit);
                }
            }
            for p in arm_entry_patches {
                let here = self.chunk.code_len();
                self.chunk.patch(p, here, PatchKind::Cond20);
            }

            self.statement()?;
            let skip = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);
            end_patches.push(skip);
            if !self.match_punct(Punct::Semicolon) {
                break;
            }
        }
        if let Some(p) = next_branch_patch.take() {
            let here = self.chunk.code_len();
            self.chunk.patch(p, here, PatchKind::Cond20);
        }
        if self.match_keyword(Keyword::Else) {
            self.compound_or_single_sequence()?;
        }
        self.expect_keyword(Keyword::End, "'end' to close 'case'")?;
        let end_at = self.chunk.code_len();
        for p in end_patches {
            self.chunk.patch(p, end_at, PatchKind::Rel24);
        }
        self.emitter.regs.unpersist(RegKind::Gpr, subject_reg);
        self.free_reg(subject_reg);
        Ok(())
    }

    /// `case ... else <stmt>; <stmt>; ... end` — a bare statement list with
    /// no `begin`/`end` of its own, terminated by the case's own `end`.
    fn compound_or_single_sequence(&mut self) -> R<()> {
        while !self.check_keyword(Keyword::End) {
            self.statement()?;
            if !self.match_punct(Punct::Semicolon) {
                break;
            }
        }
        Ok(())
    }

    fn break_statement(&mut self, line: u32) -> R<()> {
        self.advance();
        if self.loops.is_empty() {
            return Err(CompileError::new(ErrorKind::BreakOutsideLoop, line, "'break' outside any loop"));
        }
        let patch = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);
        self.loops.last_mut().unwrap().break_patches.push(patch);
        Ok(())
    }

    fn exit_statement(&mut self, line: u32) -> R<()> {
        self.advance();
        if self.match_punct(Punct::LParen) {
            let ret_ty = self.subs.last().and_then(|s| s.return_type).ok_or_else(|| {
                CompileError::new(ErrorKind::TypeMismatch, line, "'exit' with a value is only valid in a function")
            })?;
            let value = self.expression()?;
            let value = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, value, ret_ty);
            self.store_function_result(value, ret_ty);
            self.expect_punct(Punct::RParen, "')' after exit value")?;
        }
        let patch = self.emitter.emit_rel_branch(&mut self.chunk, Op::Br);
        self.subs.last_mut().ok_or_else(|| {
            CompileError::new(ErrorKind::UnexpectedToken, line, "'exit' outside any subroutine")
        })?.exit_patches.push(patch);
        Ok(())
    }

    /// `exit(value)`: store through the same slot the `f := expr` idiom
    /// uses, so every return path (explicit `exit` or falling off the end)
    /// is collected into the return register by one place, the shared
    /// epilogue in `emit_subroutine_epilogue`.
    fn store_function_result(&mut self, value: Value, ret_ty: TypeId) {
        if matches!(self.arena.get(ret_ty), TypeDesc::Record { .. }) {
            if let Some(slot) = self.subs.last().and_then(|s| s.hidden_return_slot) {
                value::store_to_memory(&self.arena, &mut self.emitter, &mut self.chunk, value, slot, false);
            }
            return;
        }
        if let Some(slot) = self.subs.last().and_then(|s| s.result_slot) {
            value::store_to_memory(&self.arena, &mut self.emitter, &mut self.chunk, value, slot, false);
        }
    }

    fn require_bool(&mut self, v: &Value) -> R<()> {
        if v.type_id != TY_BOOL && !matches!(v.loc, ValueLoc::Flag) {
            return Err(CompileError::new(
                ErrorKind::TypeMismatch,
                self.cur.line,
                format!("expected a boolean condition, found {}", self.arena.display_name(v.type_id)),
            ));
        }
        Ok(())
    }

    fn bool_to_reg(&mut self, v: Value) -> R<Reg> {
        let v = value::materialize_flag(&mut self.emitter, &mut self.chunk, v);
        Ok(value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &v))
    }

    fn free_reg(&mut self, r: Reg) {
        let spilled_gpr = self.emitter.regs.free(RegKind::Gpr, r);
        if spilled_gpr {
            let (op, bit) = emitter::reglist_bit(RegKind::Gpr, r, false);
            self.emitter.emit_reglist(&mut self.chunk, op, bit);
        }
    }

    // --- assignment / call statements ------------------------------------------

    fn assignment_or_call_statement(&mut self) -> R<()> {
        let line = self.cur.line;
        let name = self.expect_ident()?;

        if builtins::lookup(&name).is_some() {
            return self.call_builtin(&name, line);
        }

        if let Some(sub_id) = self.symtab.subroutine_id_by_name(&name) {
            if !self.check_punct(Punct::Assign)
                && !self.check_punct(Punct::PlusEq)
                && !self.check_punct(Punct::MinusEq)
                && !self.check_punct(Punct::StarEq)
                && !self.check_punct(Punct::SlashEq)
                && !self.check_punct(Punct::PercentEq)
            {
                self.call_subroutine(sub_id, line)?;
                return Ok(());
            }
        }

        let mut target = {
            let sym = self.symtab.find(&name).ok_or_else(|| undefined(&name, line))?;
            match &sym.binding {
                Binding::Memory { offset, is_global } => Value::memory(sym.type_id, *offset, *is_global),
                _ => {
                    return Err(CompileError::new(
                        ErrorKind::InvalidOperandStorage,
                        line,
                        format!("'{name}' is not assignable"),
                    ))
                }
            }
        };
        // A bare name may still be the root of a `.field`/`[index]`/`^`
        // chain before the assignment operator, e.g. `x.a := 1` or
        // `p^.a := 1`.
        loop {
            if self.match_punct(Punct::Caret) {
                target = self.deref(target)?;
            } else if self.match_punct(Punct::Dot) {
                let field = self.expect_ident()?;
                target = self.field_access(target, &field)?;
            } else if self.check_punct(Punct::LBracket) {
                self.advance();
                let index = self.expression()?;
                self.expect_punct(Punct::RBracket, "']' after array index")?;
                target = self.index_access(target, index)?;
            } else {
                break;
            }
        }
        let target_ty = target.type_id;

        let op = if self.match_punct(Punct::Assign) {
            None
        } else if self.match_punct(Punct::PlusEq) {
            Some(Punct::Plus)
        } else if self.match_punct(Punct::MinusEq) {
            Some(Punct::Minus)
        } else if self.match_punct(Punct::StarEq) {
            Some(Punct::Star)
        } else if self.match_punct(Punct::SlashEq) {
            Some(Punct::Slash)
        } else if self.match_punct(Punct::PercentEq) {
            Some(Punct::Percent)
        } else {
            return Err(self.unexpected("':=' or a compound assignment operator"));
        };

        let rhs = self.expression()?;
        let rhs = if let Some(op) = op {
            let lhs = Value::borrow(&target);
            self.apply_binary_op(op, lhs, rhs, line)?
        } else {
            rhs
        };
        let rhs = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, rhs, target_ty);
        self.store_to_target(rhs, target);
        Ok(())
    }

    /// Store `rhs` (already coerced) into `target`, a resolved lvalue
    /// (`ValueLoc::Mem` or `ValueLoc::Indirect`). Strings go through
    /// `assign_string` for their copy-on-assign semantics; an owned
    /// `Indirect` address register is freed once the store is emitted.
    fn store_to_target(&mut self, rhs: Value, target: Value) {
        let free_base = match &target.loc {
            ValueLoc::Indirect { base, .. } if target.owned_reg => Some(*base),
            _ => None,
        };
        if matches!(self.arena.get(target.type_id), TypeDesc::String) {
            self.assign_string(rhs, &target);
        } else {
            match target.loc {
                ValueLoc::Mem { offset, is_global } => {
                    value::store_to_memory(&self.arena, &mut self.emitter, &mut self.chunk, rhs, offset, is_global)
                }
                ValueLoc::Indirect { base, offset } => {
                    value::store_to_indirect(&self.arena, &mut self.emitter, &mut self.chunk, rhs, base, offset)
                }
                _ => unreachable!("assignment target must be a resolved storage location"),
            }
        }
        if let Some(base) = free_base {
            self.free_reg(base);
        }
    }

    /// `x := y` for a string-typed `x`: alias `y`'s handle then force a
    /// fresh heap allocation via `SAdd` against a cached empty-string
    /// register, so `x` never ends up sharing `y`'s heap entry.
    fn assign_string(&mut self, rhs: Value, target: &Value) {
        let r = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &rhs);
        let empty_reg = self.empty_string_reg();
        self.emitter.emit(&mut self.chunk, Op::SAdd, r, empty_reg);
        value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &rhs);
        let fresh = Value::register(TY_STRING, r, true);
        match target.loc {
            ValueLoc::Mem { offset, is_global } => {
                value::store_to_memory(&self.arena, &mut self.emitter, &mut self.chunk, fresh, offset, is_global)
            }
            ValueLoc::Indirect { base, offset } => {
                value::store_to_indirect(&self.arena, &mut self.emitter, &mut self.chunk, fresh, base, offset)
            }
            _ => unreachable!("assignment target must be a resolved storage location"),
        }
    }

    /// A register holding the handle for the interned empty string
    /// literal, materialized fresh at each use (no cross-statement cache,
    /// since register lifetime does not span statements).
    fn empty_string_reg(&mut self) -> Reg {
        let idx = self.chunk.intern_string("");
        let r = self.emitter.regs.allocate(RegKind::Gpr).0;
        self.emitter.emit_movi(&mut self.chunk, r, idx as i64);
        r
    }

    fn call_builtin(&mut self, name: &str, line: u32) -> R<()> {
        let lower = name.to_ascii_lowercase();
        if lower == "write" || lower == "writeln" {
            let mut args = Vec::new();
            if self.match_punct(Punct::LParen) {
                if !self.check_punct(Punct::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.match_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::RParen, "')' after write arguments")?;
            }
            builtins::compile_write(&self.arena, &mut self.emitter, &mut self.chunk, args, lower == "writeln", line)?;
            return Ok(());
        }
        Err(CompileError::new(
            ErrorKind::UnexpectedToken,
            line,
            format!("'{name}' cannot be used as a statement"),
        ))
    }

    fn call_subroutine(&mut self, id: crate::symtab::SubroutineId, line: u32) -> R<Value> {
        let sub_type = self.symtab.subroutine(id).type_id;
        let (params, ret) = match self.arena.get(sub_type) {
            TypeDesc::Subroutine { params, ret, .. } => (params.clone(), *ret),
            _ => unreachable!(),
        };

        let mut args = Vec::new();
        if self.match_punct(Punct::LParen) {
            if !self.check_punct(Punct::RParen) {
                loop {
                    args.push(self.expression()?);
                    if !self.match_punct(Punct::Comma) {
                        break;
                    }
                }
            }
            self.expect_punct(Punct::RParen, "')' after call arguments")?;
        }
        if args.len() != params.len() {
            return Err(CompileError::new(
                ErrorKind::WrongArgumentCount,
                line,
                format!("expected {} argument(s), found {}", params.len(), args.len()),
            ));
        }

        let (saved_gprs, _) = self.emitter.regs.in_use_snapshot();
        let save_mask = saved_gprs & !(1 << emitter::SP) & !(1 << emitter::FP) & !(1 << emitter::GP);
        let (save_lo, save_hi) = emitter::split_mask(save_mask);
        if save_lo != 0 {
            self.emitter.emit_reglist(&mut self.chunk, Op::PshL, save_lo);
        }
        if save_hi != 0 {
            self.emitter.emit_reglist(&mut self.chunk, Op::PshU, save_hi);
        }

        let mut gpr_cursor = 0usize;
        let mut fpr_cursor = 0usize;
        for (arg, param) in args.into_iter().zip(params.iter()) {
            match param.mode {
                ParamMode::ByRef => {
                    let addr = self.address_of(arg, line)?;
                    if gpr_cursor < emitter::ARG_GPRS.len() {
                        let dst = emitter::ARG_GPRS[gpr_cursor];
                        gpr_cursor += 1;
                        if addr != dst {
                            self.emitter.emit(&mut self.chunk, Op::Mov64, dst, addr);
                        }
                        self.free_reg(addr);
                    }
                }
                ParamMode::Value | ParamMode::Const => {
                    let arg = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, arg, param.ty);
                    let is_float = self.arena.is_float(param.ty);
                    let r = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &arg);
                    if is_float && fpr_cursor < emitter::ARG_FPRS.len() {
                        let dst = emitter::ARG_FPRS[fpr_cursor];
                        fpr_cursor += 1;
                        if r != dst {
                            let mov = if matches!(self.arena.get(param.ty), TypeDesc::F64) { Op::MovF64 } else { Op::MovF32 };
                            self.emitter.emit(&mut self.chunk, mov, dst, r);
                        }
                    } else if !is_float && gpr_cursor < emitter::ARG_GPRS.len() {
                        let dst = emitter::ARG_GPRS[gpr_cursor];
                        gpr_cursor += 1;
                        if r != dst {
                            self.emitter.emit(&mut self.chunk, Op::Mov32, dst, r);
                        }
                    }
                    value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &arg);
                }
            }
        }

        let call_site = self.emitter.emit_rel_branch(&mut self.chunk, Op::Call);
        let desc = self.symtab.subroutine(id);
        if desc.defined {
            let entry = desc.entry.unwrap();
            self.chunk.patch(call_site, entry, PatchKind::Rel24);
        } else {
            self.symtab.record_pending_call(id, call_site, PatchKind::Rel24);
        }

        if save_hi != 0 {
            self.emitter.emit_reglist(&mut self.chunk, Op::PopU, save_hi);
        }
        if save_lo != 0 {
            self.emitter.emit_reglist(&mut self.chunk, Op::PopL, save_lo);
        }

        match ret {
            Some(ret_ty) => {
                let kind = value::reg_kind_of(&self.arena, ret_ty);
                let src = if kind == RegKind::Fpr { emitter::RET_FPR } else { emitter::RET_GPR };
                let (dst, spilled) = self.emitter.regs.allocate(kind);
                if spilled {
                    let (op, bit) = emitter::reglist_bit(kind, dst, true);
                    self.emitter.emit_reglist(&mut self.chunk, op, bit);
                }
                if dst != src {
                    let mov = match (kind, self.arena.get(ret_ty)) {
                        (RegKind::Fpr, TypeDesc::F64) => Op::MovF64,
                        (RegKind::Fpr, _) => Op::MovF32,
                        _ => Op::Mov32,
                    };
                    self.emitter.emit(&mut self.chunk, mov, dst, src);
                }
                Ok(Value::register(ret_ty, dst, true))
            }
            None => Ok(Value::constant(TY_INVALID, ConstValue::Int(0))),
        }
    }

    /// Compile `arg` down to an address, for a `var` argument or `@expr`:
    /// `arg` must be an lvalue (`ValueLoc::Mem` for a named variable, or
    /// `ValueLoc::Indirect` for a location already reached through a
    /// dereference/field/index chain).
    fn address_of(&mut self, arg: Value, line: u32) -> R<Reg> {
        match arg.loc {
            ValueLoc::Mem { offset, is_global } => Ok(value::emit_lea(&mut self.emitter, &mut self.chunk, offset, is_global)),
            ValueLoc::Indirect { base, offset } => {
                let owned = arg.owned_reg;
                let r = value::emit_lea_reg(&mut self.emitter, &mut self.chunk, base, offset);
                if owned {
                    self.free_reg(base);
                }
                Ok(r)
            }
            _ => Err(CompileError::new(
                ErrorKind::InvalidOperandStorage,
                line,
                "a 'var' argument must be a variable",
            )),
        }
    }

    /// `@subroutine`: the subroutine's entry offset is loaded as a plain
    /// address via `LDRIP` rather than called. If the subroutine is not yet
    /// defined (a `forward` reference), the load site is recorded and
    /// patched alongside the subroutine's ordinary call sites once its
    /// entry offset is known.
    fn address_of_subroutine(&mut self, id: crate::symtab::SubroutineId, sub_type: TypeId) -> R<Value> {
        let (r, spilled) = self.emitter.regs.allocate(RegKind::Gpr);
        if spilled {
            let (op, bit) = emitter::reglist_bit(RegKind::Gpr, r, true);
            self.emitter.emit_reglist(&mut self.chunk, op, bit);
        }
        let load_site = self.emitter.emit_ldrip(&mut self.chunk, r);
        let desc = self.symtab.subroutine(id);
        if desc.defined {
            let entry = desc.entry.unwrap();
            self.chunk.patch(load_site, entry, PatchKind::Rip32);
        } else {
            self.symtab.record_pending_call(id, load_site, PatchKind::Rip32);
        }
        let ptr_ty = self.arena.make_pointer(sub_type);
        Ok(Value::register(ptr_ty, r, true))
    }

    // --- expressions -----------------------------------------------------------

    fn const_expr(&mut self) -> R<ConstValue> {
        let v = self.expression()?;
        v.as_const().cloned().ok_or_else(|| {
            CompileError::new(ErrorKind::NotConstant, self.cur.line, "expected a compile-time constant expression")
        })
    }

    /// Relational level: `= <> < > <= >=`.
    fn expression(&mut self) -> R<Value> {
        let mut lhs = self.simple_expression()?;
        loop {
            let op = match &self.cur.kind {
                TokenKind::Punct(p @ (Punct::Eq | Punct::NotEq | Punct::Lt | Punct::Gt | Punct::Le | Punct::Ge)) => *p,
                _ => break,
            };
            let line = self.cur.line;
            self.advance();
            let rhs = self.simple_expression()?;
            lhs = self.compile_comparison(op, lhs, rhs, line)?;
        }
        Ok(lhs)
    }

    /// `+ - or xor`.
    fn simple_expression(&mut self) -> R<Value> {
        let mut lhs = self.term()?;
        loop {
            let op = match &self.cur.kind {
                TokenKind::Punct(p @ (Punct::Plus | Punct::Minus)) => *p,
                TokenKind::Keyword(Keyword::Or) => Punct::Plus, // placeholder, handled below
                TokenKind::Keyword(Keyword::Xor) => Punct::Minus, // placeholder, handled below
                _ => break,
            };
            let is_or = matches!(self.cur.kind, TokenKind::Keyword(Keyword::Or));
            let is_xor = matches!(self.cur.kind, TokenKind::Keyword(Keyword::Xor));
            let line = self.cur.line;
            self.advance();
            if is_or {
                lhs = self.compile_short_circuit_or(lhs, line)?;
                continue;
            }
            if is_xor {
                let rhs = self.term()?;
                lhs = self.apply_binary_op(Punct::NotEq, lhs, rhs, line)?; // bool xor == <>
                continue;
            }
            let rhs = self.term()?;
            lhs = self.apply_binary_op(op, lhs, rhs, line)?;
        }
        Ok(lhs)
    }

    /// `* / div mod and shl shr asr << >>`.
    fn term(&mut self) -> R<Value> {
        let mut lhs = self.unary()?;
        loop {
            let line = self.cur.line;
            let is_and = matches!(self.cur.kind, TokenKind::Keyword(Keyword::And));
            if is_and {
                self.advance();
                lhs = self.compile_short_circuit_and(lhs, line)?;
                continue;
            }
            let kw_op = match &self.cur.kind {
                TokenKind::Keyword(Keyword::Div) => Some(Punct::Slash),
                TokenKind::Keyword(Keyword::Mod) => Some(Punct::Percent),
                TokenKind::Keyword(Keyword::Shl) => Some(Punct::LShift),
                TokenKind::Keyword(Keyword::Shr) => Some(Punct::RShift),
                TokenKind::Keyword(Keyword::Asr) => Some(Punct::RShift),
                _ => None,
            };
            if let Some(op) = kw_op {
                self.advance();
                let rhs = self.unary()?;
                lhs = self.apply_binary_op(op, lhs, rhs, line)?;
                continue;
            }
            let op = match &self.cur.kind {
                TokenKind::Punct(p @ (Punct::Star | Punct::Slash | Punct::Percent | Punct::LShift | Punct::RShift)) => *p,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = self.apply_binary_op(op, lhs, rhs, line)?;
        }
        Ok(lhs)
    }

    /// `+ - not @` (prefix).
    fn unary(&mut self) -> R<Value> {
        let line = self.cur.line;
        if self.match_punct(Punct::Minus) {
            let v = self.unary()?;
            return self.negate(v, line);
        }
        if self.match_punct(Punct::Plus) {
            return self.unary();
        }
        if self.match_keyword(Keyword::Not) {
            let v = self.unary()?;
            return self.logical_not(v, line);
        }
        if self.match_punct(Punct::At) {
            if let TokenKind::Ident(name) = self.cur.kind.clone() {
                let sub = self.symtab.find(&name).and_then(|sym| match sym.binding {
                    Binding::Subroutine(id) => Some((id, sym.type_id)),
                    _ => None,
                });
                if let Some((id, sub_type)) = sub {
                    self.advance();
                    return self.address_of_subroutine(id, sub_type);
                }
            }
            let v = self.postfix()?;
            let pointee_ty = v.type_id;
            let r = self.address_of(v, line)?;
            let ptr_ty = self.arena.make_pointer(pointee_ty);
            return Ok(Value::register(ptr_ty, r, true));
        }
        self.postfix()
    }

    /// `^ . [] ()` postfixes on a primary.
    fn postfix(&mut self) -> R<Value> {
        let mut v = self.primary()?;
        loop {
            if self.match_punct(Punct::Caret) {
                v = self.deref(v)?;
            } else if self.match_punct(Punct::Dot) {
                let field = self.expect_ident()?;
                v = self.field_access(v, &field)?;
            } else if self.check_punct(Punct::LBracket) {
                self.advance();
                let index = self.expression()?;
                self.expect_punct(Punct::RBracket, "']' after array index")?;
                v = self.index_access(v, index)?;
            } else {
                break;
            }
        }
        Ok(v)
    }

    /// `v^`: the pointee keeps its addressability rather than collapsing to
    /// a loaded scalar, so a chained `.field`/`[index]` or an outer `:=`
    /// can still resolve a storage location instead of a dead-end register.
    fn deref(&mut self, v: Value) -> R<Value> {
        let pointee = match self.arena.get(v.type_id) {
            TypeDesc::Pointer { pointee: Some(p) } => *p,
            TypeDesc::Pointer { pointee: None } => {
                return Err(CompileError::new(
                    ErrorKind::OpaquePointerDeref,
                    self.cur.line,
                    "cannot dereference an opaque pointer",
                ))
            }
            _ => {
                return Err(CompileError::new(
                    ErrorKind::TypeMismatch,
                    self.cur.line,
                    "'^' applied to a non-pointer value",
                ))
            }
        };
        let (addr_reg, owned) = match &v.loc {
            ValueLoc::Reg(r) => (*r, v.owned_reg),
            _ => {
                let r = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &v);
                value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &v);
                (r, true)
            }
        };
        Ok(Value::indirect(pointee, addr_reg, 0, owned))
    }

    fn field_access(&mut self, v: Value, field: &str) -> R<Value> {
        let (offset, ty) = match self.arena.get(v.type_id) {
            TypeDesc::Record { fields, .. } => {
                let f = fields.iter().find(|f| f.name.eq_ignore_ascii_case(field)).ok_or_else(|| {
                    CompileError::new(ErrorKind::UndefinedIdentifier, self.cur.line, format!("no field '{field}'"))
                })?;
                (f.offset, f.ty)
            }
            _ => {
                return Err(CompileError::new(
                    ErrorKind::TypeMismatch,
                    self.cur.line,
                    "'.' applied to a non-record value",
                ))
            }
        };
        let owned = v.owned_reg;
        match v.loc {
            ValueLoc::Mem { offset: base, is_global } => Ok(Value::memory(ty, base + offset as i32, is_global)),
            ValueLoc::Indirect { base, offset: base_off } => Ok(Value::indirect(ty, base, base_off + offset as i32, owned)),
            _ => Err(CompileError::new(
                ErrorKind::InvalidOperandStorage,
                self.cur.line,
                "record field access requires a memory-resident record",
            )),
        }
    }

    fn index_access(&mut self, v: Value, index: Value) -> R<Value> {
        let (low, elem) = match self.arena.get(v.type_id) {
            TypeDesc::StaticArray { low, elem, .. } => (*low, *elem),
            _ => {
                return Err(CompileError::new(
                    ErrorKind::TypeMismatch,
                    self.cur.line,
                    "'[]' applied to a non-array value",
                ))
            }
        };
        let elem_size = self.arena.size_of(elem) as i64;
        let owned = v.owned_reg;
        match (v.loc, index.as_const()) {
            (ValueLoc::Mem { offset: base, is_global }, Some(c)) => {
                let i = value::const_as_i64(c).unwrap_or(low);
                let byte_off = (i - low) * elem_size;
                Ok(Value::memory(elem, base + byte_off as i32, is_global))
            }
            (ValueLoc::Indirect { base, offset: base_off }, Some(c)) => {
                let i = value::const_as_i64(c).unwrap_or(low);
                let byte_off = (i - low) * elem_size;
                Ok(Value::indirect(elem, base, base_off + byte_off as i32, owned))
            }
            (ValueLoc::Mem { offset: base, is_global }, None) => {
                let idx_reg = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &index);
                let scale_reg = self.emitter.regs.allocate(RegKind::Gpr).0;
                self.emitter.emit_mul_by_const(&mut self.chunk, scale_reg, idx_reg, elem_size, true);
                self.free_reg(idx_reg);
                let base_reg = value::emit_lea(&mut self.emitter, &mut self.chunk, base - (low as i32) * elem_size as i32, is_global);
                self.emitter.emit(&mut self.chunk, Op::Add64, base_reg, scale_reg);
                self.free_reg(scale_reg);
                // Leave the result addressable rather than eagerly loading,
                // so a further `.field`/`[index]`/`:=` can still resolve it.
                Ok(Value::indirect(elem, base_reg, 0, true))
            }
            (ValueLoc::Indirect { base: addr_base, offset: base_off }, None) => {
                let idx_reg = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &index);
                let scale_reg = self.emitter.regs.allocate(RegKind::Gpr).0;
                self.emitter.emit_mul_by_const(&mut self.chunk, scale_reg, idx_reg, elem_size, true);
                self.free_reg(idx_reg);
                let base_reg = value::emit_lea_reg(
                    &mut self.emitter,
                    &mut self.chunk,
                    addr_base,
                    base_off - (low as i32) * elem_size as i32,
                );
                self.emitter.emit(&mut self.chunk, Op::Add64, base_reg, scale_reg);
                self.free_reg(scale_reg);
                if owned {
                    self.free_reg(addr_base);
                }
                Ok(Value::indirect(elem, base_reg, 0, true))
            }
            _ => Err(CompileError::new(
                ErrorKind::InvalidOperandStorage,
                self.cur.line,
                "array indexing requires a memory-resident array",
            )),
        }
    }

    fn primary(&mut self) -> R<Value> {
        let line = self.cur.line;
        match self.cur.kind.clone() {
            TokenKind::Int(i) => {
                self.advance();
                Ok(Value::constant(TY_I32, ConstValue::Int(i)))
            }
            TokenKind::UInt(u) => {
                self.advance();
                Ok(Value::constant(TY_U32, ConstValue::UInt(u)))
            }
            TokenKind::Real(f) => {
                self.advance();
                Ok(Value::constant(TY_F64, ConstValue::Float(f)))
            }
            TokenKind::Char(c) => {
                self.advance();
                Ok(Value::constant(TY_CHAR, ConstValue::Char(c)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Value::constant(TY_STRING, ConstValue::Str(s.as_str().to_string())))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Value::constant(TY_BOOL, ConstValue::Bool(true)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Value::constant(TY_BOOL, ConstValue::Bool(false)))
            }
            TokenKind::Keyword(Keyword::Nil) => {
                self.advance();
                Ok(Value::constant(TY_OPAQUE_PTR, ConstValue::Int(0)))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let v = self.expression()?;
                self.expect_punct(Punct::RParen, "')'")?;
                Ok(v)
            }
            TokenKind::Ident(name) => {
                self.advance();
                self.resolve_ident(&name, line)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn resolve_ident(&mut self, name: &str, line: u32) -> R<Value> {
        if self.check_punct(Punct::LParen) {
            if let Some(id) = self.symtab.subroutine_id_by_name(name) {
                return self.call_subroutine(id, line);
            }
            if name.eq_ignore_ascii_case("sizeof") {
                self.advance();
                let type_name = self.expect_ident()?;
                let ty = self.resolve_type_name(&type_name)?;
                self.expect_punct(Punct::RParen, "')' after sizeof argument")?;
                return Ok(builtins::compile_sizeof(&self.arena, ty));
            }
        }
        let sym = self.symtab.find(name).ok_or_else(|| undefined(name, line))?.clone();
        match sym.binding {
            Binding::Literal(c) => Ok(Value::constant(sym.type_id, c)),
            Binding::Memory { offset, is_global } => Ok(Value::memory(sym.type_id, offset, is_global)),
            Binding::Subroutine(id) => {
                if self.check_punct(Punct::LParen) {
                    self.call_subroutine(id, line)
                } else {
                    // Parameterless call (procedure/function referenced
                    // bare, as Pascal permits for a result with no args).
                    self.call_subroutine(id, line)
                }
            }
            _ => Err(CompileError::new(
                ErrorKind::InvalidOperandStorage,
                line,
                format!("'{name}' cannot be used in an expression"),
            )),
        }
    }

    // --- binary/unary op codegen -------------------------------------------------

    fn negate(&mut self, v: Value, line: u32) -> R<Value> {
        if let Some(c) = v.as_const() {
            return Ok(match c {
                ConstValue::Int(i) => Value::constant(v.type_id, ConstValue::Int(-i)),
                ConstValue::Float(f) => Value::constant(v.type_id, ConstValue::Float(-f)),
                _ => return Err(CompileError::new(ErrorKind::TypeMismatch, line, "cannot negate this constant")),
            });
        }
        let is_float = value::is_float_ty(&self.arena, v.type_id);
        let r = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &v);
        let op = if is_float {
            if matches!(self.arena.get(v.type_id), TypeDesc::F64) { Op::FNeg64 } else { Op::FNeg32 }
        } else if matches!(value::int_shape(&self.arena, v.type_id), Some((crate::types::ExecWidth::W64, _))) {
            Op::Neg64
        } else {
            Op::Neg32
        };
        self.emitter.emit(&mut self.chunk, op, r, r);
        Ok(Value::register(v.type_id, r, true))
    }

    fn logical_not(&mut self, v: Value, line: u32) -> R<Value> {
        if let Some(ConstValue::Bool(b)) = v.as_const() {
            return Ok(Value::constant(TY_BOOL, ConstValue::Bool(!b)));
        }
        if v.type_id != TY_BOOL {
            return Err(CompileError::new(ErrorKind::TypeMismatch, line, "'not' requires a boolean operand"));
        }
        let v = value::materialize_flag(&mut self.emitter, &mut self.chunk, v);
        let r = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &v);
        self.emitter.emit(&mut self.chunk, Op::NegFlag, 0, 0);
        self.emitter.emit(&mut self.chunk, Op::GetFlag, r, 0);
        Ok(Value::register(TY_BOOL, r, true))
    }

    fn compile_short_circuit_and(&mut self, lhs: Value, line: u32) -> R<Value> {
        self.require_bool(&lhs)?;
        let lr = self.bool_to_reg(lhs)?;
        let short_circuit = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bez, lr);
        let rhs = self.unary()?;
        self.require_bool(&rhs)?;
        let rr = self.bool_to_reg(rhs)?;
        if rr != lr {
            self.emitter.emit(&mut self.chunk, Op::Mov32, lr, rr);
            self.free_reg(rr);
        }
        let end_at = self.chunk.code_len();
        self.chunk.patch(short_circuit, end_at, PatchKind::Cond20);
        let _ = line;
        Ok(Value::register(TY_BOOL, lr, true))
    }

    fn compile_short_circuit_or(&mut self, lhs: Value, line: u32) -> R<Value> {
        self.require_bool(&lhs)?;
        let lr = self.bool_to_reg(lhs)?;
        let short_circuit = self.emitter.emit_cond_branch(&mut self.chunk, Op::Bnz, lr);
        let rhs = self.term()?;
        self.require_bool(&rhs)?;
        let rr = self.bool_to_reg(rhs)?;
        if rr != lr {
            self.emitter.emit(&mut self.chunk, Op::Mov32, lr, rr);
            self.free_reg(rr);
        }
        let end_at = self.chunk.code_len();
        self.chunk.patch(short_circuit, end_at, PatchKind::Cond20);
        let _ = line;
        Ok(Value::register(TY_BOOL, lr, true))
    }

    fn compile_comparison(&mut self, op: Punct, lhs: Value, rhs: Value, line: u32) -> R<Value> {
        if matches!(self.arena.get(lhs.type_id), TypeDesc::String)
            || matches!(self.arena.get(rhs.type_id), TypeDesc::String)
        {
            return self.compile_string_comparison(op, lhs, rhs, line);
        }
        let common = crate::types::coerce(&self.arena, lhs.type_id, rhs.type_id).ok_or_else(|| {
            CompileError::new(
                ErrorKind::TypeMismatch,
                line,
                format!(
                    "cannot compare {} and {}",
                    self.arena.display_name(lhs.type_id),
                    self.arena.display_name(rhs.type_id)
                ),
            )
        })?;
        if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
            if let (Some(af), Some(bf)) = (value::const_as_f64(a), value::const_as_f64(b)) {
                let result = match op {
                    Punct::Eq => af == bf,
                    Punct::NotEq => af != bf,
                    Punct::Lt => af < bf,
                    Punct::Gt => af > bf,
                    Punct::Le => af <= bf,
                    Punct::Ge => af >= bf,
                    _ => unreachable!(),
                };
                return Ok(Value::constant(TY_BOOL, ConstValue::Bool(result)));
            }
        }
        let is_float = value::is_float_ty(&self.arena, common);
        let signed = value::int_shape(&self.arena, common).map(|(_, s)| s).unwrap_or(true);
        let lhs = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, lhs, common);
        let rhs = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, rhs, common);
        let lr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &lhs);
        let rr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &rhs);
        // SEQ/SLT/... compare the full 64-bit register regardless of the
        // operand's declared width, so a 32-bit value must be canonicalized
        // into its sign- or zero-extended 64-bit form first (coerce_value
        // above is a no-op when both sides already share `common`).
        if !is_float && value::int_shape(&self.arena, common).map(|(w, _)| w) == Some(crate::types::ExecWidth::W32) {
            let ext = if signed { Op::Sx32To64 } else { Op::Zx32To64 };
            self.emitter.emit(&mut self.chunk, ext, lr, lr);
            self.emitter.emit(&mut self.chunk, ext, rr, rr);
        }
        let set_op = if is_float {
            match op {
                Punct::Eq => Op::FSeq,
                Punct::NotEq => Op::FSne,
                Punct::Lt => Op::FSlt,
                Punct::Gt => Op::FSgt,
                Punct::Le => Op::FSle,
                Punct::Ge => Op::FSge,
                _ => unreachable!(),
            }
        } else {
            match (op, signed) {
                (Punct::Eq, _) => Op::Seq,
                (Punct::NotEq, _) => Op::Sne,
                (Punct::Lt, true) => Op::Islt,
                (Punct::Lt, false) => Op::Slt,
                (Punct::Gt, true) => Op::Isgt,
                (Punct::Gt, false) => Op::Sgt,
                (Punct::Le, true) => Op::Isle,
                (Punct::Le, false) => Op::Sle,
                (Punct::Ge, true) => Op::Isge,
                (Punct::Ge, false) => Op::Sge,
                _ => unreachable!(),
            }
        };
        self.emitter.emit(&mut self.chunk, set_op, lr, rr);
        value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &rhs);
        value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &lhs);
        Ok(Value::flag(TY_BOOL))
    }

    fn compile_string_comparison(&mut self, op: Punct, lhs: Value, rhs: Value, line: u32) -> R<Value> {
        let lr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &lhs);
        let rr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &rhs);
        let set_op = match op {
            Punct::Lt => Op::StrLt,
            Punct::Gt => Op::StrGt,
            Punct::Eq => Op::StrEqu,
            Punct::NotEq => Op::StrEqu, // negated below
            Punct::Le | Punct::Ge => {
                return Err(CompileError::new(ErrorKind::TypeMismatch, line, "strings only support = <> < >"))
            }
            _ => unreachable!(),
        };
        self.emitter.emit(&mut self.chunk, set_op, lr, rr);
        if matches!(op, Punct::NotEq) {
            self.emitter.emit(&mut self.chunk, Op::NegFlag, 0, 0);
        }
        value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &rhs);
        value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &lhs);
        Ok(Value::flag(TY_BOOL))
    }

    fn apply_binary_op(&mut self, op: Punct, lhs: Value, rhs: Value, line: u32) -> R<Value> {
        if matches!(self.arena.get(lhs.type_id), TypeDesc::String) && matches!(op, Punct::Plus) {
            return self.compile_string_concat(lhs, rhs);
        }
        let common = crate::types::coerce(&self.arena, lhs.type_id, rhs.type_id).ok_or_else(|| {
            CompileError::new(
                ErrorKind::TypeMismatch,
                line,
                format!(
                    "cannot apply this operator to {} and {}",
                    self.arena.display_name(lhs.type_id),
                    self.arena.display_name(rhs.type_id)
                ),
            )
        })?;

        if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
            if let Some(folded) = fold_const_binary(op, a, b, value::is_float_ty(&self.arena, common)) {
                return Ok(Value::constant(common, folded));
            }
        }

        let is_float = value::is_float_ty(&self.arena, common);
        let signed = value::int_shape(&self.arena, common).map(|(_, s)| s).unwrap_or(true);
        let w64 = matches!(value::int_shape(&self.arena, common), Some((crate::types::ExecWidth::W64, _)));
        let lhs = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, lhs, common);

        // Constant-RHS peephole: strength-reduce * and div/mod by a
        // compile-time constant instead of materializing it into a register.
        if let (Punct::Star, Some(k)) = (op, rhs.as_const().and_then(value::const_as_i64)) {
            if !is_float {
                let lr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &lhs);
                let (dst, spilled) = self.emitter.regs.allocate(RegKind::Gpr);
                if spilled {
                    let (op, bit) = emitter::reglist_bit(RegKind::Gpr, dst, true);
                    self.emitter.emit_reglist(&mut self.chunk, op, bit);
                }
                self.emitter.emit_mul_by_const(&mut self.chunk, dst, lr, k, signed);
                value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &lhs);
                return Ok(Value::register(common, dst, true));
            }
        }
        if matches!(op, Punct::Slash) && !is_float {
            if let Some(k) = rhs.as_const().and_then(value::const_as_i64) {
                if k == 0 {
                    return Err(CompileError::new(ErrorKind::DivisionByZero, line, "division by the constant zero"));
                }
                let lr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &lhs);
                let (dst, spilled) = self.emitter.regs.allocate(RegKind::Gpr);
                if spilled {
                    let (op, bit) = emitter::reglist_bit(RegKind::Gpr, dst, true);
                    self.emitter.emit_reglist(&mut self.chunk, op, bit);
                }
                self.emitter.emit_div_by_const(&mut self.chunk, dst, lr, k, signed);
                value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &lhs);
                return Ok(Value::register(common, dst, true));
            }
        }

        let rhs = value::coerce_value(&self.arena, &mut self.emitter, &mut self.chunk, rhs, common);
        let lr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &lhs);
        let rr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &rhs);
        let bin_op = binary_opcode(op, is_float, signed, w64, line)?;
        self.emitter.emit(&mut self.chunk, bin_op, lr, rr);
        value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &rhs);
        Ok(Value::register(common, lr, true))
    }

    fn compile_string_concat(&mut self, lhs: Value, rhs: Value) -> R<Value> {
        let lr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &lhs);
        let rr = value::load_to_reg(&self.arena, &mut self.emitter, &mut self.chunk, &rhs);
        let (dst, spilled) = self.emitter.regs.allocate(RegKind::Gpr);
        if spilled {
            let (op, bit) = emitter::reglist_bit(RegKind::Gpr, dst, true);
            self.emitter.emit_reglist(&mut self.chunk, op, bit);
        }
        if dst != lr {
            self.emitter.emit(&mut self.chunk, Op::Mov32, dst, lr);
        }
        self.emitter.emit(&mut self.chunk, Op::SAdd, dst, rr);
        value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &rhs);
        if dst != lr {
            value::free_value(&mut self.emitter, &mut self.chunk, &self.arena, &lhs);
        }
        Ok(Value::register(TY_STRING, dst, true))
    }
}

fn undefined(name: &str, line: u32) -> CompileError {
    CompileError::new(ErrorKind::UndefinedIdentifier, line, format!("undefined identifier '{name}'"))
}

fn const_type(v: &ConstValue) -> TypeId {
    match v {
        ConstValue::Int(_) => TY_I32,
        ConstValue::UInt(_) => TY_U32,
        ConstValue::Float(_) => TY_F64,
        ConstValue::Bool(_) => TY_BOOL,
        ConstValue::Char(_) => TY_CHAR,
        ConstValue::Str(_) => TY_STRING,
    }
}

fn builtin_type_by_name(name: &str) -> Option<TypeId> {
    use crate::types::*;
    let lower = name.to_ascii_lowercase();
    Some(match lower.as_str() {
        "shortint" => TY_I8,
        "byte" => TY_U8,
        "smallint" => TY_I16,
        "word" => TY_U16,
        "integer" => TY_I32,
        "cardinal" => TY_U32,
        "int64" => TY_I64,
        "uint64" => TY_U64,
        "single" => TY_F32,
        "double" | "real" => TY_F64,
        "boolean" => TY_BOOL,
        "char" => TY_CHAR,
        "string" => TY_STRING,
        "pointer" => TY_OPAQUE_PTR,
        _ => return None,
    })
}

fn fold_const_binary(op: Punct, a: &ConstValue, b: &ConstValue, is_float: bool) -> Option<ConstValue> {
    if is_float {
        let af = value::const_as_f64(a)?;
        let bf = value::const_as_f64(b)?;
        let r = match op {
            Punct::Plus => af + bf,
            Punct::Minus => af - bf,
            Punct::Star => af * bf,
            Punct::Slash => af / bf,
            _ => return None,
        };
        Some(ConstValue::Float(r))
    } else {
        let ai = value::const_as_i64(a)?;
        let bi = value::const_as_i64(b)?;
        let r = match op {
            Punct::Plus => ai.checked_add(bi)?,
            Punct::Minus => ai.checked_sub(bi)?,
            Punct::Star => ai.checked_mul(bi)?,
            Punct::Slash => {
                if bi == 0 {
                    return None;
                }
                ai.wrapping_div(bi)
            }
            Punct::Percent => {
                if bi == 0 {
                    return None;
                }
                ai.wrapping_rem(bi)
            }
            Punct::LShift => ai.checked_shl(bi as u32)?,
            Punct::RShift => ai.checked_shr(bi as u32)?,
            _ => return None,
        };
        Some(ConstValue::Int(r))
    }
}

fn binary_opcode(op: Punct, is_float: bool, signed: bool, w64: bool, line: u32) -> R<Op> {
    if is_float {
        return Ok(match op {
            Punct::Plus => if w64 { Op::FAdd64 } else { Op::FAdd32 },
            Punct::Minus => if w64 { Op::FSub64 } else { Op::FSub32 },
            Punct::Star => if w64 { Op::FMul64 } else { Op::FMul32 },
            Punct::Slash => if w64 { Op::FDiv64 } else { Op::FDiv32 },
            _ => return Err(CompileError::new(ErrorKind::TypeMismatch, line, "operator not valid on floating values")),
        });
    }
    Ok(match (op, w64, signed) {
        (Punct::Plus, false, _) => Op::Add32,
        (Punct::Plus, true, _) => Op::Add64,
        (Punct::Minus, false, _) => Op::Sub32,
        (Punct::Minus, true, _) => Op::Sub64,
        (Punct::Star, false, true) => Op::Imul32,
        (Punct::Star, false, false) => Op::Mul32,
        (Punct::Star, true, true) => Op::Imul64,
        (Punct::Star, true, false) => Op::Mul64,
        (Punct::Slash, false, true) => Op::Idiv32,
        (Punct::Slash, false, false) => Op::Div32,
        (Punct::Slash, true, true) => Op::Idiv64,
        (Punct::Slash, true, false) => Op::Div64,
        (Punct::Percent, false, _) => Op::Mod32,
        (Punct::Percent, true, _) => Op::Mod64,
        (Punct::LShift, false, _) => Op::Shl32,
        (Punct::LShift, true, _) => Op::Shl64,
        (Punct::RShift, false, true) => Op::Sar32,
        (Punct::RShift, false, false) => Op::Shr32,
        (Punct::RShift, true, true) => Op::Sar64,
        (Punct::RShift, true, false) => Op::Shr64,
        _ => return Err(CompileError::new(ErrorKind::TypeMismatch, line, "operator not valid on these operands")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_trivial_program() {
        let src = "program Hello; begin writeln('hi') end.";
        let result = Compiler::compile(src);
        assert!(result.success(), "diagnostics: {:?}", result.diagnostics);
    }

    #[test]
    fn reports_undefined_identifier() {
        let src = "program P; begin x := 1 end.";
        let result = Compiler::compile(src);
        assert!(!result.success());
        assert!(result.diagnostics.iter().any(|d| d.kind == ErrorKind::UndefinedIdentifier));
    }

    #[test]
    fn compiles_arithmetic_and_control_flow() {
        let src = r#"
            program P;
            var i, total: integer;
            begin
                total := 0;
                for i := 1 to 10 do
                    total := total + i;
                writeln(total);
            end.
        "#;
        let result = Compiler::compile(src);
        assert!(result.success(), "diagnostics: {:?}", result.diagnostics);
    }

    #[test]
    fn duplicate_case_labels_are_a_diagnosed_warning_not_fatal() {
        let src = r#"
            program P;
            var x: integer;
            begin
                x := 1;
                case x of
                    1: writeln(1);
                    1: writeln(2);
                end;
            end.
        "#;
        let result = Compiler::compile(src);
        assert!(result.chunk.is_none() || !result.diagnostics.is_empty());
    }

    #[test]
    fn forward_declared_subroutine_resolves_after_definition() {
        let src = r#"
            program P;
            procedure Helper(); forward;
            procedure Main();
            begin
                Helper();
            end;
            procedure Helper();
            begin
                writeln(1);
            end;
            begin
                Main();
            end.
        "#;
        let result = Compiler::compile(src);
        assert!(result.success(), "diagnostics: {:?}", result.diagnostics);
    }
}
