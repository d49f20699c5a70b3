//! AST → bytecode lowering.
//!
//! The compiler threads a result *hint* down the tree (what the parent needs:
//! a specific register, an lvalue store, any value, or nothing) and returns a
//! compile-time *value* up (a register, a symbolic reference to a named
//! register, or a constant available for folding). Constants are materialized
//! into registers only when they escape into a runtime operation.
//!
//! Registers follow the instruction-as-register scheme: emitting the
//! instruction at body position `i` of a function with `P` parameters makes
//! register `P + i`. Forward jumps are emitted with a placeholder offset and
//! patched when their target position is known; loop back-edges encode the
//! negative delta directly.

#[cfg(test)]
mod tests;

use ecow::EcoString;
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::bytecode::{Bytecode, Code, Data, DebugInfo, Op, Primitive};
use crate::errors::{CompileError, Diagnostic};
use crate::syntax::ast::{BinOp, JumpKind, Literal, MatchCase, Node, SuffixOp, TypeOp, UnOp};
use crate::value::{arith_binary, arith_negate, number_cmp, Arith, TypeTag};

/// Sentinel for an already-recorded compile error.
pub(crate) struct Fail;

type CResult<T> = Result<T, Fail>;

/// Placeholder offset for forward jumps; must never survive into a module.
const PATCH: i32 = i32::MAX;

// ============================================================================
// Hints and compile-time values
// ============================================================================

/// What the parent needs from a node.
#[derive(Clone, Copy)]
enum Hint {
    /// Any value; constants may stay unmaterialized.
    Value,
    /// The value will be dropped; emit side effects only.
    Discard,
    /// Emit into this specific register.
    Rt(u32),
    /// The node is an lvalue target; the register holds the source value.
    Lval(LvalKind, u32),
}

#[derive(Clone, Copy)]
enum LvalKind {
    Let { mutable: bool },
    Assign,
    Aug(BinOp),
}

/// What a node produced.
#[derive(Clone, PartialEq, Debug)]
enum CValue {
    /// Statements: no value.
    Empty,
    /// A freshly produced register this expression owns.
    Rt(u32),
    /// A named register (variable, capture, global copy); never discarded.
    Ref(u32),
    Null,
    Int(i64),
    Num(f64),
    Bool(bool),
    Str(EcoString),
}

impl CValue {
    fn as_arith(&self) -> Option<Arith> {
        match self {
            CValue::Int(i) => Some(Arith::Int(*i)),
            CValue::Num(n) => Some(Arith::Num(*n)),
            _ => None,
        }
    }

    fn is_const(&self) -> bool {
        !matches!(self, CValue::Empty | CValue::Rt(_) | CValue::Ref(_))
    }
}

// ============================================================================
// Scopes
// ============================================================================

struct Symbol {
    name: EcoString,
    reg: u32,
    mutable: bool,
    /// Index into the function stack at declaration time.
    fn_depth: usize,
}

struct LoopCtx {
    /// Body position of the `continue` target.
    cond_begin: usize,
    /// Body positions of pending `break` jumps.
    breaks: Vec<usize>,
    /// Catch regions of the current function active at loop entry;
    /// `break`/`continue` pop handlers entered past this mark.
    catch_base: usize,
}

enum ScopeKind {
    Function,
    Block,
    Loop(LoopCtx),
}

struct Scope {
    kind: ScopeKind,
    symbols: Vec<Symbol>,
}

struct CaptureEntry {
    name: EcoString,
    /// Register in the *enclosing* function holding the captured value.
    outer_ref: u32,
    /// Register of the synthesized `load_capture` in this function.
    local_reg: u32,
}

struct FnCtx {
    body: Vec<u32>,
    arity: u32,
    captures: Vec<CaptureEntry>,
}

/// A lexically active `catch` whose protected expression is being compiled.
/// `try` inside it hands error values to the handler instead of returning.
struct CatchCtx {
    fn_depth: usize,
    catch_reg: u32,
    /// Body positions of `try` hand-off jumps to patch to the handler.
    jumps: Vec<usize>,
}

enum Locality {
    Local,
    Outer,
}

// ============================================================================
// Compiler
// ============================================================================

/// Rollback point for incremental (REPL) compiles.
struct Checkpoint {
    ops: usize,
    extra: usize,
    strings: usize,
    lines: usize,
    main: usize,
    module_symbols: usize,
}

pub struct Compiler {
    ops: Vec<Op>,
    data: Vec<Data>,
    extra: Vec<u32>,
    strings: Vec<u8>,
    string_map: HashMap<EcoString, (u32, u32)>,
    lines: Vec<(u32, u32)>,
    scopes: Vec<Scope>,
    fns: Vec<FnCtx>,
    catches: Vec<CatchCtx>,
    diagnostics: Vec<Diagnostic>,
    path: EcoString,
    source: EcoString,
    /// Added to node offsets; lets a REPL line report positions within the
    /// session's accumulated source.
    offset_base: u32,
}

impl Compiler {
    pub fn new(path: &str) -> Self {
        Compiler {
            ops: Vec::new(),
            data: Vec::new(),
            extra: Vec::new(),
            strings: Vec::new(),
            string_map: HashMap::new(),
            lines: Vec::new(),
            scopes: vec![Scope {
                kind: ScopeKind::Function,
                symbols: Vec::new(),
            }],
            fns: vec![FnCtx {
                body: Vec::new(),
                arity: 0,
                captures: Vec::new(),
            }],
            catches: Vec::new(),
            diagnostics: Vec::new(),
            path: path.into(),
            source: EcoString::new(),
            offset_base: 0,
        }
    }

    /// One-shot compilation of a whole program.
    pub fn compile(path: &str, source: &str, stmts: &[&Node<'_>]) -> Result<Bytecode, CompileError> {
        let mut compiler = Compiler::new(path);
        compiler.push_source(source);
        compiler.compile_more(stmts)?;
        Ok(compiler.snapshot())
    }

    /// Record a slice of source for debug info; returns the base offset to
    /// be added to node offsets of statements parsed from it.
    pub fn push_source(&mut self, source: &str) -> u32 {
        let base = self.source.len() as u32;
        self.offset_base = base;
        self.source.push_str(source);
        base
    }

    /// Number of instructions in the top-level body so far; the VM resumes
    /// incremental execution from here.
    pub fn main_len(&self) -> usize {
        self.fns[0].body.len()
    }

    /// Compile additional statements into the module, ending with a `ret` of
    /// the last statement's value. On error the module is left exactly as it
    /// was.
    pub fn compile_more(&mut self, stmts: &[&Node<'_>]) -> Result<(), CompileError> {
        if stmts.is_empty() {
            return Ok(());
        }
        let checkpoint = self.checkpoint();

        let (last, init) = stmts.split_last().expect("statement list is non-empty");
        for stmt in init {
            if self.gen(stmt, Hint::Discard).is_err() {
                self.recover();
            }
        }
        let result = self
            .gen(last, Hint::Value)
            .and_then(|cv| self.emit_ret(cv, last.offset()));
        if result.is_err() {
            self.recover();
        }

        if self.diagnostics.is_empty() {
            debug!(
                instructions = self.ops.len(),
                main = self.fns[0].body.len(),
                "compiled {} statement(s)",
                stmts.len()
            );
            Ok(())
        } else {
            self.rollback(checkpoint);
            Err(CompileError {
                diagnostics: core::mem::take(&mut self.diagnostics),
            })
        }
    }

    /// Clone the current module image.
    pub fn snapshot(&self) -> Bytecode {
        debug_assert!(
            !self
                .ops
                .iter()
                .zip(&self.data)
                .any(|(op, data)| unpatched(*op, *data)),
            "forward jump left unpatched"
        );
        Bytecode {
            code: Code {
                ops: self.ops.clone(),
                data: self.data.clone(),
            },
            extra: self.extra.clone(),
            main: self.fns[0].body.clone(),
            strings: self.strings.clone(),
            debug_info: DebugInfo {
                path: self.path.clone(),
                source: self.source.clone(),
                lines: self.lines.clone(),
            },
        }
    }

    fn emit_ret(&mut self, cv: CValue, offset: u32) -> CResult<()> {
        match cv {
            CValue::Empty => {
                self.emit(Op::RetNull, Data::NONE, offset);
            }
            cv => {
                let reg = self.materialize(cv, offset)?;
                self.emit(Op::Ret, Data::un(reg), offset);
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            ops: self.ops.len(),
            extra: self.extra.len(),
            strings: self.strings.len(),
            lines: self.lines.len(),
            main: self.fns[0].body.len(),
            module_symbols: self.scopes[0].symbols.len(),
        }
    }

    /// Reset scope and function stacks after a failed statement so the next
    /// one compiles against a clean module scope.
    fn recover(&mut self) {
        self.fns.truncate(1);
        self.scopes.truncate(1);
        self.catches.clear();
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.ops.truncate(checkpoint.ops);
        self.data.truncate(checkpoint.ops);
        self.extra.truncate(checkpoint.extra);
        self.strings.truncate(checkpoint.strings);
        self.lines.truncate(checkpoint.lines);
        self.fns.truncate(1);
        self.fns[0].body.truncate(checkpoint.main);
        self.scopes.truncate(1);
        self.scopes[0].symbols.truncate(checkpoint.module_symbols);
        let limit = checkpoint.strings as u32;
        self.string_map.retain(|_, (offset, _)| *offset < limit);
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    /// Append one instruction to the current function's body and return its
    /// result register.
    fn emit(&mut self, op: Op, data: Data, offset: u32) -> u32 {
        let inst = self.ops.len() as u32;
        if op.needs_debug_info() {
            self.lines.push((inst, self.offset_base + offset));
        }
        self.ops.push(op);
        self.data.push(data);
        let ctx = self.fns.last_mut().expect("function stack is never empty");
        ctx.body.push(inst);
        ctx.arity + (ctx.body.len() - 1) as u32
    }

    /// Emit into an arbitrary function on the stack (capture synthesis).
    fn emit_into(&mut self, fn_depth: usize, op: Op, data: Data, offset: u32) -> u32 {
        let inst = self.ops.len() as u32;
        if op.needs_debug_info() {
            self.lines.push((inst, self.offset_base + offset));
        }
        self.ops.push(op);
        self.data.push(data);
        let ctx = &mut self.fns[fn_depth];
        ctx.body.push(inst);
        ctx.arity + (ctx.body.len() - 1) as u32
    }

    /// Body position one past the last emitted instruction of the current
    /// function; the next instruction lands here.
    fn here(&self) -> usize {
        self.fns.last().expect("function stack is never empty").body.len()
    }

    /// Rewrite a forward jump at `body_pos` to target `target`.
    fn patch(&mut self, body_pos: usize, target: usize) {
        let ctx = self.fns.last().expect("function stack is never empty");
        let inst = ctx.body[body_pos] as usize;
        let delta = target as i32 - body_pos as i32;
        self.data[inst] = match self.ops[inst] {
            Op::Jump => Data::jump(delta),
            _ => Data::jump_condition(self.data[inst].as_jump_condition().0, delta),
        };
    }

    fn intern_string(&mut self, s: &str) -> (u32, u32) {
        if let Some(&slice) = self.string_map.get(s) {
            return slice;
        }
        let slice = (self.strings.len() as u32, s.len() as u32);
        self.strings.extend_from_slice(s.as_bytes());
        self.string_map.insert(EcoString::from(s), slice);
        slice
    }

    fn push_extra(&mut self, words: &[u32]) -> (u32, u32) {
        let offset = self.extra.len() as u32;
        self.extra.extend_from_slice(words);
        (offset, words.len() as u32)
    }

    fn err<T>(&mut self, offset: u32, message: impl Into<EcoString>) -> CResult<T> {
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            offset: self.offset_base + offset,
        });
        Err(Fail)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Force a compile-time value into a register.
    fn materialize(&mut self, cv: CValue, offset: u32) -> CResult<u32> {
        Ok(match cv {
            CValue::Rt(reg) | CValue::Ref(reg) => reg,
            CValue::Empty | CValue::Null => {
                self.emit(Op::Primitive, Data::primitive(Primitive::Null), offset)
            }
            CValue::Bool(true) => self.emit(Op::Primitive, Data::primitive(Primitive::True), offset),
            CValue::Bool(false) => {
                self.emit(Op::Primitive, Data::primitive(Primitive::False), offset)
            }
            CValue::Int(v) => self.emit(Op::Int, Data::int(v), offset),
            CValue::Num(v) => self.emit(Op::Num, Data::num(v), offset),
            CValue::Str(s) => {
                let (off, len) = self.intern_string(&s);
                self.emit(Op::Str, Data::str(off, len), offset)
            }
        })
    }

    /// Apply the parent's hint to a produced value.
    fn finish(&mut self, cv: CValue, hint: Hint, offset: u32) -> CResult<CValue> {
        match hint {
            Hint::Value => Ok(cv),
            Hint::Discard => {
                if let CValue::Rt(reg) = cv {
                    self.emit(Op::Discard, Data::un(reg), offset);
                }
                Ok(CValue::Empty)
            }
            Hint::Rt(dst) => {
                let src = self.materialize(cv, offset)?;
                if src != dst {
                    self.emit(Op::Move, Data::bin(dst, src), offset);
                }
                Ok(CValue::Rt(dst))
            }
            Hint::Lval(..) => self.err(offset, "cannot assign to this expression"),
        }
    }

    /// Give a `let`/`const` binding its own register. Temporaries are taken
    /// over directly; named registers and constants get a fresh register so
    /// later assignments cannot clobber the source binding.
    fn bind_register(&mut self, cv: CValue, offset: u32) -> CResult<u32> {
        match cv {
            CValue::Rt(reg) => Ok(reg),
            CValue::Ref(src) => {
                let fresh = self.emit(Op::Primitive, Data::primitive(Primitive::Null), offset);
                self.emit(Op::Move, Data::bin(fresh, src), offset);
                Ok(fresh)
            }
            cv => self.materialize(cv, offset),
        }
    }

    // ------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------

    fn declare(&mut self, name: &str, reg: u32, mutable: bool, offset: u32) -> CResult<()> {
        let fn_depth = self.fns.len() - 1;
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        if scope.symbols.iter().any(|s| s.name == name) {
            return self.err(offset, format!("redeclaration of `{name}`"));
        }
        scope.symbols.push(Symbol {
            name: name.into(),
            reg,
            mutable,
            fn_depth,
        });
        Ok(())
    }

    /// Innermost-to-outermost lookup. A hit in an enclosing function
    /// synthesizes `load_capture` chains; a hit at module level from inside a
    /// function synthesizes `load_global`.
    fn resolve(&mut self, name: &str, offset: u32) -> Option<(u32, bool, Locality)> {
        let mut hit: Option<(u32, bool, usize)> = None;
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.symbols.iter().rev().find(|s| s.name == name) {
                hit = Some((sym.reg, sym.mutable, sym.fn_depth));
                break;
            }
        }
        let (reg, mutable, fn_depth) = hit?;
        let current = self.fns.len() - 1;

        if fn_depth == current {
            return Some((reg, mutable, Locality::Local));
        }
        if fn_depth == 0 {
            // Module-level binding: read through the module frame.
            let local = self.emit(Op::LoadGlobal, Data::un(reg), offset);
            return Some((local, mutable, Locality::Outer));
        }
        // Otherwise thread the value through every intervening function's
        // capture list.
        let mut outer = reg;
        for depth in fn_depth + 1..=current {
            outer = self.capture_into(depth, name, outer, offset);
        }
        Some((outer, mutable, Locality::Outer))
    }

    fn capture_into(&mut self, fn_depth: usize, name: &str, outer_ref: u32, offset: u32) -> u32 {
        if let Some(entry) = self.fns[fn_depth].captures.iter().find(|c| c.name == name) {
            return entry.local_reg;
        }
        let index = self.fns[fn_depth].captures.len() as u32;
        let local_reg = self.emit_into(fn_depth, Op::LoadCapture, Data::un(index), offset);
        self.fns[fn_depth].captures.push(CaptureEntry {
            name: name.into(),
            outer_ref,
            local_reg,
        });
        local_reg
    }

    /// Catch regions of the current function whose protected expression is
    /// still being compiled.
    fn active_catches(&self) -> usize {
        let current = self.fns.len() - 1;
        self.catches
            .iter()
            .filter(|ctx| ctx.fn_depth == current)
            .count()
    }

    fn innermost_loop(&mut self) -> Option<&mut LoopCtx> {
        for scope in self.scopes.iter_mut().rev() {
            match &mut scope.kind {
                ScopeKind::Loop(ctx) => return Some(ctx),
                ScopeKind::Function => return None,
                ScopeKind::Block => continue,
            }
        }
        None
    }

    fn push_scope(&mut self, kind: ScopeKind) {
        self.scopes.push(Scope {
            kind,
            symbols: Vec::new(),
        });
    }

    fn pop_scope(&mut self) -> Scope {
        self.scopes.pop().expect("scope stack is never empty")
    }

    // ------------------------------------------------------------------
    // Lowering
    // ------------------------------------------------------------------

    fn gen(&mut self, node: &Node<'_>, hint: Hint) -> CResult<CValue> {
        let offset = node.offset();
        match node {
            Node::Literal { value, .. } => {
                let cv = match value {
                    Literal::Null => CValue::Null,
                    Literal::Bool(b) => CValue::Bool(*b),
                    Literal::Int(v) => CValue::Int(*v),
                    Literal::Num(v) => CValue::Num(*v),
                    Literal::Str(s) => CValue::Str(EcoString::from(*s)),
                };
                self.finish(cv, hint, offset)
            }

            Node::Identifier { name, .. } => self.gen_identifier(name, hint, offset),

            Node::Discard { .. } => match hint {
                Hint::Lval(_, src) => {
                    self.emit(Op::Discard, Data::un(src), offset);
                    Ok(CValue::Empty)
                }
                _ => self.err(offset, "`_` is not a value"),
            },

            Node::Grouped { expr, .. } => self.gen(expr, hint),

            Node::Block { stmts, .. } => self.gen_block(stmts, hint, offset),

            Node::Decl {
                mutable,
                pattern,
                value,
                ..
            } => {
                let cv = self.gen(value, Hint::Value)?;
                self.gen_binding(pattern, cv, *mutable)?;
                Ok(CValue::Empty)
            }

            Node::Assign {
                target, op, value, ..
            } => {
                let cv = self.gen(value, Hint::Value)?;
                let src = self.materialize(cv, value.offset())?;
                let kind = match op {
                    Some(op) => LvalKind::Aug(*op),
                    None => LvalKind::Assign,
                };
                match (target, kind) {
                    (Node::Tuple { items, .. }, LvalKind::Assign)
                    | (Node::List { items, .. }, LvalKind::Assign) => {
                        self.gen_destructure_assign(items, src, offset)?;
                    }
                    _ => {
                        self.gen(target, Hint::Lval(kind, src))?;
                    }
                }
                Ok(CValue::Empty)
            }

            Node::Infix { op, lhs, rhs, .. } => self.gen_infix(*op, lhs, rhs, hint, offset),

            Node::TypeInfix { op, operand, ty, .. } => {
                let Some(tag) = TypeTag::from_name(ty) else {
                    return self.err(offset, format!("unknown type name `{ty}`"));
                };
                let cv = self.gen(operand, Hint::Value)?;
                let reg = self.materialize(cv, offset)?;
                let opcode = match op {
                    TypeOp::As => Op::As,
                    TypeOp::Is => Op::Is,
                };
                let result = self.emit(opcode, Data::bin_ty(reg, tag), offset);
                self.finish(CValue::Rt(result), hint, offset)
            }

            Node::Prefix { op, operand, .. } => self.gen_prefix(*op, operand, hint, offset),

            Node::Try { expr, .. } => {
                let cv = self.gen(expr, Hint::Value)?;
                let was_ref = matches!(cv, CValue::Ref(_));
                let reg = self.materialize(cv, offset)?;
                // Not an error: hop over the propagation path.
                self.emit(Op::UnwrapErrorOrJump, Data::jump_condition(reg, PATCH), offset);
                let jump_pos = self.here() - 1;

                let in_catch = self
                    .catches
                    .last()
                    .is_some_and(|ctx| ctx.fn_depth == self.fns.len() - 1);
                if in_catch {
                    // Hand the error to the enclosing catch handler: leave
                    // the protected region, deliver, jump to the handler.
                    let catch_reg = self.catches.last().expect("checked above").catch_reg;
                    self.emit(Op::PopErrHandler, Data::NONE, offset);
                    self.emit(Op::Move, Data::bin(catch_reg, reg), offset);
                    self.emit(Op::Jump, Data::jump(PATCH), offset);
                    let hand_off = self.here() - 1;
                    self.catches
                        .last_mut()
                        .expect("checked above")
                        .jumps
                        .push(hand_off);
                } else {
                    // No handler in this function: return the error value.
                    self.emit(Op::Ret, Data::un(reg), offset);
                }

                let after = self.here();
                self.patch(jump_pos, after);
                let cv = if was_ref { CValue::Ref(reg) } else { CValue::Rt(reg) };
                self.finish(cv, hint, offset)
            }

            Node::Throw { expr, .. } => {
                let cv = self.gen(expr, Hint::Value)?;
                let reg = self.materialize(cv, offset)?;
                self.emit(Op::Throw, Data::un(reg), offset);
                Ok(CValue::Empty)
            }

            Node::If {
                cond,
                then_body,
                else_body,
                ..
            } => self.gen_if(cond, then_body, *else_body, hint, offset),

            Node::While { cond, body, .. } => self.gen_while(cond, body, hint, offset),

            Node::For {
                pattern,
                iterable,
                body,
                ..
            } => self.gen_for(pattern, iterable, body, hint, offset),

            Node::Match { subject, cases, .. } => self.gen_match(subject, cases, hint, offset),

            Node::Tuple { items, .. } | Node::List { items, .. } => {
                let build = if matches!(node, Node::Tuple { .. }) {
                    Op::BuildTuple
                } else {
                    Op::BuildList
                };
                if let Hint::Lval(kind, src) = hint {
                    return match kind {
                        LvalKind::Let { mutable } => {
                            self.gen_destructure(items, src, mutable, offset)?;
                            Ok(CValue::Empty)
                        }
                        LvalKind::Assign => {
                            self.gen_destructure_assign(items, src, offset)?;
                            Ok(CValue::Empty)
                        }
                        LvalKind::Aug(_) => {
                            self.err(offset, "augmented assignment needs a single target")
                        }
                    };
                }
                let mut regs: SmallVec<[u32; 8]> = SmallVec::new();
                for item in *items {
                    let cv = self.gen(item, Hint::Value)?;
                    regs.push(self.materialize(cv, item.offset())?);
                }
                let (off, len) = self.push_extra(&regs);
                let result = self.emit(build, Data::extra(off, len), offset);
                self.finish(CValue::Rt(result), hint, offset)
            }

            Node::Map { entries, .. } => {
                let mut regs: SmallVec<[u32; 16]> = SmallVec::new();
                for (key, value) in *entries {
                    let kv = self.gen(key, Hint::Value)?;
                    regs.push(self.materialize(kv, key.offset())?);
                    let vv = self.gen(value, Hint::Value)?;
                    regs.push(self.materialize(vv, value.offset())?);
                }
                let (off, len) = self.push_extra(&regs);
                let result = self.emit(Op::BuildMap, Data::extra(off, len), offset);
                self.finish(CValue::Rt(result), hint, offset)
            }

            Node::Fn { params, body, .. } => self.gen_fn(params, body, hint, offset),

            Node::Suffix { op, operand, .. } => self.gen_suffix(op, operand, hint, offset),

            Node::ErrorValue { value, .. } => {
                let result = match value {
                    Some(value) => {
                        let cv = self.gen(value, Hint::Value)?;
                        let reg = self.materialize(cv, offset)?;
                        self.emit(Op::BuildError, Data::un(reg), offset)
                    }
                    None => self.emit(Op::BuildErrorNull, Data::NONE, offset),
                };
                self.finish(CValue::Rt(result), hint, offset)
            }

            Node::Tagged { name, value, .. } => {
                let (soff, slen) = self.intern_string(name);
                let result = match value {
                    Some(value) => {
                        let cv = self.gen(value, Hint::Value)?;
                        let reg = self.materialize(cv, offset)?;
                        let (off, len) = self.push_extra(&[soff, slen, reg]);
                        self.emit(Op::BuildTagged, Data::extra(off, len), offset)
                    }
                    None => self.emit(Op::BuildTaggedNull, Data::str(soff, slen), offset),
                };
                self.finish(CValue::Rt(result), hint, offset)
            }

            Node::Jump { kind, .. } => self.gen_jump(kind, offset),

            Node::Catch {
                expr,
                binding,
                handler,
                ..
            } => self.gen_catch(expr, *binding, handler, hint, offset),

            Node::Import { path, .. } | Node::Native { name: path, .. } => {
                // Natives resolve through the same host registry the import
                // op consults first.
                let (soff, slen) = self.intern_string(path);
                let result = self.emit(Op::Import, Data::str(soff, slen), offset);
                self.finish(CValue::Rt(result), hint, offset)
            }
        }
    }

    fn gen_identifier(&mut self, name: &str, hint: Hint, offset: u32) -> CResult<CValue> {
        if name == "this" {
            if matches!(hint, Hint::Lval(..)) {
                return self.err(offset, "cannot assign to `this`");
            }
            let reg = self.emit(Op::LoadThis, Data::NONE, offset);
            return self.finish(CValue::Rt(reg), hint, offset);
        }

        if let Hint::Lval(LvalKind::Let { mutable }, src) = hint {
            let reg = self.bind_register(CValue::Rt(src), offset)?;
            self.declare(name, reg, mutable, offset)?;
            return Ok(CValue::Empty);
        }

        let Some((reg, mutable, locality)) = self.resolve(name, offset) else {
            return self.err(offset, format!("undefined variable `{name}`"));
        };

        match hint {
            Hint::Lval(LvalKind::Let { .. }, _) => unreachable!("handled above"),
            Hint::Lval(kind, src) => {
                if matches!(locality, Locality::Outer) {
                    return self.err(
                        offset,
                        format!("cannot assign to `{name}` outside the current function"),
                    );
                }
                if !mutable {
                    return self.err(offset, format!("cannot assign to constant `{name}`"));
                }
                match kind {
                    LvalKind::Assign => {
                        self.emit(Op::Move, Data::bin(reg, src), offset);
                    }
                    LvalKind::Aug(op) => {
                        let Some(opcode) = arith_opcode(op) else {
                            return self.err(offset, "invalid augmented assignment operator");
                        };
                        let result = self.emit(opcode, Data::bin(reg, src), offset);
                        self.emit(Op::Move, Data::bin(reg, result), offset);
                    }
                    LvalKind::Let { .. } => unreachable!(),
                }
                Ok(CValue::Empty)
            }
            _ => self.finish(CValue::Ref(reg), hint, offset),
        }
    }

    fn gen_block(&mut self, stmts: &[&Node<'_>], hint: Hint, offset: u32) -> CResult<CValue> {
        if matches!(hint, Hint::Lval(..)) {
            return self.err(offset, "cannot assign to a block");
        }
        self.push_scope(ScopeKind::Block);
        let result = (|| {
            let Some((last, init)) = stmts.split_last() else {
                return Ok(CValue::Empty);
            };
            for stmt in init {
                self.gen(stmt, Hint::Discard)?;
            }
            self.gen(last, Hint::Value)
        })();
        self.pop_scope();
        let cv = result?;
        self.finish(cv, hint, offset)
    }

    fn gen_binding(&mut self, pattern: &Node<'_>, cv: CValue, mutable: bool) -> CResult<()> {
        let offset = pattern.offset();
        match pattern {
            Node::Identifier { name, .. } => {
                let reg = self.bind_register(cv, offset)?;
                self.declare(name, reg, mutable, offset)
            }
            Node::Discard { .. } => {
                if let CValue::Rt(reg) = cv {
                    self.emit(Op::Discard, Data::un(reg), offset);
                }
                Ok(())
            }
            Node::Tuple { items, .. } | Node::List { items, .. } => {
                let reg = self.materialize(cv, offset)?;
                self.gen_destructure(items, reg, mutable, offset)
            }
            Node::ErrorValue { value: Some(inner), .. } => {
                let reg = self.materialize(cv, offset)?;
                let payload = self.emit(Op::UnwrapError, Data::un(reg), offset);
                self.gen_binding(inner, CValue::Rt(payload), mutable)
            }
            Node::Tagged { name, value, .. } => {
                let reg = self.materialize(cv, offset)?;
                let (soff, slen) = self.intern_string(name);
                let (off, len) = self.push_extra(&[soff, slen, reg]);
                let payload = self.emit(Op::UnwrapTagged, Data::extra(off, len), offset);
                match value {
                    Some(inner) => self.gen_binding(inner, CValue::Rt(payload), mutable),
                    None => Ok(()),
                }
            }
            _ => self.err(offset, "invalid binding pattern"),
        }
    }

    /// `let (a, _, b) = rhs`: length is asserted, then each slot is fetched;
    /// `_` slots are fetched and discarded so the error-discard rule applies.
    fn gen_destructure(
        &mut self,
        items: &[&Node<'_>],
        src: u32,
        mutable: bool,
        offset: u32,
    ) -> CResult<()> {
        self.emit(Op::AssertLen, Data::bin(src, items.len() as u32), offset);
        for (i, item) in items.iter().enumerate() {
            let index = self.emit(Op::Int, Data::int(i as i64), item.offset());
            let element = self.emit(Op::Get, Data::bin(src, index), item.offset());
            self.gen_binding(item, CValue::Rt(element), mutable)?;
        }
        Ok(())
    }

    /// `(a, b) = rhs`: like destructuring, but each slot is an assignment
    /// target instead of a new binding.
    fn gen_destructure_assign(&mut self, items: &[&Node<'_>], src: u32, offset: u32) -> CResult<()> {
        self.emit(Op::AssertLen, Data::bin(src, items.len() as u32), offset);
        for (i, item) in items.iter().enumerate() {
            let index = self.emit(Op::Int, Data::int(i as i64), item.offset());
            let element = self.emit(Op::Get, Data::bin(src, index), item.offset());
            self.gen(item, Hint::Lval(LvalKind::Assign, element))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn gen_infix(
        &mut self,
        op: BinOp,
        lhs: &Node<'_>,
        rhs: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        match op {
            BinOp::And | BinOp::Or => return self.gen_short_circuit(op, lhs, rhs, hint, offset),
            BinOp::Range => return self.gen_range(lhs, rhs, hint, offset),
            _ => {}
        }

        let lcv = self.gen(lhs, Hint::Value)?;
        let rcv = self.gen(rhs, Hint::Value)?;

        if lcv.is_const() && rcv.is_const() {
            if let Some(folded) = self.fold_binary(op, &lcv, &rcv, offset)? {
                return self.finish(folded, hint, offset);
            }
        }

        let lreg = self.materialize(lcv, lhs.offset())?;
        let rreg = self.materialize(rcv, rhs.offset())?;
        let opcode = match op {
            BinOp::Equal => Op::Equal,
            BinOp::NotEqual => Op::NotEqual,
            BinOp::Less => Op::LessThan,
            BinOp::LessEq => Op::LessThanEqual,
            BinOp::Greater => Op::GreaterThan,
            BinOp::GreaterEq => Op::GreaterThanEqual,
            BinOp::In => Op::In,
            other => match arith_opcode(other) {
                Some(opcode) => opcode,
                None => unreachable!("handled above"),
            },
        };
        let result = self.emit(opcode, Data::bin(lreg, rreg), offset);
        self.finish(CValue::Rt(result), hint, offset)
    }

    /// Compile-time evaluation with exactly the VM's semantics; operations
    /// that would trap stay unfolded so they raise catchably at run time.
    fn fold_binary(
        &mut self,
        op: BinOp,
        lhs: &CValue,
        rhs: &CValue,
        offset: u32,
    ) -> CResult<Option<CValue>> {
        // Arithmetic and bitwise ops over numeric constants. An operation
        // that would trap (overflow, division by zero) is left to run time,
        // where it raises catchably.
        if let Some(opcode) = arith_opcode(op) {
            let (Some(a), Some(b)) = (lhs.as_arith(), rhs.as_arith()) else {
                return Ok(None);
            };
            return match arith_binary(opcode, a, b) {
                Ok(Arith::Int(v)) => Ok(Some(CValue::Int(v))),
                Ok(Arith::Num(v)) => Ok(Some(CValue::Num(v))),
                Err(_) => Ok(None),
            };
        }

        let ordering = match (lhs.as_arith(), rhs.as_arith()) {
            (Some(a), Some(b)) => number_cmp(a, b),
            _ => match (lhs, rhs) {
                (CValue::Str(a), CValue::Str(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
                (CValue::Bool(a), CValue::Bool(b)) => match op {
                    BinOp::Equal => return Ok(Some(CValue::Bool(a == b))),
                    BinOp::NotEqual => return Ok(Some(CValue::Bool(a != b))),
                    _ => return self.err(offset, "cannot order booleans"),
                },
                (CValue::Null, CValue::Null) => match op {
                    BinOp::Equal => return Ok(Some(CValue::Bool(true))),
                    BinOp::NotEqual => return Ok(Some(CValue::Bool(false))),
                    _ => return self.err(offset, "cannot order null"),
                },
                _ => match op {
                    // Mixed constant kinds: structurally unequal.
                    BinOp::Equal => return Ok(Some(CValue::Bool(false))),
                    BinOp::NotEqual => return Ok(Some(CValue::Bool(true))),
                    BinOp::In => return Ok(None),
                    _ => return self.err(offset, "cannot compare values of different kinds"),
                },
            },
        };

        use core::cmp::Ordering::*;
        Ok(match op {
            BinOp::Equal => Some(CValue::Bool(ordering == Some(Equal))),
            BinOp::NotEqual => Some(CValue::Bool(ordering != Some(Equal))),
            BinOp::Less => Some(CValue::Bool(ordering == Some(Less))),
            BinOp::LessEq => Some(CValue::Bool(matches!(ordering, Some(Less | Equal)))),
            BinOp::Greater => Some(CValue::Bool(ordering == Some(Greater))),
            BinOp::GreaterEq => Some(CValue::Bool(matches!(ordering, Some(Greater | Equal)))),
            BinOp::In => None,
            _ => unreachable!("handled above"),
        })
    }

    /// `and`/`or`: a constant left side decides at compile time and drops the
    /// right operand entirely; otherwise the right side is guarded by a
    /// conditional jump.
    fn gen_short_circuit(
        &mut self,
        op: BinOp,
        lhs: &Node<'_>,
        rhs: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let lcv = self.gen(lhs, Hint::Value)?;
        if let CValue::Bool(value) = lcv {
            let decides = match op {
                BinOp::And => !value,
                _ => value,
            };
            if decides {
                return self.finish(CValue::Bool(value), hint, offset);
            }
            return self.gen(rhs, hint);
        }
        if lcv.is_const() {
            return self.err(lhs.offset(), "expected a bool");
        }

        let lreg = self.materialize(lcv, lhs.offset())?;
        let merge = self.emit(Op::CopyUn, Data::un(lreg), offset);
        let jump_op = match op {
            BinOp::And => Op::JumpIfFalse,
            _ => Op::JumpIfTrue,
        };
        self.emit(jump_op, Data::jump_condition(lreg, PATCH), offset);
        let jump_pos = self.here() - 1;
        self.gen(rhs, Hint::Rt(merge))?;
        let end = self.here();
        self.patch(jump_pos, end);
        self.finish(CValue::Rt(merge), hint, offset)
    }

    fn gen_range(
        &mut self,
        lhs: &Node<'_>,
        rhs: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        // A nested range in the left operand is the step form `a:b:c`.
        if let Node::Infix {
            op: BinOp::Range,
            lhs: start,
            rhs: end,
            ..
        } = lhs
        {
            let scv = self.gen(start, Hint::Value)?;
            let sreg = self.materialize(scv, start.offset())?;
            let ecv = self.gen(end, Hint::Value)?;
            let ereg = self.materialize(ecv, end.offset())?;
            let tcv = self.gen(rhs, Hint::Value)?;
            let treg = self.materialize(tcv, rhs.offset())?;
            let (off, _) = self.push_extra(&[ereg, treg]);
            let result = self.emit(Op::BuildRangeStep, Data::range(sreg, off), offset);
            return self.finish(CValue::Rt(result), hint, offset);
        }

        let scv = self.gen(lhs, Hint::Value)?;
        let sreg = self.materialize(scv, lhs.offset())?;
        let ecv = self.gen(rhs, Hint::Value)?;
        let ereg = self.materialize(ecv, rhs.offset())?;
        let result = self.emit(Op::BuildRange, Data::bin(sreg, ereg), offset);
        self.finish(CValue::Rt(result), hint, offset)
    }

    fn gen_prefix(
        &mut self,
        op: UnOp,
        operand: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let cv = self.gen(operand, Hint::Value)?;

        // Constant folding with the VM's semantics; a fold that would trap
        // is left to run time.
        match (op, &cv) {
            (UnOp::Neg, _) if cv.as_arith().is_some() => {
                match arith_negate(cv.as_arith().expect("checked numeric")) {
                    Ok(Arith::Int(v)) => return self.finish(CValue::Int(v), hint, offset),
                    Ok(Arith::Num(v)) => return self.finish(CValue::Num(v), hint, offset),
                    Err(_) => {
                        let reg = self.materialize(cv, operand.offset())?;
                        let result = self.emit(Op::Negate, Data::un(reg), offset);
                        return self.finish(CValue::Rt(result), hint, offset);
                    }
                }
            }
            (UnOp::BoolNot, CValue::Bool(b)) => {
                let b = !*b;
                return self.finish(CValue::Bool(b), hint, offset);
            }
            (UnOp::BitNot, CValue::Int(v)) => {
                let v = !*v;
                return self.finish(CValue::Int(v), hint, offset);
            }
            _ => {}
        }
        if cv.is_const() {
            return self.err(offset, "invalid operand type for unary operator");
        }

        let reg = self.materialize(cv, operand.offset())?;
        let opcode = match op {
            UnOp::Neg => Op::Negate,
            UnOp::BoolNot => Op::BoolNot,
            UnOp::BitNot => Op::BitNot,
        };
        let result = self.emit(opcode, Data::un(reg), offset);
        self.finish(CValue::Rt(result), hint, offset)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    fn gen_if(
        &mut self,
        cond: &Node<'_>,
        then_body: &Node<'_>,
        else_body: Option<&Node<'_>>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let ccv = self.gen(cond, Hint::Value)?;

        // A constant condition drops the untaken branch entirely.
        if let CValue::Bool(value) = ccv {
            return if value {
                self.gen(then_body, hint)
            } else {
                match else_body {
                    Some(else_body) => self.gen(else_body, hint),
                    None => self.finish(CValue::Null, hint, offset),
                }
            };
        }
        if ccv.is_const() {
            return self.err(cond.offset(), "expected a bool");
        }

        let creg = self.materialize(ccv, cond.offset())?;

        if matches!(hint, Hint::Discard) {
            self.emit(Op::JumpIfFalse, Data::jump_condition(creg, PATCH), offset);
            let to_else = self.here() - 1;
            self.gen(then_body, Hint::Discard)?;
            match else_body {
                Some(else_body) => {
                    self.emit(Op::Jump, Data::jump(PATCH), offset);
                    let to_end = self.here() - 1;
                    self.patch(to_else, self.here());
                    self.gen(else_body, Hint::Discard)?;
                    self.patch(to_end, self.here());
                }
                None => self.patch(to_else, self.here()),
            }
            return Ok(CValue::Empty);
        }

        let merge = self.emit(Op::Primitive, Data::primitive(Primitive::Null), offset);
        self.emit(Op::JumpIfFalse, Data::jump_condition(creg, PATCH), offset);
        let to_else = self.here() - 1;

        self.gen(then_body, Hint::Rt(merge))?;

        match else_body {
            Some(else_body) => {
                self.emit(Op::Jump, Data::jump(PATCH), offset);
                let to_end = self.here() - 1;
                self.patch(to_else, self.here());
                self.gen(else_body, Hint::Rt(merge))?;
                self.patch(to_end, self.here());
            }
            None => self.patch(to_else, self.here()),
        }
        self.finish(CValue::Rt(merge), hint, offset)
    }

    fn gen_while(
        &mut self,
        cond: &Node<'_>,
        body: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let cond_begin = self.here();
        let ccv = self.gen(cond, Hint::Value)?;
        let check = match ccv {
            // A constant condition folds: `while (false)` vanishes and
            // `while (true)` loops without a per-iteration check.
            CValue::Bool(false) => return self.finish(CValue::Null, hint, offset),
            CValue::Bool(true) => None,
            cv if cv.is_const() => return self.err(cond.offset(), "expected a bool"),
            cv => {
                let creg = self.materialize(cv, cond.offset())?;
                self.emit(Op::JumpIfFalse, Data::jump_condition(creg, PATCH), offset);
                Some(self.here() - 1)
            }
        };

        self.push_scope(ScopeKind::Loop(LoopCtx {
            cond_begin,
            breaks: Vec::new(),
            catch_base: self.active_catches(),
        }));
        let result = (|| {
            self.gen(body, Hint::Discard)?;
            let back = cond_begin as i32 - self.here() as i32;
            self.emit(Op::Jump, Data::jump(back), offset);
            Ok(())
        })();
        let scope = self.pop_scope();
        result?;

        if let Some(check) = check {
            self.patch(check, self.here());
        }
        if let ScopeKind::Loop(ctx) = scope.kind {
            let end = self.here();
            for pos in ctx.breaks {
                self.patch(pos, end);
            }
        }
        self.finish(CValue::Null, hint, offset)
    }

    fn gen_for(
        &mut self,
        pattern: &Node<'_>,
        iterable: &Node<'_>,
        body: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let icv = self.gen(iterable, Hint::Value)?;
        let ireg = self.materialize(icv, iterable.offset())?;
        let iter = self.emit(Op::IterInit, Data::un(ireg), offset);

        let cond_begin = self.here();
        self.push_scope(ScopeKind::Loop(LoopCtx {
            cond_begin,
            breaks: Vec::new(),
            catch_base: self.active_catches(),
        }));

        let result = (|| {
            let element = self.emit(Op::IterNext, Data::jump_condition(iter, PATCH), offset);
            let next_pos = self.here() - 1;

            self.push_scope(ScopeKind::Block);
            let body_result = self
                .gen_binding(pattern, CValue::Rt(element), true)
                .and_then(|()| self.gen(body, Hint::Discard));
            self.pop_scope();
            body_result?;

            let back = cond_begin as i32 - self.here() as i32;
            self.emit(Op::Jump, Data::jump(back), offset);
            self.patch(next_pos, self.here());
            Ok(())
        })();

        let scope = self.pop_scope();
        result?;
        if let ScopeKind::Loop(ctx) = scope.kind {
            let end = self.here();
            for pos in ctx.breaks {
                self.patch(pos, end);
            }
        }
        self.finish(CValue::Null, hint, offset)
    }

    fn gen_jump(&mut self, kind: &JumpKind<'_>, offset: u32) -> CResult<CValue> {
        match kind {
            JumpKind::Break => {
                let Some(catch_base) = self.innermost_loop().map(|ctx| ctx.catch_base) else {
                    return self.err(offset, "`break` outside of a loop");
                };
                self.pop_handlers_to(catch_base, offset);
                self.emit(Op::Jump, Data::jump(PATCH), offset);
                let pos = self.here() - 1;
                self.innermost_loop()
                    .expect("checked above")
                    .breaks
                    .push(pos);
                Ok(CValue::Empty)
            }
            JumpKind::Continue => {
                let Some((target, catch_base)) = self
                    .innermost_loop()
                    .map(|ctx| (ctx.cond_begin, ctx.catch_base))
                else {
                    return self.err(offset, "`continue` outside of a loop");
                };
                self.pop_handlers_to(catch_base, offset);
                let back = target as i32 - self.here() as i32;
                self.emit(Op::Jump, Data::jump(back), offset);
                Ok(CValue::Empty)
            }
            JumpKind::Return(value) => {
                match value {
                    Some(value) => {
                        let cv = self.gen(value, Hint::Value)?;
                        let reg = self.materialize(cv, offset)?;
                        self.pop_handlers_to(0, offset);
                        self.emit(Op::Ret, Data::un(reg), offset);
                    }
                    None => {
                        self.pop_handlers_to(0, offset);
                        self.emit(Op::RetNull, Data::NONE, offset);
                    }
                }
                Ok(CValue::Empty)
            }
        }
    }

    /// Leave catch regions abnormally: pop one handler per region entered
    /// past `base`, keeping the frame's handler stack balanced.
    fn pop_handlers_to(&mut self, base: usize, offset: u32) {
        for _ in base..self.active_catches() {
            self.emit(Op::PopErrHandler, Data::NONE, offset);
        }
    }

    fn gen_catch(
        &mut self,
        expr: &Node<'_>,
        binding: Option<&Node<'_>>,
        handler: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let merge = self.emit(Op::Primitive, Data::primitive(Primitive::Null), offset);
        let catch_reg = self.emit(Op::Primitive, Data::primitive(Primitive::Null), offset);
        self.emit(
            Op::PushErrHandler,
            Data::jump_condition(catch_reg, PATCH),
            offset,
        );
        let handler_jump = self.here() - 1;

        self.catches.push(CatchCtx {
            fn_depth: self.fns.len() - 1,
            catch_reg,
            jumps: Vec::new(),
        });
        let protected = self.gen(expr, Hint::Value);
        let ctx = self.catches.pop().expect("pushed above");
        let xreg = self.materialize(protected?, expr.offset())?;

        self.emit(Op::PopErrHandler, Data::NONE, offset);
        self.emit(Op::Move, Data::bin(merge, xreg), offset);
        // The protected expression may also have *evaluated to* an error
        // value without raising; route it into the handler as well.
        self.emit(Op::UnwrapErrorOrJump, Data::jump_condition(xreg, PATCH), offset);
        let to_end = self.here() - 1;
        self.emit(Op::Move, Data::bin(catch_reg, xreg), offset);

        let handler_pos = self.here();
        self.patch(handler_jump, handler_pos);
        for jump in ctx.jumps {
            self.patch(jump, handler_pos);
        }
        self.push_scope(ScopeKind::Block);
        let handler_result = (|| {
            if let Some(Node::Identifier { name, offset, .. }) = binding {
                self.declare(name, catch_reg, false, *offset)?;
            }
            self.gen(handler, Hint::Rt(merge))?;
            Ok(())
        })();
        self.pop_scope();
        handler_result?;

        self.patch(to_end, self.here());
        self.finish(CValue::Rt(merge), hint, offset)
    }

    // ------------------------------------------------------------------
    // Functions and calls
    // ------------------------------------------------------------------

    fn gen_fn(
        &mut self,
        params: &[&Node<'_>],
        body: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let arity = params.len() as u32;
        self.fns.push(FnCtx {
            body: Vec::new(),
            arity,
            captures: Vec::new(),
        });
        self.push_scope(ScopeKind::Function);

        let body_result = (|| {
            for (i, param) in params.iter().enumerate() {
                match param {
                    Node::Identifier { name, offset, .. } => {
                        self.declare(name, i as u32, true, *offset)?;
                    }
                    // `_` parameters accept and ignore their argument.
                    Node::Discard { .. } => {}
                    _ => return self.err(param.offset(), "invalid parameter"),
                }
            }
            let cv = self.gen(body, Hint::Value)?;
            self.emit_ret(cv, body.offset())
        })();

        self.pop_scope();
        let ctx = self.fns.pop().expect("pushed above");
        body_result?;

        let result = if ctx.captures.is_empty() {
            let mut words = Vec::with_capacity(1 + ctx.body.len());
            words.push(arity);
            words.extend_from_slice(&ctx.body);
            let (off, len) = self.push_extra(&words);
            self.emit(Op::BuildFunc, Data::extra(off, len), offset)
        } else {
            let mut words = Vec::with_capacity(2 + ctx.captures.len() + ctx.body.len());
            words.push(arity);
            words.push(ctx.captures.len() as u32);
            words.extend(ctx.captures.iter().map(|c| c.outer_ref));
            words.extend_from_slice(&ctx.body);
            let (off, len) = self.push_extra(&words);
            self.emit(Op::BuildFuncCapture, Data::extra(off, len), offset)
        };
        self.finish(CValue::Rt(result), hint, offset)
    }

    fn gen_suffix(
        &mut self,
        op: &SuffixOp<'_>,
        operand: &Node<'_>,
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        match op {
            SuffixOp::Call(args) => self.gen_call(operand, args, hint, offset),
            SuffixOp::Index(index) => {
                let ccv = self.gen(operand, Hint::Value)?;
                let creg = self.materialize(ccv, operand.offset())?;
                let icv = self.gen(index, Hint::Value)?;
                let ireg = self.materialize(icv, index.offset())?;
                self.gen_subscript(creg, ireg, hint, offset)
            }
            SuffixOp::Member(name) => {
                let ccv = self.gen(operand, Hint::Value)?;
                let creg = self.materialize(ccv, operand.offset())?;
                let (soff, slen) = self.intern_string(name);
                let key = self.emit(Op::Str, Data::str(soff, slen), offset);
                self.gen_subscript(creg, key, hint, offset)
            }
        }
    }

    /// Shared tail of index and member access: a read (`get`) or a store
    /// (`set`, for lvalue hints).
    fn gen_subscript(&mut self, container: u32, index: u32, hint: Hint, offset: u32) -> CResult<CValue> {
        match hint {
            Hint::Lval(LvalKind::Let { .. }, _) => {
                self.err(offset, "cannot declare into a subscript")
            }
            Hint::Lval(LvalKind::Assign, src) => {
                let (off, _) = self.push_extra(&[index, src]);
                self.emit(Op::Set, Data::range(container, off), offset);
                Ok(CValue::Empty)
            }
            Hint::Lval(LvalKind::Aug(op), src) => {
                let Some(opcode) = arith_opcode(op) else {
                    return self.err(offset, "invalid augmented assignment operator");
                };
                let current = self.emit(Op::Get, Data::bin(container, index), offset);
                let result = self.emit(opcode, Data::bin(current, src), offset);
                let (off, _) = self.push_extra(&[index, result]);
                self.emit(Op::Set, Data::range(container, off), offset);
                Ok(CValue::Empty)
            }
            _ => {
                let result = self.emit(Op::Get, Data::bin(container, index), offset);
                self.finish(CValue::Rt(result), hint, offset)
            }
        }
    }

    fn gen_call(
        &mut self,
        callee: &Node<'_>,
        args: &[&Node<'_>],
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        // Method-call sugar: `recv.name(args)`.
        if let Node::Suffix {
            op: SuffixOp::Member(name),
            operand: recv,
            ..
        } = callee
        {
            let rcv = self.gen(recv, Hint::Value)?;
            let rreg = self.materialize(rcv, recv.offset())?;

            // `list.append(x)` is the in-place mutation opcode.
            if *name == "append" && args.len() == 1 {
                let acv = self.gen(args[0], Hint::Value)?;
                let areg = self.materialize(acv, args[0].offset())?;
                self.emit(Op::Append, Data::bin(rreg, areg), offset);
                return self.finish(CValue::Null, hint, offset);
            }

            let (soff, slen) = self.intern_string(name);
            let key = self.emit(Op::Str, Data::str(soff, slen), offset);
            let func = self.emit(Op::Get, Data::bin(rreg, key), offset);
            let result = if args.is_empty() {
                self.emit(Op::ThisCallZero, Data::bin(func, rreg), offset)
            } else {
                let mut words: SmallVec<[u32; 8]> = SmallVec::new();
                words.push(func);
                words.push(rreg);
                for arg in args {
                    let acv = self.gen(arg, Hint::Value)?;
                    words.push(self.materialize(acv, arg.offset())?);
                }
                let (off, len) = self.push_extra(&words);
                self.emit(Op::ThisCall, Data::extra(off, len), offset)
            };
            return self.finish(CValue::Rt(result), hint, offset);
        }

        let fcv = self.gen(callee, Hint::Value)?;
        let freg = self.materialize(fcv, callee.offset())?;
        let result = match args {
            [] => self.emit(Op::CallZero, Data::un(freg), offset),
            [arg] => {
                let acv = self.gen(arg, Hint::Value)?;
                let areg = self.materialize(acv, arg.offset())?;
                self.emit(Op::CallOne, Data::bin(freg, areg), offset)
            }
            args => {
                let mut words: SmallVec<[u32; 8]> = SmallVec::new();
                words.push(freg);
                for arg in args {
                    let acv = self.gen(arg, Hint::Value)?;
                    words.push(self.materialize(acv, arg.offset())?);
                }
                let (off, len) = self.push_extra(&words);
                self.emit(Op::Call, Data::extra(off, len), offset)
            }
        };
        self.finish(CValue::Rt(result), hint, offset)
    }

    // ------------------------------------------------------------------
    // Match
    // ------------------------------------------------------------------

    fn gen_match(
        &mut self,
        subject: &Node<'_>,
        cases: &[MatchCase<'_>],
        hint: Hint,
        offset: u32,
    ) -> CResult<CValue> {
        let scv = self.gen(subject, Hint::Value)?;
        let sreg = self.materialize(scv, subject.offset())?;
        let merge = self.emit(Op::Primitive, Data::primitive(Primitive::Null), offset);
        let mut end_jumps = Vec::with_capacity(cases.len());

        for case in cases {
            let mut fail_jumps = Vec::new();
            self.push_scope(ScopeKind::Block);
            let case_result = (|| {
                self.gen_match_pattern(case.pattern, sreg, &mut fail_jumps)?;
                self.gen(case.body, Hint::Rt(merge))?;
                Ok(())
            })();
            self.pop_scope();
            case_result?;

            self.emit(Op::Jump, Data::jump(PATCH), case.offset);
            end_jumps.push(self.here() - 1);
            let next_case = self.here();
            for pos in fail_jumps {
                self.patch(pos, next_case);
            }
        }

        // No case matched: the merge register still holds null.
        let end = self.here();
        for pos in end_jumps {
            self.patch(pos, end);
        }
        self.finish(CValue::Rt(merge), hint, offset)
    }

    /// Test-style pattern: on mismatch, jump to the next case (offsets are
    /// collected in `fail_jumps`); on match, bind names.
    fn gen_match_pattern(
        &mut self,
        pattern: &Node<'_>,
        subject: u32,
        fail_jumps: &mut Vec<usize>,
    ) -> CResult<()> {
        let offset = pattern.offset();
        match pattern {
            Node::Discard { .. } => Ok(()),
            Node::Identifier { name, .. } => self.declare(name, subject, false, offset),
            Node::Literal { value, .. } => {
                let cv = match value {
                    Literal::Null => CValue::Null,
                    Literal::Bool(b) => CValue::Bool(*b),
                    Literal::Int(v) => CValue::Int(*v),
                    Literal::Num(v) => CValue::Num(*v),
                    Literal::Str(s) => CValue::Str(EcoString::from(*s)),
                };
                let lreg = self.materialize(cv, offset)?;
                let test = self.emit(Op::Equal, Data::bin(subject, lreg), offset);
                self.emit(Op::JumpIfFalse, Data::jump_condition(test, PATCH), offset);
                fail_jumps.push(self.here() - 1);
                Ok(())
            }
            Node::Tuple { items, .. } | Node::List { items, .. } => {
                // Work on a duplicate: a failing check_len overwrites its
                // operand with null, and later cases still need the subject.
                let dup = self.emit(Op::CopyUn, Data::un(subject), offset);
                self.emit(Op::CheckLen, Data::bin(dup, items.len() as u32), offset);
                self.emit(Op::JumpIfNull, Data::jump_condition(dup, PATCH), offset);
                fail_jumps.push(self.here() - 1);
                for (i, item) in items.iter().enumerate() {
                    let index = self.emit(Op::Int, Data::int(i as i64), item.offset());
                    let element = self.emit(Op::Get, Data::bin(dup, index), item.offset());
                    self.gen_match_pattern(item, element, fail_jumps)?;
                }
                Ok(())
            }
            Node::ErrorValue { value: Some(inner), .. } => {
                let test = self.emit(Op::Is, Data::bin_ty(subject, TypeTag::Error), offset);
                self.emit(Op::JumpIfFalse, Data::jump_condition(test, PATCH), offset);
                fail_jumps.push(self.here() - 1);
                let payload = self.emit(Op::UnwrapError, Data::un(subject), offset);
                self.gen_match_pattern(inner, payload, fail_jumps)
            }
            Node::Tagged { name, value, .. } => {
                let (soff, slen) = self.intern_string(name);
                match value {
                    Some(inner) => {
                        let (off, len) = self.push_extra(&[soff, slen, subject]);
                        let payload =
                            self.emit(Op::UnwrapTaggedOrNull, Data::extra(off, len), offset);
                        self.emit(Op::JumpIfNull, Data::jump_condition(payload, PATCH), offset);
                        fail_jumps.push(self.here() - 1);
                        self.gen_match_pattern(inner, payload, fail_jumps)
                    }
                    None => {
                        // Payload-less tags compare structurally; the
                        // unwrap's null result would be ambiguous here.
                        let probe = self.emit(Op::BuildTaggedNull, Data::str(soff, slen), offset);
                        let test = self.emit(Op::Equal, Data::bin(subject, probe), offset);
                        self.emit(Op::JumpIfFalse, Data::jump_condition(test, PATCH), offset);
                        fail_jumps.push(self.here() - 1);
                        Ok(())
                    }
                }
            }
            _ => self.err(offset, "invalid match pattern"),
        }
    }
}

/// Arithmetic/bitwise opcode for an AST operator, when it is one.
fn arith_opcode(op: BinOp) -> Option<Op> {
    Some(match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::DivFloor => Op::DivFloor,
        BinOp::Rem => Op::Rem,
        BinOp::Pow => Op::Pow,
        BinOp::LShift => Op::LShift,
        BinOp::RShift => Op::RShift,
        BinOp::BitAnd => Op::BitAnd,
        BinOp::BitOr => Op::BitOr,
        BinOp::BitXor => Op::BitXor,
        _ => return None,
    })
}

fn unpatched(op: Op, data: Data) -> bool {
    match op {
        Op::Jump => data.as_jump() == PATCH,
        Op::JumpIfTrue
        | Op::JumpIfFalse
        | Op::JumpIfNull
        | Op::UnwrapErrorOrJump
        | Op::PushErrHandler
        | Op::IterNext => data.as_jump_condition().1 == PATCH,
        _ => false,
    }
}
