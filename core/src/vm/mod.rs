//! The virtual machine: instruction dispatch, call frames, error handlers,
//! imports and the GC trigger.
//!
//! Each frame's register file is itself a heap value (`HeapValue::Frame`),
//! so rooting is uniform: the collector traces the live frames' register
//! values and everything else follows. Collection is consulted once per
//! dispatch step, never in the middle of an instruction.
//!
//! A raise never uses host unwinding: the raising arm reports the error,
//! and [`Vm::raise_value`] scans the handler stacks of the current frame and
//! each caller. A handler receives the error value in its catch register and
//! execution resumes at its offset; with no handler left the VM aborts with
//! a traceback assembled from the frames' debug line maps.

mod ops;

use std::rc::Rc;

use ecow::EcoString;
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bytecode::{Bytecode, Data, Op, Primitive};
use crate::errors::{RuntimeError, TraceEntry};
use crate::gc::{Heap, ValueRef, FALSE, NULL, TRUE};
use crate::value::{display_value, HeapValue, NativeFn};

/// Host-facing VM configuration.
#[derive(Clone, Debug)]
pub struct VmOptions {
    /// Allow `import("path")` to compile and run script files.
    pub import_files: bool,
    pub max_call_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            import_files: false,
            max_call_depth: 512,
        }
    }
}

/// Which instruction list a frame executes.
enum Body {
    Main,
    Slice { offset: u32, len: u32 },
}

struct Handler {
    catch_ip: usize,
    reg: u32,
}

struct Frame {
    /// Handle to this frame's reified register file.
    regs: ValueRef,
    module: Rc<Bytecode>,
    body: Body,
    ip: usize,
    arity: u32,
    this: ValueRef,
    /// The function value being executed; null for module frames.
    func: ValueRef,
    /// Register file of the defining module's frame, for `load_global`.
    module_regs: ValueRef,
    handlers: Vec<Handler>,
    /// Caller register that receives this frame's return value.
    ret_reg: u32,
}

fn body_slice<'m>(module: &'m Bytecode, body: &Body) -> &'m [u32] {
    match body {
        Body::Main => &module.main,
        Body::Slice { offset, len } => {
            &module.extra[*offset as usize..(*offset + *len) as usize]
        }
    }
}

enum ModuleEntry {
    /// Currently executing its top level; hitting this again is a cycle.
    Loading,
    Loaded(ValueRef),
}

/// What one dispatch step decided beyond "keep going".
enum Step {
    Next,
    Ret(ValueRef),
    Raise(ValueRef),
}

pub struct Vm {
    heap: Heap,
    frames: Vec<Frame>,
    natives: HashMap<EcoString, NativeFn>,
    modules: HashMap<EcoString, ModuleEntry>,
    options: VmOptions,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        Vm {
            heap: Heap::new(),
            frames: Vec::new(),
            natives: HashMap::new(),
            modules: HashMap::new(),
            options,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Register a host callable under a name resolvable by `native("name")`.
    pub fn register_native(
        &mut self,
        name: impl Into<EcoString>,
        func: impl Fn(&mut Heap, &[ValueRef]) -> Result<ValueRef, EcoString> + 'static,
    ) {
        self.natives.insert(name.into(), Rc::new(func));
    }

    /// Execute a module's top level and return its result value.
    pub fn run_module(&mut self, module: Rc<Bytecode>) -> Result<ValueRef, RuntimeError> {
        let regs = self
            .heap
            .alloc(HeapValue::Frame(vec![NULL; module.main.len()]));
        self.run_frame(module, regs, 0)
    }

    /// Create a persistent base frame for incremental (REPL) execution.
    pub fn new_base_frame(&mut self) -> ValueRef {
        self.heap.alloc(HeapValue::Frame(Vec::new()))
    }

    /// Execute `main[start_ip..]` against an existing base frame, growing its
    /// register file to cover the module's current top-level body.
    pub fn run_incremental(
        &mut self,
        module: Rc<Bytecode>,
        base_regs: ValueRef,
        start_ip: usize,
    ) -> Result<ValueRef, RuntimeError> {
        let needed = module.main.len();
        match self.heap.get_mut(base_regs) {
            HeapValue::Frame(regs) => {
                if regs.len() < needed {
                    regs.resize(needed, NULL);
                }
            }
            _ => unreachable!("base frame handle does not name a frame value"),
        }
        self.run_frame(module, base_regs, start_ip)
    }

    fn run_frame(
        &mut self,
        module: Rc<Bytecode>,
        regs: ValueRef,
        start_ip: usize,
    ) -> Result<ValueRef, RuntimeError> {
        debug!(path = %module.debug_info.path, start_ip, "executing module frame");
        self.frames.push(Frame {
            regs,
            module,
            body: Body::Main,
            ip: start_ip,
            arity: 0,
            this: NULL,
            func: NULL,
            module_regs: regs,
            handlers: Vec::new(),
            ret_reg: 0,
        });
        self.execute()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn execute(&mut self) -> Result<ValueRef, RuntimeError> {
        let base = self.frames.len() - 1;

        loop {
            if self.heap.needs_collect() {
                self.collect_garbage();
            }

            // Fetch one instruction from the top frame.
            let (module, regs, fetched, pos, arity);
            {
                let frame = self.frames.last_mut().expect("frame stack is never empty");
                let body = body_slice(&frame.module, &frame.body);
                fetched = body.get(frame.ip).copied();
                pos = frame.ip;
                if fetched.is_some() {
                    frame.ip += 1;
                }
                arity = frame.arity;
                regs = frame.regs;
                module = frame.module.clone();
            }
            let Some(inst) = fetched else {
                // Fell off the end of a body: behave like `ret_null`.
                match self.finish_frame(base, NULL) {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            };
            let inst = inst as usize;
            let dst = arity + pos as u32;

            let op = module.code.ops[inst];
            let data = module.code.data[inst];
            trace!(pos, op = op.name(), "step");

            let outcome = self.step(op, data, &module, regs, pos, dst);
            match outcome {
                Ok(Step::Next) => {}
                Ok(Step::Ret(value)) => {
                    if let Some(result) = self.finish_frame(base, value) {
                        return Ok(result);
                    }
                }
                Ok(Step::Raise(err)) => self.raise_value(base, err)?,
                Err(msg) => {
                    let inner = self.heap.alloc_str(msg);
                    let err = self.heap.alloc(HeapValue::Error(inner));
                    self.raise_value(base, err)?;
                }
            }
        }
    }

    /// One instruction. `Err` is a raise with a fresh message; `Step::Raise`
    /// re-raises an existing error value.
    fn step(
        &mut self,
        op: Op,
        data: Data,
        module: &Rc<Bytecode>,
        regs: ValueRef,
        pos: usize,
        dst: u32,
    ) -> Result<Step, EcoString> {
        match op {
            Op::Nop => {}

            // --------------------------------------------------------------
            // Literals
            // --------------------------------------------------------------
            Op::Primitive => {
                let value = match data.as_primitive() {
                    Primitive::Null => NULL,
                    Primitive::True => TRUE,
                    Primitive::False => FALSE,
                };
                self.set_reg(regs, dst, value);
            }
            Op::Int => {
                let value = self.heap.alloc_int(data.as_int());
                self.set_reg(regs, dst, value);
            }
            Op::Num => {
                let value = self.heap.alloc_num(data.as_num());
                self.set_reg(regs, dst, value);
            }
            Op::Str => {
                let (offset, len) = data.as_str();
                let value = self.heap.alloc_str(module.string(offset, len));
                self.set_reg(regs, dst, value);
            }

            // --------------------------------------------------------------
            // Aggregates
            // --------------------------------------------------------------
            Op::BuildTuple | Op::BuildList => {
                let (offset, len) = data.as_extra();
                let items: Vec<ValueRef> = self
                    .extra_refs(module, offset, len)
                    .iter()
                    .map(|&r| self.reg(regs, r))
                    .collect();
                let value = if op == Op::BuildTuple {
                    self.heap.alloc(HeapValue::Tuple(items))
                } else {
                    self.heap.alloc(HeapValue::List(items))
                };
                self.set_reg(regs, dst, value);
            }
            Op::BuildMap => {
                let (offset, len) = data.as_extra();
                let words: SmallVec<[u32; 16]> =
                    SmallVec::from_slice(self.extra_refs(module, offset, len));
                let mut entries: Vec<(ValueRef, ValueRef)> = Vec::with_capacity(words.len() / 2);
                for pair in words.chunks_exact(2) {
                    let key = self.reg(regs, pair[0]);
                    let value = self.reg(regs, pair[1]);
                    // Last write wins, in place, preserving insertion order.
                    match entries
                        .iter_mut()
                        .find(|(k, _)| crate::value::deep_equal(&self.heap, *k, key))
                    {
                        Some(entry) => entry.1 = value,
                        None => entries.push((key, value)),
                    }
                }
                let value = self.heap.alloc(HeapValue::Map(entries));
                self.set_reg(regs, dst, value);
            }
            Op::BuildError => {
                let inner = self.reg(regs, data.as_un());
                let value = self.heap.alloc(HeapValue::Error(inner));
                self.set_reg(regs, dst, value);
            }
            Op::BuildErrorNull => {
                let value = self.heap.alloc(HeapValue::Error(NULL));
                self.set_reg(regs, dst, value);
            }
            Op::BuildTagged => {
                let (offset, len) = data.as_extra();
                let words = self.extra_refs(module, offset, len);
                let (soff, slen, operand) = (words[0], words[1], words[2]);
                let name = EcoString::from(module.string(soff, slen));
                let inner = self.reg(regs, operand);
                let value = self.heap.alloc(HeapValue::Tagged { name, value: inner });
                self.set_reg(regs, dst, value);
            }
            Op::BuildTaggedNull => {
                let (soff, slen) = data.as_str();
                let name = EcoString::from(module.string(soff, slen));
                let value = self.heap.alloc(HeapValue::Tagged { name, value: NULL });
                self.set_reg(regs, dst, value);
            }
            Op::BuildRange => {
                let (lhs, rhs) = data.as_bin();
                let start = self.reg(regs, lhs);
                let end = self.reg(regs, rhs);
                let value = self.build_range(start, end, None)?;
                self.set_reg(regs, dst, value);
            }
            Op::BuildRangeStep => {
                let (start_ref, offset) = data.as_range();
                let words = self.extra_refs(module, offset, 2);
                let (end_ref, step_ref) = (words[0], words[1]);
                let start = self.reg(regs, start_ref);
                let end = self.reg(regs, end_ref);
                let step = self.reg(regs, step_ref);
                let value = self.build_range(start, end, Some(step))?;
                self.set_reg(regs, dst, value);
            }
            Op::BuildFunc | Op::BuildFuncCapture => {
                let (offset, len) = data.as_extra();
                let value = self.build_func(module, regs, op, offset, len);
                self.set_reg(regs, dst, value);
            }

            // --------------------------------------------------------------
            // Bindings & movement
            // --------------------------------------------------------------
            Op::Discard => {
                let value = self.reg(regs, data.as_un());
                if let HeapValue::Error(_) = self.heap.get(value) {
                    return Ok(Step::Raise(value));
                }
            }
            Op::CopyUn => {
                let value = self.reg(regs, data.as_un());
                let copy = self.heap.get(value).clone();
                let copy = self.heap.alloc(copy);
                self.set_reg(regs, dst, copy);
            }
            Op::Copy => {
                let (to, from) = data.as_bin();
                let value = self.reg(regs, from);
                let copy = self.heap.get(value).clone();
                let copy = self.heap.alloc(copy);
                self.set_reg(regs, to, copy);
            }
            Op::Move => {
                let (to, from) = data.as_bin();
                let value = self.reg(regs, from);
                self.set_reg(regs, to, value);
            }
            Op::LoadGlobal => {
                let slot = data.as_un();
                let module_regs = self.frames.last().expect("frame stack is never empty").module_regs;
                let value = self.heap.frame_reg(module_regs, slot);
                self.set_reg(regs, dst, value);
            }
            Op::LoadCapture => {
                let index = data.as_un();
                let func = self.frames.last().expect("frame stack is never empty").func;
                let value = match self.heap.get(func) {
                    HeapValue::Func(f) => f.captures[index as usize],
                    _ => unreachable!("load_capture outside a function frame"),
                };
                self.set_reg(regs, dst, value);
            }
            Op::LoadThis => {
                let this = self.frames.last().expect("frame stack is never empty").this;
                self.set_reg(regs, dst, this);
            }
            Op::Import => {
                let (offset, len) = data.as_str();
                let name = EcoString::from(module.string(offset, len));
                let value = self.import(&name)?;
                self.set_reg(regs, dst, value);
            }

            // --------------------------------------------------------------
            // Arithmetic, bitwise, comparison
            // --------------------------------------------------------------
            Op::DivFloor
            | Op::Div
            | Op::Mul
            | Op::Pow
            | Op::Rem
            | Op::Add
            | Op::Sub
            | Op::LShift
            | Op::RShift
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor => {
                let (lhs, rhs) = data.as_bin();
                let a = self.reg(regs, lhs);
                let b = self.reg(regs, rhs);
                let value = self.binary_arith(op, a, b)?;
                self.set_reg(regs, dst, value);
            }
            Op::Equal | Op::NotEqual => {
                let (lhs, rhs) = data.as_bin();
                let a = self.reg(regs, lhs);
                let b = self.reg(regs, rhs);
                let mut result = crate::value::deep_equal(&self.heap, a, b);
                if op == Op::NotEqual {
                    result = !result;
                }
                let value = self.heap.alloc_bool(result);
                self.set_reg(regs, dst, value);
            }
            Op::LessThan | Op::LessThanEqual | Op::GreaterThan | Op::GreaterThanEqual => {
                let (lhs, rhs) = data.as_bin();
                let a = self.reg(regs, lhs);
                let b = self.reg(regs, rhs);
                let result = self.ordered_compare(op, a, b)?;
                let value = self.heap.alloc_bool(result);
                self.set_reg(regs, dst, value);
            }
            Op::In => {
                let (lhs, rhs) = data.as_bin();
                let needle = self.reg(regs, lhs);
                let haystack = self.reg(regs, rhs);
                let result = self.contains(haystack, needle)?;
                let value = self.heap.alloc_bool(result);
                self.set_reg(regs, dst, value);
            }

            // --------------------------------------------------------------
            // Mutation, type, unary
            // --------------------------------------------------------------
            Op::Append => {
                let (lhs, rhs) = data.as_bin();
                let list = self.reg(regs, lhs);
                let item = self.reg(regs, rhs);
                match self.heap.get_mut(list) {
                    HeapValue::List(items) => items.push(item),
                    other => {
                        let tag = other.tag().name();
                        return Err(EcoString::from(format!("cannot append to {tag}")));
                    }
                }
            }
            Op::As => {
                let (operand, tag) = data.as_bin_ty();
                let value = self.reg(regs, operand);
                let cast = self.cast(value, tag)?;
                self.set_reg(regs, dst, cast);
            }
            Op::Is => {
                let (operand, tag) = data.as_bin_ty();
                let value = self.reg(regs, operand);
                let result = self.heap.get(value).tag() == tag;
                let value = self.heap.alloc_bool(result);
                self.set_reg(regs, dst, value);
            }
            Op::Negate | Op::BoolNot | Op::BitNot => {
                let operand = self.reg(regs, data.as_un());
                let value = self.unary(op, operand)?;
                self.set_reg(regs, dst, value);
            }

            // --------------------------------------------------------------
            // Errors & tags
            // --------------------------------------------------------------
            Op::UnwrapError => {
                let value = self.reg(regs, data.as_un());
                match self.heap.get(value) {
                    HeapValue::Error(inner) => {
                        let inner = *inner;
                        self.set_reg(regs, dst, inner);
                    }
                    other => {
                        let tag = other.tag().name();
                        return Err(EcoString::from(format!("expected an error, found {tag}")));
                    }
                }
            }
            Op::UnwrapTagged | Op::UnwrapTaggedOrNull => {
                let (offset, len) = data.as_extra();
                let words = self.extra_refs(module, offset, len);
                let (soff, slen, operand) = (words[0], words[1], words[2]);
                let expected = module.string(soff, slen);
                let value = self.reg(regs, operand);
                let payload = match self.heap.get(value) {
                    HeapValue::Tagged { name, value } if name == expected => Some(*value),
                    _ => None,
                };
                match (payload, op) {
                    (Some(payload), _) => self.set_reg(regs, dst, payload),
                    (None, Op::UnwrapTaggedOrNull) => self.set_reg(regs, dst, NULL),
                    (None, _) => {
                        return Err(EcoString::from(format!(
                            "expected a value tagged @{expected}"
                        )))
                    }
                }
            }

            // --------------------------------------------------------------
            // Sequence shape
            // --------------------------------------------------------------
            Op::CheckLen => {
                let (operand, expected) = data.as_bin();
                let value = self.reg(regs, operand);
                let matches = match self.heap.get(value) {
                    HeapValue::Tuple(items) | HeapValue::List(items) => {
                        items.len() == expected as usize
                    }
                    _ => false,
                };
                if !matches {
                    self.set_reg(regs, operand, NULL);
                }
            }
            Op::AssertLen => {
                let (operand, expected) = data.as_bin();
                let value = self.reg(regs, operand);
                match self.heap.get(value) {
                    HeapValue::Tuple(items) | HeapValue::List(items) => {
                        let len = items.len();
                        if len != expected as usize {
                            return Err(EcoString::from(format!(
                                "expected {expected} elements, found {len}"
                            )));
                        }
                    }
                    other => {
                        let tag = other.tag().name();
                        return Err(EcoString::from(format!(
                            "cannot destructure {tag} as a sequence"
                        )));
                    }
                }
            }

            // --------------------------------------------------------------
            // Indexed access
            // --------------------------------------------------------------
            Op::Get => {
                let (container, index) = data.as_bin();
                let container = self.reg(regs, container);
                let index = self.reg(regs, index);
                let value = self.get_index(container, index)?;
                self.set_reg(regs, dst, value);
            }
            Op::GetOrNull => {
                let (container, index) = data.as_bin();
                let container = self.reg(regs, container);
                let index = self.reg(regs, index);
                let value = self.get_index(container, index).unwrap_or(NULL);
                self.set_reg(regs, dst, value);
            }
            Op::Set => {
                let (container_ref, offset) = data.as_range();
                let words = self.extra_refs(module, offset, 2);
                let (index_ref, value_ref) = (words[0], words[1]);
                let container = self.reg(regs, container_ref);
                let index = self.reg(regs, index_ref);
                let value = self.reg(regs, value_ref);
                self.set_index(container, index, value)?;
            }

            // --------------------------------------------------------------
            // Control
            // --------------------------------------------------------------
            Op::PushErrHandler => {
                let (reg, offset) = data.as_jump_condition();
                let catch_ip = (pos as i64 + offset as i64) as usize;
                self.frames
                    .last_mut()
                    .expect("frame stack is never empty")
                    .handlers
                    .push(Handler { catch_ip, reg });
            }
            Op::PopErrHandler => {
                self.frames
                    .last_mut()
                    .expect("frame stack is never empty")
                    .handlers
                    .pop()
                    .expect("pop_err_handler on an empty handler stack");
            }
            Op::Jump => {
                self.jump(pos, data.as_jump());
            }
            Op::JumpIfTrue | Op::JumpIfFalse => {
                let (operand, offset) = data.as_jump_condition();
                let value = self.reg(regs, operand);
                let truth = match self.heap.get(value) {
                    HeapValue::Bool(b) => *b,
                    other => {
                        let tag = other.tag().name();
                        return Err(EcoString::from(format!("expected a bool, found {tag}")));
                    }
                };
                if truth == (op == Op::JumpIfTrue) {
                    self.jump(pos, offset);
                }
            }
            Op::JumpIfNull => {
                let (operand, offset) = data.as_jump_condition();
                let value = self.reg(regs, operand);
                if matches!(self.heap.get(value), HeapValue::Null) {
                    self.jump(pos, offset);
                }
            }
            Op::UnwrapErrorOrJump => {
                let (operand, offset) = data.as_jump_condition();
                let value = self.reg(regs, operand);
                // Errors fall through into the propagation/handler path.
                if !matches!(self.heap.get(value), HeapValue::Error(_)) {
                    self.jump(pos, offset);
                }
            }

            // --------------------------------------------------------------
            // Iteration
            // --------------------------------------------------------------
            Op::IterInit => {
                let source = self.reg(regs, data.as_un());
                let iter = self.iter_init(source)?;
                self.set_reg(regs, dst, iter);
            }
            Op::IterNext => {
                let (operand, offset) = data.as_jump_condition();
                let iter = self.reg(regs, operand);
                match self.iter_next(iter)? {
                    Some(item) => self.set_reg(regs, dst, item),
                    None => self.jump(pos, offset),
                }
            }

            // --------------------------------------------------------------
            // Calls & returns
            // --------------------------------------------------------------
            Op::Call => {
                let (offset, len) = data.as_extra();
                let words: SmallVec<[u32; 8]> =
                    SmallVec::from_slice(self.extra_refs(module, offset, len));
                let callee = self.reg(regs, words[0]);
                let args: SmallVec<[ValueRef; 8]> =
                    words[1..].iter().map(|&r| self.reg(regs, r)).collect();
                self.call_value(callee, NULL, &args, dst)?;
            }
            Op::CallOne => {
                let (callee, arg) = data.as_bin();
                let callee = self.reg(regs, callee);
                let arg = self.reg(regs, arg);
                self.call_value(callee, NULL, &[arg], dst)?;
            }
            Op::CallZero => {
                let callee = self.reg(regs, data.as_un());
                self.call_value(callee, NULL, &[], dst)?;
            }
            Op::ThisCall => {
                let (offset, len) = data.as_extra();
                let words: SmallVec<[u32; 8]> =
                    SmallVec::from_slice(self.extra_refs(module, offset, len));
                let callee = self.reg(regs, words[0]);
                let this = self.reg(regs, words[1]);
                let args: SmallVec<[ValueRef; 8]> =
                    words[2..].iter().map(|&r| self.reg(regs, r)).collect();
                self.call_value(callee, this, &args, dst)?;
            }
            Op::ThisCallZero => {
                let (callee, this) = data.as_bin();
                let callee = self.reg(regs, callee);
                let this = self.reg(regs, this);
                self.call_value(callee, this, &[], dst)?;
            }
            Op::Ret => {
                let value = self.reg(regs, data.as_un());
                return Ok(Step::Ret(value));
            }
            Op::RetNull => return Ok(Step::Ret(NULL)),
            Op::Throw => {
                let value = self.reg(regs, data.as_un());
                let err = match self.heap.get(value) {
                    HeapValue::Error(_) => value,
                    _ => self.heap.alloc(HeapValue::Error(value)),
                };
                return Ok(Step::Raise(err));
            }
        }
        Ok(Step::Next)
    }

    // ------------------------------------------------------------------
    // Frame plumbing
    // ------------------------------------------------------------------

    fn reg(&self, regs: ValueRef, index: u32) -> ValueRef {
        self.heap.frame_reg(regs, index)
    }

    fn set_reg(&mut self, regs: ValueRef, index: u32, value: ValueRef) {
        self.heap.frame_set_reg(regs, index, value);
    }

    fn extra_refs<'m>(&self, module: &'m Bytecode, offset: u32, len: u32) -> &'m [u32] {
        &module.extra[offset as usize..(offset + len) as usize]
    }

    fn jump(&mut self, pos: usize, offset: i32) {
        let frame = self.frames.last_mut().expect("frame stack is never empty");
        frame.ip = (pos as i64 + offset as i64) as usize;
    }

    /// Pop the finished frame and deliver `value`. Returns the final result
    /// when the popped frame was this execution's base.
    fn finish_frame(&mut self, base: usize, value: ValueRef) -> Option<ValueRef> {
        let frame = self.frames.pop().expect("frame stack is never empty");
        debug_assert!(
            frame.handlers.is_empty(),
            "error-handler stack unbalanced at return"
        );
        if self.frames.len() == base {
            return Some(value);
        }
        let caller_regs = self.frames.last().expect("caller frame exists").regs;
        self.heap.frame_set_reg(caller_regs, frame.ret_reg, value);
        None
    }

    /// Deliver an error value to the nearest handler at or above `base`, or
    /// abort with a traceback.
    fn raise_value(&mut self, base: usize, err: ValueRef) -> Result<(), RuntimeError> {
        let mut target = None;
        for index in (base..self.frames.len()).rev() {
            if !self.frames[index].handlers.is_empty() {
                target = Some(index);
                break;
            }
        }

        match target {
            Some(index) => {
                self.frames.truncate(index + 1);
                let frame = self.frames.last_mut().expect("target frame exists");
                let handler = frame.handlers.pop().expect("handler checked non-empty");
                frame.ip = handler.catch_ip;
                let regs = frame.regs;
                self.heap.frame_set_reg(regs, handler.reg, err);
                Ok(())
            }
            None => {
                let traceback: Vec<TraceEntry> = self.frames[base..]
                    .iter()
                    .rev()
                    .map(|frame| {
                        let body = body_slice(&frame.module, &frame.body);
                        let offset = frame
                            .ip
                            .checked_sub(1)
                            .and_then(|ip| body.get(ip))
                            .and_then(|&inst| frame.module.line_for(inst))
                            .unwrap_or(0);
                        TraceEntry {
                            path: frame.module.debug_info.path.clone(),
                            offset,
                        }
                    })
                    .collect();
                let message = match self.heap.get(err) {
                    HeapValue::Error(inner) => match self.heap.get(*inner) {
                        HeapValue::Str(s) => s.clone(),
                        _ => EcoString::from(display_value(&self.heap, *inner)),
                    },
                    _ => EcoString::from(display_value(&self.heap, err)),
                };
                self.frames.truncate(base);
                debug!(%message, "unhandled runtime error");
                Err(RuntimeError { message, traceback })
            }
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    fn collect_garbage(&mut self) {
        let mut roots: Vec<ValueRef> = Vec::with_capacity(self.frames.len() * 4 + 8);
        for frame in &self.frames {
            roots.push(frame.regs);
            roots.push(frame.this);
            roots.push(frame.func);
            roots.push(frame.module_regs);
        }
        for entry in self.modules.values() {
            if let ModuleEntry::Loaded(value) = entry {
                roots.push(*value);
            }
        }
        self.heap.collect(roots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Code, Data, DebugInfo};

    /// Hand-assembled single-body module; debug lines are synthesized for
    /// every faulting opcode.
    fn module(ops: Vec<Op>, data: Vec<Data>, extra: Vec<u32>, strings: &[u8]) -> Rc<Bytecode> {
        let main = (0..ops.len() as u32).collect();
        let lines = ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.needs_debug_info())
            .map(|(i, _)| (i as u32, 0))
            .collect();
        Rc::new(Bytecode {
            code: Code { ops, data },
            extra,
            main,
            strings: strings.to_vec(),
            debug_info: DebugInfo {
                path: "<test>".into(),
                source: "".into(),
                lines,
            },
        })
    }

    fn run(module: Rc<Bytecode>) -> Result<i64, RuntimeError> {
        let mut vm = Vm::default();
        let result = vm.run_module(module)?;
        match vm.heap().get(result) {
            HeapValue::Int(i) => Ok(*i),
            other => panic!("expected int result, got {}", other.tag().name()),
        }
    }

    #[test]
    fn arithmetic_over_registers() {
        let m = module(
            vec![Op::Int, Op::Int, Op::Add, Op::Ret],
            vec![Data::int(40), Data::int(2), Data::bin(0, 1), Data::un(2)],
            vec![],
            b"",
        );
        assert_eq!(run(m).unwrap(), 42);
    }

    #[test]
    fn division_by_zero_raises_with_traceback() {
        let m = module(
            vec![Op::Int, Op::Int, Op::Div, Op::Ret],
            vec![Data::int(1), Data::int(0), Data::bin(0, 1), Data::un(2)],
            vec![],
            b"",
        );
        let err = run(m).unwrap_err();
        assert!(err.message.contains("division by zero"));
        assert_eq!(err.traceback.len(), 1);
    }

    #[test]
    fn handler_catches_raise() {
        // r0 = null (catch register), push handler -> ip 5, 1/0 raises,
        // handler unwraps nothing and returns the caught error's register.
        let m = module(
            vec![
                Op::Primitive,       // 0: catch register
                Op::PushErrHandler,  // 1: catch -> position 5
                Op::Int,             // 2
                Op::Int,             // 3
                Op::Div,             // 4: raises
                Op::Is,              // 5: caught? r0 is error
                Op::Ret,             // 6
            ],
            vec![
                Data::primitive(Primitive::Null),
                Data::jump_condition(0, 4),
                Data::int(1),
                Data::int(0),
                Data::bin(2, 3),
                Data::bin_ty(0, crate::value::TypeTag::Error),
                Data::un(5),
            ],
            vec![],
            b"",
        );
        let mut vm = Vm::default();
        let result = vm.run_module(m).unwrap();
        assert!(matches!(vm.heap().get(result), HeapValue::Bool(true)));
    }

    #[test]
    fn get_or_null_swallows_missing_keys() {
        // [10][5] is out of bounds: get_or_null yields null.
        let m = module(
            vec![
                Op::Int,       // 0: 10
                Op::BuildList, // 1: [10]
                Op::Int,       // 2: 5
                Op::GetOrNull, // 3
                Op::Is,        // 4: null?
                Op::Ret,       // 5
            ],
            vec![
                Data::int(10),
                Data::extra(0, 1),
                Data::int(5),
                Data::bin(1, 2),
                Data::bin_ty(3, crate::value::TypeTag::Null),
                Data::un(4),
            ],
            vec![0],
            b"",
        );
        let mut vm = Vm::default();
        let result = vm.run_module(m).unwrap();
        assert!(matches!(vm.heap().get(result), HeapValue::Bool(true)));
    }

    #[test]
    fn check_len_nulls_its_operand_on_mismatch() {
        let m = module(
            vec![
                Op::Int,       // 0
                Op::BuildList, // 1: [7]
                Op::CheckLen,  // 2: expects 2 -> nulls r1
                Op::Is,        // 3: r1 is null
                Op::Ret,       // 4
            ],
            vec![
                Data::int(7),
                Data::extra(0, 1),
                Data::bin(1, 2),
                Data::bin_ty(1, crate::value::TypeTag::Null),
                Data::un(3),
            ],
            vec![0],
            b"",
        );
        let mut vm = Vm::default();
        let result = vm.run_module(m).unwrap();
        assert!(matches!(vm.heap().get(result), HeapValue::Bool(true)));
    }

    #[test]
    fn copy_clones_the_cell_but_shares_elements() {
        // r0 = 7, r1 = [r0], r2 = null, copy r2 <- r1, append 7 to r1:
        // the copy keeps its own (shorter) spine.
        let m = module(
            vec![
                Op::Int,       // 0
                Op::BuildList, // 1
                Op::Primitive, // 2
                Op::Copy,      // 3: r2 <- clone of r1
                Op::Append,    // 4: r1 grows
                Op::Ret,       // 5: the clone
            ],
            vec![
                Data::int(7),
                Data::extra(0, 1),
                Data::primitive(Primitive::Null),
                Data::bin(2, 1),
                Data::bin(1, 0),
                Data::un(2),
            ],
            vec![0],
            b"",
        );
        let mut vm = Vm::default();
        let result = vm.run_module(m).unwrap();
        match vm.heap().get(result) {
            HeapValue::List(items) => assert_eq!(items.len(), 1),
            other => panic!("expected a list, got {}", other.tag().name()),
        }
    }

    #[test]
    fn discard_of_an_error_raises() {
        let m = module(
            vec![Op::Int, Op::BuildError, Op::Discard, Op::RetNull],
            vec![Data::int(3), Data::un(0), Data::un(1), Data::NONE],
            vec![],
            b"",
        );
        let mut vm = Vm::default();
        let err = vm.run_module(m).unwrap_err();
        assert!(err.message.contains("3"));
    }

    #[test]
    fn gc_runs_between_instructions_and_keeps_registers() {
        // A tight allocation loop with a tiny threshold: values referenced
        // from registers must survive collections.
        let mut vm = Vm::default();
        vm.heap = Heap::with_threshold(256);
        let m = module(
            vec![
                Op::Int,        // 0: 0
                Op::Int,        // 1: 100000
                Op::BuildRange, // 2: 0:100000
                Op::IterInit,   // 3
                Op::IterNext,   // 4: -> +2 when exhausted
                Op::Jump,       // 5: back to 4
                Op::Ret,        // 6: last element
            ],
            vec![
                Data::int(0),
                Data::int(100),
                Data::bin(0, 1),
                Data::un(2),
                Data::jump_condition(3, 2),
                Data::jump(-1),
                Data::un(4),
            ],
            vec![],
            b"",
        );
        let result = vm.run_module(m).unwrap();
        assert!(matches!(vm.heap().get(result), HeapValue::Int(99)));
    }
}
