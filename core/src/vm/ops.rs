//! Value-level operation helpers behind the dispatch loop: arithmetic and
//! comparison over heap values, casts, subscripts, the iterator protocol,
//! calls and import resolution. Every helper reports failures as a plain
//! message; the dispatch loop turns that into a raise at the faulting
//! instruction.

use std::rc::Rc;

use ecow::EcoString;

use super::{Body, Frame, ModuleEntry, Vm};
use crate::bytecode::{Bytecode, Op};
use crate::gc::{ValueRef, NULL};
use crate::value::{
    arith_binary, arith_negate, compare, stringify, Arith, Func, HeapValue, Iter, IterKind,
    TypeTag,
};

type OpResult<T> = Result<T, EcoString>;

fn type_error(op: Op, a: &HeapValue, b: &HeapValue) -> EcoString {
    EcoString::from(format!(
        "invalid operands for `{}`: {} and {}",
        op.name(),
        a.tag().name(),
        b.tag().name()
    ))
}

fn as_arith(value: &HeapValue) -> Option<Arith> {
    match value {
        HeapValue::Int(i) => Some(Arith::Int(*i)),
        HeapValue::Num(n) => Some(Arith::Num(*n)),
        _ => None,
    }
}

impl Vm {
    // ------------------------------------------------------------------
    // Arithmetic & comparison
    // ------------------------------------------------------------------

    pub(super) fn binary_arith(&mut self, op: Op, a: ValueRef, b: ValueRef) -> OpResult<ValueRef> {
        let (va, vb) = (self.heap().get(a), self.heap().get(b));
        let (Some(x), Some(y)) = (as_arith(va), as_arith(vb)) else {
            return Err(type_error(op, va, vb));
        };
        match arith_binary(op, x, y) {
            Ok(Arith::Int(v)) => Ok(self.heap_mut().alloc_int(v)),
            Ok(Arith::Num(v)) => Ok(self.heap_mut().alloc_num(v)),
            Err(e) => Err(EcoString::from(e.message())),
        }
    }

    pub(super) fn unary(&mut self, op: Op, operand: ValueRef) -> OpResult<ValueRef> {
        let value = self.heap().get(operand);
        match op {
            Op::Negate => match as_arith(value) {
                Some(v) => match arith_negate(v) {
                    Ok(Arith::Int(v)) => Ok(self.heap_mut().alloc_int(v)),
                    Ok(Arith::Num(v)) => Ok(self.heap_mut().alloc_num(v)),
                    Err(e) => Err(EcoString::from(e.message())),
                },
                None => Err(EcoString::from(format!(
                    "cannot negate {}",
                    value.tag().name()
                ))),
            },
            Op::BoolNot => match value {
                HeapValue::Bool(b) => {
                    let b = !*b;
                    Ok(self.heap_mut().alloc_bool(b))
                }
                other => Err(EcoString::from(format!(
                    "expected a bool, found {}",
                    other.tag().name()
                ))),
            },
            _ => match value {
                HeapValue::Int(i) => {
                    let i = !*i;
                    Ok(self.heap_mut().alloc_int(i))
                }
                other => Err(EcoString::from(format!(
                    "cannot bit-invert {}",
                    other.tag().name()
                ))),
            },
        }
    }

    pub(super) fn ordered_compare(&self, op: Op, a: ValueRef, b: ValueRef) -> OpResult<bool> {
        use core::cmp::Ordering::*;
        match compare(self.heap(), a, b) {
            Ok(ordering) => Ok(match op {
                Op::LessThan => ordering == Some(Less),
                Op::LessThanEqual => matches!(ordering, Some(Less | Equal)),
                Op::GreaterThan => ordering == Some(Greater),
                _ => matches!(ordering, Some(Greater | Equal)),
            }),
            Err(()) => Err(type_error(
                op,
                self.heap().get(a),
                self.heap().get(b),
            )),
        }
    }

    pub(super) fn contains(&self, haystack: ValueRef, needle: ValueRef) -> OpResult<bool> {
        match self.heap().get(haystack) {
            HeapValue::Tuple(items) | HeapValue::List(items) => Ok(items
                .iter()
                .any(|&item| crate::value::deep_equal(self.heap(), needle, item))),
            HeapValue::Map(entries) => Ok(entries
                .iter()
                .any(|&(key, _)| crate::value::deep_equal(self.heap(), needle, key))),
            HeapValue::Str(s) => match self.heap().get(needle) {
                HeapValue::Str(sub) => Ok(s.contains(sub.as_str())),
                other => Err(EcoString::from(format!(
                    "cannot search a str for {}",
                    other.tag().name()
                ))),
            },
            HeapValue::Range { start, end, step } => match self.heap().get(needle) {
                HeapValue::Int(i) => {
                    let (start, end, step, i) = (*start, *end, *step, *i);
                    let inside = if step > 0 {
                        i >= start && i < end
                    } else {
                        i <= start && i > end
                    };
                    Ok(inside && (i - start) % step == 0)
                }
                _ => Ok(false),
            },
            other => Err(EcoString::from(format!(
                "{} is not a container",
                other.tag().name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Casts
    // ------------------------------------------------------------------

    pub(super) fn cast(&mut self, value: ValueRef, target: TypeTag) -> OpResult<ValueRef> {
        let current = self.heap().get(value).tag();
        if current == target {
            return Ok(value);
        }
        let unsupported = || {
            EcoString::from(format!(
                "cannot cast {} to {}",
                current.name(),
                target.name()
            ))
        };
        match target {
            TypeTag::Int => {
                let v = match self.heap().get(value) {
                    HeapValue::Num(n) => {
                        if !n.is_finite() {
                            return Err(EcoString::from("cannot cast a non-finite num to int"));
                        }
                        *n as i64
                    }
                    HeapValue::Bool(b) => *b as i64,
                    HeapValue::Str(s) => s
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| EcoString::from(format!("invalid int literal: {s:?}")))?,
                    _ => return Err(unsupported()),
                };
                Ok(self.heap_mut().alloc_int(v))
            }
            TypeTag::Num => {
                let v = match self.heap().get(value) {
                    HeapValue::Int(i) => *i as f64,
                    HeapValue::Bool(b) => *b as u8 as f64,
                    HeapValue::Str(s) => s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| EcoString::from(format!("invalid num literal: {s:?}")))?,
                    _ => return Err(unsupported()),
                };
                Ok(self.heap_mut().alloc_num(v))
            }
            TypeTag::Bool => {
                let v = match self.heap().get(value) {
                    HeapValue::Int(i) => *i != 0,
                    HeapValue::Str(s) => match s.as_str() {
                        "true" => true,
                        "false" => false,
                        _ => return Err(EcoString::from(format!("invalid bool literal: {s:?}"))),
                    },
                    _ => return Err(unsupported()),
                };
                Ok(self.heap_mut().alloc_bool(v))
            }
            TypeTag::Str => {
                let text = stringify(self.heap(), value);
                Ok(self.heap_mut().alloc_str(text))
            }
            _ => Err(unsupported()),
        }
    }

    // ------------------------------------------------------------------
    // Subscripts
    // ------------------------------------------------------------------

    pub(super) fn get_index(&mut self, container: ValueRef, index: ValueRef) -> OpResult<ValueRef> {
        match self.heap().get(container) {
            HeapValue::Tuple(items) | HeapValue::List(items) => {
                let i = self.int_index(index, items.len())?;
                Ok(items[i])
            }
            HeapValue::Str(s) => {
                let chars = s.chars().count();
                let i = self.int_index(index, chars)?;
                let ch: String = s.chars().skip(i).take(1).collect();
                Ok(self.heap_mut().alloc_str(ch))
            }
            HeapValue::Map(entries) => {
                match entries
                    .iter()
                    .find(|&&(key, _)| crate::value::deep_equal(self.heap(), key, index))
                {
                    Some(&(_, value)) => Ok(value),
                    None => Err(EcoString::from(format!(
                        "key not found: {}",
                        crate::value::display_value(self.heap(), index)
                    ))),
                }
            }
            other => Err(EcoString::from(format!(
                "{} is not indexable",
                other.tag().name()
            ))),
        }
    }

    fn int_index(&self, index: ValueRef, len: usize) -> OpResult<usize> {
        match self.heap().get(index) {
            HeapValue::Int(i) => {
                let i = *i;
                if i >= 0 && (i as usize) < len {
                    Ok(i as usize)
                } else {
                    Err(EcoString::from(format!(
                        "index {i} out of bounds for length {len}"
                    )))
                }
            }
            other => Err(EcoString::from(format!(
                "expected an int index, found {}",
                other.tag().name()
            ))),
        }
    }

    pub(super) fn set_index(
        &mut self,
        container: ValueRef,
        index: ValueRef,
        value: ValueRef,
    ) -> OpResult<()> {
        match self.heap().get(container) {
            HeapValue::List(items) => {
                let i = self.int_index(index, items.len())?;
                match self.heap_mut().get_mut(container) {
                    HeapValue::List(items) => items[i] = value,
                    _ => unreachable!("container kind changed mid-instruction"),
                }
                Ok(())
            }
            HeapValue::Map(_) => {
                let existing = match self.heap().get(container) {
                    HeapValue::Map(entries) => entries
                        .iter()
                        .position(|&(key, _)| crate::value::deep_equal(self.heap(), key, index)),
                    _ => unreachable!(),
                };
                match self.heap_mut().get_mut(container) {
                    HeapValue::Map(entries) => match existing {
                        Some(at) => entries[at].1 = value,
                        None => entries.push((index, value)),
                    },
                    _ => unreachable!(),
                }
                Ok(())
            }
            HeapValue::Tuple(_) => Err(EcoString::from("cannot assign into a tuple")),
            other => Err(EcoString::from(format!(
                "{} is not indexable",
                other.tag().name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Ranges, functions
    // ------------------------------------------------------------------

    pub(super) fn build_range(
        &mut self,
        start: ValueRef,
        end: ValueRef,
        step: Option<ValueRef>,
    ) -> OpResult<ValueRef> {
        let as_int = |vm: &Vm, v: ValueRef| match vm.heap().get(v) {
            HeapValue::Int(i) => Ok(*i),
            other => Err(EcoString::from(format!(
                "range bounds must be ints, found {}",
                other.tag().name()
            ))),
        };
        let start = as_int(self, start)?;
        let end = as_int(self, end)?;
        let step = match step {
            Some(step) => as_int(self, step)?,
            None => 1,
        };
        if step == 0 {
            return Err(EcoString::from("range step cannot be zero"));
        }
        Ok(self.heap_mut().alloc(HeapValue::Range { start, end, step }))
    }

    /// Decode `[arity, (captures_len, captures...,)? body...]` and build the
    /// function value. Captures are read from the current frame's registers
    /// at this moment; the resulting value owns them from here on.
    pub(super) fn build_func(
        &mut self,
        module: &Rc<Bytecode>,
        regs: ValueRef,
        op: Op,
        offset: u32,
        len: u32,
    ) -> ValueRef {
        let words = &module.extra[offset as usize..(offset + len) as usize];
        let arity = words[0];
        let (captures, body_start) = if op == Op::BuildFuncCapture {
            let cap_len = words[1] as usize;
            let captures = words[2..2 + cap_len]
                .iter()
                .map(|&r| self.heap.frame_reg(regs, r))
                .collect();
            (captures, 2 + cap_len as u32)
        } else {
            (Vec::new(), 1)
        };
        let module_regs = self
            .frames
            .last()
            .expect("frame stack is never empty")
            .module_regs;
        self.heap.alloc(HeapValue::Func(Func {
            module: module.clone(),
            body_offset: offset + body_start,
            body_len: len - body_start,
            arity,
            captures,
            module_regs,
        }))
    }

    // ------------------------------------------------------------------
    // Iterators
    // ------------------------------------------------------------------

    pub(super) fn iter_init(&mut self, source: ValueRef) -> OpResult<ValueRef> {
        let kind = match self.heap().get(source) {
            HeapValue::Tuple(items) | HeapValue::List(items) => IterKind::Seq {
                index: 0,
                len: items.len(),
            },
            HeapValue::Map(entries) => IterKind::Map {
                index: 0,
                len: entries.len(),
            },
            HeapValue::Str(_) => IterKind::Str { byte: 0 },
            HeapValue::Range { start, .. } => IterKind::Range { current: *start },
            other => {
                return Err(EcoString::from(format!(
                    "{} is not iterable",
                    other.tag().name()
                )))
            }
        };
        Ok(self.heap_mut().alloc(HeapValue::Iter(Iter { source, kind })))
    }

    /// Advance an iterator; `None` means exhausted. Containers whose length
    /// changed since `iter_init` raise instead of yielding garbage.
    pub(super) fn iter_next(&mut self, iter: ValueRef) -> OpResult<Option<ValueRef>> {
        let (source, kind) = match self.heap().get(iter) {
            HeapValue::Iter(it) => (it.source, it.kind.clone()),
            other => {
                return Err(EcoString::from(format!(
                    "expected an iterator, found {}",
                    other.tag().name()
                )))
            }
        };

        let (item, next_kind) = match kind {
            IterKind::Seq { index, len } => match self.heap().get(source) {
                HeapValue::Tuple(items) | HeapValue::List(items) => {
                    if items.len() != len {
                        return Err(EcoString::from("container mutated during iteration"));
                    }
                    if index >= len {
                        return Ok(None);
                    }
                    (items[index], IterKind::Seq { index: index + 1, len })
                }
                _ => unreachable!("iterator source changed kind"),
            },
            IterKind::Map { index, len } => {
                let entry = match self.heap().get(source) {
                    HeapValue::Map(entries) => {
                        if entries.len() != len {
                            return Err(EcoString::from("container mutated during iteration"));
                        }
                        if index >= len {
                            return Ok(None);
                        }
                        entries[index]
                    }
                    _ => unreachable!("iterator source changed kind"),
                };
                let pair = self.heap_mut().alloc(HeapValue::Tuple(vec![entry.0, entry.1]));
                (pair, IterKind::Map { index: index + 1, len })
            }
            IterKind::Str { byte } => {
                let ch = match self.heap().get(source) {
                    HeapValue::Str(s) => s[byte..].chars().next().map(|c| (c, c.len_utf8())),
                    _ => unreachable!("iterator source changed kind"),
                };
                match ch {
                    None => return Ok(None),
                    Some((c, width)) => {
                        let item = self.heap_mut().alloc_str(String::from(c));
                        (item, IterKind::Str { byte: byte + width })
                    }
                }
            }
            IterKind::Range { current } => {
                let (end, step) = match self.heap().get(source) {
                    HeapValue::Range { end, step, .. } => (*end, *step),
                    _ => unreachable!("iterator source changed kind"),
                };
                let exhausted = if step > 0 { current >= end } else { current <= end };
                if exhausted {
                    return Ok(None);
                }
                let item = self.heap_mut().alloc_int(current);
                (item, IterKind::Range {
                    current: current.saturating_add(step),
                })
            }
        };

        match self.heap_mut().get_mut(iter) {
            HeapValue::Iter(it) => it.kind = next_kind,
            _ => unreachable!("iterator vanished mid-instruction"),
        }
        Ok(Some(item))
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Invoke a callable: script functions push a frame, natives run
    /// immediately. `dst` is the caller register that receives the result.
    pub(super) fn call_value(
        &mut self,
        callee: ValueRef,
        this: ValueRef,
        args: &[ValueRef],
        dst: u32,
    ) -> OpResult<()> {
        match self.heap().get(callee) {
            HeapValue::Func(func) => {
                let arity = func.arity as usize;
                if args.len() != arity {
                    return Err(EcoString::from(format!(
                        "expected {arity} argument(s), found {}",
                        args.len()
                    )));
                }
                if self.frames.len() >= self.options.max_call_depth {
                    return Err(EcoString::from("call stack overflow"));
                }
                let func = func.clone();
                let mut registers = vec![NULL; arity + func.body_len as usize];
                registers[..arity].copy_from_slice(args);
                let regs = self.heap.alloc(HeapValue::Frame(registers));
                self.frames.push(Frame {
                    regs,
                    module: func.module.clone(),
                    body: Body::Slice {
                        offset: func.body_offset,
                        len: func.body_len,
                    },
                    ip: 0,
                    arity: func.arity,
                    this,
                    func: callee,
                    module_regs: func.module_regs,
                    handlers: Vec::new(),
                    ret_reg: dst,
                });
                Ok(())
            }
            HeapValue::Native(native) => {
                let func = native.func.clone();
                let result = func(&mut self.heap, args)?;
                let caller_regs = self
                    .frames
                    .last()
                    .expect("frame stack is never empty")
                    .regs;
                self.heap.frame_set_reg(caller_regs, dst, result);
                Ok(())
            }
            other => Err(EcoString::from(format!(
                "{} is not callable",
                other.tag().name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    /// Resolution order: host native registry, module cache, then script
    /// files when `import_files` is enabled.
    pub(super) fn import(&mut self, name: &EcoString) -> OpResult<ValueRef> {
        if let Some(func) = self.natives.get(name) {
            let native = crate::value::Native {
                name: name.clone(),
                func: func.clone(),
            };
            return Ok(self.heap.alloc(HeapValue::Native(native)));
        }

        match self.modules.get(name) {
            Some(ModuleEntry::Loaded(value)) => return Ok(*value),
            Some(ModuleEntry::Loading) => {
                return Err(EcoString::from(format!("circular import of {name:?}")))
            }
            None => {}
        }

        if !self.options.import_files {
            return Err(EcoString::from(format!("unknown import {name:?}")));
        }

        let source = std::fs::read_to_string(name.as_str())
            .map_err(|e| EcoString::from(format!("cannot read {name:?}: {e}")))?;
        let arena = bumpalo::Bump::new();
        let stmts = crate::syntax::parse(&arena, &source)
            .map_err(|e| EcoString::from(format!("parse error in {name:?}: {e}")))?;
        let module = crate::compiler::Compiler::compile(name, &source, stmts)
            .map_err(|e| EcoString::from(format!("compile error in {name:?}: {e}")))?;

        self.modules.insert(name.clone(), ModuleEntry::Loading);
        let result = self.run_module(Rc::new(module));
        match result {
            Ok(value) => {
                self.modules.insert(name.clone(), ModuleEntry::Loaded(value));
                Ok(value)
            }
            Err(e) => {
                self.modules.remove(name.as_str());
                Err(EcoString::from(format!("error in {name:?}: {}", e.message)))
            }
        }
    }
}
