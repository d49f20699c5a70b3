//! Runtime values.
//!
//! Every value lives on the [`crate::gc::Heap`] and is addressed by a
//! [`ValueRef`] handle; aggregate payloads hold handles, never direct
//! references, so the collector can trace them uniformly. Each kind maps to
//! one [`TypeTag`] byte, which is exactly what the compiler packs into
//! `bin_ty` operands for `as`/`is`.
//!
//! The numeric kernel ([`arith_binary`], [`arith_unary`]) is shared between
//! the VM and the compiler's constant folder, so folded arithmetic cannot
//! drift from executed arithmetic.

use std::cmp::Ordering;
use std::rc::Rc;

use ecow::EcoString;

use crate::bytecode::{Bytecode, Op};
use crate::gc::{Heap, ValueRef};

/// Host callable: receives the heap and argument handles, returns a result
/// handle or an error message the VM raises.
pub type NativeFn = Rc<dyn Fn(&mut Heap, &[ValueRef]) -> Result<ValueRef, EcoString>>;

// ============================================================================
// Type tags
// ============================================================================

/// One byte per value kind; the `as`/`is` operand encoding. Natives share
/// the `func` tag with script functions.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeTag {
    Null = 0,
    Bool,
    Int,
    Num,
    Str,
    Tuple,
    List,
    Map,
    Range,
    Error,
    Tagged,
    Func,
    Iter,
    Frame,
}

impl TypeTag {
    pub const fn name(self) -> &'static str {
        match self {
            TypeTag::Null => "null",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Num => "num",
            TypeTag::Str => "str",
            TypeTag::Tuple => "tuple",
            TypeTag::List => "list",
            TypeTag::Map => "map",
            TypeTag::Range => "range",
            TypeTag::Error => "error",
            TypeTag::Tagged => "tagged",
            TypeTag::Func => "func",
            TypeTag::Iter => "iter",
            TypeTag::Frame => "frame",
        }
    }

    /// Parse a source-level type name (`x is error`, `x as int`).
    pub fn from_name(name: &str) -> Option<TypeTag> {
        Some(match name {
            "null" => TypeTag::Null,
            "bool" => TypeTag::Bool,
            "int" => TypeTag::Int,
            "num" => TypeTag::Num,
            "str" => TypeTag::Str,
            "tuple" => TypeTag::Tuple,
            "list" => TypeTag::List,
            "map" => TypeTag::Map,
            "range" => TypeTag::Range,
            "error" => TypeTag::Error,
            "tagged" => TypeTag::Tagged,
            "func" => TypeTag::Func,
            "iter" => TypeTag::Iter,
            "frame" => TypeTag::Frame,
            _ => return None,
        })
    }

    pub fn try_from_u8(byte: u8) -> Option<TypeTag> {
        if byte <= TypeTag::Frame as u8 {
            Some(TypeTag::from_u8(byte))
        } else {
            None
        }
    }

    pub fn from_u8(byte: u8) -> TypeTag {
        match byte {
            1 => TypeTag::Bool,
            2 => TypeTag::Int,
            3 => TypeTag::Num,
            4 => TypeTag::Str,
            5 => TypeTag::Tuple,
            6 => TypeTag::List,
            7 => TypeTag::Map,
            8 => TypeTag::Range,
            9 => TypeTag::Error,
            10 => TypeTag::Tagged,
            11 => TypeTag::Func,
            12 => TypeTag::Iter,
            13 => TypeTag::Frame,
            _ => TypeTag::Null,
        }
    }
}

// ============================================================================
// Value kinds
// ============================================================================

/// A script function value. `body` is a slice of the owning module's extra
/// pool holding instruction indices; captures are resolved handles copied at
/// the `build_func_capture` site.
#[derive(Clone)]
pub struct Func {
    pub module: Rc<Bytecode>,
    pub body_offset: u32,
    pub body_len: u32,
    pub arity: u32,
    pub captures: Vec<ValueRef>,
    /// Register file of the defining module's frame, for `load_global`.
    pub module_regs: ValueRef,
}

impl Func {
    pub fn body<'m>(&self, module: &'m Bytecode) -> &'m [u32] {
        &module.extra[self.body_offset as usize..(self.body_offset + self.body_len) as usize]
    }
}

/// A registered host callable, reified as a callable value.
#[derive(Clone)]
pub struct Native {
    pub name: EcoString,
    pub func: NativeFn,
}

/// Iterator state; `source` keeps the underlying container alive.
#[derive(Clone)]
pub struct Iter {
    pub source: ValueRef,
    pub kind: IterKind,
}

#[derive(Clone)]
pub enum IterKind {
    /// Tuple or list; `len` snapshots the length for mutation detection.
    Seq { index: usize, len: usize },
    /// Map entries, yielded as `(key, value)` tuples.
    Map { index: usize, len: usize },
    /// String characters; the cursor is a byte offset.
    Str { byte: usize },
    Range { current: i64 },
}

#[derive(Clone)]
pub enum HeapValue {
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(EcoString),
    Tuple(Vec<ValueRef>),
    List(Vec<ValueRef>),
    /// Insertion-ordered entries; duplicate keys resolve to the last write.
    Map(Vec<(ValueRef, ValueRef)>),
    Range { start: i64, end: i64, step: i64 },
    Error(ValueRef),
    /// `value` is the null handle for payload-less tags.
    Tagged { name: EcoString, value: ValueRef },
    Func(Func),
    Native(Native),
    Iter(Iter),
    /// Reified register file; roots REPL-resident bindings uniformly.
    Frame(Vec<ValueRef>),
}

impl HeapValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            HeapValue::Null => TypeTag::Null,
            HeapValue::Bool(_) => TypeTag::Bool,
            HeapValue::Int(_) => TypeTag::Int,
            HeapValue::Num(_) => TypeTag::Num,
            HeapValue::Str(_) => TypeTag::Str,
            HeapValue::Tuple(_) => TypeTag::Tuple,
            HeapValue::List(_) => TypeTag::List,
            HeapValue::Map(_) => TypeTag::Map,
            HeapValue::Range { .. } => TypeTag::Range,
            HeapValue::Error(_) => TypeTag::Error,
            HeapValue::Tagged { .. } => TypeTag::Tagged,
            HeapValue::Func(_) | HeapValue::Native(_) => TypeTag::Func,
            HeapValue::Iter(_) => TypeTag::Iter,
            HeapValue::Frame(_) => TypeTag::Frame,
        }
    }

    /// Rough payload size for the collector's allocation accounting.
    pub fn heap_bytes(&self) -> usize {
        let payload = match self {
            HeapValue::Str(s) => s.len(),
            HeapValue::Tuple(v) | HeapValue::List(v) | HeapValue::Frame(v) => v.len() * 4,
            HeapValue::Map(entries) => entries.len() * 8,
            HeapValue::Func(f) => f.captures.len() * 4,
            _ => 0,
        };
        core::mem::size_of::<HeapValue>() + payload
    }
}

// ============================================================================
// Numeric kernel (shared by VM and constant folder)
// ============================================================================

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Arith {
    Int(i64),
    Num(f64),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArithError {
    Overflow,
    DivideByZero,
    IntsRequired,
    NegativeShift,
}

impl ArithError {
    pub const fn message(self) -> &'static str {
        match self {
            ArithError::Overflow => "integer overflow",
            ArithError::DivideByZero => "division by zero",
            ArithError::IntsRequired => "operation requires integers",
            ArithError::NegativeShift => "negative shift amount",
        }
    }
}

fn floor_div(a: i64, b: i64) -> Result<i64, ArithError> {
    if b == 0 {
        return Err(ArithError::DivideByZero);
    }
    let q = a.checked_div(b).ok_or(ArithError::Overflow)?;
    if a % b != 0 && (a < 0) != (b < 0) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn int_pow(base: i64, exp: i64) -> Result<Arith, ArithError> {
    if exp < 0 {
        // Negative exponents promote to num.
        return Ok(Arith::Num((base as f64).powi(exp.clamp(i32::MIN as i64, 0) as i32)));
    }
    let exp: u32 = exp.try_into().map_err(|_| ArithError::Overflow)?;
    base.checked_pow(exp).map(Arith::Int).ok_or(ArithError::Overflow)
}

fn shift(op: Op, a: i64, b: i64) -> Result<i64, ArithError> {
    if b < 0 {
        return Err(ArithError::NegativeShift);
    }
    Ok(match op {
        Op::LShift => {
            if b >= 64 {
                0
            } else {
                ((a as u64) << b) as i64
            }
        }
        _ => {
            // Arithmetic right shift; saturates to the sign.
            if b >= 64 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            }
        }
    })
}

/// Binary arithmetic and bitwise semantics:
///
/// - `int op int` is checked; overflow and division by zero are errors.
/// - any num operand promotes to IEEE-754 num arithmetic.
/// - `div` always yields num; `div_floor`, shifts and bit ops are int-only.
/// - `rem` follows the sign of the dividend for ints, fmod for nums.
/// - `pow` with a negative int exponent promotes to num.
pub fn arith_binary(op: Op, a: Arith, b: Arith) -> Result<Arith, ArithError> {
    use Arith::*;

    if let (Int(x), Int(y)) = (a, b) {
        return match op {
            Op::Add => x.checked_add(y).map(Int).ok_or(ArithError::Overflow),
            Op::Sub => x.checked_sub(y).map(Int).ok_or(ArithError::Overflow),
            Op::Mul => x.checked_mul(y).map(Int).ok_or(ArithError::Overflow),
            Op::Div => {
                if y == 0 {
                    Err(ArithError::DivideByZero)
                } else {
                    Ok(Num(x as f64 / y as f64))
                }
            }
            Op::DivFloor => floor_div(x, y).map(Int),
            Op::Rem => {
                if y == 0 {
                    Err(ArithError::DivideByZero)
                } else {
                    x.checked_rem(y).map(Int).ok_or(ArithError::Overflow)
                }
            }
            Op::Pow => int_pow(x, y),
            Op::LShift | Op::RShift => shift(op, x, y).map(Int),
            Op::BitAnd => Ok(Int(x & y)),
            Op::BitOr => Ok(Int(x | y)),
            Op::BitXor => Ok(Int(x ^ y)),
            _ => unreachable!("not an arithmetic opcode: {op:?}"),
        };
    }

    let (x, y) = (num_of(a), num_of(b));
    match op {
        Op::Add => Ok(Num(x + y)),
        Op::Sub => Ok(Num(x - y)),
        Op::Mul => Ok(Num(x * y)),
        Op::Div => Ok(Num(x / y)),
        Op::Rem => Ok(Num(x % y)),
        Op::Pow => Ok(Num(x.powf(y))),
        Op::DivFloor | Op::LShift | Op::RShift | Op::BitAnd | Op::BitOr | Op::BitXor => {
            Err(ArithError::IntsRequired)
        }
        _ => unreachable!("not an arithmetic opcode: {op:?}"),
    }
}

pub fn arith_negate(a: Arith) -> Result<Arith, ArithError> {
    match a {
        Arith::Int(x) => x.checked_neg().map(Arith::Int).ok_or(ArithError::Overflow),
        Arith::Num(x) => Ok(Arith::Num(-x)),
    }
}

fn num_of(a: Arith) -> f64 {
    match a {
        Arith::Int(x) => x as f64,
        Arith::Num(x) => x,
    }
}

/// Mixed int/num comparison used by both `equal` and the ordered opcodes.
pub fn number_cmp(a: Arith, b: Arith) -> Option<Ordering> {
    match (a, b) {
        (Arith::Int(x), Arith::Int(y)) => Some(x.cmp(&y)),
        _ => num_of(a).partial_cmp(&num_of(b)),
    }
}

// ============================================================================
// Structural equality, ordering, display
// ============================================================================

fn as_arith(value: &HeapValue) -> Option<Arith> {
    match value {
        HeapValue::Int(i) => Some(Arith::Int(*i)),
        HeapValue::Num(n) => Some(Arith::Num(*n)),
        _ => None,
    }
}

/// Deep structural equality. `int == num` compares mathematically;
/// functions, natives, iterators and frames compare by identity.
pub fn deep_equal(heap: &Heap, a: ValueRef, b: ValueRef) -> bool {
    if a == b {
        return true;
    }
    let (va, vb) = (heap.get(a), heap.get(b));
    if let (Some(x), Some(y)) = (as_arith(va), as_arith(vb)) {
        return number_cmp(x, y) == Some(Ordering::Equal);
    }
    match (va, vb) {
        (HeapValue::Null, HeapValue::Null) => true,
        (HeapValue::Bool(x), HeapValue::Bool(y)) => x == y,
        (HeapValue::Str(x), HeapValue::Str(y)) => x == y,
        (HeapValue::Tuple(x), HeapValue::Tuple(y)) | (HeapValue::List(x), HeapValue::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(&l, &r)| deep_equal(heap, l, r))
        }
        (HeapValue::Map(x), HeapValue::Map(y)) => {
            // Order-insensitive: same key set, equal values.
            x.len() == y.len()
                && x.iter().all(|&(k, v)| {
                    y.iter()
                        .find(|&&(k2, _)| deep_equal(heap, k, k2))
                        .is_some_and(|&(_, v2)| deep_equal(heap, v, v2))
                })
        }
        (
            HeapValue::Range { start, end, step },
            HeapValue::Range { start: s2, end: e2, step: t2 },
        ) => start == s2 && end == e2 && step == t2,
        (HeapValue::Error(x), HeapValue::Error(y)) => deep_equal(heap, *x, *y),
        (
            HeapValue::Tagged { name, value },
            HeapValue::Tagged { name: n2, value: v2 },
        ) => name == n2 && deep_equal(heap, *value, *v2),
        _ => false,
    }
}

/// Ordered comparison. `Err(())` means the kinds are incomparable (the VM
/// raises); `Ok(None)` means unordered (NaN), for which every ordered
/// opcode yields false.
pub fn compare(heap: &Heap, a: ValueRef, b: ValueRef) -> Result<Option<Ordering>, ()> {
    let (va, vb) = (heap.get(a), heap.get(b));
    if let (Some(x), Some(y)) = (as_arith(va), as_arith(vb)) {
        return Ok(number_cmp(x, y));
    }
    match (va, vb) {
        (HeapValue::Str(x), HeapValue::Str(y)) => Ok(Some(x.as_bytes().cmp(y.as_bytes()))),
        (HeapValue::Tuple(x), HeapValue::Tuple(y)) | (HeapValue::List(x), HeapValue::List(y))
            if x.len() == y.len() =>
        {
            for (&l, &r) in x.iter().zip(y) {
                match compare(heap, l, r)? {
                    Some(Ordering::Equal) => continue,
                    other => return Ok(other),
                }
            }
            Ok(Some(Ordering::Equal))
        }
        _ => Err(()),
    }
}

/// Length as the `len` native and `in` understand it.
pub fn length(heap: &Heap, v: ValueRef) -> Option<usize> {
    match heap.get(v) {
        HeapValue::Str(s) => Some(s.chars().count()),
        HeapValue::Tuple(items) | HeapValue::List(items) => Some(items.len()),
        HeapValue::Map(entries) => Some(entries.len()),
        HeapValue::Range { start, end, step } => {
            let span = *end as i128 - *start as i128;
            let step = *step as i128;
            if span == 0 || (span > 0) != (step > 0) {
                Some(0)
            } else {
                Some(((span.abs() + step.abs() - 1) / step.abs()) as usize)
            }
        }
        _ => None,
    }
}

fn write_display(heap: &Heap, v: ValueRef, out: &mut String, quote_strings: bool, depth: usize) {
    use core::fmt::Write;

    if depth > 32 {
        out.push_str("...");
        return;
    }
    match heap.get(v) {
        HeapValue::Null => out.push_str("null"),
        HeapValue::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        HeapValue::Int(i) => {
            let _ = write!(out, "{i}");
        }
        HeapValue::Num(n) => {
            let _ = write!(out, "{n:?}");
        }
        HeapValue::Str(s) => {
            if quote_strings {
                let _ = write!(out, "{s:?}");
            } else {
                out.push_str(s);
            }
        }
        HeapValue::Tuple(items) => {
            out.push('(');
            for (i, &item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_display(heap, item, out, true, depth + 1);
            }
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        HeapValue::List(items) => {
            out.push('[');
            for (i, &item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_display(heap, item, out, true, depth + 1);
            }
            out.push(']');
        }
        HeapValue::Map(entries) => {
            out.push('{');
            for (i, &(k, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_display(heap, k, out, true, depth + 1);
                out.push_str(": ");
                write_display(heap, val, out, true, depth + 1);
            }
            out.push('}');
        }
        HeapValue::Range { start, end, step } => {
            let _ = write!(out, "{start}:{end}");
            if *step != 1 {
                let _ = write!(out, ":{step}");
            }
        }
        HeapValue::Error(inner) => {
            out.push_str("error(");
            write_display(heap, *inner, out, true, depth + 1);
            out.push(')');
        }
        HeapValue::Tagged { name, value } => {
            let _ = write!(out, "@{name}");
            if !matches!(heap.get(*value), HeapValue::Null) {
                out.push('(');
                write_display(heap, *value, out, true, depth + 1);
                out.push(')');
            }
        }
        HeapValue::Func(f) => {
            let _ = write!(out, "fn({})", f.arity);
        }
        HeapValue::Native(n) => {
            let _ = write!(out, "fn({})", n.name);
        }
        HeapValue::Iter(_) => out.push_str("iter"),
        HeapValue::Frame(_) => out.push_str("frame"),
    }
}

/// Render a value for the REPL and error messages; strings are quoted.
pub fn display_value(heap: &Heap, v: ValueRef) -> String {
    let mut out = String::new();
    write_display(heap, v, &mut out, true, 0);
    out
}

/// Render a value for `as str`: a top-level string stays unquoted.
pub fn stringify(heap: &Heap, v: ValueRef) -> String {
    let mut out = String::new();
    write_display(heap, v, &mut out, false, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn arith_matches_spec_semantics() {
        use Arith::*;
        // div always yields num
        assert_eq!(arith_binary(Op::Div, Int(7), Int(2)), Ok(Num(3.5)));
        // floor division rounds toward negative infinity
        assert_eq!(arith_binary(Op::DivFloor, Int(-7), Int(2)), Ok(Int(-4)));
        assert_eq!(arith_binary(Op::DivFloor, Int(7), Int(-2)), Ok(Int(-4)));
        // rem follows the dividend's sign
        assert_eq!(arith_binary(Op::Rem, Int(-7), Int(2)), Ok(Int(-1)));
        // pow promotes on negative exponents
        assert_eq!(arith_binary(Op::Pow, Int(2), Int(-1)), Ok(Num(0.5)));
        assert_eq!(arith_binary(Op::Pow, Int(2), Int(10)), Ok(Int(1024)));
        // checked overflow
        assert_eq!(
            arith_binary(Op::Add, Int(i64::MAX), Int(1)),
            Err(ArithError::Overflow)
        );
        assert_eq!(
            arith_binary(Op::Div, Int(1), Int(0)),
            Err(ArithError::DivideByZero)
        );
        // num promotion
        assert_eq!(arith_binary(Op::Add, Int(1), Num(0.5)), Ok(Num(1.5)));
        // div_floor is integer-only
        assert_eq!(
            arith_binary(Op::DivFloor, Num(1.0), Num(2.0)),
            Err(ArithError::IntsRequired)
        );
    }

    #[test]
    fn shifts_saturate_and_reject_negative_counts() {
        use Arith::*;
        assert_eq!(arith_binary(Op::LShift, Int(1), Int(3)), Ok(Int(8)));
        assert_eq!(arith_binary(Op::LShift, Int(1), Int(64)), Ok(Int(0)));
        assert_eq!(arith_binary(Op::RShift, Int(-8), Int(1)), Ok(Int(-4)));
        assert_eq!(arith_binary(Op::RShift, Int(-8), Int(70)), Ok(Int(-1)));
        assert_eq!(
            arith_binary(Op::LShift, Int(1), Int(-1)),
            Err(ArithError::NegativeShift)
        );
    }

    #[test]
    fn equality_is_structural_and_cross_numeric() {
        let mut heap = Heap::new();
        let a = heap.alloc_int(3);
        let b = heap.alloc_num(3.0);
        assert!(deep_equal(&heap, a, b));

        let one = heap.alloc_int(1);
        let two = heap.alloc_int(2);
        let t1 = heap.alloc(HeapValue::Tuple(vec![one, two]));
        let one2 = heap.alloc_int(1);
        let two2 = heap.alloc_int(2);
        let t2 = heap.alloc(HeapValue::Tuple(vec![one2, two2]));
        assert!(deep_equal(&heap, t1, t2));

        let l = heap.alloc(HeapValue::List(vec![one, two]));
        assert!(!deep_equal(&heap, t1, l));
    }

    #[test]
    fn ordering_covers_numbers_strings_and_sequences() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("abc");
        let b = heap.alloc_str("abd");
        assert_eq!(compare(&heap, a, b), Ok(Some(Ordering::Less)));

        let x = heap.alloc_int(1);
        let y = heap.alloc_num(1.5);
        assert_eq!(compare(&heap, x, y), Ok(Some(Ordering::Less)));

        let t1 = heap.alloc(HeapValue::Tuple(vec![x, x]));
        let t2 = heap.alloc(HeapValue::Tuple(vec![x, y]));
        assert_eq!(compare(&heap, t1, t2), Ok(Some(Ordering::Less)));

        // Length mismatch is incomparable, not unequal-ordered.
        let t3 = heap.alloc(HeapValue::Tuple(vec![x]));
        assert_eq!(compare(&heap, t1, t3), Err(()));

        let nan = heap.alloc_num(f64::NAN);
        assert_eq!(compare(&heap, x, nan), Ok(None));
    }

    #[test]
    fn display_renders_aggregates() {
        let mut heap = Heap::new();
        let one = heap.alloc_int(1);
        let s = heap.alloc_str("hi");
        let t = heap.alloc(HeapValue::Tuple(vec![one, s]));
        assert_eq!(display_value(&heap, t), "(1, \"hi\")");
        assert_eq!(stringify(&heap, s), "hi");
        let r = heap.alloc(HeapValue::Range { start: 1, end: 4, step: 1 });
        assert_eq!(display_value(&heap, r), "1:4");
    }

    #[test]
    fn range_length_is_end_exclusive() {
        let mut heap = Heap::new();
        let r = heap.alloc(HeapValue::Range { start: 1, end: 4, step: 1 });
        assert_eq!(length(&heap, r), Some(3));
        let r2 = heap.alloc(HeapValue::Range { start: 0, end: 7, step: 2 });
        assert_eq!(length(&heap, r2), Some(4));
        let r3 = heap.alloc(HeapValue::Range { start: 4, end: 1, step: 1 });
        assert_eq!(length(&heap, r3), Some(0));
    }
}
