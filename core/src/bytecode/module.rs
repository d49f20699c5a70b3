//! The compiled module: instruction arrays, operand pools, debug line map,
//! plus the structural validator and the assembly-style dump used by
//! `debug:dump`.

use core::fmt;

use ecow::EcoString;
use smallvec::SmallVec;

use super::{Data, Op, Ref};
use crate::errors::ModuleFormatError;
use crate::value::TypeTag;

/// Parallel instruction arrays. `ops[i]` decides how `data[i]` is decoded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Code {
    pub ops: Vec<Op>,
    pub data: Vec<Data>,
}

impl Code {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Source mapping for traceback rendering. `lines` holds
/// `(instruction_index, source_byte_offset)` pairs sorted by instruction
/// index, populated only for opcodes with [`Op::needs_debug_info`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugInfo {
    pub path: EcoString,
    pub source: EcoString,
    pub lines: Vec<(u32, u32)>,
}

/// One compiled module. All arrays are immutable after construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bytecode {
    pub code: Code,
    /// 32-bit word pool for variable-length operands.
    pub extra: Vec<u32>,
    /// Top-level body: instruction indices in execution order.
    pub main: Vec<u32>,
    /// Contiguous UTF-8 buffer; string literals are `{offset, len}` slices.
    pub strings: Vec<u8>,
    pub debug_info: DebugInfo,
}

impl Bytecode {
    /// Decode a string-pool slice.
    pub fn string(&self, offset: u32, len: u32) -> &str {
        let bytes = &self.strings[offset as usize..(offset + len) as usize];
        core::str::from_utf8(bytes).expect("string pool holds invalid UTF-8")
    }

    /// Source byte offset recorded for an instruction, if any.
    pub fn line_for(&self, inst: u32) -> Option<u32> {
        self.debug_info
            .lines
            .binary_search_by_key(&inst, |entry| entry.0)
            .ok()
            .map(|i| self.debug_info.lines[i].1)
    }

    fn extra_slice(&self, offset: u32, len: u32) -> Result<&[u32], ModuleFormatError> {
        self.extra
            .get(offset as usize..(offset as usize + len as usize))
            .ok_or(ModuleFormatError::Malformed("extra slice out of bounds"))
    }

    /// Structural validation of a module, run on every loaded module file:
    ///
    /// 1. every register operand names a parameter or an earlier instruction
    ///    of its body;
    /// 2. jump targets stay inside their body;
    /// 3. every faulting opcode has a debug line entry;
    /// 4. string slices are in bounds and valid UTF-8.
    pub fn validate(&self) -> Result<(), ModuleFormatError> {
        // Bodies to visit: (instruction indices, parameter count).
        let mut pending: Vec<(Vec<u32>, u32)> = vec![(self.main.clone(), 0)];

        while let Some((body, params)) = pending.pop() {
            for (pos, &inst) in body.iter().enumerate() {
                let inst = inst as usize;
                if inst >= self.code.len() {
                    return Err(ModuleFormatError::Malformed(
                        "body references instruction out of bounds",
                    ));
                }
                let op = self.code.ops[inst];
                let data = self.code.data[inst];

                let mut regs: SmallVec<[Ref; 8]> = SmallVec::new();
                self.collect_operands(op, data, &mut regs, &mut pending)?;
                for reg in regs {
                    if reg >= params + pos as u32 {
                        return Err(ModuleFormatError::Malformed(
                            "operand references a later instruction",
                        ));
                    }
                    // Registers of result-less instructions must never be read.
                    if reg >= params {
                        let defining = body[(reg - params) as usize] as usize;
                        if !self.code.ops[defining].has_result() {
                            return Err(ModuleFormatError::Malformed(
                                "operand reads a result-less register",
                            ));
                        }
                    }
                }

                if let Some(offset) = jump_offset(op, data) {
                    let target = pos as i64 + offset as i64;
                    if target < 0 || target >= body.len() as i64 {
                        return Err(ModuleFormatError::Malformed("jump target out of body"));
                    }
                }
            }
        }

        // Invariant: faulting opcodes carry a source offset.
        for (inst, &op) in self.code.ops.iter().enumerate() {
            if op.needs_debug_info() && self.line_for(inst as u32).is_none() {
                return Err(ModuleFormatError::Malformed(
                    "faulting opcode without debug line entry",
                ));
            }
        }

        Ok(())
    }

    fn check_string(&self, offset: u32, len: u32) -> Result<(), ModuleFormatError> {
        let bytes = self
            .strings
            .get(offset as usize..(offset as usize + len as usize))
            .ok_or(ModuleFormatError::Malformed("string slice out of bounds"))?;
        core::str::from_utf8(bytes)
            .map_err(|_| ModuleFormatError::Malformed("string slice is not UTF-8"))?;
        Ok(())
    }

    /// Register operands of one instruction; also queues nested function
    /// bodies discovered in `build_func` / `build_func_capture`.
    fn collect_operands(
        &self,
        op: Op,
        data: Data,
        regs: &mut SmallVec<[Ref; 8]>,
        pending: &mut Vec<(Vec<u32>, u32)>,
    ) -> Result<(), ModuleFormatError> {
        match op {
            // un-operand registers
            Op::Discard
            | Op::CopyUn
            | Op::BuildError
            | Op::UnwrapError
            | Op::Ret
            | Op::Throw
            | Op::Negate
            | Op::BoolNot
            | Op::BitNot
            | Op::IterInit
            | Op::CallZero => regs.push(data.as_un()),

            // bin with both sides registers
            Op::Copy
            | Op::Move
            | Op::DivFloor
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
            | Op::BitXor
            | Op::Equal
            | Op::NotEqual
            | Op::LessThan
            | Op::LessThanEqual
            | Op::GreaterThan
            | Op::GreaterThanEqual
            | Op::In
            | Op::Append
            | Op::Get
            | Op::GetOrNull
            | Op::CallOne
            | Op::ThisCallZero
            | Op::BuildRange => {
                let (lhs, rhs) = data.as_bin();
                regs.push(lhs);
                regs.push(rhs);
            }

            // bin whose rhs is a raw count
            Op::CheckLen | Op::AssertLen => regs.push(data.as_bin().0),

            Op::As | Op::Is => {
                let (operand, ty) = data.as_bin_ty();
                if TypeTag::try_from_u8(ty as u8).is_none() {
                    return Err(ModuleFormatError::Malformed("invalid type tag"));
                }
                regs.push(operand);
            }

            Op::JumpIfTrue
            | Op::JumpIfFalse
            | Op::JumpIfNull
            | Op::UnwrapErrorOrJump
            | Op::PushErrHandler
            | Op::IterNext => regs.push(data.as_jump_condition().0),

            Op::BuildTuple | Op::BuildList | Op::BuildMap | Op::Call | Op::ThisCall => {
                let (offset, len) = data.as_extra();
                regs.extend_from_slice(self.extra_slice(offset, len)?);
            }

            Op::BuildTagged | Op::UnwrapTagged | Op::UnwrapTaggedOrNull => {
                let (offset, len) = data.as_extra();
                let words = self.extra_slice(offset, len)?;
                if words.len() != 3 {
                    return Err(ModuleFormatError::Malformed("tagged operand needs 3 words"));
                }
                self.check_string(words[0], words[1])?;
                regs.push(words[2]);
            }

            Op::Set | Op::BuildRangeStep => {
                let (start, offset) = data.as_range();
                let words = self.extra_slice(offset, 2)?;
                regs.push(start);
                regs.push(words[0]);
                regs.push(words[1]);
            }

            Op::BuildFunc | Op::BuildFuncCapture => {
                let (offset, len) = data.as_extra();
                let words = self.extra_slice(offset, len)?;
                let (arity, caps, body) = match op {
                    Op::BuildFunc => {
                        let (&arity, body) = words
                            .split_first()
                            .ok_or(ModuleFormatError::Malformed("empty function operand"))?;
                        (arity, &[][..], body)
                    }
                    _ => {
                        if words.len() < 2 {
                            return Err(ModuleFormatError::Malformed("empty function operand"));
                        }
                        let arity = words[0];
                        let cap_len = words[1] as usize;
                        if words.len() < 2 + cap_len {
                            return Err(ModuleFormatError::Malformed("capture list out of bounds"));
                        }
                        (arity, &words[2..2 + cap_len], &words[2 + cap_len..])
                    }
                };
                regs.extend_from_slice(caps);
                pending.push((body.to_vec(), arity));
            }

            Op::Str | Op::Import | Op::BuildTaggedNull => {
                let (offset, len) = data.as_str();
                self.check_string(offset, len)?;
            }

            // slot/index operands are not registers of this body
            Op::LoadGlobal | Op::LoadCapture => {}

            Op::Nop
            | Op::Primitive
            | Op::Int
            | Op::Num
            | Op::BuildErrorNull
            | Op::LoadThis
            | Op::PopErrHandler
            | Op::Jump
            | Op::RetNull => {}
        }
        Ok(())
    }

    /// Decode one instruction's operands for the dump.
    fn fmt_operands(&self, op: Op, data: Data) -> String {
        fn refs(words: &[u32]) -> String {
            let items: Vec<String> = words.iter().map(|r| format!("r{r}")).collect();
            format!("[{}]", items.join(", "))
        }

        match op {
            Op::Nop | Op::BuildErrorNull | Op::LoadThis | Op::PopErrHandler | Op::RetNull => {
                String::new()
            }
            Op::Primitive => format!("{:?}", data.as_primitive()).to_lowercase(),
            Op::Int => format!("{}", data.as_int()),
            Op::Num => format!("{:?}", data.as_num()),
            Op::Str | Op::Import | Op::BuildTaggedNull => {
                let (offset, len) = data.as_str();
                format!("{:?}", self.string(offset, len))
            }
            Op::Discard
            | Op::CopyUn
            | Op::BuildError
            | Op::UnwrapError
            | Op::Ret
            | Op::Throw
            | Op::Negate
            | Op::BoolNot
            | Op::BitNot
            | Op::IterInit
            | Op::CallZero => format!("r{}", data.as_un()),
            Op::LoadGlobal => format!("global {}", data.as_un()),
            Op::LoadCapture => format!("capture {}", data.as_un()),
            Op::CheckLen | Op::AssertLen => {
                let (operand, len) = data.as_bin();
                format!("r{operand}, len {len}")
            }
            Op::As | Op::Is => {
                let (operand, ty) = data.as_bin_ty();
                format!("r{operand}, {}", ty.name())
            }
            Op::Jump => format!("{:+}", data.as_jump()),
            Op::JumpIfTrue
            | Op::JumpIfFalse
            | Op::JumpIfNull
            | Op::UnwrapErrorOrJump
            | Op::PushErrHandler
            | Op::IterNext => {
                let (operand, offset) = data.as_jump_condition();
                format!("r{operand}, {offset:+}")
            }
            Op::BuildTuple | Op::BuildList | Op::BuildMap | Op::Call | Op::ThisCall => {
                let (offset, len) = data.as_extra();
                match self.extra_slice(offset, len) {
                    Ok(words) => refs(words),
                    Err(_) => "<bad extra>".into(),
                }
            }
            Op::BuildTagged | Op::UnwrapTagged | Op::UnwrapTaggedOrNull => {
                let (offset, len) = data.as_extra();
                match self.extra_slice(offset, len) {
                    Ok(words) if words.len() == 3 => {
                        format!("{:?}, r{}", self.string(words[0], words[1]), words[2])
                    }
                    _ => "<bad extra>".into(),
                }
            }
            Op::Set | Op::BuildRangeStep => {
                let (start, offset) = data.as_range();
                match self.extra_slice(offset, 2) {
                    Ok(words) => format!("r{start}, r{}, r{}", words[0], words[1]),
                    Err(_) => "<bad extra>".into(),
                }
            }
            Op::BuildFunc | Op::BuildFuncCapture => {
                let (offset, len) = data.as_extra();
                match self.extra_slice(offset, len) {
                    Ok(words) if !words.is_empty() => {
                        if op == Op::BuildFunc {
                            format!("arity {}, body {:?}", words[0], &words[1..])
                        } else {
                            let cap_len = words[1] as usize;
                            format!(
                                "arity {}, captures {}, body {:?}",
                                words[0],
                                refs(&words[2..2 + cap_len]),
                                &words[2 + cap_len..]
                            )
                        }
                    }
                    _ => "<bad extra>".into(),
                }
            }
            Op::Copy
            | Op::Move
            | Op::DivFloor
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
            | Op::BitXor
            | Op::Equal
            | Op::NotEqual
            | Op::LessThan
            | Op::LessThanEqual
            | Op::GreaterThan
            | Op::GreaterThanEqual
            | Op::In
            | Op::Append
            | Op::Get
            | Op::GetOrNull
            | Op::CallOne
            | Op::ThisCallZero
            | Op::BuildRange => {
                let (lhs, rhs) = data.as_bin();
                format!("r{lhs}, r{rhs}")
            }
        }
    }
}

impl fmt::Display for Bytecode {
    /// Assembly-style dump: the main body, then every instruction.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.debug_info.path.is_empty() {
            writeln!(f, "module {}", self.debug_info.path)?;
        }
        writeln!(f, "main = {:?}", self.main)?;
        for (addr, (&op, &data)) in self.code.ops.iter().zip(&self.code.data).enumerate() {
            writeln!(f, "  {:4}  {:<22}{}", addr, op.name(), self.fmt_operands(op, data))?;
        }
        Ok(())
    }
}

fn jump_offset(op: Op, data: Data) -> Option<i32> {
    match op {
        Op::Jump => Some(data.as_jump()),
        Op::JumpIfTrue
        | Op::JumpIfFalse
        | Op::JumpIfNull
        | Op::UnwrapErrorOrJump
        | Op::PushErrHandler
        | Op::IterNext => Some(data.as_jump_condition().1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(ops: Vec<Op>, data: Vec<Data>, main: Vec<u32>) -> Bytecode {
        Bytecode {
            code: Code { ops, data },
            main,
            ..Bytecode::default()
        }
    }

    #[test]
    fn validate_accepts_straight_line_code() {
        let m = module(
            vec![Op::Int, Op::Int, Op::Ret],
            vec![Data::int(1), Data::int(2), Data::un(1)],
            vec![0, 1, 2],
        );
        assert_eq!(m.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_forward_operand() {
        // `ret r1` at position 0 references its own (future) register.
        let m = module(
            vec![Op::Ret, Op::Int],
            vec![Data::un(1), Data::int(2)],
            vec![0, 1],
        );
        assert!(matches!(m.validate(), Err(ModuleFormatError::Malformed(_))));
    }

    #[test]
    fn validate_rejects_jump_out_of_body() {
        let m = module(vec![Op::Jump], vec![Data::jump(5)], vec![0]);
        assert!(matches!(m.validate(), Err(ModuleFormatError::Malformed(_))));
    }

    #[test]
    fn validate_requires_debug_entries_for_faulting_ops() {
        let mut m = module(
            vec![Op::Int, Op::Int, Op::Add, Op::Ret],
            vec![Data::int(1), Data::int(2), Data::bin(0, 1), Data::un(2)],
            vec![0, 1, 2, 3],
        );
        assert!(matches!(m.validate(), Err(ModuleFormatError::Malformed(_))));
        m.debug_info.lines.push((2, 0));
        assert_eq!(m.validate(), Ok(()));
    }

    #[test]
    fn validate_descends_into_function_bodies() {
        // build_func with a body whose single instruction reads register 2:
        // the function has arity 1, so r2 is a forward reference.
        let mut m = module(
            vec![Op::BuildFunc, Op::Ret, Op::Ret],
            vec![Data::extra(0, 2), Data::un(2), Data::un(0)],
            vec![0, 2],
        );
        m.extra = vec![1, 1];
        assert!(matches!(m.validate(), Err(ModuleFormatError::Malformed(_))));

        // Returning the parameter instead is fine.
        m.code.data[1] = Data::un(0);
        assert_eq!(m.validate(), Ok(()));
    }

    #[test]
    fn dump_uses_normative_names() {
        let mut m = module(
            vec![Op::Int, Op::Int, Op::Add, Op::Ret],
            vec![Data::int(40), Data::int(2), Data::bin(0, 1), Data::un(2)],
            vec![0, 1, 2, 3],
        );
        m.debug_info.lines.push((2, 4));
        let dump = m.to_string();
        assert!(dump.contains("add"));
        assert!(dump.contains("r0, r1"));
        assert!(dump.contains("main = [0, 1, 2, 3]"));
    }
}
