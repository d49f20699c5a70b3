//! Module file format: a little-endian binary image of a [`Bytecode`].
//!
//! Layout: 4-byte magic, version byte, then six u32 lengths (`main`,
//! `code.op`, `code.data`, `extra`, `strings`, `debug_info.lines`), then the
//! arrays verbatim. Nothing inside the arrays is individually versioned;
//! compatibility requires an exact version match.

use super::{Bytecode, Code, Data, DebugInfo, Op};
use crate::errors::ModuleFormatError;

const MAGIC: [u8; 4] = *b"TARN";
const VERSION: u8 = 1;

/// Serialize a module. The output is deterministic: serializing a module
/// read back from this format reproduces the input bytes exactly.
pub fn write_module(module: &Bytecode) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        5 + 6 * 4
            + module.main.len() * 4
            + module.code.ops.len()
            + module.code.data.len() * 8
            + module.extra.len() * 4
            + module.strings.len()
            + module.debug_info.lines.len() * 8,
    );

    out.extend_from_slice(&MAGIC);
    out.push(VERSION);

    for len in [
        module.main.len(),
        module.code.ops.len(),
        module.code.data.len(),
        module.extra.len(),
        module.strings.len(),
        module.debug_info.lines.len(),
    ] {
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }

    for word in &module.main {
        out.extend_from_slice(&word.to_le_bytes());
    }
    for op in &module.code.ops {
        out.push(*op as u8);
    }
    for data in &module.code.data {
        out.extend_from_slice(&data.bits().to_le_bytes());
    }
    for word in &module.extra {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(&module.strings);
    for (inst, offset) in &module.debug_info.lines {
        out.extend_from_slice(&inst.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
    }

    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ModuleFormatError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(ModuleFormatError::Truncated)?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ModuleFormatError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ModuleFormatError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ModuleFormatError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Deserialize a module image. The caller is expected to run
/// [`Bytecode::validate`] before executing the result.
pub fn read_module(bytes: &[u8]) -> Result<Bytecode, ModuleFormatError> {
    let mut r = Reader { bytes, pos: 0 };

    if r.take(4)? != MAGIC {
        return Err(ModuleFormatError::BadMagic);
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(ModuleFormatError::BadVersion(version));
    }

    let main_len = r.u32()? as usize;
    let ops_len = r.u32()? as usize;
    let data_len = r.u32()? as usize;
    let extra_len = r.u32()? as usize;
    let strings_len = r.u32()? as usize;
    let lines_len = r.u32()? as usize;

    if ops_len != data_len {
        return Err(ModuleFormatError::Malformed("op/data length mismatch"));
    }

    let mut main = Vec::with_capacity(main_len);
    for _ in 0..main_len {
        main.push(r.u32()?);
    }

    let mut ops = Vec::with_capacity(ops_len);
    for _ in 0..ops_len {
        let byte = r.u8()?;
        ops.push(Op::from_u8(byte).ok_or(ModuleFormatError::Malformed("invalid opcode"))?);
    }

    let mut data = Vec::with_capacity(data_len);
    for _ in 0..data_len {
        data.push(Data::from_bits(r.u64()?));
    }

    let mut extra = Vec::with_capacity(extra_len);
    for _ in 0..extra_len {
        extra.push(r.u32()?);
    }

    let strings = r.take(strings_len)?.to_vec();

    let mut lines = Vec::with_capacity(lines_len);
    for _ in 0..lines_len {
        let inst = r.u32()?;
        let offset = r.u32()?;
        lines.push((inst, offset));
    }

    if r.pos != bytes.len() {
        return Err(ModuleFormatError::Malformed("trailing bytes"));
    }

    Ok(Bytecode {
        code: Code { ops, data },
        extra,
        main,
        strings,
        debug_info: DebugInfo {
            lines,
            ..DebugInfo::default()
        },
    })
}

/// Whether a byte buffer looks like a module file rather than source text.
pub fn is_module_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Bytecode {
        let mut m = Bytecode {
            code: Code {
                ops: vec![Op::Int, Op::Int, Op::Add, Op::Ret],
                data: vec![Data::int(40), Data::int(2), Data::bin(0, 1), Data::un(2)],
            },
            extra: vec![7, 8, 9],
            main: vec![0, 1, 2, 3],
            strings: b"hello".to_vec(),
            ..Bytecode::default()
        };
        m.debug_info.lines.push((2, 4));
        m
    }

    #[test]
    fn write_read_round_trips_bitwise() {
        let module = sample();
        let image = write_module(&module);
        let reread = read_module(&image).unwrap();
        // Serializing again must reproduce the identical image.
        assert_eq!(write_module(&reread), image);
        assert_eq!(reread.main, module.main);
        assert_eq!(reread.code.ops, module.code.ops);
        assert_eq!(reread.strings, module.strings);
        assert_eq!(reread.debug_info.lines, module.debug_info.lines);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut image = write_module(&sample());
        assert!(matches!(
            read_module(b"nope"),
            Err(ModuleFormatError::BadMagic | ModuleFormatError::Truncated)
        ));
        image[4] = 99;
        assert_eq!(read_module(&image), Err(ModuleFormatError::BadVersion(99)));
    }

    #[test]
    fn rejects_truncation_and_trailing_bytes() {
        let image = write_module(&sample());
        assert_eq!(
            read_module(&image[..image.len() - 1]),
            Err(ModuleFormatError::Truncated)
        );
        let mut long = image.clone();
        long.push(0);
        assert!(matches!(
            read_module(&long),
            Err(ModuleFormatError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_invalid_opcode_byte() {
        let mut image = write_module(&sample());
        // First op byte lives after magic+version+6 lengths+main words.
        let op_at = 4 + 1 + 6 * 4 + 4 * 4;
        image[op_at] = 0xFF;
        assert_eq!(
            read_module(&image),
            Err(ModuleFormatError::Malformed("invalid opcode"))
        );
    }

    #[test]
    fn detects_module_images() {
        assert!(is_module_image(&write_module(&sample())));
        assert!(!is_module_image(b"let x = 1;"));
    }
}
