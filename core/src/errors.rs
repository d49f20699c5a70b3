//! Error types shared across the compilation pipeline and the VM.
//!
//! Three kinds of failures reach the embedding driver:
//!
//! - [`ParseError`]: the tokenizer or parser rejected the source; reported
//!   with the byte offset of the offending token.
//! - [`CompileError`]: the compiler accumulated one or more diagnostics;
//!   the first diagnostic aborts lowering but the whole list is preserved so
//!   the driver can render them together.
//! - [`RuntimeError`]: an unhandled raise unwound every frame; carries a
//!   traceback with one entry per live frame, resolved through each module's
//!   debug line map.

use ecow::EcoString;
use thiserror::Error;

/// One compiler diagnostic: a message anchored at a source byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: EcoString,
    pub offset: u32,
}

/// One traceback entry: the module path and the source byte offset of the
/// faulting instruction in that frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub path: EcoString,
    pub offset: u32,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: EcoString,
    pub offset: u32,
}

impl ParseError {
    pub fn new(message: impl Into<EcoString>, offset: u32) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

#[derive(Debug, Error)]
#[error("compilation failed with {} error(s)", diagnostics.len())]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: EcoString,
    /// Innermost frame first.
    pub traceback: Vec<TraceEntry>,
}

/// Failures while loading a module file in the on-disk format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleFormatError {
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported module version {0}")]
    BadVersion(u8),
    #[error("truncated module file")]
    Truncated,
    #[error("malformed bytecode: {0}")]
    Malformed(&'static str),
}

/// Any failure the embedding API can surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    ModuleFormat(#[from] ModuleFormatError),
}

/// Resolve a byte offset to a 1-based (line, column) pair.
///
/// Columns count bytes within the line, which is what the renderer needs to
/// place a caret under ASCII-heavy source.
pub fn line_col(source: &str, offset: u32) -> (u32, u32) {
    let offset = (offset as usize).min(source.len());
    let mut line = 1u32;
    let mut col = 1u32;
    for b in source.as_bytes()[..offset].iter() {
        if *b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_from_one() {
        let src = "let x = 1;\nlet y = 2;";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 4), (1, 5));
        assert_eq!(line_col(src, 11), (2, 1));
        assert_eq!(line_col(src, 15), (2, 5));
    }

    #[test]
    fn line_col_clamps_past_end() {
        assert_eq!(line_col("ab", 100), (1, 3));
    }
}
