//! Tarn core: compiler and register-based virtual machine for a small
//! dynamically-typed, expression-oriented scripting language.
//!
//! The pipeline is `source → tokens → AST → bytecode → value`:
//!
//! - [`syntax`] tokenizes and parses source text into an arena-allocated AST.
//! - [`compiler`] lowers the AST to [`bytecode::Bytecode`], resolving scopes,
//!   computing captures, folding constants and patching jumps.
//! - [`vm`] executes bytecode against a garbage-collected heap ([`gc`]) of
//!   tagged values ([`value`]).
//! - [`api`] wraps the pieces into an embeddable engine and a REPL session.

pub mod api;
pub mod bytecode;
pub mod compiler;
pub mod errors;
pub mod gc;
pub mod syntax;
pub mod value;
pub mod vm;

pub use api::{Engine, EngineOptions, ReplSession};
pub use bytecode::{Bytecode, Data, Op};
pub use errors::{CompileError, Error, ModuleFormatError, ParseError, RuntimeError};
pub use gc::{Heap, ValueRef};
pub use value::{HeapValue, TypeTag};
pub use vm::{Vm, VmOptions};

/// Test utilities for enabling logging in tests
#[cfg(test)]
pub mod test_utils {
    /// Initialize tracing subscriber for tests with DEBUG level
    /// Call this at the start of tests where you want to see logging output
    pub fn init_test_logging() {
        use tracing_subscriber::{fmt, EnvFilter};

        // Try to initialize, ignore error if already initialized
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }
}
