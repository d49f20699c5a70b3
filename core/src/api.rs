//! The embedding façade.
//!
//! [`Engine`] wires the front end, compiler and VM together for one-shot
//! compilation and execution. [`ReplSession`] keeps a persistent compiler and
//! VM pair and compiles one input at a time into the same module, appending
//! to the top-level body and re-entering the VM at the previous tail; a
//! failed increment leaves the module untouched.
//!
//! # Example
//!
//! ```ignore
//! use tarn_core::{Engine, EngineOptions};
//!
//! let mut engine = Engine::new(EngineOptions::default());
//! let value = engine.run_source("<inline>", "let x = 40; x + 2").unwrap();
//! assert_eq!(engine.display(value), "42");
//! ```

use std::rc::Rc;

use bumpalo::Bump;
use ecow::EcoString;

use crate::bytecode::Bytecode;
use crate::compiler::Compiler;
use crate::errors::Error;
use crate::gc::{Heap, ValueRef};
use crate::syntax;
use crate::value::display_value;
use crate::vm::{Vm, VmOptions};

#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    pub vm: VmOptions,
}

pub struct Engine {
    vm: Vm,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Engine {
            vm: Vm::new(options.vm),
        }
    }

    /// Register a host callable reachable via `native("name")`.
    pub fn register_native(
        &mut self,
        name: impl Into<EcoString>,
        func: impl Fn(&mut Heap, &[ValueRef]) -> Result<ValueRef, EcoString> + 'static,
    ) {
        self.vm.register_native(name, func);
    }

    /// Parse and compile a source text into a module.
    pub fn compile(&self, path: &str, source: &str) -> Result<Rc<Bytecode>, Error> {
        let arena = Bump::new();
        let stmts = syntax::parse(&arena, source)?;
        let module = Compiler::compile(path, source, stmts)?;
        Ok(Rc::new(module))
    }

    /// Execute a compiled module's top level.
    pub fn run(&mut self, module: Rc<Bytecode>) -> Result<ValueRef, Error> {
        Ok(self.vm.run_module(module)?)
    }

    /// Compile and execute in one step.
    pub fn run_source(&mut self, path: &str, source: &str) -> Result<ValueRef, Error> {
        let module = self.compile(path, source)?;
        self.run(module)
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Render a result value for display; strings come out quoted.
    pub fn display(&self, value: ValueRef) -> String {
        display_value(self.vm.heap(), value)
    }
}

/// One interactive session: a persistent module under incremental
/// compilation and a persistent base frame holding its globals.
pub struct ReplSession {
    compiler: Compiler,
    vm: Vm,
    /// Heap-reified register file of the module frame; roots REPL bindings
    /// across inputs.
    base_frame: ValueRef,
    /// Top-level instructions already executed.
    executed: usize,
}

impl ReplSession {
    pub fn new(options: EngineOptions) -> Self {
        let mut vm = Vm::new(options.vm);
        let base_frame = vm.new_base_frame();
        ReplSession {
            compiler: Compiler::new("<repl>"),
            vm,
            base_frame,
            executed: 0,
        }
    }

    pub fn register_native(
        &mut self,
        name: impl Into<EcoString>,
        func: impl Fn(&mut Heap, &[ValueRef]) -> Result<ValueRef, EcoString> + 'static,
    ) {
        self.vm.register_native(name, func);
    }

    /// Compile one input against the session module and run the new tail.
    /// Returns the rendered result value, or `None` when it was null.
    pub fn eval(&mut self, input: &str) -> Result<Option<String>, Error> {
        let arena = Bump::new();
        let stmts = syntax::parse(&arena, input)?;
        if stmts.is_empty() {
            return Ok(None);
        }
        self.compiler.push_source(input);
        self.compiler.compile_more(stmts)?;

        let module = Rc::new(self.compiler.snapshot());
        let start = self.executed;
        self.executed = self.compiler.main_len();
        let value = self
            .vm
            .run_incremental(module, self.base_frame, start)?;

        if matches!(self.vm.heap().get(value), crate::value::HeapValue::Null) {
            Ok(None)
        } else {
            Ok(Some(display_value(self.vm.heap(), value)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    #[test]
    fn engine_runs_source_end_to_end() {
        let mut engine = Engine::default();
        let value = engine.run_source("<test>", "let x = 40; x + 2").unwrap();
        assert_eq!(engine.display(value), "42");
    }

    #[test]
    fn engine_reports_parse_and_compile_errors() {
        let mut engine = Engine::default();
        assert!(matches!(
            engine.run_source("<test>", "let = ;"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            engine.run_source("<test>", "undefined_name"),
            Err(Error::Compile(_))
        ));
    }

    #[test]
    fn repl_keeps_bindings_between_inputs() {
        let mut repl = ReplSession::new(EngineOptions::default());
        assert_eq!(repl.eval("let x = 20").unwrap(), None);
        assert_eq!(repl.eval("let y = x + 2").unwrap(), None);
        assert_eq!(repl.eval("x * y").unwrap(), Some("440".to_string()));
    }

    #[test]
    fn repl_failed_increment_does_not_poison_the_module() {
        let mut repl = ReplSession::new(EngineOptions::default());
        assert_eq!(repl.eval("let x = 1").unwrap(), None);
        // Undefined variable: the increment must roll back completely.
        assert!(repl.eval("x + missing").is_err());
        // Redeclaration afterwards still reports correctly...
        assert!(repl.eval("let x = 2").is_err());
        // ...and the original binding still evaluates.
        assert_eq!(repl.eval("x").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn repl_functions_capture_session_globals() {
        let mut repl = ReplSession::new(EngineOptions::default());
        repl.eval("let n = 7").unwrap();
        repl.eval("let f = fn() n * 2").unwrap();
        assert_eq!(repl.eval("f()").unwrap(), Some("14".to_string()));
    }
}
