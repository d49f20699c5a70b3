//! Compiler tests: emitted shapes, folding, scoping and diagnostics.

use bumpalo::Bump;

use super::Compiler;
use crate::bytecode::{Bytecode, Op};
use crate::errors::CompileError;
use crate::syntax;

fn compile(src: &str) -> Bytecode {
    try_compile(src).unwrap()
}

fn try_compile(src: &str) -> Result<Bytecode, CompileError> {
    let arena = Bump::new();
    let stmts = syntax::parse(&arena, src).expect("test source parses");
    Compiler::compile("<test>", src, stmts)
}

fn count_op(module: &Bytecode, op: Op) -> usize {
    module.code.ops.iter().filter(|&&o| o == op).count()
}

#[test]
fn compiled_modules_validate() {
    for src in [
        "let x = 1 + 2 * 3; x",
        "let f = fn(a, b) a + b; f(40, 2)",
        "let acc = []; for x in 1:4 acc.append(x); acc",
        "let r = try 10 / 0 catch |e| e; r is error",
        "let mk = fn(n) fn() n; let g = mk(7); g() + g()",
        "let (a, _, b) = (1, 2, 3); a + b",
        "let m = {a: 1}; m.a = m.a + 1; m",
        "match (3) { 1 => \"one\", let n => n, _ => null }",
        "let i = 0; while (i < 3) { i = i + 1 }; i",
    ] {
        let module = compile(src);
        module.validate().unwrap_or_else(|e| panic!("{src}: {e}"));
    }
}

// ----------------------------------------------------------------------
// Constant folding
// ----------------------------------------------------------------------

#[test]
fn arithmetic_folds_to_a_single_literal() {
    let module = compile("let x = 1 + 2 * 3; x");
    // One `int 7` and the final ret; no arithmetic survives.
    assert_eq!(count_op(&module, Op::Add), 0);
    assert_eq!(count_op(&module, Op::Mul), 0);
    let ints: Vec<i64> = module
        .code
        .ops
        .iter()
        .zip(&module.code.data)
        .filter(|(op, _)| **op == Op::Int)
        .map(|(_, data)| data.as_int())
        .collect();
    assert_eq!(ints, vec![7]);
}

#[test]
fn trapping_folds_fall_back_to_runtime_ops() {
    // Overflow and division by zero stay runtime operations, so a `catch`
    // around them still works.
    let module = compile("9223372036854775807 + 1");
    assert_eq!(count_op(&module, Op::Add), 1);
    let module = compile("1 // 0");
    assert_eq!(count_op(&module, Op::DivFloor), 1);
    // IEEE num arithmetic never traps and always folds.
    let module = compile("1.0 / 0.0");
    assert_eq!(count_op(&module, Op::Div), 0);
}

#[test]
fn comparison_folding() {
    let module = compile("1 < 2");
    assert_eq!(count_op(&module, Op::LessThan), 0);
    let module = compile("\"a\" == \"b\"");
    assert_eq!(count_op(&module, Op::Equal), 0);
}

#[test]
fn short_circuit_drops_the_decided_branch() {
    // `false and E` must not evaluate E at all: no call survives.
    let module = compile("let f = fn() 1; false and f()");
    assert_eq!(count_op(&module, Op::CallZero), 0);
    let module = compile("let f = fn() 1; true or f()");
    assert_eq!(count_op(&module, Op::CallZero), 0);
    // An undecided left side keeps the guarded call.
    let module = compile("let f = fn() true; f() and f()");
    assert_eq!(count_op(&module, Op::CallZero), 2);
    assert_eq!(count_op(&module, Op::JumpIfFalse), 1);
}

#[test]
fn constant_conditions_drop_untaken_branches() {
    let module = compile("if (true) 1 else 2");
    assert_eq!(count_op(&module, Op::JumpIfFalse), 0);
    let ints: Vec<i64> = module
        .code
        .ops
        .iter()
        .zip(&module.code.data)
        .filter(|(op, _)| **op == Op::Int)
        .map(|(_, data)| data.as_int())
        .collect();
    assert_eq!(ints, vec![1]);
}

// ----------------------------------------------------------------------
// Emitted shapes
// ----------------------------------------------------------------------

#[test]
fn calls_use_the_fast_paths() {
    let module = compile("let f = fn() 0; f()");
    assert_eq!(count_op(&module, Op::CallZero), 1);
    let module = compile("let f = fn(a) a; f(1)");
    assert_eq!(count_op(&module, Op::CallOne), 1);
    let module = compile("let f = fn(a, b) a; f(1, 2)");
    assert_eq!(count_op(&module, Op::Call), 1);
}

#[test]
fn non_capturing_functions_use_build_func() {
    let module = compile("fn(a, b) a + b");
    assert_eq!(count_op(&module, Op::BuildFunc), 1);
    assert_eq!(count_op(&module, Op::BuildFuncCapture), 0);
}

#[test]
fn nested_functions_capture_enclosing_locals() {
    let module = compile("let mk = fn(n) fn() n; mk");
    assert_eq!(count_op(&module, Op::BuildFuncCapture), 1);
    assert_eq!(count_op(&module, Op::LoadCapture), 1);
}

#[test]
fn module_bindings_read_through_load_global() {
    let module = compile("let x = 1; let f = fn() x; f");
    assert_eq!(count_op(&module, Op::LoadGlobal), 1);
    assert_eq!(count_op(&module, Op::BuildFuncCapture), 0);
}

#[test]
fn destructuring_let_asserts_length_and_discards_holes() {
    let module = compile("let (a, _, b) = (1, 2, 3); a + b");
    assert_eq!(count_op(&module, Op::AssertLen), 1);
    assert_eq!(count_op(&module, Op::Discard), 1);
    assert_eq!(count_op(&module, Op::Get), 3);
}

#[test]
fn match_sequences_check_length_against_a_duplicate() {
    let module = compile("match ((1, 2)) { (a, b) => a, _ => 0 }");
    assert_eq!(count_op(&module, Op::CheckLen), 1);
    assert_eq!(count_op(&module, Op::CopyUn), 1);
    assert_eq!(count_op(&module, Op::JumpIfNull), 1);
}

#[test]
fn catch_brackets_the_protected_expression() {
    let module = compile("1 / 0 catch |e| e");
    assert_eq!(count_op(&module, Op::PushErrHandler), 1);
    assert_eq!(count_op(&module, Op::PopErrHandler), 1);
    assert_eq!(count_op(&module, Op::UnwrapErrorOrJump), 1);
}

#[test]
fn try_emits_a_propagating_return() {
    let module = compile("let f = fn(x) try x; f");
    assert_eq!(count_op(&module, Op::UnwrapErrorOrJump), 1);
    // The function holds two returns: the propagating one and the normal one.
    assert_eq!(count_op(&module, Op::Ret), 3);
}

#[test]
fn for_loops_use_the_iterator_protocol() {
    let module = compile("for x in 1:4 x");
    assert_eq!(count_op(&module, Op::IterInit), 1);
    assert_eq!(count_op(&module, Op::IterNext), 1);
    assert_eq!(count_op(&module, Op::BuildRange), 1);
}

#[test]
fn method_append_lowers_to_the_append_opcode() {
    let module = compile("let l = []; l.append(1)");
    assert_eq!(count_op(&module, Op::Append), 1);
    assert_eq!(count_op(&module, Op::ThisCall), 0);
    // Other members go through get + this_call.
    let module = compile("let m = {f: 0}; m.f()");
    assert_eq!(count_op(&module, Op::ThisCallZero), 1);
}

#[test]
fn native_and_import_share_the_import_opcode() {
    let module = compile("native(\"print\")");
    assert_eq!(count_op(&module, Op::Import), 1);
    let module = compile("import(\"lib.tarn\")");
    assert_eq!(count_op(&module, Op::Import), 1);
}

#[test]
fn string_literals_are_pooled_once() {
    let module = compile("let a = \"hi\"; let b = \"hi\"; a == b");
    assert_eq!(module.strings, b"hi".to_vec());
}

#[test]
fn debug_lines_cover_faulting_ops() {
    let module = compile("let f = fn(a, b) a + b; f(40, 2)");
    for (index, op) in module.code.ops.iter().enumerate() {
        if op.needs_debug_info() {
            assert!(
                module.line_for(index as u32).is_some(),
                "missing line for {}",
                op.name()
            );
        }
    }
}

// ----------------------------------------------------------------------
// Diagnostics
// ----------------------------------------------------------------------

#[test]
fn undefined_variables_are_reported() {
    let err = try_compile("missing + 1").unwrap_err();
    assert!(err.diagnostics[0].message.contains("undefined variable"));
}

#[test]
fn errors_accumulate_across_statements() {
    let err = try_compile("missing_a; missing_b; 1").unwrap_err();
    assert_eq!(err.diagnostics.len(), 2);
}

#[test]
fn redeclaration_in_the_same_scope_is_rejected() {
    assert!(try_compile("let x = 1; let x = 2").is_err());
    // Shadowing in an inner scope is fine.
    assert!(try_compile("let x = 1; { let x = 2; x }; x").is_ok());
}

#[test]
fn assignment_rules() {
    assert!(try_compile("const c = 1; c = 2").is_err());
    assert!(try_compile("let x = 1; x = 2").is_ok());
    assert!(try_compile("let x = 1; x += 2").is_ok());
    // Assigning across a function boundary is rejected.
    assert!(try_compile("let x = 1; let f = fn() x = 2; f").is_err());
}

#[test]
fn jump_statements_need_a_loop() {
    assert!(try_compile("break").is_err());
    assert!(try_compile("continue").is_err());
    assert!(try_compile("while (true) break").is_ok());
    // A function body cuts the loop context off.
    assert!(try_compile("while (true) { let f = fn() break; f() }").is_err());
}

#[test]
fn unknown_type_names_are_rejected() {
    assert!(try_compile("1 is widget").is_err());
    assert!(try_compile("1 as error").is_ok());
}

#[test]
fn scope_symbols_vanish_at_block_end() {
    assert!(try_compile("{ let x = 1; x }; x").is_err());
}
